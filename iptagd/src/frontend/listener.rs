/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, anyhow};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::config::ListenAddr;

const UNIX_SOCKET_MODE: u32 = 0o660;

pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Listener {
    pub(crate) async fn bind(addr: &ListenAddr) -> anyhow::Result<Listener> {
        match addr {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .context(format!("failed to bind tcp listener to {addr}"))?;
                Ok(Listener::Tcp(listener))
            }
            ListenAddr::Unix(path) => {
                // a previous run may have left its socket file behind
                match std::fs::remove_file(path) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(anyhow!(
                            "failed to remove existing socket file {}: {e}",
                            path.display()
                        ));
                    }
                }
                let listener = UnixListener::bind(path)
                    .context(format!("failed to bind unix listener to {}", path.display()))?;
                std::fs::set_permissions(path, Permissions::from_mode(UNIX_SOCKET_MODE)).context(
                    format!("failed to set permissions on {}", path.display()),
                )?;
                Ok(Listener::Unix(listener))
            }
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Stream::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}
