/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub(crate) mod http;

mod listener;
pub(crate) use listener::{Listener, Stream};

use crate::worker::Manager;

const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);
const CONN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Accept loop of the data plane. Stops accepting on the shutdown
/// signal, then gives in-flight connections a short drain window.
pub(crate) async fn run_api_server(
    listener: Listener,
    manager: Arc<Manager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn_tasks = JoinSet::new();
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok(stream) => {
                    let manager = manager.clone();
                    let shutdown = shutdown.clone();
                    match stream {
                        Stream::Tcp(s) => {
                            conn_tasks.spawn(serve_data_conn(s, manager, shutdown));
                        }
                        Stream::Unix(s) => {
                            conn_tasks.spawn(serve_data_conn(s, manager, shutdown));
                        }
                    }
                }
                Err(e) => {
                    warn!("api accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    let drained = tokio::time::timeout(CONN_DRAIN_TIMEOUT, async {
        while conn_tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("api connections did not drain in time, aborting");
        conn_tasks.abort_all();
    }
}

async fn serve_data_conn<S>(stream: S, manager: Arc<Manager>, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let head = tokio::select! {
            r = tokio::time::timeout(HEAD_READ_TIMEOUT, http::read_request_head(&mut reader)) => {
                match r {
                    Ok(Ok(Some(head))) => head,
                    Ok(Ok(None)) => return, // peer closed
                    Ok(Err(e)) => {
                        debug!("bad request head: {e}");
                        let _ = http::write_response(&mut write_half, 400, "", TEXT_PLAIN, false)
                            .await;
                        return;
                    }
                    Err(_) => return, // idle timeout
                }
            }
            _ = shutdown.changed() => return,
        };

        let (status, body) = if head.method == "GET" {
            let raw_ip = head.path.strip_prefix('/').unwrap_or(head.path.as_str());
            let outcome = manager.handle_query(raw_ip);
            (outcome.status(), outcome.body().to_string())
        } else {
            (400, String::new())
        };

        let keep_alive = head.keep_alive;
        if http::write_response(&mut write_half, status, &body, TEXT_PLAIN, keep_alive)
            .await
            .is_err()
        {
            return;
        }
        if !keep_alive {
            return;
        }
    }
}
