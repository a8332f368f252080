/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Just enough HTTP/1.1 for two GET-only text planes: a bounded request
//! head reader and a plain response writer.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const MAX_LINE_SIZE: usize = 4096;
const MAX_HEADER_COUNT: usize = 64;

#[derive(Debug, Error)]
pub(crate) enum HttpParseError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("request line too long")]
    LineTooLong,
    #[error("too many header lines")]
    TooManyHeaders,
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("unsupported http version {0}")]
    UnsupportedVersion(String),
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) keep_alive: bool,
}

/// Read one request head. `Ok(None)` means the peer closed the
/// connection cleanly before sending another request.
pub(crate) async fn read_request_head<R>(
    reader: &mut R,
) -> Result<Option<RequestHead>, HttpParseError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_head_line(reader).await? else {
        return Ok(None);
    };

    let mut parts = line.split_ascii_whitespace();
    let method = parts
        .next()
        .ok_or(HttpParseError::InvalidRequestLine)?
        .to_string();
    let path = parts
        .next()
        .ok_or(HttpParseError::InvalidRequestLine)?
        .to_string();
    let version = parts.next().ok_or(HttpParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(HttpParseError::InvalidRequestLine);
    }
    let mut keep_alive = match version {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        _ => return Err(HttpParseError::UnsupportedVersion(version.to_string())),
    };

    let mut header_count = 0;
    loop {
        let Some(line) = read_head_line(reader).await? else {
            return Ok(None); // closed mid-head
        };
        if line.is_empty() {
            break;
        }
        header_count += 1;
        if header_count > MAX_HEADER_COUNT {
            return Err(HttpParseError::TooManyHeaders);
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("connection") {
                match value.trim().to_ascii_lowercase().as_str() {
                    "close" => keep_alive = false,
                    "keep-alive" => keep_alive = true,
                    _ => {}
                }
            }
        }
    }

    Ok(Some(RequestHead {
        method,
        path,
        keep_alive,
    }))
}

/// Read a CRLF (or bare LF) terminated line with a hard size cap.
async fn read_head_line<R>(reader: &mut R) -> Result<Option<String>, HttpParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (eol_found, consumed) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return if line.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
                };
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(consumed);
        if line.len() > MAX_LINE_SIZE {
            return Err(HttpParseError::LineTooLong);
        }
        if eol_found {
            break;
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "",
    }
}

pub(crate) async fn write_response<W>(
    writer: &mut W,
    status: u16,
    body: &str,
    content_type: &str,
    keep_alive: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nConnection: {}\r\n",
        reason_phrase(status),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    if !body.is_empty() {
        head.push_str("Content-Type: ");
        head.push_str(content_type);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        writer.write_all(body.as_bytes()).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::BufReader;

    async fn parse(data: &str) -> Result<Option<RequestHead>, HttpParseError> {
        let mut reader = BufReader::new(data.as_bytes());
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn simple_get() {
        let head = parse("GET /1.2.3.4 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/1.2.3.4");
        assert!(head.keep_alive);
    }

    #[tokio::test]
    async fn connection_close() {
        let head = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive);
    }

    #[tokio::test]
    async fn http_10_defaults_to_close() {
        let head = parse("GET /status HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert!(!head.keep_alive);

        let head = parse("GET /status HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(head.keep_alive);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        assert!(parse("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_request_line() {
        assert!(parse("GET\r\n\r\n").await.is_err());
        assert!(parse("GET / HTTP/2.0\r\n\r\n").await.is_err());
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let line = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(MAX_LINE_SIZE + 10));
        assert!(matches!(
            parse(&line).await,
            Err(HttpParseError::LineTooLong)
        ));
    }

    #[tokio::test]
    async fn response_format() {
        let mut buf = Vec::new();
        write_response(&mut buf, 200, "beijing_cmcc", "text/plain; charset=utf-8", true)
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nbeijing_cmcc"));
    }

    #[tokio::test]
    async fn empty_body_has_no_content_type() {
        let mut buf = Vec::new();
        write_response(&mut buf, 202, "", "text/plain; charset=utf-8", false)
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 202 Accepted\r\n"));
        assert!(!text.contains("Content-Type"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }
}
