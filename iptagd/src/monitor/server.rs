/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::frontend::http;
use crate::monitor::Monitor;
use crate::worker::Manager;

const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(5);
const CONN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

// keep the statistics page readable for very fat tags
const STATISTICS_KEY_DISPLAY_MAX: usize = 50;

pub(crate) async fn run_monitor_server(
    listener: TcpListener,
    monitor: Arc<Monitor>,
    manager: Arc<Manager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn_tasks = JoinSet::new();
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, _peer)) => {
                    conn_tasks.spawn(serve_monitor_conn(
                        stream,
                        monitor.clone(),
                        manager.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("monitor accept failed: {e}");
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
        conn_tasks.abort_all();
    }
}

async fn serve_monitor_conn(
    stream: TcpStream,
    monitor: Arc<Monitor>,
    manager: Arc<Manager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let head = tokio::select! {
            r = tokio::time::timeout(HEAD_READ_TIMEOUT, http::read_request_head(&mut reader)) => {
                match r {
                    Ok(Ok(Some(head))) => head,
                    Ok(Ok(None)) => return,
                    Ok(Err(e)) => {
                        debug!("bad monitor request head: {e}");
                        let _ = http::write_response(&mut write_half, 400, "", TEXT_PLAIN, false)
                            .await;
                        return;
                    }
                    Err(_) => return,
                }
            }
            _ = shutdown.changed() => return,
        };

        let (status, body, content_type) = if head.method != "GET" {
            (400, String::new(), TEXT_PLAIN)
        } else {
            match head.path.as_str() {
                "/status" => {
                    let (status, body) = handle_status(&monitor, &manager).await;
                    (status, body, APPLICATION_JSON)
                }
                "/statistics" => {
                    let (status, body) = handle_statistics(&manager).await;
                    let content_type = if status == 200 { TEXT_HTML } else { TEXT_PLAIN };
                    (status, body, content_type)
                }
                _ => (404, String::new(), TEXT_PLAIN),
            }
        };

        let keep_alive = head.keep_alive;
        if http::write_response(&mut write_half, status, &body, content_type, keep_alive)
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

async fn handle_status(monitor: &Arc<Monitor>, manager: &Arc<Manager>) -> (u16, String) {
    monitor.refresh_quota().await;
    monitor.update_cache_count(manager.cache_count());
    let (healthy, json) = monitor.status_document();
    (if healthy { 200 } else { 500 }, json)
}

async fn handle_statistics(manager: &Arc<Manager>) -> (u16, String) {
    let blocking_manager = manager.clone();
    let items = match tokio::task::spawn_blocking(move || blocking_manager.all_cached_items())
        .await
    {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => {
            warn!("failed to read statistics: {e}");
            return (
                500,
                "Failed to retrieve statistics from database".to_string(),
            );
        }
        Err(e) => {
            warn!("statistics query task failed: {e}");
            return (
                500,
                "Failed to retrieve statistics from database".to_string(),
            );
        }
    };

    let total = items.len();
    (
        200,
        render_statistics_page(total, manager.dropped_updates(), items),
    )
}

fn render_statistics_page(
    total: usize,
    dropped_updates: u64,
    items: Vec<(String, String)>,
) -> String {
    // tag -> sorted /24 keys; BTreeMap keeps the tags sorted for free
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, tag) in items {
        groups.entry(tag).or_default().push(key);
    }

    let mut page = format!(
        r#"<html>
<head>
    <title>IP Cache Statistics</title>
    <style>
        body {{ font-family: sans-serif; }}
        table {{ border-collapse: collapse; width: 100%; }}
        th, td {{ border: 1px solid #ddd; padding: 8px; text-align: left; }}
        th {{ background-color: #f2f2f2; }}
        .metric {{ margin-bottom: 20px; font-weight: bold; }}
        .warn {{ color: red; }}
    </style>
</head>
<body>
    <h1>IP Cache Statistics</h1>
    <div class="metric">
        <p>Total Cached Items: {total}</p>
        <p>Dropped Updates (Disk Pressure): <span class="{}">{dropped_updates}</span></p>
    </div>
    <table>
        <tr>
            <th>Tag</th>
            <th>IP Ranges (Count)</th>
        </tr>"#,
        if dropped_updates > 0 { "warn" } else { "" },
    );

    for (tag, mut keys) in groups {
        keys.sort();
        let count = keys.len();
        if count > STATISTICS_KEY_DISPLAY_MAX {
            let hidden = count - STATISTICS_KEY_DISPLAY_MAX;
            keys.truncate(STATISTICS_KEY_DISPLAY_MAX);
            keys.push(format!("... and {hidden} others"));
        }
        let _ = write!(
            page,
            "<tr><td>{tag}</td><td>{} <br/>(Count: {count})</td></tr>",
            keys.join(", ")
        );
    }
    page.push_str("</table></body></html>");
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_page_groups_and_sorts() {
        let items = vec![
            ("2.2.2".to_string(), "guangdong_ct".to_string()),
            ("1.1.1".to_string(), "beijing_cmcc".to_string()),
            ("1.1.2".to_string(), "beijing_cmcc".to_string()),
        ];
        let page = render_statistics_page(3, 0, items);
        assert!(page.contains("Total Cached Items: 3"));
        assert!(page.contains("<td>1.1.1, 1.1.2 <br/>(Count: 2)</td>"));
        // sorted tags: beijing before guangdong
        let beijing = page.find("beijing_cmcc").unwrap();
        let guangdong = page.find("guangdong_ct").unwrap();
        assert!(beijing < guangdong);
        // no disk pressure, no red highlight
        assert!(page.contains(r#"<span class="">0</span>"#));
    }

    #[test]
    fn statistics_page_highlights_drops() {
        let page = render_statistics_page(0, 7, Vec::new());
        assert!(page.contains(r#"<span class="warn">7</span>"#));
    }

    #[test]
    fn statistics_page_truncates_long_tag_groups() {
        let items: Vec<_> = (0..60)
            .map(|i| (format!("10.0.{i}"), "fallback".to_string()))
            .collect();
        let page = render_statistics_page(60, 0, items);
        assert!(page.contains("... and 10 others"));
        assert!(page.contains("(Count: 60)"));
    }
}
