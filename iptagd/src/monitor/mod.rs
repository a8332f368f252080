/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::QuotaChecker;

mod server;
pub(crate) use server::run_monitor_server;

const UNHEALTHY_CONSECUTIVE_ERR: i64 = 3;

#[derive(Default)]
struct MonitorState {
    total_requests: i64,
    success_count: i64,
    fail_count: i64,
    consecutive_err: i64,
    last_error: String,
    last_error_time: Option<DateTime<Utc>>,
    last_fail_ip: String,
    remaining_request_num: i64,
    cache_item_count: i64,
}

/// Upstream health state shared between the providers (which record each
/// fetch) and the monitor HTTP plane (which reports it).
pub struct Monitor {
    start_time: DateTime<Utc>,
    state: RwLock<MonitorState>,
    quota: OnceLock<QuotaChecker>,
}

#[derive(Serialize)]
struct MonitorSnapshot {
    start_time: String,
    total_requests: i64,
    success_count: i64,
    fail_count: i64,
    consecutive_err: i64,
    last_error: String,
    last_error_time: String,
    last_fail_ip: String,
    remaining_request_num: i64,
    cache_item_count: i64,
}

#[derive(Serialize)]
struct StatusDocument {
    healthy: bool,
    uptime: String,
    data: MonitorSnapshot,
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Monitor {
            start_time: Utc::now(),
            state: RwLock::new(MonitorState {
                remaining_request_num: -1,
                ..Default::default()
            }),
            quota: OnceLock::new(),
        }
    }

    pub fn set_quota_checker(&self, checker: QuotaChecker) {
        let _ = self.quota.set(checker);
    }

    pub fn record_success(&self) {
        let mut state = self.state.write().unwrap();
        state.total_requests += 1;
        state.success_count += 1;
        state.consecutive_err = 0;
    }

    pub fn record_failure(&self, ip: &str, err_msg: &str) {
        let mut state = self.state.write().unwrap();
        state.total_requests += 1;
        state.fail_count += 1;
        state.consecutive_err += 1;
        state.last_error = err_msg.to_string();
        state.last_fail_ip = ip.to_string();
        state.last_error_time = Some(Utc::now());
    }

    pub fn update_cache_count(&self, count: i64) {
        self.state.write().unwrap().cache_item_count = count;
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().unwrap().consecutive_err < UNHEALTHY_CONSECUTIVE_ERR
    }

    /// Re-probe the remaining quota; a failed probe keeps the stale value.
    pub(crate) async fn refresh_quota(&self) {
        let Some(checker) = self.quota.get() else {
            return;
        };
        let remaining = checker.remaining_requests().await;
        if remaining >= 0 {
            self.state.write().unwrap().remaining_request_num = remaining;
        }
    }

    /// Render the `/status` document. Returns the health flag alongside
    /// the serialized JSON so the caller can pick the response status.
    pub(crate) fn status_document(&self) -> (bool, String) {
        let snapshot = {
            let state = self.state.read().unwrap();
            MonitorSnapshot {
                start_time: self.start_time.to_rfc3339(),
                total_requests: state.total_requests,
                success_count: state.success_count,
                fail_count: state.fail_count,
                consecutive_err: state.consecutive_err,
                last_error: state.last_error.clone(),
                last_error_time: state
                    .last_error_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                last_fail_ip: state.last_fail_ip.clone(),
                remaining_request_num: state.remaining_request_num,
                cache_item_count: state.cache_item_count,
            }
        };
        let healthy = snapshot.consecutive_err < UNHEALTHY_CONSECUTIVE_ERR;
        let doc = StatusDocument {
            healthy,
            uptime: format_uptime(
                (Utc::now() - self.start_time)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            ),
            data: snapshot,
        };
        let json = serde_json::to_string(&doc).unwrap_or_else(|_| "{}".to_string());
        (healthy, json)
    }
}

fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
