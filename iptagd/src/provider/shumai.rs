/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use anyhow::anyhow;
use reqwest::Method;
use serde::Deserialize;

use iptag_geo::IpInfo;

use super::market::MarketClient;
use super::{FetchFuture, IpInfoProvider};
use crate::config::ProviderConfig;
use crate::monitor::Monitor;

const BASE_URL: &str =
    "https://ap-guangzhou.cloudmarket-apigw.com/service-5ezbz0ek/v4/ip/district/query";

/// Cloud-market product 38599: GET query with the address in the query
/// string, province under `data.result.prov`.
pub(super) struct ShuMaiProvider {
    client: MarketClient,
    monitor: Arc<Monitor>,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: ApiData,
}

#[derive(Deserialize, Default)]
struct ApiData {
    #[serde(default)]
    result: ApiResult,
}

#[derive(Deserialize, Default)]
struct ApiResult {
    #[serde(default)]
    prov: String,
    #[serde(default)]
    isp: String,
}

impl ShuMaiProvider {
    pub(super) fn new(config: &ProviderConfig, monitor: &Arc<Monitor>) -> anyhow::Result<Self> {
        let client = MarketClient::new(
            &config.secret_id,
            &config.secret_key,
            BASE_URL,
            Method::GET,
        )?;
        Ok(ShuMaiProvider {
            client,
            monitor: monitor.clone(),
        })
    }
}

impl IpInfoProvider for ShuMaiProvider {
    fn fetch<'a>(&'a self, ip: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let body = match self.client.request(&[("ip", ip)], None).await {
                Ok(body) => body,
                Err(e) => {
                    self.monitor.record_failure(ip, &format!("request failed: {e}"));
                    return Err(e);
                }
            };

            let rsp: ApiResponse = match serde_json::from_slice(&body) {
                Ok(rsp) => rsp,
                Err(e) => {
                    let msg = format!(
                        "invalid response json: {e}, body: {}",
                        String::from_utf8_lossy(&body)
                    );
                    self.monitor.record_failure(ip, &msg);
                    return Err(anyhow!(msg));
                }
            };

            if rsp.code != 200 {
                let msg = format!("api error, code {}, msg {}", rsp.code, rsp.msg);
                self.monitor.record_failure(ip, &msg);
                return Err(anyhow!(msg));
            }

            self.monitor.record_success();
            Ok(IpInfo::new(rsp.data.result.prov, rsp.data.result.isp))
        })
    }

    fn name(&self) -> &'static str {
        "https://market.cloud.tencent.com/products/38599"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_success_response() {
        let body = r#"{
            "code": 200, "msg": "success", "success": true,
            "data": {"result": {"prov": "广东省", "isp": "中国电信"}}
        }"#;
        let rsp: ApiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(rsp.code, 200);
        assert_eq!(rsp.data.result.prov, "广东省");
        assert_eq!(rsp.data.result.isp, "中国电信");
    }

    #[test]
    fn decode_error_response() {
        let body = r#"{"code": 403, "msg": "quota exceeded"}"#;
        let rsp: ApiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(rsp.code, 403);
        assert_eq!(rsp.msg, "quota exceeded");
        assert!(rsp.data.result.prov.is_empty());
    }
}
