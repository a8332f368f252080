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

const BASE_URL: &str = "https://ap-guangzhou.cloudmarket-apigw.com/service-hnhpr5tw/ip/query";

/// Cloud-market product 30498: POST form with the address in the body,
/// province under `data.region`.
pub(super) struct IpQueryProvider {
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
    region: String,
    #[serde(default)]
    isp: String,
}

impl IpQueryProvider {
    pub(super) fn new(config: &ProviderConfig, monitor: &Arc<Monitor>) -> anyhow::Result<Self> {
        let client = MarketClient::new(
            &config.secret_id,
            &config.secret_key,
            BASE_URL,
            Method::POST,
        )?;
        Ok(IpQueryProvider {
            client,
            monitor: monitor.clone(),
        })
    }
}

impl IpInfoProvider for IpQueryProvider {
    fn fetch<'a>(&'a self, ip: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let body = match self.client.request(&[], Some(&[("ip", ip)])).await {
                Ok(body) => body,
                Err(e) => {
                    self.monitor.record_failure(ip, &format!("request failed: {e}"));
                    return Err(e);
                }
            };

            let rsp: ApiResponse = match serde_json::from_slice(&body) {
                Ok(rsp) => rsp,
                Err(e) => {
                    let msg = format!("invalid response json: {e}");
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
            Ok(IpInfo::new(rsp.data.region, rsp.data.isp))
        })
    }

    fn name(&self) -> &'static str {
        "https://market.cloud.tencent.com/products/30498"
    }
}
