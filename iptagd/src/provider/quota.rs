/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Remaining-quota probe against the Tencent cloud API
//! (`GetUsagePlanUsageAmount`), signed with the TC3-HMAC-SHA256 scheme.
//! Any failure yields the sentinel `-1` so the monitor keeps showing the
//! last known value.

use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::DateTime;
use hmac::{Hmac, Mac};
use log::warn;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::QuotaConfig;

const HOST: &str = "market.tencentcloudapi.com";
const SERVICE: &str = "market";
const ACTION: &str = "GetUsagePlanUsageAmount";
const API_VERSION: &str = "2019-10-10";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host";

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct QuotaChecker {
    secret_id: String,
    secret_key: String,
    instance_id: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: QuotaResponse,
}

#[derive(Deserialize, Default)]
struct QuotaResponse {
    #[serde(rename = "RemainingRequestNum", default)]
    remaining_request_num: Option<i64>,
    #[serde(rename = "Error", default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

impl QuotaChecker {
    pub(crate) fn new(config: &QuotaConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(QuotaChecker {
            secret_id: config.secret_id.clone(),
            secret_key: config.secret_key.clone(),
            instance_id: config.instance_id.clone(),
            client,
        })
    }

    /// Remaining request count of the usage plan, or `-1` on any failure.
    pub(crate) async fn remaining_requests(&self) -> i64 {
        if self.instance_id.is_empty() {
            return -1;
        }
        match self.fetch().await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("quota probe failed: {e:?}");
                -1
            }
        }
    }

    async fn fetch(&self) -> anyhow::Result<i64> {
        let payload = format!(r#"{{"InstanceId":"{}"}}"#, self.instance_id);
        let timestamp = chrono::Utc::now().timestamp();
        let authorization = self.tc3_authorization(&payload, timestamp)?;

        let rsp = self
            .client
            .post(format!("https://{HOST}/"))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-TC-Action", ACTION)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", API_VERSION)
            .body(payload)
            .send()
            .await
            .context("request failed")?;

        let envelope: Envelope = rsp.json().await.context("invalid response json")?;
        if let Some(e) = envelope.response.error {
            return Err(anyhow!("api error {}: {}", e.code, e.message));
        }
        envelope
            .response
            .remaining_request_num
            .ok_or_else(|| anyhow!("no remaining request number in response"))
    }

    fn tc3_authorization(&self, payload: &str, timestamp: i64) -> anyhow::Result<String> {
        let date = DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| anyhow!("invalid timestamp {timestamp}"))?
            .format("%Y-%m-%d")
            .to_string();

        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{HOST}\n\n{SIGNED_HEADERS}\n{}",
            sha256_hex(payload.as_bytes())
        );
        let credential_scope = format!("{date}/{SERVICE}/tc3_request");
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{timestamp}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let secret_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), &date)?;
        let secret_service = hmac_sha256(&secret_date, SERVICE)?;
        let secret_signing = hmac_sha256(&secret_service, "tc3_request")?;
        let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign)?);

        Ok(format!(
            "TC3-HMAC-SHA256 Credential={}/{credential_scope}, \
             SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.secret_id
        ))
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &str) -> anyhow::Result<Vec<u8>> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|_| anyhow!("invalid hmac key length"))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> QuotaChecker {
        QuotaChecker::new(&QuotaConfig {
            instance_id: "plan-1".to_string(),
            secret_id: "AKID_test".to_string(),
            secret_key: "secret".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn authorization_is_deterministic() {
        let c = checker();
        let a = c.tc3_authorization(r#"{"InstanceId":"plan-1"}"#, 1_700_000_000).unwrap();
        let b = c.tc3_authorization(r#"{"InstanceId":"plan-1"}"#, 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("TC3-HMAC-SHA256 Credential=AKID_test/2023-11-14/market/tc3_request"));
        assert!(a.contains("SignedHeaders=content-type;host"));
        assert!(a.contains("Signature="));
    }

    #[test]
    fn decode_quota_response() {
        let body = r#"{"Response": {"RemainingRequestNum": 12345, "RequestId": "x"}}"#;
        let envelope: Envelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.response.remaining_request_num, Some(12345));

        let body = r#"{"Response": {"Error": {"Code": "AuthFailure", "Message": "nope"}, "RequestId": "x"}}"#;
        let envelope: Envelope = serde_json::from_str(body).unwrap();
        assert!(envelope.response.error.is_some());
    }
}
