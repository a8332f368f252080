/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Shared client for Tencent cloud-market gateway products.
//!
//! The gateway authenticates with an HMAC-SHA1 signature over a single
//! `x-date` line; the resulting authorization is a small JSON blob sent
//! as the `Authorization` header, alongside a random `request-id`.

use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use reqwest::Method;
use sha1::Sha1;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) struct MarketClient {
    secret_id: String,
    secret_key: String,
    base_url: &'static str,
    method: Method,
    client: reqwest::Client,
}

impl MarketClient {
    pub(super) fn new(
        secret_id: &str,
        secret_key: &str,
        base_url: &'static str,
        method: Method,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(MarketClient {
            secret_id: secret_id.to_string(),
            secret_key: secret_key.to_string(),
            base_url,
            method,
            client,
        })
    }

    pub(super) async fn request(
        &self,
        query: &[(&str, &str)],
        form: Option<&[(&str, &str)]>,
    ) -> anyhow::Result<Vec<u8>> {
        let auth = self.authorization()?;

        let mut req = self.client.request(self.method.clone(), self.base_url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(form) = form {
            req = req.form(form);
        }
        let rsp = req
            .header("Authorization", auth)
            .header("request-id", request_id())
            .send()
            .await
            .context("request failed")?;

        let body = rsp.bytes().await.context("failed to read response")?;
        Ok(body.to_vec())
    }

    fn authorization(&self) -> anyhow::Result<String> {
        if self.secret_id.is_empty() || self.secret_key.is_empty() {
            return Err(anyhow!("missing credentials: empty secret id or secret key"));
        }

        let datetime = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let sign_str = format!("x-date: {datetime}");

        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|_| anyhow!("invalid secret key"))?;
        mac.update(sign_str.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        Ok(format!(
            r#"{{"id":"{}", "x-date":"{datetime}", "signature":"{signature}"}}"#,
            self.secret_id
        ))
    }
}

fn request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[0..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..16]),
    )
}
