/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;

use iptag_geo::IpInfo;

use crate::config::ProviderConfig;
use crate::monitor::Monitor;

mod market;

mod ipquery;
mod shumai;

mod quota;
pub(crate) use quota::QuotaChecker;

pub(crate) type FetchFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<IpInfo>> + Send + 'a>>;

/// An upstream geolocation source. Implementations own their transport,
/// signing and decoding, record every outcome into the monitor, and must
/// be safe for concurrent calls.
pub trait IpInfoProvider: Send + Sync {
    fn fetch<'a>(&'a self, ip: &'a str) -> FetchFuture<'a>;
    fn name(&self) -> &'static str;
}

type ProviderCtor = fn(&ProviderConfig, &Arc<Monitor>) -> anyhow::Result<Arc<dyn IpInfoProvider>>;

/// Constructor registry keyed by the literal product identifier used in
/// the config file.
const PROVIDERS: &[(&str, ProviderCtor)] = &[
    ("38599", |config, monitor| {
        Ok(Arc::new(shumai::ShuMaiProvider::new(config, monitor)?))
    }),
    ("30498", |config, monitor| {
        Ok(Arc::new(ipquery::IpQueryProvider::new(config, monitor)?))
    }),
];

pub(crate) fn new_provider_by_name(
    config: &ProviderConfig,
    monitor: &Arc<Monitor>,
) -> anyhow::Result<Arc<dyn IpInfoProvider>> {
    for (name, ctor) in PROVIDERS {
        if *name == config.name {
            return ctor(config, monitor);
        }
    }
    Err(anyhow!("unknown provider {}", config.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatch() {
        let monitor = Arc::new(Monitor::new());
        let config = ProviderConfig {
            name: "38599".to_string(),
            secret_id: "id".to_string(),
            secret_key: "key".to_string(),
        };
        let provider = new_provider_by_name(&config, &monitor).unwrap();
        assert_eq!(
            provider.name(),
            "https://market.cloud.tencent.com/products/38599"
        );

        let config = ProviderConfig {
            name: "30498".to_string(),
            ..config
        };
        let provider = new_provider_by_name(&config, &monitor).unwrap();
        assert_eq!(
            provider.name(),
            "https://market.cloud.tencent.com/products/30498"
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let monitor = Arc::new(Monitor::new());
        let config = ProviderConfig {
            name: "99999".to_string(),
            ..Default::default()
        };
        assert!(new_provider_by_name(&config, &monitor).is_err());
    }
}
