/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use yaml_rust::{Yaml, YamlLoader};

mod yaml;

const DEFAULT_WORKER_CONCURRENCY: usize = 8;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_CACHE_REFRESH_PERCENT: u32 = 10;

/// Data-plane listen address: plain TCP, or a unix socket given as
/// `unix://<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(anyhow!("empty unix socket path"));
            }
            Ok(ListenAddr::Unix(PathBuf::from(path)))
        } else {
            let addr = SocketAddr::from_str(s)
                .map_err(|e| anyhow!("invalid socket address {s}: {e}"))?;
            Ok(ListenAddr::Tcp(addr))
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub name: String,
    pub secret_id: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuotaConfig {
    pub instance_id: String,
    pub secret_id: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => f.write_str("info"),
            LogLevel::Debug => f.write_str("debug"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: ListenAddr,
    pub monitor_addr: SocketAddr,
    pub worker_concurrency: usize,
    pub cache_ttl: Duration,
    /// Fraction of the TTL forming the trailing refresh window.
    pub cache_refresh_ratio: f64,
    pub cache_store_path: Option<PathBuf>,
    pub provider: ProviderConfig,
    pub quota: QuotaConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: ListenAddr::Tcp(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                8080,
            )),
            monitor_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090),
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_refresh_ratio: f64::from(DEFAULT_CACHE_REFRESH_PERCENT) / 100.0,
            cache_store_path: None,
            provider: ProviderConfig::default(),
            quota: QuotaConfig::default(),
            log: LogConfig::default(),
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    let mut docs = YamlLoader::load_from_str(&content)
        .map_err(|e| anyhow!("invalid yaml in {}: {e}", path.display()))?;
    if docs.is_empty() {
        return Err(anyhow!("no yaml document found in {}", path.display()));
    }
    load_doc(&docs.remove(0))
}

fn load_doc(doc: &Yaml) -> anyhow::Result<Config> {
    let Yaml::Hash(map) = doc else {
        return Err(anyhow!("root yaml value type should be 'map'"));
    };

    let mut config = Config::default();
    yaml::foreach_kv(map, |k, v| match yaml::key::normalize(k).as_str() {
        "listen_addr" => {
            let s = yaml::value::as_string(v)?;
            config.listen_addr = ListenAddr::from_str(&s)
                .context(format!("invalid listen address value for key {k}"))?;
            Ok(())
        }
        "monitor_addr" => {
            let s = yaml::value::as_string(v)?;
            config.monitor_addr = SocketAddr::from_str(&s)
                .map_err(|e| anyhow!("invalid tcp socket address value for key {k}: {e}"))?;
            Ok(())
        }
        "worker_concurrency" => {
            let n = yaml::value::as_usize(v)?;
            if n == 0 {
                return Err(anyhow!("value for key {k} should be positive"));
            }
            config.worker_concurrency = n;
            Ok(())
        }
        "cache_ttl_seconds" => {
            config.cache_ttl = Duration::from_secs(yaml::value::as_u64(v)?);
            Ok(())
        }
        "cache_refresh_ratio" => {
            let percent = yaml::value::as_u32(v)?;
            if percent > 99 {
                return Err(anyhow!("value for key {k} should be a percent in 0-99"));
            }
            config.cache_refresh_ratio = f64::from(percent) / 100.0;
            Ok(())
        }
        "cache_store_path" => {
            let s = yaml::value::as_string(v)?;
            if !s.is_empty() {
                config.cache_store_path = Some(PathBuf::from(s));
            }
            Ok(())
        }
        "provider" => {
            config.provider =
                load_provider(v).context(format!("invalid provider config for key {k}"))?;
            Ok(())
        }
        "quota" => {
            config.quota = load_quota(v).context(format!("invalid quota config for key {k}"))?;
            Ok(())
        }
        "log_level" => {
            let s = yaml::value::as_string(v)?;
            config.log.level = match s.as_str() {
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                _ => return Err(anyhow!("unsupported log level {s}")),
            };
            Ok(())
        }
        "log_file" => {
            let s = yaml::value::as_string(v)?;
            if !s.is_empty() {
                config.log.file = Some(PathBuf::from(s));
            }
            Ok(())
        }
        _ => Err(anyhow!("invalid key {k}")),
    })?;

    Ok(config)
}

fn load_provider(v: &Yaml) -> anyhow::Result<ProviderConfig> {
    let Yaml::Hash(map) = v else {
        return Err(anyhow!("yaml value type for the provider config should be 'map'"));
    };
    let mut provider = ProviderConfig::default();
    yaml::foreach_kv(map, |k, v| match yaml::key::normalize(k).as_str() {
        "name" => {
            provider.name = yaml::value::as_string(v)?;
            Ok(())
        }
        "secret_id" => {
            provider.secret_id = yaml::value::as_string(v)?;
            Ok(())
        }
        "secret_key" => {
            provider.secret_key = yaml::value::as_string(v)?;
            Ok(())
        }
        _ => Err(anyhow!("invalid key {k}")),
    })?;
    Ok(provider)
}

fn load_quota(v: &Yaml) -> anyhow::Result<QuotaConfig> {
    let Yaml::Hash(map) = v else {
        return Err(anyhow!("yaml value type for the quota config should be 'map'"));
    };
    let mut quota = QuotaConfig::default();
    yaml::foreach_kv(map, |k, v| match yaml::key::normalize(k).as_str() {
        "instance_id" => {
            quota.instance_id = yaml::value::as_string(v)?;
            Ok(())
        }
        "secret_id" => {
            quota.secret_id = yaml::value::as_string(v)?;
            Ok(())
        }
        "secret_key" => {
            quota.secret_key = yaml::value::as_string(v)?;
            Ok(())
        }
        _ => Err(anyhow!("invalid key {k}")),
    })?;
    Ok(quota)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> anyhow::Result<Config> {
        let mut docs = YamlLoader::load_from_str(content).unwrap();
        load_doc(&docs.remove(0))
    }

    #[test]
    fn defaults() {
        let config = parse("listen_addr: 127.0.0.1:8080").unwrap();
        assert_eq!(config.monitor_addr.port(), 9090);
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.cache_ttl, Duration::from_secs(2_592_000));
        assert_eq!(config.cache_refresh_ratio, 0.10);
        assert!(config.cache_store_path.is_none());
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn full_document() {
        let config = parse(
            r#"
listen_addr: "unix:///run/iptagd.sock"
monitor_addr: "0.0.0.0:9191"
worker_concurrency: 4
cache_ttl_seconds: 3600
cache_refresh_ratio: 25
cache_store_path: /var/lib/iptagd/ip_cache.db
provider:
  name: "38599"
  secret_id: id
  secret_key: key
quota:
  instance_id: plan-1
  secret_id: id2
  secret_key: key2
log_level: debug
log_file: /var/log/iptagd.log
"#,
        )
        .unwrap();
        assert_eq!(
            config.listen_addr,
            ListenAddr::Unix(PathBuf::from("/run/iptagd.sock"))
        );
        assert_eq!(config.monitor_addr.port(), 9191);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache_refresh_ratio, 0.25);
        assert_eq!(config.provider.name, "38599");
        assert_eq!(config.quota.instance_id, "plan-1");
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.file, Some(PathBuf::from("/var/log/iptagd.log")));
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(parse("no_such_key: 1").is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(parse("worker_concurrency: 0").is_err());
    }

    #[test]
    fn rejects_out_of_range_refresh_ratio() {
        assert!(parse("cache_refresh_ratio: 100").is_err());
    }

    #[test]
    fn rejects_unix_monitor_addr() {
        assert!(parse("monitor_addr: unix:///run/mon.sock").is_err());
    }
}
