/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Small yaml walking helpers for the config loader.

use anyhow::anyhow;
use yaml_rust::{Yaml, yaml};

pub(crate) mod key {
    /// Normalize a config key: lowercase, `-` folded to `_`.
    pub(crate) fn normalize(k: &str) -> String {
        k.to_lowercase().replace('-', "_")
    }
}

pub(crate) fn foreach_kv<F>(map: &yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in map.iter() {
        if let Yaml::String(key) = k {
            f(key, v)?;
        } else {
            return Err(anyhow!("hash key should be string, but got {k:?}"));
        }
    }
    Ok(())
}

pub(crate) mod value {
    use std::str::FromStr;

    use anyhow::anyhow;
    use yaml_rust::Yaml;

    pub(crate) fn as_string(v: &Yaml) -> anyhow::Result<String> {
        match v {
            Yaml::String(s) => Ok(s.to_string()),
            Yaml::Integer(i) => Ok(i.to_string()),
            Yaml::Real(s) => Ok(s.to_string()),
            _ => Err(anyhow!(
                "yaml value type for string should be 'string', 'integer' or 'real'"
            )),
        }
    }

    pub(crate) fn as_u64(v: &Yaml) -> anyhow::Result<u64> {
        match v {
            Yaml::String(s) => Ok(u64::from_str(s)?),
            Yaml::Integer(i) => Ok(u64::try_from(*i)?),
            _ => Err(anyhow!(
                "yaml value type for 'u64' should be 'string' or 'integer'"
            )),
        }
    }

    pub(crate) fn as_u32(v: &Yaml) -> anyhow::Result<u32> {
        match v {
            Yaml::String(s) => Ok(u32::from_str(s)?),
            Yaml::Integer(i) => Ok(u32::try_from(*i)?),
            _ => Err(anyhow!(
                "yaml value type for 'u32' should be 'string' or 'integer'"
            )),
        }
    }

    pub(crate) fn as_usize(v: &Yaml) -> anyhow::Result<usize> {
        match v {
            Yaml::String(s) => Ok(usize::from_str(s)?),
            Yaml::Integer(i) => Ok(usize::try_from(*i)?),
            _ => Err(anyhow!(
                "yaml value type for 'usize' should be 'string' or 'integer'"
            )),
        }
    }
}
