/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Mapping of raw geolocation answers to canonical `province_isp` tags.
//!
//! Upstream providers return free-form text for both dimensions: Chinese
//! administrative names with or without suffixes, English carrier names,
//! already-normalized codes, or garbage. This crate classifies both sides
//! and collapses them into the compact tag the cache and its consumers key on.

mod isp;
mod province;

pub use isp::isp_code;
pub use province::province_code;

/// The tag emitted when either the province or the ISP is unrecognized.
pub const FALLBACK_TAG: &str = "fallback";

/// A raw resolution result as returned by an upstream provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub province: String,
    pub isp: String,
}

impl IpInfo {
    pub fn new(province: String, isp: String) -> Self {
        IpInfo { province, isp }
    }

    /// Build the canonical `province_isp` tag for this answer.
    ///
    /// Both dimensions have to classify; a miss on either side yields the
    /// literal [`FALLBACK_TAG`] so that unknown regions still cache.
    pub fn to_tag(&self) -> String {
        match (province_code(&self.province), isp_code(&self.isp)) {
            (Some(p), Some(i)) => format!("{p}_{i}"),
            _ => FALLBACK_TAG.to_string(),
        }
    }
}
