/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! The resolution cache used by the iptag daemon.
//!
//! A fixed set of 256 shards maps `/24` keys to tag strings with TTL and
//! pre-refresh semantics. Writes are mirrored asynchronously into an
//! embedded sqlite store (write-behind, bounded channel, batched
//! transactions) so a restart starts warm. The in-memory side is
//! authoritative while the process runs; the store only has to be good
//! enough to avoid a cold rebuild.

mod cache;
mod inflight;
mod store;

pub use cache::{CacheHit, TagCache};
pub use inflight::{InflightGuard, InflightSet};
pub use store::StoreError;
