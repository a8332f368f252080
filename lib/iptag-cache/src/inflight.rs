/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::{Arc, Mutex};

use ahash::AHashSet;

/// Set of cache keys that are queued for a fetch or currently being
/// fetched. Together with the work queue this gives single-flight per
/// key: a key is a member iff exactly one task owns it.
///
/// Every successful [`try_add`](Self::try_add) must be paired with exactly
/// one [`delete`](Self::delete), on every path. Fetch paths should hold an
/// [`InflightGuard`] so the release survives early returns.
#[derive(Default)]
pub struct InflightSet {
    keys: Mutex<AHashSet<String>>,
}

impl InflightSet {
    pub fn new() -> Self {
        InflightSet::default()
    }

    /// Insert the key, returning false if it is already a member.
    pub fn try_add(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().unwrap();
        if keys.contains(key) {
            return false;
        }
        keys.insert(key.to_string());
        true
    }

    /// Remove the key unconditionally.
    pub fn delete(&self, key: &str) {
        self.keys.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scope-exit release of an inflight membership.
pub struct InflightGuard {
    set: Arc<InflightSet>,
    key: String,
}

impl InflightGuard {
    /// Take over an existing membership; the key is released when the
    /// guard drops, panicking paths included.
    pub fn new(set: Arc<InflightSet>, key: String) -> Self {
        InflightGuard { set, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.delete(&self.key);
    }
}
