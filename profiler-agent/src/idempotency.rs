// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Bounded, genuinely ordered set of executed command ids.
//!
//! The original Python agent this is modeled on keeps a plain `set` and
//! evicts an arbitrary suffix once it overflows — sets have no insertion
//! order in that language, so "oldest" isn't actually honored. Here the
//! eviction order is a real invariant: a `VecDeque` alongside the
//! `HashSet` guarantees the oldest id is the one dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

pub struct IdempotencySet {
    capacity: usize,
    order: Mutex<VecDeque<String>>,
    members: Mutex<HashSet<String>>,
}

impl IdempotencySet {
    pub fn new(capacity: usize) -> Self {
        IdempotencySet {
            capacity,
            order: Mutex::new(VecDeque::new()),
            members: Mutex::new(HashSet::new()),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.lock().unwrap().contains(id)
    }

    /// Inserts `id`, evicting the oldest entries if this push exceeds
    /// capacity. No-op if `id` is already present.
    pub fn insert(&self, id: &str) {
        let mut members = self.members.lock().unwrap();
        if !members.insert(id.to_string()) {
            return;
        }
        let mut order = self.order.lock().unwrap();
        order.push_back(id.to_string());
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                members.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
