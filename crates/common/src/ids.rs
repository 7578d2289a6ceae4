//! Identifier generation
//!
//! Entities never call `Uuid::new_v4()` directly; they take an [`IdGenerator`] so that
//! tests and replays can supply deterministic ids.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of entity identifiers
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Uuid;
}

/// Random v4 UUIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn generate(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Monotonic ids `00000000-0000-0000-0000-000000000001`, `...02`, and so on
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `offset`
    pub fn starting_at(offset: u64) -> Self {
        Self {
            next: AtomicU64::new(offset),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn generate(&self) -> Uuid {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(n as u128)
    }
}
