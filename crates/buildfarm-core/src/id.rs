//! Identifiers for store rows and job batches.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Identifier of a build request, sub-job, agent or build run.
/// UUIDv7 keeps ids ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ResourceId> for Uuid {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

static LAST_BATCH: AtomicI64 = AtomicI64::new(0);

/// Spawn timestamp shared by every sub-job created by one parent run.
///
/// Batch ids are microseconds since the epoch and strictly increase within
/// a process, so two batches started in the same microsecond never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BatchId(i64);

impl BatchId {
    pub fn now() -> Self {
        let stamp = Utc::now().timestamp_micros();
        let mut last = LAST_BATCH.load(Ordering::Relaxed);
        loop {
            let next = stamp.max(last + 1);
            match LAST_BATCH.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Self(next),
                Err(seen) => last = seen,
            }
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn spawned_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ids_strictly_increase() {
        let a = BatchId::now();
        let b = BatchId::now();
        let c = BatchId::now();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_batch_id_is_a_timestamp() {
        let before = Utc::now();
        let batch = BatchId::now();
        let spawned = batch.spawned_at().unwrap();
        assert!(spawned >= before - chrono::Duration::seconds(1));
    }

    #[test]
    fn test_resource_id_round_trips_through_text() {
        let id = ResourceId::new();
        let parsed: ResourceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
