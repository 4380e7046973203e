//! Per-area node-label allocation.
//!
//! Each node claims a unique small integer per area by probing label keys in
//! the KV store and persisting its claim under the winning key. A label
//! already persisted in `LinkMonitorState` is preferred so the node keeps a
//! stable identity across restarts. Allocation runs only after the initial
//! adjacency hold expires, over an established peer set.

use std::time::Duration;
use tracing::{debug, info};

use crate::error::{LinkMonitorError, Result};
use crate::kv::KvStoreClient;
use crate::types::NODE_LABEL_KEY_PREFIX;

/// Inclusive label range claimed by node allocators.
pub const NODE_LABEL_RANGE: (u32, u32) = (101, 49_999);

/// Probes attempted per allocation before giving up (retried later).
const MAX_PROBES: u32 = 64;

/// Allocates node labels for one area.
#[derive(Debug)]
pub struct LabelAllocator {
    area: String,
    node_id: String,
    range: (u32, u32),
}

impl LabelAllocator {
    /// Creates an allocator for an area.
    pub fn new(area: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            node_id: node_id.into(),
            range: NODE_LABEL_RANGE,
        }
    }

    /// The area this allocator serves.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// Claims a label, preferring `preferred` (the persisted label).
    ///
    /// Probes sequentially from the starting candidate, skipping labels
    /// owned by other nodes, and claims the first free (or self-owned) one
    /// by persisting the label key. The caller persists the result into
    /// `LinkMonitorState` and retries on error.
    pub async fn allocate(
        &self,
        kv: &mut dyn KvStoreClient,
        preferred: Option<u32>,
        ttl: Duration,
    ) -> Result<u32> {
        let start = preferred
            .filter(|p| (self.range.0..=self.range.1).contains(p))
            .unwrap_or_else(|| self.seed());
        let span = self.range.1 - self.range.0 + 1;

        for probe in 0..MAX_PROBES {
            let label = self.range.0 + (start - self.range.0 + probe) % span;
            let key = format!("{}{}", NODE_LABEL_KEY_PREFIX, label);
            match kv.get_key(&self.area, &key).await? {
                Some(owner) if owner != self.node_id => {
                    debug!(area = %self.area, label, %owner, "Label taken, probing next");
                    continue;
                }
                _ => {
                    kv.persist_key(&self.area, &key, self.node_id.clone(), ttl).await?;
                    info!(area = %self.area, label, "Claimed node label");
                    return Ok(label);
                }
            }
        }

        Err(LinkMonitorError::KvStore(format!(
            "no free node label in area {} after {} probes",
            self.area, MAX_PROBES
        )))
    }

    /// Deterministic starting candidate derived from the node id (FNV-1a),
    /// spreading first probes across the range.
    fn seed(&self) -> u32 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self.node_id.bytes().chain(self.area.bytes()) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let span = (self.range.1 - self.range.0 + 1) as u64;
        self.range.0 + (hash % span) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKvStore;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_allocate_prefers_persisted_label() {
        let mut kv = MemKvStore::new();
        let allocator = LabelAllocator::new("0", "N1");
        let label = allocator.allocate(&mut kv, Some(200), TTL).await.unwrap();
        assert_eq!(label, 200);
        assert_eq!(
            kv.entry("0", "nodeLabel:200").map(String::as_str),
            Some("N1")
        );
    }

    #[tokio::test]
    async fn test_allocate_skips_taken_labels() {
        let mut kv = MemKvStore::new();
        kv.seed("0", "nodeLabel:200", "other-node");
        let allocator = LabelAllocator::new("0", "N1");
        let label = allocator.allocate(&mut kv, Some(200), TTL).await.unwrap();
        assert_eq!(label, 201);
    }

    #[tokio::test]
    async fn test_allocate_reclaims_own_label() {
        let mut kv = MemKvStore::new();
        kv.seed("0", "nodeLabel:200", "N1");
        let allocator = LabelAllocator::new("0", "N1");
        let label = allocator.allocate(&mut kv, Some(200), TTL).await.unwrap();
        assert_eq!(label, 200);
    }

    #[tokio::test]
    async fn test_allocate_is_deterministic_per_node() {
        let mut kv1 = MemKvStore::new();
        let mut kv2 = MemKvStore::new();
        let allocator = LabelAllocator::new("0", "N1");
        let first = allocator.allocate(&mut kv1, None, TTL).await.unwrap();
        let second = allocator.allocate(&mut kv2, None, TTL).await.unwrap();
        assert_eq!(first, second);
        assert!((NODE_LABEL_RANGE.0..=NODE_LABEL_RANGE.1).contains(&first));
    }

    #[tokio::test]
    async fn test_allocate_different_areas_are_independent() {
        let mut kv = MemKvStore::new();
        let a0 = LabelAllocator::new("0", "N1");
        let a1 = LabelAllocator::new("1", "N1");
        let l0 = a0.allocate(&mut kv, Some(150), TTL).await.unwrap();
        kv.seed("1", "nodeLabel:150", "other-node");
        let l1 = a1.allocate(&mut kv, Some(150), TTL).await.unwrap();
        assert_eq!(l0, 150);
        assert_eq!(l1, 151);
    }

    #[tokio::test]
    async fn test_allocate_propagates_kv_failure() {
        let mut kv = MemKvStore::new();
        kv.fail_persists = true;
        let allocator = LabelAllocator::new("0", "N1");
        assert!(allocator.allocate(&mut kv, Some(200), TTL).await.is_err());
    }
}
