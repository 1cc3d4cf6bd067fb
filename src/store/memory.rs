use super::{Capture, CaptureStore, StoreStats};
use crate::error::StoreError;
use crate::guard::session::now_ms;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Process-local capture store.
///
/// Expired entries are swept before every insert and dropped lazily on
/// read. Inserts are refused once the store would hold more than
/// `max_entries` captures or `max_bytes` decoded bytes.
#[derive(Debug)]
pub struct MemoryCaptureStore {
    ttl_ms: u64,
    max_entries: usize,
    max_bytes: usize,
    entries: Mutex<HashMap<String, Capture>>,
}

impl MemoryCaptureStore {
    pub fn new(ttl_secs: u64, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            ttl_ms: ttl_secs * 1000,
            max_entries,
            max_bytes,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, c: &Capture, now_ms: u64) -> bool {
        now_ms.saturating_sub(c.created_at_ms) >= self.ttl_ms
    }

    pub async fn put_at(&self, capture: Capture, now_ms: u64) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;

        let before = entries.len();
        entries.retain(|_, c| !self.expired(c, now_ms));
        if entries.len() < before {
            debug!("capture store: swept {} expired", before - entries.len());
        }

        let count = entries.len();
        let bytes: usize = entries.values().map(Capture::byte_size).sum();
        if count + 1 > self.max_entries || bytes + capture.byte_size() > self.max_bytes {
            return Err(StoreError::Full { count, bytes });
        }

        entries.insert(capture.id.clone(), capture);
        Ok(())
    }

    pub async fn get_at(&self, id: &str, now_ms: u64) -> Option<Capture> {
        let mut entries = self.entries.lock().await;
        match entries.get(id) {
            Some(c) if self.expired(c, now_ms) => {
                entries.remove(id);
                None
            }
            Some(c) => Some(c.clone()),
            None => None,
        }
    }

    /// Occupancy of the entries still live at `now_ms`.
    pub async fn stats_at(&self, now_ms: u64) -> StoreStats {
        let entries = self.entries.lock().await;
        let live = entries.values().filter(|c| !self.expired(c, now_ms));
        let mut stats = StoreStats::default();
        for c in live {
            stats.count += 1;
            stats.total_bytes += c.byte_size();
        }
        stats
    }
}

#[async_trait]
impl CaptureStore for MemoryCaptureStore {
    async fn put(&self, capture: Capture) -> Result<(), StoreError> {
        self.put_at(capture, now_ms()).await
    }

    async fn get(&self, id: &str) -> Result<Option<Capture>, StoreError> {
        Ok(self.get_at(id, now_ms()).await)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().await.remove(id).is_some())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self.stats_at(now_ms()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_capture;

    const T0: u64 = 1_700_000_000_000;

    #[tokio::test]
    async fn put_get_delete() {
        let s = MemoryCaptureStore::new(600, 80, 1 << 20);
        let c = test_capture(100, T0);
        let id = c.id.clone();
        s.put_at(c.clone(), T0).await.unwrap();
        assert_eq!(s.get_at(&id, T0 + 1).await, Some(c));
        assert!(s.delete(&id).await.unwrap());
        assert!(!s.delete(&id).await.unwrap());
        assert_eq!(s.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stats_skip_unswept_expired_entries() {
        let s = MemoryCaptureStore::new(60, 80, 1 << 20);
        s.put_at(test_capture(100, T0), T0).await.unwrap();
        s.put_at(test_capture(250, T0 + 30_000), T0 + 30_000).await.unwrap();

        let live = s.stats_at(T0 + 61_000).await;
        assert_eq!(live, StoreStats { count: 1, total_bytes: 250 });
        assert_eq!(s.stats_at(T0 + 91_000).await, StoreStats::default());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let s = MemoryCaptureStore::new(600, 80, 1 << 20);
        let c = test_capture(10, T0);
        let id = c.id.clone();
        s.put_at(c, T0).await.unwrap();
        assert!(s.get_at(&id, T0 + 599_999).await.is_some());
        assert!(s.get_at(&id, T0 + 600_000).await.is_none());
        assert_eq!(s.stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn count_guard_rejects_past_capacity() {
        let s = MemoryCaptureStore::new(600, 3, 1 << 20);
        for _ in 0..3 {
            s.put_at(test_capture(10, T0), T0).await.unwrap();
        }
        let err = s.put_at(test_capture(10, T0), T0).await.unwrap_err();
        assert!(matches!(err, StoreError::Full { count: 3, bytes: 30 }));
    }

    #[tokio::test]
    async fn byte_guard_rejects_past_capacity() {
        let s = MemoryCaptureStore::new(600, 80, 100);
        s.put_at(test_capture(60, T0), T0).await.unwrap();
        assert!(s.put_at(test_capture(41, T0), T0).await.is_err());
        s.put_at(test_capture(40, T0), T0).await.unwrap();
        assert_eq!(
            s.stats().await.unwrap(),
            StoreStats {
                count: 2,
                total_bytes: 100
            }
        );
    }

    #[tokio::test]
    async fn sweep_on_write_frees_capacity() {
        let s = MemoryCaptureStore::new(600, 2, 1 << 20);
        s.put_at(test_capture(10, T0), T0).await.unwrap();
        s.put_at(test_capture(10, T0), T0).await.unwrap();
        assert!(s.put_at(test_capture(10, T0), T0 + 1_000).await.is_err());
        let later = T0 + 600_000;
        s.put_at(test_capture(10, later), later).await.unwrap();
        assert_eq!(s.stats().await.unwrap().count, 1);
    }
}
