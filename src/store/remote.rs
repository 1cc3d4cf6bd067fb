use super::{Capture, CaptureStore, StoreStats};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

const PAYLOAD_FIELD: &str = "payload";
const BYTES_FIELD: &str = "bytes";
const SCAN_COUNT: usize = 100;

/// Captures stored as hashes under `<prefix>:capture:<id>`: the JSON
/// capture in `payload` and its decoded size in `bytes`, with a key TTL.
///
/// Expiry is Redis's job; there is no local sweep and no capacity guard.
#[derive(Clone)]
pub struct RedisCaptureStore {
    client: redis::Client,
    prefix: String,
    ttl_secs: u64,
}

impl RedisCaptureStore {
    pub fn new(url: &str, prefix: &str, ttl_secs: u64) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.to_string(),
            ttl_secs,
        })
    }

    fn key(&self, id: &str) -> String {
        format!("{}:capture:{id}", self.prefix)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl CaptureStore for RedisCaptureStore {
    async fn put(&self, capture: Capture) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&capture)?;
        let key = self.key(&capture.id);
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&key, PAYLOAD_FIELD, payload)
            .ignore()
            .hset(&key, BYTES_FIELD, capture.byte_size())
            .ignore()
            .expire(&key, self.ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!("capture store: stored {} in redis", capture.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Capture>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.key(id), PAYLOAD_FIELD).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(self.key(id)).await?;
        Ok(removed > 0)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}:capture:*", self.prefix);
        let mut stats = StoreStats::default();
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            for key in &keys {
                // Expired between SCAN and HGET: not counted.
                let bytes: Option<usize> = conn.hget(key, BYTES_FIELD).await?;
                if let Some(bytes) = bytes {
                    stats.count += 1;
                    stats.total_bytes += bytes;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_capture;

    #[test]
    fn keys_are_prefixed() {
        let s = RedisCaptureStore::new("redis://127.0.0.1:6379/", "pp", 600).unwrap();
        assert_eq!(s.key("abc"), "pp:capture:abc");
    }

    #[test]
    fn invalid_url_is_a_backend_error() {
        assert!(matches!(
            RedisCaptureStore::new("not-a-url", "pp", 600),
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_backend_error() {
        let s = RedisCaptureStore::new("redis://127.0.0.1:1/", "pp", 600).unwrap();
        let err = s.put(test_capture(10, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL and a local Redis"]
    async fn stats_sum_decoded_image_bytes() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            eprintln!("skipping stats_sum_decoded_image_bytes: REDIS_URL not set");
            return;
        };
        let prefix = format!("pp-test-{}", crate::store::new_capture_id());
        let s = RedisCaptureStore::new(&url, &prefix, 60).unwrap();
        let a = test_capture(1_000, 0);
        let b = test_capture(2_500, 0);
        s.put(a.clone()).await.unwrap();
        s.put(b.clone()).await.unwrap();

        let stats = s.stats().await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_bytes, 3_500);
        assert_eq!(s.get(&a.id).await.unwrap(), Some(a.clone()));

        s.delete(&a.id).await.unwrap();
        s.delete(&b.id).await.unwrap();
        assert_eq!(s.stats().await.unwrap().count, 0);
    }
}
