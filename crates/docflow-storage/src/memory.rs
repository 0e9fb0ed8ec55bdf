//! In-memory storage backend.
//!
//! Holds objects in a map and can simulate transfer latency and injected
//! failures, which makes it the backend of choice for tests and dry runs.

use crate::keys::validate_key;
use crate::signing::{SignedUrl, UrlSigner};
use crate::traits::{ObjectReader, ProgressFn, Storage, StorageError, StorageResult};
use crate::transfer::copy_with_progress;
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MEMORY_BASE_URL: &str = "memory://objects";

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    put_attempts: AtomicU32,
    fail_next: AtomicU32,
}

#[derive(Clone)]
pub struct MemoryStorage {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    signer: UrlSigner,
    latency: Option<Duration>,
    counters: Arc<Counters>,
}

impl MemoryStorage {
    pub fn new(signing_secret: impl AsRef<[u8]>) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            signer: UrlSigner::new(signing_secret, MEMORY_BASE_URL),
            latency: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Hold every transfer open for `latency` before writing it.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `n` puts fail with a transport error.
    pub fn fail_next_puts(&self, n: u32) {
        self.counters.fail_next.store(n, Ordering::SeqCst);
    }

    /// Highest number of puts observed running at the same time.
    pub fn max_concurrent_puts(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn put_attempts(&self) -> u32 {
        self.counters.put_attempts.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().len()
    }

    pub fn verify_signed_url(&self, url: &str) -> StorageResult<String> {
        self.signer.verify(url, Utc::now())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_injected_failure(&self) -> bool {
        self.counters
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_object(
        &self,
        key: &str,
        reader: ObjectReader,
        content_length: Option<u64>,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> StorageResult<String> {
        validate_key(key)?;
        self.counters.put_attempts.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.counters);

        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled(key.to_string())),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        if self.take_injected_failure() {
            tracing::debug!(key = %key, "Injected storage failure");
            return Err(StorageError::UploadFailed(format!(
                "Connection reset while writing {}",
                key
            )));
        }

        let mut buffer: Vec<u8> = Vec::with_capacity(content_length.unwrap_or(0) as usize);
        let written = copy_with_progress(key, reader, &mut buffer, &on_progress, &cancel).await?;

        if let Some(expected) = content_length {
            if expected != written {
                return Err(StorageError::UploadFailed(format!(
                    "Short write for {}: expected {} bytes, wrote {}",
                    key, expected, written
                )));
            }
        }

        self.lock().insert(key.to_string(), Bytes::from(buffer));
        tracing::debug!(key = %key, size_bytes = written, "Memory storage upload successful");
        Ok(key.to_string())
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.lock().remove(key);
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<SignedUrl> {
        validate_key(key)?;
        if !self.lock().contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.signer.sign(key, ttl, Utc::now())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.lock().contains_key(key))
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &[u8]) -> ObjectReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    async fn put(storage: &MemoryStorage, key: &str) -> StorageResult<String> {
        storage
            .put_object(key, reader(b"hello"), Some(5), Arc::new(|_| {}), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn stores_and_signs_objects() {
        let storage = MemoryStorage::new("memory-secret");
        put(&storage, "documents/a/b/c/hello.txt").await.unwrap();
        assert_eq!(
            storage.object("documents/a/b/c/hello.txt").unwrap(),
            Bytes::from_static(b"hello")
        );

        let signed = storage
            .signed_url("documents/a/b/c/hello.txt", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(signed.url.starts_with("memory://objects/documents/a/b/c/hello.txt?expires="));
        assert_eq!(
            storage.verify_signed_url(&signed.url).unwrap(),
            "documents/a/b/c/hello.txt"
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let storage = MemoryStorage::new("memory-secret");
        storage.fail_next_puts(2);
        assert!(put(&storage, "documents/x/one").await.is_err());
        assert!(put(&storage, "documents/x/one").await.is_err());
        assert!(put(&storage, "documents/x/one").await.is_ok());
        assert_eq!(storage.put_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_latency() {
        let storage = MemoryStorage::new("memory-secret").with_latency(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel_clone.cancel();
        });

        let result = storage
            .put_object("documents/x/slow", reader(b"abc"), Some(3), Arc::new(|_| {}), cancel)
            .await;

        assert!(matches!(result, Err(StorageError::Cancelled(_))));
        assert_eq!(storage.object_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_peak_concurrency() {
        let storage = MemoryStorage::new("memory-secret").with_latency(Duration::from_millis(100));
        let mut handles = Vec::new();
        for i in 0..3 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                put(&storage, &format!("documents/x/{}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(storage.max_concurrent_puts(), 3);
    }
}
