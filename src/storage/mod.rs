//! Per-session block storage engine: read/write/flush against S3 with a
//! session-local dirty buffer providing read-your-writes consistency.
//!
//! One [`BlockEngine`] is constructed per session, bound to a single export
//! name (see `src/server/listener.rs`: "do not share a storage instance
//! across sessions" — inter-session exclusion is delegated entirely to the
//! lease manager, §4.4).

pub mod block;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::object_client::{ObjectClient, ObjectError};
use block::{spans, BLOCK_SIZE};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("range [{offset}, {offset}+{length}) exceeds export size {export_size}")]
    RangeError {
        offset: u64,
        length: u64,
        export_size: u64,
    },

    #[error("object store unavailable: {0}")]
    Unavailable(#[from] ObjectError),
}

fn block_key(export_name: &str, index: u64) -> String {
    format!("blocks/{export_name}/{:016x}", index * BLOCK_SIZE)
}

fn zero_block() -> Bytes {
    Bytes::from(vec![0u8; BLOCK_SIZE as usize])
}

/// Per-session block storage engine bound to one export.
pub struct BlockEngine {
    export_name: String,
    export_size: u64,
    flush_parallelism: usize,
    object_client: Arc<dyn ObjectClient>,
    dirty: RwLock<HashMap<u64, Bytes>>,
    /// Block indices this session knows to have a backing S3 object, used
    /// only to decide whether an all-zero block can skip a PUT (§4.3
    /// "Sparse optimization"). Conservatively empty on construction.
    known_objects: RwLock<HashSet<u64>>,
}

impl BlockEngine {
    pub fn new(
        export_name: String,
        export_size: u64,
        flush_parallelism: usize,
        object_client: Arc<dyn ObjectClient>,
    ) -> Self {
        Self {
            export_name,
            export_size,
            flush_parallelism,
            object_client,
            dirty: RwLock::new(HashMap::new()),
            known_objects: RwLock::new(HashSet::new()),
        }
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<(), StorageError> {
        if offset.checked_add(length).map_or(true, |end| end > self.export_size) {
            return Err(StorageError::RangeError {
                offset,
                length,
                export_size: self.export_size,
            });
        }
        Ok(())
    }

    async fn fetch_block(&self, index: u64) -> Result<Bytes, ObjectError> {
        let key = block_key(&self.export_name, index);
        match self.object_client.get(&key).await {
            Ok(bytes) => Ok(bytes),
            Err(ObjectError::NotFound) => Ok(zero_block()),
            Err(e) => Err(e),
        }
    }

    /// Read `length` bytes starting at `offset`, preferring dirty-buffer
    /// contents over the durable S3 state (§4.3 "Read algorithm").
    pub async fn read(&self, offset: u64, length: u32) -> Result<Bytes, StorageError> {
        let length = length as u64;
        self.check_range(offset, length)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let want = spans(offset, length);
        let dirty = self.dirty.read().await;

        let mut fetches = Vec::with_capacity(want.len());
        for span in &want {
            if let Some(buf) = dirty.get(&span.index) {
                fetches.push(futures::future::Either::Left(futures::future::ready(Ok(
                    buf.slice(span.lo..span.hi),
                ))));
            } else {
                let span = *span;
                fetches.push(futures::future::Either::Right(async move {
                    let block = self.fetch_block(span.index).await?;
                    Ok::<_, ObjectError>(block.slice(span.lo..span.hi))
                }));
            }
        }

        let parts = futures::future::try_join_all(fetches).await?;
        drop(dirty);

        let mut out = BytesMut::with_capacity(length as usize);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out.freeze())
    }

    /// Buffer `data` at `offset`, materializing partially-overwritten blocks
    /// from their current authoritative content first (§4.3 "Write
    /// algorithm").
    pub async fn write(&self, offset: u64, data: Bytes) -> Result<(), StorageError> {
        let length = data.len() as u64;
        self.check_range(offset, length)?;
        if length == 0 {
            return Ok(());
        }

        let want = spans(offset, length);
        let mut dirty = self.dirty.write().await;

        for span in want {
            let block_start = span.index * BLOCK_SIZE;
            let data_lo = (block_start + span.lo as u64 - offset) as usize;
            let data_hi = (block_start + span.hi as u64 - offset) as usize;
            let piece = data.slice(data_lo..data_hi);

            if span.is_full_block() {
                dirty.insert(span.index, piece);
                continue;
            }

            let current = match dirty.get(&span.index) {
                Some(existing) => existing.clone(),
                None => self.fetch_block(span.index).await?,
            };
            let mut updated = BytesMut::from(&current[..]);
            updated[span.lo..span.hi].copy_from_slice(&piece);
            dirty.insert(span.index, updated.freeze());
        }
        Ok(())
    }

    /// Durably persist every block dirty at entry time (§4.3 "Flush
    /// algorithm"). Writes enqueued during the upload are not waited on but
    /// remain buffered for a later flush or are dropped on disconnect.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let snapshot = {
            let mut dirty = self.dirty.write().await;
            std::mem::take(&mut *dirty)
        };

        if snapshot.is_empty() {
            return Ok(());
        }

        let known = self.known_objects.read().await;
        let to_upload: Vec<(u64, Bytes)> = snapshot
            .iter()
            .filter(|(index, buf)| !(is_all_zero(buf) && !known.contains(index)))
            .map(|(index, buf)| (*index, buf.clone()))
            .collect();
        drop(known);

        let results: Vec<(u64, Bytes, Result<(), ObjectError>)> = stream::iter(to_upload)
            .map(|(index, buf)| async move {
                let key = block_key(&self.export_name, index);
                let result = self.object_client.put(&key, buf.clone()).await;
                (index, buf, result)
            })
            .buffer_unordered(self.flush_parallelism)
            .collect()
            .await;

        let mut failed = Vec::new();
        let mut succeeded = Vec::new();
        for (index, buf, result) in results {
            match result {
                Ok(()) => succeeded.push(index),
                Err(e) => failed.push((index, buf, e)),
            }
        }

        if !succeeded.is_empty() {
            let mut known = self.known_objects.write().await;
            known.extend(succeeded);
        }

        if failed.is_empty() {
            return Ok(());
        }

        // Re-merge unpersisted blocks; a write that landed during the
        // flush takes precedence on collision (§4.3).
        let mut dirty = self.dirty.write().await;
        let first_error = failed.first().map(|(_, _, e)| e.to_string());
        for (index, buf, _) in failed {
            dirty.entry(index).or_insert(buf);
        }
        drop(dirty);

        Err(StorageError::Unavailable(ObjectError::StorageUnavailable(
            first_error.unwrap_or_default(),
        )))
    }
}

fn is_all_zero(buf: &Bytes) -> bool {
    buf.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_client::{HeadInfo, MemoryObjectClient, PutIfAbsent, PutIfMatch};
    use std::sync::atomic::{AtomicBool, Ordering};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn engine(size: u64) -> BlockEngine {
        BlockEngine::new(
            "alpha".to_string(),
            size,
            10,
            Arc::new(MemoryObjectClient::new()),
        )
    }

    #[tokio::test]
    async fn read_your_writes_within_a_session() {
        let e = engine(GIB);
        e.write(0, Bytes::from_static(b"Hello")).await.unwrap();
        let got = e.read(0, 5).await.unwrap();
        assert_eq!(&got[..], b"Hello");
    }

    #[tokio::test]
    async fn unwritten_export_reads_zero() {
        let e = engine(GIB);
        let got = e.read(1_048_576, 4096).await.unwrap();
        assert!(got.iter().all(|b| *b == 0));
        assert_eq!(got.len(), 4096);
    }

    #[tokio::test]
    async fn zero_length_is_a_noop() {
        let e = engine(GIB);
        assert_eq!(e.read(0, 0).await.unwrap().len(), 0);
        e.write(0, Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_is_rejected() {
        let e = engine(1024);
        assert!(matches!(
            e.read(1000, 100).await,
            Err(StorageError::RangeError { .. })
        ));
        assert!(matches!(
            e.write(1000, Bytes::from(vec![0u8; 100])).await,
            Err(StorageError::RangeError { .. })
        ));
    }

    #[tokio::test]
    async fn cross_block_write_touches_exactly_two_blocks() {
        let e = engine(GIB);
        let data = Bytes::from(vec![0xABu8; 20]);
        e.write(BLOCK_SIZE - 10, data).await.unwrap();
        assert_eq!(e.dirty.read().await.len(), 2);
    }

    #[tokio::test]
    async fn full_block_write_skips_read_modify_write() {
        let client = Arc::new(MemoryObjectClient::new());
        let e = BlockEngine::new("gamma".to_string(), GIB, 10, client.clone());
        let data = Bytes::from(vec![0xCDu8; BLOCK_SIZE as usize]);
        e.write(0, data.clone()).await.unwrap();
        let buf = e.dirty.read().await.get(&0).cloned().unwrap();
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let client = Arc::new(MemoryObjectClient::new());
        let e = BlockEngine::new("delta".to_string(), GIB, 10, client.clone());
        e.write(0, Bytes::from_static(b"X")).await.unwrap();
        e.flush().await.unwrap();
        // Second flush has nothing dirty, so no further PUTs happen; the
        // object written by the first flush is untouched.
        e.flush().await.unwrap();
        assert_eq!(
            client.get(&block_key("delta", 0)).await.unwrap()[0],
            b'X'
        );
    }

    #[tokio::test]
    async fn round_trip_survives_a_new_engine_instance() {
        let client: Arc<dyn ObjectClient> = Arc::new(MemoryObjectClient::new());
        {
            let e = BlockEngine::new("alpha".to_string(), GIB, 10, client.clone());
            e.write(0, Bytes::from_static(b"Hello")).await.unwrap();
            e.flush().await.unwrap();
        }
        let e2 = BlockEngine::new("alpha".to_string(), GIB, 10, client.clone());
        let got = e2.read(0, 5).await.unwrap();
        assert_eq!(&got[..], b"Hello");
    }

    #[tokio::test]
    async fn unflushed_write_does_not_survive_a_new_session() {
        let client: Arc<dyn ObjectClient> = Arc::new(MemoryObjectClient::new());
        {
            let e = BlockEngine::new("delta".to_string(), GIB, 10, client.clone());
            e.write(0, Bytes::from_static(b"X")).await.unwrap();
            // Session ends without flush: dirty buffer is simply dropped.
        }
        let e2 = BlockEngine::new("delta".to_string(), GIB, 10, client.clone());
        let got = e2.read(0, 1).await.unwrap();
        assert_eq!(got[0], 0);
    }

    #[tokio::test]
    async fn sparse_export_writes_no_objects() {
        let client = Arc::new(MemoryObjectClient::new());
        let e = BlockEngine::new("beta".to_string(), GIB, 10, client.clone());
        e.flush().await.unwrap();
        assert!(client.get(&block_key("beta", 0)).await.is_err());
    }

    /// Object client whose `put` always fails, to exercise the flush
    /// failure/re-merge path.
    struct FailingPutClient {
        inner: MemoryObjectClient,
        should_fail: AtomicBool,
    }

    impl FailingPutClient {
        fn new() -> Self {
            Self {
                inner: MemoryObjectClient::new(),
                should_fail: AtomicBool::new(true),
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectClient for FailingPutClient {
        async fn get(&self, key: &str) -> Result<Bytes, ObjectError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, body: Bytes) -> Result<(), ObjectError> {
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(ObjectError::StorageUnavailable("simulated".to_string()));
            }
            self.inner.put(key, body).await
        }
        async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<PutIfAbsent, ObjectError> {
            self.inner.put_if_absent(key, body).await
        }
        async fn put_if_match(
            &self,
            key: &str,
            body: Bytes,
            etag: &str,
        ) -> Result<PutIfMatch, ObjectError> {
            self.inner.put_if_match(key, body, etag).await
        }
        async fn head(&self, key: &str) -> Result<Option<HeadInfo>, ObjectError> {
            self.inner.head(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), ObjectError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn failed_flush_remerges_unpersisted_blocks() {
        let client = Arc::new(FailingPutClient::new());
        let e = BlockEngine::new("epsilon".to_string(), GIB, 10, client.clone());
        e.write(0, Bytes::from_static(b"unpersisted")).await.unwrap();

        let result = e.flush().await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));

        // The write is still visible (dirty buffer got the block back).
        let got = e.read(0, 11).await.unwrap();
        assert_eq!(&got[..], b"unpersisted");

        client.should_fail.store(false, Ordering::SeqCst);
        e.flush().await.unwrap();
        let got = e.read(0, 11).await.unwrap();
        assert_eq!(&got[..], b"unpersisted");
    }
}
