//! Typed facade over an S3-compatible object store.
//!
//! Gives the storage engine and the lease manager a small, retrying,
//! conditional-write-capable interface instead of the full AWS SDK surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;

/// Maximum outbound object-store requests in flight at once, across all
/// sessions sharing this client (see §5: "cap concurrent outbound requests").
const MAX_IN_FLIGHT: usize = 64;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Errors surfaced by the object client wrapper.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("key not found")]
    NotFound,

    #[error("conditional write precondition failed")]
    PreconditionFailed,

    #[error("object store unavailable after retries: {0}")]
    StorageUnavailable(String),
}

/// Outcome of a `put_if_absent` call.
#[derive(Debug)]
pub enum PutIfAbsent {
    Created { etag: String },
    PreconditionFailed,
}

/// Outcome of a `put_if_match` call.
#[derive(Debug)]
pub enum PutIfMatch {
    Updated { etag: String },
    PreconditionFailed,
}

/// Result of a `head` call.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub etag: String,
}

/// Abstraction over the object store so the engine and lease manager can be
/// tested against an in-memory fake (see [`memory::MemoryObjectStore`]).
#[async_trait::async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectError>;
    async fn put(&self, key: &str, body: Bytes) -> Result<(), ObjectError>;
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<PutIfAbsent, ObjectError>;
    async fn put_if_match(
        &self,
        key: &str,
        body: Bytes,
        etag: &str,
    ) -> Result<PutIfMatch, ObjectError>;
    async fn head(&self, key: &str) -> Result<Option<HeadInfo>, ObjectError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectError>;
}

/// S3-backed implementation. Wraps `aws-sdk-s3` with a fixed retry policy
/// and a semaphore bounding outbound concurrency.
pub struct S3ObjectClient {
    client: Client,
    bucket: String,
    limiter: Arc<Semaphore>,
}

impl S3ObjectClient {
    pub fn new(client: Client, bucket: String) -> Self {
        Self {
            client,
            bucket,
            limiter: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
        }
    }

    fn is_transient(err: &aws_sdk_s3::error::SdkError<impl std::error::Error>) -> bool {
        use aws_sdk_s3::error::SdkError;
        match err {
            SdkError::TimeoutError(_)
            | SdkError::DispatchFailure(_)
            | SdkError::ResponseError(_) => true,
            SdkError::ServiceError(svc) => svc.raw().status().as_u16() >= 500,
            _ => false,
        }
    }

    async fn backoff(attempt: u32) {
        let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(6));
        let capped = exp.min(MAX_BACKOFF);
        let jitter_ms = rand::random::<u64>() % (capped.as_millis() as u64 + 1);
        sleep(Duration::from_millis(jitter_ms)).await;
    }
}

#[async_trait::async_trait]
impl ObjectClient for S3ObjectClient {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectError> {
        let _permit = self.limiter.acquire().await.expect("semaphore not closed");
        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;
            match result {
                Ok(out) => {
                    let data = out
                        .body
                        .collect()
                        .await
                        .map_err(|e| ObjectError::StorageUnavailable(e.to_string()))?;
                    return Ok(data.into_bytes());
                }
                Err(aws_sdk_s3::error::SdkError::ServiceError(svc))
                    if svc.err().is_no_such_key() =>
                {
                    return Err(ObjectError::NotFound);
                }
                Err(e) if Self::is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    log::warn!("object get({key}) transient failure, retrying: {e}");
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(ObjectError::StorageUnavailable(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), ObjectError> {
        let _permit = self.limiter.acquire().await.expect("semaphore not closed");
        for attempt in 0..MAX_ATTEMPTS {
            let stream = ByteStream::from(body.clone());
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(stream)
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if Self::is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    log::warn!("object put({key}) transient failure, retrying: {e}");
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(ObjectError::StorageUnavailable(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<PutIfAbsent, ObjectError> {
        let _permit = self.limiter.acquire().await.expect("semaphore not closed");
        for attempt in 0..MAX_ATTEMPTS {
            let stream = ByteStream::from(body.clone());
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .if_none_match("*")
                .body(stream)
                .send()
                .await;
            match result {
                Ok(out) => {
                    let etag = out.e_tag().unwrap_or_default().to_string();
                    return Ok(PutIfAbsent::Created { etag });
                }
                Err(aws_sdk_s3::error::SdkError::ServiceError(svc))
                    if svc.raw().status().as_u16() == 412 =>
                {
                    return Ok(PutIfAbsent::PreconditionFailed);
                }
                Err(e) if Self::is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    log::warn!("object put_if_absent({key}) transient failure, retrying: {e}");
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(ObjectError::StorageUnavailable(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn put_if_match(
        &self,
        key: &str,
        body: Bytes,
        etag: &str,
    ) -> Result<PutIfMatch, ObjectError> {
        let _permit = self.limiter.acquire().await.expect("semaphore not closed");
        for attempt in 0..MAX_ATTEMPTS {
            let stream = ByteStream::from(body.clone());
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .if_match(etag)
                .body(stream)
                .send()
                .await;
            match result {
                Ok(out) => {
                    let etag = out.e_tag().unwrap_or_default().to_string();
                    return Ok(PutIfMatch::Updated { etag });
                }
                Err(aws_sdk_s3::error::SdkError::ServiceError(svc))
                    if svc.raw().status().as_u16() == 412 =>
                {
                    return Ok(PutIfMatch::PreconditionFailed);
                }
                Err(e) if Self::is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    log::warn!("object put_if_match({key}) transient failure, retrying: {e}");
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(ObjectError::StorageUnavailable(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn head(&self, key: &str) -> Result<Option<HeadInfo>, ObjectError> {
        let _permit = self.limiter.acquire().await.expect("semaphore not closed");
        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;
            match result {
                Ok(out) => {
                    let etag = out.e_tag().unwrap_or_default().to_string();
                    return Ok(Some(HeadInfo { etag }));
                }
                Err(aws_sdk_s3::error::SdkError::ServiceError(svc))
                    if svc.raw().status().as_u16() == 404 =>
                {
                    return Ok(None);
                }
                Err(e) if Self::is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(ObjectError::StorageUnavailable(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectError> {
        let _permit = self.limiter.acquire().await.expect("semaphore not closed");
        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if Self::is_transient(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    Self::backoff(attempt).await;
                }
                Err(e) => return Err(ObjectError::StorageUnavailable(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }
}

/// In-memory fake used by unit tests for the storage engine and lease manager,
/// standing in for a live S3 endpoint the way `CasBackend`'s tests stand in
/// for a live CAS server.
pub struct MemoryObjectClient {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    next_etag: Mutex<u64>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_etag: Mutex::new(0),
        }
    }

    async fn fresh_etag(&self) -> String {
        let mut n = self.next_etag.lock().await;
        *n += 1;
        format!("etag-{n}")
    }
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn get(&self, key: &str) -> Result<Bytes, ObjectError> {
        let objects = self.objects.lock().await;
        objects
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or(ObjectError::NotFound)
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), ObjectError> {
        let etag = self.fresh_etag().await;
        self.objects.lock().await.insert(key.to_string(), (body, etag));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<PutIfAbsent, ObjectError> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(key) {
            return Ok(PutIfAbsent::PreconditionFailed);
        }
        let etag = self.fresh_etag().await;
        objects.insert(key.to_string(), (body, etag.clone()));
        Ok(PutIfAbsent::Created { etag })
    }

    async fn put_if_match(
        &self,
        key: &str,
        body: Bytes,
        etag: &str,
    ) -> Result<PutIfMatch, ObjectError> {
        let mut objects = self.objects.lock().await;
        match objects.get(key) {
            Some((_, current_etag)) if current_etag == etag => {
                let new_etag = self.fresh_etag().await;
                objects.insert(key.to_string(), (body, new_etag.clone()));
                Ok(PutIfMatch::Updated { etag: new_etag })
            }
            _ => Ok(PutIfMatch::PreconditionFailed),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<HeadInfo>, ObjectError> {
        let objects = self.objects.lock().await;
        Ok(objects.get(key).map(|(_, etag)| HeadInfo {
            etag: etag.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_only_succeeds_once() {
        let client = MemoryObjectClient::new();
        let first = client.put_if_absent("k", Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(first, PutIfAbsent::Created { .. }));
        let second = client.put_if_absent("k", Bytes::from_static(b"b")).await.unwrap();
        assert!(matches!(second, PutIfAbsent::PreconditionFailed));
    }

    #[tokio::test]
    async fn put_if_match_requires_current_etag() {
        let client = MemoryObjectClient::new();
        let created = client.put_if_absent("k", Bytes::from_static(b"a")).await.unwrap();
        let etag = match created {
            PutIfAbsent::Created { etag } => etag,
            _ => unreachable!(),
        };
        let stale = client
            .put_if_match("k", Bytes::from_static(b"c"), "stale")
            .await
            .unwrap();
        assert!(matches!(stale, PutIfMatch::PreconditionFailed));
        let fresh = client
            .put_if_match("k", Bytes::from_static(b"c"), &etag)
            .await
            .unwrap();
        assert!(matches!(fresh, PutIfMatch::Updated { .. }));
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let client = MemoryObjectClient::new();
        assert!(matches!(client.get("missing").await, Err(ObjectError::NotFound)));
    }
}
