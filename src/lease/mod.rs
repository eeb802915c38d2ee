//! Per-export exclusive lease manager, using S3 conditional writes as a
//! distributed mutex (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::object_client::{ObjectClient, ObjectError, PutIfAbsent, PutIfMatch};

const ACQUIRE_RETRY_BOUND: u32 = 8;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("export is held by another session")]
    Conflict,

    #[error("lease lost: {0}")]
    Lost(String),

    #[error("object store unavailable: {0}")]
    Unavailable(#[from] ObjectError),
}

/// The JSON record stored at `locks/{export_name}` (§3 "Lease record").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    holder_id: String,
    acquired_at: i64,
    expires_at: i64,
}

fn lock_key(export_name: &str) -> String {
    format!("locks/{export_name}")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_holder_id() -> String {
    hex::encode(uuid::Uuid::new_v4().as_bytes())
}

/// A held lease. Dropping it does not release the lease (the async
/// `release` call must be awaited first); it exists only to carry the
/// heartbeat task's handle and the "lost" notification.
pub struct LeaseHandle {
    export_name: String,
    holder_id: String,
    etag: Arc<tokio::sync::Mutex<String>>,
    lost: Arc<AtomicBool>,
    lost_notify: Arc<Notify>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl LeaseHandle {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Resolves once the heartbeat task observes the lease has been lost
    /// (taken over by another holder, or a conditional write failed in a
    /// way that cannot be distinguished from takeover).
    pub async fn wait_until_lost(&self) {
        if self.is_lost() {
            return;
        }
        self.lost_notify.notified().await;
    }

    pub fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

pub struct LeaseManager {
    object_client: Arc<dyn ObjectClient>,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
}

impl LeaseManager {
    pub fn new(
        object_client: Arc<dyn ObjectClient>,
        lease_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            object_client,
            lease_ttl,
            heartbeat_interval,
        }
    }

    fn serialize(record: &LeaseRecord) -> Bytes {
        Bytes::from(serde_json::to_vec(record).expect("LeaseRecord always serializes"))
    }

    fn deserialize(body: &Bytes) -> Option<LeaseRecord> {
        serde_json::from_slice(body).ok()
    }

    /// Attempt to acquire the lease for `export_name`. Returns a live handle
    /// with its heartbeat task already running, or `LeaseError::Conflict`
    /// if another holder's lease has not yet expired (§4.4 "Acquire").
    pub async fn acquire(
        self: &Arc<Self>,
        export_name: &str,
    ) -> Result<LeaseHandle, LeaseError> {
        let holder_id = new_holder_id();
        let key = lock_key(export_name);

        for attempt in 0..ACQUIRE_RETRY_BOUND {
            let existing = self.object_client.get(&key).await;
            let now = now_millis();

            let etag = match existing {
                Err(ObjectError::NotFound) => {
                    let record = LeaseRecord {
                        holder_id: holder_id.clone(),
                        acquired_at: now,
                        expires_at: now + self.lease_ttl.as_millis() as i64,
                    };
                    match self
                        .object_client
                        .put_if_absent(&key, Self::serialize(&record))
                        .await?
                    {
                        PutIfAbsent::Created { etag } => Some(etag),
                        PutIfAbsent::PreconditionFailed => None,
                    }
                }
                Ok(body) => {
                    let record = Self::deserialize(&body);
                    let head = self.object_client.head(&key).await?;
                    let current_etag = head.map(|h| h.etag).unwrap_or_default();

                    let expired_or_ours = match &record {
                        Some(r) => now >= r.expires_at || r.holder_id == holder_id,
                        None => true,
                    };
                    let held_by_other = match &record {
                        Some(r) => now < r.expires_at && r.holder_id != holder_id,
                        None => false,
                    };

                    if held_by_other {
                        return Err(LeaseError::Conflict);
                    }
                    if !expired_or_ours {
                        return Err(LeaseError::Conflict);
                    }

                    let fresh = LeaseRecord {
                        holder_id: holder_id.clone(),
                        acquired_at: now,
                        expires_at: now + self.lease_ttl.as_millis() as i64,
                    };
                    match self
                        .object_client
                        .put_if_match(&key, Self::serialize(&fresh), &current_etag)
                        .await?
                    {
                        PutIfMatch::Updated { etag } => Some(etag),
                        PutIfMatch::PreconditionFailed => None,
                    }
                }
                Err(ObjectError::PreconditionFailed) => None,
                Err(e) => return Err(LeaseError::Unavailable(e)),
            };

            if let Some(etag) = etag {
                return Ok(self.spawn_handle(export_name.to_string(), holder_id, etag));
            }

            let backoff = Duration::from_millis(rand::thread_rng().gen_range(10..60) * (attempt as u64 + 1));
            sleep(backoff).await;
        }

        Err(LeaseError::Conflict)
    }

    fn spawn_handle(
        self: &Arc<Self>,
        export_name: String,
        holder_id: String,
        etag: String,
    ) -> LeaseHandle {
        let etag = Arc::new(tokio::sync::Mutex::new(etag));
        let lost = Arc::new(AtomicBool::new(false));
        let lost_notify = Arc::new(Notify::new());

        let manager = Arc::clone(self);
        let task_export = export_name.clone();
        let task_holder = holder_id.clone();
        let task_etag = Arc::clone(&etag);
        let task_lost = Arc::clone(&lost);
        let task_notify = Arc::clone(&lost_notify);

        let heartbeat_task = tokio::spawn(async move {
            loop {
                sleep(manager.heartbeat_interval).await;
                match manager
                    .renew(&task_export, &task_holder, &task_etag)
                    .await
                {
                    Ok(()) => {}
                    Err(e) => {
                        log::warn!(
                            "lease heartbeat lost for export {task_export} holder {task_holder}: {e}"
                        );
                        task_lost.store(true, Ordering::SeqCst);
                        task_notify.notify_waiters();
                        return;
                    }
                }
            }
        });

        LeaseHandle {
            export_name,
            holder_id,
            etag,
            lost,
            lost_notify,
            heartbeat_task: Some(heartbeat_task),
        }
    }

    async fn renew(
        &self,
        export_name: &str,
        holder_id: &str,
        etag: &Arc<tokio::sync::Mutex<String>>,
    ) -> Result<(), LeaseError> {
        let key = lock_key(export_name);
        let current_etag = etag.lock().await.clone();

        let body = self.object_client.get(&key).await?;
        let record = Self::deserialize(&body)
            .ok_or_else(|| LeaseError::Lost("lease record unreadable".to_string()))?;
        if record.holder_id != holder_id {
            return Err(LeaseError::Lost("holder changed".to_string()));
        }

        let now = now_millis();
        let fresh = LeaseRecord {
            holder_id: holder_id.to_string(),
            acquired_at: record.acquired_at,
            expires_at: now + self.lease_ttl.as_millis() as i64,
        };

        match self
            .object_client
            .put_if_match(&key, Self::serialize(&fresh), &current_etag)
            .await?
        {
            PutIfMatch::Updated { etag: new_etag } => {
                *etag.lock().await = new_etag;
                Ok(())
            }
            PutIfMatch::PreconditionFailed => {
                Err(LeaseError::Lost("conditional renew failed".to_string()))
            }
        }
    }

    /// Best-effort release: write a tombstone record. Failure is logged,
    /// not propagated — the lease will simply expire (§4.4 "Release").
    pub async fn release(&self, mut handle: LeaseHandle) {
        handle.stop_heartbeat();
        let key = lock_key(&handle.export_name);
        let current_etag = handle.etag.lock().await.clone();
        let tombstone = LeaseRecord {
            holder_id: handle.holder_id.clone(),
            acquired_at: 0,
            expires_at: 0,
        };
        match self
            .object_client
            .put_if_match(&key, Self::serialize(&tombstone), &current_etag)
            .await
        {
            Ok(_) => {}
            Err(e) => log::warn!(
                "failed to release lease for export {}: {e}",
                handle.export_name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_client::MemoryObjectClient;
    use std::time::Duration as StdDuration;

    fn manager() -> Arc<LeaseManager> {
        Arc::new(LeaseManager::new(
            Arc::new(MemoryObjectClient::new()),
            StdDuration::from_millis(200),
            StdDuration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn second_acquire_conflicts_while_first_holds() {
        let mgr = manager();
        let first = mgr.acquire("epsilon").await.unwrap();
        let second = mgr.acquire("epsilon").await;
        assert!(matches!(second, Err(LeaseError::Conflict)));
        mgr.release(first).await;
    }

    #[tokio::test]
    async fn acquire_after_release_succeeds() {
        let mgr = manager();
        let first = mgr.acquire("epsilon").await.unwrap();
        mgr.release(first).await;
        let second = mgr.acquire("epsilon").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn acquire_after_expiry_succeeds_without_release() {
        let mgr = manager();
        let mut first = mgr.acquire("zeta").await.unwrap();
        first.stop_heartbeat(); // simulate the holder's process dying
        sleep(StdDuration::from_millis(250)).await; // past lease_ttl
        let second = mgr.acquire("zeta").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn independent_exports_do_not_conflict() {
        let mgr = manager();
        let a = mgr.acquire("disk-a").await.unwrap();
        let b = mgr.acquire("disk-b").await.unwrap();
        mgr.release(a).await;
        mgr.release(b).await;
    }
}
