//! Background session writes. The chat response never waits on the database:
//! finished exchanges are handed to a single worker over a bounded channel.
//! Clears go through the same channel so they are ordered with the saves
//! queued before them, and saves that arrive for an id after it was cleared
//! are dropped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use super::{SessionStore, StoreError};
use crate::models::ChatMessage;

pub const SAVE_QUEUE_CAPACITY: usize = 64;

/// How many cleared ids the worker remembers.
const CLEARED_MEMORY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SaveJob {
    pub id: String,
    pub dashboard: String,
    pub messages: Vec<ChatMessage>,
}

enum WriteJob {
    Save(SaveJob),
    Clear {
        id: String,
        dashboard: String,
        reply: oneshot::Sender<Result<String, StoreError>>,
    },
}

impl WriteJob {
    fn session_id(&self) -> &str {
        match self {
            WriteJob::Save(job) => &job.id,
            WriteJob::Clear { id, .. } => id,
        }
    }
}

/// Bounded set of recently cleared session ids.
#[derive(Default)]
struct ClearedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl ClearedIds {
    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > CLEARED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Clone)]
pub struct SaveQueue {
    tx: mpsc::Sender<WriteJob>,
}

impl SaveQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn SessionStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(capacity.max(1));
        tokio::spawn(async move {
            let mut cleared = ClearedIds::default();
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Save(job) if cleared.contains(&job.id) => {
                        tracing::debug!(session_id = %job.id, "save_queue: session was cleared, dropping save");
                    }
                    WriteJob::Save(job) => {
                        match store.upsert(&job.id, &job.dashboard, &job.messages).await {
                            Ok(()) => tracing::debug!(
                                session_id = %job.id,
                                messages = job.messages.len(),
                                "save_queue: session saved"
                            ),
                            Err(e) => tracing::warn!(session_id = %job.id, "save_queue: save failed: {}", e),
                        }
                    }
                    WriteJob::Clear { id, dashboard, reply } => {
                        let result = store.clear(&id, &dashboard).await;
                        if result.is_ok() {
                            cleared.insert(id);
                        }
                        // the requester may have gone away; nothing to do then
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::debug!("save_queue: worker stopped");
        });
        Self { tx }
    }

    /// Hand a job to the worker without waiting. Returns `false` when the job
    /// was dropped.
    pub fn enqueue(&self, job: SaveJob) -> bool {
        match self.tx.try_send(WriteJob::Save(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                tracing::warn!(session_id = %job.session_id(), "save_queue: queue full, dropping save");
                false
            }
            Err(TrySendError::Closed(job)) => {
                tracing::warn!(session_id = %job.session_id(), "save_queue: worker gone, dropping save");
                false
            }
        }
    }

    /// Clear `id` after every write already queued, and return the id the
    /// next exchange should use. Unlike `enqueue` this waits for room in the
    /// queue and for the result.
    pub async fn clear(&self, id: &str, dashboard: &str) -> Result<String, StoreError> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(WriteJob::Clear {
                id: id.to_string(),
                dashboard: dashboard.to_string(),
                reply,
            })
            .await
            .map_err(|_| StoreError::WriterStopped)?;
        result.await.map_err(|_| StoreError::WriterStopped)?
    }
}
