//! Event bus: durable append plus live fan-out.
//!
//! `append` persists through the store (which assigns `seq`) and then
//! broadcasts to whoever is subscribed. `subscribe` hands back the persisted
//! history suffix together with a live receiver; because the receiver is
//! created before the history read, an event landing in between is seen
//! twice, never missed — consumers de-duplicate on `seq`.

use crate::events::{EventPayload, TaskEvent};
use crate::store::{Store, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    store: Store,
    channels: RwLock<HashMap<String, broadcast::Sender<TaskEvent>>>,
}

impl EventBus {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            channels: RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn sender(&self, task_id: &str) -> broadcast::Sender<TaskEvent> {
        if let Some(tx) = self.channels.read().await.get(task_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Durably append one event, then fan it out to live subscribers.
    pub async fn append(&self, task_id: &str, payload: EventPayload) -> StoreResult<TaskEvent> {
        let event = self.store.append_event(task_id, &payload)?;
        let tx = self.sender(task_id).await;
        // No receivers is fine; history replay covers late subscribers.
        let _ = tx.send(event.clone());
        Ok(event)
    }

    /// History from `from_seq` (1-based, inclusive) plus a live receiver.
    pub async fn subscribe(
        &self,
        task_id: &str,
        from_seq: i64,
    ) -> StoreResult<(Vec<TaskEvent>, broadcast::Receiver<TaskEvent>)> {
        self.store.get_task(task_id)?;
        let rx = self.sender(task_id).await.subscribe();
        let history = self.store.events_from(task_id, from_seq.max(1))?;
        Ok((history, rx))
    }

    /// Drop the channel for a deleted task.
    pub async fn forget(&self, task_id: &str) {
        self.channels.write().await.remove(task_id);
    }
}
