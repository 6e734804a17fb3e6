use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octorouter_storage::{Delivery, StorageError, WorkQueue, poison_queue};
use papaya::HashMap as PapayaHashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Message {
    id: String,
    payload: String,
    dequeue_count: u32,
}

#[derive(Debug)]
struct Lease {
    message: Message,
    receipt: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<Message>,
    leased: HashMap<String, Lease>,
}

impl QueueState {
    /// Moves leases past their deadline back to the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                self.visible.push_front(lease.message);
            }
        }
    }

    fn take_lease(&mut self, delivery: &Delivery) -> Result<Message, StorageError> {
        match self.leased.get(&delivery.id) {
            Some(lease) if lease.receipt == delivery.receipt => self
                .leased
                .remove(&delivery.id)
                .map(|lease| lease.message)
                .ok_or_else(|| StorageError::lease_expired(&delivery.id)),
            _ => Err(StorageError::lease_expired(&delivery.id)),
        }
    }
}

/// In-memory work queues with visibility-timeout leases.
///
/// Queues are created on first use. Lease deadlines use `tokio::time`, so a
/// paused test clock drives redelivery.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: PapayaHashMap<String, Arc<Mutex<QueueState>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<Mutex<QueueState>> {
        let guard = self.queues.pin();
        Arc::clone(guard.get_or_insert_with(name.to_string(), Default::default))
    }

    /// Payloads currently visible in `queue`, front first.
    pub async fn peek(&self, queue: &str) -> Vec<String> {
        let state = self.queue(queue);
        let state = state.lock().await;
        state.visible.iter().map(|m| m.payload.clone()).collect()
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn send(&self, queue: &str, payload: String) -> Result<(), StorageError> {
        let state = self.queue(queue);
        state.lock().await.visible.push_back(Message {
            id: Uuid::new_v4().to_string(),
            payload,
            dequeue_count: 0,
        });
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, StorageError> {
        let state = self.queue(queue);
        let mut state = state.lock().await;
        let now = Instant::now();
        state.reclaim_expired(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut message) = state.visible.pop_front() else {
                break;
            };
            message.dequeue_count += 1;
            let receipt = Uuid::new_v4().to_string();
            deliveries.push(Delivery {
                id: message.id.clone(),
                receipt: receipt.clone(),
                queue: queue.to_string(),
                payload: message.payload.clone(),
                dequeue_count: message.dequeue_count,
            });
            state.leased.insert(
                message.id.clone(),
                Lease {
                    message,
                    receipt,
                    deadline: now + visibility_timeout,
                },
            );
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), StorageError> {
        let state = self.queue(&delivery.queue);
        state.lock().await.take_lease(delivery)?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), StorageError> {
        let state = self.queue(&delivery.queue);
        let mut state = state.lock().await;
        let message = state.take_lease(delivery)?;
        state.visible.push_front(message);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), StorageError> {
        let message = {
            let state = self.queue(&delivery.queue);
            let mut state = state.lock().await;
            state.take_lease(delivery)?
        };
        tracing::debug!(
            queue = %delivery.queue,
            id = %message.id,
            reason,
            "Moved message to poison queue"
        );
        let poison = self.queue(&poison_queue(&delivery.queue));
        poison.lock().await.visible.push_back(Message {
            dequeue_count: 0,
            ..message
        });
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, StorageError> {
        let state = self.queue(queue);
        let state = state.lock().await;
        Ok(state.visible.len() + state.leased.len())
    }
}
