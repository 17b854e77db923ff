//! In-process broker.
//!
//! All queues live behind a single async mutex, which makes every operation atomic with
//! respect to the others. Nothing survives a restart, so this backend is meant for tests
//! and local development.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{future::BoxFuture, FutureExt};
use tokio::sync::Mutex;

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
    message::{
        md5_of_body, DeadLetter, Delivery, MessageAttributes, MessageId, ReceiptHandle,
        SendReceipt,
    },
    queue::{QueuePolicy, QueueStatistics},
    utils::delta,
};

use super::{check_body, receive_limit, Broker};

struct Stored {
    id: MessageId,
    body: Bytes,
    attributes: MessageAttributes,
    md5_of_body: String,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    visible_at: DateTime<Utc>,
    receipt: Option<ReceiptHandle>,
}

struct Dead {
    message: Stored,
    dead_lettered_at: DateTime<Utc>,
}

struct QueueState {
    policy: QueuePolicy,
    next_seq: u64,
    pending: BTreeMap<u64, Stored>,
    dead: BTreeMap<u64, Dead>,
}

impl QueueState {
    fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            next_seq: 0,
            pending: BTreeMap::new(),
            dead: BTreeMap::new(),
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) -> u64 {
        let retention = delta(self.policy.retention);
        let dead_retention = delta(self.policy.dead_letter_retention);

        let before = self.pending.len() + self.dead.len();
        self.pending.retain(|_, m| m.sent_at + retention > now);
        self.dead
            .retain(|_, d| d.message.sent_at + dead_retention > now);

        (before - self.pending.len() - self.dead.len()) as u64
    }

    /// Moves visible messages that used up their deliveries to the dead-letter area.
    fn dead_letter_exhausted(&mut self, queue: &str, now: DateTime<Utc>) {
        let max_receive_count = self.policy.max_receive_count;

        let exhausted: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, m)| m.visible_at <= now && m.receive_count >= max_receive_count)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in exhausted {
            if let Some(mut message) = self.pending.remove(&seq) {
                tracing::warn!(
                    queue,
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "Moving message to dead-letter queue"
                );
                message.receipt = None;
                self.dead.insert(
                    seq,
                    Dead {
                        message,
                        dead_lettered_at: now,
                    },
                );
            }
        }
    }

    fn find_in_flight(&mut self, receipt: &ReceiptHandle) -> Option<&mut Stored> {
        self.pending
            .values_mut()
            .find(|m| m.receipt.as_ref() == Some(receipt))
    }

    fn find_dead(&self, id: &MessageId) -> Option<u64> {
        self.dead
            .iter()
            .find(|(_, d)| &d.message.id == id)
            .map(|(seq, _)| *seq)
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    clock: Arc<dyn Clock>,
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        policy: QueuePolicy,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            policy.check_limits()?;

            let mut queues = self.queues.lock().await;
            queues
                .entry(name.to_owned())
                .and_modify(|q| q.policy = policy)
                .or_insert_with(|| QueueState::new(policy));
            Ok(())
        }
        .boxed()
    }

    fn send<'a>(
        &'a self,
        queue: &'a str,
        body: Bytes,
        attributes: MessageAttributes,
    ) -> BoxFuture<'a, Result<SendReceipt, Error>> {
        async move {
            check_body(&body)?;

            let now = self.clock.now();
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            let id = MessageId::generate();
            let md5_of_body = md5_of_body(&body);
            let seq = state.next_seq;
            state.next_seq += 1;

            state.pending.insert(
                seq,
                Stored {
                    id: id.clone(),
                    body,
                    attributes,
                    md5_of_body: md5_of_body.clone(),
                    sent_at: now,
                    receive_count: 0,
                    visible_at: now,
                    receipt: None,
                },
            );

            Ok(SendReceipt {
                message_id: id,
                md5_of_body,
            })
        }
        .boxed()
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        max_messages: usize,
    ) -> BoxFuture<'a, Result<Vec<Delivery>, Error>> {
        async move {
            let limit = receive_limit(max_messages);
            let now = self.clock.now();
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            state.expire(now);
            state.dead_letter_exhausted(queue, now);

            let visibility = delta(state.policy.visibility_timeout);

            let mut deliveries = Vec::new();

            for message in state.pending.values_mut() {
                if deliveries.len() >= limit {
                    break;
                }
                if message.visible_at > now {
                    continue;
                }

                let receipt = ReceiptHandle::generate()?;
                message.receive_count += 1;
                message.visible_at = now + visibility;
                message.receipt = Some(receipt.clone());

                deliveries.push(Delivery {
                    message_id: message.id.clone(),
                    receipt_handle: receipt,
                    body: message.body.clone(),
                    attributes: message.attributes.clone(),
                    md5_of_body: message.md5_of_body.clone(),
                    approximate_receive_count: message.receive_count,
                    sent_at: message.sent_at,
                });
            }

            Ok(deliveries)
        }
        .boxed()
    }

    fn delete<'a>(
        &'a self,
        queue: &'a str,
        receipt: &'a ReceiptHandle,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            let seq = state
                .pending
                .iter()
                .find(|(_, m)| m.receipt.as_ref() == Some(receipt))
                .map(|(seq, _)| *seq)
                .ok_or_else(|| Error::invalid_receipt_handle(receipt.as_str()))?;

            state.pending.remove(&seq);
            Ok(())
        }
        .boxed()
    }

    fn release<'a>(
        &'a self,
        queue: &'a str,
        receipt: &'a ReceiptHandle,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let now = self.clock.now();
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            let message = state
                .find_in_flight(receipt)
                .ok_or_else(|| Error::invalid_receipt_handle(receipt.as_str()))?;

            message.visible_at = now;
            Ok(())
        }
        .boxed()
    }

    fn dead_letters<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Vec<DeadLetter>, Error>> {
        async move {
            let now = self.clock.now();
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            state.expire(now);
            state.dead_letter_exhausted(queue, now);

            Ok(state
                .dead
                .values()
                .map(|d| DeadLetter {
                    message_id: d.message.id.clone(),
                    body: d.message.body.clone(),
                    attributes: d.message.attributes.clone(),
                    receive_count: d.message.receive_count,
                    sent_at: d.message.sent_at,
                    dead_lettered_at: d.dead_lettered_at,
                })
                .collect())
        }
        .boxed()
    }

    fn redrive<'a>(&'a self, queue: &'a str, id: &'a MessageId) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let now = self.clock.now();
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            let seq = state
                .find_dead(id)
                .ok_or_else(|| Error::dead_letter_not_found(queue, id.as_str()))?;

            if let Some(Dead { mut message, .. }) = state.dead.remove(&seq) {
                message.receive_count = 0;
                message.sent_at = now;
                message.visible_at = now;
                message.receipt = None;
                state.pending.insert(seq, message);
            }

            Ok(())
        }
        .boxed()
    }

    fn discard<'a>(&'a self, queue: &'a str, id: &'a MessageId) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| Error::queue_not_found(queue))?;

            let seq = state
                .find_dead(id)
                .ok_or_else(|| Error::dead_letter_not_found(queue, id.as_str()))?;

            state.dead.remove(&seq);
            Ok(())
        }
        .boxed()
    }

    fn expire(&self) -> BoxFuture<'_, Result<u64, Error>> {
        async move {
            let now = self.clock.now();
            let mut queues = self.queues.lock().await;

            Ok(queues.values_mut().map(|q| q.expire(now)).sum())
        }
        .boxed()
    }

    fn statistics(&self) -> BoxFuture<'_, Result<Vec<QueueStatistics>, Error>> {
        async move {
            let now = self.clock.now();
            let mut queues = self.queues.lock().await;

            for (name, q) in queues.iter_mut() {
                q.dead_letter_exhausted(name, now);
            }

            let mut stats: Vec<QueueStatistics> = queues
                .iter()
                .map(|(name, q)| {
                    let visible = q.pending.values().filter(|m| m.visible_at <= now).count();
                    QueueStatistics {
                        name: name.clone(),
                        visible: visible as i64,
                        in_flight: (q.pending.len() - visible) as i64,
                        dead_lettered: q.dead.len() as i64,
                    }
                })
                .collect();

            stats.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(stats)
        }
        .boxed()
    }
}
