//! Event-source mapping between a queue and a [`BatchConsumer`].
//!
//! The poller fills a batch from the broker, hands it to the consumer and settles the
//! report: reported failures are released so they become visible right away, every other
//! delivery is deleted. An aborted batch is left untouched and comes back once its
//! visibility window runs out.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::Broker,
    error::Error,
    message::{Delivery, MessageId},
    queue::{QueuePolicy, MAX_RECEIVE_MESSAGES},
};

use super::{BatchConsumer, BatchReport};

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub acknowledged: usize,
    pub released: usize,
    pub aborted: bool,
}

#[derive(Clone)]
pub struct Poller {
    broker: Arc<dyn Broker>,
    queue: String,
    policy: QueuePolicy,
    consumer: BatchConsumer,
    poll_interval: Duration,
}

impl Poller {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        policy: QueuePolicy,
        consumer: BatchConsumer,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            policy,
            consumer,
            poll_interval,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Receives until the batch is full or the batch window has elapsed.
    ///
    /// A full page from the broker is followed up immediately, even with a zero window,
    /// since more messages are likely waiting.
    ///
    /// A batch holds each message at most once. If a message comes back while the batch
    /// is still filling, the later delivery replaces the earlier one, because only its
    /// receipt handle is still valid.
    pub async fn collect(&self) -> Result<Vec<Delivery>, Error> {
        let max = self.policy.max_batch_size.max(1);
        let deadline = Instant::now() + self.policy.batch_window;
        let mut batch: Vec<Delivery> = Vec::new();
        let mut positions: HashMap<MessageId, usize> = HashMap::new();

        while batch.len() < max {
            let want = (max - batch.len()).min(MAX_RECEIVE_MESSAGES);
            let page = self.broker.receive(&self.queue, want).await?;
            let full_page = page.len() == want;
            let before = batch.len();

            for delivery in page {
                match positions.get(&delivery.message_id) {
                    Some(&at) => {
                        tracing::warn!(
                            message_id = %delivery.message_id,
                            receive_count = delivery.approximate_receive_count,
                            "Message redelivered while the batch was filling"
                        );
                        batch[at] = delivery;
                    }
                    None => {
                        positions.insert(delivery.message_id.clone(), batch.len());
                        batch.push(delivery);
                    }
                }
            }

            if full_page && batch.len() > before {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        Ok(batch)
    }

    #[tracing::instrument(skip(self), fields(queue = %self.queue))]
    pub async fn poll_once(&self) -> Result<BatchSummary, Error> {
        let batch = self.collect().await?;

        if batch.is_empty() {
            return Ok(BatchSummary::default());
        }

        let mut summary = BatchSummary {
            received: batch.len(),
            ..Default::default()
        };

        let report = self.consumer.handle(&batch).await;

        if let BatchReport::Aborted { reason } = &report {
            tracing::warn!(
                %reason,
                size = batch.len(),
                "Batch aborted, messages reappear after the visibility timeout"
            );
            summary.aborted = true;
            return Ok(summary);
        }

        let failed: HashSet<&MessageId> = report.failures().iter().collect();

        for delivery in &batch {
            let res = if failed.contains(&delivery.message_id) {
                self.broker
                    .release(&self.queue, &delivery.receipt_handle)
                    .await
                    .map(|_| summary.released += 1)
            } else {
                self.broker
                    .delete(&self.queue, &delivery.receipt_handle)
                    .await
                    .map(|_| summary.acknowledged += 1)
            };

            // A stale handle means the message was already redelivered elsewhere.
            if let Err(e) = res {
                tracing::warn!(message_id = %delivery.message_id, "Failed to settle delivery: {e}");
            }
        }

        tracing::debug!(
            received = summary.received,
            acknowledged = summary.acknowledged,
            released = summary.released,
            "Settled batch"
        );

        Ok(summary)
    }

    /// Polls until `shutdown` is cancelled. Broker errors are logged and retried after the
    /// poll interval.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            queue = %self.queue,
            processor = self.consumer.processor(),
            "Starting consumer"
        );

        loop {
            let idle = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.poll_once() => match res {
                    Ok(summary) => summary.received == 0,
                    Err(e) => {
                        tracing::error!(queue = %self.queue, "Failed to poll queue: {e}");
                        true
                    }
                },
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        tracing::info!(queue = %self.queue, "Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::{
        broker::MemoryBroker,
        clock::ManualClock,
        consumer::tests::Scripted,
        message::MessageAttributes,
    };

    use super::*;

    const QUEUE: &str = "alpha";

    async fn setup(policy: QueuePolicy) -> (ManualClock, Arc<dyn Broker>, Poller) {
        let clock = ManualClock::default();
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::with_clock(Arc::new(clock.clone())));
        broker.create_queue(QUEUE, policy).await.unwrap();

        let consumer = BatchConsumer::new(Arc::new(Scripted), Duration::from_secs(5));
        let poller = Poller::new(
            broker.clone(),
            QUEUE,
            policy,
            consumer,
            Duration::from_millis(5),
        );

        (clock, broker, poller)
    }

    async fn send(broker: &dyn Broker, body: &str) -> MessageId {
        broker
            .send(
                QUEUE,
                Bytes::from(body.to_owned()),
                MessageAttributes::new("api-gateway", "req"),
            )
            .await
            .unwrap()
            .message_id
    }

    #[tokio::test]
    async fn test_only_failures_are_redelivered() {
        let (_, broker, poller) = setup(QueuePolicy::default()).await;

        send(broker.as_ref(), "ok-1").await;
        let failing = send(broker.as_ref(), "fail").await;
        send(broker.as_ref(), "ok-2").await;

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(
            summary,
            BatchSummary {
                received: 3,
                acknowledged: 2,
                released: 1,
                aborted: false,
            }
        );

        let redelivered = broker.receive(QUEUE, 10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message_id, failing);
    }

    #[tokio::test]
    async fn test_poison_message_ends_in_dead_letters() {
        let (_, broker, poller) = setup(QueuePolicy::default()).await;
        let poison = send(broker.as_ref(), "fail").await;

        for _ in 0..3 {
            assert_eq!(poller.poll_once().await.unwrap().released, 1);
        }
        assert_eq!(poller.poll_once().await.unwrap(), BatchSummary::default());

        let dead = broker.dead_letters(QUEUE).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, poison);
    }

    #[tokio::test]
    async fn test_batch_size_is_respected() {
        let policy = QueuePolicy {
            max_batch_size: 25,
            ..Default::default()
        };
        let (_, broker, poller) = setup(policy).await;

        for i in 0..30 {
            send(broker.as_ref(), &format!("ok-{i}")).await;
        }

        assert_eq!(poller.collect().await.unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_batch_window_waits_for_more() {
        let policy = QueuePolicy {
            batch_window: Duration::from_millis(200),
            ..Default::default()
        };
        let (_, broker, poller) = setup(policy).await;

        send(broker.as_ref(), "ok-1").await;

        let late = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                send(broker.as_ref(), "ok-2").await;
            })
        };

        let batch = poller.collect().await.unwrap();
        late.await.unwrap();

        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_holds_each_message_once() {
        let policy = QueuePolicy {
            visibility_timeout: Duration::from_millis(100),
            batch_window: Duration::from_millis(300),
            ..Default::default()
        };
        let (clock, broker, poller) = setup(policy).await;
        let id = send(broker.as_ref(), "ok").await;

        // The visibility window runs out while the batch is still filling.
        let expiry = {
            let clock = clock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                clock.advance(Duration::from_millis(200));
            })
        };

        let batch = poller.collect().await.unwrap();
        expiry.await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].approximate_receive_count, 2);

        // The kept delivery carries the current handle.
        broker.delete(QUEUE, &batch[0].receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_batch_is_left_in_flight() {
        let (clock, broker, _) = setup(QueuePolicy::default()).await;

        struct Slow;

        impl crate::consumer::Processor for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            fn process<'a>(
                &'a self,
                _delivery: &'a Delivery,
            ) -> futures_util::future::BoxFuture<'a, eyre::Result<crate::consumer::ProcessedRecord>>
            {
                use futures_util::FutureExt;
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    eyre::bail!("too slow")
                }
                .boxed()
            }
        }

        let poller = Poller::new(
            broker.clone(),
            QUEUE,
            QueuePolicy::default(),
            BatchConsumer::new(Arc::new(Slow), Duration::from_millis(20)),
            Duration::from_millis(5),
        );

        let id = send(broker.as_ref(), "ok").await;

        let summary = poller.poll_once().await.unwrap();
        assert!(summary.aborted);
        assert_eq!((summary.acknowledged, summary.released), (0, 0));

        // Still hidden until the visibility timeout passes.
        assert!(broker.receive(QUEUE, 10).await.unwrap().is_empty());

        clock.advance(QueuePolicy::default().visibility_timeout);
        let redelivered = broker.receive(QUEUE, 10).await.unwrap();
        assert_eq!(redelivered[0].message_id, id);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, broker, poller) = setup(QueuePolicy::default()).await;
        send(broker.as_ref(), "ok").await;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poller.run(shutdown.clone()));

        for _ in 0..100 {
            let stats = broker.statistics().await.unwrap();
            if stats[0].visible == 0 && stats[0].in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        task.await.unwrap();

        let stats = broker.statistics().await.unwrap();
        assert_eq!((stats[0].visible, stats[0].in_flight), (0, 0));
    }
}
