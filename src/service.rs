use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    broker::{Broker, MemoryBroker, SqliteBroker},
    clock::{Clock, SystemClock},
    config::{Backend, Config},
    consumer::{BatchConsumer, Poller, Processor, SimulatedWork},
    edge::RateLimiter,
    error::Error,
    message::{MessageAttributes, SendReceipt},
    queue::QueuePolicy,
};

/// Shared application state: the queue backend plus the configuration it was set up with.
pub struct Service {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    config: Config,
}

#[bon::bon]
impl Service {
    /// Opens the configured backend and declares one queue per channel.
    ///
    /// An explicit `broker` takes precedence over the configured backend.
    #[builder]
    pub async fn connect(
        #[builder(default)] config: Config,
        clock: Option<Arc<dyn Clock>>,
        broker: Option<Arc<dyn Broker>>,
    ) -> eyre::Result<Self> {
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));

        let policy = config.queue_policy();
        policy.validate(config.consumer_timeout())?;

        let broker: Arc<dyn Broker> = match (broker, config.backend) {
            (Some(broker), _) => broker,
            (None, Backend::Memory) => Arc::new(MemoryBroker::with_clock(clock.clone())),
            (None, Backend::Sqlite) => {
                Arc::new(SqliteBroker::open(Some(config.db_path()), clock.clone()).await?)
            }
        };

        for channel in &config.channels {
            broker.create_queue(channel, policy).await?;
            tracing::info!(
                queue = %channel,
                visibility_timeout_secs = policy.visibility_timeout.as_secs(),
                max_receive_count = policy.max_receive_count,
                "Declared queue"
            );
        }

        Ok(Self {
            broker,
            clock,
            policy,
            config,
        })
    }
}

impl Service {
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Translates an inbound request into a queued message.
    ///
    /// The body is stored verbatim; the caller is answered as soon as the broker has
    /// accepted it. Broker failures surface as [`Error::EnqueueRejected`].
    pub async fn enqueue(
        &self,
        channel: &str,
        body: Bytes,
        request_id: &str,
    ) -> Result<SendReceipt, Error> {
        if !self.config.has_channel(channel) {
            return Err(Error::UnknownChannel {
                channel: channel.to_owned(),
            });
        }

        if body.len() > self.config.max_body_bytes {
            return Err(Error::PayloadTooLarge {
                size: body.len(),
                limit: self.config.max_body_bytes,
            });
        }

        let attributes = MessageAttributes::new(&self.config.source, request_id);

        match self.broker.send(channel, body, attributes).await {
            Ok(receipt) => {
                tracing::info!(
                    queue = channel,
                    message_id = %receipt.message_id,
                    request_id,
                    "Message sent to queue"
                );
                Ok(receipt)
            }
            Err(e @ Error::PayloadTooLarge { .. }) => Err(e),
            Err(e) => {
                tracing::error!(queue = channel, request_id, "Failed to enqueue message: {e}");
                Err(Error::EnqueueRejected {
                    queue: channel.to_owned(),
                })
            }
        }
    }

    /// Default workload for a channel.
    pub fn processor(&self, channel: &str) -> Arc<dyn Processor> {
        let (min, max) = self.config.work_latency();
        Arc::new(SimulatedWork::new(channel, min, max))
    }

    pub fn poller(&self, channel: &str, processor: Arc<dyn Processor>) -> Result<Poller, Error> {
        if !self.config.has_channel(channel) {
            return Err(Error::UnknownChannel {
                channel: channel.to_owned(),
            });
        }

        Ok(Poller::new(
            self.broker.clone(),
            channel,
            self.policy,
            BatchConsumer::new(processor, self.config.consumer_timeout()),
            self.config.poll_interval(),
        ))
    }

    /// Retention sweep over every queue, plus pruning of idle rate limit windows.
    pub async fn sweep(&self, limiter: Option<&RateLimiter>) -> Result<u64, Error> {
        let expired = self.broker.expire().await?;
        if expired > 0 {
            tracing::warn!(expired, "Discarded messages past their retention window");
        }

        if let Some(limiter) = limiter {
            let pruned = limiter.prune(self.clock.now());
            tracing::debug!(pruned, "Pruned rate limit windows");
        }

        Ok(expired)
    }

    /// Starts one consumer per channel and the maintenance task. Everything stops when
    /// `shutdown` is cancelled.
    pub fn spawn_workers(
        self: &Arc<Self>,
        limiter: Option<Arc<RateLimiter>>,
        shutdown: CancellationToken,
    ) -> Result<JoinSet<()>, Error> {
        let mut tasks = JoinSet::new();

        for channel in &self.config.channels {
            let poller = self.poller(channel, self.processor(channel))?;
            tasks.spawn(poller.run(shutdown.clone()));
        }

        let service = Arc::clone(self);
        let interval = self.config.sweep_interval();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.sweep(limiter.as_deref()).await {
                            tracing::error!("Maintenance sweep failed: {e}");
                        }
                    }
                }
            }
        });

        Ok(tasks)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use futures_util::{future::BoxFuture, FutureExt};

    use crate::{
        message::{DeadLetter, Delivery, MessageId, ReceiptHandle},
        queue::QueueStatistics,
    };

    use super::*;

    pub(crate) fn memory_config() -> Config {
        Config {
            backend: Backend::Memory,
            work_min_ms: 0,
            work_max_ms: 0,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    /// A broker whose every operation fails, as when the queue is unreachable.
    pub(crate) struct Unavailable;

    impl Broker for Unavailable {
        fn create_queue<'a>(
            &'a self,
            _name: &'a str,
            _policy: QueuePolicy,
        ) -> BoxFuture<'a, Result<(), Error>> {
            async { Ok(()) }.boxed()
        }

        fn send<'a>(
            &'a self,
            _queue: &'a str,
            _body: Bytes,
            _attributes: MessageAttributes,
        ) -> BoxFuture<'a, Result<SendReceipt, Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn receive<'a>(
            &'a self,
            _queue: &'a str,
            _max_messages: usize,
        ) -> BoxFuture<'a, Result<Vec<Delivery>, Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn delete<'a>(
            &'a self,
            _queue: &'a str,
            _receipt: &'a ReceiptHandle,
        ) -> BoxFuture<'a, Result<(), Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn release<'a>(
            &'a self,
            _queue: &'a str,
            _receipt: &'a ReceiptHandle,
        ) -> BoxFuture<'a, Result<(), Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn dead_letters<'a>(
            &'a self,
            _queue: &'a str,
        ) -> BoxFuture<'a, Result<Vec<DeadLetter>, Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn redrive<'a>(
            &'a self,
            _queue: &'a str,
            _id: &'a MessageId,
        ) -> BoxFuture<'a, Result<(), Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn discard<'a>(
            &'a self,
            _queue: &'a str,
            _id: &'a MessageId,
        ) -> BoxFuture<'a, Result<(), Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn expire(&self) -> BoxFuture<'_, Result<u64, Error>> {
            async { Err(Error::opaque()) }.boxed()
        }

        fn statistics(&self) -> BoxFuture<'_, Result<Vec<QueueStatistics>, Error>> {
            async { Err(Error::opaque()) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_enqueue_stamps_attributes() {
        let service = Service::connect().config(memory_config()).call().await.unwrap();

        let body = Bytes::from_static(br#"{"message":"Hello World"}"#);
        let receipt = service.enqueue("alpha", body.clone(), "req-42").await.unwrap();

        let delivery = service.broker().receive("alpha", 10).await.unwrap().remove(0);
        assert_eq!(delivery.message_id, receipt.message_id);
        assert_eq!(delivery.body, body);
        assert_eq!(delivery.attributes.source(), "api-gateway");
        assert_eq!(delivery.attributes.request_id(), "req-42");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_channel() {
        let service = Service::connect().config(memory_config()).call().await.unwrap();

        let res = service.enqueue("gamma", Bytes::new(), "req").await;
        assert!(matches!(res, Err(Error::UnknownChannel { .. })));
    }

    #[tokio::test]
    async fn test_enqueue_hides_broker_failure() {
        let service = Service::connect()
            .config(memory_config())
            .broker(Arc::new(Unavailable))
            .call()
            .await
            .unwrap();

        let res = service.enqueue("alpha", Bytes::from_static(b"{}"), "req").await;
        assert!(matches!(res, Err(Error::EnqueueRejected { ref queue }) if queue == "alpha"));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_policy() {
        let config = Config {
            visibility_timeout_secs: Some(5),
            ..memory_config()
        };

        assert!(Service::connect().config(config).call().await.is_err());
    }

    #[tokio::test]
    async fn test_workers_drain_queues() {
        let service = Arc::new(Service::connect().config(memory_config()).call().await.unwrap());

        service
            .enqueue("alpha", Bytes::from_static(br#"{"message":"Hello World"}"#), "req-1")
            .await
            .unwrap();
        service
            .enqueue("beta", Bytes::from_static(b"not json"), "req-2")
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let mut tasks = service.spawn_workers(None, shutdown.clone()).unwrap();

        // The malformed message exhausts its deliveries and lands in the dead-letter area.
        let mut dead = Vec::new();
        for _ in 0..200 {
            dead = service.broker().dead_letters("beta").await.unwrap();
            if !dead.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        while tasks.join_next().await.is_some() {}

        assert_eq!(dead.len(), 1);
        let stats = service.broker().statistics().await.unwrap();
        assert!(stats.iter().all(|s| s.visible == 0 && s.in_flight == 0));
    }
}
