use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::WrapErr;
use futures_util::{future::BoxFuture, FutureExt};
use rand::Rng;
use serde::Serialize;

use crate::message::{Delivery, MessageId};

use super::Processor;

/// Result of successfully processing one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub message_id: MessageId,
    pub processor: String,
    pub payload: serde_json::Value,
    pub latency_ms: u64,
    pub processed_at: DateTime<Utc>,
}

/// Stand-in workload: parses the body as JSON and waits a random amount of time.
///
/// A body that is not valid JSON fails that message only.
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    name: String,
    min_latency: Duration,
    max_latency: Duration,
}

impl SimulatedWork {
    pub fn new(name: impl Into<String>, min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            name: name.into(),
            min_latency: min_latency.min(max_latency),
            max_latency,
        }
    }

    fn latency(&self) -> Duration {
        if self.min_latency == self.max_latency {
            return self.min_latency;
        }
        rand::thread_rng().gen_range(self.min_latency..=self.max_latency)
    }
}

impl Processor for SimulatedWork {
    fn name(&self) -> &str {
        &self.name
    }

    fn process<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, eyre::Result<ProcessedRecord>> {
        async move {
            let payload: serde_json::Value = serde_json::from_slice(&delivery.body)
                .wrap_err_with(|| format!("message {} is not valid JSON", delivery.message_id))?;

            let latency = self.latency();
            tokio::time::sleep(latency).await;

            tracing::info!(
                processor = %self.name,
                message_id = %delivery.message_id,
                request_id = delivery.attributes.request_id(),
                source = delivery.attributes.source(),
                latency_ms = latency.as_millis() as u64,
                %payload,
                "Processed message"
            );

            Ok(ProcessedRecord {
                message_id: delivery.message_id.clone(),
                processor: self.name.clone(),
                payload,
                latency_ms: latency.as_millis() as u64,
                processed_at: Utc::now(),
            })
        }
        .boxed()
    }
}
