//! Batch consumers with partial failure reporting.
//!
//! A [`BatchConsumer`] runs a [`Processor`] over every delivery of a batch, one at a time.
//! Each message is guarded on its own: an error or a panic marks only that message as
//! failed and processing moves on to the next one. The outcome is a [`BatchReport`],
//! which the [`Poller`](poller::Poller) turns into acknowledgments and early releases.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::message::{Delivery, MessageId};

pub mod poller;
pub mod transform;

pub use poller::{BatchSummary, Poller};
pub use transform::{ProcessedRecord, SimulatedWork};

/// Business logic applied to a single message.
pub trait Processor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn process<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, eyre::Result<ProcessedRecord>>;
}

/// Why a batch produced no report at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The batch did not finish within the consumer timeout
    Timeout(Duration),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "batch timed out after {}ms", after.as_millis()),
        }
    }
}

/// Outcome of one consumer invocation.
#[derive(Debug, Clone)]
pub enum BatchReport {
    /// Every message was processed.
    Complete { processed: Vec<ProcessedRecord> },
    /// Some messages failed. Only those are made visible again.
    Partial {
        processed: Vec<ProcessedRecord>,
        failures: Vec<MessageId>,
    },
    /// The invocation itself failed. Nothing is acknowledged and every message of the
    /// batch reappears once its visibility window expires.
    Aborted { reason: AbortReason },
}

impl BatchReport {
    pub fn processed(&self) -> &[ProcessedRecord] {
        match self {
            Self::Complete { processed } | Self::Partial { processed, .. } => processed,
            Self::Aborted { .. } => &[],
        }
    }

    pub fn failures(&self) -> &[MessageId] {
        match self {
            Self::Partial { failures, .. } => failures,
            Self::Complete { .. } | Self::Aborted { .. } => &[],
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// The partial batch response for this report, or `None` when the invocation aborted.
    pub fn response(&self) -> Option<BatchResponse> {
        if self.is_aborted() {
            return None;
        }

        Some(BatchResponse {
            batch_item_failures: self
                .failures()
                .iter()
                .map(|id| BatchItemFailure {
                    item_identifier: id.clone(),
                })
                .collect(),
        })
    }
}

/// Wire shape of a partial batch response. An empty failure list acknowledges the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: MessageId,
}

#[derive(Clone)]
pub struct BatchConsumer {
    processor: Arc<dyn Processor>,
    timeout: Duration,
}

impl BatchConsumer {
    pub fn new(processor: Arc<dyn Processor>, timeout: Duration) -> Self {
        Self { processor, timeout }
    }

    pub fn processor(&self) -> &str {
        self.processor.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[tracing::instrument(skip_all, fields(processor = self.processor.name(), size = batch.len()))]
    pub async fn handle(&self, batch: &[Delivery]) -> BatchReport {
        let work = async {
            let mut processed = Vec::with_capacity(batch.len());
            let mut failures = Vec::new();

            for delivery in batch {
                // Guards both building the future and polling it.
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
                    self.processor.process(delivery)
                })) {
                    Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                    Err(payload) => Err(payload),
                };

                match outcome {
                    Ok(Ok(record)) => processed.push(record),
                    Ok(Err(error)) => {
                        tracing::warn!(
                            message_id = %delivery.message_id,
                            request_id = delivery.attributes.request_id(),
                            receive_count = delivery.approximate_receive_count,
                            "Failed to process message: {error:#}"
                        );
                        failures.push(delivery.message_id.clone());
                    }
                    Err(_) => {
                        tracing::error!(
                            message_id = %delivery.message_id,
                            request_id = delivery.attributes.request_id(),
                            "Processor panicked"
                        );
                        failures.push(delivery.message_id.clone());
                    }
                }
            }

            (processed, failures)
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok((processed, failures)) if failures.is_empty() => BatchReport::Complete { processed },
            Ok((processed, failures)) => BatchReport::Partial {
                processed,
                failures,
            },
            Err(_) => {
                let reason = AbortReason::Timeout(self.timeout);
                tracing::error!(%reason, "Aborting batch");
                BatchReport::Aborted { reason }
            }
        }
    }
}
