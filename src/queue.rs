//! Queue delivery policy and operator statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::Error;

/// Largest batch a consumer may be configured to receive.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Longest a poller may wait to fill a batch.
pub const MAX_BATCH_WINDOW: Duration = Duration::from_secs(300);

/// Most messages a single receive call hands out.
pub const MAX_RECEIVE_MESSAGES: usize = 10;

/// Longest a received message may stay hidden.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest a message may be kept, in either the primary queue or its dead-letter area.
pub const MAX_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Delivery settings of one queue and its dead-letter holding area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// How long a received message stays hidden from other consumers
    pub visibility_timeout: Duration,
    /// Deliveries allowed before the message is dead-lettered
    pub max_receive_count: u32,
    /// Age after which a message in the primary queue is discarded
    pub retention: Duration,
    /// Age after which a dead letter is discarded
    pub dead_letter_retention: Duration,
    /// Upper bound on messages per consumer invocation
    pub max_batch_size: usize,
    /// Upper bound on time spent filling a batch
    pub batch_window: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::for_consumer_timeout(Duration::from_secs(30))
    }
}

impl QueuePolicy {
    /// Builds the default policy for consumers that may run for `consumer_timeout`.
    ///
    /// The visibility timeout is twice the consumer timeout, so a message is not handed
    /// to a second consumer while the first is still inside its time limit.
    pub fn for_consumer_timeout(consumer_timeout: Duration) -> Self {
        Self {
            visibility_timeout: consumer_timeout.saturating_mul(2),
            max_receive_count: 3,
            retention: Duration::from_secs(4 * 24 * 60 * 60),
            dead_letter_retention: Duration::from_secs(14 * 24 * 60 * 60),
            max_batch_size: 10,
            batch_window: Duration::ZERO,
        }
    }

    /// Checks the policy on its own: every bound a broker needs to store and apply it.
    pub fn check_limits(&self) -> Result<(), Error> {
        if self.max_receive_count == 0 {
            return Err(Error::invalid_parameter(
                "max_receive_count must be at least 1",
            ));
        }

        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(Error::invalid_parameter(format!(
                "max_batch_size must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }

        if self.batch_window > MAX_BATCH_WINDOW {
            return Err(Error::invalid_parameter(format!(
                "batch_window must be at most {}s",
                MAX_BATCH_WINDOW.as_secs()
            )));
        }

        if self.visibility_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(Error::invalid_parameter(format!(
                "visibility_timeout must be at most {}s",
                MAX_VISIBILITY_TIMEOUT.as_secs()
            )));
        }

        for (name, retention) in [
            ("retention", self.retention),
            ("dead_letter_retention", self.dead_letter_retention),
        ] {
            if retention.is_zero() || retention > MAX_RETENTION {
                return Err(Error::invalid_parameter(format!(
                    "{name} must be between 1s and {}s",
                    MAX_RETENTION.as_secs()
                )));
            }
        }

        Ok(())
    }

    /// Checks the policy against the consumer it feeds.
    ///
    /// A message stays in flight while its batch fills and then while the consumer runs,
    /// so the visibility timeout must cover the batch window plus the consumer timeout.
    pub fn validate(&self, consumer_timeout: Duration) -> Result<(), Error> {
        self.check_limits()?;

        let in_flight = self.batch_window.saturating_add(consumer_timeout);
        if self.visibility_timeout < in_flight {
            return Err(Error::invalid_parameter(format!(
                "visibility_timeout ({}s) must cover the batch window plus the consumer timeout ({}s)",
                self.visibility_timeout.as_secs(),
                in_flight.as_secs()
            )));
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct QueueStatistics {
    pub name: String,
    /// Messages ready to be received
    pub visible: i64,
    /// Messages received and not yet acknowledged or visible again
    pub in_flight: i64,
    pub dead_lettered: i64,
}
