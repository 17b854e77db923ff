//! Message types and their delivery lifecycle.
//!
//! A message is created by an accepted enqueue call and lives in its queue until it is
//! either acknowledged (deleted) by a consumer or relocated to the queue's dead-letter
//! holding area after too many unacknowledged deliveries.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created `Pending` and immediately visible
//! 2. Each receive hides the message for the visibility window and mints a new
//!    [`ReceiptHandle`]
//! 3. Deleting with the current handle acknowledges the message and removes it
//! 4. Once the receive count reaches the queue's threshold, the next receive moves the
//!    message to `DeadLettered` instead of delivering it again
//!
//! Both states are bounded by the queue's retention windows.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Largest message body a queue accepts, in bytes.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

/// Most attributes a single message may carry.
pub const MAX_ATTRIBUTES: usize = 10;

/// Persistent state of a stored message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(type_name = "text")]
pub enum MessageStatus {
    /// In the primary queue, either visible or in flight
    #[serde(rename = "pending")]
    #[sqlx(rename = "pending")]
    #[strum(serialize = "pending")]
    Pending,
    /// In the dead-letter holding area
    #[serde(rename = "dead")]
    #[sqlx(rename = "dead")]
    #[strum(serialize = "dead")]
    DeadLettered,
}

/// Queue-assigned identifier of a message, stable across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of ownership of one in-flight delivery.
///
/// A new handle is minted every time the message is delivered, so a handle from an
/// earlier delivery can no longer acknowledge or release the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn generate() -> Result<Self, Error> {
        Ok(Self(crate::utils::generate_token::<32>(rand::thread_rng())?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReceiptHandle {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// String attributes stamped on a message at enqueue time.
///
/// Every message carries the two required entries, [`MessageAttributes::SOURCE`] and
/// [`MessageAttributes::REQUEST_ID`]. A few extra entries may be added, up to
/// [`MAX_ATTRIBUTES`] in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageAttributes(BTreeMap<String, String>);

impl MessageAttributes {
    /// Static tag identifying the ingestion endpoint that enqueued the message.
    pub const SOURCE: &'static str = "source";
    /// Correlation id of the originating request.
    pub const REQUEST_ID: &'static str = "requestId";

    pub fn new(source: impl Into<String>, request_id: impl Into<String>) -> Self {
        let mut kv = BTreeMap::new();
        kv.insert(Self::SOURCE.to_owned(), source.into());
        kv.insert(Self::REQUEST_ID.to_owned(), request_id.into());
        Self(kv)
    }

    /// Rebuilds attributes from storage, checking the required subset is present.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, Error> {
        let kv: BTreeMap<String, String> = pairs.into_iter().collect();

        for required in [Self::SOURCE, Self::REQUEST_ID] {
            if !kv.contains_key(required) {
                return Err(Error::missing_parameter(format!("attribute {required}")));
            }
        }

        if kv.len() > MAX_ATTRIBUTES {
            return Err(Error::invalid_parameter(format!(
                "at most {MAX_ATTRIBUTES} attributes are allowed"
            )));
        }

        Ok(Self(kv))
    }

    /// Adds an extra attribute. The required entries cannot be overwritten.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self, Error> {
        let key = key.into();

        if key.is_empty() {
            return Err(Error::invalid_parameter("attribute name must not be empty"));
        }
        if key == Self::SOURCE || key == Self::REQUEST_ID {
            return Err(Error::invalid_parameter(format!(
                "attribute {key} is reserved"
            )));
        }
        if !self.0.contains_key(&key) && self.0.len() >= MAX_ATTRIBUTES {
            return Err(Error::invalid_parameter(format!(
                "at most {MAX_ATTRIBUTES} attributes are allowed"
            )));
        }

        self.0.insert(key, value.into());
        Ok(self)
    }

    pub fn source(&self) -> &str {
        self.get(Self::SOURCE).unwrap_or_default()
    }

    pub fn request_id(&self) -> &str {
        self.get(Self::REQUEST_ID).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Acknowledgment of an accepted enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub md5_of_body: String,
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: Bytes,
    pub attributes: MessageAttributes,
    pub md5_of_body: String,
    /// How many times the message has been handed out, this delivery included
    pub approximate_receive_count: u32,
    pub sent_at: DateTime<Utc>,
}

/// A message that exceeded its queue's redelivery threshold.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: Bytes,
    pub attributes: MessageAttributes,
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Hex-encoded MD5 digest of a message body.
pub fn md5_of_body(body: &[u8]) -> String {
    hex::encode(*md5::compute(body))
}
