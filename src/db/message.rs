use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::{
    error::Error,
    message::{MessageAttributes, MessageStatus, ReceiptHandle},
};

#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct Message {
    pub id: i64,
    pub message_id: String,
    pub body: Vec<u8>,
    pub md5_of_body: String,
    pub sent_at: i64,
    pub receive_count: i64,
    pub receipt_handle: Option<String>,
    pub dead_lettered_at: Option<i64>,
}

#[derive(FromRow)]
struct KvPair {
    k: String,
    v: String,
}

impl Message {
    pub fn receive_count(&self) -> u32 {
        u32::try_from(self.receive_count).unwrap_or(u32::MAX)
    }

    pub async fn insert(
        db: &mut SqliteConnection,
        queue: i64,
        message_id: &str,
        body: &[u8],
        md5_of_body: &str,
        now_ms: i64,
        attributes: &MessageAttributes,
    ) -> Result<i64, Error> {
        let id: i64 = sqlx::query_scalar(
            "
            INSERT INTO messages (message_id, queue, body, md5_of_body, status, sent_at, visible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING id
            ",
        )
        .bind(message_id)
        .bind(queue)
        .bind(body)
        .bind(md5_of_body)
        .bind(MessageStatus::Pending)
        .bind(now_ms)
        .fetch_one(&mut *db)
        .await?;

        for (k, v) in attributes.iter() {
            sqlx::query("INSERT INTO kv_pairs (message, k, v) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(k)
                .bind(v)
                .execute(&mut *db)
                .await?;
        }

        Ok(id)
    }

    pub async fn attributes(db: &mut SqliteConnection, id: i64) -> Result<MessageAttributes, Error> {
        let mut stream = sqlx::query_as::<_, KvPair>("SELECT k, v FROM kv_pairs WHERE message = $1")
            .bind(id)
            .fetch(db);

        let mut pairs = Vec::new();
        while let Some(pair) = stream.next().await.transpose()? {
            pairs.push((pair.k, pair.v));
        }

        MessageAttributes::from_pairs(pairs)
    }

    /// Deletes pending messages sent before `pending_cutoff` and dead letters sent before
    /// `dead_cutoff`.
    pub async fn expire(
        db: &mut SqliteConnection,
        queue: i64,
        pending_cutoff: i64,
        dead_cutoff: i64,
    ) -> Result<u64, Error> {
        let res = sqlx::query(
            "
            DELETE FROM messages
            WHERE queue = $1
            AND (
                (status = $2 AND sent_at <= $3)
                OR (status = $4 AND sent_at <= $5)
            )
            ",
        )
        .bind(queue)
        .bind(MessageStatus::Pending)
        .bind(pending_cutoff)
        .bind(MessageStatus::DeadLettered)
        .bind(dead_cutoff)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Moves visible messages that used up their deliveries to the dead-letter area.
    pub async fn dead_letter_exhausted(
        db: &mut SqliteConnection,
        queue: i64,
        now_ms: i64,
        max_receive_count: u32,
    ) -> Result<Vec<String>, Error> {
        Ok(sqlx::query_scalar(
            "
            UPDATE messages
            SET status = $1, dead_lettered_at = $2, receipt_handle = NULL
            WHERE queue = $3 AND status = $4 AND visible_at <= $2 AND receive_count >= $5
            RETURNING message_id
            ",
        )
        .bind(MessageStatus::DeadLettered)
        .bind(now_ms)
        .bind(queue)
        .bind(MessageStatus::Pending)
        .bind(i64::from(max_receive_count))
        .fetch_all(db)
        .await?)
    }

    pub async fn visible(
        db: &mut SqliteConnection,
        queue: i64,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<i64>, Error> {
        Ok(sqlx::query_scalar(
            "
            SELECT id FROM messages
            WHERE queue = $1 AND status = $2 AND visible_at <= $3
            ORDER BY id
            LIMIT $4
            ",
        )
        .bind(queue)
        .bind(MessageStatus::Pending)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(db)
        .await?)
    }

    /// Hands the message out under a new receipt handle until `visible_at`.
    pub async fn claim(
        db: &mut SqliteConnection,
        id: i64,
        receipt: &ReceiptHandle,
        visible_at: i64,
    ) -> Result<Message, Error> {
        Ok(sqlx::query_as(
            "
            UPDATE messages
            SET receipt_handle = $1, visible_at = $2, receive_count = receive_count + 1
            WHERE id = $3
            RETURNING *
            ",
        )
        .bind(receipt.as_str())
        .bind(visible_at)
        .bind(id)
        .fetch_one(db)
        .await?)
    }

    pub async fn find_in_flight(
        db: &mut SqliteConnection,
        queue: i64,
        receipt: &ReceiptHandle,
    ) -> Result<i64, Error> {
        sqlx::query_scalar(
            "SELECT id FROM messages WHERE queue = $1 AND status = $2 AND receipt_handle = $3",
        )
        .bind(queue)
        .bind(MessageStatus::Pending)
        .bind(receipt.as_str())
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::invalid_receipt_handle(receipt.as_str()))
    }

    pub async fn find_dead(
        db: &mut SqliteConnection,
        queue: i64,
        message_id: &str,
    ) -> Result<Option<i64>, Error> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM messages WHERE queue = $1 AND status = $2 AND message_id = $3",
        )
        .bind(queue)
        .bind(MessageStatus::DeadLettered)
        .bind(message_id)
        .fetch_optional(db)
        .await?)
    }

    pub async fn list_dead(db: &mut SqliteConnection, queue: i64) -> Result<Vec<Message>, Error> {
        Ok(
            sqlx::query_as("SELECT * FROM messages WHERE queue = $1 AND status = $2 ORDER BY id")
                .bind(queue)
                .bind(MessageStatus::DeadLettered)
                .fetch_all(db)
                .await?,
        )
    }

    pub async fn set_visible_at(
        db: &mut SqliteConnection,
        id: i64,
        visible_at: i64,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE messages SET visible_at = $1 WHERE id = $2")
            .bind(visible_at)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Returns a dead letter to the primary queue as if it had just been sent.
    pub async fn redrive(db: &mut SqliteConnection, id: i64, now_ms: i64) -> Result<(), Error> {
        sqlx::query(
            "
            UPDATE messages
            SET status = $1, sent_at = $2, visible_at = $2, receive_count = 0,
                receipt_handle = NULL, dead_lettered_at = NULL
            WHERE id = $3
            ",
        )
        .bind(MessageStatus::Pending)
        .bind(now_ms)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn delete(db: &mut SqliteConnection, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}
