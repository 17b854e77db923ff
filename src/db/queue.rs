use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::{
    error::Error,
    queue::{QueuePolicy, QueueStatistics},
};

#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    visibility_timeout_ms: i64,
    max_receive_count: i64,
    retention_ms: i64,
    dead_letter_retention_ms: i64,
    max_batch_size: i64,
    batch_window_ms: i64,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn duration(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

impl Queue {
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            visibility_timeout: duration(self.visibility_timeout_ms),
            max_receive_count: u32::try_from(self.max_receive_count).unwrap_or(u32::MAX),
            retention: duration(self.retention_ms),
            dead_letter_retention: duration(self.dead_letter_retention_ms),
            max_batch_size: usize::try_from(self.max_batch_size).unwrap_or(usize::MAX),
            batch_window: duration(self.batch_window_ms),
        }
    }

    pub async fn upsert(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
        policy: &QueuePolicy,
    ) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO queues (
                name,
                visibility_timeout_ms,
                max_receive_count,
                retention_ms,
                dead_letter_retention_ms,
                max_batch_size,
                batch_window_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                visibility_timeout_ms = excluded.visibility_timeout_ms,
                max_receive_count = excluded.max_receive_count,
                retention_ms = excluded.retention_ms,
                dead_letter_retention_ms = excluded.dead_letter_retention_ms,
                max_batch_size = excluded.max_batch_size,
                batch_window_ms = excluded.batch_window_ms
            ",
        )
        .bind(name.as_ref())
        .bind(millis(policy.visibility_timeout))
        .bind(i64::from(policy.max_receive_count))
        .bind(millis(policy.retention))
        .bind(millis(policy.dead_letter_retention))
        .bind(policy.max_batch_size as i64)
        .bind(millis(policy.batch_window))
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, name: impl AsRef<str>) -> Result<Queue, Error> {
        sqlx::query_as("SELECT * FROM queues WHERE name = $1")
            .bind(name.as_ref())
            .fetch_optional(db)
            .await?
            .ok_or_else(|| Error::queue_not_found(name.as_ref()))
    }

    pub async fn list(db: &mut SqliteConnection) -> Result<Vec<Queue>, Error> {
        let mut stream = sqlx::query_as("SELECT * FROM queues ORDER BY name").fetch(db);

        let mut queues = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            queues.push(res);
        }

        Ok(queues)
    }

    pub async fn statistics(
        db: &mut SqliteConnection,
        now_ms: i64,
    ) -> Result<Vec<QueueStatistics>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT
                q.name AS name,
                COALESCE(SUM(CASE WHEN m.status = 'pending' AND m.visible_at <= $1 THEN 1 ELSE 0 END), 0) AS visible,
                COALESCE(SUM(CASE WHEN m.status = 'pending' AND m.visible_at > $1 THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN m.status = 'dead' THEN 1 ELSE 0 END), 0) AS dead_lettered
            FROM queues q
            LEFT JOIN messages m ON m.queue = q.id
            GROUP BY q.id
            ORDER BY q.name
            ",
        )
        .bind(now_ms)
        .fetch_all(db)
        .await?)
    }
}
