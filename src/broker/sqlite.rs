//! Durable broker backed by SQLite.
//!
//! Every operation runs in its own transaction. The pool holds a single connection: SQLite
//! allows one writer at a time, and funnelling all work through one connection keeps
//! receive claims serialized without lock upgrade failures.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    clock::{Clock, SystemClock},
    db::{message::Message, queue::Queue},
    error::Error,
    message::{
        md5_of_body, DeadLetter, Delivery, MessageAttributes, MessageId, ReceiptHandle,
        SendReceipt,
    },
    queue::{QueuePolicy, QueueStatistics},
    utils::{delta, from_millis, to_millis},
};

use super::{check_body, receive_limit, Broker};

#[derive(Clone)]
pub struct SqliteBroker {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteBroker {
    /// Opens (creating if missing) the database at `path`, or a private in-memory database
    /// when `path` is `None`, and applies the schema migrations.
    pub async fn open(path: Option<&str>, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let opts = if let Some(path) = path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // The in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = path.unwrap_or(":memory:"), "Opened SQLite broker");

        Ok(Self { db: pool, clock })
    }

    pub async fn in_memory() -> Result<Self, Error> {
        Self::open(None, Arc::new(SystemClock)).await
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    fn now_ms(&self) -> i64 {
        to_millis(self.clock.now())
    }

    async fn dead_letter_exhausted(
        db: &mut sqlx::SqliteConnection,
        queue: &Queue,
        now_ms: i64,
    ) -> Result<(), Error> {
        let dead =
            Message::dead_letter_exhausted(db, queue.id, now_ms, queue.policy().max_receive_count)
                .await?;

        for message_id in &dead {
            tracing::warn!(queue = %queue.name, %message_id, "Moving message to dead-letter queue");
        }

        Ok(())
    }

    async fn to_dead_letter(
        db: &mut sqlx::SqliteConnection,
        row: Message,
    ) -> Result<DeadLetter, Error> {
        let attributes = Message::attributes(db, row.id).await?;
        let receive_count = row.receive_count();

        Ok(DeadLetter {
            message_id: MessageId::from(row.message_id),
            body: Bytes::from(row.body),
            attributes,
            receive_count,
            sent_at: from_millis(row.sent_at),
            dead_lettered_at: from_millis(row.dead_lettered_at.unwrap_or(row.sent_at)),
        })
    }
}

impl Broker for SqliteBroker {
    fn create_queue<'a>(
        &'a self,
        name: &'a str,
        policy: QueuePolicy,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            policy.check_limits()?;

            let mut tx = self.db.begin().await?;
            Queue::upsert(&mut tx, name, &policy).await?;
            tx.commit().await?;
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

            let now = self.now_ms();
            let message_id = MessageId::generate();
            let md5_of_body = md5_of_body(&body);

            let mut tx = self.db.begin().await?;
            let queue = Queue::get(&mut tx, queue).await?;

            Message::insert(
                &mut tx,
                queue.id,
                message_id.as_str(),
                &body,
                &md5_of_body,
                now,
                &attributes,
            )
            .await?;

            tx.commit().await?;

            Ok(SendReceipt {
                message_id,
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
            let now_ms = to_millis(now);

            let mut tx = self.db.begin().await?;
            let queue_row = Queue::get(&mut tx, queue).await?;
            let policy = queue_row.policy();

            Message::expire(
                &mut tx,
                queue_row.id,
                to_millis(now - delta(policy.retention)),
                to_millis(now - delta(policy.dead_letter_retention)),
            )
            .await?;

            Self::dead_letter_exhausted(&mut tx, &queue_row, now_ms).await?;

            let visible_until = to_millis(now + delta(policy.visibility_timeout));
            let ids = Message::visible(&mut tx, queue_row.id, now_ms, limit).await?;

            let mut deliveries = Vec::with_capacity(ids.len());
            for id in ids {
                let receipt = ReceiptHandle::generate()?;
                let row = Message::claim(&mut tx, id, &receipt, visible_until).await?;
                let attributes = Message::attributes(&mut tx, row.id).await?;
                let approximate_receive_count = row.receive_count();

                deliveries.push(Delivery {
                    message_id: MessageId::from(row.message_id),
                    receipt_handle: receipt,
                    body: Bytes::from(row.body),
                    attributes,
                    md5_of_body: row.md5_of_body,
                    approximate_receive_count,
                    sent_at: from_millis(row.sent_at),
                });
            }

            tx.commit().await?;

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
            let mut tx = self.db.begin().await?;
            let queue = Queue::get(&mut tx, queue).await?;
            let id = Message::find_in_flight(&mut tx, queue.id, receipt).await?;
            Message::delete(&mut tx, id).await?;
            tx.commit().await?;
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
            let now = self.now_ms();
            let mut tx = self.db.begin().await?;
            let queue = Queue::get(&mut tx, queue).await?;
            let id = Message::find_in_flight(&mut tx, queue.id, receipt).await?;
            Message::set_visible_at(&mut tx, id, now).await?;
            tx.commit().await?;
            Ok(())
        }
        .boxed()
    }

    fn dead_letters<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Vec<DeadLetter>, Error>> {
        async move {
            let now = self.clock.now();
            let mut tx = self.db.begin().await?;
            let queue_row = Queue::get(&mut tx, queue).await?;
            let policy = queue_row.policy();

            Message::expire(
                &mut tx,
                queue_row.id,
                to_millis(now - delta(policy.retention)),
                to_millis(now - delta(policy.dead_letter_retention)),
            )
            .await?;

            Self::dead_letter_exhausted(&mut tx, &queue_row, to_millis(now)).await?;

            let rows = Message::list_dead(&mut tx, queue_row.id).await?;
            let mut dead = Vec::with_capacity(rows.len());
            for row in rows {
                dead.push(Self::to_dead_letter(&mut tx, row).await?);
            }

            tx.commit().await?;
            Ok(dead)
        }
        .boxed()
    }

    fn redrive<'a>(&'a self, queue: &'a str, id: &'a MessageId) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let now = self.now_ms();
            let mut tx = self.db.begin().await?;
            let queue_row = Queue::get(&mut tx, queue).await?;
            let row_id = Message::find_dead(&mut tx, queue_row.id, id.as_str())
                .await?
                .ok_or_else(|| Error::dead_letter_not_found(queue, id.as_str()))?;
            Message::redrive(&mut tx, row_id, now).await?;
            tx.commit().await?;
            Ok(())
        }
        .boxed()
    }

    fn discard<'a>(&'a self, queue: &'a str, id: &'a MessageId) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut tx = self.db.begin().await?;
            let queue_row = Queue::get(&mut tx, queue).await?;
            let row_id = Message::find_dead(&mut tx, queue_row.id, id.as_str())
                .await?
                .ok_or_else(|| Error::dead_letter_not_found(queue, id.as_str()))?;
            Message::delete(&mut tx, row_id).await?;
            tx.commit().await?;
            Ok(())
        }
        .boxed()
    }

    fn expire(&self) -> BoxFuture<'_, Result<u64, Error>> {
        async move {
            let now = self.clock.now();
            let mut tx = self.db.begin().await?;

            let mut discarded = 0;
            for queue in Queue::list(&mut tx).await? {
                let policy = queue.policy();
                discarded += Message::expire(
                    &mut tx,
                    queue.id,
                    to_millis(now - delta(policy.retention)),
                    to_millis(now - delta(policy.dead_letter_retention)),
                )
                .await?;
            }

            tx.commit().await?;
            Ok(discarded)
        }
        .boxed()
    }

    fn statistics(&self) -> BoxFuture<'_, Result<Vec<QueueStatistics>, Error>> {
        async move {
            let now = self.now_ms();
            let mut tx = self.db.begin().await?;

            for queue in Queue::list(&mut tx).await? {
                Self::dead_letter_exhausted(&mut tx, &queue, now).await?;
            }

            let stats = Queue::statistics(&mut tx, now).await?;
            tx.commit().await?;
            Ok(stats)
        }
        .boxed()
    }
}
