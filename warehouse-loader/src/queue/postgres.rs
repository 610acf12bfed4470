use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{EventQueue, QueueError, QueuedMessage};

/// PG limits bind parameters per statement; 100 tokens per DELETE keeps us
/// far from it and matches typical provider delete-batch sizes.
const DELETE_CHUNK_SIZE: usize = 100;

/// How often to re-check for visible rows while long-polling.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    receipt_token: String,
    payload: String,
    enqueued_at: DateTime<Utc>,
}

/// A visibility-timeout queue on top of a PostgreSQL table.
///
/// Expected schema:
///   id              BIGSERIAL PRIMARY KEY
///   payload         TEXT NOT NULL
///   enqueued_at     TIMESTAMPTZ NOT NULL DEFAULT now()
///   visible_at      TIMESTAMPTZ NOT NULL DEFAULT now()
///   receipt_token   TEXT
///   delivery_count  INT NOT NULL DEFAULT 0
///
/// Receiving a message pushes `visible_at` into the future and rotates its
/// receipt token, which is how un-acked messages reappear for competing
/// consumers without any cross-process locking.
pub struct PgEventQueue {
    table: String,
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgEventQueue {
    pub async fn new(
        table: &str,
        url: &str,
        max_connections: u32,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self {
            table: table.to_owned(),
            pool,
            visibility_timeout,
        })
    }

    pub fn new_with_pool(table: &str, pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            table: table.to_owned(),
            pool,
            visibility_timeout,
        }
    }

    /// Enqueue a payload. The pipeline itself never calls this; it exists for
    /// producers sharing the table definition and for integration tests.
    pub async fn enqueue(&self, payload: &str) -> Result<(), QueueError> {
        let query = format!(
            r#"
INSERT INTO "{0}" (payload, enqueued_at, visible_at, delivery_count)
VALUES ($1, now(), now(), 0)
            "#,
            &self.table
        );

        sqlx::query(&query)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn receive_once(&self, max_messages: u32) -> Result<Vec<QueuedMessage>, QueueError> {
        let query = format!(
            r#"
WITH visible AS (
    SELECT
        id
    FROM
        "{0}"
    WHERE
        visible_at <= now()
    ORDER BY
        id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    "{0}"
SET
    visible_at = now() + ($2::bigint * interval '1 second'),
    receipt_token = gen_random_uuid()::text,
    delivery_count = "{0}".delivery_count + 1
FROM
    visible
WHERE
    "{0}".id = visible.id
RETURNING
    "{0}".id,
    "{0}".receipt_token,
    "{0}".payload,
    "{0}".enqueued_at
            "#,
            &self.table
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&query)
            .bind(max_messages as i64)
            .bind(self.visibility_timeout.as_secs() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(rows
            .into_iter()
            .map(|row| QueuedMessage {
                id: row.id.to_string(),
                receipt_token: row.receipt_token,
                payload: row.payload,
                enqueued_at: row.enqueued_at,
            })
            .collect())
    }
}

#[async_trait]
impl EventQueue for PgEventQueue {
    async fn receive(
        &self,
        max_messages: u32,
        max_wait: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let messages = self.receive_once(max_messages).await?;
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn delete(&self, receipt_tokens: &[String]) -> Result<(), QueueError> {
        // Conditional delete: the token rotates on redelivery, so rows whose
        // token no longer matches are left for their current owner.
        let query = format!(
            r#"DELETE FROM "{0}" WHERE receipt_token = ANY($1)"#,
            &self.table
        );

        for chunk in receipt_tokens.chunks(DELETE_CHUNK_SIZE) {
            sqlx::query(&query)
                .bind(chunk)
                .execute(&self.pool)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "DELETE".to_owned(),
                    error,
                })?;
        }

        Ok(())
    }
}
