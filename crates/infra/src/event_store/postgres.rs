//! Postgres-backed event store implementation.
//!
//! Persists events append-only with per-stream sequencing under a stream
//! head row lock, idempotent replay on `(stream_type, stream_id,
//! idempotency_key)`, SHA-256 hash chaining, and DLP follow-ups written in
//! the same transaction.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `EventStoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `SequenceContention` / idempotent replay | Concurrent append on the same stream head |
//! | Database (raise by trigger) | `P0001` append-only message | `AppendOnlyViolation` | UPDATE/DELETE reached `evt_events` |
//! | Database (check violation) | `23514` | `InvalidAppend` | Enum/check constraint rejected a value |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / network | N/A | `Storage` | Pool shut down, connection failures |
//!
//! ## Thread Safety
//!
//! `PostgresEventStore` is `Send + Sync` and can be shared across tasks.
//! All operations use the SQLx connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use warden_core::EventId;
use warden_events::data::{EventRedacted, SecretLeakDetected};
use warden_events::{
    chain, DlpScan, DlpScanner, EventData, EventSink, NewEvent, RedactionLevel, SinkError,
    StoredEvent, StreamType,
};

use super::r#trait::{AppendOutcome, EventStore, EventStoreError};

/// Postgres-backed append-only event store.
///
/// The append path takes the stream head row lock (`SELECT … FOR UPDATE`),
/// so sequence assignment is serialized per stream entirely database-side.
/// The `evt_events` table carries a trigger that rejects UPDATE/DELETE, so
/// append-only holds even against code that bypasses this type.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Append within the caller's transaction.
    ///
    /// The caller owns commit/rollback; the store only guarantees that the
    /// event, its follow-ups and the redaction log land atomically with
    /// whatever else the transaction does.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewEvent,
    ) -> Result<AppendOutcome, EventStoreError> {
        // Idempotent replay short-circuits before taking the head lock.
        if let Some(key) = &event.idempotency_key {
            if let Some(existing) =
                load_by_idempotency(tx, event.stream.stream_type, &event.stream.id, key).await?
            {
                return Ok(AppendOutcome {
                    event: existing,
                    deduplicated: true,
                    followups: Vec::new(),
                });
            }
        }

        let recorded_at = Utc::now();
        let scan = DlpScanner::shared().scan_value(&event.data);

        let stored = insert_event(tx, event, recorded_at, &scan).await?;

        let mut followups = Vec::new();
        if scan.contains_secrets {
            let redacted = EventData::EventRedacted(EventRedacted {
                target_event_id: stored.event_id,
                rule_ids: scan.rule_ids(),
            })
            .new_event(
                stored.workspace_id.clone(),
                stored.stream.clone(),
                stored.actor.clone(),
                stored.correlation_id.clone(),
            )
            .with_causation(stored.event_id);
            followups.push(insert_event(tx, redacted, recorded_at, &DlpScan::default()).await?);

            let leak = EventData::SecretLeakDetected(SecretLeakDetected {
                rule_ids: scan.rule_ids(),
                previews: scan.previews(),
                truncated: scan.truncated,
            })
            .new_event(
                stored.workspace_id.clone(),
                stored.stream.clone(),
                stored.actor.clone(),
                stored.correlation_id.clone(),
            )
            .with_causation(stored.event_id);
            followups.push(insert_event(tx, leak, recorded_at, &DlpScan::default()).await?);

            sqlx::query(
                r#"
                INSERT INTO evt_redaction_log (event_id, rule_ids, masked_previews)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(stored.event_id.as_uuid())
            .bind(scan.rule_ids())
            .bind(scan.previews())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_redaction_log", e))?;
        }

        Ok(AppendOutcome {
            event: stored,
            deduplicated: false,
            followups,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, event),
        fields(
            stream = %event.stream,
            event_type = %event.event_type,
        ),
        err
    )]
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome, EventStoreError> {
        // One retry on unique violation: the head-lock path loses only when
        // another append slipped between our replay probe and the lock.
        let mut last_err: Option<EventStoreError> = None;
        for _ in 0..2 {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin", e))?;

            match self.append_in_tx(&mut tx, event.clone()).await {
                Ok(outcome) => {
                    tx.commit()
                        .await
                        .map_err(|e| map_sqlx_error("commit", e))?;
                    return Ok(outcome);
                }
                Err(err) => {
                    let _ = tx.rollback().await;
                    match &err {
                        EventStoreError::SequenceContention { .. }
                        | EventStoreError::IdempotencyConflict(_) => {
                            last_err = Some(err);
                            continue;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
        // A surviving idempotency conflict resolves to the stored row.
        if let Some(key) = &event.idempotency_key {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin", e))?;
            if let Some(existing) =
                load_by_idempotency(&mut tx, event.stream.stream_type, &event.stream.id, key)
                    .await?
            {
                let _ = tx.rollback().await;
                return Ok(AppendOutcome {
                    event: existing,
                    deduplicated: true,
                    followups: Vec::new(),
                });
            }
            let _ = tx.rollback().await;
        }
        Err(last_err.unwrap_or_else(|| {
            EventStoreError::Storage("append retry exhausted".to_string())
        }))
    }

    async fn read_stream(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE stream_type = $1 AND stream_id = $2 AND stream_seq >= $3 \
             ORDER BY stream_seq ASC LIMIT $4"
        ))
        .bind(stream_type.as_str())
        .bind(stream_id)
        .bind(from_seq.max(1) as i64)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_stream", e))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn read_feed(
        &self,
        after_global_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENT} WHERE global_seq > $1 ORDER BY global_seq ASC LIMIT $2"
        ))
        .bind(after_global_seq as i64)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_feed", e))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn get_by_id(
        &self,
        event_id: &EventId,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let row = sqlx::query(&format!("{SELECT_EVENT} WHERE event_id = $1 LIMIT 1"))
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_id", e))?;

        row.as_ref().map(event_from_row).transpose()
    }
}

#[async_trait]
impl EventSink for PostgresEventStore {
    async fn append(&self, event: NewEvent) -> Result<StoredEvent, SinkError> {
        EventStore::append(self, event)
            .await
            .map(|outcome| outcome.event)
            .map_err(|e| SinkError::Storage(e.to_string()))
    }
}

/// Allocate the next sequence for a stream under the head row lock.
async fn next_stream_seq(
    tx: &mut Transaction<'_, Postgres>,
    stream_type: StreamType,
    stream_id: &str,
) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT next_seq FROM evt_stream_heads
        WHERE stream_type = $1 AND stream_id = $2
        FOR UPDATE
        "#,
    )
    .bind(stream_type.as_str())
    .bind(stream_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_stream_head", e))?;

    let seq = match row {
        Some(row) => {
            let next: i64 = row
                .try_get("next_seq")
                .map_err(|e| EventStoreError::Storage(format!("read next_seq: {e}")))?;
            sqlx::query(
                "UPDATE evt_stream_heads SET next_seq = $3 WHERE stream_type = $1 AND stream_id = $2",
            )
            .bind(stream_type.as_str())
            .bind(stream_id)
            .bind(next + 1)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("bump_stream_head", e))?;
            next
        }
        None => {
            sqlx::query(
                "INSERT INTO evt_stream_heads (stream_type, stream_id, next_seq) VALUES ($1, $2, 2)",
            )
            .bind(stream_type.as_str())
            .bind(stream_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_unique_to_contention(stream_type, stream_id, "create_stream_head", e))?;
            1
        }
    };
    Ok(seq as u64)
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: NewEvent,
    recorded_at: DateTime<Utc>,
    scan: &DlpScan,
) -> Result<StoredEvent, EventStoreError> {
    let stream_type = event.stream.stream_type;
    let stream_id = event.stream.id.clone();

    let stream_seq = next_stream_seq(tx, stream_type, &stream_id).await?;

    // Previous event on the stream anchors the chain.
    let prev_event_hash: Option<String> = if stream_seq > 1 {
        let row = sqlx::query(
            r#"
            SELECT event_hash FROM evt_events
            WHERE stream_type = $1 AND stream_id = $2 AND stream_seq = $3
            "#,
        )
        .bind(stream_type.as_str())
        .bind(&stream_id)
        .bind((stream_seq - 1) as i64)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_prev_hash", e))?;
        Some(
            row.try_get("event_hash")
                .map_err(|e| EventStoreError::Storage(format!("read event_hash: {e}")))?,
        )
    } else {
        None
    };

    let mut stored = StoredEvent::from_new(event, stream_seq, 0, recorded_at);
    if scan.contains_secrets {
        stored.contains_secrets = true;
        stored.redaction_level = RedactionLevel::Partial;
    }
    if scan.truncated {
        if let serde_json::Value::Object(map) = &mut stored.policy_context {
            map.insert("dlp_truncated".to_string(), serde_json::Value::Bool(true));
        } else {
            stored.policy_context = serde_json::json!({"dlp_truncated": true});
        }
    }
    stored.prev_event_hash = prev_event_hash;
    stored.event_hash = chain::event_hash_of(&stored);

    let row = sqlx::query(
        r#"
        INSERT INTO evt_events (
            event_id, event_type, event_version, occurred_at, recorded_at,
            workspace_id, scope, actor_type, actor_id, actor_principal_id,
            zone, stream_type, stream_id, stream_seq, correlation_id,
            causation_id, redaction_level, contains_secrets, policy_context,
            model_context, display, data, idempotency_key, prev_event_hash,
            event_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
        RETURNING global_seq
        "#,
    )
    .bind(stored.event_id.as_uuid())
    .bind(&stored.event_type)
    .bind(stored.event_version as i32)
    .bind(stored.occurred_at)
    .bind(stored.recorded_at)
    .bind(stored.workspace_id.as_str())
    .bind(serde_json::to_value(&stored.scope).unwrap_or(serde_json::Value::Null))
    .bind(stored.actor.actor_type.as_str())
    .bind(&stored.actor.id)
    .bind(stored.actor_principal_id.as_ref().map(|p| p.as_str()))
    .bind(stored.zone.as_str())
    .bind(stream_type.as_str())
    .bind(&stream_id)
    .bind(stored.stream_seq as i64)
    .bind(stored.correlation_id.as_str())
    .bind(stored.causation_id.as_ref().map(|c| c.as_uuid()))
    .bind(stored.redaction_level.as_str())
    .bind(stored.contains_secrets)
    .bind(&stored.policy_context)
    .bind(&stored.model_context)
    .bind(&stored.display)
    .bind(&stored.data)
    .bind(stored.idempotency_key.as_deref())
    .bind(stored.prev_event_hash.as_deref())
    .bind(&stored.event_hash)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_insert_error(stream_type, &stream_id, e))?;

    let global_seq: i64 = row
        .try_get("global_seq")
        .map_err(|e| EventStoreError::Storage(format!("read global_seq: {e}")))?;
    stored.global_seq = global_seq as u64;

    Ok(stored)
}

async fn load_by_idempotency(
    tx: &mut Transaction<'_, Postgres>,
    stream_type: StreamType,
    stream_id: &str,
    idempotency_key: &str,
) -> Result<Option<StoredEvent>, EventStoreError> {
    let row = sqlx::query(&format!(
        "{SELECT_EVENT} WHERE stream_type = $1 AND stream_id = $2 AND idempotency_key = $3"
    ))
    .bind(stream_type.as_str())
    .bind(stream_id)
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_by_idempotency", e))?;

    row.as_ref().map(event_from_row).transpose()
}

const SELECT_EVENT: &str = r#"
    SELECT event_id, event_type, event_version, occurred_at, recorded_at,
           workspace_id, scope, actor_type, actor_id, actor_principal_id,
           zone, stream_type, stream_id, stream_seq, global_seq,
           correlation_id, causation_id, redaction_level, contains_secrets,
           policy_context, model_context, display, data, idempotency_key,
           prev_event_hash, event_hash
    FROM evt_events
"#;

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let read = |e: sqlx::Error| EventStoreError::Storage(format!("decode event row: {e}"));

    let stream_type: String = row.try_get("stream_type").map_err(read)?;
    let stream_type = match stream_type.as_str() {
        "room" => StreamType::Room,
        "thread" => StreamType::Thread,
        "workspace" => StreamType::Workspace,
        other => {
            return Err(EventStoreError::Storage(format!(
                "unknown stream_type '{other}'"
            )))
        }
    };

    let parse_str = |field: &'static str| -> Result<String, EventStoreError> {
        row.try_get::<String, _>(field).map_err(read)
    };

    let actor_type: String = parse_str("actor_type")?;
    let actor = warden_core::Actor {
        actor_type: serde_json::from_value(serde_json::Value::String(actor_type))
            .map_err(|e| EventStoreError::Storage(format!("decode actor_type: {e}")))?,
        id: parse_str("actor_id")?,
    };

    let zone: String = parse_str("zone")?;
    let redaction: String = parse_str("redaction_level")?;
    let event_id: Uuid = row.try_get("event_id").map_err(read)?;
    let causation_id: Option<Uuid> = row.try_get("causation_id").map_err(read)?;

    Ok(StoredEvent {
        event_id: EventId::from_uuid(event_id),
        event_type: parse_str("event_type")?,
        event_version: row.try_get::<i32, _>("event_version").map_err(read)? as u32,
        occurred_at: row.try_get("occurred_at").map_err(read)?,
        recorded_at: row.try_get("recorded_at").map_err(read)?,
        workspace_id: parse_str("workspace_id")?
            .parse()
            .map_err(|e| EventStoreError::Storage(format!("decode workspace_id: {e}")))?,
        scope: serde_json::from_value(
            row.try_get::<serde_json::Value, _>("scope").map_err(read)?,
        )
        .unwrap_or_default(),
        actor,
        actor_principal_id: row
            .try_get::<Option<String>, _>("actor_principal_id")
            .map_err(read)?
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| EventStoreError::Storage(format!("decode principal: {e}")))?,
        zone: serde_json::from_value(serde_json::Value::String(zone))
            .map_err(|e| EventStoreError::Storage(format!("decode zone: {e}")))?,
        stream: warden_events::StreamRef {
            stream_type,
            id: parse_str("stream_id")?,
        },
        stream_seq: row.try_get::<i64, _>("stream_seq").map_err(read)? as u64,
        global_seq: row.try_get::<i64, _>("global_seq").map_err(read)? as u64,
        correlation_id: parse_str("correlation_id")?.into(),
        causation_id: causation_id.map(EventId::from_uuid),
        redaction_level: serde_json::from_value(serde_json::Value::String(redaction))
            .map_err(|e| EventStoreError::Storage(format!("decode redaction_level: {e}")))?,
        contains_secrets: row.try_get("contains_secrets").map_err(read)?,
        policy_context: row.try_get("policy_context").map_err(read)?,
        model_context: row.try_get("model_context").map_err(read)?,
        display: row.try_get("display").map_err(read)?,
        data: row.try_get("data").map_err(read)?,
        idempotency_key: row.try_get("idempotency_key").map_err(read)?,
        prev_event_hash: row.try_get("prev_event_hash").map_err(read)?,
        event_hash: parse_str("event_hash")?,
    })
}

fn map_insert_error(
    stream_type: StreamType,
    stream_id: &str,
    err: sqlx::Error,
) -> EventStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            let msg = db_err.message();
            if msg.contains("idempotency") {
                return EventStoreError::IdempotencyConflict(msg.to_string());
            }
            return EventStoreError::SequenceContention {
                stream: format!("{}/{}", stream_type.as_str(), stream_id),
                detail: msg.to_string(),
            };
        }
    }
    map_sqlx_error("insert_event", err)
}

fn map_unique_to_contention(
    stream_type: StreamType,
    stream_id: &str,
    operation: &str,
    err: sqlx::Error,
) -> EventStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return EventStoreError::SequenceContention {
                stream: format!("{}/{}", stream_type.as_str(), stream_id),
                detail: db_err.message().to_string(),
            };
        }
    }
    map_sqlx_error(operation, err)
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if db_err.message().contains("append-only") {
                return EventStoreError::AppendOnlyViolation(msg);
            }
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::SequenceContention {
                    stream: operation.to_string(),
                    detail: msg,
                },
                Some("23514") | Some("23503") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            EventStoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
