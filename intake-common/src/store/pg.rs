use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use super::{ContentStore, FunnelStore, Store, StoreError, StoreResult, SubmissionStore};
use crate::content::{Collection, ContentDocument, NewContent};
use crate::funnel::{FirstSegment, FunnelKind, FunnelRecord, FunnelUpdate};
use crate::submission::{
    family_pattern, sequenced_authid, NewSubmission, Submission, SubmissionKind,
    MAX_SEQUENCE_ATTEMPTS,
};

const FUNNEL_COLUMNS: &str = "kind, user_session_id, first_segment, last_segment_reached, state, seen, timestamp, created_at, updated_at";
const SUBMISSION_COLUMNS: &str = "kind, authid, base_authid, answers, created_at";
const CONTENT_COLUMNS: &str = "id, collection, body, is_active, created_at, updated_at";

/// A store backed by PostgreSQL tables created by the migrations in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(StoreError::ConnectionError)?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;

        Ok(())
    }
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(e) => e.is_unique_violation(),
        _ => false,
    }
}

#[derive(sqlx::FromRow)]
struct FunnelRow {
    kind: String,
    user_session_id: String,
    first_segment: Option<Json<FirstSegment>>,
    last_segment_reached: Option<i32>,
    state: Option<i32>,
    seen: bool,
    timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FunnelRow> for FunnelRecord {
    type Error = StoreError;

    fn try_from(row: FunnelRow) -> Result<Self, Self::Error> {
        Ok(FunnelRecord {
            kind: row
                .kind
                .parse()
                .map_err(|e: crate::funnel::ParseFunnelKindError| StoreError::InvalidRow(e.to_string()))?,
            user_session_id: row.user_session_id,
            first_segment: row.first_segment.map(|Json(segment)| segment),
            last_segment_reached: row.last_segment_reached,
            state: row.state,
            seen: row.seen,
            timestamp: row.timestamp,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn funnel_records(rows: Vec<FunnelRow>) -> StoreResult<Vec<FunnelRecord>> {
    rows.into_iter().map(FunnelRecord::try_from).collect()
}

#[async_trait]
impl FunnelStore for PgStore {
    async fn upsert_funnel(
        &self,
        kind: FunnelKind,
        update: FunnelUpdate,
    ) -> StoreResult<FunnelRecord> {
        // Absent fields arrive as NULL and keep the stored value.
        let query = format!(
            r#"
INSERT INTO funnel_records
    (kind, user_session_id, first_segment, last_segment_reached, state, timestamp)
VALUES
    ($1, $2, $3, $4, $5, $6)
ON CONFLICT (kind, user_session_id) DO UPDATE SET
    first_segment = COALESCE(EXCLUDED.first_segment, funnel_records.first_segment),
    last_segment_reached = COALESCE(EXCLUDED.last_segment_reached, funnel_records.last_segment_reached),
    state = COALESCE(EXCLUDED.state, funnel_records.state),
    timestamp = EXCLUDED.timestamp,
    updated_at = NOW()
RETURNING {FUNNEL_COLUMNS}
            "#
        );

        let row: FunnelRow = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(&update.user_session_id)
            .bind(update.first_segment.map(Json))
            .bind(update.last_segment_reached)
            .bind(update.state)
            .bind(update.timestamp)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        row.try_into()
    }

    async fn get_funnel(
        &self,
        kind: FunnelKind,
        session_id: &str,
    ) -> StoreResult<Option<FunnelRecord>> {
        let query = format!(
            "SELECT {FUNNEL_COLUMNS} FROM funnel_records WHERE kind = $1 AND user_session_id = $2"
        );

        let row: Option<FunnelRow> = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        row.map(FunnelRecord::try_from).transpose()
    }

    async fn list_funnels(
        &self,
        kind: FunnelKind,
        states: &[i32],
    ) -> StoreResult<Vec<FunnelRecord>> {
        let query = format!(
            r#"
SELECT {FUNNEL_COLUMNS}
FROM funnel_records
WHERE kind = $1 AND state = ANY($2)
ORDER BY timestamp DESC, user_session_id
            "#
        );

        let rows: Vec<FunnelRow> = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(states.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        funnel_records(rows)
    }

    async fn delete_funnel(
        &self,
        kind: FunnelKind,
        session_id: &str,
    ) -> StoreResult<Option<FunnelRecord>> {
        let query = format!(
            "DELETE FROM funnel_records WHERE kind = $1 AND user_session_id = $2 RETURNING {FUNNEL_COLUMNS}"
        );

        let row: Option<FunnelRow> = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        row.map(FunnelRecord::try_from).transpose()
    }

    async fn count_funnels(
        &self,
        kind: FunnelKind,
        states: &[i32],
        seen: bool,
    ) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM funnel_records WHERE kind = $1 AND state = ANY($2) AND seen = $3",
        )
        .bind(kind.as_str())
        .bind(states.to_vec())
        .bind(seen)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn mark_funnels_seen(
        &self,
        kind: FunnelKind,
        states: &[i32],
        seen: bool,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE funnel_records SET seen = $3, updated_at = NOW() WHERE kind = $1 AND state = ANY($2)",
        )
        .bind(kind.as_str())
        .bind(states.to_vec())
        .bind(seen)
        .execute(&self.pool)
        .await
        .map_err(query_error("UPDATE"))?;

        Ok(result.rows_affected())
    }

    async fn set_funnel_seen(
        &self,
        kind: FunnelKind,
        session_id: &str,
        seen: bool,
    ) -> StoreResult<Option<FunnelRecord>> {
        let query = format!(
            r#"
UPDATE funnel_records
SET seen = $3, updated_at = NOW()
WHERE kind = $1 AND user_session_id = $2
RETURNING {FUNNEL_COLUMNS}
            "#
        );

        let row: Option<FunnelRow> = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(session_id)
            .bind(seen)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("UPDATE"))?;

        row.map(FunnelRecord::try_from).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    kind: String,
    authid: String,
    base_authid: String,
    answers: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = StoreError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        Ok(Submission {
            kind: row.kind.parse().map_err(
                |e: crate::submission::ParseSubmissionKindError| {
                    StoreError::InvalidRow(e.to_string())
                },
            )?,
            authid: row.authid,
            base_authid: row.base_authid,
            answers: row.answers.0,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn insert_submission(&self, submission: NewSubmission) -> StoreResult<Submission> {
        let base = submission.base_authid().to_owned();

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM submissions WHERE kind = $1 AND base_authid = $2 AND authid ~ $3",
        )
        .bind(submission.kind.as_str())
        .bind(&base)
        .bind(family_pattern(&base))
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;
        let existing = u64::try_from(existing).unwrap_or(0);

        let query = format!(
            r#"
INSERT INTO submissions
    (kind, authid, base_authid, answers)
VALUES
    ($1, $2, $3, $4)
RETURNING {SUBMISSION_COLUMNS}
            "#
        );
        let answers = Json(submission.answers);

        // Count-then-insert races with concurrent submissions of the same family; the unique
        // index rejects the loser, which moves on to the next sequence number.
        for sequence in existing..existing.saturating_add(MAX_SEQUENCE_ATTEMPTS) {
            let authid = sequenced_authid(&submission.authid, &base, sequence);

            let inserted: Result<SubmissionRow, sqlx::Error> = sqlx::query_as(&query)
                .bind(submission.kind.as_str())
                .bind(&authid)
                .bind(&base)
                .bind(&answers)
                .fetch_one(&self.pool)
                .await;

            match inserted {
                Ok(row) => return row.try_into(),
                Err(error) if is_unique_violation(&error) => {
                    tracing::debug!(%authid, "authid already taken, trying next sequence number");
                    metrics::counter!("intake_submission_sequence_retries_total").increment(1);
                }
                Err(error) => return Err(query_error("INSERT")(error)),
            }
        }

        Err(StoreError::SequenceExhausted(base))
    }

    async fn list_submissions(
        &self,
        kind: SubmissionKind,
        base_authid: &str,
    ) -> StoreResult<Vec<Submission>> {
        let query = format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE kind = $1 AND base_authid = $2 ORDER BY id"
        );

        let rows: Vec<SubmissionRow> = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(base_authid)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        rows.into_iter().map(Submission::try_from).collect()
    }

    async fn get_submission(
        &self,
        kind: SubmissionKind,
        authid: &str,
    ) -> StoreResult<Option<Submission>> {
        let query =
            format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE kind = $1 AND authid = $2");

        let row: Option<SubmissionRow> = sqlx::query_as(&query)
            .bind(kind.as_str())
            .bind(authid)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        row.map(Submission::try_from).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct ContentRow {
    id: Uuid,
    collection: String,
    body: Json<Value>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ContentRow> for ContentDocument {
    fn from(row: ContentRow) -> Self {
        ContentDocument {
            id: row.id,
            collection: row.collection,
            body: row.body.0,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// A concurrent activation in the same collection trips the partial unique index.
fn activation_error(command: &str, collection: &Collection) -> impl FnOnce(sqlx::Error) -> StoreError {
    let command = command.to_owned();
    let collection = collection.to_string();
    move |error| {
        if is_unique_violation(&error) {
            StoreError::Conflict(format!(
                "another document in {collection} was activated concurrently"
            ))
        } else {
            StoreError::QueryError { command, error }
        }
    }
}

#[async_trait]
impl ContentStore for PgStore {
    async fn create_content(
        &self,
        collection: &Collection,
        content: NewContent,
    ) -> StoreResult<ContentDocument> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        if content.is_active {
            sqlx::query(
                "UPDATE content_documents SET is_active = FALSE, updated_at = NOW() WHERE collection = $1 AND is_active",
            )
            .bind(collection.as_str())
            .execute(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;
        }

        let query = format!(
            r#"
INSERT INTO content_documents
    (id, collection, body, is_active)
VALUES
    ($1, $2, $3, $4)
RETURNING {CONTENT_COLUMNS}
            "#
        );

        let row: ContentRow = sqlx::query_as(&query)
            .bind(Uuid::now_v7())
            .bind(collection.as_str())
            .bind(Json(content.body))
            .bind(content.is_active)
            .fetch_one(&mut *tx)
            .await
            .map_err(activation_error("INSERT", collection))?;

        tx.commit()
            .await
            .map_err(activation_error("COMMIT", collection))?;

        Ok(row.into())
    }

    async fn list_content(&self, collection: &Collection) -> StoreResult<Vec<ContentDocument>> {
        let query = format!(
            "SELECT {CONTENT_COLUMNS} FROM content_documents WHERE collection = $1 ORDER BY created_at, id"
        );

        let rows: Vec<ContentRow> = sqlx::query_as(&query)
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(ContentDocument::from).collect())
    }

    async fn get_active_content(
        &self,
        collection: &Collection,
    ) -> StoreResult<Option<ContentDocument>> {
        let query = format!(
            "SELECT {CONTENT_COLUMNS} FROM content_documents WHERE collection = $1 AND is_active"
        );

        let row: Option<ContentRow> = sqlx::query_as(&query)
            .bind(collection.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(row.map(ContentDocument::from))
    }

    async fn update_content_body(
        &self,
        collection: &Collection,
        id: Uuid,
        body: Value,
    ) -> StoreResult<Option<ContentDocument>> {
        let query = format!(
            r#"
UPDATE content_documents
SET body = $3, updated_at = NOW()
WHERE collection = $1 AND id = $2
RETURNING {CONTENT_COLUMNS}
            "#
        );

        let row: Option<ContentRow> = sqlx::query_as(&query)
            .bind(collection.as_str())
            .bind(id)
            .bind(Json(body))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("UPDATE"))?;

        Ok(row.map(ContentDocument::from))
    }

    async fn activate_content(
        &self,
        collection: &Collection,
        id: Uuid,
    ) -> StoreResult<Option<ContentDocument>> {
        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        let target: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM content_documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error("SELECT"))?;

        if target.is_none() {
            tx.rollback().await.map_err(query_error("ROLLBACK"))?;
            return Ok(None);
        }

        sqlx::query(
            "UPDATE content_documents SET is_active = FALSE, updated_at = NOW() WHERE collection = $1 AND is_active AND id <> $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(query_error("UPDATE"))?;

        let query = format!(
            "UPDATE content_documents SET is_active = TRUE, updated_at = NOW() WHERE id = $1 RETURNING {CONTENT_COLUMNS}"
        );
        let row: ContentRow = sqlx::query_as(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(activation_error("UPDATE", collection))?;

        tx.commit()
            .await
            .map_err(activation_error("COMMIT", collection))?;

        Ok(Some(row.into()))
    }

    async fn delete_content(
        &self,
        collection: &Collection,
        id: Uuid,
    ) -> StoreResult<Option<ContentDocument>> {
        let query = format!(
            "DELETE FROM content_documents WHERE collection = $1 AND id = $2 RETURNING {CONTENT_COLUMNS}"
        );

        let row: Option<ContentRow> = sqlx::query_as(&query)
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(row.map(ContentDocument::from))
    }

    async fn list_active_content(&self) -> StoreResult<Vec<ContentDocument>> {
        let query = format!(
            "SELECT {CONTENT_COLUMNS} FROM content_documents WHERE is_active ORDER BY collection"
        );

        let rows: Vec<ContentRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(ContentDocument::from).collect())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::FirstSegment;
    use serde_json::json;

    fn update(session: &str, segment: i32, state: Option<i32>) -> FunnelUpdate {
        FunnelUpdate {
            user_session_id: session.to_owned(),
            first_segment: Some(FirstSegment {
                email: Some("ada@example.com".to_owned()),
                ..Default::default()
            }),
            last_segment_reached: Some(segment),
            state,
            timestamp: Utc::now(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_upsert_keeps_one_row_per_session(db: PgPool) {
        let store = PgStore::new_from_pool(db);

        store
            .upsert_funnel(FunnelKind::WeightLoss, update("s1", 1, Some(0)))
            .await
            .unwrap();
        let mut second = update("s1", 4, None);
        second.first_segment = None;
        let record = store
            .upsert_funnel(FunnelKind::WeightLoss, second)
            .await
            .unwrap();

        assert_eq!(record.last_segment_reached, Some(4));
        assert_eq!(record.state, Some(0));
        assert_eq!(
            record.first_segment.and_then(|s| s.email).as_deref(),
            Some("ada@example.com")
        );
        assert_eq!(
            store
                .count_funnels(FunnelKind::WeightLoss, &[0, 1], false)
                .await
                .unwrap(),
            1
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_mark_seen_and_count(db: PgPool) {
        let store = PgStore::new_from_pool(db);

        for (session, state) in [("a", 0), ("b", 1), ("c", 2)] {
            store
                .upsert_funnel(FunnelKind::Ed, update(session, 1, Some(state)))
                .await
                .unwrap();
        }

        let matched = store
            .mark_funnels_seen(FunnelKind::Ed, &[0, 1], true)
            .await
            .unwrap();

        assert_eq!(matched, 2);
        assert_eq!(
            store
                .count_funnels(FunnelKind::Ed, &[0, 1], true)
                .await
                .unwrap(),
            matched
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_refill_authids_are_sequenced(db: PgPool) {
        let store = PgStore::new_from_pool(db);

        let mut authids = Vec::new();
        for _ in 0..3 {
            let submission =
                NewSubmission::new(SubmissionKind::Refill, "P100", Map::new()).unwrap();
            authids.push(store.insert_submission(submission).await.unwrap().authid);
        }

        assert_eq!(authids, vec!["P100", "P100-1", "P100-2"]);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires postgres"]
    async fn test_activation_leaves_one_active_document(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let faq: Collection = "faq".parse().unwrap();

        let first = store
            .create_content(
                &faq,
                NewContent {
                    body: json!({"v": 1}),
                    is_active: true,
                },
            )
            .await
            .unwrap();
        let second = store
            .create_content(
                &faq,
                NewContent {
                    body: json!({"v": 2}),
                    is_active: true,
                },
            )
            .await
            .unwrap();

        store.activate_content(&faq, first.id).await.unwrap();

        let active = store.get_active_content(&faq).await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
        assert_ne!(active.id, second.id);
        assert_eq!(store.list_active_content().await.unwrap().len(), 1);
    }
}
