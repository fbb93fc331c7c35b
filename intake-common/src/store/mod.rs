//! Persistence for funnel records, questionnaire submissions and content documents.
//!
//! [`PgStore`] is the production backend. [`MemoryStore`] keeps everything in process and is
//! used for local development and tests; both honour the same contracts.
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::content::{Collection, ContentDocument, NewContent};
use crate::funnel::{FunnelKind, FunnelRecord, FunnelUpdate};
use crate::submission::{NewSubmission, Submission, SubmissionKind};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
    #[error("failed to apply migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("could not allocate a unique authid for {0}")]
    SequenceExhausted(String),
    #[error("stored row is invalid: {0}")]
    InvalidRow(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait FunnelStore: Send + Sync {
    /// Insert or update the record for `update.user_session_id`, returning the stored record.
    async fn upsert_funnel(&self, kind: FunnelKind, update: FunnelUpdate)
        -> StoreResult<FunnelRecord>;

    async fn get_funnel(&self, kind: FunnelKind, session_id: &str)
        -> StoreResult<Option<FunnelRecord>>;

    /// Records whose state is in `states`, most recent activity first.
    async fn list_funnels(&self, kind: FunnelKind, states: &[i32])
        -> StoreResult<Vec<FunnelRecord>>;

    async fn delete_funnel(&self, kind: FunnelKind, session_id: &str)
        -> StoreResult<Option<FunnelRecord>>;

    async fn count_funnels(&self, kind: FunnelKind, states: &[i32], seen: bool)
        -> StoreResult<u64>;

    /// Set `seen` on every record whose state is in `states`, returning how many matched.
    async fn mark_funnels_seen(&self, kind: FunnelKind, states: &[i32], seen: bool)
        -> StoreResult<u64>;

    async fn set_funnel_seen(&self, kind: FunnelKind, session_id: &str, seen: bool)
        -> StoreResult<Option<FunnelRecord>>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Store a submission under the next free authid of its family.
    async fn insert_submission(&self, submission: NewSubmission) -> StoreResult<Submission>;

    /// Every submission of the family of `base_authid`, oldest first.
    async fn list_submissions(&self, kind: SubmissionKind, base_authid: &str)
        -> StoreResult<Vec<Submission>>;

    async fn get_submission(&self, kind: SubmissionKind, authid: &str)
        -> StoreResult<Option<Submission>>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Create a document. An active document takes over from the collection's current one.
    async fn create_content(&self, collection: &Collection, content: NewContent)
        -> StoreResult<ContentDocument>;

    async fn list_content(&self, collection: &Collection) -> StoreResult<Vec<ContentDocument>>;

    async fn get_active_content(&self, collection: &Collection)
        -> StoreResult<Option<ContentDocument>>;

    async fn update_content_body(&self, collection: &Collection, id: Uuid, body: Value)
        -> StoreResult<Option<ContentDocument>>;

    /// Make `id` the only active document of its collection.
    async fn activate_content(&self, collection: &Collection, id: Uuid)
        -> StoreResult<Option<ContentDocument>>;

    async fn delete_content(&self, collection: &Collection, id: Uuid)
        -> StoreResult<Option<ContentDocument>>;

    /// The active document of every collection that has one, ordered by collection.
    async fn list_active_content(&self) -> StoreResult<Vec<ContentDocument>>;
}

#[async_trait]
pub trait Store: FunnelStore + SubmissionStore + ContentStore {
    /// Check the backend can serve queries.
    async fn ping(&self) -> StoreResult<()>;
}
