use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{ContentStore, FunnelStore, Store, StoreError, StoreResult, SubmissionStore};
use crate::content::{Collection, ContentDocument, NewContent};
use crate::funnel::{FunnelKind, FunnelRecord, FunnelUpdate};
use crate::submission::{
    family_regex, sequenced_authid, NewSubmission, Submission, SubmissionKind,
    MAX_SEQUENCE_ATTEMPTS,
};
use crate::time::TimeSource;

#[derive(Default)]
struct Collections {
    funnels: HashMap<(FunnelKind, String), FunnelRecord>,
    submissions: Vec<Submission>,
    content: Vec<ContentDocument>,
}

/// In-process store. Every operation runs under one lock, so multi-step writes such as
/// authid sequencing and activation are atomic.
pub struct MemoryStore {
    collections: Mutex<Collections>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl MemoryStore {
    pub fn new(timesource: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self {
            collections: Mutex::new(Collections::default()),
            timesource,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn newest_first(records: &mut [FunnelRecord]) {
    records.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.user_session_id.cmp(&b.user_session_id))
    });
}

#[async_trait]
impl FunnelStore for MemoryStore {
    async fn upsert_funnel(
        &self,
        kind: FunnelKind,
        update: FunnelUpdate,
    ) -> StoreResult<FunnelRecord> {
        let now = self.timesource.now();
        let mut collections = self.lock();

        let key = (kind, update.user_session_id.clone());
        let record = match collections.funnels.get_mut(&key) {
            Some(record) => {
                record.apply(update, now);
                record.clone()
            }
            None => {
                let record = FunnelRecord::new(kind, update, now);
                collections.funnels.insert(key, record.clone());
                record
            }
        };

        Ok(record)
    }

    async fn get_funnel(
        &self,
        kind: FunnelKind,
        session_id: &str,
    ) -> StoreResult<Option<FunnelRecord>> {
        Ok(self
            .lock()
            .funnels
            .get(&(kind, session_id.to_owned()))
            .cloned())
    }

    async fn list_funnels(
        &self,
        kind: FunnelKind,
        states: &[i32],
    ) -> StoreResult<Vec<FunnelRecord>> {
        let mut records: Vec<FunnelRecord> = self
            .lock()
            .funnels
            .values()
            .filter(|record| record.kind == kind && in_states(record, states))
            .cloned()
            .collect();
        newest_first(&mut records);

        Ok(records)
    }

    async fn delete_funnel(
        &self,
        kind: FunnelKind,
        session_id: &str,
    ) -> StoreResult<Option<FunnelRecord>> {
        Ok(self
            .lock()
            .funnels
            .remove(&(kind, session_id.to_owned())))
    }

    async fn count_funnels(
        &self,
        kind: FunnelKind,
        states: &[i32],
        seen: bool,
    ) -> StoreResult<u64> {
        let count = self
            .lock()
            .funnels
            .values()
            .filter(|record| record.kind == kind && record.seen == seen && in_states(record, states))
            .count();

        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn mark_funnels_seen(
        &self,
        kind: FunnelKind,
        states: &[i32],
        seen: bool,
    ) -> StoreResult<u64> {
        let now = self.timesource.now();
        let mut matched: u64 = 0;

        for record in self.lock().funnels.values_mut() {
            if record.kind == kind && in_states(record, states) {
                record.seen = seen;
                record.updated_at = now;
                matched += 1;
            }
        }

        Ok(matched)
    }

    async fn set_funnel_seen(
        &self,
        kind: FunnelKind,
        session_id: &str,
        seen: bool,
    ) -> StoreResult<Option<FunnelRecord>> {
        let now = self.timesource.now();
        let mut collections = self.lock();

        Ok(collections
            .funnels
            .get_mut(&(kind, session_id.to_owned()))
            .map(|record| {
                record.seen = seen;
                record.updated_at = now;
                record.clone()
            }))
    }
}

fn in_states(record: &FunnelRecord, states: &[i32]) -> bool {
    record.state.is_some_and(|state| states.contains(&state))
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert_submission(&self, submission: NewSubmission) -> StoreResult<Submission> {
        let base = submission.base_authid().to_owned();
        let family = family_regex(&base).map_err(|e| StoreError::InvalidRow(e.to_string()))?;
        let now = self.timesource.now();
        let mut collections = self.lock();

        let existing = collections
            .submissions
            .iter()
            .filter(|s| s.kind == submission.kind && family.is_match(&s.authid))
            .count();
        let existing = u64::try_from(existing).unwrap_or(u64::MAX);

        for sequence in existing..existing.saturating_add(MAX_SEQUENCE_ATTEMPTS) {
            let authid = sequenced_authid(&submission.authid, &base, sequence);
            let taken = collections
                .submissions
                .iter()
                .any(|s| s.kind == submission.kind && s.authid == authid);

            if taken {
                metrics::counter!("intake_submission_sequence_retries_total").increment(1);
                continue;
            }

            let stored = Submission {
                kind: submission.kind,
                authid,
                base_authid: base,
                answers: submission.answers,
                created_at: now,
            };
            collections.submissions.push(stored.clone());
            return Ok(stored);
        }

        Err(StoreError::SequenceExhausted(base))
    }

    async fn list_submissions(
        &self,
        kind: SubmissionKind,
        base_authid: &str,
    ) -> StoreResult<Vec<Submission>> {
        Ok(self
            .lock()
            .submissions
            .iter()
            .filter(|s| s.kind == kind && s.base_authid == base_authid)
            .cloned()
            .collect())
    }

    async fn get_submission(
        &self,
        kind: SubmissionKind,
        authid: &str,
    ) -> StoreResult<Option<Submission>> {
        Ok(self
            .lock()
            .submissions
            .iter()
            .find(|s| s.kind == kind && s.authid == authid)
            .cloned())
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn create_content(
        &self,
        collection: &Collection,
        content: NewContent,
    ) -> StoreResult<ContentDocument> {
        let now = self.timesource.now();
        let mut collections = self.lock();

        if content.is_active {
            deactivate_all(&mut collections.content, collection, now);
        }

        let document = ContentDocument {
            id: Uuid::now_v7(),
            collection: collection.to_string(),
            body: content.body,
            is_active: content.is_active,
            created_at: now,
            updated_at: now,
        };
        collections.content.push(document.clone());

        Ok(document)
    }

    async fn list_content(&self, collection: &Collection) -> StoreResult<Vec<ContentDocument>> {
        Ok(self
            .lock()
            .content
            .iter()
            .filter(|d| d.collection == collection.as_str())
            .cloned()
            .collect())
    }

    async fn get_active_content(
        &self,
        collection: &Collection,
    ) -> StoreResult<Option<ContentDocument>> {
        Ok(self
            .lock()
            .content
            .iter()
            .find(|d| d.collection == collection.as_str() && d.is_active)
            .cloned())
    }

    async fn update_content_body(
        &self,
        collection: &Collection,
        id: Uuid,
        body: Value,
    ) -> StoreResult<Option<ContentDocument>> {
        let now = self.timesource.now();
        let mut collections = self.lock();

        Ok(find_document(&mut collections.content, collection, id).map(|document| {
            document.body = body;
            document.updated_at = now;
            document.clone()
        }))
    }

    async fn activate_content(
        &self,
        collection: &Collection,
        id: Uuid,
    ) -> StoreResult<Option<ContentDocument>> {
        let now = self.timesource.now();
        let mut collections = self.lock();

        if find_document(&mut collections.content, collection, id).is_none() {
            return Ok(None);
        }

        deactivate_all(&mut collections.content, collection, now);

        Ok(find_document(&mut collections.content, collection, id).map(|document| {
            document.is_active = true;
            document.updated_at = now;
            document.clone()
        }))
    }

    async fn delete_content(
        &self,
        collection: &Collection,
        id: Uuid,
    ) -> StoreResult<Option<ContentDocument>> {
        let mut collections = self.lock();

        let position = collections
            .content
            .iter()
            .position(|d| d.collection == collection.as_str() && d.id == id);

        Ok(position.map(|index| collections.content.remove(index)))
    }

    async fn list_active_content(&self) -> StoreResult<Vec<ContentDocument>> {
        let mut active: Vec<ContentDocument> = self
            .lock()
            .content
            .iter()
            .filter(|d| d.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.collection.cmp(&b.collection));

        Ok(active)
    }
}

fn find_document<'a>(
    documents: &'a mut [ContentDocument],
    collection: &Collection,
    id: Uuid,
) -> Option<&'a mut ContentDocument> {
    documents
        .iter_mut()
        .find(|d| d.collection == collection.as_str() && d.id == id)
}

fn deactivate_all(
    documents: &mut [ContentDocument],
    collection: &Collection,
    now: chrono::DateTime<chrono::Utc>,
) {
    for document in documents
        .iter_mut()
        .filter(|d| d.collection == collection.as_str() && d.is_active)
    {
        document.is_active = false;
        document.updated_at = now;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
