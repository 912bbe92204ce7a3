use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

pub const OPEN_RETRY_ATTEMPTS: u32 = 10;
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("queue item {id} not found")]
    NotFound { id: i64 },
    #[error("invalid state transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: &'static str,
        to: &'static str,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        StoreError::Sql { source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Queued,
    Forwarding,
    Sent,
    Failed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Queued => "queued",
            ItemState::Forwarding => "forwarding",
            ItemState::Sent => "sent",
            ItemState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<ItemState> {
        match value {
            "queued" => Some(ItemState::Queued),
            "forwarding" => Some(ItemState::Forwarding),
            "sent" => Some(ItemState::Sent),
            "failed" => Some(ItemState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Sent | ItemState::Failed)
    }

    /// Transition DAG. The direct `queued -> sent|failed` edges carry the
    /// inline parallel-mode sends; `forwarding -> forwarding` is the
    /// file-path refresh after the claim.
    fn can_transition_to(self, next: ItemState) -> bool {
        match self {
            ItemState::Queued => matches!(
                next,
                ItemState::Forwarding | ItemState::Sent | ItemState::Failed
            ),
            ItemState::Forwarding => matches!(
                next,
                ItemState::Forwarding | ItemState::Sent | ItemState::Queued | ItemState::Failed
            ),
            ItemState::Sent | ItemState::Failed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiStatus {
    Pending,
    Delivered,
    Failed,
    Timeout,
}

impl AiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::Pending => "pending",
            AiStatus::Delivered => "delivered",
            AiStatus::Failed => "failed",
            AiStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<AiStatus> {
        match value {
            "pending" => Some(AiStatus::Pending),
            "delivered" => Some(AiStatus::Delivered),
            "failed" => Some(AiStatus::Failed),
            "timeout" => Some(AiStatus::Timeout),
            _ => None,
        }
    }
}

/// One received object and its delivery lifecycle. Timestamps are epoch
/// milliseconds UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub study_uid: String,
    pub sop_uid: String,
    pub file_path: PathBuf,
    pub state: ItemState,
    pub retries: u32,
    pub last_error: Option<String>,
    pub worker_host: Option<String>,
    pub worker_ae: Option<String>,
    pub worker_sent_at: Option<i64>,
    pub result_received_at: Option<i64>,
    pub ai_status: Option<AiStatus>,
    pub pacs_sent_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub original_sop_uid: String,
    pub worker_host: Option<String>,
    pub worker_ae: Option<String>,
    pub duration_ms: i64,
}

/// Durable queue store. Every mutation is committed before the call returns;
/// records are never destroyed, terminal rows remain for audit.
#[derive(Debug)]
pub struct QueueStore {
    conn: Mutex<Connection>,
}

const ITEM_COLUMNS: &str = "id, study_uid, sop_uid, file_path, state, retries, last_error, \
     worker_host, worker_ae, worker_sent_at, result_received_at, ai_status, pacs_sent_at, \
     created_at, updated_at";

impl QueueStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_uid TEXT NOT NULL,
                sop_uid TEXT NOT NULL,
                file_path TEXT NOT NULL,
                state TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                worker_host TEXT,
                worker_ae TEXT,
                worker_sent_at INTEGER,
                result_received_at INTEGER,
                ai_status TEXT,
                pacs_sent_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_items_state_created
                ON queue_items(state, created_at);
            CREATE INDEX IF NOT EXISTS idx_queue_items_study
                ON queue_items(study_uid);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bounded-retry open for startup, where the store volume may not be
    /// ready yet.
    pub fn open_with_retry(
        path: &Path,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, StoreError> {
        let mut last_error = None;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                thread::sleep(delay);
            }
            match Self::open(path) {
                Ok(store) => return Ok(store),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.expect("at least one open attempt"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, study_uid: &str, sop_uid: &str, path: &Path) -> Result<i64, StoreError> {
        let now = now_millis();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO queue_items
                 (study_uid, sop_uid, file_path, state, retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?4)",
            params![study_uid, sop_uid, path.display().to_string(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim the oldest queued record: select by `(created_at,
    /// id)`, transition to `forwarding`. Exactly one claimant wins a record;
    /// losers see a different record or nothing.
    pub fn get_next_queued(&self) -> Result<Option<QueueItem>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let item = tx
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM queue_items
                     WHERE state = 'queued'
                     ORDER BY created_at, id LIMIT 1"
                ),
                [],
                row_to_item,
            )
            .optional()?;
        let Some(mut item) = item else {
            return Ok(None);
        };

        let now = now_millis();
        let changed = tx.execute(
            "UPDATE queue_items SET state = 'forwarding', updated_at = ?1
             WHERE id = ?2 AND state = 'queued'",
            params![now, item.id],
        )?;
        tx.commit()?;
        if changed != 1 {
            return Ok(None);
        }
        item.state = ItemState::Forwarding;
        item.updated_at = now;
        Ok(Some(item))
    }

    pub fn update_state(
        &self,
        id: i64,
        state: ItemState,
        file_path: Option<&Path>,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM queue_items WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::NotFound { id })?;
        let from = ItemState::parse(&current).ok_or(StoreError::Sql {
            source: rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("invalid state `{current}` in store").into(),
            ),
        })?;
        if !from.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                id,
                from: from.as_str(),
                to: state.as_str(),
            });
        }

        tx.execute(
            "UPDATE queue_items
             SET state = ?1,
                 file_path = COALESCE(?2, file_path),
                 last_error = COALESCE(?3, last_error),
                 updated_at = ?4
             WHERE id = ?5",
            params![
                state.as_str(),
                file_path.map(|p| p.display().to_string()),
                last_error,
                now_millis(),
                id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Bumps the retry counter and remembers the error; state is untouched.
    /// Returns the new counter value.
    pub fn increment_retry(&self, id: i64, error: &str) -> Result<u32, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE queue_items
             SET retries = retries + 1, last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, now_millis(), id],
        )?;
        if changed != 1 {
            return Err(StoreError::NotFound { id });
        }
        let retries: u32 = tx.query_row(
            "SELECT retries FROM queue_items WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(retries)
    }

    pub fn mark_worker_sent(&self, id: i64, host: &str, ae: &str) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE queue_items
             SET worker_host = ?1, worker_ae = ?2, worker_sent_at = ?3,
                 ai_status = 'pending', updated_at = ?3
             WHERE id = ?4",
            params![host, ae, now_millis(), id],
        )?;
        if changed != 1 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    pub fn mark_pacs_sent(&self, id: i64) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE queue_items SET pacs_sent_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now_millis(), id],
        )?;
        if changed != 1 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    pub fn mark_ai_status(
        &self,
        id: i64,
        status: AiStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE queue_items
             SET ai_status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error, now_millis(), id],
        )?;
        if changed != 1 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    /// Correlate an inbound result object with the oldest pending worker send
    /// for the study. Two concurrent results for one study each win a
    /// different pending record; with none left the result is unmatched.
    pub fn mark_result_received(
        &self,
        study_uid: &str,
        _result_sop_uid: &str,
    ) -> Result<Option<Correlation>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row: Option<(i64, String, Option<String>, Option<String>, Option<i64>)> = tx
            .query_row(
                "SELECT id, sop_uid, worker_host, worker_ae, worker_sent_at
                 FROM queue_items
                 WHERE study_uid = ?1
                   AND ai_status = 'pending'
                   AND result_received_at IS NULL
                 ORDER BY worker_sent_at, id LIMIT 1",
                params![study_uid],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, original_sop_uid, worker_host, worker_ae, worker_sent_at)) = row else {
            return Ok(None);
        };

        let now = now_millis();
        let changed = tx.execute(
            "UPDATE queue_items
             SET result_received_at = ?1, ai_status = 'delivered', updated_at = ?1
             WHERE id = ?2 AND ai_status = 'pending' AND result_received_at IS NULL",
            params![now, id],
        )?;
        tx.commit()?;
        if changed != 1 {
            return Ok(None);
        }
        Ok(Some(Correlation {
            original_sop_uid,
            worker_host,
            worker_ae,
            duration_ms: now - worker_sent_at.unwrap_or(now),
        }))
    }

    pub fn get_item(&self, id: i64) -> Result<Option<QueueItem>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1"),
                params![id],
                row_to_item,
            )
            .optional()?)
    }

    pub fn get_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let conn = self.conn();
        let mut statement =
            conn.prepare("SELECT state, COUNT(*) FROM queue_items GROUP BY state")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            counts.insert(state, count);
        }
        Ok(counts)
    }

    pub fn get_study_rows(&self, study_uid: &str) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.conn();
        let mut statement = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE study_uid = ?1 ORDER BY created_at, id"
        ))?;
        let rows = statement.query_map(params![study_uid], row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let state: String = row.get(4)?;
    let state = ItemState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("invalid state `{state}` in store").into(),
        )
    })?;
    let ai_status: Option<String> = row.get(11)?;
    let ai_status = match ai_status {
        None => None,
        Some(value) => Some(AiStatus::parse(&value).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                11,
                rusqlite::types::Type::Text,
                format!("invalid ai status `{value}` in store").into(),
            )
        })?),
    };
    Ok(QueueItem {
        id: row.get(0)?,
        study_uid: row.get(1)?,
        sop_uid: row.get(2)?,
        file_path: PathBuf::from(row.get::<_, String>(3)?),
        state,
        retries: row.get(5)?,
        last_error: row.get(6)?,
        worker_host: row.get(7)?,
        worker_ae: row.get(8)?,
        worker_sent_at: row.get(9)?,
        result_received_at: row.get(10)?,
        ai_status,
        pacs_sent_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn open_store(dir: &Path) -> QueueStore {
        QueueStore::open(&dir.join("state/edge.db")).expect("open store")
    }

    #[test]
    fn enqueue_creates_a_queued_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let id = store
            .enqueue("1.2.3", "1.2.3.4", Path::new("/data/incoming/1.2.3/1.2.3.4.dcm"))
            .expect("enqueue");

        let item = store.get_item(id).expect("get").expect("item");
        assert_eq!(item.state, ItemState::Queued);
        assert_eq!(item.retries, 0);
        assert_eq!(item.study_uid, "1.2.3");
        assert_eq!(item.sop_uid, "1.2.3.4");
        assert_eq!(item.ai_status, None);
        assert!(item.created_at > 0);
        assert_eq!(item.created_at, item.updated_at);
    }

    #[test]
    fn claim_is_fifo_by_creation_and_transitions_to_forwarding() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let first = store.enqueue("1.2.3", "1.2.3.1", Path::new("/a")).expect("enqueue");
        let second = store.enqueue("1.2.3", "1.2.3.2", Path::new("/b")).expect("enqueue");

        let claimed = store.get_next_queued().expect("claim").expect("item");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.state, ItemState::Forwarding);

        let claimed = store.get_next_queued().expect("claim").expect("item");
        assert_eq!(claimed.id, second);
        assert!(store.get_next_queued().expect("claim").is_none());
    }

    #[test]
    fn concurrent_claims_never_share_a_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(open_store(tmp.path()));
        for i in 0..20 {
            store
                .enqueue("9.9", &format!("9.9.{i}"), Path::new("/x"))
                .expect("enqueue");
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(item) = store.get_next_queued().expect("claim") {
                    claimed.push(item.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().expect("join") {
                assert!(seen.insert(id), "item {id} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 20);
    }

    #[test]
    fn transition_guard_enforces_the_lifecycle_dag() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let id = store.enqueue("1.2.3", "1.2.3.4", Path::new("/a")).expect("enqueue");

        // queued -> queued is not a transition
        let err = store
            .update_state(id, ItemState::Queued, None, None)
            .expect_err("self loop");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.get_next_queued().expect("claim").expect("item");
        // forwarding -> forwarding refreshes the file path
        store
            .update_state(id, ItemState::Forwarding, Some(Path::new("/queued/a")), None)
            .expect("path refresh");
        store
            .update_state(id, ItemState::Sent, Some(Path::new("/sent/a")), None)
            .expect("sent");

        let err = store
            .update_state(id, ItemState::Queued, None, None)
            .expect_err("terminal");
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: "sent", to: "queued", .. }
        ));
        let item = store.get_item(id).expect("get").expect("item");
        assert_eq!(item.state, ItemState::Sent);
        assert_eq!(item.file_path, PathBuf::from("/sent/a"));
    }

    #[test]
    fn direct_queued_to_terminal_edges_serve_the_inline_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let sent = store.enqueue("1.2.3", "1.2.3.1", Path::new("/a")).expect("enqueue");
        let failed = store.enqueue("1.2.3", "1.2.3.2", Path::new("/b")).expect("enqueue");

        store
            .update_state(sent, ItemState::Sent, None, None)
            .expect("inline sent");
        store
            .update_state(failed, ItemState::Failed, None, Some("association_refused"))
            .expect("inline failed");

        let item = store.get_item(failed).expect("get").expect("item");
        assert_eq!(item.state, ItemState::Failed);
        assert_eq!(item.last_error.as_deref(), Some("association_refused"));
    }

    #[test]
    fn update_state_on_unknown_id_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let err = store
            .update_state(42, ItemState::Sent, None, None)
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound { id: 42 }));
    }

    #[test]
    fn increment_retry_counts_without_touching_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let id = store.enqueue("1.2.3", "1.2.3.4", Path::new("/a")).expect("enqueue");

        assert_eq!(store.increment_retry(id, "timeout").expect("retry"), 1);
        assert_eq!(store.increment_retry(id, "association_refused").expect("retry"), 2);

        let item = store.get_item(id).expect("get").expect("item");
        assert_eq!(item.state, ItemState::Queued);
        assert_eq!(item.retries, 2);
        assert_eq!(item.last_error.as_deref(), Some("association_refused"));
    }

    #[test]
    fn worker_send_stamps_pending_status() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let id = store.enqueue("1.2.3", "1.2.3.4", Path::new("/a")).expect("enqueue");
        store.mark_worker_sent(id, "worker1", "WORKER").expect("mark");

        let item = store.get_item(id).expect("get").expect("item");
        assert_eq!(item.worker_host.as_deref(), Some("worker1"));
        assert_eq!(item.worker_ae.as_deref(), Some("WORKER"));
        assert_eq!(item.ai_status, Some(AiStatus::Pending));
        assert!(item.worker_sent_at.is_some());
        assert!(item.result_received_at.is_none());
    }

    #[test]
    fn correlation_returns_worker_and_nonnegative_latency() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let id = store.enqueue("1.2.3", "1.2.3.4", Path::new("/a")).expect("enqueue");
        store.mark_worker_sent(id, "worker1", "WORKER").expect("mark");

        let correlation = store
            .mark_result_received("1.2.3", "1.2.3.99")
            .expect("correlate")
            .expect("match");
        assert_eq!(correlation.original_sop_uid, "1.2.3.4");
        assert_eq!(correlation.worker_host.as_deref(), Some("worker1"));
        assert!(correlation.duration_ms >= 0);

        let item = store.get_item(id).expect("get").expect("item");
        assert_eq!(item.ai_status, Some(AiStatus::Delivered));
        assert!(item.result_received_at.is_some());
    }

    #[test]
    fn each_result_consumes_one_pending_record_oldest_first() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let older = store.enqueue("1.2.3", "1.2.3.1", Path::new("/a")).expect("enqueue");
        let newer = store.enqueue("1.2.3", "1.2.3.2", Path::new("/b")).expect("enqueue");
        store.mark_worker_sent(older, "w1", "WORKER").expect("mark");
        std::thread::sleep(Duration::from_millis(5));
        store.mark_worker_sent(newer, "w2", "WORKER").expect("mark");

        let first = store
            .mark_result_received("1.2.3", "1.2.3.90")
            .expect("correlate")
            .expect("match");
        assert_eq!(first.original_sop_uid, "1.2.3.1");

        let second = store
            .mark_result_received("1.2.3", "1.2.3.91")
            .expect("correlate")
            .expect("match");
        assert_eq!(second.original_sop_uid, "1.2.3.2");

        // more results than pending originals: the surplus is unmatched
        assert!(store
            .mark_result_received("1.2.3", "1.2.3.92")
            .expect("correlate")
            .is_none());
    }

    #[test]
    fn results_for_other_studies_never_match() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let id = store.enqueue("1.2.3", "1.2.3.4", Path::new("/a")).expect("enqueue");
        store.mark_worker_sent(id, "w1", "WORKER").expect("mark");

        assert!(store
            .mark_result_received("7.7.7", "7.7.7.1")
            .expect("correlate")
            .is_none());
    }

    #[test]
    fn counts_and_study_rows_reflect_the_queue() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let a = store.enqueue("1.2.3", "1.2.3.1", Path::new("/a")).expect("enqueue");
        store.enqueue("1.2.3", "1.2.3.2", Path::new("/b")).expect("enqueue");
        store.enqueue("4.5.6", "4.5.6.1", Path::new("/c")).expect("enqueue");
        store.update_state(a, ItemState::Sent, None, None).expect("sent");

        let counts = store.get_counts().expect("counts");
        assert_eq!(counts.get("queued"), Some(&2));
        assert_eq!(counts.get("sent"), Some(&1));
        assert_eq!(counts.get("failed"), None);

        let rows = store.get_study_rows("1.2.3").expect("rows");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.study_uid == "1.2.3"));
        assert!(store.get_study_rows("8.8.8").expect("rows").is_empty());
    }

    #[test]
    fn open_with_retry_gives_up_after_bounded_attempts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, b"file").expect("write blocker");
        let target = blocker.join("nested/edge.db");

        let err = QueueStore::open_with_retry(&target, 2, Duration::from_millis(10))
            .expect_err("cannot open under a file");
        assert!(matches!(err, StoreError::CreateParent { .. } | StoreError::Open { .. }));
    }
}
