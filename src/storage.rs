use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::progress::{ActivityEntry, ProgressSnapshot};

/// Storage collaborator. Per-learner snapshot atomicity only; no
/// multi-document guarantees.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(
        &self,
        learner_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, EngineError>;

    async fn put_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), EngineError>;

    async fn append_activity(
        &self,
        learner_id: Uuid,
        entry: &ActivityEntry,
    ) -> Result<(), EngineError>;

    async fn list_snapshots(&self) -> Result<Vec<ProgressSnapshot>, EngineError>;
}

/// In-memory store used by tests and replay.
pub struct MemoryStore {
    snapshots: RwLock<HashMap<Uuid, ProgressSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get_snapshot(
        &self,
        learner_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, EngineError> {
        Ok(self.snapshots.read().await.get(&learner_id).cloned())
    }

    async fn put_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), EngineError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.learner_id, snapshot.clone());
        Ok(())
    }

    async fn append_activity(
        &self,
        _learner_id: Uuid,
        _entry: &ActivityEntry,
    ) -> Result<(), EngineError> {
        // The snapshot already carries the bounded recent-activity list.
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<ProgressSnapshot>, EngineError> {
        Ok(self.snapshots.read().await.values().cloned().collect())
    }
}

/// Postgres store: one JSONB snapshot row per learner plus an append-only
/// activity log.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
        let learner_id = Uuid::parse_str("6b1f7a90-5c2e-4b53-9c56-1f27a20a6e01")?;
        let mut snapshot = ProgressSnapshot::new(learner_id, Utc::now());
        snapshot.subjects.insert(
            "mathematics".to_string(),
            crate::progress::SubjectProgress {
                progress: 40,
                modules_completed: 1,
                total_modules: 3,
                time_spent_secs: 1_800,
                average_score: 0,
                last_accessed: Utc::now(),
            },
        );
        snapshot.subjects.insert(
            "science".to_string(),
            crate::progress::SubjectProgress {
                progress: 60,
                modules_completed: 2,
                total_modules: 3,
                time_spent_secs: 2_400,
                average_score: 85,
                last_accessed: Utc::now(),
            },
        );
        snapshot.recompute_overall();

        let store = PgStore::new(pool.clone());
        store.put_snapshot(&snapshot).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn get_snapshot(
        &self,
        learner_id: Uuid,
    ) -> Result<Option<ProgressSnapshot>, EngineError> {
        let row = sqlx::query(
            "SELECT snapshot FROM engage.learner_snapshots WHERE learner_id = $1",
        )
        .bind(learner_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("snapshot");
                let snapshot: ProgressSnapshot = serde_json::from_value(value)
                    .map_err(|e| EngineError::Persistence(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn put_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), EngineError> {
        let value = serde_json::to_value(snapshot)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO engage.learner_snapshots (learner_id, snapshot, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (learner_id) DO UPDATE
            SET snapshot = EXCLUDED.snapshot, updated_at = NOW()
            "#,
        )
        .bind(snapshot.learner_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_activity(
        &self,
        learner_id: Uuid,
        entry: &ActivityEntry,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO engage.activity_log
            (id, learner_id, subject, kind, score, duration_secs, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(learner_id)
        .bind(&entry.subject)
        .bind(entry.kind.as_str())
        .bind(entry.score.map(|s| s as i32))
        .bind(entry.duration_secs as i64)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<ProgressSnapshot>, EngineError> {
        let rows = sqlx::query("SELECT snapshot FROM engage.learner_snapshots")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.get("snapshot");
            let snapshot: ProgressSnapshot = serde_json::from_value(value)
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }
}
