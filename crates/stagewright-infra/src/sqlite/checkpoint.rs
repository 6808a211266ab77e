//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `stagewright-core`. Every fact (a
//! completed stage, a completed batch, an identifier) is one row inserted with
//! `ON CONFLICT DO NOTHING`, so writes are append-only and atomic per row and
//! the first recorded value wins. Results and artifact references are stored
//! as JSON blobs.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::Row;
use stagewright_core::store::{CheckpointError, CheckpointStore, RunStatusUpdate};
use stagewright_types::artifact::Artifact;
use stagewright_types::checkpoint::CheckpointRecord;
use stagewright_types::error::RepositoryError;
use stagewright_types::run::{Escalation, ReviewDecision, RunReport, RunStatus, StepResult};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    definition_id: String,
    status: String,
    escalation: Option<String>,
    decision: Option<String>,
    report: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition_id: row.try_get("definition_id")?,
            status: row.try_get("status")?,
            escalation: row.try_get("escalation")?,
            decision: row.try_get("decision")?,
            report: row.try_get("report")?,
        })
    }

    fn apply(self, record: &mut CheckpointRecord) -> Result<(), CheckpointError> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|e: String| CheckpointError::Serialization(e))?;
        let decision = self
            .decision
            .as_deref()
            .map(|d| d.parse::<ReviewDecision>())
            .transpose()
            .map_err(CheckpointError::Serialization)?;
        let mut escalation: Option<Escalation> = self
            .escalation
            .as_deref()
            .map(|s| from_json(s, "escalation"))
            .transpose()?;
        if let Some(escalation) = escalation.as_mut() {
            escalation.decision = decision.or(escalation.decision);
        }

        record.definition_id = Some(self.definition_id);
        record.status = Some(status);
        record.escalation = escalation;
        record.report = self
            .report
            .as_deref()
            .map(|s| from_json::<RunReport>(s, "run report"))
            .transpose()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Repository(RepositoryError::Query(e.to_string()).to_string())
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, CheckpointError> {
    serde_json::to_string(value)
        .map_err(|e| CheckpointError::Serialization(format!("serialize {what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, CheckpointError> {
    serde_json::from_str(s)
        .map_err(|e| CheckpointError::Serialization(format!("invalid {what} JSON: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, run_id: Uuid) -> Result<CheckpointRecord, CheckpointError> {
        let id = run_id.to_string();
        let mut record = CheckpointRecord::empty(run_id);

        let run = sqlx::query(
            "SELECT definition_id, status, escalation, decision, report FROM checkpoint_runs WHERE run_id = ?",
        )
        .bind(&id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        if let Some(row) = run {
            RunRow::from_row(&row).map_err(query_err)?.apply(&mut record)?;
        }

        let stages = sqlx::query(
            "SELECT stage_id, result FROM checkpoint_stages WHERE run_id = ? ORDER BY seq ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        for row in &stages {
            let stage_id: String = row.try_get("stage_id").map_err(query_err)?;
            let result: String = row.try_get("result").map_err(query_err)?;
            let result: StepResult = from_json(&result, "stage result")?;
            record.completed_stages.push(stage_id.clone());
            record.stage_results.insert(stage_id, result);
        }

        let batches = sqlx::query(
            "SELECT stage_id, batch_index, artifact FROM checkpoint_batches WHERE run_id = ? ORDER BY stage_id, batch_index",
        )
        .bind(&id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        for row in &batches {
            let stage_id: String = row.try_get("stage_id").map_err(query_err)?;
            let batch_index: i64 = row.try_get("batch_index").map_err(query_err)?;
            let artifact: String = row.try_get("artifact").map_err(query_err)?;
            let artifact: Artifact = from_json(&artifact, "batch artifact")?;
            record
                .completed_batches
                .entry(stage_id)
                .or_insert_with(BTreeMap::new)
                .insert(batch_index as usize, artifact);
        }

        let identifiers = sqlx::query("SELECT key, value FROM checkpoint_identifiers WHERE run_id = ?")
            .bind(&id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        for row in &identifiers {
            let key: String = row.try_get("key").map_err(query_err)?;
            let value: String = row.try_get("value").map_err(query_err)?;
            record.identifiers.insert(key, value);
        }

        Ok(record)
    }

    async fn record_stage_complete(
        &self,
        run_id: Uuid,
        result: &StepResult,
    ) -> Result<(), CheckpointError> {
        let json = to_json(result, "stage result")?;
        let inserted = sqlx::query(
            r#"INSERT INTO checkpoint_stages (run_id, stage_id, result, completed_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(run_id, stage_id) DO NOTHING"#,
        )
        .bind(run_id.to_string())
        .bind(&result.step_id)
        .bind(&json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::debug!(
            %run_id,
            stage_id = result.step_id.as_str(),
            inserted = inserted.rows_affected() > 0,
            "stage checkpoint written"
        );
        Ok(())
    }

    async fn record_batch_complete(
        &self,
        run_id: Uuid,
        stage_id: &str,
        batch_index: usize,
        artifact: &Artifact,
    ) -> Result<(), CheckpointError> {
        let json = to_json(artifact, "batch artifact")?;
        sqlx::query(
            r#"INSERT INTO checkpoint_batches (run_id, stage_id, batch_index, artifact, completed_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id, stage_id, batch_index) DO NOTHING"#,
        )
        .bind(run_id.to_string())
        .bind(stage_id)
        .bind(batch_index as i64)
        .bind(&json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::debug!(%run_id, stage_id, batch = batch_index, "batch checkpoint written");
        Ok(())
    }

    async fn record_identifier(
        &self,
        run_id: Uuid,
        key: &str,
        value: &str,
    ) -> Result<String, CheckpointError> {
        sqlx::query(
            r#"INSERT INTO checkpoint_identifiers (run_id, key, value)
               VALUES (?, ?, ?)
               ON CONFLICT(run_id, key) DO NOTHING"#,
        )
        .bind(run_id.to_string())
        .bind(key)
        .bind(value)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        // Read back through the writer so the value is the committed winner.
        let (stored,): (String,) =
            sqlx::query_as("SELECT value FROM checkpoint_identifiers WHERE run_id = ? AND key = ?")
                .bind(run_id.to_string())
                .bind(key)
                .fetch_one(&self.pool.writer)
                .await
                .map_err(query_err)?;
        Ok(stored)
    }

    async fn record_run_status(&self, update: RunStatusUpdate<'_>) -> Result<(), CheckpointError> {
        let escalation = update
            .escalation
            .map(|e| to_json(e, "escalation"))
            .transpose()?;
        let decision = update
            .escalation
            .and_then(|e| e.decision)
            .map(|d| d.as_str());
        let report = update.report.map(|r| to_json(r, "run report")).transpose()?;
        let now = format_datetime(&Utc::now());

        // A decision recorded while escalated survives re-writing the escalation.
        sqlx::query(
            r#"INSERT INTO checkpoint_runs
               (run_id, definition_id, status, escalation, decision, report, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 escalation = excluded.escalation,
                 decision = CASE
                   WHEN excluded.status = 'escalated' AND excluded.escalation IS NOT NULL
                     THEN COALESCE(excluded.decision, checkpoint_runs.decision)
                   ELSE NULL
                 END,
                 report = excluded.report,
                 updated_at = excluded.updated_at"#,
        )
        .bind(update.run_id.to_string())
        .bind(update.definition_id)
        .bind(update.status.as_str())
        .bind(&escalation)
        .bind(decision)
        .bind(&report)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::debug!(run_id = %update.run_id, status = %update.status, "run status written");
        Ok(())
    }

    async fn record_decision(
        &self,
        run_id: Uuid,
        decision: ReviewDecision,
    ) -> Result<(), CheckpointError> {
        let result = sqlx::query(
            r#"UPDATE checkpoint_runs SET decision = ?, updated_at = ?
               WHERE run_id = ? AND status = 'escalated' AND escalation IS NOT NULL AND decision IS NULL"#,
        )
        .bind(decision.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM checkpoint_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        match exists {
            Some(_) => Err(CheckpointError::NotEscalated(run_id)),
            None => Err(CheckpointError::RunNotFound(run_id)),
        }
    }

    async fn live_artifacts(&self) -> Result<BTreeSet<Uuid>, CheckpointError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT run_id FROM checkpoint_stages
               UNION SELECT run_id FROM checkpoint_batches
               UNION SELECT run_id FROM checkpoint_runs WHERE escalation IS NOT NULL
               EXCEPT SELECT run_id FROM checkpoint_runs WHERE status = ?"#,
        )
        .bind(RunStatus::Completed.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut live = BTreeSet::new();
        for (run_id,) in rows {
            let run_id = run_id
                .parse::<Uuid>()
                .map_err(|e| CheckpointError::Serialization(format!("invalid run id: {e}")))?;
            live.extend(self.load(run_id).await?.referenced_artifacts());
        }
        Ok(live)
    }

    async fn reset_stage(&self, run_id: Uuid, stage_id: &str) -> Result<(), CheckpointError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        sqlx::query("DELETE FROM checkpoint_stages WHERE run_id = ? AND stage_id = ?")
            .bind(run_id.to_string())
            .bind(stage_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        sqlx::query("DELETE FROM checkpoint_batches WHERE run_id = ? AND stage_id = ?")
            .bind(run_id.to_string())
            .bind(stage_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        tracing::debug!(%run_id, stage_id, "stage checkpoint reset");
        Ok(())
    }
}
