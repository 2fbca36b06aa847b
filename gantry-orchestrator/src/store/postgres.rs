//! PostgreSQL run store.
//!
//! Runs keep their stage records, trigger, failure and artifact bindings
//! as JSONB columns of the run row; the definition snapshot is stored in
//! full so a run never depends on a later definition version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use gantry_core::domain::approval::{ApprovalDecision, Decision, GateId};
use gantry_core::domain::artifact::ArtifactRef;
use gantry_core::domain::definition::{PipelineDefinition, StageSpec, TriggerConfig};
use gantry_core::domain::run::{PipelineRun, RunFailure, StageRecord, TriggerEvent};

use super::{RunFilter, RunStore, StoreError, StoreResult, next_version};

/// PostgreSQL-backed run store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a pool whose schema has been created by [`crate::db::run_migrations`]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RUN_COLUMNS: &str = r#"
    id, definition, status, current_stage, trigger_event, stages, artifacts,
    failure, created_at, updated_at, finished_at, retired
"#;

#[async_trait]
impl RunStore for PgStore {
    async fn insert_definition(
        &self,
        mut definition: PipelineDefinition,
    ) -> StoreResult<PipelineDefinition> {
        let mut tx = self.pool.begin().await?;

        // Serialise version assignment per definition name
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&definition.name)
            .execute(&mut *tx)
            .await?;

        let latest: Option<i32> =
            sqlx::query_scalar("SELECT MAX(version) FROM definitions WHERE name = $1")
                .bind(&definition.name)
                .fetch_one(&mut *tx)
                .await?;

        definition.id = Uuid::new_v4();
        definition.version = next_version(latest.map(|v| v as u32));
        definition.created_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO definitions
                (id, name, version, description, branch, stages, approval_timeout_seconds, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(definition.version as i32)
        .bind(&definition.description)
        .bind(&definition.trigger.branch)
        .bind(Json(&definition.stages))
        .bind(
            definition
                .approval_timeout_seconds
                .and_then(|seconds| i64::try_from(seconds).ok()),
        )
        .bind(definition.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Stored definition {} v{} ({})",
            definition.name,
            definition.version,
            definition.id
        );
        Ok(definition)
    }

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<PipelineDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT id, name, version, description, branch, stages, approval_timeout_seconds, created_at
            FROM definitions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn latest_definition(&self, name: &str) -> StoreResult<Option<PipelineDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT id, name, version, description, branch, stages, approval_timeout_seconds, created_at
            FROM definitions
            WHERE name = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_definitions(&self) -> StoreResult<Vec<PipelineDefinition>> {
        let rows = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT id, name, version, description, branch, stages, approval_timeout_seconds, created_at
            FROM definitions
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_run(&self, run: &PipelineRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, definition_id, definition_name, definition, status, current_stage,
                trigger_event, stages, artifacts, failure, created_at, updated_at,
                finished_at, retired
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                current_stage = EXCLUDED.current_stage,
                stages = EXCLUDED.stages,
                artifacts = EXCLUDED.artifacts,
                failure = EXCLUDED.failure,
                updated_at = EXCLUDED.updated_at,
                finished_at = EXCLUDED.finished_at,
                retired = EXCLUDED.retired
            "#,
        )
        .bind(run.id)
        .bind(run.definition.id)
        .bind(&run.definition.name)
        .bind(Json(&run.definition))
        .bind(run.status.as_str())
        .bind(run.current_stage as i32)
        .bind(Json(&run.trigger))
        .bind(Json(&run.stages))
        .bind(Json(&run.artifacts))
        .bind(run.failure.as_ref().map(Json))
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(run.finished_at)
        .bind(run.retired)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<PipelineRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {}
            FROM runs
            WHERE ($1::TEXT IS NULL OR definition_name = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
            RUN_COLUMNS
        ))
        .bind(filter.definition.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_unfinished_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {}
            FROM runs
            WHERE status IN ('running', 'awaiting_approval')
            ORDER BY created_at ASC
            "#,
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_retirable_runs(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<PipelineRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {}
            FROM runs
            WHERE status IN ('succeeded', 'failed', 'cancelled')
              AND NOT retired
              AND finished_at < $1
            ORDER BY finished_at ASC
            "#,
            RUN_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn record_decision(&self, decision: &ApprovalDecision) -> StoreResult<ApprovalDecision> {
        sqlx::query(
            r#"
            INSERT INTO approval_decisions
                (run_id, stage, decision, actor, comment, expired, decided_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id, stage) DO NOTHING
            "#,
        )
        .bind(decision.gate.run_id)
        .bind(&decision.gate.stage)
        .bind(decision_to_string(decision.decision))
        .bind(&decision.actor)
        .bind(&decision.comment)
        .bind(decision.expired)
        .bind(decision.decided_at)
        .execute(&self.pool)
        .await?;

        self.get_decision(&decision.gate)
            .await?
            .ok_or_else(|| StoreError::Internal(format!("decision for {} vanished", decision.gate)))
    }

    async fn get_decision(&self, gate: &GateId) -> StoreResult<Option<ApprovalDecision>> {
        let row = sqlx::query_as::<_, DecisionRow>(
            r#"
            SELECT run_id, stage, decision, actor, comment, expired, decided_at
            FROM approval_decisions
            WHERE run_id = $1 AND stage = $2
            "#,
        )
        .bind(gate.run_id)
        .bind(&gate.stage)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}

fn decision_to_string(decision: Decision) -> &'static str {
    match decision {
        Decision::Approve => "approve",
        Decision::Reject => "reject",
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: Uuid,
    name: String,
    version: i32,
    description: Option<String>,
    branch: String,
    stages: Json<Vec<StageSpec>>,
    approval_timeout_seconds: Option<i64>,
    created_at: DateTime<Utc>,
}

impl From<DefinitionRow> for PipelineDefinition {
    fn from(row: DefinitionRow) -> Self {
        PipelineDefinition {
            id: row.id,
            version: row.version as u32,
            name: row.name,
            description: row.description,
            trigger: TriggerConfig { branch: row.branch },
            stages: row.stages.0,
            approval_timeout_seconds: row
                .approval_timeout_seconds
                .and_then(|seconds| u64::try_from(seconds).ok()),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    definition: Json<PipelineDefinition>,
    status: String,
    current_stage: i32,
    trigger_event: Json<TriggerEvent>,
    stages: Json<Vec<StageRecord>>,
    artifacts: Json<Vec<ArtifactRef>>,
    failure: Option<Json<RunFailure>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    retired: bool,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(PipelineRun {
            id: row.id,
            definition: row.definition.0,
            trigger: row.trigger_event.0,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            current_stage: row.current_stage as usize,
            stages: row.stages.0,
            artifacts: row.artifacts.0,
            failure: row.failure.map(|f| f.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
            retired: row.retired,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DecisionRow {
    run_id: Uuid,
    stage: String,
    decision: String,
    actor: String,
    comment: Option<String>,
    expired: bool,
    decided_at: DateTime<Utc>,
}

impl TryFrom<DecisionRow> for ApprovalDecision {
    type Error = StoreError;

    fn try_from(row: DecisionRow) -> Result<Self, Self::Error> {
        Ok(ApprovalDecision {
            gate: GateId::new(row.run_id, row.stage),
            decision: row.decision.parse().map_err(StoreError::Corrupt)?,
            actor: row.actor,
            comment: row.comment,
            expired: row.expired,
            decided_at: row.decided_at,
        })
    }
}
