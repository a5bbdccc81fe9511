//! SQLite-based run store

use crate::core::{ExecutionStatus, PipelineRun, StepExecution};
use crate::persistence::RunStore;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id TEXT PRIMARY KEY,
        pipeline_name TEXT NOT NULL,
        status TEXT NOT NULL,
        mode TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        external_id TEXT,
        failure TEXT,
        trigger_data TEXT NOT NULL,
        workspace TEXT NOT NULL,
        total_stages INTEGER NOT NULL DEFAULT 0,
        completed_stages INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON pipeline_runs(pipeline_name)",
    "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON pipeline_runs(started_at)",
    r#"
    CREATE TABLE IF NOT EXISTS step_executions (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        step_name TEXT NOT NULL,
        status TEXT NOT NULL,
        output TEXT NOT NULL,
        error TEXT,
        started_at TEXT,
        completed_at TEXT,
        step_order INTEGER NOT NULL,
        stage_index INTEGER,
        max_retries INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_steps_run ON step_executions(run_id)",
];

const RUN_COLUMNS: &str = "id, pipeline_name, status, mode, started_at, completed_at, external_id, \
                           failure, trigger_data, workspace, total_stages, completed_stages";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (or create) a store at `db_path`; `:memory:` gives a private database
    pub async fn new(db_path: &str) -> Result<Self> {
        let in_memory = db_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // Every pooled connection to :memory: would see its own database
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("pipeline-orchestrator");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("runs.db");
        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("Database path is not valid UTF-8"))?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize schema")?;
        }
        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn status(row: &SqliteRow) -> Result<ExecutionStatus> {
        let text: String = row.get("status");
        ExecutionStatus::from_str(&text).map_err(|e| anyhow!(e))
    }

    fn run_from_row(row: &SqliteRow) -> Result<PipelineRun> {
        let failure: Option<String> = row.get("failure");
        Ok(PipelineRun {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_name: row.get("pipeline_name"),
            status: Self::status(row)?,
            mode: row.get("mode"),
            trigger: serde_json::from_str(&row.get::<String, _>("trigger_data"))
                .context("Corrupt trigger metadata")?,
            started_at: row
                .get::<Option<NaiveDateTime>, _>("started_at")
                .map(Self::from_naive),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
            failure: failure
                .map(|f| serde_json::from_str(&f))
                .transpose()
                .context("Corrupt failure record")?,
            external_id: row.get("external_id"),
            step_executions: Vec::new(),
            workspace: serde_json::from_str(&row.get::<String, _>("workspace"))
                .context("Corrupt workspace")?,
            total_stages: row.get::<i64, _>("total_stages") as usize,
            completed_stages: row.get::<i64, _>("completed_stages") as usize,
        })
    }

    fn step_from_row(row: &SqliteRow) -> Result<StepExecution> {
        Ok(StepExecution {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            step_id: row.get("step_id"),
            step_name: row.get("step_name"),
            status: Self::status(row)?,
            output: row.get("output"),
            error: row.get("error"),
            started_at: row
                .get::<Option<NaiveDateTime>, _>("started_at")
                .map(Self::from_naive),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
            order: row.get("step_order"),
            stage_index: row.get::<Option<i64>, _>("stage_index").map(|i| i as usize),
            max_retries: row.get::<i64, _>("max_retries") as usize,
        })
    }
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let failure = run.failure.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO pipeline_runs ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            RUN_COLUMNS
        ))
        .bind(run.id.to_string())
        .bind(&run.pipeline_name)
        .bind(run.status.as_str())
        .bind(&run.mode)
        .bind(run.started_at.map(Self::to_naive))
        .bind(run.completed_at.map(Self::to_naive))
        .bind(&run.external_id)
        .bind(failure)
        .bind(serde_json::to_string(&run.trigger)?)
        .bind(serde_json::to_string(&run.workspace)?)
        .bind(run.total_stages as i64)
        .bind(run.completed_stages as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs WHERE id = ?1",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load run")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = Self::run_from_row(&row)?;
        run.step_executions = self.load_step_executions(run_id).await?;
        Ok(Some(run))
    }

    async fn list_runs(&self, pipeline_name: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>> {
        let rows = match pipeline_name {
            Some(name) => {
                sqlx::query(&format!(
                    "SELECT {} FROM pipeline_runs WHERE pipeline_name = ?1 \
                     ORDER BY started_at DESC LIMIT ?2",
                    RUN_COLUMNS
                ))
                .bind(name)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM pipeline_runs ORDER BY started_at DESC LIMIT ?1",
                    RUN_COLUMNS
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list runs")?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT pipeline_name FROM pipeline_runs ORDER BY pipeline_name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }

    async fn save_step_executions(&self, run_id: Uuid, executions: &[StepExecution]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM step_executions WHERE run_id = ?1")
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to clear step executions")?;

        for exec in executions {
            sqlx::query(
                r#"
                INSERT INTO step_executions
                (id, run_id, step_id, step_name, status, output, error, started_at,
                 completed_at, step_order, stage_index, max_retries)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(exec.id.to_string())
            .bind(run_id.to_string())
            .bind(&exec.step_id)
            .bind(&exec.step_name)
            .bind(exec.status.as_str())
            .bind(&exec.output)
            .bind(&exec.error)
            .bind(exec.started_at.map(Self::to_naive))
            .bind(exec.completed_at.map(Self::to_naive))
            .bind(exec.order)
            .bind(exec.stage_index.map(|i| i as i64))
            .bind(exec.max_retries as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to save step execution")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT id, step_id, step_name, status, output, error, started_at, completed_at,
                   step_order, stage_index, max_retries
            FROM step_executions
            WHERE run_id = ?1
            ORDER BY step_order ASC, stage_index ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load step executions")?;

        rows.iter().map(Self::step_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunFailure, TriggerMetadata, WorkspaceContext};

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteRunStore::new(":memory:").await.unwrap();

        let mut workspace = WorkspaceContext::new();
        workspace.set("docker.image", "app:1");
        let mut run = PipelineRun::new("deploy", "local", TriggerMetadata::manual("ci"), workspace);
        run.start();
        run.record_failure(RunFailure {
            stage_index: Some(1),
            step_id: Some("test".to_string()),
            error: "exit 1".to_string(),
        });
        run.finish(ExecutionStatus::Failed);

        let mut exec = StepExecution::new("test", "Test", 2, Some(1));
        exec.max_retries = 2;
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.transition(ExecutionStatus::Failed).unwrap();
        run.step_executions.push(exec);

        store.save_run(&run).await.unwrap();
        store
            .save_step_executions(run.id, &run.step_executions)
            .await
            .unwrap();

        let loaded = store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.pipeline_name, "deploy");
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.failure, run.failure);
        assert_eq!(loaded.workspace.get("docker.image"), Some("app:1"));
        assert_eq!(loaded.step_executions.len(), 1);
        assert_eq!(loaded.step_executions[0].max_retries, 2);
        assert_eq!(loaded.snapshot().retryable_steps(), ["test".to_string()]);
    }

    #[tokio::test]
    async fn test_step_executions_are_replaced() {
        let store = SqliteRunStore::new(":memory:").await.unwrap();
        let run = PipelineRun::new("p", "local", TriggerMetadata::default(), WorkspaceContext::new());
        store.save_run(&run).await.unwrap();

        let first = vec![StepExecution::new("a", "A", 1, Some(0))];
        store.save_step_executions(run.id, &first).await.unwrap();
        let second = vec![
            StepExecution::new("a", "A", 1, Some(0)),
            StepExecution::new("b", "B", 2, Some(1)),
        ];
        store.save_step_executions(run.id, &second).await.unwrap();

        let steps = store.load_step_executions(run.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(store.list_pipelines().await.unwrap(), vec!["p"]);
        assert_eq!(store.list_runs(Some("p"), 5).await.unwrap().len(), 1);
    }
}
