//! SQLite-backed run store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::{guarded_update, RunStore, StoreError};
use crate::evaluation::elo::EloRating;
use crate::run::{
    CombinedDocument, GeneratedDocument, PairwiseResult, PairwiseStage, Run, RunId, RunPhase,
    RunStatus, SingleEvalResult,
};
use crate::timeline::TimelineEvent;

const RUN_COLUMNS: &str = "id, status, phase, config, progress, summary, pre_combine_winner, \
     winner, total_cost, cancel_reason, created_at, started_at, completed_at";

/// Run store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Opens (creating if missing) the database at `url` and applies migrations.
    ///
    /// `sqlite::memory:` gives a private in-memory database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            opts = opts
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Every connection to `:memory:` is its own database.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;

        tracing::info!(url = url, "Run store opened");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await?;
        Ok(())
    }

    async fn fetch_runs(&self, filter: Option<RunStatus>) -> Result<Vec<Run>, StoreError> {
        let rows = match filter {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM runs WHERE status = ?1 ORDER BY created_at, rowid",
                    RUN_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM runs ORDER BY created_at, rowid",
                    RUN_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(run_from_row).collect()
    }

    async fn fetch_bodies<T: DeserializeOwned>(
        &self,
        sql: &str,
        run_id: RunId,
        stage: Option<PairwiseStage>,
    ) -> Result<Vec<T>, StoreError> {
        let mut query = sqlx::query(sql).bind(run_id.to_string());
        if let Some(stage) = stage {
            query = query.bind(stage.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<T, StoreError> {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_phase(raw: &str) -> Result<RunPhase, StoreError> {
    RunPhase::all()
        .into_iter()
        .find(|p| p.as_str() == raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown phase '{}'", raw)))
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let phase: Option<String> = row.try_get("phase")?;
    let config: String = row.try_get("config")?;
    let progress: String = row.try_get("progress")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Run {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("run id: {}", e)))?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        phase: phase.as_deref().map(parse_phase).transpose()?,
        config: serde_json::from_str(&config)?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?)?,
        summary: row.try_get("summary")?,
        pre_combine_winner: row.try_get("pre_combine_winner")?,
        winner: row.try_get("winner")?,
        progress: serde_json::from_str(&progress)?,
        total_cost: row.try_get("total_cost")?,
        cancel_reason: row.try_get("cancel_reason")?,
    })
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (
                id, status, phase, config, progress, summary, pre_combine_winner,
                winner, total_cost, cancel_reason, created_at, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.status.as_str())
        .bind(run.phase.map(|p| p.as_str()))
        .bind(serde_json::to_string(&run.config)?)
        .bind(serde_json::to_string(&run.progress)?)
        .bind(&run.summary)
        .bind(&run.pre_combine_winner)
        .bind(&run.winner)
        .bind(run.total_cost)
        .bind(&run.cancel_reason)
        .bind(format_ts(&run.created_at))
        .bind(run.started_at.as_ref().map(format_ts))
        .bind(run.completed_at.as_ref().map(format_ts))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(run.id));
        }
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        // Only non-terminal rows take a full update.
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = ?2, phase = ?3, config = ?4, progress = ?5, summary = ?6,
                pre_combine_winner = ?7, winner = ?8, total_cost = ?9, cancel_reason = ?10,
                started_at = ?11, completed_at = ?12
            WHERE id = ?1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.status.as_str())
        .bind(run.phase.map(|p| p.as_str()))
        .bind(serde_json::to_string(&run.config)?)
        .bind(serde_json::to_string(&run.progress)?)
        .bind(&run.summary)
        .bind(&run.pre_combine_winner)
        .bind(&run.winner)
        .bind(run.total_cost)
        .bind(&run.cancel_reason)
        .bind(run.started_at.as_ref().map(format_ts))
        .bind(run.completed_at.as_ref().map(format_ts))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let stored = self.get_run(run.id).await?;
        let kept = guarded_update(&stored, run)?;
        sqlx::query("UPDATE runs SET summary = ?2 WHERE id = ?1")
            .bind(run.id.to_string())
            .bind(&kept.summary)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(run_id))?;
        run_from_row(&row)
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.fetch_runs(None).await
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, StoreError> {
        self.fetch_runs(Some(status)).await
    }

    async fn save_generated_document(&self, doc: &GeneratedDocument) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO generated_documents (run_id, id, seq, body, success)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (run_id, id) DO UPDATE SET
                seq = excluded.seq,
                body = excluded.body,
                success = excluded.success
            "#,
        )
        .bind(doc.run_id.to_string())
        .bind(&doc.id)
        .bind(doc.seq as i64)
        .bind(serde_json::to_string(doc)?)
        .bind(doc.success())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_generated_documents(
        &self,
        run_id: RunId,
    ) -> Result<Vec<GeneratedDocument>, StoreError> {
        self.fetch_bodies(
            "SELECT body FROM generated_documents WHERE run_id = ?1 ORDER BY seq",
            run_id,
            None,
        )
        .await
    }

    async fn save_single_result(&self, result: &SingleEvalResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO single_eval_results (id, run_id, candidate_id, judge, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.run_id.to_string())
        .bind(&result.candidate_id)
        .bind(&result.judge)
        .bind(serde_json::to_string(result)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_single_results(
        &self,
        run_id: RunId,
    ) -> Result<Vec<SingleEvalResult>, StoreError> {
        self.fetch_bodies(
            "SELECT body FROM single_eval_results WHERE run_id = ?1 ORDER BY rowid",
            run_id,
            None,
        )
        .await
    }

    async fn save_pairwise_result(&self, result: &PairwiseResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pairwise_results (id, run_id, stage, body)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.run_id.to_string())
        .bind(result.stage.as_str())
        .bind(serde_json::to_string(result)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pairwise_results(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
    ) -> Result<Vec<PairwiseResult>, StoreError> {
        self.fetch_bodies(
            "SELECT body FROM pairwise_results WHERE run_id = ?1 AND stage = ?2 ORDER BY rowid",
            run_id,
            Some(stage),
        )
        .await
    }

    async fn save_elo_ratings(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
        ratings: &[EloRating],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM elo_ratings WHERE run_id = ?1 AND stage = ?2")
            .bind(run_id.to_string())
            .bind(stage.as_str())
            .execute(&mut *tx)
            .await?;

        for rating in ratings {
            sqlx::query(
                r#"
                INSERT INTO elo_ratings (
                    run_id, stage, candidate_id, rating, wins, losses, ties, seq
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(run_id.to_string())
            .bind(stage.as_str())
            .bind(&rating.candidate_id)
            .bind(rating.rating)
            .bind(rating.wins as i64)
            .bind(rating.losses as i64)
            .bind(rating.ties as i64)
            .bind(rating.seq as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_elo_ratings(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
    ) -> Result<Vec<EloRating>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT candidate_id, rating, wins, losses, ties, seq
            FROM elo_ratings
            WHERE run_id = ?1 AND stage = ?2
            ORDER BY rating DESC, wins DESC, seq ASC, candidate_id ASC
            "#,
        )
        .bind(run_id.to_string())
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<EloRating, StoreError> {
                Ok(EloRating {
                    candidate_id: row.try_get("candidate_id")?,
                    rating: row.try_get("rating")?,
                    wins: row.try_get::<i64, _>("wins")? as u32,
                    losses: row.try_get::<i64, _>("losses")? as u32,
                    ties: row.try_get::<i64, _>("ties")? as u32,
                    seq: row.try_get::<i64, _>("seq")? as u64,
                })
            })
            .collect()
    }

    async fn save_combined_document(&self, doc: &CombinedDocument) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO combined_documents (run_id, body) VALUES (?1, ?2)
            ON CONFLICT (run_id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(doc.run_id.to_string())
        .bind(serde_json::to_string(doc)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_combined_document(
        &self,
        run_id: RunId,
    ) -> Result<Option<CombinedDocument>, StoreError> {
        let mut docs: Vec<CombinedDocument> = self
            .fetch_bodies(
                "SELECT body FROM combined_documents WHERE run_id = ?1",
                run_id,
                None,
            )
            .await?;
        Ok(docs.pop())
    }

    async fn append_timeline_event(&self, event: &TimelineEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO timeline_events (id, run_id, phase, event_type, success, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.run_id.to_string())
        .bind(event.phase.as_str())
        .bind(event.event_type.as_str())
        .bind(event.success)
        .bind(serde_json::to_string(event)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_timeline(&self, run_id: RunId) -> Result<Vec<TimelineEvent>, StoreError> {
        self.fetch_bodies(
            "SELECT body FROM timeline_events WHERE run_id = ?1 ORDER BY seq",
            run_id,
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{
        Criterion, GenerationOutcome, JudgeSpec, ModelSpec, PairwiseOutcome, RunConfig,
        SourceDocument,
    };
    use crate::timeline::TimelineEventType;

    async fn store() -> SqliteRunStore {
        SqliteRunStore::connect("sqlite::memory:").await.unwrap()
    }

    fn run() -> Run {
        Run::new(RunConfig::new(
            vec![SourceDocument::new("doc-1", "Explain tides")],
            vec![ModelSpec::new("openai", "gpt-4o")],
            vec![JudgeSpec::new("judge-1", ModelSpec::new("openai", "gpt-4o-mini"))],
            vec![Criterion::new("clarity")],
        ))
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = store().await;
        let mut run = run();
        store.insert_run(&run).await.unwrap();

        run.mark_running().unwrap();
        run.set_phase(RunPhase::EvaluatingPairwise);
        run.progress.generation.total = 4;
        run.progress.generation.completed = 3;
        run.progress.generation.failed = 1;
        run.total_cost = 0.25;
        store.update_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.phase, Some(RunPhase::EvaluatingPairwise));
        assert_eq!(loaded.progress, run.progress);
        assert_eq!(loaded.config, run.config);
        assert!(loaded.started_at.is_some());
        assert!((loaded.total_cost - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_terminal_run_only_takes_summary() {
        let store = store().await;
        let mut run = run();
        run.mark_running().unwrap();
        store.insert_run(&run).await.unwrap();

        run.mark_completed(None, "done").unwrap();
        store.update_run(&run).await.unwrap();

        let mut edited = run.clone();
        edited.set_summary("done, reviewed");
        store.update_run(&edited).await.unwrap();
        assert_eq!(
            store.get_run(run.id).await.unwrap().summary.as_deref(),
            Some("done, reviewed")
        );

        let mut regress = run.clone();
        regress.status = RunStatus::Running;
        assert!(matches!(
            store.update_run(&regress).await,
            Err(StoreError::TerminalRun { .. })
        ));
        assert_eq!(
            store.get_run(run.id).await.unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_list_runs_by_status() {
        let store = store().await;
        let pending = run();
        let mut running = run();
        running.mark_running().unwrap();
        store.insert_run(&pending).await.unwrap();
        store.insert_run(&running).await.unwrap();

        let found = store.list_runs_by_status(RunStatus::Running).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, running.id);
        assert!(matches!(
            store.get_run(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_child_records_round_trip() {
        let store = store().await;
        let run = run();
        store.insert_run(&run).await.unwrap();
        let now = Utc::now();
        let model = ModelSpec::new("openai", "gpt-4o");

        let doc = GeneratedDocument {
            id: GeneratedDocument::candidate_id("doc-1", &model, 1),
            run_id: run.id,
            source_document_id: "doc-1".to_string(),
            model,
            iteration: 1,
            seq: 0,
            outcome: GenerationOutcome::Succeeded {
                content: "Tides follow the moon.".to_string(),
            },
            attempts: 1,
            started_at: now,
            completed_at: now,
            cost: 0.01,
        };
        store.save_generated_document(&doc).await.unwrap();
        assert_eq!(
            store.list_generated_documents(run.id).await.unwrap(),
            vec![doc.clone()]
        );

        let pairwise = PairwiseResult {
            id: Uuid::new_v4(),
            run_id: run.id,
            stage: PairwiseStage::PostCombine,
            candidate_a: doc.id.clone(),
            candidate_b: "combined-best_of_n".to_string(),
            judge: "judge-1".to_string(),
            outcome: PairwiseOutcome::Tie,
            rationale: "equal".to_string(),
            attempts: 1,
            started_at: now,
            completed_at: now,
        };
        store.save_pairwise_result(&pairwise).await.unwrap();
        assert!(store
            .list_pairwise_results(run.id, PairwiseStage::PreCombine)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_pairwise_results(run.id, PairwiseStage::PostCombine)
                .await
                .unwrap(),
            vec![pairwise]
        );

        let ratings = vec![
            EloRating {
                candidate_id: "b".to_string(),
                rating: 984.0,
                wins: 0,
                losses: 1,
                ties: 0,
                seq: 1,
            },
            EloRating {
                candidate_id: "a".to_string(),
                rating: 1016.0,
                wins: 1,
                losses: 0,
                ties: 0,
                seq: 0,
            },
        ];
        store
            .save_elo_ratings(run.id, PairwiseStage::PreCombine, &ratings)
            .await
            .unwrap();
        store
            .save_elo_ratings(run.id, PairwiseStage::PreCombine, &ratings)
            .await
            .unwrap();
        let loaded = store
            .list_elo_ratings(run.id, PairwiseStage::PreCombine)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].candidate_id, "a");
    }

    #[tokio::test]
    async fn test_timeline_order() {
        let store = store().await;
        let run = run();
        store.insert_run(&run).await.unwrap();

        for i in 0..5 {
            let event = TimelineEvent::run_event(
                run.id,
                TimelineEventType::RunStarted,
                format!("event {}", i),
            );
            store.append_timeline_event(&event).await.unwrap();
        }

        let events = store.list_timeline(run.id).await.unwrap();
        let descriptions: Vec<&str> = events.iter().map(|e| e.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["event 0", "event 1", "event 2", "event 3", "event 4"]
        );
    }
}
