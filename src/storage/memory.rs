//! In-memory run store for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{guarded_update, RunStore, StoreError};
use crate::evaluation::elo::EloRating;
use crate::run::{
    CombinedDocument, GeneratedDocument, PairwiseResult, PairwiseStage, Run, RunId, RunStatus,
    SingleEvalResult,
};
use crate::timeline::TimelineEvent;

#[derive(Default)]
struct RunRecords {
    run: Option<Run>,
    generated: Vec<GeneratedDocument>,
    single: Vec<SingleEvalResult>,
    pairwise: Vec<PairwiseResult>,
    elo: HashMap<PairwiseStage, Vec<EloRating>>,
    combined: Option<CombinedDocument>,
    timeline: Vec<TimelineEvent>,
}

/// Store backed by a map of run id to records.
#[derive(Default)]
pub struct InMemoryRunStore {
    records: RwLock<HashMap<RunId, RunRecords>>,
    // Run ids in insertion order.
    order: RwLock<Vec<RunId>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let entry = records.entry(run.id).or_default();
        if entry.run.is_some() {
            return Err(StoreError::Duplicate(run.id));
        }
        entry.run = Some(run.clone());
        self.order.write().await.push(run.id);
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&run.id)
            .and_then(|r| r.run.as_mut())
            .ok_or(StoreError::NotFound(run.id))?;
        *stored = guarded_update(stored, run)?;
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.records
            .read()
            .await
            .get(&run_id)
            .and_then(|r| r.run.clone())
            .ok_or(StoreError::NotFound(run_id))
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let records = self.records.read().await;
        let order = self.order.read().await;
        Ok(order
            .iter()
            .filter_map(|id| records.get(id).and_then(|r| r.run.clone()))
            .collect())
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .list_runs()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    async fn save_generated_document(&self, doc: &GeneratedDocument) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let entry = records.entry(doc.run_id).or_default();
        match entry.generated.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc.clone(),
            None => entry.generated.push(doc.clone()),
        }
        Ok(())
    }

    async fn list_generated_documents(
        &self,
        run_id: RunId,
    ) -> Result<Vec<GeneratedDocument>, StoreError> {
        let mut docs = self
            .records
            .read()
            .await
            .get(&run_id)
            .map(|r| r.generated.clone())
            .unwrap_or_default();
        docs.sort_by_key(|d| d.seq);
        Ok(docs)
    }

    async fn save_single_result(&self, result: &SingleEvalResult) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .entry(result.run_id)
            .or_default()
            .single
            .push(result.clone());
        Ok(())
    }

    async fn list_single_results(
        &self,
        run_id: RunId,
    ) -> Result<Vec<SingleEvalResult>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&run_id)
            .map(|r| r.single.clone())
            .unwrap_or_default())
    }

    async fn save_pairwise_result(&self, result: &PairwiseResult) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .entry(result.run_id)
            .or_default()
            .pairwise
            .push(result.clone());
        Ok(())
    }

    async fn list_pairwise_results(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
    ) -> Result<Vec<PairwiseResult>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&run_id)
            .map(|r| {
                r.pairwise
                    .iter()
                    .filter(|p| p.stage == stage)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_elo_ratings(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
        ratings: &[EloRating],
    ) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .entry(run_id)
            .or_default()
            .elo
            .insert(stage, ratings.to_vec());
        Ok(())
    }

    async fn list_elo_ratings(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
    ) -> Result<Vec<EloRating>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&run_id)
            .and_then(|r| r.elo.get(&stage).cloned())
            .unwrap_or_default())
    }

    async fn save_combined_document(&self, doc: &CombinedDocument) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .entry(doc.run_id)
            .or_default()
            .combined = Some(doc.clone());
        Ok(())
    }

    async fn get_combined_document(
        &self,
        run_id: RunId,
    ) -> Result<Option<CombinedDocument>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&run_id)
            .and_then(|r| r.combined.clone()))
    }

    async fn append_timeline_event(&self, event: &TimelineEvent) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .timeline
            .push(event.clone());
        Ok(())
    }

    async fn list_timeline(&self, run_id: RunId) -> Result<Vec<TimelineEvent>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&run_id)
            .map(|r| r.timeline.clone())
            .unwrap_or_default())
    }
}
