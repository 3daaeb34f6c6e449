//! Fan-out of generation tasks over a bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::collaborators::{GenerationTask, Generator, GeneratorReply};
use crate::error::{CallError, GenerationFailure};
use crate::evaluation::{with_timeout, RetryPolicy};
use crate::metrics::MetricsCollector;
use crate::orchestrator::{CancelSignal, ProgressCounters};
use crate::pipeline::EngineConfig;
use crate::run::{
    Candidate, GeneratedDocument, GenerationOutcome, PhaseProgress, RunConfig, RunId, RunPhase,
};
use crate::storage::{RunStore, StoreError};
use crate::timeline::{TimelineEvent, TimelineRecorder};

/// Outcome of the generation phase.
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    /// Every resolved document, in plan order.
    pub documents: Vec<GeneratedDocument>,
    pub progress: PhaseProgress,
    pub cost: f64,
}

impl GenerationReport {
    pub fn succeeded(&self) -> usize {
        self.documents.iter().filter(|d| d.success()).count()
    }

    /// Evaluation candidates from successful documents.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.documents.iter().filter_map(|d| d.candidate()).collect()
    }
}

/// Classifies a generator reply.
///
/// Success is only trusted when there is text to back it: a reply claiming
/// success with blank content is downgraded to `FailedEmpty`.
fn classify_reply(reply: &GeneratorReply) -> GenerationOutcome {
    if reply.success {
        return GenerationOutcome::from_content(
            reply.content.clone(),
            GenerationFailure::EmptyContent {
                detail: Some("reported success".to_string()),
            }
            .to_string(),
        );
    }
    match &reply.error {
        Some(error) if !error.trim().is_empty() => GenerationOutcome::FailedError {
            kind: "reported".to_string(),
            message: GenerationFailure::Reported(error.clone()).to_string(),
        },
        _ => GenerationOutcome::FailedEmpty {
            reason: GenerationFailure::EmptyContent { detail: None }.to_string(),
        },
    }
}

fn classify_error(err: CallError) -> GenerationOutcome {
    GenerationOutcome::FailedError {
        kind: err.kind().to_string(),
        message: GenerationFailure::Call(err).to_string(),
    }
}

enum TaskResolution {
    Done(GeneratedDocument),
    Skipped,
}

/// Runs generation tasks with bounded concurrency.
pub struct GenerationDispatcher {
    generator: Arc<dyn Generator>,
    store: Arc<dyn RunStore>,
    timeout: Duration,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl GenerationDispatcher {
    pub fn new(generator: Arc<dyn Generator>, store: Arc<dyn RunStore>, config: &EngineConfig) -> Self {
        Self {
            generator,
            store,
            timeout: config.generation_timeout,
            retry: config.generation_retry(),
            metrics: MetricsCollector::new(),
        }
    }

    /// One task per document x model x iteration, numbered in that order.
    pub fn plan(run_id: RunId, config: &RunConfig) -> Vec<GenerationTask> {
        let mut tasks = Vec::with_capacity(config.generation_task_count());
        for document in &config.documents {
            for model in &config.models {
                for iteration in 1..=config.iterations.max(1) {
                    tasks.push(GenerationTask {
                        run_id,
                        candidate_id: GeneratedDocument::candidate_id(&document.id, model, iteration),
                        document: document.clone(),
                        model: model.clone(),
                        iteration,
                        seq: tasks.len() as u64,
                    });
                }
            }
        }
        tasks
    }

    /// Executes `tasks`, persisting one document and one timeline record per task.
    ///
    /// Task failures never abort the phase; only a store failure does.
    pub async fn dispatch(
        &self,
        tasks: Vec<GenerationTask>,
        concurrency: usize,
        recorder: &TimelineRecorder,
        cancel: &CancelSignal,
        counters: &ProgressCounters,
    ) -> Result<GenerationReport, StoreError> {
        let run_id = recorder.run_id();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let generator = self.generator.clone();
            let store = self.store.clone();
            let (timeout, retry, metrics) = (self.timeout, self.retry, self.metrics);
            let semaphore = semaphore.clone();
            let recorder = recorder.clone();
            let cancel = cancel.clone();
            let counters = counters.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok::<_, StoreError>(TaskResolution::Skipped),
                };
                if let Some(reason) = cancel.reason() {
                    counters.record_skipped();
                    recorder
                        .record(
                            TimelineEvent::task_skipped(
                                run_id,
                                RunPhase::Generating,
                                task.candidate_id.clone(),
                                format!("run cancelled: {}", reason),
                            )
                            .with_actor(task.model.id()),
                        )
                        .await?;
                    return Ok(TaskResolution::Skipped);
                }

                let started_at = Utc::now();
                let attempted = retry
                    .run(&task.candidate_id, |_| {
                        with_timeout(timeout, generator.generate(&task))
                    })
                    .await;

                let (outcome, cost, started_at, completed_at) = match attempted.result {
                    Ok(reply) => (
                        classify_reply(&reply),
                        reply.cost,
                        started_at,
                        reply.completed_at.max(started_at),
                    ),
                    Err(err) => (classify_error(err), 0.0, started_at, Utc::now()),
                };

                let document = GeneratedDocument {
                    id: task.candidate_id.clone(),
                    run_id,
                    source_document_id: task.document.id.clone(),
                    model: task.model.clone(),
                    iteration: task.iteration,
                    seq: task.seq,
                    outcome,
                    attempts: attempted.attempts,
                    started_at,
                    completed_at,
                    cost,
                };
                store.save_generated_document(&document).await?;

                let latency = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
                metrics.record_generation(&task.model.id(), document.outcome.label(), latency, cost);

                let mut event = TimelineEvent::task_completed(
                    run_id,
                    RunPhase::Generating,
                    format!("generated {}: {}", document.id, document.outcome.label()),
                    started_at,
                    completed_at,
                )
                .with_actor(task.model.id())
                .with_subject(document.id.clone())
                .with_details(serde_json::json!({
                    "source_document": document.source_document_id,
                    "iteration": document.iteration,
                    "outcome": document.outcome.label(),
                    "attempts": document.attempts,
                    "content_chars": document.content().chars().count(),
                    "cost": cost,
                }));

                match document.outcome.failure_reason() {
                    None => counters.record_completed(),
                    Some(reason) => {
                        tracing::warn!(
                            run_id = %run_id,
                            candidate = %document.id,
                            model = %document.model,
                            attempts = document.attempts,
                            reason = %reason,
                            "Generation failed"
                        );
                        counters.record_failed();
                        event = event.failed(reason);
                    }
                }
                recorder.record(event).await?;

                Ok(TaskResolution::Done(document))
            }));
        }

        let mut report = GenerationReport {
            progress: PhaseProgress {
                total: handles.len(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut first_error = None;

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(TaskResolution::Done(document))) => {
                    if document.success() {
                        report.progress.completed += 1;
                    } else {
                        report.progress.failed += 1;
                    }
                    report.cost += document.cost;
                    report.documents.push(document);
                }
                Ok(Ok(TaskResolution::Skipped)) => report.progress.skipped += 1,
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_error) => {
                    tracing::error!(run_id = %run_id, error = %join_error, "Generation task panicked");
                    report.progress.failed += 1;
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        report.documents.sort_by_key(|d| d.seq);
        tracing::info!(
            run_id = %run_id,
            planned = report.progress.total,
            succeeded = report.progress.completed,
            failed = report.progress.failed,
            skipped = report.progress.skipped,
            cost = report.cost,
            "Generation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Criterion, JudgeSpec, ModelSpec, SourceDocument};
    use crate::storage::InMemoryRunStore;
    use crate::timeline::TimelineEventType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Answers by model name: "blank" claims success with no text, "down" fails
    /// transiently once, "broken" reports failure, anything else writes text.
    struct ScriptedGenerator {
        calls: AtomicU32,
        down_calls: AtomicU32,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, task: &GenerationTask) -> Result<GeneratorReply, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            match task.model.model.as_str() {
                "blank" => Ok(GeneratorReply::succeeded("  ", 0.01, now)),
                "broken" => Ok(GeneratorReply::failed("content filter", 0.0, now)),
                "down" => {
                    if self.down_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CallError::Network("connection reset".to_string()))
                    } else {
                        Ok(GeneratorReply::succeeded("recovered", 0.02, now))
                    }
                }
                _ => Ok(GeneratorReply::succeeded(
                    format!("{} on {}", task.model.model, task.document.id),
                    0.05,
                    now,
                )),
            }
        }
    }

    fn config(models: &[&str]) -> RunConfig {
        RunConfig::new(
            vec![SourceDocument::new("doc-1", "Explain tides")],
            models.iter().map(|m| ModelSpec::new("p", *m)).collect(),
            vec![JudgeSpec::new("judge", ModelSpec::new("p", "judge"))],
            vec![Criterion::new("clarity")],
        )
    }

    fn dispatcher(generator: Arc<dyn Generator>, store: Arc<dyn RunStore>) -> GenerationDispatcher {
        let engine = EngineConfig::new()
            .with_generation_max_attempts(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        GenerationDispatcher::new(generator, store, &engine)
    }

    #[test]
    fn test_plan_orders_tasks() {
        let run_id = Uuid::new_v4();
        let config = RunConfig::new(
            vec![SourceDocument::new("d1", "a"), SourceDocument::new("d2", "b")],
            vec![ModelSpec::new("p", "m1"), ModelSpec::new("p", "m2")],
            vec![],
            vec![],
        )
        .with_iterations(2);
        let tasks = GenerationDispatcher::plan(run_id, &config);
        assert_eq!(tasks.len(), 8);
        assert_eq!(tasks[0].candidate_id, "d1::p/m1::1");
        assert_eq!(tasks[1].candidate_id, "d1::p/m1::2");
        assert_eq!(tasks[2].candidate_id, "d1::p/m2::1");
        assert_eq!(tasks[7].candidate_id, "d2::p/m2::2");
        assert!(tasks.iter().enumerate().all(|(i, t)| t.seq == i as u64));
    }

    #[test]
    fn test_success_without_text_is_failed_empty() {
        let reply = GeneratorReply::succeeded("", 0.0, Utc::now());
        match classify_reply(&reply) {
            GenerationOutcome::FailedEmpty { reason } => {
                assert!(reason.contains("reported success"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let reply = GeneratorReply {
            error: None,
            ..GeneratorReply::failed("", 0.0, Utc::now())
        };
        assert_eq!(classify_reply(&reply).label(), "failed_empty");
    }

    #[tokio::test]
    async fn test_every_task_resolves_to_one_record() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let run_id = Uuid::new_v4();
        let recorder = TimelineRecorder::new(run_id, store.clone());
        let generator = Arc::new(ScriptedGenerator {
            calls: AtomicU32::new(0),
            down_calls: AtomicU32::new(0),
        });
        let dispatcher = dispatcher(generator.clone(), store.clone());
        let tasks =
            GenerationDispatcher::plan(run_id, &config(&["good", "blank", "broken", "down"]));

        let report = dispatcher
            .dispatch(tasks, 2, &recorder, &CancelSignal::never(), &ProgressCounters::new())
            .await
            .unwrap();

        assert_eq!(report.documents.len(), 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.progress.failed, 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 5);

        let labels: Vec<&str> = report.documents.iter().map(|d| d.outcome.label()).collect();
        assert_eq!(labels, vec!["succeeded", "failed_empty", "failed_error", "succeeded"]);
        assert_eq!(report.documents[3].attempts, 2);
        assert_eq!(
            report.candidates().iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["doc-1::p/good::1", "doc-1::p/down::1"]
        );

        assert_eq!(store.list_generated_documents(run_id).await.unwrap().len(), 4);
        let events = recorder.events().await.unwrap();
        assert_eq!(events.len(), 4);
        assert!(events
            .iter()
            .all(|e| e.event_type == TimelineEventType::TaskCompleted));
        assert_eq!(events.iter().filter(|e| !e.success).count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed_error() {
        struct Sleeper;

        #[async_trait]
        impl Generator for Sleeper {
            async fn generate(&self, _task: &GenerationTask) -> Result<GeneratorReply, CallError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(GeneratorReply::succeeded("late", 0.0, Utc::now()))
            }
        }

        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let run_id = Uuid::new_v4();
        let recorder = TimelineRecorder::new(run_id, store.clone());
        let engine = EngineConfig::new()
            .with_generation_timeout(Duration::from_millis(20))
            .with_generation_max_attempts(1);
        let dispatcher = GenerationDispatcher::new(Arc::new(Sleeper), store, &engine);

        let report = dispatcher
            .dispatch(
                GenerationDispatcher::plan(run_id, &config(&["slow"])),
                1,
                &recorder,
                &CancelSignal::never(),
                &ProgressCounters::new(),
            )
            .await
            .unwrap();

        match &report.documents[0].outcome {
            GenerationOutcome::FailedError { kind, .. } => assert_eq!(kind, "timeout"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_tasks_are_skipped() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let run_id = Uuid::new_v4();
        let recorder = TimelineRecorder::new(run_id, store.clone());
        let generator = Arc::new(ScriptedGenerator {
            calls: AtomicU32::new(0),
            down_calls: AtomicU32::new(0),
        });
        let dispatcher = dispatcher(generator.clone(), store);
        let handle = crate::orchestrator::CancelHandle::new();
        handle.cancel("operator");

        let report = dispatcher
            .dispatch(
                GenerationDispatcher::plan(run_id, &config(&["a", "b"])),
                1,
                &recorder,
                &handle.signal(),
                &ProgressCounters::new(),
            )
            .await
            .unwrap();

        assert!(report.documents.is_empty());
        assert_eq!(report.progress.skipped, 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        let events = recorder.events().await.unwrap();
        assert!(events
            .iter()
            .all(|e| e.event_type == TimelineEventType::TaskSkipped
                && e.description.contains("operator")));
    }
}
