//! Durable execution engine.
//!
//! A workflow is an async body that runs named steps through a
//! [`WorkflowContext`]. Each finished step's output is checkpointed in
//! the state store before the next step starts, so a workflow that is
//! executed again after a crash skips the steps it already did and
//! replays their recorded outputs.
//!
//! Workflow IDs are chosen by the caller and follow a reject-duplicate
//! policy: an ID that is executing in this process, or whose record
//! already finished, is refused with [`EngineError::DuplicateWorkflow`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use fleet_state::{CompletedStep, StateStore, WorkflowRecord, WorkflowStatus, epoch_secs};

use crate::error::{EngineError, EngineResult, StepError};

/// Retry and deadline policy for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    /// Attempts before the step fails (at least 1).
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub initial_backoff: Duration,
    /// Upper bound on a single attempt.
    pub max_duration: Duration,
}

impl StepOptions {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            max_duration,
        }
    }

    pub fn with_retries(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(multiplier)
    }
}

/// Runs workflows and keeps their checkpoints.
#[derive(Clone)]
pub struct ExecutionEngine {
    store: StateStore,
    running: Arc<Mutex<HashSet<String>>>,
}

impl ExecutionEngine {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Execute a top-level workflow.
    ///
    /// A record left Running by an earlier process is resumed from its
    /// last checkpoint; `params` are only stored for a fresh workflow.
    pub async fn execute<P, T, F, Fut>(
        &self,
        workflow_id: &str,
        kind: &str,
        params: &P,
        body: F,
    ) -> EngineResult<T>
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.run(workflow_id, kind, params, None, body).await
    }

    /// Workflow record by ID.
    pub fn get(&self, workflow_id: &str) -> EngineResult<Option<WorkflowRecord>> {
        Ok(self.store.get_workflow(workflow_id)?)
    }

    /// Top-level workflows of `kind` still marked Running.
    ///
    /// After a restart these are the executions to resume. Child
    /// executions are left to their parent.
    pub fn incomplete(&self, kind: &str) -> EngineResult<Vec<WorkflowRecord>> {
        Ok(self
            .store
            .list_workflows()?
            .into_iter()
            .filter(|r| {
                r.kind == kind && r.status == WorkflowStatus::Running && r.parent_id.is_none()
            })
            .collect())
    }

    /// Whether the workflow is executing in this process.
    pub fn is_running(&self, workflow_id: &str) -> bool {
        lock(&self.running).contains(workflow_id)
    }

    async fn run<P, T, F, Fut>(
        &self,
        workflow_id: &str,
        kind: &str,
        params: &P,
        parent_id: Option<&str>,
        body: F,
    ) -> EngineResult<T>
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let _claim = Claim::acquire(&self.running, workflow_id)?;

        let now = epoch_secs();
        let fresh = WorkflowRecord {
            id: workflow_id.to_string(),
            kind: kind.to_string(),
            params: serde_json::to_value(params)?,
            status: WorkflowStatus::Running,
            parent_id: parent_id.map(str::to_string),
            completed_steps: Vec::new(),
            output: None,
            last_error: None,
            started_at: now,
            updated_at: now,
        };
        let record = match self.store.create_workflow(&fresh)? {
            None => {
                info!(%workflow_id, kind, "workflow started");
                fresh
            }
            Some(existing) if existing.status == WorkflowStatus::Running => {
                info!(
                    %workflow_id,
                    kind = %existing.kind,
                    completed_steps = existing.completed_steps.len(),
                    "workflow resumed"
                );
                existing
            }
            Some(_) => return Err(EngineError::DuplicateWorkflow(workflow_id.to_string())),
        };

        let ctx = WorkflowContext {
            engine: self.clone(),
            record: Arc::new(Mutex::new(record)),
        };
        let result = body(ctx.clone()).await;

        let mut finished = ctx.snapshot();
        finished.updated_at = epoch_secs();
        match &result {
            Ok(output) => {
                finished.status = WorkflowStatus::Completed;
                finished.output = Some(serde_json::to_value(output)?);
                info!(%workflow_id, steps = finished.completed_steps.len(), "workflow completed");
            }
            Err(e) => {
                finished.status = WorkflowStatus::Failed;
                finished.last_error = Some(e.to_string());
                warn!(%workflow_id, error = %e, "workflow failed");
            }
        }
        self.store.put_workflow(&finished)?;
        result
    }
}

/// Handle a workflow body uses to run steps and child workflows.
#[derive(Clone)]
pub struct WorkflowContext {
    engine: ExecutionEngine,
    record: Arc<Mutex<WorkflowRecord>>,
}

impl WorkflowContext {
    pub fn workflow_id(&self) -> String {
        lock(&self.record).id.clone()
    }

    /// Run a step with at-least-once semantics.
    ///
    /// A step that already completed in an earlier run is not executed
    /// again; its recorded output is returned instead. Retryable
    /// failures and timed-out attempts are retried with exponential
    /// backoff until `max_attempts` is reached.
    pub async fn step<T, F, Fut>(
        &self,
        name: &str,
        options: &StepOptions,
        mut f: F,
    ) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let (workflow_id, replay) = {
            let record = lock(&self.record);
            (record.id.clone(), record.step_output(name).cloned())
        };
        if let Some(output) = replay {
            debug!(%workflow_id, step = name, "step replayed from checkpoint");
            return Ok(serde_json::from_value(output)?);
        }

        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(%workflow_id, step = name, attempt, "step attempt");
            let failure = match tokio::time::timeout(options.max_duration, f()).await {
                Ok(Ok(output)) => {
                    self.checkpoint(name, &output)?;
                    debug!(%workflow_id, step = name, attempt, "step completed");
                    return Ok(output);
                }
                Ok(Err(StepError::Fatal(message))) => {
                    return Err(EngineError::StepFailed {
                        workflow_id,
                        step: name.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
                Ok(Err(StepError::Retryable(message))) => {
                    if attempt >= max_attempts {
                        return Err(EngineError::StepFailed {
                            workflow_id,
                            step: name.to_string(),
                            attempts: attempt,
                            message,
                        });
                    }
                    message
                }
                Err(_elapsed) => {
                    if attempt >= max_attempts {
                        return Err(EngineError::StepTimedOut {
                            workflow_id,
                            step: name.to_string(),
                            after: options.max_duration,
                        });
                    }
                    format!("attempt timed out after {:?}", options.max_duration)
                }
            };

            let delay = options.backoff(attempt);
            warn!(
                %workflow_id,
                step = name,
                attempt,
                error = %failure,
                retry_in = ?delay,
                "step failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run a nested workflow with its own ID.
    ///
    /// A child that already finished replays its recorded outcome, so a
    /// resumed parent observes the same result as the original run.
    pub async fn child<P, T, F, Fut>(
        &self,
        workflow_id: &str,
        kind: &str,
        params: &P,
        body: F,
    ) -> EngineResult<T>
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if let Some(existing) = self.engine.get(workflow_id)? {
            match existing.status {
                WorkflowStatus::Completed => {
                    debug!(%workflow_id, "child workflow replayed from record");
                    let output = existing.output.unwrap_or(serde_json::Value::Null);
                    return Ok(serde_json::from_value(output)?);
                }
                WorkflowStatus::Failed => {
                    return Err(EngineError::WorkflowFailed {
                        workflow_id: workflow_id.to_string(),
                        message: existing.last_error.unwrap_or_default(),
                    });
                }
                WorkflowStatus::Running => {}
            }
        }
        let parent_id = self.workflow_id();
        self.engine
            .run(workflow_id, kind, params, Some(&parent_id), body)
            .await
    }

    /// Current copy of the workflow record.
    pub fn snapshot(&self) -> WorkflowRecord {
        lock(&self.record).clone()
    }

    fn checkpoint<T: Serialize>(&self, name: &str, output: &T) -> EngineResult<()> {
        let value = serde_json::to_value(output)?;
        let record = {
            let mut record = lock(&self.record);
            record.completed_steps.push(CompletedStep {
                name: name.to_string(),
                output: value,
            });
            record.updated_at = epoch_secs();
            record.clone()
        };
        self.engine.store.put_workflow(&record)?;
        Ok(())
    }
}

/// In-process claim on a workflow ID, released on drop.
struct Claim {
    running: Arc<Mutex<HashSet<String>>>,
    workflow_id: String,
}

impl Claim {
    fn acquire(running: &Arc<Mutex<HashSet<String>>>, workflow_id: &str) -> EngineResult<Self> {
        if !lock(running).insert(workflow_id.to_string()) {
            return Err(EngineError::DuplicateWorkflow(workflow_id.to_string()));
        }
        Ok(Self {
            running: Arc::clone(running),
            workflow_id: workflow_id.to_string(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.workflow_id);
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(StateStore::open_in_memory().unwrap())
    }

    fn quick() -> StepOptions {
        StepOptions::new(Duration::from_secs(5)).with_retries(3, Duration::from_millis(1))
    }

    #[test]
    fn backoff_doubles() {
        let options =
            StepOptions::new(Duration::from_secs(1)).with_retries(5, Duration::from_millis(100));
        assert_eq!(options.backoff(1), Duration::from_millis(100));
        assert_eq!(options.backoff(2), Duration::from_millis(200));
        assert_eq!(options.backoff(3), Duration::from_millis(400));
        let floor = StepOptions::new(Duration::from_secs(1)).with_retries(0, Duration::ZERO);
        assert_eq!(floor.max_attempts, 1);
    }

    #[tokio::test]
    async fn steps_are_checkpointed_and_workflow_completes() {
        let engine = engine();
        let output: u32 = engine
            .execute("wf-1", "test", &"params", |ctx| async move {
                let a: u32 = ctx.step("a", &quick(), || async { Ok(20) }).await?;
                let b: u32 = ctx.step("b", &quick(), || async { Ok(22) }).await?;
                Ok(a + b)
            })
            .await
            .unwrap();
        assert_eq!(output, 42);

        let record = engine.get("wf-1").unwrap().unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.params, serde_json::json!("params"));
        assert_eq!(record.step_output("a"), Some(&serde_json::json!(20)));
        assert_eq!(record.output, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn finished_workflow_ids_are_rejected() {
        let engine = engine();
        engine
            .execute("wf-1", "test", &(), |_| async { Ok(()) })
            .await
            .unwrap();
        let err = engine
            .execute("wf-1", "test", &(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateWorkflow(_)));
    }

    #[tokio::test]
    async fn concurrent_duplicate_is_rejected() {
        let engine = engine();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute("wf-1", "test", &(), |_| async move {
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        while !engine.is_running("wf-1") {
            tokio::task::yield_now().await;
        }

        let err = engine
            .execute("wf-1", "test", &(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateWorkflow(_)));

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert!(!engine.is_running("wf-1"));
    }

    #[tokio::test]
    async fn retryable_failures_are_retried() {
        let engine = engine();
        let calls = AtomicU32::new(0);
        let value: u32 = engine
            .execute("wf-1", "test", &(), |ctx| {
                let calls = &calls;
                async move {
                    ctx.step("flaky", &quick(), move || async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(StepError::retryable("not yet"))
                        } else {
                            Ok(7)
                        }
                    })
                    .await
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let engine = engine();
        let calls = AtomicU32::new(0);
        let err = engine
            .execute("wf-1", "test", &(), |ctx| {
                let calls = &calls;
                async move {
                    ctx.step("broken", &quick(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(StepError::retryable("still broken"))
                    })
                    .await
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let record = engine.get("wf-1").unwrap().unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
        assert!(record.last_error.unwrap().contains("still broken"));
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let engine = engine();
        let calls = AtomicU32::new(0);
        let err = engine
            .execute("wf-1", "test", &(), |ctx| {
                let calls = &calls;
                async move {
                    ctx.step("bad", &quick(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(StepError::fatal("bad request"))
                    })
                    .await
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded_by_max_duration() {
        let engine = engine();
        let options = StepOptions::new(Duration::from_millis(10));
        let err = engine
            .execute("wf-1", "test", &(), |ctx| async move {
                ctx.step("slow", &options, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepTimedOut { .. }));
    }

    #[tokio::test]
    async fn running_record_resumes_from_checkpoint() {
        let store = StateStore::open_in_memory().unwrap();
        let engine = ExecutionEngine::new(store.clone());

        // A crashed run left one completed step behind.
        store
            .put_workflow(&WorkflowRecord {
                id: "wf-1".into(),
                kind: "test".into(),
                params: serde_json::json!({ "n": 1 }),
                status: WorkflowStatus::Running,
                parent_id: None,
                completed_steps: vec![CompletedStep {
                    name: "first".into(),
                    output: serde_json::json!("done before crash"),
                }],
                output: None,
                last_error: None,
                started_at: 1,
                updated_at: 1,
            })
            .unwrap();
        assert_eq!(engine.incomplete("test").unwrap().len(), 1);
        assert!(engine.incomplete("other").unwrap().is_empty());

        let first_calls = AtomicU32::new(0);
        let output: String = engine
            .execute("wf-1", "test", &serde_json::json!({ "n": 2 }), |ctx| {
                let first_calls = &first_calls;
                async move {
                    let first: String = ctx
                        .step("first", &quick(), move || async move {
                            first_calls.fetch_add(1, Ordering::SeqCst);
                            Ok("rerun".to_string())
                        })
                        .await?;
                    let second: String = ctx
                        .step("second", &quick(), || async { Ok("fresh".to_string()) })
                        .await?;
                    Ok(format!("{first}/{second}"))
                }
            })
            .await
            .unwrap();

        assert_eq!(output, "done before crash/fresh");
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        let record = engine.get("wf-1").unwrap().unwrap();
        assert_eq!(record.params, serde_json::json!({ "n": 1 }));
        assert_eq!(record.completed_steps.len(), 2);
        assert!(engine.incomplete("test").unwrap().is_empty());
    }

    #[tokio::test]
    async fn children_run_once_and_replay() {
        let engine = engine();
        let runs = AtomicU32::new(0);
        let total: u32 = engine
            .execute("parent", "test", &(), |ctx| {
                let runs = &runs;
                async move {
                    let mut total = 0;
                    for _ in 0..2 {
                        let value: u32 = ctx
                            .child("parent/child", "child", &(), |child| async move {
                                runs.fetch_add(1, Ordering::SeqCst);
                                child.step("work", &quick(), || async { Ok(5) }).await
                            })
                            .await?;
                        total += value;
                    }
                    Ok(total)
                }
            })
            .await
            .unwrap();

        assert_eq!(total, 10);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let child = engine.get("parent/child").unwrap().unwrap();
        assert_eq!(child.parent_id.as_deref(), Some("parent"));
        assert_eq!(child.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn failed_child_replays_its_error() {
        let engine = engine();
        let err = engine
            .execute("parent", "test", &(), |ctx| async move {
                let first: EngineResult<()> = ctx
                    .child("parent/child", "child", &(), |_| async {
                        Err(EngineError::WorkflowFailed {
                            workflow_id: "parent/child".into(),
                            message: "boom".into(),
                        })
                    })
                    .await;
                assert!(first.is_err());
                ctx.child("parent/child", "child", &(), |_| async { Ok(()) })
                    .await
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::WorkflowFailed { ref message, .. } if message.contains("boom")
        ));
    }
}
