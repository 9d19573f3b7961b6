pub mod executor;
pub mod plan;
pub mod run;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, Semaphore, watch};

use crate::context::Context;
use crate::model::{self, ProjectSpec, ProvisionedResource};

pub use run::{ActionStatus, ReconciliationRun, RunStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejections raised before a run starts. A run that started always comes
/// back as a [`ReconciliationRun`] carrying its own outcome.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A second concurrent request for the same project is rejected, never
    /// interleaved.
    #[error("a run for project '{0}' is already in flight")]
    Busy(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("spec targets cluster '{spec}', this orchestrator manages '{managed}'")]
    ClusterMismatch { spec: String, managed: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-project state the engine remembers between runs.
#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    pub last_run: Option<ReconciliationRun>,
    /// Spec of the last run that reached Succeeded; diff baseline.
    pub last_applied: Option<ProjectSpec>,
    pub last_applied_hash: Option<String>,
    pub resources: Vec<ProvisionedResource>,
    /// Rendered sealed env per deployment, keyed by the template that
    /// produced it; reused while the template is unchanged.
    pub sealed_user_env: BTreeMap<String, (BTreeMap<String, String>, BTreeMap<String, String>)>,
}

struct Inner {
    ctx: Arc<Context>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    workers: Semaphore,
    registry: RwLock<HashMap<String, ProjectState>>,
    shutdown: watch::Receiver<bool>,
}

/// The reconciliation engine handle. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<Context>, shutdown: watch::Receiver<bool>) -> Self {
        let workers = Semaphore::new(ctx.config.max_concurrent_runs.max(1));
        Self {
            inner: Arc::new(Inner {
                ctx,
                locks: DashMap::new(),
                workers,
                registry: RwLock::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    fn lock_for(&self, project: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(project.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn refuse_if_stopping(&self) -> Result<(), EngineError> {
        if *self.inner.shutdown.borrow() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Plan and execute a reconciliation for `spec`.
    ///
    /// At most one run per project is in flight; a concurrent call returns
    /// [`EngineError::Busy`]. Reconciling an unchanged spec is a no-op run
    /// with zero connector side effects and no commit.
    #[tracing::instrument(skip(self, spec), fields(project = %spec.name), err)]
    pub async fn reconcile(&self, spec: ProjectSpec) -> Result<ReconciliationRun, EngineError> {
        self.refuse_if_stopping()?;
        model::validate(&spec).map_err(EngineError::Validation)?;
        if spec.cluster != self.inner.ctx.config.cluster {
            return Err(EngineError::ClusterMismatch {
                spec: spec.cluster,
                managed: self.inner.ctx.config.cluster.clone(),
            });
        }

        let lock = self.lock_for(&spec.name);
        let Ok(_guard) = lock.try_lock() else {
            return Err(EngineError::Busy(spec.name));
        };
        let _permit = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;

        let hash = spec.content_hash();
        let mut state = self
            .inner
            .registry
            .read()
            .await
            .get(&spec.name)
            .cloned()
            .unwrap_or_default();

        // Idempotency: an unchanged spec converges without touching anything.
        if state.last_applied_hash.as_deref() == Some(hash.as_str()) {
            tracing::info!(project = %spec.name, "spec unchanged, no-op run");
            let mut run = ReconciliationRun::new(&spec.name, &hash);
            run.set_plan(plan::build_plan(
                &spec,
                &model::SpecDiff::default(),
                &state.resources,
            ));
            run.skip_remaining();
            run.finish(RunStatus::Succeeded);
            self.store_run(&spec.name, state, run.clone(), None).await;
            return Ok(run);
        }

        let run = executor::execute_reconcile(&self.inner.ctx, &spec, &mut state).await;

        let applied = (run.status == RunStatus::Succeeded).then(|| (spec.clone(), hash));
        self.store_run(&spec.name, state, run.clone(), applied).await;

        tracing::info!(
            project = %spec.name,
            run = %run.id,
            status = ?run.status,
            "reconciliation finished"
        );
        Ok(run)
    }

    /// Tear down everything provisioned for a project, children first.
    /// Absence of anything along the way is success.
    #[tracing::instrument(skip(self), fields(%project), err)]
    pub async fn delete(&self, project: &str) -> Result<ReconciliationRun, EngineError> {
        self.refuse_if_stopping()?;

        let lock = self.lock_for(project);
        let Ok(_guard) = lock.try_lock() else {
            return Err(EngineError::Busy(project.to_owned()));
        };
        let _permit = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;

        let mut state = self
            .inner
            .registry
            .read()
            .await
            .get(project)
            .cloned()
            .unwrap_or_default();

        let run = executor::execute_delete(&self.inner.ctx, project, &mut state).await;

        {
            let mut registry = self.inner.registry.write().await;
            let entry = registry.entry(project.to_owned()).or_default();
            if run.status == RunStatus::Succeeded {
                // Keep only the run outcome; the project itself is gone.
                *entry = ProjectState {
                    last_run: Some(run.clone()),
                    ..ProjectState::default()
                };
            } else {
                entry.resources = state.resources;
                entry.last_run = Some(run.clone());
            }
        }

        tracing::info!(%project, run = %run.id, status = ?run.status, "deletion finished");
        Ok(run)
    }

    /// Outcome of the last run for a project, if any.
    pub async fn status(&self, project: &str) -> Option<ReconciliationRun> {
        self.inner
            .registry
            .read()
            .await
            .get(project)
            .and_then(|state| state.last_run.clone())
    }

    async fn store_run(
        &self,
        project: &str,
        state: ProjectState,
        run: ReconciliationRun,
        applied: Option<(ProjectSpec, String)>,
    ) {
        let mut registry = self.inner.registry.write().await;
        let entry = registry.entry(project.to_owned()).or_default();
        entry.resources = state.resources;
        entry.sealed_user_env = state.sealed_user_env;
        entry.last_run = Some(run);
        if let Some((spec, hash)) = applied {
            entry.last_applied = Some(spec);
            entry.last_applied_hash = Some(hash);
        } else {
            entry.last_applied = state.last_applied;
            entry.last_applied_hash = state.last_applied_hash;
        }
    }
}
