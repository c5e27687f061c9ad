//! The run coordinator.
//!
//! One task owns all DAG state. It claims pending runs from the store,
//! expands matrices, dispatches ready jobs to the runner while the global
//! cap allows, and applies completions until each run terminates.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use zephyr_core::pipeline::{JobDef, MatrixSpec, PipelineDef};
use zephyr_core::{Status, matrix};
use zephyr_store::{RunRecord, Store};

use crate::bus::{BusEvent, LogBus};
use crate::dag::{JobDag, NodeStatus};
use crate::resolver::PipelineResolver;
use crate::runner::{JobOutcome, JobRequest, JobRunner};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global cap on concurrently running jobs.
    pub max_concurrent: usize,
    /// How often to poll the store queue when idle.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Live counters surfaced on the health endpoint.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub running: AtomicBool,
    pub active_jobs: AtomicUsize,
}

/// Control handle usable from the API while the scheduler runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<SchedulerStats>,
    max_concurrent: usize,
}

impl SchedulerHandle {
    pub fn cancel_run(&self, run_id: &str) {
        let _ = self.commands.send(Command::CancelRun(run_id.to_string()));
    }

    /// Nudge the scheduler to poll the queue now instead of on the next tick.
    pub fn wake(&self) {
        let _ = self.commands.send(Command::Wake);
    }

    pub fn is_running(&self) -> bool {
        self.stats.running.load(Ordering::Relaxed)
    }

    pub fn active_jobs(&self) -> usize {
        self.stats.active_jobs.load(Ordering::Relaxed)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

enum Command {
    CancelRun(String),
    Wake,
}

struct JobSlot {
    job_id: String,
    def: JobDef,
    /// Matrix group (base job name) this member belongs to, if any.
    group: Option<String>,
}

struct GroupSpec {
    fail_fast: bool,
    max_parallel: Option<usize>,
    members: Vec<String>,
}

struct ActiveRun {
    run_id: String,
    dag: JobDag,
    jobs: HashMap<String, JobSlot>,
    groups: HashMap<String, GroupSpec>,
    env: HashMap<String, String>,
    secrets: HashMap<String, String>,
    cancel: CancellationToken,
}

struct Completion {
    run_id: String,
    node: String,
    outcome: JobOutcome,
}

/// The coordinator. Consumed by [`Scheduler::run`].
pub struct Scheduler {
    store: Store,
    bus: LogBus,
    resolver: Arc<dyn PipelineResolver>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        bus: LogBus,
        resolver: Arc<dyn PipelineResolver>,
        runner: Arc<dyn JobRunner>,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SchedulerStats::default());
        let handle = SchedulerHandle {
            commands: tx,
            stats: stats.clone(),
            max_concurrent: config.max_concurrent,
        };
        (
            Self {
                store,
                bus,
                resolver,
                runner,
                config,
                stats,
                commands: rx,
            },
            handle,
        )
    }

    /// Run until `shutdown` fires. On shutdown every in-flight run is
    /// cancelled and the loop drains remaining completions before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(max_concurrent = self.config.max_concurrent, "scheduler started");
        self.stats.running.store(true, Ordering::Relaxed);

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut active: Vec<ActiveRun> = Vec::new();
        let mut inflight = 0usize;

        loop {
            self.admit_and_dispatch(&mut active, &mut inflight, &done_tx).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => match command {
                    Command::CancelRun(run_id) => {
                        self.handle_cancel(&mut active, &run_id).await;
                    }
                    Command::Wake => {}
                },
                Some(done) = done_rx.recv() => {
                    inflight -= 1;
                    self.stats.active_jobs.store(inflight, Ordering::Relaxed);
                    self.handle_completion(&mut active, done).await;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("scheduler shutting down, cancelling in-flight runs");
        for run in &mut active {
            Self::cancel_active_run(&self.store, &self.bus, run).await;
        }
        while inflight > 0 {
            if let Some(done) = done_rx.recv().await {
                inflight -= 1;
                self.stats.active_jobs.store(inflight, Ordering::Relaxed);
                self.handle_completion(&mut active, done).await;
            } else {
                break;
            }
        }
        self.stats.running.store(false, Ordering::Relaxed);
        info!("scheduler stopped");
    }

    /// Fill free worker slots: first from runs already in flight (FIFO by
    /// pickup), then by claiming new pending runs from the store.
    async fn admit_and_dispatch(
        &self,
        active: &mut Vec<ActiveRun>,
        inflight: &mut usize,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) {
        loop {
            self.dispatch_ready(active, inflight, done_tx).await;
            if *inflight >= self.config.max_concurrent {
                return;
            }

            match self.store.next_pending_run().await {
                Ok(Some(run)) => {
                    if let Some(initialized) = self.init_run(run).await {
                        active.push(initialized);
                        // Loop back to dispatch the new run's roots.
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "failed to poll run queue");
                    return;
                }
            }
        }
    }

    async fn dispatch_ready(
        &self,
        active: &mut Vec<ActiveRun>,
        inflight: &mut usize,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) {
        for run in active.iter_mut() {
            for node in run.dag.ready() {
                if *inflight >= self.config.max_concurrent {
                    return;
                }
                if !group_has_capacity(run, &node) {
                    continue;
                }
                let Some(slot) = run.jobs.get(&node) else {
                    continue;
                };

                if let Err(e) = run.dag.mark_running(&node) {
                    error!(node = %node, error = %e, "dispatch raced node state");
                    continue;
                }
                if let Err(e) = self
                    .store
                    .update_job_status(&slot.job_id, Status::Running, Some(Utc::now()), None, None, None)
                    .await
                {
                    warn!(job_id = %slot.job_id, error = %e, "failed to persist dispatch");
                }
                self.bus.publish(BusEvent::JobUpdate {
                    run_id: run.run_id.clone(),
                    job_id: slot.job_id.clone(),
                    status: Status::Running,
                });

                let request = JobRequest {
                    job_id: slot.job_id.clone(),
                    run_id: run.run_id.clone(),
                    def: slot.def.clone(),
                    env: run.env.clone(),
                    secrets: run.secrets.clone(),
                    workspace_files: Vec::new(),
                    cancel: run.cancel.clone(),
                };
                *inflight += 1;
                self.stats.active_jobs.store(*inflight, Ordering::Relaxed);

                let runner = self.runner.clone();
                let done_tx = done_tx.clone();
                let run_id = run.run_id.clone();
                tokio::spawn(async move {
                    let outcome = runner.run_job(request).await;
                    let _ = done_tx.send(Completion {
                        run_id,
                        node,
                        outcome,
                    });
                });
            }
        }
    }

    /// Claim-time initialization: resolve the pipeline, expand matrices,
    /// persist job and step rows, build the DAG and mark the run running.
    async fn init_run(&self, run: RunRecord) -> Option<ActiveRun> {
        let project = match self.store.get_project(&run.project_id).await {
            Ok(project) => project,
            Err(e) => {
                self.fail_run_at_init(&run.id, &format!("project lookup failed: {e}")).await;
                return None;
            }
        };
        let pipeline = match self.resolver.resolve(&project, &run).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.fail_run_at_init(&run.id, &e.to_string()).await;
                return None;
            }
        };

        let expanded = match expand_pipeline(&pipeline) {
            Ok(expanded) => expanded,
            Err(e) => {
                self.fail_run_at_init(&run.id, &e.to_string()).await;
                return None;
            }
        };

        let dag_nodes: Vec<(String, Vec<String>)> = expanded
            .iter()
            .map(|member| (member.def.name.clone(), member.resolved_deps.clone()))
            .collect();
        let mut dag = match JobDag::build(dag_nodes) {
            Ok(dag) => dag,
            Err(e) => {
                self.fail_run_at_init(&run.id, &e.to_string()).await;
                return None;
            }
        };

        let mut jobs = HashMap::new();
        let mut groups: HashMap<String, GroupSpec> = HashMap::new();
        for member in &expanded {
            let record = match self
                .store
                .create_job(&run.id, &member.def.name, &member.def.runner.image)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    self.fail_run_at_init(&run.id, &format!("persisting jobs failed: {e}")).await;
                    return None;
                }
            };
            for (order, step) in member.def.steps.iter().enumerate() {
                if let Err(e) = self.store.create_step(&record.id, &step.name, order as i64).await {
                    self.fail_run_at_init(&run.id, &format!("persisting steps failed: {e}")).await;
                    return None;
                }
            }

            if let Some(matrix) = &member.matrix {
                groups
                    .entry(member.base.clone())
                    .or_insert_with(|| GroupSpec {
                        fail_fast: matrix.fail_fast,
                        max_parallel: matrix.max_parallel,
                        members: Vec::new(),
                    })
                    .members
                    .push(member.def.name.clone());
            }
            jobs.insert(
                member.def.name.clone(),
                JobSlot {
                    job_id: record.id,
                    def: member.def.clone(),
                    group: member.matrix.is_some().then(|| member.base.clone()),
                },
            );
        }

        // Jobs whose resolved condition is false never run; their dependents
        // are skipped with them.
        for member in &expanded {
            if member.def.condition == Some(false) {
                let mut affected = dag.mark_skipped(&member.def.name);
                affected.push(member.def.name.clone());
                for name in affected {
                    if let Some(slot) = jobs.get(&name) {
                        self.persist_terminal_job(&run.id, &slot.job_id, Status::Skipped, None, None)
                            .await;
                    }
                }
            }
        }

        let secrets = self
            .store
            .secrets_for_project(&run.project_id)
            .await
            .unwrap_or_default();

        if let Err(e) = self
            .store
            .update_run_status(&run.id, Status::Running, Some(Utc::now()), None)
            .await
        {
            warn!(run_id = %run.id, error = %e, "failed to mark run running");
        }
        self.bus.publish(BusEvent::RunUpdate {
            run_id: run.id.clone(),
            status: Status::Running,
        });
        info!(run_id = %run.id, pipeline = %pipeline.name, jobs = jobs.len(), "run initialized");

        let mut initialized = ActiveRun {
            run_id: run.id.clone(),
            dag,
            jobs,
            groups,
            env: pipeline.env.clone(),
            secrets,
            cancel: CancellationToken::new(),
        };
        if initialized.dag.is_complete() {
            self.finalize_run(&mut initialized).await;
            return None;
        }
        Some(initialized)
    }

    async fn handle_completion(&self, active: &mut Vec<ActiveRun>, done: Completion) {
        let Some(index) = active.iter().position(|r| r.run_id == done.run_id) else {
            return;
        };
        let run = &mut active[index];
        let Some(slot) = run.jobs.get(&done.node) else {
            return;
        };
        let job_id = slot.job_id.clone();
        let group = slot.group.clone();

        self.persist_terminal_job(
            &run.run_id,
            &job_id,
            done.outcome.status,
            done.outcome.exit_code,
            done.outcome.error.as_deref(),
        )
        .await;

        let effects = match done.outcome.status {
            Status::Cancelled => {
                run.dag.mark_cancelled(&done.node);
                Default::default()
            }
            status => run.dag.mark_completed(&done.node, status == Status::Success),
        };
        for name in &effects.newly_skipped {
            if let Some(skipped) = run.jobs.get(name) {
                self.persist_terminal_job(&run.run_id, &skipped.job_id, Status::Skipped, None, None)
                    .await;
            }
        }

        if done.outcome.status == Status::Failure {
            if let Some(base) = group {
                self.apply_fail_fast(run, &base).await;
            }
        }

        if run.dag.is_complete() {
            let mut finished = active.remove(index);
            self.finalize_run(&mut finished).await;
        }
    }

    /// Fail-fast: cancel members of the same matrix group that have not been
    /// handed to an executor. Running members are left to finish.
    async fn apply_fail_fast(&self, run: &mut ActiveRun, base: &str) {
        let Some(group) = run.groups.get(base) else {
            return;
        };
        if !group.fail_fast {
            return;
        }
        let members = group.members.clone();
        for member in members {
            if matches!(
                run.dag.status(&member),
                Some(NodeStatus::Pending) | Some(NodeStatus::Ready)
            ) {
                run.dag.mark_cancelled(&member);
                if let Some(slot) = run.jobs.get(&member) {
                    self.persist_terminal_job(&run.run_id, &slot.job_id, Status::Cancelled, None, None)
                        .await;
                }
            }
        }
    }

    async fn handle_cancel(&self, active: &mut Vec<ActiveRun>, run_id: &str) {
        let Some(index) = active.iter().position(|r| r.run_id == run_id) else {
            // Not in flight; cancel it in the queue if it is still there.
            if let Err(e) = self
                .store
                .update_run_status(run_id, Status::Cancelled, None, Some(Utc::now()))
                .await
            {
                warn!(run_id = %run_id, error = %e, "queue cancel failed");
            }
            return;
        };
        info!(run_id = %run_id, "cancelling run");
        Self::cancel_active_run(&self.store, &self.bus, &mut active[index]).await;
        if active[index].dag.is_complete() {
            let mut finished = active.remove(index);
            self.finalize_run(&mut finished).await;
        }
    }

    async fn cancel_active_run(store: &Store, bus: &LogBus, run: &mut ActiveRun) {
        run.cancel.cancel();
        for node in run.dag.cancel_all() {
            if let Some(slot) = run.jobs.get(&node) {
                if let Err(e) = store
                    .update_job_status(&slot.job_id, Status::Cancelled, None, Some(Utc::now()), None, None)
                    .await
                {
                    warn!(job_id = %slot.job_id, error = %e, "cancel persist failed");
                }
                if let Err(e) = store.mark_steps_for_job(&slot.job_id, Status::Cancelled).await {
                    warn!(job_id = %slot.job_id, error = %e, "step cancel persist failed");
                }
                bus.publish(BusEvent::JobUpdate {
                    run_id: run.run_id.clone(),
                    job_id: slot.job_id.clone(),
                    status: Status::Cancelled,
                });
            }
        }
    }

    async fn finalize_run(&self, run: &mut ActiveRun) {
        let status = if run.dag.has_status(NodeStatus::Failure) {
            Status::Failure
        } else if run.dag.has_status(NodeStatus::Cancelled) {
            Status::Cancelled
        } else {
            Status::Success
        };
        if let Err(e) = self
            .store
            .update_run_status(&run.run_id, status, None, Some(Utc::now()))
            .await
        {
            warn!(run_id = %run.run_id, error = %e, "failed to finalize run");
        }
        self.bus.publish(BusEvent::RunUpdate {
            run_id: run.run_id.clone(),
            status,
        });
        info!(run_id = %run.run_id, status = %status, "run finished");
    }

    async fn fail_run_at_init(&self, run_id: &str, reason: &str) {
        error!(run_id = %run_id, reason, "run failed during initialization");
        let now = Utc::now();
        if let Err(e) = self
            .store
            .update_run_status(run_id, Status::Failure, Some(now), Some(now))
            .await
        {
            warn!(run_id = %run_id, error = %e, "failed to persist init failure");
        }
        self.bus.publish(BusEvent::RunUpdate {
            run_id: run_id.to_string(),
            status: Status::Failure,
        });
    }

    async fn persist_terminal_job(
        &self,
        run_id: &str,
        job_id: &str,
        status: Status,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .update_job_status(job_id, status, None, Some(Utc::now()), exit_code, error)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to persist job status");
        }
        if matches!(status, Status::Skipped | Status::Cancelled) {
            if let Err(e) = self.store.mark_steps_for_job(job_id, status).await {
                warn!(job_id = %job_id, error = %e, "failed to persist step statuses");
            }
        }
        self.bus.publish(BusEvent::JobUpdate {
            run_id: run_id.to_string(),
            job_id: job_id.to_string(),
            status,
        });
    }
}

fn group_has_capacity(run: &ActiveRun, node: &str) -> bool {
    let Some(slot) = run.jobs.get(node) else {
        return false;
    };
    let Some(base) = &slot.group else {
        return true;
    };
    let Some(group) = run.groups.get(base) else {
        return true;
    };
    let Some(max_parallel) = group.max_parallel else {
        return true;
    };
    let running = group
        .members
        .iter()
        .filter(|member| run.dag.status(member) == Some(NodeStatus::Running))
        .count();
    running < max_parallel
}

/// One matrix-expanded member with its rewritten dependencies.
struct ExpandedMember {
    def: JobDef,
    base: String,
    matrix: Option<MatrixSpec>,
    resolved_deps: Vec<String>,
}

/// Expand every job and rewrite `depends_on` so a dependency on a matrix
/// job's base name points at all of its members.
fn expand_pipeline(pipeline: &PipelineDef) -> zephyr_core::Result<Vec<ExpandedMember>> {
    let mut members = Vec::new();
    for job in &pipeline.jobs {
        for expanded in matrix::expand(job)? {
            members.push(ExpandedMember {
                def: expanded.def,
                base: expanded.base,
                matrix: job.matrix.clone(),
                resolved_deps: Vec::new(),
            });
        }
    }

    let mut base_to_members: HashMap<&str, Vec<String>> = HashMap::new();
    for member in &members {
        base_to_members
            .entry(member.base.as_str())
            .or_default()
            .push(member.def.name.clone());
    }

    let mut resolved: Vec<Vec<String>> = Vec::with_capacity(members.len());
    for member in &members {
        let mut deps = Vec::new();
        for dep in &member.def.depends_on {
            match base_to_members.get(dep.as_str()) {
                Some(names) => deps.extend(names.iter().cloned()),
                // Points at a concrete member name (or a typo the DAG
                // validation will reject).
                None => deps.push(dep.clone()),
            }
        }
        resolved.push(deps);
    }
    for (member, deps) in members.iter_mut().zip(resolved) {
        member.resolved_deps = deps;
    }
    Ok(members)
}
