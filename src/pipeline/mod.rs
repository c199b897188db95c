// src/pipeline/mod.rs
//
// Transform then load, joined by one dependency edge. A run walks the
// RunState machine and never starts the load unless the transform finished.

use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument};

use crate::{
    error::{ConfigError, PipelineError},
    load::{LoadSummary, LoadTask},
    schedule::Schedule,
    transform::{TransformOutput, TransformStep},
};

pub mod state;

pub use state::{RunState, RunTracker, StateChange};

/// Identity of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    /// Start of the interval this run covers.
    pub logical_date: DateTime<Utc>,
}

impl RunContext {
    pub fn manual(now: DateTime<Utc>) -> Self {
        Self {
            run_id: format!("manual__{}", now.to_rfc3339()),
            logical_date: now,
        }
    }

    pub fn scheduled(logical_date: DateTime<Utc>) -> Self {
        Self {
            run_id: format!("scheduled__{}", logical_date.to_rfc3339()),
            logical_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub upstream: String,
    pub downstream: String,
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >> {}", self.upstream, self.downstream)
    }
}

/// Outcome of one run. A run either fully succeeds or ends `Failed` with the cause.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub logical_date: DateTime<Utc>,
    pub history: Vec<StateChange>,
    pub transform: Option<TransformOutput>,
    pub load: Option<LoadSummary>,
    pub failure: Option<PipelineError>,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.history
            .last()
            .map(|c| c.state)
            .unwrap_or(RunState::Pending)
    }

    pub fn succeeded(&self) -> bool {
        self.state() == RunState::Succeeded
    }

    pub fn into_result(mut self) -> Result<Self, PipelineError> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    id: String,
    owner: Option<String>,
    schedule: Option<Schedule>,
    transform: Option<Arc<dyn TransformStep>>,
    load: Option<LoadTask>,
}

impl PipelineBuilder {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn transform(mut self, step: Arc<dyn TransformStep>) -> Self {
        self.transform = Some(step);
        self
    }

    pub fn load(mut self, task: LoadTask) -> Self {
        self.load = Some(task);
        self
    }

    pub fn build(self) -> Result<Pipeline, ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline id is empty".into()));
        }
        let schedule = self
            .schedule
            .ok_or_else(|| ConfigError::Invalid(format!("pipeline {} has no schedule", self.id)))?;
        let transform = self.transform.ok_or_else(|| {
            ConfigError::Invalid(format!("pipeline {} has no transform step", self.id))
        })?;
        let load = self
            .load
            .ok_or_else(|| ConfigError::Invalid(format!("pipeline {} has no load step", self.id)))?;

        if transform.task_id() == load.task_id() {
            return Err(ConfigError::Invalid(format!(
                "transform and load share task id `{}`",
                load.task_id()
            )));
        }
        if schedule.max_active_runs == 0 {
            return Err(ConfigError::Invalid("max_active_runs must be at least 1".into()));
        }

        let produced = transform.output_headers();
        let expected = load.job().schema.names();
        if produced != expected.as_slice() {
            return Err(ConfigError::HeaderMismatch(format!(
                "transform writes {:?} but table schema is {:?}",
                produced, expected
            )));
        }

        let object = transform.output_object();
        if !load.job().source_uris.contains(object) {
            return Err(ConfigError::Invalid(format!(
                "transform writes {} but load reads {:?}",
                object,
                load.job()
                    .source_uris
                    .iter()
                    .map(|u| u.to_string())
                    .collect::<Vec<_>>()
            )));
        }

        let edge = DependencyEdge {
            upstream: transform.task_id().to_string(),
            downstream: load.task_id().to_string(),
        };
        let guard = Semaphore::new(schedule.max_active_runs);

        Ok(Pipeline {
            id: self.id,
            owner: self.owner.unwrap_or_default(),
            schedule,
            transform,
            load,
            edge,
            guard,
        })
    }
}

/// An immutable two-step pipeline definition.
pub struct Pipeline {
    id: String,
    owner: String,
    schedule: Schedule,
    transform: Arc<dyn TransformStep>,
    load: LoadTask,
    edge: DependencyEdge,
    guard: Semaphore,
}

impl Pipeline {
    pub fn builder(id: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn transform(&self) -> &dyn TransformStep {
        self.transform.as_ref()
    }

    pub fn load(&self) -> &LoadTask {
        &self.load
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        std::slice::from_ref(&self.edge)
    }

    /// Execute one run. Refused with `RunInProgress` when the active-run limit
    /// is reached; otherwise step failures are reported inside the `RunReport`.
    #[instrument(level = "info", skip(self, ctx), fields(pipeline = %self.id, run_id = %ctx.run_id))]
    pub async fn run(&self, ctx: RunContext) -> Result<RunReport, PipelineError> {
        let _permit = self
            .guard
            .try_acquire()
            .map_err(|_| PipelineError::RunInProgress(self.id.clone()))?;

        let mut tracker = RunTracker::new();
        let mut report = RunReport {
            run_id: ctx.run_id.clone(),
            logical_date: ctx.logical_date,
            history: Vec::new(),
            transform: None,
            load: None,
            failure: None,
        };

        // 1) transform
        tracker.advance(RunState::TransformRunning)?;
        info!(task = %self.edge.upstream, "transform started");
        match self.transform.run(&ctx).await {
            Ok(output) => {
                tracker.advance(RunState::TransformDone)?;
                report.transform = Some(output);
            }
            Err(e) => {
                error!(task = %self.edge.upstream, "transform failed: {}", e);
                tracker.advance(RunState::TransformFailed)?;
                tracker.advance(RunState::Failed)?;
                report.failure = Some(e.into());
                report.history = tracker.into_history();
                return Ok(report);
            }
        }

        // 2) load, only after the upstream edge is satisfied
        tracker.advance(RunState::LoadRunning)?;
        info!(task = %self.edge.downstream, "load started");
        match self.load.run(&ctx).await {
            Ok(summary) => {
                tracker.advance(RunState::LoadDone)?;
                tracker.advance(RunState::Succeeded)?;
                report.load = Some(summary);
            }
            Err(e) => {
                error!(task = %self.edge.downstream, "load failed: {}", e);
                tracker.advance(RunState::LoadFailed)?;
                tracker.advance(RunState::Failed)?;
                report.failure = Some(e.into());
            }
        }

        report.history = tracker.into_history();
        info!(state = %report.state(), "run finished");
        Ok(report)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("schedule", &self.schedule)
            .field("edge", &self.edge)
            .finish_non_exhaustive()
    }
}
