// src/transform/container.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{process::Stdio, time::Duration};
use tokio::{process::Command, time::timeout};
use tracing::{info, instrument, warn};

use super::{TransformOutput, TransformSpec, TransformStep};
use crate::{
    error::{ConfigError, TransformError},
    pipeline::RunContext,
    storage::ObjectUri,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    #[default]
    Always,
    IfNotPresent,
    Never,
}

/// Resource requests for the transform worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// e.g. `2G`
    pub memory: String,
    /// e.g. `1` or `0.5`
    pub cpu: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            memory: "2G".into(),
            cpu: "1".into(),
        }
    }
}

/// Runs the transform image under a container runtime, handing it the
/// `TransformSpec` through the environment contract.
#[derive(Debug, Clone)]
pub struct ContainerTransform {
    task_id: String,
    name: String,
    image: String,
    pull_policy: PullPolicy,
    resources: Resources,
    startup_timeout: Duration,
    runtime: String,
    spec: TransformSpec,
    target: ObjectUri,
}

impl ContainerTransform {
    pub fn new(
        task_id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        spec: TransformSpec,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;
        let target = spec.target_uri()?;
        let image = image.into();
        if image.trim().is_empty() {
            return Err(ConfigError::Invalid("transform image is empty".into()));
        }
        Ok(Self {
            task_id: task_id.into(),
            name: name.into(),
            image,
            pull_policy: PullPolicy::default(),
            resources: Resources::default(),
            startup_timeout: Duration::from_secs(600),
            runtime: "docker".into(),
            spec,
            target,
        })
    }

    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Container names allow `[a-zA-Z0-9_.-]`; everything else in the run id becomes `-`.
    fn container_name(&self, ctx: &RunContext) -> String {
        let run: String = ctx
            .run_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}-{}", self.name, run)
    }

    pub fn run_args(&self, ctx: &RunContext) -> Result<Vec<String>, ConfigError> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--pull".to_string(),
            "never".to_string(),
            "--name".to_string(),
            self.container_name(ctx),
            "--memory".to_string(),
            self.resources.memory.to_lowercase(),
            "--cpus".to_string(),
            self.resources.cpu.clone(),
        ];
        for (key, value) in self.spec.to_env()? {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        Ok(args)
    }

    async fn image_present(&self) -> bool {
        Command::new(&self.runtime)
            .args(["image", "inspect", self.image.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Make the image available locally, bounded by the startup timeout.
    async fn acquire_image(&self) -> Result<(), TransformError> {
        let pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !self.image_present().await,
            PullPolicy::Never => false,
        };
        if !pull {
            return Ok(());
        }

        info!(image = %self.image, "pulling transform image");
        let status = timeout(
            self.startup_timeout,
            Command::new(&self.runtime)
                .args(["pull", self.image.as_str()])
                .stdout(Stdio::null())
                .status(),
        )
        .await
        .map_err(|_| TransformError::StartupTimeout(self.startup_timeout))?
        .map_err(|e| TransformError::io(&self.runtime, e))?;

        if !status.success() {
            return Err(TransformError::ContainerExited(format!(
                "image pull {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransformStep for ContainerTransform {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn output_headers(&self) -> &[String] {
        &self.spec.csv_headers
    }

    fn output_object(&self) -> &ObjectUri {
        &self.target
    }

    #[instrument(level = "info", skip(self, ctx), fields(task = %self.task_id, run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<TransformOutput, TransformError> {
        self.acquire_image().await?;

        let args = self.run_args(ctx)?;
        info!(image = %self.image, runtime = %self.runtime, "starting transform container");
        let status = Command::new(&self.runtime)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| TransformError::io(&self.runtime, e))?;

        if !status.success() {
            warn!(%status, "transform container failed");
            return Err(TransformError::ContainerExited(status.to_string()));
        }

        Ok(TransformOutput {
            object: self.target.clone(),
            rows: None,
        })
    }
}
