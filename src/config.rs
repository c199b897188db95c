// src/config.rs
//
// Run configuration, read from YAML. `${VAR}` (or `${VAR:-default}`) in the
// file is replaced from the process environment before parsing.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::ConfigError,
    load::{LoadJob, TableId, WriteDisposition},
    schedule::Schedule,
    schema::series_summary,
    transform::{PullPolicy, Resources, TransformSpec},
};

static VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex")
});

/// Replace every `${VAR}` in `raw`. Unset variables without a default fail.
pub fn interpolate<F>(raw: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Option<String> = None;
    let out = VAR_RE.replace_all(raw, |caps: &Captures| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingVariable(name)),
        None => Ok(out.into_owned()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// Run the transform image under a container runtime.
    #[default]
    Container,
    /// Run the same rewrite inside this process.
    InProcess,
}

fn default_runtime() -> String {
    "docker".into()
}

fn default_startup_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub mode: TransformMode,
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub resources: Resources,
    pub source_url: String,
    pub source_file: PathBuf,
    pub column_to_remove: String,
    pub target_file: PathBuf,
    pub target_gcs_bucket: String,
    pub target_gcs_path: String,
}

impl TransformConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

fn default_skip_leading_rows() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub task_id: String,
    pub destination_table: String,
    #[serde(default)]
    pub write_disposition: WriteDisposition,
    #[serde(default = "default_skip_leading_rows")]
    pub skip_leading_rows: u64,
    #[serde(default = "default_true")]
    pub allow_quoted_newlines: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Objects under `<root>/objects`, tables under `<root>/warehouse`.
    Local { root: PathBuf },
    /// GCS and BigQuery with application default credentials.
    Gcp {
        #[serde(default)]
        project: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            root: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub pipeline: PipelineConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl RunConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw, |name| std::env::var(name).ok())
    }

    pub fn from_yaml_str<F>(raw: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expanded = interpolate(raw, lookup)?;
        let config: RunConfig = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// The WDI series summary pipeline as originally scheduled. The bucket and
    /// image come from the deployment, everything else is fixed.
    pub fn series_summary_defaults(
        composer_bucket: impl Into<String>,
        transform_image: impl Into<String>,
    ) -> Self {
        RunConfig {
            pipeline: PipelineConfig {
                id: "world_bank_wdi.series_summary".into(),
                owner: "Google".into(),
                schedule: Schedule::daily(NaiveDate::from_ymd_opt(2021, 3, 1).unwrap_or_default()),
            },
            transform: TransformConfig {
                task_id: "series_summary_transform_csv".into(),
                name: "series_summary".into(),
                mode: TransformMode::Container,
                image: transform_image.into(),
                runtime: default_runtime(),
                pull_policy: PullPolicy::Always,
                startup_timeout_secs: default_startup_timeout(),
                resources: Resources::default(),
                source_url: "gs://pdp-feeds-staging/RelayWorldBank/WDI_csv/WDISeries.csv".into(),
                source_file: PathBuf::from("files/data.csv"),
                column_to_remove: series_summary::COLUMN_TO_REMOVE.into(),
                target_file: PathBuf::from("files/data_output.csv"),
                target_gcs_bucket: composer_bucket.into(),
                target_gcs_path: "data/world_bank_wdi/series_summary/data_output.csv".into(),
            },
            load: LoadConfig {
                task_id: "load_series_summary_to_bq".into(),
                destination_table: "world_bank_wdi.series_summary".into(),
                write_disposition: WriteDisposition::WriteTruncate,
                skip_leading_rows: 1,
                allow_quoted_newlines: true,
            },
            backend: BackendConfig::Gcp { project: None },
        }
    }

    /// The environment contract handed to the transform.
    pub fn transform_spec(&self) -> TransformSpec {
        let t = &self.transform;
        TransformSpec {
            source_url: t.source_url.clone(),
            source_file: t.source_file.clone(),
            column_to_remove: t.column_to_remove.clone(),
            target_file: t.target_file.clone(),
            target_gcs_bucket: t.target_gcs_bucket.clone(),
            target_gcs_path: t.target_gcs_path.clone(),
            pipeline_name: t.name.clone(),
            csv_headers: series_summary::csv_headers(),
            rename_mappings: series_summary::rename_map().clone(),
        }
    }

    /// Loads whatever the transform wrote.
    pub fn load_job(&self) -> Result<LoadJob, ConfigError> {
        let source = self.transform_spec().target_uri()?;
        let destination: TableId = self
            .load
            .destination_table
            .parse()
            .map_err(|e: crate::error::LoadError| ConfigError::Invalid(e.to_string()))?;
        Ok(LoadJob {
            source_uris: vec![source],
            destination,
            schema: series_summary::schema().clone(),
            write_disposition: self.load.write_disposition,
            skip_leading_rows: self.load.skip_leading_rows,
            allow_quoted_newlines: self.load.allow_quoted_newlines,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.id.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.id is empty".into()));
        }
        if self.pipeline.schedule.max_active_runs == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.schedule.max_active_runs must be at least 1".into(),
            ));
        }
        if self.transform.mode == TransformMode::Container && self.transform.image.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "transform.image is required in container mode".into(),
            ));
        }
        if self.transform.task_id == self.load.task_id {
            return Err(ConfigError::Invalid(format!(
                "transform and load share task id `{}`",
                self.load.task_id
            )));
        }
        self.transform_spec().validate()?;
        self.load_job()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
pipeline:
  id: world_bank_wdi.series_summary
  owner: Google
  schedule:
    interval: "@daily"
    start_date: 2021-03-01
    catchup: false
    max_active_runs: 1
transform:
  task_id: series_summary_transform_csv
  name: series_summary
  mode: in_process
  source_url: gs://pdp-feeds-staging/RelayWorldBank/WDI_csv/WDISeries.csv
  source_file: files/data.csv
  column_to_remove: "Unnamed: 20"
  target_file: files/data_output.csv
  target_gcs_bucket: ${COMPOSER_BUCKET}
  target_gcs_path: data/world_bank_wdi/series_summary/data_output.csv
load:
  task_id: load_series_summary_to_bq
  destination_table: world_bank_wdi.series_summary
backend:
  kind: local
  root: ${DATA_ROOT:-data}
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn interpolates_variables_and_defaults() {
        let lookup = env(&[("A", "1")]);
        assert_eq!(interpolate("x${A}y${B:-2}z", &lookup).unwrap(), "x1y2z");
        let err = interpolate("${C}", &lookup).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(ref v) if v == "C"));
    }

    #[test]
    fn parses_yaml_with_defaults_filled() {
        let cfg = RunConfig::from_yaml_str(YAML, env(&[("COMPOSER_BUCKET", "my-bucket")])).unwrap();
        assert_eq!(cfg.transform.mode, TransformMode::InProcess);
        assert_eq!(cfg.transform.pull_policy, PullPolicy::Always);
        assert_eq!(cfg.transform.startup_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.transform.resources, Resources::default());
        assert_eq!(cfg.load.write_disposition, WriteDisposition::WriteTruncate);
        assert_eq!(cfg.load.skip_leading_rows, 1);
        assert!(cfg.load.allow_quoted_newlines);
        assert_eq!(
            cfg.backend,
            BackendConfig::Local {
                root: PathBuf::from("data")
            }
        );

        let job = cfg.load_job().unwrap();
        assert_eq!(
            job.source_uris[0].to_string(),
            "gs://my-bucket/data/world_bank_wdi/series_summary/data_output.csv"
        );
        assert_eq!(job.schema.len(), 20);
    }

    #[test]
    fn missing_bucket_variable_is_reported() {
        let err = RunConfig::from_yaml_str(YAML, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(ref v) if v == "COMPOSER_BUCKET"));
    }

    #[test]
    fn container_mode_needs_an_image() {
        let yaml = YAML.replace("mode: in_process", "mode: container");
        let err = RunConfig::from_yaml_str(&yaml, env(&[("COMPOSER_BUCKET", "b")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_destination_table_is_rejected() {
        let yaml = YAML.replace(
            "destination_table: world_bank_wdi.series_summary",
            "destination_table: series_summary",
        );
        assert!(RunConfig::from_yaml_str(&yaml, env(&[("COMPOSER_BUCKET", "b")])).is_err());
    }

    #[test]
    fn defaults_match_original_schedule_and_contract() {
        let cfg = RunConfig::series_summary_defaults(
            "composer-bucket",
            "gcr.io/project/run_csv_transform_kub:latest",
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.pipeline.schedule.start_date.to_string(), "2021-03-01");
        assert!(!cfg.pipeline.schedule.catchup);
        assert_eq!(cfg.transform.resources.memory, "2G");
        assert_eq!(cfg.transform_spec().to_env().unwrap().len(), 9);
    }

    #[test]
    fn shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/series_summary.yaml");
        let raw = std::fs::read_to_string(path).unwrap();
        let cfg = RunConfig::from_yaml_str(&raw, env(&[("COMPOSER_BUCKET", "b")])).unwrap();
        assert_eq!(cfg.pipeline.id, "world_bank_wdi.series_summary");
    }
}
