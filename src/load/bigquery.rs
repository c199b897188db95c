// src/load/bigquery.rs

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use google_cloud_bigquery::{
    client::{Client, ClientConfig},
    http::{
        job::{
            get::GetJobRequest, Job, JobConfiguration, JobConfigurationLoad, JobReference,
            JobState, JobType, WriteDisposition as BqWriteDisposition,
        },
        table::{
            SourceFormat, TableFieldMode, TableFieldSchema, TableFieldType, TableReference,
            TableSchema,
        },
    },
};
use std::time::Duration;
use tracing::{debug, info};

use super::{LoadJob, LoadSummary, Warehouse, WriteDisposition};
use crate::{
    error::LoadError,
    schema::{FieldMode, FieldType, TargetSchema},
};

/// BigQuery load jobs, authenticated with application default credentials.
pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    poll_interval: Duration,
}

impl BigQueryWarehouse {
    /// `project_id` overrides the project found in the credentials.
    pub async fn from_default_credentials(project_id: Option<String>) -> anyhow::Result<Self> {
        let (config, detected) = ClientConfig::new_with_auth()
            .await
            .context("authenticating BigQuery client")?;
        let project_id = project_id
            .or(detected)
            .ok_or_else(|| anyhow!("no project_id from config or credentials"))?;
        let client = Client::new(config).await.context("creating BigQuery client")?;
        Ok(Self {
            client,
            project_id,
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn table_schema(schema: &TargetSchema) -> TableSchema {
    TableSchema {
        fields: schema
            .fields()
            .iter()
            .map(|field| TableFieldSchema {
                name: field.name.clone(),
                data_type: match field.ty {
                    FieldType::String => TableFieldType::String,
                    FieldType::Integer => TableFieldType::Integer,
                    FieldType::Float => TableFieldType::Float,
                    FieldType::Boolean => TableFieldType::Boolean,
                },
                mode: Some(match field.mode {
                    FieldMode::Nullable => TableFieldMode::Nullable,
                    FieldMode::Required => TableFieldMode::Required,
                }),
                description: Some(field.description.clone()),
                ..Default::default()
            })
            .collect(),
    }
}

fn disposition(d: WriteDisposition) -> BqWriteDisposition {
    match d {
        WriteDisposition::WriteTruncate => BqWriteDisposition::WriteTruncate,
        WriteDisposition::WriteAppend => BqWriteDisposition::WriteAppend,
        WriteDisposition::WriteEmpty => BqWriteDisposition::WriteEmpty,
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn load(&self, job: &LoadJob) -> Result<LoadSummary, LoadError> {
        let project_id = job
            .destination
            .project
            .clone()
            .unwrap_or_else(|| self.project_id.clone());
        let job_id = format!(
            "load_{}_{}",
            job.destination.table,
            Utc::now().timestamp_micros()
        );

        let load = JobConfigurationLoad {
            source_uris: job.source_uris.iter().map(|u| u.to_string()).collect(),
            source_format: Some(SourceFormat::Csv),
            destination_table: TableReference {
                project_id: project_id.clone(),
                dataset_id: job.destination.dataset.clone(),
                table_id: job.destination.table.clone(),
            },
            schema: Some(table_schema(&job.schema)),
            write_disposition: Some(disposition(job.write_disposition)),
            skip_leading_rows: Some(job.skip_leading_rows as i64),
            allow_quoted_newlines: Some(job.allow_quoted_newlines),
            ..Default::default()
        };
        let request = Job {
            job_reference: JobReference {
                project_id: project_id.clone(),
                job_id: job_id.clone(),
                ..Default::default()
            },
            configuration: JobConfiguration {
                job: JobType::Load(load),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = self
            .client
            .job()
            .create(&request)
            .await
            .map_err(|e| LoadError::Unavailable(e.into()))?;
        info!(job_id = %job_id, table = %job.destination, "submitted BigQuery load job");

        let location = created.job_reference.location.clone();
        loop {
            let current = self
                .client
                .job()
                .get(
                    &project_id,
                    &job_id,
                    &GetJobRequest {
                        location: location.clone(),
                    },
                )
                .await
                .map_err(|e| LoadError::Unavailable(e.into()))?;

            if matches!(current.status.state, JobState::Done) {
                if let Some(err) = current.status.error_result {
                    return Err(LoadError::Rejected(
                        err.message.unwrap_or_else(|| "unknown error".into()),
                    ));
                }
                break;
            }
            debug!(job_id = %job_id, state = ?current.status.state, "load job still running");
            tokio::time::sleep(self.poll_interval).await;
        }

        Ok(LoadSummary {
            table: job.destination.clone(),
            rows_loaded: None,
        })
    }
}
