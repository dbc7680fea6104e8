//! Just enough of the BigQuery `Job` resource to submit a load job and
//! follow it to completion.

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TableRef, WriteDisposition};
use crate::process::schema::TableSchema;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceFormat {
    Parquet,
}

/// Request body for `jobs.insert` with a load configuration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadJob<'a> {
    pub job_reference: JobReference,
    pub configuration: JobConfiguration<'a>,
}

#[derive(Debug, Serialize)]
pub struct JobConfiguration<'a> {
    pub load: LoadConfiguration<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadConfiguration<'a> {
    pub destination_table: &'a TableRef,
    pub schema: &'a TableSchema,
    pub source_format: SourceFormat,
    pub write_disposition: WriteDisposition,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Done,
}

/// An error as the API reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorProto {
    pub reason: Option<String>,
    pub location: Option<String>,
    pub message: Option<String>,
}

impl fmt::Display for ErrorProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message.as_deref().unwrap_or("unknown error");
        match (&self.reason, &self.location) {
            (Some(r), Some(l)) => write!(f, "{} ({}, at {})", message, r, l),
            (Some(r), None) => write!(f, "{} ({})", message, r),
            (None, Some(l)) => write!(f, "{} (at {})", message, l),
            (None, None) => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    pub error_result: Option<ErrorProto>,
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadStatistics {
    /// int64 values travel as JSON strings.
    pub output_rows: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobStatistics {
    pub load: Option<LoadStatistics>,
}

/// The parts of a `Job` response this loader looks at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_reference: JobReference,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub statistics: JobStatistics,
}

impl Job {
    pub fn is_done(&self) -> bool {
        self.status.state == JobState::Done
    }

    pub fn output_rows(&self) -> Option<u64> {
        self.statistics
            .load
            .as_ref()
            .and_then(|l| l.output_rows.as_deref())
            .and_then(|n| n.parse().ok())
    }

    /// The job's failure, if it has one: the `errorResult` plus any further
    /// messages from `errors`.
    pub fn failure(&self) -> Option<Error> {
        let primary = self.status.error_result.as_ref()?;
        let details: Vec<String> = self
            .status
            .errors
            .iter()
            .filter(|e| *e != primary)
            .map(ToString::to_string)
            .collect();
        let job_id = &self.job_reference.job_id;
        Some(if details.is_empty() {
            anyhow!("load job {} failed: {}", job_id, primary)
        } else {
            anyhow!(
                "load job {} failed: {}; {}",
                job_id,
                primary,
                details.join("; ")
            )
        })
    }
}
