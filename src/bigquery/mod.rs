// src/bigquery/mod.rs
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::process::schema::TableSchema;

pub mod client;
pub mod job;

pub use client::BigQueryClient;

/// A destination table as written on the command line:
/// `project.dataset.table`, legacy `project:dataset.table`, or
/// `dataset.table` when the project comes from elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    project: Option<String>,
    dataset: String,
    table: String,
}

impl TableName {
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// Fill in the project, if the name didn't carry one.
    pub fn resolve(&self, default_project: &str) -> TableRef {
        TableRef {
            project_id: self
                .project
                .clone()
                .unwrap_or_else(|| default_project.to_string()),
            dataset_id: self.dataset.clone(),
            table_id: self.table.clone(),
        }
    }
}

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (project, rest) = match s.split_once(':') {
            Some((project, rest)) => (Some(project), rest),
            None => (None, s),
        };
        let parts: Vec<&str> = rest.split('.').collect();
        let (project, dataset, table) = match (project, parts.as_slice()) {
            (Some(p), [d, t]) => (Some(p), *d, *t),
            (None, [d, t]) => (None, *d, *t),
            (None, [p, d, t]) => (Some(*p), *d, *t),
            _ => bail!(
                "table name {:?} must look like [project.]dataset.table or project:dataset.table",
                s
            ),
        };

        let non_empty = |part: &str, what: &str| -> Result<String> {
            if part.trim().is_empty() {
                Err(anyhow!("table name {:?} has an empty {}", s, what))
            } else {
                Ok(part.to_string())
            }
        };
        Ok(TableName {
            project: project.map(|p| non_empty(p, "project")).transpose()?,
            dataset: non_empty(dataset, "dataset")?,
            table: non_empty(table, "table")?,
        })
    }
}

/// Fully-qualified table reference, serialized as the API's `TableReference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// What a load job does to rows already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteAppend,
}

/// One chunk, ready to be submitted as a load job.
#[derive(Debug)]
pub struct LoadRequest<'a> {
    pub table: &'a TableRef,
    pub schema: &'a TableSchema,
    pub disposition: WriteDisposition,
    pub chunk_index: usize,
    pub rows: usize,
    /// Parquet-encoded chunk.
    pub payload: Vec<u8>,
}

/// A finished load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub job_id: String,
    pub output_rows: Option<u64>,
}

/// Somewhere chunks can be appended to. Implementations return only once
/// the job has finished, successfully or not.
#[allow(async_fn_in_trait)]
pub trait LoadTarget {
    async fn load(&self, request: LoadRequest<'_>) -> Result<LoadOutcome>;
}
