use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::{
    bigquery::{LoadRequest, LoadTarget, TableRef, WriteDisposition},
    extract::unzip_archive,
    process::{encode::encode_chunk, schema::TableSchema, ChunkReader, DEFAULT_CHUNK_SIZE},
    workspace::{ScratchDir, DEFAULT_WORK_DIR},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Maximum rows per load job.
    pub chunk_size: usize,
    /// Scratch directory the archive is extracted into. Must be missing or
    /// empty; whatever the run puts there is removed afterwards.
    pub work_dir: PathBuf,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
        }
    }
}

/// What a run appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub chunks: usize,
    pub rows: u64,
}

/// Append every row of `csv_path` to `table`, one load job per chunk.
///
/// The schema comes from the header row once; each chunk is checked against
/// it, encoded, and submitted only after the previous job has finished.
#[instrument(level = "info", skip(csv_path, table, target), fields(csv = %csv_path.as_ref().display(), table = %table))]
pub async fn load_csv<P: AsRef<Path>, T: LoadTarget>(
    csv_path: P,
    table: &TableRef,
    target: &T,
    chunk_size: usize,
) -> Result<LoadSummary> {
    let reader = ChunkReader::open(csv_path.as_ref(), chunk_size)?;
    let schema = TableSchema::all_strings(reader.columns())?;
    debug!(columns = ?schema.names().collect::<Vec<_>>(), "derived all-STRING schema");

    let mut summary = LoadSummary::default();
    for chunk in reader {
        let chunk = chunk.with_context(|| {
            format!("reading chunk {} of {}", summary.chunks, csv_path.as_ref().display())
        })?;
        let payload = encode_chunk(&schema, &chunk)?;

        info!("Loading chunk {} to BigQuery table {}", chunk.index, table);
        let outcome = target
            .load(LoadRequest {
                table,
                schema: &schema,
                disposition: WriteDisposition::WriteAppend,
                chunk_index: chunk.index,
                rows: chunk.len(),
                payload,
            })
            .await?;
        debug!(job_id = %outcome.job_id, output_rows = ?outcome.output_rows, "chunk loaded");

        summary.chunks += 1;
        summary.rows += chunk.len() as u64;
    }
    Ok(summary)
}

/// Extract `zip_path` into a scratch directory, load its one CSV into
/// `table`, and remove the scratch directory whether or not that worked.
#[instrument(level = "info", skip(zip_path, target, options), fields(zip = %zip_path.as_ref().display()))]
pub async fn run<P: AsRef<Path>, T: LoadTarget>(
    zip_path: P,
    table: &TableRef,
    target: &T,
    options: &LoadOptions,
) -> Result<LoadSummary> {
    let scratch = ScratchDir::create(&options.work_dir)?;
    let csv_path = unzip_archive(zip_path.as_ref(), scratch.path())?;
    info!(csv = %csv_path.display(), "found CSV in archive");

    let summary = load_csv(&csv_path, table, target, options.chunk_size).await?;
    info!(chunks = summary.chunks, rows = summary.rows, "all chunks loaded");
    Ok(summary)
}

/// Printed once a run has finished.
pub fn completion_message(table_name: &str) -> String {
    format!("Data has been loaded to {}", table_name)
}
