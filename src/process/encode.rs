use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, StringArray},
    record_batch::RecordBatch,
};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use std::sync::Arc;
use tracing::trace;

use super::{schema::TableSchema, Chunk};

/// Convert a chunk into an Arrow batch of Utf8 columns matching `schema`.
pub fn chunk_to_batch(schema: &TableSchema, chunk: &Chunk) -> Result<RecordBatch> {
    schema.ensure_matches(chunk)?;

    let columns: Vec<ArrayRef> = (0..schema.width())
        .map(|col| {
            let values: StringArray = chunk.rows.iter().map(|row| row[col].as_deref()).collect();
            Arc::new(values) as ArrayRef
        })
        .collect();

    RecordBatch::try_new(schema.to_arrow(), columns)
        .with_context(|| format!("building record batch for chunk {}", chunk.index))
}

/// Encode a chunk as an in-memory Snappy-compressed Parquet file.
pub fn encode_chunk(schema: &TableSchema, chunk: &Chunk) -> Result<Vec<u8>> {
    let batch = chunk_to_batch(schema, chunk)?;

    let mut buffer = Vec::new();
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .context("creating parquet writer")?;
    writer.write(&batch).context("writing batch to parquet")?;
    writer.close().context("closing parquet writer")?;

    trace!(
        chunk = chunk.index,
        rows = batch.num_rows(),
        bytes = buffer.len(),
        "encoded chunk"
    );
    Ok(buffer)
}
