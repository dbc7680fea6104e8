// src/process/mod.rs
use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use std::{fs::File, io::Read, path::Path};
use tracing::debug;

pub mod columns;
pub mod encode;
pub mod schema;

/// Rows per load job.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

/// Upper bound on the rows pre-allocated for a chunk, so small files with a
/// huge chunk size don't reserve memory they never use.
const MAX_PREALLOCATED_ROWS: usize = 64 * 1024;

/// Cell values read as NULL instead of text.
pub const NA_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Up to `chunk_size` consecutive data rows of the CSV, all values as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk in the file, starting at 0.
    pub index: usize,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Lazily splits a CSV into [`Chunk`]s in file order.
///
/// The header row is read up front and exposed sanitized through
/// [`ChunkReader::columns`]. Short rows are padded with NULLs; a row with
/// more values than there are columns stops the iteration with an error.
pub struct ChunkReader<R: Read> {
    reader: csv::Reader<R>,
    columns: Vec<String>,
    chunk_size: usize,
    next_index: usize,
    record: StringRecord,
    finished: bool,
}

impl ChunkReader<File> {
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open CSV: {}", path.display()))?;
        Self::from_reader(file, chunk_size)
            .with_context(|| format!("reading CSV header of {}", path.display()))
    }
}

impl<R: Read> ChunkReader<R> {
    pub fn from_reader(rdr: R, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk size must be at least 1");
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true) // ragged rows are handled per record below
            .from_reader(rdr);

        let header = reader.headers().context("CSV header parse error")?;
        if header.is_empty() {
            bail!("no columns to parse from file");
        }
        let columns = columns::sanitize_headers(header.iter());
        debug!(?columns, "read CSV header");

        Ok(Self {
            reader,
            columns,
            chunk_size,
            next_index: 0,
            record: StringRecord::new(),
            finished: false,
        })
    }

    /// Sanitized column names, in header order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        let width = self.columns.len();
        let mut rows = Vec::with_capacity(self.chunk_size.min(MAX_PREALLOCATED_ROWS));

        while rows.len() < self.chunk_size {
            let more = self
                .reader
                .read_record(&mut self.record)
                .context("CSV parse error")?;
            if !more {
                self.finished = true;
                break;
            }

            if self.record.len() > width {
                let line = self.record.position().map(|p| p.line()).unwrap_or(0);
                bail!(
                    "Expected {} fields in line {}, saw {}",
                    width,
                    line,
                    self.record.len()
                );
            }

            let mut row: Vec<Option<String>> = self
                .record
                .iter()
                .map(|v| (!NA_MARKERS.contains(&v)).then(|| v.to_string()))
                .collect();
            row.resize(width, None);
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Chunk { index, rows }))
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
