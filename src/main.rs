use anyhow::Result;
use bqload::{
    bigquery::{BigQueryClient, TableName},
    pipeline::{self, LoadOptions},
    process::DEFAULT_CHUNK_SIZE,
    workspace::DEFAULT_WORK_DIR,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Load CSV data from a zip archive into a BigQuery table in chunked append jobs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the zip file containing CSV data.
    #[arg(long = "zip_file", alias = "zip-file")]
    zip_file: PathBuf,

    /// Name of the BigQuery table: [project.]dataset.table
    #[arg(long = "table_name", alias = "table-name")]
    table_name: String,

    /// Project that runs the load jobs. Defaults to GOOGLE_CLOUD_PROJECT,
    /// then the table's project, then the credentials' project.
    #[arg(long)]
    project: Option<String>,

    /// Rows per load job.
    #[arg(long = "chunk_size", alias = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Scratch directory for the extracted archive. Must be missing or empty;
    /// whatever the run puts there is removed when it ends.
    #[arg(long = "work_dir", alias = "work-dir", default_value = DEFAULT_WORK_DIR)]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_target(false)
        .init();

    // ─── 2) parse arguments ─────────────────────────────────────────
    let args = Args::parse();
    let table_name: TableName = args.table_name.parse()?;

    // ─── 3) authenticate & resolve the table ────────────────────────
    let project = args
        .project
        .or_else(|| std::env::var("GOOGLE_CLOUD_PROJECT").ok())
        .or_else(|| table_name.project().map(str::to_string));
    let client = BigQueryClient::new(project).await?;
    let table = table_name.resolve(client.project_id());
    info!(zip = %args.zip_file.display(), table = %table, "startup");

    // ─── 4) extract, load every chunk, clean up ─────────────────────
    let options = LoadOptions {
        chunk_size: args.chunk_size,
        work_dir: args.work_dir,
    };
    let summary = pipeline::run(&args.zip_file, &table, &client, &options).await?;
    info!(chunks = summary.chunks, rows = summary.rows, "all done");

    // ─── 5) report ──────────────────────────────────────────────────
    println!("{}", pipeline::completion_message(&args.table_name));
    Ok(())
}
