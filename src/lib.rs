pub mod bigquery;
pub mod extract;
pub mod pipeline;
pub mod process;
pub mod workspace;
