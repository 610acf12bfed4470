use async_trait::async_trait;
use thiserror::Error;

pub mod http;
pub mod mock;

pub use http::HttpWarehouseClient;
pub use mock::{JobScript, MockWarehouseClient};

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("warehouse returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("column already exists: {0}")]
    ColumnExists(String),
    #[error("unexpected warehouse response: {0}")]
    Protocol(String),
}

/// A warehouse instance the pipeline loads into. The primary target is
/// mandatory and decides commits; the secondary is optional, independently
/// toggled, and never affects the primary path.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    pub name: String,
    pub endpoint: String,
    pub token: String,
    pub table: String,
    pub schema_evolution: bool,
}

/// The bulk-load statement submitted against a staged location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStatement {
    pub table: String,
    pub location: String,
    pub manifest: bool,
}

impl LoadStatement {
    pub fn to_sql(&self) -> String {
        let manifest = if self.manifest { " MANIFEST" } else { "" };
        format!(
            "COPY {} FROM '{}' FORMAT JSON GZIP{}",
            self.table, self.location, manifest
        )
    }
}

/// State the warehouse reports for a submitted load job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobState {
    Queued,
    Running,
    Success,
    Failed,
}

impl RemoteJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteJobState::Success | RemoteJobState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct JobDescription {
    pub state: RemoteJobState,
    /// Row counts are advisory: some warehouses report zero for successful
    /// bulk loads. `Success` is authoritative regardless.
    pub rows_affected: Option<u64>,
    pub error: Option<String>,
}

/// The warehouse's admission and introspection surface: submit a bulk load,
/// poll it, observe the concurrent-job count the admission controller
/// throttles on, and read/extend the target table's columns.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    async fn submit(&self, statement: &LoadStatement) -> Result<String, WarehouseError>;

    async fn describe(&self, external_job_id: &str) -> Result<JobDescription, WarehouseError>;

    /// Current count of concurrently running load jobs, an eventually
    /// consistent read.
    async fn running_jobs(&self) -> Result<usize, WarehouseError>;

    async fn list_columns(&self, table: &str) -> Result<Vec<String>, WarehouseError>;

    async fn add_column(&self, table: &str, column: &str, ty: &str)
        -> Result<(), WarehouseError>;
}
