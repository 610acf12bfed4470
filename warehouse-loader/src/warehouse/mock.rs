use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    JobDescription, LoadStatement, RemoteJobState, WarehouseClient, WarehouseError,
};

/// What a scripted load job should do once polled to completion.
#[derive(Debug, Clone)]
pub struct JobScript {
    pub polls_until_terminal: u32,
    pub terminal: RemoteJobState,
    pub rows_affected: Option<u64>,
    pub error: Option<String>,
}

impl JobScript {
    pub fn succeed() -> Self {
        Self {
            polls_until_terminal: 0,
            terminal: RemoteJobState::Success,
            rows_affected: None,
            error: None,
        }
    }

    pub fn succeed_with_rows(rows: u64) -> Self {
        Self {
            rows_affected: Some(rows),
            ..Self::succeed()
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            polls_until_terminal: 0,
            terminal: RemoteJobState::Failed,
            rows_affected: None,
            error: Some(message.to_owned()),
        }
    }

    pub fn after_polls(mut self, polls: u32) -> Self {
        self.polls_until_terminal = polls;
        self
    }

    /// A job that never reaches a terminal state, for timeout tests.
    pub fn never_finish() -> Self {
        Self::succeed().after_polls(u32::MAX)
    }
}

struct JobEntry {
    script: JobScript,
    polls: u32,
}

#[derive(Default)]
struct Inner {
    submitted: Vec<LoadStatement>,
    scripts: VecDeque<JobScript>,
    jobs: HashMap<String, JobEntry>,
    next_job: u64,
    running_counts: VecDeque<usize>,
    last_running: usize,
    running_jobs_reads: u64,
    fail_submits: u32,
    fail_add_columns: u32,
    fail_running_jobs: bool,
    tables: HashMap<String, BTreeSet<String>>,
    added_columns: Vec<(String, String, String)>,
}

/// Scriptable warehouse fake, always available for tests. Submissions consume
/// scripted job outcomes in order (defaulting to immediate success with an
/// unreported row count), `running_jobs` consumes scripted counts with the
/// last one repeating, and the column set behaves like a real additive-only
/// table.
#[derive(Default)]
pub struct MockWarehouseClient {
    inner: Mutex<Inner>,
}

impl MockWarehouseClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_job(&self, script: JobScript) {
        self.lock().scripts.push_back(script);
    }

    pub fn push_running_jobs(&self, count: usize) {
        self.lock().running_counts.push_back(count);
    }

    /// Make the next `n` submissions fail with a 503.
    pub fn set_fail_submits(&self, n: u32) {
        self.lock().fail_submits = n;
    }

    /// Make the next `n` column additions fail with a 500.
    pub fn set_fail_add_columns(&self, n: u32) {
        self.lock().fail_add_columns = n;
    }

    pub fn set_fail_running_jobs(&self, fail: bool) {
        self.lock().fail_running_jobs = fail;
    }

    pub fn with_table(self, table: &str, columns: &[&str]) -> Self {
        self.lock().tables.insert(
            table.to_owned(),
            columns.iter().map(|c| (*c).to_owned()).collect(),
        );
        self
    }

    pub fn submitted(&self) -> Vec<LoadStatement> {
        self.lock().submitted.clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.lock().submitted.len()
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|cols| cols.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn added_columns(&self) -> Vec<(String, String, String)> {
        self.lock().added_columns.clone()
    }

    pub fn running_jobs_reads(&self) -> u64 {
        self.lock().running_jobs_reads
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("MockWarehouseClient lock poisoned")
    }
}

#[async_trait]
impl WarehouseClient for MockWarehouseClient {
    async fn submit(&self, statement: &LoadStatement) -> Result<String, WarehouseError> {
        let mut inner = self.lock();
        if inner.fail_submits > 0 {
            inner.fail_submits -= 1;
            return Err(WarehouseError::Api {
                status: 503,
                message: "too many concurrent load jobs".to_owned(),
            });
        }

        inner.submitted.push(statement.clone());
        let id = format!("job-{}", inner.next_job);
        inner.next_job += 1;
        let script = inner.scripts.pop_front().unwrap_or_else(JobScript::succeed);
        inner.jobs.insert(id.clone(), JobEntry { script, polls: 0 });
        Ok(id)
    }

    async fn describe(&self, external_job_id: &str) -> Result<JobDescription, WarehouseError> {
        let mut inner = self.lock();
        let entry = inner
            .jobs
            .get_mut(external_job_id)
            .ok_or_else(|| WarehouseError::Protocol(format!("unknown job {external_job_id}")))?;

        if entry.polls < entry.script.polls_until_terminal {
            entry.polls += 1;
            return Ok(JobDescription {
                state: RemoteJobState::Running,
                rows_affected: None,
                error: None,
            });
        }

        Ok(JobDescription {
            state: entry.script.terminal,
            rows_affected: entry.script.rows_affected,
            error: entry.script.error.clone(),
        })
    }

    async fn running_jobs(&self) -> Result<usize, WarehouseError> {
        let mut inner = self.lock();
        inner.running_jobs_reads += 1;
        if inner.fail_running_jobs {
            return Err(WarehouseError::Api {
                status: 503,
                message: "job status unavailable".to_owned(),
            });
        }
        if let Some(count) = inner.running_counts.pop_front() {
            inner.last_running = count;
        }
        Ok(inner.last_running)
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        Ok(self.columns(table))
    }

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        ty: &str,
    ) -> Result<(), WarehouseError> {
        let mut inner = self.lock();
        if inner.fail_add_columns > 0 {
            inner.fail_add_columns -= 1;
            return Err(WarehouseError::Api {
                status: 500,
                message: "schema change failed".to_owned(),
            });
        }
        let columns = inner.tables.entry(table.to_owned()).or_default();
        if !columns.insert(column.to_owned()) {
            return Err(WarehouseError::ColumnExists(column.to_owned()));
        }
        inner
            .added_columns
            .push((table.to_owned(), column.to_owned(), ty.to_owned()));
        Ok(())
    }
}
