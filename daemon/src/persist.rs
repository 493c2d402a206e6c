//! Persistence service port.
//!
//! The facade reads job records and their sub-records through this trait; the
//! launcher writes status events, outputs and log lines through it.

use async_trait::async_trait;
use common::{JobFilter, JobId, JobLogEntry, JobOutput, JobRecord, JobStatusEvent};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("persistence call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

#[async_trait]
pub trait PersistClient: Send + Sync {
    async fn create_job_record(&self, record: &JobRecord) -> Result<(), PersistError>;

    async fn get_job_record(&self, job_id: &JobId) -> Result<JobRecord, PersistError>;

    /// Records matching `filter`, oldest first.
    async fn list_job_records(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, PersistError>;

    /// Status events in the order they were stored.
    async fn get_job_statuses(&self, job_id: &JobId) -> Result<Vec<JobStatusEvent>, PersistError>;

    async fn get_job_output(&self, job_id: &JobId) -> Result<Option<JobOutput>, PersistError>;

    /// Every stored log line for the job, in stored order.
    async fn get_job_logs(&self, job_id: &JobId) -> Result<Vec<JobLogEntry>, PersistError>;

    async fn create_job_status(
        &self,
        job_id: &JobId,
        event: &JobStatusEvent,
    ) -> Result<(), PersistError>;

    async fn create_job_output(&self, output: &JobOutput) -> Result<(), PersistError>;

    async fn create_job_log(&self, entry: &JobLogEntry) -> Result<(), PersistError>;
}
