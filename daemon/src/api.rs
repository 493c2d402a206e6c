//! The job API facade.
//!
//! Creation launches first and persists second, with no rollback between the
//! two. Reads join a job's record, status history and output into a
//! [`JobInfo`] on every call.

use common::{
    ErrorKind, JobFilter, JobId, JobInfo, JobLogEntry, JobRecord, JobRequest, JobSpec, SpecError,
    StreamFilter,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::launcher::{LaunchError, Launcher};
use crate::metrics::MetricsCollector;
use crate::persist::{PersistClient, PersistError};

/// External call a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Launch,
    Persist,
    GetJobRecord,
    ListJobRecords,
    GetJobStatuses,
    GetJobOutput,
    GetJobLogs,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Launch => "launch",
            Step::Persist => "persist",
            Step::GetJobRecord => "get_job_record",
            Step::ListJobRecords => "list_job_records",
            Step::GetJobStatuses => "get_job_statuses",
            Step::GetJobOutput => "get_job_output",
            Step::GetJobLogs => "get_job_logs",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid job request {request:?}: {reason}")]
    InvalidArgument {
        request: Box<JobRequest>,
        reason: SpecError,
    },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("launching job {job_id} failed: {source}")]
    Launch {
        job_id: JobId,
        source: LaunchError,
    },

    /// The workload is running but has no durable record.
    #[error("job {job_id} was launched but persisting its record failed: {source}")]
    PersistAfterLaunch {
        job_id: JobId,
        source: PersistError,
    },

    #[error("{step} failed: {source}")]
    Upstream {
        step: Step,
        source: PersistError,
    },

    #[error("assembling job {job_id}: {step} failed: {source}")]
    Aggregation {
        job_id: JobId,
        step: Step,
        source: PersistError,
    },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Launch { .. }
            | ApiError::PersistAfterLaunch { .. }
            | ApiError::Upstream { .. } => ErrorKind::UpstreamFailure,
            ApiError::Aggregation { .. } => ErrorKind::PartialAggregationFailure,
        }
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            ApiError::InvalidArgument { .. } | ApiError::NotFound(_) => None,
            ApiError::Launch { .. } => Some(Step::Launch),
            ApiError::PersistAfterLaunch { .. } => Some(Step::Persist),
            ApiError::Upstream { step, .. } | ApiError::Aggregation { step, .. } => Some(*step),
        }
    }

    fn from_read(step: Step, source: PersistError) -> Self {
        match source {
            PersistError::NotFound(job_id) => ApiError::NotFound(job_id),
            source => ApiError::Upstream { step, source },
        }
    }
}

async fn with_deadline<T, E, F>(
    limit: Duration,
    call: F,
    elapsed: fn(Duration) -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(elapsed(limit)),
    }
}

/// Creation after validation: identity assigned, nothing external done yet.
struct Validated(JobRecord);

/// Creation after the launcher accepted the job.
struct Launched(JobRecord);

pub struct JobApi {
    persist: Arc<dyn PersistClient>,
    launcher: Arc<dyn Launcher>,
    timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl JobApi {
    pub fn new(
        persist: Arc<dyn PersistClient>,
        launcher: Arc<dyn Launcher>,
        timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            persist,
            launcher,
            timeout,
            metrics,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub async fn create_job(&self, request: JobRequest) -> Result<JobId, ApiError> {
        let start = Instant::now();
        let result = self.create_job_inner(request).await;
        self.observe("create_job", start, &result);
        result
    }

    async fn create_job_inner(&self, request: JobRequest) -> Result<JobId, ApiError> {
        let validated = Self::validate(request)?;
        let launched = self.launch(validated).await?;
        self.persist_record(launched).await
    }

    fn validate(request: JobRequest) -> Result<Validated, ApiError> {
        let spec = match JobSpec::from_parts(request.transform.clone(), request.pipeline.clone()) {
            Ok(spec) => spec,
            Err(reason) => {
                return Err(ApiError::InvalidArgument {
                    request: Box::new(request),
                    reason,
                })
            }
        };
        Ok(Validated(JobRecord {
            job_id: JobId::generate(),
            input: request.input,
            output_parent: request.output_parent,
            spec,
            created_at: chrono::Utc::now(),
        }))
    }

    async fn launch(&self, Validated(record): Validated) -> Result<Launched, ApiError> {
        let call = self.launcher.start_job(&record);
        let launched = with_deadline(self.timeout, call, LaunchError::Timeout).await;
        match launched {
            Ok(()) => Ok(Launched(record)),
            Err(source) => Err(ApiError::Launch {
                job_id: record.job_id,
                source,
            }),
        }
    }

    async fn persist_record(&self, Launched(record): Launched) -> Result<JobId, ApiError> {
        let call = self.persist.create_job_record(&record);
        let persisted = with_deadline(self.timeout, call, PersistError::Timeout).await;
        match persisted {
            Ok(()) => Ok(record.job_id),
            Err(source) => {
                log::error!(
                    "Orphaned launch: job {} ({}) is running without a stored record: {}",
                    record.job_id,
                    record.spec,
                    source
                );
                Err(ApiError::PersistAfterLaunch {
                    job_id: record.job_id,
                    source,
                })
            }
        }
    }

    pub async fn inspect_job(&self, job_id: &JobId) -> Result<JobInfo, ApiError> {
        let start = Instant::now();
        let result = async {
            let call = self.persist.get_job_record(job_id);
            let record = with_deadline(self.timeout, call, PersistError::Timeout)
                .await
                .map_err(|e| ApiError::from_read(Step::GetJobRecord, e))?;
            self.assemble(record).await
        }
        .await;
        self.observe("inspect_job", start, &result);
        result
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobInfo>, ApiError> {
        let start = Instant::now();
        let result = async {
            let call = self.persist.list_job_records(filter);
            let records = with_deadline(self.timeout, call, PersistError::Timeout)
                .await
                .map_err(|e| ApiError::from_read(Step::ListJobRecords, e))?;

            let mut infos = Vec::with_capacity(records.len());
            for record in records {
                infos.push(self.assemble(record).await?);
            }
            Ok::<_, ApiError>(infos)
        }
        .await;
        self.observe("list_jobs", start, &result);
        result
    }

    /// Fetches every stored log line once, then yields those matching
    /// `filter` in stored order.
    pub async fn get_job_logs(
        &self,
        job_id: &JobId,
        filter: StreamFilter,
    ) -> Result<BoxStream<'static, JobLogEntry>, ApiError> {
        let start = Instant::now();
        let call = self.persist.get_job_logs(job_id);
        let result = with_deadline(self.timeout, call, PersistError::Timeout)
            .await
            .map_err(|e| ApiError::from_read(Step::GetJobLogs, e));
        self.observe("get_job_logs", start, &result);

        let logs = result?;
        Ok(stream::iter(logs)
            .filter(move |entry| futures::future::ready(filter.matches(entry.stream)))
            .boxed())
    }

    // TODO: fetch statuses and outputs for a whole listing in one call each
    // once the persistence service offers batch reads.
    async fn assemble(&self, record: JobRecord) -> Result<JobInfo, ApiError> {
        let job_id = &record.job_id;
        let call = self.persist.get_job_statuses(job_id);
        let statuses = with_deadline(self.timeout, call, PersistError::Timeout)
            .await
            .map_err(|source| ApiError::Aggregation {
                job_id: job_id.clone(),
                step: Step::GetJobStatuses,
                source,
            })?;
        let call = self.persist.get_job_output(job_id);
        let output = with_deadline(self.timeout, call, PersistError::Timeout)
            .await
            .map_err(|source| ApiError::Aggregation {
                job_id: job_id.clone(),
                step: Step::GetJobOutput,
                source,
            })?;

        Ok(JobInfo {
            job_id: record.job_id,
            input: record.input,
            output_parent: record.output_parent,
            spec: record.spec,
            created_at: record.created_at,
            statuses,
            output: output.map(|o| o.output),
        })
    }

    fn observe<T>(&self, operation: &'static str, start: Instant, result: &Result<T, ApiError>) {
        let elapsed = start.elapsed();
        match result {
            Ok(_) => log::info!("{} ok in {:?}", operation, elapsed),
            Err(e) => log::error!("{} failed in {:?} ({}): {}", operation, elapsed, e.kind(), e),
        }
        self.metrics
            .record_call(operation, elapsed.as_millis() as u64, result.is_ok());
    }
}
