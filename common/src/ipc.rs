use serde::{Deserialize, Serialize};
use crate::job::{JobFilter, JobId, JobInfo, JobLogEntry, JobRequest, StreamFilter};

/// One request per line, JSON encoded.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    CreateJob(JobRequest),
    InspectJob(JobId),
    ListJobs(JobFilter),
    GetJobLogs { job_id: JobId, filter: StreamFilter },
    Metrics,
}

/// Responses are also line delimited. `GetJobLogs` answers with zero or more
/// `LogEntry` lines followed by `EndOfLogs`, or a single `Error`.
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    JobCreated(JobId),
    Job(JobInfo),
    JobList(Vec<JobInfo>),
    LogEntry(JobLogEntry),
    EndOfLogs,
    Metrics(String),
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    UpstreamFailure,
    PartialAggregationFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::UpstreamFailure => "upstream failure",
            ErrorKind::PartialAggregationFailure => "partial aggregation failure",
        };
        f.write_str(s)
    }
}
