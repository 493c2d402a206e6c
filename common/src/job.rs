use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl JobId {
    /// New globally unique id, 32 hex chars without dashes.
    pub fn generate() -> Self {
        JobId(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a commit in a data repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    pub repo: String,
    pub id: String,
}

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repo, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Transform {
    pub image: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub stdin: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
}

/// What a job runs: an inline transform or a reference to a named pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobSpec {
    Transform(Transform),
    Pipeline(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("both transform and pipeline are not set")]
    Neither,
    #[error("both transform and pipeline are set")]
    Both,
}

impl JobSpec {
    pub fn from_parts(
        transform: Option<Transform>,
        pipeline: Option<Pipeline>,
    ) -> Result<Self, SpecError> {
        match (transform, pipeline) {
            (Some(transform), None) => Ok(JobSpec::Transform(transform)),
            (None, Some(pipeline)) => Ok(JobSpec::Pipeline(pipeline.name)),
            (None, None) => Err(SpecError::Neither),
            (Some(_), Some(_)) => Err(SpecError::Both),
        }
    }

    pub fn pipeline_name(&self) -> Option<&str> {
        match self {
            JobSpec::Pipeline(name) => Some(name),
            JobSpec::Transform(_) => None,
        }
    }
}

impl std::fmt::Display for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobSpec::Transform(t) => write!(f, "transform({}: {})", t.image, t.cmd.join(" ")),
            JobSpec::Pipeline(name) => write!(f, "pipeline({})", name),
        }
    }
}

/// Job-definition request as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRequest {
    pub input: Commit,
    #[serde(default)]
    pub output_parent: Option<Commit>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
}

/// Durable job record. Written once at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub input: Commit,
    pub output_parent: Option<Commit>,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatusType {
    Started,
    Error,
    Success,
}

impl JobStatusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatusType::Started => "started",
            JobStatusType::Error => "error",
            JobStatusType::Success => "success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(JobStatusType::Started),
            "error" => Some(JobStatusType::Error),
            "success" => Some(JobStatusType::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusEvent {
    pub status: JobStatusType,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl JobStatusEvent {
    pub fn now(status: JobStatusType, message: impl Into<String>) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOutput {
    pub job_id: JobId,
    pub output: Commit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(OutputStream::Stdout),
            "stderr" => Some(OutputStream::Stderr),
            _ => None,
        }
    }
}

/// Which log streams a caller wants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StreamFilter {
    #[default]
    All,
    Only(OutputStream),
}

impl StreamFilter {
    pub fn matches(&self, stream: OutputStream) -> bool {
        match self {
            StreamFilter::All => true,
            StreamFilter::Only(wanted) => *wanted == stream,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobLogEntry {
    pub job_id: JobId,
    pub stream: OutputStream,
    pub value: Vec<u8>,
}

/// Unified read-side view of a job. Assembled per request, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: JobId,
    pub input: Commit,
    pub output_parent: Option<Commit>,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
    pub statuses: Vec<JobStatusEvent>,
    pub output: Option<Commit>,
}

impl JobInfo {
    pub fn latest_status(&self) -> Option<&JobStatusEvent> {
        self.statuses.last()
    }
}

/// Listing filter. Interpreted by the persistence service only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobFilter {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub input_repo: Option<String>,
}
