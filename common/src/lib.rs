pub mod ipc;
pub mod job;

pub use ipc::{ErrorKind, Request, Response};
pub use job::{
    Commit, JobFilter, JobId, JobInfo, JobLogEntry, JobOutput, JobRecord, JobRequest, JobSpec,
    JobStatusEvent, JobStatusType, OutputStream, Pipeline, SpecError, StreamFilter, Transform,
};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/jobgate/jobgate.sock";
pub const DEFAULT_DB_PATH: &str = "/var/lib/jobgate/jobgate.db";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobgate/config.yaml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/jobgate/daemon.log";
pub const DEFAULT_JOBS_LOG_FILE: &str = "/var/log/jobgate/jobs.log";

