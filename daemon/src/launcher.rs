use async_trait::async_trait;
use common::{
    Commit, JobId, JobLogEntry, JobOutput, JobRecord, JobSpec, JobStatusEvent, JobStatusType,
    OutputStream, Transform,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{LauncherConfig, PipelineDef};
use crate::logging::JOB_OUTPUT_TARGET;
use crate::persist::PersistClient;

/// Repo used for outputs of jobs created without an output parent.
pub const DEFAULT_OUTPUT_REPO: &str = "out";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("pipeline {0:?} is not defined")]
    UnknownPipeline(String),

    #[error("transform has an empty command")]
    InvalidTransform,

    #[error("launcher is at capacity ({0} jobs running)")]
    AtCapacity(usize),

    #[error("failed to spawn job process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("launch timed out after {0:?}")]
    Timeout(Duration),
}

/// Starts a job's workload. Success means the workload was handed to the
/// cluster; nothing about its eventual outcome.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start_job(&self, record: &JobRecord) -> Result<(), LaunchError>;
}

/// Handle on the local execution "cluster": where jobs run, which pipelines
/// it knows, and how many jobs may run at once.
pub struct LocalCluster {
    work_dir: Option<PathBuf>,
    pipelines: HashMap<String, Transform>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl LocalCluster {
    pub fn new(config: &LauncherConfig, pipelines: &[PipelineDef]) -> Self {
        let max_concurrent = config.max_concurrent_jobs.max(1) as usize;
        Self {
            work_dir: config.work_dir.clone(),
            pipelines: pipelines
                .iter()
                .map(|p| (p.name.clone(), p.transform.clone()))
                .collect(),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    fn resolve(&self, spec: &JobSpec) -> Result<Transform, LaunchError> {
        let transform = match spec {
            JobSpec::Transform(t) => t.clone(),
            JobSpec::Pipeline(name) => self
                .pipelines
                .get(name)
                .cloned()
                .ok_or_else(|| LaunchError::UnknownPipeline(name.clone()))?,
        };
        if transform.cmd.is_empty() || transform.cmd[0].is_empty() {
            return Err(LaunchError::InvalidTransform);
        }
        Ok(transform)
    }
}

/// Runs each job's transform as a child process and reports its status,
/// output and log lines to the persistence service.
pub struct ProcessLauncher {
    cluster: LocalCluster,
    persist: Arc<dyn PersistClient>,
}

impl ProcessLauncher {
    pub fn new(cluster: LocalCluster, persist: Arc<dyn PersistClient>) -> Self {
        Self { cluster, persist }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start_job(&self, record: &JobRecord) -> Result<(), LaunchError> {
        let transform = self.cluster.resolve(&record.spec)?;
        let permit = self
            .cluster
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| LaunchError::AtCapacity(self.cluster.max_concurrent))?;

        log::info!(
            "Starting job {} ({}) on input {}",
            record.job_id,
            record.spec,
            record.input
        );
        if !transform.image.is_empty() {
            log::debug!(
                "Job {} runs locally, image {} is not pulled",
                record.job_id,
                transform.image
            );
        }

        let mut cmd = Command::new(&transform.cmd[0]);
        cmd.args(&transform.cmd[1..]);
        cmd.env("JOBGATE_JOB_ID", &record.job_id.0);
        cmd.env("JOBGATE_INPUT_REPO", &record.input.repo);
        cmd.env("JOBGATE_INPUT_COMMIT", &record.input.id);
        if let Some(ref dir) = self.cluster.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if transform.stdin.is_empty() { Stdio::null() } else { Stdio::piped() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn()?;

        tokio::spawn(run_to_completion(
            child,
            record.clone(),
            transform.stdin,
            self.persist.clone(),
            permit,
        ));
        Ok(())
    }
}

async fn run_to_completion(
    mut child: Child,
    record: JobRecord,
    stdin_lines: Vec<String>,
    persist: Arc<dyn PersistClient>,
    _permit: OwnedSemaphorePermit,
) {
    let job_id = record.job_id.clone();
    record_status(persist.as_ref(), &job_id, JobStatusType::Started, String::new()).await;

    let stdout = child.stdout.take().map(|out| {
        let forward = forward_output(out, job_id.clone(), OutputStream::Stdout, persist.clone());
        tokio::spawn(forward)
    });
    let stderr = child.stderr.take().map(|err| {
        let forward = forward_output(err, job_id.clone(), OutputStream::Stderr, persist.clone());
        tokio::spawn(forward)
    });

    if let Some(mut stdin) = child.stdin.take() {
        for line in &stdin_lines {
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await
            };
            if let Err(e) = written.await {
                log::warn!("Job {}: failed to write stdin: {}", job_id, e);
                break;
            }
        }
    }

    let status = child.wait().await;
    for reader in [stdout, stderr].into_iter().flatten() {
        if let Err(e) = reader.await {
            log::warn!("Job {}: output forwarder failed: {}", job_id, e);
        }
    }

    match status {
        Ok(status) if status.success() => {
            log::info!("Job {} finished with status: {}", job_id, status);
            let output = JobOutput {
                job_id: job_id.clone(),
                output: Commit {
                    repo: record
                        .output_parent
                        .as_ref()
                        .map(|parent| parent.repo.clone())
                        .unwrap_or_else(|| DEFAULT_OUTPUT_REPO.to_string()),
                    id: job_id.0.clone(),
                },
            };
            if let Err(e) = persist.create_job_output(&output).await {
                log::error!("Job {}: failed to record output: {}", job_id, e);
            }
            let message = status.to_string();
            record_status(persist.as_ref(), &job_id, JobStatusType::Success, message).await;
        }
        Ok(status) => {
            log::warn!("Job {} finished with status: {}", job_id, status);
            let message = status.to_string();
            record_status(persist.as_ref(), &job_id, JobStatusType::Error, message).await;
        }
        Err(e) => {
            log::error!("Job {} failed to wait: {}", job_id, e);
            let message = format!("Failed to wait: {}", e);
            record_status(persist.as_ref(), &job_id, JobStatusType::Error, message).await;
        }
    }
}

/// Stores the stream as one log entry per line, bytes kept exactly as the
/// process wrote them (line terminator included, no UTF-8 requirement).
async fn forward_output<R>(
    reader: R,
    job_id: JobId,
    stream: OutputStream,
    persist: Arc<dyn PersistClient>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut value = Vec::new();
        match reader.read_until(b'\n', &mut value).await {
            Ok(0) => break,
            Ok(_) => {
                log::info!(
                    target: JOB_OUTPUT_TARGET,
                    "Job {} [{}] {}",
                    job_id,
                    stream.as_str(),
                    String::from_utf8_lossy(&value).trim_end()
                );
                let entry = JobLogEntry {
                    job_id: job_id.clone(),
                    stream,
                    value,
                };
                if let Err(e) = persist.create_job_log(&entry).await {
                    log::error!("Job {}: failed to store {} line: {}", job_id, stream.as_str(), e);
                }
            }
            Err(e) => {
                log::warn!("Job {}: reading {} failed: {}", job_id, stream.as_str(), e);
                break;
            }
        }
    }
}

async fn record_status(
    persist: &dyn PersistClient,
    job_id: &JobId,
    status: JobStatusType,
    message: String,
) {
    let event = JobStatusEvent::now(status, message);
    if let Err(e) = persist.create_job_status(job_id, &event).await {
        log::error!("Job {}: failed to record {} status: {}", job_id, status.as_str(), e);
    }
}
