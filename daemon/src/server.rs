use common::{ErrorKind, Request, Response};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::api::{ApiError, JobApi};

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: UnixListener, api: Arc<JobApi>) -> anyhow::Result<()> {
    loop {
        let (socket, _) = listener.accept().await?;
        let api = api.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, api).await {
                log::error!("connection closed with error: {:#}", e);
            }
        });
    }
}

async fn handle_connection(socket: UnixStream, api: Arc<JobApi>) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    // Requests that arrived while an earlier one was still running.
    let mut pending = VecDeque::new();

    loop {
        let line = match pending.pop_front() {
            Some(line) => line,
            None => match lines.next_line().await? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                log::error!("failed to deserialize request; err = {:?}", e);
                let resp = Response::Error {
                    kind: ErrorKind::InvalidArgument,
                    message: format!("malformed request: {}", e),
                };
                send(&mut writer, &resp).await?;
                continue;
            }
        };

        log::debug!("Received request: {:?}", req);

        // The call is dropped, and with it any in-flight external call, as
        // soon as the client hangs up.
        let hung_up = {
            let call = respond(&api, req, &mut writer);
            tokio::pin!(call);
            loop {
                tokio::select! {
                    result = &mut call => {
                        result?;
                        break false;
                    }
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => pending.push_back(line),
                        Ok(None) => break true,
                        Err(e) => {
                            log::warn!("reading from client failed: {}", e);
                            break true;
                        }
                    },
                }
            }
        };
        if hung_up {
            log::info!("Client hung up, abandoning in-flight request");
            return Ok(());
        }
    }
    Ok(())
}

async fn respond<W>(api: &JobApi, req: Request, writer: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match req {
        Request::GetJobLogs { job_id, filter } => match api.get_job_logs(&job_id, filter).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next().await {
                    send(writer, &Response::LogEntry(entry)).await?;
                }
                send(writer, &Response::EndOfLogs).await
            }
            Err(e) => send(writer, &error_response(&e)).await,
        },
        Request::CreateJob(request) => {
            let resp = match api.create_job(request).await {
                Ok(job_id) => Response::JobCreated(job_id),
                Err(e) => error_response(&e),
            };
            send(writer, &resp).await
        }
        Request::InspectJob(job_id) => {
            let resp = match api.inspect_job(&job_id).await {
                Ok(info) => Response::Job(info),
                Err(e) => error_response(&e),
            };
            send(writer, &resp).await
        }
        Request::ListJobs(filter) => {
            let resp = match api.list_jobs(&filter).await {
                Ok(infos) => Response::JobList(infos),
                Err(e) => error_response(&e),
            };
            send(writer, &resp).await
        }
        Request::Metrics => send(writer, &Response::Metrics(api.metrics().export())).await,
    }
}

fn error_response(e: &ApiError) -> Response {
    Response::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, resp: &Response) -> anyhow::Result<()> {
    let mut bytes = serde_json::to_vec(resp)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlitePersist;
    use crate::launcher::{LaunchError, Launcher};
    use crate::metrics::MetricsCollector;
    use crate::persist::{PersistClient, PersistError};
    use async_trait::async_trait;
    use common::{
        Commit, JobFilter, JobId, JobLogEntry, JobOutput, JobRecord, JobRequest, JobStatusEvent,
        OutputStream, Pipeline, StreamFilter,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::Notify;

    struct AcceptAll;

    #[async_trait]
    impl Launcher for AcceptAll {
        async fn start_job(&self, _record: &JobRecord) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &std::path::Path) -> Self {
            let (reader, writer) = UnixStream::connect(path).await.unwrap().into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn call(&mut self, req: &Request) -> Response {
            self.send_raw(&serde_json::to_string(req).unwrap()).await;
            self.next().await
        }

        async fn next(&mut self) -> Response {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn spawn_server(
        persist: Arc<dyn PersistClient>,
        timeout: Duration,
    ) -> (tempfile::TempDir, Client) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobgate.sock");
        let api = Arc::new(JobApi::new(
            persist,
            Arc::new(AcceptAll),
            timeout,
            Arc::new(MetricsCollector::new()),
        ));
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, api));
        let client = Client::connect(&path).await;
        (dir, client)
    }

    async fn start() -> (tempfile::TempDir, Arc<SqlitePersist>, Client) {
        let persist = Arc::new(SqlitePersist::open_in_memory().unwrap());
        let (dir, client) = spawn_server(persist.clone(), Duration::from_secs(5)).await;
        (dir, persist, client)
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Record reads never finish on their own.
    #[derive(Default)]
    struct StallingPersist {
        entered: Notify,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PersistClient for StallingPersist {
        async fn create_job_record(&self, _record: &JobRecord) -> Result<(), PersistError> {
            Ok(())
        }

        async fn get_job_record(&self, job_id: &JobId) -> Result<JobRecord, PersistError> {
            let _guard = SetOnDrop(self.dropped.clone());
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(PersistError::NotFound(job_id.clone()))
        }

        async fn list_job_records(&self, _: &JobFilter) -> Result<Vec<JobRecord>, PersistError> {
            Ok(vec![])
        }

        async fn get_job_statuses(&self, _: &JobId) -> Result<Vec<JobStatusEvent>, PersistError> {
            Ok(vec![])
        }

        async fn get_job_output(&self, _: &JobId) -> Result<Option<JobOutput>, PersistError> {
            Ok(None)
        }

        async fn get_job_logs(&self, _: &JobId) -> Result<Vec<JobLogEntry>, PersistError> {
            Ok(vec![])
        }

        async fn create_job_status(
            &self,
            _: &JobId,
            _: &JobStatusEvent,
        ) -> Result<(), PersistError> {
            Ok(())
        }

        async fn create_job_output(&self, _: &JobOutput) -> Result<(), PersistError> {
            Ok(())
        }

        async fn create_job_log(&self, _: &JobLogEntry) -> Result<(), PersistError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_then_inspect_over_the_socket() {
        let (_dir, _persist, mut client) = start().await;

        let req = Request::CreateJob(JobRequest {
            input: Commit {
                repo: "in".to_string(),
                id: "c1".to_string(),
            },
            output_parent: None,
            transform: None,
            pipeline: Some(Pipeline { name: "p1".to_string() }),
        });
        let job_id = match client.call(&req).await {
            Response::JobCreated(id) => id,
            other => panic!("unexpected response: {:?}", other),
        };

        match client.call(&Request::InspectJob(job_id.clone())).await {
            Response::Job(info) => {
                assert_eq!(info.job_id, job_id);
                assert_eq!(info.spec, common::JobSpec::Pipeline("p1".to_string()));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match client.call(&Request::ListJobs(Default::default())).await {
            Response::JobList(infos) => assert_eq!(infos.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn errors_carry_their_kind() {
        let (_dir, _persist, mut client) = start().await;

        match client.call(&Request::InspectJob(JobId("missing".to_string()))).await {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("unexpected response: {:?}", other),
        }

        let neither = Request::CreateJob(JobRequest {
            input: Commit {
                repo: "in".to_string(),
                id: "c1".to_string(),
            },
            output_parent: None,
            transform: None,
            pipeline: None,
        });
        match client.call(&neither).await {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidArgument),
            other => panic!("unexpected response: {:?}", other),
        }

        client.send_raw("{not json").await;
        match client.next().await {
            Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidArgument),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn logs_arrive_as_entries_then_end_marker() {
        let (_dir, persist, mut client) = start().await;
        let job_id = JobId("j1".to_string());
        let lines = [
            (OutputStream::Stdout, "a"),
            (OutputStream::Stderr, "b"),
            (OutputStream::Stdout, "c"),
        ];
        for (stream, line) in lines {
            persist
                .create_job_log(&JobLogEntry {
                    job_id: job_id.clone(),
                    stream,
                    value: line.as_bytes().to_vec(),
                })
                .await
                .unwrap();
        }

        let req = Request::GetJobLogs {
            job_id,
            filter: StreamFilter::Only(OutputStream::Stdout),
        };
        client.send_raw(&serde_json::to_string(&req).unwrap()).await;

        let mut values = Vec::new();
        loop {
            match client.next().await {
                Response::LogEntry(entry) => values.push(entry.value),
                Response::EndOfLogs => break,
                other => panic!("unexpected response: {:?}", other),
            }
        }
        assert_eq!(values, vec![b"a".to_vec(), b"c".to_vec()]);

        match client.call(&Request::Metrics).await {
            Response::Metrics(text) => assert!(text.contains("operation=\"get_job_logs\"")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_hang_up_drops_the_in_flight_call() {
        let persist = Arc::new(StallingPersist::default());
        let (_dir, mut client) = spawn_server(persist.clone(), Duration::from_secs(60)).await;

        let req = Request::InspectJob(JobId("j1".to_string()));
        client.send_raw(&serde_json::to_string(&req).unwrap()).await;
        tokio::time::timeout(Duration::from_secs(5), persist.entered.notified())
            .await
            .unwrap();
        assert!(!persist.dropped.load(Ordering::SeqCst));

        drop(client);

        for _ in 0..40 {
            if persist.dropped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("in-flight read still running after the client went away");
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let (_dir, _persist, mut client) = start().await;

        let inspect = serde_json::to_string(&Request::InspectJob(JobId("x".to_string()))).unwrap();
        let metrics = serde_json::to_string(&Request::Metrics).unwrap();
        client.send_raw(&format!("{inspect}\n{inspect}\n{metrics}")).await;

        for _ in 0..2 {
            match client.next().await {
                Response::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
                other => panic!("unexpected response: {:?}", other),
            }
        }
        match client.next().await {
            Response::Metrics(text) => assert!(text.contains("operation=\"inspect_job\"")),
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
