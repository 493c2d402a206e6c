use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use common::{
    Commit, JobFilter, JobId, JobInfo, JobRequest, OutputStream, Pipeline, Request, Response,
    StreamFilter, Transform,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon socket
    #[arg(long, default_value = common::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a job from a transform or a pipeline
    Create {
        /// Input commit as repo/commit
        #[arg(short, long, value_parser = parse_commit)]
        input: Commit,
        /// Output parent commit as repo/commit
        #[arg(short, long, value_parser = parse_commit)]
        output_parent: Option<Commit>,
        /// Run a configured pipeline
        #[arg(short, long)]
        pipeline: Option<String>,
        /// Container image of the transform
        #[arg(long, default_value = "")]
        image: String,
        /// Line fed to the transform's stdin (repeatable)
        #[arg(long)]
        stdin: Vec<String>,
        /// Transform command
        #[arg(last = true)]
        cmd: Vec<String>,
    },
    /// Show one job
    Inspect {
        id: String,
    },
    /// List jobs
    List {
        #[arg(short, long)]
        pipeline: Option<String>,
        #[arg(long)]
        input_repo: Option<String>,
        /// Print CSV instead of a table
        #[arg(long)]
        csv: bool,
    },
    /// Print a job's logs
    Logs {
        id: String,
        #[arg(short, long, value_enum, default_value_t = StreamArg::All)]
        stream: StreamArg,
    },
    /// Print daemon metrics
    Metrics,
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamArg {
    All,
    Stdout,
    Stderr,
}

impl From<StreamArg> for StreamFilter {
    fn from(arg: StreamArg) -> Self {
        match arg {
            StreamArg::All => StreamFilter::All,
            StreamArg::Stdout => StreamFilter::Only(OutputStream::Stdout),
            StreamArg::Stderr => StreamFilter::Only(OutputStream::Stderr),
        }
    }
}

fn parse_commit(s: &str) -> Result<Commit, String> {
    match s.split_once('/') {
        Some((repo, id)) if !repo.is_empty() && !id.is_empty() => Ok(Commit {
            repo: repo.to_string(),
            id: id.to_string(),
        }),
        _ => Err(format!("expected repo/commit, got {:?}", s)),
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(path: &PathBuf) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to {}: {}", path.display(), e))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn send(&mut self, req: &Request) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec(req)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Response> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("daemon closed the connection"))?;
        Ok(serde_json::from_str(&line)?)
    }
}

fn latest_status(info: &JobInfo) -> String {
    info.latest_status()
        .map(|s| format!("{:?}", s.status))
        .unwrap_or_else(|| "-".to_string())
}

fn print_job(info: &JobInfo) {
    println!("Job Details:");
    println!("  ID:       {}", info.job_id);
    println!("  Input:    {}", info.input);
    if let Some(ref parent) = info.output_parent {
        println!("  Parent:   {}", parent);
    }
    println!("  Spec:     {}", info.spec);
    println!("  Created:  {}", info.created_at.to_rfc3339());
    match info.output {
        Some(ref output) => println!("  Output:   {}", output),
        None => println!("  Output:   -"),
    }
    println!("  Statuses:");
    for status in &info.statuses {
        println!("    {} {:?} {}", status.timestamp.to_rfc3339(), status.status, status.message);
    }
}

fn print_jobs(infos: &[JobInfo], as_csv: bool) -> anyhow::Result<()> {
    if as_csv {
        let mut wtr = csv::Writer::from_writer(std::io::stdout());
        wtr.write_record(["id", "spec", "input", "created_at", "status", "output"])?;
        for info in infos {
            wtr.write_record([
                info.job_id.to_string(),
                info.spec.to_string(),
                info.input.to_string(),
                info.created_at.to_rfc3339(),
                latest_status(info),
                info.output.as_ref().map(|o| o.to_string()).unwrap_or_default(),
            ])?;
        }
        wtr.flush()?;
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Spec", "Input", "Created", "Status", "Output"]);
    for info in infos {
        table.add_row(vec![
            info.job_id.to_string(),
            info.spec.to_string(),
            info.input.to_string(),
            info.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string(),
            latest_status(info),
            info.output.as_ref().map(|o| o.to_string()).unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut conn = Connection::open(&cli.socket).await?;
    let as_csv = matches!(cli.command, Commands::List { csv: true, .. });

    let req = match cli.command {
        Commands::Create { input, output_parent, pipeline, image, stdin, cmd } => {
            let transform = if cmd.is_empty() {
                None
            } else {
                Some(Transform { image, cmd, stdin })
            };
            Request::CreateJob(JobRequest {
                input,
                output_parent,
                transform,
                pipeline: pipeline.map(|name| Pipeline { name }),
            })
        }
        Commands::Inspect { id } => Request::InspectJob(JobId(id)),
        Commands::List { pipeline, input_repo, .. } => Request::ListJobs(JobFilter {
            pipeline,
            input_repo,
        }),
        Commands::Logs { id, stream } => Request::GetJobLogs {
            job_id: JobId(id),
            filter: stream.into(),
        },
        Commands::Metrics => Request::Metrics,
    };
    conn.send(&req).await?;

    let mut stdout = std::io::stdout().lock();
    loop {
        match conn.recv().await? {
            Response::JobCreated(id) => println!("{}", id),
            Response::Job(info) => print_job(&info),
            Response::JobList(infos) => print_jobs(&infos, as_csv)?,
            Response::LogEntry(entry) => {
                stdout.write_all(&entry.value)?;
                continue;
            }
            Response::EndOfLogs => stdout.flush()?,
            Response::Metrics(text) => print!("{}", text),
            Response::Error { kind, message } => {
                eprintln!("Error ({}): {}", kind, message);
                std::process::exit(1);
            }
        }
        break;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_parse_as_repo_slash_id() {
        assert_eq!(
            parse_commit("images/abc123"),
            Ok(Commit {
                repo: "images".to_string(),
                id: "abc123".to_string(),
            })
        );
        assert!(parse_commit("images").is_err());
        assert!(parse_commit("/abc").is_err());
        assert!(parse_commit("images/").is_err());
    }

    #[test]
    fn create_flags_parse() {
        let cli = Cli::try_parse_from([
            "jobgate", "create", "-i", "in/c1", "--image", "alpine", "--", "wc", "-l",
        ])
        .unwrap();
        match cli.command {
            Commands::Create { input, cmd, image, pipeline, .. } => {
                assert_eq!(input.repo, "in");
                assert_eq!(cmd, vec!["wc", "-l"]);
                assert_eq!(image, "alpine");
                assert!(pipeline.is_none());
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn stream_argument_maps_to_filter() {
        assert_eq!(StreamFilter::from(StreamArg::All), StreamFilter::All);
        assert_eq!(
            StreamFilter::from(StreamArg::Stderr),
            StreamFilter::Only(OutputStream::Stderr)
        );
    }
}
