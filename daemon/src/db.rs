use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    Commit, JobFilter, JobId, JobLogEntry, JobOutput, JobRecord, JobSpec, JobStatusEvent,
    JobStatusType, OutputStream,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::migrations::Migrator;
use crate::persist::{PersistClient, PersistError};

/// SQLite-backed persistence service.
pub struct SqlitePersist {
    conn: Mutex<Connection>,
}

impl SqlitePersist {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, PersistError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, PersistError> {
        Migrator::new(&mut conn).run_migrations()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistError> {
        self.conn
            .lock()
            .map_err(|_| PersistError::Database("connection mutex poisoned".to_string()))
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

struct RecordRow {
    job_id: String,
    input_repo: String,
    input_commit: String,
    output_parent: Option<String>,
    spec: String,
    created_at: String,
}

impl RecordRow {
    const COLUMNS: &'static str =
        "job_id, input_repo, input_commit, output_parent, spec, created_at";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            input_repo: row.get(1)?,
            input_commit: row.get(2)?,
            output_parent: row.get(3)?,
            spec: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, PersistError> {
        let spec: JobSpec = serde_json::from_str(&self.spec)
            .map_err(|e| PersistError::Corrupt(format!("job {} spec: {}", self.job_id, e)))?;
        let output_parent = match self.output_parent {
            Some(json) => Some(serde_json::from_str::<Commit>(&json).map_err(|e| {
                PersistError::Corrupt(format!("job {} output parent: {}", self.job_id, e))
            })?),
            None => None,
        };
        Ok(JobRecord {
            input: Commit {
                repo: self.input_repo,
                id: self.input_commit,
            },
            output_parent,
            spec,
            created_at: parse_time(&self.created_at)?,
            job_id: JobId(self.job_id),
        })
    }
}

#[async_trait]
impl PersistClient for SqlitePersist {
    async fn create_job_record(&self, record: &JobRecord) -> Result<(), PersistError> {
        let spec_json = serde_json::to_string(&record.spec)
            .map_err(|e| PersistError::Corrupt(e.to_string()))?;
        let output_parent_json = record
            .output_parent
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PersistError::Corrupt(e.to_string()))?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO job_records
                (job_id, input_repo, input_commit, output_parent, spec, pipeline_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.job_id.0,
                record.input.repo,
                record.input.id,
                output_parent_json,
                spec_json,
                record.spec.pipeline_name(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(PersistError::AlreadyExists(record.job_id.clone()));
        }
        Ok(())
    }

    async fn get_job_record(&self, job_id: &JobId) -> Result<JobRecord, PersistError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM job_records WHERE job_id = ?1", RecordRow::COLUMNS),
                params![job_id.0],
                RecordRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_record(),
            None => Err(PersistError::NotFound(job_id.clone())),
        }
    }

    async fn list_job_records(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, PersistError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_records
             WHERE (?1 IS NULL OR pipeline_name = ?1)
               AND (?2 IS NULL OR input_repo = ?2)
             ORDER BY created_at, job_id",
            RecordRow::COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![filter.pipeline, filter.input_repo],
            RecordRow::from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    async fn get_job_statuses(&self, job_id: &JobId) -> Result<Vec<JobStatusEvent>, PersistError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, timestamp, message FROM job_statuses WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut statuses = Vec::new();
        for row in rows {
            let (status, timestamp, message) = row?;
            let status = JobStatusType::parse(&status)
                .ok_or_else(|| PersistError::Corrupt(format!("unknown status type {:?}", status)))?;
            statuses.push(JobStatusEvent {
                status,
                timestamp: parse_time(&timestamp)?,
                message,
            });
        }
        Ok(statuses)
    }

    async fn get_job_output(&self, job_id: &JobId) -> Result<Option<JobOutput>, PersistError> {
        let conn = self.conn()?;
        let output = conn
            .query_row(
                "SELECT output_repo, output_commit FROM job_outputs WHERE job_id = ?1",
                params![job_id.0],
                |row| {
                    Ok(Commit {
                        repo: row.get(0)?,
                        id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(output.map(|output| JobOutput {
            job_id: job_id.clone(),
            output,
        }))
    }

    async fn get_job_logs(&self, job_id: &JobId) -> Result<Vec<JobLogEntry>, PersistError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT stream, value FROM job_logs WHERE job_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![job_id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut logs = Vec::new();
        for row in rows {
            let (stream, value) = row?;
            let stream = OutputStream::parse(&stream).ok_or_else(|| {
                PersistError::Corrupt(format!("unknown output stream {:?}", stream))
            })?;
            logs.push(JobLogEntry {
                job_id: job_id.clone(),
                stream,
                value,
            });
        }
        Ok(logs)
    }

    async fn create_job_status(
        &self,
        job_id: &JobId,
        event: &JobStatusEvent,
    ) -> Result<(), PersistError> {
        self.conn()?.execute(
            "INSERT INTO job_statuses (job_id, status, timestamp, message) VALUES (?1, ?2, ?3, ?4)",
            params![
                job_id.0,
                event.status.as_str(),
                event.timestamp.to_rfc3339(),
                event.message
            ],
        )?;
        Ok(())
    }

    async fn create_job_output(&self, output: &JobOutput) -> Result<(), PersistError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO job_outputs (job_id, output_repo, output_commit)
             VALUES (?1, ?2, ?3)",
            params![output.job_id.0, output.output.repo, output.output.id],
        )?;
        Ok(())
    }

    async fn create_job_log(&self, entry: &JobLogEntry) -> Result<(), PersistError> {
        self.conn()?.execute(
            "INSERT INTO job_logs (job_id, stream, value) VALUES (?1, ?2, ?3)",
            params![entry.job_id.0, entry.stream.as_str(), entry.value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::{JobStatusType, Transform};

    fn record(id: &str, spec: JobSpec, minute: u32) -> JobRecord {
        JobRecord {
            job_id: JobId(id.to_string()),
            input: Commit {
                repo: "images".to_string(),
                id: "c1".to_string(),
            },
            output_parent: None,
            spec,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    fn transform() -> JobSpec {
        JobSpec::Transform(Transform {
            image: "alpine".to_string(),
            cmd: vec!["echo".to_string(), "hi".to_string()],
            stdin: vec![],
        })
    }

    #[tokio::test]
    async fn record_round_trips_with_spec_variant() {
        let db = SqlitePersist::open_in_memory().unwrap();
        let mut rec = record("j1", JobSpec::Pipeline("p1".to_string()), 0);
        rec.output_parent = Some(Commit {
            repo: "out".to_string(),
            id: "base".to_string(),
        });
        db.create_job_record(&rec).await.unwrap();

        assert_eq!(db.get_job_record(&rec.job_id).await.unwrap(), rec);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let db = SqlitePersist::open_in_memory().unwrap();
        let err = db.get_job_record(&JobId("nope".to_string())).await.unwrap_err();
        assert!(matches!(err, PersistError::NotFound(id) if id.0 == "nope"));
    }

    #[tokio::test]
    async fn duplicate_record_is_rejected() {
        let db = SqlitePersist::open_in_memory().unwrap();
        let rec = record("j1", transform(), 0);
        db.create_job_record(&rec).await.unwrap();
        let err = db.create_job_record(&rec).await.unwrap_err();
        assert!(matches!(err, PersistError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn list_orders_by_creation_and_applies_filter() {
        let db = SqlitePersist::open_in_memory().unwrap();
        db.create_job_record(&record("late", JobSpec::Pipeline("p1".to_string()), 5))
            .await
            .unwrap();
        db.create_job_record(&record("early", transform(), 1)).await.unwrap();
        db.create_job_record(&record("mid", JobSpec::Pipeline("p2".to_string()), 3))
            .await
            .unwrap();

        let all = db.list_job_records(&JobFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.job_id.0.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);

        let p1 = db
            .list_job_records(&JobFilter {
                pipeline: Some("p1".to_string()),
                input_repo: None,
            })
            .await
            .unwrap();
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].job_id.0, "late");

        let other_repo = db
            .list_job_records(&JobFilter {
                pipeline: None,
                input_repo: Some("other".to_string()),
            })
            .await
            .unwrap();
        assert!(other_repo.is_empty());
    }

    #[tokio::test]
    async fn statuses_and_logs_keep_stored_order() {
        let db = SqlitePersist::open_in_memory().unwrap();
        let id = JobId("j1".to_string());
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        // Stored out of timestamp order on purpose.
        let events = vec![
            JobStatusEvent {
                status: JobStatusType::Success,
                timestamp: t1 + Duration::seconds(10),
                message: "done".to_string(),
            },
            JobStatusEvent {
                status: JobStatusType::Started,
                timestamp: t1,
                message: String::new(),
            },
        ];
        for event in &events {
            db.create_job_status(&id, event).await.unwrap();
        }
        assert_eq!(db.get_job_statuses(&id).await.unwrap(), events);

        for (stream, line) in [
            (OutputStream::Stdout, "a"),
            (OutputStream::Stderr, "b"),
            (OutputStream::Stdout, "c"),
        ] {
            db.create_job_log(&JobLogEntry {
                job_id: id.clone(),
                stream,
                value: line.as_bytes().to_vec(),
            })
            .await
            .unwrap();
        }
        let values: Vec<_> = db
            .get_job_logs(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn output_is_absent_until_written() {
        let db = SqlitePersist::open_in_memory().unwrap();
        let id = JobId("j1".to_string());
        assert_eq!(db.get_job_output(&id).await.unwrap(), None);

        let output = JobOutput {
            job_id: id.clone(),
            output: Commit {
                repo: "out".to_string(),
                id: "j1".to_string(),
            },
        };
        db.create_job_output(&output).await.unwrap();
        assert_eq!(db.get_job_output(&id).await.unwrap(), Some(output));
    }
}
