use rusqlite::{params, Connection, Result};
const SCHEMA_VERSION: i32 = 2;

pub struct Migrator<'a> {
    conn: &'a mut Connection,
}

impl<'a> Migrator<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn run_migrations(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.current_version()?;
        log::debug!("Current database schema version: {}", current_version);

        if current_version < SCHEMA_VERSION {
            log::info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);
            self.migrate_from(current_version)?;
        }

        Ok(())
    }

    pub fn current_version(&self) -> Result<i32> {
        let version: Option<i32> = self.conn.query_row(
            "SELECT MAX(version) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    fn migrate_from(&mut self, from_version: i32) -> Result<()> {
        let tx = self.conn.transaction()?;

        for version in (from_version + 1)..=SCHEMA_VERSION {
            log::info!("Applying migration to version {}", version);
            match version {
                1 => Self::migrate_to_v1(&tx)?,
                2 => Self::migrate_to_v2(&tx)?,
                _ => return Err(rusqlite::Error::InvalidQuery),
            }

            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![version],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn migrate_to_v1(tx: &rusqlite::Transaction) -> Result<()> {
        tx.execute(
            "CREATE TABLE IF NOT EXISTS job_records (
                job_id TEXT PRIMARY KEY,
                input_repo TEXT NOT NULL,
                input_commit TEXT NOT NULL,
                output_parent TEXT,
                spec TEXT NOT NULL,
                pipeline_name TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Row ids keep insertion order for statuses and logs.
        tx.execute(
            "CREATE TABLE IF NOT EXISTS job_statuses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS job_outputs (
                job_id TEXT PRIMARY KEY,
                output_repo TEXT NOT NULL,
                output_commit TEXT NOT NULL
            )",
            [],
        )?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS job_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                stream TEXT NOT NULL,
                value BLOB NOT NULL
            )",
            [],
        )?;

        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_statuses_job_id ON job_statuses(job_id)",
            [],
        )?;
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_logs_job_id ON job_logs(job_id)",
            [],
        )?;

        Ok(())
    }

    fn migrate_to_v2(tx: &rusqlite::Transaction) -> Result<()> {
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_records_pipeline ON job_records(pipeline_name)",
            [],
        )?;
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_records_created_at ON job_records(created_at)",
            [],
        )?;
        Ok(())
    }
}
