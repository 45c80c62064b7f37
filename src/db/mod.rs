use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::oneshot;

mod migrations;

use migrations::run_migrations;

use crate::attendance::AttendanceReport;
use crate::models::{SessionRow, SessionStatus};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn status_from_str(value: &str) -> Result<SessionStatus> {
    match value {
        "Running" => Ok(SessionStatus::Running),
        "Completed" => Ok(SessionStatus::Completed),
        "Interrupted" => Ok(SessionStatus::Interrupted),
        _ => Err(anyhow!("unknown session status '{value}'")),
    }
}

fn row_to_session(row: &Row) -> Result<SessionRow> {
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let status: String = row.get("status")?;
    let registered_count: i64 = row.get("registered_count")?;
    let max_observed: i64 = row.get("max_observed")?;
    let min_observed: i64 = row.get("min_observed")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(SessionRow {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at)?,
        stopped_at: stopped_at.as_deref().map(parse_datetime).transpose()?,
        status: status_from_str(&status)?,
        registered_count: u32::try_from(registered_count)
            .map_err(|_| anyhow!("registered_count {registered_count} out of range"))?,
        max_observed: u32::try_from(max_observed)
            .map_err(|_| anyhow!("max_observed {max_observed} out of range"))?,
        min_observed: u32::try_from(min_observed)
            .map_err(|_| anyhow!("min_observed {min_observed} out of range"))?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

/// Handle to the dedicated database worker thread. All SQLite access runs on
/// that thread; async callers submit closures and await the reply.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("roomsense-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    pub async fn insert_session(&self, session: &SessionRow) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, started_at, stopped_at, status, registered_count, max_observed, min_observed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.started_at.to_rfc3339(),
                    record.stopped_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.status.as_str(),
                    record.registered_count,
                    record.max_observed,
                    record.min_observed,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert session")?;
            Ok(())
        })
        .await
    }

    /// Write the final extrema and durations for a stopped session.
    pub async fn finalize_session(
        &self,
        report: &AttendanceReport,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let report = report.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE sessions
                 SET stopped_at = ?1,
                     status = ?2,
                     max_observed = ?3,
                     min_observed = ?4,
                     updated_at = ?5
                 WHERE id = ?6",
                params![
                    report.stopped_at.to_rfc3339(),
                    SessionStatus::Completed.as_str(),
                    report.max_observed as i64,
                    report.min_observed as i64,
                    updated_at.to_rfc3339(),
                    report.session_id,
                ],
            )
            .with_context(|| "failed to finalize session")?;

            {
                let mut insert = tx.prepare(
                    "INSERT INTO attendance_records (session_id, identity, stable, first_seen, last_seen, duration_secs)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for body in &report.bodies {
                    insert.execute(params![
                        report.session_id,
                        body.identity.to_string(),
                        body.identity.is_stable(),
                        body.first_seen.to_rfc3339(),
                        body.last_seen.to_rfc3339(),
                        body.duration_secs,
                    ])?;
                }
            }

            tx.commit().context("failed to commit session finalization")?;
            Ok(())
        })
        .await
    }

    pub async fn mark_session_interrupted(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     stopped_at = COALESCE(stopped_at, ?2),
                     updated_at = ?2
                 WHERE id = ?3",
                params![
                    SessionStatus::Interrupted.as_str(),
                    now.to_rfc3339(),
                    session_id,
                ],
            )
            .with_context(|| "failed to mark session interrupted")?;
            Ok(())
        })
        .await
    }

    /// A session left in Running state by a crashed process, if any.
    pub async fn get_incomplete_session(&self) -> Result<Option<SessionRow>> {
        self.execute(|conn| {
            let session = conn
                .query_row(
                    "SELECT * FROM sessions WHERE status = 'Running' ORDER BY started_at DESC LIMIT 1",
                    [],
                    |row| Ok(row_to_session(row)),
                )
                .optional()?
                .transpose()?;
            Ok(session)
        })
        .await
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRow>> {
        self.execute(move |conn| {
            let mut statement = conn.prepare(
                "SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?1",
            )?;
            let rows = statement.query_map(params![limit as i64], |row| Ok(row_to_session(row)))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row??);
            }
            Ok(sessions)
        })
        .await
    }
}
