use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::Connection;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::connection::{DatabaseConnector, DumpSession};

const STDERR_TAIL_LINES: usize = 20;
const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens MySQL sessions whose export is produced by `mysqldump`.
pub struct MysqlConnector {
    mysqldump_path: PathBuf,
}

impl MysqlConnector {
    pub fn new(mysqldump_path: impl Into<PathBuf>) -> Self {
        Self {
            mysqldump_path: mysqldump_path.into(),
        }
    }
}

#[async_trait]
impl DatabaseConnector for MysqlConnector {
    type Session = MysqlDumpSession;

    async fn open(&self, config: &DatabaseConfig) -> anyhow::Result<MysqlDumpSession> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(config.password.expose())
            .database(&config.name);

        let mut conn = MySqlConnection::connect_with(&options)
            .await
            .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;

        let version: String = sqlx::query_scalar("SELECT VERSION()")
            .fetch_one(&mut conn)
            .await
            .context("Failed to query server version")?;
        info!(server_version = %version, database = %config.name, "Opened database session");

        Ok(MysqlDumpSession {
            conn: Some(conn),
            child: None,
            stdout: None,
            stderr_tail: Arc::new(Mutex::new(Vec::new())),
            stderr_task: None,
            config: config.clone(),
            mysqldump_path: self.mysqldump_path.clone(),
        })
    }
}

pub struct MysqlDumpSession {
    conn: Option<MySqlConnection>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<Vec<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    config: DatabaseConfig,
    mysqldump_path: PathBuf,
}

impl MysqlDumpSession {
    fn dump_command(&self) -> Command {
        let mut command = Command::new(&self.mysqldump_path);
        command
            .arg(format!("--host={}", self.config.host))
            .arg(format!("--port={}", self.config.port))
            .arg(format!("--user={}", self.config.user))
            // InnoDB consistent read: the dump sees the database as of its first statement.
            .arg("--single-transaction")
            .arg("--skip-lock-tables")
            .arg("--quick")
            .arg("--routines")
            .arg("--triggers")
            .arg("--events")
            .arg("--no-tablespaces")
            .arg(&self.config.name)
            .env("MYSQL_PWD", self.config.password.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn stderr_summary(&self) -> String {
        match self.stderr_tail.lock() {
            Ok(lines) if !lines.is_empty() => lines.join("\n"),
            _ => "no diagnostics on stderr".to_string(),
        }
    }

    async fn finish_child(&mut self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().await.context("Failed to wait for mysqldump")?;
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        if !status.success() {
            bail!("mysqldump exited with {}: {}", status, self.stderr_summary());
        }
        Ok(())
    }
}

#[async_trait]
impl DumpSession for MysqlDumpSession {
    async fn begin_export(&mut self) -> anyhow::Result<()> {
        let conn = self
            .conn
            .as_mut()
            .context("Database session is already closed")?;

        let schema: Option<String> = sqlx::query_scalar(
            "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(self.config.name.as_str())
        .fetch_optional(conn)
        .await
        .context("Failed to look up the target schema")?;
        if schema.is_none() {
            bail!("Database {} does not exist", self.config.name);
        }

        let mut child = self.dump_command().spawn().with_context(|| {
            format!("Failed to execute {}", self.mysqldump_path.display())
        })?;
        info!(
            program = %self.mysqldump_path.display(),
            database = %self.config.name,
            "Started mysqldump"
        );

        self.stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            let tail = self.stderr_tail.clone();
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "mysqldump stderr");
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                }
            }));
        }
        self.child = Some(child);
        Ok(())
    }

    async fn read_chunk(&mut self, max_len: usize) -> anyhow::Result<Option<Bytes>> {
        let stdout = self
            .stdout
            .as_mut()
            .context("Export has not been started")?;

        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            let read = stdout
                .read(&mut buf[filled..])
                .await
                .context("Failed to read mysqldump output")?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);

        if buf.is_empty() {
            self.stdout = None;
            self.finish_child().await?;
            return Ok(None);
        }
        Ok(Some(Bytes::from(buf)))
    }

    async fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Some(Err(e)) = bounded("kill mysqldump", child.kill()).await {
                warn!(error = %e, "Failed to kill mysqldump");
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(conn) = self.conn.take() {
            if let Some(Err(e)) = bounded("close database connection", conn.close()).await {
                warn!(error = %e, "Failed to close database connection cleanly");
            }
            info!(database = %self.config.name, "Closed database session");
        }
    }
}

/// Runs one cleanup step, giving up after [`CLOSE_STEP_TIMEOUT`].
async fn bounded<F: Future>(step: &str, fut: F) -> Option<F::Output> {
    match tokio::time::timeout(CLOSE_STEP_TIMEOUT, fut).await {
        Ok(output) => Some(output),
        Err(_) => {
            warn!(
                step,
                timeout_ms = CLOSE_STEP_TIMEOUT.as_millis() as u64,
                "Cleanup step timed out"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_step_gives_up_on_hung_peer() {
        let started = tokio::time::Instant::now();
        let result = bounded("close database connection", std::future::pending::<()>()).await;

        assert_eq!(result, None);
        assert!(started.elapsed() >= CLOSE_STEP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_cleanup_step_returns_output() {
        assert_eq!(bounded("kill mysqldump", async { 7 }).await, Some(7));
    }
}
