//! Real server processes
//!
//! `ProcessNode` runs the configured server binary with the Raft module loaded
//! and talks to it over its native protocol through a multiplexed `redis`
//! connection. The child is spawned with `kill_on_drop`, so dropping the
//! backend always reaps the process.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::{Command, Reply};
use crate::config::{HarnessConfig, ServerConfig};
use crate::error::{HarnessError, Result};

use super::traits::{BackendFactory, LaunchSpec, NodeBackend};
use super::NodeId;

/// File in the node's data dir receiving its stdout/stderr
const LOG_FILE: &str = "node.log";

/// Creates [`ProcessNode`] backends sharing one server configuration
#[derive(Clone, Debug)]
pub struct ProcessFactory {
    server: ServerConfig,
    request_timeout: Duration,
    stop_timeout: Duration,
}

impl ProcessFactory {
    pub fn new(config: &HarnessConfig) -> Self {
        ProcessFactory {
            server: config.server.clone(),
            request_timeout: config.request_timeout,
            stop_timeout: config.stop_timeout,
        }
    }
}

impl BackendFactory for ProcessFactory {
    fn create(&self, node_id: NodeId) -> Box<dyn NodeBackend> {
        Box::new(ProcessNode {
            node_id,
            server: self.server.clone(),
            request_timeout: self.request_timeout,
            stop_timeout: self.stop_timeout,
            child: None,
            address: None,
            conn: None,
        })
    }
}

/// A server process plus a lazily opened connection to it
pub struct ProcessNode {
    node_id: NodeId,
    server: ServerConfig,
    request_timeout: Duration,
    stop_timeout: Duration,
    child: Option<Child>,
    address: Option<String>,
    conn: Option<MultiplexedConnection>,
}

impl ProcessNode {
    /// Command line for the server binary
    fn server_args(&self, spec: &LaunchSpec) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--port".into(),
            spec.port.to_string().into(),
            "--bind".into(),
            spec.host.clone().into(),
            "--dir".into(),
            spec.data_dir.clone().into_os_string(),
            "--save".into(),
            "".into(),
            "--loadmodule".into(),
            self.server.module.clone().into_os_string(),
            format!("id={}", spec.node_id).into(),
            format!("addr={}", spec.address()).into(),
            format!("persist={}", if spec.config.persist { "yes" } else { "no" }).into(),
        ];
        args.extend(
            spec.config
                .raft_args
                .iter()
                .map(|(k, v)| OsString::from(format!("{}={}", k, v))),
        );
        args.extend(self.server.extra_args.iter().map(OsString::from));
        args
    }

    async fn connection(&mut self) -> Result<&mut MultiplexedConnection> {
        if self.conn.is_none() {
            let address = self
                .address
                .as_deref()
                .ok_or(HarnessError::NodeNotRunning(self.node_id))?;
            let client = redis::Client::open(format!("redis://{}/", address))
                .map_err(|e| HarnessError::Config(e.to_string()))?;
            let conn = timeout(self.request_timeout, client.get_multiplexed_async_connection())
                .await
                .map_err(|_| HarnessError::Timeout {
                    node_id: self.node_id,
                    timeout: self.request_timeout,
                })?
                .map_err(|e| to_error(self.node_id, e, self.request_timeout))?;
            self.conn = Some(conn);
        }
        self.conn.as_mut().ok_or(HarnessError::NodeNotRunning(self.node_id))
    }
}

#[async_trait]
impl NodeBackend for ProcessNode {
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<()> {
        if !spec.config.persist {
            match tokio::fs::remove_dir_all(&spec.data_dir).await {
                Ok(()) => debug!(node_id = self.node_id, "Cleared data dir for fresh start"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::fs::create_dir_all(&spec.data_dir).await?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.data_dir.join(LOG_FILE))?;

        let child = ProcessCommand::new(&self.server.executable)
            .args(self.server_args(spec))
            .current_dir(&spec.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::Startup {
                node_id: self.node_id,
                reason: format!("failed to spawn {}: {}", self.server.executable.display(), e),
            })?;

        debug!(node_id = self.node_id, pid = ?child.id(), "Spawned server process");
        self.child = Some(child);
        self.address = Some(spec.address());
        self.conn = None;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if matches!(child.try_wait(), Ok(None)) {
            // The connection drops as the server exits, so the reply is irrelevant
            let request_timeout = self.request_timeout;
            if let Ok(conn) = self.connection().await {
                let cmd = to_redis_cmd(&Command::shutdown());
                let _ = timeout(request_timeout, conn.req_packed_command(&cmd)).await;
            }

            if timeout(self.stop_timeout, child.wait()).await.is_err() {
                warn!(node_id = self.node_id, "Server ignored SHUTDOWN, killing it");
                child.kill().await?;
            }
        }

        self.conn = None;
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> Result<Reply> {
        let node_id = self.node_id;
        let request_timeout = self.request_timeout;
        let cmd = to_redis_cmd(command);

        let conn = self.connection().await?;
        let result = timeout(request_timeout, conn.req_packed_command(&cmd)).await;

        match result {
            Ok(Ok(value)) => Ok(to_reply(value)),
            Ok(Err(e)) => {
                let err = to_error(node_id, e, request_timeout);
                if !matches!(err, HarnessError::Response { .. }) {
                    self.conn = None;
                }
                Err(err)
            }
            Err(_) => {
                self.conn = None;
                Err(HarnessError::Timeout {
                    node_id,
                    timeout: request_timeout,
                })
            }
        }
    }

    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }
}

fn to_redis_cmd(command: &Command) -> redis::Cmd {
    let mut cmd = redis::cmd(command.name());
    for arg in command.arguments() {
        cmd.arg(arg);
    }
    cmd
}

fn to_reply(value: redis::Value) -> Reply {
    match value {
        redis::Value::Nil => Reply::Nil,
        redis::Value::Int(n) => Reply::Int(n),
        redis::Value::BulkString(data) => Reply::Bulk(data),
        redis::Value::SimpleString(s) => Reply::Status(s),
        redis::Value::Okay => Reply::ok(),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            Reply::Array(items.into_iter().map(to_reply).collect())
        }
        redis::Value::Boolean(b) => Reply::Int(i64::from(b)),
        redis::Value::Double(d) => Reply::Status(d.to_string()),
        redis::Value::VerbatimString { text, .. } => Reply::Bulk(text.into_bytes()),
        other => Reply::Status(format!("{:?}", other)),
    }
}

/// Error replies keep their tag; everything else is a connection problem
fn to_error(node_id: NodeId, err: redis::RedisError, request_timeout: Duration) -> HarnessError {
    if let Some(code) = err.code() {
        return HarnessError::Response {
            node_id,
            code: code.to_string(),
            message: err.detail().unwrap_or_default().to_string(),
        };
    }
    if err.is_timeout() {
        HarnessError::Timeout {
            node_id,
            timeout: request_timeout,
        }
    } else {
        HarnessError::Connection {
            node_id,
            reason: err.to_string(),
        }
    }
}
