//! Worker subprocess handle.
//!
//! Owns the spawned bridge process and its framed stdio endpoints. The
//! channel event loop is the only consumer: it writes requests through
//! [`WorkerProcess::send`] and drives [`WorkerProcess::next_event`], which
//! yields decoded frames until EOF and then a single terminal exit event.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FrameError, LineCodec};
use crate::bridge::protocol::Request;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must hand back a child with piped stdin/stdout and an
/// environment that flushes output after every message.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Default spawner: runs the Python bridge script.
///
/// `PYTHONUNBUFFERED=1` is load-bearing: without it the worker's replies sit
/// in a stdio buffer and every call stalls until the buffer happens to fill.
pub struct BridgeSpawner {
    python: PathBuf,
    script: PathBuf,
}

impl BridgeSpawner {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            python: PathBuf::from("python3"),
            script: script.into(),
        }
    }

    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }
}

impl WorkerSpawner for BridgeSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.python)
            .arg(&self.script)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Spawner for an arbitrary worker executable.
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Event from the worker's output side.
#[derive(Debug)]
pub enum ProcessEvent {
    /// One complete framed line.
    Frame(String),
    /// The worker exited. Terminal: stdout is drained before this is
    /// reported, and no frame follows it.
    Exited(ExitStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Write attempted after the worker's stdin closed or the worker exited.
    #[error("worker input channel is closed")]
    ChannelClosed,

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("failed to reap worker: {0}")]
    Wait(io::Error),
}

/// Exclusively-owned handle to the worker subprocess.
pub struct WorkerProcess {
    child: Child,
    /// Write endpoint; dropped to close the worker's stdin.
    writer: Option<FramedWrite<ChildStdin, LineCodec>>,
    reader: FramedRead<ChildStdout, LineCodec>,
    exited: Option<ExitStatus>,
}

impl WorkerProcess {
    pub fn spawn(spawner: &dyn WorkerSpawner) -> Result<Self, SpawnError> {
        let mut child = spawner.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(pid = child.id(), "Worker spawned");

        Ok(Self {
            child,
            writer: Some(FramedWrite::new(stdin, LineCodec::new())),
            reader: FramedRead::new(stdout, LineCodec::new()),
            exited: None,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_some()
    }

    /// Encode a request, append the framing newline, write and flush.
    pub async fn send(&mut self, request: &Request) -> Result<(), ProcessError> {
        if self.exited.is_some() {
            return Err(ProcessError::ChannelClosed);
        }
        let line = request.to_line()?;
        let writer = self.writer.as_mut().ok_or(ProcessError::ChannelClosed)?;

        tracing::trace!(len = line.len(), "Sending frame");
        match writer.send(line).await {
            Ok(()) => Ok(()),
            Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                Err(ProcessError::ChannelClosed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next output event: a frame, or the terminal exit status once stdout
    /// reaches EOF.
    pub async fn next_event(&mut self) -> Result<ProcessEvent, ProcessError> {
        if let Some(status) = self.exited {
            return Ok(ProcessEvent::Exited(status));
        }
        match self.reader.next().await {
            Some(Ok(line)) => Ok(ProcessEvent::Frame(line)),
            Some(Err(e)) => Err(e.into()),
            None => {
                let status = self.child.wait().await.map_err(ProcessError::Wait)?;
                tracing::debug!(code = status.code(), "Worker exited");
                self.exited = Some(status);
                self.writer = None;
                Ok(ProcessEvent::Exited(status))
            }
        }
    }

    /// Close the worker's stdin and forcibly end the process if still alive.
    /// Idempotent.
    pub async fn terminate(&mut self) {
        self.writer = None;
        if self.exited.is_none() {
            // InvalidInput means the child already exited between our check
            // and the kill; wait() below reaps it either way.
            if let Err(e) = self.child.start_kill()
                && e.kind() != io::ErrorKind::InvalidInput
            {
                tracing::warn!(error = %e, "Failed to kill worker");
            }
            match self.child.wait().await {
                Ok(status) => self.exited = Some(status),
                Err(e) => tracing::warn!(error = %e, "Failed to reap worker"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpawner {
        CommandSpawner::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn yields_frames_then_exit() {
        let mut process =
            WorkerProcess::spawn(&sh("printf 'one\\ntwo\\n'")).unwrap();

        let first = process.next_event().await.unwrap();
        assert!(matches!(first, ProcessEvent::Frame(ref line) if line == "one"));
        let second = process.next_event().await.unwrap();
        assert!(matches!(second, ProcessEvent::Frame(ref line) if line == "two"));

        match process.next_event().await.unwrap() {
            ProcessEvent::Exited(status) => assert!(status.success()),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn echoes_request_line() {
        let mut process =
            WorkerProcess::spawn(&sh("IFS= read -r line; printf '%s\\n' \"$line\"")).unwrap();

        process.send(&Request::Ping).await.unwrap();

        match process.next_event().await.unwrap() {
            ProcessEvent::Frame(line) => assert_eq!(line, r#"{"type":"ping"}"#),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_event_is_sticky_and_write_fails_after() {
        let mut process = WorkerProcess::spawn(&sh("exit 3")).unwrap();

        match process.next_event().await.unwrap() {
            ProcessEvent::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected exit, got {other:?}"),
        }
        assert!(process.has_exited());
        assert!(matches!(
            process.next_event().await.unwrap(),
            ProcessEvent::Exited(_)
        ));
        assert!(matches!(
            process.send(&Request::Ping).await,
            Err(ProcessError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mut process = WorkerProcess::spawn(&sh("sleep 30")).unwrap();
        process.terminate().await;
        assert!(process.has_exited());
        process.terminate().await;
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/worker-binary");
        assert!(matches!(
            WorkerProcess::spawn(&spawner),
            Err(SpawnError::Spawn(_))
        ));
    }
}
