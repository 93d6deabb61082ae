//! Line-delimited JSON over a child process's standard streams.
//!
//! One [`Transport`] owns one agent process. Outgoing records are written
//! as a single line each; incoming lines are decoded into
//! [`TransportEvent`]s on a background reader task. A malformed line is
//! reported and skipped. End of stream is reported once, as
//! [`TransportEvent::Closed`], and ends the event sequence.

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::config::LaunchSpec;
use crate::error::Error;

/// One decoded unit of input from the agent process.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A well-formed JSON value read from one line.
    Message(serde_json::Value),
    /// A line that was not valid JSON. The channel stays open.
    ParseError { line: String, error: String },
    /// The output stream ended. Always the last event.
    Closed { exit_status: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transport is closed")]
    Closed,
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Framing layer over one child process (or any reader/writer pair).
pub struct Transport {
    outbound: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
    grace: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("pid", &self.pid)
            .field("grace", &self.grace)
            .finish()
    }
}

impl Transport {
    /// Spawn `spec` in `cwd` with piped stdio.
    ///
    /// `grace` is the delay between SIGTERM and SIGKILL in [`Transport::close`].
    pub fn spawn(spec: &LaunchSpec, cwd: &Path, grace: Duration) -> Result<Self, Error> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Merge, don't replace the inherited environment.
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::HandshakeFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::HandshakeFailed("child stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, stderr = %line, "agent stderr");
                }
            });
        }

        debug!(pid, program = %spec.program, cwd = %cwd.display(), "spawned agent process");

        let child = Arc::new(Mutex::new(Some(child)));
        Ok(Self::start(stdout, stdin, Arc::clone(&child), pid, grace))
    }

    /// Wrap an arbitrary reader/writer pair. Used for in-memory peers.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(
            reader,
            writer,
            Arc::new(Mutex::new(None)),
            None,
            Duration::from_secs(0),
        )
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        child: Arc<Mutex<Option<Child>>>,
        pid: Option<u32>,
        grace: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(write_lines(writer, out_rx, pid));
        tokio::spawn(read_lines(reader, event_tx, Arc::clone(&child), pid));

        Self {
            outbound: StdMutex::new(Some(out_tx)),
            events: StdMutex::new(Some(event_rx)),
            child,
            pid,
            grace,
        }
    }

    /// OS pid of the agent process, if this transport owns one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write `record` as one line.
    pub fn send<T: Serialize + ?Sized>(&self, record: &T) -> Result<(), SendError> {
        let line = serde_json::to_string(record)?;
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let sender = outbound.as_ref().ok_or(SendError::Closed)?;
        sender.send(line).map_err(|_| SendError::Closed)
    }

    /// Take the inbound event sequence. Only the first call returns it.
    pub fn receive(&self) -> Option<EventStream> {
        let rx = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        Some(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    /// Close stdin, ask the process to exit, and kill it after the grace
    /// period. Idempotent.
    pub async fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, ?status, "agent process exited");
            }
            _ => {
                debug!(pid = self.pid, "agent process did not exit in time, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>, pid: Option<u32>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(?pid, error = %e, "failed writing to agent stdin");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_lines<R>(
    reader: R,
    events: mpsc::UnboundedSender<TransportEvent>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = match serde_json::from_str(trimmed) {
                    Ok(value) => TransportEvent::Message(value),
                    Err(e) => {
                        warn!(?pid, line = trimmed, error = %e, "skipping malformed line");
                        TransportEvent::ParseError {
                            line: trimmed.to_string(),
                            error: e.to_string(),
                        }
                    }
                };
                if events.send(event).is_err() {
                    // Nobody is listening anymore; keep draining so the
                    // child never blocks on a full pipe.
                    continue;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(?pid, error = %e, "error reading agent stdout");
                break;
            }
        }
    }

    let exit_status = reap(&child).await;
    debug!(?pid, ?exit_status, "agent output closed");
    let _ = events.send(TransportEvent::Closed { exit_status });
}

/// Best-effort exit code of a child whose stdout just closed.
async fn reap(child: &Mutex<Option<Child>>) -> Option<i32> {
    let mut guard = child.lock().await;
    let child = guard.as_mut()?;
    match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn decodes_lines_and_reports_parse_errors() {
        let (client, mut peer) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let transport = Transport::from_io(reader, writer);
        let mut events = transport.receive().unwrap();

        peer.write_all(b"{\"a\":1}\n\n   \nnot json\n{\"b\":2}\n")
            .await
            .unwrap();
        drop(peer);

        let collected: Vec<TransportEvent> = events.by_ref().collect().await;
        assert_eq!(collected.len(), 4);
        assert_eq!(collected[0], TransportEvent::Message(serde_json::json!({"a": 1})));
        assert!(matches!(&collected[1], TransportEvent::ParseError { line, .. } if line == "not json"));
        assert_eq!(collected[2], TransportEvent::Message(serde_json::json!({"b": 2})));
        assert_eq!(collected[3], TransportEvent::Closed { exit_status: None });
    }

    #[tokio::test]
    async fn receive_is_not_restartable() {
        let (client, _peer) = duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let transport = Transport::from_io(reader, writer);
        assert!(transport.receive().is_some());
        assert!(transport.receive().is_none());
    }

    #[tokio::test]
    async fn send_writes_one_line_per_record() {
        let (client, mut peer) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let transport = Transport::from_io(reader, writer);

        transport.send(&serde_json::json!({"text": "two\nlines"})).unwrap();
        transport.send(&serde_json::json!([1, 2])).unwrap();
        transport.close().await;

        let mut written = String::new();
        peer.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "{\"text\":\"two\\nlines\"}\n[1,2]\n");
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (client, _peer) = duplex(64);
        let (reader, writer) = tokio::io::split(client);
        let transport = Transport::from_io(reader, writer);
        transport.close().await;
        assert!(matches!(
            transport.send(&serde_json::json!({})),
            Err(SendError::Closed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_event_carries_exit_status() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo '{\"hello\":true}'; exit 7");
        let transport = Transport::spawn(&spec, tmp.path(), Duration::from_secs(1)).unwrap();
        assert!(transport.pid().is_some());

        let events: Vec<TransportEvent> = transport.receive().unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                TransportEvent::Message(serde_json::json!({"hello": true})),
                TransportEvent::Closed {
                    exit_status: Some(7)
                },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_terminates_a_sleeping_process() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("/bin/sh").arg("-c").arg("exec sleep 3600");
        let transport = Transport::spawn(&spec, tmp.path(), Duration::from_secs(2)).unwrap();
        let mut events = transport.receive().unwrap();

        transport.close().await;

        let last = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("closed event should arrive");
        assert!(matches!(last, Some(TransportEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new("/nonexistent/path/to/agent");
        let err = Transport::spawn(&spec, tmp.path(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
