//! Per-session orchestration.
//!
//! One broker run per SSH session channel: obtain the user's container,
//! open an exec instance, pump bytes both ways, forward window resizes,
//! and release the container handle on every exit path. The broker never
//! removes containers; lifetime is owned by the registry.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use futures::StreamExt;

use crate::config::Config;
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, ExecSpec, OutputChunk};

/// How long the writer pump gets to drain after the session ends.
const WRITER_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    /// The SSH side stopped accepting data.
    #[error("client channel closed")]
    ChannelClosed,

    /// The exec stream failed.
    #[error("exec stream error: {0}")]
    Stream(String),
}

/// Window dimensions from a PTY or window-change request.
#[derive(Debug, Clone, Copy)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

/// Everything the front-end knows about one session channel.
#[derive(Debug)]
pub struct SessionBinding {
    pub id: Uuid,
    pub user: String,
    /// `NAME=value` pairs from env requests, plus TERM when a PTY was
    /// requested.
    pub env: Vec<String>,
    /// Raw exec command, if the channel carried one.
    pub command: Option<String>,
    pub pty: Option<PtySize>,
}

/// Where guest output and the final exit status go. The SSH front-end
/// backs this with the channel handle; tests record into buffers.
#[async_trait]
pub trait SessionSink: Send {
    async fn stdout(&mut self, data: &[u8]) -> Result<(), SessionError>;
    async fn stderr(&mut self, data: &[u8]) -> Result<(), SessionError>;
    async fn exit(&mut self, code: u32);
    async fn finish(&mut self);
}

/// Wires SSH session channels to exec instances.
#[derive(Clone)]
pub struct SessionBroker {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<Config>,
}

impl SessionBroker {
    pub fn new(
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            runtime,
            config,
        }
    }

    /// Run one session to completion. `stdin` carries client keystrokes,
    /// `resize` carries window changes, `cancel` fires when the channel
    /// closes and `shutdown` when the daemon stops.
    pub async fn run_session<S: SessionSink>(
        &self,
        sink: &mut S,
        binding: SessionBinding,
        stdin: mpsc::Receiver<Vec<u8>>,
        resize: mpsc::Receiver<PtySize>,
        cancel: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "session {} starting for user {} (pty: {}, command: {:?})",
            binding.id,
            binding.user,
            binding.pty.is_some(),
            binding.command
        );

        let container_id = match self.registry.acquire(&binding.user).await {
            Ok(id) => id,
            Err(e) => {
                warn!("session {}: no container for {}: {e}", binding.id, binding.user);
                sink.exit(1).await;
                sink.finish().await;
                return;
            }
        };

        let code = self
            .attach(sink, &binding, &container_id, stdin, resize, cancel, shutdown)
            .await;

        self.registry.release(&binding.user).await;
        sink.exit(code).await;
        sink.finish().await;
        info!("session {} finished with exit {code}", binding.id);
    }

    async fn attach<S: SessionSink>(
        &self,
        sink: &mut S,
        binding: &SessionBinding,
        container_id: &str,
        mut stdin: mpsc::Receiver<Vec<u8>>,
        mut resize: mpsc::Receiver<PtySize>,
        mut cancel: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u32 {
        let cmd = match &binding.command {
            Some(command) => vec!["/bin/sh".to_string(), "-c".to_string(), command.clone()],
            None => self.config.default_cmd.clone(),
        };

        let spec = ExecSpec {
            user: self.config.container_user.clone(),
            tty: binding.pty.is_some(),
            env: binding.env.clone(),
            cmd,
        };

        let handle = match self.runtime.exec(container_id, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("session {}: exec failed: {e}", binding.id);
                return 1;
            }
        };
        let exec_id = handle.id;
        let mut output = handle.output;
        let mut input = handle.input;

        if let Some(size) = binding.pty {
            if let Err(e) = self.runtime.resize_exec(&exec_id, size.rows, size.cols).await {
                warn!("session {}: initial resize failed: {e}", binding.id);
            }
        }

        // Client → guest. Dropping the sender half-closes the stream so the
        // guest sees EOF on stdin.
        let mut writer = tokio::spawn(async move {
            while let Some(data) = stdin.recv().await {
                if input.write_all(&data).await.is_err() {
                    return Err(());
                }
            }
            let _ = input.shutdown().await;
            Ok(())
        });

        // Window changes are best-effort; a failed resize never ends the
        // session.
        let resizer = {
            let runtime = Arc::clone(&self.runtime);
            let exec_id = exec_id.clone();
            let session_id = binding.id;
            tokio::spawn(async move {
                while let Some(size) = resize.recv().await {
                    if let Err(e) = runtime.resize_exec(&exec_id, size.rows, size.cols).await {
                        warn!("session {session_id}: resize failed: {e}");
                    }
                }
            })
        };

        if *shutdown.borrow() {
            resizer.abort();
            writer.abort();
            return 1;
        }

        let read_result = tokio::select! {
            result = pump_output(&mut output, sink) => result,
            _ = cancel.changed() => Err(SessionError::ChannelClosed),
            _ = shutdown.changed() => Err(SessionError::ChannelClosed),
        };

        resizer.abort();
        drop(output);

        let writer_failed = match timeout(WRITER_DRAIN, &mut writer).await {
            Ok(Ok(result)) => result.is_err(),
            Ok(Err(_)) => false,
            Err(_) => {
                writer.abort();
                false
            }
        };

        match read_result {
            Ok(()) if !writer_failed => 0,
            Ok(()) => {
                debug!("session {}: stdin pump failed", binding.id);
                1
            }
            Err(e) => {
                debug!("session {}: {e}", binding.id);
                1
            }
        }
    }
}

/// Guest → client. TTY sessions arrive as a flat stdout stream; otherwise
/// the runtime's stdout/stderr framing maps onto the two SSH streams, each
/// in order.
async fn pump_output<S: SessionSink>(
    output: &mut (impl futures::Stream<Item = crate::runtime::RuntimeResult<OutputChunk>>
              + Send
              + Unpin),
    sink: &mut S,
) -> Result<(), SessionError> {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(OutputChunk::Stdout(data)) => sink.stdout(&data).await?,
            Ok(OutputChunk::Stderr(data)) => sink.stderr(&data).await?,
            Err(e) => return Err(SessionError::Stream(e.to_string())),
        }
    }
    Ok(())
}
