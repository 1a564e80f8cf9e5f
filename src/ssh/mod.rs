//! SSH front-end.
//!
//! Accepts connections, runs password authentication against the OAuth2
//! endpoint and dispatches session channels to the broker. Features the
//! gateway does not support (sftp payloads, local and remote port
//! forwarding) are refused here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::session::{PtySize, SessionBinding, SessionBroker, SessionError, SessionSink};
use crate::volume::validate_username;

/// Longest exec command line accepted from a client.
const MAX_EXEC_LEN: usize = 4096;

/// Shared state handed to every connection.
pub struct ServerState {
    pub config: Arc<Config>,
    pub auth: Authenticator,
    pub broker: SessionBroker,
    pub shutdown: watch::Receiver<bool>,
}

/// Accept connections until the caller drops this future.
pub async fn run_server(state: Arc<ServerState>) -> Result<()> {
    let key = russh::keys::load_secret_key(&state.config.ssh_host_key, None)
        .with_context(|| format!("failed to load host key {:?}", state.config.ssh_host_key))?;

    let russh_config = Arc::new(russh::server::Config {
        methods: MethodSet::from(&[MethodKind::Password][..]),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.ssh_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("ssh server listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let handler = SessionHandler::new(Arc::clone(&state), peer);
        let config = Arc::clone(&russh_config);
        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!("ssh session from {peer} ended: {e}");
                    }
                }
                Err(e) => warn!("ssh handshake with {peer} failed: {e}"),
            }
        });
    }
}

#[derive(Default)]
struct ChannelState {
    env: Vec<String>,
    term: Option<String>,
    pty: Option<PtySize>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    resize_tx: Option<mpsc::Sender<PtySize>>,
    cancel_tx: Option<watch::Sender<bool>>,
    started: bool,
}

/// Per-connection handler state.
struct SessionHandler {
    state: Arc<ServerState>,
    peer: SocketAddr,
    username: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SessionHandler {
    fn new(state: Arc<ServerState>, peer: SocketAddr) -> Self {
        Self {
            state,
            peer,
            username: None,
            channels: HashMap::new(),
        }
    }

    fn start_session(
        &mut self,
        channel_id: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) -> Result<()> {
        let Some(user) = self.username.clone() else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let Some(st) = self.channels.get_mut(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        if st.started {
            warn!("user {user} requested a second command on one channel");
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }
        st.started = true;

        let mut env = st.env.clone();
        if let Some(term) = &st.term {
            env.push(format!("TERM={term}"));
        }

        let (stdin_tx, stdin_rx) = mpsc::channel(32);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        st.stdin_tx = Some(stdin_tx);
        st.resize_tx = Some(resize_tx);
        st.cancel_tx = Some(cancel_tx);

        let binding = SessionBinding {
            id: Uuid::new_v4(),
            user,
            env,
            command,
            pty: st.pty,
        };
        info!(
            "session {} opened by {} from {}",
            binding.id, binding.user, self.peer
        );

        let mut sink = ChannelSink {
            handle: session.handle(),
            channel: channel_id,
        };
        let broker = self.state.broker.clone();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            broker
                .run_session(&mut sink, binding, stdin_rx, resize_rx, cancel_rx, shutdown)
                .await;
        });

        let _ = session.channel_success(channel_id);
        Ok(())
    }
}

impl Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if validate_username(user).is_err() {
            warn!("rejecting malformed username from {}", self.peer);
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }

        if self.state.auth.authenticate(user, password).await {
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("session channel opened: {:?}", channel.id());
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(st) = self.channels.get_mut(&channel_id) {
            st.env.push(format!("{variable_name}={variable_value}"));
        }
        let _ = session.channel_success(channel_id);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("pty request: term={term}, cols={col_width}, rows={row_height}");
        if let Some(st) = self.channels.get_mut(&channel_id) {
            st.term = Some(term.to_string());
            st.pty = Some(PtySize {
                rows: row_height as u16,
                cols: col_width as u16,
            });
        }
        let _ = session.channel_success(channel_id);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel_id, None, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data.len() > MAX_EXEC_LEN {
            warn!("exec command from {} too large, rejecting", self.peer);
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }
        let command = String::from_utf8_lossy(data).to_string();
        self.start_session(channel_id, Some(command), session)
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.channels.get(&channel_id).and_then(|st| st.resize_tx.as_ref()) {
            let _ = tx
                .send(PtySize {
                    rows: row_height as u16,
                    cols: col_width as u16,
                })
                .await;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.channels.get(&channel_id).and_then(|st| st.stdin_tx.as_ref()) {
            let _ = tx.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender half-closes stdin so the guest sees EOF.
        if let Some(st) = self.channels.get_mut(&channel_id) {
            st.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(st) = self.channels.remove(&channel_id) {
            if let Some(cancel) = st.cancel_tx {
                let _ = cancel.send(true);
            }
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name == "sftp" {
            // Accepted so clients get a clean exit instead of a protocol
            // error, but no SFTP service is behind it.
            warn!("sftp subsystem is disabled (user {:?})", self.username);
            let _ = session.channel_success(channel_id);
            let _ = session.exit_status_request(channel_id, 0);
            let _ = session.close(channel_id);
        } else {
            warn!("subsystem {name} denied (user {:?})", self.username);
            let _ = session.channel_failure(channel_id);
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            "denied local forward to {host_to_connect}:{port_to_connect} from {}",
            self.peer
        );
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!("denied remote forward on {address}:{port} from {}", self.peer);
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

/// Adapts the russh channel handle to the broker's sink.
struct ChannelSink {
    handle: russh::server::Handle,
    channel: ChannelId,
}

#[async_trait]
impl SessionSink for ChannelSink {
    async fn stdout(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    async fn stderr(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.handle
            .extended_data(self.channel, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    async fn exit(&mut self, code: u32) {
        let _ = self.handle.exit_status_request(self.channel, code).await;
    }

    async fn finish(&mut self) {
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}
