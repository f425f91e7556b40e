//! In-process realtime notifier.
//!
//! Speaks the same message contract as the remote notifier over tokio
//! channels. The demo command drives it, and tests use it to deliver push
//! events at precise moments.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::push::{InboundMessage, OutboundMessage, PushConnection, PushConnector};
use crate::error::MonitorError;

/// How the notifier answers connection and authentication attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Authenticate when the token matches, `auth_error` otherwise.
    Verify,
    /// Accept the connection but never answer `authenticate`.
    Silent,
    /// Refuse the connection outright.
    Refuse,
}

struct Socket {
    id: u64,
    authenticated: bool,
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

struct State {
    token: String,
    mode: AuthMode,
    sockets: Vec<Socket>,
    next_id: u64,
    connects: usize,
}

#[derive(Clone)]
pub struct LocalNotifier {
    state: Arc<Mutex<State>>,
}

impl LocalNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                token: token.into(),
                mode: AuthMode::Verify,
                sockets: Vec::new(),
                next_id: 0,
                connects: 0,
            })),
        }
    }

    pub fn set_mode(&self, mode: AuthMode) {
        self.state.lock().mode = mode;
    }

    /// Delivers `message` to every authenticated socket subscribed to its job.
    /// Returns how many sockets received it.
    pub fn publish(&self, message: InboundMessage) -> usize {
        let Some(job_id) = message.job_id().map(str::to_string) else {
            return 0;
        };
        let state = self.state.lock();
        let mut delivered = 0;
        for socket in state
            .sockets
            .iter()
            .filter(|s| s.authenticated && s.subscriptions.contains(&job_id))
        {
            if socket.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.state
            .lock()
            .sockets
            .iter()
            .filter(|s| s.subscriptions.contains(job_id))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().sockets.len()
    }

    /// Total connection attempts that were accepted, including closed ones.
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    fn handle(&self, socket_id: u64, message: OutboundMessage) {
        let mut state = self.state.lock();
        let token_ok = matches!(&message, OutboundMessage::Authenticate { token } if *token == state.token);
        let mode = state.mode;
        let Some(socket) = state.sockets.iter_mut().find(|s| s.id == socket_id) else {
            return;
        };
        match message {
            OutboundMessage::Authenticate { .. } => {
                if mode == AuthMode::Silent {
                    return;
                }
                let reply = if token_ok {
                    socket.authenticated = true;
                    InboundMessage::Authenticated { user_id: None }
                } else {
                    InboundMessage::AuthError {
                        message: "invalid token".into(),
                    }
                };
                let _ = socket.tx.send(reply);
            }
            OutboundMessage::Subscribe { job_id } if socket.authenticated => {
                socket.subscriptions.insert(job_id);
            }
            OutboundMessage::Subscribe { job_id } => {
                debug!(socket_id, job_id = %job_id, "subscribe before authentication ignored");
            }
            OutboundMessage::Unsubscribe { job_id } => {
                socket.subscriptions.remove(&job_id);
            }
        }
    }

    fn disconnect(&self, socket_id: u64) {
        self.state.lock().sockets.retain(|s| s.id != socket_id);
    }
}

#[async_trait]
impl PushConnector for LocalNotifier {
    async fn connect(&self) -> Result<PushConnection, MonitorError> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundMessage>();

        let socket_id = {
            let mut state = self.state.lock();
            if state.mode == AuthMode::Refuse {
                return Err(MonitorError::PushConnectFailed("connection refused".into()));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.connects += 1;
            state.sockets.push(Socket {
                id,
                authenticated: false,
                subscriptions: HashSet::new(),
                tx: in_tx,
            });
            id
        };

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                server.handle(socket_id, message);
            }
            server.disconnect(socket_id);
        });

        Ok(PushConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
