//! Control channel
//!
//! Wraps exactly one transport connection for its lifetime with a state
//! machine, a FIFO outbound queue, and failure classification.
//!
//! States run `Connecting → Connected → {Closed | Error}`; the last two
//! are terminal and the current state never regresses. Outbound sends are
//! queued and written one at a time — a slow send stalls the queue, which
//! is the intended simplicity-over-throughput tradeoff for low-volume
//! control traffic. Tearing the channel down rejects every queued send
//! with a "channel closed" error so no caller waits forever, and
//! `dispose` is idempotent from any state.
//!
//! Messages arriving on a connection whose peer is not in the trust set
//! are restricted to the pairing/keep-alive whitelist; anything else is a
//! protocol violation that tears the connection down. Pairing success
//! elevates the connection in place via [`ControlChannel::elevate`].

use cribcall_protocol::{ConnectionInfo, ControlMessage, ProtocolError, TransportConnection};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::failure::Failure;

/// Current state of a control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    Connecting,
    Connected {
        connection_id: String,
        peer_fingerprint: String,
    },
    Closed {
        connection_id: Option<String>,
        peer_fingerprint: Option<String>,
    },
    Error {
        connection_id: Option<String>,
        peer_fingerprint: Option<String>,
        failure: Failure,
    },
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed { .. } | ChannelState::Error { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected { .. })
    }
}

/// A message received on a channel, tagged with its origin.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: String,
    pub peer_fingerprint: String,
    pub message: ControlMessage,
}

enum Command {
    Send {
        message: ControlMessage,
        completion: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Elevate,
    Dispose,
}

/// Handle to a running control channel. Cloneable; the underlying
/// connection task ends when the channel reaches a terminal state.
#[derive(Clone)]
pub struct ControlChannel {
    info: ConnectionInfo,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ChannelState>,
}

impl ControlChannel {
    /// Spawn the channel task around an established connection.
    ///
    /// Inbound messages that pass the trust restriction are delivered to
    /// `inbound_tx` in arrival order.
    pub fn spawn(
        connection: Box<dyn TransportConnection>,
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        Self::spawn_with(connection, inbound_tx, |_| {})
    }

    /// Like [`ControlChannel::spawn`], but calls `register` with the new
    /// handle before the connection task starts. Registering first means
    /// no inbound message can be dispatched before the channel is
    /// reachable through the registry.
    pub fn spawn_with(
        connection: Box<dyn TransportConnection>,
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
        register: impl FnOnce(&Self),
    ) -> Self {
        let info = connection.info().clone();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);

        let channel = Self {
            info,
            command_tx,
            state_rx,
        };
        register(&channel);

        tokio::spawn(run_channel(connection, command_rx, state_tx, inbound_tx));
        channel
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn state(&self) -> ChannelState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver for observing state transitions.
    pub fn state_stream(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Queue a message for sending. Resolves once the transport accepted
    /// the bytes, or with an error if the send failed or the channel was
    /// torn down first.
    pub async fn send(&self, message: ControlMessage) -> Result<(), ProtocolError> {
        let (completion, result) = oneshot::channel();
        self.command_tx
            .send(Command::Send {
                message,
                completion,
            })
            .map_err(|_| ProtocolError::Closed("channel closed".to_string()))?;
        result
            .await
            .map_err(|_| ProtocolError::Closed("channel closed".to_string()))?
    }

    /// Promote the connection to trusted in place (pairing success).
    pub fn elevate(&self) {
        let _ = self.command_tx.send(Command::Elevate);
    }

    /// Tear the channel down. Safe to call repeatedly and from any state.
    pub fn dispose(&self) {
        let _ = self.command_tx.send(Command::Dispose);
    }
}

enum Terminal {
    Closed,
    Failed(Failure),
}

async fn run_channel(
    mut connection: Box<dyn TransportConnection>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ChannelState>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
) {
    let info = connection.info().clone();
    state_tx.send_replace(ChannelState::Connected {
        connection_id: info.connection_id.clone(),
        peer_fingerprint: info.peer_fingerprint.clone(),
    });
    debug!(connection_id = %info.connection_id, "channel connected");

    let mut close_reason = "dispose".to_string();

    let terminal = loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                // All handles dropped: treat like dispose.
                None => break Terminal::Closed,
                Some(Command::Send { message, completion }) => {
                    let result = send_one(connection.as_mut(), &message).await;
                    match result {
                        Ok(()) => {
                            let _ = completion.send(Ok(()));
                        }
                        Err(e) => {
                            warn!(
                                connection_id = %info.connection_id,
                                message_type = message.message_type(),
                                "send failed: {e}"
                            );
                            let failure = Failure::classify(e.to_string());
                            let _ = completion.send(Err(e));
                            close_reason = "send failure".to_string();
                            break Terminal::Failed(failure);
                        }
                    }
                }
                Some(Command::Elevate) => connection.elevate(),
                Some(Command::Dispose) => break Terminal::Closed,
            },

            inbound = connection.recv_frame() => match inbound {
                Ok(Some(payload)) => {
                    match ControlMessage::from_payload(&payload) {
                        Ok(message) => {
                            if !connection.is_trusted() && !message.allowed_when_untrusted() {
                                let error = ProtocolError::ProtocolViolation(format!(
                                    "message type '{}' not allowed from untrusted peer",
                                    message.message_type()
                                ));
                                warn!(
                                    connection_id = %info.connection_id,
                                    peer = %info.peer_fingerprint,
                                    "{error}"
                                );
                                close_reason = "protocol violation".to_string();
                                break Terminal::Failed(Failure::classify(error.to_string()));
                            }
                            let _ = inbound_tx.send(InboundMessage {
                                connection_id: info.connection_id.clone(),
                                peer_fingerprint: info.peer_fingerprint.clone(),
                                message,
                            });
                        }
                        Err(e) => {
                            close_reason = "protocol violation".to_string();
                            break Terminal::Failed(Failure::classify(e.to_string()));
                        }
                    }
                }
                Ok(None) => {
                    debug!(connection_id = %info.connection_id, "peer closed connection");
                    close_reason = "peer closed".to_string();
                    break Terminal::Closed;
                }
                Err(e) => {
                    close_reason = "transport error".to_string();
                    break Terminal::Failed(Failure::classify(e.to_string()));
                }
            },
        }
    };

    // Flush-and-reject every queued request so no caller waits forever.
    command_rx.close();
    while let Ok(command) = command_rx.try_recv() {
        if let Command::Send { completion, .. } = command {
            let _ = completion.send(Err(ProtocolError::Closed("channel closed".to_string())));
        }
    }

    let _ = connection.close(&close_reason).await;

    let final_state = match terminal {
        Terminal::Closed => ChannelState::Closed {
            connection_id: Some(info.connection_id.clone()),
            peer_fingerprint: Some(info.peer_fingerprint.clone()),
        },
        Terminal::Failed(failure) => ChannelState::Error {
            connection_id: Some(info.connection_id.clone()),
            peer_fingerprint: Some(info.peer_fingerprint.clone()),
            failure,
        },
    };

    // Terminal states are final: never overwrite one already emitted.
    state_tx.send_if_modified(|state| {
        if state.is_terminal() {
            false
        } else {
            *state = final_state;
            true
        }
    });

    info!(connection_id = %info.connection_id, "channel stopped");
}

async fn send_one(
    connection: &mut dyn TransportConnection,
    message: &ControlMessage,
) -> Result<(), ProtocolError> {
    let payload = message.to_payload()?;
    connection.send_frame(&payload).await
}
