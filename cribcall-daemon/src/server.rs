//! Monitor server
//!
//! Wires the pieces together: the transport listener (with trust-snapshot
//! generations), control channels, the pairing engine, the subscription
//! registry, the broadcaster, and the HTTPS side-channel API.
//!
//! Trust mutations go through [`TrustControl`]: the accept loop owns the
//! listener, applies the new snapshot, and acknowledges — only then is
//! the mutation considered externally visible. Removing a peer also
//! proactively closes its connection; adding one elevates any live
//! connection it already holds.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use cribcall_protocol::pairing::{ConfirmResult, IssuedToken, PairingAccepted, PairingEngine};
use cribcall_protocol::{
    transport, ControlMessage, Identity, ListenerConfig, ProtocolError, TransportListener,
    TrustStore,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::api::ApiService;
use crate::broadcast::{BroadcastReport, Broadcaster, NoiseEvent};
use crate::channel::{ChannelState, ControlChannel, InboundMessage};
use crate::config::DaemonConfig;
use crate::events::DaemonEvent;
use crate::http::HttpServer;
use crate::push::PushSender;
use crate::registry::ChannelRegistry;
use crate::subscription::{SubscriptionDefaults, SubscriptionRegistry};

enum TrustCommand {
    Rebind {
        trusted: HashSet<String>,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle for trust-snapshot generations owned by the accept loop.
#[derive(Clone)]
pub struct TrustControl {
    tx: mpsc::UnboundedSender<TrustCommand>,
}

impl TrustControl {
    /// Apply a new trust snapshot and wait for the rebind to complete.
    pub async fn rebind(&self, trusted: HashSet<String>) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(TrustCommand::Rebind { trusted, ack }).is_ok() {
            let _ = done.await;
        }
    }

    async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(TrustCommand::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

pub(crate) struct ServerInner {
    pub(crate) config: DaemonConfig,
    pub(crate) identity: Arc<Identity>,
    pub(crate) trust: Arc<dyn TrustStore>,
    pub(crate) engine: Mutex<PairingEngine>,
    pub(crate) subscriptions: Arc<SubscriptionRegistry>,
    pub(crate) channels: ChannelRegistry,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) events: broadcast::Sender<DaemonEvent>,
    pub(crate) settings: std::sync::RwLock<Value>,
    pub(crate) trust_control: TrustControl,
    pub(crate) started_at: Instant,
    pub(crate) control_addr: SocketAddr,
    pub(crate) api_addr: SocketAddr,
}

/// Running monitor daemon. Cloneable handle.
#[derive(Clone)]
pub struct MonitorServer {
    inner: Arc<ServerInner>,
}

impl MonitorServer {
    /// Bind listeners and start all loops.
    pub async fn start(
        config: DaemonConfig,
        identity: Arc<Identity>,
        trust: Arc<dyn TrustStore>,
        push: Arc<dyn PushSender>,
    ) -> anyhow::Result<Self> {
        let listener = transport::listen(
            config.transport,
            identity.clone(),
            ListenerConfig {
                bind_addr: config.control_bind,
                trusted: trust.fingerprints(),
            },
        )
        .await?;
        let control_addr = listener.local_addr()?;

        let api_server = HttpServer::bind(&identity, config.api_bind).await?;
        let api_addr = api_server.local_addr();

        let (trust_tx, trust_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let subscriptions = Arc::new(SubscriptionRegistry::new(SubscriptionDefaults {
            threshold: config.default_threshold,
            cooldown_secs: config.default_cooldown_secs,
            lease_secs: config.default_lease_secs,
            max_lease_secs: config.max_lease_secs,
        }));
        let channels = ChannelRegistry::new();
        let broadcaster = Broadcaster::new(
            config.monitor_name.clone(),
            subscriptions.clone(),
            channels.clone(),
            push,
            trust.clone(),
        );

        let engine = PairingEngine::new(identity.clone(), config.monitor_name.clone());

        let inner = Arc::new(ServerInner {
            config,
            identity,
            trust,
            engine: Mutex::new(engine),
            subscriptions,
            channels,
            broadcaster,
            events,
            settings: std::sync::RwLock::new(json!({})),
            trust_control: TrustControl { tx: trust_tx },
            started_at: Instant::now(),
            control_addr,
            api_addr,
        });

        tokio::spawn(accept_loop(
            inner.clone(),
            listener,
            trust_rx,
            inbound_tx,
        ));

        let dispatch_inner = inner.clone();
        tokio::spawn(async move { dispatch_loop(dispatch_inner, inbound_rx).await });

        let server = Self { inner: inner.clone() };
        tokio::spawn(api_server.run(Arc::new(ApiService::new(server.clone()))));

        info!(
            control = %control_addr,
            api = %api_addr,
            fingerprint = %inner.identity.fingerprint(),
            "monitor server started"
        );
        Ok(server)
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.inner.control_addr
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.inner.api_addr
    }

    pub fn fingerprint(&self) -> String {
        self.inner.identity.fingerprint().to_string()
    }

    /// Subscribe to daemon events (UI, media engine).
    pub fn events(&self) -> broadcast::Receiver<DaemonEvent> {
        self.inner.events.subscribe()
    }

    /// Feed one detection event from the local noise sampler.
    pub async fn broadcast_noise(&self, event: NoiseEvent) -> BroadcastReport {
        self.inner.broadcaster.broadcast(event).await
    }

    /// Issue a one-time pairing token (QR payload).
    pub async fn issue_pairing_token(&self) -> IssuedToken {
        self.inner.engine.lock().await.issue_token()
    }

    /// Host user confirmed the comparison code for a session.
    pub async fn confirm_pairing(&self, session_id: &str) -> bool {
        self.inner.engine.lock().await.user_confirm(session_id)
    }

    /// Host user rejected the comparison code for a session.
    pub async fn reject_pairing(&self, session_id: &str) -> bool {
        self.inner.engine.lock().await.user_reject(session_id)
    }

    /// Remove a peer: trust store, listener generation, live connection,
    /// subscription. Transport-side errors are best effort.
    pub async fn unpair(&self, fingerprint: &str) {
        self.inner.unpair(fingerprint).await;
    }

    /// Current effective settings snapshot.
    pub fn settings(&self) -> Value {
        self.inner.settings.read().unwrap().clone()
    }

    /// Stop accepting and tear down live channels.
    pub async fn shutdown(&self) {
        self.inner.trust_control.shutdown().await;
        for peer in self.inner.trust.snapshot() {
            self.inner.channels.close_peer(&peer.fingerprint);
        }
        info!("monitor server stopped");
    }

    pub(crate) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }
}

impl ServerInner {
    /// Trust-store mutation + rebind + in-place elevation after a
    /// successful pairing.
    pub(crate) async fn apply_pairing(&self, accepted: &PairingAccepted) {
        self.trust.upsert(accepted.peer.clone());
        self.trust_control.rebind(self.trust.fingerprints()).await;

        if let Some(channel) = self.channels.get(&accepted.peer.fingerprint) {
            channel.elevate();
        }

        let _ = self.events.send(DaemonEvent::PeerPaired {
            fingerprint: accepted.peer.fingerprint.clone(),
            device_id: accepted.peer.device_id.clone(),
            display_name: accepted.peer.display_name.clone(),
        });
    }

    pub(crate) async fn unpair(&self, fingerprint: &str) {
        let removed = self.trust.remove(fingerprint);
        self.trust_control.rebind(self.trust.fingerprints()).await;
        self.channels.close_peer(fingerprint);
        self.subscriptions.purge_fingerprint(fingerprint);
        if removed.is_some() {
            info!(peer = %fingerprint, "peer unpaired");
            let _ = self.events.send(DaemonEvent::PeerRemoved {
                fingerprint: fingerprint.to_string(),
            });
        }
    }

    pub(crate) fn health(&self) -> Value {
        json!({
            "status": "ok",
            "role": "monitor",
            "protocol": self.config.transport,
            "uptimeSec": self.started_at.elapsed().as_secs(),
            "activeConnections": self.channels.connected_count(),
            "fingerprint": self.identity.fingerprint(),
        })
    }

    async fn handle_message(self: &Arc<Self>, inbound: InboundMessage) {
        let peer = inbound.peer_fingerprint.clone();
        debug!(
            peer = %peer,
            message_type = inbound.message.message_type(),
            "control message received"
        );

        match inbound.message {
            ControlMessage::Ping => {
                if let Err(e) = self.channels.send_to(&peer, ControlMessage::Pong).await {
                    debug!(peer = %peer, "pong not delivered: {e}");
                }
            }
            ControlMessage::Pong => {}

            ControlMessage::PushTokenUpdate { token, platform } => {
                if !self.trust.set_push_token(&peer, Some(token.clone())) {
                    warn!(peer = %peer, "push token update from unknown peer");
                    return;
                }
                self.subscriptions.update_push_token(&peer, &token, &platform);
                info!(peer = %peer, platform = %platform, "push token updated");
            }

            ControlMessage::SettingsGet => {
                let settings = self.settings.read().unwrap().clone();
                let reply = ControlMessage::SettingsUpdate { settings };
                if let Err(e) = self.channels.send_to(&peer, reply).await {
                    debug!(peer = %peer, "settings reply not delivered: {e}");
                }
            }
            ControlMessage::SettingsUpdate { settings } => {
                *self.settings.write().unwrap() = settings.clone();
                let _ = self.events.send(DaemonEvent::SettingsUpdated { settings });
            }

            message @ (ControlMessage::WebrtcOffer { .. }
            | ControlMessage::WebrtcAnswer { .. }
            | ControlMessage::WebrtcIce { .. }) => {
                // Opaque to this core: handed to the media engine verbatim.
                let _ = self.events.send(DaemonEvent::Signaling {
                    fingerprint: peer,
                    message,
                });
            }

            message @ (ControlMessage::StreamStart { .. }
            | ControlMessage::StreamEnd { .. }
            | ControlMessage::StreamPin { .. }) => {
                let _ = self.events.send(DaemonEvent::StreamRequest {
                    fingerprint: peer,
                    message,
                });
            }

            ControlMessage::NoiseAlert { .. } => {
                warn!(peer = %peer, "unexpected noise alert from remote, ignoring");
            }

            ControlMessage::PairInit(request) => {
                let result = self.engine.lock().await.init(&request);
                match result {
                    Ok((response, code)) => {
                        let _ = self.events.send(DaemonEvent::PairingCode {
                            session_id: response.pairing_session_id.clone(),
                            device_name: request.device_name.clone(),
                            code,
                        });
                        let reply = ControlMessage::PairInitAck(response);
                        if let Err(e) = self.channels.send_to(&peer, reply).await {
                            warn!(peer = %peer, "pair init reply not delivered: {e}");
                        }
                    }
                    Err(e) => warn!(peer = %peer, "pair init rejected: {e}"),
                }
            }

            ControlMessage::PairConfirm(request) => {
                let result = self.engine.lock().await.confirm(&request);
                let outcome = result.to_outcome();
                if let ConfirmResult::Accepted(accepted) = &result {
                    self.apply_pairing(accepted).await;
                }
                let reply = ControlMessage::PairConfirmAck(outcome);
                if let Err(e) = self.channels.send_to(&peer, reply).await {
                    warn!(peer = %peer, "pair confirm reply not delivered: {e}");
                }
            }

            ControlMessage::PairToken(request) => {
                let result = self.engine.lock().await.redeem_token(&request);
                let outcome = match &result {
                    Ok(accepted) => {
                        self.apply_pairing(accepted).await;
                        cribcall_protocol::pairing::PairOutcome::accepted(
                            accepted.monitor.clone(),
                        )
                    }
                    Err(failure) => {
                        cribcall_protocol::pairing::PairOutcome::rejected(failure.describe())
                    }
                };
                let reply = ControlMessage::PairConfirmAck(outcome);
                if let Err(e) = self.channels.send_to(&peer, reply).await {
                    warn!(peer = %peer, "pair token reply not delivered: {e}");
                }
            }

            // Acks are remote-bound; a remote echoing them back is noise.
            ControlMessage::PairInitAck(_) | ControlMessage::PairConfirmAck(_) => {
                debug!(peer = %peer, "ignoring pairing ack from remote");
            }
        }
    }

    fn register_connection(
        self: &Arc<Self>,
        connection: Box<dyn cribcall_protocol::TransportConnection>,
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    ) {
        let channel = ControlChannel::spawn_with(connection, inbound_tx, |channel| {
            // Registered before the task runs: inbound dispatch can always
            // reply through the registry.
            self.channels.insert(channel.clone());
        });
        let info = channel.info().clone();
        let _ = self.events.send(DaemonEvent::ChannelUp {
            fingerprint: info.peer_fingerprint.clone(),
            connection_id: info.connection_id.clone(),
        });

        // Prune the registry and surface the terminal state.
        let inner = self.clone();
        tokio::spawn(async move {
            let mut states = channel.state_stream();
            let terminal = states.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
            inner
                .channels
                .remove_connection(&info.peer_fingerprint, &info.connection_id);
            let failure = match terminal {
                Ok(ChannelState::Error { failure, .. }) => Some(failure),
                _ => None,
            };
            let _ = inner.events.send(DaemonEvent::ChannelDown {
                fingerprint: info.peer_fingerprint,
                connection_id: info.connection_id,
                failure,
            });
        });
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    mut listener: Box<dyn TransportListener>,
    mut trust_rx: mpsc::UnboundedReceiver<TrustCommand>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok(connection) => inner.register_connection(connection, inbound_tx.clone()),
                Err(ProtocolError::Closed(_)) => {
                    info!("control listener closed, accept loop ending");
                    break;
                }
                Err(e) => {
                    error!("error accepting connection: {e}");
                }
            },
            command = trust_rx.recv() => match command {
                Some(TrustCommand::Rebind { trusted, ack }) => {
                    if let Err(e) = listener.update_trust(trusted).await {
                        error!("listener rebind failed: {e}");
                    }
                    let _ = ack.send(());
                }
                Some(TrustCommand::Shutdown { ack }) => {
                    listener.close().await;
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
        }
    }
}

async fn dispatch_loop(inner: Arc<ServerInner>, mut inbound_rx: mpsc::UnboundedReceiver<InboundMessage>) {
    while let Some(message) = inbound_rx.recv().await {
        inner.handle_message(message).await;
    }
    debug!("dispatch loop ended");
}
