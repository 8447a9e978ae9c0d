//! Peer engine: the client side of the protocol.
//!
//! Owns the negotiation state machine (session id, miss counter, pending
//! flag) behind a single mutex, a cooperative negotiation timer, and the
//! stamping of outgoing samples. Events are snapshotted under the lock and
//! emitted after it is released, so subscriber code never runs with engine
//! state held.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, warn};

use crate::{
    config::PeerSettings,
    logging::LogSink,
    metrics::Metrics,
    transport::{DatagramHandler, Transport, TransportError, TransportOptions},
    wire::{self, Message, NegotiationRequest, NegotiationResponse, SampleDown, SampleUp},
};

/// Consecutive unanswered negotiation ticks tolerated while connected.
pub const MISS_LIMIT: u8 = 3;

/// State change and inbound-payload notifications surfaced to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A session was established (transition out of the disconnected state).
    Connected { peer_id: u16, session_id: u16 },
    /// A negotiation tick fired with the previous request still unanswered.
    Timeout {
        peer_id: u16,
        session_id: u16,
        miss_count: u8,
    },
    /// The miss limit was reached; `session_id` is the session that lapsed.
    Disconnected { peer_id: u16, session_id: u16 },
    /// A sample arrived from the controller.
    SampleDown(SampleDown),
}

#[derive(Debug)]
struct NegotiationState {
    session_id: u16,
    miss_count: u8,
    waiting_for_response: bool,
}

struct PeerShared {
    peer_id: u16,
    settings: PeerSettings,
    transport: Transport,
    state: Mutex<NegotiationState>,
    events: mpsc::Sender<PeerEvent>,
    interval_tx: watch::Sender<Duration>,
    metrics: Arc<Metrics>,
}

impl PeerShared {
    /// Shared body of a timer tick and a manual negotiation: miss-counter
    /// bookkeeping, then a request stamped with the current session.
    async fn negotiate(&self, initial: bool) -> bool {
        let mut pending = Vec::new();
        let mut interval_change = None;
        let request;
        {
            let mut state = self.state.lock().expect("peer state lock");
            if !initial && state.waiting_for_response && state.session_id != 0 {
                state.miss_count += 1;
                self.metrics.negotiation_timeouts.inc();
                if state.miss_count >= MISS_LIMIT {
                    let prior = state.session_id;
                    state.session_id = 0;
                    state.miss_count = 0;
                    interval_change = Some(self.settings.disconnected_interval());
                    pending.push(PeerEvent::Disconnected {
                        peer_id: self.peer_id,
                        session_id: prior,
                    });
                } else {
                    pending.push(PeerEvent::Timeout {
                        peer_id: self.peer_id,
                        session_id: state.session_id,
                        miss_count: state.miss_count,
                    });
                }
            }
            state.waiting_for_response = true;
            request = NegotiationRequest {
                session_id: state.session_id,
                peer_id: self.peer_id,
            };
        }

        if let Some(interval) = interval_change {
            let _ = self.interval_tx.send(interval);
        }
        for event in pending {
            self.push_event(event).await;
        }

        self.metrics.negotiation_requests.inc();
        match request.encode() {
            Ok(bytes) => self.transport.send(Bytes::from(bytes), None).await,
            Err(err) => {
                error!(error = %err, "failed to encode negotiation request");
                false
            }
        }
    }

    async fn handle_response(&self, response: NegotiationResponse) {
        if response.peer_id != self.peer_id {
            debug!(
                got = response.peer_id,
                want = self.peer_id,
                "ignoring negotiation response addressed to another peer"
            );
            return;
        }
        self.metrics.negotiation_responses.inc();

        let became_connected;
        {
            let mut state = self.state.lock().expect("peer state lock");
            let was_disconnected = state.session_id == 0;
            state.session_id = response.session_id;
            state.miss_count = 0;
            state.waiting_for_response = false;
            became_connected = was_disconnected && response.session_id != 0;
        }

        let interval = if response.session_id != 0 {
            self.settings.connected_interval()
        } else {
            self.settings.disconnected_interval()
        };
        let _ = self.interval_tx.send(interval);

        if became_connected {
            self.push_event(PeerEvent::Connected {
                peer_id: self.peer_id,
                session_id: response.session_id,
            })
            .await;
        }
    }

    async fn handle_datagram(&self, datagram: Bytes, from: SocketAddr) {
        let message = match wire::decode_datagram(&datagram) {
            Ok(message) => message,
            Err(err) => {
                self.metrics.malformed_frames.inc();
                debug!(%from, error = %err, "dropping malformed datagram");
                return;
            }
        };

        match message {
            Message::NegotiationResponse(response) => self.handle_response(response).await,
            Message::SampleDown(sample) => {
                self.metrics.samples_down.inc();
                self.push_event(PeerEvent::SampleDown(sample)).await;
            }
            other => {
                debug!(
                    kind = ?other.message_type(),
                    "ignoring controller-bound message on the peer side"
                );
            }
        }
    }

    async fn push_event(&self, event: PeerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("peer event channel full; applying backpressure");
                if self.events.send(event).await.is_err() {
                    debug!("peer event receiver dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct PeerDispatch {
    shared: Weak<PeerShared>,
}

impl DatagramHandler for PeerDispatch {
    async fn on_datagram(&self, datagram: Bytes, from: SocketAddr) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_datagram(datagram, from).await;
        }
    }
}

/// Negotiation timer: sleeps on the interval currently published by the
/// engine; a zero interval parks it until the interval changes. Publishing a
/// new interval (even an equal one) rearms the pending sleep, which is how a
/// fresh response pushes the next keep-alive a full period out.
async fn run_timer(
    shared: Weak<PeerShared>,
    mut interval_rx: watch::Receiver<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let interval = *interval_rx.borrow_and_update();
        if interval.is_zero() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = time::sleep(interval) => {
                let Some(shared) = shared.upgrade() else { break };
                shared.negotiate(false).await;
            }
        }
    }
}

/// Client role handle.
///
/// Created via [`Peer::start`]; dropping it tears the engine down, though an
/// explicit [`Peer::stop`] is the orderly path.
pub struct Peer {
    shared: Arc<PeerShared>,
    shutdown_tx: watch::Sender<bool>,
    timer_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Binds the transport and brings the engine up.
    ///
    /// The returned receiver carries [`PeerEvent`]s. When the disconnected
    /// interval is non-zero an initial negotiation request goes out
    /// immediately (without miss-counter bookkeeping).
    pub async fn start(
        peer_id: u16,
        transport: TransportOptions,
        settings: PeerSettings,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), TransportError> {
        let transport = Transport::new(transport, Arc::clone(&metrics));
        Self::start_inner(peer_id, transport, settings, metrics).await
    }

    /// Like [`Peer::start`] with a caller-supplied log sink.
    pub async fn start_with_sink(
        peer_id: u16,
        transport: TransportOptions,
        settings: PeerSettings,
        metrics: Arc<Metrics>,
        sink: Arc<dyn LogSink>,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), TransportError> {
        let transport = Transport::with_sink(transport, Arc::clone(&metrics), sink);
        Self::start_inner(peer_id, transport, settings, metrics).await
    }

    async fn start_inner(
        peer_id: u16,
        transport: Transport,
        settings: PeerSettings,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), TransportError> {
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer);
        let (interval_tx, interval_rx) = watch::channel(settings.disconnected_interval());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(PeerShared {
            peer_id,
            settings,
            transport,
            state: Mutex::new(NegotiationState {
                session_id: 0,
                miss_count: 0,
                waiting_for_response: false,
            }),
            events: events_tx,
            interval_tx,
            metrics,
        });

        if shared.transport.default_remote().is_none() {
            warn!("peer transport has no default remote; outbound packets will be skipped");
        }

        shared
            .transport
            .start(Arc::new(PeerDispatch {
                shared: Arc::downgrade(&shared),
            }))
            .await?;

        let timer = tokio::spawn(run_timer(
            Arc::downgrade(&shared),
            interval_rx,
            shutdown_rx,
        ));

        if !shared.settings.disconnected_interval().is_zero() {
            shared.negotiate(true).await;
        }

        Ok((
            Self {
                shared,
                shutdown_tx,
                timer_task: AsyncMutex::new(Some(timer)),
            },
            events_rx,
        ))
    }

    /// The immutable identifier this peer negotiates under.
    pub fn peer_id(&self) -> u16 {
        self.shared.peer_id
    }

    /// Local address of the bound socket, when running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr().await
    }

    /// Current session id; zero while disconnected.
    pub fn session_id(&self) -> u16 {
        self.shared.state.lock().expect("peer state lock").session_id
    }

    /// Whether a session is currently held.
    pub fn is_connected(&self) -> bool {
        self.session_id() != 0
    }

    /// Sends a negotiation request now, with the same observable semantics
    /// as a timer tick (miss counting included).
    pub async fn negotiate(&self) -> bool {
        self.shared.negotiate(false).await
    }

    /// Stamps `sample` with the current session and peer ids, then enqueues
    /// it toward the controller. This is the only place those fields are
    /// populated; whatever the caller set is overwritten.
    pub async fn send_sample(&self, mut sample: SampleUp) -> bool {
        {
            let state = self.shared.state.lock().expect("peer state lock");
            sample.session_id = state.session_id;
            sample.peer_id = self.shared.peer_id;
        }
        match sample.encode() {
            Ok(bytes) => {
                let sent = self.shared.transport.send(Bytes::from(bytes), None).await;
                if sent {
                    self.shared.metrics.samples_up.inc();
                }
                sent
            }
            Err(err) => {
                error!(error = %err, "failed to encode sample");
                false
            }
        }
    }

    /// Stops the negotiation timer and the transport loops.
    ///
    /// Returns `false` when the engine was already stopped.
    pub async fn stop(&self) -> bool {
        let _ = self.shutdown_tx.send(true);
        if let Some(timer) = self.timer_task.lock().await.take() {
            let _ = timer.await;
        }
        self.shared.transport.stop().await
    }

    /// Metrics handle shared with the transport.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }
}
