//! Controller engine: the server side of the protocol.
//!
//! Owns the peer registry (session → record plus a peer-id index), allocates
//! session ids, answers negotiation requests, and runs the periodic sweeper
//! that evicts peers whose negotiations have gone stale. Sample traffic is
//! routed by session id with the transport's default remote as the fallback.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, warn};

use crate::{
    config::ControllerSettings,
    logging::LogSink,
    metrics::Metrics,
    transport::{DatagramHandler, Transport, TransportError, TransportOptions},
    wire::{self, Message, NegotiationRequest, NegotiationResponse, SampleDown, SampleUp},
};

/// Fixed cadence of the registry sweeper.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Registry and inbound-payload notifications surfaced to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A previously unknown peer id completed negotiation.
    PeerConnected {
        peer_id: u16,
        session_id: u16,
        endpoint: SocketAddr,
    },
    /// The sweeper evicted a peer whose negotiations went stale.
    PeerDisconnected {
        peer_id: u16,
        session_id: u16,
        endpoint: SocketAddr,
    },
    /// A sample arrived from a peer.
    SampleUp {
        message: SampleUp,
        from: SocketAddr,
    },
}

/// Outcome of a [`NegotiationHook`] invocation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationDecision {
    /// Session id to place in the response.
    pub session_id: u16,
    /// Whether a response should be sent at all.
    pub send_response: bool,
}

/// Application-owned negotiation policy, replacing the built-in registry.
///
/// Installing a hook turns the controller into a pure protocol layer: no
/// record is created, no [`ControllerEvent::PeerConnected`] fires, and the
/// response carries whatever session the hook returns.
pub type NegotiationHook = dyn Fn(&NegotiationRequest, SocketAddr) -> NegotiationDecision + Send + Sync;

/// State tracked for one negotiated peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Stable identifier chosen by the peer.
    pub peer_id: u16,
    /// Most recent source endpoint; refreshed on every negotiation.
    pub endpoint: SocketAddr,
    /// Receipt time of the most recent negotiation.
    pub last_negotiation: Instant,
}

#[derive(Debug)]
struct Registry {
    sessions: AHashMap<u16, PeerRecord>,
    peers: AHashMap<u16, u16>,
    next_session_id: u16,
}

impl Registry {
    fn new() -> Self {
        Self {
            sessions: AHashMap::new(),
            peers: AHashMap::new(),
            next_session_id: 1,
        }
    }

    /// Hands out the next session id, skipping zero on wrap and any id still
    /// tracked. Returns `None` only with all 65535 ids live.
    fn allocate_session_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_session_id;
            self.next_session_id = if self.next_session_id == u16::MAX {
                1
            } else {
                self.next_session_id + 1
            };
            if !self.sessions.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Registers or refreshes `peer_id` negotiating from `endpoint`.
    ///
    /// A known peer keeps its session; the endpoint is overwritten either
    /// way (address-change tolerance) and the timestamp restarts the
    /// eviction clock. Returns the session id and whether it is new.
    fn upsert(&mut self, peer_id: u16, endpoint: SocketAddr, now: Instant) -> Option<(u16, bool)> {
        if let Some(&session_id) = self.peers.get(&peer_id) {
            if let Some(record) = self.sessions.get_mut(&session_id) {
                record.endpoint = endpoint;
                record.last_negotiation = now;
            }
            return Some((session_id, false));
        }

        let session_id = self.allocate_session_id()?;
        self.sessions.insert(
            session_id,
            PeerRecord {
                peer_id,
                endpoint,
                last_negotiation: now,
            },
        );
        self.peers.insert(peer_id, session_id);
        Some((session_id, true))
    }

    /// Removes every record whose age exceeds `timeout` (strictly; a record
    /// exactly at the boundary survives) and returns the evicted entries.
    fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<(u16, PeerRecord)> {
        let expired: Vec<u16> = self
            .sessions
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_negotiation) > timeout)
            .map(|(&session_id, _)| session_id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for session_id in expired {
            if let Some(record) = self.sessions.remove(&session_id) {
                self.peers.remove(&record.peer_id);
                evicted.push((session_id, record));
            }
        }
        evicted
    }

    fn endpoint_for(&self, session_id: u16) -> Option<SocketAddr> {
        self.sessions.get(&session_id).map(|record| record.endpoint)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn snapshot(&self) -> Vec<(u16, PeerRecord)> {
        let mut entries: Vec<_> = self
            .sessions
            .iter()
            .map(|(&session_id, record)| (session_id, record.clone()))
            .collect();
        entries.sort_by_key(|(session_id, _)| *session_id);
        entries
    }
}

struct ControllerShared {
    settings: ControllerSettings,
    transport: Transport,
    registry: Mutex<Registry>,
    events: mpsc::Sender<ControllerEvent>,
    hook: Option<Box<NegotiationHook>>,
    metrics: Arc<Metrics>,
}

impl ControllerShared {
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
            Message::NegotiationRequest(request) => self.handle_negotiation(request, from).await,
            Message::SampleUp(sample) => {
                self.metrics.samples_up.inc();
                self.push_event(ControllerEvent::SampleUp {
                    message: sample,
                    from,
                })
                .await;
            }
            other => {
                debug!(
                    kind = ?other.message_type(),
                    "ignoring peer-bound message on the controller side"
                );
            }
        }
    }

    async fn handle_negotiation(&self, request: NegotiationRequest, from: SocketAddr) {
        self.metrics.negotiation_requests.inc();

        if let Some(hook) = &self.hook {
            let decision = hook(&request, from);
            if decision.send_response {
                self.send_response(decision.session_id, request.peer_id, from)
                    .await;
            }
            return;
        }

        let outcome = {
            let mut registry = self.registry.lock().expect("registry lock");
            let outcome = registry.upsert(request.peer_id, from, Instant::now());
            if outcome.is_some() {
                self.metrics.peers_tracked.set(registry.len() as i64);
            }
            outcome
        };
        let Some((session_id, is_new)) = outcome else {
            warn!(peer_id = request.peer_id, "session id space exhausted; dropping negotiation");
            return;
        };

        if is_new {
            self.push_event(ControllerEvent::PeerConnected {
                peer_id: request.peer_id,
                session_id,
                endpoint: from,
            })
            .await;
        }

        // The response goes out for new and existing peers alike.
        self.send_response(session_id, request.peer_id, from).await;
    }

    async fn send_response(&self, session_id: u16, peer_id: u16, destination: SocketAddr) {
        let response = NegotiationResponse {
            session_id,
            peer_id,
        };
        match response.encode() {
            Ok(bytes) => {
                if self
                    .transport
                    .send(Bytes::from(bytes), Some(destination))
                    .await
                {
                    self.metrics.negotiation_responses.inc();
                }
            }
            Err(err) => {
                error!(error = %err, "failed to encode negotiation response");
            }
        }
    }

    async fn sweep_once(&self) {
        let evicted = {
            let mut registry = self.registry.lock().expect("registry lock");
            let evicted = registry.sweep(Instant::now(), self.settings.peer_timeout());
            if !evicted.is_empty() {
                self.metrics.peers_tracked.set(registry.len() as i64);
                self.metrics.peers_evicted.inc_by(evicted.len() as u64);
            }
            evicted
        };

        for (session_id, record) in evicted {
            debug!(
                peer_id = record.peer_id,
                session_id, endpoint = %record.endpoint, "evicting stale peer"
            );
            self.push_event(ControllerEvent::PeerDisconnected {
                peer_id: record.peer_id,
                session_id,
                endpoint: record.endpoint,
            })
            .await;
        }
    }

    async fn push_event(&self, event: ControllerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("controller event channel full; applying backpressure");
                if self.events.send(event).await.is_err() {
                    debug!("controller event receiver dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct ControllerDispatch {
    shared: Weak<ControllerShared>,
}

impl DatagramHandler for ControllerDispatch {
    async fn on_datagram(&self, datagram: Bytes, from: SocketAddr) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_datagram(datagram, from).await;
        }
    }
}

async fn run_sweeper(shared: Weak<ControllerShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = time::sleep(SWEEP_PERIOD) => {
                let Some(shared) = shared.upgrade() else { break };
                shared.sweep_once().await;
            }
        }
    }
}

/// Builder for a [`Controller`] with a custom sink or negotiation hook.
pub struct ControllerBuilder {
    transport: TransportOptions,
    settings: ControllerSettings,
    metrics: Arc<Metrics>,
    sink: Option<Arc<dyn LogSink>>,
    hook: Option<Box<NegotiationHook>>,
}

impl ControllerBuilder {
    /// Creates a builder with default settings.
    pub fn new(transport: TransportOptions, metrics: Arc<Metrics>) -> Self {
        Self {
            transport,
            settings: ControllerSettings::default(),
            metrics,
            sink: None,
            hook: None,
        }
    }

    /// Replaces the controller settings.
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Installs a log sink for datagram hex dumps.
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Installs an application-owned negotiation policy (protocol-only mode).
    pub fn negotiation_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&NegotiationRequest, SocketAddr) -> NegotiationDecision + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Binds the transport and brings the engine up.
    pub async fn start(
        self,
    ) -> Result<(Controller, mpsc::Receiver<ControllerEvent>), TransportError> {
        let transport = match self.sink {
            Some(sink) => Transport::with_sink(self.transport, Arc::clone(&self.metrics), sink),
            None => Transport::new(self.transport, Arc::clone(&self.metrics)),
        };
        Controller::start_inner(transport, self.settings, self.metrics, self.hook).await
    }
}

/// Server role handle.
pub struct Controller {
    shared: Arc<ControllerShared>,
    shutdown_tx: watch::Sender<bool>,
    sweeper_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Binds the transport and brings the engine up with the built-in
    /// registry path.
    pub async fn start(
        transport: TransportOptions,
        settings: ControllerSettings,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::Receiver<ControllerEvent>), TransportError> {
        let transport = Transport::new(transport, Arc::clone(&metrics));
        Self::start_inner(transport, settings, metrics, None).await
    }

    /// Returns a builder for installing a sink or negotiation hook.
    pub fn builder(transport: TransportOptions, metrics: Arc<Metrics>) -> ControllerBuilder {
        ControllerBuilder::new(transport, metrics)
    }

    async fn start_inner(
        transport: Transport,
        settings: ControllerSettings,
        metrics: Arc<Metrics>,
        hook: Option<Box<NegotiationHook>>,
    ) -> Result<(Self, mpsc::Receiver<ControllerEvent>), TransportError> {
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(ControllerShared {
            settings,
            transport,
            registry: Mutex::new(Registry::new()),
            events: events_tx,
            hook,
            metrics,
        });

        shared
            .transport
            .start(Arc::new(ControllerDispatch {
                shared: Arc::downgrade(&shared),
            }))
            .await?;

        let sweeper = tokio::spawn(run_sweeper(Arc::downgrade(&shared), shutdown_rx));

        Ok((
            Self {
                shared,
                shutdown_tx,
                sweeper_task: AsyncMutex::new(Some(sweeper)),
            },
            events_rx,
        ))
    }

    /// Local address of the bound socket, when running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.local_addr().await
    }

    /// Sends a sample toward the peer holding `sample.session_id`.
    ///
    /// Unknown sessions fall back to the transport's default remote; with
    /// neither available the packet is skipped by the send loop.
    pub async fn send_sample(&self, sample: SampleDown) -> bool {
        let destination = {
            let registry = self.shared.registry.lock().expect("registry lock");
            registry.endpoint_for(sample.session_id)
        };
        match sample.encode() {
            Ok(bytes) => {
                let sent = self
                    .shared
                    .transport
                    .send(Bytes::from(bytes), destination)
                    .await;
                if sent {
                    self.shared.metrics.samples_down.inc();
                }
                sent
            }
            Err(err) => {
                error!(error = %err, "failed to encode sample");
                false
            }
        }
    }

    /// Runs an eviction pass immediately, outside the fixed sweep cadence.
    pub async fn sweep_now(&self) {
        self.shared.sweep_once().await;
    }

    /// Snapshot of the tracked peers, ordered by session id.
    pub fn tracked_peers(&self) -> Vec<(u16, PeerRecord)> {
        self.shared.registry.lock().expect("registry lock").snapshot()
    }

    /// Number of peers currently tracked.
    pub fn peer_count(&self) -> usize {
        self.shared.registry.lock().expect("registry lock").len()
    }

    /// Stops the sweeper and the transport loops.
    ///
    /// Returns `false` when the engine was already stopped.
    pub async fn stop(&self) -> bool {
        let _ = self.shutdown_tx.send(true);
        if let Some(sweeper) = self.sweeper_task.lock().await.take() {
            let _ = sweeper.await;
        }
        self.shared.transport.stop().await
    }

    /// Metrics handle shared with the transport.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }
}
