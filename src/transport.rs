//! Datagram transport core: socket ownership, the bounded outbound queue,
//! and the two worker loops (receive and send).
//!
//! The send loop is the queue's sole consumer, so packets enqueued from a
//! single caller task leave the socket in enqueue order. Both loops park on a
//! shared shutdown signal; [`Transport::stop`] flips it, joins the loops, and
//! drops the socket, after which a fresh [`Transport::start`] reuses the same
//! instance.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    logging::{hex_dump, LogLevel, LogSink, TracingSink},
    metrics::Metrics,
};

/// Outbound queue capacity used when the options leave it unset.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 100;

const RECV_BUFFER_LEN: usize = 65535;

/// Bind-time options for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Local UDP bind address.
    pub local: SocketAddr,
    /// Default destination for packets enqueued without an explicit one.
    ///
    /// Required for the peer role; optional for a controller, where it only
    /// serves as the fallback dispatch target.
    pub remote: Option<SocketAddr>,
    /// Outbound queue capacity; producers block while the queue is full.
    pub send_queue_capacity: usize,
}

impl TransportOptions {
    /// Creates options binding `local` with no default remote.
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            remote: None,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }

    /// Sets the default remote endpoint.
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the outbound queue capacity (clamped to at least 1).
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }
}

/// Lifecycle error raised by [`Transport::start`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport already has live worker loops.
    #[error("transport already started")]
    AlreadyStarted,

    /// Binding the UDP socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Inbound dispatch target registered at [`Transport::start`].
///
/// The receive loop awaits the returned future to completion before reading
/// the next datagram, so handlers provide natural back-pressure on the
/// socket.
pub trait DatagramHandler: Send + Sync + 'static {
    /// Called once per received datagram with the sender's endpoint.
    fn on_datagram(&self, datagram: Bytes, from: SocketAddr) -> impl Future<Output = ()> + Send;
}

#[derive(Debug)]
struct Outbound {
    payload: Bytes,
    destination: Option<SocketAddr>,
}

#[derive(Debug)]
struct Active {
    local_addr: SocketAddr,
    queue_tx: mpsc::Sender<Outbound>,
    shutdown_tx: watch::Sender<bool>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

/// UDP transport shared by the peer and controller engines.
pub struct Transport {
    options: TransportOptions,
    sink: Arc<dyn LogSink>,
    metrics: Arc<Metrics>,
    active: Mutex<Option<Active>>,
}

impl Transport {
    /// Creates a stopped transport logging through [`TracingSink`].
    pub fn new(options: TransportOptions, metrics: Arc<Metrics>) -> Self {
        Self::with_sink(options, metrics, Arc::new(TracingSink))
    }

    /// Creates a stopped transport with a caller-supplied log sink.
    pub fn with_sink(
        options: TransportOptions,
        metrics: Arc<Metrics>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            options,
            sink,
            metrics,
            active: Mutex::new(None),
        }
    }

    /// Binds the socket and spawns the receive and send loops.
    ///
    /// `handler` becomes the inbound dispatch target for the lifetime of
    /// this start/stop cycle.
    pub async fn start<H: DatagramHandler>(&self, handler: Arc<H>) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let socket = UdpSocket::bind(self.options.local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.options.local,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| TransportError::Bind {
            addr: self.options.local,
            source,
        })?;
        let socket = Arc::new(socket);

        let (queue_tx, queue_rx) = mpsc::channel(self.options.send_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let send_task = tokio::spawn(run_send_loop(
            Arc::clone(&socket),
            queue_rx,
            self.options.remote,
            shutdown_rx.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.metrics),
        ));
        let recv_task = tokio::spawn(run_recv_loop(
            socket,
            handler,
            shutdown_rx,
            Arc::clone(&self.sink),
            Arc::clone(&self.metrics),
        ));

        debug!(%local_addr, remote = ?self.options.remote, "transport started");
        *active = Some(Active {
            local_addr,
            queue_tx,
            shutdown_tx,
            send_task,
            recv_task,
        });
        Ok(())
    }

    /// Cancels both loops, waits for them, and closes the socket.
    ///
    /// Returns `false` when the transport was not running. Producers blocked
    /// on a full queue observe `false` from their pending `send`.
    pub async fn stop(&self) -> bool {
        let taken = self.active.lock().await.take();
        let Some(active) = taken else {
            return false;
        };

        let _ = active.shutdown_tx.send(true);
        let _ = active.send_task.await;
        let _ = active.recv_task.await;
        self.metrics.send_queue_depth.set(0);
        debug!(local_addr = %active.local_addr, "transport stopped");
        true
    }

    /// Enqueues an already-serialized datagram.
    ///
    /// Blocks while the outbound queue is full. Returns `false` when the
    /// transport is stopped (including a stop that lands mid-wait).
    pub async fn send(&self, payload: Bytes, destination: Option<SocketAddr>) -> bool {
        let queue_tx = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(active) => active.queue_tx.clone(),
                None => return false,
            }
        };

        match queue_tx
            .send(Outbound {
                payload,
                destination,
            })
            .await
        {
            Ok(()) => true,
            Err(_closed) => false,
        }
    }

    /// Returns `true` while the worker loops are live.
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Local address of the bound socket, when running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().await.as_ref().map(|a| a.local_addr)
    }

    /// Default remote endpoint recorded at construction.
    pub fn default_remote(&self) -> Option<SocketAddr> {
        self.options.remote
    }

    /// Configured outbound queue capacity.
    pub fn send_queue_capacity(&self) -> usize {
        self.options.send_queue_capacity
    }
}

async fn run_send_loop(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::Receiver<Outbound>,
    default_remote: Option<SocketAddr>,
    mut shutdown: watch::Receiver<bool>,
    sink: Arc<dyn LogSink>,
    metrics: Arc<Metrics>,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = queue.recv() => match item {
                Some(outbound) => outbound,
                None => break,
            },
        };
        metrics.send_queue_depth.set(queue.len() as i64);

        let Some(destination) = outbound.destination.or(default_remote) else {
            metrics.packets_skipped_no_destination.inc();
            debug!("skipping outbound packet: no destination and no default remote");
            continue;
        };

        if sink.enabled(LogLevel::Debug) {
            sink.log(
                LogLevel::Debug,
                &format!(
                    "tx {} bytes -> {destination}\n{}",
                    outbound.payload.len(),
                    hex_dump(&outbound.payload)
                ),
            );
        }

        match socket.send_to(&outbound.payload, destination).await {
            Ok(sent) => {
                metrics.datagrams_sent.inc();
                metrics.bytes_sent.inc_by(sent as u64);
            }
            Err(err) => {
                // Transient; the loop keeps draining.
                metrics.send_errors.inc();
                warn!(%destination, error = %err, "datagram send failed");
            }
        }
    }
}

async fn run_recv_loop<H: DatagramHandler>(
    socket: Arc<UdpSocket>,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
    sink: Arc<dyn LogSink>,
    metrics: Arc<Metrics>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let (len, from) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(err) => {
                    metrics.recv_errors.inc();
                    warn!(error = %err, "datagram receive failed");
                    continue;
                }
            },
        };

        metrics.datagrams_received.inc();
        metrics.bytes_received.inc_by(len as u64);

        if sink.enabled(LogLevel::Debug) {
            sink.log(
                LogLevel::Debug,
                &format!("rx {len} bytes <- {from}\n{}", hex_dump(&buf[..len])),
            );
        }

        let datagram = Bytes::copy_from_slice(&buf[..len]);
        handler.on_datagram(datagram, from).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Collect {
        tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    }

    impl DatagramHandler for Collect {
        async fn on_datagram(&self, datagram: Bytes, from: SocketAddr) {
            let _ = self.tx.send((datagram, from));
        }
    }

    struct Ignore;

    impl DatagramHandler for Ignore {
        async fn on_datagram(&self, _datagram: Bytes, _from: SocketAddr) {}
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().expect("metrics"))
    }

    #[tokio::test]
    async fn start_stop_restart_cycle() {
        let transport = Transport::new(TransportOptions::new(localhost()), test_metrics());
        assert!(!transport.is_running().await);
        assert!(!transport.stop().await);

        transport.start(Arc::new(Ignore)).await.unwrap();
        assert!(transport.is_running().await);
        let first_addr = transport.local_addr().await.unwrap();
        assert_ne!(first_addr.port(), 0);

        let err = transport.start(Arc::new(Ignore)).await.unwrap_err();
        assert!(matches!(err, TransportError::AlreadyStarted));

        assert!(transport.stop().await);
        assert!(!transport.stop().await);
        assert!(!transport.is_running().await);

        // A fresh start after stop must succeed.
        transport.start(Arc::new(Ignore)).await.unwrap();
        assert!(transport.is_running().await);
        assert!(transport.stop().await);
    }

    #[tokio::test]
    async fn single_producer_order_is_preserved() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = Transport::new(TransportOptions::new(localhost()), test_metrics());
        receiver.start(Arc::new(Collect { tx })).await.unwrap();
        let receiver_addr = receiver.local_addr().await.unwrap();

        let sender = Transport::new(
            TransportOptions::new(localhost()).with_remote(receiver_addr),
            test_metrics(),
        );
        sender.start(Arc::new(Ignore)).await.unwrap();

        const COUNT: u8 = 32;
        for i in 0..COUNT {
            assert!(sender.send(Bytes::copy_from_slice(&[i]), None).await);
        }

        for expected in 0..COUNT {
            let (datagram, _) = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            assert_eq!(datagram.as_ref(), &[expected]);
        }

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn explicit_destination_overrides_default_remote() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let a = Transport::new(TransportOptions::new(localhost()), test_metrics());
        a.start(Arc::new(Collect { tx: tx_a })).await.unwrap();
        let addr_a = a.local_addr().await.unwrap();

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let b = Transport::new(TransportOptions::new(localhost()), test_metrics());
        b.start(Arc::new(Collect { tx: tx_b })).await.unwrap();
        let addr_b = b.local_addr().await.unwrap();

        let sender = Transport::new(
            TransportOptions::new(localhost()).with_remote(addr_a),
            test_metrics(),
        );
        sender.start(Arc::new(Ignore)).await.unwrap();

        assert!(sender.send(Bytes::from_static(b"default"), None).await);
        assert!(sender.send(Bytes::from_static(b"override"), Some(addr_b)).await);

        let (datagram, _) = timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.as_ref(), b"default");

        let (datagram, _) = timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.as_ref(), b"override");

        sender.stop().await;
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn packet_without_destination_is_skipped() {
        let metrics = test_metrics();
        let transport = Transport::new(TransportOptions::new(localhost()), Arc::clone(&metrics));
        transport.start(Arc::new(Ignore)).await.unwrap();

        assert!(transport.send(Bytes::from_static(b"nowhere"), None).await);

        // The send loop counts the skip once it drains the packet.
        timeout(Duration::from_secs(5), async {
            while metrics.packets_skipped_no_destination.get() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("skip was never counted");

        transport.stop().await;
    }

    #[tokio::test]
    async fn send_after_stop_returns_false() {
        let transport = Transport::new(TransportOptions::new(localhost()), test_metrics());
        transport.start(Arc::new(Ignore)).await.unwrap();
        transport.stop().await;
        assert!(!transport.send(Bytes::from_static(b"late"), None).await);
    }
}
