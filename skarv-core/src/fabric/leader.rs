//! Leader-replicated fabric.
//!
//! Every consumer runs the same code; exactly one wins the election cell
//! and owns a local producer host. The leader pumps producer events onto
//! a broadcast bus, coalescing slices to at most one per display frame
//! (the consumer bridge re-rates at that frequency anyway); status and
//! metrics go out immediately. Followers subscribe, ping their presence
//! every 2 s, and infer `connected` from the first slice since they can
//! never observe the leader's one-time transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Endpoints;
use crate::data::{
    BusMessage, BusPayload, ConnectionStatus, MetricsPatch, OrderbookSlice, ProducerEvent,
    SyncMode,
};
use crate::fabric::election::{self, ElectionCell, HEARTBEAT_INTERVAL, LEASE_TTL};
use crate::fabric::session::Session;
use crate::fabric::{EventPublisher, ProducerFactory};
use crate::producer::{ProducerHandle, ProducerHost};

/// Timing and feed parameters for the leader fabric.
#[derive(Debug, Clone)]
pub struct LeaderFabricConfig {
    pub endpoints: Endpoints,
    pub depth: u32,
    /// Leader lease refresh / follower recheck interval.
    pub heartbeat: Duration,
    /// Lease freshness window.
    pub lease_ttl: Duration,
    /// Drop a follower not heard from for this long.
    pub follower_ttl: Duration,
    /// Follower presence ping interval.
    pub ping_interval: Duration,
    /// Bus slice coalescing window (one display frame).
    pub frame_interval: Duration,
}

impl LeaderFabricConfig {
    pub fn new(endpoints: Endpoints, depth: u32) -> Self {
        Self {
            endpoints,
            depth,
            heartbeat: HEARTBEAT_INTERVAL,
            lease_ttl: LEASE_TTL,
            follower_ttl: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Consumer-side handle to the fabric.
#[derive(Debug)]
pub struct LeaderFabricHandle {
    tab_id: String,
    events: mpsc::UnboundedReceiver<ProducerEvent>,
    leadership: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
}

impl LeaderFabricHandle {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub async fn recv(&mut self) -> Option<ProducerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProducerEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<bool> {
        self.leadership.clone()
    }

    /// Resign (clearing the cell when leader) and stop the fabric task.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for LeaderFabricHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// The per-consumer fabric task.
pub struct LeaderFabric {
    config: LeaderFabricConfig,
    cell: Arc<dyn ElectionCell>,
    factory: ProducerFactory,
    session: Session,
    bus: broadcast::Sender<BusMessage>,
    bus_rx: broadcast::Receiver<BusMessage>,
    out: mpsc::UnboundedSender<ProducerEvent>,
    leadership: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    producer: Option<ProducerHandle>,
    producer_events: Option<mpsc::UnboundedReceiver<ProducerEvent>>,
    /// Latest slice awaiting the next frame flush onto the bus.
    pending_slice: Option<(OrderbookSlice, f64)>,
    followers: HashMap<String, Instant>,
    last_tab_count: usize,
    /// Follower side: whether any status has been seen yet.
    seen_status: bool,
}

impl LeaderFabric {
    /// Spawn a fabric member that runs a real producer when elected.
    pub fn spawn(
        config: LeaderFabricConfig,
        cell: Arc<dyn ElectionCell>,
        bus: broadcast::Sender<BusMessage>,
    ) -> LeaderFabricHandle {
        let endpoints = config.endpoints.clone();
        let depth = config.depth;
        Self::spawn_with_factory(
            config,
            cell,
            bus,
            Box::new(move |events| {
                let producer =
                    ProducerHost::spawn(depth, Box::new(EventPublisher::new(events)));
                producer.connect(&endpoints);
                producer
            }),
        )
    }

    /// Spawn with a custom producer factory (exercised directly in tests).
    pub fn spawn_with_factory(
        config: LeaderFabricConfig,
        cell: Arc<dyn ElectionCell>,
        bus: broadcast::Sender<BusMessage>,
        factory: ProducerFactory,
    ) -> LeaderFabricHandle {
        let session = Session::new(SyncMode::Broadcast);
        let tab_id = session.tab_id.clone();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (leadership_tx, leadership_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let fabric = LeaderFabric {
            bus_rx: bus.subscribe(),
            config,
            cell,
            factory,
            session,
            bus,
            out: out_tx,
            leadership: leadership_tx,
            shutdown: shutdown_rx,
            producer: None,
            producer_events: None,
            pending_slice: None,
            followers: HashMap::new(),
            last_tab_count: 0,
            seen_status: false,
        };
        tokio::spawn(fabric.run());

        LeaderFabricHandle {
            tab_id,
            events: out_rx,
            leadership: leadership_rx,
            shutdown: shutdown_tx,
        }
    }

    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        let mut frame = tokio::time::interval(self.config.frame_interval);
        let mut ping = tokio::time::interval(self.config.ping_interval);
        for tick in [&mut heartbeat, &mut frame, &mut ping] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        let mut cell_changes = self.cell.watch_changes();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.run_election();
                    self.prune_followers();
                }
                _ = Self::cell_changed(&mut cell_changes) => self.on_cell_change(),
                msg = self.bus_rx.recv() => match msg {
                    Ok(msg) => self.on_bus(msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "bus receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = Self::next_producer_event(&mut self.producer_events) => {
                    self.on_producer_event(event);
                }
                _ = frame.tick() => self.flush_pending_slice(),
                _ = ping.tick() => self.send_ping(),
            }
        }

        self.resign();
    }

    async fn cell_changed(changes: &mut Option<watch::Receiver<u64>>) {
        match changes {
            Some(rx) => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending().await,
        }
    }

    async fn next_producer_event(
        events: &mut Option<mpsc::UnboundedReceiver<ProducerEvent>>,
    ) -> ProducerEvent {
        match events {
            Some(rx) => match rx.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    /// Full claim attempt: refreshes our lease when leader, takes over a
    /// vacant or stale cell otherwise.
    fn run_election(&mut self) {
        match election::try_claim(self.cell.as_ref(), &self.session.tab_id, self.config.lease_ttl) {
            Ok(true) => self.become_leader(),
            Ok(false) => self.become_follower(),
            Err(e) => warn!("election cell unavailable: {e}"),
        }
    }

    /// A change event re-runs the check, but our own heartbeat echo must
    /// not trigger another write (that would self-oscillate).
    fn on_cell_change(&mut self) {
        match self.cell.read() {
            Ok(Some(record)) if record.tab_id == self.session.tab_id => {}
            Ok(Some(record)) if !record.is_stale(self.config.lease_ttl) => {
                self.become_follower();
            }
            Ok(_) => self.run_election(),
            Err(e) => warn!("election cell unavailable: {e}"),
        }
    }

    fn become_leader(&mut self) {
        if self.session.is_leader {
            return;
        }
        info!(tab_id = %self.session.tab_id, "elected leader, starting producer");
        self.session.is_leader = true;
        let _ = self.leadership.send(true);
        self.followers.clear();

        let (tx, rx) = mpsc::unbounded_channel();
        self.producer = Some((self.factory)(tx));
        self.producer_events = Some(rx);
        self.publish_tab_count();
    }

    fn become_follower(&mut self) {
        if !self.session.is_leader {
            return;
        }
        info!(tab_id = %self.session.tab_id, "lost leadership, stopping producer");
        self.session.is_leader = false;
        let _ = self.leadership.send(false);
        self.pending_slice = None;
        self.seen_status = false;
        if let Some(producer) = self.producer.take() {
            producer.disconnect();
        }
        self.producer_events = None;
    }

    /// Leader: pump a producer event locally and onto the bus.
    fn on_producer_event(&mut self, event: ProducerEvent) {
        match event {
            ProducerEvent::OrderbookUpdate {
                data,
                producer_timestamp_ms,
            } => {
                let _ = self.out.send(ProducerEvent::OrderbookUpdate {
                    data: data.clone(),
                    producer_timestamp_ms,
                });
                // Coalesce for the bus: keep only the newest until the
                // next frame flush.
                self.pending_slice = Some((data, producer_timestamp_ms));
            }
            ProducerEvent::StatusChange { status, error } => {
                let _ = self.out.send(ProducerEvent::StatusChange {
                    status: status.clone(),
                    error: error.clone(),
                });
                let _ = self.bus.send(BusMessage::Data {
                    payload: BusPayload::StatusChange { status, error },
                });
            }
            ProducerEvent::Metrics { data } => {
                let _ = self.out.send(ProducerEvent::Metrics { data: data.clone() });
                let _ = self.bus.send(BusMessage::Data {
                    payload: BusPayload::Metrics { data },
                });
            }
            ProducerEvent::SharedMemoryReady { .. } => {}
        }
    }

    fn flush_pending_slice(&mut self) {
        if let Some((slice, stamp)) = self.pending_slice.take() {
            let _ = self.bus.send(BusMessage::Data {
                payload: BusPayload::OrderbookUpdate {
                    data: slice,
                    producer_timestamp_ms: stamp,
                },
            });
        }
    }

    fn send_ping(&mut self) {
        if !self.session.is_leader {
            let _ = self.bus.send(BusMessage::TabPing {
                tab_id: self.session.tab_id.clone(),
            });
        }
    }

    fn on_bus(&mut self, msg: BusMessage) {
        if self.session.is_leader {
            // The leader only listens for presence; its own broadcasts
            // echo back here and are ignored.
            if let BusMessage::TabPing { tab_id } = msg {
                if tab_id != self.session.tab_id {
                    self.followers.insert(tab_id, Instant::now());
                    self.publish_tab_count();
                }
            }
            return;
        }

        match msg {
            BusMessage::Data { payload } => self.on_follower_payload(payload),
            BusMessage::TabCount { count } => {
                let _ = self.out.send(ProducerEvent::Metrics {
                    data: MetricsPatch::tab_count(count),
                });
            }
            BusMessage::TabPing { .. } => {}
        }
    }

    fn on_follower_payload(&mut self, payload: BusPayload) {
        match payload {
            BusPayload::OrderbookUpdate {
                data,
                producer_timestamp_ms,
            } => {
                // Followers never see the leader's one-time `connected`
                // transition; the first slice implies it.
                if !self.seen_status {
                    self.seen_status = true;
                    let _ = self.out.send(ProducerEvent::StatusChange {
                        status: ConnectionStatus::Connected,
                        error: None,
                    });
                }
                let _ = self.out.send(ProducerEvent::OrderbookUpdate {
                    data,
                    producer_timestamp_ms,
                });
            }
            BusPayload::StatusChange { status, error } => {
                self.seen_status = true;
                let _ = self.out.send(ProducerEvent::StatusChange { status, error });
            }
            BusPayload::Metrics { data } => {
                let _ = self.out.send(ProducerEvent::Metrics { data });
            }
        }
    }

    fn prune_followers(&mut self) {
        if !self.session.is_leader {
            return;
        }
        let ttl = self.config.follower_ttl;
        let before = self.followers.len();
        self.followers.retain(|tab_id, last_seen| {
            let alive = last_seen.elapsed() <= ttl;
            if !alive {
                debug!(%tab_id, "pruning silent follower");
            }
            alive
        });
        if self.followers.len() != before {
            self.publish_tab_count();
        }
    }

    /// Broadcast the member count (followers plus the leader itself) when
    /// it changed.
    fn publish_tab_count(&mut self) {
        let count = self.followers.len() + 1;
        if count == self.last_tab_count {
            return;
        }
        self.last_tab_count = count;
        let _ = self.bus.send(BusMessage::TabCount { count });
        let _ = self.out.send(ProducerEvent::Metrics {
            data: MetricsPatch::tab_count(count),
        });
    }

    /// Exit path: clear the cell so followers observe the vacancy
    /// immediately, and drain the coalesced slice.
    fn resign(&mut self) {
        self.flush_pending_slice();
        if self.session.is_leader {
            if let Err(e) = self.cell.clear() {
                warn!("failed to clear election cell on exit: {e}");
            }
            if let Some(producer) = self.producer.take() {
                producer.disconnect();
            }
        }
        debug!(tab_id = %self.session.tab_id, "fabric member stopped");
    }
}
