//! Producer host: owns the transport, sequence manager, and book engine.
//!
//! A single task drives four inputs — control messages, transport events,
//! snapshot results, and the publish cadence — so sequence-manager and
//! book state never see concurrent access. Slices leave through the
//! [`SlicePublisher`] seam at a bounded cadence while synchronized.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::book::BookEngine;
use crate::config::Endpoints;
use crate::data::{ConnectionStatus, ConsumerControl, DepthSnapshot, MetricsPatch};
use crate::error::SkarvError;
use crate::fabric::SlicePublisher;
use crate::sync::{
    DeltaOutcome, SequenceManager, SnapshotFetcher, SnapshotOutcome, SyncState,
    SNAPSHOT_RETRY_DELAY,
};
use crate::transport::{DepthStream, DepthStreamHandle, TransportEvent};

/// Publish cadence while synchronized.
pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Handle for sending control messages to a running producer host.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    control: mpsc::UnboundedSender<ConsumerControl>,
}

impl ProducerHandle {
    pub fn send(&self, msg: ConsumerControl) {
        let _ = self.control.send(msg);
    }

    /// Convenience: issue a `connect` for the given endpoint triple.
    pub fn connect(&self, endpoints: &Endpoints) {
        self.send(ConsumerControl::Connect {
            symbol: endpoints.symbol.to_string(),
            ws_url: endpoints.ws_url.to_string(),
            rest_url: endpoints.rest_url.to_string(),
            stream_suffix: endpoints.stream_suffix.to_string(),
        });
    }

    pub fn disconnect(&self) {
        self.send(ConsumerControl::Disconnect);
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ConsumerControl> {
        self.control.clone()
    }
}

/// One live feed session (between `connect` and `disconnect`/teardown).
struct ActiveSession {
    transport: DepthStreamHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    sm: SequenceManager,
    book: BookEngine,
    fetcher: SnapshotFetcher,
    fetch_task: Option<JoinHandle<()>>,
}

/// The producer host task.
pub struct ProducerHost {
    depth: u32,
    publisher: Box<dyn SlicePublisher>,
    control: mpsc::UnboundedReceiver<ConsumerControl>,
    session: Option<ActiveSession>,
    status: ConnectionStatus,
    hidden: bool,
    reconnect_count: u32,
    published_gaps: u64,
    snapshot_tx: mpsc::UnboundedSender<(u64, Result<DepthSnapshot, SkarvError>)>,
    snapshot_rx: mpsc::UnboundedReceiver<(u64, Result<DepthSnapshot, SkarvError>)>,
    /// Bumped whenever an in-flight fetch must be invalidated; results
    /// stamped with an older epoch are dropped.
    fetch_epoch: u64,
}

impl ProducerHost {
    /// Spawn the host task; returns its control handle.
    pub fn spawn(depth: u32, publisher: Box<dyn SlicePublisher>) -> ProducerHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let host = ProducerHost {
            depth,
            publisher,
            control: control_rx,
            session: None,
            status: ConnectionStatus::Disconnected,
            hidden: false,
            reconnect_count: 0,
            published_gaps: 0,
            snapshot_tx,
            snapshot_rx,
            fetch_epoch: 0,
        };
        tokio::spawn(host.run());
        ProducerHandle {
            control: control_tx,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(PUBLISH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.control.recv() => match msg {
                    Some(msg) => self.handle_control(msg),
                    None => {
                        // Every handle dropped: the host's lifetime is over.
                        self.teardown();
                        return;
                    }
                },
                event = Self::next_transport_event(&mut self.session) => {
                    self.handle_transport(event);
                }
                Some((epoch, result)) = self.snapshot_rx.recv() => {
                    self.handle_snapshot(epoch, result);
                }
                _ = tick.tick() => self.on_tick(),
            }
        }
    }

    async fn next_transport_event(session: &mut Option<ActiveSession>) -> TransportEvent {
        match session {
            Some(s) => match s.events.recv().await {
                Some(event) => event,
                // Transport task ended (terminal error already surfaced);
                // park until the session is replaced.
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    fn handle_control(&mut self, msg: ConsumerControl) {
        match msg {
            ConsumerControl::Connect {
                symbol,
                ws_url,
                rest_url,
                stream_suffix,
            } => {
                self.teardown();
                let stream_url =
                    format!("{}/{}{}", ws_url, symbol.to_lowercase(), stream_suffix);
                info!(%stream_url, "starting feed session");

                let (event_tx, event_rx) = mpsc::unbounded_channel();
                let transport = DepthStream::spawn(stream_url, event_tx);
                self.session = Some(ActiveSession {
                    transport,
                    events: event_rx,
                    sm: SequenceManager::new(),
                    book: BookEngine::new(self.depth),
                    fetcher: SnapshotFetcher::new(rest_url, symbol),
                    fetch_task: None,
                });
                self.set_status(ConnectionStatus::Connecting, None);
            }
            ConsumerControl::Disconnect => {
                info!("feed session stopped by consumer");
                self.teardown();
                self.set_status(ConnectionStatus::Disconnected, None);
            }
            ConsumerControl::Ping => {}
            ConsumerControl::Visibility { hidden } => {
                let resumed = self.hidden && !hidden;
                self.hidden = hidden;
                if resumed {
                    // One fresh slice so a resumed consumer is current
                    // without waiting out the cadence.
                    self.publish_fresh_slice();
                }
            }
            ConsumerControl::SetDepth { depth } => {
                if depth == 0 {
                    warn!("ignoring set_depth(0)");
                    return;
                }
                self.depth = depth;
                if let Some(session) = &mut self.session {
                    session.book.set_depth(depth);
                }
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                debug!("transport open, awaiting first delta");
                self.set_status(ConnectionStatus::Syncing, None);
            }
            TransportEvent::Delta(delta) => {
                let Some(session) = &mut self.session else {
                    return;
                };
                match session.sm.on_delta(delta, &mut session.book) {
                    DeltaOutcome::Buffered { request_snapshot } => {
                        if request_snapshot {
                            self.start_fetch(Duration::ZERO);
                        }
                    }
                    DeltaOutcome::Applied => {}
                    DeltaOutcome::Resync { gap } => {
                        warn!(gap, "resyncing after sequence gap");
                        self.abort_fetch();
                        self.set_status(ConnectionStatus::Syncing, None);
                        self.start_fetch(Duration::ZERO);
                    }
                }
            }
            TransportEvent::Closed => {
                debug!("transport closed");
            }
            TransportEvent::Reconnecting { attempt } => {
                self.reconnect_count += 1;
                self.abort_fetch();
                if let Some(session) = &mut self.session {
                    session.sm.reset();
                }
                self.set_status(ConnectionStatus::Reconnecting, None);
                let patch = MetricsPatch {
                    reconnect_count: Some(self.reconnect_count),
                    ..Default::default()
                };
                self.publisher.publish_metrics(patch);
                debug!(attempt, "transport reconnecting");
            }
            TransportEvent::Error(msg) => {
                self.abort_fetch();
                self.set_status(ConnectionStatus::Error(msg.clone()), Some(msg));
            }
        }
    }

    fn handle_snapshot(&mut self, epoch: u64, result: Result<DepthSnapshot, SkarvError>) {
        if epoch != self.fetch_epoch {
            debug!("dropping stale snapshot result");
            return;
        }
        let Some(session) = &mut self.session else {
            return;
        };
        session.fetch_task = None;

        match result {
            Ok(snapshot) => match session.sm.on_snapshot(&snapshot, &mut session.book) {
                SnapshotOutcome::Applied { replayed } => {
                    debug!(replayed, "synchronized");
                    self.set_status(ConnectionStatus::Connected, None);
                }
                SnapshotOutcome::TooOld { refetch: true } => {
                    self.start_fetch(Duration::ZERO);
                }
                SnapshotOutcome::TooOld { refetch: false } => {
                    warn!("snapshot attempts exhausted, staying in syncing");
                }
                SnapshotOutcome::Ignored => {}
            },
            Err(e) => {
                warn!("snapshot fetch failed: {e}");
                if session.sm.on_fetch_failed() {
                    self.start_fetch(SNAPSHOT_RETRY_DELAY);
                }
            }
        }
    }

    /// Launch a snapshot fetch after `delay`. The task is stamped with the
    /// current epoch so results from before a reset are dropped.
    fn start_fetch(&mut self, delay: Duration) {
        let Some(session) = &mut self.session else {
            return;
        };
        let fetcher = session.fetcher.clone();
        let tx = self.snapshot_tx.clone();
        let epoch = self.fetch_epoch;
        session.fetch_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = fetcher.fetch().await;
            let _ = tx.send((epoch, result));
        }));
    }

    /// Abort any in-flight fetch; it is not retried.
    fn abort_fetch(&mut self) {
        self.fetch_epoch += 1;
        if let Some(session) = &mut self.session {
            if let Some(task) = session.fetch_task.take() {
                task.abort();
            }
        }
    }

    fn on_tick(&mut self) {
        // Metrics: surface the gap counter when it moved.
        if let Some(session) = &self.session {
            let gaps = session.sm.sequence_gaps();
            if gaps != self.published_gaps {
                self.published_gaps = gaps;
                let patch = MetricsPatch {
                    sequence_gaps: Some(gaps),
                    ..Default::default()
                };
                self.publisher.publish_metrics(patch);
            }
        }

        let Some(session) = &mut self.session else {
            return;
        };
        if session.sm.state() != SyncState::Synchronized {
            return;
        }
        if session.book.take_dirty() {
            session.book.warn_if_crossed();
            let slice = session.book.slice();
            self.publisher.publish_slice(slice);
        }
    }

    /// Publish a slice immediately, regardless of the dirty flag.
    fn publish_fresh_slice(&mut self) {
        if let Some(session) = &mut self.session {
            if session.sm.state() == SyncState::Synchronized {
                let slice = session.book.slice();
                session.book.take_dirty();
                self.publisher.publish_slice(slice);
            }
        }
    }

    fn set_status(&mut self, status: ConnectionStatus, error: Option<String>) {
        if self.status == status {
            return;
        }
        self.status = status.clone();
        self.publisher.publish_status(status, error);
    }

    /// Tear the session down: abort the fetch, stop the transport, drop
    /// sequence and book state. No publish can happen afterwards because
    /// the cadence path requires a live session.
    fn teardown(&mut self) {
        self.abort_fetch();
        if let Some(session) = self.session.take() {
            session.transport.disconnect();
        }
    }
}
