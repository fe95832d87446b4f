//! Shared-host fabric: one producer, many attached consumer ports.
//!
//! A single producer host lives in a background task whose lifetime is
//! bounded by the existence of at least one attached port. Slices are
//! fanned out copy-on-send; ports flagged hidden are skipped so a
//! backgrounded consumer never accumulates a queue — it receives one
//! fresh slice on resume instead. A pruner drops ports that stopped
//! talking: 6 s for visible ports, 60 s for hidden ones.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Endpoints;
use crate::data::{
    ConnectionStatus, ConsumerControl, MetricsPatch, OrderbookSlice, ProducerEvent,
};
use crate::fabric::{EventPublisher, ProducerFactory};
use crate::producer::{ProducerHandle, ProducerHost};

/// Host timing and feed parameters.
#[derive(Debug, Clone)]
pub struct SharedHostConfig {
    pub endpoints: Endpoints,
    pub depth: u32,
    /// Pruner scan interval.
    pub prune_interval: Duration,
    /// Drop a visible port not seen for this long.
    pub visible_ttl: Duration,
    /// Drop a hidden port not seen for this long.
    pub hidden_ttl: Duration,
}

impl SharedHostConfig {
    pub fn new(endpoints: Endpoints, depth: u32) -> Self {
        Self {
            endpoints,
            depth,
            prune_interval: Duration::from_secs(3),
            visible_ttl: Duration::from_secs(6),
            hidden_ttl: Duration::from_secs(60),
        }
    }
}

enum HostCommand {
    Attach {
        reply: oneshot::Sender<SharedHostPort>,
    },
    Control {
        port: u64,
        msg: ConsumerControl,
    },
}

/// Consumer-side endpoint of a host port.
#[derive(Debug)]
pub struct SharedHostPort {
    id: u64,
    to_host: mpsc::UnboundedSender<HostCommand>,
    events: mpsc::UnboundedReceiver<ProducerEvent>,
}

impl SharedHostPort {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a control message to the host; also refreshes liveness.
    pub fn send(&self, msg: ConsumerControl) {
        let _ = self.to_host.send(HostCommand::Control {
            port: self.id,
            msg,
        });
    }

    /// Next event from the host.
    pub async fn recv(&mut self) -> Option<ProducerEvent> {
        self.events.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ProducerEvent> {
        self.events.try_recv().ok()
    }
}

struct PortState {
    tx: mpsc::UnboundedSender<ProducerEvent>,
    last_seen: Instant,
    hidden: bool,
    hidden_since: Option<Instant>,
}

/// Handle for attaching new consumers to a running host.
#[derive(Debug, Clone)]
pub struct SharedHostHandle {
    cmd: mpsc::UnboundedSender<HostCommand>,
}

impl SharedHostHandle {
    /// Open a new full-duplex port. `None` if the host task is gone.
    pub async fn attach(&self) -> Option<SharedHostPort> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd
            .send(HostCommand::Attach { reply: reply_tx })
            .ok()?;
        reply_rx.await.ok()
    }
}

/// The shared host task.
pub struct SharedHost {
    config: SharedHostConfig,
    factory: ProducerFactory,
    cmd: mpsc::UnboundedReceiver<HostCommand>,
    cmd_tx: mpsc::UnboundedSender<HostCommand>,
    ports: HashMap<u64, PortState>,
    next_port_id: u64,
    producer: Option<ProducerHandle>,
    producer_events: Option<mpsc::UnboundedReceiver<ProducerEvent>>,
    last_slice: Option<OrderbookSlice>,
    last_slice_stamp: f64,
    last_status: Option<(ConnectionStatus, Option<String>)>,
}

impl SharedHost {
    /// Spawn a host that runs a real producer against the configured
    /// endpoints.
    pub fn spawn(config: SharedHostConfig) -> SharedHostHandle {
        let endpoints = config.endpoints.clone();
        let depth = config.depth;
        Self::spawn_with_factory(
            config,
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
        config: SharedHostConfig,
        factory: ProducerFactory,
    ) -> SharedHostHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let host = SharedHost {
            config,
            factory,
            cmd: cmd_rx,
            cmd_tx: cmd_tx.clone(),
            ports: HashMap::new(),
            next_port_id: 0,
            producer: None,
            producer_events: None,
            last_slice: None,
            last_slice_stamp: 0.0,
            last_status: None,
        };
        tokio::spawn(host.run());
        SharedHostHandle { cmd: cmd_tx }
    }

    async fn run(mut self) {
        let mut pruner = tokio::time::interval(self.config.prune_interval);
        pruner.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("all host handles dropped, shutting down");
                        self.stop_producer();
                        return;
                    }
                },
                event = Self::next_producer_event(&mut self.producer_events) => {
                    self.broadcast(event);
                }
                _ = pruner.tick() => self.prune_ports(),
            }
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

    fn handle_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::Attach { reply } => self.attach_port(reply),
            HostCommand::Control { port, msg } => self.handle_port_control(port, msg),
        }
    }

    fn attach_port(&mut self, reply: oneshot::Sender<SharedHostPort>) {
        let id = self.next_port_id;
        self.next_port_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.ports.insert(
            id,
            PortState {
                tx,
                last_seen: Instant::now(),
                hidden: false,
                hidden_since: None,
            },
        );
        debug!(port = id, count = self.ports.len(), "port attached");

        let port = SharedHostPort {
            id,
            to_host: self.cmd_tx.clone(),
            events: rx,
        };
        if reply.send(port).is_err() {
            self.ports.remove(&id);
            return;
        }
        self.publish_tab_count();
    }

    fn handle_port_control(&mut self, port_id: u64, msg: ConsumerControl) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            return;
        };
        port.last_seen = Instant::now();

        match msg {
            ConsumerControl::Connect { .. } => {
                if self.producer.is_none() {
                    self.start_producer();
                } else {
                    self.send_handshake(port_id);
                }
            }
            ConsumerControl::Disconnect => {
                self.ports.remove(&port_id);
                debug!(port = port_id, "port detached");
                self.publish_tab_count();
                self.stop_producer_if_empty();
            }
            ConsumerControl::Ping => {}
            ConsumerControl::Visibility { hidden } => {
                let resumed = port.hidden && !hidden;
                port.hidden = hidden;
                port.hidden_since = hidden.then(Instant::now);
                if resumed {
                    self.send_cached_slice(port_id);
                }
            }
            ConsumerControl::SetDepth { depth } => {
                if let Some(producer) = &self.producer {
                    producer.send(ConsumerControl::SetDepth { depth });
                }
            }
        }
    }

    fn start_producer(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.producer = Some((self.factory)(tx));
        self.producer_events = Some(rx);
        info!("producer session started");
    }

    fn stop_producer(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.disconnect();
        }
        self.producer_events = None;
        self.last_slice = None;
        self.last_status = None;
    }

    fn stop_producer_if_empty(&mut self) {
        if self.ports.is_empty() && self.producer.is_some() {
            info!("no ports left, tearing down producer session");
            self.stop_producer();
        }
    }

    /// Late-joiner handshake: current status, plus a fresh slice when the
    /// session is already synchronized.
    fn send_handshake(&self, port_id: u64) {
        let Some(port) = self.ports.get(&port_id) else {
            return;
        };
        if let Some((status, error)) = &self.last_status {
            let _ = port.tx.send(ProducerEvent::StatusChange {
                status: status.clone(),
                error: error.clone(),
            });
            if *status == ConnectionStatus::Connected {
                if let Some(slice) = &self.last_slice {
                    let _ = port.tx.send(ProducerEvent::OrderbookUpdate {
                        data: slice.clone(),
                        producer_timestamp_ms: self.last_slice_stamp,
                    });
                }
            }
        }
    }

    fn send_cached_slice(&self, port_id: u64) {
        let Some(port) = self.ports.get(&port_id) else {
            return;
        };
        if let Some(slice) = &self.last_slice {
            let _ = port.tx.send(ProducerEvent::OrderbookUpdate {
                data: slice.clone(),
                producer_timestamp_ms: self.last_slice_stamp,
            });
        }
    }

    /// Fan one producer event out to the ports.
    ///
    /// Slices skip hidden ports; everything else goes everywhere.
    fn broadcast(&mut self, event: ProducerEvent) {
        match &event {
            ProducerEvent::OrderbookUpdate {
                data,
                producer_timestamp_ms,
            } => {
                self.last_slice = Some(data.clone());
                self.last_slice_stamp = *producer_timestamp_ms;
                for port in self.ports.values().filter(|p| !p.hidden) {
                    let _ = port.tx.send(event.clone());
                }
            }
            ProducerEvent::StatusChange { status, error } => {
                self.last_status = Some((status.clone(), error.clone()));
                for port in self.ports.values() {
                    let _ = port.tx.send(event.clone());
                }
            }
            _ => {
                for port in self.ports.values() {
                    let _ = port.tx.send(event.clone());
                }
            }
        }
    }

    fn prune_ports(&mut self) {
        let visible_ttl = self.config.visible_ttl;
        let hidden_ttl = self.config.hidden_ttl;
        let before = self.ports.len();

        self.ports.retain(|id, port| {
            let ttl = if port.hidden { hidden_ttl } else { visible_ttl };
            let alive = port.last_seen.elapsed() < ttl && !port.tx.is_closed();
            if !alive {
                warn!(port = id, hidden = port.hidden, "pruning dead port");
            }
            alive
        });

        if self.ports.len() != before {
            self.publish_tab_count();
            self.stop_producer_if_empty();
        }
    }

    /// Metrics frame carrying the current membership size.
    fn publish_tab_count(&self) {
        let patch = MetricsPatch::tab_count(self.ports.len());
        for port in self.ports.values() {
            let _ = port.tx.send(ProducerEvent::Metrics {
                data: patch.clone(),
            });
        }
    }
}
