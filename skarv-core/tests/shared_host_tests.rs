//! Shared-host fabric integration tests.
//!
//! A scripted producer factory stands in for the real feed: the test
//! captures the event sender handed to the factory and injects producer
//! events directly, then observes what the host fans out to its ports.

use std::time::Duration;

use skarv_core::config::Exchange;
use skarv_core::data::{
    ConnectionStatus, ConsumerControl, MetricsPatch, OrderbookSlice, PriceLevel, ProducerEvent,
};
use skarv_core::fabric::{
    EventPublisher, ProducerFactory, SharedHost, SharedHostConfig, SharedHostHandle,
    SharedHostPort,
};
use skarv_core::producer::ProducerHost;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_slice(id: u64) -> OrderbookSlice {
    OrderbookSlice {
        bids: vec![PriceLevel {
            price: 97500.0,
            size: 1.5,
            cumulative: 1.5,
            depth_percent: 100.0,
        }],
        asks: vec![],
        last_update_id: id,
        ..Default::default()
    }
}

/// Host wired to a scripted producer. Returns the handle plus a channel
/// yielding the event sender the "producer" publishes into.
fn scripted_host(
    config: SharedHostConfig,
) -> (
    SharedHostHandle,
    mpsc::UnboundedReceiver<mpsc::UnboundedSender<ProducerEvent>>,
) {
    let (feed_tx, feed_rx) = mpsc::unbounded_channel();
    let factory: ProducerFactory = Box::new(move |events| {
        let _ = feed_tx.send(events);
        // An idle real producer host; the session never connects.
        let (sink, _keep) = {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, rx)
        };
        ProducerHost::spawn(15, Box::new(EventPublisher::new(sink)))
    });
    let handle = SharedHost::spawn_with_factory(config, factory);
    (handle, feed_rx)
}

fn config() -> SharedHostConfig {
    SharedHostConfig::new(Exchange::Spot.endpoints(), 15)
}

async fn recv_event(port: &mut SharedHostPort) -> ProducerEvent {
    timeout(Duration::from_secs(2), port.recv())
        .await
        .expect("timed out waiting for event")
        .expect("port closed")
}

/// Skip metrics frames (tab counts arrive on every membership change).
async fn recv_non_metrics(port: &mut SharedHostPort) -> ProducerEvent {
    loop {
        match recv_event(port).await {
            ProducerEvent::Metrics { .. } => continue,
            event => return event,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn slices_fan_out_to_all_visible_ports() {
    let (host, mut feeds) = scripted_host(config());

    let mut port_a = host.attach().await.unwrap();
    let mut port_b = host.attach().await.unwrap();
    port_a.send(ConsumerControl::Ping);

    // First connect starts the producer session.
    port_a.send(ConsumerControl::Connect {
        symbol: "BTCUSD".into(),
        ws_url: "wss://unused".into(),
        rest_url: "https://unused".into(),
        stream_suffix: "@depth@100ms".into(),
    });
    let feed = timeout(Duration::from_secs(2), feeds.recv())
        .await
        .unwrap()
        .unwrap();

    feed.send(ProducerEvent::OrderbookUpdate {
        data: test_slice(7),
        producer_timestamp_ms: 1.0,
    })
    .unwrap();

    for port in [&mut port_a, &mut port_b] {
        match recv_non_metrics(port).await {
            ProducerEvent::OrderbookUpdate { data, .. } => {
                assert_eq!(data.last_update_id, 7);
            }
            other => panic!("expected slice, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn hidden_ports_skip_slices_and_resume_with_fresh_one() {
    let (host, mut feeds) = scripted_host(config());

    let port_a = host.attach().await.unwrap();
    let mut port_b = host.attach().await.unwrap();
    port_a.send(ConsumerControl::Connect {
        symbol: "BTCUSD".into(),
        ws_url: "wss://unused".into(),
        rest_url: "https://unused".into(),
        stream_suffix: "@depth@100ms".into(),
    });
    let feed = timeout(Duration::from_secs(2), feeds.recv())
        .await
        .unwrap()
        .unwrap();

    port_b.send(ConsumerControl::Visibility { hidden: true });

    feed.send(ProducerEvent::OrderbookUpdate {
        data: test_slice(1),
        producer_timestamp_ms: 1.0,
    })
    .unwrap();
    feed.send(ProducerEvent::OrderbookUpdate {
        data: test_slice(2),
        producer_timestamp_ms: 2.0,
    })
    .unwrap();
    // Status frames still reach hidden ports.
    feed.send(ProducerEvent::StatusChange {
        status: ConnectionStatus::Connected,
        error: None,
    })
    .unwrap();

    match recv_non_metrics(&mut port_b).await {
        ProducerEvent::StatusChange { status, .. } => {
            assert_eq!(status, ConnectionStatus::Connected);
        }
        other => panic!("hidden port should only see status, got {other:?}"),
    }

    // On resume the port receives exactly the cached latest slice.
    port_b.send(ConsumerControl::Visibility { hidden: false });
    match recv_non_metrics(&mut port_b).await {
        ProducerEvent::OrderbookUpdate { data, .. } => {
            assert_eq!(data.last_update_id, 2);
        }
        other => panic!("expected resume slice, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn late_joiner_gets_status_and_slice_handshake() {
    let (host, mut feeds) = scripted_host(config());

    let port_a = host.attach().await.unwrap();
    let connect = ConsumerControl::Connect {
        symbol: "BTCUSD".into(),
        ws_url: "wss://unused".into(),
        rest_url: "https://unused".into(),
        stream_suffix: "@depth@100ms".into(),
    };
    port_a.send(connect.clone());
    let feed = timeout(Duration::from_secs(2), feeds.recv())
        .await
        .unwrap()
        .unwrap();

    feed.send(ProducerEvent::StatusChange {
        status: ConnectionStatus::Connected,
        error: None,
    })
    .unwrap();
    feed.send(ProducerEvent::OrderbookUpdate {
        data: test_slice(42),
        producer_timestamp_ms: 1.0,
    })
    .unwrap();

    // Give the host a moment to cache the state.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut late = host.attach().await.unwrap();
    late.send(connect);

    match recv_non_metrics(&mut late).await {
        ProducerEvent::StatusChange { status, .. } => {
            assert_eq!(status, ConnectionStatus::Connected);
        }
        other => panic!("expected handshake status, got {other:?}"),
    }
    match recv_non_metrics(&mut late).await {
        ProducerEvent::OrderbookUpdate { data, .. } => {
            assert_eq!(data.last_update_id, 42);
        }
        other => panic!("expected handshake slice, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_changes_emit_tab_counts() {
    let (host, _feeds) = scripted_host(config());

    let mut port_a = host.attach().await.unwrap();
    let _port_b = host.attach().await.unwrap();

    // port_a sees the attach of port_b as a tab-count frame.
    let mut latest_count = None;
    for _ in 0..4 {
        match timeout(Duration::from_millis(500), port_a.recv()).await {
            Ok(Some(ProducerEvent::Metrics {
                data: MetricsPatch {
                    tab_count: Some(n), ..
                },
            })) => latest_count = Some(n),
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(latest_count, Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_ports_are_pruned_and_producer_stops_when_empty() {
    let mut cfg = config();
    cfg.prune_interval = Duration::from_millis(50);
    cfg.visible_ttl = Duration::from_millis(150);
    let (host, mut feeds) = scripted_host(cfg);

    let port = host.attach().await.unwrap();
    port.send(ConsumerControl::Connect {
        symbol: "BTCUSD".into(),
        ws_url: "wss://unused".into(),
        rest_url: "https://unused".into(),
        stream_suffix: "@depth@100ms".into(),
    });
    let feed = timeout(Duration::from_secs(2), feeds.recv())
        .await
        .unwrap()
        .unwrap();

    // Stop talking; the pruner drops the port and tears the session down,
    // which closes the producer event channel on the host side.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(feed.is_closed(), "producer should be torn down");

    // The port endpoint observes the drop as a closed channel.
    let mut port = port;
    assert!(timeout(Duration::from_secs(1), port.recv())
        .await
        .expect("host should close pruned port")
        .is_none());
}
