//! Integration tests for the transport manager's pull and push strategies.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rig_hmi::backend::mock::{Endpoint, MockBackend};
use rig_hmi::backend::Backend;
use rig_hmi::config::TransportConfig;
use rig_hmi::protocol::DeviceId;
use rig_hmi::status::{DeviceStatusAggregator, HealthState, OverallSummary};
use rig_hmi::transport::{ConnectionStatus, EventKind, InboundEvent, TransportManager, TransportStrategy};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

fn pull_manager(mock: &Arc<MockBackend>) -> TransportManager {
    TransportManager::new(
        TransportStrategy::Pull {
            backend: Arc::clone(mock) as Arc<dyn Backend>,
        },
        TransportConfig::default(),
    )
}

fn record_statuses(manager: &TransportManager) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_status_change(move |status| sink.lock().push(status));
    seen
}

#[tokio::test(start_paused = true)]
async fn test_pull_retries_are_bounded() {
    let mock = Arc::new(MockBackend::new());
    mock.set_status_failing(true);
    let manager = pull_manager(&mock);
    let seen = record_statuses(&manager);

    manager.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    // Five failed ticks, no sixth request
    assert_eq!(mock.call_count(Endpoint::DeviceStatus), 5);
    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(
        *seen.lock(),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Error,
        ]
    );

    // Only an explicit connect() starts again
    mock.set_status_failing(false);
    manager.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(mock.call_count(Endpoint::DeviceStatus), 6);
}

#[tokio::test(start_paused = true)]
async fn test_pull_publishes_status_and_data() {
    let mock = Arc::new(MockBackend::new());
    mock.set_device_data(DeviceId::Lcu, json!({"position": 12.5, "mode": 2}));
    let manager = pull_manager(&mock);
    let aggregator = DeviceStatusAggregator::attach(&manager);

    let lcu_samples = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&lcu_samples);
    manager.on(EventKind::LcuData, move |event| {
        if let InboundEvent::DeviceData(sample) = event {
            assert_eq!(sample.data["position"], 12.5);
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    manager.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(lcu_samples.load(Ordering::SeqCst), 1);
    assert_eq!(aggregator.read().overall_summary(), OverallSummary::AllOnline);
    assert!(manager.latest_device_data(DeviceId::Lcu).is_some());
    assert!(manager.latest_device_data(DeviceId::Dcu).is_none());
    // A per-device endpoint answered, so no bulk request
    assert_eq!(mock.call_count(Endpoint::AllDeviceData), 0);

    // Next tick after the poll interval
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(lcu_samples.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pull_falls_back_to_bulk_data() {
    let mock = Arc::new(MockBackend::new());
    let manager = pull_manager(&mock);
    manager.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(mock.call_count(Endpoint::DeviceData), 3);
    assert_eq!(mock.call_count(Endpoint::AllDeviceData), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_polling() {
    let mock = Arc::new(MockBackend::new());
    let manager = pull_manager(&mock);
    manager.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.disconnect();

    let polled = mock.call_count(Endpoint::DeviceStatus);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.call_count(Endpoint::DeviceStatus), polled);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let mock = Arc::new(MockBackend::new());
    let manager = pull_manager(&mock);
    manager.connect();
    let generation = manager.generation();
    manager.connect();
    assert_eq!(manager.generation(), generation);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mock.call_count(Endpoint::DeviceStatus), 1);
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_push_requests_status_and_honours_normal_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        let first = ws.next().await.expect("first frame").expect("frame");
        let request = first.into_text().expect("text");

        let status = json!({
            "type": "device_status_update",
            "data": {
                "devices": [
                    {"device": "lcu", "status": "online", "last_seen": "2024-05-01T10:00:00", "data_count": 4},
                    {"device": "dcu", "status": "online", "last_seen": "2024-05-01T10:00:00", "data_count": 2},
                    {"device": "sdu", "status": "offline", "last_seen": null, "data_count": 0}
                ],
                "timestamp": "2024-05-01T10:00:01"
            }
        });
        ws.send(Message::Text(status.to_string())).await.expect("send status");
        ws.send(Message::Text("not json".to_string())).await.expect("send junk");
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "shutdown".into(),
        }))
        .await
        .expect("close");
        while let Some(Ok(_)) = ws.next().await {}
        request
    });

    let url = Url::parse(&format!("ws://127.0.0.1:{port}/ws")).expect("url");
    let manager = TransportManager::new(TransportStrategy::Push { url }, TransportConfig::default());
    let seen = record_statuses(&manager);
    let aggregator = DeviceStatusAggregator::attach(&manager);

    manager.connect();
    wait_for(|| {
        let seen = seen.lock();
        seen.len() > 1 && seen.last() == Some(&ConnectionStatus::Disconnected)
    })
    .await;

    let request = server.await.expect("server task");
    assert!(request.contains("request_status"));
    assert!(seen.lock().contains(&ConnectionStatus::Connected));

    let agg = aggregator.read();
    assert_eq!(agg.get(DeviceId::Lcu).map(|r| r.status), Some(HealthState::Online));
    assert_eq!(
        agg.overall_summary(),
        OverallSummary::Partial { online: 2, total: 3 }
    );
}

#[tokio::test]
async fn test_push_gives_up_after_max_attempts() {
    // Reserve a port with nothing listening on it
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let config = TransportConfig {
        reconnect_interval_ms: 10,
        max_reconnect_attempts: 2,
        ..TransportConfig::default()
    };
    let url = Url::parse(&format!("ws://127.0.0.1:{port}/ws")).expect("url");
    let manager = TransportManager::new(TransportStrategy::Push { url }, config);
    let seen = record_statuses(&manager);

    manager.connect();
    wait_for(|| {
        seen.lock()
            .iter()
            .filter(|s| **s == ConnectionStatus::Error)
            .count()
            == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let connecting = seen
        .lock()
        .iter()
        .filter(|s| **s == ConnectionStatus::Connecting)
        .count();
    assert_eq!(connecting, 2);
    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert!(!manager.send(&json!({"type": "request_status"})));
}
