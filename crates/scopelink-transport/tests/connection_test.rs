//! Connection behaviour against the in-memory broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scopelink_transport::{
    ConnectionState, LinkClient, LinkDriver, LinkEvent, LoopbackBroker, QoS, TransportConfig,
    TransportConnection, TransportError,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

fn config(client_id: &str) -> TransportConfig {
    TransportConfig::new("loopback").with_client_id(client_id)
}

async fn connect(broker: &LoopbackBroker, client_id: &str) -> TransportConnection {
    TransportConnection::connect_loopback(broker, &config(client_id))
        .await
        .unwrap()
}

/// Poll `cond` until it holds, failing the test after five seconds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_state(conn: &TransportConnection, wanted: ConnectionState) {
    let mut states = conn.state_changes();
    timeout(Duration::from_secs(60), states.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .unwrap();
}

enum Request {
    Publish(QoS),
    Subscribe,
    Disconnect,
}

/// Request side of a link that queues requests like an MQTT client does.
struct QueuedClient {
    requests: mpsc::UnboundedSender<Request>,
    publishes: Arc<AtomicUsize>,
}

impl QueuedClient {
    fn send(&self, request: Request) -> scopelink_transport::Result<()> {
        self.requests
            .send(request)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl LinkClient for QueuedClient {
    async fn publish(&self, _topic: &str, qos: QoS, _payload: Vec<u8>) -> scopelink_transport::Result<()> {
        self.send(Request::Publish(qos))?;
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> scopelink_transport::Result<()> {
        self.try_subscribe(filter, qos)
    }

    fn try_subscribe(&self, _filter: &str, _qos: QoS) -> scopelink_transport::Result<()> {
        self.send(Request::Subscribe)
    }

    async fn unsubscribe(&self, _filter: &str) -> scopelink_transport::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> scopelink_transport::Result<()> {
        self.send(Request::Disconnect)
    }
}

/// Event side with clean-session semantics: on a reset every request still
/// queued is thrown away, and the next poll reconnects.
struct QueuedDriver {
    requests: mpsc::UnboundedReceiver<Request>,
    resets: mpsc::UnboundedReceiver<()>,
    // While true, queued requests stay queued.
    hold: watch::Receiver<bool>,
    connected: bool,
    next_pkid: u16,
    pending: VecDeque<LinkEvent>,
}

async fn next_request(
    hold: &mut watch::Receiver<bool>,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) -> Option<Request> {
    while *hold.borrow_and_update() {
        if hold.changed().await.is_err() {
            break;
        }
    }
    requests.recv().await
}

#[async_trait]
impl LinkDriver for QueuedDriver {
    async fn poll(&mut self) -> scopelink_transport::Result<LinkEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        if !self.connected {
            self.connected = true;
            return Ok(LinkEvent::Connected);
        }

        tokio::select! {
            biased;
            Some(()) = self.resets.recv() => {
                while self.requests.try_recv().is_ok() {}
                self.connected = false;
                Err(TransportError::Connection("connection reset".into()))
            }
            request = next_request(&mut self.hold, &mut self.requests) => match request {
                Some(Request::Publish(qos)) if qos.is_acknowledged() => {
                    self.next_pkid += 1;
                    self.pending.push_back(LinkEvent::PublishAcked { pkid: self.next_pkid });
                    Ok(LinkEvent::PublishSent { pkid: self.next_pkid })
                }
                Some(Request::Publish(_)) => Ok(LinkEvent::PublishSent { pkid: 0 }),
                Some(Request::Subscribe) => Ok(LinkEvent::Idle),
                Some(Request::Disconnect) => Ok(LinkEvent::Closed),
                None => Err(TransportError::Closed),
            },
        }
    }
}

#[tokio::test]
async fn test_publish_after_reset_is_acknowledged() {
    let (requests_tx, requests) = mpsc::unbounded_channel();
    let (resets_tx, resets) = mpsc::unbounded_channel();
    let (hold_tx, hold) = watch::channel(true);
    let publishes = Arc::new(AtomicUsize::new(0));
    let client = QueuedClient {
        requests: requests_tx,
        publishes: publishes.clone(),
    };
    let driver = QueuedDriver {
        requests,
        resets,
        hold,
        connected: false,
        next_pkid: 0,
        pending: VecDeque::new(),
    };
    let conn = TransportConnection::open(client, driver, &config("caller"))
        .await
        .unwrap();

    // The first publish is still queued on the client when the link resets.
    let first = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.publish("microscope2/command", "{}", QoS::ExactlyOnce)
                .await
        }
    });
    wait_until(|| publishes.load(Ordering::SeqCst) == 1).await;
    resets_tx.send(()).unwrap();

    let err = timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost));
    wait_for_state(&conn, ConnectionState::Connected).await;

    hold_tx.send(false).unwrap();
    timeout(
        Duration::from_secs(5),
        conn.publish("microscope2/command", "{}", QoS::ExactlyOnce),
    )
    .await
    .expect("publish on the new session was never acknowledged")
    .unwrap();
    assert_eq!(conn.pending_acks(), 0);

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_waits_for_ack_and_delivers() {
    let broker = LoopbackBroker::new();
    let device = connect(&broker, "device").await;
    let caller = connect(&broker, "caller").await;

    let mut commands = device
        .subscribe("microscope2/command", QoS::ExactlyOnce)
        .await
        .unwrap();
    wait_until(|| broker.subscribers("microscope2/command") == 1).await;

    caller
        .publish("microscope2/command", r#"{"command":"get_pos"}"#, QoS::ExactlyOnce)
        .await
        .unwrap();
    assert_eq!(caller.pending_acks(), 0);

    let msg = timeout(Duration::from_secs(1), commands.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic, "microscope2/command");
    assert_eq!(msg.payload_str(), r#"{"command":"get_pos"}"#);
    assert_eq!(msg.qos, QoS::ExactlyOnce);
}

#[tokio::test]
async fn test_wildcard_callback_fan_out_preserves_order() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "status-watcher").await;

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    conn.on_message("devices/+/status", QoS::AtLeastOnce, move |msg| {
        sink.lock().push((msg.topic.clone(), msg.payload_str().into_owned()));
    })
    .await
    .unwrap();
    let mut everything = conn.subscribe("devices/#", QoS::AtMostOnce).await.unwrap();
    wait_until(|| broker.subscribers("devices/#") == 1).await;

    broker.publish("devices/microscope1/status", QoS::AtLeastOnce, "online");
    broker.publish("devices/microscope2/status", QoS::AtLeastOnce, "busy");
    broker.publish("devices/microscope1/status", QoS::AtLeastOnce, "offline");
    broker.publish("devices/microscope1/log", QoS::AtLeastOnce, "ignored by callback");

    wait_until(|| seen.lock().len() == 3).await;
    assert_eq!(
        *seen.lock(),
        vec![
            ("devices/microscope1/status".to_string(), "online".to_string()),
            ("devices/microscope2/status".to_string(), "busy".to_string()),
            ("devices/microscope1/status".to_string(), "offline".to_string()),
        ]
    );

    let mut topics = Vec::new();
    for _ in 0..4 {
        topics.push(everything.recv().await.unwrap().topic);
    }
    assert_eq!(topics.last().map(String::as_str), Some("devices/microscope1/log"));
}

#[tokio::test]
async fn test_invalid_filter_rejected() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "caller").await;

    let err = conn.subscribe("devices/#/status", QoS::AtLeastOnce).await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidTopicFilter { .. }));
    let err = conn.subscribe("devices/scope+/status", QoS::AtLeastOnce).await.unwrap_err();
    assert!(matches!(err, TransportError::InvalidTopicFilter { .. }));
}

#[tokio::test]
async fn test_initial_connect_failure_is_not_retried() {
    let broker = LoopbackBroker::new();
    broker.refuse_connections(1);

    let err = TransportConnection::connect_loopback(&broker, &config("caller"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connection(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_reconnects_and_resubscribes_after_link_loss() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "caller").await;
    let mut returns = conn
        .subscribe("microscope2/return", QoS::ExactlyOnce)
        .await
        .unwrap();
    wait_until(|| broker.subscribers("microscope2/return") == 1).await;

    broker.drop_links();
    wait_until(|| broker.connect_attempts() >= 2).await;
    wait_for_state(&conn, ConnectionState::Connected).await;
    wait_until(|| broker.subscribers("microscope2/return") == 1).await;

    broker.publish("microscope2/return", QoS::ExactlyOnce, r#"{"pos":{"x":1,"y":2,"z":3}}"#);
    let msg = timeout(Duration::from_secs(1), returns.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.json::<serde_json::Value>().unwrap()["pos"]["z"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_retries_at_fixed_interval() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "caller").await;

    let transitions = Arc::new(AtomicUsize::new(0));
    let mut states = conn.state_changes();
    let counter = transitions.clone();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    broker.refuse_connections(2);
    let started = tokio::time::Instant::now();
    broker.drop_links();

    wait_for_state(&conn, ConnectionState::Reconnecting).await;
    wait_for_state(&conn, ConnectionState::Connected).await;

    // Initial connect plus three recovery attempts.
    assert_eq!(broker.connect_attempts(), 4);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(transitions.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_publish_while_reconnecting_fails_fast() {
    let broker = LoopbackBroker::new();
    let conn = TransportConnection::connect_loopback(
        &broker,
        &config("caller").with_reconnect_interval(Duration::from_secs(3600)),
    )
    .await
    .unwrap();

    broker.refuse_connections(u32::MAX);
    broker.drop_links();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;

    let err = conn
        .publish("microscope2/command", "{}", QoS::ExactlyOnce)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::NotConnected(ConnectionState::Reconnecting)
    ));

    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_while_reconnecting_makes_no_new_attempt() {
    let broker = LoopbackBroker::new();
    let conn = TransportConnection::connect_loopback(
        &broker,
        &config("caller").with_reconnect_interval(Duration::from_secs(3600)),
    )
    .await
    .unwrap();

    broker.refuse_connections(u32::MAX);
    broker.drop_links();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;
    wait_until(|| broker.connect_attempts() >= 2).await;
    let attempts = broker.connect_attempts();

    conn.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.connect_attempts(), attempts);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_resubscription_queued_before_connected() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "caller").await;
    let _returns = conn
        .subscribe("microscope2/return", QoS::ExactlyOnce)
        .await
        .unwrap();
    wait_until(|| broker.subscribers("microscope2/return") == 1).await;

    broker.drop_links();
    wait_until(|| broker.connect_attempts() >= 2).await;
    wait_for_state(&conn, ConnectionState::Connected).await;

    // The subscription request precedes anything published from here on, so
    // a publish right after the transition reaches the route.
    conn.publish("microscope2/return", "{}", QoS::ExactlyOnce)
        .await
        .unwrap();
    assert_eq!(broker.subscribers("microscope2/return"), 1);
}

#[tokio::test]
async fn test_injected_publish_failure_is_surfaced() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "caller").await;

    broker.fail_publishes(1);
    let err = conn
        .publish("microscope2/command", "{}", QoS::ExactlyOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Request(_)));
    assert_eq!(conn.pending_acks(), 0);

    conn.publish("microscope2/command", "{}", QoS::ExactlyOnce)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_ends_subscriptions() {
    let broker = LoopbackBroker::new();
    let conn = connect(&broker, "caller").await;
    let mut returns = conn
        .subscribe("microscope2/return", QoS::ExactlyOnce)
        .await
        .unwrap();

    conn.disconnect().await.unwrap();
    conn.disconnect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(returns.recv().await.is_none());

    let err = conn
        .publish("microscope2/command", "{}", QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotConnected(_)));
    assert!(matches!(
        conn.subscribe("x/y", QoS::AtMostOnce).await.unwrap_err(),
        TransportError::Closed
    ));
}
