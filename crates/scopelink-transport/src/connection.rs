//! Resilient broker connection.
//!
//! A [`TransportConnection`] owns one link. A background task polls the link,
//! dispatches inbound messages to routes, resolves publish acknowledgements
//! and hosts the [`ReconnectSupervisor`]. Handles are cheap to clone; the task
//! stops once [`TransportConnection::disconnect`] is called or the last handle
//! is dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::link::{LinkClient, LinkDriver, LinkEvent};
use crate::message::{InboundMessage, QoS};
use crate::supervisor::{shutdown_requested, ReconnectSupervisor, Recovery};
use crate::topic::{validate_topic, TopicFilter};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Callback invoked for every message matching its route.
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Identifies a registered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

enum Sink {
    Queue(mpsc::UnboundedSender<InboundMessage>),
    Callback(MessageCallback),
}

struct Route {
    id: RouteId,
    filter: TopicFilter,
    qos: QoS,
    sink: Sink,
}

type AckWaiter = oneshot::Sender<Result<()>>;

/// Publish acknowledgement bookkeeping.
///
/// Waiters are queued in request order and bound to a packet id when the
/// driver reports the publish leaving the client. Sessions are clean, so a
/// link loss discards every request the client had not yet sent and the
/// tracker starts empty on the next session.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<(QoS, AckWaiter)>,
    in_flight: HashMap<u16, AckWaiter>,
}

impl AckTracker {
    fn sent(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some((qos, waiter)) if qos.is_acknowledged() => {
                self.in_flight.insert(pkid, waiter);
            }
            Some((_, waiter)) => {
                let _ = waiter.send(Ok(()));
            }
            None => debug!(pkid, "publish sent without a waiter"),
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.in_flight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_all(&mut self, err: TransportError) {
        for (_, waiter) in self.queued.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for (_, waiter) in self.in_flight.drain() {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}

/// State shared between the handles and the event-loop task.
struct Shared {
    client: Arc<dyn LinkClient>,
    routes: Mutex<Vec<Route>>,
    acks: Mutex<AckTracker>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                self.resubscribe();
                self.state_tx.send_replace(ConnectionState::Connected);
            }
            LinkEvent::Message(msg) => self.dispatch(msg),
            LinkEvent::PublishSent { pkid } => self.acks.lock().sent(pkid),
            LinkEvent::PublishAcked { pkid } => self.acks.lock().acked(pkid),
            LinkEvent::Closed => debug!("link closed"),
            LinkEvent::Idle => {}
        }
    }

    /// Fail every outstanding publish and stop accepting new ones.
    ///
    /// Both happen under the tracker lock so no waiter registered after the
    /// loss can be bound to a packet of the dead session.
    fn link_lost(&self) {
        let mut acks = self.acks.lock();
        self.state_tx.send_replace(ConnectionState::Reconnecting);
        acks.fail_all(TransportError::ConnectionLost);
    }

    fn dispatch(&self, msg: InboundMessage) {
        let mut callbacks = Vec::new();
        let mut delivered = 0usize;
        {
            let mut routes = self.routes.lock();
            routes.retain(|route| {
                if !route.filter.matches(&msg.topic) {
                    return true;
                }
                delivered += 1;
                match &route.sink {
                    Sink::Queue(tx) => tx.send(msg.clone()).is_ok(),
                    Sink::Callback(cb) => {
                        callbacks.push(cb.clone());
                        true
                    }
                }
            });
        }

        debug!(topic = %msg.topic, bytes = msg.payload.len(), routes = delivered, "inbound message");

        for cb in callbacks {
            cb(&msg);
        }
    }

    /// Re-establish every live route on a fresh (clean) session.
    ///
    /// Requests are queued without waiting, so they are on the link before
    /// the connection reports itself connected.
    fn resubscribe(&self) {
        let mut filters: Vec<(String, QoS)> = Vec::new();
        for route in self.routes.lock().iter() {
            match filters.iter_mut().find(|(f, _)| f == route.filter.as_str()) {
                Some((_, qos)) => *qos = (*qos).max(route.qos),
                None => filters.push((route.filter.as_str().to_string(), route.qos)),
            }
        }

        let mut backlog = Vec::new();
        for (filter, qos) in filters {
            match self.client.try_subscribe(&filter, qos) {
                Ok(()) => info!("Resubscribed to {}", filter),
                Err(e) => {
                    debug!("Request queue busy for {}: {}", filter, e);
                    backlog.push((filter, qos));
                }
            }
        }
        if backlog.is_empty() {
            return;
        }

        // The request queue is drained by this very task, so the remainder
        // is issued from a separate one.
        let client = self.client.clone();
        tokio::spawn(async move {
            for (filter, qos) in backlog {
                match client.subscribe(&filter, qos).await {
                    Ok(()) => info!("Resubscribed to {}", filter),
                    Err(e) => warn!("Failed to resubscribe to {}: {}", filter, e),
                }
            }
        });
    }
}

struct Inner {
    client_id: String,
    shared: Arc<Shared>,
    publish_order: tokio::sync::Mutex<()>,
    next_route: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Handle to one broker connection.
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TransportConnection {
    /// Connect to the configured broker over TLS.
    #[cfg(feature = "mqtt")]
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        let (client, driver) = crate::mqtt::mqtt_link(config)?;
        Self::open(client, driver, config).await
    }

    /// Connect to an in-memory broker.
    #[cfg(feature = "loopback")]
    pub async fn connect_loopback(
        broker: &crate::loopback::LoopbackBroker,
        config: &TransportConfig,
    ) -> Result<Self> {
        let (client, driver) = broker.link();
        Self::open(client, driver, config).await
    }

    /// Bring up a connection over an arbitrary link.
    ///
    /// The initial attempt is bounded by the connect timeout and is not
    /// retried. Once it succeeds, later losses are handled by the supervisor.
    pub async fn open<C, D>(client: C, mut driver: D, config: &TransportConfig) -> Result<Self>
    where
        C: LinkClient,
        D: LinkDriver,
    {
        let client_id = config.client_id_or_random();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        info!("Connecting to broker at {} as {}", config.full_broker_addr(), client_id);

        let connect_timeout = config.connect_timeout();
        match tokio::time::timeout(connect_timeout, await_connack(&mut driver)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                error!("Failed to connect to broker {}: {}", config.full_broker_addr(), e);
                return Err(match e {
                    TransportError::Connection(_) => e,
                    other => TransportError::Connection(other.to_string()),
                });
            }
            Err(_) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                error!("Timed out connecting to broker {}", config.full_broker_addr());
                return Err(TransportError::ConnectTimeout(connect_timeout));
            }
        }

        state_tx.send_replace(ConnectionState::Connected);
        info!("Connected to broker at {}", config.full_broker_addr());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client: Arc::new(client),
            routes: Mutex::new(Vec::new()),
            acks: Mutex::new(AckTracker::default()),
            state_tx: state_tx.clone(),
        });
        let restore = shared.clone();
        let supervisor =
            ReconnectSupervisor::new(config.reconnect_interval(), state_tx, shutdown_rx.clone())
                .with_restore(move || restore.resubscribe());

        let task = tokio::spawn(run_event_loop(shared.clone(), driver, supervisor, shutdown_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                client_id,
                shared,
                publish_order: tokio::sync::Mutex::new(()),
                next_route: AtomicU64::new(0),
                shutdown_tx,
                closed: AtomicBool::new(false),
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch channel carrying every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state_tx.subscribe()
    }

    /// Publish acknowledgements still outstanding.
    pub fn pending_acks(&self) -> usize {
        self.inner.shared.acks.lock().pending()
    }

    /// Publish a payload.
    ///
    /// For QoS 1 and 2 this waits for the broker's PUBACK / PUBCOMP. Never
    /// retries.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) -> Result<()> {
        validate_topic(topic)?;

        let payload = payload.into();
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.inner.publish_order.lock().await;
            {
                let mut acks = self.inner.shared.acks.lock();
                let state = self.state();
                if state != ConnectionState::Connected {
                    return Err(TransportError::NotConnected(state));
                }
                acks.queued.push_back((qos, tx));
            }
            if let Err(e) = self.inner.shared.client.publish(topic, qos, payload).await {
                self.inner.shared.acks.lock().queued.pop_back();
                return Err(e);
            }
        }
        debug!(topic, ?qos, "publish queued");

        rx.await.unwrap_or(Err(TransportError::ConnectionLost))
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T, qos: QoS) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, qos).await
    }

    /// Subscribe with a FIFO queue as the sink.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription> {
        let filter = TopicFilter::new(filter)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_route(filter.clone(), qos, Sink::Queue(tx)).await?;
        Ok(Subscription {
            id,
            filter,
            receiver: rx,
        })
    }

    /// Subscribe with a callback as the sink.
    ///
    /// The callback runs on the connection task and must not block.
    pub async fn on_message<F>(&self, filter: &str, qos: QoS, callback: F) -> Result<RouteId>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let filter = TopicFilter::new(filter)?;
        self.add_route(filter, qos, Sink::Callback(Arc::new(callback)))
            .await
    }

    async fn add_route(&self, filter: TopicFilter, qos: QoS, sink: Sink) -> Result<RouteId> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = RouteId(self.inner.next_route.fetch_add(1, Ordering::Relaxed));
        self.inner.shared.routes.lock().push(Route {
            id,
            filter: filter.clone(),
            qos,
            sink,
        });

        // While reconnecting the route is picked up by the resubscription.
        if self.is_connected() {
            if let Err(e) = self.inner.shared.client.subscribe(filter.as_str(), qos).await {
                self.remove_route(id);
                return Err(e);
            }
        }
        info!("Subscribed to {} (qos {:?})", filter, qos);
        Ok(id)
    }

    /// Remove a single route. The broker subscription is kept while other
    /// routes use the same filter.
    pub async fn remove(&self, id: RouteId) -> Result<()> {
        let Some(filter) = self.remove_route(id) else {
            return Ok(());
        };
        let still_used = self
            .inner
            .shared
            .routes
            .lock()
            .iter()
            .any(|r| r.filter == filter);
        if still_used || !self.is_connected() {
            return Ok(());
        }
        self.inner.shared.client.unsubscribe(filter.as_str()).await
    }

    fn remove_route(&self, id: RouteId) -> Option<TopicFilter> {
        let mut routes = self.inner.shared.routes.lock();
        let pos = routes.iter().position(|r| r.id == id)?;
        Some(routes.remove(pos).filter)
    }

    /// Drop every route registered with `filter` and unsubscribe from the broker.
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.inner
            .shared
            .routes
            .lock()
            .retain(|r| r.filter.as_str() != filter);
        if !self.is_connected() {
            return Ok(());
        }
        self.inner.shared.client.unsubscribe(filter).await?;
        info!("Unsubscribed from {}", filter);
        Ok(())
    }

    /// Close the connection. Safe to call more than once.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = &self.inner.shared;
        let was_connected = shared.state() == ConnectionState::Connected;
        shared.state_tx.send_replace(ConnectionState::Disconnected);

        if was_connected {
            if let Err(e) = shared.client.disconnect().await {
                debug!("Disconnect request not delivered: {}", e);
            }
        }
        let _ = self.inner.shutdown_tx.send(true);

        shared.routes.lock().clear();
        shared.acks.lock().fail_all(TransportError::Closed);

        let task = self.inner.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("Event loop did not stop in time, aborting");
                task.abort();
            }
        }

        info!("Disconnected from broker ({})", self.inner.client_id);
        Ok(())
    }
}

async fn await_connack<D: LinkDriver + ?Sized>(driver: &mut D) -> Result<()> {
    loop {
        match driver.poll().await? {
            LinkEvent::Connected => return Ok(()),
            other => debug!("ignoring {:?} before connection ack", other),
        }
    }
}

async fn run_event_loop<D: LinkDriver>(
    shared: Arc<Shared>,
    mut driver: D,
    mut supervisor: ReconnectSupervisor,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut link_up = true;
    loop {
        let polled = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => break,
            polled = driver.poll() => polled,
        };

        match polled {
            Ok(event) => shared.handle_event(event),
            Err(e) => {
                if *shutdown_rx.borrow() || shared.state() == ConnectionState::Disconnected {
                    break;
                }
                link_up = false;
                shared.link_lost();
                match supervisor.recover(&mut driver, &e).await {
                    // Routes were restored and the state announced by the supervisor.
                    Recovery::Resumed(LinkEvent::Connected) => link_up = true,
                    Recovery::Resumed(event) => {
                        link_up = true;
                        shared.handle_event(event);
                    }
                    Recovery::Shutdown => break,
                }
            }
        }
    }

    // Let an explicit disconnect reach the wire. A link that is down has
    // nothing to flush, and polling it would only start another attempt.
    if link_up {
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match driver.poll().await {
                    Ok(LinkEvent::Closed) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }

    shared.acks.lock().fail_all(TransportError::Closed);
    debug!(
        "Connection event loop stopped after {} reconnect(s)",
        supervisor.total_reconnects()
    );
}

/// Queue-backed subscription.
///
/// Ends (yields `None`) once its route is dropped, e.g. on disconnect.
#[derive(Debug)]
pub struct Subscription {
    id: RouteId,
    filter: TopicFilter,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
}

impl Subscription {
    pub fn id(&self) -> RouteId {
        self.id
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Next message in arrival order.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_tracker_binds_in_order() {
        let mut acks = AckTracker::default();
        let (tx0, mut rx0) = oneshot::channel();
        let (tx1, mut rx1) = oneshot::channel();
        acks.queued.push_back((QoS::AtMostOnce, tx0));
        acks.queued.push_back((QoS::ExactlyOnce, tx1));

        acks.sent(0);
        assert!(matches!(rx0.try_recv(), Ok(Ok(()))));

        acks.sent(4);
        assert!(rx1.try_recv().is_err());
        assert_eq!(acks.pending(), 1);

        acks.acked(4);
        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert_eq!(acks.pending(), 0);
    }

    #[test]
    fn test_ack_tracker_starts_clean_after_link_loss() {
        let mut acks = AckTracker::default();
        let (stale, mut stale_rx) = oneshot::channel();
        acks.queued.push_back((QoS::AtLeastOnce, stale));
        acks.fail_all(TransportError::ConnectionLost);
        assert!(matches!(
            stale_rx.try_recv(),
            Ok(Err(TransportError::ConnectionLost))
        ));
        assert_eq!(acks.pending(), 0);

        // The dropped request is never sent; the first send of the new
        // session belongs to the first request made on it.
        let (fresh, mut fresh_rx) = oneshot::channel();
        acks.queued.push_back((QoS::AtLeastOnce, fresh));
        acks.sent(5);
        assert!(fresh_rx.try_recv().is_err());
        acks.acked(5);
        assert!(matches!(fresh_rx.try_recv(), Ok(Ok(()))));
        assert_eq!(acks.pending(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        let err = TransportError::NotConnected(ConnectionState::Disconnected);
        assert_eq!(err.to_string(), "Not connected (state: disconnected)");
    }
}
