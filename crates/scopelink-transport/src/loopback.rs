//! In-memory broker.
//!
//! Links created from one [`LoopbackBroker`] see each other's publishes
//! through ordinary topic-filter routing. The broker can refuse connection
//! attempts, fail publishes and drop every link, which is what the reconnect
//! and retry paths are tested against.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::link::{LinkClient, LinkDriver, LinkEvent};
use crate::message::{InboundMessage, QoS};
use crate::topic::TopicFilter;

enum Input {
    Publish { topic: String, qos: QoS, payload: Vec<u8> },
    Subscribe { filter: TopicFilter, qos: QoS },
    Unsubscribe { filter: String },
    Disconnect,
    Deliver(InboundMessage),
    Drop,
}

struct Slot {
    online: bool,
    subscriptions: Vec<(TopicFilter, QoS)>,
    inbox: mpsc::UnboundedSender<Input>,
}

#[derive(Default)]
struct BrokerState {
    slots: HashMap<u64, Slot>,
    next_link: u64,
    refuse_connects: u32,
    fail_publishes: u32,
    connect_attempts: u64,
    published: u64,
}

impl BrokerState {
    fn route(&mut self, topic: &str, qos: QoS, payload: &[u8]) {
        self.published += 1;
        for slot in self.slots.values().filter(|s| s.online) {
            let granted = slot
                .subscriptions
                .iter()
                .filter(|(filter, _)| filter.matches(topic))
                .map(|(_, sub_qos)| *sub_qos)
                .max();

            if let Some(sub_qos) = granted {
                let msg = InboundMessage::new(topic, payload.to_vec(), qos.min(sub_qos));
                let _ = slot.inbox.send(Input::Deliver(msg));
            }
        }
    }
}

/// Shared in-memory broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the two halves of a new link to this broker.
    pub fn link(&self) -> (LoopbackClient, LoopbackDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_link;
            state.next_link += 1;
            state.slots.insert(
                id,
                Slot {
                    online: false,
                    subscriptions: Vec::new(),
                    inbox: tx.clone(),
                },
            );
            id
        };

        let client = LoopbackClient {
            inbox: tx,
            state: self.state.clone(),
        };
        let driver = LoopbackDriver {
            id,
            state: self.state.clone(),
            inbox: rx,
            connected: false,
            closed: false,
            pending: VecDeque::new(),
            next_pkid: 0,
        };
        (client, driver)
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.state.lock().refuse_connects = n;
    }

    /// Fail the next `n` publish requests.
    pub fn fail_publishes(&self, n: u32) {
        self.state.lock().fail_publishes = n;
    }

    /// Sever every online link as if the network went away.
    pub fn drop_links(&self) {
        let state = self.state.lock();
        for slot in state.slots.values().filter(|s| s.online) {
            let _ = slot.inbox.send(Input::Drop);
        }
    }

    /// Publish from outside any link.
    pub fn publish(&self, topic: &str, qos: QoS, payload: impl AsRef<[u8]>) {
        self.state.lock().route(topic, qos, payload.as_ref());
    }

    /// Number of connection attempts seen so far, refused ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Number of messages routed so far.
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Number of online links subscribed with exactly this filter.
    pub fn subscribers(&self, filter: &str) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|s| s.online && s.subscriptions.iter().any(|(f, _)| f.as_str() == filter))
            .count()
    }
}

/// Request side of a loopback link.
#[derive(Clone)]
pub struct LoopbackClient {
    inbox: mpsc::UnboundedSender<Input>,
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackClient {
    fn send(&self, input: Input) -> Result<()> {
        self.inbox.send(input).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl LinkClient for LoopbackClient {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(TransportError::Request("publish rejected by loopback broker".into()));
            }
        }
        self.send(Input::Publish {
            topic: topic.to_string(),
            qos,
            payload,
        })
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.try_subscribe(filter, qos)
    }

    fn try_subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let filter = TopicFilter::new(filter)?;
        self.send(Input::Subscribe { filter, qos })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.send(Input::Unsubscribe {
            filter: filter.to_string(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.send(Input::Disconnect)
    }
}

/// Event side of a loopback link.
pub struct LoopbackDriver {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    inbox: mpsc::UnboundedReceiver<Input>,
    connected: bool,
    closed: bool,
    pending: VecDeque<LinkEvent>,
    next_pkid: u16,
}

impl LoopbackDriver {
    fn try_connect(&mut self) -> Result<LinkEvent> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Connection(
                "connection refused by loopback broker".into(),
            ));
        }
        if let Some(slot) = state.slots.get_mut(&self.id) {
            slot.online = true;
            slot.subscriptions.clear();
        }
        self.connected = true;
        Ok(LinkEvent::Connected)
    }

    fn go_offline(&mut self) {
        self.connected = false;
        if let Some(slot) = self.state.lock().slots.get_mut(&self.id) {
            slot.online = false;
            slot.subscriptions.clear();
        }
    }

    /// Requests queued before a link loss never reach the broker; the next
    /// session starts clean.
    fn discard_queued(&mut self) {
        let mut discarded = 0usize;
        while let Ok(input) = self.inbox.try_recv() {
            match input {
                Input::Disconnect => self.closed = true,
                _ => discarded += 1,
            }
        }
        if discarded > 0 {
            debug!(link = self.id, discarded, "queued requests discarded");
        }
    }

    fn pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        self.next_pkid
    }

    fn handle(&mut self, input: Input) -> Result<()> {
        match input {
            Input::Publish { topic, qos, payload } => {
                let pkid = if qos.is_acknowledged() { self.pkid() } else { 0 };
                self.state.lock().route(&topic, qos, &payload);
                self.pending.push_back(LinkEvent::PublishSent { pkid });
                if qos.is_acknowledged() {
                    self.pending.push_back(LinkEvent::PublishAcked { pkid });
                }
            }
            Input::Subscribe { filter, qos } => {
                if let Some(slot) = self.state.lock().slots.get_mut(&self.id) {
                    slot.subscriptions.retain(|(f, _)| f != &filter);
                    slot.subscriptions.push((filter, qos));
                }
                self.pending.push_back(LinkEvent::Idle);
            }
            Input::Unsubscribe { filter } => {
                if let Some(slot) = self.state.lock().slots.get_mut(&self.id) {
                    slot.subscriptions.retain(|(f, _)| f.as_str() != filter);
                }
                self.pending.push_back(LinkEvent::Idle);
            }
            Input::Disconnect => {
                self.go_offline();
                self.closed = true;
                self.pending.push_back(LinkEvent::Closed);
            }
            Input::Deliver(msg) => self.pending.push_back(LinkEvent::Message(msg)),
            Input::Drop => {
                debug!(link = self.id, "loopback link dropped");
                self.go_offline();
                self.discard_queued();
                return Err(TransportError::Connection("link dropped".into()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LinkDriver for LoopbackDriver {
    async fn poll(&mut self) -> Result<LinkEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if self.closed {
                return Err(TransportError::Closed);
            }
            if !self.connected {
                return self.try_connect();
            }
            match self.inbox.recv().await {
                Some(input) => self.handle(input)?,
                None => return Err(TransportError::Closed),
            }
        }
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.state.lock().slots.remove(&self.id);
    }
}
