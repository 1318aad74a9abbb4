//! Command sessions.
//!
//! A [`CommandSession`] turns "publish a command, wait for its response" on a
//! device's command and return topics into call/return semantics. Responses
//! are picked up by a router task that owns the return-topic subscription and
//! hands each one to the caller it belongs to.
//!
//! Two correlation modes are supported:
//!
//! - [`Correlation::RequestId`]: every command carries a fresh `"id"` that the
//!   device echoes. Calls may be pipelined; responses can arrive in any order.
//!   A response without an id is accepted only while a single call is
//!   outstanding and only if it has the shape that call expects.
//! - [`Correlation::Ordinal`]: for devices that do not echo ids. Responses are
//!   matched by arrival order, so only one command may be outstanding. A call
//!   abandoned while pending leaves the session desynchronized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use scopelink_transport::{
    command_topic, return_topic, QoS, Subscription, TransportConfig, TransportConnection,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{Command, FocusAmount, ScanArea, Verb};
use crate::error::{Result, SessionError};
use crate::policy::{retry_publish, with_deadline, CallPolicy};
use crate::response::{decode, request_id, shape_matches, Position, Reply};
use crate::stitch::{stitch_tiles, StitchTool};

/// How responses are matched to commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// Echoed `"id"` field.
    #[default]
    RequestId,
    /// Arrival order, single command in flight.
    Ordinal,
}

/// Session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub correlation: Correlation,
    #[serde(default)]
    pub policy: CallPolicy,
    /// Program used by [`CommandSession::scan_and_stitch`]
    #[serde(default)]
    pub stitch_tool: Option<StitchTool>,
}

impl SessionOptions {
    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stitch_tool(mut self, tool: StitchTool) -> Self {
        self.stitch_tool = Some(tool);
        self
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub commands_issued: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    /// Responses that could not be matched to the command they were paired with
    pub correlation_violations: u64,
    /// Responses that arrived with nothing pending
    pub stray_responses: u64,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    violations: AtomicU64,
    strays: AtomicU64,
}

type ResponseTx = oneshot::Sender<Result<Value>>;

struct Waiter {
    ticket: u64,
    verb: Verb,
    tx: ResponseTx,
}

#[derive(Default)]
struct Waiters {
    closed: bool,
    desynchronized: bool,
    next_ticket: u64,
    by_id: HashMap<String, Waiter>,
    ordinal: Option<Waiter>,
}

/// Pending-call bookkeeping shared by the session and its router task.
struct Router {
    device: String,
    correlation: Correlation,
    waiters: Mutex<Waiters>,
    counters: Counters,
}

impl Router {
    fn register(&self, verb: Verb, tx: ResponseTx) -> Result<PendingCall<'_>> {
        let mut waiters = self.waiters.lock();
        if waiters.closed {
            return Err(SessionError::Closed);
        }

        waiters.next_ticket += 1;
        let ticket = waiters.next_ticket;
        let waiter = Waiter { ticket, verb, tx };

        let request_id = match self.correlation {
            Correlation::RequestId => {
                let id = uuid::Uuid::new_v4().to_string();
                waiters.by_id.insert(id.clone(), waiter);
                Some(id)
            }
            Correlation::Ordinal => {
                if waiters.desynchronized {
                    return Err(SessionError::Desynchronized);
                }
                if waiters.ordinal.is_some() {
                    return Err(SessionError::Busy);
                }
                waiters.ordinal = Some(waiter);
                None
            }
        };

        Ok(PendingCall {
            router: self,
            ticket,
            request_id,
            desync_on_abandon: true,
        })
    }

    fn deliver(&self, payload: &[u8]) {
        let parsed: std::result::Result<Value, _> = serde_json::from_slice(payload);
        match self.correlation {
            Correlation::RequestId => self.deliver_by_id(parsed),
            Correlation::Ordinal => self.deliver_in_order(parsed),
        }
    }

    fn deliver_by_id(&self, parsed: std::result::Result<Value, serde_json::Error>) {
        let value = match parsed {
            Ok(value) => value,
            Err(e) => {
                self.violation(format!("undecodable response: {}", e));
                return;
            }
        };

        let Some(id) = request_id(&value).map(str::to_string) else {
            self.deliver_unlabelled(value);
            return;
        };

        let waiter = self.waiters.lock().by_id.remove(&id);
        match waiter {
            Some(waiter) => {
                debug!(device = %self.device, id = %id, verb = %waiter.verb, "response matched");
                let _ = waiter.tx.send(Ok(value));
            }
            None => self.violation(format!("response for unknown request id {}", id)),
        }
    }

    /// A device that does not echo ids can still be served while exactly one
    /// call is outstanding, as long as the response has the shape that call
    /// expects. Anything else is dropped and the call keeps waiting.
    fn deliver_unlabelled(&self, value: Value) {
        let waiter = {
            let mut waiters = self.waiters.lock();
            let only = match waiters.by_id.iter().next() {
                Some((id, waiter)) if waiters.by_id.len() == 1 => {
                    Some((id.clone(), waiter.verb))
                }
                _ => None,
            };
            match only {
                Some((id, verb)) if shape_matches(verb, &value) => waiters.by_id.remove(&id),
                _ => None,
            }
        };

        match waiter {
            Some(waiter) => {
                debug!(device = %self.device, verb = %waiter.verb, "response without id matched");
                let _ = waiter.tx.send(Ok(value));
            }
            None => self.violation(format!(
                "response {} without request id cannot be paired",
                summarize(&value)
            )),
        }
    }

    fn deliver_in_order(&self, parsed: std::result::Result<Value, serde_json::Error>) {
        let waiter = self.waiters.lock().ordinal.take();
        let Some(waiter) = waiter else {
            self.counters.strays.fetch_add(1, Ordering::Relaxed);
            warn!(device = %self.device, "Stray response with no command pending, dropped");
            return;
        };

        let result = match parsed {
            Ok(value) if shape_matches(waiter.verb, &value) => Ok(value),
            Ok(value) => {
                let reason = format!(
                    "response {} does not answer a {} command",
                    summarize(&value),
                    waiter.verb
                );
                self.violation(reason.clone());
                Err(SessionError::CorrelationViolation(reason))
            }
            Err(e) => Err(SessionError::Decode {
                verb: waiter.verb,
                reason: e.to_string(),
            }),
        };
        let _ = waiter.tx.send(result);
    }

    fn violation(&self, reason: String) {
        self.counters.violations.fetch_add(1, Ordering::Relaxed);
        warn!(device = %self.device, "Correlation violation: {}", reason);
    }

    /// Close for new calls and resolve every pending one with `Cancelled`.
    fn cancel_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        let mut cancelled = 0;
        for (_, waiter) in waiters.by_id.drain() {
            let _ = waiter.tx.send(Err(SessionError::Cancelled));
            cancelled += 1;
        }
        if let Some(waiter) = waiters.ordinal.take() {
            let _ = waiter.tx.send(Err(SessionError::Cancelled));
            cancelled += 1;
        }
        cancelled
    }
}

/// Short description of a response for log lines.
fn summarize(value: &Value) -> String {
    match value.as_object() {
        Some(obj) => format!("with fields {:?}", obj.keys().collect::<Vec<_>>()),
        None => "that is not an object".to_string(),
    }
}

/// A registered call. Dropping it before the response arrived unregisters it.
struct PendingCall<'a> {
    router: &'a Router,
    ticket: u64,
    request_id: Option<String>,
    desync_on_abandon: bool,
}

impl PendingCall<'_> {
    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Unregister without desynchronizing; the command never reached the device.
    fn withdraw(mut self) {
        self.desync_on_abandon = false;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        let mut waiters = self.router.waiters.lock();
        match &self.request_id {
            Some(id) => {
                waiters.by_id.remove(id);
            }
            None => {
                let ours = waiters.ordinal.as_ref().map(|w| w.ticket) == Some(self.ticket);
                if ours {
                    waiters.ordinal = None;
                    if self.desync_on_abandon {
                        waiters.desynchronized = true;
                        warn!(
                            device = %self.router.device,
                            "Pending command abandoned, session is now desynchronized"
                        );
                    }
                }
            }
        }
    }
}

async fn route_responses(mut returns: Subscription, router: Arc<Router>) {
    while let Some(msg) = returns.recv().await {
        router.deliver(&msg.payload);
    }
    let cancelled = router.cancel_all();
    debug!(
        device = %router.device,
        "Return stream ended, {} pending call(s) cancelled",
        cancelled
    );
}

/// Call/return session with one device.
pub struct CommandSession {
    device: String,
    command_topic: String,
    return_topic: String,
    conn: TransportConnection,
    options: SessionOptions,
    router: Arc<Router>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CommandSession {
    /// Open a session on an existing connection.
    ///
    /// The session takes over the connection and disconnects it on close.
    pub async fn open(
        conn: TransportConnection,
        device: impl Into<String>,
        options: SessionOptions,
    ) -> Result<Self> {
        let device = device.into();
        let command_topic = command_topic(&device);
        let return_topic = return_topic(&device);

        let returns = conn.subscribe(&return_topic, QoS::ExactlyOnce).await?;

        let router = Arc::new(Router {
            device: device.clone(),
            correlation: options.correlation,
            waiters: Mutex::new(Waiters::default()),
            counters: Counters::default(),
        });
        let task = tokio::spawn(route_responses(returns, router.clone()));

        info!(
            "Session opened for {} ({:?} correlation)",
            device, options.correlation
        );

        Ok(Self {
            device,
            command_topic,
            return_topic,
            conn,
            options,
            router,
            router_task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to the broker and open a session for `device`.
    pub async fn connect(
        config: &TransportConfig,
        device: impl Into<String>,
        options: SessionOptions,
    ) -> Result<Self> {
        let device = device.into();
        let mut config = config.clone();
        if config.client_id.is_none() {
            config.client_id = Some(format!("microscope-demo-{}", device));
        }
        let conn = TransportConnection::connect(&config).await?;
        Self::open(conn, device, options).await
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn correlation(&self) -> Correlation {
        self.options.correlation
    }

    pub fn connection(&self) -> &TransportConnection {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.router.counters;
        SessionStats {
            commands_issued: c.issued.load(Ordering::Relaxed),
            commands_succeeded: c.succeeded.load(Ordering::Relaxed),
            commands_failed: c.failed.load(Ordering::Relaxed),
            correlation_violations: c.violations.load(Ordering::Relaxed),
            stray_responses: c.strays.load(Ordering::Relaxed),
        }
    }

    /// Send `command` and wait for its decoded response.
    ///
    /// The whole exchange runs under the policy's deadline; on expiry the
    /// command is not re-sent.
    pub async fn execute(&self, command: &Command) -> Result<Reply> {
        let counters = &self.router.counters;
        counters.issued.fetch_add(1, Ordering::Relaxed);

        let result = with_deadline(&self.options.policy, self.exchange(command)).await;

        match &result {
            Ok(_) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("{} command to {} failed: {}", command.verb(), self.device, e);
            }
        }
        result
    }

    async fn exchange(&self, command: &Command) -> Result<Reply> {
        let verb = command.verb();
        let (tx, rx) = oneshot::channel();
        let pending = self.router.register(verb, tx)?;
        let payload = command.to_wire(pending.request_id())?;

        debug!(device = %self.device, %verb, id = ?pending.request_id(), "sending command");

        let conn = &self.conn;
        let topic = self.command_topic.as_str();
        let published = retry_publish(&self.options.policy, move || {
            conn.publish(topic, payload.clone(), QoS::ExactlyOnce)
        })
        .await;
        if let Err(e) = published {
            pending.withdraw();
            return Err(e);
        }

        let value = match rx.await {
            Ok(response) => response?,
            Err(_) => return Err(SessionError::Cancelled),
        };
        drop(pending);

        decode(verb, value)
    }

    pub async fn move_to(&self, x: i64, y: i64, z: Option<i64>, relative: bool) -> Result<Value> {
        let command = Command::Move { x, y, z, relative };
        match self.execute(&command).await? {
            Reply::Ack(value) => Ok(value),
            other => Err(unexpected(Verb::Move, &other)),
        }
    }

    pub async fn focus(&self, amount: FocusAmount) -> Result<Value> {
        match self.execute(&Command::Focus { amount }).await? {
            Reply::Ack(value) => Ok(value),
            other => Err(unexpected(Verb::Focus, &other)),
        }
    }

    pub async fn get_pos(&self) -> Result<Position> {
        match self.execute(&Command::GetPos).await? {
            Reply::Position(pos) => Ok(pos),
            other => Err(unexpected(Verb::GetPos, &other)),
        }
    }

    /// Raw bytes of one captured image.
    pub async fn take_image(&self) -> Result<Vec<u8>> {
        match self.execute(&Command::TakeImage).await? {
            Reply::Image(bytes) => Ok(bytes),
            other => Err(unexpected(Verb::TakeImage, &other)),
        }
    }

    /// Raw bytes of every scan tile, in device order.
    pub async fn scan(&self, area: &ScanArea) -> Result<Vec<Vec<u8>>> {
        match self.execute(&Command::Scan(area.clone())).await? {
            Reply::Images(tiles) => Ok(tiles),
            other => Err(unexpected(Verb::Scan, &other)),
        }
    }

    /// Scan `area`, stitch the tiles and move the result to `output`.
    ///
    /// **Destructive:** `scratch` is deleted and recreated before the tiles
    /// are written into it.
    pub async fn scan_and_stitch(
        &self,
        area: &ScanArea,
        scratch: &Path,
        output: &Path,
    ) -> Result<PathBuf> {
        let tool = self.options.stitch_tool.clone().unwrap_or_default();
        let tiles = self.scan(area).await?;
        info!("Stitching {} tile(s) from {}", tiles.len(), self.device);
        stitch_tiles(&tool, &tiles, scratch, output).await
    }

    /// Release the session. Pending calls resolve with `Cancelled`.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancelled = self.router.cancel_all();
        if let Some(task) = self.router_task.lock().take() {
            task.abort();
        }

        if let Err(e) = self.conn.unsubscribe(&self.return_topic).await {
            debug!("Unsubscribe from {} failed: {}", self.return_topic, e);
        }
        self.conn.disconnect().await?;

        info!(
            "Session for {} closed ({} pending call(s) cancelled)",
            self.device, cancelled
        );
        Ok(())
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.router.cancel_all();
        if let Some(task) = self.router_task.lock().take() {
            task.abort();
        }

        // Best effort; without a runtime the connection task is already gone.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let conn = self.conn.clone();
            let topic = self.return_topic.clone();
            handle.spawn(async move {
                let _ = conn.unsubscribe(&topic).await;
                let _ = conn.disconnect().await;
            });
        }
        debug!("Session for {} released on drop", self.device);
    }
}

fn unexpected(verb: Verb, reply: &Reply) -> SessionError {
    let kind = match reply {
        Reply::Ack(_) => "acknowledgement",
        Reply::Position(_) => "position",
        Reply::Image(_) => "image",
        Reply::Images(_) => "image list",
    };
    SessionError::Decode {
        verb,
        reason: format!("unexpected {} reply", kind),
    }
}
