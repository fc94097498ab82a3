//! The single logical connection to the broker.
//!
//! A [`Connection`] owns at most one physical link at a time. A supervisor
//! task opens the link, performs the STOMP handshake, pumps inbound frames to
//! subscriptions, keeps heart-beats flowing and, once a link that reached
//! `Connected` dies, reconnects after the configured delay until
//! [`Connection::disconnect`] is called.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use relay_core::config::TransportConfig;
use relay_core::types::ConnectionState;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::frame::{decode, Command, Frame, HEARTBEAT};
use crate::link::Connector;

const JSON: &str = "application/json";

type ConnectOutcome = Result<(), TransportError>;
type PendingConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

struct SubscriptionEntry {
    destination: String,
    deliveries: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct LinkState {
    /// Bumped whenever a supervisor is started or stopped. A supervisor only
    /// touches shared state while its generation is current.
    generation: u64,
    /// Counts links that reached `Connected`.
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    supervisor: Option<JoinHandle<()>>,
    pending: Option<PendingConnect>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    next_subscription: u64,
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<LinkState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "Connection state changed");
        }
    }

    /// The writer of the live link, only while `Connected`.
    fn writer(&self, link: &LinkState) -> Result<mpsc::UnboundedSender<String>, TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected(format!("connection is {state}")));
        }
        link.outbound
            .clone()
            .ok_or_else(|| TransportError::NotConnected("no live link".into()))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(supervisor) = link.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Handle to the broker connection. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state,
                link: Mutex::new(LinkState::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Identifies the current link. Changes every time a new link reaches
    /// `Connected`, so subscriptions taken on an earlier link can be told apart.
    pub fn link_epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Number of live subscriptions on the current link.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Establish the connection.
    ///
    /// Resolves immediately when already connected. While an attempt is in
    /// flight every caller awaits that same attempt, so concurrent calls never
    /// open a second link. A failed first attempt is not retried.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let pending = {
            let mut link = self.inner.lock();
            match self.inner.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => match &link.pending {
                    Some(pending) => pending.clone(),
                    None => self.start(&mut link),
                },
                ConnectionState::Disconnected => self.start(&mut link),
            }
        };
        pending.await
    }

    fn start(&self, link: &mut LinkState) -> PendingConnect {
        if let Some(stale) = link.supervisor.take() {
            debug!("Aborting stale connection supervisor");
            stale.abort();
        }
        link.outbound = None;
        link.subscriptions.clear();
        link.generation += 1;

        let (outcome, pending) = pending_outcome();
        link.pending = Some(pending.clone());
        self.inner.set_state(ConnectionState::Connecting);
        link.supervisor = Some(tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            link.generation,
            outcome,
        )));
        pending
    }

    /// Tear down the link and stop reconnecting.
    ///
    /// Sends a best-effort `DISCONNECT`, drops every subscription and leaves
    /// the connection `Disconnected`. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut link = self.inner.lock();
        link.generation += 1;
        if let Some(supervisor) = link.supervisor.take() {
            supervisor.abort();
        }
        if let Some(outbound) = link.outbound.take() {
            let _ = outbound.send(Frame::disconnect().encode());
        }
        link.pending = None;
        let dropped = link.subscriptions.len();
        link.subscriptions.clear();
        if self.inner.state() != ConnectionState::Disconnected {
            info!(dropped_subscriptions = dropped, "Disconnected from broker");
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Send `payload` as a JSON `SEND` frame. No acknowledgement is awaited.
    pub fn publish(&self, destination: &str, payload: &str) -> Result<(), TransportError> {
        let writer = self.inner.writer(&self.inner.lock())?;
        writer
            .send(Frame::send(destination, JSON, payload).encode())
            .map_err(|_| TransportError::PublishFailed("link writer closed".into()))?;
        debug!(destination, bytes = payload.len(), "Published");
        Ok(())
    }

    /// Subscribe to `destination`. Deliveries arrive in broker order.
    pub fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError> {
        let mut link = self.inner.lock();
        let writer = self.inner.writer(&link)?;

        link.next_subscription += 1;
        let id = format!("sub-{}", link.next_subscription);
        writer
            .send(Frame::subscribe(&id, destination).encode())
            .map_err(|_| TransportError::PublishFailed("link writer closed".into()))?;

        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        link.subscriptions.insert(
            id.clone(),
            SubscriptionEntry {
                destination: destination.to_string(),
                deliveries: deliveries_tx,
            },
        );
        debug!(subscription_id = %id, destination, "Subscribed");

        Ok(Subscription {
            epoch: link.epoch,
            deliveries,
            unsubscriber: Unsubscriber {
                inner: Arc::downgrade(&self.inner),
                id,
                destination: destination.to_string(),
                active: true,
            },
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.inner.lock();
        let destinations: Vec<&str> = link
            .subscriptions
            .values()
            .map(|entry| entry.destination.as_str())
            .collect();
        f.debug_struct("Connection")
            .field("state", &self.inner.state())
            .field("subscriptions", &destinations)
            .finish()
    }
}

/// An ordered stream of message bodies for one destination.
#[derive(Debug)]
pub struct Subscription {
    epoch: u64,
    deliveries: mpsc::UnboundedReceiver<String>,
    unsubscriber: Unsubscriber,
}

impl Subscription {
    pub fn id(&self) -> &str {
        self.unsubscriber.id()
    }

    pub fn destination(&self) -> &str {
        self.unsubscriber.destination()
    }

    /// [`Connection::link_epoch`] of the link this subscription lives on.
    pub fn link_epoch(&self) -> u64 {
        self.epoch
    }

    /// The next delivered body, or `None` once the subscription or its link
    /// has gone away.
    pub async fn next(&mut self) -> Option<String> {
        self.deliveries.recv().await
    }

    /// Split into the delivery channel and the handle that ends it.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<String>, Unsubscriber) {
        (self.deliveries, self.unsubscriber)
    }
}

/// Ends a subscription. Idempotent; also runs on drop.
pub struct Unsubscriber {
    inner: Weak<Inner>,
    id: String,
    destination: String,
    active: bool,
}

impl Unsubscriber {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn unsubscribe(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut link = inner.lock();
        // Gone already when the link was torn down underneath us.
        if link.subscriptions.remove(&self.id).is_none() {
            return;
        }
        if let Some(outbound) = &link.outbound {
            let _ = outbound.send(Frame::unsubscribe(&self.id).encode());
        }
        debug!(subscription_id = %self.id, destination = %self.destination, "Unsubscribed");
    }
}

impl Drop for Unsubscriber {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscriber")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("active", &self.active)
            .finish()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

fn pending_outcome() -> (oneshot::Sender<ConnectOutcome>, PendingConnect) {
    let (tx, rx) = oneshot::channel();
    let pending = async move {
        rx.await.unwrap_or_else(|_| {
            Err(TransportError::NotConnected(
                "connection attempt abandoned".into(),
            ))
        })
    }
    .boxed()
    .shared();
    (tx, pending)
}

/// A link that completed the STOMP handshake.
struct Session {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    /// Negotiated inbound silence limit; `None` if the broker never beats.
    liveness: Option<Duration>,
}

async fn supervise(
    inner: Weak<Inner>,
    generation: u64,
    outcome: oneshot::Sender<ConnectOutcome>,
) {
    let Some((connector, config)) = inner
        .upgrade()
        .map(|live| (Arc::clone(&live.connector), live.config.clone()))
    else {
        return;
    };
    let mut outcome = Some(outcome);
    let mut initial = true;

    loop {
        match establish(connector.as_ref(), &config).await {
            Ok(mut session) => {
                if !install(&inner, generation, &session) {
                    return;
                }
                info!(endpoint = %config.endpoint, "Connected to broker");
                if let Some(outcome) = outcome.take() {
                    let _ = outcome.send(Ok(()));
                }
                initial = false;

                let reason = run(&inner, &mut session, &config).await;
                drop(session);
                warn!(%reason, "Broker link lost");
                if !teardown(&inner, generation) {
                    return;
                }
            }
            Err(err) => {
                warn!(reason = %err, initial, "Connection attempt failed");
                if !fail_attempt(&inner, generation, initial) {
                    return;
                }
                if let Some(outcome) = outcome.take() {
                    let _ = outcome.send(Err(err));
                }
                if initial {
                    return;
                }
            }
        }

        tokio::time::sleep(config.reconnect_delay()).await;
        match begin_attempt(&inner, generation) {
            Some(next) => outcome = Some(next),
            None => return,
        }
        info!(endpoint = %config.endpoint, "Reconnecting to broker");
    }
}

async fn establish(
    connector: &dyn Connector,
    config: &TransportConfig,
) -> Result<Session, TransportError> {
    let handshake = async {
        let mut link = connector.open().await?;
        link.outbound
            .send(Frame::connect(&config.host, config.heartbeat_ms).encode())
            .map_err(|_| TransportError::NotConnected("link closed during handshake".into()))?;

        loop {
            let Some(text) = link.inbound.recv().await else {
                return Err(TransportError::NotConnected(
                    "link closed during handshake".into(),
                ));
            };
            let frames = decode(&text).map_err(|e| {
                TransportError::NotConnected(format!("malformed handshake reply: {e}"))
            })?;
            for frame in frames {
                match frame.command {
                    Command::Connected => {
                        let (server_sends, _) = frame.heartbeat();
                        return Ok(Session {
                            outbound: link.outbound,
                            inbound: link.inbound,
                            liveness: config.liveness_timeout(server_sends),
                        });
                    }
                    Command::Error => {
                        let message = frame.get("message").unwrap_or(frame.body.as_str());
                        return Err(TransportError::NotConnected(format!(
                            "broker rejected connection: {message}"
                        )));
                    }
                    other => debug!(command = %other, "Ignoring frame before CONNECTED"),
                }
            }
        }
    };

    tokio::time::timeout(config.connect_timeout(), handshake)
        .await
        .map_err(|_| {
            TransportError::NotConnected(format!(
                "handshake timed out after {}ms",
                config.connect_timeout_ms
            ))
        })?
}

fn install(inner: &Weak<Inner>, generation: u64, session: &Session) -> bool {
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    let mut link = inner.lock();
    if link.generation != generation {
        return false;
    }
    link.outbound = Some(session.outbound.clone());
    link.pending = None;
    link.epoch += 1;
    inner.set_state(ConnectionState::Connected);
    true
}

fn teardown(inner: &Weak<Inner>, generation: u64) -> bool {
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    let mut link = inner.lock();
    if link.generation != generation {
        return false;
    }
    link.outbound = None;
    link.subscriptions.clear();
    inner.set_state(ConnectionState::Disconnected);
    true
}

fn fail_attempt(inner: &Weak<Inner>, generation: u64, initial: bool) -> bool {
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    let mut link = inner.lock();
    if link.generation != generation {
        return false;
    }
    link.pending = None;
    if initial {
        link.supervisor = None;
    }
    inner.set_state(ConnectionState::Disconnected);
    true
}

fn begin_attempt(inner: &Weak<Inner>, generation: u64) -> Option<oneshot::Sender<ConnectOutcome>> {
    let inner = inner.upgrade()?;
    let mut link = inner.lock();
    if link.generation != generation {
        return None;
    }
    let (outcome, pending) = pending_outcome();
    link.pending = Some(pending);
    inner.set_state(ConnectionState::Connecting);
    Some(outcome)
}

/// Pump the live link until it dies, returning the reason.
async fn run(inner: &Weak<Inner>, session: &mut Session, config: &TransportConfig) -> String {
    let mut ticker = tokio::time::interval(config.heartbeat());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            received = session.inbound.recv() => {
                let Some(text) = received else {
                    return "link closed".to_string();
                };
                last_inbound = Instant::now();
                if let Err(reason) = dispatch(inner, &text) {
                    return reason;
                }
            }
            _ = ticker.tick() => {
                if session.outbound.send(HEARTBEAT.to_string()).is_err() {
                    return "link closed".to_string();
                }
                if let Some(limit) = session.liveness {
                    if last_inbound.elapsed() > limit {
                        return format!("no heart-beat from broker for {}ms", limit.as_millis());
                    }
                }
            }
        }
    }
}

/// Route inbound frames. An `Err` means the link must be dropped.
fn dispatch(inner: &Weak<Inner>, text: &str) -> Result<(), String> {
    let frames = match decode(text) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable inbound text");
            return Ok(());
        }
    };
    if frames.is_empty() {
        return Ok(());
    }
    let Some(inner) = inner.upgrade() else {
        return Err("connection released".to_string());
    };

    for frame in frames {
        match frame.command {
            Command::Message => {
                let Some(id) = frame.get("subscription").map(str::to_owned) else {
                    debug!("MESSAGE without subscription header");
                    continue;
                };
                let mut link = inner.lock();
                let delivered = link
                    .subscriptions
                    .get(&id)
                    .map(|entry| entry.deliveries.send(frame.body).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        debug!(subscription_id = %id, "Receiver gone, dropping subscription");
                        link.subscriptions.remove(&id);
                    }
                    None => debug!(subscription_id = %id, "MESSAGE for unknown subscription"),
                }
            }
            Command::Error => {
                let message = frame.get("message").unwrap_or(frame.body.as_str());
                return Err(format!("broker error: {message}"));
            }
            other => debug!(command = %other, "Ignoring inbound frame"),
        }
    }
    Ok(())
}
