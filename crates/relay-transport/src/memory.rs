//! In-process STOMP broker.
//!
//! Speaks the same frames a real broker would over [`Link`]s instead of
//! sockets. Used by tests to script connection failures and by the client's
//! offline mode.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use crate::error::TransportError;
use crate::frame::{decode, Command, Frame, HEARTBEAT};
use crate::link::{Connector, Link, LinkPeer};

/// A `SEND` frame the broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub destination: String,
    pub body: String,
}

/// Hook invoked for every received `SEND`, e.g. to script replies.
pub type Responder = Arc<dyn Fn(&MemoryBroker, &Published) + Send + Sync>;

struct ClientSession {
    to_client: mpsc::UnboundedSender<String>,
    /// Subscription id to destination.
    subscriptions: HashMap<String, String>,
    connected: bool,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<u64, ClientSession>,
    next_session: u64,
    next_message: u64,
    connect_attempts: usize,
    published: Vec<Published>,
    refuse: bool,
    reject: Option<String>,
    heartbeat: Option<Duration>,
    silent: bool,
    responder: Option<Responder>,
}

enum Step {
    Continue,
    Connected(Option<Duration>),
    Close,
}

/// A broker living in this process. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `body` to every subscriber of `destination`. Returns how many
    /// subscriptions received it.
    pub fn broadcast(&self, destination: &str, body: &str) -> usize {
        let mut state = self.lock();
        state.next_message += 1;
        let message_id = format!("msg-{}", state.next_message);

        let mut delivered = 0;
        for session in state.sessions.values().filter(|s| s.connected) {
            for (id, subscribed) in &session.subscriptions {
                if subscribed != destination {
                    continue;
                }
                let frame = Frame::new(Command::Message)
                    .header("destination", destination)
                    .header("subscription", id.as_str())
                    .header("message-id", message_id.as_str())
                    .header("content-type", "application/json")
                    .with_body(body);
                if session.to_client.send(frame.encode()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(destination, delivered, "Broker broadcast");
        delivered
    }

    /// Every `SEND` received so far, in order.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Bodies sent to one destination, in order.
    pub fn published_to(&self, destination: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.destination == destination)
            .map(|p| p.body.clone())
            .collect()
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.lock()
            .sessions
            .values()
            .flat_map(|s| s.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    /// Sessions that completed the handshake and are still open.
    pub fn connection_count(&self) -> usize {
        self.lock().sessions.values().filter(|s| s.connected).count()
    }

    /// Links opened or refused since the broker was created.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Fail every `open` as if nothing listened on the endpoint.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Answer `CONNECT` with an `ERROR` frame carrying `message`.
    pub fn reject_handshakes(&self, message: Option<String>) {
        self.lock().reject = message;
    }

    /// Heart-beat interval advertised and sent to new sessions.
    pub fn set_heartbeat(&self, every: Option<Duration>) {
        self.lock().heartbeat = every;
    }

    /// Stop sending heart-beats without closing anything.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Close every open link from the broker side.
    pub fn drop_connections(&self) {
        let sessions: Vec<ClientSession> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        debug!(count = sessions.len(), "Broker dropping connections");
        for session in sessions {
            if let Some(task) = session.task {
                task.abort();
            }
        }
    }

    /// Send an `ERROR` frame to every open session, leaving the links up.
    pub fn send_error(&self, message: &str) -> usize {
        let state = self.lock();
        let error = Frame::new(Command::Error)
            .header("message", message)
            .encode();
        state
            .sessions
            .values()
            .filter(|s| s.connected && s.to_client.send(error.clone()).is_ok())
            .count()
    }

    pub fn set_responder(&self, responder: Responder) {
        self.lock().responder = Some(responder);
    }

    fn send_to(&self, session: u64, text: String) -> bool {
        match self.lock().sessions.get(&session) {
            Some(s) => s.to_client.send(text).is_ok(),
            None => false,
        }
    }

    async fn serve(self, session: u64, mut from_client: mpsc::UnboundedReceiver<String>) {
        let mut heartbeat: Option<Interval> = None;
        loop {
            tokio::select! {
                received = from_client.recv() => {
                    let Some(text) = received else { break };
                    match self.handle(session, &text) {
                        Step::Continue => {}
                        Step::Connected(Some(every)) => {
                            let mut ticker = tokio::time::interval(every);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            ticker.tick().await;
                            heartbeat = Some(ticker);
                        }
                        Step::Connected(None) => {}
                        Step::Close => break,
                    }
                }
                _ = tick(&mut heartbeat) => {
                    let silent = self.lock().silent;
                    if !silent && !self.send_to(session, HEARTBEAT.to_string()) {
                        break;
                    }
                }
            }
        }
        self.lock().sessions.remove(&session);
        debug!(session, "Broker session closed");
    }

    fn handle(&self, session: u64, text: &str) -> Step {
        let frames = match decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                let error = Frame::new(Command::Error).header("message", e.to_string());
                self.send_to(session, error.encode());
                return Step::Close;
            }
        };

        let mut step = Step::Continue;
        for frame in frames {
            match frame.command {
                Command::Connect | Command::Stomp => {
                    let mut state = self.lock();
                    if let Some(message) = state.reject.clone() {
                        if let Some(s) = state.sessions.get(&session) {
                            let error = Frame::new(Command::Error).header("message", message);
                            let _ = s.to_client.send(error.encode());
                        }
                        return Step::Close;
                    }
                    let every = state.heartbeat;
                    let Some(s) = state.sessions.get_mut(&session) else {
                        return Step::Close;
                    };
                    s.connected = true;
                    let ms = every.map_or(0, |d| d.as_millis() as u64);
                    let connected = Frame::new(Command::Connected)
                        .header("version", "1.2")
                        .header("heart-beat", format!("{ms},{ms}"));
                    let _ = s.to_client.send(connected.encode());
                    step = Step::Connected(every);
                }
                Command::Subscribe => {
                    let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination"))
                    else {
                        continue;
                    };
                    if let Some(s) = self.lock().sessions.get_mut(&session) {
                        s.subscriptions.insert(id.to_string(), destination.to_string());
                    }
                }
                Command::Unsubscribe => {
                    if let (Some(id), Some(s)) =
                        (frame.get("id"), self.lock().sessions.get_mut(&session))
                    {
                        s.subscriptions.remove(id);
                    }
                }
                Command::Send => {
                    let Some(destination) = frame.get("destination") else {
                        continue;
                    };
                    let published = Published {
                        destination: destination.to_string(),
                        body: frame.body.clone(),
                    };
                    let responder = {
                        let mut state = self.lock();
                        state.published.push(published.clone());
                        state.responder.clone()
                    };
                    if let Some(responder) = responder {
                        responder(self, &published);
                    }
                }
                Command::Disconnect => {
                    if let Some(receipt) = frame.get("receipt") {
                        let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
                        self.send_to(session, reply.encode());
                    }
                    return Step::Close;
                }
                other => debug!(command = %other, "Broker ignoring frame"),
            }
        }
        step
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self) -> Result<Link, TransportError> {
        let session = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.refuse {
                return Err(TransportError::NotConnected("connection refused".into()));
            }
            state.next_session += 1;
            state.next_session
        };

        let (link, peer) = Link::pair();
        let LinkPeer {
            from_client,
            to_client,
        } = peer;
        self.lock().sessions.insert(
            session,
            ClientSession {
                to_client,
                subscriptions: HashMap::new(),
                connected: false,
                task: None,
            },
        );

        let task = tokio::spawn(self.clone().serve(session, from_client));
        match self.lock().sessions.get_mut(&session) {
            Some(s) => s.task = Some(task),
            None => task.abort(),
        }
        Ok(link)
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("sessions", &state.sessions.len())
            .field("published", &state.published.len())
            .field("refuse", &state.refuse)
            .field("heartbeat", &state.heartbeat)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_frame(link: &mut Link) -> Frame {
        loop {
            let text = link.inbound.recv().await.unwrap();
            if let Some(frame) = decode(&text).unwrap().into_iter().next() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_subscribe_and_broadcast() {
        let broker = MemoryBroker::new();
        let mut link = broker.open().await.unwrap();

        link.outbound.send(Frame::connect("localhost", 0).encode()).unwrap();
        let connected = next_frame(&mut link).await;
        assert_eq!(connected.command, Command::Connected);
        assert_eq!(connected.heartbeat(), (0, 0));

        link.outbound
            .send(Frame::subscribe("sub-1", "/topic/chat/1").encode())
            .unwrap();
        link.outbound
            .send(Frame::send("/app/chat.join", "application/json", "\"1\"").encode())
            .unwrap();
        // The SEND is processed after the SUBSCRIBE; wait for it.
        while broker.published().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.subscriber_count("/topic/chat/1"), 1);
        assert_eq!(broker.published_to("/app/chat.join"), vec!["\"1\"".to_string()]);

        assert_eq!(broker.broadcast("/topic/chat/1", "{\"x\":1}"), 1);
        let message = next_frame(&mut link).await;
        assert_eq!(message.command, Command::Message);
        assert_eq!(message.get("subscription"), Some("sub-1"));
        assert_eq!(message.body, "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_rejected_handshake_closes_link() {
        let broker = MemoryBroker::new();
        broker.reject_handshakes(Some("bad credentials".to_string()));
        let mut link = broker.open().await.unwrap();
        link.outbound.send(Frame::connect("localhost", 0).encode()).unwrap();

        let error = next_frame(&mut link).await;
        assert_eq!(error.command, Command::Error);
        assert_eq!(error.get("message"), Some("bad credentials"));
        assert!(link.inbound.recv().await.is_none());
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        assert!(broker.open().await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_closes_links() {
        let broker = MemoryBroker::new();
        let mut link = broker.open().await.unwrap();
        link.outbound.send(Frame::connect("localhost", 0).encode()).unwrap();
        next_frame(&mut link).await;
        assert_eq!(broker.connection_count(), 1);

        broker.drop_connections();
        assert!(link.inbound.recv().await.is_none());
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_sees_sends() {
        let broker = MemoryBroker::new();
        broker.set_responder(Arc::new(|broker: &MemoryBroker, published: &Published| {
            broker.broadcast("/topic/echo", &published.body);
        }));
        let mut link = broker.open().await.unwrap();
        link.outbound.send(Frame::connect("localhost", 0).encode()).unwrap();
        next_frame(&mut link).await;
        link.outbound
            .send(Frame::subscribe("sub-1", "/topic/echo").encode())
            .unwrap();
        link.outbound
            .send(Frame::send("/app/x", "application/json", "hello").encode())
            .unwrap();

        let echoed = next_frame(&mut link).await;
        assert_eq!(echoed.body, "hello");
    }
}
