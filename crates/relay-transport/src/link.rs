//! Physical links and the connectors that open them.
//!
//! A [`Link`] is a pair of ordered text channels: whatever the client pushes
//! on `outbound` reaches the server as one text message, and every server
//! text message shows up on `inbound`. When `inbound` yields `None` the link
//! is dead. Connectors hide how the bytes actually travel.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

use crate::error::TransportError;

/// Client side of an open link.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Server side of an open link, held by whatever pumps the bytes.
#[derive(Debug)]
pub struct LinkPeer {
    /// Text the client wrote.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Text to deliver to the client. Dropping every clone closes the link.
    pub to_client: mpsc::UnboundedSender<String>,
}

impl Link {
    /// A connected client/peer channel pair.
    pub fn pair() -> (Link, LinkPeer) {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        (
            Link { outbound, inbound },
            LinkPeer {
                from_client,
                to_client,
            },
        )
    }
}

/// Opens physical links to the broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one new link. Each call must produce an independent link.
    async fn open(&self) -> Result<Link, TransportError>;
}

/// Connector for a STOMP broker behind a WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
    session_cookie: Option<String>,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_cookie: None,
        }
    }

    /// Forward an authenticated session cookie on the upgrade request.
    pub fn with_session_cookie(mut self, cookie: Option<String>) -> Self {
        self.session_cookie = cookie;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        let mut request = self.endpoint.as_str().into_client_request().map_err(|e| {
            TransportError::NotConnected(format!("invalid endpoint {}: {e}", self.endpoint))
        })?;
        if let Some(cookie) = &self.session_cookie {
            let value = HeaderValue::from_str(cookie).map_err(|e| {
                TransportError::NotConnected(format!("invalid session cookie: {e}"))
            })?;
            request.headers_mut().insert(COOKIE, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::NotConnected(format!("websocket handshake failed: {e}")))?;
        info!(endpoint = %self.endpoint, "WebSocket link opened");

        let (mut sink, mut stream) = socket.split();
        let (link, peer) = Link::pair();
        let LinkPeer {
            mut from_client,
            to_client,
        } = peer;

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!(error = %e, "Dropping non UTF-8 binary message");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        debug!(?frame, "WebSocket closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "WebSocket read failed");
                        break;
                    }
                };
                if to_client.send(text).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            reader.abort();
        });

        Ok(link)
    }
}
