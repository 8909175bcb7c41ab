//! Secured pub/sub session.
//!
//! A [`Session`] owns at most one live transport link and routes inbound
//! messages to one global hook plus at most one callback per topic. The
//! transport itself sits behind the [`Connector`] / [`Link`] seam so the
//! routing rules can be exercised without a broker.
//!
//! Reconfiguring the session detaches the previous link before anything new
//! is built: the routing generation is bumped, the per-topic table is
//! cleared, and the old dispatcher task is stopped. A message that the old
//! link delivers afterwards is never handed to a callback.

use crate::identity::Identity;
use crate::tls::{RootCertificates, TlsError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Port used for MQTT over mutual TLS.
pub const MQTT_TLS_PORT: u16 = 8883;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the link -> dispatcher queue.
pub const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("session not configured")]
    NotConfigured,
    #[error("transport request failed: {0}")]
    Transport(String),
    #[error("serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl SessionError {
    /// Handshake and network failures, as opposed to requests on a dead link.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectTimeout(_) | Self::Tls(_)
        )
    }
}

/// Delivery guarantee for a publish or subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

/// An inbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Everything needed to open one authenticated connection. Rebuilt, never
/// mutated, when the identity changes.
#[derive(Clone)]
pub struct SessionConfig {
    endpoint: String,
    port: u16,
    roots: RootCertificates,
    identity: Identity,
    connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>, roots: RootCertificates, identity: Identity) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: MQTT_TLS_PORT,
            roots,
            identity,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the broker port. Production endpoints always use [`MQTT_TLS_PORT`].
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn roots(&self) -> &RootCertificates {
        &self.roots
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("identity", &self.identity)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Opens transport links. Inbound publishes must be forwarded to `inbound`;
/// dropping that sender signals that the link is gone.
pub trait Connector: Send + Sync {
    type Link: Link;

    fn connect(
        &self,
        config: &SessionConfig,
        client_id: &str,
        inbound: mpsc::Sender<Message>,
    ) -> impl Future<Output = Result<Self::Link, SessionError>> + Send;
}

/// One established transport connection.
pub trait Link: Send + Sync {
    fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn is_connected(&self) -> bool;

    fn disconnect(self) -> impl Future<Output = ()> + Send;
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Routes {
    generation: u64,
    global: Option<MessageHandler>,
    topics: HashMap<String, MessageHandler>,
    on_disconnect: Option<LifecycleHandler>,
}

pub struct Session<C: Connector> {
    connector: C,
    config: Option<SessionConfig>,
    link: Option<C::Link>,
    dispatcher: Option<JoinHandle<()>>,
    routes: Arc<Mutex<Routes>>,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: None,
            link: None,
            dispatcher: None,
            routes: Arc::new(Mutex::new(Routes::default())),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Install the hook invoked for every inbound message, before any topic
    /// callback. Replaces a previous hook and survives reconfiguration.
    pub fn on_message(&self, hook: impl Fn(&Message) + Send + Sync + 'static) {
        self.routes.lock().global = Some(Arc::new(hook));
    }

    /// Install the hook invoked when the live link goes away on its own.
    /// Not invoked for links torn down by [`Session::configure`] or [`Session::close`].
    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.routes.lock().on_disconnect = Some(Arc::new(hook));
    }

    /// Replace the connection settings. Any existing link is detached and
    /// closed first; topic callbacks registered against it are dropped.
    pub async fn configure(&mut self, config: SessionConfig) {
        debug!(?config, "configuring session");
        self.detach().await;
        self.config = Some(config);
    }

    /// Open the link using the current configuration.
    pub async fn connect(&mut self, client_id: &str) -> Result<(), SessionError> {
        let config = self.config.clone().ok_or(SessionError::NotConfigured)?;
        if client_id.is_empty() || client_id.starts_with(char::is_whitespace) {
            return Err(SessionError::Connection(format!(
                "invalid client id {client_id:?}"
            )));
        }
        self.detach().await;

        debug!(client_id, endpoint = config.endpoint(), port = config.port(), "connecting");
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let link = tokio::time::timeout(
            config.connect_timeout(),
            self.connector.connect(&config, client_id, tx),
        )
        .await
        .map_err(|_| SessionError::ConnectTimeout(config.connect_timeout()))??;

        let generation = self.routes.lock().generation;
        self.dispatcher = Some(tokio::spawn(dispatch(rx, self.routes.clone(), generation)));
        self.link = Some(link);
        debug!(client_id, generation, "connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_connected)
    }

    /// Register `callback` for `topic` (last registration wins) and send the
    /// subscribe request.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: Qos,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<(), SessionError> {
        let link = self.live_link()?;
        trace!(topic, qos = qos.level(), "subscribe");
        let previous = self
            .routes
            .lock()
            .topics
            .insert(topic.to_string(), Arc::new(callback));
        if let Err(err) = link.subscribe(topic, qos).await {
            let mut routes = self.routes.lock();
            match previous {
                Some(handler) => routes.topics.insert(topic.to_string(), handler),
                None => routes.topics.remove(topic),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Serialize `payload` as compact JSON and publish it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: Qos,
    ) -> Result<(), SessionError> {
        let link = self.live_link()?;
        let body = serde_json::to_vec(payload)?;
        trace!(topic, qos = qos.level(), bytes = body.len(), "publish");
        link.publish(topic, body, qos).await
    }

    /// Detach hooks from and close the current link, if any.
    pub async fn close(&mut self) {
        self.detach().await;
    }

    fn live_link(&self) -> Result<&C::Link, SessionError> {
        match &self.link {
            Some(link) if link.is_connected() => Ok(link),
            _ => Err(SessionError::NotConnected),
        }
    }

    async fn detach(&mut self) {
        {
            let mut routes = self.routes.lock();
            routes.generation += 1;
            routes.topics.clear();
        }
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(link) = self.link.take() {
            link.disconnect().await;
        }
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}

/// Deliver each inbound message to the global hook, then to the topic's
/// callback. Stops delivering as soon as the routing generation moves on.
async fn dispatch(
    mut inbound: mpsc::Receiver<Message>,
    routes: Arc<Mutex<Routes>>,
    generation: u64,
) {
    while let Some(message) = inbound.recv().await {
        let (global, topic) = {
            let routes = routes.lock();
            if routes.generation != generation {
                debug!(topic = %message.topic, "dropping message from detached link");
                return;
            }
            (
                routes.global.clone(),
                routes.topics.get(&message.topic).cloned(),
            )
        };
        trace!(topic = %message.topic, bytes = message.payload.len(), "inbound message");
        if let Some(hook) = global {
            hook(&message);
        }
        if let Some(callback) = topic {
            callback(&message);
        }
    }

    let hook = {
        let routes = routes.lock();
        if routes.generation != generation {
            return;
        }
        routes.on_disconnect.clone()
    };
    warn!("transport link closed");
    if let Some(hook) = hook {
        hook();
    }
}
