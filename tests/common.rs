//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Generating a CA, claim and permanent certificates with rcgen
//! - Building provisioning settings over a temporary secure directory
//! - An in-memory broker that stands in for the MQTT transport

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use fleetprov::config::Settings;
use fleetprov::provisioning::{Milestone, Notices};
use fleetprov::session::{Connector, Link, Message, Qos, SessionConfig, SessionError};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ROOT_CERT: &str = "root.ca.pem";
pub const CLAIM_CERT: &str = "bootstrap-certificate.pem.crt";
pub const CLAIM_KEY: &str = "bootstrap-private.pem.key";
pub const TEMPLATE: &str = "FleetTemplate";

/// Allocate an ephemeral loopback port. Returns the address with assigned port.
pub fn ephemeral_port() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}

/// PEM certificate and PKCS#8 key of a leaf signed by the test CA.
#[derive(Debug, Clone)]
pub struct IssuedPem {
    pub certificate: String,
    pub private_key: String,
}

pub struct TestCa {
    key: KeyPair,
    cert: Certificate,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "test-ca");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).expect("self-sign CA");
        Self { key, cert }
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    pub fn issue(&self, common_name: &str) -> IssuedPem {
        let key = KeyPair::generate().expect("generate leaf key");
        let mut params =
            CertificateParams::new(vec![common_name.to_string()]).expect("leaf cert params");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign leaf cert");
        IssuedPem {
            certificate: cert.pem(),
            private_key: key.serialize_pem(),
        }
    }
}

/// Write the root CA and the claim credentials into `dir`.
pub fn write_claim_materials(dir: &Path) -> (TestCa, IssuedPem) {
    let ca = TestCa::new();
    let claim = ca.issue("claim");
    fs::write(dir.join(ROOT_CERT), ca.pem()).expect("write root");
    fs::write(dir.join(CLAIM_CERT), &claim.certificate).expect("write claim cert");
    fs::write(dir.join(CLAIM_KEY), &claim.private_key).expect("write claim key");
    (ca, claim)
}

pub fn settings(dir: &Path) -> Settings {
    let doc = format!(
        r#"
secure_cert_path = "{}"
root_cert = "{ROOT_CERT}"
claim_cert = "{CLAIM_CERT}"
claim_key = "{CLAIM_KEY}"
iot_endpoint = "broker.test"
provisioning_template = "{TEMPLATE}"
connect_timeout_ms = 2000
settle_delay_ms = 10
"#,
        dir.display()
    );
    toml::from_str(&doc).expect("settings")
}

pub fn create_topic() -> &'static str {
    "$aws/certificates/create/json"
}

pub fn register_topic() -> String {
    format!("$aws/provisioning-templates/{TEMPLATE}/provision/json")
}

// -----------------------------------------------------------------------------
// In-memory broker
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub connection: usize,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl PublishRecord {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("publish payload is JSON")
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// The connection that published the triggering message.
    Same,
    Connection(usize),
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: Target,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn to_same(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: Target::Same,
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

type Responder = Box<dyn FnMut(&PublishRecord) -> Vec<Delivery> + Send>;

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub client_id: String,
    pub endpoint: String,
    pub certificate_pem: Vec<u8>,
    pub subscriptions: Vec<(String, Qos)>,
    pub connected: bool,
    sender: Option<mpsc::Sender<Message>>,
}

#[derive(Default)]
struct BrokerState {
    connections: Vec<ConnectionRecord>,
    publishes: Vec<PublishRecord>,
    responder: Option<Responder>,
    refuse_connects: Option<String>,
    hang_connects: bool,
    dropped: usize,
}

impl BrokerState {
    fn deliver(&mut self, index: usize, topic: &str, payload: Vec<u8>) -> bool {
        let sender = self.connections.get(index).and_then(|c| c.sender.clone());
        let delivered = sender.is_some_and(|tx| tx.try_send(Message::new(topic, payload)).is_ok());
        if !delivered {
            self.dropped += 1;
        }
        delivered
    }
}

/// Records what clients do and answers publishes through a scripted responder.
/// Publishes are echoed back to the publishing connection when it subscribed
/// to the same topic.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            broker: self.clone(),
        }
    }

    pub fn respond_with(
        &self,
        responder: impl FnMut(&PublishRecord) -> Vec<Delivery> + Send + 'static,
    ) {
        self.state.lock().responder = Some(Box::new(responder));
    }

    pub fn refuse_connects(&self, reason: &str) {
        self.state.lock().refuse_connects = Some(reason.to_string());
    }

    pub fn hang_connects(&self) {
        self.state.lock().hang_connects = true;
    }

    /// Snapshot of the connections. Senders are not copied out, so holding a
    /// snapshot never keeps a channel open.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.state
            .lock()
            .connections
            .iter()
            .map(|c| ConnectionRecord {
                sender: None,
                ..c.clone()
            })
            .collect()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.state.lock().publishes.clone()
    }

    pub fn publishes_to(&self, topic: &str) -> Vec<PublishRecord> {
        self.publishes()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    /// Deliveries that found no live listener.
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    /// Push a message into connection `index` as if the broker sent it.
    pub fn inject(&self, index: usize, topic: &str, payload: &[u8]) -> bool {
        self.state.lock().deliver(index, topic, payload.to_vec())
    }

    /// Drop connection `index` from the broker side.
    pub fn sever(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(connection) = state.connections.get_mut(index) {
            connection.connected = false;
            connection.sender = None;
        }
    }
}

enum ConnectOutcome {
    Refused(String),
    Hang,
    Accepted(usize),
}

pub struct FakeConnector {
    broker: FakeBroker,
}

impl Connector for FakeConnector {
    type Link = FakeLink;

    async fn connect(
        &self,
        config: &SessionConfig,
        client_id: &str,
        inbound: mpsc::Sender<Message>,
    ) -> Result<FakeLink, SessionError> {
        let outcome = {
            let mut state = self.broker.state.lock();
            if let Some(reason) = state.refuse_connects.clone() {
                ConnectOutcome::Refused(reason)
            } else if state.hang_connects {
                ConnectOutcome::Hang
            } else {
                state.connections.push(ConnectionRecord {
                    client_id: client_id.to_string(),
                    endpoint: config.endpoint().to_string(),
                    certificate_pem: config.identity().certificate_pem().to_vec(),
                    subscriptions: Vec::new(),
                    connected: true,
                    sender: Some(inbound),
                });
                ConnectOutcome::Accepted(state.connections.len() - 1)
            }
        };
        match outcome {
            ConnectOutcome::Refused(reason) => Err(SessionError::Connection(reason)),
            ConnectOutcome::Hang => std::future::pending().await,
            ConnectOutcome::Accepted(index) => Ok(FakeLink {
                broker: self.broker.clone(),
                index,
            }),
        }
    }
}

pub struct FakeLink {
    broker: FakeBroker,
    index: usize,
}

impl Link for FakeLink {
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), SessionError> {
        let mut state = self.broker.state.lock();
        state.connections[self.index]
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), SessionError> {
        let mut state = self.broker.state.lock();
        let record = PublishRecord {
            connection: self.index,
            topic: topic.to_string(),
            payload,
            qos,
        };
        state.publishes.push(record.clone());

        let echo = state.connections[self.index]
            .subscriptions
            .iter()
            .any(|(subscribed, _)| subscribed == topic);
        if echo {
            state.deliver(self.index, topic, record.payload.clone());
        }

        let deliveries = match state.responder.as_mut() {
            Some(responder) => responder(&record),
            None => Vec::new(),
        };
        for delivery in deliveries {
            let index = match delivery.target {
                Target::Same => self.index,
                Target::Connection(index) => index,
            };
            state.deliver(index, &delivery.topic, delivery.payload);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker.state.lock().connections[self.index].connected
    }

    async fn disconnect(self) {
        let mut state = self.broker.state.lock();
        state.connections[self.index].connected = false;
    }
}

// -----------------------------------------------------------------------------
// Notices
// -----------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordedNotices {
    milestones: Arc<Mutex<Vec<Milestone>>>,
}

impl RecordedNotices {
    pub fn milestones(&self) -> Vec<Milestone> {
        self.milestones.lock().clone()
    }
}

impl Notices for RecordedNotices {
    fn notify(&self, milestone: &Milestone) {
        self.milestones.lock().push(milestone.clone());
    }
}
