//! MQTT over mutual TLS, backed by rumqttc.

use crate::session::{Connector, Link, Message, Qos, SessionConfig, SessionError, INBOUND_CAPACITY};
use crate::tls::client_config;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, TlsConfiguration, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_PACKET_SIZE: usize = 256 * 1024;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

impl Qos {
    pub fn to_rumqttc(self) -> QoS {
        match self {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Opens one rumqttc client per connect, authenticated with the configured identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    type Link = MqttLink;

    async fn connect(
        &self,
        config: &SessionConfig,
        client_id: &str,
        inbound: mpsc::Sender<Message>,
    ) -> Result<MqttLink, SessionError> {
        let tls = client_config(config.roots(), config.identity())?;

        let mut options = MqttOptions::new(client_id, config.endpoint(), config.port());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(tls),
        )));

        let (client, mut eventloop) = AsyncClient::new(options, INBOUND_CAPACITY);
        await_connack(&mut eventloop).await?;
        info!(
            client_id,
            endpoint = config.endpoint(),
            port = config.port(),
            "mqtt connected"
        );

        let connected = Arc::new(AtomicBool::new(true));
        let driver = tokio::spawn(drive(eventloop, inbound, connected.clone()));
        Ok(MqttLink {
            client,
            driver,
            connected,
        })
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), SessionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(SessionError::Connection(format!(
                        "connection rejected: {:?}",
                        ack.code
                    )));
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(SessionError::Connection(format!(
                    "connection refused: {code:?}"
                )));
            }
            Err(err) => return Err(SessionError::Connection(err.to_string())),
        }
    }
}

/// Poll the event loop, forwarding publishes until the connection ends or
/// the session stops listening.
async fn drive(mut eventloop: EventLoop, inbound: mpsc::Sender<Message>, connected: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = Message::new(publish.topic, publish.payload.to_vec());
                if inbound.send(message).await.is_err() {
                    debug!("session no longer listening; stopping mqtt driver");
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                debug!(pkid = ack.pkid, codes = ?ack.return_codes, "subscription acknowledged");
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("broker sent disconnect");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt connection lost");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

pub struct MqttLink {
    client: AsyncClient,
    driver: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

impl Link for MqttLink {
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), SessionError> {
        self.client
            .subscribe(topic, qos.to_rumqttc())
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), SessionError> {
        self.client
            .publish(topic, qos.to_rumqttc(), false, payload)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.driver.is_finished()
    }

    async fn disconnect(mut self) {
        if self.is_connected() {
            if let Err(err) = self.client.disconnect().await {
                debug!(error = %err, "disconnect request not queued");
            }
            if tokio::time::timeout(DISCONNECT_GRACE, &mut self.driver)
                .await
                .is_err()
            {
                debug!("mqtt driver did not stop within grace period");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
