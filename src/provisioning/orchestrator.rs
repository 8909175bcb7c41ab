//! Provisioning state machine.
//!
//! The [`Provisioner`] owns all flow state and is driven from a single
//! control loop. Session callbacks never touch that state; they only turn
//! inbound messages into [`FlowEvent`]s on a channel the loop drains, so
//! stage transitions happen in one place and in arrival order.

use super::messages::{
    CertificateCreated, CreateCertificateRequest, DeviceConfigured, RegisterThingRequest,
    Response, Topics, VerificationMessage,
};
use super::notices::{ConsoleNotices, Milestone, Notices};
use super::storage::{SecureStorage, StoredCredentials};
use super::{Completion, ProvisionError};
use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::identity::Identity;
use crate::session::{Connector, Message, Qos, Session, SessionConfig};
use crate::tls::RootCertificates;
use std::fmt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    ClaimConnected,
    AwaitingCertificate,
    AwaitingActivation,
    SwappingIdentity,
    PermanentConnected,
    Verifying,
    Complete,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
enum FlowEvent {
    /// Any inbound message, via the session's global hook.
    Response(Message),
    /// A message on one of the `/rejected` topics.
    Rejected(Message),
    /// A message on the verification topic.
    Verified(Message),
    Disconnected,
}

/// Drives one provisioning attempt. Consumed by [`Provisioner::run`].
pub struct Provisioner<C: Connector, N: Notices = ConsoleNotices> {
    settings: Settings,
    storage: SecureStorage,
    topics: Topics,
    session: Session<C>,
    notices: N,
    correlation_id: String,
    stage: watch::Sender<Stage>,
    events_tx: mpsc::UnboundedSender<FlowEvent>,
    events_rx: mpsc::UnboundedReceiver<FlowEvent>,
    credentials: Option<StoredCredentials>,
    thing_name: Option<String>,
}

impl<C: Connector, N: Notices> Provisioner<C, N> {
    pub fn new(settings: Settings, connector: C, notices: N) -> Self {
        let (stage, _) = watch::channel(Stage::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            storage: SecureStorage::new(&settings.secure_cert_path),
            topics: Topics::new(&settings.provisioning_template),
            settings,
            session: Session::new(connector),
            notices,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            stage,
            events_tx,
            events_rx,
            credentials: None,
            thing_name: None,
        }
    }

    /// Client id used for the claim connection and sent as `SerialNumber`.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn stage(&self) -> Stage {
        *self.stage.borrow()
    }

    pub fn watch_stage(&self) -> watch::Receiver<Stage> {
        self.stage.subscribe()
    }

    /// Run the flow to completion, failure or cancellation. `on_complete`
    /// is called exactly once, and only on success. The transport is closed
    /// before this returns.
    pub async fn run(
        mut self,
        cancel: CancelToken,
        on_complete: impl FnOnce(&Completion),
    ) -> Result<Completion, ProvisionError> {
        info!(
            correlation_id = %self.correlation_id,
            template = %self.settings.provisioning_template,
            "starting provisioning"
        );
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProvisionError::Cancelled),
            result = self.drive() => result,
        };
        self.session.close().await;

        match outcome {
            Ok(completion) => {
                self.advance(Stage::Complete);
                self.notices.notify(&Milestone::Provisioned {
                    thing_name: completion.thing_name.clone(),
                });
                on_complete(&completion);
                Ok(completion)
            }
            Err(err) => {
                self.advance(Stage::Failed);
                if err.is_benign() {
                    info!(error = %err, "nothing to provision");
                } else {
                    warn!(error = %err, "provisioning failed");
                }
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<Completion, ProvisionError> {
        self.storage.ensure_claim(&self.settings)?;
        let roots = RootCertificates::load(self.storage.path(&self.settings.root_cert))?;
        let claim = Identity::load(
            self.storage.root(),
            &self.settings.claim_cert,
            &self.settings.claim_key,
        )?;

        self.install_hooks();
        self.notices.notify(&Milestone::ConnectingWithClaim);
        let config = self.session_config(roots.clone(), claim);
        self.session.configure(config).await;
        self.session.connect(&self.correlation_id).await?;
        self.advance(Stage::ClaimConnected);

        self.subscribe_responses().await?;
        self.session
            .publish(
                self.topics.create_certificate(),
                &CreateCertificateRequest::default(),
                Qos::AtMostOnce,
            )
            .await?;
        self.advance(Stage::AwaitingCertificate);

        loop {
            let event = self
                .events_rx
                .recv()
                .await
                .ok_or(ProvisionError::SessionClosed)?;
            if let Some(completion) = self.handle(event, &roots).await? {
                return Ok(completion);
            }
        }
    }

    async fn handle(
        &mut self,
        event: FlowEvent,
        roots: &RootCertificates,
    ) -> Result<Option<Completion>, ProvisionError> {
        match event {
            FlowEvent::Rejected(message) => Err(self.rejected(&message)),
            FlowEvent::Disconnected => {
                warn!(stage = %self.stage(), "connection lost");
                Err(ProvisionError::SessionClosed)
            }
            FlowEvent::Response(message) => {
                self.on_response(&message, roots).await?;
                Ok(None)
            }
            FlowEvent::Verified(message) => Ok(self.on_verified(message)),
        }
    }

    async fn on_response(
        &mut self,
        message: &Message,
        roots: &RootCertificates,
    ) -> Result<(), ProvisionError> {
        let stage = self.stage();
        if !matches!(
            stage,
            Stage::AwaitingCertificate | Stage::AwaitingActivation
        ) {
            debug!(topic = %message.topic, %stage, "ignoring message outside request stages");
            return Ok(());
        }

        let response = Response::decode(&message.payload).map_err(|err| self.malformed(err))?;
        match (stage, response) {
            (_, Response::Rejected(_)) => Err(self.rejected(message)),
            (Stage::AwaitingCertificate, Response::CertificateCreated(created)) => {
                self.on_certificate(&created).await
            }
            (Stage::AwaitingActivation, Response::DeviceConfigured(configured)) => {
                self.on_registered(configured, roots).await
            }
            (Stage::AwaitingActivation, Response::CertificateCreated(created)) => {
                warn!(certificate_id = %created.certificate_id, "duplicate certificate response ignored");
                Ok(())
            }
            (_, Response::DeviceConfigured(_)) => Err(self.malformed(
                ProvisionError::MalformedResponse(
                    "registration response before a certificate was issued".into(),
                ),
            )),
            (_, Response::CertificateCreated(_)) => Ok(()),
        }
    }

    async fn on_certificate(&mut self, created: &CertificateCreated) -> Result<(), ProvisionError> {
        let prefix = created.file_prefix().map_err(|err| self.malformed(err))?;
        self.notices.notify(&Milestone::CertificateIssued {
            certificate_id: created.certificate_id.clone(),
        });
        let stored =
            self.storage
                .write_permanent(prefix, &created.certificate_pem, &created.private_key)?;
        self.credentials = Some(stored);

        let request = RegisterThingRequest::new(
            &created.certificate_ownership_token,
            &self.correlation_id,
            &self.settings.template_parameters,
        );
        self.notices.notify(&Milestone::RegisteringThing);
        self.session
            .publish(self.topics.register_thing(), &request, Qos::AtMostOnce)
            .await?;
        self.advance(Stage::AwaitingActivation);
        Ok(())
    }

    async fn on_registered(
        &mut self,
        configured: DeviceConfigured,
        roots: &RootCertificates,
    ) -> Result<(), ProvisionError> {
        let thing_name = configured.thing_name;
        self.notices.notify(&Milestone::ThingRegistered {
            thing_name: thing_name.clone(),
        });
        self.advance(Stage::SwappingIdentity);

        let stored = self.credentials.clone().ok_or_else(|| {
            ProvisionError::MalformedResponse("no permanent credentials stored".into())
        })?;
        let permanent = Identity::load(&stored.directory, &stored.certificate, &stored.private_key)?;
        self.notices.notify(&Milestone::ConnectingWithPermanent {
            thing_name: thing_name.clone(),
        });
        let config = self.session_config(roots.clone(), permanent);
        self.session.configure(config).await;
        self.session.connect(&thing_name).await?;
        self.advance(Stage::PermanentConnected);

        let topic = Topics::verification(&thing_name);
        let events = self.events_tx.clone();
        self.session
            .subscribe(&topic, Qos::AtLeastOnce, move |message| {
                let _ = events.send(FlowEvent::Verified(message.clone()));
            })
            .await?;
        tokio::time::sleep(self.settings.settle_delay()).await;

        let notice = self.verified_milestone(&stored).to_string();
        self.session
            .publish(
                &topic,
                &VerificationMessage {
                    service_response: &notice,
                },
                Qos::AtMostOnce,
            )
            .await?;
        self.thing_name = Some(thing_name);
        self.advance(Stage::Verifying);
        Ok(())
    }

    fn on_verified(&self, message: Message) -> Option<Completion> {
        if self.stage() != Stage::Verifying {
            debug!(stage = %self.stage(), "verification message outside verifying stage");
            return None;
        }
        let (Some(thing_name), Some(stored)) = (self.thing_name.clone(), self.credentials.clone())
        else {
            return None;
        };
        self.notices.notify(&self.verified_milestone(&stored));
        Some(Completion {
            payload: message.payload,
            thing_name,
            certificate: stored.certificate_path(),
            private_key: stored.private_key_path(),
        })
    }

    fn install_hooks(&self) {
        let events = self.events_tx.clone();
        let topics = self.topics.clone();
        self.session.on_message(move |message| {
            // rejected topics have their own callback
            if !topics.is_rejected(&message.topic) {
                let _ = events.send(FlowEvent::Response(message.clone()));
            }
        });
        let events = self.events_tx.clone();
        self.session.on_disconnect(move || {
            let _ = events.send(FlowEvent::Disconnected);
        });
    }

    async fn subscribe_responses(&self) -> Result<(), ProvisionError> {
        for topic in self.topics.rejected() {
            let events = self.events_tx.clone();
            self.session
                .subscribe(&topic, Qos::AtLeastOnce, move |message| {
                    let _ = events.send(FlowEvent::Rejected(message.clone()));
                })
                .await?;
        }
        for topic in self.topics.accepted() {
            self.session
                .subscribe(&topic, Qos::AtLeastOnce, |message| {
                    debug!(topic = %message.topic, bytes = message.payload.len(), "accepted response");
                })
                .await?;
        }
        Ok(())
    }

    fn session_config(&self, roots: RootCertificates, identity: Identity) -> SessionConfig {
        SessionConfig::new(&self.settings.iot_endpoint, roots, identity)
            .with_connect_timeout(self.settings.connect_timeout())
    }

    fn verified_milestone(&self, stored: &StoredCredentials) -> Milestone {
        Milestone::CredentialsVerified {
            certificate: stored.certificate.clone(),
            key: stored.private_key.clone(),
            directory: stored.directory.clone(),
        }
    }

    fn rejected(&self, message: &Message) -> ProvisionError {
        let payload = message.payload_str().into_owned();
        self.notices.notify(&Milestone::Rejected {
            topic: message.topic.clone(),
            payload: payload.clone(),
        });
        ProvisionError::Rejected {
            topic: message.topic.clone(),
            payload,
        }
    }

    fn malformed(&self, err: ProvisionError) -> ProvisionError {
        if let ProvisionError::MalformedResponse(reason) = &err {
            self.notices.notify(&Milestone::Malformed {
                reason: reason.clone(),
            });
        }
        err
    }

    fn advance(&self, stage: Stage) {
        let previous = self.stage.send_replace(stage);
        debug!(from = %previous, to = %stage, "stage transition");
    }
}
