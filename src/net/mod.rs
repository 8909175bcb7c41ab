//! Networking layer.
//!
//! This module provides the device side of the secured connection:
//! - `identity` - Certificate and private key loading
//! - `tls` - mTLS client configuration
//! - `session` - Pub/sub session, topic routing and identity swaps
//! - `mqtt` - rumqttc transport behind the session's connector seam

pub mod identity;
pub mod mqtt;
pub mod session;
pub mod tls;

pub use identity::{Identity, IdentityError, KeyEncoding};
pub use mqtt::{MqttConnector, MqttLink};
pub use session::{Connector, Link, Message, Qos, Session, SessionConfig, SessionError};
pub use tls::{client_config, RootCertificates, TlsError};
