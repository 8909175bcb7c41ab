//! Fleet provisioning flow.
//!
//! - `messages` - Topics, request payloads and response decoding
//! - `storage` - Secure certificate directory
//! - `notices` - Operator-facing milestones
//! - `orchestrator` - The claim -> certificate -> thing -> swap -> verify state machine

pub mod messages;
pub mod notices;
pub mod orchestrator;
pub mod storage;

pub use messages::{Response, Topics};
pub use notices::{ConsoleNotices, Milestone, Notices};
pub use orchestrator::{Provisioner, Stage};
pub use storage::{SecureStorage, StorageError, StoredCredentials};

use crate::identity::IdentityError;
use crate::session::SessionError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("provisioning rejected on {topic}: {payload}")]
    Rejected { topic: String, payload: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("provisioning cancelled")]
    Cancelled,
    #[error("session closed before provisioning completed")]
    SessionClosed,
}

impl ProvisionError {
    /// True when the device has no claim credentials to provision with,
    /// which usually means it was provisioned on an earlier boot.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Missing { .. }))
    }
}

/// Outcome of a successful provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Body of the message received on the verification topic.
    pub payload: Vec<u8>,
    pub thing_name: String,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl Completion {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
