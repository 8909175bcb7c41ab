//! Operator-facing milestones, separate from diagnostic logging.

use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    ConnectingWithClaim,
    CertificateIssued {
        certificate_id: String,
    },
    RegisteringThing,
    ThingRegistered {
        thing_name: String,
    },
    ConnectingWithPermanent {
        thing_name: String,
    },
    CredentialsVerified {
        certificate: String,
        key: String,
        directory: PathBuf,
    },
    Provisioned {
        thing_name: String,
    },
    Rejected {
        topic: String,
        payload: String,
    },
    Malformed {
        reason: String,
    },
}

impl Milestone {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Malformed { .. })
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectingWithClaim => {
                write!(f, "Connecting to the provisioning service with the claim certificate")
            }
            Self::CertificateIssued { certificate_id } => {
                write!(f, "Permanent certificate {certificate_id} issued")
            }
            Self::RegisteringThing => write!(f, "Registering thing with the provisioning template"),
            Self::ThingRegistered { thing_name } => write!(f, "Thing {thing_name} registered"),
            Self::ConnectingWithPermanent { thing_name } => {
                write!(f, "Reconnecting as {thing_name} with the permanent certificate")
            }
            Self::CredentialsVerified {
                certificate,
                key,
                directory,
            } => write!(
                f,
                "Successfully provisioned. Credentials {certificate} and {key} in {} are verified",
                directory.display()
            ),
            Self::Provisioned { thing_name } => write!(f, "Provisioning of {thing_name} complete"),
            Self::Rejected { topic, payload } => {
                write!(f, "Provisioning rejected on {topic}: {payload}")
            }
            Self::Malformed { reason } => write!(f, "Unexpected response: {reason}"),
        }
    }
}

pub trait Notices: Send + Sync {
    fn notify(&self, milestone: &Milestone);
}

/// Prints milestones to stdout and mirrors them into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotices;

impl Notices for ConsoleNotices {
    fn notify(&self, milestone: &Milestone) {
        if milestone.is_failure() {
            warn!(%milestone, "provisioning milestone");
            println!("!!!!! {milestone} !!!!!");
        } else {
            info!(%milestone, "provisioning milestone");
            println!("##### {milestone} #####");
        }
    }
}
