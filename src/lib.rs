#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: durations come from config in milliseconds
#![allow(clippy::cast_possible_truncation)]
// Control flow style
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Error handling style
#![allow(clippy::result_large_err)]
#![allow(clippy::large_enum_variant)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]

//! fleetprov - device identity bootstrap over MQTT fleet provisioning.
//!
//! A device ships with a shared, low-privilege claim certificate. This crate
//! uses it to ask the fleet provisioning service for a uniquely issued
//! permanent certificate, registers the device as a thing, then swaps its live
//! MQTT connection over to the new identity and proves it works.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Settings parsing and validation
//! - `core::cancel` - Cancellation of an in-flight provisioning attempt
//!
//! ## Networking
//! - `net::identity` - Client identity loading (certificate + private key)
//! - `net::tls` - rustls client configuration for mutual TLS
//! - `net::session` - Secured pub/sub session with topic routing
//! - `net::mqtt` - rumqttc-backed transport
//!
//! ## Provisioning
//! - `provisioning::orchestrator` - Claim -> certificate -> thing -> swap -> verify
//! - `provisioning::messages` - Wire payloads and response decoding
//! - `provisioning::storage` - Secure certificate directory
//! - `provisioning::notices` - Human-readable milestones
//!
//! ## Operations
//! - `ops::telemetry` - Tracing subscriber setup

// Core infrastructure
pub mod core;

// Networking
pub mod net;

// Provisioning flow
pub mod provisioning;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{cancel, config};
pub use net::{identity, mqtt, session, tls};
pub use provisioning::{Completion, ProvisionError, Provisioner};
