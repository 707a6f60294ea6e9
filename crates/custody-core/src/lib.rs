//! # Custody Core
//!
//! Asynchronous threshold custody engine: Feldman-verifiable distributed key
//! generation and threshold Schnorr signing for nodes that coordinate only
//! through an append-style bulletin board. Participants never need to be
//! online at the same time.
//!
//! The crate provides:
//! - Feldman DKG over secp256k1 ([`dkg`]): after a round, each of `n` nodes
//!   holds a share of a group key none of them can reconstruct alone.
//! - Threshold signing ([`signing`]): any `t` nodes cooperatively produce a
//!   single Schnorr-style signature under the group key; a first-writer-wins
//!   session lock keeps partials consistent when more nodes approve than
//!   finalise.
//! - A secret module adapter ([`module`]) holding every long-lived secret
//!   behind per-object extractability attributes, with deterministic
//!   monotonic-counter nonce derivation.
//! - A durable state manager ([`state`]) with locked atomic updates and a
//!   nonce-usage audit trail.
//!
//! ## Example
//!
//! ```rust,ignore
//! use custody_core::{dkg, signing, Node};
//!
//! // Phase by phase, at each node, at times of its choosing:
//! dkg::start(&node, "demo", 2, 3)?;
//! dkg::distribute(&node, "demo")?;
//! dkg::finalize(&node, "demo")?;
//!
//! let request = signing::create_request(&node, "Pay 100 BTC to Satoshi")?;
//! signing::approve(&node, &request.request_id)?;
//! signing::finalize(&node, &request.request_id)?;
//! ```

pub mod dkg;
pub mod error;
pub mod math;
pub mod messages;
pub mod module;
pub mod node;
pub mod signing;
pub mod state;
pub mod types;

pub use error::{Error, Result, ReuseLayer};
pub use node::{init, status, Node};
pub use types::{ModulePin, NodeConfig, NodeId, OperationMode, RequestId, RoundId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
