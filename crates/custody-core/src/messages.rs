//! Board message types
//!
//! One struct per blob the protocol puts on the bulletin board, with the
//! exact field sets of the wire format. Unknown fields are rejected on
//! ingress.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Error, Result};

/// Posted to `identity/{node_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityRecord {
    pub node_id: String,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Posted to `dkg/{round_id}/commitments/{node_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DkgCommitments {
    pub node_id: String,
    pub round_id: String,
    /// Compressed points, one per polynomial coefficient.
    pub commitments: Vec<String>,
    pub threshold: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

/// Posted to `dkg/{round_id}/complaints/{accuser}_vs_{accused}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DkgComplaint {
    pub accuser: String,
    pub accused: String,
    pub round_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Posted to `signing/{request_id}/request.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningRequest {
    pub request_id: String,
    pub message: String,
    pub message_digest_hex: String,
    pub requester: String,
    pub threshold: usize,
    pub created_at: DateTime<Utc>,
}

/// Posted once per request to `signing/{request_id}/session.json` by the
/// first finaliser; pins which `t` commitments define the aggregate nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionLock {
    pub participants: Vec<String>,
    pub locked_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Posted to `signing/{request_id}/commitments/{node_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NonceCommitment {
    pub node_id: String,
    #[serde(rename = "R_hex")]
    pub r_hex: String,
    pub message_digest_hex: String,
    pub counter: u64,
    pub timestamp: DateTime<Utc>,
}

/// Posted to `signing/{request_id}/partials/{node_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialSignature {
    pub node_id: String,
    pub partial: String,
    pub timestamp: DateTime<Utc>,
}

/// Posted to `signing/{request_id}/result.json`. First write wins; the
/// request is terminal once this exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningResult {
    #[serde(rename = "R")]
    pub r: String,
    pub s: String,
    pub participants: Vec<String>,
    pub message_digest_hex: String,
}

/// Encode a message for the board.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode and validate a board blob, naming the path in the error.
pub fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::MalformedMessage {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Board path conventions (wire-exact).
pub mod paths {
    pub fn identity(node_id: &str) -> String {
        format!("identity/{node_id}")
    }

    pub fn dkg_commitment(round_id: &str, node_id: &str) -> String {
        format!("dkg/{round_id}/commitments/{node_id}.json")
    }

    pub fn dkg_commitments_prefix(round_id: &str) -> String {
        format!("dkg/{round_id}/commitments/")
    }

    pub fn dkg_share(round_id: &str, from: &str, to: &str) -> String {
        format!("dkg/{round_id}/shares/{from}_to_{to}.enc")
    }

    pub fn dkg_shares_prefix(round_id: &str) -> String {
        format!("dkg/{round_id}/shares/")
    }

    pub fn dkg_complaint(round_id: &str, accuser: &str, accused: &str) -> String {
        format!("dkg/{round_id}/complaints/{accuser}_vs_{accused}.json")
    }

    pub fn dkg_complaints_prefix(round_id: &str) -> String {
        format!("dkg/{round_id}/complaints/")
    }

    pub fn signing_prefix() -> String {
        "signing/".to_string()
    }

    pub fn signing_request(request_id: &str) -> String {
        format!("signing/{request_id}/request.json")
    }

    pub fn signing_session(request_id: &str) -> String {
        format!("signing/{request_id}/session.json")
    }

    pub fn signing_commitment(request_id: &str, node_id: &str) -> String {
        format!("signing/{request_id}/commitments/{node_id}.json")
    }

    pub fn signing_commitments_prefix(request_id: &str) -> String {
        format!("signing/{request_id}/commitments/")
    }

    pub fn signing_partial(request_id: &str, node_id: &str) -> String {
        format!("signing/{request_id}/partials/{node_id}.json")
    }

    pub fn signing_partials_prefix(request_id: &str) -> String {
        format!("signing/{request_id}/partials/")
    }

    pub fn signing_result(request_id: &str) -> String {
        format!("signing/{request_id}/result.json")
    }

    /// The `{node_id}` of a `…/{node_id}.json` board path.
    pub fn node_of(path: &str, prefix: &str) -> Option<String> {
        path.strip_prefix(prefix)?
            .strip_suffix(".json")
            .map(str::to_string)
    }
}
