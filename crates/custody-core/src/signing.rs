//! Threshold Schnorr signing ceremony
//!
//! A request moves through four board-visible states: created, committed
//! (at least one nonce commitment), locked (session.json pins the `t`
//! participants), combined (result.json, terminal).
//!
//! Approval is the security-critical step. Three independent layers must
//! all agree the nonce is fresh before anything is derived, and the write
//! order afterwards is strict: module counter, module backup record, local
//! state, board. The counter advance anchors the defence — no rollback of
//! any one layer can make the module hand out the same nonce twice.

use chrono::Utc;
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::math;
use crate::messages::{
    self, paths, NonceCommitment, PartialSignature, SessionLock, SigningRequest, SigningResult,
};
use crate::node::Node;
use crate::state::NonceRecord;
use crate::{Error, ReuseLayer, Result};

/// Board-visible lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Committed,
    Locked,
    Combined,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Created => write!(f, "request_created"),
            RequestState::Committed => write!(f, "committed"),
            RequestState::Locked => write!(f, "locked"),
            RequestState::Combined => write!(f, "combined"),
        }
    }
}

/// One request as seen by `sign-list`.
#[derive(Debug)]
pub struct RequestSummary {
    pub request_id: String,
    pub requester: String,
    pub message: String,
    pub threshold: usize,
    pub state: RequestState,
    pub commitments: usize,
    pub partials: usize,
}

/// What approve recorded.
#[derive(Debug)]
pub struct ApproveReport {
    pub request_id: String,
    pub counter: u64,
    pub r_hex: String,
}

/// Outcome of a finalise step.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// The request already carries a result; nothing to do.
    AlreadyCombined(SigningResult),
    /// Fewer than `threshold` commitments; no session can be locked yet.
    WaitingCommitments { have: usize, need: usize },
    /// Our partial is posted; other session members still owe theirs.
    WaitingPartials { have: usize, need: usize },
    /// This call combined and posted the verified signature.
    Combined(SigningResult),
}

/// Create a signing request on the board.
///
/// The id is `tx_` + 8 hex of a random nonce; an id already on the board is
/// rejected rather than silently reused.
pub fn create_request(node: &Node, message: &str) -> Result<SigningRequest> {
    let state = node.state().load()?;
    if !state.dkg.share_stored {
        return Err(Error::OutOfOrder(
            "no finalized DKG round on this node".to_string(),
        ));
    }

    let mut id_bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut id_bytes);
    let request_id = format!("tx_{}", hex::encode(id_bytes));

    let path = paths::signing_request(&request_id);
    if node.board().read(&path)?.is_some() {
        return Err(Error::RequestExists(request_id));
    }

    let request = SigningRequest {
        request_id: request_id.clone(),
        message: message.to_string(),
        message_digest_hex: hex::encode(math::sha256(message.as_bytes())),
        requester: node.node_id().to_string(),
        threshold: state.dkg.threshold,
        created_at: Utc::now(),
    };
    node.board().post(&path, &messages::encode(&request)?)?;
    info!(request_id = %request.request_id, requester = node.node_id(), "signing request created");
    Ok(request)
}

/// Approve a request: derive a nonce and publish its commitment.
///
/// Exactly once per node per request, enforced by the triple pre-check and
/// the mandatory derive → module → state → board write order.
pub fn approve(node: &Node, request_id: &str) -> Result<ApproveReport> {
    let state = node.state().load()?;
    if !state.dkg.share_stored {
        return Err(Error::OutOfOrder(
            "no finalized DKG round on this node".to_string(),
        ));
    }

    let request = read_request(node, request_id)?;
    if node.board().read(&paths::signing_result(request_id))?.is_some() {
        return Err(Error::OutOfOrder(format!(
            "request {request_id} is already combined"
        )));
    }

    // Layer 1: local durable state (survives board rewinds).
    if node.state().has_nonce_for(request_id)? {
        return Err(Error::NonceReuseAttempted {
            request_id: request_id.to_string(),
            layer: ReuseLayer::LocalState,
        });
    }

    // Layer 2: secret module (survives local snapshot rollbacks).
    let session = node.login()?;
    if session.has_nonce_commit(request_id)? {
        return Err(Error::NonceReuseAttempted {
            request_id: request_id.to_string(),
            layer: ReuseLayer::SecretModule,
        });
    }

    // Layer 3: bulletin board (survives local state loss).
    let commitment_path = paths::signing_commitment(request_id, node.node_id());
    if node.board().read(&commitment_path)?.is_some() {
        return Err(Error::NonceReuseAttempted {
            request_id: request_id.to_string(),
            layer: ReuseLayer::Board,
        });
    }

    let digest = digest_of(&request)?;

    // The counter advances here; a crash at any later point leaves a burnt
    // counter value, never a reusable nonce.
    let derivation = session.derive_nonce(request_id, &digest)?;
    session.store_nonce_commit(request_id, &derivation.r_hex)?;
    node.state().record_nonce(
        request_id,
        NonceRecord {
            counter: derivation.counter,
            r_hex: derivation.r_hex.clone(),
            message_digest_hex: request.message_digest_hex.clone(),
        },
    )?;

    let msg = NonceCommitment {
        node_id: node.node_id().to_string(),
        r_hex: derivation.r_hex.clone(),
        message_digest_hex: request.message_digest_hex.clone(),
        counter: derivation.counter,
        timestamp: Utc::now(),
    };
    node.board().post(&commitment_path, &messages::encode(&msg)?)?;

    info!(
        request_id,
        counter = derivation.counter,
        "request approved, nonce commitment posted"
    );
    Ok(ApproveReport {
        request_id: request_id.to_string(),
        counter: derivation.counter,
        r_hex: derivation.r_hex,
    })
}

/// Finalise a request: lock (or join) the session, post a partial
/// signature, and combine once the threshold of partials is present.
pub fn finalize(node: &Node, request_id: &str) -> Result<FinalizeOutcome> {
    let state = node.state().load()?;
    if !state.dkg.share_stored {
        return Err(Error::OutOfOrder(
            "no finalized DKG round on this node".to_string(),
        ));
    }
    let round_id = state.dkg.round_id.clone().ok_or_else(|| {
        Error::StateCorruption("share stored without a round id".to_string())
    })?;
    let request = read_request(node, request_id)?;
    let threshold = request.threshold;

    let result_path = paths::signing_result(request_id);
    if let Some(raw) = node.board().read(&result_path)? {
        return Ok(FinalizeOutcome::AlreadyCombined(messages::decode(
            &result_path,
            &raw,
        )?));
    }

    let commitments = load_commitments(node, &request)?;
    if !commitments.iter().any(|c| c.node_id == node.node_id()) {
        return Err(Error::NotApproved(request_id.to_string()));
    }
    if commitments.len() < threshold {
        return Ok(FinalizeOutcome::WaitingCommitments {
            have: commitments.len(),
            need: threshold,
        });
    }

    let session_lock = acquire_session(node, request_id, threshold, &commitments)?;
    if !session_lock.participants.contains(&node.node_id().to_string()) {
        debug!(request_id, "not in locked participant set");
        return Err(Error::NotInSession(request_id.to_string()));
    }

    // This node's recorded derivation, cross-checked against the module and
    // the board before any secret is touched.
    let digest = digest_of(&request)?;
    let record = node
        .state()
        .nonce_records()?
        .remove(request_id)
        .ok_or_else(|| {
            Error::StateCorruption(format!(
                "approved request {request_id} has no local nonce record"
            ))
        })?;
    let module = node.login()?;
    let rederived = module.nonce_commitment(record.counter, request_id, &digest)?;
    let board_r = commitments
        .iter()
        .find(|c| c.node_id == node.node_id())
        .map(|c| c.r_hex.clone())
        .expect("own commitment verified above");
    if rederived != record.r_hex || rederived != board_r {
        return Err(Error::StateCorruption(format!(
            "nonce commitment for {request_id} disagrees across module, state, and board"
        )));
    }

    // Aggregate nonce over the locked set only.
    let mut aggregate = ProjectivePoint::IDENTITY;
    for participant in &session_lock.participants {
        let commitment = commitments
            .iter()
            .find(|c| &c.node_id == participant)
            .ok_or_else(|| {
                Error::ParticipantMismatch(format!(
                    "locked participant {participant} has no commitment"
                ))
            })?;
        aggregate += math::point_from_hex(&commitment.r_hex)?;
    }

    let group_key_hex = state.dkg.group_pubkey_hex.clone().ok_or_else(|| {
        Error::StateCorruption("finalized DKG without a group key".to_string())
    })?;
    let group_key = math::point_from_hex(&group_key_hex)?;
    let challenge = math::challenge(&aggregate, &group_key, request.message.as_bytes())?;

    let my_index = dkg_index(&state.dkg.participants, node.node_id())?;
    let session_indices = session_lock
        .participants
        .iter()
        .map(|p| dkg_index(&state.dkg.participants, p))
        .collect::<Result<Vec<_>>>()?;
    let lambda = math::lagrange_at_zero(my_index, &session_indices)?;

    // The nonce is re-derived inside the module and wiped there; only the
    // partial-signature scalar comes out.
    let partial = module.partial_signature(
        &round_id,
        record.counter,
        request_id,
        &digest,
        &challenge,
        &lambda,
    )?;

    let partial_path = paths::signing_partial(request_id, node.node_id());
    if node.board().read(&partial_path)?.is_none() {
        let msg = PartialSignature {
            node_id: node.node_id().to_string(),
            partial: math::scalar_to_hex(&partial),
            timestamp: Utc::now(),
        };
        node.board().post(&partial_path, &messages::encode(&msg)?)?;
        debug!(request_id, "partial signature posted");
    }

    combine(node, &request, &session_lock, &aggregate, &challenge, &group_key)
}

/// Attempt the combine step: requires all `t` session partials.
fn combine(
    node: &Node,
    request: &SigningRequest,
    session_lock: &SessionLock,
    aggregate: &ProjectivePoint,
    challenge: &Scalar,
    group_key: &ProjectivePoint,
) -> Result<FinalizeOutcome> {
    let request_id = &request.request_id;
    let mut sum = Scalar::ZERO;
    let mut have = 0;
    for participant in &session_lock.participants {
        let path = paths::signing_partial(request_id, participant);
        match node.board().read(&path)? {
            Some(raw) => {
                let msg: PartialSignature = messages::decode(&path, &raw)?;
                if msg.node_id != *participant {
                    return Err(Error::MalformedMessage {
                        path,
                        reason: "partial does not match its path".to_string(),
                    });
                }
                sum += math::scalar_from_hex(&msg.partial)?;
                have += 1;
            }
            None => debug!(request_id, %participant, "partial not yet posted"),
        }
    }
    if have < session_lock.participants.len() {
        return Ok(FinalizeOutcome::WaitingPartials {
            have,
            need: session_lock.participants.len(),
        });
    }

    // s·G == R + e·Y, or the result never reaches the board.
    if ProjectivePoint::GENERATOR * sum != *aggregate + *group_key * *challenge {
        warn!(request_id, "combined signature failed verification");
        return Err(Error::SignatureVerificationFailed(request_id.clone()));
    }

    let result = SigningResult {
        r: math::point_to_hex(aggregate)?,
        s: math::scalar_to_hex(&sum),
        participants: session_lock.participants.clone(),
        message_digest_hex: request.message_digest_hex.clone(),
    };
    let result_path = paths::signing_result(request_id);
    match node.board().post(&result_path, &messages::encode(&result)?) {
        Ok(()) => {
            info!(request_id, "signature combined and posted");
            Ok(FinalizeOutcome::Combined(result))
        }
        Err(bulletin::Error::Occupied(_)) => {
            // Someone combined first; theirs is canonical.
            let raw = node.board().read(&result_path)?.ok_or_else(|| {
                Error::TransientTransport(format!("{result_path} vanished after conflict"))
            })?;
            Ok(FinalizeOutcome::AlreadyCombined(messages::decode(
                &result_path,
                &raw,
            )?))
        }
        Err(other) => Err(other.into()),
    }
}

/// Verify a posted result against the group key and message.
pub fn verify_result(result: &SigningResult, group_key_hex: &str, message: &str) -> Result<bool> {
    let aggregate = math::point_from_hex(&result.r)?;
    let group_key = math::point_from_hex(group_key_hex)?;
    let s = math::scalar_from_hex(&result.s)?;
    let challenge = math::challenge(&aggregate, &group_key, message.as_bytes())?;
    Ok(ProjectivePoint::GENERATOR * s == aggregate + group_key * challenge)
}

/// Enumerate requests on the board with their lifecycle state.
pub fn list_requests(node: &Node) -> Result<Vec<RequestSummary>> {
    let all_paths = node.board().list(&paths::signing_prefix())?;
    let mut request_ids: Vec<String> = all_paths
        .iter()
        .filter_map(|p| {
            p.strip_prefix("signing/")
                .and_then(|rest| rest.strip_suffix("/request.json"))
                .map(str::to_string)
        })
        .collect();
    request_ids.sort();

    let mut summaries = Vec::with_capacity(request_ids.len());
    for request_id in request_ids {
        let path = paths::signing_request(&request_id);
        let raw = match node.board().read(&path)? {
            Some(raw) => raw,
            None => continue,
        };
        let request: SigningRequest = messages::decode(&path, &raw)?;

        let commitments = all_paths
            .iter()
            .filter(|p| p.starts_with(&paths::signing_commitments_prefix(&request_id)))
            .count();
        let partials = all_paths
            .iter()
            .filter(|p| p.starts_with(&paths::signing_partials_prefix(&request_id)))
            .count();
        let combined = all_paths.contains(&paths::signing_result(&request_id));
        let locked = all_paths.contains(&paths::signing_session(&request_id));

        let state = if combined {
            RequestState::Combined
        } else if locked {
            RequestState::Locked
        } else if commitments > 0 {
            RequestState::Committed
        } else {
            RequestState::Created
        };

        summaries.push(RequestSummary {
            request_id,
            requester: request.requester,
            message: request.message,
            threshold: request.threshold,
            state,
            commitments,
            partials,
        });
    }
    Ok(summaries)
}

fn read_request(node: &Node, request_id: &str) -> Result<SigningRequest> {
    let path = paths::signing_request(request_id);
    let raw = node
        .board()
        .read(&path)?
        .ok_or_else(|| Error::RequestNotFound(request_id.to_string()))?;
    let request: SigningRequest = messages::decode(&path, &raw)?;
    if request.request_id != request_id {
        return Err(Error::MalformedMessage {
            path,
            reason: "request id does not match its path".to_string(),
        });
    }
    if request.message_digest_hex != hex::encode(math::sha256(request.message.as_bytes())) {
        return Err(Error::MalformedMessage {
            path,
            reason: "message digest does not match message".to_string(),
        });
    }
    if request.threshold < 1 {
        return Err(Error::MalformedMessage {
            path,
            reason: "threshold must be at least 1".to_string(),
        });
    }
    Ok(request)
}

fn digest_of(request: &SigningRequest) -> Result<[u8; 32]> {
    let bytes = hex::decode(&request.message_digest_hex).map_err(|e| Error::MalformedMessage {
        path: paths::signing_request(&request.request_id),
        reason: format!("bad digest hex: {e}"),
    })?;
    bytes.try_into().map_err(|_| Error::MalformedMessage {
        path: paths::signing_request(&request.request_id),
        reason: "digest is not 32 bytes".to_string(),
    })
}

/// Read and validate all nonce commitments for a request.
fn load_commitments(node: &Node, request: &SigningRequest) -> Result<Vec<NonceCommitment>> {
    let prefix = paths::signing_commitments_prefix(&request.request_id);
    let mut out = Vec::new();
    for path in node.board().list(&prefix)? {
        let poster = paths::node_of(&path, &prefix).ok_or_else(|| Error::MalformedMessage {
            path: path.clone(),
            reason: "unexpected file name".to_string(),
        })?;
        let raw = node
            .board()
            .read(&path)?
            .ok_or_else(|| Error::TransientTransport(format!("{path} vanished between list and read")))?;
        let msg: NonceCommitment = messages::decode(&path, &raw)?;
        if msg.node_id != poster {
            return Err(Error::MalformedMessage {
                path,
                reason: "commitment does not match its path".to_string(),
            });
        }
        if msg.message_digest_hex != request.message_digest_hex {
            return Err(Error::MalformedMessage {
                path,
                reason: "commitment digest does not match request".to_string(),
            });
        }
        out.push(msg);
    }
    Ok(out)
}

/// Read the session lock, creating it if absent.
///
/// The participant set is the first `threshold` commitment posters by
/// timestamp, ties broken by node id; the post is first-writer-wins, and a
/// lost race means reading the winner's lock.
fn acquire_session(
    node: &Node,
    request_id: &str,
    threshold: usize,
    commitments: &[NonceCommitment],
) -> Result<SessionLock> {
    let path = paths::signing_session(request_id);
    if let Some(raw) = node.board().read(&path)? {
        let lock: SessionLock = messages::decode(&path, &raw)?;
        validate_session(&path, &lock, threshold, commitments)?;
        return Ok(lock);
    }

    let mut ordered: Vec<&NonceCommitment> = commitments.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    let mut participants: Vec<String> = ordered
        .iter()
        .take(threshold)
        .map(|c| c.node_id.clone())
        .collect();
    participants.sort();

    let lock = SessionLock {
        participants,
        locked_by: node.node_id().to_string(),
        timestamp: Utc::now(),
    };
    match node.board().post(&path, &messages::encode(&lock)?) {
        Ok(()) => {
            info!(request_id, participants = ?lock.participants, "session locked");
            Ok(lock)
        }
        Err(bulletin::Error::Occupied(_)) => {
            let raw = node.board().read(&path)?.ok_or_else(|| {
                Error::TransientTransport(format!("{path} vanished after conflict"))
            })?;
            let existing: SessionLock = messages::decode(&path, &raw)?;
            validate_session(&path, &existing, threshold, commitments)?;
            debug!(request_id, locked_by = %existing.locked_by, "joined existing session");
            Ok(existing)
        }
        Err(other) => Err(other.into()),
    }
}

fn validate_session(
    path: &str,
    lock: &SessionLock,
    threshold: usize,
    commitments: &[NonceCommitment],
) -> Result<()> {
    if lock.participants.len() != threshold {
        return Err(Error::MalformedMessage {
            path: path.to_string(),
            reason: format!(
                "session pins {} participants for threshold {threshold}",
                lock.participants.len()
            ),
        });
    }
    for participant in &lock.participants {
        if !commitments.iter().any(|c| &c.node_id == participant) {
            return Err(Error::ParticipantMismatch(format!(
                "locked participant {participant} has no commitment"
            )));
        }
    }
    Ok(())
}

fn dkg_index(participants: &[String], node_id: &str) -> Result<u64> {
    participants
        .iter()
        .position(|p| p == node_id)
        .map(|p| (p + 1) as u64)
        .ok_or_else(|| {
            Error::ParticipantMismatch(format!(
                "{node_id} is not a participant of the DKG round"
            ))
        })
}
