//! Feldman DKG ceremony
//!
//! Three operator-driven phases over the bulletin board. Every participant
//! deals: it commits to a random polynomial, distributes encrypted share
//! evaluations to everyone (itself included, for symmetry), and finalises by
//! verifying every received share against the dealer's commitments.
//!
//! The phase machine `idle → committed → distributed → finalized` lives in
//! durable state; re-running a completed phase is a no-op and running out of
//! order is refused.

use chrono::Utc;
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::math;
use crate::messages::{self, paths, DkgCommitments, DkgComplaint};
use crate::node::Node;
use crate::state::DkgPhase;
use crate::{Error, Result};

/// Outcome of the distribute phase.
#[derive(Debug)]
pub enum DistributeOutcome {
    /// Fewer than `total` commitments are on the board; nothing was done.
    Pending { have: usize, need: usize },
    /// Shares posted for every participant.
    Distributed { recipients: usize },
    /// The phase had already completed.
    AlreadyDistributed,
}

/// Outcome of the finalise phase.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// Shares addressed to this node are still missing.
    Pending { have: usize, need: usize },
    /// Share stored, group key computed.
    Finalized { group_pubkey_hex: String },
    /// The round had already finalised on this node.
    AlreadyFinalized { group_pubkey_hex: String },
}

/// Phase 1: sample the polynomial and post commitments.
pub fn start(node: &Node, round_id: &str, threshold: usize, total: usize) -> Result<()> {
    if threshold < 1 {
        return Err(Error::Config("threshold must be at least 1".to_string()));
    }
    if total < threshold {
        return Err(Error::Config(format!(
            "total ({total}) must be at least the threshold ({threshold})"
        )));
    }

    let state = node.state().load()?;
    if !state.initialized || !state.identity_posted {
        return Err(Error::OutOfOrder("run init before dkg-start".to_string()));
    }
    match (&state.dkg.round_id, state.dkg.phase) {
        (Some(current), phase) if current == round_id && phase >= DkgPhase::Committed => {
            info!(round_id, %phase, "dkg-start already completed");
            return Ok(());
        }
        (Some(current), phase) if current != round_id && phase != DkgPhase::Idle => {
            return Err(Error::OutOfOrder(format!(
                "round {current} is already in progress (phase {phase})"
            )));
        }
        _ => {}
    }

    info!(round_id, threshold, total, "starting DKG round");
    let session = node.login()?;
    let commitments = session.create_polynomial(round_id, threshold, &mut OsRng)?;
    let commitment_hexes = commitments
        .iter()
        .map(math::point_to_hex)
        .collect::<Result<Vec<_>>>()?;

    let path = paths::dkg_commitment(round_id, node.node_id());
    if node.board().read(&path)?.is_none() {
        let msg = DkgCommitments {
            node_id: node.node_id().to_string(),
            round_id: round_id.to_string(),
            commitments: commitment_hexes,
            threshold,
            total,
            timestamp: Utc::now(),
        };
        node.board().post(&path, &messages::encode(&msg)?)?;
    }

    node.state().update(|s| {
        s.dkg.round_id = Some(round_id.to_string());
        s.dkg.phase = DkgPhase::Committed;
        s.dkg.threshold = threshold;
        s.dkg.total = total;
    })?;
    info!(round_id, "commitments posted");
    Ok(())
}

/// Phase 2: once all `total` commitments are visible, encrypt and post a
/// share evaluation for every participant.
pub fn distribute(node: &Node, round_id: &str) -> Result<DistributeOutcome> {
    let state = node.state().load()?;
    require_round(&state.dkg.round_id, round_id)?;
    match state.dkg.phase {
        DkgPhase::Distributed | DkgPhase::Finalized => return Ok(DistributeOutcome::AlreadyDistributed),
        DkgPhase::Committed => {}
        phase => {
            return Err(Error::OutOfOrder(format!(
                "dkg-distribute requires phase committed, found {phase}"
            )))
        }
    }

    let commitments = load_commitments(node, round_id, state.dkg.threshold, state.dkg.total)?;
    if commitments.len() < state.dkg.total {
        debug!(
            round_id,
            have = commitments.len(),
            need = state.dkg.total,
            "waiting for commitments"
        );
        return Ok(DistributeOutcome::Pending {
            have: commitments.len(),
            need: state.dkg.total,
        });
    }

    let participants = participant_list(&commitments);
    index_of(&participants, node.node_id())?;

    let session = node.login()?;
    for (position, recipient) in participants.iter().enumerate() {
        let share_path = paths::dkg_share(round_id, node.node_id(), recipient);
        if node.board().read(&share_path)?.is_some() {
            debug!(round_id, %recipient, "share already posted");
            continue;
        }

        let identity_path = paths::identity(recipient);
        let identity_raw = node.board().read(&identity_path)?.ok_or_else(|| {
            Error::ParticipantMismatch(format!("no identity posted for {recipient}"))
        })?;
        let identity: messages::IdentityRecord = messages::decode(&identity_path, &identity_raw)?;

        let share = session.polynomial_share(round_id, (position + 1) as u64)?;
        let share_bytes = Zeroizing::new(share.to_bytes().to_vec());
        let ciphertext = crate::module::SecretModule::encrypt_for_recipient(
            &identity.public_key_pem,
            &share_bytes,
            &mut OsRng,
        )?;
        node.board().post(&share_path, &ciphertext)?;
        debug!(round_id, %recipient, "share posted");
    }

    node.state().update(|s| s.dkg.phase = DkgPhase::Distributed)?;
    info!(round_id, recipients = participants.len(), "shares distributed");
    Ok(DistributeOutcome::Distributed {
        recipients: participants.len(),
    })
}

/// Phase 3: decrypt and verify every share addressed to this node, store
/// the summed share, compute the group key, wipe the polynomial.
pub fn finalize(node: &Node, round_id: &str) -> Result<FinalizeOutcome> {
    let state = node.state().load()?;
    require_round(&state.dkg.round_id, round_id)?;
    match state.dkg.phase {
        DkgPhase::Finalized => {
            let group_pubkey_hex = state.dkg.group_pubkey_hex.clone().ok_or_else(|| {
                Error::StateCorruption("finalized round without a group key".to_string())
            })?;
            return Ok(FinalizeOutcome::AlreadyFinalized { group_pubkey_hex });
        }
        DkgPhase::Distributed => {}
        phase => {
            return Err(Error::OutOfOrder(format!(
                "dkg-finalize requires phase distributed, found {phase}"
            )))
        }
    }

    let commitments = load_commitments(node, round_id, state.dkg.threshold, state.dkg.total)?;
    if commitments.len() < state.dkg.total {
        return Ok(FinalizeOutcome::Pending {
            have: commitments.len(),
            need: state.dkg.total,
        });
    }
    let participants = participant_list(&commitments);
    let my_index = index_of(&participants, node.node_id())?;

    refuse_if_complained_against_providers(node, round_id, &participants)?;

    // All providers' ciphertexts must be present before any is opened.
    let mut ciphertexts = Vec::with_capacity(participants.len());
    let mut have = 0;
    for provider in &participants {
        let path = paths::dkg_share(round_id, provider, node.node_id());
        match node.board().read(&path)? {
            Some(ciphertext) => {
                have += 1;
                ciphertexts.push((provider.clone(), ciphertext));
            }
            None => debug!(round_id, %provider, "share not yet posted"),
        }
    }
    if have < participants.len() {
        return Ok(FinalizeOutcome::Pending {
            have,
            need: participants.len(),
        });
    }

    let session = node.login()?;
    let mut sum = Scalar::ZERO;
    let mut failures = Vec::new();
    for (provider, ciphertext) in &ciphertexts {
        let plaintext = Zeroizing::new(session.decrypt_share(ciphertext)?);
        let share_array: [u8; 32] = plaintext.as_slice().try_into().map_err(|_| {
            Error::MalformedMessage {
                path: paths::dkg_share(round_id, provider, node.node_id()),
                reason: "share plaintext is not 32 bytes".to_string(),
            }
        })?;
        let share = math::scalar_reduce(&share_array);

        let dealer = commitments
            .iter()
            .find(|c| &c.node_id == provider)
            .expect("provider comes from the commitment list");
        let dealer_points = dealer
            .commitments
            .iter()
            .map(|h| math::point_from_hex(h))
            .collect::<Result<Vec<_>>>()?;

        if ProjectivePoint::GENERATOR * share
            != math::eval_commitments(&dealer_points, my_index as u64)
        {
            warn!(round_id, %provider, "share failed Feldman verification");
            post_complaint(node, round_id, provider)?;
            failures.push(provider.clone());
            continue;
        }
        sum += share;
    }

    if !failures.is_empty() {
        return Err(Error::DkgVerificationFailed(format!(
            "shares from {} failed verification; complaints posted",
            failures.join(", ")
        )));
    }

    let mut group_key = ProjectivePoint::IDENTITY;
    for dealer in &commitments {
        group_key += math::point_from_hex(&dealer.commitments[0])?;
    }
    let group_pubkey_hex = math::point_to_hex(&group_key)?;

    session.store_dkg_share(round_id, &sum)?;
    session.wipe_polynomial(round_id)?;

    node.state().update(|s| {
        s.dkg.phase = DkgPhase::Finalized;
        s.dkg.share_stored = true;
        s.dkg.participants = participants.clone();
        s.dkg.group_pubkey_hex = Some(group_pubkey_hex.clone());
    })?;

    info!(round_id, group_pubkey = %group_pubkey_hex, "DKG finalized");
    Ok(FinalizeOutcome::Finalized { group_pubkey_hex })
}

/// Progress of a round as visible on the board.
#[derive(Debug)]
pub struct RoundProgress {
    pub committed: Vec<String>,
    pub shares_for_me: Vec<String>,
    pub complaints: Vec<String>,
}

pub fn progress(node: &Node, round_id: &str) -> Result<RoundProgress> {
    let commitment_prefix = paths::dkg_commitments_prefix(round_id);
    let committed = node
        .board()
        .list(&commitment_prefix)?
        .iter()
        .filter_map(|p| paths::node_of(p, &commitment_prefix))
        .collect();

    let suffix = format!("_to_{}.enc", node.node_id());
    let share_prefix = paths::dkg_shares_prefix(round_id);
    let shares_for_me = node
        .board()
        .list(&share_prefix)?
        .iter()
        .filter_map(|p| p.strip_prefix(&share_prefix))
        .filter_map(|name| name.strip_suffix(&suffix))
        .map(str::to_string)
        .collect();

    let complaints = node.board().list(&paths::dkg_complaints_prefix(round_id))?;
    Ok(RoundProgress {
        committed,
        shares_for_me,
        complaints,
    })
}

fn require_round(current: &Option<String>, round_id: &str) -> Result<()> {
    match current {
        Some(r) if r == round_id => Ok(()),
        Some(r) => Err(Error::OutOfOrder(format!(
            "round {round_id} is not the active round ({r})"
        ))),
        None => Err(Error::OutOfOrder(format!(
            "round {round_id} has not been started on this node"
        ))),
    }
}

/// Read and validate every commitment blob of the round. Parameters must
/// agree with ours; more posters than `total` is a configuration mismatch.
fn load_commitments(
    node: &Node,
    round_id: &str,
    threshold: usize,
    total: usize,
) -> Result<Vec<DkgCommitments>> {
    let prefix = paths::dkg_commitments_prefix(round_id);
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
        let msg: DkgCommitments = messages::decode(&path, &raw)?;
        if msg.node_id != poster || msg.round_id != round_id {
            return Err(Error::MalformedMessage {
                path,
                reason: "commitment does not match its path".to_string(),
            });
        }
        if msg.commitments.len() != msg.threshold {
            return Err(Error::MalformedMessage {
                path,
                reason: format!(
                    "{} commitments for threshold {}",
                    msg.commitments.len(),
                    msg.threshold
                ),
            });
        }
        if msg.threshold != threshold || msg.total != total {
            return Err(Error::ParticipantMismatch(format!(
                "{poster} declared {}-of-{}, this node expects {threshold}-of-{total}",
                msg.threshold, msg.total
            )));
        }
        out.push(msg);
    }
    if out.len() > total {
        return Err(Error::ParticipantMismatch(format!(
            "{} commitments posted for a {total}-participant round",
            out.len()
        )));
    }
    Ok(out)
}

/// Sorted participant ids; index(j) is 1 + position in this list.
fn participant_list(commitments: &[DkgCommitments]) -> Vec<String> {
    let mut ids: Vec<String> = commitments.iter().map(|c| c.node_id.clone()).collect();
    ids.sort();
    ids
}

fn index_of(participants: &[String], node_id: &str) -> Result<usize> {
    participants
        .iter()
        .position(|p| p == node_id)
        .map(|p| p + 1)
        .ok_or_else(|| {
            Error::ParticipantMismatch(format!("{node_id} is not among the round's participants"))
        })
}

/// Any standing complaint against a share provider blocks finalisation;
/// adjudication is an operator concern.
fn refuse_if_complained_against_providers(
    node: &Node,
    round_id: &str,
    participants: &[String],
) -> Result<()> {
    for path in node.board().list(&paths::dkg_complaints_prefix(round_id))? {
        let raw = node
            .board()
            .read(&path)?
            .ok_or_else(|| Error::TransientTransport(format!("{path} vanished between list and read")))?;
        let complaint: DkgComplaint = messages::decode(&path, &raw)?;
        if participants.contains(&complaint.accused) {
            return Err(Error::DkgVerificationFailed(format!(
                "complaint by {} against provider {} is on record",
                complaint.accuser, complaint.accused
            )));
        }
    }
    Ok(())
}

fn post_complaint(node: &Node, round_id: &str, accused: &str) -> Result<()> {
    let path = paths::dkg_complaint(round_id, node.node_id(), accused);
    if node.board().read(&path)?.is_some() {
        return Ok(());
    }
    let complaint = DkgComplaint {
        accuser: node.node_id().to_string(),
        accused: accused.to_string(),
        round_id: round_id.to_string(),
        reason: "share does not match Feldman commitments".to_string(),
        timestamp: Utc::now(),
    };
    node.board().post(&path, &messages::encode(&complaint)?)?;
    Ok(())
}
