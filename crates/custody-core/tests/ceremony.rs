//! End-to-end ceremony tests: several nodes sharing one in-memory board,
//! each with its own token and data directory.

use std::fs;
use std::sync::Arc;

use bulletin::{MemoryTransport, Transport};
use k256::ProjectivePoint;

use custody_core::module;
use custody_core::module::token::{MemoryToken, TokenBackend};
use custody_core::state::DkgPhase;
use custody_core::{dkg, init, math, messages, signing, status, Error, ModulePin, Node, NodeConfig, OperationMode};

struct TestNode {
    node: Node,
    token: Arc<MemoryToken>,
    dir: tempfile::TempDir,
}

impl TestNode {
    fn id(&self) -> String {
        self.node.node_id().to_string()
    }

    fn state_file(&self) -> std::path::PathBuf {
        self.dir.path().join("state.json")
    }
}

fn open_node(
    transport: &Arc<MemoryTransport>,
    token: Arc<MemoryToken>,
    data_dir: &std::path::Path,
    node_id: &str,
) -> Node {
    let config = NodeConfig::new(
        node_id,
        data_dir,
        OperationMode::Demo,
        ModulePin::new("test-pin-123").unwrap(),
    )
    .unwrap();
    Node::open(
        config,
        transport.clone() as Arc<dyn Transport>,
        token as Arc<dyn TokenBackend>,
    )
    .unwrap()
}

fn spawn(transport: &Arc<MemoryTransport>, node_id: &str) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let token = Arc::new(MemoryToken::new());
    let node = open_node(transport, token.clone(), dir.path(), node_id);
    init(&node).unwrap();
    TestNode { node, token, dir }
}

fn spawn_cluster(transport: &Arc<MemoryTransport>, count: usize) -> Vec<TestNode> {
    (1..=count)
        .map(|i| spawn(transport, &format!("node{i}")))
        .collect()
}

/// Drive a full DKG round on every node and return the agreed group key.
fn run_dkg(nodes: &[TestNode], round_id: &str, threshold: usize) -> String {
    for n in nodes {
        dkg::start(&n.node, round_id, threshold, nodes.len()).unwrap();
    }
    for n in nodes {
        match dkg::distribute(&n.node, round_id).unwrap() {
            dkg::DistributeOutcome::Distributed { recipients } => {
                assert_eq!(recipients, nodes.len())
            }
            other => panic!("expected Distributed, got {other:?}"),
        }
    }
    let mut keys = Vec::new();
    for n in nodes {
        match dkg::finalize(&n.node, round_id).unwrap() {
            dkg::FinalizeOutcome::Finalized { group_pubkey_hex } => keys.push(group_pubkey_hex),
            other => panic!("expected Finalized, got {other:?}"),
        }
    }
    for key in &keys[1..] {
        assert_eq!(key, &keys[0]);
    }
    keys[0].clone()
}

#[test]
fn happy_two_of_three_dkg() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    let group_key = run_dkg(&nodes, "demo", 2);
    assert_eq!(group_key.len(), 66);

    // Every node reports finalized with the same key, and the group key is
    // the sum of the constant-term commitments.
    let mut constant_terms = ProjectivePoint::IDENTITY;
    for n in &nodes {
        let report = status(&n.node).unwrap();
        assert_eq!(report.dkg.phase, DkgPhase::Finalized);
        assert_eq!(report.dkg.group_pubkey_hex.as_deref(), Some(group_key.as_str()));

        let path = messages::paths::dkg_commitment("demo", &n.id());
        let raw = n.node.board().read(&path).unwrap().unwrap();
        let msg: messages::DkgCommitments = messages::decode(&path, &raw).unwrap();
        constant_terms += math::point_from_hex(&msg.commitments[0]).unwrap();
    }
    assert_eq!(math::point_to_hex(&constant_terms).unwrap(), group_key);
}

#[test]
fn finalized_share_matches_public_commitments() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    run_dkg(&nodes, "demo", 2);

    // Collect every dealer's commitment vector from the board.
    let mut dealer_commitments = Vec::new();
    for n in &nodes {
        let path = messages::paths::dkg_commitment("demo", &n.id());
        let raw = n.node.board().read(&path).unwrap().unwrap();
        let msg: messages::DkgCommitments = messages::decode(&path, &raw).unwrap();
        let points: Vec<ProjectivePoint> = msg
            .commitments
            .iter()
            .map(|h| math::point_from_hex(h).unwrap())
            .collect();
        dealer_commitments.push(points);
    }

    // In demo mode the stored share is extractable: check
    // share · G == Σ_dealers Σ_k index^k · C_{dealer,k}.
    for (position, n) in nodes.iter().enumerate() {
        let index = (position + 1) as u64;
        let session = n.node.login().unwrap();
        let share_bytes = session
            .export_secret(&module::dkg_share_label("demo"))
            .unwrap();
        let share_array: [u8; 32] = share_bytes.as_slice().try_into().unwrap();
        let share = math::scalar_reduce(&share_array);

        let mut expected = ProjectivePoint::IDENTITY;
        for dealer in &dealer_commitments {
            expected += math::eval_commitments(dealer, index);
        }
        assert_eq!(ProjectivePoint::GENERATOR * share, expected);
    }
}

#[test]
fn sign_with_two_of_three() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    let group_key = run_dkg(&nodes, "demo", 2);

    let message = "Pay 100 BTC to Satoshi";
    let request = signing::create_request(&nodes[0].node, message).unwrap();
    assert!(request.request_id.starts_with("tx_"));
    assert_eq!(request.threshold, 2);

    signing::approve(&nodes[0].node, &request.request_id).unwrap();
    signing::approve(&nodes[1].node, &request.request_id).unwrap();

    // First finaliser locks the session and waits for the other partial.
    match signing::finalize(&nodes[0].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::WaitingPartials { have, need } => {
            assert_eq!((have, need), (1, 2));
        }
        other => panic!("expected WaitingPartials, got {other:?}"),
    }

    let session_path = messages::paths::signing_session(&request.request_id);
    let raw = nodes[0].node.board().read(&session_path).unwrap().unwrap();
    let lock: messages::SessionLock = messages::decode(&session_path, &raw).unwrap();
    assert_eq!(lock.participants, vec!["node1".to_string(), "node2".to_string()]);

    let result = match signing::finalize(&nodes[1].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::Combined(result) => result,
        other => panic!("expected Combined, got {other:?}"),
    };
    assert!(signing::verify_result(&result, &group_key, message).unwrap());
    assert_eq!(result.participants, lock.participants);

    // Finalising again just reads the terminal result.
    match signing::finalize(&nodes[0].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::AlreadyCombined(existing) => {
            assert_eq!(existing.s, result.s);
        }
        other => panic!("expected AlreadyCombined, got {other:?}"),
    }
}

#[test]
fn late_approver_is_not_in_session() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    let group_key = run_dkg(&nodes, "demo", 2);

    let message = "rotate custodian set";
    let request = signing::create_request(&nodes[0].node, message).unwrap();

    // All three approve, in order; the first two by timestamp are node1 and
    // node2.
    for n in &nodes {
        signing::approve(&n.node, &request.request_id).unwrap();
    }

    // node2 finalises first and locks {node1, node2}.
    match signing::finalize(&nodes[1].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::WaitingPartials { .. } => {}
        other => panic!("expected WaitingPartials, got {other:?}"),
    }

    // node1 joins the locked session and completes the signature.
    let result = match signing::finalize(&nodes[0].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::Combined(result) => result,
        other => panic!("expected Combined, got {other:?}"),
    };
    assert!(signing::verify_result(&result, &group_key, message).unwrap());

    // node3 approved but is outside the locked set; it exits cleanly.
    match signing::finalize(&nodes[2].node, &request.request_id) {
        Err(Error::NotInSession(id)) => assert_eq!(id, request.request_id),
        other => panic!("expected NotInSession, got {other:?}"),
    }
}

#[test]
fn board_rewind_does_not_permit_nonce_reuse() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    run_dkg(&nodes, "demo", 2);

    let request = signing::create_request(&nodes[0].node, "drain the cold wallet").unwrap();
    let report = signing::approve(&nodes[0].node, &request.request_id).unwrap();
    assert_eq!(report.counter, 1);

    // An attacker rewinds the board so our commitment is gone.
    let commitment_path = messages::paths::signing_commitment(&request.request_id, "node1");
    assert!(transport.rewind(&commitment_path));
    assert!(nodes[0].node.board().read(&commitment_path).unwrap().is_none());

    // Layer 1 (local state) refuses before anything is derived.
    match signing::approve(&nodes[0].node, &request.request_id) {
        Err(Error::NonceReuseAttempted { layer, .. }) => {
            assert_eq!(layer, custody_core::ReuseLayer::LocalState);
        }
        other => panic!("expected NonceReuseAttempted, got {other:?}"),
    }
    let session = nodes[0].node.login().unwrap();
    assert_eq!(session.counter().unwrap(), 1);
}

#[test]
fn snapshot_rollback_does_not_permit_nonce_reuse() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    run_dkg(&nodes, "demo", 2);

    let request = signing::create_request(&nodes[0].node, "migrate vault").unwrap();

    // Snapshot the local disk before approval; the module (hardware-backed)
    // is not part of the snapshot.
    let snapshot = fs::read(nodes[0].state_file()).unwrap();
    signing::approve(&nodes[0].node, &request.request_id).unwrap();
    fs::write(nodes[0].state_file(), snapshot).unwrap();
    assert!(!nodes[0]
        .node
        .state()
        .has_nonce_for(&request.request_id)
        .unwrap());

    // Layer 1 passes after the rollback; layer 2 (module) refuses.
    match signing::approve(&nodes[0].node, &request.request_id) {
        Err(Error::NonceReuseAttempted { layer, .. }) => {
            assert_eq!(layer, custody_core::ReuseLayer::SecretModule);
        }
        other => panic!("expected NonceReuseAttempted, got {other:?}"),
    }
    let session = nodes[0].node.login().unwrap();
    assert_eq!(session.counter().unwrap(), 1);
}

#[test]
fn bad_share_triggers_complaint_and_blocks_finalise() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    let round = "bad";
    for n in &nodes {
        dkg::start(&n.node, round, 2, 3).unwrap();
    }

    // node2 crafts a bogus share for node3 before distributing; the honest
    // distribute skips the already-posted path.
    let identity_path = messages::paths::identity("node3");
    let raw = nodes[1].node.board().read(&identity_path).unwrap().unwrap();
    let identity: messages::IdentityRecord = messages::decode(&identity_path, &raw).unwrap();
    let bogus = custody_core::module::SecretModule::encrypt_for_recipient(
        &identity.public_key_pem,
        &[0x42u8; 32],
        &mut rand::rngs::OsRng,
    )
    .unwrap();
    let bad_path = messages::paths::dkg_share(round, "node2", "node3");
    nodes[1].node.board().post(&bad_path, &bogus).unwrap();

    for n in &nodes {
        dkg::distribute(&n.node, round).unwrap();
    }

    // node3 detects the bad share, posts a complaint, and aborts.
    match dkg::finalize(&nodes[2].node, round) {
        Err(Error::DkgVerificationFailed(_)) => {}
        other => panic!("expected DkgVerificationFailed, got {other:?}"),
    }
    let complaint_path = messages::paths::dkg_complaint(round, "node3", "node2");
    let raw = nodes[2].node.board().read(&complaint_path).unwrap().unwrap();
    let complaint: messages::DkgComplaint = messages::decode(&complaint_path, &raw).unwrap();
    assert_eq!(complaint.accuser, "node3");
    assert_eq!(complaint.accused, "node2");

    let report = status(&nodes[2].node).unwrap();
    assert_eq!(report.dkg.phase, DkgPhase::Distributed);

    // The standing complaint now blocks everyone's finalise.
    match dkg::finalize(&nodes[0].node, round) {
        Err(Error::DkgVerificationFailed(_)) => {}
        other => panic!("expected DkgVerificationFailed, got {other:?}"),
    }
}

#[test]
fn one_of_one_still_signs() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 1);
    let group_key = run_dkg(&nodes, "solo", 1);

    let message = "single custodian payout";
    let request = signing::create_request(&nodes[0].node, message).unwrap();
    assert_eq!(request.threshold, 1);
    signing::approve(&nodes[0].node, &request.request_id).unwrap();

    let result = match signing::finalize(&nodes[0].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::Combined(result) => result,
        other => panic!("expected Combined, got {other:?}"),
    };
    assert_eq!(result.participants, vec!["node1".to_string()]);
    assert!(signing::verify_result(&result, &group_key, message).unwrap());
}

#[test]
fn approvals_keep_all_layers_consistent() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    run_dkg(&nodes, "demo", 2);

    for message in ["payment one", "payment two"] {
        let request = signing::create_request(&nodes[0].node, message).unwrap();
        signing::approve(&nodes[0].node, &request.request_id).unwrap();
    }

    let report = status(&nodes[0].node).unwrap();
    assert_eq!(report.counter, Some(2));
    assert_eq!(report.nonce_audit.local_records, 2);
    assert_eq!(report.nonce_audit.module_records, 2);
    assert!(report.nonce_audit.is_consistent());

    // Invariant: one local record, one module backup, one board blob per
    // approved request, all agreeing on R.
    let session = nodes[0].node.login().unwrap();
    for (request_id, record) in nodes[0].node.state().nonce_records().unwrap() {
        assert!(session.has_nonce_commit(&request_id).unwrap());
        let path = messages::paths::signing_commitment(&request_id, "node1");
        let raw = nodes[0].node.board().read(&path).unwrap().unwrap();
        let msg: messages::NonceCommitment = messages::decode(&path, &raw).unwrap();
        assert_eq!(msg.r_hex, record.r_hex);
        assert_eq!(msg.counter, record.counter);
    }
}

#[test]
fn request_listing_tracks_lifecycle() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    run_dkg(&nodes, "demo", 2);

    let request = signing::create_request(&nodes[0].node, "lifecycle probe").unwrap();
    let summaries = signing::list_requests(&nodes[1].node).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].state, signing::RequestState::Created);

    signing::approve(&nodes[0].node, &request.request_id).unwrap();
    let summaries = signing::list_requests(&nodes[1].node).unwrap();
    assert_eq!(summaries[0].state, signing::RequestState::Committed);

    signing::approve(&nodes[1].node, &request.request_id).unwrap();
    signing::finalize(&nodes[0].node, &request.request_id).unwrap();
    let summaries = signing::list_requests(&nodes[1].node).unwrap();
    assert_eq!(summaries[0].state, signing::RequestState::Locked);

    signing::finalize(&nodes[1].node, &request.request_id).unwrap();
    let summaries = signing::list_requests(&nodes[1].node).unwrap();
    assert_eq!(summaries[0].state, signing::RequestState::Combined);
    assert_eq!(summaries[0].partials, 2);
}

#[test]
fn finalize_without_approval_is_refused() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    run_dkg(&nodes, "demo", 2);

    let request = signing::create_request(&nodes[0].node, "unapproved").unwrap();
    signing::approve(&nodes[0].node, &request.request_id).unwrap();

    match signing::finalize(&nodes[2].node, &request.request_id) {
        Err(Error::NotApproved(id)) => assert_eq!(id, request.request_id),
        other => panic!("expected NotApproved, got {other:?}"),
    }
}

#[test]
fn dkg_phases_refuse_out_of_order_runs() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 2);

    match dkg::distribute(&nodes[0].node, "demo") {
        Err(Error::OutOfOrder(_)) => {}
        other => panic!("expected OutOfOrder, got {other:?}"),
    }

    dkg::start(&nodes[0].node, "demo", 2, 2).unwrap();
    match dkg::finalize(&nodes[0].node, "demo") {
        Err(Error::OutOfOrder(_)) => {}
        other => panic!("expected OutOfOrder, got {other:?}"),
    }

    // Only node1 has committed; distribute reports pending.
    match dkg::distribute(&nodes[0].node, "demo").unwrap() {
        dkg::DistributeOutcome::Pending { have, need } => assert_eq!((have, need), (1, 2)),
        other => panic!("expected Pending, got {other:?}"),
    }

    // Re-running a completed phase is a no-op.
    dkg::start(&nodes[0].node, "demo", 2, 2).unwrap();
}

#[test]
fn node_reopens_with_persistent_state() {
    let transport = Arc::new(MemoryTransport::new());
    let nodes = spawn_cluster(&transport, 3);
    let group_key = run_dkg(&nodes, "demo", 2);

    // Reconstruct node1 from its surviving data dir and token, as after a
    // process restart.
    let reopened = open_node(
        &transport,
        nodes[0].token.clone(),
        nodes[0].dir.path(),
        "node1",
    );
    let report = status(&reopened).unwrap();
    assert_eq!(report.dkg.phase, DkgPhase::Finalized);
    assert_eq!(report.dkg.group_pubkey_hex.as_deref(), Some(group_key.as_str()));

    // And it can still sign.
    let message = "post-restart payout";
    let request = signing::create_request(&reopened, message).unwrap();
    signing::approve(&reopened, &request.request_id).unwrap();
    signing::approve(&nodes[1].node, &request.request_id).unwrap();
    signing::finalize(&reopened, &request.request_id).unwrap();
    let result = match signing::finalize(&nodes[1].node, &request.request_id).unwrap() {
        signing::FinalizeOutcome::Combined(result) => result,
        other => panic!("expected Combined, got {other:?}"),
    };
    assert!(signing::verify_result(&result, &group_key, message).unwrap());
}
