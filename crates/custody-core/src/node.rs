//! Node context
//!
//! Everything one custody node needs to run ceremonies, threaded explicitly
//! so several nodes can coexist in one test process: configuration, board
//! client, secret module, durable state.

use std::sync::Arc;

use bulletin::{BoardClient, Transport};
use chrono::Utc;
use rand::rngs::OsRng;
use tracing::info;

use crate::messages::{self, paths, IdentityRecord};
use crate::module::{token::TokenBackend, ModuleSession, SecretModule};
use crate::state::{DkgState, NonceAudit, StateStore};
use crate::types::{NodeConfig, OperationMode};
use crate::Result;

/// One custody node.
pub struct Node {
    config: NodeConfig,
    board: BoardClient,
    module: SecretModule,
    state: StateStore,
}

impl Node {
    /// Wire a node to its board transport and token backend.
    pub fn open(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        token: Arc<dyn TokenBackend>,
    ) -> Result<Self> {
        let state = StateStore::open(&config.data_dir, &config.node_id)?;
        let module = SecretModule::new(token, config.mode);
        let board = BoardClient::new(transport, config.node_id.clone());
        Ok(Self {
            config,
            board,
            module,
            state,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn mode(&self) -> OperationMode {
        self.config.mode
    }

    pub fn board(&self) -> &BoardClient {
        &self.board
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Open an authenticated module session with the configured PIN.
    pub fn login(&self) -> Result<ModuleSession<'_>> {
        self.module.login(&self.config.pin)
    }
}

/// What `init` found or created.
#[derive(Debug)]
pub struct InitReport {
    pub created_identity: bool,
    pub created_nonce_seed: bool,
    pub identity_posted_now: bool,
}

/// Initialise a node: identity keypair, nonce derivation system, identity
/// posting. Safe to re-run.
pub fn init(node: &Node) -> Result<InitReport> {
    let session = node.login()?;
    let created_identity = session.ensure_identity(&mut OsRng)?;
    let created_nonce_seed = session.init_nonce_derivation(&mut OsRng)?;
    let public_key_pem = session.identity_public_key_pem()?;

    let path = paths::identity(node.node_id());
    let identity_posted_now = if node.board().read(&path)?.is_none() {
        let record = IdentityRecord {
            node_id: node.node_id().to_string(),
            public_key_pem,
            created_at: Utc::now(),
        };
        node.board().post(&path, &messages::encode(&record)?)?;
        true
    } else {
        false
    };

    node.state().update(|s| {
        s.initialized = true;
        s.identity_posted = true;
    })?;

    info!(
        node_id = node.node_id(),
        mode = %node.mode(),
        created_identity,
        created_nonce_seed,
        "node initialised"
    );
    Ok(InitReport {
        created_identity,
        created_nonce_seed,
        identity_posted_now,
    })
}

/// Snapshot of a node's health for the operator.
#[derive(Debug)]
pub struct StatusReport {
    pub node_id: String,
    pub mode: OperationMode,
    pub initialized: bool,
    pub identity_posted: bool,
    pub dkg: DkgState,
    pub counter: Option<u64>,
    pub nonce_audit: NonceAudit,
    pub board_identities: Vec<String>,
}

/// Collect node status, including the nonce consistency audit between local
/// state and the secret module.
pub fn status(node: &Node) -> Result<StatusReport> {
    let state = node.state().load()?;
    let session = node.login()?;
    let counter = session.counter().ok();
    let nonce_audit = node.state().audit_nonces(&session, node.mode())?;

    let board_identities = node
        .board()
        .list("identity/")?
        .into_iter()
        .filter_map(|p| p.strip_prefix("identity/").map(str::to_string))
        .collect();

    Ok(StatusReport {
        node_id: state.node_id,
        mode: node.mode(),
        initialized: state.initialized,
        identity_posted: state.identity_posted,
        dkg: state.dkg,
        counter,
        nonce_audit,
        board_identities,
    })
}
