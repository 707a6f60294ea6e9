//! Custody Node CLI
//!
//! Drives one ceremony step at a time against a shared bulletin-board
//! directory:
//! - node lifecycle: `init`, `status`
//! - DKG phases: `dkg-start`, `dkg-status`, `dkg-distribute`, `dkg-finalize`
//! - signing: `sign-request`, `sign-list`, `sign-approve`, `sign-finalize`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use bulletin::{DirTransport, Transport};
use custody_core::module::token::{FileToken, TokenBackend};
use custody_core::{dkg, signing, Error, ModulePin, Node, NodeConfig, OperationMode};

/// Custody Node - asynchronous threshold custody participant
#[derive(Parser)]
#[command(name = "custody-node")]
#[command(about = "Asynchronous threshold custody node")]
#[command(version)]
struct Cli {
    /// Node identity on the board
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Directory for durable state and the software token
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Shared bulletin-board directory
    #[arg(long, env = "BOARD_DIR")]
    board: PathBuf,

    /// Secret-module mode: production (non-extractable) or demo
    #[arg(long, env = "OPERATION_MODE", default_value = "production")]
    mode: OperationMode,

    /// Secret-module PIN (at least 8 characters; never logged)
    #[arg(long, env = "MODULE_PIN", hide_env_values = true)]
    pin: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the node: identity keypair, nonce derivation, identity post
    Init,

    /// Show node status with the nonce security audit
    Status,

    /// DKG phase 1: sample polynomial, post commitments
    DkgStart {
        /// Unique round identifier
        #[arg(long)]
        round_id: String,

        /// Signing threshold (t)
        #[arg(long, default_value_t = 2)]
        threshold: usize,

        /// Total participants (n)
        #[arg(long, default_value_t = 3)]
        total: usize,
    },

    /// Show DKG round progress
    DkgStatus {
        #[arg(long)]
        round_id: String,
    },

    /// DKG phase 2: send encrypted shares to every participant
    DkgDistribute {
        #[arg(long)]
        round_id: String,
    },

    /// DKG phase 3: verify shares, store final share, compute group key
    DkgFinalize {
        #[arg(long)]
        round_id: String,
    },

    /// Create a signing request
    SignRequest {
        /// Message to sign
        #[arg(long)]
        message: String,
    },

    /// List signing requests on the board
    SignList,

    /// Approve a signing request (derives and commits a nonce)
    SignApprove {
        #[arg(long)]
        request_id: String,
    },

    /// Finalize a signing request (partial signature and combine)
    SignFinalize {
        #[arg(long)]
        request_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let node = open_node(&cli)?;

    match &cli.command {
        Commands::Init => run_init(&cli, &node),
        Commands::Status => run_status(&node),
        Commands::DkgStart {
            round_id,
            threshold,
            total,
        } => run_dkg_start(&node, round_id, *threshold, *total),
        Commands::DkgStatus { round_id } => run_dkg_status(&node, round_id),
        Commands::DkgDistribute { round_id } => run_dkg_distribute(&node, round_id),
        Commands::DkgFinalize { round_id } => run_dkg_finalize(&node, round_id),
        Commands::SignRequest { message } => run_sign_request(&node, message),
        Commands::SignList => run_sign_list(&node),
        Commands::SignApprove { request_id } => run_sign_approve(&node, request_id),
        Commands::SignFinalize { request_id } => run_sign_finalize(&node, request_id),
    }
}

fn open_node(cli: &Cli) -> Result<Node> {
    let pin = ModulePin::new(cli.pin.clone())?;
    let config = NodeConfig::new(cli.node_id.clone(), cli.data_dir.clone(), cli.mode, pin)?;
    let transport = DirTransport::open(&cli.board)
        .with_context(|| format!("opening board at {}", cli.board.display()))?;
    let token = FileToken::open(cli.data_dir.join("token.json"))?;
    Ok(Node::open(
        config,
        Arc::new(transport) as Arc<dyn Transport>,
        Arc::new(token) as Arc<dyn TokenBackend>,
    )?)
}

fn run_init(cli: &Cli, node: &Node) -> Result<()> {
    if cli.mode == OperationMode::Demo {
        println!("WARNING: demo mode - module secrets are extractable. Do not use in production.");
    }
    let report = custody_core::init(node)?;
    println!(
        "Node {} initialized (identity {}, nonce seed {}, identity {} on board)",
        node.node_id(),
        if report.created_identity { "created" } else { "present" },
        if report.created_nonce_seed { "created" } else { "present" },
        if report.identity_posted_now { "posted" } else { "already" },
    );
    Ok(())
}

fn run_status(node: &Node) -> Result<()> {
    let report = custody_core::status(node)?;
    println!("Node:            {}", report.node_id);
    println!("Mode:            {}", report.mode);
    println!("Initialized:     {}", report.initialized);
    println!("Identity posted: {}", report.identity_posted);
    println!();
    println!("DKG:");
    println!("  Round: {}", report.dkg.round_id.as_deref().unwrap_or("-"));
    println!("  Phase: {}", report.dkg.phase);
    if let Some(key) = &report.dkg.group_pubkey_hex {
        println!("  Group key: {key}");
    }
    println!();
    println!("Nonce audit:");
    match report.counter {
        Some(counter) => println!("  Counter:        {counter}"),
        None => println!("  Counter:        not initialized"),
    }
    println!("  Local records:  {}", report.nonce_audit.local_records);
    println!("  Module records: {}", report.nonce_audit.module_records);
    if report.nonce_audit.is_consistent() {
        println!("  Consistency:    OK");
    } else {
        println!("  Consistency:    MISMATCH");
        for mismatch in &report.nonce_audit.mismatches {
            println!("    - {mismatch}");
        }
    }
    println!();
    println!("Board identities: {}", report.board_identities.join(", "));
    Ok(())
}

fn run_dkg_start(node: &Node, round_id: &str, threshold: usize, total: usize) -> Result<()> {
    dkg::start(node, round_id, threshold, total)?;
    println!("Commitments posted for round {round_id} ({threshold}-of-{total}). Run dkg-distribute next.");
    Ok(())
}

fn run_dkg_status(node: &Node, round_id: &str) -> Result<()> {
    let progress = dkg::progress(node, round_id)?;
    println!("Round {round_id}:");
    println!("  Committed: {}", progress.committed.join(", "));
    println!("  Shares for this node from: {}", progress.shares_for_me.join(", "));
    if !progress.complaints.is_empty() {
        println!("  Complaints: {}", progress.complaints.join(", "));
    }
    Ok(())
}

fn run_dkg_distribute(node: &Node, round_id: &str) -> Result<()> {
    match dkg::distribute(node, round_id)? {
        dkg::DistributeOutcome::Pending { have, need } => {
            println!("Waiting for commitments ({have}/{need}). Try again later.");
        }
        dkg::DistributeOutcome::Distributed { recipients } => {
            println!("Shares distributed to {recipients} participants. Run dkg-finalize next.");
        }
        dkg::DistributeOutcome::AlreadyDistributed => {
            println!("Shares already distributed.");
        }
    }
    Ok(())
}

fn run_dkg_finalize(node: &Node, round_id: &str) -> Result<()> {
    match dkg::finalize(node, round_id)? {
        dkg::FinalizeOutcome::Pending { have, need } => {
            println!("Waiting for shares ({have}/{need}). Try again later.");
        }
        dkg::FinalizeOutcome::Finalized { group_pubkey_hex } => {
            println!("DKG complete. Group public key: {group_pubkey_hex}");
        }
        dkg::FinalizeOutcome::AlreadyFinalized { group_pubkey_hex } => {
            println!("Round already finalized. Group public key: {group_pubkey_hex}");
        }
    }
    Ok(())
}

fn run_sign_request(node: &Node, message: &str) -> Result<()> {
    let request = signing::create_request(node, message)?;
    println!("Request created: {}", request.request_id);
    println!("  Digest: {}", request.message_digest_hex);
    println!("  Threshold: {}", request.threshold);
    Ok(())
}

fn run_sign_list(node: &Node) -> Result<()> {
    let summaries = signing::list_requests(node)?;
    if summaries.is_empty() {
        println!("No signing requests.");
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}: {} ({} commitments, {} partials, threshold {})",
            summary.request_id, summary.state, summary.commitments, summary.partials, summary.threshold
        );
        println!("  From: {}", summary.requester);
        println!("  Message: {}", summary.message);
    }
    Ok(())
}

fn run_sign_approve(node: &Node, request_id: &str) -> Result<()> {
    match signing::approve(node, request_id) {
        Ok(report) => {
            println!("Approved {request_id} (counter {}).", report.counter);
            println!("  R: {}", report.r_hex);
            println!("Run sign-finalize once the threshold of commitments is posted.");
            Ok(())
        }
        Err(Error::NonceReuseAttempted { request_id, layer }) => {
            println!("REFUSED: a nonce for {request_id} was already issued (detected by {layer}).");
            println!("No new nonce was derived; the counter did not move.");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn run_sign_finalize(node: &Node, request_id: &str) -> Result<()> {
    match signing::finalize(node, request_id) {
        Ok(signing::FinalizeOutcome::WaitingCommitments { have, need }) => {
            println!("Waiting for commitments ({have}/{need}). Try again later.");
            Ok(())
        }
        Ok(signing::FinalizeOutcome::WaitingPartials { have, need }) => {
            println!("Partial posted. Waiting for partials ({have}/{need}).");
            Ok(())
        }
        Ok(signing::FinalizeOutcome::Combined(result)) => {
            println!("Signature complete.");
            println!("  R: {}", result.r);
            println!("  s: {}", result.s);
            println!("  Participants: {}", result.participants.join(", "));
            Ok(())
        }
        Ok(signing::FinalizeOutcome::AlreadyCombined(result)) => {
            println!("Request already combined.");
            println!("  R: {}", result.r);
            println!("  s: {}", result.s);
            Ok(())
        }
        Err(Error::NotInSession(request_id)) => {
            println!(
                "This node is not in the locked participant set for {request_id}; \
                 its commitment stays available for future requests."
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
