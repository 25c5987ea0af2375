//! DDD command-line tool
//!
//! Disconnection/Delay-tolerant Data Delivery: key management, ADU
//! submission, and bundle files for whatever carrier moves them.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ddd_core::bundle::BUNDLE_EXTENSION;
use ddd_core::{BundleTransmission, IngestOutcome, Role, keystore};
use ddd_crypto::PeerIdentity;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use config::Config;

/// DDD - encrypted bundles for intermittent links
#[derive(Parser)]
#[command(name = "ddd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the key files of a role
    Keygen {
        /// Role the keys are for
        #[arg(long)]
        role: Role,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Server key directory to provision into a client key directory
        #[arg(long)]
        server: Option<PathBuf>,
    },

    /// Print the peer id of a public key file
    PeerId {
        /// Public key file
        file: PathBuf,
    },

    /// Queue a file as an ADU for a peer
    Enqueue {
        /// Recipient peer id
        #[arg(long)]
        peer: String,

        /// Application id
        #[arg(long)]
        app: String,

        /// File holding the ADU payload
        file: PathBuf,
    },

    /// Write bundles for peers into a directory, replacing superseded ones
    Generate {
        /// Peers to generate for (all known peers if omitted)
        #[arg(long)]
        peer: Vec<String>,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Process received bundle files
    Ingest {
        /// Bundle files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the window of a peer
    Status {
        /// Peer id
        #[arg(long)]
        peer: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Keygen { role, out, server } => generate_keys(role, &out, server.as_deref())?,
        Commands::PeerId { file } => {
            println!("{}", keystore::peer_id_of(&file)?);
        }
        Commands::Enqueue { peer, app, file } => {
            let transmission = open(&config)?;
            let peer = parse_peer(&peer)?;
            let data =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let id = transmission.enqueue_adu(&peer, &app, &data)?;
            println!("Queued {app}/{id} for {peer} ({} bytes)", data.len());
        }
        Commands::Generate { peer, out } => {
            let transmission = open(&config)?;
            generate_bundles(&transmission, &peer, &out).await?;
        }
        Commands::Ingest { files } => {
            let transmission = open(&config)?;
            ingest_bundles(&transmission, &files).await?;
        }
        Commands::Status { peer } => {
            let transmission = open(&config)?;
            show_status(&transmission, &parse_peer(&peer)?)?;
        }
    }

    Ok(())
}

fn open(config: &Config) -> anyhow::Result<BundleTransmission> {
    let keys = keystore::load(config.node.role, &config.keys.dir)
        .with_context(|| format!("loading keys from {}", config.keys.dir.display()))?;
    Ok(BundleTransmission::open(config.node.clone(), keys)?)
}

fn parse_peer(text: &str) -> anyhow::Result<PeerIdentity> {
    PeerIdentity::parse(text).with_context(|| format!("invalid peer id {text:?}"))
}

/// Generate a key directory
fn generate_keys(role: Role, out: &Path, server: Option<&Path>) -> anyhow::Result<()> {
    let mut rng = rand_core::OsRng;
    let peer = match role {
        Role::Server => keystore::generate_server(out, &mut rng)?.identity.peer_id(),
        Role::Client => keystore::generate_client(out, &mut rng)?.identity.peer_id(),
    };
    println!("Generated {role} keys in {}", out.display());
    println!("Peer id: {peer}");

    match (role, server) {
        (Role::Client, Some(server)) => {
            keystore::provision_server_keys(server, out)?;
            println!("Provisioned server keys from {}", server.display());
        }
        (Role::Client, None) => {
            println!("Copy the server_*.pub files into {} before use", out.display());
        }
        (Role::Server, Some(_)) => anyhow::bail!("--server only applies to client keys"),
        (Role::Server, None) => {}
    }
    Ok(())
}

/// Bring the bundle files in `out` up to date: write bundles the directory
/// lacks and remove the ones they supersede
async fn generate_bundles(
    transmission: &BundleTransmission,
    peers: &[String],
    out: &Path,
) -> anyhow::Result<()> {
    let peers = if peers.is_empty() {
        transmission.known_peers()
    } else {
        peers.iter().map(|p| parse_peer(p)).collect::<anyhow::Result<_>>()?
    };
    std::fs::create_dir_all(out)?;

    let held = held_bundles(out)?;
    let exchange = transmission.bundles_for_transport(&peers, &held).await;

    for bundle in &exchange.bundles {
        let path = out.join(bundle.file_name());
        std::fs::write(&path, &bundle.bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        let kind = if bundle.retransmission { "resent" } else { "new" };
        println!(
            "{}: bundle {} ({kind}) -> {}",
            bundle.peer,
            bundle.counter,
            path.display()
        );
    }
    for wire_id in &exchange.to_delete {
        let path = out.join(format!("{wire_id}.{BUNDLE_EXTENSION}"));
        match std::fs::remove_file(&path) {
            Ok(()) => println!("Removed superseded {}", path.display()),
            Err(e) => tracing::warn!("Could not remove {}: {e}", path.display()),
        }
    }
    println!(
        "Wrote {} bundles, removed {}",
        exchange.bundles.len(),
        exchange.to_delete.len()
    );
    Ok(())
}

/// Wire ids of the bundle files in `dir`
fn held_bundles(dir: &Path) -> anyhow::Result<BTreeSet<String>> {
    let mut held = BTreeSet::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            held.insert(stem.to_owned());
        }
    }
    Ok(held)
}

/// Ingest bundle files, continuing past bad ones
async fn ingest_bundles(transmission: &BundleTransmission, files: &[PathBuf]) -> anyhow::Result<()> {
    for file in files {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        match transmission.ingest(&bytes).await {
            Ok(IngestOutcome::Processed {
                peer,
                counter,
                stored,
                acked,
                ..
            }) => {
                let acked = acked.map_or_else(|| "none".to_string(), |a| a.to_string());
                println!(
                    "{}: bundle {counter} from {peer}, {stored} new ADUs, acked {acked}",
                    file.display()
                );
            }
            Ok(IngestOutcome::Duplicate { peer, counter }) => {
                println!("{}: duplicate bundle {counter} from {peer}", file.display());
            }
            Ok(IngestOutcome::NotForUs) => println!("{}: not addressed to us", file.display()),
            Ok(IngestOutcome::UnknownPeer { peer }) => {
                println!("{}: unknown sender {peer}", file.display());
            }
            Err(e) if e.is_local() => tracing::warn!("Rejected {}: {e}", file.display()),
            Err(e) => return Err(e).with_context(|| format!("ingesting {}", file.display())),
        }
    }
    Ok(())
}

/// Show node and window status
fn show_status(transmission: &BundleTransmission, peer: &PeerIdentity) -> anyhow::Result<()> {
    println!("DDD Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Role: {}", transmission.role());
    println!("Local id: {}", transmission.local_id());
    println!();

    let window = transmission.window_state(peer)?;
    println!("Window for {peer}:");
    println!("  Start: {}", window.start);
    println!("  End: {}", window.end);
    println!("  In flight: {}/{}", window.in_flight(), window.capacity);
    println!("  Full: {}", window.is_full());

    Ok(())
}
