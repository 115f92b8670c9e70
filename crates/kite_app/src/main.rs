mod config;
mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use kite_agents::{
    MobileProducerAgent, PrefixPair, ProducerEvent, RendezvousAgent, probe,
};
use kite_network::security::decode_public_key;
use kite_network::transport::start_forwarder;
use kite_network::{KeyChain, MemoryFabric, Name, TrustPolicy, WsFace};

use crate::config::KiteConfig;

#[derive(Parser)]
#[command(name = "kite", version, about = "Producer mobility over a named-packet fabric")]
struct Cli {
    /// Config file (defaults to ~/.kite/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a forwarder that agents connect to.
    Forwarder {
        /// Listen address, overriding the configured one.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Run a mobile producer.
    Producer {
        /// Rendezvous prefix of the active pair (needs --suffix).
        #[arg(long, requires = "suffix")]
        rendezvous: Option<Name>,
        /// Producer suffix of the active pair (needs --rendezvous).
        #[arg(long, requires = "rendezvous")]
        suffix: Option<Name>,
        /// Send a single update request and exit.
        #[arg(long)]
        once: bool,
    },
    /// Run a rendezvous service.
    Rendezvous {
        /// Prefix to listen on, overriding the configured ones.
        #[arg(long)]
        prefix: Option<Name>,
        /// Trust policy file, overriding the configured one.
        #[arg(long)]
        trust_policy: Option<PathBuf>,
    },
    /// Create (or show) a signing identity in the key chain.
    Keygen { identity: Name },
    /// Check that a producer prefix answers with a signed echo.
    Probe {
        name: Name,
        #[arg(long, default_value_t = 4000)]
        lifetime_ms: u64,
        /// Hex public key the echo must be signed with.
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KiteConfig::load(cli.config.as_deref())?;
    let _log_guard = logging::init_logging(&config.logging, &config.logs_dir()?)?;

    match cli.command {
        Command::Forwarder { listen } => run_forwarder(&config, listen).await,
        Command::Producer {
            rendezvous,
            suffix,
            once,
        } => {
            let pairs = match (rendezvous, suffix) {
                (Some(rv), Some(suffix)) => vec![PrefixPair::new(rv, suffix)],
                _ => Vec::new(),
            };
            run_producer(&config, pairs, once).await
        }
        Command::Rendezvous {
            prefix,
            trust_policy,
        } => run_rendezvous(&config, prefix, trust_policy).await,
        Command::Keygen { identity } => keygen(&config, identity),
        Command::Probe {
            name,
            lifetime_ms,
            key,
        } => run_probe(&config, name, Duration::from_millis(lifetime_ms), key).await,
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn run_forwarder(config: &KiteConfig, listen: Option<SocketAddr>) -> Result<()> {
    let addr = match listen {
        Some(addr) => addr,
        None => config
            .network
            .forwarder_addr
            .parse()
            .with_context(|| format!("Invalid forwarder address: {}", config.network.forwarder_addr))?,
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    start_forwarder(addr, MemoryFabric::new(), shutdown_rx).await?;
    Ok(())
}

async fn connect(config: &KiteConfig) -> Result<WsFace> {
    WsFace::connect(&config.network.forwarder_addr)
        .await
        .with_context(|| format!("Cannot reach forwarder at {}", config.network.forwarder_addr))
}

async fn run_producer(config: &KiteConfig, pairs: Vec<PrefixPair>, once: bool) -> Result<()> {
    let mut options = config
        .producer
        .to_options(pairs)
        .context("Invalid producer configuration")?;
    if once {
        options = options.with_auto_renew(false);
    }

    let prefix = options.producer_prefix();
    let keychain = KeyChain::load_or_create(&config.keychain_path()?, std::slice::from_ref(&prefix))?;
    let face = connect(config).await?;

    let mut agent = MobileProducerAgent::new(Arc::new(options), Arc::new(face), Arc::new(keychain));
    agent
        .after_receive()
        .connect(|name: &Name| info!("Serving {name}"));
    agent.start().await?;

    if !once {
        agent.run_until(shutdown_signal()).await;
        return Ok(());
    }

    agent.send_update_request()?;
    let result = loop {
        match agent.step().await {
            Some(ProducerEvent::Acknowledged { announcement }) => {
                println!(
                    "{} announced for {}ms",
                    announcement.announced_name,
                    announcement.expiration.as_millis()
                );
                break Ok(());
            }
            Some(ProducerEvent::Nacked { reason }) => break Err(anyhow!("Update nacked: {reason}")),
            Some(ProducerEvent::TimedOut { name }) => break Err(anyhow!("Update {name} timed out")),
            Some(ProducerEvent::UpdateFailed { reason }) => break Err(anyhow!("Update failed: {reason}")),
            Some(_) => continue,
            None => break Err(anyhow!("Producer stopped before the update resolved")),
        }
    };
    agent.stop();
    result
}

async fn run_rendezvous(
    config: &KiteConfig,
    prefix: Option<Name>,
    trust_policy: Option<PathBuf>,
) -> Result<()> {
    let options = config
        .rendezvous
        .to_options(prefix)
        .context("Invalid rendezvous configuration")?;

    let Some(policy_path) = trust_policy.or_else(|| config.rendezvous.trust_policy.clone()) else {
        bail!("No trust policy configured; set rendezvous.trust_policy or pass --trust-policy");
    };
    let policy = TrustPolicy::load(&policy_path)?;
    if policy.rule_count() == 0 {
        warn!(
            "Trust policy {} has no rules; every update request will be rejected",
            policy_path.display()
        );
    }
    info!(
        "Loaded trust policy {} ({} anchors, {} rules)",
        policy_path.display(),
        policy.anchor_count(),
        policy.rule_count()
    );

    let keychain = KeyChain::load_or_create(
        &config.keychain_path()?,
        std::slice::from_ref(options.active_prefix()),
    )?;
    let face = connect(config).await?;

    let mut agent = RendezvousAgent::new(
        Arc::new(options),
        Arc::new(face),
        Arc::new(keychain),
        Arc::new(policy),
    );
    agent.start().await?;
    agent.run_until(shutdown_signal()).await;

    let (accepted, rejected) = agent.counters();
    info!("Rendezvous service exiting: {accepted} accepted, {rejected} rejected");
    Ok(())
}

fn keygen(config: &KiteConfig, identity: Name) -> Result<()> {
    let path = config.keychain_path()?;
    let keychain = KeyChain::load_or_create(&path, std::slice::from_ref(&identity))?;
    let public_key = keychain
        .public_key_hex(&identity)
        .ok_or_else(|| anyhow!("Identity {identity} missing from {}", path.display()))?;

    println!("identity   = \"{identity}\"");
    println!("public_key = \"{public_key}\"");
    if let Some(key_id) = keychain.key_id(&identity) {
        println!("# key id {key_id}, stored in {}", path.display());
    }
    Ok(())
}

async fn run_probe(
    config: &KiteConfig,
    name: Name,
    lifetime: Duration,
    key: Option<String>,
) -> Result<()> {
    let key = key
        .map(|hex| decode_public_key(&hex).map_err(|e| anyhow!("Invalid public key: {e}")))
        .transpose()?;
    let face = connect(config).await?;

    let report = probe(&face, name, lifetime, key.as_ref()).await?;
    let signer = report
        .signer
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unsigned".into());
    println!(
        "{} answered in {}ms (signed by {signer})",
        report.name,
        report.round_trip.as_millis()
    );
    Ok(())
}
