// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidemark_calendar::CalendarStore;
use tidemark_node::aggregator::Aggregator;
use tidemark_node::config::{CalendarConfig, Chain};
use tidemark_node::rpc::{BitcoindClient, NodeRpc};
use tidemark_node::server::{build_router, AppState, ServerIdentity};
use tidemark_node::stamper::Stamper;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "tidemark-node")]
#[command(about = "Calendar server for hash-based timestamping", long_about = None)]
struct Args {
    /// Calendar base directory (journal, index, uri, hmac-key).
    #[arg(long, default_value = "./calendar")]
    base_dir: PathBuf,

    /// Chain to anchor into.
    #[arg(long, value_enum, default_value_t = Chain::Regtest)]
    chain: Chain,

    /// HTTP bind address.
    #[arg(long, default_value = "127.0.0.1:14788")]
    bind: std::net::SocketAddr,

    /// Aggregation round length in seconds.
    #[arg(long, default_value_t = 1.0)]
    round_interval: f64,

    /// Minimum seconds between anchor transactions.
    #[arg(long, default_value_t = 3600)]
    anchor_interval: u64,

    /// Minimum relay feerate in sat/vB.
    #[arg(long, default_value_t = 1)]
    min_relay_feerate: u64,

    /// Absolute fee cap per anchor transaction, in satoshi.
    #[arg(long, default_value_t = 50_000)]
    max_fee: u64,

    /// Confirmation target (blocks) for fee estimation.
    #[arg(long, default_value_t = 6)]
    confirmation_target: u16,

    /// Confirmations required before attestations are published.
    #[arg(long, default_value_t = 6)]
    min_confirmations: u64,

    /// Seconds an anchor may sit unconfirmed before a fee bump.
    #[arg(long, default_value_t = 1800)]
    replace_after: u64,

    /// Aggregation buffer capacity in digests.
    #[arg(long, default_value_t = 65_536)]
    buffer_cap: usize,

    /// Node RPC endpoint.
    #[arg(long, default_value = "http://127.0.0.1:18443")]
    rpc_url: String,

    #[arg(long, default_value = "tidemark")]
    rpc_user: String,

    #[arg(long, default_value = "")]
    rpc_password: String,
}

impl Args {
    fn into_config(self) -> CalendarConfig {
        CalendarConfig {
            chain: self.chain,
            base_dir: self.base_dir,
            bind_addr: self.bind,
            round_interval: Duration::from_secs_f64(self.round_interval),
            anchor_interval: Duration::from_secs(self.anchor_interval),
            min_relay_feerate: self.min_relay_feerate,
            max_fee: self.max_fee,
            confirmation_target: self.confirmation_target,
            min_confirmations: self.min_confirmations,
            replace_after: Duration::from_secs(self.replace_after),
            buffer_cap: self.buffer_cap,
            rpc_url: self.rpc_url,
            rpc_user: self.rpc_user,
            rpc_password: self.rpc_password,
            ..CalendarConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tidemark_node::telemetry::init_telemetry();

    let cfg = Args::parse().into_config();
    tracing::info!(chain = %cfg.chain, dir = %cfg.base_dir.display(), "starting tidemark node");

    std::fs::create_dir_all(&cfg.base_dir)
        .with_context(|| format!("cannot create {}", cfg.base_dir.display()))?;

    // The public URI goes into every pending attestation; refusing to
    // start without it beats minting proofs that point nowhere.
    let uri = std::fs::read_to_string(cfg.base_dir.join("uri"))
        .map(|s| s.trim().to_string())
        .with_context(|| {
            format!(
                "calendar uri not set; create {} with the public URI",
                cfg.base_dir.join("uri").display()
            )
        })?;

    let hmac_key_path = cfg.base_dir.join("hmac-key");
    let hmac_key = match std::fs::read(&hmac_key_path) {
        Ok(key) => key,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            std::fs::write(&hmac_key_path, &key)
                .with_context(|| format!("cannot write {}", hmac_key_path.display()))?;
            tracing::info!(path = %hmac_key_path.display(), "generated new hmac key");
            key
        }
        Err(e) => return Err(e).context("cannot read hmac-key"),
    };

    let donation_addr = std::fs::read_to_string(cfg.base_dir.join("donation_addr"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let store = Arc::new(
        CalendarStore::open(&cfg.base_dir).context("calendar store failed to open")?,
    );
    tracing::info!(
        commitments = store.stats().commitments,
        journal_bytes = store.stats().journal_bytes,
        "calendar store open"
    );

    let rpc: Arc<dyn NodeRpc> = Arc::new(
        BitcoindClient::new(
            cfg.rpc_url.clone(),
            cfg.rpc_user.clone(),
            cfg.rpc_password.clone(),
            Duration::from_secs(30),
        )
        .context("node rpc client")?,
    );
    let height = rpc
        .block_count()
        .await
        .context("blockchain node unreachable at startup")?;
    tracing::info!(height, "connected to node");

    let aggregator = Aggregator::spawn(
        store.clone(),
        uri.clone(),
        cfg.round_interval,
        cfg.buffer_cap,
    );

    let mut stamper = Stamper::new(store.clone(), rpc, cfg.clone());
    stamper
        .recover()
        .await
        .context("stamper crash recovery failed")?;
    tokio::spawn(stamper.run());

    let state = AppState {
        store,
        aggregator,
        identity: ServerIdentity {
            uri,
            donation_addr,
            chain: cfg.chain.to_string(),
        },
        hmac_key: Arc::new(hmac_key),
    };

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("http server failed")?;

    Ok(())
}
