use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which chain the calendar anchors into. Fixed for the lifetime of a
/// calendar directory; mixing chains in one journal is never valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Chain {
    Mainnet,
    Testnet,
    Regtest,
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Mainnet => f.write_str("mainnet"),
            Chain::Testnet => f.write_str("testnet"),
            Chain::Regtest => f.write_str("regtest"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CalendarConfig {
    pub chain: Chain,
    pub base_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// How long one aggregation round stays open.
    pub round_interval: Duration,
    /// Floor on the time between anchor transactions.
    pub anchor_interval: Duration,
    /// Stamper wakeup cadence for polling the node.
    pub stamper_poll_interval: Duration,
    /// Minimum feerate in sat/vB; also the replacement bump unit.
    pub min_relay_feerate: u64,
    /// Absolute cap on a single anchor transaction fee, in satoshi.
    pub max_fee: u64,
    /// Confirmation target handed to the node's fee estimator.
    pub confirmation_target: u16,
    /// Confirmations required before attestations are published.
    pub min_confirmations: u64,
    /// How long an anchor may sit unconfirmed before a fee bump.
    pub replace_after: Duration,
    /// Aggregator buffer capacity; submissions past this get 503.
    pub buffer_cap: usize,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            chain: Chain::Regtest,
            base_dir: PathBuf::from("./calendar"),
            bind_addr: "127.0.0.1:14788".parse().unwrap(),
            round_interval: Duration::from_secs(1),
            anchor_interval: Duration::from_secs(3600),
            stamper_poll_interval: Duration::from_secs(30),
            min_relay_feerate: 1,
            max_fee: 50_000,
            confirmation_target: 6,
            min_confirmations: 6,
            replace_after: Duration::from_secs(1800),
            buffer_cap: 65_536,
            rpc_url: "http://127.0.0.1:18443".into(),
            rpc_user: "tidemark".into(),
            rpc_password: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CalendarConfig::default();
        assert_eq!(cfg.round_interval, Duration::from_secs(1));
        assert!(cfg.anchor_interval >= Duration::from_secs(3600));
        assert!(cfg.bind_addr.ip().is_loopback());
        assert!(cfg.min_relay_feerate > 0);
    }
}
