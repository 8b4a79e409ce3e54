//! Blockchain node RPC seam.
//!
//! The stamper only ever talks to the node through [`NodeRpc`], so tests
//! drive the full anchoring state machine against an in-memory node. The
//! production implementation speaks bitcoind-style JSON-RPC over reqwest.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tidemark_proofs::Digest;

use crate::bitcoin::{OutPoint, Transaction};

/// Node errors the stamper retries with backoff, vs. ones it treats as a
/// policy verdict.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("malformed node response: {0}")]
    BadResponse(String),
}

impl RpcError {
    pub fn is_temporary(&self) -> bool {
        match self {
            // Connection resets, timeouts, a node mid-restart.
            RpcError::Transport(_) => true,
            // RPC_IN_WARMUP.
            RpcError::Node { code: -28, .. } => true,
            RpcError::Node { .. } | RpcError::BadResponse(_) => false,
        }
    }

    /// Mempool rejected the fee; retry the build at a higher feerate.
    pub fn wants_higher_fee(&self) -> bool {
        matches!(self, RpcError::Node { code: -26, .. })
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Debug, Clone)]
pub struct Unspent {
    pub outpoint: OutPoint,
    /// Value in satoshi.
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct TxStatus {
    pub confirmations: u64,
    pub block_hash: Option<Digest>,
}

#[derive(Debug, Clone)]
pub struct WalletTx {
    pub txid: Digest,
    pub raw: Vec<u8>,
    pub confirmations: i64,
}

#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn block_count(&self) -> Result<u64>;
    async fn block_height(&self, hash: &Digest) -> Result<u64>;
    /// Ordered txids of the block, as the chain orders them.
    async fn block_txids(&self, hash: &Digest) -> Result<Vec<Digest>>;
    /// Confirmed spendable wallet outputs.
    async fn list_spendable(&self) -> Result<Vec<Unspent>>;
    /// scriptPubKey of a fresh change address.
    async fn change_script(&self) -> Result<Vec<u8>>;
    async fn sign_transaction(&self, tx: &Transaction) -> Result<Transaction>;
    /// Submits to the mempool; returns the txid the node will report the
    /// transaction under.
    async fn broadcast(&self, tx: &Transaction) -> Result<Digest>;
    /// `None` for a transaction the node does not know.
    async fn tx_status(&self, txid: &Digest) -> Result<Option<TxStatus>>;
    /// Feerate estimate in sat/vB for the given confirmation target.
    async fn estimate_feerate(&self, target: u16) -> Result<u64>;
    /// Recent wallet transactions, for crash recovery.
    async fn recent_wallet_txs(&self) -> Result<Vec<WalletTx>>;
}

/// bitcoind JSON-RPC client. One calendar, one wallet: the configuration
/// documents that the wallet is for the stamper's exclusive use.
pub struct BitcoindClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl BitcoindClient {
    pub fn new(url: String, user: String, password: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url,
            user,
            password,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "tidemark",
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Node {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::BadResponse("missing result".into()))
    }
}

fn as_str(v: &Value, what: &str) -> Result<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| RpcError::BadResponse(format!("{} is not a string", what)))
}

fn parse_digest(hex_str: &str, what: &str) -> Result<Digest> {
    hex_str
        .parse()
        .map_err(|_| RpcError::BadResponse(format!("{} is not a 32-byte hex digest", what)))
}

fn btc_to_sat(amount: f64) -> u64 {
    (amount * 100_000_000.0).round() as u64
}

#[async_trait]
impl NodeRpc for BitcoindClient {
    async fn block_count(&self) -> Result<u64> {
        self.call("getblockcount", json!([]))
            .await?
            .as_u64()
            .ok_or_else(|| RpcError::BadResponse("getblockcount not a number".into()))
    }

    async fn block_height(&self, hash: &Digest) -> Result<u64> {
        let header = self
            .call("getblockheader", json!([hash.to_hex(), true]))
            .await?;
        header
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::BadResponse("blockheader without height".into()))
    }

    async fn block_txids(&self, hash: &Digest) -> Result<Vec<Digest>> {
        let block = self.call("getblock", json!([hash.to_hex(), 1])).await?;
        let txs = block
            .get("tx")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::BadResponse("block without tx list".into()))?;
        txs.iter()
            .map(|t| parse_digest(&as_str(t, "txid")?, "txid"))
            .collect()
    }

    async fn list_spendable(&self) -> Result<Vec<Unspent>> {
        let unspent = self.call("listunspent", json!([1])).await?;
        let entries = unspent
            .as_array()
            .ok_or_else(|| RpcError::BadResponse("listunspent not an array".into()))?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry
                .get("spendable")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }
            let txid = parse_digest(&as_str(&entry["txid"], "unspent txid")?, "unspent txid")?;
            let vout = entry
                .get("vout")
                .and_then(Value::as_u64)
                .ok_or_else(|| RpcError::BadResponse("unspent without vout".into()))?
                as u32;
            let amount = entry
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| RpcError::BadResponse("unspent without amount".into()))?;
            out.push(Unspent {
                outpoint: OutPoint { txid, vout },
                value: btc_to_sat(amount),
            });
        }
        Ok(out)
    }

    async fn change_script(&self) -> Result<Vec<u8>> {
        let addr = self.call("getrawchangeaddress", json!([])).await?;
        let info = self
            .call("getaddressinfo", json!([as_str(&addr, "change address")?]))
            .await?;
        let script_hex = info
            .get("scriptPubKey")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::BadResponse("addressinfo without scriptPubKey".into()))?;
        hex::decode(script_hex).map_err(|e| RpcError::BadResponse(e.to_string()))
    }

    async fn sign_transaction(&self, tx: &Transaction) -> Result<Transaction> {
        let result = self
            .call(
                "signrawtransactionwithwallet",
                json!([hex::encode(tx.serialize())]),
            )
            .await?;
        if !result
            .get("complete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(RpcError::BadResponse("wallet could not sign".into()));
        }
        let signed_hex = result
            .get("hex")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::BadResponse("sign result without hex".into()))?;
        let bytes = hex::decode(signed_hex).map_err(|e| RpcError::BadResponse(e.to_string()))?;
        Transaction::deserialize(&bytes).map_err(|e| RpcError::BadResponse(e.to_string()))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Digest> {
        let txid = self
            .call("sendrawtransaction", json!([hex::encode(tx.serialize())]))
            .await?;
        parse_digest(&as_str(&txid, "sent txid")?, "sent txid")
    }

    async fn tx_status(&self, txid: &Digest) -> Result<Option<TxStatus>> {
        match self
            .call("getrawtransaction", json!([txid.to_hex(), true]))
            .await
        {
            Ok(info) => {
                let confirmations = info
                    .get("confirmations")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let block_hash = match info.get("blockhash").and_then(Value::as_str) {
                    Some(h) => Some(parse_digest(h, "blockhash")?),
                    None => None,
                };
                Ok(Some(TxStatus {
                    confirmations,
                    block_hash,
                }))
            }
            // RPC_INVALID_ADDRESS_OR_KEY: no such mempool or chain tx.
            Err(RpcError::Node { code: -5, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn estimate_feerate(&self, target: u16) -> Result<u64> {
        let estimate = self
            .call("estimatesmartfee", json!([target]))
            .await?;
        match estimate.get("feerate").and_then(Value::as_f64) {
            // BTC/kvB to sat/vB.
            Some(btc_per_kvb) => Ok((btc_to_sat(btc_per_kvb) / 1000).max(1)),
            // Estimator has no data yet; caller applies its floor.
            None => Ok(0),
        }
    }

    async fn recent_wallet_txs(&self) -> Result<Vec<WalletTx>> {
        let listed = self
            .call("listtransactions", json!(["*", 100]))
            .await?;
        let entries = listed
            .as_array()
            .ok_or_else(|| RpcError::BadResponse("listtransactions not an array".into()))?;

        let mut out = Vec::new();
        for entry in entries {
            let Some(txid_hex) = entry.get("txid").and_then(Value::as_str) else {
                continue;
            };
            let txid = parse_digest(txid_hex, "wallet txid")?;
            if out.iter().any(|t: &WalletTx| t.txid == txid) {
                continue;
            }
            let confirmations = entry
                .get("confirmations")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let raw_hex = self
                .call("getrawtransaction", json!([txid_hex]))
                .await?;
            let raw = hex::decode(as_str(&raw_hex, "raw tx")?)
                .map_err(|e| RpcError::BadResponse(e.to_string()))?;
            out.push(WalletTx {
                txid,
                raw,
                confirmations,
            });
        }
        Ok(out)
    }
}
