// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::{Deserialize, Serialize};

/// `GET /tip` — current calendar head.
#[derive(Serialize, Deserialize, Debug)]
pub struct TipResponse {
    /// Latest round commitment, hex.
    pub commitment: String,
    /// Serialized path from the commitment to its pending attestation, hex.
    pub path: String,
}

/// `GET /backup/{offset}` query string.
#[derive(Deserialize, Debug)]
pub struct BackupQuery {
    #[serde(default)]
    pub token: String,
}
