// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod aggregator;
pub mod api;
pub mod backup;
pub mod bitcoin;
pub mod config;
pub mod errors;
pub mod rpc;
pub mod server;
pub mod stamper;
pub mod telemetry;
