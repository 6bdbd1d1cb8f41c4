// Suppress pedantic doc-formatting lints crate-wide. JSON-RPC method names
// (eth_getLogs, eth_blockNumber) appear throughout the ledger docs.
#![allow(clippy::doc_markdown)]

//! clubhouse-daemon - ledger watcher and operator API
//!
//! This library wires [`clubhouse_core::engine::AccessEngine`] to an
//! Ethereum-style ledger. It polls the chain head, replays and follows the
//! `GrantAdmission` event log of one contract, and feeds every decoded
//! passphrase into the engine.
//!
//! # Runtime Requirements
//!
//! The API handlers move store writes onto the blocking pool with
//! `tokio::task::spawn_blocking`, so a multi-threaded runtime is expected.
//!
//! # Modules
//!
//! - [`api`]: Operator HTTP API (status, allocation, reset, metrics)
//! - [`head_monitor`]: Chain head polling and freshness tracking
//! - [`ingest`]: Historical replay and live subscription of grant events
//! - [`ledger`]: Ledger client trait, JSON-RPC and in-memory backends, and
//!   event payload decoding
//! - [`metrics`]: Prometheus metrics
//! - [`pipeline`]: Task wiring between the monitor, ingestor, and engine
//! - [`state`]: Shared daemon state

pub mod api;
pub mod head_monitor;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod state;
