#![allow(clippy::doc_markdown)]

//! clubhouse-core - ledger-gated admission kernel
//!
//! This crate owns the state that decides who gets through the door: the
//! event session, the numbered tickets issued during it, the passphrases seen
//! on the ledger, and the set of tickets those passphrases approve.
//!
//! Nothing in here talks to the network. Ledger access, polling, and the HTTP
//! surface live in `clubhouse-daemon`; this crate only needs a durable
//! string key/value store ([`store::CounterStore`]).
//!
//! # Modules
//!
//! - [`challenge`]: Session identifiers and the deterministic challenge text
//! - [`config`]: `clubhouse.toml` parsing and validation
//! - [`engine`]: [`engine::AccessEngine`], the single serialization point for
//!   allocation, observation, and session reset
//! - [`reconcile`]: Order-independent matching of passphrases to tickets
//! - [`session`]: Session bootstrap and the ticket allocator
//! - [`store`]: Persistent counter store trait with in-memory and `SQLite`
//!   backends
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use clubhouse_core::engine::AccessEngine;
//! use clubhouse_core::store::MemoryCounterStore;
//!
//! let engine = AccessEngine::open(Arc::new(MemoryCounterStore::new())).unwrap();
//! let ticket = engine.allocate().unwrap();
//! assert_eq!(ticket.number, 1);
//!
//! // The authority submits the challenge text on-chain; the daemon observes it.
//! engine.observe(&ticket.challenge);
//! assert_eq!(engine.snapshot().approved, vec![1]);
//! ```

pub mod challenge;
pub mod config;
pub mod engine;
pub mod reconcile;
pub mod session;
pub mod store;
