//! perfstore-core: host-side datastore for profiling telemetry
//!
//! Sits between one profiling front end and any number of connected device
//! agents. Requests are routed to the live agent for a session's device,
//! recent reads are cached, background pollers pull telemetry into SQLite,
//! and history stays queryable after a device goes away.
//!
//! # Architecture
//!
//! ```text
//! front end → DataStore → {Cpu,Memory,Event,Profiler}Service → Backing tables (SQLite)
//!                 ↓                    ↑
//!          ClientRegistry        PollRunner ← FetchExecutor
//!                 ↓                    ↑
//!           device agents  ────────────┘
//! ```
//!
//! # Modules
//!
//! - `client`: traits for talking to a device agent, one per domain
//! - `registry`: device → live clients
//! - `storage`: namespaces, shared connections, and the backing tables
//! - `poller`: pollers and the cooperative runner that drives them
//! - `executor`: where runners are scheduled
//! - `service`: per-domain request handling and response caching
//! - `datastore`: owns the services and handles connect/disconnect
//! - `config`: configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod datastore;
pub mod error;
pub mod executor;
pub mod logging;
pub mod poller;
pub mod registry;
pub mod service;
pub mod storage;
pub mod types;

pub use datastore::DataStore;
pub use error::{Error, Result};
