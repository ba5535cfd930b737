//! DavDrive Core - Domain types, configuration and ports
//!
//! This crate contains the pieces of DavDrive that do not depend on a
//! filesystem framework:
//! - **Configuration** - `Config` loaded from YAML and threaded explicitly
//!   through the driver
//! - **Domain** - `PathTranslator`, `ServerDialect`, `DomainError`
//! - **Port definitions** - `IRemoteRepository` for the WebDAV wire client and
//!   `IActionObserver` for per-operation events
//! - **Logging** - `tracing` subscriber initialisation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module is pure string and value logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.

pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
