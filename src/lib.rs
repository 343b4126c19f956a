//! kube-inventory - mirrors Kubernetes inventory into a local store
//!
//! Remote objects are collected by full listings and watch streams, mapped
//! into an in-memory entity graph, and reconciled against the persisted
//! store in passes.
//!
//! # Architecture
//!
//! - A full refresh lists every watched kind and reconciles in full scope:
//!   whatever the store holds for an enumerated kind but the listing lacks
//!   is archived (or deleted, for child kinds).
//! - One watch worker per kind pushes notices into a shared buffer; a
//!   coordinator drains it on an interval, deduplicates, and reconciles the
//!   batch in targeted scope.
//! - A pass moves through BUILD, RESOLVE, DIFF and APPLY. References by
//!   secondary key are lazy until RESOLVE, so parse order never matters.
//!
//! # Modules
//!
//! - [`kind`] - resource and entity kinds
//! - [`collector`] - listing and watching the API server
//! - [`buffer`] - notice buffer and deduplication
//! - [`parser`] - raw objects to graph nodes
//! - [`graph`] - entity graph and lazy references
//! - [`persister`] - reconciliation passes and apply strategies
//! - [`store`] - persisted entity rows
//! - [`refresh`] - full and targeted refreshes
//! - [`supervisor`] - watch workers and coordinator
//! - [`config`] - configuration file
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod buffer;
pub mod collector;
pub mod config;
pub mod error;
pub mod graph;
pub mod kind;
pub mod parser;
pub mod persister;
pub mod refresh;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod tags;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
