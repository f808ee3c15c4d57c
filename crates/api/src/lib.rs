//! pvedash API layer
//!
//! Auth-aware HTTP client for the Proxmox VE REST API, the cluster
//! snapshot aggregator, background guest enrichment and storage
//! deduplication.

pub mod client;
pub mod cluster;
pub mod enrich;
pub mod guest;
pub mod storage;
pub mod vnc;

mod value;

pub use client::{Client, ConnectionOptions};
pub use cluster::{Aggregator, BuildOutcome, SnapshotCallback};
pub use guest::GuestAction;
pub use enrich::Enricher;
pub use storage::StorageDedup;
pub use vnc::VncTicket;
