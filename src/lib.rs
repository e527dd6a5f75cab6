//! rust-sync
//!
//! Per-repository pull engine for a block-synchronized file cluster. The
//! puller reconciles a local directory tree against the cluster-wide global
//! file list by copying blocks it already has and fetching the rest from
//! peers, assembling files in hidden temporaries and renaming them into
//! place after hash verification.
//!
//! The surrounding system (scanner, wire protocol, authoritative model) is
//! consumed through the [`model::Model`] and [`versioner::Versioner`]
//! capabilities.

pub mod buffers;
pub mod config;
pub mod logging;
pub mod model;
pub mod pull;
pub mod versioner;
