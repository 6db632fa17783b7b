//! Shared plumbing for the packer, verifier and stager binaries: config
//! loading, logging setup, the error taxonomy, the cooperative shutdown
//! flag, the status file writer, the BFID/archive-URL format and a small
//! WebDAV client.

pub mod bfid;
pub mod config;
pub mod error;
pub mod logging;
pub mod rootcheck;
pub mod shutdown;
pub mod status;
pub mod webdav;

pub use error::{MainError, Taxonomy};
pub use shutdown::ShutdownSignal;
