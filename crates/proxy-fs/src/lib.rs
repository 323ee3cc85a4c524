//! Sandboxed filesystem service for the ws-proxy control channel.
//!
//! Every client-supplied path is resolved through [`SandboxRoot`] before it
//! touches the filesystem; nothing outside the configured root is readable
//! or writable through this crate.

mod archive;
mod error;
mod sandbox;
mod service;

pub use error::FsError;
pub use sandbox::SandboxRoot;
pub use service::{DirEntryInfo, FsService, StatInfo};
