//! NBD server exposing named virtual block devices, durably backed by an
//! S3-compatible object store.
//!
//! Three subsystems carry the design: the block-mapped [`storage`] engine,
//! the per-export exclusive [`lease`] manager built on S3 conditional
//! writes, and the [`nbd`] connection/protocol state machine that binds the
//! two together per session.

pub mod config;
pub mod lease;
pub mod nbd;
pub mod object_client;
pub mod server;
pub mod storage;

pub use config::Config;
pub use lease::{LeaseError, LeaseHandle, LeaseManager};
pub use object_client::{ObjectClient, ObjectError, S3ObjectClient};
pub use storage::{BlockEngine, StorageError};
