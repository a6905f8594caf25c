//! # Sandpiper Core
//!
//! Shared domain types for the Sandpiper file transfer daemon: error
//! kinds, the user model and its login filters, the credential store and
//! defender interfaces, and the virtual file system the protocol
//! front-ends operate on.

pub mod defender;
pub mod error;
pub mod store;
pub mod user;
pub mod vfs;

pub use defender::{Defender, HostEvent, MemoryDefender, MemoryDefenderConfig, NullDefender};
pub use error::{Error, Result};
pub use store::{MemoryUserStore, StoredUser, UserStore};
pub use user::{LoginMethod, Protocol, User, UserFilters, VALID_LOGIN_METHODS};
pub use vfs::{clean_virtual_path, DirEntry, LocalFs, OpenParams, StatVfs, Vfs};
