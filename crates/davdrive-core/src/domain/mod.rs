//! Domain types and business rules
//!
//! This module contains the pure (I/O free) parts of DavDrive:
//! - Path translation between local and repository paths
//! - Server dialect handling (directory classification)
//! - Domain-specific error types

pub mod dialect;
pub mod errors;
pub mod paths;

pub use dialect::ServerDialect;
pub use errors::DomainError;
pub use paths::{
    is_local_descendant, join_local, local_name, local_parent, rebase_local, PathTranslator,
    LOCAL_ROOT, LOCAL_SEPARATOR,
};
