//! WebDAV server dialects
//!
//! Different servers signal "this resource is a collection" in different
//! ways. The dialect is selected by configuration and decides how remote
//! items are classified as files or directories.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// The flavour of WebDAV server the repository talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerDialect {
    /// Generic WebDAV: directories are inferred from missing entity metadata.
    #[default]
    WebDav,
    /// AOS document server: directories carry an explicit collection flag.
    Aos,
}

impl ServerDialect {
    /// Classifies a remote resource as a directory.
    ///
    /// - `Aos` trusts the explicit collection flag.
    /// - `WebDav` treats a resource as a directory when it has no content
    ///   length at all, or when it has neither an entity tag nor any content.
    pub fn is_directory(
        &self,
        is_collection: bool,
        etag: Option<&str>,
        content_length: Option<u64>,
    ) -> bool {
        match self {
            ServerDialect::Aos => is_collection,
            ServerDialect::WebDav => match content_length {
                None => true,
                Some(0) => etag.is_none(),
                Some(_) => false,
            },
        }
    }

    /// Whether a move onto an existing file may delete the target first.
    ///
    /// Only the AOS server refuses overwriting moves, so replacement is
    /// emulated there with a delete followed by the move.
    pub fn emulates_replace(&self) -> bool {
        matches!(self, ServerDialect::Aos)
    }
}

impl fmt::Display for ServerDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerDialect::WebDav => "webdav",
            ServerDialect::Aos => "aos",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ServerDialect {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webdav" | "0" => Ok(ServerDialect::WebDav),
            "aos" | "1" => Ok(ServerDialect::Aos),
            other => Err(DomainError::UnknownDialect(other.to_string())),
        }
    }
}
