//! Path translation between local and repository paths
//!
//! Local paths are the names presented to filesystem callers. They are
//! rooted at `\` and use `\` as separator (`\docs\report.pdf`). Repository
//! paths are the server-side URL paths below the document library
//! (`/remote.php/webdav/docs/report.pdf`), percent-encoded.
//!
//! All functions here are pure string operations. Inputs that cannot be
//! translated produce `None` rather than an error.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use super::errors::DomainError;

/// Separator used in local paths.
pub const LOCAL_SEPARATOR: char = '\\';

/// The local path of the repository root.
pub const LOCAL_ROOT: &str = "\\";

const REPOSITORY_SEPARATOR: char = '/';

/// Characters escaped inside one repository path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

/// Maps local paths to repository paths and back for one document library.
///
/// The translator only knows the document library path (the URL path of
/// the repository root without trailing slash). It is cheap to clone and
/// is shared by every component of one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTranslator {
    root: String,
}

impl PathTranslator {
    /// Creates a translator for the given document library path.
    ///
    /// Trailing slashes are dropped, so `/webdav/` and `/webdav` are the
    /// same library. An empty string means the server root.
    pub fn new(document_library_path: impl Into<String>) -> Self {
        let root = document_library_path.into();
        let root = root.trim_end_matches(REPOSITORY_SEPARATOR).to_string();
        Self { root }
    }

    /// Creates a translator from a repository base URL.
    pub fn from_url(base_url: &str) -> Result<Self, DomainError> {
        let url =
            url::Url::parse(base_url).map_err(|e| DomainError::InvalidUrl(e.to_string()))?;
        Ok(Self::new(url.path()))
    }

    /// The document library path (no trailing slash, may be empty).
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Repository path of the library root, never empty.
    pub fn repository_root(&self) -> String {
        if self.root.is_empty() {
            REPOSITORY_SEPARATOR.to_string()
        } else {
            self.root.clone()
        }
    }

    /// Converts a local path into its repository path.
    ///
    /// Each segment is percent-encoded; the result never ends in `/`
    /// unless it is the bare server root.
    pub fn local_to_repository(&self, local: &str) -> String {
        let mut repository = self.root.clone();
        for segment in local
            .split(LOCAL_SEPARATOR)
            .filter(|segment| !segment.is_empty())
        {
            repository.push(REPOSITORY_SEPARATOR);
            repository.extend(utf8_percent_encode(segment, SEGMENT));
        }
        if repository.is_empty() {
            repository.push(REPOSITORY_SEPARATOR);
        }
        repository
    }

    /// Converts a repository path into its local path.
    ///
    /// Returns `None` when the path lies outside the document library.
    pub fn repository_to_local(&self, repository: &str) -> Option<String> {
        let repository = normalize_repository(repository);
        let rest = self.strip_root(&repository)?;
        let mut local = String::new();
        for segment in rest
            .split(REPOSITORY_SEPARATOR)
            .filter(|segment| !segment.is_empty())
        {
            local.push(LOCAL_SEPARATOR);
            local.push_str(&percent_decode_str(segment).decode_utf8_lossy());
        }
        if local.is_empty() {
            local.push(LOCAL_SEPARATOR);
        }
        Some(local)
    }

    /// Extracts the normalized repository path from a remote `href`.
    ///
    /// `href` may be an absolute URL or an absolute path. Doubled slashes
    /// are collapsed and a trailing slash is dropped, except for `/`.
    pub fn href_to_repository(&self, href: &str) -> String {
        let path = match url::Url::parse(href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href.to_string(),
        };
        normalize_repository(&path)
    }

    /// Returns true if `repository` names the document library root.
    pub fn is_repository_root(&self, repository: &str) -> bool {
        let repository = normalize_repository(repository);
        repository.trim_end_matches(REPOSITORY_SEPARATOR) == self.root
    }

    /// Repository path of the parent of `repository`.
    ///
    /// Returns `None` for the library root and for paths outside it.
    pub fn parent_repository_path(&self, repository: &str) -> Option<String> {
        let repository = normalize_repository(repository);
        if self.is_repository_root(&repository) {
            return None;
        }
        self.strip_root(&repository)?;
        let index = repository.rfind(REPOSITORY_SEPARATOR)?;
        if index == 0 {
            return Some(REPOSITORY_SEPARATOR.to_string());
        }
        Some(repository[..index].to_string())
    }

    /// The display name of a repository item: its decoded last segment,
    /// or `\` for the library root.
    pub fn display_name(&self, repository: &str) -> String {
        if self.is_repository_root(repository) {
            return LOCAL_ROOT.to_string();
        }
        let repository = normalize_repository(repository);
        let segment = repository
            .rsplit(REPOSITORY_SEPARATOR)
            .next()
            .unwrap_or_default();
        percent_decode_str(segment).decode_utf8_lossy().into_owned()
    }

    fn strip_root<'a>(&self, repository: &'a str) -> Option<&'a str> {
        if self.root.is_empty() {
            return Some(repository);
        }
        let rest = repository.strip_prefix(self.root.as_str())?;
        if rest.is_empty() || rest.starts_with(REPOSITORY_SEPARATOR) {
            Some(rest)
        } else {
            None
        }
    }
}

fn normalize_repository(path: &str) -> String {
    let mut normalized = path.to_string();
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    if normalized.len() > 1 && normalized.ends_with(REPOSITORY_SEPARATOR) {
        normalized.pop();
    }
    normalized
}

// ============================================================================
// Local path helpers
// ============================================================================

/// Parent of a local path, or `None` for the root.
///
/// `\a\b` has parent `\a`, and `\a` has parent `\`.
pub fn local_parent(local: &str) -> Option<&str> {
    if local == LOCAL_ROOT || local.is_empty() {
        return None;
    }
    let trimmed = local.trim_end_matches(LOCAL_SEPARATOR);
    match trimmed.rfind(LOCAL_SEPARATOR) {
        Some(0) => Some(LOCAL_ROOT),
        Some(index) => Some(&trimmed[..index]),
        None => None,
    }
}

/// Final segment of a local path; `\` for the root.
pub fn local_name(local: &str) -> &str {
    if local == LOCAL_ROOT {
        return LOCAL_ROOT;
    }
    local
        .trim_end_matches(LOCAL_SEPARATOR)
        .rsplit(LOCAL_SEPARATOR)
        .next()
        .unwrap_or(local)
}

/// Appends one segment to a local directory path.
pub fn join_local(parent: &str, name: &str) -> String {
    if parent == LOCAL_ROOT || parent.is_empty() {
        format!("{}{}", LOCAL_SEPARATOR, name)
    } else {
        format!("{}{}{}", parent, LOCAL_SEPARATOR, name)
    }
}

/// True if `path` is strictly below `prefix`.
///
/// The match is boundary-safe: `\old\a` is below `\old`, while the
/// sibling `\oldXYZ` is not.
pub fn is_local_descendant(path: &str, prefix: &str) -> bool {
    if prefix == LOCAL_ROOT {
        return path != LOCAL_ROOT && path.starts_with(LOCAL_SEPARATOR);
    }
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path[prefix.len()..].starts_with(LOCAL_SEPARATOR)
}

/// Rewrites `path` from below `old_prefix` to below `new_prefix`.
///
/// `path` equal to `old_prefix` maps to `new_prefix`. Returns `None`
/// for paths outside `old_prefix`.
pub fn rebase_local(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    if !is_local_descendant(path, old_prefix) {
        return None;
    }
    let tail = if old_prefix == LOCAL_ROOT {
        &path[1..]
    } else {
        &path[old_prefix.len() + 1..]
    };
    Some(join_local(new_prefix, tail))
}
