//! Confinement of server-supplied locators to the agent root.
//!
//! Every filesystem path the agent touches on behalf of the server comes out
//! of [`PathResolver::resolve`]. Two independent checks are applied:
//!
//! 1. the decoded locator is rejected outright if it contains `..` anywhere;
//! 2. the joined path is canonicalized and must sit strictly below the
//!    canonical root, compared with a trailing separator so that a sibling
//!    such as `/data/agent-evil` never passes for `/data/agent`.
//!
//! The first check is cheap and obvious. The second is authoritative and
//! also catches symlinks that lead out of the root.
//!
//! A [`ResolvedPath`] carries two paths: the fully canonical one, and the
//! entry itself (canonical parent plus the final name as given). Writes go
//! through the canonical path; removal unlinks the entry, so deleting an
//! in-root symlink removes the link and not what it points to.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Prefix the server puts in front of object store locators.
pub const DOWNLOADS_PREFIX: &str = "/downloads/";

/// Errors produced while resolving a locator.
#[derive(Debug, Error)]
pub enum PathError {
    /// The locator tries to leave the root, or cannot be proven not to.
    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    /// Nothing is left of the locator once prefixes and separators are removed.
    #[error("locator does not name a file: {0:?}")]
    Empty(String),

    /// Percent-decoding produced bytes that are not UTF-8.
    #[error("locator is not valid UTF-8 once decoded: {0}")]
    InvalidEncoding(String),

    /// IO error while inspecting the destination.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An absolute path known to be strictly inside the agent root.
///
/// Only [`PathResolver`] constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    path: PathBuf,
    entry: PathBuf,
    relative: PathBuf,
}

impl ResolvedPath {
    /// The absolute, canonical path.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The directory entry the locator names, with its final component not
    /// followed. Differs from [`as_path`](Self::as_path) only for symlinks.
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// The cleaned locator the path was built from, relative to root.
    pub fn relative(&self) -> &Path {
        &self.relative
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Resolves locators against a single canonical root directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver for `root`. The directory must already exist.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root is not a directory: {}", root.display()),
            ));
        }
        Ok(Self { root })
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Turn a server locator into a confined absolute path.
    pub fn resolve(&self, locator: &str) -> Result<ResolvedPath, PathError> {
        let stripped = locator.strip_prefix(DOWNLOADS_PREFIX).unwrap_or(locator);

        let decoded = percent_decode_str(stripped)
            .decode_utf8()
            .map_err(|_| PathError::InvalidEncoding(locator.to_string()))?;

        let cleaned = decoded.trim_start_matches(|c| c == '/' || c == '\\');

        // Fail closed: no attempt is made to clean up suspicious input.
        if cleaned.contains("..") || cleaned.contains('\0') {
            return Err(PathError::PathTraversal(locator.to_string()));
        }
        if cleaned.is_empty() {
            return Err(PathError::Empty(locator.to_string()));
        }

        let relative = Path::new(cleaned);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(PathError::PathTraversal(locator.to_string()));
        }

        let traversal = |e: PathError| match e {
            PathError::PathTraversal(_) => PathError::PathTraversal(locator.to_string()),
            other => other,
        };

        let joined = self.root.join(relative);
        let canonical = canonicalize_lenient(&joined).map_err(traversal)?;

        if !is_descendant(&self.root, &canonical) {
            tracing::warn!(
                locator,
                resolved = %canonical.display(),
                root = %self.root.display(),
                "Locator resolves outside of root"
            );
            return Err(PathError::PathTraversal(locator.to_string()));
        }

        // The entry is checked on its own: a link whose parent lies outside
        // root can still point back in.
        let entry = match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) => {
                canonicalize_lenient(parent).map_err(traversal)?.join(name)
            }
            _ => return Err(PathError::PathTraversal(locator.to_string())),
        };
        if !is_descendant(&self.root, &entry) {
            tracing::warn!(
                locator,
                entry = %entry.display(),
                root = %self.root.display(),
                "Locator entry lies outside of root"
            );
            return Err(PathError::PathTraversal(locator.to_string()));
        }

        Ok(ResolvedPath {
            path: canonical,
            entry,
            relative: relative.to_path_buf(),
        })
    }
}

/// Extract the path part of a download locator.
///
/// Absolute `http(s)` URLs lose their scheme and authority; query strings and
/// fragments are dropped from any locator. The path is returned verbatim
/// (still percent-encoded, dot segments untouched) so that
/// [`PathResolver::resolve`] sees exactly what the server sent.
pub fn locator_path(locator: &str) -> &str {
    let without_origin = ["http://", "https://"]
        .iter()
        .find_map(|scheme| {
            let rest = strip_prefix_ignore_case(locator, scheme)?;
            Some(rest.find('/').map(|i| &rest[i..]).unwrap_or(""))
        })
        .unwrap_or(locator);

    match without_origin.find(|c| c == '?' || c == '#') {
        Some(i) => &without_origin[..i],
        None => without_origin,
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Check that `candidate` lies strictly below `root`.
///
/// Both paths must already be canonical. The comparison is a byte prefix
/// match against `root` plus a trailing separator.
pub fn is_descendant(root: &Path, candidate: &Path) -> bool {
    let root_bytes = root.as_os_str().as_encoded_bytes();
    let candidate_bytes = candidate.as_os_str().as_encoded_bytes();

    let mut prefix = root_bytes.to_vec();
    if !root_bytes.ends_with(MAIN_SEPARATOR.to_string().as_bytes()) {
        prefix.extend_from_slice(MAIN_SEPARATOR.to_string().as_bytes());
    }

    candidate_bytes.len() > prefix.len() && candidate_bytes.starts_with(&prefix)
}

/// Canonicalize a path whose last components may not exist yet.
///
/// The deepest existing ancestor is canonicalized and the missing components
/// are appended again. A dangling symlink counts as existing and makes the
/// whole path unresolvable.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf, PathError> {
    let mut existing = path;
    let mut missing: Vec<&OsStr> = Vec::new();

    loop {
        match fs::symlink_metadata(existing) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let name = existing
                    .file_name()
                    .ok_or_else(|| PathError::PathTraversal(path.display().to_string()))?;
                missing.push(name);
                existing = existing
                    .parent()
                    .ok_or_else(|| PathError::PathTraversal(path.display().to_string()))?;
            }
            Err(e) => return Err(PathError::Io(e)),
        }
    }

    let mut canonical = fs::canonicalize(existing)
        .map_err(|_| PathError::PathTraversal(path.display().to_string()))?;
    for name in missing.iter().rev() {
        canonical.push(name);
    }

    Ok(canonical)
}
