//! iRODS virtual paths: always absolute, `/`-separated, canonical.

use std::fmt;

pub const PATH_SEPARATOR: char = '/';

/// A canonical absolute path in the iRODS namespace, stored as its
/// ordered segments. Canonicalization is idempotent: feeding a
/// rendered path back in yields an identical value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IrodsPath {
    segments: Vec<String>,
}

impl IrodsPath {
    /// Build from an absolute or relative path; relative paths resolve
    /// against `home`.
    pub fn resolve(raw: &str, home: &str) -> IrodsPath {
        let normalized = raw.replace('\\', "/");
        if normalized.starts_with(PATH_SEPARATOR) {
            IrodsPath {
                segments: canonical_segments(&normalized),
            }
        } else {
            let joined = format!("{}/{}", home.trim_end_matches(PATH_SEPARATOR), normalized);
            IrodsPath {
                segments: canonical_segments(&joined),
            }
        }
    }

    /// Build from a path treated as absolute even without a leading
    /// separator.
    pub fn absolute(raw: &str) -> IrodsPath {
        let normalized = raw.replace('\\', "/");
        IrodsPath {
            segments: canonical_segments(&normalized),
        }
    }

    pub fn root() -> IrodsPath {
        IrodsPath { segments: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Leaf name; empty for the root
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    pub fn parent(&self) -> Option<IrodsPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(IrodsPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, child: &str) -> IrodsPath {
        let mut joined = self.to_string();
        if !joined.ends_with(PATH_SEPARATOR) {
            joined.push(PATH_SEPARATOR);
        }
        joined.push_str(child);
        IrodsPath::absolute(&joined)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn starts_with(&self, other: &IrodsPath) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }
}

fn canonical_segments(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for part in path.split(PATH_SEPARATOR) {
        match part {
            // Runs of separators and bare dots collapse away
            "" | "." => {}
            // Parent refs pop; at the root they are discarded
            ".." => {
                segments.pop();
            }
            other => segments.push(other.to_string()),
        }
    }
    segments
}

impl fmt::Display for IrodsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}
