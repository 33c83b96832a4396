use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path escapes its root: {0}")]
    EscapesRoot(String),
    #[error("path contains a NUL byte: {0:?}")]
    NulByte(String),
}

/// Normalized, `/`-separated path that is absolute within some root.
///
/// Never has a trailing slash and never contains `.` or `..` segments. The
/// root itself is `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryPath(String);

impl DirectoryPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn parse(input: &str) -> Result<Self, PathError> {
        if input.contains('\0') {
            return Err(PathError::NulByte(input.to_string()));
        }
        let mut segments: Vec<&str> = Vec::new();
        for seg in input.split(['/', '\\']) {
            match seg {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot(input.to_string()));
                    }
                }
                other => segments.push(other),
            }
        }
        Ok(Self::from_segments(&segments))
    }

    fn from_segments(segments: &[&str]) -> Self {
        let mut s = String::with_capacity(segments.iter().map(|x| x.len() + 1).sum());
        for seg in segments {
            s.push('/');
            s.push_str(seg);
        }
        if s.is_empty() {
            s.push('/');
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path without the leading slash; empty for the root.
    pub fn relative_str(&self) -> &str {
        &self.0[1..]
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.relative_str().split('/').filter(|s| !s.is_empty())
    }

    /// Appends a single directory entry name as returned by `listdir`.
    pub fn join(&self, name: &str) -> Result<Self, PathError> {
        self.join_path(&Self::parse(name)?)
    }

    /// Re-roots `rel` (itself root-relative) below `self`.
    pub fn join_path(&self, rel: &DirectoryPath) -> Result<Self, PathError> {
        if rel.is_root() {
            return Ok(self.clone());
        }
        if self.is_root() {
            return Ok(rel.clone());
        }
        Ok(Self(format!("{}{}", self.0, rel.0)))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    pub fn starts_with(&self, base: &DirectoryPath) -> bool {
        base.is_root()
            || self.0 == base.0
            || (self.0.starts_with(&base.0) && self.0.as_bytes().get(base.0.len()) == Some(&b'/'))
    }

    /// View of `self` relative to `root`, or `None` when `self` lies outside it.
    pub fn strip_root(&self, root: &DirectoryPath) -> Option<Self> {
        if !self.starts_with(root) {
            return None;
        }
        if root.is_root() {
            return Some(self.clone());
        }
        let rest = &self.0[root.0.len()..];
        if rest.is_empty() {
            Some(Self::root())
        } else {
            Some(Self(rest.to_string()))
        }
    }
}

impl fmt::Display for DirectoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DirectoryPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DirectoryPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DirectoryPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
