//! Dotted-path utilities for statetree.
//!
//! A path is an ordered, root-relative list of opaque string tokens. The
//! canonical text form prefixes every token with `.`, so `.users.0.name`
//! addresses `["users", "0", "name"]` and the empty string addresses the
//! root. Tokens containing `.`, `~`, or `=` are escaped (`~1` / `~0` /
//! `~2`).
//!
//! # Example
//!
//! ```
//! use statetree_path::Path;
//!
//! let path = Path::parse(".users.0.name").unwrap();
//! assert_eq!(path.tokens(), ["users", "0", "name"]);
//! assert_eq!(path.to_string(), ".users.0.name");
//!
//! let built = Path::root().key("users").index(0).key("name");
//! assert_eq!(built, path);
//! ```

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path must be empty or start with '.'")]
    NotAnchored,
}

/// Unescapes one path token.
pub fn unescape_token(token: &str) -> String {
    if !token.contains('~') {
        return token.to_string();
    }
    // Order matters: ~0 must be replaced last
    token
        .replace("~1", ".")
        .replace("~2", "=")
        .replace("~0", "~")
}

/// Escapes one path token for the dotted text form. `=` is escaped so
/// the text form can be embedded in `path=value` records.
pub fn escape_token(token: &str) -> String {
    if !token.contains('.') && !token.contains('~') && !token.contains('=') {
        return token.to_string();
    }
    token
        .replace('~', "~0")
        .replace('.', "~1")
        .replace('=', "~2")
}

/// An ordered, root-relative list of property tokens.
///
/// Two paths are equal iff their token sequences are equal; a path
/// identifies at most one live node in a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    tokens: Vec<String>,
}

impl Path {
    /// The empty (root) path.
    pub fn root() -> Self {
        Path { tokens: Vec::new() }
    }

    /// Parse the dotted text form. `""` is the root; otherwise the string
    /// must start with `.`.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if text.is_empty() {
            return Ok(Path::root());
        }
        if !text.starts_with('.') {
            return Err(PathError::NotAnchored);
        }
        Ok(Path {
            tokens: text.split('.').skip(1).map(unescape_token).collect(),
        })
    }

    /// Appends a property token.
    pub fn key(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into());
        self
    }

    /// Appends an array index token.
    pub fn index(self, index: usize) -> Self {
        self.key(index.to_string())
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The last token, if any.
    pub fn leaf(&self) -> Option<&str> {
        self.tokens.last().map(String::as_str)
    }

    /// Everything but the last token; `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.tokens.is_empty() {
            return None;
        }
        Some(Path {
            tokens: self.tokens[..self.tokens.len() - 1].to_vec(),
        })
    }

    /// This path extended by one token.
    pub fn child(&self, token: &str) -> Path {
        let mut tokens = Vec::with_capacity(self.tokens.len() + 1);
        tokens.extend_from_slice(&self.tokens);
        tokens.push(token.to_string());
        Path { tokens }
    }

    /// This path followed by all of `other`'s tokens.
    pub fn join(&self, other: &Path) -> Path {
        let mut tokens = Vec::with_capacity(self.tokens.len() + other.tokens.len());
        tokens.extend_from_slice(&self.tokens);
        tokens.extend_from_slice(&other.tokens);
        Path { tokens }
    }

    /// True when `prefix`'s tokens lead this path's tokens. Every path
    /// starts with the root.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.tokens.len() >= prefix.tokens.len()
            && self.tokens[..prefix.tokens.len()] == prefix.tokens[..]
    }

    /// The tokens after `prefix`, or `None` when `prefix` does not lead
    /// this path.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Path {
            tokens: self.tokens[prefix.tokens.len()..].to_vec(),
        })
    }

    /// Strict prefixes from the root (inclusive) up to, but excluding,
    /// this path: `.a.b.c` yields ``, `.a`, `.a.b`.
    pub fn strict_prefixes(&self) -> Vec<Path> {
        (0..self.tokens.len())
            .map(|end| Path {
                tokens: self.tokens[..end].to_vec(),
            })
            .collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            write!(f, ".{}", escape_token(token))?;
        }
        Ok(())
    }
}

impl From<Vec<String>> for Path {
    fn from(tokens: Vec<String>) -> Self {
        Path { tokens }
    }
}

impl From<&[&str]> for Path {
    fn from(tokens: &[&str]) -> Self {
        Path {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl FromIterator<String> for Path {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Path {
            tokens: iter.into_iter().collect(),
        }
    }
}
