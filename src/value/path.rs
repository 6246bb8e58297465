//! Pointer-style paths into a document.
//!
//! Paths are `/`-delimited with JSON-Pointer escaping (`~0` for `~`, `~1` for
//! `/`). Both `""` and `"/"` address the document root.

use std::fmt;

use crate::error::{Result, SyncError};

/// A parsed document path
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path {
    tokens: Vec<String>,
}

impl Path {
    /// The document root
    pub fn root() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Parse a `/`-delimited path
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw == "/" {
            return Ok(Self::root());
        }
        if !raw.starts_with('/') {
            return Err(SyncError::validation(format!(
                "path must start with '/': {raw:?}"
            )));
        }

        let tokens = raw[1..]
            .split('/')
            .map(unescape)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tokens })
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Split into the parent path and the last token
    pub fn split_last(&self) -> Option<(Path, &str)> {
        let (last, rest) = self.tokens.split_last()?;
        Some((Path { tokens: rest.to_vec() }, last.as_str()))
    }

    /// Path of a direct child
    pub fn child(&self, token: impl Into<String>) -> Path {
        let mut tokens = self.tokens.clone();
        tokens.push(token.into());
        Path { tokens }
    }

    /// True if `self` equals `other` or lies underneath it
    pub fn starts_with(&self, other: &Path) -> bool {
        self.tokens.len() >= other.tokens.len()
            && self.tokens[..other.tokens.len()] == other.tokens[..]
    }

    /// Every proper ancestor, root first
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.tokens.len()).map(move |len| Path {
            tokens: self.tokens[..len].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tokens.is_empty() {
            return f.write_str("/");
        }
        for token in &self.tokens {
            write!(f, "/{}", escape(token))?;
        }
        Ok(())
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> Result<String> {
    if !token.contains('~') {
        return Ok(token.to_string());
    }

    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => {
                return Err(SyncError::validation(format!(
                    "invalid escape sequence in path token {token:?}"
                )))
            }
        }
    }
    Ok(out)
}

/// Parse an array index token. Leading zeros and signs are rejected.
pub(crate) fn array_index(token: &str) -> Option<usize> {
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return None;
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_forms() {
        assert!(Path::parse("").unwrap().is_root());
        assert!(Path::parse("/").unwrap().is_root());
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn test_escaping_round_trip() {
        let path = Path::parse("/a~1b/c~0d").unwrap();
        assert_eq!(path.tokens(), &["a/b".to_string(), "c~d".to_string()]);
        assert_eq!(path.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn test_rejects_relative_and_bad_escape() {
        assert!(Path::parse("user/name").is_err());
        assert!(Path::parse("/a~2").is_err());
    }

    #[test]
    fn test_prefix_and_ancestors() {
        let path = Path::parse("/user/profile/name").unwrap();
        let user = Path::parse("/user").unwrap();
        assert!(path.starts_with(&user));
        assert!(!user.starts_with(&path));

        let ancestors: Vec<String> = path.ancestors().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["/", "/user", "/user/profile"]);
    }

    #[test]
    fn test_array_index() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("12"), Some(12));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-"), None);
        assert_eq!(array_index("+1"), None);
    }
}
