//! Secret wrapper for tokens and client keys

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Sensitive value, redacted in Debug/Display and zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Read a secret from `name`. Unset or blank variables yield `None`.
    pub fn from_env(name: &str) -> Option<Self> {
        let value = std::env::var(name).ok()?;
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    /// Read a secret from a file, trimming surrounding whitespace.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut raw = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let secret = raw.trim().to_string();
        raw.zeroize();
        if secret.is_empty() {
            return Err(Error::EmptySecret(path.display().to_string()));
        }
        Ok(Self(secret))
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<'de, T: Zeroize + Deserialize<'de>> Deserialize<'de> for Secret<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new(String::from("rt_live_123"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
        assert_eq!(secret.expose(), "rt_live_123");
    }

    #[test]
    fn from_file_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refresh_token");
        std::fs::write(&path, "  rt_from_file\n").unwrap();

        let secret = Secret::from_file(&path).unwrap();
        assert_eq!(secret.expose(), "rt_from_file");
    }

    #[test]
    fn from_file_rejects_blank_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, "\n\n").unwrap();

        assert!(matches!(Secret::from_file(&path), Err(Error::EmptySecret(_))));
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = Secret::from_file("/definitely/not/here").unwrap_err();
        assert!(matches!(err, Error::ReadFile { .. }));
    }

    #[test]
    fn deserializes_transparently() {
        #[derive(Deserialize)]
        struct Auth {
            client_key: Secret<String>,
        }
        let auth: Auth = toml::from_str(r#"client_key = "pck_abc""#).unwrap();
        assert_eq!(auth.client_key.expose(), "pck_abc");
    }
}
