use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secrets directory {} does not exist", .0.display())]
    MissingDir(PathBuf),
    #[error("secrets path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to inspect secrets directory {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid secret name {0:?}")]
    InvalidKey(String),
    #[error("failed to read secret {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write secret {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// A secret value that never shows up in logs or panic messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(REDACTED)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("REDACTED")
    }
}

/// Secrets stored one per file in a directory.
#[derive(Debug, Clone)]
pub struct DirVault {
    dir: PathBuf,
}

impl DirVault {
    /// # Errors
    /// Fails when `dir` is missing, is not a directory, or cannot be inspected.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SecretsError> {
        let dir = dir.into();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(Self { dir }),
            Ok(_) => Err(SecretsError::NotADirectory(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SecretsError::MissingDir(dir)),
            Err(source) => Err(SecretsError::Inspect { path: dir, source }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// # Errors
    /// Fails when `key` is not a plain file name or the file cannot be read.
    pub fn get(&self, key: &str) -> Result<Secret, SecretsError> {
        let path = self.entry(key)?;
        let value = fs::read_to_string(&path)
            .map_err(|source| SecretsError::Read { key: key.to_string(), source })?;
        Ok(Secret(value))
    }

    /// Store `value` under `key`, readable by the owner only.
    ///
    /// # Errors
    /// Fails when `key` is not a plain file name or the file cannot be written.
    pub fn set(&self, key: &str, value: &Secret) -> Result<(), SecretsError> {
        let path = self.entry(key)?;
        let write_error = |source| SecretsError::Write { key: key.to_string(), source };

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(write_error)?;
        file.write_all(value.as_bytes()).map_err(write_error)?;
        file.sync_all().map_err(write_error)?;
        tracing::debug!(key, "secret stored");
        Ok(())
    }

    fn entry(&self, key: &str) -> Result<PathBuf, SecretsError> {
        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.dir.join(key)),
            _ => Err(SecretsError::InvalidKey(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = match DirVault::open(dir.path().join("absent")) {
            Ok(vault) => panic!("opened vault at {}", vault.dir().display()),
            Err(err) => err,
        };
        assert!(matches!(err, SecretsError::MissingDir(_)));
        Ok(())
    }

    #[test]
    fn regular_file_is_not_a_vault() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("token");
        fs::write(&file, "x")?;
        assert!(matches!(DirVault::open(&file), Err(SecretsError::NotADirectory(_))));
        Ok(())
    }

    #[test]
    fn set_then_get() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = DirVault::open(dir.path())?;
        vault.set("discord_token", &Secret::new("hunter2"))?;
        assert_eq!(vault.get("discord_token")?.expose(), "hunter2");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("discord_token"))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[test]
    fn unknown_secret_fails_to_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = DirVault::open(dir.path())?;
        assert!(matches!(vault.get("nope"), Err(SecretsError::Read { .. })));
        Ok(())
    }

    #[test]
    fn keys_cannot_leave_the_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = DirVault::open(dir.path())?;
        for key in ["../escape", "nested/key", "/etc/passwd", ""] {
            assert!(matches!(vault.get(key), Err(SecretsError::InvalidKey(_))), "{key}");
        }
        Ok(())
    }

    #[test]
    fn secrets_are_redacted_when_printed() {
        let secret = Secret::new("hunter2");
        assert_eq!(secret.to_string(), "REDACTED");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
