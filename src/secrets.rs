//! Secret lookup.
//!
//! Secrets come from a mounted secrets directory (one file per secret, as
//! written by Kubernetes, Docker and most vault agents). When there is no
//! directory, or the secret's file is missing from it, the caller-supplied
//! environment variable is used instead.

use std::path::PathBuf;

use crate::error::{EtlError, Result};

pub struct SecretProvider {
    dir: Option<PathBuf>,
}

impl SecretProvider {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Resolve `name` from the secrets directory, or from `env_fallback`
    /// when no directory is configured or the file does not exist.
    ///
    /// # Errors
    ///
    /// [`EtlError::Configuration`] when the name is empty, the secret file
    /// exists but cannot be read, or neither source has the secret.
    pub fn get_secret(&self, name: &str, env_fallback: Option<&str>) -> Result<String> {
        if name.is_empty() {
            return Err(EtlError::Configuration("secret name is required".into()));
        }

        if let Some(dir) = &self.dir {
            if name.contains('/') || name.contains('\\') || name == ".." {
                return Err(EtlError::Configuration(format!(
                    "invalid secret name '{}'",
                    name
                )));
            }
            let file = dir.join(name);
            match std::fs::read_to_string(&file) {
                Ok(value) => return Ok(value.trim_end_matches(['\n', '\r']).to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(EtlError::Configuration(format!(
                        "secret '{}' not readable at {}: {}",
                        name,
                        file.display(),
                        e
                    )))
                }
            }
        }

        if let Some(var) = env_fallback {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    return Ok(value);
                }
            }
        }

        let looked_in = match &self.dir {
            Some(dir) => format!("no file {}", dir.join(name).display()),
            None => "no secrets directory configured".to_string(),
        };
        Err(EtlError::Configuration(format!(
            "secret '{}' not found ({}); set [secrets].dir or provide {}",
            name,
            looked_in,
            env_fallback.unwrap_or("an env fallback")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reads_secret_file_and_trims_newline() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("api-key"), "s3cr3t\n").unwrap();
        let provider = SecretProvider::new(Some(tmp.path().to_path_buf()));
        assert_eq!(provider.get_secret("api-key", None).unwrap(), "s3cr3t");
    }

    #[test]
    fn test_missing_secret_file_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let provider = SecretProvider::new(Some(tmp.path().to_path_buf()));
        let err = provider.get_secret("absent", None).unwrap_err();
        assert!(matches!(err, EtlError::Configuration(_)));
    }

    #[test]
    fn test_missing_file_falls_back_to_env() {
        std::env::set_var("LAKEHOUSE_ETL_TEST_FILE_FALLBACK", "env-value");
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("present"), "file-value\n").unwrap();
        let provider = SecretProvider::new(Some(tmp.path().to_path_buf()));

        assert_eq!(
            provider
                .get_secret("absent", Some("LAKEHOUSE_ETL_TEST_FILE_FALLBACK"))
                .unwrap(),
            "env-value"
        );
        // the file still wins when it exists
        assert_eq!(
            provider
                .get_secret("present", Some("LAKEHOUSE_ETL_TEST_FILE_FALLBACK"))
                .unwrap(),
            "file-value"
        );
    }

    #[test]
    fn test_env_fallback() {
        std::env::set_var("LAKEHOUSE_ETL_TEST_SECRET", "from-env");
        let provider = SecretProvider::new(None);
        assert_eq!(
            provider
                .get_secret("whatever", Some("LAKEHOUSE_ETL_TEST_SECRET"))
                .unwrap(),
            "from-env"
        );
    }

    #[test]
    fn test_no_backend_no_fallback_fails() {
        let provider = SecretProvider::new(None);
        let err = provider
            .get_secret("api-key", Some("LAKEHOUSE_ETL_TEST_UNSET_VAR"))
            .unwrap_err();
        assert!(matches!(err, EtlError::Configuration(_)));
        assert!(provider.get_secret("", None).is_err());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let tmp = TempDir::new().unwrap();
        let provider = SecretProvider::new(Some(tmp.path().to_path_buf()));
        assert!(provider.get_secret("../etc/passwd", None).is_err());
    }
}
