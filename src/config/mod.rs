//! Configuration loading and validation.
//!
//! Doorman reads a single YAML or JSON file at startup; the parsed
//! [`Config`](model::Config) is validated, wrapped in an `Arc`, and
//! never mutated again for the life of the process. A SHA-256 hash of
//! the raw file content is kept as the config version reported by
//! `/oauth/health`.

pub mod model;
pub mod validation;

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::DoormanError;
use model::Config;

/// Parse a config string based on file extension.
pub fn parse_config_str(
    ext: &str,
    content: &str,
    path_display: &str,
) -> Result<Config, DoormanError> {
    match ext {
        "yaml" | "yml" => serde_yml::from_str(content).map_err(|e| DoormanError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        "json" => serde_json::from_str(content).map_err(|e| DoormanError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        other => Err(DoormanError::UnsupportedFormat(other.to_string())),
    }
}

/// Compute a lowercase hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Read, parse, and validate a config file. Returns the config plus the
/// content hash used as its version.
pub async fn load(path: &Path) -> Result<(Config, String), DoormanError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DoormanError::ConfigFileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            DoormanError::Io(e)
        }
    })?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let config = parse_config_str(ext, &content, &path.display().to_string())?;

    if let Err(errors) = validation::validate(&config) {
        return Err(DoormanError::ConfigValidation { errors });
    }

    Ok((config, sha256_hex(content.as_bytes())))
}
