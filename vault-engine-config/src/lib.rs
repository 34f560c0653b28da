// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! File-backed configuration loading shared by the vault engine binaries.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Serde-backed configuration that can be read from and written to disk.
///
/// The format is picked from the file extension: `.yaml`/`.yml` are parsed as
/// YAML, everything else as JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content, is_yaml(path))
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn parse(content: &str, yaml: bool) -> Result<Self> {
        let config: Self = if yaml {
            serde_yaml::from_str(content)?
        } else {
            serde_json::from_str(content)?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

// Vault metadata files are plain arrays, so they get the same loader.
impl<T: Serialize + DeserializeOwned> Config for Vec<T> {}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct Sample {
        rpc_url: String,
        poll_secs: u64,
    }

    impl Config for Sample {}

    #[test]
    fn test_load_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let sample = Sample {
            rpc_url: "http://localhost:8545".to_string(),
            poll_secs: 30,
        };

        let json_path = dir.path().join("engine.json");
        sample.save(&json_path).unwrap();
        assert_eq!(Sample::load(&json_path).unwrap(), sample);

        let yaml_path = dir.path().join("engine.yaml");
        sample.save(&yaml_path).unwrap();
        let raw = std::fs::read_to_string(&yaml_path).unwrap();
        assert!(raw.contains("rpc-url"));
        assert_eq!(Sample::load(&yaml_path).unwrap(), sample);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = Sample::load("/definitely/not/here.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
    }

    #[test]
    fn test_load_array() {
        let parsed = Vec::<Sample>::parse("[{\"rpc-url\":\"x\",\"poll-secs\":1}]", false).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].poll_secs, 1);
    }
}
