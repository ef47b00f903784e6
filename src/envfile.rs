//! Companion `.env` file maintenance for containerized projects.
//!
//! Compose files read image versions from `.env`. Before a containerized run the
//! version keys are rewritten from the project's `ContainerConfig`; any other
//! lines in the file are kept as they were.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::ContainerConfig;

pub const ENV_FILE: &str = ".env";

#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvLine {
    Pair(String, String),
    Other(String),
}

/// The `KEY=VALUE` entries a container configuration contributes.
fn container_entries(config: &ContainerConfig) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    if let Some(version) = non_empty(config.postgres_version.as_deref()) {
        entries.push(("POSTGRES_VERSION".to_string(), version.to_string()));
    }
    for (language, version) in &config.languages {
        if let Some(version) = non_empty(Some(version.as_str())) {
            let key = format!("{}_VERSION", language.trim().to_uppercase().replace('-', "_"));
            entries.push((key, version.to_string()));
        }
    }
    entries
}

/// Rewrites the container keys of `<dir>/.env`.
///
/// Returns the entries written, or an empty list when the configuration has no
/// versions (the file is then left untouched).
pub fn refresh_env_file(dir: &Path, config: &ContainerConfig) -> Result<Vec<(String, String)>> {
    let entries = container_entries(config);
    if entries.is_empty() {
        return Ok(entries);
    }
    let path = dir.join(ENV_FILE);
    let mut lines = if path.exists() {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        parse(&raw)
    } else {
        Vec::new()
    };
    for (key, value) in &entries {
        upsert(&mut lines, key, value);
    }
    write(&path, &lines)?;
    Ok(entries)
}

/// Path of the companion environment file for `dir`.
pub fn env_file_path(dir: &Path) -> PathBuf {
    dir.join(ENV_FILE)
}

fn parse(raw: &str) -> Vec<EnvLine> {
    raw.lines()
        .map(|line| match line.split_once('=') {
            Some((key, value)) if !line.trim_start().starts_with('#') => {
                EnvLine::Pair(key.to_string(), value.to_string())
            }
            _ => EnvLine::Other(line.to_string()),
        })
        .collect()
}

fn upsert(lines: &mut Vec<EnvLine>, key: &str, value: &str) {
    for line in lines.iter_mut() {
        if let EnvLine::Pair(existing, current) = line {
            if existing == key {
                *current = value.to_string();
                return;
            }
        }
    }
    lines.push(EnvLine::Pair(key.to_string(), value.to_string()));
}

fn write(path: &Path, lines: &[EnvLine]) -> Result<()> {
    let mut out = String::new();
    for line in lines {
        match line {
            EnvLine::Pair(key, value) => out.push_str(&format!("{}={}\n", key, value)),
            EnvLine::Other(text) => {
                out.push_str(text);
                out.push('\n');
            }
        }
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        let mut config = ContainerConfig {
            use_container: true,
            postgres_version: Some("17-alpine".into()),
            ..Default::default()
        };
        config.languages.insert("erlang".into(), "28".into());
        config.languages.insert("node".into(), "25.2.1".into());
        config
    }

    #[test]
    fn entries_cover_database_and_languages() {
        let entries = container_entries(&config());
        assert_eq!(
            entries,
            vec![
                ("POSTGRES_VERSION".to_string(), "17-alpine".to_string()),
                ("ERLANG_VERSION".to_string(), "28".to_string()),
                ("NODE_VERSION".to_string(), "25.2.1".to_string()),
            ]
        );
    }

    #[test]
    fn creates_env_file_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        refresh_env_file(dir.path(), &config()).unwrap();
        let written = fs::read_to_string(env_file_path(dir.path())).unwrap();
        assert_eq!(written, "POSTGRES_VERSION=17-alpine\nERLANG_VERSION=28\nNODE_VERSION=25.2.1\n");
    }

    #[test]
    fn preserves_unrelated_keys_and_overwrites_versions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(ENV_FILE),
            "# local\nSECRET_KEY=abc=def\nPOSTGRES_VERSION=15\n",
        )
        .unwrap();
        refresh_env_file(dir.path(), &config()).unwrap();
        let written = fs::read_to_string(dir.path().join(ENV_FILE)).unwrap();
        assert_eq!(
            written,
            "# local\nSECRET_KEY=abc=def\nPOSTGRES_VERSION=17-alpine\nERLANG_VERSION=28\nNODE_VERSION=25.2.1\n"
        );
    }

    #[test]
    fn empty_configuration_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContainerConfig {
            use_container: true,
            postgres_version: Some("  ".into()),
            ..Default::default()
        };
        let entries = refresh_env_file(dir.path(), &config).unwrap();
        assert!(entries.is_empty());
        assert!(!dir.path().join(ENV_FILE).exists());
    }
}
