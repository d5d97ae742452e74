//! Binary configuration: an optional TOML file overlaid by `QUARRY_*`
//! environment variables.
//!
//! ```toml
//! store_path = "~/.local/share/quarry/quarry.db"
//! jsonl_dir  = "~/data/prices"
//!
//! [fetch]
//! max_attempts = 5
//!
//! [[collections]]
//! name   = "daily_prices"
//! source = "jsonl"
//! ```
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `QUARRY_FETCH__TIMEOUT_MS=10000`.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use quarry_core::config::{CollectionConfig, FetchPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct QuarryConfig {
  #[serde(default = "default_store_path")]
  pub store_path:  PathBuf,
  /// Directory of `<entity>.jsonl` files served by the `jsonl` source.
  #[serde(default = "default_jsonl_dir")]
  pub jsonl_dir:   PathBuf,
  #[serde(default)]
  pub fetch:       FetchPolicy,
  #[serde(default)]
  pub collections: Vec<CollectionConfig>,
}

fn default_store_path() -> PathBuf { PathBuf::from("quarry.db") }

fn default_jsonl_dir() -> PathBuf { PathBuf::from("data") }

impl QuarryConfig {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("QUARRY")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()
      .context("failed to read config file")?;

    let mut cfg: Self = settings
      .try_deserialize()
      .context("failed to deserialise QuarryConfig")?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    cfg.jsonl_dir = expand_tilde(&cfg.jsonl_dir);
    for collection in &cfg.collections {
      collection
        .validate()
        .with_context(|| format!("invalid collection {:?} in {}", collection.name, path.display()))?;
    }
    Ok(cfg)
  }

  /// The named collection, or the only configured one when `name` is `None`.
  pub fn collection(&self, name: Option<&str>) -> anyhow::Result<&CollectionConfig> {
    match (name, self.collections.as_slice()) {
      (Some(name), all) => all
        .iter()
        .find(|c| c.name == name)
        .with_context(|| format!("no collection named {name:?} in config")),
      (None, [only]) => Ok(only),
      (None, []) => bail!("no collections configured"),
      (None, all) => {
        let names: Vec<&str> = all.iter().map(|c| c.name.as_str()).collect();
        bail!("several collections configured, pick one with --collection: {names:?}")
      }
    }
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quarry.toml");
    fs::write(&path, body).unwrap();
    (dir, path)
  }

  #[test]
  fn loads_collections_and_partial_fetch_policy() {
    let (_dir, path) = write_config(
      r#"
        store_path = "/tmp/q.db"

        [fetch]
        max_attempts = 5

        [[collections]]
        name   = "daily_prices"
        source = "jsonl"

        [[collections]]
        name             = "hourly"
        source           = "jsonl"
        granularity_secs = 3600
      "#,
    );
    let cfg = QuarryConfig::load(&path).unwrap();

    assert_eq!(cfg.store_path, PathBuf::from("/tmp/q.db"));
    assert_eq!(cfg.fetch.max_attempts, 5);
    assert_eq!(cfg.fetch.backoff_ms, FetchPolicy::default().backoff_ms);
    assert_eq!(cfg.collections.len(), 2);
    assert_eq!(cfg.collection(Some("hourly")).unwrap().granularity_secs, 3600);
    assert_eq!(cfg.collection(Some("daily_prices")).unwrap().granularity_secs, 86_400);
  }

  #[test]
  fn collection_choice_needs_a_name_when_ambiguous() {
    let (_dir, path) = write_config(
      r#"
        [[collections]]
        name   = "a"
        source = "jsonl"

        [[collections]]
        name   = "b"
        source = "jsonl"
      "#,
    );
    let cfg = QuarryConfig::load(&path).unwrap();
    assert!(cfg.collection(None).is_err());
    assert!(cfg.collection(Some("c")).is_err());
    assert_eq!(cfg.collection(Some("b")).unwrap().name, "b");
  }

  #[test]
  fn non_positive_granularity_is_rejected_at_load() {
    for bad in ["0", "-3600", "9223372036854775807"] {
      let (_dir, path) = write_config(&format!(
        "[[collections]]\nname = \"a\"\nsource = \"jsonl\"\ngranularity_secs = {bad}\n"
      ));
      let err = QuarryConfig::load(&path).unwrap_err();
      assert!(format!("{err:#}").contains("granularity_secs"), "{bad}: {err:#}");
    }
  }

  #[test]
  fn missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = QuarryConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.store_path, PathBuf::from("quarry.db"));
    assert!(cfg.collections.is_empty());
    assert!(cfg.collection(None).is_err());
  }

  #[test]
  fn tilde_expands_to_home() {
    let Ok(home) = std::env::var("HOME") else { return };
    assert_eq!(expand_tilde(Path::new("~/q.db")), PathBuf::from(home).join("q.db"));
    assert_eq!(expand_tilde(Path::new("/abs/q.db")), PathBuf::from("/abs/q.db"));
  }
}
