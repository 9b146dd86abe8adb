use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use oidcflow::OidcSettings;
use oidcflow::config::loader::load_configurations;

/// Loads and validates the client configuration file.
pub fn load(path: &Path) -> Result<OidcSettings> {
    let settings = load_configurations(path)
        .with_context(|| format!("Cannot load configuration from {}", path.display()))?;
    if settings.clients.is_empty() {
        anyhow::bail!("{} defines no clients", path.display());
    }
    Ok(settings)
}

/// The session store: `--store`, else `~/.oidcflow/store.json`.
pub fn store_path(cli_store: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = cli_store {
        return Ok(path.to_path_buf());
    }
    Ok(dirs::home_dir()
        .context("Cannot determine home directory")?
        .join(".oidcflow")
        .join("store.json"))
}

/// Parses `key=value` pairs.
pub fn parse_params(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected key=value, got: {pair}"))?;
            if key.is_empty() {
                anyhow::bail!("Empty parameter name in: {pair}");
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
