//! XML configuration support.
//! - Loads settings from config.xml (quick_xml + serde).
//! - Writes a commented template on request (`--init-config`).
//!
//! Unknown elements are rejected so typos surface instead of being ignored.

use anyhow::{Context, Result, bail};
use quick_xml::de::from_str as from_xml_str;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::paths::{default_config_path, path_has_symlink_ancestor};
use super::types::{Config, LogLevel};
use crate::platform::write_config_secure_new_0600;

/// Struct mirroring the XML config for deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename = "config")]
#[serde(deny_unknown_fields)]
struct XmlConfig {
    log_level: Option<String>,
    log_file: Option<String>,
    metadata_file: Option<String>,
    #[serde(default, deserialize_with = "de_u64_trimmed_opt")]
    max_shim_bytes: Option<u64>,
    preserve_timestamps: Option<bool>,
    disable_locks: Option<bool>,
    verify_libraries: Option<XmlLibraries>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct XmlLibraries {
    #[serde(rename = "library", default)]
    library: Vec<String>,
}

fn de_u64_trimmed_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse::<u64>().map(Some).map_err(serde::de::Error::custom),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn xml_to_config(parsed: XmlConfig) -> Result<Config> {
    let mut cfg = Config::default();
    if let Some(s) = non_empty(parsed.log_level) {
        cfg.log_level = s.parse::<LogLevel>().map_err(anyhow::Error::msg)?;
    }
    cfg.log_file = non_empty(parsed.log_file).map(PathBuf::from);
    if let Some(name) = non_empty(parsed.metadata_file) {
        cfg.metadata_file = name;
    }
    if let Some(n) = parsed.max_shim_bytes {
        cfg.max_shim_bytes = n;
    }
    if let Some(b) = parsed.preserve_timestamps {
        cfg.preserve_timestamps = b;
    }
    if let Some(b) = parsed.disable_locks {
        cfg.disable_locks = b;
    }
    if let Some(libs) = parsed.verify_libraries {
        cfg.verify_libraries = libs
            .library
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
    }
    Ok(cfg)
}

/// Load a Config from a specific XML file.
pub fn load_config_from_xml_path(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).with_context(|| format!("read config xml '{}'", path.display()))?;
    let parsed: XmlConfig =
        from_xml_str(&contents).with_context(|| format!("parse config xml '{}'", path.display()))?;
    let cfg = xml_to_config(parsed).with_context(|| format!("invalid value in '{}'", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

/// Load the config file at the default location (or `VENV_MOVE_CONFIG`).
/// Returns Ok(None) when no file exists there; the location is returned with the config.
pub fn load_config() -> Result<Option<(Config, PathBuf)>> {
    let path = default_config_path()?;
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(None);
    }
    let cfg = load_config_from_xml_path(&path)?;
    Ok(Some((cfg, path)))
}

/// Commented template with every setting at its default.
pub fn render_template() -> String {
    let d = Config::default();
    format!(
        "<!--\n  venv_move configuration (XML)\n\n    log_level            -> quiet | normal | info | debug\n    log_file             -> append logs to this file as well as stderr (optional)\n    metadata_file        -> environment metadata record at the root\n    max_shim_bytes       -> larger text files are never patched\n    preserve_timestamps  -> copy atime/mtime onto relocated files\n    disable_locks        -> skip the destination claim (filesystems without flock)\n    verify_libraries     -> modules imported by `venv_move verify` by default;\n                            use label=module when the names differ\n\n  CLI flags override these values.\n-->\n<config>\n  <log_level>{}</log_level>\n  <log_file></log_file>\n  <metadata_file>{}</metadata_file>\n  <max_shim_bytes>{}</max_shim_bytes>\n  <preserve_timestamps>{}</preserve_timestamps>\n  <disable_locks>{}</disable_locks>\n  <verify_libraries>\n    <library>pip</library>\n  </verify_libraries>\n</config>\n",
        d.log_level, d.metadata_file, d.max_shim_bytes, d.preserve_timestamps, d.disable_locks
    )
}

/// Write the template to `path`. Refuses to overwrite or to write through a symlinked ancestor.
pub fn create_template_config(path: &Path) -> Result<()> {
    if path_has_symlink_ancestor(path)? {
        bail!("Refusing to create config: ancestor of {} is a symlink", path.display());
    }
    write_config_secure_new_0600(path, render_template().as_bytes())?;
    info!(path = %path.display(), "created template config");
    Ok(())
}
