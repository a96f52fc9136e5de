use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

const DEFAULT_LISTEN_PORT: u16 = 3001;

/// Parsed configuration file. Sections are deserialized lazily by the module
/// that owns them (`[storage]` by `layout`, `[mirror]` by `mirror`, ...).
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: Option<PathBuf>,
    pub value: Value,
}

impl Default for ConfigDoc {
    fn default() -> Self {
        Self {
            path: None,
            value: Value::Table(Default::default()),
        }
    }
}

impl ConfigDoc {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let value: Value =
            toml::from_str(raw).map_err(|e| Error::parse(format!("TOML parse error: {e}")))?;
        Ok(Self { path: None, value })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::parse(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    pub fn section<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        Ok(self.deserialize_path(path)?.unwrap_or_default())
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let value: Value = toml::from_str(&data)
        .map_err(|e| Error::parse(format!("TOML parse error in {}: {e}", path.display())))?;
    Ok(ConfigDoc {
        path: Some(path.to_path_buf()),
        value,
    })
}

pub fn load_optional(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => load(p),
        None => Ok(ConfigDoc::default()),
    }
}

pub(crate) fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

// A literal value in the file wins over the environment.
pub(crate) fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    let direct = literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    direct.or_else(|| resolve_env_ref(env_key))
}

pub(crate) fn resolve_port_field(
    cfg_path: &str,
    literal: Option<u16>,
    env_key: Option<&str>,
) -> Result<Option<u16>> {
    if let Some(v) = literal {
        return Ok(Some(v));
    }
    resolve_env_ref(env_key)
        .map(|s| {
            s.parse::<u16>()
                .map_err(|e| Error::validation(format!("{cfg_path} parse failed for '{s}': {e}")))
        })
        .transpose()
}

fn default_port_env() -> Option<String> {
    Some("PORT".into())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: Option<u16>,
    #[serde(default = "default_port_env")]
    pub port_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            port_env: default_port_env(),
        }
    }
}

impl ServerConfig {
    pub fn listen_port(&self) -> Result<u16> {
        Ok(resolve_port_field("server.port", self.port, self.port_env.as_deref())?
            .unwrap_or(DEFAULT_LISTEN_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_falls_back_to_default() {
        let doc = ConfigDoc::from_toml_str("[storage]\nroot_dir = \"/srv\"\n").expect("parse");
        let server: ServerConfig = doc.section("server").expect("server");
        assert_eq!(server.port, None);
        assert_eq!(server.port_env.as_deref(), Some("PORT"));
    }

    #[test]
    fn literal_beats_env() {
        unsafe {
            std::env::set_var("DOCVAULT_TEST_CFG_LITERAL", "from-env");
        }
        assert_eq!(
            resolve_string_field(Some("  direct "), Some("DOCVAULT_TEST_CFG_LITERAL")).as_deref(),
            Some("direct")
        );
        assert_eq!(
            resolve_string_field(Some(""), Some("DOCVAULT_TEST_CFG_LITERAL")).as_deref(),
            Some("from-env")
        );
    }

    #[test]
    fn port_env_must_parse() {
        unsafe {
            std::env::set_var("DOCVAULT_TEST_CFG_PORT", "not-a-port");
        }
        let cfg = ServerConfig {
            port: None,
            port_env: Some("DOCVAULT_TEST_CFG_PORT".into()),
        };
        let err = cfg.listen_port().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
