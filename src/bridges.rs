//! Static bridge catalog.
//!
//! Parsed once from the embedded `assets/bridges.yaml` and shared read-only.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

const EMBEDDED_CATALOG: &str = include_str!("../assets/bridges.yaml");
pub const SERVICE_PREFIX: &str = "mautrix-";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeDescriptor {
    pub name: String,
    pub port: u16,
    pub description: String,
    #[serde(default)]
    pub requires_credentials: bool,
    #[serde(default)]
    pub login_instructions: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub welcome: Option<String>,
}

impl BridgeDescriptor {
    pub fn service_name(&self) -> String {
        format!("{SERVICE_PREFIX}{}", self.name)
    }

    pub fn image(&self) -> String {
        format!("dock.mau.dev/mautrix/{}:latest", self.name)
    }

    pub fn bot_username(&self) -> String {
        format!("{}bot", self.name)
    }

    pub fn namespace_prefix(&self) -> String {
        format!("{}_", self.name)
    }

    pub fn bot_user_id(&self, server_name: &str) -> String {
        format!("@{}:{}", self.bot_username(), server_name)
    }

    pub fn login_instructions_for(&self, server_name: &str) -> String {
        self.login_instructions.replace("SERVER", server_name)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    bridges: Vec<BridgeDescriptor>,
}

/// Name-keyed, immutable after load.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: BTreeMap<String, BridgeDescriptor>,
}

impl Catalog {
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED_CATALOG)
    }

    pub fn from_yaml(src: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_yaml::from_str(src).map_err(|e| Error::Catalog(e.to_string()))?;
        let mut entries = BTreeMap::new();
        for desc in file.bridges {
            if desc.name.is_empty() || desc.name.contains(char::is_whitespace) {
                return Err(Error::Catalog(format!("invalid bridge name {:?}", desc.name)));
            }
            if let Some(prev) = entries.insert(desc.name.clone(), desc) {
                return Err(Error::Catalog(format!("duplicate bridge {}", prev.name)));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&BridgeDescriptor> {
        self.entries.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&BridgeDescriptor> {
        self.get(name)
            .ok_or_else(|| Error::UnknownBridge(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BridgeDescriptor> {
        self.entries.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Map a logical compose service (`mautrix-<name>`) back to its bridge.
    pub fn for_service(&self, service: &str) -> Option<&BridgeDescriptor> {
        service
            .strip_prefix(SERVICE_PREFIX)
            .and_then(|name| self.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_catalog_loads() {
        let catalog = Catalog::embedded().unwrap();
        assert!(catalog.len() >= 10);
        let telegram = catalog.get("telegram").unwrap();
        assert!(telegram.requires_credentials);
        assert!(!catalog.get("whatsapp").unwrap().requires_credentials);
        assert!(catalog.names().all(|n| catalog.require(n).is_ok()));
    }

    #[test]
    fn derived_names() {
        let catalog = Catalog::embedded().unwrap();
        let wa = catalog.get("whatsapp").unwrap();
        assert_eq!(wa.service_name(), "mautrix-whatsapp");
        assert_eq!(wa.image(), "dock.mau.dev/mautrix/whatsapp:latest");
        assert_eq!(wa.bot_user_id("chat.lan"), "@whatsappbot:chat.lan");
        assert_eq!(wa.namespace_prefix(), "whatsapp_");
        assert!(wa
            .login_instructions_for("chat.lan")
            .contains("@whatsappbot:chat.lan"));
        assert_eq!(
            catalog.for_service("mautrix-whatsapp").map(|d| d.port),
            Some(29318)
        );
        assert!(catalog.for_service("synapse").is_none());
    }

    #[test]
    fn duplicates_are_rejected() {
        let src = "bridges:\n  - {name: a, port: 1, description: x}\n  - {name: a, port: 2, description: y}\n";
        assert!(matches!(Catalog::from_yaml(src), Err(Error::Catalog(_))));
    }

    #[test]
    fn unknown_lookup_is_an_error() {
        let catalog = Catalog::embedded().unwrap();
        assert!(matches!(
            catalog.require("irc"),
            Err(Error::UnknownBridge(name)) if name == "irc"
        ));
    }
}
