//! Persisted settings and secret issuance.
//!
//! Secrets are generated once and then reused on every regeneration so that
//! rendered registrations stay valid across restarts.

use crate::bridges::Catalog;
use crate::config::paths::Paths;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

pub const TOKEN_LEN: usize = 64;
const DB_PASSWORD_LEN: usize = 32;
const ADMIN_PASSWORD_LEN: usize = 16;
const PORT_SCAN_SPAN: u16 = 100;

pub const DEFAULT_SYNAPSE_PORT: u16 = 8008;
pub const DEFAULT_ELEMENT_PORT: u16 = 8080;

/// `len` random characters from the URL-safe base64 alphabet.
pub fn generate_secret(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    let mut s = URL_SAFE_NO_PAD.encode(&bytes);
    s.truncate(len);
    s
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    #[default]
    Local,
    Private,
    Public,
}

impl Connectivity {
    pub const ALL: [Connectivity; 3] = [Self::Local, Self::Private, Self::Public];

    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "Local only",
            Self::Private => "Private network",
            Self::Public => "Public (HTTPS)",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Local => "Reachable from this machine only (localhost)",
            Self::Private => "Reachable on your LAN or VPN by hostname",
            Self::Public => "Served on a public domain with automatic TLS",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Local => Self::Private,
            Self::Private => Self::Public,
            Self::Public => Self::Local,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Self::Local => Self::Public,
            Self::Private => Self::Local,
            Self::Public => Self::Private,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(default)]
    pub as_token: String,
    #[serde(default)]
    pub hs_token: String,
}

impl TokenPair {
    pub fn generate() -> Self {
        Self {
            as_token: generate_secret(TOKEN_LEN),
            hs_token: generate_secret(TOKEN_LEN),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.as_token.is_empty() && !self.hs_token.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synapse: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub email: String,
}

/// Extra credentials some bridges need before they can start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub api_hash: String,
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        !self.api_id.trim().is_empty() && !self.api_hash.trim().is_empty()
    }
}

/// Grace delays and polling bounds used by lifecycle runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    #[serde(with = "humantime_serde")]
    pub homeserver_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub bridge_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub admin_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub bridge_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub status_refresh: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            homeserver_grace: Duration::from_secs(3),
            bridge_grace: Duration::from_secs(5),
            admin_grace: Duration::from_secs(3),
            bridge_wait: Duration::from_secs(30),
            status_refresh: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub server_name: String,
    #[serde(default)]
    pub connectivity: Connectivity,
    /// Absent means enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_enabled: Option<bool>,
    #[serde(default)]
    pub ports: Ports,
    pub postgres: PostgresConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub https: HttpsConfig,
    #[serde(default)]
    pub registration_secret: String,
    #[serde(default)]
    pub enabled_bridges: Vec<String>,
    #[serde(default)]
    pub bridge_tokens: BTreeMap<String, TokenPair>,
    #[serde(default)]
    pub double_puppet: TokenPair,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, ApiCredentials>,
    #[serde(default)]
    pub timings: Timings,
}

impl Settings {
    /// Fresh settings with newly generated passwords; tokens are issued on first generation.
    pub fn defaults(server_name: &str, connectivity: Connectivity) -> Self {
        Self {
            server_name: server_name.to_string(),
            connectivity,
            element_enabled: None,
            ports: Ports::default(),
            postgres: PostgresConfig {
                user: "synapse".into(),
                password: generate_secret(DB_PASSWORD_LEN),
                database: "synapse".into(),
            },
            admin: AdminConfig {
                username: "admin".into(),
                password: generate_secret(ADMIN_PASSWORD_LEN),
            },
            https: HttpsConfig::default(),
            registration_secret: String::new(),
            enabled_bridges: Vec::new(),
            bridge_tokens: BTreeMap::new(),
            double_puppet: TokenPair::default(),
            credentials: BTreeMap::new(),
            timings: Timings::default(),
        }
    }

    /// Defaults for a chosen mode. HTTPS only sticks in public mode.
    pub fn defaults_for(connectivity: Connectivity, server_name: &str, https: Option<HttpsConfig>) -> Self {
        let mut s = Self::defaults(server_name, connectivity);
        if connectivity == Connectivity::Public {
            s.https = https.unwrap_or_default();
        }
        s
    }

    pub fn exists(paths: &Paths) -> bool {
        paths.settings_file().is_file()
    }

    pub fn load(paths: &Paths, catalog: &Catalog) -> Result<Self> {
        let path = paths.settings_file();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path))
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        let mut settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?;
        for dropped in settings.normalize(catalog) {
            tracing::warn!(bridge = %dropped, "ignoring unknown or duplicate enabled bridge");
        }
        Ok(settings)
    }

    /// Keep only catalog-known, first-seen bridge names. Returns what was dropped.
    pub fn normalize(&mut self, catalog: &Catalog) -> Vec<String> {
        let mut kept: Vec<String> = Vec::with_capacity(self.enabled_bridges.len());
        let mut dropped = Vec::new();
        for name in self.enabled_bridges.drain(..) {
            if catalog.contains(&name) && !kept.contains(&name) {
                kept.push(name);
            } else {
                dropped.push(name);
            }
        }
        self.enabled_bridges = kept;
        dropped
    }

    /// Write settings through a temp file and rename it into place.
    pub fn save(&self, paths: &Paths) -> Result<()> {
        paths.ensure_skeleton()?;
        let path = paths.settings_file();
        let yaml = serde_yaml::to_string(self).map_err(|e| Error::Serialize {
            what: "settings",
            detail: e.to_string(),
        })?;

        let tmp = path.with_extension("yaml.tmp");
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp).map_err(|e| Error::io(&tmp, e))?;
        file.write_all(yaml.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::io(&tmp, e))?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        tracing::debug!(path = %path.display(), "settings saved");
        Ok(())
    }

    pub fn element_enabled(&self) -> bool {
        self.element_enabled.unwrap_or(true)
    }

    pub fn is_enabled(&self, bridge: &str) -> bool {
        self.enabled_bridges.iter().any(|b| b == bridge)
    }

    /// Returns true when the set changed.
    pub fn enable_bridge(&mut self, bridge: &str) -> bool {
        if self.is_enabled(bridge) {
            return false;
        }
        self.enabled_bridges.push(bridge.to_string());
        true
    }

    /// Returns true when the set changed. Issued tokens are kept.
    pub fn disable_bridge(&mut self, bridge: &str) -> bool {
        let before = self.enabled_bridges.len();
        self.enabled_bridges.retain(|b| b != bridge);
        before != self.enabled_bridges.len()
    }

    /// The existing pair unless either half is empty; a fresh pair otherwise.
    /// The flag reports whether a new pair was issued and must be persisted.
    pub fn issue_or_reuse(&mut self, bridge: &str) -> (TokenPair, bool) {
        let entry = self.bridge_tokens.entry(bridge.to_string()).or_default();
        reuse_or_issue(entry)
    }

    pub fn issue_or_reuse_double_puppet(&mut self) -> (TokenPair, bool) {
        reuse_or_issue(&mut self.double_puppet)
    }

    /// Drop a bridge's pair so the next generation issues a new one.
    pub fn clear_tokens(&mut self, bridge: &str) -> bool {
        self.bridge_tokens.remove(bridge).is_some()
    }

    pub fn ensure_registration_secret(&mut self) -> bool {
        if !self.registration_secret.is_empty() {
            return false;
        }
        self.registration_secret = generate_secret(TOKEN_LEN);
        true
    }

    pub fn double_puppet_secret(&self) -> String {
        format!("as_token:{}", self.double_puppet.as_token)
    }

    pub fn credentials_for(&self, bridge: &str) -> Option<&ApiCredentials> {
        self.credentials.get(bridge).filter(|c| c.is_complete())
    }

    pub fn set_credentials(&mut self, bridge: &str, creds: ApiCredentials) {
        self.credentials.insert(bridge.to_string(), creds);
    }

    pub fn synapse_port(&self) -> u16 {
        self.ports.synapse.unwrap_or(DEFAULT_SYNAPSE_PORT)
    }

    pub fn element_port(&self) -> u16 {
        self.ports
            .element
            .unwrap_or_else(|| default_element_port(self.synapse_port()))
    }

    /// Pick free ports for unset entries. Returns true when a value was chosen.
    pub fn ensure_ports(&mut self) -> bool {
        let mut changed = false;
        if self.ports.synapse.is_none() {
            let port = find_available_port(DEFAULT_SYNAPSE_PORT, &[]).unwrap_or(DEFAULT_SYNAPSE_PORT);
            self.ports.synapse = Some(port);
            changed = true;
        }
        if self.ports.element.is_none() {
            let synapse = self.synapse_port();
            let start = default_element_port(synapse);
            let port = find_available_port(start, &[synapse]).unwrap_or(start);
            self.ports.element = Some(port);
            changed = true;
        }
        changed
    }

    pub fn https_active(&self) -> bool {
        self.https.enabled && !self.https.domain.is_empty()
    }

    pub fn public_base_url(&self) -> String {
        if self.https_active() {
            format!("https://{}", self.https.domain)
        } else {
            format!("http://{}:{}", self.server_name, self.synapse_port())
        }
    }

    pub fn element_url(&self) -> String {
        if self.https_active() {
            format!("https://{}", self.https.domain)
        } else {
            format!("http://{}:{}", self.server_name, self.element_port())
        }
    }

    /// Homeserver address reachable from this host.
    pub fn local_homeserver_url(&self) -> String {
        format!("http://localhost:{}", self.synapse_port())
    }

    pub fn admin_user_id(&self) -> String {
        format!("@{}:{}", self.admin.username, self.server_name)
    }

    /// Copy with every secret replaced, for display.
    pub fn masked(&self) -> Self {
        fn mask(s: &str) -> String {
            if s.is_empty() {
                String::new()
            } else {
                "********".into()
            }
        }
        let mut out = self.clone();
        out.postgres.password = mask(&out.postgres.password);
        out.admin.password = mask(&out.admin.password);
        out.registration_secret = mask(&out.registration_secret);
        out.double_puppet.as_token = mask(&out.double_puppet.as_token);
        out.double_puppet.hs_token = mask(&out.double_puppet.hs_token);
        for pair in out.bridge_tokens.values_mut() {
            pair.as_token = mask(&pair.as_token);
            pair.hs_token = mask(&pair.hs_token);
        }
        for creds in out.credentials.values_mut() {
            creds.api_hash = mask(&creds.api_hash);
        }
        out
    }
}

fn reuse_or_issue(pair: &mut TokenPair) -> (TokenPair, bool) {
    if pair.is_complete() {
        return (pair.clone(), false);
    }
    *pair = TokenPair::generate();
    (pair.clone(), true)
}

fn default_element_port(synapse: u16) -> u16 {
    if synapse == DEFAULT_ELEMENT_PORT {
        DEFAULT_ELEMENT_PORT + 1
    } else {
        DEFAULT_ELEMENT_PORT
    }
}

pub fn port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// First bindable port in `start..start+100`, skipping `taken`.
pub fn find_available_port(start: u16, taken: &[u16]) -> Option<u16> {
    (0..PORT_SCAN_SPAN)
        .filter_map(|offset| start.checked_add(offset))
        .find(|p| !taken.contains(p) && port_available(*p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::embedded().unwrap()
    }

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("config"), tmp.path().join("data"));
        (tmp, paths)
    }

    #[test]
    fn secrets_have_requested_length_and_alphabet() {
        for len in [16, 32, 64] {
            let s = generate_secret(len);
            assert_eq!(s.len(), len);
            assert!(s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        assert_ne!(generate_secret(64), generate_secret(64));
    }

    #[test]
    fn load_reports_missing_and_malformed() {
        let (_tmp, paths) = temp_paths();
        assert!(matches!(
            Settings::load(&paths, &catalog()),
            Err(Error::NotFound(_))
        ));

        std::fs::create_dir_all(paths.config_dir()).unwrap();
        std::fs::write(paths.settings_file(), "server_name: [unclosed").unwrap();
        assert!(matches!(
            Settings::load(&paths, &catalog()),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn save_then_load_normalizes_bridges() {
        let (_tmp, paths) = temp_paths();
        let mut s = Settings::defaults("chat.lan", Connectivity::Private);
        s.enabled_bridges = vec![
            "signal".into(),
            "nonexistent".into(),
            "whatsapp".into(),
            "signal".into(),
        ];
        s.save(&paths).unwrap();
        assert!(paths.data_dir().join("postgres").is_dir());

        let loaded = Settings::load(&paths, &catalog()).unwrap();
        assert_eq!(loaded.enabled_bridges, vec!["signal", "whatsapp"]);
        assert_eq!(loaded.server_name, "chat.lan");
        assert_eq!(loaded.timings, Timings::default());
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (_tmp, paths) = temp_paths();
        Settings::defaults("localhost", Connectivity::Local)
            .save(&paths)
            .unwrap();
        let mode = std::fs::metadata(paths.settings_file())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        assert!(s.enable_bridge("signal"));
        assert!(!s.enable_bridge("signal"));
        assert_eq!(s.enabled_bridges, vec!["signal"]);
        assert!(s.disable_bridge("signal"));
        assert!(!s.disable_bridge("signal"));
        assert!(s.enabled_bridges.is_empty());
    }

    #[test]
    fn tokens_are_reused_until_a_half_goes_missing() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        let (first, issued) = s.issue_or_reuse("discord");
        assert!(issued);
        assert_eq!(first.as_token.len(), TOKEN_LEN);

        let (again, issued) = s.issue_or_reuse("discord");
        assert!(!issued);
        assert_eq!(again, first);

        s.bridge_tokens.get_mut("discord").unwrap().hs_token.clear();
        let (fresh, issued) = s.issue_or_reuse("discord");
        assert!(issued);
        assert_ne!(fresh.as_token, first.as_token);
        assert!(fresh.is_complete());
    }

    #[test]
    fn double_puppet_pair_follows_the_same_rule() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        let (a, issued) = s.issue_or_reuse_double_puppet();
        assert!(issued);
        let (b, issued) = s.issue_or_reuse_double_puppet();
        assert!(!issued);
        assert_eq!(a, b);
        assert_eq!(s.double_puppet_secret(), format!("as_token:{}", a.as_token));
    }

    #[test]
    fn element_port_moves_off_synapse_default_collision() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        s.ports.synapse = Some(8080);
        assert_eq!(s.element_port(), 8081);
        s.ports.synapse = Some(8008);
        assert_eq!(s.element_port(), 8080);
    }

    #[test]
    fn port_scan_skips_bound_ports() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let found = find_available_port(busy, &[]).unwrap();
        assert_ne!(found, busy);
        assert!(found > busy && found < busy.saturating_add(PORT_SCAN_SPAN));
    }

    #[test]
    fn ensure_ports_only_fills_unset_values() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        s.ports.synapse = Some(18008);
        s.ports.element = Some(18080);
        assert!(!s.ensure_ports());
        assert_eq!(s.synapse_port(), 18008);

        s.ports.element = None;
        assert!(s.ensure_ports());
        assert!(s.ports.element.is_some());
        assert_ne!(s.ports.element, Some(18008));
    }

    #[test]
    fn urls_follow_https_mode() {
        let mut s = Settings::defaults("chat.lan", Connectivity::Private);
        s.ports.synapse = Some(8008);
        s.ports.element = Some(8080);
        assert_eq!(s.public_base_url(), "http://chat.lan:8008");
        assert_eq!(s.element_url(), "http://chat.lan:8080");

        s.connectivity = Connectivity::Public;
        s.https = HttpsConfig {
            enabled: true,
            domain: "matrix.example.org".into(),
            email: "ops@example.org".into(),
        };
        assert_eq!(s.public_base_url(), "https://matrix.example.org");
    }

    #[test]
    fn https_is_dropped_outside_public_mode() {
        let https = HttpsConfig {
            enabled: true,
            domain: "matrix.example.org".into(),
            email: String::new(),
        };
        let s = Settings::defaults_for(Connectivity::Private, "chat.lan", Some(https.clone()));
        assert!(!s.https_active());
        let s = Settings::defaults_for(Connectivity::Public, "example.org", Some(https));
        assert!(s.https_active());
        assert_eq!(s.server_name, "example.org");
    }

    #[test]
    fn masked_copy_hides_secrets() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        s.issue_or_reuse("signal");
        let masked = s.masked();
        assert_eq!(masked.postgres.password, "********");
        assert_eq!(masked.bridge_tokens["signal"].as_token, "********");
        assert_eq!(masked.server_name, s.server_name);
    }
}
