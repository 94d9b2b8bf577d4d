//! Typed shapes of the generated service configuration files.

use crate::bridges::BridgeDescriptor;
use crate::config::{Settings, TokenPair};
use serde::Serialize;
use std::collections::BTreeMap;

/// Homeserver address as seen from other containers.
pub const SYNAPSE_INTERNAL_URL: &str = "http://synapse:8008";
pub const SYNAPSE_LISTEN_PORT: u16 = 8008;

/// Container path where bridge registrations are mounted into synapse.
const SYNAPSE_BRIDGES_MOUNT: &str = "/bridges";
const DOUBLE_PUPPET_REGISTRATION: &str = "/data/doublepuppet-registration.yaml";

#[derive(Debug, Serialize)]
pub struct Homeserver {
    pub server_name: String,
    pub pid_file: &'static str,
    pub public_baseurl: String,
    pub listeners: Vec<Listener>,
    pub database: Database,
    pub log_config: &'static str,
    pub media_store_path: &'static str,
    pub signing_key_path: String,
    pub registration_shared_secret: String,
    pub enable_registration: bool,
    pub report_stats: bool,
    pub serve_server_wellknown: bool,
    pub trusted_key_servers: Vec<KeyServer>,
    pub suppress_key_server_warning: bool,
    pub app_service_config_files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Listener {
    pub port: u16,
    pub tls: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub x_forwarded: bool,
    pub bind_addresses: Vec<&'static str>,
    pub resources: Vec<ListenerResource>,
}

#[derive(Debug, Serialize)]
pub struct ListenerResource {
    pub names: Vec<&'static str>,
    pub compress: bool,
}

#[derive(Debug, Serialize)]
pub struct Database {
    pub name: &'static str,
    pub args: DatabaseArgs,
}

#[derive(Debug, Serialize)]
pub struct DatabaseArgs {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: &'static str,
    pub cp_min: u32,
    pub cp_max: u32,
}

#[derive(Debug, Serialize)]
pub struct KeyServer {
    pub server_name: &'static str,
}

pub fn homeserver(settings: &Settings) -> Homeserver {
    let mut app_services: Vec<String> = settings
        .enabled_bridges
        .iter()
        .map(|b| format!("{SYNAPSE_BRIDGES_MOUNT}/{b}/registration.yaml"))
        .collect();
    app_services.push(DOUBLE_PUPPET_REGISTRATION.to_string());

    Homeserver {
        server_name: settings.server_name.clone(),
        pid_file: "/data/homeserver.pid",
        public_baseurl: settings.public_base_url(),
        listeners: vec![Listener {
            port: SYNAPSE_LISTEN_PORT,
            tls: false,
            kind: "http",
            x_forwarded: settings.https_active(),
            bind_addresses: vec!["0.0.0.0"],
            resources: vec![ListenerResource {
                names: vec!["client", "federation"],
                compress: false,
            }],
        }],
        database: Database {
            name: "psycopg2",
            args: DatabaseArgs {
                user: settings.postgres.user.clone(),
                password: settings.postgres.password.clone(),
                database: settings.postgres.database.clone(),
                host: "postgres",
                cp_min: 5,
                cp_max: 10,
            },
        },
        log_config: "/config/log.config",
        media_store_path: "/data/media_store",
        signing_key_path: format!("/data/{}.signing.key", settings.server_name),
        registration_shared_secret: settings.registration_secret.clone(),
        enable_registration: false,
        report_stats: false,
        serve_server_wellknown: settings.https_active(),
        trusted_key_servers: vec![KeyServer {
            server_name: "matrix.org",
        }],
        suppress_key_server_warning: true,
        app_service_config_files: app_services,
    }
}

pub const SYNAPSE_LOG_CONFIG: &str = "\
version: 1
formatters:
  precise:
    format: '%(asctime)s - %(name)s - %(lineno)d - %(levelname)s - %(request)s - %(message)s'
handlers:
  console:
    class: logging.StreamHandler
    formatter: precise
loggers:
  synapse.storage.SQL:
    level: WARNING
root:
  level: INFO
  handlers: [console]
disable_existing_loggers: false
";

/// Appservice registration read by the homeserver and the bridge.
#[derive(Debug, Serialize)]
pub struct Registration {
    pub id: String,
    pub url: Option<String>,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    pub rate_limited: bool,
    pub namespaces: Namespaces,
    #[serde(rename = "de.sorunome.msc2409.push_ephemeral", skip_serializing_if = "Option::is_none")]
    pub push_ephemeral: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_ephemeral: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct Namespaces {
    pub users: Vec<Namespace>,
}

#[derive(Debug, Serialize)]
pub struct Namespace {
    pub regex: String,
    pub exclusive: bool,
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if ".+*?^$()[]{}|\\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn bridge_registration(
    desc: &BridgeDescriptor,
    tokens: &TokenPair,
    server_name: &str,
) -> Registration {
    let server = escape_regex(server_name);
    Registration {
        id: desc.name.clone(),
        url: Some(format!("http://{}:{}", desc.service_name(), desc.port)),
        as_token: tokens.as_token.clone(),
        hs_token: tokens.hs_token.clone(),
        sender_localpart: desc.bot_username(),
        rate_limited: false,
        namespaces: Namespaces {
            users: vec![
                Namespace {
                    regex: format!("^@{}:{server}$", escape_regex(&desc.bot_username())),
                    exclusive: true,
                },
                Namespace {
                    regex: format!("^@{}.*:{server}$", escape_regex(&desc.namespace_prefix())),
                    exclusive: true,
                },
            ],
        },
        push_ephemeral: Some(true),
        receive_ephemeral: Some(true),
    }
}

/// Pseudo-appservice that lets bridges log in as local users.
pub fn double_puppet_registration(tokens: &TokenPair, server_name: &str) -> Registration {
    Registration {
        id: "doublepuppet".into(),
        url: None,
        as_token: tokens.as_token.clone(),
        hs_token: tokens.hs_token.clone(),
        sender_localpart: "doublepuppet".into(),
        rate_limited: false,
        namespaces: Namespaces {
            users: vec![Namespace {
                regex: format!("@.*:{}", escape_regex(server_name)),
                exclusive: false,
            }],
        },
        push_ephemeral: None,
        receive_ephemeral: None,
    }
}

#[derive(Debug, Serialize)]
pub struct BridgeConfig {
    pub homeserver: BridgeHomeserver,
    pub appservice: BridgeAppservice,
    pub database: BridgeDatabase,
    pub bridge: BridgePermissions,
    pub double_puppet: DoublePuppet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkCredentials>,
    pub logging: BridgeLogging,
}

#[derive(Debug, Serialize)]
pub struct BridgeHomeserver {
    pub address: &'static str,
    pub domain: String,
}

#[derive(Debug, Serialize)]
pub struct BridgeAppservice {
    pub address: String,
    pub hostname: &'static str,
    pub port: u16,
    pub id: String,
    pub bot: BridgeBot,
    pub as_token: String,
    pub hs_token: String,
    pub username_template: String,
}

#[derive(Debug, Serialize)]
pub struct BridgeBot {
    pub username: String,
    pub displayname: String,
}

#[derive(Debug, Serialize)]
pub struct BridgeDatabase {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct BridgePermissions {
    pub permissions: BTreeMap<String, &'static str>,
}

#[derive(Debug, Serialize)]
pub struct DoublePuppet {
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct NetworkCredentials {
    pub api_id: String,
    pub api_hash: String,
}

#[derive(Debug, Serialize)]
pub struct BridgeLogging {
    pub min_level: &'static str,
    pub writers: Vec<LogWriter>,
}

#[derive(Debug, Serialize)]
pub struct LogWriter {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub format: &'static str,
}

pub fn bridge_config(desc: &BridgeDescriptor, tokens: &TokenPair, settings: &Settings) -> BridgeConfig {
    let server = settings.server_name.clone();
    let mut permissions = BTreeMap::new();
    permissions.insert("*".to_string(), "relay");
    permissions.insert(server.clone(), "user");
    permissions.insert(settings.admin_user_id(), "admin");

    let mut secrets = BTreeMap::new();
    secrets.insert(server.clone(), settings.double_puppet_secret());

    let network = if desc.requires_credentials {
        let creds = settings.credentials.get(&desc.name).cloned().unwrap_or_default();
        Some(NetworkCredentials {
            api_id: creds.api_id,
            api_hash: creds.api_hash,
        })
    } else {
        None
    };

    BridgeConfig {
        homeserver: BridgeHomeserver {
            address: SYNAPSE_INTERNAL_URL,
            domain: server,
        },
        appservice: BridgeAppservice {
            address: format!("http://{}:{}", desc.service_name(), desc.port),
            hostname: "0.0.0.0",
            port: desc.port,
            id: desc.name.clone(),
            bot: BridgeBot {
                username: desc.bot_username(),
                displayname: format!("{} bridge bot", desc.name),
            },
            as_token: tokens.as_token.clone(),
            hs_token: tokens.hs_token.clone(),
            username_template: format!("{}{{{{.}}}}", desc.namespace_prefix()),
        },
        database: BridgeDatabase {
            kind: "sqlite3-fk-wal",
            uri: format!("file:/data/{}.db?_txlock=immediate", desc.service_name()),
        },
        bridge: BridgePermissions { permissions },
        double_puppet: DoublePuppet { secrets },
        network,
        logging: BridgeLogging {
            min_level: "info",
            writers: vec![LogWriter {
                kind: "stdout",
                format: "pretty",
            }],
        },
    }
}

#[derive(Debug, Serialize)]
pub struct ElementConfig {
    pub default_server_config: ElementServerConfig,
    pub brand: &'static str,
    pub disable_guests: bool,
    pub disable_custom_urls: bool,
    pub default_theme: &'static str,
    pub room_directory: ElementRoomDirectory,
}

#[derive(Debug, Serialize)]
pub struct ElementServerConfig {
    #[serde(rename = "m.homeserver")]
    pub homeserver: ElementHomeserver,
}

#[derive(Debug, Serialize)]
pub struct ElementHomeserver {
    pub base_url: String,
    pub server_name: String,
}

#[derive(Debug, Serialize)]
pub struct ElementRoomDirectory {
    pub servers: Vec<String>,
}

pub fn element(settings: &Settings) -> ElementConfig {
    ElementConfig {
        default_server_config: ElementServerConfig {
            homeserver: ElementHomeserver {
                base_url: settings.public_base_url(),
                server_name: settings.server_name.clone(),
            },
        },
        brand: "Element",
        disable_guests: true,
        disable_custom_urls: false,
        default_theme: "dark",
        room_directory: ElementRoomDirectory {
            servers: vec![settings.server_name.clone()],
        },
    }
}

pub fn caddyfile(settings: &Settings) -> String {
    let domain = &settings.https.domain;
    let mut out = String::new();
    if !settings.https.email.is_empty() {
        out.push_str(&format!("{{\n    email {}\n}}\n\n", settings.https.email));
    }
    out.push_str(&format!("{domain} {{\n"));
    out.push_str("    reverse_proxy /_matrix/* synapse:8008\n");
    out.push_str("    reverse_proxy /_synapse/client/* synapse:8008\n");
    if settings.element_enabled() {
        out.push_str("    reverse_proxy element:80\n");
    }
    out.push_str("}\n\n");
    out.push_str(&format!("{domain}:8448 {{\n    reverse_proxy synapse:8008\n}}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::Catalog;
    use crate::config::Connectivity;

    #[test]
    fn regex_escaping_covers_dots() {
        assert_eq!(escape_regex("chat.example.org"), "chat\\.example\\.org");
    }

    #[test]
    fn registration_namespaces_are_exclusive_to_the_bridge() {
        let catalog = Catalog::embedded().unwrap();
        let desc = catalog.get("signal").unwrap();
        let reg = bridge_registration(desc, &TokenPair::generate(), "chat.lan");
        assert_eq!(reg.url.as_deref(), Some("http://mautrix-signal:29328"));
        assert_eq!(reg.namespaces.users[0].regex, "^@signalbot:chat\\.lan$");
        assert_eq!(reg.namespaces.users[1].regex, "^@signal_.*:chat\\.lan$");
    }

    #[test]
    fn homeserver_lists_bridges_then_double_puppet() {
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        s.enabled_bridges = vec!["whatsapp".into(), "signal".into()];
        let hs = homeserver(&s);
        assert_eq!(
            hs.app_service_config_files,
            vec![
                "/bridges/whatsapp/registration.yaml",
                "/bridges/signal/registration.yaml",
                "/data/doublepuppet-registration.yaml",
            ]
        );
    }

    #[test]
    fn credentialed_bridges_get_a_network_block() {
        let catalog = Catalog::embedded().unwrap();
        let mut s = Settings::defaults("localhost", Connectivity::Local);
        s.set_credentials(
            "telegram",
            crate::config::ApiCredentials {
                api_id: "123".into(),
                api_hash: "abc".into(),
            },
        );
        let tokens = TokenPair::generate();
        let cfg = bridge_config(catalog.get("telegram").unwrap(), &tokens, &s);
        assert_eq!(cfg.network.as_ref().map(|n| n.api_id.as_str()), Some("123"));
        assert!(bridge_config(catalog.get("signal").unwrap(), &tokens, &s)
            .network
            .is_none());
        assert_eq!(cfg.appservice.username_template, "telegram_{{.}}");
    }

    #[test]
    fn caddyfile_omits_element_when_disabled() {
        let mut s = Settings::defaults("matrix.example.org", Connectivity::Public);
        s.https.enabled = true;
        s.https.domain = "matrix.example.org".into();
        assert!(caddyfile(&s).contains("reverse_proxy element:80"));
        s.element_enabled = Some(false);
        let out = caddyfile(&s);
        assert!(!out.contains("element:80"));
        assert!(out.starts_with("matrix.example.org {"));
    }
}
