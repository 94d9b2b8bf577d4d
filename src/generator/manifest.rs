//! Compose manifest covering every service the stack can run.
//!
//! Optional services sit behind profiles; the driver activates them per run.

use crate::bridges::Catalog;
use crate::config::Settings;
use serde::Serialize;
use std::collections::BTreeMap;

pub const ELEMENT_PROFILE: &str = "element";
pub const HTTPS_PROFILE: &str = "https";

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub services: BTreeMap<String, Service>,
}

#[derive(Debug, Default, Serialize)]
pub struct Service {
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    pub restart: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Serialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: &'static str,
    pub timeout: &'static str,
    pub retries: u32,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn manifest(settings: &Settings, catalog: &Catalog) -> Manifest {
    let mut services = BTreeMap::new();

    let mut pg_env = BTreeMap::new();
    pg_env.insert("POSTGRES_USER".into(), settings.postgres.user.clone());
    pg_env.insert("POSTGRES_PASSWORD".into(), "${POSTGRES_PASSWORD}".into());
    pg_env.insert("POSTGRES_DB".into(), settings.postgres.database.clone());
    pg_env.insert(
        "POSTGRES_INITDB_ARGS".into(),
        "--encoding=UTF-8 --lc-collate=C --lc-ctype=C".into(),
    );
    services.insert(
        "postgres".to_string(),
        Service {
            image: "postgres:17".into(),
            restart: "unless-stopped",
            environment: pg_env,
            volumes: strings(&["${DATA_DIR}/postgres:/var/lib/postgresql/data"]),
            healthcheck: Some(Healthcheck {
                test: vec![
                    "CMD-SHELL".into(),
                    format!("pg_isready -U {}", settings.postgres.user),
                ],
                interval: "10s",
                timeout: "5s",
                retries: 5,
            }),
            ..Default::default()
        },
    );

    let mut synapse_env = BTreeMap::new();
    synapse_env.insert(
        "SYNAPSE_CONFIG_PATH".into(),
        "/config/homeserver.yaml".into(),
    );
    services.insert(
        "synapse".to_string(),
        Service {
            image: "matrixdotorg/synapse:latest".into(),
            restart: "unless-stopped",
            environment: synapse_env,
            volumes: strings(&[
                "${CONFIG_DIR}/synapse:/config",
                "${CONFIG_DIR}/bridges:/bridges:ro",
                "${DATA_DIR}/synapse:/data",
            ]),
            ports: strings(&["${SYNAPSE_PORT}:8008"]),
            depends_on: strings(&["postgres"]),
            healthcheck: Some(Healthcheck {
                test: strings(&["CMD", "curl", "-fSs", "http://localhost:8008/health"]),
                interval: "15s",
                timeout: "5s",
                retries: 3,
            }),
            ..Default::default()
        },
    );

    services.insert(
        "element".to_string(),
        Service {
            image: "vectorim/element-web:latest".into(),
            profiles: strings(&[ELEMENT_PROFILE]),
            restart: "unless-stopped",
            volumes: strings(&["${CONFIG_DIR}/element/config.json:/app/config.json:ro"]),
            ports: strings(&["${ELEMENT_PORT}:80"]),
            ..Default::default()
        },
    );

    services.insert(
        "caddy".to_string(),
        Service {
            image: "caddy:2".into(),
            profiles: strings(&[HTTPS_PROFILE]),
            restart: "unless-stopped",
            volumes: strings(&[
                "${CONFIG_DIR}/caddy/Caddyfile:/etc/caddy/Caddyfile:ro",
                "${DATA_DIR}/caddy:/data",
            ]),
            ports: strings(&["80:80", "443:443", "8448:8448"]),
            depends_on: strings(&["synapse"]),
            ..Default::default()
        },
    );

    for desc in catalog.iter() {
        services.insert(
            desc.service_name(),
            Service {
                image: desc.image(),
                profiles: vec![desc.name.clone()],
                restart: "unless-stopped",
                volumes: vec![format!("${{DATA_DIR}}/bridges/{}:/data", desc.name)],
                depends_on: strings(&["synapse"]),
                ..Default::default()
            },
        );
    }

    Manifest { services }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Connectivity;

    #[test]
    fn every_bridge_gets_its_own_profile() {
        let catalog = Catalog::embedded().unwrap();
        let m = manifest(&Settings::defaults("localhost", Connectivity::Local), &catalog);
        for desc in catalog.iter() {
            let svc = &m.services[&desc.service_name()];
            assert_eq!(svc.profiles, vec![desc.name.clone()]);
            assert_eq!(
                svc.volumes,
                vec![format!("${{DATA_DIR}}/bridges/{}:/data", desc.name)]
            );
        }
        assert!(m.services["synapse"].profiles.is_empty());
        assert_eq!(m.services["element"].profiles, vec!["element"]);
        assert_eq!(m.services["caddy"].profiles, vec!["https"]);
    }

    #[test]
    fn secrets_stay_interpolated() {
        let catalog = Catalog::embedded().unwrap();
        let s = Settings::defaults("localhost", Connectivity::Local);
        let yaml = serde_yaml::to_string(&manifest(&s, &catalog)).unwrap();
        assert!(yaml.contains("${POSTGRES_PASSWORD}"));
        assert!(!yaml.contains(&s.postgres.password));
    }
}
