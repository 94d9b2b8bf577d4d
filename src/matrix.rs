//! Minimal client-server API client used to open bot conversations.

use crate::bridges::Catalog;
use crate::config::Settings;
use crate::error::{self, BestEffortError, Error, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct JoinedRooms {
    joined_rooms: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JoinedMembers {
    joined: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    room_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

pub struct MatrixClient {
    http: reqwest::Client,
    base: Url,
    access_token: Option<String>,
}

impl MatrixClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| Error::Matrix {
            status: 0,
            message: format!("invalid homeserver url {base_url}: {e}"),
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("muxbee/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base,
            access_token: None,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Matrix {
                status: 0,
                message: format!("homeserver url {} cannot be a base", self.base),
            })?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body: ApiError = resp.json().await.unwrap_or_default();
            let message = match (body.errcode.is_empty(), body.error.is_empty()) {
                (false, false) => format!("{}: {}", body.errcode, body.error),
                (true, false) => body.error,
                (false, true) => body.errcode,
                (true, true) => status.to_string(),
            };
            return Err(Error::Matrix {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": username },
            "password": password,
            "initial_device_display_name": "muxbee",
        });
        let url = self.endpoint(&["login"])?;
        let resp: LoginResponse = self.send(self.http.post(url).json(&body)).await?;
        self.access_token = Some(resp.access_token);
        Ok(())
    }

    pub async fn joined_rooms(&self) -> Result<Vec<String>> {
        let url = self.endpoint(&["joined_rooms"])?;
        let resp: JoinedRooms = self.send(self.http.get(url)).await?;
        Ok(resp.joined_rooms)
    }

    pub async fn joined_members(&self, room_id: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&["rooms", room_id, "joined_members"])?;
        let resp: JoinedMembers = self.send(self.http.get(url)).await?;
        Ok(resp.joined.into_keys().collect())
    }

    pub async fn create_direct_room(&self, user_id: &str) -> Result<String> {
        let body = json!({
            "preset": "trusted_private_chat",
            "is_direct": true,
            "invite": [user_id],
        });
        let url = self.endpoint(&["createRoom"])?;
        let resp: CreateRoomResponse = self.send(self.http.post(url).json(&body)).await?;
        Ok(resp.room_id)
    }

    pub async fn send_text(&self, room_id: &str, body: &str) -> Result<()> {
        let txn = format!("muxbee-{}", rand::random::<u64>());
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", &txn])?;
        let payload = json!({ "msgtype": "m.text", "body": body });
        let _: serde_json::Value = self.send(self.http.put(url).json(&payload)).await?;
        Ok(())
    }

    /// A joined room whose only members are us and `user_id`.
    pub async fn find_direct_room(&self, user_id: &str) -> Result<Option<String>> {
        for room in self.joined_rooms().await? {
            match self.joined_members(&room).await {
                Ok(members) if is_direct_with(&members, user_id) => return Ok(Some(room)),
                Ok(_) => {}
                Err(e) => tracing::debug!(room = %room, error = %e, "skipping room"),
            }
        }
        Ok(None)
    }

    /// Existing DM or a new one; the flag is true when the room was created.
    pub async fn direct_room(&self, user_id: &str) -> Result<(String, bool)> {
        if let Some(room) = self.find_direct_room(user_id).await? {
            return Ok((room, false));
        }
        Ok((self.create_direct_room(user_id).await?, true))
    }

    pub async fn leave_and_forget(&self, room_id: &str) -> Result<()> {
        let leave = self.endpoint(&["rooms", room_id, "leave"])?;
        let _: serde_json::Value = self.send(self.http.post(leave).json(&json!({}))).await?;
        let forget = self.endpoint(&["rooms", room_id, "forget"])?;
        let _: serde_json::Value = self.send(self.http.post(forget).json(&json!({}))).await?;
        Ok(())
    }
}

fn is_direct_with(members: &[String], user_id: &str) -> bool {
    members.len() == 2 && members.iter().any(|m| m == user_id)
}

/// GET `url` and return the status code.
pub async fn probe(url: &str) -> Result<reqwest::StatusCode> {
    let client = reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build()?;
    Ok(client.get(url).send().await?.status())
}

/// Conversations between the admin account and bridge bots.
#[async_trait]
pub trait BotConversations: Send + Sync {
    /// Open a DM with each bridge bot, greeting only newly created rooms.
    async fn setup_bots(&self, settings: &Settings, bridges: &[String]) -> Vec<BestEffortError>;

    /// Leave the DM with a bridge bot.
    async fn cleanup_bot(&self, settings: &Settings, bridge: &str) -> std::result::Result<(), BestEffortError>;
}

pub struct MatrixBots {
    catalog: Arc<Catalog>,
}

impl MatrixBots {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    async fn admin_client(settings: &Settings) -> Result<MatrixClient> {
        let mut client = MatrixClient::new(&settings.local_homeserver_url())?;
        client
            .login(&settings.admin.username, &settings.admin.password)
            .await?;
        Ok(client)
    }
}

const SETUP_STEP: &str = "Setting up bot conversations";
const CLEANUP_STEP: &str = "Leaving bot conversation";

#[async_trait]
impl BotConversations for MatrixBots {
    async fn setup_bots(&self, settings: &Settings, bridges: &[String]) -> Vec<BestEffortError> {
        if bridges.is_empty() {
            return Vec::new();
        }
        let client = match Self::admin_client(settings).await {
            Ok(c) => c,
            Err(e) => return vec![BestEffortError::new(SETUP_STEP, None, error::chain(&e))],
        };

        let mut failures = Vec::new();
        for name in bridges {
            let Some(desc) = self.catalog.get(name) else {
                continue;
            };
            let bot = desc.bot_user_id(&settings.server_name);
            match client.direct_room(&bot).await {
                Ok((room, true)) => {
                    tracing::info!(bridge = %name, room = %room, "opened bot conversation");
                    let greeting = desc.welcome.as_deref().unwrap_or("help");
                    if let Err(e) = client.send_text(&room, greeting).await {
                        failures.push(BestEffortError::new(
                            SETUP_STEP,
                            Some(desc.service_name()),
                            error::chain(&e),
                        ));
                    }
                }
                Ok((_, false)) => tracing::debug!(bridge = %name, "bot conversation exists"),
                Err(e) => failures.push(BestEffortError::new(
                    SETUP_STEP,
                    Some(desc.service_name()),
                    error::chain(&e),
                )),
            }
        }
        failures
    }

    async fn cleanup_bot(&self, settings: &Settings, bridge: &str) -> std::result::Result<(), BestEffortError> {
        let service = Some(format!("{}{bridge}", crate::bridges::SERVICE_PREFIX));
        let fail = |e: Error| BestEffortError::new(CLEANUP_STEP, service.clone(), error::chain(&e));
        let desc = self.catalog.require(bridge).map_err(fail)?;
        let client = Self::admin_client(settings).await.map_err(fail)?;
        let bot = desc.bot_user_id(&settings.server_name);
        match client.find_direct_room(&bot).await.map_err(fail)? {
            Some(room) => client.leave_and_forget(&room).await.map_err(fail),
            None => Err(BestEffortError::new(
                CLEANUP_STEP,
                service.clone(),
                format!("no conversation with {bot} found"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_rooms_have_exactly_two_members() {
        let bot = "@signalbot:localhost";
        assert!(is_direct_with(&["@admin:localhost".into(), bot.into()], bot));
        assert!(!is_direct_with(&[bot.into()], bot));
        assert!(!is_direct_with(
            &["@admin:localhost".into(), bot.into(), "@other:localhost".into()],
            bot
        ));
        assert!(!is_direct_with(
            &["@admin:localhost".into(), "@other:localhost".into()],
            bot
        ));
    }

    #[test]
    fn endpoints_escape_room_ids() {
        let client = MatrixClient::new("http://localhost:8008").unwrap();
        let url = client
            .endpoint(&["rooms", "!abc:localhost", "send", "m.room.message", "t1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8008/_matrix/client/v3/rooms/!abc:localhost/send/m.room.message/t1"
        );
        let login = client.endpoint(&["login"]).unwrap();
        assert_eq!(login.path(), "/_matrix/client/v3/login");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            MatrixClient::new("not a url"),
            Err(Error::Matrix { status: 0, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_homeserver_is_a_best_effort_failure() {
        let catalog = Arc::new(Catalog::embedded().unwrap());
        let bots = MatrixBots::new(catalog);
        let mut settings = Settings::defaults("localhost", crate::config::Connectivity::Local);
        settings.ports.synapse = Some(1);
        let failures = bots.setup_bots(&settings, &["signal".into()]).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, SETUP_STEP);
        assert!(bots.setup_bots(&settings, &[]).await.is_empty());
    }
}
