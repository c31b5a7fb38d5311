// ABOUTME: HTTP client for the Synapse admin API (users, rooms) and the room endpoints.
// ABOUTME: Also provides fetch_all, a lazily paginated stream over the remote directory.

use crate::config::Config;
use crate::entity::{Entity, EntityKind};
use crate::error::{FleetError, Lookup};
use crate::traits::{RemoteDirectory, RoomCreation, RoomService};
use crate::utils::room_alias_local_part;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};

const USERS_PATH: &[&str] = &["_synapse", "admin", "v2", "users"];
const ROOMS_PATH: &[&str] = &["_synapse", "admin", "v1", "rooms"];
const CLIENT_PATH: &[&str] = &["_matrix", "client", "v3"];

/// Talks to the home server with an administrator's access token
#[derive(Clone)]
pub struct RemoteDirectoryClient {
    base_url: Url,
    admin_token: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for RemoteDirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDirectoryClient")
            .field("base_url", &self.base_url.as_str())
            .field("admin_token", &"[REDACTED]")
            .finish()
    }
}

impl RemoteDirectoryClient {
    pub fn new(
        home_server: &str,
        admin_token: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, FleetError> {
        let base_url = Url::parse(home_server)
            .map_err(|e| FleetError::Config(format!("invalid home server URL '{}': {}", home_server, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FleetError::Config(format!(
                "home server URL '{}' cannot carry a path",
                home_server
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Transport(e.to_string()))?;
        Ok(Self {
            base_url,
            admin_token: admin_token.into(),
            http,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, FleetError> {
        Self::new(
            &config.messenger.home_server,
            config.messenger.admin_access_token.clone(),
            config.request_timeout(),
        )
    }

    /// Base URL plus percent-encoded path segments
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn entity_path(kind: EntityKind) -> &'static [&'static str] {
        match kind {
            EntityKind::Resident => USERS_PATH,
            EntityKind::Group => ROOMS_PATH,
        }
    }

    /// Key of the entity array in a list response
    fn list_key(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Resident => "users",
            EntityKind::Group => "rooms",
        }
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, FleetError> {
        tracing::debug!(method = %method, path = %url.path(), "Directory request");
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.admin_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Turn a non-success response into `FleetError::Remote` with its body
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, FleetError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FleetError::Remote {
            status: status.as_u16(),
            body,
        })
    }

    async fn json_body(response: reqwest::Response, context: &str) -> Result<Value, FleetError> {
        response
            .json::<Value>()
            .await
            .map_err(|e| FleetError::decode(context, e))
    }

    async fn get_optional(&self, url: Url, context: &str) -> Result<Lookup<Value>, FleetError> {
        let response = self.send(Method::GET, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Lookup::NotFound);
        }
        let response = Self::check(response).await?;
        Ok(Lookup::Found(Self::json_body(response, context).await?))
    }
}

#[async_trait]
impl RemoteDirectory for RemoteDirectoryClient {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        from: u64,
        limit: u64,
    ) -> Result<Vec<Value>, FleetError> {
        let mut url = self.endpoint(Self::entity_path(kind));
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("from", &from.to_string())
                .append_pair("limit", &limit.to_string());
            if kind == EntityKind::Resident {
                query.append_pair("guests", "false");
            }
        }

        let response = Self::check(self.send(Method::GET, url, None).await?).await?;
        let mut body = Self::json_body(response, Self::list_key(kind)).await?;
        match body.get_mut(Self::list_key(kind)).map(Value::take) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(FleetError::decode(
                Self::list_key(kind),
                format!("expected an array, got {}", other),
            )),
        }
    }

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<Lookup<Value>, FleetError> {
        let mut segments: Vec<&str> = Self::entity_path(kind).to_vec();
        segments.push(id);
        self.get_optional(self.endpoint(&segments), kind.as_str())
            .await
    }

    async fn put(&self, kind: EntityKind, id: &str, body: &Value) -> Result<(), FleetError> {
        if kind != EntityKind::Resident {
            return Err(FleetError::Unsupported(format!("registering a {}", kind)));
        }
        let mut segments: Vec<&str> = USERS_PATH.to_vec();
        segments.push(id);
        let url = self.endpoint(&segments);
        Self::check(self.send(Method::PUT, url, Some(body)).await?).await?;
        tracing::info!(kind = %kind, entity = %id, "Remote entity registered or updated");
        Ok(())
    }
}

#[async_trait]
impl RoomService for RemoteDirectoryClient {
    async fn resolve_alias(&self, alias: &str) -> Result<Lookup<String>, FleetError> {
        let mut segments: Vec<&str> = CLIENT_PATH.to_vec();
        segments.extend(["directory", "room", alias]);
        let found = self
            .get_optional(self.endpoint(&segments), "room alias")
            .await?;
        match found {
            Lookup::NotFound => Ok(Lookup::NotFound),
            Lookup::Found(body) => body
                .get("room_id")
                .and_then(Value::as_str)
                .map(|id| Lookup::Found(id.to_string()))
                .ok_or_else(|| FleetError::decode("room alias", "response has no room_id")),
        }
    }

    async fn create_room(&self, request: &RoomCreation) -> Result<String, FleetError> {
        let mut segments: Vec<&str> = CLIENT_PATH.to_vec();
        segments.push("createRoom");
        let body = json!({
            "preset": "public_chat",
            "visibility": "public",
            "room_alias_name": room_alias_local_part(&request.alias),
            "name": request.name,
            "topic": request.topic,
            "creation_content": { "m.federate": true },
        });
        let response =
            Self::check(self.send(Method::POST, self.endpoint(&segments), Some(&body)).await?)
                .await?;
        let body = Self::json_body(response, "createRoom").await?;
        body.get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FleetError::decode("createRoom", "response has no room_id"))
    }

    async fn joined_members(&self, room_id: &str) -> Result<HashSet<String>, FleetError> {
        let mut segments: Vec<&str> = CLIENT_PATH.to_vec();
        segments.extend(["rooms", room_id, "joined_members"]);
        let response =
            Self::check(self.send(Method::GET, self.endpoint(&segments), None).await?).await?;
        let body = Self::json_body(response, "joined_members").await?;
        Ok(body
            .get("joined")
            .and_then(Value::as_object)
            .map(|joined| joined.keys().cloned().collect())
            .unwrap_or_default())
    }
}

struct PageCursor {
    from: u64,
    buffered: VecDeque<Value>,
    done: bool,
}

/// Every raw entity of a kind, one page at a time.
///
/// Pages are requested lazily from offset 0 until an empty page. A failed
/// page request yields its error once and ends the stream; items already
/// yielded stay valid.
pub fn fetch_all(
    directory: &dyn RemoteDirectory,
    kind: EntityKind,
    page_size: u64,
) -> BoxStream<'_, Result<Value, FleetError>> {
    let limit = page_size.max(1);
    let cursor = PageCursor {
        from: 0,
        buffered: VecDeque::new(),
        done: false,
    };
    stream::unfold(cursor, move |mut cursor| async move {
        loop {
            if let Some(item) = cursor.buffered.pop_front() {
                return Some((Ok(item), cursor));
            }
            if cursor.done {
                return None;
            }
            match directory.fetch_page(kind, cursor.from, limit).await {
                Ok(page) if page.is_empty() => cursor.done = true,
                Ok(page) => {
                    tracing::debug!(kind = %kind, from = cursor.from, count = page.len(), "Fetched directory page");
                    cursor.from += page.len() as u64;
                    cursor.buffered.extend(page);
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, from = cursor.from, error = %e, "Directory page fetch failed");
                    cursor.done = true;
                    return Some((Err(e), cursor));
                }
            }
        }
    })
    .boxed()
}

/// One entry of a typed directory walk
#[derive(Debug)]
pub enum DirectoryItem<S> {
    Snapshot(S),
    /// The page arrived but this entry did not match the snapshot shape
    Undecodable(FleetError),
}

/// `fetch_all` decoded into typed snapshots.
///
/// An undecodable entry is yielded as `DirectoryItem::Undecodable` and the
/// walk continues. An `Err` is always a failed page and ends the stream.
pub fn fetch_all_snapshots<E: Entity>(
    directory: &dyn RemoteDirectory,
    page_size: u64,
) -> BoxStream<'_, Result<DirectoryItem<E::Snapshot>, FleetError>> {
    fetch_all(directory, E::KIND, page_size)
        .map(|item| {
            item.map(|value| match serde_json::from_value::<E::Snapshot>(value) {
                Ok(snapshot) => DirectoryItem::Snapshot(snapshot),
                Err(e) => {
                    DirectoryItem::Undecodable(FleetError::decode(format!("{} snapshot", E::KIND), e))
                }
            })
        })
        .boxed()
}
