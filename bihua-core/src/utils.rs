// ABOUTME: Small helpers for Matrix identifiers, media URIs and timestamps.
// ABOUTME: Pure functions shared by the entity mapping, the room service and the orchestrator.

/// Milliseconds since the Unix epoch
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Host part of a home server URL, used as the server name when none is configured.
///
/// `https://matrix.example.org:8448/` becomes `matrix.example.org:8448`.
pub fn server_name_from_url(home_server: &str) -> Option<String> {
    let rest = home_server
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(home_server);
    let host = rest.split('/').next().unwrap_or_default().trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Convert an `mxc://server/media` URI to a download URL on the home server.
/// Values that are not mxc URIs are returned unchanged.
pub fn mxc_to_http(home_server: &str, uri: &str) -> String {
    let Some(rest) = uri.strip_prefix("mxc://") else {
        return uri.to_string();
    };
    let Some((server, media_id)) = rest.split_once('/') else {
        return uri.to_string();
    };
    format!(
        "{}/_matrix/media/v3/download/{}/{}",
        home_server.trim_end_matches('/'),
        server,
        media_id
    )
}

/// Fully qualify a room alias: `lobby` becomes `#lobby:server`
pub fn qualify_room_alias(alias: &str, server_name: &str) -> String {
    let alias = alias.trim();
    let local = alias.strip_prefix('#').unwrap_or(alias);
    if local.contains(':') {
        format!("#{}", local)
    } else {
        format!("#{}:{}", local, server_name)
    }
}

/// `#lobby:server` -> `lobby`
pub fn room_alias_local_part(alias: &str) -> &str {
    let local = alias.strip_prefix('#').unwrap_or(alias);
    local.split_once(':').map(|(l, _)| l).unwrap_or(local)
}
