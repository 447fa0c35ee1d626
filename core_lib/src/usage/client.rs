use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Consulted in order after `X-Forwarded-For`. All of these are client
/// supplied and therefore spoofable.
const FORWARDING_HEADERS: &[&str] = &[
    "x-real-ip",
    "cf-connecting-ip",
    "x-client-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

pub const UNKNOWN_CLIENT: &str = "unknown";

/// Best-effort client identity used to key usage quotas.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return first.to_string();
    }

    FORWARDING_HEADERS
        .iter()
        .find_map(|name| header_str(headers, name).map(str::trim).filter(|v| !v.is_empty()))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
