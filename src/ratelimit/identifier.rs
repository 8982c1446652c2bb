//! Caller identification for rate limit keys.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Identifier used when a request carries no usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where the rate limit identifier for a request comes from.
///
/// Written in configuration as `ip`, `global` or `header:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySource {
    /// The client IP address
    #[default]
    Ip,
    /// An explicit token carried in the named header
    Header(String),
    /// One shared key for every caller
    Global,
}

impl KeySource {
    /// Derive the identifier for a request.
    ///
    /// Header-based keys fall back to the client IP when the header is
    /// missing, so anonymous callers still share a per-address quota.
    /// Header values are fingerprinted and never appear in the identifier.
    pub fn identify(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        proxies: &TrustedProxies,
    ) -> String {
        match self {
            KeySource::Ip => format!("ip:{}", proxies.client_ip(headers, peer)),
            KeySource::Header(name) => match header_token(headers, name) {
                Some(token) => format!("token:{}", fingerprint(token)),
                None => format!("ip:{}", proxies.client_ip(headers, peer)),
            },
            KeySource::Global => "global".to_string(),
        }
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Ip => f.write_str("ip"),
            KeySource::Header(name) => write!(f, "header:{}", name),
            KeySource::Global => f.write_str("global"),
        }
    }
}

impl TryFrom<String> for KeySource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "ip" => Ok(KeySource::Ip),
            "global" => Ok(KeySource::Global),
            other => match other.strip_prefix("header:") {
                Some(name) if !name.trim().is_empty() => {
                    Ok(KeySource::Header(name.trim().to_ascii_lowercase()))
                }
                _ => Err(format!(
                    "invalid key source `{}`, expected `ip`, `global` or `header:<name>`",
                    value
                )),
            },
        }
    }
}

impl From<KeySource> for String {
    fn from(source: KeySource) -> Self {
        source.to_string()
    }
}

/// Reverse proxies whose forwarding headers are believed.
///
/// Written in configuration as a list of IP addresses. Requests from any
/// other peer are identified by their socket address alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustedProxies(Vec<IpAddr>);

impl TrustedProxies {
    pub fn new(proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        Self(proxies.into_iter().collect())
    }

    /// Trust no one; only the socket peer counts.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `peer` is a configured proxy.
    pub fn trusts(&self, peer: Option<SocketAddr>) -> bool {
        peer.is_some_and(|addr| self.0.contains(&canonical(addr.ip())))
    }

    /// Client address for a request.
    ///
    /// Forwarding headers count only when the socket peer is a trusted
    /// proxy. `x-forwarded-for` is read right to left, skipping trusted
    /// hops, so a client cannot prepend an address of its choosing. Without
    /// a peer the client is [`UNKNOWN_CLIENT`].
    pub fn client_ip(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let Some(peer) = peer else {
            return UNKNOWN_CLIENT.to_string();
        };
        let peer_ip = canonical(peer.ip());
        if !self.0.contains(&peer_ip) {
            return peer_ip.to_string();
        }

        self.forwarded_for(headers)
            .or_else(|| header_ip(headers, "x-real-ip"))
            .unwrap_or(peer_ip)
            .to_string()
    }

    fn forwarded_for(&self, headers: &HeaderMap) -> Option<IpAddr> {
        let chain = headers.get("x-forwarded-for")?.to_str().ok()?;
        let mut hops = Vec::new();
        for hop in chain.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            hops.push(canonical(hop.parse().ok()?));
        }

        hops.iter()
            .rev()
            .find(|ip| !self.0.contains(ip))
            .or_else(|| hops.first())
            .copied()
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let ip: IpAddr = headers.get(name)?.to_str().ok()?.trim().parse().ok()?;
    Some(canonical(ip))
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

fn header_token<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Short stable digest of a credential, safe to log and return.
pub fn fingerprint(token: &str) -> String {
    let hash = blake3::hash(token.as_bytes());
    hash.to_hex().as_str()[..16].to_string()
}
