//! Caller classification.
//!
//! A non-empty credential header wins; otherwise the caller is identified by the peer address
//! (port stripped). Behind a reverse proxy, forwarding headers can be trusted explicitly.
//!
//! The peer address comes from the request extensions. The default [`PeerAddr`] reads a bare
//! `SocketAddr` and, with the `axum` feature, axum's `ConnectInfo<SocketAddr>`. Servers that
//! store the address under another type plug in their own with [`KeyExtractor::with_peer_addr`].

use crate::error::ConfigError;
use crate::rate_limit::CallerKey;
use crate::settings::Settings;
use http::{Extensions, HeaderName, Request};
use std::net::{IpAddr, SocketAddr};

/// Header carrying the access credential unless configured otherwise (matched case-insensitively).
pub const DEFAULT_CREDENTIAL_HEADER: &str = "api_key";

/// Reads the peer address out of the request extensions.
pub type PeerAddr = fn(&Extensions) -> Option<IpAddr>;

/// Shared address value for callers whose address cannot be determined.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Derives the [`CallerKey`] for a request.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
    credential_header: HeaderName,
    trust_forwarded_headers: bool,
    peer_addr: PeerAddr,
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self {
            credential_header: HeaderName::from_static(DEFAULT_CREDENTIAL_HEADER),
            trust_forwarded_headers: false,
            peer_addr: connection_peer_addr,
        }
    }
}

impl KeyExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extractor configured from process settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new()
            .with_credential_header(&settings.credential_header)?
            .trust_forwarded_headers(settings.trust_forwarded_headers))
    }

    /// Read the credential from `header` instead of [`DEFAULT_CREDENTIAL_HEADER`].
    pub fn with_credential_header(mut self, header: &str) -> Result<Self, ConfigError> {
        self.credential_header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| ConfigError::InvalidHeaderName(header.to_string()))?;
        Ok(self)
    }

    /// Prefer `X-Forwarded-For`, `X-Real-IP` and `Forwarded` over the peer address.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Resolve the peer address with `peer_addr` instead of [`connection_peer_addr`].
    pub fn with_peer_addr(mut self, peer_addr: PeerAddr) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Header the credential is read from.
    pub fn credential_header(&self) -> &HeaderName {
        &self.credential_header
    }

    /// Classify `req`.
    pub fn extract<B>(&self, req: &Request<B>) -> CallerKey {
        if let Some(credential) = self.credential(req) {
            return CallerKey::credential(credential);
        }
        match self.client_ip(req) {
            Some(ip) => CallerKey::address(ip.to_string()),
            None => CallerKey::address(UNKNOWN_ADDRESS),
        }
    }

    fn credential<B>(&self, req: &Request<B>) -> Option<String> {
        req.headers()
            .get(&self.credential_header)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn client_ip<B>(&self, req: &Request<B>) -> Option<IpAddr> {
        let peer = || (self.peer_addr)(req.extensions());
        if self.trust_forwarded_headers {
            from_x_forwarded_for(req)
                .or_else(|| from_x_real_ip(req))
                .or_else(|| from_forwarded(req))
                .or_else(peer)
        } else {
            peer()
        }
    }
}

/// Default [`PeerAddr`]: a `SocketAddr` extension, then axum's `ConnectInfo<SocketAddr>`.
pub fn connection_peer_addr(extensions: &Extensions) -> Option<IpAddr> {
    extensions.get::<SocketAddr>().map(SocketAddr::ip).or_else(|| connect_info_ip(extensions))
}

#[cfg(feature = "axum")]
fn connect_info_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions.get::<axum::extract::ConnectInfo<SocketAddr>>().map(|info| info.0.ip())
}

#[cfg(not(feature = "axum"))]
fn connect_info_ip(_extensions: &Extensions) -> Option<IpAddr> {
    None
}

/// X-Forwarded-For: "client, proxy1, proxy2"; the leftmost entry is the client.
fn from_x_forwarded_for<B>(req: &Request<B>) -> Option<IpAddr> {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|ip| parse_ip(ip.trim()))
}

fn from_x_real_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| parse_ip(s.trim()))
}

/// RFC 7239: `for=192.0.2.60;proto=http` or `for="[2001:db8::1]:4711"`.
fn from_forwarded<B>(req: &Request<B>) -> Option<IpAddr> {
    let header = req.headers().get("forwarded")?.to_str().ok()?;
    let first = header.split(',').next()?;
    first.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("for") {
            return None;
        }
        parse_ip(value.trim().trim_matches('"'))
    })
}

/// Accepts a bare address or one with a port (`1.2.3.4:80`, `[::1]:80`).
fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
        .or_else(|| raw.trim_start_matches('[').trim_end_matches(']').parse().ok())
}
