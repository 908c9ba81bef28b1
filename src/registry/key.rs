//! Stream identity
//!
//! A source is identified by the tuple `(schema, vhost, app, stream)`. The
//! same logical stream published once is usually registered under several
//! schemas, one per protocol sink.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;

use super::error::RegistryError;

/// Virtual host used when vhosts are disabled or none was given
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

pub const RTSP_SCHEMA: &str = "rtsp";
pub const RTMP_SCHEMA: &str = "rtmp";
pub const HLS_SCHEMA: &str = "hls";
pub const TS_SCHEMA: &str = "ts";
pub const FMP4_SCHEMA: &str = "fmp4";
pub const MP4_SCHEMA: &str = "mp4";

/// Unique identifier for a registered source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamKey {
    /// Protocol family (e.g., "rtsp")
    pub schema: String,
    /// Virtual host
    pub vhost: String,
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name
    pub stream: String,
}

impl StreamKey {
    /// Create a key; an empty vhost becomes [`DEFAULT_VHOST`]
    pub fn new(
        schema: impl Into<String>,
        vhost: impl Into<String>,
        app: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        let vhost = vhost.into();
        Self {
            schema: schema.into(),
            vhost: if vhost.is_empty() {
                DEFAULT_VHOST.to_string()
            } else {
                vhost
            },
            app: app.into(),
            stream: stream.into(),
        }
    }

    /// Same stream under another schema
    pub fn with_schema(&self, schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            ..self.clone()
        }
    }

    /// Collapse the vhost when virtual hosting is disabled
    pub fn normalized(mut self, enable_vhost: bool) -> Self {
        if !enable_vhost || self.vhost.is_empty() {
            self.vhost = DEFAULT_VHOST.to_string();
        }
        self
    }

    /// Whether app and stream are both present
    pub fn is_complete(&self) -> bool {
        !self.app.is_empty() && !self.stream.is_empty()
    }

    /// `vhost/app/stream`
    pub fn short_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    /// `schema://vhost/app/stream`
    pub fn url(&self) -> String {
        format!("{}://{}", self.schema, self.short_url())
    }

    /// Parse `schema://host[:port]/app/stream[/more]?k=v&...`
    ///
    /// A host that is `localhost` or an IP literal maps to the default
    /// vhost, as does any host when `enable_vhost` is false. A `vhost`
    /// query parameter overrides the host.
    pub fn parse_url(url: &str, enable_vhost: bool) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidUrl(url.to_string());

        let (rest, query) = match url.split_once('?') {
            Some((rest, query)) => (rest, query),
            None => (url, ""),
        };
        let (schema, rest) = match rest.split_once("://") {
            Some((schema, rest)) => (schema, rest),
            None => ("", rest),
        };

        let mut parts = rest.splitn(3, '/');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let app = parts.next().unwrap_or_default();
        let stream = parts.next().unwrap_or_default();

        let params = parse_query(query);
        let vhost = match params.get("vhost") {
            Some(vhost) if !vhost.is_empty() => vhost.to_string(),
            _ => host_to_vhost(host),
        };

        Ok(Self::new(schema, vhost, app, stream).normalized(enable_vhost))
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}/{}", self.schema, self.vhost, self.app, self.stream)
    }
}

/// Parse `a=1&b=2` into a map; later duplicates win
pub fn parse_query(query: &str) -> HashMap<&str, &str> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect()
}

fn host_to_vhost(host: &str) -> String {
    let name = if let Some(bracketed) = host.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };

    if name.eq_ignore_ascii_case("localhost") || name.parse::<IpAddr>().is_ok() {
        DEFAULT_VHOST.to_string()
    } else {
        name.to_string()
    }
}
