//! Protocol version negotiation and server URL handling.

use thiserror::Error;
use url::Url;

/// Oldest protocol version this client can still speak.
pub const PROTOCOL_VERSION_MIN: u32 = 7;

/// Newest protocol version this client speaks.
pub const PROTOCOL_VERSION_CURRENT: u32 = 9;

/// Prefix of the websocket subprotocol strings used for version
/// negotiation. The full string is the prefix followed by a decimal
/// version number.
pub const WEBSOCKET_PROTOCOL_PREFIX: &str = "io.tidesync.protocol/v";

/// The subprotocol strings to offer during the websocket handshake, in
/// descending version order so the server selects the highest version it
/// supports.
pub fn supported_subprotocols() -> Vec<String> {
    (PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_CURRENT)
        .rev()
        .map(|version| format!("{WEBSOCKET_PROTOCOL_PREFIX}{version}"))
        .collect()
}

/// Parses the subprotocol echoed by the server and checks it against the
/// supported range. Any failure here is fatal for the connection.
pub fn parse_negotiated_subprotocol(protocol: &str) -> Result<u32, UrlError> {
    let rest = protocol
        .strip_prefix(WEBSOCKET_PROTOCOL_PREFIX)
        .ok_or_else(|| UrlError::BadSubprotocol(protocol.to_owned()))?;
    let version: u32 = rest
        .parse()
        .map_err(|_| UrlError::BadSubprotocol(protocol.to_owned()))?;
    if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_CURRENT).contains(&version) {
        return Err(UrlError::UnsupportedVersion {
            negotiated: version,
            min: PROTOCOL_VERSION_MIN,
            max: PROTOCOL_VERSION_CURRENT,
        });
    }
    Ok(version)
}

/// Transport envelope selected by the server URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Envelope {
    /// Plain websocket over TCP.
    Ws,
    /// Websocket over TLS.
    Wss,
}

impl Envelope {
    /// Whether the envelope uses TLS.
    pub fn is_tls(self) -> bool {
        matches!(self, Envelope::Wss)
    }

    /// The URL scheme to use when dialing.
    pub fn scheme(self) -> &'static str {
        match self {
            Envelope::Ws => "ws",
            Envelope::Wss => "wss",
        }
    }
}

/// A parsed server endpoint. Two sessions share a connection exactly when
/// their endpoints compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    /// Transport envelope.
    pub envelope: Envelope,
    /// Host name or address.
    pub address: String,
    /// TCP port.
    pub port: u16,
    /// HTTP request path of the websocket handshake.
    pub path: String,
}

impl ServerEndpoint {
    /// Whether to speak TLS.
    pub fn is_tls(&self) -> bool {
        self.envelope.is_tls()
    }

    /// The websocket URL for this endpoint.
    pub fn websocket_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.envelope.scheme(),
            self.address,
            self.port,
            self.path
        )
    }
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.websocket_url())
    }
}

/// Errors from server URL parsing and subprotocol negotiation.
#[derive(Debug, Error)]
pub enum UrlError {
    /// The URL did not parse at all.
    #[error("invalid server URL: {0}")]
    Invalid(#[from] url::ParseError),

    /// The scheme is not one of tidesync/tidesyncs/ws/wss.
    #[error("unsupported URL scheme: {0}")]
    BadScheme(String),

    /// The URL is missing a host.
    #[error("server URL has no host")]
    MissingHost,

    /// The server's subprotocol string did not parse.
    #[error("bad protocol info from server: {0:?}")]
    BadSubprotocol(String),

    /// The server chose a version outside the supported range.
    #[error("negotiated protocol version {negotiated} outside supported range {min}-{max}")]
    UnsupportedVersion {
        /// The version the server picked.
        negotiated: u32,
        /// Oldest supported version.
        min: u32,
        /// Newest supported version.
        max: u32,
    },
}

/// Decomposes a server URL into an endpoint.
///
/// Supported schemes and their default ports: `tidesync:` (7800, plain),
/// `tidesyncs:` (7801, TLS), `ws:` (80, plain), `wss:` (443, TLS).
pub fn parse_server_url(input: &str) -> Result<ServerEndpoint, UrlError> {
    let url = Url::parse(input)?;
    let (envelope, default_port) = match url.scheme() {
        "tidesync" => (Envelope::Ws, 7800),
        "tidesyncs" => (Envelope::Wss, 7801),
        "ws" => (Envelope::Ws, 80),
        "wss" => (Envelope::Wss, 443),
        other => return Err(UrlError::BadScheme(other.to_owned())),
    };
    let address = url.host_str().ok_or(UrlError::MissingHost)?.to_owned();
    let port = url.port().unwrap_or(default_port);
    let mut path = url.path().to_owned();
    if path.is_empty() {
        path.push('/');
    }
    Ok(ServerEndpoint {
        envelope,
        address,
        port,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocols_descending() {
        let protocols = supported_subprotocols();
        assert_eq!(protocols.first().unwrap(), "io.tidesync.protocol/v9");
        assert_eq!(protocols.last().unwrap(), "io.tidesync.protocol/v7");
    }

    #[test]
    fn negotiation_accepts_supported_versions() {
        assert_eq!(
            parse_negotiated_subprotocol("io.tidesync.protocol/v8").unwrap(),
            8
        );
    }

    #[test]
    fn negotiation_rejects_out_of_range_and_garbage() {
        assert!(parse_negotiated_subprotocol("io.tidesync.protocol/v6").is_err());
        assert!(parse_negotiated_subprotocol("io.tidesync.protocol/v10").is_err());
        assert!(parse_negotiated_subprotocol("io.tidesync.protocol/vx").is_err());
        assert!(parse_negotiated_subprotocol("something-else").is_err());
        assert!(parse_negotiated_subprotocol("").is_err());
    }

    #[test]
    fn scheme_mapping() {
        let ep = parse_server_url("tidesync://sync.example.com/data").unwrap();
        assert!(!ep.is_tls());
        assert_eq!(ep.port, 7800);
        assert_eq!(ep.path, "/data");

        let ep = parse_server_url("tidesyncs://sync.example.com/data").unwrap();
        assert!(ep.is_tls());
        assert_eq!(ep.port, 7801);

        let ep = parse_server_url("wss://sync.example.com/data").unwrap();
        assert!(ep.is_tls());
        assert_eq!(ep.port, 443);

        let ep = parse_server_url("ws://sync.example.com:9090/data").unwrap();
        assert!(!ep.is_tls());
        assert_eq!(ep.port, 9090);
        assert_eq!(ep.websocket_url(), "ws://sync.example.com:9090/data");
    }

    #[test]
    fn bad_urls() {
        assert!(matches!(
            parse_server_url("http://example.com/"),
            Err(UrlError::BadScheme(_))
        ));
        assert!(parse_server_url("not a url").is_err());
    }
}
