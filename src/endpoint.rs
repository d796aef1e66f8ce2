//! Endpoint identity shared by both pool registries.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing an endpoint description
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unsupported network type: {0}")]
    UnsupportedNetwork(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("endpoint url has no port: {0}")]
    MissingPort(String),
}

/// Network type of a remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    /// Connection-oriented byte stream (framing errors desynchronize it)
    pub fn is_stream(&self) -> bool {
        !self.is_datagram()
    }

    /// Packet oriented transport (each read is one self-contained packet)
    pub fn is_datagram(&self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unix => "unix",
        }
    }
}

impl FromStr for Network {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            "unix" => Ok(Network::Unix),
            other => Err(EndpointError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one remote target: network type, address and protocol name.
///
/// The protocol is an opaque label; two pools for the same address that
/// speak different protocols never share connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub network: Network,
    pub address: String,
    pub protocol: String,
}

impl EndpointKey {
    pub fn new(network: Network, address: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            protocol: protocol.into(),
        }
    }

    /// Parse an endpoint from URL form.
    ///
    /// `tcp://127.0.0.1:8000`, `udp://[::1]:53?protocol=dns`, `unix:///tmp/app.sock`
    pub fn from_url(input: &str) -> Result<Self, EndpointError> {
        let url = url::Url::parse(input).map_err(|e| EndpointError::InvalidUrl(format!("{input}: {e}")))?;
        let network: Network = url.scheme().parse()?;

        let address = if network == Network::Unix {
            if url.path().is_empty() {
                return Err(EndpointError::InvalidUrl(input.to_string()));
            }
            url.path().to_string()
        } else {
            let host = url
                .host_str()
                .ok_or_else(|| EndpointError::InvalidUrl(input.to_string()))?;
            let port = url
                .port()
                .ok_or_else(|| EndpointError::MissingPort(input.to_string()))?;
            format!("{host}:{port}")
        };

        let protocol = url
            .query_pairs()
            .find(|(k, _)| k == "protocol")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        Ok(Self {
            network,
            address,
            protocol,
        })
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.is_empty() {
            write!(f, "{}://{}", self.network, self.address)
        } else {
            write!(f, "{}://{}#{}", self.network, self.address, self.protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        assert_eq!("TCP".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp6);
        assert!("quic".parse::<Network>().is_err());
    }

    #[test]
    fn test_network_kinds() {
        assert!(Network::Tcp.is_stream());
        assert!(Network::Unix.is_stream());
        assert!(Network::Udp4.is_datagram());
        assert!(!Network::Udp.is_stream());
    }

    #[test]
    fn test_from_url_tcp() {
        let key = EndpointKey::from_url("tcp://127.0.0.1:8000").unwrap();
        assert_eq!(key.network, Network::Tcp);
        assert_eq!(key.address, "127.0.0.1:8000");
        assert!(key.protocol.is_empty());
    }

    #[test]
    fn test_from_url_with_protocol() {
        let key = EndpointKey::from_url("udp://[::1]:5353?protocol=dns").unwrap();
        assert_eq!(key.network, Network::Udp);
        assert_eq!(key.address, "[::1]:5353");
        assert_eq!(key.protocol, "dns");
    }

    #[test]
    fn test_from_url_unix() {
        let key = EndpointKey::from_url("unix:///tmp/app.sock").unwrap();
        assert_eq!(key.network, Network::Unix);
        assert_eq!(key.address, "/tmp/app.sock");
    }

    #[test]
    fn test_from_url_errors() {
        assert!(matches!(
            EndpointKey::from_url("tcp://localhost"),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            EndpointKey::from_url("sctp://localhost:1"),
            Err(EndpointError::UnsupportedNetwork(_))
        ));
        assert!(EndpointKey::from_url("not a url").is_err());
    }

    #[test]
    fn test_key_identity() {
        let a = EndpointKey::new(Network::Tcp, "10.0.0.1:80", "http");
        let b = EndpointKey::new(Network::Tcp, "10.0.0.1:80", "grpc");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "tcp://10.0.0.1:80#http");
    }
}
