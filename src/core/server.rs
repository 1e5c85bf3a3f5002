use std::fmt;
use std::path::PathBuf;

/// Largest accepted weight; ring points grow linearly with it
pub const MAX_WEIGHT: u32 = 1000;

/// Where a memcached server listens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    /// `host:port`, resolved at connect time
    Tcp { host: String, port: u16 },
    /// Unix domain socket path
    Unix(PathBuf),
}

/// A memcached server participating in the ring.
///
/// Identity is the address string. Health is tracked separately by the
/// failure policy so this stays cheap to clone and share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Server {
    address: String,
    addr: ServerAddr,
    weight: u32,
}

impl Server {
    /// Parse `host:port`, `[v6]:port`, `unix:/path` or `/path`
    pub fn parse(address: &str, weight: u32) -> Result<Self, ServerParseError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ServerParseError::Empty);
        }
        if weight == 0 {
            return Err(ServerParseError::ZeroWeight(address.to_string()));
        }
        if weight > MAX_WEIGHT {
            return Err(ServerParseError::WeightTooLarge {
                address: address.to_string(),
                max: MAX_WEIGHT,
            });
        }

        let addr = if let Some(path) = address.strip_prefix("unix:") {
            ServerAddr::Unix(PathBuf::from(path))
        } else if address.starts_with('/') {
            ServerAddr::Unix(PathBuf::from(address))
        } else {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| ServerParseError::MissingPort(address.to_string()))?;
            if host.is_empty() {
                return Err(ServerParseError::MissingHost(address.to_string()));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| ServerParseError::InvalidPort(address.to_string()))?;
            ServerAddr::Tcp {
                host: host.to_string(),
                port,
            }
        };

        Ok(Self {
            address: address.to_string(),
            addr,
            weight,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerParseError {
    #[error("Server address is empty")]
    Empty,
    #[error("Server address '{0}' has no port")]
    MissingPort(String),
    #[error("Server address '{0}' has no host")]
    MissingHost(String),
    #[error("Server address '{0}' has an invalid port")]
    InvalidPort(String),
    #[error("Server '{0}' must have a weight of at least 1")]
    ZeroWeight(String),
    #[error("Server '{address}' has a weight above the maximum of {max}")]
    WeightTooLarge { address: String, max: u32 },
}
