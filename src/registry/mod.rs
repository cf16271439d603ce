use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::slice;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::ServerEntry;

/// One candidate provisioning server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub address: IpAddr,
    pub port: u16,
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    pub home_path: String,
}

impl ServerDescriptor {
    pub fn new(
        address: IpAddr,
        port: u16,
        retry_attempts: u32,
        retry_interval: Duration,
        home_path: impl Into<String>,
    ) -> Self {
        Self {
            address,
            port,
            retry_attempts,
            retry_interval,
            home_path: home_path.into(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn log_payload(&self) -> Value {
        json!({
            "server": self.socket_addr().to_string(),
            "retry_attempts": self.retry_attempts,
            "retry_interval_ms": self.retry_interval.as_millis() as u64,
        })
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl TryFrom<&ServerEntry> for ServerDescriptor {
    type Error = RegistryError;

    fn try_from(entry: &ServerEntry) -> Result<Self, Self::Error> {
        let address = entry
            .address
            .parse::<IpAddr>()
            .map_err(|_| RegistryError::InvalidAddress {
                address: entry.address.clone(),
            })?;

        Ok(Self::new(
            address,
            entry.port,
            entry.retry_attempts,
            Duration::from_secs(entry.retry_interval_seconds),
            entry.home_path.clone(),
        ))
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Empty,
    InvalidAddress { address: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "server registry must contain at least one server"),
            Self::InvalidAddress { address } => {
                write!(f, "server address '{address}' is not an IP address")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Ordered failover list; the first entry is the most preferred.
///
/// Holds no cursor: every connection pass walks the list from the top
/// through [`ServerRegistry::iter`].
#[derive(Clone, Debug)]
pub struct ServerRegistry {
    descriptors: Vec<ServerDescriptor>,
}

impl ServerRegistry {
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Result<Self, RegistryError> {
        if descriptors.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Self { descriptors })
    }

    pub fn from_config(entries: &[ServerEntry]) -> Result<Self, RegistryError> {
        let descriptors = entries
            .iter()
            .map(ServerDescriptor::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(descriptors)
    }

    pub fn iter(&self) -> slice::Iter<'_, ServerDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Upper bound on connect attempts a single pass can make.
    pub fn attempts_per_pass(&self) -> u64 {
        self.descriptors
            .iter()
            .map(|descriptor| u64::from(descriptor.retry_attempts))
            .sum()
    }
}

impl<'a> IntoIterator for &'a ServerRegistry {
    type Item = &'a ServerDescriptor;
    type IntoIter = slice::Iter<'a, ServerDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
