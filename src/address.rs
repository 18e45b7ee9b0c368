use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::{anyhow, bail};

/// Scheme of replica addresses
pub const SCHEME: &str = "rntbd";

/// A server, identified by host and port. Connections and channels are pooled per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        }
        else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A replica's address, e.g. `rntbd://db1.example.com:14330/apps/x/services/y/partitions/z/replicas/1p/`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaAddress {
    pub endpoint: Endpoint,
    /// the path part, which is sent as part of every request to identify the replica
    pub replica_path: String,
}

impl FromStr for ReplicaAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://")
            .ok_or_else(|| anyhow!("replica address {:?} has no scheme", s))?;
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            bail!("replica address {:?} does not have the {} scheme", s, SCHEME);
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 host in {:?}", s))?;
            let port = after.strip_prefix(':')
                .ok_or_else(|| anyhow!("replica address {:?} has no port", s))?;
            (host, port)
        }
        else {
            authority.rsplit_once(':')
                .ok_or_else(|| anyhow!("replica address {:?} has no port", s))?
        };

        if host.is_empty() {
            bail!("replica address {:?} has no host", s);
        }
        let port: u16 = port.parse()
            .map_err(|_| anyhow!("invalid port in replica address {:?}", s))?;

        Ok(ReplicaAddress {
            endpoint: Endpoint::new(host, port),
            replica_path: path.to_string(),
        })
    }
}

impl Display for ReplicaAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", SCHEME, self.endpoint, self.replica_path)
    }
}
