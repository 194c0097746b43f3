// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::lookup_host;

/// A peer address as the application names it: a hostname (or literal
/// IP) plus a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub hostname: String,
    pub port: u16,
}

impl Target {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Resolves to a socket address. Literal IPs bypass DNS entirely;
    /// for names, the first resolved address (IPv4 or IPv6) wins.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        if let Ok(ip) = self.hostname.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        lookup_host((self.hostname.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", self.hostname),
                )
            })
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self {
            hostname: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ipv4_bypasses_dns() {
        let target = Target::new("127.0.0.1", 4000);
        let addr = target.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }

    #[tokio::test]
    async fn literal_ipv6_bypasses_dns() {
        let target = Target::new("::1", 4000);
        let addr = target.resolve().await.unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.is_ipv6());
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let target = Target::new("localhost", 80);
        let addr = target.resolve().await.unwrap();
        assert_eq!(addr.port(), 80);
    }
}
