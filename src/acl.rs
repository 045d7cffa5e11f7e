//! Source-address allow list.
//!
//! An `Acl` is a parsed set of CIDR ranges checked against the peer address
//! of every accepted connection. An empty ruleset admits everything.
//!
//! Listeners hold their ACL behind an `RwLock` so a SIGHUP reload can swap
//! the ruleset without touching in-flight connections; readers take the
//! shared lock only for the duration of an `allows` call.

use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),
}

/// A parsed CIDR ruleset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acl {
    nets: Vec<IpNet>,
}

impl Acl {
    /// Parse a comma-separated list of CIDRs (IPv4 or IPv6).
    ///
    /// Whitespace around each element is trimmed; empty elements are
    /// rejected. An empty or all-whitespace input yields an empty ruleset.
    pub fn parse(csv: &str) -> Result<Self, AclError> {
        let mut nets = Vec::new();
        if csv.trim().is_empty() {
            return Ok(Acl { nets });
        }
        for part in csv.split(',') {
            let part = part.trim();
            let net =
                IpNet::from_str(part).map_err(|_| AclError::InvalidCidr(part.to_owned()))?;
            nets.push(net);
        }
        Ok(Acl { nets })
    }

    /// True if `ip` is admitted by this ruleset.
    ///
    /// An empty ruleset admits every address.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.nets.is_empty() {
            return true;
        }
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}
