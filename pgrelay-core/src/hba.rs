//! The host-based-authentication matcher.
//!
//! HBA *file* parsing lives in the daemon crate's config loader; this
//! module is only the decision algorithm over an already-parsed,
//! in-memory rule table.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostType {
    Host,
    HostSsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Reject,
    Trust,
    Password,
    Md5,
    ScramSha256,
    /// Defers to whatever the backend demands.
    All,
}

impl AuthMethod {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "reject" => AuthMethod::Reject,
            "trust" => AuthMethod::Trust,
            "password" => AuthMethod::Password,
            "md5" => AuthMethod::Md5,
            "scram-sha-256" => AuthMethod::ScramSha256,
            "all" => AuthMethod::All,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum AddressMatch {
    All,
    Cidr(IpAddr, u8),
}

impl AddressMatch {
    /// CIDR bits compared MSB-first; a zero-length prefix matches all
    /// addresses of that family.
    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            AddressMatch::All => true,
            AddressMatch::Cidr(network, bits) => cidr_contains(*network, *bits, addr),
        }
    }
}

fn cidr_contains(network: IpAddr, prefix_bits: u8, addr: IpAddr) -> bool {
    if prefix_bits == 0 {
        return matches!(
            (network, addr),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
        );
    }
    match (network, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let mask = if prefix_bits >= 32 {
                u32::MAX
            } else {
                !(u32::MAX >> prefix_bits)
            };
            (u32::from(n) & mask) == (u32::from(a) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let mask = if prefix_bits >= 128 {
                u128::MAX
            } else {
                !(u128::MAX >> prefix_bits)
            };
            (u128::from(n) & mask) == (u128::from(a) & mask)
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct HbaRule {
    pub host_type: HostType,
    /// `"all"`, a literal database name, or (matched by the caller having
    /// already alias-resolved) the canonical database name.
    pub database: String,
    pub username: String,
    pub address: AddressMatch,
    pub method: AuthMethod,
}

#[derive(Debug, Clone, Default)]
pub struct HbaTable {
    rules: Vec<HbaRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext<'a> {
    pub database: &'a str,
    pub username: &'a str,
    pub address: Option<IpAddr>,
    pub tls: bool,
}

impl HbaTable {
    pub fn new(rules: Vec<HbaRule>) -> Self {
        HbaTable { rules }
    }

    /// First matching rule wins; no match rejects.
    pub fn decide(&self, ctx: ConnectionContext<'_>) -> AuthMethod {
        for rule in &self.rules {
            if self.rule_matches(rule, ctx) {
                return rule.method;
            }
        }
        AuthMethod::Reject
    }

    fn rule_matches(&self, rule: &HbaRule, ctx: ConnectionContext<'_>) -> bool {
        let type_ok = match rule.host_type {
            HostType::Host => true,
            HostType::HostSsl => ctx.tls,
        };
        if !type_ok {
            return false;
        }
        if rule.database != "all" && rule.database != ctx.database {
            return false;
        }
        if rule.username != "all" && rule.username != ctx.username {
            return false;
        }
        match (&rule.address, ctx.address) {
            (AddressMatch::All, _) => true,
            (AddressMatch::Cidr(..), Some(addr)) => rule.address.matches(addr),
            (AddressMatch::Cidr(..), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(db: &str, user: &str, addr: AddressMatch, method: AuthMethod) -> HbaRule {
        HbaRule {
            host_type: HostType::Host,
            database: db.into(),
            username: user.into(),
            address: addr,
            method,
        }
    }

    #[test]
    fn first_match_wins() {
        let table = HbaTable::new(vec![
            rule("postgres", "bob", AddressMatch::All, AuthMethod::Reject),
            rule("all", "all", AddressMatch::All, AuthMethod::Trust),
        ]);
        let decision = table.decide(ConnectionContext {
            database: "postgres",
            username: "bob",
            address: None,
            tls: false,
        });
        assert_eq!(decision, AuthMethod::Reject);
    }

    #[test]
    fn no_match_rejects() {
        let table = HbaTable::new(vec![rule(
            "postgres",
            "alice",
            AddressMatch::All,
            AuthMethod::Trust,
        )]);
        let decision = table.decide(ConnectionContext {
            database: "other",
            username: "alice",
            address: None,
            tls: false,
        });
        assert_eq!(decision, AuthMethod::Reject);
    }

    #[test]
    fn hostssl_requires_tls() {
        let table = HbaTable::new(vec![
            rule("all", "all", AddressMatch::All, AuthMethod::ScramSha256),
        ]);
        let mut rules = table.clone_rules();
        rules[0].host_type = HostType::HostSsl;
        let table = HbaTable::new(rules);

        let no_tls = table.decide(ConnectionContext {
            database: "d",
            username: "u",
            address: None,
            tls: false,
        });
        assert_eq!(no_tls, AuthMethod::Reject);

        let with_tls = table.decide(ConnectionContext {
            database: "d",
            username: "u",
            address: None,
            tls: true,
        });
        assert_eq!(with_tls, AuthMethod::ScramSha256);
    }

    #[test]
    fn ipv4_cidr_prefix() {
        let network: IpAddr = "10.0.0.0".parse().unwrap();
        let table = HbaTable::new(vec![rule(
            "all",
            "all",
            AddressMatch::Cidr(network, 8),
            AuthMethod::Trust,
        )]);
        let inside = table.decide(ConnectionContext {
            database: "d",
            username: "u",
            address: Some("10.1.2.3".parse().unwrap()),
            tls: false,
        });
        assert_eq!(inside, AuthMethod::Trust);

        let outside = table.decide(ConnectionContext {
            database: "d",
            username: "u",
            address: Some("11.1.2.3".parse().unwrap()),
            tls: false,
        });
        assert_eq!(outside, AuthMethod::Reject);
    }

    impl HbaTable {
        fn clone_rules(&self) -> Vec<HbaRule> {
            self.rules.clone()
        }
    }
}
