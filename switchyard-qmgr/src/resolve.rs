//! Address resolution: recipient address to transport and nexthop.

use std::fmt::Debug;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use switchyard_common::address;

/// What the resolver could not do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    /// Delivered on this host
    pub local: bool,
    /// The lookup itself failed; try again later
    pub fail: bool,
    /// The address is malformed
    pub error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReply {
    pub transport: String,
    pub nexthop: String,
    /// The address as it should be delivered
    pub recipient: String,
    pub flags: ResolveFlags,
}

pub trait Resolver: Debug + Send + Sync {
    fn resolve(&self, sender: &str, address: &str) -> ResolveReply;

    /// Nexthop for addresses that have no domain of their own.
    fn myhostname(&self) -> &str;
}

fn default_myhostname() -> String {
    String::from("localhost")
}

fn default_transport() -> String {
    String::from("smtp")
}

fn default_local_transport() -> String {
    String::from("local")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_myhostname")]
    pub myhostname: String,

    #[serde(default = "default_transport")]
    pub default_transport: String,

    #[serde(default = "default_local_transport")]
    pub local_transport: String,

    /// Domains delivered locally, besides `myhostname`
    #[serde(default)]
    pub local_domains: Vec<String>,

    /// `domain` or `.parent` to `transport` or `transport:nexthop`
    #[serde(default)]
    pub transport_map: AHashMap<String, String>,

    /// Nexthop for everything not local and not in the map
    #[serde(default)]
    pub relayhost: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            myhostname: default_myhostname(),
            default_transport: default_transport(),
            local_transport: default_local_transport(),
            local_domains: Vec::new(),
            transport_map: AHashMap::default(),
            relayhost: None,
        }
    }
}

/// Resolver driven entirely by configuration tables.
#[derive(Debug, Clone)]
pub struct TableResolver {
    config: ResolverConfig,
}

impl TableResolver {
    pub fn new(mut config: ResolverConfig) -> Self {
        config.myhostname.make_ascii_lowercase();
        for domain in &mut config.local_domains {
            domain.make_ascii_lowercase();
        }
        config.transport_map = config
            .transport_map
            .into_iter()
            .map(|(domain, route)| (domain.to_ascii_lowercase(), route))
            .collect();
        Self { config }
    }

    fn is_local(&self, domain: &str) -> bool {
        domain == self.config.myhostname || self.config.local_domains.iter().any(|d| d == domain)
    }

    /// The exact domain first, then each parent as `.parent`.
    fn lookup(&self, domain: &str) -> Option<&str> {
        let map = &self.config.transport_map;
        if let Some(route) = map.get(domain) {
            return Some(route.as_str());
        }

        let mut rest = domain;
        while let Some(dot) = rest.find('.') {
            rest = &rest[dot..];
            if let Some(route) = map.get(rest) {
                return Some(route.as_str());
            }
            rest = &rest[1..];
        }
        None
    }
}

/// Anything a delivery agent could not make sense of.
fn is_malformed(recipient: &str) -> bool {
    if recipient.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return true;
    }

    let mut quoted = false;
    let mut ats = 0;
    for c in recipient.chars() {
        match c {
            '"' => quoted = !quoted,
            '@' if !quoted => ats += 1,
            _ => {}
        }
    }
    quoted || ats > 1 || address::local_part(recipient).is_empty()
}

impl Resolver for TableResolver {
    fn resolve(&self, _sender: &str, recipient: &str) -> ResolveReply {
        if is_malformed(recipient) {
            return ResolveReply {
                recipient: recipient.to_string(),
                flags: ResolveFlags {
                    error: true,
                    ..ResolveFlags::default()
                },
                ..ResolveReply::default()
            };
        }

        let (local, domain) = address::split(recipient);
        let domain = domain
            .filter(|d| !d.is_empty())
            .map_or_else(|| self.config.myhostname.clone(), str::to_ascii_lowercase);
        let recipient = format!("{local}@{domain}");

        if self.is_local(&domain) {
            return ResolveReply {
                transport: self.config.local_transport.clone(),
                nexthop: self.config.myhostname.clone(),
                recipient,
                flags: ResolveFlags {
                    local: true,
                    ..ResolveFlags::default()
                },
            };
        }

        let (transport, nexthop) = match self.lookup(&domain) {
            Some(route) => {
                let (transport, nexthop) = route.split_once(':').unwrap_or((route, ""));
                let nexthop = if nexthop.is_empty() { domain.as_str() } else { nexthop };
                (transport.to_string(), nexthop.to_string())
            }
            None => (
                self.config.default_transport.clone(),
                self.config.relayhost.clone().unwrap_or_else(|| domain.clone()),
            ),
        };

        ResolveReply {
            transport,
            nexthop,
            recipient,
            flags: ResolveFlags::default(),
        }
    }

    fn myhostname(&self) -> &str {
        &self.config.myhostname
    }
}

/// Routes every address to one transport with its domain as nexthop, with
/// per-address overrides. For tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticResolver {
    transport: String,
    overrides: Mutex<AHashMap<String, ResolveReply>>,
}

impl StaticResolver {
    pub fn new(transport: &str) -> Self {
        Self {
            transport: transport.to_string(),
            overrides: Mutex::default(),
        }
    }

    pub fn set(&self, address: &str, reply: ResolveReply) {
        self.overrides.lock().insert(address.to_string(), reply);
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, _sender: &str, address: &str) -> ResolveReply {
        if let Some(reply) = self.overrides.lock().get(address) {
            return reply.clone();
        }
        let domain = address::domain(address).unwrap_or("localhost");
        ResolveReply {
            transport: self.transport.clone(),
            nexthop: domain.to_ascii_lowercase(),
            recipient: address.to_string(),
            flags: ResolveFlags::default(),
        }
    }

    fn myhostname(&self) -> &str {
        "localhost"
    }
}
