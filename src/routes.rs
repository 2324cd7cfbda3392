//! Static SNI hostname → upstream routing table.

use std::collections::HashMap;

/// An upstream dial target, immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

/// Case-sensitive, injectable lookup from a canonical lowercase SNI hostname
/// to its upstream target. Absence of a key means the route is denied.
pub struct RouteTable {
    routes: HashMap<String, Upstream>,
}

impl RouteTable {
    pub fn new(routes: HashMap<String, Upstream>) -> Self {
        Self { routes }
    }

    /// The default route table: the six Ubiquiti firmware/update domains,
    /// each routed to itself on port 443.
    pub fn default_ubiquiti() -> Self {
        let hosts = [
            "fw-download.ubnt.com",
            "fw-update.ubnt.com",
            "fw-update.ui.com",
            "apt.artifacts.ui.com",
            "apt-beta.artifacts.ui.com",
            "apt-release-candidate.artifacts.ui.com",
        ];

        let routes = hosts
            .into_iter()
            .map(|host| {
                (
                    host.to_string(),
                    Upstream {
                        host: host.to_string(),
                        port: 443,
                    },
                )
            })
            .collect();

        Self::new(routes)
    }

    pub fn lookup(&self, sni: &str) -> Option<&Upstream> {
        self.routes.get(sni)
    }

    /// All configured SNI hostnames, for reporting back through the admin
    /// sidecar's `/stats` `config.allowedDomains` field.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.routes.keys().cloned().collect();
        domains.sort();
        domains
    }
}
