use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::config::TunnelTarget;
use crate::errors::{Error, Result};
use crate::forward::is_connectable;

/// Entry of `GET /containers/json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct ContainerSummary {
    #[serde(default)]
    pub Id: String,
    pub Names: Vec<String>,
    pub Image: String,
    pub State: String,
    pub Status: String,
    #[serde(default, deserialize_with = "format::null_to_default")]
    pub Ports: Vec<Port>,
    #[serde(default)]
    pub NetworkSettings: Option<SummaryNetworkSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct Port {
    pub IP: Option<String>,
    pub PrivatePort: u16,
    pub PublicPort: Option<u16>,
    #[serde(default)]
    pub Type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct SummaryNetworkSettings {
    /// Network name to endpoint, in the order the daemon sent them.
    #[serde(default, deserialize_with = "format::ordered_entries")]
    pub Networks: Vec<(String, EndpointSettings)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct EndpointSettings {
    #[serde(default)]
    pub IPAddress: String,
    #[serde(default)]
    pub Gateway: String,
}

mod format {
    use super::*;
    use std::marker::PhantomData;

    pub fn null_to_default<'de, D, T>(de: D) -> std::result::Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        let value: Option<T> = Option::deserialize(de)?;
        Ok(value.unwrap_or_default())
    }

    struct Entries<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for Entries<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map or null")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }

        fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    pub fn ordered_entries<'de, D, V>(de: D) -> std::result::Result<Vec<(String, V)>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        de.deserialize_any(Entries(PhantomData))
    }
}

/// One published port of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMapping {
    /// Host address the port is published on; empty when unpublished.
    pub ip: String,
    pub public_port: u16,
    pub private_port: u16,
    pub protocol: String,
}

/// An active tunnel to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tunnel {
    pub local: SocketAddr,
    pub remote_host: String,
    pub remote_port: u16,
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.local.ip(),
            self.local.port(),
            self.remote_host,
            self.remote_port
        )
    }
}

/// A container as shown in the inventory table.
///
/// Only the first port mapping is used for display and tunnelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortMapping>,
    /// Address on the first container network, if known.
    pub private_host: String,
    pub tunnel: Option<Tunnel>,
}

impl Container {
    fn first_port(&self) -> Option<&PortMapping> {
        self.ports.first()
    }

    pub fn public_host(&self) -> &str {
        self.first_port().map(|p| p.ip.as_str()).unwrap_or("")
    }

    pub fn public_port(&self) -> u16 {
        self.first_port().map(|p| p.public_port).unwrap_or(0)
    }

    pub fn private_port(&self) -> u16 {
        self.first_port().map(|p| p.private_port).unwrap_or(0)
    }

    /// `host:public:private` of the first mapping, empty without one.
    pub fn ports_display(&self) -> String {
        if self.ports.is_empty() {
            return String::new();
        }
        let port = |p: u16| if p == 0 { String::new() } else { p.to_string() };
        format!(
            "{}:{}:{}",
            self.public_host(),
            port(self.public_port()),
            port(self.private_port())
        )
    }

    /// Endpoint a tunnel would connect to, if the container is connectable.
    pub fn endpoint(&self, target: TunnelTarget) -> Option<(&str, u16)> {
        let (host, port) = match target {
            TunnelTarget::Public => (self.public_host(), self.public_port()),
            TunnelTarget::Private => (self.private_host.as_str(), self.private_port()),
        };
        if is_connectable(host) && port != 0 {
            Some((host, port))
        } else {
            None
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Parse one line of `docker ps --format` output.
    ///
    /// Fields are `Names`, `Ports`, `Status`, `Image` joined by `separator`.
    pub fn from_listing_line(line: &str, separator: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(separator).collect();
        let [names, ports, status, image] = fields[..] else {
            return Err(Error::MalformedListing {
                line: line.to_owned(),
            });
        };
        let name = names.split(',').next().unwrap_or(names).trim();
        if name.is_empty() {
            return Err(Error::MalformedListing {
                line: line.to_owned(),
            });
        }
        Ok(Container {
            name: name.to_owned(),
            image: image.trim().to_owned(),
            state: state_from_status(status).to_owned(),
            status: status.trim().to_owned(),
            ports: parse_ports_column(ports).into_iter().collect(),
            private_host: String::new(),
            tunnel: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_port(name: &str, ip: &str, public_port: u16, private_port: u16) -> Self {
        Container {
            name: name.to_owned(),
            state: "running".to_owned(),
            ports: vec![PortMapping {
                ip: ip.to_owned(),
                public_port,
                private_port,
                protocol: "tcp".to_owned(),
            }],
            ..Default::default()
        }
    }
}

impl From<ContainerSummary> for Container {
    fn from(summary: ContainerSummary) -> Self {
        let name = summary
            .Names
            .first()
            .map(|n| n.trim_start_matches('/').to_owned())
            .unwrap_or_default();
        let private_host = summary
            .NetworkSettings
            .and_then(|ns| ns.Networks.into_iter().next())
            .map(|(_, ep)| ep.IPAddress)
            .unwrap_or_default();
        let ports = summary
            .Ports
            .into_iter()
            .map(|p| PortMapping {
                ip: p.IP.unwrap_or_default(),
                public_port: p.PublicPort.unwrap_or(0),
                private_port: p.PrivatePort,
                protocol: p.Type,
            })
            .collect();
        Container {
            name,
            image: summary.Image,
            state: summary.State,
            status: summary.Status,
            ports,
            private_host,
            tunnel: None,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Docker's state keyword for a human readable `Status` column.
pub fn state_from_status(status: &str) -> &'static str {
    let status = status.trim();
    if status.contains("(Paused)") {
        return "paused";
    }
    match status.split_whitespace().next().unwrap_or("") {
        "Up" => "running",
        "Exited" => "exited",
        "Created" => "created",
        "Restarting" => "restarting",
        "Removal" => "removing",
        "Dead" => "dead",
        _ => "unknown",
    }
}

/// First mapping of a `docker ps` ports column.
///
/// Accepts `0.0.0.0:8080->80/tcp`, `[::]:8080->80/tcp` and bare `80/tcp`.
pub fn parse_ports_column(column: &str) -> Option<PortMapping> {
    let first = column.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    let (published, private) = match first.split_once("->") {
        Some((published, private)) => (Some(published), private),
        None => (None, first),
    };
    let (private_port, protocol) = private.split_once('/').unwrap_or((private, "tcp"));
    // ranges such as 8000-8001 use their first port
    let first_port = |s: &str| s.split('-').next().and_then(|p| p.parse::<u16>().ok());
    let private_port = first_port(private_port)?;
    let (ip, public_port) = match published.and_then(|p| p.rsplit_once(':')) {
        Some((ip, port)) => (
            ip.trim_start_matches('[').trim_end_matches(']').to_owned(),
            first_port(port).unwrap_or(0),
        ),
        None => (String::new(), 0),
    };
    Some(PortMapping {
        ip,
        public_port,
        private_port,
        protocol: protocol.to_owned(),
    })
}
