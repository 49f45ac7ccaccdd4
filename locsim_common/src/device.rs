use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque device identifier (UDID).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentifier(String);

impl DeviceIdentifier {
    pub fn new(udid: impl Into<String>) -> Self {
        Self(udid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentifier {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for DeviceIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which transports a connection attempt may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMode {
    /// USB only.
    #[default]
    LocalOnly,
    NetworkOnly,
    LocalAndNetwork,
    /// Both, trying the network connection first.
    PreferNetwork,
}

impl DiscoveryMode {
    pub fn allows_local(self) -> bool {
        !matches!(self, DiscoveryMode::NetworkOnly)
    }

    pub fn allows_network(self) -> bool {
        !matches!(self, DiscoveryMode::LocalOnly)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Usb,
    Network,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb => f.write_str("usb"),
            Transport::Network => f.write_str("network"),
        }
    }
}

/// Set of transports a device is currently reachable through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTypes {
    pub usb: bool,
    pub network: bool,
}

impl ConnectionTypes {
    pub fn only(transport: Transport) -> Self {
        let mut types = Self::default();
        types.insert(transport);
        types
    }

    pub fn contains(&self, transport: Transport) -> bool {
        match transport {
            Transport::Usb => self.usb,
            Transport::Network => self.network,
        }
    }

    /// Returns `true` if the transport was not present before.
    pub fn insert(&mut self, transport: Transport) -> bool {
        let slot = self.slot(transport);
        !std::mem::replace(slot, true)
    }

    /// Returns `true` if the transport was present before.
    pub fn remove(&mut self, transport: Transport) -> bool {
        let slot = self.slot(transport);
        std::mem::replace(slot, false)
    }

    pub fn is_empty(&self) -> bool {
        !self.usb && !self.network
    }

    fn slot(&mut self, transport: Transport) -> &mut bool {
        match transport {
            Transport::Usb => &mut self.usb,
            Transport::Network => &mut self.network,
        }
    }

    pub fn discovery_mode(&self, prefer_network: bool) -> DiscoveryMode {
        match (self.usb, self.network) {
            (true, false) => DiscoveryMode::LocalOnly,
            (false, true) => DiscoveryMode::NetworkOnly,
            _ if prefer_network => DiscoveryMode::PreferNetwork,
            _ => DiscoveryMode::LocalAndNetwork,
        }
    }
}

impl fmt::Display for ConnectionTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.usb, self.network) {
            (true, true) => f.write_str("usb+network"),
            (true, false) => f.write_str("usb"),
            (false, true) => f.write_str("network"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// A physical device known to the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub udid: DeviceIdentifier,
    pub name: String,
    pub connection: ConnectionTypes,
    pub prefer_network: bool,
}

impl Device {
    pub fn discovery_mode(&self) -> DiscoveryMode {
        self.connection.discovery_mode(self.prefer_network)
    }

    pub fn uses_network(&self) -> bool {
        self.discovery_mode().allows_network()
    }
}

/// OS version truncated to its first two components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProductVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses the leading digits of the first two dot separated components.
    /// `"14.2.1"` gives `14.2`. Returns `None` unless both components start
    /// with a digit.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        Some(Self { major, minor })
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let end = part
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(part.len(), |(i, _)| i);
    part[..end].parse().ok()
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_truncates_to_two_components() {
        assert_eq!(ProductVersion::parse("14.2.1"), Some(ProductVersion::new(14, 2)));
        assert_eq!(ProductVersion::parse("6.1"), Some(ProductVersion::new(6, 1)));
        assert_eq!(ProductVersion::parse("17.0b2"), Some(ProductVersion::new(17, 0)));
        assert_eq!(ProductVersion::parse("14.2.1").unwrap().to_string(), "14.2");
    }

    #[test]
    fn version_rejects_garbage() {
        assert_eq!(ProductVersion::parse(""), None);
        assert_eq!(ProductVersion::parse("14"), None);
        assert_eq!(ProductVersion::parse("abc.def"), None);
        assert_eq!(ProductVersion::parse(".3"), None);
    }

    #[test]
    fn discovery_mode_from_connection() {
        let usb = ConnectionTypes::only(Transport::Usb);
        let net = ConnectionTypes::only(Transport::Network);
        let both = ConnectionTypes { usb: true, network: true };

        assert_eq!(usb.discovery_mode(true), DiscoveryMode::LocalOnly);
        assert_eq!(net.discovery_mode(false), DiscoveryMode::NetworkOnly);
        assert_eq!(both.discovery_mode(false), DiscoveryMode::LocalAndNetwork);
        assert_eq!(both.discovery_mode(true), DiscoveryMode::PreferNetwork);
        assert!(!DiscoveryMode::NetworkOnly.allows_local());
        assert!(!DiscoveryMode::LocalOnly.allows_network());
    }

    #[test]
    fn connection_insert_remove() {
        let mut types = ConnectionTypes::default();
        assert!(types.insert(Transport::Usb));
        assert!(!types.insert(Transport::Usb));
        assert!(types.insert(Transport::Network));
        assert_eq!(types.to_string(), "usb+network");
        assert!(types.remove(Transport::Usb));
        assert!(!types.remove(Transport::Usb));
        assert!(types.remove(Transport::Network));
        assert!(types.is_empty());
    }
}
