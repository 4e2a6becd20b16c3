//! Device locators and detection results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::SniError;
use crate::mapping::AddressSpace;

/// Identifies a reachable or connected device.
///
/// Two textual forms: `scheme://host` for network endpoints and
/// `scheme:opaque` for everything else (device paths, singleton sentinels).
/// The scheme is the name of the driver that owns the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceLocator {
    scheme: String,
    target: LocatorTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LocatorTarget {
    Host(String),
    Opaque(String),
}

impl DeviceLocator {
    pub fn with_host(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            target: LocatorTarget::Host(host.into()),
        }
    }

    pub fn with_opaque(scheme: impl Into<String>, opaque: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            target: LocatorTarget::Opaque(opaque.into()),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> Option<&str> {
        match &self.target {
            LocatorTarget::Host(h) => Some(h),
            LocatorTarget::Opaque(_) => None,
        }
    }

    pub fn opaque(&self) -> Option<&str> {
        match &self.target {
            LocatorTarget::Opaque(o) => Some(o),
            LocatorTarget::Host(_) => None,
        }
    }

    /// Host or opaque part, whichever is present.
    pub fn target(&self) -> &str {
        match &self.target {
            LocatorTarget::Host(s) | LocatorTarget::Opaque(s) => s,
        }
    }
}

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            LocatorTarget::Host(h) => write!(f, "{}://{}", self.scheme, h),
            LocatorTarget::Opaque(o) => write!(f, "{}:{}", self.scheme, o),
        }
    }
}

impl FromStr for DeviceLocator {
    type Err = SniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| SniError::InvalidLocator(s.to_string()))?;

        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
        if !valid_scheme {
            return Err(SniError::InvalidLocator(s.to_string()));
        }

        let locator = match rest.strip_prefix("//") {
            Some(host) if !host.is_empty() => DeviceLocator::with_host(scheme, host),
            Some(_) => return Err(SniError::InvalidLocator(s.to_string())),
            None if !rest.is_empty() => DeviceLocator::with_opaque(scheme, rest),
            None => return Err(SniError::InvalidLocator(s.to_string())),
        };
        Ok(locator)
    }
}

impl TryFrom<String> for DeviceLocator {
    type Error = SniError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceLocator> for String {
    fn from(value: DeviceLocator) -> Self {
        value.to_string()
    }
}

/// A device found by `Driver::detect`. Rebuilt on every detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub locator: DeviceLocator,
    pub display_name: String,
    pub kind: String,
    pub capabilities: Vec<Capability>,
    pub default_address_space: AddressSpace,
}
