//! Application and source identities.
//!
//! Both ends of a triplet are described by the same record. The numeric id
//! is assigned by the broker: for the application when the broker is
//! opened, for a source when it is enumerated or opened. Until then it is
//! zero and carries no meaning.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Data groups and sub-protocol generation an identity supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SupportedGroups: u32 {
        /// Control group
        const CONTROL = 0x0000_0001;
        /// Image group
        const IMAGE = 0x0000_0002;
        /// Audio group
        const AUDIO = 0x0000_0004;
        /// Set by a broker that speaks the 2.x sub-protocol
        const DSM2 = 0x1000_0000;
        /// Set by an application that speaks the 2.x sub-protocol
        const APP2 = 0x2000_0000;
        /// Set by a source that speaks the 2.x sub-protocol
        const DS2 = 0x4000_0000;
    }
}

/// Version block of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Version {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Language code
    pub language: u16,
    /// Country code
    pub country: u16,
    /// Free-form version text
    pub info: String,
}

/// Identity of an application or a source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Broker-assigned id, zero until negotiated
    pub id: u32,
    /// Version block
    pub version: Version,
    /// Protocol major version
    pub protocol_major: u16,
    /// Protocol minor version
    pub protocol_minor: u16,
    /// Supported groups bitmask
    pub supported_groups: SupportedGroups,
    /// Manufacturer name
    pub manufacturer: String,
    /// Product family
    pub product_family: String,
    /// Product name, unique per broker
    pub product_name: String,
}

impl Identity {
    /// Protocol version the client speaks.
    pub const PROTOCOL_MAJOR: u16 = 2;
    /// Protocol minor version the client speaks.
    pub const PROTOCOL_MINOR: u16 = 4;

    /// Identity for an application speaking the 2.x sub-protocol.
    pub fn application(
        manufacturer: impl Into<String>,
        product_family: impl Into<String>,
        product_name: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            version: Version { major: 1, minor: 0, language: 0, country: 0, info: String::new() },
            protocol_major: Self::PROTOCOL_MAJOR,
            protocol_minor: Self::PROTOCOL_MINOR,
            supported_groups: SupportedGroups::CONTROL
                | SupportedGroups::IMAGE
                | SupportedGroups::AUDIO
                | SupportedGroups::APP2,
            manufacturer: manufacturer.into(),
            product_family: product_family.into(),
            product_name: product_name.into(),
        }
    }

    /// Identity naming a source by product, used to open a specific device.
    pub fn source(product_name: impl Into<String>) -> Self {
        Self { product_name: product_name.into(), ..Self::default() }
    }

    /// Whether the broker has assigned an id.
    pub fn is_assigned(&self) -> bool {
        self.id != 0
    }

    /// Whether this identity speaks the 2.x sub-protocol in its role.
    pub fn speaks_v2(&self) -> bool {
        self.supported_groups.intersects(
            SupportedGroups::DSM2 | SupportedGroups::APP2 | SupportedGroups::DS2,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_identity_advertises_v2() {
        let app = Identity::application("Acme", "Imaging", "Capture");
        assert!(app.speaks_v2());
        assert!(!app.is_assigned());
        assert!(app.supported_groups.contains(SupportedGroups::IMAGE));
    }

    #[test]
    fn source_identity_is_legacy_until_flagged() {
        let mut source = Identity::source("Flatbed 9000");
        assert!(!source.speaks_v2());

        source.supported_groups |= SupportedGroups::DS2;
        assert!(source.speaks_v2());
    }
}
