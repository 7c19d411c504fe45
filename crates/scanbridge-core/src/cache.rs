//! Per-source capability cache.
//!
//! Holds what the client has learned about a source's capabilities: which
//! ones it supports, which it rejected, and the last values read back with
//! Get, GetCurrent and GetDefault. Each capability has a validity mask: a
//! cached value is only served while the source is in one of those states,
//! and leaving them drops the value.

use std::collections::{BTreeSet, HashMap};

use scanbridge_proto::{CapabilityId, Container, Msg};

use crate::state::{SourceState, StateMask};

/// Which Get-class message produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GetKind {
    /// All values the source allows
    Get,
    /// Current value
    GetCurrent,
    /// Power-on default
    GetDefault,
    /// Reset to default, returning the new current value
    Reset,
}

impl GetKind {
    /// Message code.
    pub fn msg(self) -> Msg {
        match self {
            Self::Get => Msg::GET,
            Self::GetCurrent => Msg::GETCURRENT,
            Self::GetDefault => Msg::GETDEFAULT,
            Self::Reset => Msg::RESET,
        }
    }

    /// Whether a read of this kind may be answered from cache.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, Self::Reset)
    }
}

/// Capability knowledge for one source.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCache {
    supported: Option<BTreeSet<CapabilityId>>,
    unsupported: BTreeSet<CapabilityId>,
    validity: HashMap<CapabilityId, StateMask>,
    values: HashMap<(CapabilityId, GetKind), Container>,
}

impl CapabilityCache {
    /// States in which cached values stay valid unless overridden.
    pub const DEFAULT_VALIDITY: StateMask = StateMask::OPENED;

    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the supported-capabilities list.
    pub fn set_supported(&mut self, caps: impl IntoIterator<Item = CapabilityId>) {
        self.supported = Some(caps.into_iter().collect());
    }

    /// Supported capabilities, once discovered.
    pub fn supported(&self) -> Option<&BTreeSet<CapabilityId>> {
        self.supported.as_ref()
    }

    /// Record that the source rejected a capability as unsupported.
    pub fn mark_unsupported(&mut self, cap: CapabilityId) {
        self.unsupported.insert(cap);
        self.invalidate(cap);
    }

    /// What the cache knows about support: `Some(false)` if rejected or
    /// missing from the supported list, `Some(true)` if listed, `None` if
    /// nothing is known.
    pub fn is_supported(&self, cap: CapabilityId) -> Option<bool> {
        if self.unsupported.contains(&cap) {
            return Some(false);
        }
        self.supported.as_ref().map(|caps| caps.contains(&cap))
    }

    /// Override the states in which values of `cap` stay valid.
    pub fn set_validity(&mut self, cap: CapabilityId, mask: StateMask) {
        self.validity.insert(cap, mask);
    }

    /// States in which values of `cap` stay valid.
    pub fn validity(&self, cap: CapabilityId) -> StateMask {
        self.validity.get(&cap).copied().unwrap_or(Self::DEFAULT_VALIDITY)
    }

    /// Cached value, if one is valid in `state`.
    pub fn get(&self, cap: CapabilityId, kind: GetKind, state: SourceState) -> Option<&Container> {
        if !self.validity(cap).contains(state.mask()) {
            return None;
        }
        self.values.get(&(cap, kind))
    }

    /// Store a value read in `state`. Ignored if not valid there.
    pub fn store(&mut self, cap: CapabilityId, kind: GetKind, state: SourceState, value: Container) {
        if kind.is_cacheable() && self.validity(cap).contains(state.mask()) {
            self.values.insert((cap, kind), value);
        }
    }

    /// Drop the values of `cap` that a Set or Reset may have changed.
    /// Defaults survive.
    pub fn invalidate(&mut self, cap: CapabilityId) {
        self.values.retain(|(cached, kind), _| *cached != cap || *kind == GetKind::GetDefault);
    }

    /// Drop every Get and GetCurrent value after a write. Setting one
    /// capability can change others (pixel type moves bit depth), so no
    /// current value is trusted afterwards. Defaults survive.
    pub fn invalidate_current(&mut self) {
        self.values.retain(|(_, kind), _| *kind == GetKind::GetDefault);
    }

    /// Drop every value (reset-all).
    pub fn invalidate_all(&mut self) {
        self.values.clear();
    }

    /// Drop values not valid in the new state.
    pub fn on_state_change(&mut self, state: SourceState) {
        let validity = &self.validity;
        self.values.retain(|(cap, _), _| {
            validity.get(cap).copied().unwrap_or(Self::DEFAULT_VALIDITY).contains(state.mask())
        });
    }

    /// Forget everything (source closed).
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// No cached values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use scanbridge_proto::{CapValue, ItemType};

    use super::*;

    fn one(v: u16) -> Container {
        Container::one(ItemType::UInt16, CapValue::UInt16(v))
    }

    #[test]
    fn values_served_only_in_valid_states() {
        let mut cache = CapabilityCache::new();
        let cap = CapabilityId::ICAP_PIXELTYPE;

        cache.store(cap, GetKind::GetCurrent, SourceState::Opened, one(2));
        assert_eq!(cache.get(cap, GetKind::GetCurrent, SourceState::Opened), Some(&one(2)));
        assert_eq!(cache.get(cap, GetKind::GetCurrent, SourceState::UIEnabled), None);

        cache.on_state_change(SourceState::UIEnabled);
        assert!(cache.is_empty());
    }

    #[test]
    fn extended_validity_survives_enable() {
        let mut cache = CapabilityCache::new();
        let cap = CapabilityId::CAP_DEVICEONLINE;
        cache.set_validity(cap, StateMask::OPENED | StateMask::UI_ENABLED);

        cache.store(cap, GetKind::GetCurrent, SourceState::Opened, one(1));
        cache.on_state_change(SourceState::UIEnabled);
        assert_eq!(cache.get(cap, GetKind::GetCurrent, SourceState::UIEnabled), Some(&one(1)));
    }

    #[test]
    fn set_invalidates_everything_but_defaults() {
        let mut cache = CapabilityCache::new();
        let cap = CapabilityId::ICAP_XRESOLUTION;
        for kind in [GetKind::Get, GetKind::GetCurrent, GetKind::GetDefault] {
            cache.store(cap, kind, SourceState::Opened, one(1));
        }
        cache.store(CapabilityId::ICAP_UNITS, GetKind::Get, SourceState::Opened, one(0));

        cache.invalidate(cap);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(cap, GetKind::GetDefault, SourceState::Opened).is_some());
        assert!(cache.get(cap, GetKind::Get, SourceState::Opened).is_none());
    }

    #[test]
    fn write_drops_current_values_of_every_capability() {
        let mut cache = CapabilityCache::new();
        for cap in [CapabilityId::ICAP_PIXELTYPE, CapabilityId::ICAP_BITDEPTH] {
            for kind in [GetKind::Get, GetKind::GetCurrent, GetKind::GetDefault] {
                cache.store(cap, kind, SourceState::Opened, one(8));
            }
        }

        cache.invalidate_current();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(CapabilityId::ICAP_BITDEPTH, GetKind::GetCurrent, SourceState::Opened).is_none());
        assert!(cache.get(CapabilityId::ICAP_BITDEPTH, GetKind::GetDefault, SourceState::Opened).is_some());
    }

    #[test]
    fn reset_is_never_cached() {
        let mut cache = CapabilityCache::new();
        cache.store(CapabilityId::ICAP_UNITS, GetKind::Reset, SourceState::Opened, one(0));
        assert!(cache.is_empty());
    }

    #[test]
    fn support_knowledge() {
        let mut cache = CapabilityCache::new();
        assert_eq!(cache.is_supported(CapabilityId::CAP_DUPLEX), None);

        cache.set_supported([CapabilityId::XFERCOUNT, CapabilityId::CAP_DUPLEX]);
        assert_eq!(cache.is_supported(CapabilityId::CAP_DUPLEX), Some(true));
        assert_eq!(cache.is_supported(CapabilityId::CAP_SHEETCOUNT), Some(false));

        cache.mark_unsupported(CapabilityId::CAP_DUPLEX);
        assert_eq!(cache.is_supported(CapabilityId::CAP_DUPLEX), Some(false));
    }
}
