//! One invocation of the entry point.

use scanbridge_proto::{DataArgType, DataGroup, Identity, Msg, ReturnCode};

use crate::entry::Payload;

/// A single call: who, to whom, which operation, with what payload.
///
/// Triplets are built, executed once and dropped. The identities are owned
/// copies so a call can be handed to a watchdog worker thread.
#[derive(Debug)]
pub struct Triplet {
    /// Calling application
    pub origin: Identity,
    /// Target source, `None` for calls addressed to the broker
    pub dest: Option<Identity>,
    /// Data group
    pub group: DataGroup,
    /// Data-argument type
    pub dat: DataArgType,
    /// Message
    pub msg: Msg,
    /// Payload
    pub payload: Payload,
}

impl Triplet {
    /// Control-group call.
    pub fn control(
        origin: &Identity,
        dest: Option<&Identity>,
        dat: DataArgType,
        msg: Msg,
        payload: Payload,
    ) -> Self {
        Self::new(origin, dest, DataGroup::Control, dat, msg, payload)
    }

    /// Image-group call.
    pub fn image(origin: &Identity, dest: &Identity, dat: DataArgType, msg: Msg, payload: Payload) -> Self {
        Self::new(origin, Some(dest), DataGroup::Image, dat, msg, payload)
    }

    /// Audio-group call.
    pub fn audio(origin: &Identity, dest: &Identity, dat: DataArgType, msg: Msg, payload: Payload) -> Self {
        Self::new(origin, Some(dest), DataGroup::Audio, dat, msg, payload)
    }

    /// Call in any group.
    pub fn new(
        origin: &Identity,
        dest: Option<&Identity>,
        group: DataGroup,
        dat: DataArgType,
        msg: Msg,
        payload: Payload,
    ) -> Self {
        Self { origin: origin.clone(), dest: dest.cloned(), group, dat, msg, payload }
    }

    /// Calls that block on the user or on the device and must never be
    /// abandoned by the watchdog.
    pub fn is_timeout_exempt(&self) -> bool {
        matches!(
            (self.dat, self.msg),
            (DataArgType::USERINTERFACE, Msg::ENABLEDS | Msg::ENABLEDSUIONLY)
                | (DataArgType::IDENTITY, Msg::USERSELECT)
                | (DataArgType::EVENT, Msg::PROCESSEVENT)
                | (
                    DataArgType::IMAGENATIVEXFER
                        | DataArgType::IMAGEFILEXFER
                        | DataArgType::IMAGEMEMXFER
                        | DataArgType::AUDIONATIVEXFER
                        | DataArgType::AUDIOFILEXFER,
                    Msg::GET
                )
        )
    }
}

/// What came back from a call.
#[derive(Debug)]
pub struct Reply {
    /// Verb-specific return code
    pub code: ReturnCode,
    /// Origin identity as the broker left it
    pub origin: Identity,
    /// Payload as the broker left it
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_calls_are_exempt_from_the_watchdog() {
        let app = Identity::application("Acme", "Imaging", "Capture");
        let source = Identity::source("Flatbed");

        let enable =
            Triplet::control(&app, Some(&source), DataArgType::USERINTERFACE, Msg::ENABLEDS, Payload::None);
        let native =
            Triplet::image(&app, &source, DataArgType::IMAGENATIVEXFER, Msg::GET, Payload::NativeXfer(None));
        let disable =
            Triplet::control(&app, Some(&source), DataArgType::USERINTERFACE, Msg::DISABLEDS, Payload::None);
        let info = Triplet::image(&app, &source, DataArgType::IMAGEINFO, Msg::GET, Payload::None);

        assert!(enable.is_timeout_exempt());
        assert!(native.is_timeout_exempt());
        assert!(!disable.is_timeout_exempt());
        assert!(!info.is_timeout_exempt());
    }
}
