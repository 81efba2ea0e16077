//! Device kinds and chain ordering rules

use serde::{Deserialize, Serialize};

/// Signal type a device consumes/produces.
///
/// Ordering is significant: a device chain runs MIDI processors first,
/// then at most one instrument, then audio effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Note/event processor
    Midi,
    /// Turns events into audio
    Instrument,
    /// Audio effect
    #[default]
    Audio,
}

impl DeviceKind {
    /// Short label for logs and dumps
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Midi => "midi",
            DeviceKind::Instrument => "instrument",
            DeviceKind::Audio => "audio",
        }
    }

    /// Whether this device consumes note events on the dispatch path
    pub fn receives_events(&self) -> bool {
        matches!(self, DeviceKind::Midi | DeviceKind::Instrument)
    }
}

/// Check a prospective device sequence.
///
/// Returns a description of the first violation found, if any.
pub fn check_device_order(kinds: &[DeviceKind]) -> Option<String> {
    let mut instruments = 0;
    for (index, pair) in kinds.windows(2).enumerate() {
        if pair[1] < pair[0] {
            return Some(format!(
                "{} device at position {} follows {} device",
                pair[1].label(),
                index + 1,
                pair[0].label()
            ));
        }
    }
    for kind in kinds {
        if *kind == DeviceKind::Instrument {
            instruments += 1;
        }
    }
    if instruments > 1 {
        return Some(format!("{instruments} instrument devices in one chain"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_order() {
        assert!(DeviceKind::Midi < DeviceKind::Instrument);
        assert!(DeviceKind::Instrument < DeviceKind::Audio);
    }

    #[test]
    fn test_valid_chains() {
        use DeviceKind::*;
        assert!(check_device_order(&[]).is_none());
        assert!(check_device_order(&[Midi, Midi, Instrument, Audio, Audio]).is_none());
        assert!(check_device_order(&[Audio]).is_none());
    }

    #[test]
    fn test_out_of_order() {
        use DeviceKind::*;
        assert!(check_device_order(&[Audio, Midi]).is_some());
        assert!(check_device_order(&[Instrument, Midi]).is_some());
    }

    #[test]
    fn test_two_instruments() {
        use DeviceKind::*;
        let err = check_device_order(&[Instrument, Instrument]).unwrap();
        assert!(err.contains("2 instrument"));
    }
}
