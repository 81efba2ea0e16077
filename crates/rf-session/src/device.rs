//! Device chains and racks
//!
//! A track's `Devices` container holds, in order, MIDI processors, at most
//! one instrument, then audio effects. Every insert goes through the
//! validated container replace, so a rejected device never reaches the
//! chain.
//!
//! A rack is a device holding parallel chains. Its remote layout:
//! - rack-in stage: track output → rack input bus
//! - chains container: each chain reads the rack input bus and sends into
//!   the rack output bus
//! - rack-out stage: rack output bus → track output
//!
//! Plain devices can be bypassed. A bypassed effect keeps its synth with
//! `active` at 0; a bypassed instrument releases its voices.

use std::collections::{BTreeMap, BTreeSet};

use rf_core::{BusId, DeviceKind, HandleId, MixerError, MixerResult, NodeId};

use crate::track::TrackKind;
use crate::tree::{ContainerRole, NodeBody, StageKind, Tree};

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Description of a device to create
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    /// Effect program (audio) or voice program (instrument)
    pub program: Option<String>,
    /// Build a rack instead of a plain device
    pub rack: bool,
    /// Semitone shift applied by MIDI devices
    pub transpose: i8,
}

impl DeviceSpec {
    pub fn midi(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::Midi,
            program: None,
            rack: false,
            transpose: 0,
        }
    }

    pub fn instrument(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::Instrument,
            program: Some(program.into()),
            rack: false,
            transpose: 0,
        }
    }

    pub fn audio(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::Audio,
            program: Some(program.into()),
            rack: false,
            transpose: 0,
        }
    }

    /// Rack of the given kind (audio or instrument)
    pub fn rack(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            program: None,
            rack: true,
            transpose: 0,
        }
    }

    pub fn with_transpose(mut self, semitones: i8) -> Self {
        self.transpose = semitones;
        self
    }
}

#[derive(Debug)]
pub struct DeviceBody {
    pub kind: DeviceKind,
    pub program: Option<String>,
    pub transpose: i8,
    /// `false` while bypassed
    pub is_active: bool,
    /// Sounding voices of an instrument, by note
    pub voices: BTreeMap<u8, HandleId>,
    /// Bus the sounding voices write into
    pub voice_bus: Option<BusId>,
}

#[derive(Debug)]
pub struct RackBody {
    pub kind: DeviceKind,
    /// Sends currently resolved to this rack
    pub incoming: BTreeSet<NodeId>,
    /// Receive patches currently pulling from this rack
    pub listeners: BTreeSet<NodeId>,
}

// ═══════════════════════════════════════════════════════════════════════════
// OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Tree {
    /// Build a detached device (or rack with its fixed parts)
    pub(crate) fn create_device(&mut self, spec: &DeviceSpec) -> NodeId {
        let name = Some(spec.name.clone());
        if spec.rack {
            let rack = self.spawn(
                None,
                name,
                NodeBody::Rack(RackBody {
                    kind: spec.kind,
                    incoming: BTreeSet::new(),
                    listeners: BTreeSet::new(),
                }),
            );
            self.spawn(Some(rack), None, NodeBody::Stage(StageKind::RackInput));
            self.spawn_container(rack, ContainerRole::Chains);
            self.spawn(Some(rack), None, NodeBody::Stage(StageKind::RackOutput));
            rack
        } else {
            self.spawn(
                None,
                name,
                NodeBody::Device(DeviceBody {
                    kind: spec.kind,
                    program: spec.program.clone(),
                    transpose: spec.transpose,
                    is_active: true,
                    voices: BTreeMap::new(),
                    voice_bus: None,
                }),
            )
        }
    }

    fn devices_of(&self, track: NodeId) -> MixerResult<NodeId> {
        self.track(track)?;
        self.require_part(track, ContainerRole::Devices)
    }

    pub(crate) fn add_device(&mut self, track: NodeId, spec: &DeviceSpec) -> MixerResult<NodeId> {
        let len = self.children(self.devices_of(track)?).len();
        self.insert_device(track, len, spec)
    }

    pub(crate) fn insert_device(
        &mut self,
        track: NodeId,
        index: usize,
        spec: &DeviceSpec,
    ) -> MixerResult<NodeId> {
        let devices = self.devices_of(track)?;
        let device = self.create_device(spec);
        if let Err(err) = self.replace(devices, index..index, &[device]) {
            self.remove_subtree(device);
            return Err(err);
        }
        log::debug!("added {} to {}", self.label(device), self.label(track));
        Ok(device)
    }

    fn check_members(&self, container: NodeId, members: &[NodeId]) -> MixerResult<()> {
        for member in members {
            self.node(*member)?;
            if self.parent(*member) != Some(container) {
                return Err(MixerError::scope(format!(
                    "{} is not in {}",
                    self.label(*member),
                    self.label(container)
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn remove_devices(&mut self, track: NodeId, devices: &[NodeId]) -> MixerResult<()> {
        let container = self.devices_of(track)?;
        self.check_members(container, devices)?;
        for device in devices {
            self.delete(*device)?;
        }
        Ok(())
    }

    /// Move `device` into `track`'s chain before the device currently at
    /// `index`
    pub(crate) fn move_device(&mut self, device: NodeId, track: NodeId, index: usize) -> MixerResult<()> {
        let container = self.devices_of(track)?;
        if self.device_kind(device).is_none() {
            return Err(MixerError::structural(format!(
                "{} is not a device",
                self.label(device)
            )));
        }
        let len = self.children(container).len();
        if index > len {
            return Err(MixerError::structural(format!(
                "index {index} out of range for {len} devices"
            )));
        }
        self.replace(container, index..index, &[device])
    }

    /// Bypass (`active = false`) or restore a plain device
    pub(crate) fn set_device_active(&mut self, device: NodeId, active: bool) -> MixerResult<bool> {
        let label = self.label(device);
        let body = match &mut self.node_mut(device)?.body {
            NodeBody::Device(body) => body,
            NodeBody::Rack(_) => {
                return Err(MixerError::structural(format!(
                    "{label} is a rack; mute its chains instead"
                )))
            }
            _ => return Err(MixerError::structural(format!("{label} is not a device"))),
        };
        if body.is_active == active {
            return Ok(false);
        }
        body.is_active = active;
        let kind = body.kind;
        let released: Vec<HandleId> = if active {
            Vec::new()
        } else {
            body.voice_bus = None;
            std::mem::take(&mut body.voices).into_values().collect()
        };
        log::debug!("{label} {}", if active { "activated" } else { "bypassed" });
        let (Some(handle), Some(binding)) = (self.handle(device), self.binding(device)) else {
            return Ok(true);
        };
        match kind {
            DeviceKind::Audio => {
                binding.engine.set_control(handle, "active", if active { 1.0 } else { 0.0 });
            }
            DeviceKind::Instrument => {
                for voice in released {
                    binding.engine.set_control(voice, "gate", 0.0);
                }
            }
            DeviceKind::Midi => {}
        }
        Ok(true)
    }

    pub fn is_device_active(&self, device: NodeId) -> MixerResult<bool> {
        match &self.node(device)?.body {
            NodeBody::Device(body) => Ok(body.is_active),
            NodeBody::Rack(_) => Ok(true),
            _ => Err(MixerError::structural(format!("{} is not a device", self.label(device)))),
        }
    }

    pub(crate) fn add_chain(&mut self, rack: NodeId, name: Option<&str>) -> MixerResult<NodeId> {
        if !matches!(self.node(rack)?.body, NodeBody::Rack(_)) {
            return Err(MixerError::structural(format!("{} is not a rack", self.label(rack))));
        }
        self.add_track(rack, TrackKind::Chain, name)
    }

    pub(crate) fn remove_chains(&mut self, rack: NodeId, chains: &[NodeId]) -> MixerResult<()> {
        let container = self.require_part(rack, ContainerRole::Chains)?;
        self.check_members(container, chains)?;
        for chain in chains {
            self.delete(*chain)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use std::sync::Arc;

    fn track(tree: &mut Tree) -> NodeId {
        tree.create_track(TrackKind::Audio, Some("t"), None)
    }

    #[test]
    fn test_ordered_chain_accepted() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        let arp = tree.add_device(t, &DeviceSpec::midi("arp")).unwrap();
        let synth = tree.add_device(t, &DeviceSpec::instrument("synth", "inst/saw")).unwrap();
        let eq = tree.add_device(t, &DeviceSpec::audio("eq", "fx/eq")).unwrap();
        let devices = tree.part(t, ContainerRole::Devices).unwrap();
        assert_eq!(tree.children(devices), &[arp, synth, eq]);
    }

    #[test]
    fn test_second_instrument_rejected() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        tree.add_device(t, &DeviceSpec::instrument("a", "inst/a")).unwrap();
        let before = tree.len();
        let err = tree
            .add_device(t, &DeviceSpec::instrument("b", "inst/b"))
            .unwrap_err();
        assert!(matches!(err, MixerError::StructuralViolation(_)));
        let devices = tree.part(t, ContainerRole::Devices).unwrap();
        assert_eq!(tree.children(devices).len(), 1);
        assert_eq!(tree.len(), before);
    }

    #[test]
    fn test_midi_after_audio_rejected() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        tree.add_device(t, &DeviceSpec::audio("eq", "fx/eq")).unwrap();
        let err = tree.add_device(t, &DeviceSpec::midi("arp")).unwrap_err();
        assert!(matches!(err, MixerError::StructuralViolation(_)));
        assert!(tree.insert_device(t, 0, &DeviceSpec::midi("arp")).is_ok());
    }

    #[test]
    fn test_instrument_rack_counts_as_instrument() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        tree.add_device(t, &DeviceSpec::rack("layers", DeviceKind::Instrument))
            .unwrap();
        let err = tree
            .add_device(t, &DeviceSpec::instrument("synth", "inst/saw"))
            .unwrap_err();
        assert!(matches!(err, MixerError::StructuralViolation(_)));
    }

    #[test]
    fn test_rack_layout_and_chains() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        let rack = tree
            .add_device(t, &DeviceSpec::rack("split", DeviceKind::Audio))
            .unwrap();
        assert!(tree.stage(rack, StageKind::RackInput).is_some());
        assert!(tree.stage(rack, StageKind::RackOutput).is_some());

        let low = tree.add_chain(rack, Some("low")).unwrap();
        let high = tree.add_chain(rack, Some("high")).unwrap();
        let chains = tree.part(rack, ContainerRole::Chains).unwrap();
        assert_eq!(tree.children(chains), &[low, high]);
        assert_eq!(tree.track(low).unwrap().kind, TrackKind::Chain);

        let post = tree.part(low, ContainerRole::PostFaderSends).unwrap();
        let send = tree.children(post)[0];
        assert_eq!(tree.resolve_target(send), Some(rack));

        tree.remove_chains(rack, &[low]).unwrap();
        assert_eq!(tree.children(chains), &[high]);
        assert!(!tree.contains(low));
        assert!(!tree.contains(send));
    }

    #[test]
    fn test_add_chain_requires_rack() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        let eq = tree.add_device(t, &DeviceSpec::audio("eq", "fx/eq")).unwrap();
        assert!(matches!(
            tree.add_chain(eq, None),
            Err(MixerError::StructuralViolation(_))
        ));
    }

    #[test]
    fn test_move_device_between_tracks() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let a = track(&mut tree);
        let b = track(&mut tree);
        let eq = tree.add_device(a, &DeviceSpec::audio("eq", "fx/eq")).unwrap();
        let comp = tree.add_device(b, &DeviceSpec::audio("comp", "fx/comp")).unwrap();
        tree.move_device(eq, b, 0).unwrap();
        let devices = tree.part(b, ContainerRole::Devices).unwrap();
        assert_eq!(tree.children(devices), &[eq, comp]);

        let other = tree.part(a, ContainerRole::Devices).unwrap();
        assert!(tree.children(other).is_empty());
        assert!(matches!(
            tree.remove_devices(a, &[eq]),
            Err(MixerError::ScopeMismatch(_))
        ));
    }

    #[test]
    fn test_bypass_toggles_once() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        let eq = tree.add_device(t, &DeviceSpec::audio("eq", "fx/eq")).unwrap();
        assert!(tree.set_device_active(eq, false).unwrap());
        assert!(!tree.set_device_active(eq, false).unwrap());
        assert!(!tree.is_device_active(eq).unwrap());
        assert!(tree.set_device_active(eq, true).unwrap());
        assert!(tree.is_device_active(eq).unwrap());
    }

    #[test]
    fn test_rack_bypass_rejected() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let t = track(&mut tree);
        let rack = tree
            .add_device(t, &DeviceSpec::rack("split", DeviceKind::Audio))
            .unwrap();
        assert!(matches!(
            tree.set_device_active(rack, false),
            Err(MixerError::StructuralViolation(_))
        ));
        assert!(matches!(
            tree.set_device_active(t, false),
            Err(MixerError::StructuralViolation(_))
        ));
    }
}
