//! Registry: the public session API
//!
//! Owns the node arena and one lock per application. Every mutation runs
//! the same protocol:
//! 1. discover the applications of every node it touches
//! 2. acquire their session locks in canonical order
//! 3. lock the arena and re-check discovery (retry if topology moved)
//! 4. run the mutation; all locks release on scope exit
//!
//! Read queries take the arena lock only. Callers that need several reads
//! to agree hold `session_lock(app).lock()` across them.
//!
//! Nothing outside the arena is called while it is locked except the
//! engine. Transport notifications wait until the arena is released, so a
//! transport may call back into the registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use rf_core::{
    BusRange, GraphOrder, HandleId, MixerError, MixerResult, NodeId, SessionConfig,
};

use crate::device::DeviceSpec;
use crate::engine::{Engine, ProgramLibrary, StandardPrograms, Transport};
use crate::lock::{LockSet, SessionLock};
use crate::perform::{NoteEvent, PerformReport};
use crate::send::Target;
use crate::snapshot::NodeSnapshot;
use crate::solo::ActivationDiff;
use crate::track::TrackKind;
use crate::tree::{AllocationState, ContainerRole, Tree};

/// Snapshot of a track's state
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub id: NodeId,
    pub name: Option<String>,
    pub kind: TrackKind,
    pub is_muted: bool,
    pub is_soloed: bool,
    pub is_active: bool,
    pub gain: f32,
    pub channel_count: usize,
}

/// Owner of every application and detached node
pub struct Registry {
    tree: Mutex<Tree>,
    sessions: RwLock<HashMap<NodeId, Arc<SessionLock>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_programs(Arc::new(StandardPrograms))
    }

    pub fn with_programs(programs: Arc<dyn ProgramLibrary>) -> Self {
        Self {
            tree: Mutex::new(Tree::new(programs)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOCKING
    // ═══════════════════════════════════════════════════════════════════════

    fn discover(tree: &Tree, seeds: &[NodeId]) -> BTreeSet<NodeId> {
        seeds.iter().filter_map(|s| tree.application_of(*s)).collect()
    }

    fn lock_set(&self, apps: &BTreeSet<NodeId>) -> LockSet {
        let sessions = self.sessions.read();
        let mut set = LockSet::new();
        for app in apps {
            if let Some(lock) = sessions.get(app) {
                set.add(Arc::clone(lock));
            }
        }
        set
    }

    /// Run `op` under the locks of every application reachable from `seeds`.
    ///
    /// Transport notifications raised by `op` are delivered after the
    /// arena lock is released, still under the session locks.
    fn mutate<R>(
        &self,
        seeds: &[NodeId],
        op: impl FnOnce(&mut Tree) -> MixerResult<R>,
    ) -> MixerResult<R> {
        loop {
            let apps = Self::discover(&self.tree.lock(), seeds);
            let set = self.lock_set(&apps);
            let _guard = set.acquire();
            let mut tree = self.tree.lock();
            if Self::discover(&tree, seeds) != apps {
                log::debug!("topology moved during lock acquisition, retrying");
                continue;
            }
            let result = op(&mut tree);
            let notices = tree.take_transport_notices();
            drop(tree);
            for notice in notices {
                notice.deliver();
            }
            return result;
        }
    }

    /// Lock handle of `app`, for multi-read snapshots
    pub fn session_lock(&self, app: NodeId) -> MixerResult<Arc<SessionLock>> {
        self.sessions
            .read()
            .get(&app)
            .cloned()
            .ok_or(MixerError::NodeNotFound(app))
    }

    /// Read access to the arena
    pub fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.tree.lock())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    pub fn new_application(&self, config: SessionConfig) -> MixerResult<NodeId> {
        let app = self.tree.lock().create_application(config)?;
        self.sessions
            .write()
            .insert(app, Arc::new(SessionLock::new(app)));
        Ok(app)
    }

    pub fn applications(&self) -> Vec<NodeId> {
        let mut apps: Vec<NodeId> = self.sessions.read().keys().copied().collect();
        apps.sort();
        apps
    }

    /// Allocate `app` on `engine`. Returns `false` when already running
    /// there.
    pub fn boot(
        &self,
        app: NodeId,
        engine: Arc<dyn Engine>,
        transport: Option<Arc<dyn Transport>>,
    ) -> MixerResult<bool> {
        self.mutate(&[app], |tree| tree.boot(app, engine, transport))
    }

    /// Free everything `app` holds remotely. Returns `false` when it was
    /// not running.
    pub fn quit(&self, app: NodeId) -> MixerResult<bool> {
        self.mutate(&[app], |tree| tree.quit(app))
    }

    /// Drop an application or a detached subtree for good
    pub fn dispose(&self, node: NodeId) -> MixerResult<()> {
        self.mutate(&[node], |tree| {
            tree.node(node)?;
            if tree.parent(node).is_some() {
                return Err(MixerError::structural(format!(
                    "{} is attached; delete it instead",
                    tree.label(node)
                )));
            }
            tree.free(node);
            tree.remove_subtree(node);
            Ok(())
        })?;
        self.sessions.write().remove(&node);
        log::debug!("disposed {node}");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRACKS
    // ═══════════════════════════════════════════════════════════════════════

    /// Append an audio track to an application or group track
    pub fn add_track(&self, parent: NodeId, name: Option<&str>) -> MixerResult<NodeId> {
        self.mutate(&[parent], |tree| tree.add_track(parent, TrackKind::Audio, name))
    }

    pub fn add_group_track(&self, parent: NodeId, name: Option<&str>) -> MixerResult<NodeId> {
        self.mutate(&[parent], |tree| tree.add_track(parent, TrackKind::Group, name))
    }

    pub fn add_return_track(&self, app: NodeId, name: Option<&str>) -> MixerResult<NodeId> {
        self.mutate(&[app], |tree| {
            tree.application_body(app)?;
            tree.add_track(app, TrackKind::Return, name)
        })
    }

    /// Move `track` into `owner` (application, group track or rack) at
    /// `index`
    pub fn move_track(&self, track: NodeId, owner: NodeId, index: usize) -> MixerResult<()> {
        self.mutate(&[track, owner], |tree| tree.move_track(track, owner, index))
    }

    /// Remove any node from its container and drop it
    pub fn delete(&self, node: NodeId) -> MixerResult<()> {
        self.mutate(&[node], |tree| tree.delete(node))
    }

    pub fn group(&self, tracks: &[NodeId], name: Option<&str>) -> MixerResult<NodeId> {
        self.mutate(tracks, |tree| tree.group(tracks, name))
    }

    pub fn ungroup(&self, group: NodeId) -> MixerResult<Vec<NodeId>> {
        self.mutate(&[group], |tree| tree.ungroup(group))
    }

    pub fn set_channel_count(&self, node: NodeId, count: Option<usize>) -> MixerResult<()> {
        self.mutate(&[node], |tree| tree.set_channel_count(node, count))
    }

    pub fn set_gain(&self, track: NodeId, gain: f32) -> MixerResult<()> {
        self.mutate(&[track], |tree| tree.set_gain(track, gain))
    }

    /// Re-synchronize `node`'s subtree and every send wired into it with
    /// the engine. Produces no traffic when nothing drifted.
    pub fn reallocate(&self, node: NodeId) -> MixerResult<()> {
        self.mutate(&[node], |tree| {
            tree.node(node)?;
            tree.resync(&[node]);
            Ok(())
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DEVICES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_device(&self, track: NodeId, spec: &DeviceSpec) -> MixerResult<NodeId> {
        self.mutate(&[track], |tree| tree.add_device(track, spec))
    }

    pub fn insert_device(&self, track: NodeId, index: usize, spec: &DeviceSpec) -> MixerResult<NodeId> {
        self.mutate(&[track], |tree| tree.insert_device(track, index, spec))
    }

    pub fn remove_devices(&self, track: NodeId, devices: &[NodeId]) -> MixerResult<()> {
        self.mutate(&[track], |tree| tree.remove_devices(track, devices))
    }

    pub fn move_device(&self, device: NodeId, track: NodeId, index: usize) -> MixerResult<()> {
        self.mutate(&[device, track], |tree| tree.move_device(device, track, index))
    }

    pub fn add_chain(&self, rack: NodeId, name: Option<&str>) -> MixerResult<NodeId> {
        self.mutate(&[rack], |tree| tree.add_chain(rack, name))
    }

    pub fn remove_chains(&self, rack: NodeId, chains: &[NodeId]) -> MixerResult<()> {
        self.mutate(&[rack], |tree| tree.remove_chains(rack, chains))
    }

    /// Restore a bypassed device. Returns `false` when it was already active.
    pub fn activate_device(&self, device: NodeId) -> MixerResult<bool> {
        self.mutate(&[device], |tree| tree.set_device_active(device, true))
    }

    /// Bypass a device. Returns `false` when it was already bypassed.
    pub fn deactivate_device(&self, device: NodeId) -> MixerResult<bool> {
        self.mutate(&[device], |tree| tree.set_device_active(device, false))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SENDS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_send(&self, source: NodeId, target: Target, post_fader: bool) -> MixerResult<NodeId> {
        let mut seeds = vec![source];
        if let Target::Explicit(t) = target {
            seeds.push(t);
        }
        self.mutate(&seeds, |tree| tree.add_send(source, target, post_fader))
    }

    pub fn remove_sends(&self, sends: &[NodeId]) -> MixerResult<()> {
        self.mutate(sends, |tree| tree.remove_sends(sends))
    }

    pub fn set_send_target(&self, send: NodeId, target: Target) -> MixerResult<()> {
        let mut seeds = vec![send];
        if let Target::Explicit(t) = target {
            seeds.push(t);
        }
        self.mutate(&seeds, |tree| tree.set_send_target(send, target))
    }

    pub fn set_send_gain(&self, send: NodeId, gain: f32) -> MixerResult<()> {
        self.mutate(&[send], |tree| tree.set_send_gain(send, gain))
    }

    /// Hardware direct out after the output stage
    pub fn add_direct_out(&self, track: NodeId, bus_start: u32, count: usize) -> MixerResult<NodeId> {
        self.mutate(&[track], |tree| {
            tree.add_direct_out(track, BusRange::new(bus_start, count), true)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RECEIVES
    // ═══════════════════════════════════════════════════════════════════════

    /// Pull `source`'s output (a track or rack) into `track`
    pub fn add_receive(&self, track: NodeId, source: NodeId) -> MixerResult<NodeId> {
        self.mutate(&[track, source], |tree| tree.add_receive(track, source))
    }

    pub fn set_receive_source(&self, patch: NodeId, source: NodeId) -> MixerResult<()> {
        self.mutate(&[patch, source], |tree| tree.set_receive_source(patch, source))
    }

    pub fn set_receive_gain(&self, patch: NodeId, gain: f32) -> MixerResult<()> {
        self.mutate(&[patch], |tree| tree.set_receive_gain(patch, gain))
    }

    /// Copy hardware inputs `[input, input + count)` onto `track`'s output
    pub fn add_direct_in(&self, track: NodeId, input: usize, count: usize) -> MixerResult<NodeId> {
        self.mutate(&[track], |tree| tree.add_direct_in(track, input, count))
    }

    /// Remove receive patches or direct ins
    pub fn remove_receives(&self, nodes: &[NodeId]) -> MixerResult<()> {
        self.mutate(nodes, |tree| tree.remove_receives(nodes))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MUTE / SOLO
    // ═══════════════════════════════════════════════════════════════════════

    pub fn mute(&self, track: NodeId) -> MixerResult<ActivationDiff> {
        self.mutate(&[track], |tree| tree.mute(track))
    }

    pub fn unmute(&self, track: NodeId) -> MixerResult<ActivationDiff> {
        self.mutate(&[track], |tree| tree.unmute(track))
    }

    pub fn solo(&self, track: NodeId, exclusive: bool) -> MixerResult<ActivationDiff> {
        self.mutate(&[track], |tree| tree.solo(track, exclusive))
    }

    pub fn unsolo(&self, track: NodeId) -> MixerResult<ActivationDiff> {
        self.mutate(&[track], |tree| tree.unsolo(track))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DISPATCH
    // ═══════════════════════════════════════════════════════════════════════

    /// Deliver note events into a track or chain
    pub fn perform(&self, track: NodeId, events: &[NoteEvent]) -> MixerResult<PerformReport> {
        self.mutate(&[track], |tree| tree.perform(track, events))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn track_info(&self, track: NodeId) -> MixerResult<TrackInfo> {
        let tree = self.tree.lock();
        let body = tree.track(track)?;
        Ok(TrackInfo {
            id: track,
            name: tree.node(track)?.name.clone(),
            kind: body.kind,
            is_muted: body.is_muted,
            is_soloed: body.is_soloed,
            is_active: body.is_active,
            gain: body.gain,
            channel_count: tree.effective_channel_count(track),
        })
    }

    pub fn is_active(&self, track: NodeId) -> MixerResult<bool> {
        Ok(self.tree.lock().track(track)?.is_active)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.lock().parent(node)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree.lock().children(node).to_vec()
    }

    /// Container with `role` owned by `owner`
    pub fn part(&self, owner: NodeId, role: ContainerRole) -> Option<NodeId> {
        self.tree.lock().part(owner, role)
    }

    /// Children of `owner`'s container with `role`
    pub fn contents(&self, owner: NodeId, role: ContainerRole) -> MixerResult<Vec<NodeId>> {
        let tree = self.tree.lock();
        let container = tree.require_part(owner, role)?;
        Ok(tree.children(container).to_vec())
    }

    /// Tracks of an application or group track
    pub fn tracks(&self, owner: NodeId) -> MixerResult<Vec<NodeId>> {
        self.contents(owner, ContainerRole::Tracks)
    }

    pub fn returns(&self, app: NodeId) -> MixerResult<Vec<NodeId>> {
        self.contents(app, ContainerRole::Returns)
    }

    pub fn devices(&self, track: NodeId) -> MixerResult<Vec<NodeId>> {
        self.contents(track, ContainerRole::Devices)
    }

    pub fn chains(&self, rack: NodeId) -> MixerResult<Vec<NodeId>> {
        self.contents(rack, ContainerRole::Chains)
    }

    pub fn sends(&self, track: NodeId, post_fader: bool) -> MixerResult<Vec<NodeId>> {
        let role = if post_fader {
            ContainerRole::PostFaderSends
        } else {
            ContainerRole::PreFaderSends
        };
        self.contents(track, role)
    }

    /// Receive patches and direct ins of `track`
    pub fn receives(&self, track: NodeId) -> MixerResult<Vec<NodeId>> {
        self.contents(track, ContainerRole::Receives)
    }

    pub fn master_track(&self, app: NodeId) -> Option<NodeId> {
        self.tree.lock().master_track(app)
    }

    pub fn cue_track(&self, app: NodeId) -> Option<NodeId> {
        self.tree.lock().cue_track(app)
    }

    pub fn application_of(&self, node: NodeId) -> Option<NodeId> {
        self.tree.lock().application_of(node)
    }

    /// Target `send` resolves to in the current tree
    pub fn send_target(&self, send: NodeId) -> MixerResult<Option<NodeId>> {
        self.tree.lock().send_target(send)
    }

    /// Sends resolved to `node`, in graph order
    pub fn incoming_sends(&self, node: NodeId) -> Vec<NodeId> {
        self.tree.lock().incoming_sends(node)
    }

    /// Source `patch` resolves to in the current tree
    pub fn receive_source(&self, patch: NodeId) -> MixerResult<Option<NodeId>> {
        self.tree.lock().receive_source(patch)
    }

    /// Receive patches pulling from `node`, in graph order
    pub fn receives_from(&self, node: NodeId) -> Vec<NodeId> {
        self.tree.lock().receives_from(node)
    }

    pub fn is_device_active(&self, device: NodeId) -> MixerResult<bool> {
        self.tree.lock().is_device_active(device)
    }

    pub fn graph_order(&self, node: NodeId) -> GraphOrder {
        self.tree.lock().graph_order(node)
    }

    pub fn handle(&self, node: NodeId) -> Option<HandleId> {
        self.tree.lock().handle(node)
    }

    pub fn input_bus(&self, node: NodeId) -> Option<BusRange> {
        self.tree.lock().input_bus(node)
    }

    pub fn output_bus(&self, node: NodeId) -> Option<BusRange> {
        self.tree.lock().output_bus(node)
    }

    pub fn allocation_state(&self, node: NodeId) -> MixerResult<AllocationState> {
        Ok(self.tree.lock().node(node)?.state)
    }

    pub fn label(&self, node: NodeId) -> String {
        self.tree.lock().label(node)
    }

    /// Serializable view of `node` and its subtree, taken under the
    /// session lock
    pub fn snapshot(&self, node: NodeId) -> MixerResult<NodeSnapshot> {
        self.mutate(&[node], |tree| NodeSnapshot::capture(tree, node))
    }

    /// Config of the application holding `node`
    pub fn config(&self, node: NodeId) -> MixerResult<SessionConfig> {
        let tree = self.tree.lock();
        let app = tree.application_of(node).ok_or_else(|| {
            MixerError::scope(format!("{} is not in an application", tree.label(node)))
        })?;
        Ok(tree.application_body(app)?.config.clone())
    }
}
