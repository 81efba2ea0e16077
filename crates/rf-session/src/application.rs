//! Application (session root)
//!
//! Children, in order: track container, return container, master track,
//! cue track. Master and cue copy their output to the hardware buses through
//! direct outs: master on `[0, cc)`, cue on `[cc, 2*cc)`.

use std::sync::Arc;

use rf_core::{BusRange, MixerResult, NodeId, SessionConfig};

use crate::engine::{Engine, Transport};
use crate::send::DirectOutBody;
use crate::track::TrackKind;
use crate::tree::{ApplicationBody, Binding, ContainerRole, NodeBody, Tree};

impl Tree {
    /// Build an unbooted application
    pub(crate) fn create_application(&mut self, config: SessionConfig) -> MixerResult<NodeId> {
        config.validate()?;
        let channels = config.channel_count;
        let app = self.spawn(
            None,
            Some(config.name.clone()),
            NodeBody::Application(ApplicationBody {
                config,
                transport: None,
            }),
        );
        self.node_mut(app)?.channel_count = Some(channels);
        self.spawn_container(app, ContainerRole::Tracks);
        self.spawn_container(app, ContainerRole::Returns);

        for (index, kind) in [TrackKind::Master, TrackKind::Cue].into_iter().enumerate() {
            let track = self.create_track(kind, Some(kind.label()), None);
            self.adopt(app, track)?;
            let post = self.require_part(track, ContainerRole::PostFaderSends)?;
            let bus = BusRange::new((index * channels) as u32, channels);
            self.spawn(Some(post), None, NodeBody::DirectOut(DirectOutBody { bus }));
        }
        log::debug!("created {}", self.label(app));
        Ok(app)
    }

    /// Allocate the whole application on `engine`.
    ///
    /// Returns `false` when it was already running on that engine.
    pub(crate) fn boot(
        &mut self,
        app: NodeId,
        engine: Arc<dyn Engine>,
        transport: Option<Arc<dyn Transport>>,
    ) -> MixerResult<bool> {
        self.application_body(app)?;
        let binding = Binding {
            engine,
            application: app,
        };
        if self.binding(app).is_some_and(|b| b.same_engine(&binding)) {
            return Ok(false);
        }
        // rebinding frees against the old transport first
        if self.is_bound(app) {
            self.free(app);
        }
        self.application_body_mut(app)?.transport = transport;
        self.pre_allocate(app, &binding);
        self.post_allocate(app);
        log::info!(
            "booted {} on engine {} ({} nodes)",
            self.label(app),
            binding.engine.id().0,
            self.subtree(app).len()
        );
        Ok(true)
    }

    /// Free everything the application holds on its engine.
    ///
    /// Returns `false` when it was not running.
    pub(crate) fn quit(&mut self, app: NodeId) -> MixerResult<bool> {
        self.application_body(app)?;
        if !self.is_bound(app) {
            return Ok(false);
        }
        self.free(app);
        self.application_body_mut(app)?.transport = None;
        log::info!("quit {}", self.label(app));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StandardPrograms;
    use crate::local_engine::LocalEngine;
    use crate::tree::AllocationState;

    fn booted(config: SessionConfig) -> (Tree, NodeId, Arc<LocalEngine>) {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let engine = Arc::new(LocalEngine::for_config(&config));
        let app = tree.create_application(config).unwrap();
        tree.boot(app, engine.clone(), None).unwrap();
        (tree, app, engine)
    }

    #[test]
    fn test_layout() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let app = tree.create_application(SessionConfig::default()).unwrap();
        let children = tree.children(app).to_vec();
        assert_eq!(children.len(), 4);
        assert_eq!(tree.container_role(children[0]), Some(ContainerRole::Tracks));
        assert_eq!(tree.container_role(children[1]), Some(ContainerRole::Returns));
        assert_eq!(tree.master_track(app), Some(children[2]));
        assert_eq!(tree.cue_track(app), Some(children[3]));
        assert!(!tree.is_bound(app));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut tree = Tree::new(Arc::new(StandardPrograms));
        let config = SessionConfig {
            channel_count: 0,
            ..Default::default()
        };
        assert!(tree.create_application(config).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_boot_binds_everything() {
        let (tree, app, engine) = booted(SessionConfig::default());
        for node in tree.subtree(app) {
            let n = tree.node(node).unwrap();
            assert_eq!(n.state, AllocationState::Ready, "{}", tree.label(node));
        }
        assert!(engine.live_handles() > 0);
        // master + cue: input and output bus each
        assert_eq!(engine.live_bus_ranges(), 4);
    }

    #[test]
    fn test_boot_twice_is_noop() {
        let (mut tree, app, engine) = booted(SessionConfig::default());
        engine.clear_traffic();
        assert!(!tree.boot(app, engine.clone(), None).unwrap());
        assert!(engine.traffic().is_empty());
    }

    #[test]
    fn test_quit_frees_everything() {
        let (mut tree, app, engine) = booted(SessionConfig::default());
        assert!(tree.quit(app).unwrap());
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(engine.live_bus_ranges(), 0);
        assert_eq!(engine.live_meters(), 0);
        assert!(!tree.quit(app).unwrap());
        for node in tree.subtree(app) {
            assert_eq!(tree.node(node).unwrap().state, AllocationState::Unbound);
        }
    }

    #[test]
    fn test_rebind_to_other_engine() {
        let (mut tree, app, first) = booted(SessionConfig::default());
        let second = Arc::new(LocalEngine::for_config(&SessionConfig::default()));
        assert!(tree.boot(app, second.clone(), None).unwrap());
        assert_eq!(first.live_handles(), 0);
        assert!(second.live_handles() > 0);
    }
}
