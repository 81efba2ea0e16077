//! Tree container mutation
//!
//! `replace(container, range, items)` is the single structural mutation.
//! Everything else (add, move, delete, group) is expressed through it.
//!
//! Phases, in order:
//! 1. validate the prospective child sequence (nothing mutated on error)
//! 2. collect mute/solo scopes and sends/receives touching the affected
//!    subtrees
//! 3. splice: detach items from prior parents, install the new sequence
//! 4. pre-allocate items against the container's engine
//! 5. reposition moved items remotely
//! 6. post-allocate fresh items, reallocate moved items, resync sends and
//!    receives
//! 7. free removed items
//! 8. rebuild solo aggregates and propagate activation per scope

use std::collections::BTreeSet;
use std::ops::Range;

use rf_core::{check_device_order, DeviceKind, MixerError, MixerResult, NodeId};

use crate::tree::{ContainerRole, NodeBody, Tree};

/// Validated outcome of a prospective replace
#[derive(Debug)]
struct ReplacePlan {
    children: Vec<NodeId>,
    removed: Vec<NodeId>,
}

impl Tree {
    /// Replace `range` of `container`'s children with `items`.
    ///
    /// Items already parented elsewhere are moved; an item already in this
    /// container outside `range` moves to its new position.
    pub(crate) fn replace(
        &mut self,
        container: NodeId,
        range: Range<usize>,
        items: &[NodeId],
    ) -> MixerResult<()> {
        let ReplacePlan { children, removed } = self.plan_replace(container, range, items)?;
        let role = self.container_role(container);

        // scopes and dependent sends, seen from the pre-splice tree
        let mut scope_seeds = Vec::new();
        if role.is_some_and(|r| r.holds_tracks()) {
            scope_seeds.push(container);
            scope_seeds.extend(items.iter().map(|i| self.scope_root(*i)));
            scope_seeds.extend(removed.iter().copied());
        }
        let mut touched: Vec<NodeId> = items.to_vec();
        touched.extend(removed.iter().copied());
        let mut dependents = self.links_touching(&touched);

        // splice
        for item in items {
            if let Some(old_parent) = self.parent(*item) {
                if old_parent != container {
                    if let Ok(node) = self.node_mut(old_parent) {
                        node.children.retain(|c| c != item);
                    }
                }
            }
        }
        self.node_mut(container)?.children = children;
        for item in items {
            self.node_mut(*item)?.parent = Some(container);
        }
        for item in &removed {
            self.node_mut(*item)?.parent = None;
        }

        // allocation
        let mut fresh = Vec::new();
        let mut moved = Vec::new();
        match self.binding(container).cloned() {
            Some(binding) => {
                for item in items {
                    if self.pre_allocate(*item, &binding) {
                        fresh.push(*item);
                    } else {
                        moved.push(*item);
                    }
                }
                self.reposition(items, &moved);
            }
            None => {
                for item in items {
                    self.free(*item);
                }
            }
        }
        for item in &fresh {
            self.post_allocate(*item);
        }
        for item in &moved {
            self.reallocate(*item);
        }
        dependents.extend(self.links_touching(&touched));
        dependents.extend(self.links_targeting(&touched));
        for link in dependents {
            self.rewire(link);
        }

        for item in &removed {
            self.free(*item);
        }

        // derived state
        let mut roots = BTreeSet::new();
        for seed in scope_seeds {
            if self.contains(seed) {
                roots.insert(self.scope_root(seed));
            }
        }
        for root in roots {
            self.rebuild_solo(root);
            self.propagate(root);
        }
        Ok(())
    }

    fn plan_replace(
        &self,
        container: NodeId,
        range: Range<usize>,
        items: &[NodeId],
    ) -> MixerResult<ReplacePlan> {
        let role = self.container_role(container).ok_or_else(|| {
            MixerError::structural(format!("{} is not a container", self.label(container)))
        })?;
        let current = self.children(container);
        if range.start > range.end || range.end > current.len() {
            return Err(MixerError::structural(format!(
                "range {}..{} out of bounds for {} children",
                range.start,
                range.end,
                current.len()
            )));
        }

        let mut seen = BTreeSet::new();
        for item in items {
            let node = self.node(*item)?;
            if !seen.insert(*item) {
                return Err(MixerError::structural(format!(
                    "{} inserted twice",
                    self.label(*item)
                )));
            }
            if !role.accepts(&node.body) {
                return Err(MixerError::structural(format!(
                    "{} cannot hold {}",
                    role.label(),
                    self.label(*item)
                )));
            }
            if self.is_ancestor_or_self(*item, container) {
                return Err(MixerError::structural(format!(
                    "{} cannot be inserted into its own descendant",
                    self.label(*item)
                )));
            }
            if let Some(parent) = node.parent {
                if self.container_role(parent).is_none() {
                    return Err(MixerError::structural(format!(
                        "{} is still parented by {}",
                        self.label(*item),
                        self.label(parent)
                    )));
                }
            }
        }

        let before = current[..range.start].iter().filter(|c| !seen.contains(*c));
        let after = current[range.end..].iter().filter(|c| !seen.contains(*c));
        let children: Vec<NodeId> = before
            .copied()
            .chain(items.iter().copied())
            .chain(after.copied())
            .collect();
        let removed: Vec<NodeId> = current[range]
            .iter()
            .copied()
            .filter(|c| !seen.contains(c))
            .collect();

        if role == ContainerRole::Devices {
            let kinds: Vec<DeviceKind> = children
                .iter()
                .filter_map(|c| self.device_kind(*c))
                .collect();
            if let Some(reason) = check_device_order(&kinds) {
                return Err(MixerError::StructuralViolation(reason));
            }
        }

        Ok(ReplacePlan { children, removed })
    }

    /// Move the remote nodes of `moved` items (and anything placed
    /// relative to them) to match the logical order
    fn reposition(&mut self, items: &[NodeId], moved: &[NodeId]) {
        let mut shifted = false;
        for item in items {
            let is_moved = moved.contains(item);
            if is_moved || shifted {
                let target = self.handle(*item).zip(self.place(*item));
                let engine = self.binding(*item).map(|b| b.engine.clone());
                if let (Some((handle, placement)), Some(engine)) = (target, engine) {
                    engine.move_node(handle, placement);
                }
            }
            shifted |= is_moved;
        }
    }

    /// Reallocate the subtrees of `nodes` and every send or receive wired
    /// into them
    pub(crate) fn resync(&mut self, nodes: &[NodeId]) {
        for node in nodes {
            self.reallocate(*node);
        }
        let mut links = self.links_touching(nodes);
        links.extend(self.links_targeting(nodes));
        for link in links {
            self.rewire(link);
        }
    }

    /// Kind of a device or rack
    pub(crate) fn device_kind(&self, id: NodeId) -> Option<DeviceKind> {
        match self.body(id)? {
            NodeBody::Device(device) => Some(device.kind),
            NodeBody::Rack(rack) => Some(rack.kind),
            _ => None,
        }
    }
}
