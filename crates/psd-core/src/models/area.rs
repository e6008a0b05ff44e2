//! Area: the root container for a network.
//!
//! The area contributes no states of its own; it anchors the tree, keeps the
//! terminal bookkeeping between links and buses current, and carries the
//! area-level configuration the driver reads (power-adjust participation).

use crate::arena::ComponentArena;
use crate::change::ParamResult;
use crate::component::{ComponentKind, GridModel};
use crate::object::{ComponentBase, ComponentId};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::units::Unit;

#[derive(Debug, Clone, Default)]
pub struct Area {
    /// Threshold on slack-generation drift before the power loop acts
    pub power_adjust_threshold: f64,
}

impl GridModel for Area {
    fn type_name(&self) -> &'static str {
        "area"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, _mode: &SolverMode) -> StateSizes {
        StateSizes::default()
    }

    fn set_param(
        &mut self,
        _base: &mut ComponentBase,
        name: &str,
        value: f64,
        _unit: Unit,
    ) -> ParamResult {
        match name {
            "poweradjustthreshold" => {
                if value < 0.0 {
                    return ParamResult::Invalid;
                }
                self.power_adjust_threshold = value;
            }
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn get_param(&self, _base: &ComponentBase, name: &str, _unit: Unit) -> Option<f64> {
        match name {
            "poweradjustthreshold" => Some(self.power_adjust_threshold),
            _ => None,
        }
    }
}

/// Rebuild the link/bus terminal bookkeeping under an area: resolve named
/// terminals to ids and refresh each bus's attached-link list.
pub fn update_network_links(arena: &mut ComponentArena, root: ComponentId) {
    let ids = arena.subtree_post_order(root);
    tracing::debug!(components = ids.len(), "rebuilding network terminal links");

    for &id in &ids {
        if let Some(ComponentKind::Bus(bus)) = arena.get_mut(id).map(|c| &mut c.kind) {
            bus.attached_links.clear();
        }
    }

    // resolve pending terminal names
    let mut resolutions: Vec<(ComponentId, Option<ComponentId>, Option<ComponentId>)> = Vec::new();
    for &id in &ids {
        if let Some(ComponentKind::Link(link)) = arena.get(id).map(|c| &c.kind) {
            let from = match (link.from_bus, &link.from_name) {
                (Some(f), _) => Some(f),
                (None, Some(name)) => arena.find(root, name),
                (None, None) => None,
            };
            let to = match (link.to_bus, &link.to_name) {
                (Some(t), _) => Some(t),
                (None, Some(name)) => arena.find(root, name),
                (None, None) => None,
            };
            resolutions.push((id, from, to));
        }
    }

    for (link_id, from, to) in resolutions {
        if let Some(ComponentKind::Link(link)) = arena.get_mut(link_id).map(|c| &mut c.kind) {
            link.from_bus = from;
            link.to_bus = to;
        }
        for bus_id in [from, to].into_iter().flatten() {
            if let Some(ComponentKind::Bus(bus)) = arena.get_mut(bus_id).map(|c| &mut c.kind) {
                if !bus.attached_links.contains(&link_id) {
                    bus.attached_links.push(link_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::models::{Bus, Link};

    #[test]
    fn test_link_resolution_by_name() {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("root", ComponentKind::Area(Area::default())));
        let b1 = arena
            .add_sub_object(root, Component::new("bus1", ComponentKind::Bus(Bus::default())))
            .unwrap();
        let b2 = arena
            .add_sub_object(root, Component::new("bus2", ComponentKind::Bus(Bus::default())))
            .unwrap();
        let link = arena
            .add_sub_object(
                root,
                Component::new(
                    "line12",
                    ComponentKind::Link(Link {
                        from_name: Some("bus1".into()),
                        to_name: Some("bus2".into()),
                        x: 0.1,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();

        update_network_links(&mut arena, root);

        let ComponentKind::Link(l) = &arena.expect(link).kind else {
            panic!("expected link");
        };
        assert_eq!(l.from_bus, Some(b1));
        assert_eq!(l.to_bus, Some(b2));
        for bus in [b1, b2] {
            let ComponentKind::Bus(b) = &arena.expect(bus).kind else {
                panic!("expected bus");
            };
            assert_eq!(b.attached_links, vec![link]);
        }
    }

    #[test]
    fn test_relink_is_idempotent() {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("root", ComponentKind::Area(Area::default())));
        let b1 = arena
            .add_sub_object(root, Component::new("bus1", ComponentKind::Bus(Bus::default())))
            .unwrap();
        let b2 = arena
            .add_sub_object(root, Component::new("bus2", ComponentKind::Bus(Bus::default())))
            .unwrap();
        arena
            .add_sub_object(
                root,
                Component::new(
                    "line12",
                    ComponentKind::Link(Link {
                        from_bus: Some(b1),
                        to_bus: Some(b2),
                        x: 0.1,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();

        update_network_links(&mut arena, root);
        update_network_links(&mut arena, root);

        let ComponentKind::Bus(b) = &arena.expect(b1).kind else {
            panic!("expected bus");
        };
        assert_eq!(b.attached_links.len(), 1);
    }
}
