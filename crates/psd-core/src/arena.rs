//! Arena storage for the component tree.
//!
//! Components live in a slot vector indexed by [`ComponentId`]; parent/child
//! links are ids, so a clone of the arena is a valid tree with no pointer
//! remapping. Removal leaves a free slot that later insertions reuse.

use crate::change::ChangeCode;
use crate::component::{Component, ComponentKind};
use crate::error::{PsdError, PsdResult};
use crate::object::{ComponentId, OpFlag};

/// Arena of components plus the per-simulation alert queue.
///
/// Components post `(id, alert code)` pairs instead of walking parent
/// pointers; the driver drains the queue at end of step.
#[derive(Debug, Clone, Default)]
pub struct ComponentArena {
    slots: Vec<Option<Component>>,
    free: Vec<usize>,
    alerts: Vec<(ComponentId, u32)>,
    next_user_id: u64,
}

impl ComponentArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live components.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a component with no parent (a root).
    pub fn insert(&mut self, mut component: Component) -> ComponentId {
        self.next_user_id += 1;
        component.base.user_id = self.next_user_id;
        let id = match self.free.pop() {
            Some(slot) => {
                component.base.id = ComponentId::new(slot);
                self.slots[slot] = Some(component);
                slot
            }
            None => {
                let slot = self.slots.len();
                component.base.id = ComponentId::new(slot);
                self.slots.push(Some(component));
                slot
            }
        };
        ComponentId::new(id)
    }

    /// Insert a component as a child of `parent`, adopting ownership.
    pub fn add_sub_object(
        &mut self,
        parent: ComponentId,
        component: Component,
    ) -> PsdResult<ComponentId> {
        if self.get(parent).is_none() {
            return Err(PsdError::Object(format!(
                "parent id {} does not exist",
                parent.value()
            )));
        }
        let id = self.insert(component);
        self.get_mut(id).unwrap().base.parent = Some(parent);
        self.get_mut(parent).unwrap().base.children.push(id);
        Ok(id)
    }

    /// Remove a sub-object and its descendants, bottom-up.
    pub fn remove_sub_object(&mut self, id: ComponentId) -> PsdResult<()> {
        let parent = self
            .get(id)
            .ok_or_else(|| PsdError::Object(format!("id {} does not exist", id.value())))?
            .base
            .parent;
        if let Some(p) = parent {
            if let Some(pc) = self.get_mut(p) {
                pc.base.children.retain(|&c| c != id);
            }
        }
        self.destroy_subtree(id);
        Ok(())
    }

    /// Replace a sub-object in place, destroying the old one. The new
    /// component takes over the old one's position in the parent's child
    /// list.
    pub fn replace_sub_object(
        &mut self,
        old: ComponentId,
        component: Component,
    ) -> PsdResult<ComponentId> {
        let parent = self
            .get(old)
            .ok_or_else(|| PsdError::Object(format!("id {} does not exist", old.value())))?
            .base
            .parent;
        let new_id = self.insert(component);
        self.get_mut(new_id).unwrap().base.parent = parent;
        if let Some(p) = parent {
            let pc = self.get_mut(p).unwrap();
            if let Some(pos) = pc.base.children.iter().position(|&c| c == old) {
                pc.base.children[pos] = new_id;
            } else {
                pc.base.children.push(new_id);
            }
        }
        self.destroy_subtree(old);
        Ok(new_id)
    }

    fn destroy_subtree(&mut self, id: ComponentId) {
        let children = match self.get(id) {
            Some(c) => c.base.children.clone(),
            None => return,
        };
        for child in children {
            self.destroy_subtree(child);
        }
        self.slots[id.value()] = None;
        self.free.push(id.value());
    }

    #[inline]
    pub fn get(&self, id: ComponentId) -> Option<&Component> {
        self.slots.get(id.value()).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.slots.get_mut(id.value()).and_then(|s| s.as_mut())
    }

    pub fn expect(&self, id: ComponentId) -> &Component {
        self.get(id).expect("component id out of range")
    }

    pub fn expect_mut(&mut self, id: ComponentId) -> &mut Component {
        self.get_mut(id).expect("component id out of range")
    }

    /// Iterate over live components.
    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Ids of all live components.
    pub fn ids(&self) -> Vec<ComponentId> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|c| c.base.id))
            .collect()
    }

    /// Direct children of a component.
    pub fn children(&self, id: ComponentId) -> Vec<ComponentId> {
        self.get(id).map_or_else(Vec::new, |c| c.base.children.clone())
    }

    /// Post-order (children first) subtree listing.
    pub fn subtree_post_order(&self, root: ComponentId) -> Vec<ComponentId> {
        let mut out = Vec::new();
        self.post_order_into(root, &mut out);
        out
    }

    fn post_order_into(&self, id: ComponentId, out: &mut Vec<ComponentId>) {
        for child in self.children(id) {
            self.post_order_into(child, out);
        }
        if self.get(id).is_some() {
            out.push(id);
        }
    }

    /// Find a component by case-insensitive dotted path relative to `from`.
    ///
    /// `"bus2.load1"` looks up a child named `bus2`, then its child `load1`.
    pub fn find(&self, from: ComponentId, path: &str) -> Option<ComponentId> {
        let mut current = from;
        for segment in path.split('.') {
            if segment.is_empty() {
                return None;
            }
            let next = self
                .children(current)
                .into_iter()
                .find(|&c| {
                    self.get(c)
                        .is_some_and(|comp| comp.base.name.eq_ignore_ascii_case(segment))
                })?;
            current = next;
        }
        Some(current)
    }

    /// The index-th sub-object of a given type under `parent`.
    pub fn get_sub_object(
        &self,
        parent: ComponentId,
        type_name: &str,
        index: usize,
    ) -> Option<ComponentId> {
        self.children(parent)
            .into_iter()
            .filter(|&c| {
                self.get(c)
                    .is_some_and(|comp| comp.kind.model().type_name().eq_ignore_ascii_case(type_name))
            })
            .nth(index)
    }

    /// Find a component of a given type by its user id, searching the whole
    /// subtree.
    pub fn find_by_user_id(
        &self,
        root: ComponentId,
        type_name: &str,
        user_id: u64,
    ) -> Option<ComponentId> {
        self.subtree_post_order(root).into_iter().find(|&id| {
            self.get(id).is_some_and(|c| {
                c.base.user_id == user_id
                    && c.kind.model().type_name().eq_ignore_ascii_case(type_name)
            })
        })
    }

    /// Post an alert into the simulation change queue.
    pub fn alert(&mut self, id: ComponentId, code: u32) {
        self.alerts.push((id, code));
    }

    /// Drain the alert queue, folding alert codes into a single change code.
    pub fn drain_alerts(&mut self) -> (ChangeCode, Vec<(ComponentId, u32)>) {
        let alerts = std::mem::take(&mut self.alerts);
        let code = alerts
            .iter()
            .map(|&(_, a)| crate::change::alert_change_code(a))
            .fold(ChangeCode::NoChange, ChangeCode::max_with);
        (code, alerts)
    }

    pub fn pending_alerts(&self) -> usize {
        self.alerts.len()
    }

    /// Disconnect a component (and implicitly its subtree from solves).
    pub fn disconnect(&mut self, id: ComponentId) {
        if let Some(c) = self.get_mut(id) {
            c.base.flags.set(OpFlag::Disconnected, true);
        }
    }

    pub fn reconnect(&mut self, id: ComponentId) {
        if let Some(c) = self.get_mut(id) {
            c.base.flags.set(OpFlag::Disconnected, false);
        }
    }

    /// All live components of a given kind discriminant under a root.
    pub fn collect_kind(
        &self,
        root: ComponentId,
        pred: fn(&ComponentKind) -> bool,
    ) -> Vec<ComponentId> {
        self.subtree_post_order(root)
            .into_iter()
            .filter(|&id| self.get(id).is_some_and(|c| pred(&c.kind)))
            .collect()
    }
}
