//! Discrete event queue for a continuous-time simulation.
//!
//! Events are wrapped in adapters exposing a two-part execution: the A part
//! mutates simulation state at the scheduled time, the optional B part runs
//! deferred (typically recording) so it can observe post-adjustment values.
//! The queue also carries a periodic null event used as a heartbeat to force
//! the driver out of long solver blocks.

use crate::arena::ComponentArena;
use crate::change::ChangeCode;
use crate::object::ComponentId;
use crate::units::Unit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh event id.
pub fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Default temporal tolerance for coincident events.
pub const DEFAULT_TIME_TOL: f64 = 1e-9;

/// Uniform wrapper around anything schedulable.
pub trait EventAdapter: Send {
    fn event_id(&self) -> u64;
    fn time(&self) -> f64;
    fn set_time(&mut self, time: f64);
    /// Re-arm interval for periodic events.
    fn period(&self) -> Option<f64> {
        None
    }
    /// Immediate state change at the scheduled time.
    fn execute_a(&mut self, arena: &mut ComponentArena, time: f64) -> ChangeCode;
    /// Deferred effect, typically reporting.
    fn execute_b(&mut self, _arena: &mut ComponentArena, _time: f64) -> ChangeCode {
        ChangeCode::NoChange
    }
    fn has_part_b(&self) -> bool {
        false
    }
    /// Skip the A part entirely.
    fn part_b_only(&self) -> bool {
        false
    }
    /// Key identifying the underlying trigger for duplicate suppression.
    fn dedup_key(&self) -> Option<(ComponentId, String)> {
        None
    }
    fn clone_box(&self) -> Box<dyn EventAdapter>;
}

struct QueueInner {
    time_tol: f64,
    events: Vec<Box<dyn EventAdapter>>,
    partb_list: Vec<(Box<dyn EventAdapter>, f64)>,
    null_time: f64,
    null_period: Option<f64>,
}

impl QueueInner {
    fn sort(&mut self) {
        self.events.sort_by(|a, b| a.time().total_cmp(&b.time()));
    }
}

/// Time-ordered, two-phase event queue.
///
/// A single mutex guards insert, remove, and sorting so external threads may
/// schedule events; execution runs on the driver thread.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue {
            inner: Mutex::new(QueueInner {
                time_tol: DEFAULT_TIME_TOL,
                events: Vec::new(),
                partb_list: Vec::new(),
                null_time: f64::INFINITY,
                null_period: None,
            }),
        }
    }
}

impl Clone for EventQueue {
    fn clone(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        EventQueue {
            inner: Mutex::new(QueueInner {
                time_tol: inner.time_tol,
                events: inner.events.iter().map(|e| e.clone_box()).collect(),
                partb_list: inner
                    .partb_list
                    .iter()
                    .map(|(e, t)| (e.clone_box(), *t))
                    .collect(),
                null_time: inner.null_time,
                null_period: inner.null_period,
            }),
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("EventQueue")
            .field("len", &inner.events.len())
            .field("null_time", &inner.null_time)
            .finish()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time_tol(&self, tol: f64) {
        self.inner.lock().unwrap().time_tol = tol;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an adapter time-sorted, dropping older adapters keyed to the
    /// same underlying trigger. Returns the event id.
    pub fn insert(&self, event: Box<dyn EventAdapter>) -> u64 {
        let id = event.event_id();
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = event.dedup_key() {
            inner
                .events
                .retain(|e| e.dedup_key().as_ref() != Some(&key));
        }
        inner.events.push(event);
        inner.sort();
        id
    }

    /// Erase the adapter with the matching id; no-op when absent.
    pub fn remove(&self, event_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.retain(|e| e.event_id() != event_id);
    }

    /// Smallest scheduled time across live adapters and the armed null
    /// event.
    pub fn next_time(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let event_time = inner
            .events
            .first()
            .map_or(f64::INFINITY, |e| e.time());
        event_time.min(inner.null_time)
    }

    /// Arm (or re-arm) the periodic heartbeat.
    pub fn null_event_time(&self, time: f64, period: Option<f64>) {
        let mut inner = self.inner.lock().unwrap();
        inner.null_time = time;
        inner.null_period = period;
    }

    pub fn null_time(&self) -> f64 {
        self.inner.lock().unwrap().null_time
    }

    /// Whether the heartbeat is due at `time`; re-arms periodic heartbeats.
    pub fn take_null_due(&self, time: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.null_time <= time + inner.time_tol {
            match inner.null_period {
                Some(period) => inner.null_time += period,
                None => inner.null_time = f64::INFINITY,
            }
            true
        } else {
            false
        }
    }

    fn pop_due(&self, time: f64) -> Vec<Box<dyn EventAdapter>> {
        let mut inner = self.inner.lock().unwrap();
        let tol = inner.time_tol;
        let mut due = Vec::new();
        while inner
            .events
            .first()
            .is_some_and(|e| e.time() <= time + tol)
        {
            due.push(inner.events.remove(0));
        }
        due
    }

    fn requeue(&self, event: Box<dyn EventAdapter>) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(event);
        inner.sort();
    }

    /// Execute everything due at `time`: A parts immediately, B parts
    /// immediately afterward. Returns the maximum change code among fired
    /// events.
    pub fn execute_events(&self, arena: &mut ComponentArena, time: f64) -> ChangeCode {
        let mut code = self.execute_events_a_only(arena, time);
        code = code.max_with(self.execute_events_b_only(arena));
        code
    }

    /// Execute only the A parts of due events; adapters with a B part move
    /// to the deferred list.
    pub fn execute_events_a_only(&self, arena: &mut ComponentArena, time: f64) -> ChangeCode {
        let mut code = ChangeCode::NoChange;
        let due = self.pop_due(time);
        if !due.is_empty() {
            tracing::debug!(time, count = due.len(), "executing events");
        }
        for mut event in due {
            if !event.part_b_only() {
                code = code.max_with(event.execute_a(arena, time));
            }
            let fire_time = event.time();
            if event.has_part_b() || event.part_b_only() {
                self.inner
                    .lock()
                    .unwrap()
                    .partb_list
                    .push((event, fire_time));
            } else if let Some(period) = event.period() {
                event.set_time(fire_time + period);
                self.requeue(event);
            }
        }
        code
    }

    /// Execute deferred B parts; periodic adapters re-arm afterward.
    pub fn execute_events_b_only(&self, arena: &mut ComponentArena) -> ChangeCode {
        let deferred = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.partb_list)
        };
        let mut code = ChangeCode::NoChange;
        for (mut event, fire_time) in deferred {
            code = code.max_with(event.execute_b(arena, fire_time));
            if let Some(period) = event.period() {
                event.set_time(fire_time + period);
                self.requeue(event);
            }
        }
        code
    }

    /// Re-sort after external time mutation.
    pub fn recheck(&self) {
        self.inner.lock().unwrap().sort();
    }
}

/// Event setting a numeric parameter on a component.
#[derive(Clone)]
pub struct ParameterEvent {
    id: u64,
    pub time: f64,
    pub period: Option<f64>,
    pub target: ComponentId,
    pub param: String,
    pub value: f64,
    pub unit: Unit,
}

impl ParameterEvent {
    pub fn new(time: f64, target: ComponentId, param: impl Into<String>, value: f64) -> Self {
        ParameterEvent {
            id: next_event_id(),
            time,
            period: None,
            target,
            param: param.into(),
            value,
            unit: Unit::PerUnit,
        }
    }
}

impl EventAdapter for ParameterEvent {
    fn event_id(&self) -> u64 {
        self.id
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    fn period(&self) -> Option<f64> {
        self.period
    }

    fn execute_a(&mut self, arena: &mut ComponentArena, _time: f64) -> ChangeCode {
        match arena.set_param(self.target, &self.param, self.value, self.unit) {
            Ok(()) => ChangeCode::ParameterChange,
            Err(_) => ChangeCode::NoChange,
        }
    }

    fn dedup_key(&self) -> Option<(ComponentId, String)> {
        Some((self.target, format!("param:{}", self.param)))
    }

    fn clone_box(&self) -> Box<dyn EventAdapter> {
        Box::new(self.clone())
    }
}

/// Event flipping a flag (connect/disconnect and the like).
#[derive(Clone)]
pub struct FlagEvent {
    id: u64,
    pub time: f64,
    pub target: ComponentId,
    pub flag: String,
    pub value: bool,
}

impl FlagEvent {
    pub fn new(time: f64, target: ComponentId, flag: impl Into<String>, value: bool) -> Self {
        FlagEvent {
            id: next_event_id(),
            time,
            target,
            flag: flag.into(),
            value,
        }
    }
}

impl EventAdapter for FlagEvent {
    fn event_id(&self) -> u64 {
        self.id
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    fn execute_a(&mut self, arena: &mut ComponentArena, _time: f64) -> ChangeCode {
        match arena.set_flag(self.target, &self.flag, self.value) {
            Ok(()) => {
                if self.flag == "disconnected" || self.flag == "enabled" {
                    ChangeCode::ObjectChange
                } else {
                    ChangeCode::NonStateChange
                }
            }
            Err(_) => ChangeCode::NoChange,
        }
    }

    fn dedup_key(&self) -> Option<(ComponentId, String)> {
        Some((self.target, format!("flag:{}", self.flag)))
    }

    fn clone_box(&self) -> Box<dyn EventAdapter> {
        Box::new(self.clone())
    }
}

/// Periodic sampler: B-part-only event recording a grabbed value.
#[derive(Clone)]
pub struct RecorderEvent {
    id: u64,
    pub time: f64,
    pub period: Option<f64>,
    pub target: ComponentId,
    pub field: String,
    pub samples: Arc<Mutex<Vec<(f64, f64)>>>,
}

impl RecorderEvent {
    pub fn new(time: f64, period: Option<f64>, target: ComponentId, field: impl Into<String>) -> Self {
        RecorderEvent {
            id: next_event_id(),
            time,
            period,
            target,
            field: field.into(),
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn samples(&self) -> Arc<Mutex<Vec<(f64, f64)>>> {
        Arc::clone(&self.samples)
    }
}

impl EventAdapter for RecorderEvent {
    fn event_id(&self) -> u64 {
        self.id
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    fn period(&self) -> Option<f64> {
        self.period
    }

    fn execute_a(&mut self, _arena: &mut ComponentArena, _time: f64) -> ChangeCode {
        ChangeCode::NoChange
    }

    fn execute_b(&mut self, arena: &mut ComponentArena, time: f64) -> ChangeCode {
        if let Some(value) = arena.get_param(self.target, &self.field, Unit::PerUnit) {
            self.samples.lock().unwrap().push((time, value));
        }
        ChangeCode::NoChange
    }

    fn part_b_only(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn EventAdapter> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentKind};
    use crate::models::{Area, Load};

    fn arena_with_load() -> (ComponentArena, ComponentId) {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("root", ComponentKind::Area(Area::default())));
        let load = arena
            .add_sub_object(
                root,
                Component::new(
                    "load1",
                    ComponentKind::Load(Load {
                        p: 0.8,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        (arena, load)
    }

    #[test]
    fn test_insert_orders_by_time() {
        let (_, load) = arena_with_load();
        let queue = EventQueue::new();
        queue.insert(Box::new(ParameterEvent::new(5.0, load, "p", 1.0)));
        queue.insert(Box::new(ParameterEvent::new(2.0, load, "q", 1.0)));
        assert!((queue.next_time() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_execute_applies_parameter() {
        let (mut arena, load) = arena_with_load();
        let queue = EventQueue::new();
        queue.insert(Box::new(ParameterEvent::new(3.0, load, "p", 1.0)));

        let code = queue.execute_events(&mut arena, 2.0);
        assert_eq!(code, ChangeCode::NoChange);
        assert_eq!(queue.len(), 1);

        let code = queue.execute_events(&mut arena, 3.0);
        assert_eq!(code, ChangeCode::ParameterChange);
        assert_eq!(queue.len(), 0);
        assert!(
            (arena.get_param(load, "p", Unit::PerUnit).unwrap() - 1.0).abs() < 1e-12
        );
    }

    #[test]
    fn test_duplicate_suppression() {
        let (_, load) = arena_with_load();
        let queue = EventQueue::new();
        let first = queue.insert(Box::new(ParameterEvent::new(1.0, load, "p", 0.5)));
        let second = queue.insert(Box::new(ParameterEvent::new(2.0, load, "p", 0.9)));
        assert_ne!(first, second);
        // the second event replaced the first (same target and parameter)
        assert_eq!(queue.len(), 1);
        assert!((queue.next_time() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_remove_by_id() {
        let (_, load) = arena_with_load();
        let queue = EventQueue::new();
        let id = queue.insert(Box::new(ParameterEvent::new(1.0, load, "p", 0.5)));
        queue.remove(id);
        assert!(queue.is_empty());
        queue.remove(id); // no-op
    }

    #[test]
    fn test_two_phase_recorder_sees_post_adjust_value() {
        let (mut arena, load) = arena_with_load();
        let queue = EventQueue::new();
        let recorder = RecorderEvent::new(3.0, None, load, "p");
        let samples = recorder.samples();
        queue.insert(Box::new(recorder));
        queue.insert(Box::new(ParameterEvent::new(3.0, load, "p", 1.0)));

        // phase A applies the set; the recorder waits
        queue.execute_events_a_only(&mut arena, 3.0);
        assert!(samples.lock().unwrap().is_empty());
        // a power-flow solve would run here
        queue.execute_events_b_only(&mut arena);
        let recorded = samples.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!((recorded[0].1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_periodic_event_rearms() {
        let (mut arena, load) = arena_with_load();
        let queue = EventQueue::new();
        let mut ev = ParameterEvent::new(1.0, load, "p", 1.0);
        ev.period = Some(1.0);
        queue.insert(Box::new(ev));

        queue.execute_events(&mut arena, 1.0);
        assert_eq!(queue.len(), 1);
        assert!((queue.next_time() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_null_event_heartbeat() {
        let queue = EventQueue::new();
        queue.null_event_time(2.0, Some(2.0));
        assert!((queue.next_time() - 2.0).abs() < 1e-12);
        assert!(!queue.take_null_due(1.0));
        assert!(queue.take_null_due(2.0));
        assert!((queue.null_time() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_clone_preserves_schedule() {
        let (_, load) = arena_with_load();
        let queue = EventQueue::new();
        queue.insert(Box::new(ParameterEvent::new(4.0, load, "p", 1.0)));
        let copy = queue.clone();
        assert_eq!(copy.len(), 1);
        assert!((copy.next_time() - 4.0).abs() < 1e-12);
    }
}
