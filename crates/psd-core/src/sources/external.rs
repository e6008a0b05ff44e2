//! Sources driven from outside the schedule: user functions, dotted-path
//! grabs from other objects, and queued SET messages.

use crate::change::ParamResult;
use crate::component::EvalCtx;
use crate::object::ComponentBase;
use crate::units::Unit;
use std::collections::VecDeque;
use std::sync::Arc;

/// Output is a user-supplied function of time.
#[derive(Clone)]
pub struct FunctionSource {
    pub func: Arc<dyn Fn(f64) -> f64 + Send + Sync>,
    pub cached: f64,
}

impl FunctionSource {
    pub fn new(func: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        FunctionSource {
            func: Arc::new(func),
            cached: 0.0,
        }
    }

    pub fn value_at(&self, time: f64) -> f64 {
        (self.func)(time)
    }
}

impl Default for FunctionSource {
    fn default() -> Self {
        FunctionSource::new(|_| 0.0)
    }
}

impl std::fmt::Debug for FunctionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSource")
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

/// Output read from another object through a dotted-path lookup.
#[derive(Debug, Clone, Default)]
pub struct GrabberSource {
    /// Dotted path from the tree root to the grabbed object
    pub target: String,
    /// Field read on the target
    pub field: String,
    pub gain: f64,
    pub bias: f64,
    pub cached: f64,
}

impl GrabberSource {
    pub fn new(target: impl Into<String>, field: impl Into<String>) -> Self {
        GrabberSource {
            target: target.into(),
            field: field.into(),
            gain: 1.0,
            bias: 0.0,
            cached: 0.0,
        }
    }

    /// Resolve and read the grabbed value. Exact-name path matching only.
    pub fn value_at(&self, ctx: &EvalCtx) -> f64 {
        // climb to the tree root the path is anchored at
        let mut root = ctx.id;
        while let Some(parent) = ctx.get(root).and_then(|c| c.base.parent) {
            root = parent;
        }
        let value = ctx
            .arena
            .find(root, &self.target)
            .and_then(|target| ctx.arena.get_param(target, &self.field, Unit::PerUnit));
        match value {
            Some(v) => self.gain * v + self.bias,
            None => self.cached,
        }
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> ParamResult {
        match name {
            "gain" => self.gain = value,
            "bias" => self.bias = value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    pub fn set_param_str(&mut self, name: &str, value: &str) -> ParamResult {
        match name {
            "target" => self.target = value.to_string(),
            "field" => self.field = value.to_string(),
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }
}

/// Output driven by incoming SET messages with optional rate-limited slew.
#[derive(Debug, Clone)]
pub struct CommSource {
    /// Pending `(arrival time, level)` messages
    pub inbox: VecDeque<(f64, f64)>,
    /// Maximum output slew rate when ramping is enabled (units/second)
    pub max_ramp: f64,
    /// Slew toward new levels instead of stepping
    pub ramp: bool,
    pub output: f64,
    pub target: f64,
    pub prev_time: f64,
}

impl Default for CommSource {
    fn default() -> Self {
        CommSource {
            inbox: VecDeque::new(),
            max_ramp: f64::INFINITY,
            ramp: false,
            output: 0.0,
            target: 0.0,
            prev_time: 0.0,
        }
    }
}

impl CommSource {
    pub fn init(&mut self, time0: f64) {
        self.prev_time = time0;
        self.target = self.output;
    }

    /// Queue a SET message for delivery at `time`.
    pub fn queue_message(&mut self, time: f64, level: f64) {
        let pos = self.inbox.partition_point(|&(t, _)| t <= time);
        self.inbox.insert(pos, (time, level));
    }

    pub fn slew_rate(&self) -> f64 {
        if !self.ramp || self.output == self.target {
            0.0
        } else {
            self.max_ramp * (self.target - self.output).signum()
        }
    }

    pub fn value_at(&self, time: f64) -> f64 {
        if !self.ramp {
            return self.output;
        }
        let dt = (time - self.prev_time).max(0.0);
        let travel = self.max_ramp * dt;
        let gap = self.target - self.output;
        if gap.abs() <= travel {
            self.target
        } else {
            self.output + travel * gap.signum()
        }
    }

    pub fn advance(&mut self, time: f64) {
        while let Some(&(msg_time, level)) = self.inbox.front() {
            if msg_time > time {
                break;
            }
            self.inbox.pop_front();
            if self.ramp {
                // settle the slew up to the message arrival, then retarget
                self.output = self.value_at(msg_time);
                self.prev_time = msg_time;
                self.target = level;
            } else {
                self.output = level;
                self.target = level;
                self.prev_time = msg_time;
            }
        }
        self.output = self.value_at(time);
        self.prev_time = time;
    }

    pub fn set_param(
        &mut self,
        _base: &mut ComponentBase,
        name: &str,
        value: f64,
        _unit: Unit,
    ) -> ParamResult {
        match name {
            "level" | "set" => {
                self.target = value;
                if !self.ramp {
                    self.output = value;
                }
            }
            "maxramp" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.max_ramp = value;
            }
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> ParamResult {
        match name {
            "ramp" => self.ramp = value,
            "step" => self.ramp = !value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_source() {
        let src = FunctionSource::new(|t| t * t);
        assert!((src.value_at(3.0) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_comm_step_messages() {
        let mut src = CommSource::default();
        src.init(0.0);
        src.queue_message(1.0, 5.0);
        src.queue_message(2.0, 7.0);
        src.advance(0.5);
        assert_eq!(src.output, 0.0);
        src.advance(1.5);
        assert_eq!(src.output, 5.0);
        src.advance(3.0);
        assert_eq!(src.output, 7.0);
    }

    #[test]
    fn test_comm_rate_limited_slew() {
        let mut src = CommSource {
            ramp: true,
            max_ramp: 1.0,
            ..Default::default()
        };
        src.init(0.0);
        src.queue_message(0.0, 10.0);
        src.advance(2.0);
        // slew limited to 1 unit/second
        assert!((src.output - 2.0).abs() < 1e-12);
        src.advance(20.0);
        assert!((src.output - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_comm_messages_sorted() {
        let mut src = CommSource::default();
        src.queue_message(2.0, 2.0);
        src.queue_message(1.0, 1.0);
        assert_eq!(src.inbox.front().copied(), Some((1.0, 1.0)));
    }
}
