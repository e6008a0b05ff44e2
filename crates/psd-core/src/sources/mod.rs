//! Signal sources: single-output leaves sharing one contract.
//!
//! Every variant can compute its output at an arbitrary time
//! ([`Source::value_at`]) and advance its internal schedule
//! ([`Source::advance`]). The driver integrates none of their states; they
//! are stepped through `timestep` or read on demand.

mod external;
mod file;
mod pulse;
mod random;

pub use external::{CommSource, FunctionSource, GrabberSource};
pub use file::FileSource;
pub use pulse::{PulseShape, PulseSource, SineSource};
pub use random::{Distribution, RandomSource};

use crate::change::ParamResult;
use crate::component::{EvalCtx, GridModel};
use crate::object::ComponentBase;
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;

/// Fixed-level source.
#[derive(Debug, Clone, Default)]
pub struct ConstantSource {
    pub level: f64,
}

/// Linear ramp: `output = start + rate * (t - t0)`.
#[derive(Debug, Clone, Default)]
pub struct RampSource {
    pub output: f64,
    pub rate: f64,
    pub prev_time: f64,
}

impl RampSource {
    pub fn value_at(&self, time: f64) -> f64 {
        self.output + self.rate * (time - self.prev_time)
    }

    pub fn advance(&mut self, time: f64) {
        self.output = self.value_at(time);
        self.prev_time = time;
    }

    pub fn clear_ramp(&mut self) {
        self.rate = 0.0;
    }
}

/// The source family.
#[derive(Debug, Clone)]
pub enum Source {
    Constant(ConstantSource),
    Ramp(RampSource),
    Pulse(PulseSource),
    Sine(SineSource),
    File(FileSource),
    Random(RandomSource),
    Function(FunctionSource),
    Grabber(GrabberSource),
    Comm(CommSource),
}

impl Source {
    /// Output at `time` without advancing the schedule.
    pub fn value_at(&self, ctx: &EvalCtx, time: f64) -> f64 {
        match self {
            Source::Constant(s) => s.level,
            Source::Ramp(s) => s.value_at(time),
            Source::Pulse(s) => s.value_at(time),
            Source::Sine(s) => s.value_at(time),
            Source::File(s) => s.value_at(time),
            Source::Random(s) => s.value_at(time),
            Source::Function(s) => s.value_at(time),
            Source::Grabber(s) => s.value_at(ctx),
            Source::Comm(s) => s.value_at(time),
        }
    }

    /// Advance the internal schedule to `time`.
    pub fn advance(&mut self, time: f64) {
        match self {
            Source::Constant(_) => {}
            Source::Ramp(s) => s.advance(time),
            Source::Pulse(s) => s.advance(time),
            Source::Sine(s) => s.advance(time),
            Source::File(s) => s.advance(time),
            Source::Random(s) => s.advance(time),
            Source::Function(_) => {}
            Source::Grabber(_) => {}
            Source::Comm(s) => s.advance(time),
        }
    }

    /// Last computed output without a time argument.
    pub fn cached_output(&self) -> f64 {
        match self {
            Source::Constant(s) => s.level,
            Source::Ramp(s) => s.output,
            Source::Pulse(s) => s.output,
            Source::Sine(s) => s.output,
            Source::File(s) => s.output,
            Source::Random(s) => s.ramp.output,
            Source::Function(s) => s.cached,
            Source::Grabber(s) => s.cached,
            Source::Comm(s) => s.output,
        }
    }

    /// Rate of change of the output at `time`.
    pub fn dout_dt(&self, ctx: &EvalCtx, time: f64) -> f64 {
        match self {
            Source::Constant(_) => 0.0,
            Source::Ramp(s) => s.rate,
            Source::Random(s) => s.ramp.rate,
            Source::Comm(s) => s.slew_rate(),
            _ => {
                // numerical estimate over a short backward window
                let h = 1e-4;
                (self.value_at(ctx, time) - self.value_at(ctx, time - h)) / h
            }
        }
    }
}

impl GridModel for Source {
    fn type_name(&self) -> &'static str {
        "source"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, _mode: &SolverMode) -> StateSizes {
        StateSizes::default()
    }

    fn pflow_init_a(&mut self, base: &mut ComponentBase, time0: f64, _flags: u32) {
        match self {
            Source::Pulse(s) => s.init(time0),
            Source::Sine(s) => s.init(time0),
            Source::Random(s) => s.init(time0),
            Source::Ramp(s) => s.prev_time = time0,
            Source::File(s) => s.init(time0),
            Source::Comm(s) => s.init(time0),
            _ => {}
        }
        base.output_size = 1;
    }

    fn outputs(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        _mode: &SolverMode,
    ) -> Vec<f64> {
        let time = if sd.is_empty() {
            ctx.base().prev_time
        } else {
            sd.time
        };
        vec![self.value_at(ctx, time)]
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        if index == 0 {
            self.cached_output()
        } else {
            0.0
        }
    }

    fn dout_dt(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        _mode: &SolverMode,
        index: usize,
    ) -> f64 {
        if index != 0 {
            return 0.0;
        }
        let time = if sd.is_empty() {
            ctx.base().prev_time
        } else {
            sd.time
        };
        Source::dout_dt(self, ctx, time)
    }

    fn timestep(
        &mut self,
        base: &mut ComponentBase,
        time: f64,
        _inputs: &[f64],
        _mode: &SolverMode,
    ) -> f64 {
        self.advance(time);
        base.prev_time = time;
        self.cached_output()
    }

    fn set_param(
        &mut self,
        base: &mut ComponentBase,
        name: &str,
        value: f64,
        unit: Unit,
    ) -> ParamResult {
        match self {
            Source::Constant(s) => match name {
                "level" | "value" => {
                    s.level = value;
                    ParamResult::Recognized
                }
                _ => ParamResult::NotRecognized,
            },
            Source::Ramp(s) => match name {
                "rate" | "dodt" => {
                    s.rate = value;
                    ParamResult::Recognized
                }
                "level" | "value" => {
                    s.output = value;
                    ParamResult::Recognized
                }
                _ => ParamResult::NotRecognized,
            },
            Source::Pulse(s) => s.set_param(name, value),
            Source::Sine(s) => s.set_param(name, value),
            Source::File(s) => s.set_param(name, value),
            Source::Random(s) => s.set_param(name, value),
            Source::Function(_) => ParamResult::NotRecognized,
            Source::Grabber(s) => s.set_param(name, value),
            Source::Comm(s) => s.set_param(base, name, value, unit),
        }
    }

    fn set_param_str(&mut self, _base: &mut ComponentBase, name: &str, value: &str) -> ParamResult {
        match self {
            Source::Pulse(s) => s.set_param_str(name, value),
            Source::Sine(s) => s.set_param_str(name, value),
            Source::File(s) => s.set_param_str(name, value),
            Source::Random(s) => s.set_param_str(name, value),
            Source::Grabber(s) => s.set_param_str(name, value),
            _ => ParamResult::NotRecognized,
        }
    }

    fn set_flag(&mut self, _base: &mut ComponentBase, name: &str, value: bool) -> ParamResult {
        match self {
            Source::Pulse(s) => s.set_flag(name, value),
            Source::File(s) => s.set_flag(name, value),
            Source::Random(s) => s.set_flag(name, value),
            Source::Comm(s) => s.set_flag(name, value),
            _ => ParamResult::NotRecognized,
        }
    }

    fn get_param(&self, _base: &ComponentBase, name: &str, _unit: Unit) -> Option<f64> {
        if name == "output" || name == "value" {
            return Some(self.cached_output());
        }
        match self {
            Source::Pulse(s) => s.get_param(name),
            Source::Sine(s) => s.get_param(name),
            Source::Random(s) => s.get_param(name),
            Source::Ramp(s) => match name {
                "rate" | "dodt" => Some(s.rate),
                _ => None,
            },
            Source::Constant(s) => match name {
                "level" => Some(s.level),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ComponentArena;
    use crate::component::{Component, ComponentKind};
    use crate::models::Area;

    fn ctx_arena() -> (ComponentArena, crate::object::ComponentId) {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("root", ComponentKind::Area(Area::default())));
        let src = arena
            .add_sub_object(
                root,
                Component::new(
                    "src",
                    ComponentKind::Source(Source::Constant(ConstantSource { level: 2.0 })),
                ),
            )
            .unwrap();
        (arena, src)
    }

    #[test]
    fn test_constant_source() {
        let (arena, src) = ctx_arena();
        let ctx = EvalCtx::new(&arena, src);
        let source = Source::Constant(ConstantSource { level: 2.0 });
        assert_eq!(source.value_at(&ctx, 0.0), 2.0);
        assert_eq!(source.value_at(&ctx, 1e6), 2.0);
    }

    #[test]
    fn test_ramp_source() {
        let (arena, src) = ctx_arena();
        let ctx = EvalCtx::new(&arena, src);
        let mut source = Source::Ramp(RampSource {
            output: 1.0,
            rate: 0.5,
            prev_time: 0.0,
        });
        assert!((source.value_at(&ctx, 4.0) - 3.0).abs() < 1e-12);
        source.advance(2.0);
        assert!((source.cached_output() - 2.0).abs() < 1e-12);
        assert!((source.value_at(&ctx, 4.0) - 3.0).abs() < 1e-12);
    }
}
