//! Randomly varying source.
//!
//! The output takes stepwise or ramped changes at random instants. The
//! inter-change time and the jump size come from configurable distributions;
//! `zbias` pulls the accumulated offset back toward zero to suppress long
//! drifts.

use super::RampSource;
use crate::change::ParamResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Always `param1`
    #[default]
    Constant,
    /// Uniform on `[param1, param2]`
    Uniform,
    /// Exponential with mean `param1`
    Exponential,
    /// Normal with mean `param1`, standard deviation `param2`
    Normal,
}

impl Distribution {
    pub fn parse(name: &str) -> Option<Distribution> {
        match name.to_ascii_lowercase().as_str() {
            "constant" => Some(Distribution::Constant),
            "uniform" => Some(Distribution::Uniform),
            "exponential" => Some(Distribution::Exponential),
            "normal" | "gaussian" => Some(Distribution::Normal),
            _ => None,
        }
    }

    /// Draw one sample.
    pub fn sample(&self, rng: &mut StdRng, p1: f64, p2: f64) -> f64 {
        match self {
            Distribution::Constant => p1,
            Distribution::Uniform => {
                let u: f64 = rng.gen();
                p1 + (p2 - p1) * u
            }
            Distribution::Exponential => {
                // inverse transform; mean p1
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                -p1 * u.ln()
            }
            Distribution::Normal => {
                // Box-Muller over two uniforms
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen();
                p1 + p2 * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RandomSource {
    pub ramp: RampSource,
    pub time_dist: Distribution,
    pub val_dist: Distribution,
    /// Timing distribution parameters
    pub param1_t: f64,
    pub param2_t: f64,
    /// Level distribution parameters
    pub param1_l: f64,
    pub param2_l: f64,
    /// Pull toward zero accumulated offset
    pub zbias: f64,
    /// Running sum of applied changes
    pub offset: f64,
    /// Ramp to the next level instead of stepping
    pub interpolate: bool,
    /// Re-arm after each change
    pub repeated: bool,
    /// Changes scale the current output instead of adding
    pub proportional: bool,
    pub triggered: bool,
    pub armed: bool,
    pub next_update_time: f64,
    pub key_time: f64,
    rng: StdRng,
}

impl Default for RandomSource {
    fn default() -> Self {
        RandomSource {
            ramp: RampSource::default(),
            time_dist: Distribution::Constant,
            val_dist: Distribution::Constant,
            param1_t: 1.0,
            param2_t: 0.0,
            param1_l: 0.0,
            param2_l: 0.0,
            zbias: 0.0,
            offset: 0.0,
            interpolate: false,
            repeated: true,
            proportional: false,
            triggered: false,
            armed: false,
            next_update_time: f64::INFINITY,
            key_time: 0.0,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }
}

impl RandomSource {
    pub fn init(&mut self, time0: f64) {
        self.triggered = false;
        self.offset = 0.0;
        self.key_time = time0;
        self.ramp.prev_time = time0;
        let trigger = time0 + self.next_interval();
        if self.interpolate {
            self.prepare_ramp(trigger);
        }
        self.next_update_time = trigger;
        self.armed = true;
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Draw the next inter-change interval (non-negative).
    pub fn next_interval(&mut self) -> f64 {
        loop {
            let dt = self.time_dist.sample(&mut self.rng, self.param1_t, self.param2_t);
            if dt >= 0.0 {
                return dt;
            }
        }
    }

    /// Draw the next level change, including the zero bias pull.
    fn next_change(&mut self) -> f64 {
        let mut change = self
            .val_dist
            .sample(&mut self.rng, self.param1_l, self.param2_l);
        change += self.bias_adjust();
        self.offset += change;
        change
    }

    fn bias_adjust(&self) -> f64 {
        if self.zbias == 0.0 {
            return 0.0;
        }
        match self.val_dist {
            Distribution::Uniform => -(self.param2_l - self.param1_l) * self.zbias * self.offset,
            Distribution::Exponential => self.offset / self.param1_l * self.zbias - 0.5,
            Distribution::Normal => -self.param2_l * self.zbias * self.offset,
            Distribution::Constant => 0.0,
        }
    }

    fn prepare_ramp(&mut self, trigger_time: f64) {
        let rval = self.next_change();
        let next_val = if self.proportional {
            self.ramp.output + rval * self.ramp.output
        } else {
            self.ramp.output + rval
        };
        let span = trigger_time - self.key_time;
        self.ramp.rate = if span > 0.0 {
            (next_val - self.ramp.output) / span
        } else {
            0.0
        };
    }

    pub fn value_at(&self, time: f64) -> f64 {
        self.ramp.value_at(time.min(self.next_update_time))
    }

    pub fn advance(&mut self, time: f64) {
        while self.armed && time >= self.next_update_time {
            let fire_time = self.next_update_time;
            self.triggered = true;
            let trigger = fire_time + self.next_interval();
            if self.interpolate {
                self.ramp.advance(fire_time);
                if self.repeated {
                    self.key_time = fire_time;
                    self.prepare_ramp(trigger);
                    self.next_update_time = trigger;
                } else {
                    self.ramp.clear_ramp();
                    self.next_update_time = f64::INFINITY;
                    self.armed = false;
                }
            } else {
                let rval = self.next_change();
                self.ramp.output = if self.proportional {
                    self.ramp.output + rval * self.ramp.output
                } else {
                    self.ramp.output + rval
                };
                self.ramp.prev_time = fire_time;
                self.key_time = fire_time;
                if self.repeated {
                    self.next_update_time = trigger;
                } else {
                    self.next_update_time = f64::INFINITY;
                    self.armed = false;
                }
            }
        }
        self.ramp.advance(time);
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> ParamResult {
        match name {
            "min_t" | "mean_t" | "param1_t" => {
                if value <= 0.0 && (name == "min_t" || name == "mean_t") {
                    return ParamResult::Invalid;
                }
                self.param1_t = value;
            }
            "max_t" | "scale_t" | "param2_t" => self.param2_t = value,
            "min_l" | "mean_l" | "param1_l" => self.param1_l = value,
            "max_l" | "stdev_l" | "param2_l" => self.param2_l = value,
            "zbias" => self.zbias = value,
            "seed" => self.reseed(value as u64),
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    pub fn set_param_str(&mut self, name: &str, value: &str) -> ParamResult {
        match name {
            "trigger_dist" | "time_dist" => match Distribution::parse(value) {
                Some(d) => {
                    self.time_dist = d;
                    ParamResult::Recognized
                }
                None => ParamResult::Invalid,
            },
            "size_dist" | "change_dist" => match Distribution::parse(value) {
                Some(d) => {
                    self.val_dist = d;
                    ParamResult::Recognized
                }
                None => ParamResult::Invalid,
            },
            _ => ParamResult::NotRecognized,
        }
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> ParamResult {
        match name {
            "interpolate" => {
                self.interpolate = value;
                if !value {
                    self.ramp.clear_ramp();
                }
            }
            "step" => {
                self.interpolate = !value;
                if value {
                    self.ramp.clear_ramp();
                }
            }
            "repeated" => self.repeated = value,
            "proportional" => self.proportional = value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    pub fn get_param(&self, name: &str) -> Option<f64> {
        match name {
            "param1_t" | "mean_t" => Some(self.param1_t),
            "param2_t" => Some(self.param2_t),
            "param1_l" | "mean_l" => Some(self.param1_l),
            "param2_l" => Some(self.param2_l),
            "zbias" => Some(self.zbias),
            "offset" => Some(self.offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_interval_mean() {
        let mut src = RandomSource {
            time_dist: Distribution::Exponential,
            param1_t: 2.0,
            ..Default::default()
        };
        src.reseed(42);
        let n = 10_000;
        let total: f64 = (0..n).map(|_| src.next_interval()).sum();
        let mean = total / n as f64;
        assert!(
            (mean - 2.0).abs() / 2.0 < 0.05,
            "expected mean near 2.0, got {mean}"
        );
    }

    #[test]
    fn test_uniform_interval_bounds() {
        let mut src = RandomSource {
            time_dist: Distribution::Uniform,
            param1_t: 1.0,
            param2_t: 3.0,
            ..Default::default()
        };
        src.reseed(7);
        for _ in 0..1000 {
            let dt = src.next_interval();
            assert!((1.0..=3.0).contains(&dt));
        }
    }

    #[test]
    fn test_step_changes_fire_on_schedule() {
        let mut src = RandomSource {
            time_dist: Distribution::Constant,
            val_dist: Distribution::Constant,
            param1_t: 1.0,
            param1_l: 0.5,
            ..Default::default()
        };
        src.init(0.0);
        src.advance(0.5);
        assert!((src.ramp.output - 0.0).abs() < 1e-12);
        src.advance(2.5);
        // two changes fired (at t=1 and t=2)
        assert!((src.ramp.output - 1.0).abs() < 1e-12);
        assert!((src.offset - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_one_shot_disarms() {
        let mut src = RandomSource {
            time_dist: Distribution::Constant,
            val_dist: Distribution::Constant,
            param1_t: 1.0,
            param1_l: 0.5,
            repeated: false,
            ..Default::default()
        };
        src.init(0.0);
        src.advance(5.0);
        assert!(!src.armed);
        assert!((src.ramp.output - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zbias_pulls_back() {
        let mut src = RandomSource {
            val_dist: Distribution::Normal,
            param1_l: 0.0,
            param2_l: 0.1,
            zbias: 0.5,
            ..Default::default()
        };
        src.reseed(3);
        for _ in 0..2000 {
            src.next_change();
        }
        // with bias the running offset stays bounded
        assert!(src.offset.abs() < 1.0);
    }
}
