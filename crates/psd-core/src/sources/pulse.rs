//! Pulse-train and sine sources.

use crate::change::ParamResult;

/// Waveform shape within the duty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PulseShape {
    #[default]
    Square,
    Triangle,
    Gaussian,
    Biexponential,
    Exponential,
    Cosine,
    FlatTop,
    Monocycle,
}

/// Periodic pulse train. Output is the base value outside the duty window;
/// inside, the shape applies with a linear taper over the first and last 5%
/// of the window to avoid hard discontinuities.
#[derive(Debug, Clone)]
pub struct PulseSource {
    pub shape: PulseShape,
    pub amplitude: f64,
    pub period: f64,
    pub duty_cycle: f64,
    pub base_value: f64,
    /// Phase shift in fractions of a period
    pub shift: f64,
    pub invert: bool,
    pub cycle_time: f64,
    pub output: f64,
    pub prev_time: f64,
}

impl Default for PulseSource {
    fn default() -> Self {
        PulseSource {
            shape: PulseShape::Square,
            amplitude: 0.0,
            period: f64::INFINITY,
            duty_cycle: 0.5,
            base_value: 0.0,
            shift: 0.0,
            invert: false,
            cycle_time: 0.0,
            output: 0.0,
            prev_time: 0.0,
        }
    }
}

impl PulseSource {
    pub fn init(&mut self, time0: f64) {
        // subtract a period so the train cycles properly the first time
        self.cycle_time = time0 - self.shift * self.period - self.period;
        if self.period.is_finite() {
            self.output = self.value_at(time0);
        }
        self.prev_time = time0;
    }

    pub fn value_at(&self, time: f64) -> f64 {
        if !self.period.is_finite() {
            return self.output;
        }
        let tdiff = (time - self.cycle_time).rem_euclid(self.period);
        self.base_value + self.pulse_calc(tdiff)
    }

    pub fn advance(&mut self, time: f64) {
        if time == self.prev_time || !self.period.is_finite() {
            return;
        }
        let mut tdiff = time - self.cycle_time;
        if tdiff > self.period {
            self.cycle_time += self.period * (tdiff / self.period).floor();
            tdiff = tdiff.rem_euclid(self.period);
        }
        self.output = self.base_value + self.pulse_calc(tdiff);
        self.prev_time = time;
    }

    /// The pulse contribution at offset `td` into the current cycle.
    pub fn pulse_calc(&self, td: f64) -> f64 {
        if self.duty_cycle <= 0.0 {
            return if self.invert { self.amplitude } else { 0.0 };
        }
        if self.duty_cycle >= 1.0 {
            return if self.invert { 0.0 } else { self.amplitude };
        }
        let cloc = td / self.period;
        let prop = (cloc - self.duty_cycle / 2.0) / self.duty_cycle;
        if !(0.0..1.0).contains(&prop) {
            return if self.invert { self.amplitude } else { 0.0 };
        }

        // edge taper
        let mut mult = 1.0;
        if prop < 0.05 {
            mult = 20.0 * prop;
        } else if prop > 0.95 {
            mult = 20.0 * (1.0 - prop);
        }

        let a = self.amplitude;
        let mut pamp = match self.shape {
            PulseShape::Square => a,
            PulseShape::Triangle => 2.0 * a * if prop < 0.5 { prop } else { 1.0 - prop },
            PulseShape::Gaussian => mult * a * (-(prop - 0.5) * (prop - 0.5) * 25.0).exp(),
            PulseShape::Monocycle => {
                mult * a * 11.6583 * (prop - 0.5) * (-(prop - 0.5) * (prop - 0.5)).exp()
            }
            PulseShape::Biexponential => {
                if prop < 0.5 {
                    mult * a * (-(0.5 - prop) * 12.0).exp()
                } else {
                    mult * a * (-(prop - 0.5) * 12.0).exp()
                }
            }
            PulseShape::Exponential => {
                let m = if prop < 0.5 { 1.0 } else { mult };
                m * a * (-prop * 6.0).exp()
            }
            PulseShape::Cosine => a * (prop * std::f64::consts::PI).sin(),
            PulseShape::FlatTop => {
                if prop < 0.25 {
                    a / 2.0 * (1.0 - (std::f64::consts::PI * prop * 4.0).cos())
                } else if prop > 0.75 {
                    a / 2.0 * (1.0 - (std::f64::consts::PI * (1.0 - prop) * 4.0).cos())
                } else {
                    a
                }
            }
        };
        if self.invert {
            pamp = self.amplitude - pamp;
        }
        pamp
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> ParamResult {
        match name {
            "a" | "amplitude" | "amp" => {
                self.amplitude = value;
                self.cycle_time -= self.period;
            }
            "period" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.period = value;
            }
            "frequency" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.period = 1.0 / value;
            }
            "dutycycle" | "duty" => {
                self.duty_cycle = value;
                self.cycle_time -= self.period;
            }
            "shift" => {
                self.cycle_time += (self.shift - value) * self.period;
                self.shift = value;
            }
            "base" => {
                self.base_value = value;
                self.cycle_time -= self.period;
            }
            "invert" => self.invert = value > 0.0,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    pub fn set_param_str(&mut self, name: &str, value: &str) -> ParamResult {
        if name != "type" && name != "pulsetype" && name != "shape" {
            return ParamResult::NotRecognized;
        }
        self.shape = match value.to_ascii_lowercase().as_str() {
            "square" => PulseShape::Square,
            "triangle" => PulseShape::Triangle,
            "gaussian" => PulseShape::Gaussian,
            "biexponential" => PulseShape::Biexponential,
            "exponential" => PulseShape::Exponential,
            "sine" | "cosine" => PulseShape::Cosine,
            "flattop" => PulseShape::FlatTop,
            "monocycle" => PulseShape::Monocycle,
            _ => return ParamResult::Invalid,
        };
        self.cycle_time -= self.period;
        ParamResult::Recognized
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> ParamResult {
        if name == "invert" {
            self.invert = value;
            return ParamResult::Recognized;
        }
        ParamResult::NotRecognized
    }

    pub fn get_param(&self, name: &str) -> Option<f64> {
        match name {
            "amplitude" | "amp" | "a" => Some(self.amplitude),
            "period" => Some(self.period),
            "frequency" => Some(1.0 / self.period),
            "dutycycle" | "duty" => Some(self.duty_cycle),
            "shift" => Some(self.shift),
            "base" => Some(self.base_value),
            _ => None,
        }
    }
}

/// Sine wave with optional frequency/amplitude drift and a pulse envelope.
#[derive(Debug, Clone)]
pub struct SineSource {
    pub amplitude: f64,
    pub frequency: f64,
    pub phase: f64,
    /// Frequency drift rate (Hz/s), accumulated on advance
    pub dfdt: f64,
    /// Amplitude drift rate (1/s)
    pub dadt: f64,
    pub base_value: f64,
    pub sine_period: f64,
    pub last_cycle: f64,
    pub prev_time: f64,
    pub output: f64,
    /// Envelope pulse when the source is pulsed
    pub envelope: Option<PulseSource>,
}

impl Default for SineSource {
    fn default() -> Self {
        SineSource {
            amplitude: 1.0,
            frequency: 60.0,
            phase: 0.0,
            dfdt: 0.0,
            dadt: 0.0,
            base_value: 0.0,
            sine_period: 1.0 / 60.0,
            last_cycle: 0.0,
            prev_time: 0.0,
            output: 0.0,
            envelope: None,
        }
    }
}

impl SineSource {
    pub fn init(&mut self, time0: f64) {
        self.last_cycle = time0;
        self.prev_time = time0;
        if let Some(env) = self.envelope.as_mut() {
            env.init(time0);
        }
        self.output = self.value_at(time0);
    }

    pub fn value_at(&self, time: f64) -> f64 {
        let dt = time - self.prev_time;
        let freq = self.frequency + self.dfdt * dt;
        let amp = self.amplitude + self.dadt * dt;
        let tdiff = time - self.last_cycle;
        let component =
            amp * (2.0 * std::f64::consts::PI * freq * tdiff + self.phase).sin();
        let mult = match &self.envelope {
            Some(env) => {
                let td = (time - env.cycle_time).rem_euclid(env.period.max(1e-12));
                env.pulse_calc(td)
            }
            None => 1.0,
        };
        self.base_value + mult * component
    }

    pub fn advance(&mut self, time: f64) {
        let dt = time - self.prev_time;
        if dt == 0.0 {
            return;
        }
        self.frequency += self.dfdt * dt;
        self.amplitude += self.dadt * dt;
        let mut tdiff = time - self.last_cycle;
        while tdiff > self.sine_period {
            tdiff -= self.sine_period;
            self.last_cycle += self.sine_period;
        }
        let component =
            self.amplitude * (2.0 * std::f64::consts::PI * self.frequency * tdiff + self.phase).sin();
        let mult = match self.envelope.as_mut() {
            Some(env) => {
                env.advance(time);
                let td = (time - env.cycle_time).rem_euclid(env.period.max(1e-12));
                env.pulse_calc(td)
            }
            None => 1.0,
        };
        self.output = self.base_value + mult * component;
        self.prev_time = time;
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> ParamResult {
        match name {
            "a" | "amplitude" | "amp" => self.amplitude = value,
            "frequency" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.frequency = value;
                self.sine_period = 1.0 / value;
            }
            "period" | "sineperiod" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.sine_period = value;
                self.frequency = 1.0 / value;
            }
            "phase" => self.phase = value,
            "dfdt" => self.dfdt = value,
            "dadt" => self.dadt = value,
            "base" => self.base_value = value,
            "pulsed" => {
                if value > 0.0 && self.envelope.is_none() {
                    self.envelope = Some(PulseSource::default());
                } else if value <= 0.0 {
                    self.envelope = None;
                }
            }
            "pulseperiod" => {
                return self
                    .envelope
                    .get_or_insert_with(PulseSource::default)
                    .set_param("period", value)
            }
            "pulseamplitude" => {
                return self
                    .envelope
                    .get_or_insert_with(PulseSource::default)
                    .set_param("amplitude", value)
            }
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    pub fn set_param_str(&mut self, name: &str, value: &str) -> ParamResult {
        match &mut self.envelope {
            Some(env) => env.set_param_str(name, value),
            None => ParamResult::NotRecognized,
        }
    }

    pub fn get_param(&self, name: &str) -> Option<f64> {
        match name {
            "amplitude" | "amp" | "a" => Some(self.amplitude),
            "frequency" => Some(self.frequency),
            "phase" => Some(self.phase),
            "dfdt" => Some(self.dfdt),
            "dadt" => Some(self.dadt),
            "base" => Some(self.base_value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_pulse() -> PulseSource {
        let mut src = PulseSource {
            amplitude: 1.0,
            period: 10.0,
            duty_cycle: 0.5,
            ..Default::default()
        };
        src.init(0.0);
        src
    }

    #[test]
    fn test_square_pulse_window() {
        let src = square_pulse();
        assert!((src.value_at(1.0)).abs() < 1e-12);
        assert!((src.value_at(2.5) - 1.0).abs() < 1e-12);
        assert!((src.value_at(7.5)).abs() < 1e-12);
    }

    #[test]
    fn test_pulse_repeats_across_periods() {
        let src = square_pulse();
        assert!((src.value_at(12.5) - 1.0).abs() < 1e-12);
        assert!((src.value_at(21.0)).abs() < 1e-12);
    }

    #[test]
    fn test_duty_cycle_extremes() {
        let mut src = square_pulse();
        src.duty_cycle = 0.0;
        assert_eq!(src.value_at(3.0), 0.0);
        src.duty_cycle = 1.0;
        assert_eq!(src.value_at(3.0), 1.0);
        assert_eq!(src.value_at(9.9), 1.0);
    }

    #[test]
    fn test_inverted_pulse() {
        let mut src = square_pulse();
        src.invert = true;
        assert!((src.value_at(1.0) - 1.0).abs() < 1e-12);
        assert!((src.value_at(2.5)).abs() < 1e-12);
    }

    #[test]
    fn test_triangle_peak() {
        let mut src = square_pulse();
        src.shape = PulseShape::Triangle;
        // peak at the center of the duty window (cloc = 0.5)
        assert!((src.value_at(5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sine_quarter_and_half_cycle() {
        let mut src = SineSource::default();
        src.init(0.0);
        assert!((src.value_at(1.0 / 240.0) - 1.0).abs() < 1e-9);
        assert!(src.value_at(1.0 / 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_sine_amplitude_drift() {
        let mut src = SineSource {
            dadt: 0.1,
            ..Default::default()
        };
        src.init(0.0);
        src.advance(1.0);
        assert!((src.amplitude - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_gaussian_taper_continuity() {
        let mut src = square_pulse();
        src.shape = PulseShape::Gaussian;
        // just inside the window the taper pins the output near zero
        let window_start = 2.5;
        let eps = src.period * src.duty_cycle * 1e-4;
        let v = src.value_at(window_start + eps);
        assert!(v.abs() < 0.01);
    }
}
