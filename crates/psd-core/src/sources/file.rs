//! Time-series file source.
//!
//! Loads a two-column `time,value` schedule and plays it back either
//! step-held or linearly interpolated. Times may be absolute or relative to
//! the initialization instant.

use crate::change::ParamResult;
use crate::error::{PsdError, PsdResult};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct FileSource {
    /// Sorted `(time, value)` schedule
    pub schedule: Vec<(f64, f64)>,
    /// Linear interpolation between points instead of step-hold
    pub interpolate: bool,
    /// Schedule times are relative to the simulation start
    pub relative_time: bool,
    /// Offset applied to schedule times when relative
    pub time_offset: f64,
    pub output: f64,
    pub prev_time: f64,
}

impl FileSource {
    pub fn init(&mut self, time0: f64) {
        if self.relative_time {
            self.time_offset = time0;
        }
        self.prev_time = time0;
        self.output = self.value_at(time0);
    }

    /// Load the schedule from a CSV file with `time,value` rows.
    pub fn load(&mut self, path: impl AsRef<Path>) -> PsdResult<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_path(path.as_ref())?;
        let mut schedule = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| PsdError::InvalidFile(e.to_string()))?;
            if record.len() < 2 {
                continue;
            }
            let parse = |s: &str| -> PsdResult<f64> {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| PsdError::InvalidFile(format!("bad number '{s}'")))
            };
            schedule.push((parse(&record[0])?, parse(&record[1])?));
        }
        if schedule.is_empty() {
            return Err(PsdError::InvalidFile(
                "time series file contained no usable rows".into(),
            ));
        }
        schedule.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.schedule = schedule;
        Ok(())
    }

    pub fn value_at(&self, time: f64) -> f64 {
        if self.schedule.is_empty() {
            return self.output;
        }
        let t = time - self.time_offset;
        let pos = self.schedule.partition_point(|&(st, _)| st <= t);
        if pos == 0 {
            return self.schedule[0].1;
        }
        let (t0, v0) = self.schedule[pos - 1];
        if !self.interpolate || pos >= self.schedule.len() {
            return v0;
        }
        let (t1, v1) = self.schedule[pos];
        if t1 <= t0 {
            return v0;
        }
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }

    pub fn advance(&mut self, time: f64) {
        self.output = self.value_at(time);
        self.prev_time = time;
    }

    pub fn set_param(&mut self, _name: &str, _value: f64) -> ParamResult {
        ParamResult::NotRecognized
    }

    pub fn set_param_str(&mut self, name: &str, value: &str) -> ParamResult {
        match name {
            "file" | "filename" => match self.load(value) {
                Ok(()) => ParamResult::Recognized,
                Err(_) => ParamResult::Invalid,
            },
            _ => ParamResult::NotRecognized,
        }
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> ParamResult {
        match name {
            "interpolate" => self.interpolate = value,
            "step" => self.interpolate = !value,
            "relative" => self.relative_time = value,
            "absolute" => self.relative_time = !value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stepped() -> FileSource {
        FileSource {
            schedule: vec![(0.0, 1.0), (5.0, 2.0), (10.0, 3.0)],
            ..Default::default()
        }
    }

    #[test]
    fn test_step_hold_boundaries() {
        let src = stepped();
        assert_eq!(src.value_at(4.999), 1.0);
        assert_eq!(src.value_at(5.0), 2.0);
        assert_eq!(src.value_at(9.999), 2.0);
        assert_eq!(src.value_at(10.0), 3.0);
        assert_eq!(src.value_at(50.0), 3.0);
    }

    #[test]
    fn test_interpolated() {
        let mut src = stepped();
        src.interpolate = true;
        assert!((src.value_at(2.5) - 1.5).abs() < 1e-12);
        assert!((src.value_at(7.5) - 2.5).abs() < 1e-12);
        // beyond the last point: hold
        assert_eq!(src.value_at(50.0), 3.0);
    }

    #[test]
    fn test_relative_time() {
        let mut src = stepped();
        src.relative_time = true;
        src.init(100.0);
        assert_eq!(src.value_at(104.999), 1.0);
        assert_eq!(src.value_at(105.0), 2.0);
    }

    #[test]
    fn test_load_from_csv() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# schedule").unwrap();
        writeln!(file, "0.0, 1.0").unwrap();
        writeln!(file, "5.0, 2.0").unwrap();
        writeln!(file, "10.0, 3.0").unwrap();

        let mut src = FileSource::default();
        src.load(file.path()).expect("load");
        assert_eq!(src.schedule.len(), 3);
        assert_eq!(src.value_at(6.0), 2.0);
    }

    #[test]
    fn test_load_rejects_empty() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let mut src = FileSource::default();
        assert!(src.load(file.path()).is_err());
    }
}
