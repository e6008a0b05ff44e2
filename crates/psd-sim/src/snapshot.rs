//! State snapshot persistence.
//!
//! Binary records are little-endian
//! `[time:f64][code:u32][index:u32][key:u32][N:u32][data:N*f64]`; Jacobian
//! records carry `0x00010000 | base` as the code and a length-prefixed list
//! of `(row:u32, col:u32, value:f64)` triplets. Power-flow results also
//! save and load as CSV.

use crate::simulation::Simulation;
use anyhow::{anyhow, Context, Result};
use psd_core::{ComponentKind, MatrixData, SolverMode, TripletMatrix, Unit};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const STATE_INFORMATION: u32 = 0;
pub const DERIVATIVE_INFORMATION: u32 = 1;
pub const RESIDUAL_INFORMATION: u32 = 2;
pub const JACOBIAN_FLAG: u32 = 0x0001_0000;

/// One decoded snapshot record.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRecord {
    Vector {
        time: f64,
        code: u32,
        index: u32,
        key: u32,
        data: Vec<f64>,
    },
    Jacobian {
        time: f64,
        base_code: u32,
        index: u32,
        key: u32,
        entries: Vec<(u32, u32, f64)>,
    },
}

/// Append one vector record.
pub fn write_vector_record(
    writer: &mut impl Write,
    time: f64,
    code: u32,
    index: u32,
    key: u32,
    data: &[f64],
) -> Result<()> {
    writer.write_all(&time.to_le_bytes())?;
    writer.write_all(&code.to_le_bytes())?;
    writer.write_all(&index.to_le_bytes())?;
    writer.write_all(&key.to_le_bytes())?;
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    for value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Append one Jacobian record.
pub fn write_jacobian_record(
    writer: &mut impl Write,
    time: f64,
    base_code: u32,
    index: u32,
    key: u32,
    jac: &TripletMatrix,
) -> Result<()> {
    writer.write_all(&time.to_le_bytes())?;
    writer.write_all(&(JACOBIAN_FLAG | base_code).to_le_bytes())?;
    writer.write_all(&index.to_le_bytes())?;
    writer.write_all(&key.to_le_bytes())?;
    writer.write_all(&(jac.count() as u32).to_le_bytes())?;
    for &(row, col, value) in jac.entries() {
        writer.write_all(&(row as u32).to_le_bytes())?;
        writer.write_all(&(col as u32).to_le_bytes())?;
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_exact_opt(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read every record in a snapshot stream.
pub fn read_records(reader: &mut impl Read) -> Result<Vec<SnapshotRecord>> {
    let mut records = Vec::new();
    loop {
        let mut f8 = [0u8; 8];
        if !read_exact_opt(reader, &mut f8)? {
            break;
        }
        let time = f64::from_le_bytes(f8);
        let mut u4 = [0u8; 4];
        reader.read_exact(&mut u4)?;
        let code = u32::from_le_bytes(u4);
        reader.read_exact(&mut u4)?;
        let index = u32::from_le_bytes(u4);
        reader.read_exact(&mut u4)?;
        let key = u32::from_le_bytes(u4);
        reader.read_exact(&mut u4)?;
        let count = u32::from_le_bytes(u4) as usize;

        if code & JACOBIAN_FLAG != 0 {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                reader.read_exact(&mut u4)?;
                let row = u32::from_le_bytes(u4);
                reader.read_exact(&mut u4)?;
                let col = u32::from_le_bytes(u4);
                reader.read_exact(&mut f8)?;
                entries.push((row, col, f64::from_le_bytes(f8)));
            }
            records.push(SnapshotRecord::Jacobian {
                time,
                base_code: code & !JACOBIAN_FLAG,
                index,
                key,
                entries,
            });
        } else {
            let mut data = Vec::with_capacity(count);
            for _ in 0..count {
                reader.read_exact(&mut f8)?;
                data.push(f64::from_le_bytes(f8));
            }
            records.push(SnapshotRecord::Vector {
                time,
                code,
                index,
                key,
                data,
            });
        }
    }
    Ok(records)
}

/// Save a mode's state and derivative vectors in binary form.
pub fn save_state(sim: &Simulation, mode: &SolverMode, path: impl AsRef<Path>) -> Result<()> {
    let handle = sim
        .solver_state(mode)
        .ok_or_else(|| anyhow!("no solver state for the requested mode"))?;
    let dstate = sim
        .solvers_dstate(mode)
        .ok_or_else(|| anyhow!("no derivative state for the requested mode"))?;
    let file = File::create(path.as_ref())
        .with_context(|| format!("creating snapshot '{}'", path.as_ref().display()))?;
    let mut writer = BufWriter::new(file);
    let index = mode.offset_index as u32;
    write_vector_record(
        &mut writer,
        sim.current_time,
        STATE_INFORMATION,
        index,
        0,
        handle,
    )?;
    write_vector_record(
        &mut writer,
        sim.current_time,
        DERIVATIVE_INFORMATION,
        index,
        0,
        dstate,
    )?;
    Ok(())
}

/// Load a binary snapshot back into a mode's solver vectors.
pub fn load_state(sim: &mut Simulation, mode: &SolverMode, path: impl AsRef<Path>) -> Result<()> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening snapshot '{}'", path.as_ref().display()))?;
    let mut reader = BufReader::new(file);
    let records = read_records(&mut reader)?;
    for record in records {
        if let SnapshotRecord::Vector {
            time, code, data, ..
        } = record
        {
            match code {
                STATE_INFORMATION => {
                    {
                        let handle = sim.handle(mode);
                        if handle.state.len() != data.len() {
                            handle.allocate(data.len(), 0);
                        }
                        handle.state.copy_from_slice(&data);
                        handle.current_time = time;
                    }
                    sim.current_time = time;
                }
                DERIVATIVE_INFORMATION => {
                    let handle = sim.handle(mode);
                    if handle.dstate.len() == data.len() {
                        handle.dstate.copy_from_slice(&data);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Save bus results as CSV: name, voltage, angle, P, Q.
pub fn save_powerflow_csv(sim: &Simulation, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())
        .with_context(|| format!("creating '{}'", path.as_ref().display()))?;
    writer.write_record(["bus", "voltage", "angle", "p", "q"])?;
    let sd = psd_core::StateData::empty();
    for id in sim.arena.subtree_post_order(sim.root) {
        let comp = sim.arena.expect(id);
        let ComponentKind::Bus(bus) = &comp.kind else {
            continue;
        };
        let outputs = sim.arena.outputs(id, &sd, &psd_core::LOCAL_MODE);
        writer.write_record([
            comp.base.name.clone(),
            format!("{:.12}", bus.voltage),
            format!("{:.12}", bus.angle),
            format!("{:.12}", outputs.first().copied().unwrap_or(0.0)),
            format!("{:.12}", outputs.get(1).copied().unwrap_or(0.0)),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Load a power-flow CSV back, applying voltages and angles by bus name.
pub fn load_powerflow_csv(sim: &mut Simulation, path: impl AsRef<Path>) -> Result<()> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("opening '{}'", path.as_ref().display()))?;
    for record in reader.records() {
        let record = record?;
        if record.len() < 3 {
            continue;
        }
        let name = record[0].to_string();
        let voltage: f64 = record[1].trim().parse()?;
        let angle: f64 = record[2].trim().parse()?;
        if let Some(id) = sim.arena.find(sim.root, &name) {
            sim.arena.set_param(id, "voltage", voltage, Unit::PerUnit)?;
            sim.arena.set_param(id, "angle", angle, Unit::PerUnit)?;
        }
    }
    Ok(())
}

impl Simulation {
    /// Derivative vector access for persistence.
    pub(crate) fn solvers_dstate(&self, mode: &SolverMode) -> Option<&[f64]> {
        self.solvers
            .get(mode.offset_index)
            .and_then(|h| h.as_ref())
            .map(|h| h.dstate.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_record_round_trip() {
        let mut buf = Vec::new();
        let data = vec![1.0, -2.5, 3.25];
        write_vector_record(&mut buf, 1.5, STATE_INFORMATION, 2, 7, &data).unwrap();
        let records = read_records(&mut buf.as_slice()).unwrap();
        assert_eq!(
            records,
            vec![SnapshotRecord::Vector {
                time: 1.5,
                code: STATE_INFORMATION,
                index: 2,
                key: 7,
                data,
            }]
        );
    }

    #[test]
    fn test_record_layout_is_exact() {
        let mut buf = Vec::new();
        write_vector_record(&mut buf, 0.0, STATE_INFORMATION, 0, 0, &[1.0]).unwrap();
        // time(8) + code(4) + index(4) + key(4) + N(4) + one f64(8)
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn test_jacobian_record_round_trip() {
        let mut jac = TripletMatrix::new(3, 3);
        jac.assign(0, 1, 2.5);
        jac.assign(2, 2, -1.0);
        let mut buf = Vec::new();
        write_jacobian_record(&mut buf, 4.0, RESIDUAL_INFORMATION, 1, 0, &jac).unwrap();
        let records = read_records(&mut buf.as_slice()).unwrap();
        match &records[0] {
            SnapshotRecord::Jacobian {
                time,
                base_code,
                entries,
                ..
            } => {
                assert_eq!(*time, 4.0);
                assert_eq!(*base_code, RESIDUAL_INFORMATION);
                assert_eq!(entries, &vec![(0, 1, 2.5), (2, 2, -1.0)]);
            }
            _ => panic!("expected a Jacobian record"),
        }
    }

    #[test]
    fn test_multiple_records_stream() {
        let mut buf = Vec::new();
        write_vector_record(&mut buf, 1.0, STATE_INFORMATION, 0, 0, &[1.0, 2.0]).unwrap();
        write_vector_record(&mut buf, 1.0, DERIVATIVE_INFORMATION, 0, 0, &[0.1, 0.2]).unwrap();
        let records = read_records(&mut buf.as_slice()).unwrap();
        assert_eq!(records.len(), 2);
    }
}
