//! Per-component table of solver offsets, one column per active mode.
//!
//! Column 0 is always the local mode. Columns are created on demand when a
//! mode with a larger `offset_index` first touches the table. The table also
//! resolves [`Locations`] — the bundle that lets one evaluation routine run
//! unchanged under local execution, monolithic DAE, or partitioned dynamic.

use crate::error::{PsdError, PsdResult};
use crate::sizes::SolverOffsets;
use crate::solver_mode::{SolverMode, LOCAL_MODE};
use crate::state_data::StateData;
use serde::{Deserialize, Serialize};

/// Most simulations use local, power flow, DAE, and the two partitioned
/// columns.
const DEFAULT_TABLE_SIZE: usize = 5;

/// Resolved data locations for one component under one mode.
///
/// The slices point at the component's own variable ranges, drawn from the
/// state snapshot for global modes or from the component's local cache for
/// local mode and empty snapshots. Destination slices are derived by the
/// caller from its output array using `alg_offset`/`diff_offset`, since a
/// single bundle cannot hold aliasing mutable and immutable views.
#[derive(Debug, Clone, Copy)]
pub struct Locations<'a> {
    pub time: f64,
    pub alg_offset: usize,
    pub diff_offset: usize,
    pub alg_size: usize,
    pub diff_size: usize,
    /// This component's algebraic states
    pub alg_state: &'a [f64],
    /// This component's differential states
    pub diff_state: &'a [f64],
    /// Derivatives of the differential states
    pub dstate: &'a [f64],
}

/// Table mapping each solver mode's `offset_index` to its offsets and sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetTable {
    container: Vec<SolverOffsets>,
}

impl Default for OffsetTable {
    fn default() -> Self {
        let mut container: Vec<SolverOffsets> =
            (0..DEFAULT_TABLE_SIZE).map(|_| SolverOffsets::default()).collect();
        container[0].mode = LOCAL_MODE;
        OffsetTable { container }
    }
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn valid(&self, index: usize) -> bool {
        index < self.container.len()
    }

    fn ensure(&mut self, mode: &SolverMode) -> &mut SolverOffsets {
        let index = mode.offset_index;
        if !self.valid(index) {
            self.container
                .resize_with(index + 1, SolverOffsets::default);
        }
        let slot = &mut self.container[index];
        slot.mode = *mode;
        slot.mode.offset_index = index;
        slot
    }

    /// The slot for a mode, creating it if absent. O(1) amortized.
    pub fn get_mut(&mut self, mode: &SolverMode) -> &mut SolverOffsets {
        self.ensure(mode)
    }

    /// The slot for a mode, if it exists.
    pub fn get(&self, mode: &SolverMode) -> Option<&SolverOffsets> {
        self.container.get(mode.offset_index)
    }

    /// The slot at a raw column index (used to follow paired-mode links).
    pub fn column(&self, index: usize) -> Option<&SolverOffsets> {
        self.container.get(index)
    }

    /// The local-mode slot (always present, index 0).
    pub fn local(&self) -> &SolverOffsets {
        &self.container[0]
    }

    pub fn local_mut(&mut self) -> &mut SolverOffsets {
        &mut self.container[0]
    }

    pub fn len(&self) -> usize {
        self.container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    pub fn is_loaded(&self, mode: &SolverMode) -> bool {
        self.get(mode).is_some_and(|so| so.is_loaded())
    }

    pub fn is_state_count_loaded(&self, mode: &SolverMode) -> bool {
        self.get(mode).is_some_and(|so| so.state_loaded)
    }

    pub fn is_root_count_loaded(&self, mode: &SolverMode) -> bool {
        self.get(mode).is_some_and(|so| so.roots_loaded)
    }

    pub fn is_jacobian_count_loaded(&self, mode: &SolverMode) -> bool {
        self.get(mode).is_some_and(|so| so.jacobian_loaded)
    }

    /// Derive all sub-offsets for a mode from a single base.
    pub fn set_offset(&mut self, base: usize, mode: &SolverMode) {
        self.ensure(mode).set_offset(base);
    }

    /// Copy offsets from another record into a mode's slot.
    pub fn set_offsets(&mut self, offsets: &SolverOffsets, mode: &SolverMode) {
        self.ensure(mode).set_offsets(offsets);
    }

    pub fn set_alg_offset(&mut self, offset: Option<usize>, mode: &SolverMode) {
        self.ensure(mode).alg_offset = offset;
    }

    pub fn set_diff_offset(&mut self, offset: Option<usize>, mode: &SolverMode) {
        self.ensure(mode).diff_offset = offset;
    }

    pub fn set_v_offset(&mut self, offset: Option<usize>, mode: &SolverMode) {
        self.ensure(mode).v_offset = offset;
    }

    pub fn set_a_offset(&mut self, offset: Option<usize>, mode: &SolverMode) {
        self.ensure(mode).a_offset = offset;
    }

    pub fn set_root_offset(&mut self, offset: Option<usize>, mode: &SolverMode) {
        self.ensure(mode).root_offset = offset;
    }

    pub fn alg_offset(&self, mode: &SolverMode) -> Option<usize> {
        self.get(mode).and_then(|so| so.alg_offset)
    }

    pub fn diff_offset(&self, mode: &SolverMode) -> Option<usize> {
        self.get(mode).and_then(|so| so.diff_offset)
    }

    pub fn v_offset(&self, mode: &SolverMode) -> Option<usize> {
        self.get(mode).and_then(|so| so.v_offset)
    }

    pub fn a_offset(&self, mode: &SolverMode) -> Option<usize> {
        self.get(mode).and_then(|so| so.a_offset)
    }

    pub fn root_offset(&self, mode: &SolverMode) -> Option<usize> {
        self.get(mode).and_then(|so| so.root_offset)
    }

    /// The smallest index strictly greater than any occupied index for a mode.
    pub fn max_index(&self, mode: &SolverMode) -> usize {
        self.get(mode).map_or(0, |so| so.max_index())
    }

    /// Clear load flags and null the state offsets.
    pub fn unload(&mut self, dynamic_only: bool) {
        for so in &mut self.container {
            if dynamic_only && !so.mode.is_dynamic() {
                continue;
            }
            so.state_loaded = false;
            so.roots_loaded = false;
            so.jacobian_loaded = false;
            so.alg_offset = None;
            so.diff_offset = None;
        }
    }

    pub fn state_unload(&mut self, dynamic_only: bool) {
        for so in &mut self.container {
            if dynamic_only && !so.mode.is_dynamic() {
                continue;
            }
            so.state_loaded = false;
            so.alg_offset = None;
            so.diff_offset = None;
        }
    }

    pub fn root_unload(&mut self, dynamic_only: bool) {
        for so in &mut self.container {
            if dynamic_only && !so.mode.is_dynamic() {
                continue;
            }
            so.roots_loaded = false;
        }
    }

    pub fn jacobian_unload(&mut self, dynamic_only: bool) {
        for so in &mut self.container {
            if dynamic_only && !so.mode.is_dynamic() {
                continue;
            }
            so.jacobian_loaded = false;
        }
    }

    /// Copy the local-mode local sizes into every other slot and mark them
    /// loaded. With `dynamic_only` the state counts are left alone and only
    /// root/Jacobian counters refresh on dynamic slots.
    pub fn local_update_all(&mut self, dynamic_only: bool) {
        let local_sizes = self.container[0].local;
        if dynamic_only {
            for so in self.container.iter_mut().skip(1) {
                if !so.mode.is_dynamic() {
                    continue;
                }
                so.local.alg_roots = local_sizes.alg_roots;
                so.local.diff_roots = local_sizes.diff_roots;
                so.local.jac = local_sizes.jac;
                so.total.alg_roots = local_sizes.alg_roots;
                so.total.diff_roots = local_sizes.diff_roots;
                so.total.jac = local_sizes.jac;
                so.roots_loaded = true;
                so.jacobian_loaded = true;
            }
        } else {
            for so in self.container.iter_mut().skip(1) {
                so.local = local_sizes;
                so.local_load_all(true);
            }
        }
    }

    /// The mode stored at a column.
    pub fn solver_mode(&self, index: usize) -> SolverMode {
        self.container
            .get(index)
            .map_or(SolverMode::empty(), |so| so.mode)
    }

    /// First stored mode structurally equal to the argument (index ignored).
    pub fn find(&self, mode: &SolverMode) -> Option<&SolverMode> {
        self.container
            .iter()
            .find(|so| so.mode.same_structure(mode))
            .map(|so| &so.mode)
    }

    /// Resolve the data locations for a mode against a state snapshot,
    /// falling back to the component's local caches for local mode, empty
    /// snapshots, or the missing half of a partitioned solve.
    pub fn locations<'a>(
        &self,
        sd: &StateData<'a>,
        mode: &SolverMode,
        local_state: &'a [f64],
        local_dstate: &'a [f64],
        prev_time: f64,
    ) -> PsdResult<Locations<'a>> {
        let so = self
            .get(mode)
            .ok_or_else(|| PsdError::Object("mode has no offset column".into()))?;
        let alg_size = so.total.alg;
        let diff_size = so.total.diff;
        let local_alg_total = self.local().total.algebraic_total();

        // strict slicing for global vectors; local caches clamp to what the
        // component has actually allocated
        let slice = |arr: &'a [f64], off: usize, len: usize| -> PsdResult<&'a [f64]> {
            arr.get(off..off + len)
                .ok_or_else(|| PsdError::Object("state vector shorter than offsets require".into()))
        };
        let clamp = |arr: &'a [f64], off: usize, len: usize| -> &'a [f64] {
            let off = off.min(arr.len());
            let end = (off + len).min(arr.len());
            &arr[off..end]
        };
        let local_alg = clamp(local_state, 0, local_alg_total);
        let local_diff = clamp(local_state, local_alg_total, self.local().total.diff);
        let local_ddt = clamp(local_dstate, local_alg_total, self.local().total.diff);

        if mode.is_local() || sd.is_empty() {
            let alg_off = so.alg_offset.unwrap_or(0);
            let diff_off = so.diff_offset.unwrap_or(local_alg_total);
            return Ok(Locations {
                time: prev_time,
                alg_offset: alg_off,
                diff_offset: diff_off,
                alg_size,
                diff_size,
                alg_state: local_alg,
                diff_state: local_diff,
                dstate: local_ddt,
            });
        }

        let state = sd.state.expect("non-empty state data");
        if mode.is_dae() {
            let alg_off = so.alg_offset.unwrap_or(0);
            let diff_off = so.diff_offset.unwrap_or(0);
            let dstate_dt = sd
                .dstate_dt
                .ok_or_else(|| PsdError::Object("DAE state data missing derivatives".into()))?;
            return Ok(Locations {
                time: sd.time,
                alg_offset: alg_off,
                diff_offset: diff_off,
                alg_size,
                diff_size,
                alg_state: slice(state, alg_off, alg_size)?,
                diff_state: slice(state, diff_off, diff_size)?,
                dstate: slice(dstate_dt, diff_off, diff_size)?,
            });
        }

        if mode.has_algebraic() {
            let alg_off = so.alg_offset.unwrap_or(0);
            let alg_state = slice(state, alg_off, alg_size)?;
            // the differential half comes from the paired mode or the cache
            let (diff_state, dstate, diff_off) = if mode.is_dynamic() && sd.pair_index.is_some() {
                let pair = sd.pair_index.unwrap();
                let paired_diff = self
                    .container
                    .get(pair)
                    .and_then(|p| p.diff_offset)
                    .unwrap_or(0);
                let src = sd
                    .diff_state
                    .or(sd.full_state)
                    .ok_or_else(|| {
                        PsdError::Object("paired differential state missing".into())
                    })?;
                let ds = sd.dstate_dt.ok_or_else(|| {
                    PsdError::Object("paired derivative data missing".into())
                })?;
                (
                    slice(src, paired_diff, self.paired_diff_size(pair))?,
                    slice(ds, paired_diff, self.paired_diff_size(pair))?,
                    paired_diff,
                )
            } else {
                (local_diff, local_ddt, local_alg_total)
            };
            return Ok(Locations {
                time: sd.time,
                alg_offset: alg_off,
                diff_offset: diff_off,
                alg_size,
                diff_size: diff_state.len(),
                alg_state,
                diff_state,
                dstate,
            });
        }

        if mode.has_differential() {
            let diff_off = so.diff_offset.unwrap_or(0);
            let diff_state = slice(state, diff_off, diff_size)?;
            let dstate_dt = sd
                .dstate_dt
                .ok_or_else(|| PsdError::Object("differential state data missing derivatives".into()))?;
            let dstate = slice(dstate_dt, diff_off, diff_size)?;
            let (alg_state, alg_off) = if let Some(pair) = sd.pair_index {
                let paired_alg = self
                    .container
                    .get(pair)
                    .and_then(|p| p.alg_offset)
                    .unwrap_or(0);
                let src = sd.alg_state.or(sd.full_state).ok_or_else(|| {
                    PsdError::Object("paired algebraic state missing".into())
                })?;
                (slice(src, paired_alg, self.paired_alg_size(pair))?, paired_alg)
            } else {
                (local_alg, 0)
            };
            return Ok(Locations {
                time: sd.time,
                alg_offset: alg_off,
                diff_offset: diff_off,
                alg_size: alg_state.len(),
                diff_size,
                alg_state,
                diff_state,
                dstate,
            });
        }

        // neither class active in the mode: fall back to the local cache
        Ok(Locations {
            time: prev_time,
            alg_offset: 0,
            diff_offset: local_alg_total,
            alg_size,
            diff_size,
            alg_state: local_alg,
            diff_state: local_diff,
            dstate: local_ddt,
        })
    }

    fn paired_diff_size(&self, pair: usize) -> usize {
        self.container.get(pair).map_or(0, |p| p.total.diff)
    }

    fn paired_alg_size(&self, pair: usize) -> usize {
        self.container.get(pair).map_or(0, |p| p.total.alg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizes::StateSizes;
    use crate::solver_mode::{
        DAE_MODE, DYN_ALGEBRAIC_MODE, DYN_DIFFERENTIAL_MODE, POWER_FLOW_MODE,
    };

    fn table_with_dae(alg: usize, diff: usize) -> OffsetTable {
        let mut table = OffsetTable::new();
        {
            let so = table.get_mut(&DAE_MODE);
            so.local = StateSizes {
                alg,
                diff,
                ..Default::default()
            };
            so.local_load_all(true);
            so.set_offset(0);
        }
        table
    }

    #[test]
    fn test_local_slot_always_first() {
        let table = OffsetTable::new();
        assert!(table.local().mode.is_local());
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_slot_expands_on_demand() {
        let mut table = OffsetTable::new();
        let mut big = POWER_FLOW_MODE;
        big.offset_index = 9;
        table.set_alg_offset(Some(3), &big);
        assert_eq!(table.len(), 10);
        assert_eq!(table.alg_offset(&big), Some(3));
    }

    #[test]
    fn test_find_ignores_index() {
        let mut table = OffsetTable::new();
        table.get_mut(&DAE_MODE);
        let mut probe = DAE_MODE;
        probe.offset_index = 42;
        let found = table.find(&probe).expect("structure match");
        assert_eq!(found.offset_index, DAE_MODE.offset_index);
    }

    #[test]
    fn test_unload_dynamic_only() {
        let mut table = OffsetTable::new();
        for mode in [&POWER_FLOW_MODE, &DAE_MODE] {
            let so = table.get_mut(mode);
            so.alg_offset = Some(0);
            so.set_loaded();
        }
        table.unload(true);
        assert!(table.is_state_count_loaded(&POWER_FLOW_MODE));
        assert!(!table.is_state_count_loaded(&DAE_MODE));
        assert_eq!(table.alg_offset(&DAE_MODE), None);
        table.unload(false);
        assert!(!table.is_state_count_loaded(&POWER_FLOW_MODE));
    }

    #[test]
    fn test_locations_dae() {
        let table = table_with_dae(2, 2);
        let state = [1.0, 2.0, 3.0, 4.0];
        let dstate = [0.1, 0.2, 0.3, 0.4];
        let sd = StateData::new(5.0, &state, Some(&dstate), 1);
        let loc = table
            .locations(&sd, &DAE_MODE, &[], &[], 0.0)
            .expect("locations");
        assert_eq!(loc.alg_state, &[1.0, 2.0]);
        assert_eq!(loc.diff_state, &[3.0, 4.0]);
        assert_eq!(loc.dstate, &[0.3, 0.4]);
        assert_eq!(loc.time, 5.0);
    }

    #[test]
    fn test_locations_local_fallback() {
        let mut table = OffsetTable::new();
        {
            let so = table.local_mut();
            so.local = StateSizes {
                alg: 1,
                diff: 1,
                ..Default::default()
            };
            so.local_load_all(true);
        }
        let local_state = [7.0, 8.0];
        let local_dstate = [0.0, 0.5];
        let sd = StateData::empty();
        let loc = table
            .locations(&sd, &LOCAL_MODE, &local_state, &local_dstate, 2.5)
            .expect("locations");
        assert_eq!(loc.alg_state, &[7.0]);
        assert_eq!(loc.diff_state, &[8.0]);
        assert_eq!(loc.dstate, &[0.5]);
        assert_eq!(loc.time, 2.5);
    }

    #[test]
    fn test_locations_partitioned_algebraic_reads_paired_diff() {
        let mut table = OffsetTable::new();
        {
            let so = table.get_mut(&DYN_ALGEBRAIC_MODE);
            so.local = StateSizes {
                alg: 2,
                ..Default::default()
            };
            so.local_load_all(true);
            so.alg_offset = Some(0);
        }
        {
            let so = table.get_mut(&DYN_DIFFERENTIAL_MODE);
            so.local = StateSizes {
                diff: 2,
                ..Default::default()
            };
            so.local_load_all(true);
            so.diff_offset = Some(0);
        }
        let alg = [1.0, 2.0];
        let diff = [10.0, 20.0];
        let ddt = [0.5, 0.6];
        let mut sd = StateData::new(1.0, &alg, Some(&ddt), 1);
        sd.diff_state = Some(&diff);
        sd.pair_index = Some(DYN_DIFFERENTIAL_MODE.offset_index);
        let loc = table
            .locations(&sd, &DYN_ALGEBRAIC_MODE, &[], &[], 0.0)
            .expect("locations");
        assert_eq!(loc.alg_state, &[1.0, 2.0]);
        assert_eq!(loc.diff_state, &[10.0, 20.0]);
        assert_eq!(loc.dstate, &[0.5, 0.6]);
    }

    #[test]
    fn test_max_index_through_table() {
        let mut table = OffsetTable::new();
        {
            let so = table.get_mut(&POWER_FLOW_MODE);
            so.total = StateSizes {
                alg: 3,
                v: 1,
                a: 1,
                ..Default::default()
            };
            so.set_offset(4);
        }
        // v at 4, a at 5, alg at 6..9
        assert_eq!(table.max_index(&POWER_FLOW_MODE), 9);
    }
}
