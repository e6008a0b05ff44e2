//! Verification routines: Jacobian finite-difference checking,
//! residual/algebraic/derivative consistency checks, and structural
//! object-tree comparison.
//!
//! These run in tests and under verbose logging during failure recovery.

use crate::simulation::Simulation;
use psd_core::{
    ComponentArena, ComponentId, SolverMode, StateData, TripletMatrix,
};
use std::collections::HashMap;
use tracing::debug;

/// Finite-difference perturbation sizes.
const DELTA1: f64 = 1e-8;
const DELTA2: f64 = 1e-10;
/// Relative error floor below which disagreements are ignored.
const REL_TOL: f64 = 2e-4;

/// One reported Jacobian discrepancy.
#[derive(Debug, Clone)]
pub struct JacobianIssue {
    pub row: usize,
    pub col: usize,
    pub analytic: f64,
    pub estimate1: f64,
    pub estimate2: f64,
    /// The analytical Jacobian omitted an entry finite differences found
    pub missing: bool,
}

/// Compare the analytical Jacobian of a mode against finite differences.
///
/// Returns the surviving discrepancies; an empty vector means the Jacobian
/// checks out under the acceptance rules.
pub fn jacobian_check(sim: &mut Simulation, mode: &SolverMode, tol: f64) -> Vec<JacobianIssue> {
    let index = sim.handle_index(mode);
    let handle = sim.solvers[index].as_ref().unwrap();
    let state = handle.state.clone();
    let dstate = handle.dstate.clone();
    let time = sim.current_time;
    let n = state.len();
    let cj = 1.0;

    let eval = |arena: &ComponentArena,
                root: ComponentId,
                s: &[f64],
                ds: &[f64]|
     -> Option<Vec<f64>> {
        let mut sd = StateData::new(time, s, Some(ds), 0);
        sd.cj = cj;
        let mut resid = vec![0.0; n];
        arena.residual(root, &sd, &mut resid, mode).ok()?;
        Some(resid)
    };

    let mut analytic: HashMap<(usize, usize), f64> = HashMap::new();
    {
        let mut sd = StateData::new(time, &state, Some(&dstate), 0);
        sd.cj = cj;
        let mut jac = TripletMatrix::new(n, n);
        sim.arena.jacobian_elements(sim.root, &sd, &mut jac, mode);
        jac.compact();
        for &(r, c, v) in jac.entries() {
            analytic.insert((r, c), v);
        }
    }

    let Some(base_resid) = eval(&sim.arena, sim.root, &state, &dstate) else {
        return Vec::new();
    };

    let mut issues = Vec::new();
    for col in 0..n {
        let fd_column = |delta: f64| -> Option<Vec<f64>> {
            let mut pert = state.clone();
            pert[col] += delta;
            let resid = eval(&sim.arena, sim.root, &pert, &dstate)?;
            Some(
                resid
                    .iter()
                    .zip(base_resid.iter())
                    .map(|(r, b)| (r - b) / delta)
                    .collect(),
            )
        };
        let Some(mut col1) = fd_column(DELTA1) else { continue };
        let Some(mut col2) = fd_column(DELTA2) else { continue };

        if mode.is_dae() {
            // derivative perturbations contribute through cj
            let fd_deriv = |delta: f64| -> Option<Vec<f64>> {
                let mut pert = dstate.clone();
                pert[col] += delta;
                let resid = eval(&sim.arena, sim.root, &state, &pert)?;
                Some(
                    resid
                        .iter()
                        .zip(base_resid.iter())
                        .map(|(r, b)| cj * (r - b) / delta)
                        .collect(),
                )
            };
            if let (Some(d1), Some(d2)) = (fd_deriv(DELTA1), fd_deriv(DELTA2)) {
                for (c, d) in col1.iter_mut().zip(d1.iter()) {
                    *c += d;
                }
                for (c, d) in col2.iter_mut().zip(d2.iter()) {
                    *c += d;
                }
            }
        }

        for row in 0..n {
            let j1 = col1[row];
            let j2 = col2[row];
            match analytic.get(&(row, col)) {
                Some(&ja) => {
                    if accepts(ja, j1, j2, tol) {
                        continue;
                    }
                    issues.push(JacobianIssue {
                        row,
                        col,
                        analytic: ja,
                        estimate1: j1,
                        estimate2: j2,
                        missing: false,
                    });
                }
                None => {
                    // entries the analytical Jacobian omits but finite
                    // differences find above tolerance
                    if j1.abs() > tol && j2.abs() > tol {
                        issues.push(JacobianIssue {
                            row,
                            col,
                            analytic: 0.0,
                            estimate1: j1,
                            estimate2: j2,
                            missing: true,
                        });
                    }
                }
            }
        }
    }
    debug!(issues = issues.len(), "Jacobian check complete");
    issues
}

/// The acceptance rules for a single analytical entry against the two
/// finite-difference estimates.
fn accepts(ja: f64, j1: f64, j2: f64, tol: f64) -> bool {
    let err1 = (ja - j1).abs();
    let err2 = (ja - j2).abs();
    if err1 <= tol || err2 <= tol {
        return true;
    }
    let scale = ja.abs().max(j1.abs()).max(1.0);
    if err1 / scale <= REL_TOL {
        return true;
    }
    // the smaller-delta estimate converged toward the analytic value
    if err2 * 10.0 <= err1 && ja.abs() < tol {
        return true;
    }
    // oscillatory convergence: the estimates bracket the analytic value
    if (j1 - ja).signum() != (j2 - ja).signum() {
        return true;
    }
    // first-delta estimate dominated by truncation
    if err1 > 0.0 && err2 / err1 > 30.0 {
        return true;
    }
    // large entries agreeing to a relative margin
    if ja.abs() > 10.0 && j1.abs() > 10.0 && err1 < tol * ja.abs() / 10.0 {
        return true;
    }
    false
}

/// Residual entries above `tol` at the current solver state.
pub fn residual_check(sim: &mut Simulation, mode: &SolverMode, tol: f64) -> Vec<(usize, f64)> {
    let index = sim.handle_index(mode);
    let handle = sim.solvers[index].as_ref().unwrap();
    let state = handle.state.clone();
    let dstate = handle.dstate.clone();
    let n = state.len();
    let sd = StateData::new(sim.current_time, &state, Some(&dstate), 0);
    let mut resid = vec![0.0; n];
    if sim.arena.residual(sim.root, &sd, &mut resid, mode).is_err() {
        return vec![(usize::MAX, f64::NAN)];
    }
    resid
        .into_iter()
        .enumerate()
        .filter(|(_, r)| r.abs() > tol)
        .collect()
}

/// Algebraic-update entries that disagree with the current state.
pub fn algebraic_check(sim: &mut Simulation, mode: &SolverMode, tol: f64) -> Vec<(usize, f64)> {
    let index = sim.handle_index(mode);
    let handle = sim.solvers[index].as_ref().unwrap();
    let state = handle.state.clone();
    let n = state.len();
    let sd = StateData::new(sim.current_time, &state, None, 0);
    let mut update = state.clone();
    sim.arena
        .algebraic_update(sim.root, &sd, &mut update, mode, 1.0);
    let mut var_types = vec![0.0; n];
    sim.arena.variable_types(sim.root, mode, &mut var_types);
    state
        .iter()
        .zip(update.iter())
        .enumerate()
        .filter(|(k, _)| var_types[*k] != psd_core::DIFFERENTIAL_VARIABLE)
        .filter(|(_, (s, u))| (*s - *u).abs() > tol)
        .map(|(k, (s, u))| (k, s - u))
        .collect()
}

/// Derivative entries that disagree with the stored derivative vector.
pub fn derivative_check(sim: &mut Simulation, mode: &SolverMode, tol: f64) -> Vec<(usize, f64)> {
    let index = sim.handle_index(mode);
    let handle = sim.solvers[index].as_ref().unwrap();
    let state = handle.state.clone();
    let dstate = handle.dstate.clone();
    let n = state.len();
    let sd = StateData::new(sim.current_time, &state, Some(&dstate), 0);
    let mut deriv = vec![0.0; n];
    if sim
        .arena
        .derivative(sim.root, &sd, &mut deriv, mode)
        .is_err()
    {
        return vec![(usize::MAX, f64::NAN)];
    }
    let mut var_types = vec![0.0; n];
    sim.arena.variable_types(sim.root, mode, &mut var_types);
    deriv
        .into_iter()
        .enumerate()
        .filter(|(k, _)| var_types[*k] == psd_core::DIFFERENTIAL_VARIABLE)
        .filter(|(k, d)| (d - dstate[*k]).abs() > tol)
        .map(|(k, d)| (k, d - dstate[k]))
        .collect()
}

/// Structural deep comparison of two object trees: name, type, sub-object
/// count, and recursive sub-object correspondence. Used after clone.
pub fn check_object_equivalence(
    arena_a: &ComponentArena,
    id_a: ComponentId,
    arena_b: &ComponentArena,
    id_b: ComponentId,
) -> bool {
    let (Some(a), Some(b)) = (arena_a.get(id_a), arena_b.get(id_b)) else {
        return false;
    };
    if a.base.name != b.base.name {
        return false;
    }
    if a.kind.model().type_name() != b.kind.model().type_name() {
        return false;
    }
    let children_a = arena_a.children(id_a);
    let children_b = arena_b.children(id_b);
    if children_a.len() != children_b.len() {
        return false;
    }
    children_a
        .into_iter()
        .zip(children_b)
        .all(|(ca, cb)| check_object_equivalence(arena_a, ca, arena_b, cb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use psd_core::{Component, ComponentKind};
    use psd_core::models::{Area, Bus};

    #[test]
    fn test_acceptance_rules() {
        // plain agreement
        assert!(accepts(2.0, 2.0 + 1e-10, 2.0 + 1e-12, 1e-6));
        // bracketing estimates
        assert!(accepts(2.0, 2.5, 1.5, 1e-6));
        // large entries within the relative margin
        assert!(accepts(100.0, 100.0 + 1e-6, 100.0 + 5.0, 1e-5));
        // genuine disagreement
        assert!(!accepts(2.0, 5.0, 5.0, 1e-6));
    }

    #[test]
    fn test_object_equivalence() {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("grid", ComponentKind::Area(Area::default())));
        arena
            .add_sub_object(root, Component::new("bus1", ComponentKind::Bus(Bus::default())))
            .unwrap();

        let copy = arena.clone();
        assert!(check_object_equivalence(&arena, root, &copy, root));

        let mut other = ComponentArena::new();
        let other_root =
            other.insert(Component::new("grid", ComponentKind::Area(Area::default())));
        assert!(!check_object_equivalence(&arena, root, &other, other_root));
    }
}
