//! Solver bridge: the boundary between the component tree and the numeric
//! iteration layer.
//!
//! The driver owns one [`SolverHandle`] per active [`SolverMode`]. A handle
//! wraps either a damped Newton algebraic solver or an implicit integrator;
//! both call back into the tree through a [`SolverClient`] and speak the
//! shared return-code vocabulary (`SOLVER_ROOT_FOUND`,
//! `SOLVER_INVALID_STATE_ERROR`, ...).

pub mod integrator;
pub mod newton;

pub use integrator::ImplicitIntegrator;
pub use newton::NewtonSolver;

use psd_core::{SolverMode, TripletMatrix, SOLVER_INITIAL_SETUP_ERROR};
use serde::{Deserialize, Serialize};

/// Callbacks the solvers use to evaluate the system.
pub trait SolverClient {
    /// Problem size (state vector length).
    fn size(&self) -> usize;

    /// Residual evaluation; non-zero return requests a smaller step.
    fn residual(&mut self, time: f64, state: &[f64], dstate: &[f64], cj: f64, resid: &mut [f64])
        -> i32;

    /// Jacobian triplets, including `-cj` terms on derivative rows.
    fn jacobian(
        &mut self,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        cj: f64,
        jac: &mut TripletMatrix,
    ) -> i32;

    /// Number of root functions.
    fn root_count(&self) -> usize {
        0
    }

    /// Root function evaluation.
    fn roots(&mut self, _time: f64, _state: &[f64], _dstate: &[f64], _out: &mut [f64]) -> i32 {
        0
    }

    /// Mark differential variable positions with 1.0.
    fn variable_types(&self, _out: &mut [f64]) {}
}

/// Initial-condition computation styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcMode {
    /// Hold differential states, solve algebraic states, then derive the
    /// differential derivatives.
    FixedMaskedAndDeriv,
    /// Hold differential states, solve algebraic states only.
    FixedDiff,
}

/// Per-handle numeric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            tolerance: 1e-8,
            max_iterations: 50,
            initial_step: 0.01,
            min_step: 1e-9,
            max_step: 30.0,
        }
    }
}

#[derive(Debug, Clone)]
enum Engine {
    Newton(NewtonSolver),
    Integrator(ImplicitIntegrator),
}

/// One solver instance bound to a mode, owning its state vectors.
#[derive(Debug, Clone)]
pub struct SolverHandle {
    pub mode: SolverMode,
    pub config: SolverConfig,
    pub state: Vec<f64>,
    pub dstate: Vec<f64>,
    pub current_time: f64,
    pub last_error: Option<String>,
    allocated: bool,
    engine: Engine,
}

impl SolverHandle {
    /// Handle for a pure nonlinear (algebraic) solve.
    pub fn algebraic(mode: SolverMode) -> Self {
        SolverHandle {
            mode,
            config: SolverConfig::default(),
            state: Vec::new(),
            dstate: Vec::new(),
            current_time: 0.0,
            last_error: None,
            allocated: false,
            engine: Engine::Newton(NewtonSolver::default()),
        }
    }

    /// Handle for time integration (DAE or differential-only).
    pub fn integrator(mode: SolverMode) -> Self {
        SolverHandle {
            mode,
            config: SolverConfig::default(),
            state: Vec::new(),
            dstate: Vec::new(),
            current_time: 0.0,
            last_error: None,
            allocated: false,
            engine: Engine::Integrator(ImplicitIntegrator::default()),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn size(&self) -> usize {
        self.state.len()
    }

    /// Size (or resize) the state vectors and root bookkeeping.
    pub fn allocate(&mut self, size: usize, roots: usize) {
        self.state.resize(size, 0.0);
        self.dstate.resize(size, 0.0);
        if let Engine::Integrator(integ) = &mut self.engine {
            integ.allocate(roots);
        }
        self.allocated = true;
    }

    fn setup_guard(&mut self, client: &dyn SolverClient) -> Option<i32> {
        if !self.allocated || self.state.len() != client.size() {
            self.last_error = Some("solver used before allocation".into());
            return Some(SOLVER_INITIAL_SETUP_ERROR);
        }
        None
    }

    /// Solve the algebraic system at `time`. Returns 0 on success or a
    /// negative solver code.
    pub fn solve_algebraic(&mut self, client: &mut dyn SolverClient, time: f64) -> i32 {
        if let Some(code) = self.setup_guard(client) {
            return code;
        }
        let Engine::Newton(newton) = &mut self.engine else {
            self.last_error = Some("algebraic solve on an integrator handle".into());
            return SOLVER_INITIAL_SETUP_ERROR;
        };
        let code = newton.solve(
            client,
            time,
            &mut self.state,
            &self.dstate,
            &self.config,
            None,
        );
        if code < 0 {
            self.last_error = Some(newton.last_error().to_string());
        } else {
            self.current_time = time;
        }
        code
    }

    /// Advance the integration toward `t_stop`. Returns the reached time
    /// plus a code: 0, `SOLVER_ROOT_FOUND`, or a negative failure.
    pub fn solve_to(&mut self, client: &mut dyn SolverClient, t_stop: f64) -> (f64, i32) {
        if let Some(code) = self.setup_guard(client) {
            return (self.current_time, code);
        }
        let Engine::Integrator(integ) = &mut self.engine else {
            self.last_error = Some("time integration on an algebraic handle".into());
            return (self.current_time, SOLVER_INITIAL_SETUP_ERROR);
        };
        let (reached, code) = integ.integrate(
            client,
            self.current_time,
            t_stop,
            &mut self.state,
            &mut self.dstate,
            &self.config,
        );
        self.current_time = reached;
        if code < 0 {
            self.last_error = Some(integ.last_error().to_string());
        }
        (reached, code)
    }

    /// Compute consistent initial conditions.
    pub fn calc_ic(&mut self, client: &mut dyn SolverClient, time: f64, ic_mode: IcMode) -> i32 {
        if let Some(code) = self.setup_guard(client) {
            return code;
        }
        let mut var_types = vec![0.0; self.state.len()];
        client.variable_types(&mut var_types);

        let code = {
            let newton = match &mut self.engine {
                Engine::Newton(n) => n,
                Engine::Integrator(i) => i.corrector_mut(),
            };
            newton.solve(
                client,
                time,
                &mut self.state,
                &self.dstate,
                &self.config,
                Some(&var_types),
            )
        };
        if code < 0 {
            self.last_error = Some("initial condition computation failed".into());
            return code;
        }
        if ic_mode == IcMode::FixedMaskedAndDeriv {
            // with dstate = 0 the differential residual rows equal f(x)
            let mut resid = vec![0.0; self.state.len()];
            let zero_ds = vec![0.0; self.state.len()];
            let rcode = client.residual(time, &self.state, &zero_ds, 0.0, &mut resid);
            if rcode != 0 {
                return rcode;
            }
            for (k, vt) in var_types.iter().enumerate() {
                if *vt == psd_core::DIFFERENTIAL_VARIABLE {
                    self.dstate[k] = resid[k];
                } else {
                    self.dstate[k] = 0.0;
                }
            }
        }
        self.current_time = time;
        0
    }

    /// Which root functions crossed on the last `SOLVER_ROOT_FOUND` return.
    pub fn root_mask(&self) -> Vec<bool> {
        match &self.engine {
            Engine::Integrator(integ) => integ.root_mask().to_vec(),
            Engine::Newton(_) => Vec::new(),
        }
    }

    /// Reset root bookkeeping after a discontinuity.
    pub fn reset_roots(&mut self) {
        if let Engine::Integrator(integ) = &mut self.engine {
            integ.reset_roots();
        }
    }

    /// The last error string, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psd_core::{MatrixData, POWER_FLOW_MODE};

    struct Quadratic;

    impl SolverClient for Quadratic {
        fn size(&self) -> usize {
            1
        }

        fn residual(
            &mut self,
            _time: f64,
            state: &[f64],
            _dstate: &[f64],
            _cj: f64,
            resid: &mut [f64],
        ) -> i32 {
            resid[0] = state[0] * state[0] - 4.0;
            0
        }

        fn jacobian(
            &mut self,
            _time: f64,
            state: &[f64],
            _dstate: &[f64],
            _cj: f64,
            jac: &mut TripletMatrix,
        ) -> i32 {
            jac.assign(0, 0, 2.0 * state[0]);
            0
        }
    }

    #[test]
    fn test_unallocated_handle_errors() {
        let mut handle = SolverHandle::algebraic(POWER_FLOW_MODE);
        let code = handle.solve_algebraic(&mut Quadratic, 0.0);
        assert_eq!(code, SOLVER_INITIAL_SETUP_ERROR);
        assert!(handle.last_error().is_some());
    }

    #[test]
    fn test_algebraic_solve() {
        let mut handle = SolverHandle::algebraic(POWER_FLOW_MODE);
        handle.allocate(1, 0);
        handle.state[0] = 1.0;
        let code = handle.solve_algebraic(&mut Quadratic, 0.0);
        assert_eq!(code, 0);
        assert!((handle.state[0] - 2.0).abs() < 1e-8);
    }
}
