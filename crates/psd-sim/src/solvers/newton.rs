//! Damped Newton iteration over the tree residual.
//!
//! The Jacobian is assembled as sparse triplets and factored dense through
//! faer's partial-pivot LU; power-system Jacobians at this scale solve
//! comfortably dense while keeping the assembly path sparse.

use super::{SolverClient, SolverConfig};
use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use psd_core::{TripletMatrix, DIFFERENTIAL_VARIABLE, SOLVER_CONVERGENCE_ERROR,
    SOLVER_INVALID_STATE_ERROR};

#[derive(Debug, Clone, Default)]
pub struct NewtonSolver {
    last_error: String,
    pub iterations: usize,
}

impl NewtonSolver {
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Solve `F(time, x, dstate) = 0` for `x`. When `freeze_mask` is given,
    /// entries marked [`DIFFERENTIAL_VARIABLE`] are held fixed (their rows
    /// are replaced by identity), which is the fixed-differential initial
    /// condition solve.
    pub fn solve(
        &mut self,
        client: &mut dyn SolverClient,
        time: f64,
        state: &mut [f64],
        dstate: &[f64],
        config: &SolverConfig,
        freeze_mask: Option<&[f64]>,
    ) -> i32 {
        let n = state.len();
        if n == 0 {
            self.iterations = 0;
            return 0;
        }
        let mut resid = vec![0.0; n];
        let mut jac = TripletMatrix::new(n, n);

        for iter in 0..config.max_iterations {
            self.iterations = iter + 1;
            let rcode = client.residual(time, state, dstate, 0.0, &mut resid);
            if rcode != 0 {
                self.last_error = "residual evaluation reported an invalid state".into();
                return SOLVER_INVALID_STATE_ERROR;
            }
            if let Some(mask) = freeze_mask {
                for (k, vt) in mask.iter().enumerate() {
                    if *vt == DIFFERENTIAL_VARIABLE {
                        resid[k] = 0.0;
                    }
                }
            }
            let max_resid = resid.iter().fold(0.0f64, |m, r| m.max(r.abs()));
            if max_resid < config.tolerance {
                return 0;
            }

            jac.clear();
            let jcode = client.jacobian(time, state, dstate, 0.0, &mut jac);
            if jcode != 0 {
                self.last_error = "Jacobian evaluation failed".into();
                return SOLVER_INVALID_STATE_ERROR;
            }
            jac.compact();
            let delta = match self.solve_linear(&jac, &resid, freeze_mask) {
                Ok(d) => d,
                Err(msg) => {
                    self.last_error = msg;
                    return SOLVER_CONVERGENCE_ERROR;
                }
            };

            // damped update: cap the voltage/angle style step magnitude
            let max_delta = delta.iter().fold(0.0f64, |m, d| m.max(d.abs()));
            let damp = if max_delta > 1.0 { 1.0 / max_delta } else { 1.0 };
            for (x, d) in state.iter_mut().zip(delta.iter()) {
                *x -= damp * d;
            }
        }

        self.last_error = format!(
            "Newton iteration did not converge in {} iterations",
            config.max_iterations
        );
        SOLVER_CONVERGENCE_ERROR
    }

    /// Solve `J delta = resid` densely through faer LU.
    fn solve_linear(
        &self,
        jac: &TripletMatrix,
        resid: &[f64],
        freeze_mask: Option<&[f64]>,
    ) -> Result<Vec<f64>, String> {
        let n = resid.len();
        let mut mat = Mat::<f64>::zeros(n, n);
        for &(r, c, v) in jac.entries() {
            mat.write(r, c, mat.read(r, c) + v);
        }
        if let Some(mask) = freeze_mask {
            // frozen rows become identity so delta stays zero there
            for (k, vt) in mask.iter().enumerate() {
                if *vt == DIFFERENTIAL_VARIABLE {
                    for c in 0..n {
                        mat.write(k, c, 0.0);
                    }
                    for r in 0..n {
                        mat.write(r, k, 0.0);
                    }
                    mat.write(k, k, 1.0);
                }
            }
        }
        let mut rhs = Mat::<f64>::zeros(n, 1);
        for (i, r) in resid.iter().enumerate() {
            rhs.write(i, 0, *r);
        }
        let lu = mat.partial_piv_lu();
        let solution = lu.solve(&rhs);
        let delta: Vec<f64> = (0..n).map(|i| solution.read(i, 0)).collect();
        if delta.iter().any(|d| !d.is_finite()) {
            return Err("singular Jacobian matrix".into());
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psd_core::MatrixData;

    struct Coupled;

    impl SolverClient for Coupled {
        fn size(&self) -> usize {
            2
        }

        fn residual(
            &mut self,
            _time: f64,
            state: &[f64],
            _dstate: &[f64],
            _cj: f64,
            resid: &mut [f64],
        ) -> i32 {
            // x^2 + y = 3, x + y = 2  =>  x = 1 or -2
            resid[0] = state[0] * state[0] + state[1] - 3.0;
            resid[1] = state[0] + state[1] - 2.0;
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
            jac.assign(0, 1, 1.0);
            jac.assign(1, 0, 1.0);
            jac.assign(1, 1, 1.0);
            0
        }
    }

    #[test]
    fn test_coupled_system() {
        let mut newton = NewtonSolver::default();
        let mut state = vec![2.0, 0.0];
        let code = newton.solve(
            &mut Coupled,
            0.0,
            &mut state,
            &[0.0, 0.0],
            &SolverConfig::default(),
            None,
        );
        assert_eq!(code, 0);
        assert!((state[0] - 1.0).abs() < 1e-7);
        assert!((state[1] - 1.0).abs() < 1e-7);
    }

    #[test]
    fn test_freeze_mask_holds_variables() {
        let mut newton = NewtonSolver::default();
        let mut state = vec![2.0, 0.5];
        let mask = vec![0.0, DIFFERENTIAL_VARIABLE];
        let code = newton.solve(
            &mut Coupled,
            0.0,
            &mut state,
            &[0.0, 0.0],
            &SolverConfig::default(),
            Some(&mask),
        );
        assert_eq!(code, 0);
        // y held at 0.5; x solves x^2 = 2.5
        assert!((state[1] - 0.5).abs() < 1e-12);
        assert!((state[0] - 2.5f64.sqrt()).abs() < 1e-7);
    }

    #[test]
    fn test_singular_system_reports_convergence_error() {
        struct Singular;
        impl SolverClient for Singular {
            fn size(&self) -> usize {
                1
            }
            fn residual(
                &mut self,
                _t: f64,
                _s: &[f64],
                _d: &[f64],
                _cj: f64,
                resid: &mut [f64],
            ) -> i32 {
                resid[0] = 1.0;
                0
            }
            fn jacobian(
                &mut self,
                _t: f64,
                _s: &[f64],
                _d: &[f64],
                _cj: f64,
                _jac: &mut TripletMatrix,
            ) -> i32 {
                0
            }
        }
        let mut newton = NewtonSolver::default();
        let mut state = vec![0.0];
        let code = newton.solve(
            &mut Singular,
            0.0,
            &mut state,
            &[0.0],
            &SolverConfig::default(),
            None,
        );
        assert_eq!(code, SOLVER_CONVERGENCE_ERROR);
    }
}
