//! Riccati-style backward recursion producing a new linear-Gaussian
//! controller under a KL trust region.
//!
//! The trust region enters through the dual variable η: the recursion runs
//! on the augmented cost `c / η - log p_prev(a | x)`, so the quadratic and
//! linear terms of the previous controller's log-density are added to the
//! scaled cost at every step. As η grows the augmented cost is dominated by
//! the previous controller and the solution collapses onto it; as η shrinks
//! the recursion approaches plain LQR.
//!
//! With a per-step constraint every step has its own η. The value recursion
//! then runs on the raw cost and only the action block of step `t` is
//! augmented, as `Q / η_t - log p_prev(a | x)`.
//!
//! The minimax variant eliminates a responder block first (maximizing the
//! role-centric objective over it) and then completes the square over the
//! optimized block of the reduced quadratic.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::config::{RegularizationConfig, Role};
use crate::error::SingularControlCostError;
use crate::linalg::{block, segment, select, select_vec, shifted_cholesky, symmetrize};
use crate::types::{LinearGaussianController, LinearGaussianStep, LocalModel};

/// Layout of the stacked `[x; u; v]` vector in robust mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameLayout {
    pub state_dim: usize,
    pub action_dim: usize,
    pub disturbance_dim: usize,
}

impl GameLayout {
    fn indices(&self, role: Role) -> Vec<usize> {
        let start = self.state_dim;
        match role {
            Role::Protagonist => (start..start + self.action_dim).collect(),
            Role::Antagonist => {
                let start = start + self.action_dim;
                (start..start + self.disturbance_dim).collect()
            }
        }
    }
}

/// Best response of the eliminated player at one step, as an affine
/// function of the state.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub gain: DMatrix<f64>,
    pub bias: DVector<f64>,
}

/// Output of the minimax recursion.
#[derive(Clone, Debug)]
pub struct MinimaxSolution {
    /// New controller of the optimized role.
    pub controller: LinearGaussianController,
    /// Best response of the other role assumed by the recursion.
    pub response: Vec<Response>,
}

/// Backward recursion with bounded control-block regularization.
pub struct BackwardPass<'a> {
    reg: &'a RegularizationConfig,
}

struct Blocks<'a> {
    state_dim: usize,
    optimized: &'a [usize],
    responder: &'a [usize],
    sign: f64,
}

/// Where the trust region enters the recursion.
#[derive(Clone, Copy)]
enum Dual<'e> {
    /// Plain LQR.
    Unconstrained,
    /// One η over the whole trajectory.
    Total(&'e LinearGaussianController, f64),
    /// One η per step.
    PerStep(&'e LinearGaussianController, &'e [f64]),
}

impl<'e> Dual<'e> {
    fn new(prev: Option<&'e LinearGaussianController>, eta: f64) -> Self {
        prev.map_or(Self::Unconstrained, |prev| Self::Total(prev, eta))
    }
}

/// η of step `t`. Steps without an entry keep the previous controller.
fn eta_at(etas: &[f64], t: usize) -> f64 {
    etas.get(t).copied().unwrap_or(f64::INFINITY)
}

impl<'a> BackwardPass<'a> {
    pub const fn new(reg: &'a RegularizationConfig) -> Self {
        Self { reg }
    }

    /// Standard pass over the full action block.
    ///
    /// With `prev = None` the plain LQR recursion is run and `eta` is ignored.
    pub fn run(
        &self,
        model: &LocalModel,
        prev: Option<&LinearGaussianController>,
        eta: f64,
    ) -> Result<LinearGaussianController, SingularControlCostError> {
        let Some(first) = model.dynamics.first() else {
            return Ok(LinearGaussianController::from_steps(Vec::new()));
        };
        let n = first.state_dim();
        let optimized: Vec<usize> = (n..n + first.action_dim()).collect();
        let blocks = Blocks {
            state_dim: n,
            optimized: &optimized,
            responder: &[],
            sign: 1.0,
        };
        self.recurse(model, &blocks, Dual::new(prev, eta))
            .map(|(controller, _)| controller)
    }

    /// Standard pass with one η per step; `etas[t]` weighs step `t`.
    pub fn run_per_step(
        &self,
        model: &LocalModel,
        prev: &LinearGaussianController,
        etas: &[f64],
    ) -> Result<LinearGaussianController, SingularControlCostError> {
        let Some(first) = model.dynamics.first() else {
            return Ok(LinearGaussianController::from_steps(Vec::new()));
        };
        let n = first.state_dim();
        let optimized: Vec<usize> = (n..n + first.action_dim()).collect();
        let blocks = Blocks {
            state_dim: n,
            optimized: &optimized,
            responder: &[],
            sign: 1.0,
        };
        self.recurse(model, &blocks, Dual::PerStep(prev, etas))
            .map(|(controller, _)| controller)
    }

    /// Saddle-point pass for `role` against a best-responding opponent.
    ///
    /// `prev` is the previous controller of `role` only.
    pub fn run_minimax(
        &self,
        model: &LocalModel,
        layout: GameLayout,
        role: Role,
        prev: Option<&LinearGaussianController>,
        eta: f64,
    ) -> Result<MinimaxSolution, SingularControlCostError> {
        let optimized = layout.indices(role);
        let responder = layout.indices(role.other());
        let blocks = Blocks {
            state_dim: layout.state_dim,
            optimized: &optimized,
            responder: &responder,
            sign: role.sign(),
        };
        let (controller, response) = self.recurse(model, &blocks, Dual::new(prev, eta))?;
        Ok(MinimaxSolution {
            controller,
            response,
        })
    }

    /// Saddle-point pass for `role` with one η per step.
    pub fn run_minimax_per_step(
        &self,
        model: &LocalModel,
        layout: GameLayout,
        role: Role,
        prev: &LinearGaussianController,
        etas: &[f64],
    ) -> Result<MinimaxSolution, SingularControlCostError> {
        let optimized = layout.indices(role);
        let responder = layout.indices(role.other());
        let blocks = Blocks {
            state_dim: layout.state_dim,
            optimized: &optimized,
            responder: &responder,
            sign: role.sign(),
        };
        let (controller, response) =
            self.recurse(model, &blocks, Dual::PerStep(prev, etas))?;
        Ok(MinimaxSolution {
            controller,
            response,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn recurse(
        &self,
        model: &LocalModel,
        blocks: &Blocks<'_>,
        dual: Dual<'_>,
    ) -> Result<(LinearGaussianController, Vec<Response>), SingularControlCostError> {
        let horizon = model.horizon();
        let n = blocks.state_dim;
        let o = blocks.optimized.len();
        let z_idx: Vec<usize> = (0..n).chain(blocks.optimized.iter().copied()).collect();
        let local_idx: Vec<usize> = (0..n + o).collect();
        let cost_scale = match dual {
            Dual::Total(_, eta) => blocks.sign / eta,
            Dual::Unconstrained | Dual::PerStep(..) => blocks.sign,
        };

        let mut steps = Vec::with_capacity(horizon);
        let mut responses = Vec::with_capacity(horizon);
        let mut vxx = DMatrix::<f64>::zeros(n, n);
        let mut vx = DVector::<f64>::zeros(n);

        for t in (0..horizon).rev() {
            let cost = &model.costs[t];
            let mut qtt = &cost.cm * cost_scale;
            let mut qt = &cost.cv * cost_scale;

            if let Dual::Total(prev, _) = dual {
                add_kl_penalty(&mut qtt, &mut qt, prev.step(t), &z_idx, n);
            }

            if t + 1 < horizon {
                let dyn_t = &model.dynamics[t];
                let ft_vxx = dyn_t.fm.transpose() * &vxx;
                qtt += &ft_vxx * &dyn_t.fm;
                qt += dyn_t.fm.transpose() * &vx + &ft_vxx * &dyn_t.fv;
            }
            let qtt = symmetrize(&qtt);

            // Eliminate the responder: z = [x; optimized].
            let (q_zz, q_z, response) = if blocks.responder.is_empty() {
                (select(&qtt, &z_idx, &z_idx), select_vec(&qt, &z_idx), None)
            } else {
                let q_ff = select(&qtt, blocks.responder, blocks.responder);
                let concave = shifted_cholesky(&(-&q_ff), self.reg).map_err(|last_shift| {
                    SingularControlCostError {
                        t,
                        attempts: self.reg.max_attempts,
                        last_shift,
                    }
                })?;
                if concave.shift > 0.0 {
                    debug!(t, shift = concave.shift, "Regularized responder block");
                }
                let q_fz = select(&qtt, blocks.responder, &z_idx);
                let q_f = select_vec(&qt, blocks.responder);
                let gain_z = concave.factor.solve(&q_fz);
                let bias = concave.factor.solve(&q_f);
                let q_zz = select(&qtt, &z_idx, &z_idx) + q_fz.transpose() * &gain_z;
                let q_z = select_vec(&qt, &z_idx) + q_fz.transpose() * &bias;
                (symmetrize(&q_zz), q_z, Some((gain_z, bias)))
            };

            let quu = block(&q_zz, n, n, o, o);
            let qux = block(&q_zz, n, 0, o, n);
            let qxx = block(&q_zz, 0, 0, n, n);
            let qu = segment(&q_z, n, o);
            let qx = segment(&q_z, 0, n);

            // Action block the controller is solved from.
            let (pol_uu, pol_ux, pol_u) = if let Dual::PerStep(prev, etas) = dual {
                let eta = eta_at(etas, t);
                let mut aug_zz = &q_zz / eta;
                let mut aug_z = &q_z / eta;
                add_kl_penalty(&mut aug_zz, &mut aug_z, prev.step(t), &local_idx, n);
                (
                    symmetrize(&block(&aug_zz, n, n, o, o)),
                    block(&aug_zz, n, 0, o, n),
                    segment(&aug_z, n, o),
                )
            } else {
                (quu.clone(), qux.clone(), qu.clone())
            };

            let chol = shifted_cholesky(&pol_uu, self.reg).map_err(|last_shift| {
                SingularControlCostError {
                    t,
                    attempts: self.reg.max_attempts,
                    last_shift,
                }
            })?;
            if chol.shift > 0.0 {
                debug!(t, shift = chol.shift, "Regularized control block");
            }

            let gain = -chol.factor.solve(&pol_ux);
            let bias = -chol.factor.solve(&pol_u);
            let precision = &pol_uu + DMatrix::<f64>::identity(o, o) * chol.shift;

            // Value function with the completed square written out in full, so
            // it stays consistent with the gains after a diagonal shift.
            let kt_quu = gain.transpose() * &quu;
            let qxu = qux.transpose();
            vxx = symmetrize(&(&qxx + &kt_quu * &gain + &qxu * &gain + gain.transpose() * &qux));
            vx = &qx + &kt_quu * &bias + gain.transpose() * &qu + &qxu * &bias;

            if let Some((gain_z, resp_bias)) = response {
                // f* = G_x x + G_o (K x + k) + g
                let g_x = block(&gain_z, 0, 0, gain_z.nrows(), n);
                let g_o = block(&gain_z, 0, n, gain_z.nrows(), o);
                responses.push(Response {
                    gain: &g_x + &g_o * &gain,
                    bias: &g_o * &bias + resp_bias,
                });
            }

            let step = LinearGaussianStep::from_precision(gain, bias, symmetrize(&precision))
                .ok_or(SingularControlCostError {
                    t,
                    attempts: self.reg.max_attempts,
                    last_shift: chol.shift,
                })?;
            steps.push(step);
        }

        steps.reverse();
        responses.reverse();
        Ok((LinearGaussianController::from_steps(steps), responses))
    }
}

/// Adds `-log p_prev(o | x)` (up to a constant) to the Q-function on the
/// `[x; o]` indices in `z_idx`.
fn add_kl_penalty(
    qtt: &mut DMatrix<f64>,
    qt: &mut DVector<f64>,
    prev: &LinearGaussianStep,
    z_idx: &[usize],
    n: usize,
) {
    let p = &prev.inv_covar;
    let kt_p = prev.gain.transpose() * p;
    let kt_p_k = &kt_p * &prev.gain;
    let p_k = p * &prev.gain;
    let kt_p_bias = &kt_p * &prev.bias;
    let p_bias = p * &prev.bias;

    for (i, &zi) in z_idx.iter().enumerate() {
        for (j, &zj) in z_idx.iter().enumerate() {
            qtt[(zi, zj)] += match (i < n, j < n) {
                (true, true) => kt_p_k[(i, j)],
                (true, false) => -kt_p[(i, j - n)],
                (false, true) => -p_k[(i - n, j)],
                (false, false) => p[(i - n, j - n)],
            };
        }
        qt[zi] += if i < n { kt_p_bias[i] } else { -p_bias[i - n] };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CostQuadratic, DynamicsLinear};
    use approx::assert_relative_eq;

    fn single_step_model(cm: DMatrix<f64>, cv: DVector<f64>, n: usize, m: usize) -> LocalModel {
        LocalModel {
            dynamics: vec![DynamicsLinear {
                fm: DMatrix::zeros(n, n + m),
                fv: DVector::zeros(n),
                covar: DMatrix::zeros(n, n),
            }],
            costs: vec![CostQuadratic { cm, cv, cc: 0.0 }],
        }
    }

    #[test]
    fn single_step_lqr_matches_direct_inverse() {
        let cm = DMatrix::from_row_slice(
            3,
            3,
            &[2.0, 0.1, 0.4, 0.1, 1.0, 0.2, 0.4, 0.2, 3.0],
        );
        let cv = DVector::from_vec(vec![0.1, -0.2, 0.5]);
        let model = single_step_model(cm.clone(), cv.clone(), 2, 1);
        let reg = RegularizationConfig::default();
        let controller = BackwardPass::new(&reg).run(&model, None, 1.0).unwrap();

        let quu_inv = block(&cm, 2, 2, 1, 1).try_inverse().unwrap();
        let expected_k = -&quu_inv * block(&cm, 2, 0, 1, 2);
        let expected_bias = -&quu_inv * segment(&cv, 2, 1);
        let step = controller.step(0);
        assert_relative_eq!(step.gain, expected_k, epsilon = 1e-12);
        assert_relative_eq!(step.bias, expected_bias, epsilon = 1e-12);
        assert_relative_eq!(step.covar, quu_inv, epsilon = 1e-12);
    }

    #[test]
    fn huge_eta_returns_previous_controller() {
        let cm = DMatrix::identity(2, 2) * 2.0;
        let model = single_step_model(cm, DVector::from_vec(vec![0.0, 1.0]), 1, 1);
        let prev_step = LinearGaussianStep::new(
            DMatrix::from_element(1, 1, 0.3),
            DVector::from_element(1, -0.2),
            DMatrix::from_element(1, 1, 0.8),
        )
        .unwrap();
        let prev = LinearGaussianController::from_steps(vec![prev_step.clone()]);
        let reg = RegularizationConfig::default();
        let controller = BackwardPass::new(&reg).run(&model, Some(&prev), 1e12).unwrap();
        let step = controller.step(0);
        assert_relative_eq!(step.gain, prev_step.gain, epsilon = 1e-9);
        assert_relative_eq!(step.bias, prev_step.bias, epsilon = 1e-9);
        assert_relative_eq!(step.covar, prev_step.covar, epsilon = 1e-9);
    }

    #[test]
    fn per_step_eta_matches_total_on_single_step() {
        let cm = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 2.0]);
        let model = single_step_model(cm, DVector::from_vec(vec![0.1, -0.4]), 1, 1);
        let prev = LinearGaussianController::zero(1, 1, 1, 0.5);
        let reg = RegularizationConfig::default();
        let pass = BackwardPass::new(&reg);
        let total = pass.run(&model, Some(&prev), 0.7).unwrap();
        let per_step = pass.run_per_step(&model, &prev, &[0.7]).unwrap();
        assert_relative_eq!(per_step.step(0).gain, total.step(0).gain, epsilon = 1e-12);
        assert_relative_eq!(per_step.step(0).bias, total.step(0).bias, epsilon = 1e-12);
        assert_relative_eq!(per_step.step(0).covar, total.step(0).covar, epsilon = 1e-12);
    }

    #[test]
    fn per_step_eta_pins_only_its_step() {
        let dynamics = DynamicsLinear {
            fm: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            fv: DVector::zeros(1),
            covar: DMatrix::zeros(1, 1),
        };
        let cost = CostQuadratic {
            cm: DMatrix::identity(2, 2),
            cv: DVector::zeros(2),
            cc: 0.0,
        };
        let model = LocalModel {
            dynamics: vec![dynamics; 3],
            costs: vec![cost; 3],
        };
        let prev = LinearGaussianController::zero(3, 1, 1, 1.0);
        let reg = RegularizationConfig::default();
        let controller = BackwardPass::new(&reg)
            .run_per_step(&model, &prev, &[1e-2, 1e12, 1e-2])
            .unwrap();
        assert_relative_eq!(controller.step(1).gain, prev.step(1).gain, epsilon = 1e-9);
        assert_relative_eq!(controller.step(1).covar, prev.step(1).covar, epsilon = 1e-9);
        assert!(controller.step(0).gain[(0, 0)] < -0.1);
        assert!(controller.step(2).covar[(0, 0)] < 0.1);
    }

    #[test]
    fn indefinite_control_block_is_regularized() {
        let cm = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1e-7]);
        let model = single_step_model(cm, DVector::zeros(2), 1, 1);
        let reg = RegularizationConfig::default();
        let controller = BackwardPass::new(&reg).run(&model, None, 1.0).unwrap();
        assert!(controller.step(0).inv_covar[(0, 0)] > 0.0);
    }

    #[test]
    fn regularization_gives_up_after_cap() {
        let cm = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1e6]);
        let model = single_step_model(cm, DVector::zeros(2), 1, 1);
        let reg = RegularizationConfig {
            max_attempts: 3,
            ..RegularizationConfig::default()
        };
        let err = BackwardPass::new(&reg).run(&model, None, 1.0).unwrap_err();
        assert_eq!(err.t, 0);
        assert_eq!(err.attempts, 3);
    }

    #[test]
    fn minimax_without_coupling_matches_standard() {
        // [x; u; v] with v decoupled and concave.
        let cm = DMatrix::from_row_slice(
            3,
            3,
            &[2.0, 0.5, 0.0, 0.5, 2.0, 0.0, 0.0, 0.0, -1.0],
        );
        let model = single_step_model(cm.clone(), DVector::zeros(3), 1, 2);
        let reg = RegularizationConfig::default();
        let layout = GameLayout {
            state_dim: 1,
            action_dim: 1,
            disturbance_dim: 1,
        };
        let robust = BackwardPass::new(&reg)
            .run_minimax(&model, layout, Role::Protagonist, None, 1.0)
            .unwrap();
        let plain_model = single_step_model(block(&cm, 0, 0, 2, 2), DVector::zeros(2), 1, 1);
        let plain = BackwardPass::new(&reg).run(&plain_model, None, 1.0).unwrap();
        assert_relative_eq!(robust.controller.step(0).gain, plain.step(0).gain, epsilon = 1e-12);
        assert_relative_eq!(robust.response[0].gain[(0, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn minimax_rejects_convex_responder() {
        let cm = DMatrix::from_row_slice(
            3,
            3,
            &[2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1e6],
        );
        let model = single_step_model(cm, DVector::zeros(3), 1, 2);
        let reg = RegularizationConfig {
            max_attempts: 2,
            ..RegularizationConfig::default()
        };
        let layout = GameLayout {
            state_dim: 1,
            action_dim: 1,
            disturbance_dim: 1,
        };
        assert!(
            BackwardPass::new(&reg)
                .run_minimax(&model, layout, Role::Protagonist, None, 1.0)
                .is_err()
        );
    }
}
