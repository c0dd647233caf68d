use log::{debug, warn};
use ndarray::{Array, Array1, Array2, Zip};
use ndarray_rand::rand::Rng;
use num_traits::clamp;
use rand_xoshiro::Xoshiro256Plus;

use linfa::prelude::Float;

use crate::parameters::Optimizer;

/// Outcome of one gradient-descent run over the packed log-hyperparameters.
pub(crate) struct TrainingOutcome<F: Float> {
    /// Final packed parameters
    pub params: Array1<F>,
    /// Loss evaluated at `params`
    pub loss: F,
    /// Loss recorded at the start of each iteration, `n_iters` entries
    pub history: Vec<F>,
}

/// Adam update rule with bias-corrected first and second moment estimates.
pub(crate) struct Adam<F: Float> {
    learning_rate: F,
    beta1: F,
    beta2: F,
    eps: F,
    m: Array1<F>,
    v: Array1<F>,
    t: usize,
}

impl<F: Float> Adam<F> {
    pub fn new(learning_rate: F, n: usize) -> Self {
        Adam {
            learning_rate,
            beta1: F::cast(0.9),
            beta2: F::cast(0.999),
            eps: F::cast(1e-8),
            m: Array1::zeros(n),
            v: Array1::zeros(n),
            t: 0,
        }
    }

    pub fn step(&mut self, params: &mut Array1<F>, grad: &Array1<F>) {
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        self.m
            .zip_mut_with(grad, |m, g| *m = b1 * *m + (F::one() - b1) * *g);
        self.v
            .zip_mut_with(grad, |v, g| *v = b2 * *v + (F::one() - b2) * *g * *g);
        let bc1 = F::one() - b1.powi(self.t as i32);
        let bc2 = F::one() - b2.powi(self.t as i32);
        let (lr, eps) = (self.learning_rate, self.eps);
        Zip::from(params)
            .and(&self.m)
            .and(&self.v)
            .for_each(|p, &m, &v| *p = *p - lr * (m / bc1) / ((v / bc2).sqrt() + eps));
    }
}

/// Gradient descent with classical momentum.
pub(crate) struct Sgd<F: Float> {
    learning_rate: F,
    momentum: F,
    velocity: Array1<F>,
}

impl<F: Float> Sgd<F> {
    pub fn new(learning_rate: F, momentum: F, n: usize) -> Self {
        Sgd {
            learning_rate,
            momentum,
            velocity: Array1::zeros(n),
        }
    }

    pub fn step(&mut self, params: &mut Array1<F>, grad: &Array1<F>) {
        let (mu, lr) = (self.momentum, self.learning_rate);
        self.velocity.zip_mut_with(grad, |v, g| *v = mu * *v + *g);
        params.zip_mut_with(&self.velocity, |p, v| *p = *p - lr * *v);
    }
}

/// Update-rule dispatch over the configured [Optimizer].
pub(crate) enum GradientDescent<F: Float> {
    Adam(Adam<F>),
    Sgd(Sgd<F>),
}

impl<F: Float> GradientDescent<F> {
    pub fn new(spec: &Optimizer<F>, n: usize) -> Self {
        match spec {
            Optimizer::Adam { learning_rate } => {
                GradientDescent::Adam(Adam::new(*learning_rate, n))
            }
            Optimizer::Sgd {
                learning_rate,
                momentum,
            } => GradientDescent::Sgd(Sgd::new(*learning_rate, *momentum, n)),
        }
    }

    pub fn step(&mut self, params: &mut Array1<F>, grad: &Array1<F>) {
        match self {
            GradientDescent::Adam(opt) => opt.step(params, grad),
            GradientDescent::Sgd(opt) => opt.step(params, grad),
        }
    }
}

/// Build the matrix of starting points for the likelihood optimization, one
/// start per row in packed log-parameter space. The first row is the user or
/// default defined initial guess, the remaining ones are drawn uniformly
/// within the log bounds. Components with a degenerate interval (lower equal
/// to upper) keep their pinned value in every row, components with a
/// non-finite bound are unconstrained and keep their initial value.
pub(crate) fn prepare_multistart<F: Float>(
    n_start: usize,
    init: &Array1<F>,
    log_bounds: &[(F, F)],
    rng: &mut Xoshiro256Plus,
) -> Array2<F> {
    let mut starts = Array2::zeros((n_start, init.len()));
    starts.row_mut(0).assign(init);
    for i in 1..n_start {
        let vals = log_bounds
            .iter()
            .zip(init)
            .map(|((lo, up), v0)| {
                if lo.is_finite() && up.is_finite() {
                    *lo + F::cast(rng.gen::<f64>()) * (*up - *lo)
                } else {
                    *v0
                }
            })
            .collect();
        starts.row_mut(i).assign(&Array::from_vec(vals));
    }
    starts
}

/// Minimize `objective` by gradient descent starting from `start`, projecting
/// the iterate back into `log_bounds` after each step.
///
/// `objective` returns the loss together with its gradient wrt the packed
/// parameters. A non-finite loss aborts the run and is reported as is, so
/// that the caller can discard the start.
pub(crate) fn optimize_hypers<F, O>(
    objective: &O,
    start: Array1<F>,
    spec: &Optimizer<F>,
    n_iters: usize,
    log_bounds: &[(F, F)],
) -> TrainingOutcome<F>
where
    F: Float,
    O: Fn(&Array1<F>) -> (F, Array1<F>),
{
    let mut params = start;
    let mut opt = GradientDescent::new(spec, params.len());
    let mut history = Vec::with_capacity(n_iters);
    for iter in 0..n_iters {
        let (loss, grad) = objective(&params);
        debug!("iter {:>3}/{} - loss {}", iter + 1, n_iters, loss);
        history.push(loss);
        if !loss.is_finite() {
            warn!("Non finite loss at iter {}/{}, training run discarded", iter + 1, n_iters);
            return TrainingOutcome {
                params,
                loss,
                history,
            };
        }
        opt.step(&mut params, &grad);
        Zip::from(&mut params)
            .and(log_bounds)
            .for_each(|p, (lo, up)| *p = clamp(*p, *lo, *up));
    }
    let (loss, _) = objective(&params);
    TrainingOutcome {
        params,
        loss,
        history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;

    fn quadratic(center: Array1<f64>) -> impl Fn(&Array1<f64>) -> (f64, Array1<f64>) {
        move |x: &Array1<f64>| {
            let d = x - &center;
            (d.dot(&d), d.mapv(|v| 2. * v))
        }
    }

    #[test]
    fn test_adam_converges_on_quadratic() {
        let obj = quadratic(array![0.3, -1.2]);
        let bounds = vec![(-10., 10.), (-10., 10.)];
        let out = optimize_hypers(
            &obj,
            array![2., 2.],
            &Optimizer::Adam { learning_rate: 0.1 },
            500,
            &bounds,
        );
        assert_eq!(out.history.len(), 500);
        assert!(out.loss < out.history[0]);
        assert_abs_diff_eq!(out.params, array![0.3, -1.2], epsilon = 1e-3);
    }

    #[test]
    fn test_sgd_converges_on_quadratic() {
        let obj = quadratic(array![0.5]);
        let bounds = vec![(-10., 10.)];
        let out = optimize_hypers(
            &obj,
            array![3.],
            &Optimizer::Sgd {
                learning_rate: 0.05,
                momentum: 0.9,
            },
            500,
            &bounds,
        );
        assert_abs_diff_eq!(out.params, array![0.5], epsilon = 1e-3);
    }

    #[test]
    fn test_bounds_projection() {
        // minimum lies outside the feasible interval, iterate must stick to the edge
        let obj = quadratic(array![-10.]);
        let bounds = vec![(-1., 1.)];
        let out = optimize_hypers(
            &obj,
            array![0.],
            &Optimizer::Adam { learning_rate: 0.1 },
            200,
            &bounds,
        );
        assert_abs_diff_eq!(out.params[0], -1., epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_bounds_pin_component() {
        let obj = quadratic(array![5., 5.]);
        let bounds = vec![(0.5, 0.5), (-10., 10.)];
        let out = optimize_hypers(
            &obj,
            array![0.5, 0.],
            &Optimizer::Adam { learning_rate: 0.1 },
            300,
            &bounds,
        );
        assert_abs_diff_eq!(out.params[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(out.params[1], 5., epsilon = 1e-3);
    }

    #[test]
    fn test_non_finite_loss_aborts_run() {
        let obj = |_: &Array1<f64>| (f64::NAN, array![0.]);
        let bounds = vec![(-1., 1.)];
        let out = optimize_hypers(
            &obj,
            array![0.],
            &Optimizer::Adam { learning_rate: 0.1 },
            100,
            &bounds,
        );
        // the run stops at the first non finite evaluation and reports it as is
        assert_eq!(out.history.len(), 1);
        assert!(!out.loss.is_finite());
        assert_abs_diff_eq!(out.params[0], 0., epsilon = 1e-12);
    }

    #[test]
    fn test_multistart_layout() {
        let init = array![0.1, 0.2, 0.3, 0.4];
        let bounds = vec![
            (-2., 2.),
            (0.3, 0.3),
            (-5., 5.),
            (f64::NEG_INFINITY, f64::INFINITY),
        ];
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let starts = prepare_multistart(4, &init, &bounds, &mut rng);
        assert_eq!(starts.dim(), (4, 4));
        assert_abs_diff_eq!(starts.row(0), init.view(), epsilon = 1e-12);
        for i in 1..4 {
            assert!(starts[[i, 0]] >= -2. && starts[[i, 0]] <= 2.);
            assert!(starts[[i, 2]] >= -5. && starts[[i, 2]] <= 5.);
            // pinned component keeps its value in every row
            assert_abs_diff_eq!(starts[[i, 1]], 0.3, epsilon = 1e-12);
            // unconstrained component keeps its initial value
            assert_abs_diff_eq!(starts[[i, 3]], 0.4, epsilon = 1e-12);
        }

        let mut rng2 = Xoshiro256Plus::seed_from_u64(42);
        let starts2 = prepare_multistart(4, &init, &bounds, &mut rng2);
        assert_abs_diff_eq!(starts, starts2, epsilon = 1e-12);
    }
}
