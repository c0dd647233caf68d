use crate::correlation_models::*;
use crate::errors::{GpError, Result};
use crate::mean_models::*;
use crate::optimization::{optimize_hypers, prepare_multistart, TrainingOutcome};
use crate::parameters::{GpParams, GpValidParams, LengthscaleTuning, VarianceConfig};
use crate::utils::{pairwise_differences, DiffMatrix, NormalizedData};

use linfa::prelude::{DatasetBase, Fit, Float, PredictInplace};
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{s, Array, Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use ndarray_stats::QuantileExt;
use rand_xoshiro::Xoshiro256Plus;

use log::{debug, warn};
use rayon::prelude::*;
#[cfg(feature = "persistent")]
use serde::de::DeserializeOwned;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
#[cfg(feature = "persistent")]
use std::fs;
#[cfg(feature = "persistent")]
use std::io::Write;
#[cfg(feature = "persistent")]
use std::path::Path;
use std::time::Instant;

/// Default number of gradient-descent iterations per training run
pub const GP_TRAIN_N_ITERS: usize = 50;
/// Default number of training runs (likelihood optimization restarts)
pub const GP_OPTIM_N_START: usize = 4;

/// Internal parameters computed during Gp training
/// used later on in prediction computations
#[derive(Default, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub(crate) struct GpInnerParams<F: Float> {
    /// Cholesky decomposition of the full training covariance matrix \[K\]
    k_chol: Array2<F>,
    /// Weights of the correlated part of the posterior mean: sigma2 * \[K\]^-1 (y - F beta)
    gamma: Array2<F>,
}

impl<F: Float> Clone for GpInnerParams<F> {
    fn clone(&self) -> Self {
        Self {
            k_chol: self.k_chol.to_owned(),
            gamma: self.gamma.to_owned(),
        }
    }
}

/// Structure for trained Gaussian Process model
///
/// The model is the sum of a parameterized mean and a zero-mean gaussian process
/// whose covariance between two points `x` and `x'` is
///
/// `k(x, x') = sigma2 * r(|x - x'| / lengthscales)`
///
/// where `r` is one of the available correlation models ([SquaredExponentialCorr],
/// [AbsoluteExponentialCorr], [Matern32Corr], [Matern52Corr]) and where observed
/// values carry an additional gaussian noise of variance `noise`.
///
/// Training normalizes inputs and targets to zero mean and unit standard deviation
/// then adjusts the hyperparameters, namely the lengthscales, `sigma2`, `noise` and
/// the mean weights `beta`, by gradient descent on the negative log marginal
/// likelihood of the training data averaged over the samples. Variance-like
/// hyperparameters are handled through their logarithm so that gradient steps keep
/// them positive, and the descent is restarted from `n_start` points to mitigate
/// local optima; the run reaching the best likelihood is retained.
///
/// Each hyperparameter may also be pinned to a user value with
/// [LengthscaleTuning::Fixed] or [VarianceConfig::Fixed], in which case it is left
/// untouched during training.
///
/// # Features
///
/// ## serializable
///
/// The `serializable` feature enables the serialization of GP models using the
/// [`serde crate`](https://serde.rs/).
///
/// ## persistent
///
/// The `persistent` feature enables the save and load of GP models as json files
/// using the [`serde_json` crate](https://docs.serde.rs/serde_json).
///
/// # Example
///
/// ```no_run
/// use linfa::prelude::*;
/// use ndarray::{arr2, Array, Array1, Array2, Axis};
/// use surmise_gp::correlation_models::*;
/// use surmise_gp::mean_models::*;
/// use surmise_gp::GaussianProcess;
///
/// fn xsinx(x: &Array2<f64>) -> Array1<f64> {
///     ((x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())).remove_axis(Axis(1))
/// }
///
/// let xt = arr2(&[[0.0], [5.0], [10.0], [15.0], [18.0], [20.0], [25.0]]);
/// let yt = xsinx(&xt);
///
/// let gp = GaussianProcess::<f64, ConstantMean, SquaredExponentialCorr>::params(
///     ConstantMean(),
///     SquaredExponentialCorr(),
/// )
/// .seed(Some(42))
/// .fit(&Dataset::new(xt, yt))
/// .expect("GP fitting");
///
/// let xtest = Array::linspace(0., 25., 101).insert_axis(Axis(1));
/// let ypred = gp.predict(&xtest).expect("GP prediction");
/// let (lower, upper) = gp.confidence_region(&xtest).expect("GP confidence");
/// ```
///
/// # Reference
///
/// Rasmussen, Carl Edward, and Williams, Christopher K. I.
/// [Gaussian processes for machine learning](http://www.gaussianprocess.org/gpml),
/// MIT press, 2006 (chapters 2 and 5)
#[derive(Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Mean: Serialize, Corr: Serialize",
        deserialize = "F: Deserialize<'de>, Mean: Deserialize<'de>, Corr: Deserialize<'de>"
    ))
)]
pub struct GaussianProcess<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> {
    /// Correlation lengthscales, one per input dimension (normalized space)
    lengthscales: Array1<F>,
    /// Variance of the correlated signal (normalized space)
    sigma2: F,
    /// Variance of the gaussian observation noise (normalized space)
    noise: F,
    /// Weights of the mean model
    beta: Array2<F>,
    /// Average log marginal likelihood reached at the end of training
    likelihood: F,
    /// Loss recorded at each iteration of the retained training run
    history: Vec<F>,
    /// Data-dependent quantities reused in prediction computations
    inner_params: GpInnerParams<F>,
    /// Normalized training inputs
    xt_norm: NormalizedData<F>,
    /// Normalized training targets
    yt_norm: NormalizedData<F>,
    /// Training data kept for cross-validation metrics
    pub(crate) training_data: (Array2<F>, Array1<F>),
    /// Parameters used for training
    pub(crate) params: GpValidParams<F, Mean, Corr>,
}

/// A GP regression with a constant mean and a squared exponential correlation
/// model, the default configuration used in the tutorials.
pub type ExactGp<F> = GpParams<F, ConstantMean, SquaredExponentialCorr>;

impl<F: Float> ExactGp<F> {
    /// Parameter initialization with a constant mean and a squared exponential correlation model
    pub fn params() -> ExactGp<F> {
        GpParams::new(ConstantMean(), SquaredExponentialCorr())
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> Clone
    for GaussianProcess<F, Mean, Corr>
{
    fn clone(&self) -> Self {
        Self {
            lengthscales: self.lengthscales.to_owned(),
            sigma2: self.sigma2,
            noise: self.noise,
            beta: self.beta.to_owned(),
            likelihood: self.likelihood,
            history: self.history.clone(),
            inner_params: self.inner_params.clone(),
            xt_norm: self.xt_norm.clone(),
            yt_norm: self.yt_norm.clone(),
            training_data: self.training_data.clone(),
            params: self.params.clone(),
        }
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> fmt::Display
    for GaussianProcess<F, Mean, Corr>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GP(mean={}, corr={}, lengthscales={}, outputscale={}, noise={}, likelihood={})",
            self.params.mean,
            self.params.corr,
            self.lengthscales(),
            self.outputscale(),
            self.noise_variance(),
            self.likelihood,
        )
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>>
    GaussianProcess<F, Mean, Corr>
{
    /// Gp parameters contructor with given mean and correlation models
    pub fn params<NewMean: RegressionModel<F>, NewCorr: CorrelationModel<F>>(
        mean: NewMean,
        corr: NewCorr,
    ) -> GpParams<F, NewMean, NewCorr> {
        GpParams::new(mean, corr)
    }

    /// Predict output values at n given `x` points of nx components specified as a (n, nx) matrix.
    /// Returns n predicted values as a vector.
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let xnorm = (x - &self.xt_norm.mean) / &self.xt_norm.std;
        let fx = self.params.mean.value(&xnorm);
        let corr = self._compute_correlation(&xnorm);
        let ynorm = fx.dot(&self.beta) + corr.dot(&self.inner_params.gamma);
        let y = &self.yt_norm.mean + &(ynorm * &self.yt_norm.std);
        Ok(y.remove_axis(Axis(1)))
    }

    /// Predict variances of the model output at n given `x` points specified as a
    /// (n, nx) matrix. Returns n variances as a vector. The observation noise is
    /// not included, see [GaussianProcess::confidence_region] for intervals on
    /// noisy observations.
    pub fn predict_var(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let xnorm = (x - &self.xt_norm.mean) / &self.xt_norm.std;
        let corr = self._compute_correlation(&xnorm);
        self._compute_variances(&corr)
    }

    /// Predict both output values and variances at n given `x` points, sharing the
    /// cross-correlation computation between the two.
    pub fn predict_valvar(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let xnorm = (x - &self.xt_norm.mean) / &self.xt_norm.std;
        let fx = self.params.mean.value(&xnorm);
        let corr = self._compute_correlation(&xnorm);

        let ynorm = fx.dot(&self.beta) + corr.dot(&self.inner_params.gamma);
        let y = (&self.yt_norm.mean + &(ynorm * &self.yt_norm.std)).remove_axis(Axis(1));

        let var = self._compute_variances(&corr)?;
        Ok((y, var))
    }

    /// Compute the bounds of the 95% confidence interval of the model output at n
    /// given `x` points, as `(mean - 2 * sigma, mean + 2 * sigma)` vectors where
    /// sigma accounts for both the model variance and the estimated noise variance.
    pub fn confidence_region(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let (mean, var) = self.predict_valvar(x)?;
        let noise = self.noise_variance();
        let two = F::cast(2.);
        let band = var.mapv(|v| two * (v + noise).sqrt());
        Ok((&mean - &band, &mean + &band))
    }

    /// Draw `n_draws` realizations of the model posterior at n given `x` points
    /// using the given random generator. Returns a (n, n_draws) matrix with one
    /// trajectory per column.
    pub fn sample_using<R: Rng + ?Sized>(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        n_draws: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let n = x.nrows();
        if n == 0 {
            return Ok(Array2::zeros((0, n_draws)));
        }
        let xnorm = (x - &self.xt_norm.mean) / &self.xt_norm.std;
        let fx = self.params.mean.value(&xnorm);
        let corr = self._compute_correlation(&xnorm);
        let mean = fx.dot(&self.beta) + corr.dot(&self.inner_params.gamma);

        let cov = self._compute_posterior_cov(&xnorm, &corr)?;
        let cov_chol = cov.cholesky()?;
        let normal = Normal::new(0., 1.).unwrap();
        let draws = Array::random_using((n, n_draws), normal, rng).mapv(F::cast);

        let ynorm = &mean + &cov_chol.dot(&draws);
        Ok(&self.yt_norm.mean + &(ynorm * &self.yt_norm.std))
    }

    /// Draw `n_draws` realizations of the model posterior at n given `x` points,
    /// seeding the random generator from the training parameters.
    pub fn sample(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        n_draws: usize,
    ) -> Result<Array2<F>> {
        let mut rng = match self.params.seed {
            Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        self.sample_using(x, n_draws, &mut rng)
    }

    /// Retrieve the correlation lengthscales in the original input space, one per dimension.
    pub fn lengthscales(&self) -> Array1<F> {
        &self.lengthscales * &self.xt_norm.std
    }

    /// Retrieve the variance of the correlated signal in the original output space.
    pub fn outputscale(&self) -> F {
        self.sigma2 * self.yt_norm.std[0] * self.yt_norm.std[0]
    }

    /// Retrieve the variance of the observation noise in the original output space.
    pub fn noise_variance(&self) -> F {
        self.noise * self.yt_norm.std[0] * self.yt_norm.std[0]
    }

    /// Retrieve the weights of the mean model estimated during training (normalized space).
    pub fn beta(&self) -> &Array2<F> {
        &self.beta
    }

    /// Retrieve the average log marginal likelihood of the trained model.
    pub fn likelihood(&self) -> F {
        self.likelihood
    }

    /// Retrieve the loss (negative average log marginal likelihood) recorded at
    /// each iteration of the retained training run.
    pub fn loss_history(&self) -> &[F] {
        &self.history
    }

    /// Retrieve number of (input, output) dimensions handled by the model.
    pub fn dims(&self) -> (usize, usize) {
        (self.xt_norm.ncols(), self.yt_norm.ncols())
    }

    /// Compute correlations between normalized `xnorm` points and the training
    /// points as a (n, nt) matrix.
    fn _compute_correlation(&self, xnorm: &Array2<F>) -> Array2<F> {
        let dx = pairwise_differences(xnorm, &self.xt_norm.data);
        let r = self.params.corr.value(&dx, &self.lengthscales);
        r.into_shape((xnorm.nrows(), self.xt_norm.data.nrows()))
            .expect("correlation reshape")
    }

    /// Compute posterior variances given the (n, nt) cross-correlation matrix `corr`.
    fn _compute_variances(&self, corr: &Array2<F>) -> Result<Array1<F>> {
        let ct = self
            .inner_params
            .k_chol
            .solve_triangular(&corr.t().to_owned(), UPLO::Lower)?;
        let s2 = self.sigma2;
        let mut var = ct.map_axis(Axis(0), |c| s2 - s2 * s2 * c.dot(&c));
        let ystd2 = self.yt_norm.std[0] * self.yt_norm.std[0];
        // small negative values may appear near training points
        var.mapv_inplace(|v| if v < F::zero() { F::zero() } else { v * ystd2 });
        Ok(var)
    }

    /// Compute the posterior covariance matrix (normalized space) between the
    /// normalized `xnorm` points given their cross-correlations `corr` with the
    /// training points.
    fn _compute_posterior_cov(&self, xnorm: &Array2<F>, corr: &Array2<F>) -> Result<Array2<F>> {
        let n = xnorm.nrows();
        let s2 = self.sigma2;
        let dx = pairwise_differences(xnorm, xnorm);
        let prior = self
            .params
            .corr
            .value(&dx, &self.lengthscales)
            .into_shape((n, n))
            .expect("correlation reshape")
            .mapv(|v| s2 * v);

        let ct = self
            .inner_params
            .k_chol
            .solve_triangular(&corr.t().to_owned(), UPLO::Lower)?;
        let mut cov = prior - ct.t().dot(&ct).mapv(|v| s2 * s2 * v);
        // jitter keeps the factorization possible at quasi-duplicate points
        let jitter = F::cast(1e-10);
        cov.diag_mut().mapv_inplace(|v| v + jitter);
        Ok(cov)
    }
}

#[cfg(feature = "persistent")]
/// Save and load the model as json when the `persistent` feature is enabled.
impl<F, Mean, Corr> GaussianProcess<F, Mean, Corr>
where
    F: Float + Serialize + DeserializeOwned,
    Mean: RegressionModel<F> + Serialize + DeserializeOwned,
    Corr: CorrelationModel<F> + Serialize + DeserializeOwned,
{
    /// Save the trained model as a json file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = fs::File::create(path)?;
        let bytes = serde_json::to_vec(self)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load a model saved with [GaussianProcess::save]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|err| GpError::LoadError(err.to_string()))
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>>
    PredictInplace<Array2<F>, Array1<F>> for GaussianProcess<F, Mean, Corr>
{
    fn predict_inplace(&self, x: &Array2<F>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        *y = self.predict(x).expect("GP Prediction");
    }

    fn default_target(&self, x: &Array2<F>) -> Array1<F> {
        Array1::zeros(x.nrows())
    }
}

/// Gaussian process adaptor to predict variances through the `linfa::Predict` trait.
pub struct GpVariancePredictor<'a, F, Mean, Corr>(pub &'a GaussianProcess<F, Mean, Corr>)
where
    F: Float,
    Mean: RegressionModel<F>,
    Corr: CorrelationModel<F>;

impl<F, Mean, Corr> PredictInplace<Array2<F>, Array1<F>> for GpVariancePredictor<'_, F, Mean, Corr>
where
    F: Float,
    Mean: RegressionModel<F>,
    Corr: CorrelationModel<F>,
{
    fn predict_inplace(&self, x: &Array2<F>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        *y = self.0.predict_var(x).expect("GP variance prediction");
    }

    fn default_target(&self, x: &Array2<F>) -> Array1<F> {
        Array1::zeros(x.nrows())
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for GpValidParams<F, Mean, Corr>
{
    type Object = GaussianProcess<F, Mean, Corr>;

    /// Fit GP parameters using maximum likelihood estimation on the `(x, y)` data
    /// of the given dataset, where `x` is a (n, nx) matrix of input points and `y`
    /// the corresponding n target values.
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x = dataset.records();
        let y = dataset.targets();
        if x.nrows() != y.len() {
            return Err(GpError::InvalidValueError(format!(
                "Mismatched training set: {} input points and {} target values",
                x.nrows(),
                y.len()
            )));
        }
        if x.nrows() < 2 {
            return Err(GpError::InvalidValueError(
                "At least two training points are required to fit a GP".to_string(),
            ));
        }

        let yt = y.to_owned().insert_axis(Axis(1));
        let xtrain = NormalizedData::new(x);
        let ytrain = NormalizedData::new(&yt);
        let nx = xtrain.ncols();

        let x_distances = DiffMatrix::new(&xtrain.data);
        let sums = x_distances
            .d
            .mapv(|v| num_traits::float::Float::abs(v))
            .sum_axis(Axis(1));
        if let Ok(min_dist) = sums.min() {
            if *min_dist < F::cast(1e-10) {
                warn!("Multiple input points are (almost) identical, the training covariance matrix may be singular");
            }
        }

        let tuning = self.lengthscale_tuning();
        let mut ls_init = tuning.init().to_owned();
        if ls_init.len() == 1 && nx > 1 {
            ls_init = Array1::from_elem(nx, ls_init[0]);
        }
        if ls_init.len() != nx {
            return Err(GpError::InvalidValueError(format!(
                "Mismatched lengthscales: {} values given for {} input dimensions",
                ls_init.len(),
                nx
            )));
        }

        let fx = self.mean().value(&xtrain.data);
        let p = fx.ncols();
        let n_hypers = nx + 2;

        // Packed parameter vector [ln l_1, .., ln l_nx, ln sigma2, ln noise, beta_1, .., beta_p].
        // Fixed components get degenerate bounds so that the projection pins them.
        let mut init = Array1::<F>::zeros(n_hypers + p);
        let mut log_bounds = vec![(F::neg_infinity(), F::infinity()); n_hypers + p];
        match tuning {
            LengthscaleTuning::Fixed(_) => {
                for (k, v) in ls_init.iter().enumerate() {
                    init[k] = v.ln();
                    log_bounds[k] = (init[k], init[k]);
                }
            }
            LengthscaleTuning::Optimized { bounds, .. } => {
                let (lo, up) = (bounds.0.ln(), bounds.1.ln());
                for (k, v) in ls_init.iter().enumerate() {
                    init[k] = num_traits::clamp(v.ln(), lo, up);
                    log_bounds[k] = (lo, up);
                }
            }
        }
        let (v0, bounds) = variance_component(self.outputscale_config());
        init[nx] = v0;
        log_bounds[nx] = bounds;
        let (v0, bounds) = variance_component(self.noise_config());
        init[nx + 1] = v0;
        log_bounds[nx + 1] = bounds;

        let mut rng = match self.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(*seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let starts = prepare_multistart(self.n_start(), &init, &log_bounds, &mut rng);
        debug!(
            "Optimize GP hyperparameters with {} start(s) of {} iterations",
            starts.nrows(),
            self.n_iters()
        );

        let corr = *self.corr();
        let nugget = self.nugget();
        let objective = |packed: &Array1<F>| -> (F, Array1<F>) {
            match eval_neg_mll(packed, &x_distances, &fx, &ytrain, &corr, nugget) {
                Ok(eval) => (eval.loss, eval.grad),
                Err(_) => (F::infinity(), Array1::zeros(packed.len())),
            }
        };

        let now = Instant::now();
        let outcomes: Vec<TrainingOutcome<F>> = (0..starts.nrows())
            .into_par_iter()
            .map(|i| {
                optimize_hypers(
                    &objective,
                    starts.row(i).to_owned(),
                    self.optimizer(),
                    self.n_iters(),
                    &log_bounds,
                )
            })
            .collect();
        debug!("GP training took {:?}", now.elapsed());

        let best = outcomes
            .into_iter()
            .reduce(|cur, run| if run.loss < cur.loss { run } else { cur })
            .ok_or_else(|| {
                GpError::LikelihoodComputationError("No training run was attempted".to_string())
            })?;
        if !best.loss.is_finite() {
            return Err(GpError::LikelihoodComputationError(
                "All training runs diverged, check data or fix hyperparameters".to_string(),
            ));
        }
        let TrainingOutcome {
            params: opt_packed,
            loss,
            history,
        } = best;
        let eval = eval_neg_mll(&opt_packed, &x_distances, &fx, &ytrain, &corr, nugget)?;

        let lengthscales = opt_packed.slice(s![..nx]).mapv(|v| v.exp());
        let sigma2 = opt_packed[nx].exp();
        let noise = opt_packed[nx + 1].exp();
        let beta = opt_packed
            .slice(s![n_hypers..])
            .to_owned()
            .insert_axis(Axis(1));

        Ok(GaussianProcess {
            lengthscales,
            sigma2,
            noise,
            beta,
            likelihood: -loss,
            history,
            inner_params: GpInnerParams {
                k_chol: eval.k_chol,
                gamma: eval.gamma,
            },
            xt_norm: xtrain,
            yt_norm: ytrain,
            training_data: (x.to_owned(), y.to_owned()),
            params: self.clone(),
        })
    }
}

/// Map a variance configuration to its initial log value and log bounds, using
/// degenerate bounds when the parameter is fixed.
fn variance_component<F: Float>(config: &VarianceConfig<F>) -> (F, (F, F)) {
    match config {
        VarianceConfig::Fixed(v) => (v.ln(), (v.ln(), v.ln())),
        VarianceConfig::Estimated { init, bounds } => {
            let v0 = num_traits::clamp(*init, bounds.0, bounds.1);
            (v0.ln(), (bounds.0.ln(), bounds.1.ln()))
        }
    }
}

/// Quantities computed during one likelihood evaluation
pub(crate) struct LikelihoodEval<F: Float> {
    /// Negative log marginal likelihood averaged over the training samples
    pub loss: F,
    /// Gradient of the loss wrt the packed parameter vector
    pub grad: Array1<F>,
    /// Cholesky factor of the training covariance matrix
    pub k_chol: Array2<F>,
    /// Weights of the correlated part of the posterior mean
    pub gamma: Array2<F>,
}

/// Compute the negative log marginal likelihood of the training data averaged over
/// the samples, together with its gradient, at the `packed` parameter vector
/// `[ln l_1, .., ln l_nx, ln sigma2, ln noise, beta_1, .., beta_p]`.
///
/// The training covariance matrix is `K = sigma2 * (R + nugget * I) + noise * I`
/// where `R` holds the correlation values between the normalized training points.
pub(crate) fn eval_neg_mll<F: Float, Corr: CorrelationModel<F>>(
    packed: &Array1<F>,
    x_distances: &DiffMatrix<F>,
    fx: &Array2<F>,
    ytrain: &NormalizedData<F>,
    corr: &Corr,
    nugget: F,
) -> Result<LikelihoodEval<F>> {
    let nx = x_distances.d.ncols();
    let n = x_distances.n_obs;
    let n_hypers = nx + 2;
    let lengthscales = packed.slice(s![..nx]).mapv(|v| v.exp());
    let sigma2 = packed[nx].exp();
    let noise = packed[nx + 1].exp();
    let beta = packed.slice(s![n_hypers..]).to_owned().insert_axis(Axis(1));

    let rxx = corr.value(&x_distances.d, &lengthscales);
    let k = x_distances.expand_sym(
        &rxx.column(0).mapv(|v| sigma2 * v),
        sigma2 * (F::one() + nugget) + noise,
    );
    let k_chol = k.cholesky()?;

    // L z = r then L^T alpha = z so that alpha = K^-1 (y - F beta)
    let resid = &ytrain.data - &fx.dot(&beta);
    let z = k_chol.solve_triangular(&resid, UPLO::Lower)?;
    let alpha = k_chol.t().solve_triangular_into(z, UPLO::Upper)?;

    let quad = resid.column(0).dot(&alpha.column(0));
    let ln_det = k_chol.diag().mapv(|v| v.ln()).sum();
    let half = F::cast(0.5);
    let nf = F::cast(n as f64);
    let two_pi = F::cast(2. * std::f64::consts::PI);
    let mll = -half * quad - ln_det - half * nf * two_pi.ln();
    if !mll.is_finite() {
        return Err(GpError::LikelihoodComputationError(
            "Marginal likelihood is not finite".to_string(),
        ));
    }

    // W = alpha alpha^T - K^-1 gives d mll / d K = W / 2
    let eye = Array2::eye(n);
    let linv = k_chol.solve_triangular(&eye, UPLO::Lower)?;
    let kinv = linv.t().dot(&linv);
    let w = alpha.dot(&alpha.t()) - &kinv;

    // Each stored pair stands for two symmetric entries of K, which cancels the 1/2
    let jac = corr.param_jacobian(&x_distances.d, &lengthscales);
    let mut grad = Array1::<F>::zeros(packed.len());
    let mut w_dot_r = F::zero();
    for (idx, pair) in x_distances.d_indices.outer_iter().enumerate() {
        let w_ij = w[[pair[0], pair[1]]];
        for k in 0..nx {
            grad[k] += w_ij * jac[[idx, k]];
        }
        w_dot_r += w_ij * rxx[[idx, 0]];
    }
    let tr_w = w.diag().sum();
    for k in 0..nx {
        grad[k] = sigma2 * grad[k] * lengthscales[k];
    }
    grad[nx] = half * sigma2 * (F::cast(2.) * w_dot_r + (F::one() + nugget) * tr_w);
    grad[nx + 1] = half * noise * tr_w;
    let beta_grad = fx.t().dot(&alpha);
    for (k, g) in beta_grad.column(0).iter().enumerate() {
        grad[n_hypers + k] = *g;
    }

    let scale = -(F::one() / nf);
    Ok(LikelihoodEval {
        loss: -(mll / nf),
        grad: grad.mapv(|g| scale * g),
        k_chol,
        gamma: alpha.mapv(|a| sigma2 * a),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::Optimizer;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa::{Dataset, ParamGuard};
    use linfa_linalg::norm::Norm;
    use ndarray::{arr1, array};
    use ndarray_npy::write_npy;
    use ndarray_rand::rand_distr::Uniform;
    use paste::paste;

    fn xsinx(x: &Array2<f64>) -> Array1<f64> {
        ((x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())).remove_axis(Axis(1))
    }

    /// A two-point model with hand-picked hyperparameters and identity
    /// normalization, cross-checked against a dense computation.
    fn tiny_model() -> GaussianProcess<f64, ConstantMean, SquaredExponentialCorr> {
        let s2 = 2.0;
        let noise = 0.1;
        let beta = 0.3;
        let r12 = (-0.5_f64).exp();
        let k = array![[s2 + noise, s2 * r12], [s2 * r12, s2 + noise]];
        let k_chol = k.cholesky().unwrap();
        let resid = array![[0.5 - beta], [-0.5 - beta]];
        let z = k_chol.solve_triangular(&resid, UPLO::Lower).unwrap();
        let alpha = k_chol.t().solve_triangular(&z, UPLO::Upper).unwrap();
        GaussianProcess {
            lengthscales: arr1(&[1.0]),
            sigma2: s2,
            noise,
            beta: array![[beta]],
            likelihood: 0.,
            history: vec![],
            inner_params: GpInnerParams {
                k_chol,
                gamma: alpha.mapv(|a| s2 * a),
            },
            xt_norm: NormalizedData {
                data: array![[0.], [1.]],
                mean: arr1(&[0.]),
                std: arr1(&[1.]),
            },
            yt_norm: NormalizedData {
                data: array![[0.5], [-0.5]],
                mean: arr1(&[0.]),
                std: arr1(&[1.]),
            },
            training_data: (array![[0.], [1.]], arr1(&[0.5, -0.5])),
            params: GpValidParams::default(),
        }
    }

    macro_rules! test_gp {
        ($regr:ident, $corr:ident) => {
            paste! {
                #[test]
                fn [<test_gp_ $regr:snake _ $corr:snake>]() {
                    let mut rng = Xoshiro256Plus::seed_from_u64(42);
                    let xt = Array::random_using((30, 1), Uniform::new(0., 25.), &mut rng);
                    let yt = xsinx(&xt);
                    let gp = GaussianProcess::<f64, [<$regr Mean>], [<$corr Corr>]>::params(
                        [<$regr Mean>]::default(),
                        [<$corr Corr>]::default(),
                    )
                    .seed(Some(42))
                    .n_start(2)
                    .n_iters(100)
                    .fit(&Dataset::new(xt, yt))
                    .expect("GP fitted");

                    let xtest = Array::linspace(0., 25., 100).insert_axis(Axis(1));
                    let ytrue = xsinx(&xtest);
                    let ypred = gp.predict(&xtest).expect("prediction");
                    let nrmse = (&ypred - &ytrue).norm_l2() / ytrue.norm_l2();
                    assert!(nrmse < 2e-1, "nrmse = {} too large for {}", nrmse, gp);
                    let yvar = gp.predict_var(&xtest).expect("variance");
                    assert!(yvar.iter().all(|&v| v >= 0.));

                    let test_dir = "target/tests";
                    std::fs::create_dir_all(test_dir).ok();
                    write_npy(
                        format!("{}/gp_{}_{}.npy", test_dir, stringify!($regr), stringify!($corr)),
                        &ypred,
                    )
                    .expect("saved");
                }
            }
        };
    }

    test_gp!(Constant, SquaredExponential);
    test_gp!(Constant, AbsoluteExponential);
    test_gp!(Constant, Matern32);
    test_gp!(Constant, Matern52);
    test_gp!(Linear, SquaredExponential);
    test_gp!(Linear, AbsoluteExponential);
    test_gp!(Linear, Matern32);
    test_gp!(Linear, Matern52);
    test_gp!(Quadratic, SquaredExponential);
    test_gp!(Quadratic, AbsoluteExponential);
    test_gp!(Quadratic, Matern32);
    test_gp!(Quadratic, Matern52);

    #[test]
    fn test_neg_mll_known_value() {
        let xnorm = NormalizedData {
            data: array![[0.], [1.]],
            mean: arr1(&[0.]),
            std: arr1(&[1.]),
        };
        let ynorm = NormalizedData {
            data: array![[0.5], [-0.5]],
            mean: arr1(&[0.]),
            std: arr1(&[1.]),
        };
        let dm = DiffMatrix::new(&xnorm.data);
        let corr = SquaredExponentialCorr::default();
        let fx = ConstantMean::default().value(&xnorm.data);
        // [ln l, ln sigma2, ln noise, beta]
        let packed = array![0.0, 2.0_f64.ln(), 0.1_f64.ln(), 0.3];

        let eval = eval_neg_mll(&packed, &dm, &fx, &ynorm, &corr, 0.0).expect("likelihood");
        assert_abs_diff_eq!(eval.loss, 1.3429286450613929, epsilon = 1e-12);
        assert_abs_diff_eq!(
            eval.grad,
            arr1(&[
                -0.06260562291123094,
                0.3260503879877632,
                0.01943280054494971,
                0.09055069347525466
            ]),
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(
            eval.gamma,
            array![[0.946372272617482], [-1.3085750465185007]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_neg_mll_gradient() {
        let xt = array![
            [-0.9375_f64, -0.5625],
            [-0.5625, 0.4375],
            [0.9375, 0.1875],
            [0.8125, -0.5625],
            [-0.4375, 0.625],
            [0.6875, -0.3125]
        ];
        let yt = xt
            .map_axis(Axis(1), |r| (2.5 * r[0]).sin() + r[1] * r[1])
            .insert_axis(Axis(1));
        let xtrain = NormalizedData::new(&xt);
        let ytrain = NormalizedData::new(&yt);
        let dm = DiffMatrix::new(&xtrain.data);
        let corr = SquaredExponentialCorr::default();
        let fx = LinearMean::default().value(&xtrain.data);
        let nugget = 100. * f64::EPSILON;

        // [ln l_1, ln l_2, ln sigma2, ln noise, beta_1, beta_2, beta_3]
        let packed = array![
            0.3_f64.ln(),
            1.2_f64.ln(),
            0.8_f64.ln(),
            0.05_f64.ln(),
            0.2,
            -0.1,
            0.4
        ];
        let eval = eval_neg_mll(&packed, &dm, &fx, &ytrain, &corr, nugget).expect("likelihood");

        let f = |p: &Array1<f64>| {
            eval_neg_mll(p, &dm, &fx, &ytrain, &corr, nugget)
                .map(|e| e.loss)
                .unwrap()
        };
        let fdiff = packed.central_diff(&f);
        assert_abs_diff_eq!(eval.grad, fdiff, epsilon = 1e-6);
    }

    #[test]
    fn test_predict_known_values() {
        let gp = tiny_model();
        let x = array![[0.25], [2.0]];
        let (mean, var) = gp.predict_valvar(&x).expect("prediction");
        assert_abs_diff_eq!(
            mean,
            arr1(&[0.22949119152099884, -0.36561332668639235]),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            var,
            arr1(&[0.10198325276611486, 1.1671055386326206]),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(gp.predict(&x).expect("prediction"), mean, epsilon = 1e-12);
        assert_abs_diff_eq!(gp.predict_var(&x).expect("variance"), var, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_inplace() {
        let gp = tiny_model();
        let x = array![[0.25], [2.0]];
        let mut y = Array1::zeros(x.nrows());
        gp.predict_inplace(&x, &mut y);
        assert_abs_diff_eq!(
            y,
            arr1(&[0.22949119152099884, -0.36561332668639235]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_variance_predictor() {
        let gp = tiny_model();
        let x = array![[0.25], [2.0]];
        let mut var = Array1::zeros(x.nrows());
        GpVariancePredictor(&gp).predict_inplace(&x, &mut var);
        assert_abs_diff_eq!(
            var,
            arr1(&[0.10198325276611486, 1.1671055386326206]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_display() {
        let gp = tiny_model();
        let repr = format!("{gp}");
        assert!(
            repr.starts_with("GP(mean=ConstantMean, corr=SquaredExponential"),
            "got {repr}"
        );
    }

    #[test]
    fn test_dims() {
        let gp = tiny_model();
        assert_eq!(gp.dims(), (1, 1));
    }

    #[test]
    fn test_predict_empty() {
        let gp = tiny_model();
        let x = Array2::<f64>::zeros((0, 1));
        assert_eq!(gp.predict(&x).expect("prediction").len(), 0);
        assert_eq!(gp.predict_var(&x).expect("variance").len(), 0);
        let trajs = gp.sample(&x, 3).expect("samples");
        assert_eq!(trajs.dim(), (0, 3));
    }

    #[test]
    fn test_seeded_training_is_deterministic() {
        let mut rng = Xoshiro256Plus::seed_from_u64(7);
        let xt = Array::random_using((25, 1), Uniform::new(0., 25.), &mut rng);
        let yt = xsinx(&xt);
        let ds = Dataset::new(xt, yt);
        let gp1 = ExactGp::<f64>::params()
            .seed(Some(0))
            .n_iters(30)
            .fit(&ds)
            .expect("GP fitted");
        let gp2 = ExactGp::<f64>::params()
            .seed(Some(0))
            .n_iters(30)
            .fit(&ds)
            .expect("GP fitted");
        assert_abs_diff_eq!(gp1.lengthscales(), gp2.lengthscales());
        assert_abs_diff_eq!(gp1.outputscale(), gp2.outputscale());
        assert_abs_diff_eq!(gp1.noise_variance(), gp2.noise_variance());
        assert_abs_diff_eq!(gp1.likelihood(), gp2.likelihood());
    }

    #[test]
    fn test_fixed_hyperparameters_are_kept() {
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let xt: Array2<f64> = Array::random_using((20, 2), Uniform::new(0., 1.), &mut rng);
        let yt = xt.map_axis(Axis(1), |r| (2. * r[0]).sin() + r[1]);
        let xstd = NormalizedData::new(&xt).std;
        let ystd = yt.std(1.);
        let gp = ExactGp::<f64>::params()
            .lengthscale_tuning(LengthscaleTuning::Fixed(arr1(&[0.5, 2.0])))
            .outputscale(VarianceConfig::Fixed(1.4))
            .noise_variance(VarianceConfig::Fixed(1e-4))
            .n_iters(20)
            .seed(Some(0))
            .fit(&Dataset::new(xt, yt))
            .expect("GP fitted");
        assert_abs_diff_eq!(
            gp.lengthscales(),
            &arr1(&[0.5, 2.0]) * &xstd,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(gp.outputscale(), 1.4 * ystd * ystd, epsilon = 1e-12);
        assert_abs_diff_eq!(gp.noise_variance(), 1e-4 * ystd * ystd, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolation_with_tiny_fixed_noise() {
        let xt: Array2<f64> = Array::linspace(0., 1., 12).insert_axis(Axis(1));
        let yt = xt.map_axis(Axis(1), |r| (6. * r[0]).cos());
        let gp = ExactGp::<f64>::params()
            .lengthscale_tuning(LengthscaleTuning::Fixed(arr1(&[0.3])))
            .outputscale(VarianceConfig::Fixed(1.0))
            .noise_variance(VarianceConfig::Fixed(1e-12))
            .n_iters(10)
            .seed(Some(0))
            .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))
            .expect("GP fitted");
        let pred = gp.predict(&xt).expect("prediction");
        assert_abs_diff_eq!(pred, yt, epsilon = 1e-5);
    }

    #[test]
    fn test_constant_targets() {
        let xt = Array::linspace(0., 1., 10).insert_axis(Axis(1));
        let yt = Array1::from_elem(10, 3.1);
        let gp = ExactGp::<f64>::params()
            .seed(Some(0))
            .n_iters(20)
            .fit(&Dataset::new(xt, yt))
            .expect("GP fitted");
        let pred = gp.predict(&array![[0.25], [0.75]]).expect("prediction");
        assert_abs_diff_eq!(pred, arr1(&[3.1, 3.1]), epsilon = 1e-8);
    }

    #[test]
    fn test_loss_history() {
        let mut rng = Xoshiro256Plus::seed_from_u64(21);
        let xt = Array::random_using((20, 1), Uniform::new(0., 25.), &mut rng);
        let yt = xsinx(&xt);
        let gp = ExactGp::<f64>::params()
            .n_start(1)
            .n_iters(40)
            .seed(Some(1))
            .fit(&Dataset::new(xt, yt))
            .expect("GP fitted");
        let history = gp.loss_history();
        assert_eq!(history.len(), 40);
        assert!(history.iter().all(|l| l.is_finite()));
        assert!(history[history.len() - 1] < history[0]);
    }

    #[test]
    fn test_sgd_optimizer() {
        let mut rng = Xoshiro256Plus::seed_from_u64(21);
        let xt = Array::random_using((20, 1), Uniform::new(0., 25.), &mut rng);
        let yt = xsinx(&xt);
        let gp = ExactGp::<f64>::params()
            .optimizer(Optimizer::Sgd {
                learning_rate: 0.02,
                momentum: 0.8,
            })
            .n_start(1)
            .n_iters(60)
            .seed(Some(1))
            .fit(&Dataset::new(xt, yt))
            .expect("GP fitted");
        let history = gp.loss_history();
        assert_eq!(history.len(), 60);
        assert!(history[history.len() - 1] < history[0]);
        let pred = gp.predict(&array![[5.], [15.]]).expect("prediction");
        assert!(pred.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_confidence_region_covers_noisy_data() {
        let mut rng = Xoshiro256Plus::seed_from_u64(11);
        let xt = Array::random_using((50, 1), Uniform::new(0., 1.), &mut rng);
        let noise = Array::random_using(50, Normal::new(0., 0.1).unwrap(), &mut rng);
        let yt = xt.map_axis(Axis(1), |r| (2. * std::f64::consts::PI * r[0]).sin()) + noise;
        let gp = ExactGp::<f64>::params()
            .seed(Some(0))
            .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))
            .expect("GP fitted");
        let (lower, upper) = gp.confidence_region(&xt).expect("confidence");
        let mut covered = 0;
        for ((y, lo), up) in yt.iter().zip(lower.iter()).zip(upper.iter()) {
            assert!(lo < up);
            if y >= lo && y <= up {
                covered += 1;
            }
        }
        assert!(covered >= 45, "confidence region covers {covered}/50 points");
    }

    #[test]
    fn test_sample_posterior_trajectories() {
        let gp = tiny_model();
        let x = Array::linspace(-0.5, 1.5, 9).insert_axis(Axis(1));
        let mut rng = Xoshiro256Plus::seed_from_u64(5);
        let t1 = gp.sample_using(&x, 6, &mut rng).expect("samples");
        assert_eq!(t1.dim(), (9, 6));
        assert!(t1.iter().all(|v| v.is_finite()));
        let mut rng = Xoshiro256Plus::seed_from_u64(5);
        let t2 = gp.sample_using(&x, 6, &mut rng).expect("samples");
        assert_abs_diff_eq!(t1, t2);
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        assert!(ExactGp::<f64>::params().n_iters(0).check().is_err());
        assert!(ExactGp::<f64>::params().nugget(-1.0).check().is_err());
        assert!(ExactGp::<f64>::params()
            .optimizer(Optimizer::Sgd {
                learning_rate: 0.1,
                momentum: 1.0,
            })
            .check()
            .is_err());

        // lengthscale dimension mismatch is caught at fit time
        let xt = array![[0., 0.], [1., 1.], [2., 0.5]];
        let yt = arr1(&[0., 1., 0.5]);
        assert!(ExactGp::<f64>::params()
            .lengthscale_init(arr1(&[1., 1., 1.]))
            .fit(&Dataset::new(xt, yt))
            .is_err());

        // as is a training set with less than two points
        assert!(ExactGp::<f64>::params()
            .fit(&Dataset::new(array![[0.5]], arr1(&[1.0])))
            .is_err());
    }

    #[test]
    fn test_divergent_training_is_rejected() {
        // a NaN target poisons every likelihood evaluation, so no restart can win
        let xt = array![[0.], [1.], [2.], [3.]];
        let yt = arr1(&[0.5, f64::NAN, 1.5, 2.0]);
        let res = ExactGp::<f64>::params()
            .n_start(2)
            .n_iters(10)
            .seed(Some(0))
            .fit(&Dataset::new(xt, yt));
        assert!(matches!(res, Err(GpError::LikelihoodComputationError(_))));
    }

    #[cfg(feature = "persistent")]
    #[test]
    fn test_save_load() {
        let xt: Array2<f64> = Array::linspace(0., 1., 10).insert_axis(Axis(1));
        let yt = xt.map_axis(Axis(1), |r| (4. * r[0]).sin());
        let gp = ExactGp::<f64>::params()
            .n_start(1)
            .n_iters(10)
            .seed(Some(0))
            .fit(&Dataset::new(xt, yt))
            .expect("GP fitted");
        let path = std::env::temp_dir().join("surmise_gp_save_load.json");
        gp.save(&path).expect("GP saved");
        let loaded = GaussianProcess::<f64, ConstantMean, SquaredExponentialCorr>::load(&path)
            .expect("GP loaded");
        std::fs::remove_file(&path).ok();
        let x = array![[0.3], [0.6]];
        assert_abs_diff_eq!(
            gp.predict(&x).expect("prediction"),
            loaded.predict(&x).expect("prediction"),
            epsilon = 1e-15
        );
    }
}
