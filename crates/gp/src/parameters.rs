use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::mean_models::RegressionModel;
use crate::{GP_OPTIM_N_START, GP_TRAIN_N_ITERS};
use linfa::{Float, ParamGuard};

use ndarray::{array, Array1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// An enum to represent the tuning of the anisotropic lengthscales
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum LengthscaleTuning<F: Float> {
    /// Constant parameter (ie given not estimated)
    Fixed(Array1<F>),
    /// Parameter is optimized between given bounds (lower, upper) starting from the initial guess
    Optimized {
        /// Initial guess for the lengthscales
        init: Array1<F>,
        /// Bounds applied to every lengthscale component (lower, upper)
        bounds: (F, F),
    },
}

impl<F: Float> Default for LengthscaleTuning<F> {
    fn default() -> Self {
        LengthscaleTuning::Optimized {
            init: array![F::cast(LengthscaleTuning::<F>::DEFAULT_INIT)],
            bounds: (
                F::cast(LengthscaleTuning::<F>::DEFAULT_BOUNDS.0),
                F::cast(LengthscaleTuning::<F>::DEFAULT_BOUNDS.1),
            ),
        }
    }
}

impl<F: Float> LengthscaleTuning<F> {
    /// Default initial lengthscale value
    pub const DEFAULT_INIT: f64 = 1.;
    /// Default bounds for lengthscale values
    pub const DEFAULT_BOUNDS: (f64, f64) = (1e-2, 1e2);

    /// Get initial lengthscale values
    pub fn init(&self) -> &Array1<F> {
        match self {
            LengthscaleTuning::Optimized { init, bounds: _ } => init,
            LengthscaleTuning::Fixed(init) => init,
        }
    }

    /// Get lengthscale bounds, `None` when fixed
    pub fn bounds(&self) -> Option<(F, F)> {
        match self {
            LengthscaleTuning::Optimized { init: _, bounds } => Some(*bounds),
            LengthscaleTuning::Fixed(_) => None,
        }
    }
}

/// An enum to specify how a variance parameter is handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum VarianceConfig<F: Float> {
    /// Constant parameter (ie given not estimated)
    Fixed(F),
    /// Parameter is optimized between given bounds (lower, upper) starting from the initial guess
    Estimated {
        /// Initial guess parameter value
        init: F,
        /// Bounds of the optimized parameter (lower, upper)
        bounds: (F, F),
    },
}

impl<F: Float> Default for VarianceConfig<F> {
    fn default() -> VarianceConfig<F> {
        Self::Estimated {
            init: F::cast(1e-2),
            bounds: (F::cast(1e-8), F::cast(1e2)),
        }
    }
}

impl<F: Float> VarianceConfig<F> {
    /// Get initial variance value
    pub fn init(&self) -> F {
        match self {
            VarianceConfig::Fixed(v) => *v,
            VarianceConfig::Estimated { init, bounds: _ } => *init,
        }
    }

    /// Get variance bounds, `None` when fixed
    pub fn bounds(&self) -> Option<(F, F)> {
        match self {
            VarianceConfig::Fixed(_) => None,
            VarianceConfig::Estimated { init: _, bounds } => Some(*bounds),
        }
    }

    /// Whether the parameter is adjusted during training
    pub fn is_estimated(&self) -> bool {
        matches!(self, VarianceConfig::Estimated { .. })
    }
}

/// Gradient-descent flavour used to adjust the hyperparameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Optimizer<F: Float> {
    /// Adaptive moment estimation
    Adam {
        /// Step size
        learning_rate: F,
    },
    /// Plain stochastic gradient descent with momentum
    Sgd {
        /// Step size
        learning_rate: F,
        /// Momentum factor in `[0, 1)`, `0` disables momentum
        momentum: F,
    },
}

impl<F: Float> Default for Optimizer<F> {
    fn default() -> Optimizer<F> {
        Optimizer::Adam {
            learning_rate: F::cast(0.1),
        }
    }
}

impl<F: Float> Optimizer<F> {
    /// Get the configured step size
    pub fn learning_rate(&self) -> F {
        match self {
            Optimizer::Adam { learning_rate } => *learning_rate,
            Optimizer::Sgd {
                learning_rate,
                momentum: _,
            } => *learning_rate,
        }
    }
}

/// A set of validated GP parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Mean: Serialize, Corr: Serialize",
        deserialize = "F: Deserialize<'de>, Mean: Deserialize<'de>, Corr: Deserialize<'de>"
    ))
)]
pub struct GpValidParams<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> {
    /// Parameter tuning of the correlation lengthscales
    pub(crate) lengthscale_tuning: LengthscaleTuning<F>,
    /// Handling of the process variance (aka outputscale)
    pub(crate) outputscale: VarianceConfig<F>,
    /// Handling of the gaussian observation noise variance
    pub(crate) noise: VarianceConfig<F>,
    /// Regression model representing the mean(x)
    pub(crate) mean: Mean,
    /// Correlation model representing the spatial correlation between errors at e(x) and e(x')
    pub(crate) corr: Corr,
    /// Gradient-descent flavour used during likelihood maximization
    pub(crate) optimizer: Optimizer<F>,
    /// Number of gradient-descent steps per restart
    pub(crate) n_iters: usize,
    /// Number of likelihood optimization restarts
    pub(crate) n_start: usize,
    /// Random generator seed for the multistart draws
    pub(crate) seed: Option<u64>,
    /// Parameter to improve numerical stability
    pub(crate) nugget: F,
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> Default
    for GpValidParams<F, Mean, Corr>
{
    fn default() -> GpValidParams<F, Mean, Corr> {
        GpValidParams {
            lengthscale_tuning: LengthscaleTuning::default(),
            outputscale: VarianceConfig::Estimated {
                init: F::one(),
                bounds: (F::cast(1e-6), F::cast(1e2)),
            },
            noise: VarianceConfig::default(),
            mean: Mean::default(),
            corr: Corr::default(),
            optimizer: Optimizer::default(),
            n_iters: GP_TRAIN_N_ITERS,
            n_start: GP_OPTIM_N_START,
            seed: None,
            nugget: F::cast(100.0) * F::epsilon(),
        }
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> GpValidParams<F, Mean, Corr> {
    /// Get mean model
    pub fn mean(&self) -> &Mean {
        &self.mean
    }

    /// Get correlation corr k(x, x')
    pub fn corr(&self) -> &Corr {
        &self.corr
    }

    /// Get lengthscale tuning
    pub fn lengthscale_tuning(&self) -> &LengthscaleTuning<F> {
        &self.lengthscale_tuning
    }

    /// Get process variance configuration
    pub fn outputscale_config(&self) -> &VarianceConfig<F> {
        &self.outputscale
    }

    /// Get noise variance configuration
    pub fn noise_config(&self) -> &VarianceConfig<F> {
        &self.noise
    }

    /// Get the gradient-descent flavour
    pub fn optimizer(&self) -> &Optimizer<F> {
        &self.optimizer
    }

    /// Get the number of gradient-descent steps per restart
    pub fn n_iters(&self) -> usize {
        self.n_iters
    }

    /// Get the number of likelihood optimization restarts
    pub fn n_start(&self) -> usize {
        self.n_start
    }

    /// Get seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }

    /// Get the numerical stability parameter
    pub fn nugget(&self) -> F {
        self.nugget
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [GP algorithm](struct.GaussianProcess.html).
pub struct GpParams<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>>(
    GpValidParams<F, Mean, Corr>,
);

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> GpParams<F, Mean, Corr> {
    /// A constructor for GP parameters given mean and correlation models
    pub fn new(mean: Mean, corr: Corr) -> GpParams<F, Mean, Corr> {
        Self(GpValidParams {
            mean,
            corr,
            ..Default::default()
        })
    }

    /// A constructor for GP parameters from validated parameters
    pub fn new_from_valid(params: &GpValidParams<F, Mean, Corr>) -> Self {
        Self(params.clone())
    }

    /// Set mean model.
    pub fn mean(mut self, mean: Mean) -> Self {
        self.0.mean = mean;
        self
    }

    /// Set correlation model.
    pub fn corr(mut self, corr: Corr) -> Self {
        self.0.corr = corr;
        self
    }

    /// Set initial lengthscale values.
    ///
    /// When lengthscales are optimized, the internal optimization is started from `init`.
    /// When lengthscales are fixed, this sets their constant values.
    /// Either a single value broadcast over all input dimensions or one value per dimension.
    pub fn lengthscale_init(mut self, init: Array1<F>) -> Self {
        self.0.lengthscale_tuning = match self.0.lengthscale_tuning {
            LengthscaleTuning::Optimized { init: _, bounds } => {
                LengthscaleTuning::Optimized { init, bounds }
            }
            LengthscaleTuning::Fixed(_) => LengthscaleTuning::Fixed(init),
        };
        self
    }

    /// Set the lengthscale search interval.
    ///
    /// This function is no-op when lengthscale tuning is fixed
    pub fn lengthscale_bounds(mut self, bounds: (F, F)) -> Self {
        self.0.lengthscale_tuning = match self.0.lengthscale_tuning {
            LengthscaleTuning::Optimized { init, bounds: _ } => {
                LengthscaleTuning::Optimized { init, bounds }
            }
            LengthscaleTuning::Fixed(f) => LengthscaleTuning::Fixed(f),
        };
        self
    }

    /// Set lengthscale tuning
    pub fn lengthscale_tuning(mut self, lengthscale_tuning: LengthscaleTuning<F>) -> Self {
        self.0.lengthscale_tuning = lengthscale_tuning;
        self
    }

    /// Set the process variance configuration.
    pub fn outputscale(mut self, config: VarianceConfig<F>) -> Self {
        self.0.outputscale = config;
        self
    }

    /// Set the noise variance configuration defining noise handling.
    ///
    /// Use a small `VarianceConfig::Fixed` value (eg `1e-12`) to get an
    /// interpolating model on noiseless data.
    pub fn noise_variance(mut self, config: VarianceConfig<F>) -> Self {
        self.0.noise = config;
        self
    }

    /// Set the gradient-descent flavour used during likelihood maximization.
    pub fn optimizer(mut self, optimizer: Optimizer<F>) -> Self {
        self.0.optimizer = optimizer;
        self
    }

    /// Set the number of gradient-descent steps per restart
    pub fn n_iters(mut self, n_iters: usize) -> Self {
        self.0.n_iters = n_iters;
        self
    }

    /// Set the number of internal GP hyperparameter optimization restarts
    pub fn n_start(mut self, n_start: usize) -> Self {
        self.0.n_start = n_start;
        self
    }

    /// Set the seed of the random generator drawing the multistart points.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }

    /// Set nugget.
    ///
    /// Nugget is used to improve numerical stability
    pub fn nugget(mut self, nugget: F) -> Self {
        self.0.nugget = nugget;
        self
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>>
    From<GpValidParams<F, Mean, Corr>> for GpParams<F, Mean, Corr>
{
    fn from(valid: GpValidParams<F, Mean, Corr>) -> Self {
        GpParams(valid)
    }
}

impl<F: Float, Mean: RegressionModel<F>, Corr: CorrelationModel<F>> ParamGuard
    for GpParams<F, Mean, Corr>
{
    type Checked = GpValidParams<F, Mean, Corr>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.n_iters == 0 {
            return Err(GpError::InvalidValueError(
                "`n_iters` cannot be 0!".to_string(),
            ));
        }
        if self.0.n_start == 0 {
            return Err(GpError::InvalidValueError(
                "`n_start` cannot be 0!".to_string(),
            ));
        }
        if self.0.nugget < F::zero() {
            return Err(GpError::InvalidValueError(
                "`nugget` cannot be negative".to_string(),
            ));
        }
        if self.0.optimizer.learning_rate() <= F::zero() {
            return Err(GpError::InvalidValueError(format!(
                "learning rate should be positive, got {}",
                self.0.optimizer.learning_rate()
            )));
        }
        if let Optimizer::Sgd { momentum, .. } = self.0.optimizer {
            if momentum < F::zero() || momentum >= F::one() {
                return Err(GpError::InvalidValueError(format!(
                    "momentum should lie in [0, 1), got {momentum}"
                )));
            }
        }
        let init = self.0.lengthscale_tuning.init();
        if init.iter().any(|v| *v <= F::zero()) {
            return Err(GpError::InvalidValueError(format!(
                "lengthscales should be positive, got {init}"
            )));
        }
        if let Some((lo, up)) = self.0.lengthscale_tuning.bounds() {
            if lo <= F::zero() || up <= lo {
                return Err(GpError::InvalidValueError(format!(
                    "bad lengthscale bounds, expected 0 < lower < upper, got ({lo}, {up})"
                )));
            }
        }
        for (name, config) in [("outputscale", &self.0.outputscale), ("noise", &self.0.noise)] {
            if config.init() <= F::zero() {
                return Err(GpError::InvalidValueError(format!(
                    "`{name}` variance should be positive, got {}",
                    config.init()
                )));
            }
            if let Some((lo, up)) = config.bounds() {
                if lo <= F::zero() || up <= lo {
                    return Err(GpError::InvalidValueError(format!(
                        "bad `{name}` bounds, expected 0 < lower < upper, got ({lo}, {up})"
                    )));
                }
            }
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
