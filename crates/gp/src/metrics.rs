//! A module for metrics to evaluate Gaussian Process model performances
//! It implements the Q2 predictive coefficient from the following paper:
//! Marrel, Amandine, and Bertrand Iooss.
//! "Probabilistic surrogate modeling by Gaussian process: A review on recent insights in estimation and validation."
//! Reliability Engineering & System Safety 247 (2024): 110094.

use linfa::dataset::Dataset;
use linfa::{
    traits::{Fit, Predict, PredictInplace},
    Float, ParamGuard,
};
use ndarray::{Array1, Array2};

use crate::{correlation_models, mean_models, GaussianProcess, GpError, GpParams, Result};

/// A trait for Q2 predictive coefficient cross validation score
pub trait PredictScore<F, P, O>
where
    F: Float,
    P: Fit<Array2<F>, Array1<F>, GpError, Object = O> + ParamGuard,
    O: PredictInplace<Array2<F>, Array1<F>>,
{
    /// Return the training data (xt, yt)
    fn training_data(&self) -> &(Array2<F>, Array1<F>);

    /// Return the model parameters
    fn params(&self) -> P;

    /// Compute quality metric Q2 with kfold cross validation.
    ///
    /// A submodel is trained on each fold complement and evaluated on the fold,
    /// then Q2 is computed as `1 - PRESS / TSS` where PRESS is the predictive
    /// residual sum of squares over the folds and TSS the total sum of squares.
    /// The closer to one, the better the model predictions.
    fn q2_score(&self, kfold: usize) -> Result<F> {
        let (xt, yt) = self.training_data();
        let nt = xt.nrows();
        if kfold < 2 || kfold > nt {
            return Err(GpError::InvalidValueError(format!(
                "kfold should lie in [2, {nt}], got {kfold}"
            )));
        }
        let dataset = Dataset::new(xt.to_owned(), yt.to_owned());
        let yt_mean = yt.mean().unwrap();
        // Predictive Residual Sum of Squares
        let mut press = F::zero();
        // Total Sum of Squares
        let mut tss = F::zero();
        for (train, valid) in dataset.fold(kfold).into_iter() {
            let model: O = self.params().fit(&train)?;
            let pred = model.predict(valid.records());
            press += (valid.targets() - pred).mapv(|v| v * v).sum();
            tss += (valid.targets() - yt_mean).mapv(|v| v * v).sum();
        }
        Ok(F::one() - press / tss)
    }

    /// Q2 predictive coefficient with Leave-One-Out Cross-Validation
    fn looq2_score(&self) -> Result<F> {
        self.q2_score(self.training_data().0.nrows())
    }
}

impl<F, Mean, Corr> PredictScore<F, GpParams<F, Mean, Corr>, Self>
    for GaussianProcess<F, Mean, Corr>
where
    F: Float,
    Mean: mean_models::RegressionModel<F>,
    Corr: correlation_models::CorrelationModel<F>,
{
    fn training_data(&self) -> &(Array2<F>, Array1<F>) {
        &self.training_data
    }

    fn params(&self) -> GpParams<F, Mean, Corr> {
        GpParams::from(self.params.clone())
    }
}
