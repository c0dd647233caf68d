//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression,
//! also known as [Kriging](https://en.wikipedia.org/wiki/Kriging) models.
//!
//! A model is defined by a trend (or mean) function and a correlation kernel whose
//! hyperparameters (lengthscales, output scale, noise variance) are trained by gradient
//! descent on the negative log marginal likelihood of the training data. Once trained
//! the model predicts the posterior mean and variance at unseen points, from which a
//! confidence region can be drawn, and posterior trajectories can be sampled.
//!
//! GP methods are implemented by [GaussianProcess] parameterized by [GpParams].
//! [ExactGp] gives access to default settings, namely a constant mean together
//! with a squared exponential kernel.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod correlation_models;
mod errors;
pub mod mean_models;
pub mod metrics;

mod parameters;
mod utils;

mod optimization;

pub use algorithm::*;
pub use errors::*;
pub use parameters::*;
