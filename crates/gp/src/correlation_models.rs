//! A module for correlation models to model the error term of the GP model.
//!
//! The following stationary correlation models are implemented:
//! * squared exponential,
//! * absolute exponential,
//! * matern 3/2,
//! * matern 5/2.
//!
//! All models are anisotropic: each input dimension j carries its own
//! lengthscale `l_j` and distances enter as `u_j = |d_j| / l_j`.

use linfa::Float;
use ndarray::{Array2, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// A trait for using a correlation model in GP regression
pub trait CorrelationModel<F: Float>: Clone + Copy + Default + fmt::Display + Sync {
    /// Compute correlation values r(x, x') given the absolute distances `d` between
    /// x and x' as a (n, nx) matrix and the `lengthscales` parameters (nx,).
    /// Returns the (n, 1) column of correlation values.
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F>;

    /// Compute the partial derivatives of the correlation values wrt each lengthscale,
    /// as a (n, nx) matrix: entry (i, k) is dr_i / dl_k.
    /// These derivatives drive the marginal-likelihood gradient during training.
    fn param_jacobian(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F>;
}

/// Squared exponential correlation model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialCorr();

impl From<SquaredExponentialCorr> for String {
    fn from(_item: SquaredExponentialCorr) -> String {
        "SquaredExponential".to_string()
    }
}

impl TryFrom<String> for SquaredExponentialCorr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "SquaredExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for SquaredExponentialCorr, should be 'SquaredExponential'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for SquaredExponentialCorr {
    ///   nx
    /// prod exp( - d_j^2 / (2 * l_j^2) )
    ///  j=1
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let r = u
            .mapv(|v| v * v)
            .sum_axis(Axis(1))
            .mapv(|v| F::exp(F::cast(-0.5) * v));
        r.into_shape((d.nrows(), 1)).unwrap()
    }

    /// dr/dl_k = r * u_k^2 / l_k
    fn param_jacobian(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let r = self.value(d, lengthscales);
        (&u * &u / lengthscales) * &r
    }
}

impl fmt::Display for SquaredExponentialCorr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}

/// Absolute exponential correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct AbsoluteExponentialCorr();

impl From<AbsoluteExponentialCorr> for String {
    fn from(_item: AbsoluteExponentialCorr) -> String {
        "AbsoluteExponential".to_string()
    }
}

impl TryFrom<String> for AbsoluteExponentialCorr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "AbsoluteExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for AbsoluteExponentialCorr, should be 'AbsoluteExponential'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for AbsoluteExponentialCorr {
    ///   nx
    /// prod exp( - |d_j| / l_j )
    ///  j=1
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let r = u.sum_axis(Axis(1)).mapv(|v| F::exp(-v));
        r.into_shape((d.nrows(), 1)).unwrap()
    }

    /// dr/dl_k = r * u_k / l_k
    fn param_jacobian(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let r = self.value(d, lengthscales);
        (u / lengthscales) * &r
    }
}

impl fmt::Display for AbsoluteExponentialCorr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AbsoluteExponential")
    }
}

/// Matern 3/2 correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern32Corr();

impl From<Matern32Corr> for String {
    fn from(_item: Matern32Corr) -> String {
        "Matern32".to_string()
    }
}

impl TryFrom<String> for Matern32Corr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "Matern32" {
            Ok(Self::default())
        } else {
            Err("Bad string value for Matern32Corr, should be 'Matern32'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for Matern32Corr {
    ///   nx
    /// prod (1 + sqrt(3) * u_j) exp( - sqrt(3) * u_j )
    ///  j=1
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let sqrt3 = F::cast(3.).sqrt();
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let poly = u
            .mapv(|v| F::one() + sqrt3 * v)
            .map_axis(Axis(1), |row| row.product());
        let expo = u.sum_axis(Axis(1)).mapv(|v| F::exp(-sqrt3 * v));
        (poly * expo).into_shape((d.nrows(), 1)).unwrap()
    }

    /// dr/dl_k = r * 3 * u_k^2 / (l_k * (1 + sqrt(3) * u_k))
    fn param_jacobian(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let sqrt3 = F::cast(3.).sqrt();
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let r = self.value(d, lengthscales);
        let denom = u.mapv(|v| F::one() + sqrt3 * v) * lengthscales;
        (&u * &u).mapv(|v| F::cast(3.) * v) / denom * &r
    }
}

impl fmt::Display for Matern32Corr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern32")
    }
}

/// Matern 5/2 correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern52Corr();

impl From<Matern52Corr> for String {
    fn from(_item: Matern52Corr) -> String {
        "Matern52".to_string()
    }
}

impl TryFrom<String> for Matern52Corr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "Matern52" {
            Ok(Self::default())
        } else {
            Err("Bad string value for Matern52Corr, should be 'Matern52'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for Matern52Corr {
    ///   nx
    /// prod (1 + sqrt(5) * u_j + (5/3) * u_j^2) exp( - sqrt(5) * u_j )
    ///  j=1
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let sqrt5 = F::cast(5.).sqrt();
        let div5_3 = F::cast(5. / 3.);
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let poly = u
            .mapv(|v| F::one() + sqrt5 * v + div5_3 * v * v)
            .map_axis(Axis(1), |row| row.product());
        let expo = u.sum_axis(Axis(1)).mapv(|v| F::exp(-sqrt5 * v));
        (poly * expo).into_shape((d.nrows(), 1)).unwrap()
    }

    /// dr/dl_k = r * (5/3) * u_k^2 * (1 + sqrt(5) * u_k)
    ///           / (l_k * (1 + sqrt(5) * u_k + (5/3) * u_k^2))
    fn param_jacobian(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lengthscales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let sqrt5 = F::cast(5.).sqrt();
        let div5_3 = F::cast(5. / 3.);
        let u = d.mapv(|v| v.abs()) / lengthscales;
        let r = self.value(d, lengthscales);
        let num = (&u * &u).mapv(|v| div5_3 * v) * u.mapv(|v| F::one() + sqrt5 * v);
        let denom = u.mapv(|v| F::one() + sqrt5 * v + div5_3 * v * v) * lengthscales;
        num / denom * &r
    }
}

impl fmt::Display for Matern52Corr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern52")
    }
}
