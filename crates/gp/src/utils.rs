use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A structure to store (n, xdim) matrix data and its mean and standard deviation vectors.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub(crate) struct NormalizedData<F: Float> {
    /// normalized data
    pub data: Array2<F>,
    /// mean vector computed from data
    pub mean: Array1<F>,
    /// standard deviation vector computed from data
    pub std: Array1<F>,
}

impl<F: Float> NormalizedData<F> {
    /// Normalize the given data to zero mean and unit standard deviation.
    pub fn new(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> NormalizedData<F> {
        let (data, mean, std) = normalize(x);
        NormalizedData { data, mean, std }
    }

    /// Dimension of data points
    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }
}

/// Column-wise zero-mean unit-std normalization.
/// Constant columns get a unit standard deviation to avoid division by zero.
pub fn normalize<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> (Array2<F>, Array1<F>, Array1<F>) {
    let x_mean = x.mean_axis(Axis(0)).unwrap();
    let mut x_std = x.std_axis(Axis(0), F::one());
    x_std.mapv_inplace(|v| if v == F::zero() { F::one() } else { v });
    let xnorm = (x - &x_mean) / &x_std;

    (xnorm, x_mean, x_std)
}

/// A structure to retain absolute differences computation used to compute covariance matrices.
/// Only the `n_obs * (n_obs - 1) / 2` upper-triangle pairs are stored; `d_indices` maps each
/// compressed row back to its (row, col) position in the full symmetric matrix.
#[derive(Debug)]
pub struct DiffMatrix<F: Float> {
    /// Differences as a (n_obs * (n_obs - 1) / 2, nx) array
    pub d: Array2<F>,
    /// Indices of the differences in the original data array
    pub d_indices: Array2<usize>,
    /// Number of observations
    pub n_obs: usize,
}

impl<F: Float> DiffMatrix<F> {
    /// Compute pairwise absolute differences of points given as a (n_obs, nx) array
    pub fn new(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> DiffMatrix<F> {
        let (d, d_indices) = Self::cross_diff(x);
        let n_obs = x.nrows();

        DiffMatrix {
            d,
            d_indices,
            n_obs,
        }
    }

    fn cross_diff(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> (Array2<F>, Array2<usize>) {
        let n_obs = x.nrows();
        let nx = x.ncols();
        let n_pairs = n_obs * (n_obs - 1) / 2;
        let mut d = Array2::zeros((n_pairs, nx));
        let mut indices = Array2::<usize>::zeros((n_pairs, 2));
        let mut row = 0;
        for k in 0..n_obs - 1 {
            for i in k + 1..n_obs {
                let diff = (&x.row(k) - &x.row(i)).mapv(|v| v.abs());
                d.row_mut(row).assign(&diff);
                indices[[row, 0]] = k;
                indices[[row, 1]] = i;
                row += 1;
            }
        }

        (d, indices)
    }

    /// Scatter per-pair values back into the full symmetric (n_obs, n_obs) matrix
    /// with the given diagonal value.
    pub fn expand_sym(&self, values: &ArrayBase<impl Data<Elem = F>, Ix1>, diag: F) -> Array2<F> {
        let mut full = Array2::<F>::zeros((self.n_obs, self.n_obs));
        full.diag_mut().fill(diag);
        for (row, pair) in self.d_indices.outer_iter().enumerate() {
            full[[pair[0], pair[1]]] = values[row];
            full[[pair[1], pair[0]]] = values[row];
        }
        full
    }
}

/// Computes differences between each row of x and each row of y
/// resulting in a 2d array of shape (nrows(x) * nrows(y), ncols(x));
/// *Panics* if x and y have not the same column numbers
pub fn pairwise_differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    assert!(x.ncols() == y.ncols());

    let nx = x.nrows();
    let ny = y.nrows();
    let ncols = x.ncols();
    let mut result = Array2::zeros((nx * ny, ncols));

    for (i, x_row) in x.rows().into_iter().enumerate() {
        for (j, y_row) in y.rows().into_iter().enumerate() {
            let idx = i * ny + j;
            for k in 0..ncols {
                result[[idx, k]] = x_row[k] - y_row[k];
            }
        }
    }

    result
}
