use faer::Mat;

use crate::dual::Dual;

/// A matrix of values together with one derivative matrix per
/// differentiation target.
#[derive(Debug, Clone)]
pub struct DualMatrix {
    value: Mat<f64>,
    jacobian: Option<Vec<Mat<f64>>>,
}

impl DualMatrix {
    /// Build from row-major duals. With `dim == 0` no Jacobian is kept.
    pub fn from_duals(nrows: usize, ncols: usize, data: &[Dual], dim: usize) -> Self {
        assert!(data.len() == nrows * ncols);
        let value = Mat::from_fn(nrows, ncols, |i, j| data[i * ncols + j].value());
        let jacobian = (dim > 0).then(|| {
            (0..dim)
                .map(|target| {
                    Mat::from_fn(nrows, ncols, |i, j| {
                        data[i * ncols + j]
                            .tangents()
                            .get(target)
                            .copied()
                            .unwrap_or(0f64)
                    })
                })
                .collect()
        });
        Self { value, jacobian }
    }

    /// A column vector.
    pub fn column(data: &[Dual], dim: usize) -> Self {
        Self::from_duals(data.len(), 1, data, dim)
    }

    pub fn value(&self) -> &Mat<f64> {
        &self.value
    }

    /// Derivative matrices, indexed by target position.
    pub fn jacobian(&self) -> Option<&[Mat<f64>]> {
        self.jacobian.as_deref()
    }

    pub fn nrows(&self) -> usize {
        self.value.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.value.ncols()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.value[(i, j)]
    }

    /// Derivative of entry `(i, j)` with respect to target `target`, or
    /// `None` without a Jacobian or for a target out of range.
    pub fn get_derivative(&self, i: usize, j: usize, target: usize) -> Option<f64> {
        self.jacobian
            .as_ref()
            .and_then(|jac| jac.get(target))
            .map(|derivative| derivative[(i, j)])
    }
}

/// Copy the plain values of row-major duals into a matrix.
pub(crate) fn values(nrows: usize, ncols: usize, data: &[Dual]) -> Mat<f64> {
    Mat::from_fn(nrows, ncols, |i, j| data[i * ncols + j].value())
}
