//! Forward-mode dual numbers with a run-time number of tangents.
//!
//! A [`Dual`] carries a value and the partial derivatives of that value with
//! respect to an ordered list of differentiation targets. The tangent length
//! is chosen per session, so it lives on the heap instead of in the type.
//!
//! Arithmetic is provided through named methods rather than operator
//! overloads, which keeps every allocation visible at the call site. A dual
//! with an empty tangent vector behaves like a plain scalar and can be
//! combined with duals of any tangent length.

use itertools::izip;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dual {
    value: f64,
    tangents: Vec<f64>,
}

#[allow(clippy::should_implement_trait)]
impl Dual {
    pub fn new(value: f64, tangents: Vec<f64>) -> Self {
        Self { value, tangents }
    }

    /// A dual without tangents.
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            tangents: Vec::new(),
        }
    }

    /// The `index`-th unit tangent in a space of `dim` targets.
    pub fn variable(value: f64, index: usize, dim: usize) -> Self {
        assert!(index < dim);
        let mut tangents = vec![0f64; dim];
        tangents[index] = 1f64;
        Self { value, tangents }
    }

    /// A dual with `dim` zero tangents.
    pub fn with_zero_tangents(value: f64, dim: usize) -> Self {
        Self {
            value,
            tangents: vec![0f64; dim],
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn tangents(&self) -> &[f64] {
        &self.tangents
    }

    /// The tangents, or `None` for a plain scalar.
    pub fn jacobian(&self) -> Option<&[f64]> {
        if self.tangents.is_empty() {
            None
        } else {
            Some(&self.tangents)
        }
    }

    pub fn dim(&self) -> usize {
        self.tangents.len()
    }

    pub fn is_constant(&self) -> bool {
        self.tangents.is_empty()
    }

    /// Combine two tangent vectors as `da * x + db * y`.
    fn combine(x: &Dual, da: f64, y: &Dual, db: f64) -> Vec<f64> {
        match (x.tangents.is_empty(), y.tangents.is_empty()) {
            (true, true) => Vec::new(),
            (false, true) => x.tangents.iter().map(|t| t * da).collect(),
            (true, false) => y.tangents.iter().map(|t| t * db).collect(),
            (false, false) => {
                assert!(
                    x.tangents.len() == y.tangents.len(),
                    "dual tangent lengths differ: {} vs {}",
                    x.tangents.len(),
                    y.tangents.len()
                );
                izip!(x.tangents.iter(), y.tangents.iter())
                    .map(|(tx, ty)| tx * da + ty * db)
                    .collect()
            }
        }
    }

    /// Apply a scalar function with derivative `deriv` at `self.value`.
    fn chain(&self, value: f64, deriv: f64) -> Dual {
        Dual {
            value,
            tangents: self.tangents.iter().map(|t| t * deriv).collect(),
        }
    }

    pub fn add(&self, other: &Dual) -> Dual {
        Dual {
            value: self.value + other.value,
            tangents: Self::combine(self, 1f64, other, 1f64),
        }
    }

    pub fn sub(&self, other: &Dual) -> Dual {
        Dual {
            value: self.value - other.value,
            tangents: Self::combine(self, 1f64, other, -1f64),
        }
    }

    pub fn mul(&self, other: &Dual) -> Dual {
        Dual {
            value: self.value * other.value,
            tangents: Self::combine(self, other.value, other, self.value),
        }
    }

    pub fn div(&self, other: &Dual) -> Dual {
        let value = self.value / other.value;
        Dual {
            value,
            tangents: Self::combine(self, other.value.recip(), other, -value / other.value),
        }
    }

    pub fn neg(&self) -> Dual {
        self.chain(-self.value, -1f64)
    }

    pub fn scale(&self, factor: f64) -> Dual {
        self.chain(self.value * factor, factor)
    }

    pub fn add_scalar(&self, offset: f64) -> Dual {
        Dual {
            value: self.value + offset,
            tangents: self.tangents.clone(),
        }
    }

    pub fn recip(&self) -> Dual {
        let value = self.value.recip();
        self.chain(value, -value * value)
    }

    pub fn exp(&self) -> Dual {
        let value = self.value.exp();
        self.chain(value, value)
    }

    /// `exp(x) - 1`, accurate for small `x`.
    pub fn exp_m1(&self) -> Dual {
        self.chain(self.value.exp_m1(), self.value.exp())
    }

    pub fn ln(&self) -> Dual {
        self.chain(self.value.ln(), self.value.recip())
    }

    pub fn powi(&self, n: i32) -> Dual {
        let value = self.value.powi(n);
        let deriv = if n == 0 {
            0f64
        } else {
            n as f64 * self.value.powi(n - 1)
        };
        self.chain(value, deriv)
    }

    /// Add `other` into `self`.
    pub fn add_assign(&mut self, other: &Dual) {
        self.value += other.value;
        if other.tangents.is_empty() {
            return;
        }
        if self.tangents.is_empty() {
            self.tangents = other.tangents.clone();
            return;
        }
        assert!(self.tangents.len() == other.tangents.len());
        self.tangents
            .iter_mut()
            .zip(other.tangents.iter())
            .for_each(|(t, o)| *t += o);
    }

    /// Add `weight * other` into `self`.
    pub fn add_scaled(&mut self, other: &Dual, weight: f64) {
        self.value += weight * other.value;
        if other.tangents.is_empty() {
            return;
        }
        if self.tangents.is_empty() {
            self.tangents = vec![0f64; other.tangents.len()];
        }
        assert!(self.tangents.len() == other.tangents.len());
        self.tangents
            .iter_mut()
            .zip(other.tangents.iter())
            .for_each(|(t, o)| *t += weight * o);
    }

    /// Sum a sequence of duals.
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Dual>) -> Dual {
        let mut total = Dual::constant(0f64);
        for item in items {
            total.add_assign(item);
        }
        total
    }

    /// The larger of two duals by value.
    pub fn max_by_value<'a>(&'a self, other: &'a Dual) -> &'a Dual {
        if other.value > self.value {
            other
        } else {
            self
        }
    }

    /// The smaller of two duals by value.
    pub fn min_by_value<'a>(&'a self, other: &'a Dual) -> &'a Dual {
        if other.value < self.value {
            other
        } else {
            self
        }
    }
}

impl From<f64> for Dual {
    fn from(value: f64) -> Self {
        Dual::constant(value)
    }
}
