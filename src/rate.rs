//! Piecewise-exponential coalescent rate functions.
//!
//! Piece `k` covers `[tau_k, tau_{k+1})`. Inside it the population size is
//! `N(t) = a_k * exp(g_k * (t - tau_k))` and the pairwise coalescence rate is
//! `1 / N(t)`. The last piece extends to infinity with constant size, which
//! keeps `R(t) -> inf` and every survival integral finite.

use crate::dual::Dual;
use crate::params::ParameterModel;
use crate::quadrature;

/// Below this magnitude of `g * dt` the closed form of a piece integral is
/// replaced by its Taylor series.
const SERIES_THRESHOLD: f64 = 1e-5;

#[derive(Debug, Clone)]
pub struct RateFunction {
    start: Vec<Dual>,
    growth: Vec<Dual>,
    breaks: Vec<Dual>,
    cumulative_at_breaks: Vec<Dual>,
    dim: usize,
}

/// `(1 - exp(-x)) / x`, continuous at zero.
fn one_minus_exp_over(x: &Dual) -> Dual {
    if x.value().abs() < SERIES_THRESHOLD {
        let x2 = x.mul(x);
        x.scale(-0.5)
            .add(&x2.scale(1. / 6.))
            .sub(&x2.mul(x).scale(1. / 24.))
            .add_scalar(1.)
    } else {
        x.neg().exp_m1().neg().div(x)
    }
}

impl RateFunction {
    pub fn new(model: &ParameterModel) -> Self {
        let pieces = model.num_pieces();
        let dim = model.num_targets();
        let zero = || {
            if dim == 0 {
                Dual::constant(0.)
            } else {
                Dual::with_zero_tangents(0., dim)
            }
        };

        let mut start = Vec::with_capacity(pieces);
        let mut growth = Vec::with_capacity(pieces);
        let mut breaks = Vec::with_capacity(pieces);
        let mut cumulative_at_breaks = Vec::with_capacity(pieces);

        let mut tau = zero();
        let mut cum = zero();
        for k in 0..pieces {
            let a = model.start_size(k).clone();
            breaks.push(tau.clone());
            cumulative_at_breaks.push(cum.clone());
            let g = if k + 1 < pieces {
                let span = model
                    .span(k)
                    .cloned()
                    .unwrap_or_else(|| Dual::constant(1.));
                let g = model.end_size(k).div(&a).ln().div(&span);
                cum = cum.add(&Self::piece_integral(&a, &g, &span));
                tau = tau.add(&span);
                g
            } else {
                zero()
            };
            start.push(a);
            growth.push(g);
        }

        Self {
            start,
            growth,
            breaks,
            cumulative_at_breaks,
            dim,
        }
    }

    /// `integral_0^dt exp(-g u) / a du`.
    fn piece_integral(a: &Dual, g: &Dual, dt: &Dual) -> Dual {
        dt.div(a).mul(&one_minus_exp_over(&g.mul(dt)))
    }

    pub fn num_pieces(&self) -> usize {
        self.start.len()
    }

    /// Tangent length of every value this function produces.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Start of each piece; the first entry is zero.
    pub fn breakpoints(&self) -> &[Dual] {
        &self.breaks
    }

    fn piece_of(&self, t: f64) -> usize {
        self.breaks
            .partition_point(|b| b.value() <= t)
            .saturating_sub(1)
    }

    /// Coalescence rate `1 / N(t)`.
    pub fn rate(&self, t: &Dual) -> Dual {
        let k = self.piece_of(t.value());
        let dt = t.sub(&self.breaks[k]);
        self.growth[k].mul(&dt).neg().exp().div(&self.start[k])
    }

    /// Cumulative rate `R(t)`.
    pub fn cumulative(&self, t: &Dual) -> Dual {
        let k = self.piece_of(t.value());
        let dt = t.sub(&self.breaks[k]);
        self.cumulative_at_breaks[k].add(&Self::piece_integral(
            &self.start[k],
            &self.growth[k],
            &dt,
        ))
    }

    /// Plain-valued `R(t)`.
    pub fn cumulative_value(&self, t: f64) -> f64 {
        self.cumulative(&Dual::constant(t)).value()
    }

    /// Probability that a pair has not coalesced by time `t`.
    pub fn survival(&self, t: &Dual) -> Dual {
        self.cumulative(t).neg().exp()
    }

    /// `S(t)` with `S(inf) = 0`.
    pub fn survival_at(&self, t: Option<f64>) -> Dual {
        match t {
            Some(t) => self.survival(&Dual::constant(t)),
            None => self.zero(),
        }
    }

    fn zero(&self) -> Dual {
        if self.dim == 0 {
            Dual::constant(0.)
        } else {
            Dual::with_zero_tangents(0., self.dim)
        }
    }

    /// Split `[lo, hi)` at the breakpoints. `hi = None` means infinity; only
    /// the last piece can be unbounded.
    fn segments(&self, lo: &Dual, hi: Option<&Dual>) -> Vec<(usize, Dual, Option<Dual>)> {
        let mut out = Vec::new();
        let last = self.num_pieces() - 1;
        for k in self.piece_of(lo.value())..=last {
            let seg_lo = lo.max_by_value(&self.breaks[k]).clone();
            let seg_hi = match (hi, self.breaks.get(k + 1)) {
                (Some(hi), Some(next)) => Some(hi.min_by_value(next).clone()),
                (Some(hi), None) => Some(hi.clone()),
                (None, Some(next)) => Some(next.clone()),
                (None, None) => None,
            };
            if let Some(seg_hi) = seg_hi.as_ref() {
                if seg_hi.value() <= seg_lo.value() {
                    break;
                }
            }
            out.push((k, seg_lo, seg_hi));
        }
        out
    }

    /// `integral_lo^hi exp(-c R(t)) dt` for every `c` in `powers`.
    ///
    /// The unbounded tail on the constant last piece is integrated in closed
    /// form; everything else uses composite Gauss-Legendre quadrature.
    pub fn integrate_survival(&self, powers: &[f64], lo: &Dual, hi: Option<&Dual>) -> Vec<Dual> {
        self.survival_integrals(powers, lo, hi, &self.zero())
    }

    /// `integral_lo^hi exp(-c (R(t) - shift)) dt`. With `shift = R(lo)` the
    /// integrand stays in `(0, 1]` however large `R` gets.
    fn survival_integrals(
        &self,
        powers: &[f64],
        lo: &Dual,
        hi: Option<&Dual>,
        shift: &Dual,
    ) -> Vec<Dual> {
        let mut totals = vec![self.zero(); powers.len()];
        let last = self.num_pieces() - 1;
        for (k, seg_lo, seg_hi) in self.segments(lo, hi) {
            if k == last {
                let a = &self.start[k];
                let r_lo = self.cumulative(&seg_lo).sub(shift);
                for (total, &c) in totals.iter_mut().zip(powers) {
                    // exp(-c R(lo)) * a / c * (1 - exp(-c (hi - lo) / a))
                    let mut term = r_lo.scale(-c).exp().mul(a).scale(c.recip());
                    if let Some(seg_hi) = seg_hi.as_ref() {
                        let decay = seg_hi.sub(&seg_lo).div(a).scale(-c).exp_m1().neg();
                        term = term.mul(&decay);
                    }
                    total.add_assign(&term);
                }
                continue;
            }
            let Some(seg_hi) = seg_hi else { continue };
            for (t, w) in quadrature::points(&seg_lo, &seg_hi) {
                let r = self.cumulative(&t).sub(shift);
                for (total, &c) in totals.iter_mut().zip(powers) {
                    total.add_assign(&r.scale(-c).exp().mul(&w));
                }
            }
        }
        totals
    }

    /// `integral_lo^hi exp(R(u) - R(hi)) du`, that is `S(hi)` times the
    /// integral of `1 / S` over a bounded interval. The result never exceeds
    /// `hi - lo`.
    pub fn integrate_inverse_survival(&self, lo: &Dual, hi: &Dual) -> Dual {
        let mut total = self.zero();
        let r_top = self.cumulative(hi);
        let last = self.num_pieces() - 1;
        for (k, seg_lo, seg_hi) in self.segments(lo, Some(hi)) {
            let Some(seg_hi) = seg_hi else { continue };
            if k == last {
                // a * (exp(R(seg_hi) - R(hi)) - exp(R(seg_lo) - R(hi)))
                let a = &self.start[k];
                let r_lo = self.cumulative(&seg_lo).sub(&r_top);
                let r_hi = self.cumulative(&seg_hi).sub(&r_top);
                total.add_assign(&a.mul(&r_hi.exp().sub(&r_lo.exp())));
                continue;
            }
            for (u, w) in quadrature::points(&seg_lo, &seg_hi) {
                total.add_assign(&self.cumulative(&u).sub(&r_top).exp().mul(&w));
            }
        }
        total
    }

    /// Expected pair coalescence time given it falls in `[lo, hi)`.
    ///
    /// Everything is taken relative to `S(lo)`, so the mean stays finite
    /// when `S(lo)` itself underflows:
    /// `E[T | lo <= T < hi] = lo + (integral_lo^hi S / S(lo) - (hi - lo) q) / (1 - q)`
    /// with `q = S(hi) / S(lo)`.
    pub fn conditional_time(&self, lo: f64, hi: Option<f64>) -> Dual {
        let lo_d = Dual::constant(lo);
        let hi_d = hi.map(Dual::constant);
        let r_lo = self.cumulative(&lo_d);
        let integral = self
            .survival_integrals(&[1.], &lo_d, hi_d.as_ref(), &r_lo)
            .swap_remove(0);
        let (excess, mass) = match hi_d.as_ref() {
            Some(hi_d) => {
                let gap = self.cumulative(hi_d).sub(&r_lo);
                let ratio = gap.neg().exp();
                let excess = integral.sub(&ratio.scale(hi_d.value() - lo));
                (excess, gap.neg().exp_m1().neg())
            }
            None => (integral, Dual::constant(1.)),
        };
        excess.div(&mass).add_scalar(lo)
    }
}
