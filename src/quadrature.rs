//! Composite Gauss-Legendre quadrature over dual-valued limits.

use crate::dual::Dual;

/// Nodes and weights of the 8-point rule on `[-1, 1]` (positive half).
const NODES: [f64; 4] = [
    0.183_434_642_495_649_8,
    0.525_532_409_916_329_0,
    0.796_666_477_413_626_7,
    0.960_289_856_497_536_3,
];
const WEIGHTS: [f64; 4] = [
    0.362_683_783_378_362_0,
    0.313_706_645_877_887_3,
    0.222_381_034_453_374_5,
    0.101_228_536_290_376_3,
];

/// Number of equal panels each integration interval is split into.
pub(crate) const PANELS: usize = 4;

/// Integration points on `[lo, hi]`: `(node, weight)` pairs whose weights
/// already include the interval length.
///
/// Both the nodes and the weights are duals, so moving limits contribute to
/// the derivative of the integral.
pub(crate) fn points(lo: &Dual, hi: &Dual) -> Vec<(Dual, Dual)> {
    let width = hi.sub(lo).scale((PANELS as f64).recip());
    let half = width.scale(0.5);
    let mut out = Vec::with_capacity(PANELS * 2 * NODES.len());
    for panel in 0..PANELS {
        let center = lo.add(&width.scale(panel as f64 + 0.5));
        for (&x, &w) in NODES.iter().zip(WEIGHTS.iter()) {
            let weight = half.scale(w);
            out.push((center.add(&half.scale(x)), weight.clone()));
            out.push((center.sub(&half.scale(x)), weight));
        }
    }
    out
}
