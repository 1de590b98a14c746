//! Periodic thinning of observation sequences.
//!
//! Linked sites share their genealogy, so panel (`b`, `n_b`) information from
//! neighbouring sites is strongly correlated. Thinning keeps the panel
//! information of one site per `period`-site window, at the window's right
//! edge, and recodes every other site to carry no panel information. The
//! distinguished genotype is kept everywhere (with `a = 2` folded to `0`),
//! and the total number of sites never changes.

use tracing::debug;

use crate::error::{Error, Result};
use crate::observation::Observation;

/// Thin `observations`, keeping one informative site per `period` sites.
///
/// `offset` is the number of sites already consumed from the first window,
/// so `offset = period - 1` makes the very first site informative. Only its
/// position within a window matters: it is reduced modulo `period`.
pub fn thin_data(observations: &[Observation], period: u64, offset: u64) -> Result<Vec<Observation>> {
    if period == 0 {
        return Err(Error::InvalidArgument {
            name: "period",
            reason: "must be at least 1",
        });
    }
    let offset = offset % period;

    let mut out = Vec::with_capacity(observations.len() + 1);
    let mut i = offset;
    for obs in observations.iter() {
        let mut span = obs.span;
        let a = if obs.a == 2 { 0 } else { obs.a };
        while span > 0 {
            if i + span < period {
                out.push(Observation::new(span, a, 0, 0));
                i += span;
                break;
            }
            let before = period - i;
            if before > 1 {
                out.push(Observation::new(before - 1, a, 0, 0));
            }
            if obs.is_unfolded_monomorphic() {
                out.push(Observation::new(1, 0, 0, obs.n_b));
            } else {
                out.push(Observation::new(1, obs.a, obs.b, obs.n_b));
            }
            span -= before;
            i = 0;
        }
    }
    debug!(
        rows_in = observations.len(),
        rows_out = out.len(),
        period,
        "thinned observations"
    );
    Ok(out)
}
