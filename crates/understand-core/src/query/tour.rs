//! Tour generation: an ordered walkthrough of a ranked lens.

use tracing::debug;

use crate::models::{Lens, LensMember, StopReason, Tour, TourStop};
use crate::query::merge::rank;

/// Dominant reason for a member: seed, then runtime hit, then error
/// proximity, otherwise a structural neighbour.
pub fn stop_reason(lens: &Lens, qualified_name: &str, member: &LensMember) -> StopReason {
    if lens.is_seed(qualified_name) {
        StopReason::Seed
    } else if member.runtime_hit {
        StopReason::RuntimeHit
    } else if let Some(distance) = member.error_proximity {
        StopReason::ErrorProximity(distance)
    } else {
        StopReason::Caller
    }
}

/// Tour stops in ranked order, produced lazily. Calling again restarts the
/// sequence from the first stop.
pub fn stops(lens: &Lens) -> impl Iterator<Item = TourStop> + '_ {
    rank(lens)
        .into_iter()
        .enumerate()
        .filter_map(move |(index, qualified_name)| {
            let member = lens.member(qualified_name)?;
            Some(TourStop {
                qualified_name: qualified_name.to_string(),
                rank: index as u32 + 1,
                reason: stop_reason(lens, qualified_name, member),
            })
        })
}

pub fn generate(lens: &Lens) -> Tour {
    let tour = Tour {
        stops: stops(lens).collect(),
    };
    debug!(stops = tour.len(), "tour generated");
    tour
}
