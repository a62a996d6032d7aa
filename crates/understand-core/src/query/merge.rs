//! Folding a runtime trace into a lens, and ranking the result.
//!
//! Merging replaces every runtime field from the given trace, so merging the
//! same trace twice is a no-op. Error proximity is a reverse BFS over the
//! directed `calls` edges of the lens, seeded by the functions where the
//! trace recorded an exception. A site just outside the lens still counts:
//! members calling it directly start at distance 1.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

use tracing::{debug, info};

use crate::models::{EventKind, Lens, Trace};

/// Directed call distance from every lens member that can reach an exception
/// site to its nearest site.
fn error_distances<'a>(lens: &'a Lens, sites: &BTreeSet<&str>) -> BTreeMap<&'a str, u32> {
    let mut callers_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (caller, member) in &lens.members {
        for callee in &member.calls {
            callers_of
                .entry(callee.as_str())
                .or_default()
                .push(caller.as_str());
        }
    }

    let mut distance: BTreeMap<&str, u32> = BTreeMap::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut outside: BTreeSet<&str> = BTreeSet::new();
    for site in sites {
        match lens.members.get_key_value(*site) {
            Some((name, _)) => {
                distance.insert(name.as_str(), 0);
                queue.push_back(name.as_str());
            }
            None => {
                outside.insert(*site);
            }
        }
    }
    if !outside.is_empty() {
        for (name, member) in &lens.members {
            let calls_site = member
                .boundary_calls
                .iter()
                .any(|callee| outside.contains(callee.as_str()));
            if calls_site && !distance.contains_key(name.as_str()) {
                distance.insert(name.as_str(), 1);
                queue.push_back(name.as_str());
            }
        }
        debug!(sites = outside.len(), "exception sites outside the lens");
    }
    while let Some(current) = queue.pop_front() {
        let next_distance = distance[current] + 1;
        for caller in callers_of.get(current).into_iter().flatten().copied() {
            if !distance.contains_key(caller) {
                distance.insert(caller, next_distance);
                queue.push_back(caller);
            }
        }
    }
    distance
}

/// A new lens carrying the runtime signal of `trace`.
pub fn merge(lens: &Lens, trace: &Trace) -> Lens {
    let started = Instant::now();
    let seen: BTreeSet<&str> = trace
        .events
        .iter()
        .map(|event| event.qualified_name.as_str())
        .collect();
    let counts = trace.call_counts();
    let sites = trace.exception_sites();
    let proximity = error_distances(lens, &sites);

    let mut merged = lens.clone();
    let mut hits = 0usize;
    for (qn, member) in merged.members.iter_mut() {
        member.runtime_hit = seen.contains(qn.as_str());
        member.call_count = counts.get(qn.as_str()).copied().unwrap_or(0);
        member.error_proximity = proximity.get(qn.as_str()).copied();
        hits += usize::from(member.runtime_hit);
    }

    info!(
        members = merged.members.len(),
        runtime_hits = hits,
        exception_sites = sites.len(),
        exceptions = trace
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Exception)
            .count(),
        truncated = trace.truncated,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "trace merged into lens"
    );
    merged
}

/// Lens members in ranked order: ascending error proximity (unreachable
/// last), then ascending hop, then name.
pub fn rank(lens: &Lens) -> Vec<&str> {
    let mut ranked: Vec<(&str, Option<u32>, u32)> = lens
        .members
        .iter()
        .map(|(qn, member)| (qn.as_str(), member.error_proximity, member.hop))
        .collect();
    ranked.sort_by(|a, b| {
        (a.1.is_none(), a.1, a.2, a.0).cmp(&(b.1.is_none(), b.1, b.2, b.0))
    });
    ranked.into_iter().map(|(qn, _, _)| qn).collect()
}
