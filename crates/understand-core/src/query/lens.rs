//! Lens construction: seed resolution and bounded multi-source BFS.
//!
//! The call graph is walked as undirected (callees and callers). Every
//! reached function gets its minimum hop distance over all seeds; nothing
//! beyond the hop budget is included.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{info, warn};

use crate::errors::{UnderstandError, UnderstandResult};
use crate::models::{split_qualified_name, Lens, LensMember, QualifiedName, RepositoryMap};
use crate::query::guards::clamp_hops;

/// Supplier of named seed groups.
pub trait SeedPresets {
    fn preset(&self, label: &str) -> Option<Vec<String>>;
}

impl SeedPresets for BTreeMap<String, Vec<String>> {
    fn preset(&self, label: &str) -> Option<Vec<String>> {
        self.get(label).cloned()
    }
}

// ---------------------------------------------------------------------------
// Seed resolution
// ---------------------------------------------------------------------------

fn normalize_module(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let path = path.trim_start_matches("./");
    let path = path
        .strip_suffix(".py")
        .or_else(|| path.strip_suffix(".pyi"))
        .unwrap_or(path);
    path.to_string()
}

/// Whether map module `module` is the one `wanted` refers to, allowing either
/// side to be a path suffix of the other at a `/` boundary.
fn module_matches(module: &str, wanted: &str) -> bool {
    fn suffix_at_boundary(long: &str, short: &str) -> bool {
        long.strip_suffix(short)
            .is_some_and(|rest| rest.ends_with('/'))
    }
    module == wanted || suffix_at_boundary(wanted, module) || suffix_at_boundary(module, wanted)
}

fn scope_matches(scope: &str, name: &str) -> bool {
    scope == name
        || scope
            .strip_suffix(name)
            .is_some_and(|rest| rest.ends_with('.'))
}

/// Qualified names a seed token refers to, sorted.
///
/// A token is an exact qualified name, a `path:name` reference (paths may be
/// absolute or carry an extension), a `.py` file reference (every function of
/// the file) or a bare or dotted name. Names match scopes equal to them or
/// ending with `.name`, so a traceback frame `service.py:save` finds
/// `User.save`.
pub fn resolve_seed(map: &RepositoryMap, token: &str) -> Vec<QualifiedName> {
    let token = token.trim();
    if token.is_empty() {
        return Vec::new();
    }
    if map.contains(token) {
        return vec![token.to_string()];
    }

    let functions = map.functions().keys();
    if let Some((path, name)) = token.rsplit_once(':') {
        let wanted = normalize_module(path);
        return functions
            .filter(|qn| {
                let (module, scope) = split_qualified_name(qn);
                scope_matches(scope, name) && module_matches(module, &wanted)
            })
            .cloned()
            .collect();
    }
    if token.ends_with(".py") || token.ends_with(".pyi") {
        let wanted = normalize_module(token);
        return functions
            .filter(|qn| module_matches(split_qualified_name(qn).0, &wanted))
            .cloned()
            .collect();
    }
    functions
        .filter(|qn| scope_matches(split_qualified_name(qn).1, token))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Build the lens of every function within `hops` of any seed.
///
/// Seeds that resolve to nothing are logged and skipped; if none resolve the
/// lens would be empty and misleading, so that is an error.
pub fn from_seeds<S: AsRef<str>>(
    map: &RepositoryMap,
    seeds: &[S],
    hops: u32,
) -> UnderstandResult<Lens> {
    let requested = hops;
    let hops = clamp_hops(i64::from(requested));
    if hops != requested {
        warn!(requested, hops, "hop count clamped");
    }
    let mut resolved: BTreeSet<QualifiedName> = BTreeSet::new();
    for seed in seeds {
        let seed = seed.as_ref();
        let matches = resolve_seed(map, seed);
        if matches.is_empty() {
            warn!(seed, "seed did not resolve to a known function");
        }
        resolved.extend(matches);
    }
    if resolved.is_empty() {
        return Err(UnderstandError::EmptyLens {
            requested: seeds.iter().map(|s| s.as_ref().to_string()).collect(),
        });
    }

    let mut distance: BTreeMap<&str, u32> = BTreeMap::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for seed in &resolved {
        distance.insert(seed.as_str(), 0);
        queue.push_back(seed.as_str());
    }
    while let Some(current) = queue.pop_front() {
        let hop = distance[current];
        if hop >= hops {
            continue;
        }
        for next in map.neighbors(current) {
            if !distance.contains_key(next) {
                distance.insert(next, hop + 1);
                queue.push_back(next);
            }
        }
    }

    let members: BTreeMap<QualifiedName, LensMember> = distance
        .iter()
        .map(|(qn, hop)| {
            let (calls, boundary_calls): (BTreeSet<_>, BTreeSet<_>) = map
                .callees(qn)
                .map(str::to_string)
                .partition(|callee| distance.contains_key(callee.as_str()));
            let member = LensMember {
                calls,
                boundary_calls,
                ..LensMember::at_hop(*hop)
            };
            (qn.to_string(), member)
        })
        .collect();

    info!(
        seeds = resolved.len(),
        members = members.len(),
        hops,
        "lens built"
    );
    Ok(Lens {
        seeds: resolved,
        hops,
        members,
    })
}

/// Build a lens from the seed group `label` of `presets`.
pub fn preset(
    map: &RepositoryMap,
    presets: &dyn SeedPresets,
    label: &str,
    hops: u32,
) -> UnderstandResult<Lens> {
    let seeds = presets
        .preset(label)
        .ok_or_else(|| UnderstandError::UnknownPreset(label.to_string()))?;
    from_seeds(map, &seeds, hops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::testing::{chain_map, map_from_edges};

    fn hops_of(lens: &Lens) -> Vec<(&str, u32)> {
        lens.members
            .iter()
            .map(|(qn, member)| (qn.as_str(), member.hop))
            .collect()
    }

    /// Undirected all-pairs distances by repeated relaxation.
    fn reference_distances(map: &RepositoryMap, seeds: &[&str]) -> BTreeMap<String, u32> {
        let mut dist: BTreeMap<String, u32> =
            seeds.iter().map(|s| (s.to_string(), 0)).collect();
        loop {
            let mut changed = false;
            for (caller, record) in map.functions() {
                for callee in record.resolved_calls() {
                    for (a, b) in [(caller.as_str(), callee), (callee, caller.as_str())] {
                        if let Some(&d) = dist.get(a) {
                            let entry = dist.entry(b.to_string()).or_insert(u32::MAX);
                            if d + 1 < *entry {
                                *entry = d + 1;
                                changed = true;
                            }
                        }
                    }
                }
            }
            if !changed {
                return dist;
            }
        }
    }

    #[test]
    fn test_scenario_a_one_hop() {
        let lens = from_seeds(&chain_map(), &["app:A"], 1).unwrap();
        assert_eq!(hops_of(&lens), vec![("app:A", 0), ("app:B", 1)]);
        assert!(!lens.contains("app:C"));
    }

    #[test]
    fn test_scenario_b_two_hops() {
        let lens = from_seeds(&chain_map(), &["app:A"], 2).unwrap();
        assert_eq!(
            hops_of(&lens),
            vec![("app:A", 0), ("app:B", 1), ("app:C", 2)]
        );
        assert_eq!(lens.hops, 2);
        assert!(lens.is_seed("app:A"));
    }

    #[test]
    fn test_traversal_follows_callers() {
        let lens = from_seeds(&chain_map(), &["app:C"], 1).unwrap();
        assert_eq!(hops_of(&lens), vec![("app:B", 1), ("app:C", 0)]);
    }

    #[test]
    fn test_zero_hops_is_seeds_only() {
        let lens = from_seeds(&chain_map(), &["app:B"], 0).unwrap();
        assert_eq!(hops_of(&lens), vec![("app:B", 0)]);
    }

    #[test]
    fn test_seed_order_does_not_matter() {
        let map = map_from_edges(
            &[("a", "b"), ("b", "c"), ("c", "d"), ("x", "c"), ("y", "x"), ("d", "e")],
            &["lonely"],
        );
        let forward = from_seeds(&map, &["app:a", "app:y", "app:lonely"], 2).unwrap();
        let backward = from_seeds(&map, &["app:lonely", "app:y", "app:a"], 2).unwrap();
        let shuffled = from_seeds(&map, &["app:y", "app:lonely", "app:a", "app:y"], 2).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_hops_match_shortest_undirected_distance() {
        let map = map_from_edges(
            &[
                ("a", "b"),
                ("b", "c"),
                ("c", "a"),
                ("c", "d"),
                ("e", "d"),
                ("e", "f"),
                ("g", "f"),
                ("f", "h"),
                ("h", "i"),
            ],
            &["z"],
        );
        let seeds = ["app:a", "app:g"];
        let reference = reference_distances(&map, &seeds);
        for budget in 0..=4u32 {
            let lens = from_seeds(&map, &seeds, budget).unwrap();
            let expected: Vec<(&str, u32)> = reference
                .iter()
                .filter(|(_, d)| **d <= budget)
                .map(|(qn, d)| (qn.as_str(), *d))
                .collect();
            assert_eq!(hops_of(&lens), expected, "budget {budget}");
            assert!(lens.members.values().all(|m| m.hop <= budget));
        }
    }

    #[test]
    fn test_member_calls_restricted_to_lens() {
        let lens = from_seeds(&chain_map(), &["app:A"], 1).unwrap();
        let calls: Vec<&str> = lens.members["app:A"].calls.iter().map(String::as_str).collect();
        assert_eq!(calls, vec!["app:B"]);
        assert!(lens.members["app:B"].calls.is_empty());
        let boundary: Vec<&str> = lens.members["app:B"]
            .boundary_calls
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(boundary, vec!["app:C"]);
        assert!(lens.members["app:A"].boundary_calls.is_empty());
    }

    #[test]
    fn test_unresolvable_seeds() {
        let map = chain_map();
        let lens = from_seeds(&map, &["app:A", "nowhere"], 1).unwrap();
        assert_eq!(lens.seeds.len(), 1);
        let err = from_seeds(&map, &["nowhere", "app:zzz"], 1).unwrap_err();
        match err {
            UnderstandError::EmptyLens { requested } => {
                assert_eq!(requested, vec!["nowhere", "app:zzz"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let none: [&str; 0] = [];
        assert!(from_seeds(&map, &none, 1).is_err());
    }

    #[test]
    fn test_resolve_seed_forms() {
        let map = map_from_edges(
            &[
                ("pkg/service:compute", "pkg/models:User.save"),
                ("pkg/service:compute", "pkg/util:outer.inner"),
            ],
            &["other/service:compute", "pkg/models:save"],
        );
        assert_eq!(
            resolve_seed(&map, "pkg/service:compute"),
            vec!["pkg/service:compute"]
        );
        assert_eq!(
            resolve_seed(&map, "/home/ci/work/pkg/service.py:compute"),
            vec!["pkg/service:compute"]
        );
        assert_eq!(
            resolve_seed(&map, "service:compute"),
            vec!["other/service:compute", "pkg/service:compute"]
        );
        assert_eq!(
            resolve_seed(&map, "pkg/models.py"),
            vec!["pkg/models:User.save", "pkg/models:save"]
        );
        assert_eq!(
            resolve_seed(&map, "save"),
            vec!["pkg/models:User.save", "pkg/models:save"]
        );
        assert_eq!(
            resolve_seed(&map, "pkg/models.py:save"),
            vec!["pkg/models:User.save", "pkg/models:save"]
        );
        assert_eq!(resolve_seed(&map, "User.save"), vec!["pkg/models:User.save"]);
        assert_eq!(resolve_seed(&map, "inner"), vec!["pkg/util:outer.inner"]);
        assert!(resolve_seed(&map, "ave").is_empty());
        assert!(resolve_seed(&map, "ice:compute").is_empty());
        assert!(resolve_seed(&map, "  ").is_empty());
    }

    #[test]
    fn test_preset_lookup() {
        let map = chain_map();
        let mut presets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        presets.insert("tail".to_string(), vec!["app:C".to_string()]);
        let lens = preset(&map, &presets, "tail", 1).unwrap();
        assert_eq!(hops_of(&lens), vec![("app:B", 1), ("app:C", 0)]);
        assert!(matches!(
            preset(&map, &presets, "head", 1),
            Err(UnderstandError::UnknownPreset(label)) if label == "head"
        ));
    }

    #[test]
    fn test_hops_are_clamped() {
        let map = map_from_edges(
            &[("a", "b"), ("b", "c"), ("c", "d"), ("d", "e"), ("e", "f"), ("f", "g")],
            &[],
        );
        let lens = from_seeds(&map, &["app:a"], 99).unwrap();
        assert_eq!(lens.hops, 5);
        assert!(!lens.contains("app:g"));
    }
}
