//! Why a function is part of a lens, with its neighbourhood in the map.

use serde::Serialize;

use crate::models::{Lens, QualifiedName, RepositoryMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Explanation {
    pub qualified_name: QualifiedName,
    pub reasons: Vec<String>,
    pub callers: Vec<QualifiedName>,
    pub callees: Vec<QualifiedName>,
    /// Callee expressions the scanner could not resolve.
    pub unresolved: Vec<String>,
    pub side_effects: Vec<String>,
}

/// Explain lens member `qualified_name`; `None` when it is not a member.
pub fn explain(qualified_name: &str, lens: &Lens, map: &RepositoryMap) -> Option<Explanation> {
    let member = lens.member(qualified_name)?;

    let mut reasons = Vec::new();
    if lens.is_seed(qualified_name) {
        reasons.push("seed".to_string());
    } else {
        reasons.push(format!("{} hop(s) from the nearest seed", member.hop));
    }
    if member.runtime_hit {
        reasons.push(format!("runtime hit ({} calls)", member.call_count));
    }
    if let Some(distance) = member.error_proximity {
        reasons.push(format!("error proximity {distance}"));
    }

    let record = map.get(qualified_name);
    Some(Explanation {
        qualified_name: qualified_name.to_string(),
        reasons,
        callers: map.callers(qualified_name).map(str::to_string).collect(),
        callees: map.callees(qualified_name).map(str::to_string).collect(),
        unresolved: record
            .map(|r| r.unresolved_calls().map(|c| c.label().to_string()).collect())
            .unwrap_or_default(),
        side_effects: record
            .map(|r| r.side_effects.iter().cloned().collect())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallTarget;
    use crate::query::lens::from_seeds;
    use crate::query::testing::{chain_map, map_from_edges};

    #[test]
    fn test_explain_seed_and_neighbours() {
        let map = chain_map();
        let lens = from_seeds(&map, &["app:B"], 1).unwrap();
        let explanation = explain("app:B", &lens, &map).unwrap();
        assert_eq!(explanation.reasons, vec!["seed"]);
        assert_eq!(explanation.callers, vec!["app:A"]);
        assert_eq!(explanation.callees, vec!["app:C"]);
        assert!(explain("app:missing", &lens, &map).is_none());
    }

    #[test]
    fn test_explain_runtime_signal() {
        let map = chain_map();
        let mut lens = from_seeds(&map, &["app:A"], 2).unwrap();
        if let Some(member) = lens.members.get_mut("app:C") {
            member.runtime_hit = true;
            member.call_count = 3;
            member.error_proximity = Some(0);
        }
        let explanation = explain("app:C", &lens, &map).unwrap();
        assert_eq!(
            explanation.reasons,
            vec![
                "2 hop(s) from the nearest seed",
                "runtime hit (3 calls)",
                "error proximity 0",
            ]
        );
        assert!(explanation.callees.is_empty());
    }

    #[test]
    fn test_explain_lists_unresolved_and_side_effects() {
        let map = map_from_edges(&[("a", "b")], &[]);
        let mut functions = map.functions().clone();
        if let Some(record) = functions.get_mut("app:a") {
            record.calls.insert(CallTarget::unresolved("requests.get"));
            record.side_effects.insert("network".to_string());
        }
        let map = RepositoryMap::new(map.language(), functions);
        let lens = from_seeds(&map, &["app:a"], 0).unwrap();
        let explanation = explain("app:a", &lens, &map).unwrap();
        assert_eq!(explanation.unresolved, vec!["requests.get"]);
        assert_eq!(explanation.side_effects, vec!["network"]);
        assert_eq!(explanation.callees, vec!["app:b"]);
    }
}
