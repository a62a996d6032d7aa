//! Map fixtures shared by the query tests.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{CallTarget, FunctionRecord, RepositoryMap, LANGUAGE_PYTHON};

/// Map whose functions are the nodes named in `edges` plus `isolated`, with
/// one resolved call per edge. Names without `:` are placed in module `app`.
pub(crate) fn map_from_edges(edges: &[(&str, &str)], isolated: &[&str]) -> RepositoryMap {
    let qualify = |name: &str| {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("app:{name}")
        }
    };
    let mut functions: BTreeMap<String, FunctionRecord> = BTreeMap::new();
    let nodes = edges
        .iter()
        .flat_map(|(a, b)| [*a, *b])
        .chain(isolated.iter().copied());
    for (line, node) in nodes.enumerate() {
        let name = qualify(node);
        let (module, _) = name.split_once(':').unwrap();
        let file = format!("{module}.py");
        functions.entry(name).or_insert_with(|| FunctionRecord {
            file,
            line_start: line as u32 + 1,
            line_end: line as u32 + 2,
            calls: BTreeSet::new(),
            complexity: 1,
            side_effects: BTreeSet::new(),
        });
    }
    for (from, to) in edges {
        if let Some(record) = functions.get_mut(&qualify(from)) {
            record.calls.insert(CallTarget::Resolved(qualify(to)));
        }
    }
    RepositoryMap::new(LANGUAGE_PYTHON, functions)
}

/// `A -> B -> C`.
pub(crate) fn chain_map() -> RepositoryMap {
    map_from_edges(&[("A", "B"), ("B", "C")], &[])
}
