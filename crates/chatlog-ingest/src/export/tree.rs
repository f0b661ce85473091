//! Deterministic walk over the node mapping of one conversation.
//!
//! The mapping is untrusted: it may have several parentless nodes, dangling
//! child references or cycles. The walk is iterative, visits children in
//! ascending id order and never visits a node twice.

use std::collections::{BTreeMap, HashSet};

use crate::config::UnfinishedAncestors;

use super::model::ExportNode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeWarning {
    /// No node without a parent; the lowest id was used as root.
    NoRoot,
    /// Several parentless nodes; the lowest id was used as root.
    MultipleRoots { count: usize },
    /// A node was reached again, which means the input contains a cycle or a shared child.
    Revisit { node: String },
    MissingChild { parent: String, child: String },
}

#[derive(Debug)]
pub struct Walk<'a> {
    pub root: &'a str,
    /// Ids of the nodes that emit a message, in pre-order.
    pub emitted: Vec<&'a str>,
    pub warnings: Vec<TreeWarning>,
}

fn is_parentless(node: &ExportNode) -> bool {
    node.parent.as_deref().is_none_or(str::is_empty)
}

/// Picks the root: the lowest parentless id, else the lowest id overall.
pub fn find_root(mapping: &BTreeMap<String, ExportNode>) -> Option<(&str, Option<TreeWarning>)> {
    let parentless: Vec<&str> = mapping
        .iter()
        .filter(|(_, node)| is_parentless(node))
        .map(|(id, _)| id.as_str())
        .collect();

    match parentless.as_slice() {
        [only] => Some((*only, None)),
        [] => mapping
            .keys()
            .next()
            .map(|id| (id.as_str(), Some(TreeWarning::NoRoot))),
        [first, ..] => Some((
            *first,
            Some(TreeWarning::MultipleRoots {
                count: parentless.len(),
            }),
        )),
    }
}

/// Walks the mapping from its root. Returns `None` for an empty mapping.
pub fn walk(mapping: &BTreeMap<String, ExportNode>, policy: UnfinishedAncestors) -> Option<Walk<'_>> {
    let (root, root_warning) = find_root(mapping)?;
    let mut warnings: Vec<TreeWarning> = root_warning.into_iter().collect();
    let mut emitted = Vec::new();
    let mut visited: HashSet<&str> = HashSet::with_capacity(mapping.len());
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            warnings.push(TreeWarning::Revisit {
                node: id.to_string(),
            });
            continue;
        }
        let Some(node) = mapping.get(id) else {
            continue;
        };

        match &node.message {
            Some(message) if message.is_finished() => emitted.push(id),
            Some(_) if policy == UnfinishedAncestors::SkipDescendants => continue,
            _ => {}
        }

        let mut children: Vec<&str> = node.children.iter().map(String::as_str).collect();
        children.sort_unstable();
        children.dedup();

        for child in children.into_iter().rev() {
            match mapping.get_key_value(child) {
                Some((key, _)) => stack.push(key.as_str()),
                None => warnings.push(TreeWarning::MissingChild {
                    parent: id.to_string(),
                    child: child.to_string(),
                }),
            }
        }
    }

    Some(Walk {
        root,
        emitted,
        warnings,
    })
}
