//! Dependency order for change sets.
//!
//! Under `path-depth` a directory's `index.*` item is the parent of its
//! siblings and of everything below the directory. Creates and updates run
//! parents first; deletes run afterwards, children first.

use std::cmp::Ordering;

use syllabus_core::config::HierarchyRule;
use syllabus_core::types::ChangeOp;

/// Sort key under `path-depth`: (directory depth, non-index after index, path).
fn depth_key(path: &str) -> (usize, bool, &str) {
    let depth = path.matches('/').count();
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.split('.').next().unwrap_or(file);
    (depth, stem != "index", path)
}

fn compare_upserts(a: &ChangeOp, b: &ChangeOp, rule: HierarchyRule) -> Ordering {
    match rule {
        HierarchyRule::PathDepth => depth_key(&a.path)
            .cmp(&depth_key(&b.path))
            .then_with(|| a.id.cmp(&b.id)),
        HierarchyRule::Flat => a.id.cmp(&b.id),
    }
}

/// Sort `ops` in place into dependency order.
pub fn sort_ops(ops: &mut [ChangeOp], rule: HierarchyRule) {
    ops.sort_by(|a, b| match (a.is_delete(), b.is_delete()) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, false) => compare_upserts(a, b, rule),
        (true, true) => match rule {
            HierarchyRule::PathDepth => compare_upserts(b, a, rule),
            HierarchyRule::Flat => a.id.cmp(&b.id),
        },
    });
}
