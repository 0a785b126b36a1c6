use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

/// Crates that must stay pure: no runtime, no network, no HTTP surface.
const CORE_PACKAGE_NAMES: &[&str] = &[
    "genq-contracts",
    "genq-query",
    "genq-auth",
    "genq-policy",
];
const FORBIDDEN_CORE_DEPENDENCIES: &[&str] = &["axum", "hyper", "reqwest", "tokio", "genq-gateway"];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for package_name in CORE_PACKAGE_NAMES {
        let mut violations = forbidden_dependencies(&metadata, package_name)?;
        if violations.is_empty() {
            println!("OK: `{}` has no dependency edge to the I/O stack", package_name);
            continue;
        }

        violations.sort();
        violations.dedup();
        eprintln!(
            "FAIL: `{}` depends on forbidden crate(s): {}",
            package_name,
            violations.join(", ")
        );
        failed = true;
    }

    if failed {
        std::process::exit(1);
    }

    println!(
        "OK: core crates are free of {}",
        FORBIDDEN_CORE_DEPENDENCIES.join(", ")
    );
    Ok(())
}

fn forbidden_dependencies(metadata: &Metadata, package_name: &str) -> Result<Vec<String>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == package_name)
        .with_context(|| format!("package `{}` not found in workspace", package_name))?;

    let id_to_name: HashMap<&PackageId, &str> = metadata
        .packages
        .iter()
        .map(|p| (&p.id, p.name.as_str()))
        .collect();

    // Only normal dependencies count; dev-dependencies may pull a runtime
    // in for tests.
    let adjacency: HashMap<&PackageId, Vec<&PackageId>> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps = node
                .deps
                .iter()
                .filter(|dep| {
                    dep.dep_kinds.is_empty()
                        || dep
                            .dep_kinds
                            .iter()
                            .any(|k| k.kind == cargo_metadata::DependencyKind::Normal)
                })
                .map(|dep| &dep.pkg)
                .collect();
            (&node.id, deps)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(&root.id);
    visited.insert(&root.id);

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(current) else {
            continue;
        };

        for dep in deps.iter().copied() {
            if !visited.insert(dep) {
                continue;
            }

            if let Some(name) = id_to_name.get(dep)
                && FORBIDDEN_CORE_DEPENDENCIES.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    Ok(violations)
}
