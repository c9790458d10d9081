// ABOUTME: Service ordering for runlevel transitions.
// ABOUTME: Topological ordering of a start-set, and its reverse for stops.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::ServiceConfig;

/// Reject unknown dependencies and cycles. Runs once at config load so the
/// per-transition ordering below can assume a sane graph.
pub fn validate(services: &[ServiceConfig]) -> Result<()> {
    let names: BTreeSet<&str> = services.iter().map(|s| s.name.as_str()).collect();

    for svc in services {
        for dep in &svc.depends_on {
            if !names.contains(dep.as_str()) {
                bail!(
                    "service '{}' depends on unknown service '{}'",
                    svc.name,
                    dep
                );
            }
        }
    }

    let all: BTreeSet<String> = names.iter().map(|n| n.to_string()).collect();
    let ordered = order_subset(&all, services);
    if ordered.len() != services.len() {
        let placed: BTreeSet<&str> = ordered.iter().map(|s| s.as_str()).collect();
        let in_cycle: Vec<&str> = names.difference(&placed).copied().collect();
        bail!("circular dependency detected involving: {}", in_cycle.join(", "));
    }

    Ok(())
}

/// Order `set` so every service comes after the dependencies it has inside
/// the set. Edges to services outside the set are ignored; ties break
/// alphabetically.
pub fn start_order(set: &BTreeSet<String>, services: &[ServiceConfig]) -> Vec<String> {
    let mut order = order_subset(set, services);
    if order.len() != set.len() {
        // A cycle slipped past validation (or validation was skipped).
        // Append the leftovers rather than dropping services on the floor.
        let placed: BTreeSet<&str> = order.iter().map(|s| s.as_str()).collect();
        let mut rest: Vec<String> = set
            .iter()
            .filter(|n| !placed.contains(n.as_str()))
            .cloned()
            .collect();
        rest.sort();
        order.extend(rest);
    }
    order
}

/// Stops run in the opposite direction: dependents go down before the
/// services they depend on.
pub fn stop_order(set: &BTreeSet<String>, services: &[ServiceConfig]) -> Vec<String> {
    let mut order = start_order(set, services);
    order.reverse();
    order
}

fn order_subset(set: &BTreeSet<String>, services: &[ServiceConfig]) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for svc in services {
        if !set.contains(&svc.name) {
            continue;
        }
        in_degree.entry(svc.name.as_str()).or_insert(0);
        for dep in &svc.depends_on {
            if !set.contains(dep) {
                continue;
            }
            *in_degree.entry(svc.name.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(svc.name.as_str());
        }
    }

    // BTreeMap iteration keeps the zero-degree seeds alphabetical.
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(set.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());

        if let Some(deps) = dependents.get(name) {
            let mut ready = Vec::new();
            for &dependent in deps {
                let deg = in_degree.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.push(dependent);
                }
            }
            ready.sort();
            queue.extend(ready);
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_service;

    fn svc(name: &str, deps: &[&str]) -> ServiceConfig {
        let deps_toml = if deps.is_empty() {
            String::new()
        } else {
            format!(
                "depends_on = [{}]",
                deps.iter()
                    .map(|d| format!("\"{}\"", d))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        parse_service(&format!(
            r#"
            [service]
            name = "{name}"
            exec = "/usr/bin/{name}"
            {deps_toml}
            "#
        ))
        .unwrap()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn empty_set_orders_to_nothing() {
        let services = vec![svc("a", &[])];
        assert!(start_order(&set(&[]), &services).is_empty());
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let services = vec![
            svc("dbus", &[]),
            svc("network", &["dbus"]),
            svc("sshd", &["network"]),
        ];
        let order = start_order(&set(&["sshd", "network", "dbus"]), &services);
        assert_eq!(order, vec!["dbus", "network", "sshd"]);
    }

    #[test]
    fn stop_order_is_reverse_of_start_order() {
        let services = vec![
            svc("dbus", &[]),
            svc("network", &["dbus"]),
            svc("sshd", &["network"]),
        ];
        let order = stop_order(&set(&["sshd", "network", "dbus"]), &services);
        assert_eq!(order, vec!["sshd", "network", "dbus"]);
    }

    #[test]
    fn edges_outside_the_set_are_ignored() {
        // sshd depends on network, but network is not part of this
        // transition, so sshd is orderable on its own.
        let services = vec![svc("network", &[]), svc("sshd", &["network"])];
        let order = start_order(&set(&["sshd"]), &services);
        assert_eq!(order, vec!["sshd"]);
    }

    #[test]
    fn independent_services_come_out_alphabetical() {
        let services = vec![svc("zebra", &[]), svc("alpha", &[]), svc("middle", &[])];
        let order = start_order(&set(&["zebra", "alpha", "middle"]), &services);
        assert_eq!(order, vec!["alpha", "middle", "zebra"]);
    }

    #[test]
    fn diamond_resolves_with_shared_root_first() {
        let services = vec![
            svc("a", &[]),
            svc("b", &["a"]),
            svc("c", &["a"]),
            svc("d", &["b", "c"]),
        ];
        let order = start_order(&set(&["a", "b", "c", "d"]), &services);
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let services = vec![svc("sshd", &["nonexistent"])];
        let err = validate(&services).unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[test]
    fn validate_rejects_cycles() {
        let services = vec![svc("a", &["b"]), svc("b", &["a"])];
        let err = validate(&services).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn cyclic_leftovers_are_still_dispatched() {
        let services = vec![svc("a", &["b"]), svc("b", &["a"]), svc("c", &[])];
        let order = start_order(&set(&["a", "b", "c"]), &services);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], "c");
    }
}
