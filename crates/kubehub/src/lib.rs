//! Katafygio kubehub — API discovery, filtering and watcher wiring

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{
    core::ApiResource,
    discovery::{verbs, ApiCapabilities, Discovery, Scope},
    Client,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

pub mod controller;
pub mod observer;
mod queue;

pub use controller::{Controller, WatchParams};
pub use observer::{Observer, ObserverParams};

/// Only resources supporting all of these are worth a watch controller.
const REQUIRED_VERBS: &[&str] = &[verbs::LIST, verbs::GET, verbs::WATCH];

/// The api-server re-exposes some resources under several API groups for
/// backward compatibility. When the preferred group is served, the obsolete
/// duplicate is suppressed (cf. kube-apiserver's cohabitating resources).
const COHABITATIONS: &[(&str, &str)] = &[
    ("apps:deployment", "extensions:deployment"),
    ("apps:daemonset", "extensions:daemonset"),
    ("apps:replicaset", "extensions:replicaset"),
    ("events.k8s.io:event", ":event"),
    ("extensions:podsecuritypolicy", "policy:podsecuritypolicy"),
    ("networking.k8s.io:networkpolicy", "extensions:networkpolicy"),
];

/// Registry key for a discovered kind: `<group>:<kind>`, lowercased.
pub fn registry_key(group: &str, kind: &str) -> String {
    format!("{}:{}", group, kind).to_lowercase()
}

/// A discovered, watchable resource kind.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub ar: ApiResource,
    pub namespaced: bool,
}

/// User-facing discovery filters.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Kinds to ignore, matched case-insensitively against the kind, the
    /// plural name and the singular form.
    pub exclude_kind: Vec<String>,
    /// Drop cluster-scoped resources (set when mirroring a single namespace).
    pub namespaced_only: bool,
}

impl DiscoveryFilter {
    fn excludes(&self, ar: &ApiResource) -> bool {
        let kind = ar.kind.to_lowercase();
        let plural = ar.plural.to_lowercase();
        self.exclude_kind
            .iter()
            .any(|x| x.eq_ignore_ascii_case(&kind) || x.eq_ignore_ascii_case(&plural))
    }
}

/// Reduce a discovery result to the kinds we should watch, keyed for the
/// controller registry.
pub fn filter_candidates(
    resources: impl IntoIterator<Item = (ApiResource, ApiCapabilities)>,
    filter: &DiscoveryFilter,
) -> FxHashMap<String, ResourceEntry> {
    let mut out = FxHashMap::default();
    let mut seen = FxHashSet::default();

    for (ar, caps) in resources {
        // subresources (pods/status and friends) are never dumped
        if ar.plural.contains('/') {
            continue;
        }
        if !REQUIRED_VERBS.iter().all(|v| caps.supports_operation(v)) {
            continue;
        }
        let key = registry_key(&ar.group, &ar.kind);
        seen.insert(key.clone());
        if filter.excludes(&ar) {
            debug!(kind = %ar.kind, group = %ar.group, "excluded by user");
            continue;
        }
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        if filter.namespaced_only && !namespaced {
            continue;
        }
        out.insert(key, ResourceEntry { ar, namespaced });
    }

    // A served preferred group suppresses its obsolete twin, even when the
    // preferred kind was itself excluded by the user.
    for (preferred, obsolete) in COHABITATIONS {
        if seen.contains(*preferred) {
            out.remove(*obsolete);
        }
    }

    out
}

/// Enumerate served resources (incl. CRDs) and apply the filters.
pub async fn discover(
    client: &Client,
    filter: &DiscoveryFilter,
) -> Result<FxHashMap<String, ResourceEntry>> {
    let discovery = Discovery::new(client.clone())
        .run()
        .await
        .context("collecting server resources")?;

    let mut all = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            all.push((ar, caps));
        }
    }
    metrics::counter!("discovery_runs_total", 1u64);

    Ok(filter_candidates(all, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(group: &str, kind: &str, plural: &str, scope: Scope, ops: &[&str]) -> (ApiResource, ApiCapabilities) {
        let version = "v1".to_string();
        let api_version = if group.is_empty() {
            version.clone()
        } else {
            format!("{}/{}", group, version)
        };
        (
            ApiResource {
                group: group.to_string(),
                version,
                api_version,
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            ApiCapabilities {
                scope,
                subresources: vec![],
                operations: ops.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    fn watchable(group: &str, kind: &str, plural: &str, scope: Scope) -> (ApiResource, ApiCapabilities) {
        res(group, kind, plural, scope, &["get", "list", "watch"])
    }

    #[test]
    fn keeps_watchable_resources() {
        let found = filter_candidates(
            vec![
                watchable("", "Namespace", "namespaces", Scope::Cluster),
                watchable("apps", "Deployment", "deployments", Scope::Namespaced),
            ],
            &DiscoveryFilter::default(),
        );
        assert!(found.contains_key(":namespace"));
        assert!(found.contains_key("apps:deployment"));
    }

    #[test]
    fn drops_unwatchable_verbs() {
        let found = filter_candidates(
            vec![res("", "Binding", "bindings", Scope::Namespaced, &["create"])],
            &DiscoveryFilter::default(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn exclude_kind_matches_kind_and_plural() {
        let filter = DiscoveryFilter {
            exclude_kind: vec!["ConfigMap".into(), "secrets".into()],
            namespaced_only: false,
        };
        let found = filter_candidates(
            vec![
                watchable("", "ConfigMap", "configmaps", Scope::Namespaced),
                watchable("", "Secret", "secrets", Scope::Namespaced),
                watchable("", "Pod", "pods", Scope::Namespaced),
            ],
            &filter,
        );
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(":pod"));
    }

    #[test]
    fn namespace_filter_drops_cluster_scoped() {
        let filter = DiscoveryFilter { exclude_kind: vec![], namespaced_only: true };
        let found = filter_candidates(
            vec![
                watchable("", "Namespace", "namespaces", Scope::Cluster),
                watchable("", "Pod", "pods", Scope::Namespaced),
            ],
            &filter,
        );
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(":pod"));
    }

    #[test]
    fn cohabitation_prefers_apps_deployment() {
        let found = filter_candidates(
            vec![
                watchable("apps", "Deployment", "deployments", Scope::Namespaced),
                watchable("extensions", "Deployment", "deployments", Scope::Namespaced),
            ],
            &DiscoveryFilter::default(),
        );
        assert!(found.contains_key("apps:deployment"));
        assert!(!found.contains_key("extensions:deployment"));
    }

    #[test]
    fn cohabitation_suppresses_even_when_preferred_excluded() {
        let filter = DiscoveryFilter {
            exclude_kind: vec!["deployment".into()],
            namespaced_only: false,
        };
        let found = filter_candidates(
            vec![
                watchable("apps", "Deployment", "deployments", Scope::Namespaced),
                watchable("extensions", "Deployment", "deployments", Scope::Namespaced),
            ],
            &filter,
        );
        // exclusion removes the preferred entry, cohabitation the obsolete one
        assert!(found.is_empty());
    }
}
