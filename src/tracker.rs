//! Tracking store for last-observed Deployments
//!
//! The tracker remembers the last Deployment observed for each Micro
//! workload so the controller can recreate a Deployment that was deleted
//! out-of-band. Entries live for the process lifetime only; the cluster
//! remains the source of truth for everything else.
//!
//! The dispatch loop never runs two reconciles for the same identity
//! concurrently, but distinct identities reconcile in parallel, so all
//! access goes through a read-write lock: many concurrent readers, one
//! writer.

use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use crate::crd::Micro;

/// Canonical identity of a tracked Micro workload
///
/// Always the full (namespace, name, kind) triple. Keying on name or kind
/// alone would collide distinct resources that share either value.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TrackerKey {
    /// Namespace of the Micro resource
    pub namespace: String,
    /// Name of the Micro resource
    pub name: String,
    /// Workload kind from `spec.kind`
    pub kind: String,
}

impl TrackerKey {
    /// Derive the tracker key for a Micro resource
    pub fn for_micro(micro: &Micro) -> Self {
        Self {
            namespace: micro.namespace().unwrap_or_default(),
            name: micro.name_any(),
            kind: micro.spec.kind.clone(),
        }
    }
}

/// Associative store mapping workload identity to the last observed
/// Deployment definition
///
/// Constructed once at startup and injected into the controller context.
#[derive(Debug, Default)]
pub struct DeploymentTracker {
    entries: RwLock<HashMap<TrackerKey, Deployment>>,
}

impl DeploymentTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the tracked Deployment for an identity
    pub fn get(&self, key: &TrackerKey) -> Option<Deployment> {
        self.entries
            .read()
            .expect("tracker lock poisoned")
            .get(key)
            .cloned()
    }

    /// Check whether an identity is tracked without cloning the entry
    pub fn contains(&self, key: &TrackerKey) -> bool {
        self.entries
            .read()
            .expect("tracker lock poisoned")
            .contains_key(key)
    }

    /// Store the Deployment observed for an identity
    pub fn put(&self, key: TrackerKey, deployment: Deployment) {
        self.entries
            .write()
            .expect("tracker lock poisoned")
            .insert(key, deployment);
    }

    /// Remove the entry for an exact identity, if present
    pub fn delete(&self, key: &TrackerKey) {
        self.entries
            .write()
            .expect("tracker lock poisoned")
            .remove(key);
    }

    /// Remove every entry for a (namespace, name) pair, regardless of kind
    ///
    /// Used when a Micro resource is observed deleted: the triggering
    /// notification may carry a stale `spec.kind`, so cleanup matches on
    /// the resource coordinates alone.
    pub fn purge(&self, namespace: &str, name: &str) {
        self.entries
            .write()
            .expect("tracker lock poisoned")
            .retain(|k, _| !(k.namespace == namespace && k.name == name));
    }

    /// Number of tracked identities
    pub fn len(&self) -> usize {
        self.entries.read().expect("tracker lock poisoned").len()
    }

    /// Returns true if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(namespace: &str, name: &str, kind: &str) -> TrackerKey {
        TrackerKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
        }
    }

    fn sample_deployment(name: &str, replicas: i32) -> Deployment {
        let mut dep = Deployment::default();
        dep.metadata.name = Some(name.to_string());
        dep.spec = Some(k8s_openapi::api::apps::v1::DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        });
        dep
    }

    #[test]
    fn put_then_get_returns_the_stored_deployment() {
        let tracker = DeploymentTracker::new();
        let k = key("default", "api", "api");

        assert!(tracker.get(&k).is_none());
        tracker.put(k.clone(), sample_deployment("api", 3));

        let dep = tracker.get(&k).expect("entry should exist");
        assert_eq!(dep.metadata.name.as_deref(), Some("api"));
        assert_eq!(dep.spec.and_then(|s| s.replicas), Some(3));
    }

    #[test]
    fn delete_removes_only_the_exact_identity() {
        let tracker = DeploymentTracker::new();
        tracker.put(key("default", "api", "api"), sample_deployment("api", 1));
        tracker.put(key("staging", "api", "api"), sample_deployment("api", 1));

        tracker.delete(&key("default", "api", "api"));

        assert!(!tracker.contains(&key("default", "api", "api")));
        assert!(tracker.contains(&key("staging", "api", "api")));
    }

    #[test]
    fn identities_differing_only_by_namespace_do_not_collide() {
        let tracker = DeploymentTracker::new();
        tracker.put(key("default", "api", "api"), sample_deployment("api", 1));
        tracker.put(key("prod", "api", "api"), sample_deployment("api", 5));

        assert_eq!(tracker.len(), 2);
        let prod = tracker.get(&key("prod", "api", "api")).unwrap();
        assert_eq!(prod.spec.and_then(|s| s.replicas), Some(5));
    }

    #[test]
    fn identities_differing_only_by_kind_do_not_collide() {
        let tracker = DeploymentTracker::new();
        tracker.put(key("default", "svc", "api"), sample_deployment("svc", 1));
        tracker.put(key("default", "svc", "web"), sample_deployment("svc", 2));

        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn purge_removes_all_kinds_for_a_resource() {
        let tracker = DeploymentTracker::new();
        // The same resource tracked under two kinds (spec.kind was mutated
        // between observations)
        tracker.put(key("default", "api", "api"), sample_deployment("api", 1));
        tracker.put(key("default", "api", "web"), sample_deployment("api", 1));
        tracker.put(key("default", "other", "api"), sample_deployment("other", 1));

        tracker.purge("default", "api");

        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains(&key("default", "other", "api")));
    }

    #[test]
    fn deleting_a_missing_entry_is_a_no_op() {
        let tracker = DeploymentTracker::new();
        tracker.delete(&key("default", "ghost", "api"));
        tracker.purge("default", "ghost");
        assert!(tracker.is_empty());
    }

    /// Story: reconciles for distinct identities hammer the tracker in
    /// parallel without corrupting it
    #[test]
    fn concurrent_access_from_distinct_identities() {
        let tracker = Arc::new(DeploymentTracker::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                let k = key("default", &format!("svc-{i}"), "api");
                for _ in 0..100 {
                    tracker.put(k.clone(), sample_deployment(&k.name, 1));
                    assert!(tracker.get(&k).is_some());
                    tracker.delete(&k);
                    tracker.put(k.clone(), sample_deployment(&k.name, 2));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        // One surviving entry per identity
        assert_eq!(tracker.len(), 8);
    }
}
