//! Micro controller implementation
//!
//! This module implements the reconciliation logic for Micro resources.
//! It follows the Kubernetes controller pattern: observe current state,
//! determine desired state, calculate diff, and apply changes.
//!
//! Each invocation is idempotent and re-fetches fresh cluster state; the
//! triggering object may lag behind what the API server holds. The only
//! state shared across invocations is the [`DeploymentTracker`], which
//! remembers the last observed Deployment so it can be recreated if it is
//! deleted out-of-band.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{Micro, MicroStatus};
use crate::tracker::{DeploymentTracker, TrackerKey};
use crate::{Error, FIELD_MANAGER, POD_NAME_LABEL};

/// Interval for requeueing a Micro that has not yet converged
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

/// Trait abstracting Kubernetes client operations for Micro
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. `Ok(None)` distinguishes NotFound from
/// transient read failures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MicroKubeClient: Send + Sync {
    /// Get a Micro by namespace and name, or None if it does not exist
    async fn get_micro(&self, namespace: &str, name: &str) -> Result<Option<Micro>, Error>;

    /// Get a Deployment by namespace and name, or None if it does not exist
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Create a Deployment in the given namespace
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error>;

    /// Replace an existing Deployment with the given definition
    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error>;

    /// Patch the status subresource of a Micro
    async fn update_micro_status(&self, micro: &Micro) -> Result<(), Error>;

    /// List pod names matching a label selector, preserving listing order
    async fn list_pod_names(&self, namespace: &str, selector: &str)
        -> Result<Vec<String>, Error>;
}

/// Real Kubernetes client implementation
pub struct MicroKubeClientImpl {
    client: Client,
}

impl MicroKubeClientImpl {
    /// Create a new MicroKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MicroKubeClient for MicroKubeClientImpl {
    async fn get_micro(&self, namespace: &str, name: &str) -> Result<Option<Micro>, Error> {
        let api: Api<Micro> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invariant("deployment has no metadata.name"))?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn update_micro_status(&self, micro: &Micro) -> Result<(), Error> {
        let name = micro.name_any();
        let namespace = micro
            .namespace()
            .ok_or_else(|| Error::invariant(format!("micro {name} has no namespace")))?;

        let status_patch = serde_json::json!({ "status": micro.status });

        let api: Api<Micro> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn list_pod_names(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;

        Ok(pods.items.iter().map(|pod| pod.name_any()).collect())
    }
}

/// Shared context for the Micro controller
///
/// Holds the cluster-API adapter and the deployment tracker. Built once at
/// startup and shared by every reconcile invocation.
pub struct Context {
    /// Cluster API operations, mockable in tests
    pub kube: Arc<dyn MicroKubeClient>,
    /// Tracking store for last-observed Deployments
    pub tracker: Arc<DeploymentTracker>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a Context directly from mocks (testing)
    #[cfg(test)]
    fn for_testing(kube: Arc<dyn MicroKubeClient>, tracker: Arc<DeploymentTracker>) -> Self {
        Self { kube, tracker }
    }
}

/// Builder for [`Context`]
///
/// By default wraps the given client in [`MicroKubeClientImpl`] and creates
/// a fresh tracker; both can be overridden for tests or embedding.
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn MicroKubeClient>>,
    tracker: Option<Arc<DeploymentTracker>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            tracker: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn MicroKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Share an existing tracker instead of creating a fresh one
    pub fn tracker(mut self, tracker: Arc<DeploymentTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(MicroKubeClientImpl::new(self.client.clone()))),
            tracker: self.tracker.unwrap_or_default(),
        }
    }
}

/// Reconcile a Micro resource
///
/// Drives the managed Deployment toward `spec.size` replicas and republishes
/// observed pod names into `status.nodes`. Safe to call repeatedly for the
/// same identity and tolerates the resource having been deleted.
///
/// Returns `Action::requeue` while convergence is still in progress and
/// `Action::await_change` once the invocation is terminal.
#[instrument(skip(micro, ctx), fields(micro = %micro.name_any()))]
pub async fn reconcile(micro: Arc<Micro>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = micro.name_any();
    let namespace = micro
        .namespace()
        .ok_or_else(|| Error::invariant(format!("micro {name} has no namespace")))?;

    info!("reconciling micro");

    // Re-fetch: the triggering object may already be superseded
    let Some(micro) = ctx.kube.get_micro(&namespace, &name).await? else {
        // Deleted. The owner reference garbage-collects the Deployment;
        // we only drop the tracker entry. No finalizer-based cleanup.
        info!("micro no longer exists, dropping tracked deployment");
        ctx.tracker.purge(&namespace, &name);
        return Ok(Action::await_change());
    };

    if let Err(e) = micro.spec.validate() {
        // Requires a spec change, so don't requeue
        warn!(error = %e, "micro validation failed");
        return Ok(Action::await_change());
    }

    let key = TrackerKey::for_micro(&micro);

    // Fetch the managed Deployment
    let Some(mut deployment) = ctx.kube.get_deployment(&namespace, &name).await? else {
        if let Some(tracked) = ctx.tracker.get(&key) {
            // Deleted out-of-band: recreate from the last observed definition
            info!(kind = %key.kind, "deployment absent, recreating from tracked definition");
            ctx.kube.create_deployment(&namespace, &tracked).await?;
        } else {
            // Never observed a Deployment for this identity; recreation
            // needs a previously observed definition, so just wait
            debug!(kind = %key.kind, "deployment absent and untracked, waiting");
        }
        return Ok(Action::requeue(REQUEUE_INTERVAL));
    };

    // First observation of this pair: claim ownership and start tracking
    if !ctx.tracker.contains(&key) {
        set_controller_reference(&micro, &mut deployment)?;
        ctx.tracker.put(key.clone(), deployment.clone());
        debug!(kind = %key.kind, "tracking deployment and claimed ownership");
    }

    // Converge replica count. A missing replica pointer is a malformed
    // object, never defaulted.
    let current = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .ok_or_else(|| {
            Error::invariant(format!("deployment {namespace}/{name} has no spec.replicas"))
        })?;
    let desired = micro.spec.size;

    if current != desired {
        info!(current, desired, "scaling deployment");
        // The freshly fetched object may not carry the controller reference
        // yet (step 3 only sets it in memory); every persisted write must,
        // or cascade deletion breaks for this pair
        set_controller_reference(&micro, &mut deployment)?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(desired);
        }
        ctx.kube.update_deployment(&namespace, &deployment).await?;
        // Refresh the tracked definition only once the write has landed
        ctx.tracker.put(key, deployment.clone());
        // Defer the status resync to the next cycle so it never reflects a
        // pod set mid-scale
        return Ok(Action::requeue(REQUEUE_INTERVAL));
    }

    // Resync status with the pods backing this workload
    let selector = format!("{POD_NAME_LABEL}={name}");
    let pod_names = ctx.kube.list_pod_names(&namespace, &selector).await?;

    let observed_nodes = micro
        .status
        .as_ref()
        .map(|status| status.nodes.clone())
        .unwrap_or_default();

    // Order-sensitive comparison: a listing that returns the same members
    // in a different order republishes status
    if pod_names != observed_nodes {
        info!(pods = pod_names.len(), "updating micro status nodes");
        let mut updated = micro.clone();
        updated.status = Some(MicroStatus { nodes: pod_names });
        ctx.kube.update_micro_status(&updated).await?;
    } else {
        debug!("status already in sync");
    }

    Ok(Action::await_change())
}

/// Set the Micro as the controller owner of the Deployment (in-memory)
///
/// The reference is persisted by whichever update next writes the object.
/// Fails if the Micro has no UID or another controller already owns the
/// Deployment; ownership is the sole deletion-cascade mechanism, so a
/// violation is never ignored.
fn set_controller_reference(micro: &Micro, deployment: &mut Deployment) -> Result<(), Error> {
    let uid = micro.uid().ok_or_else(|| {
        Error::invariant(format!("micro {} has no metadata.uid", micro.name_any()))
    })?;
    let deployment_name = deployment.name_any();

    let owner_refs = deployment
        .metadata
        .owner_references
        .get_or_insert_with(Vec::new);

    if let Some(existing) = owner_refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != uid)
    {
        return Err(Error::invariant(format!(
            "deployment {deployment_name} is already controlled by {} {}",
            existing.kind, existing.name
        )));
    }

    if owner_refs.iter().any(|r| r.uid == uid) {
        return Ok(());
    }

    owner_refs.push(OwnerReference {
        api_version: Micro::api_version(&()).into_owned(),
        kind: Micro::kind(&()).into_owned(),
        name: micro.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    });

    Ok(())
}

/// Error policy for the controller
///
/// Called when reconciliation fails. Retryable errors requeue with a short
/// delay (the dispatch loop applies backoff on repeated failure); errors
/// that require a spec or code fix wait for the resource to change.
pub fn error_policy(micro: Arc<Micro>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        micro = %micro.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(REQUEUE_INTERVAL)
    } else {
        Action::await_change()
    }
}
