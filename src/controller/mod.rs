//! Kubernetes controller reconciliation logic

mod micro;

pub use micro::{
    error_policy, reconcile, Context, ContextBuilder, MicroKubeClient, MicroKubeClientImpl,
    REQUEUE_INTERVAL,
};
