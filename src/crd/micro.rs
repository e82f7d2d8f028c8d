//! Micro Custom Resource Definition
//!
//! A Micro resource declares a replicated micro workload: which flavor of
//! workload it is (`kind`) and how many instances should run (`size`).
//! The controller drives a managed Deployment toward that size and reports
//! the observed pod names back into `status.nodes`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Micro workload
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "micro.dev",
    version = "v1alpha1",
    kind = "Micro",
    plural = "micros",
    status = "MicroStatus",
    namespaced,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct MicroSpec {
    /// Kind of micro workload (e.g. "api", "web", "broker")
    pub kind: String,

    /// Desired number of workload instances
    pub size: i32,
}

impl MicroSpec {
    /// Validate the Micro specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.kind.is_empty() {
            return Err(crate::Error::validation("spec.kind must not be empty"));
        }
        if self.size < 0 {
            return Err(crate::Error::validation(format!(
                "spec.size must be non-negative, got {}",
                self.size
            )));
        }
        Ok(())
    }
}

/// Status for a Micro workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MicroStatus {
    /// Names of the pods backing this workload, in listing order
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn sample_micro(size: i32) -> Micro {
        Micro {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: MicroSpec {
                kind: "api".to_string(),
                size,
            },
            status: None,
        }
    }

    #[test]
    fn valid_spec_passes_validation() {
        let micro = sample_micro(3);
        assert!(micro.spec.validate().is_ok());
    }

    #[test]
    fn zero_size_is_valid() {
        // Scaling to zero is a legitimate desired state
        let micro = sample_micro(0);
        assert!(micro.spec.validate().is_ok());
    }

    #[test]
    fn negative_size_is_rejected() {
        let micro = sample_micro(-1);
        let err = micro.spec.validate().unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn empty_kind_is_rejected() {
        let mut micro = sample_micro(1);
        micro.spec.kind = String::new();
        assert!(micro.spec.validate().is_err());
    }

    #[test]
    fn status_roundtrips_through_json() {
        let status = MicroStatus {
            nodes: vec!["api-1".to_string(), "api-2".to_string()],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["nodes"][0], "api-1");

        // A status object with no nodes field deserializes to an empty list
        let empty: MicroStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(empty.nodes.is_empty());
    }
}
