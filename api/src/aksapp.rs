use kube::api::ObjectMeta;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/*
 * A reference to a single key inside a Secret, living in the same
 * namespace as the AksApp that references it.
 */
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,

    pub key: String,
}

impl SecretKeyRef {

    pub fn new(name: &str, key: &str) -> Self {
	Self{
	    name: name.to_string(),
	    key: key.to_string(),
	}
    }
}

/*
 * AksApp describes one deployable workload. Instances are fanned out from
 * the cluster bundle by the operator and consumed by downstream
 * controllers.
 *
 *   apiVersion: deployer.aks/v1
 *   kind: AksApp
 *   metadata:
 *     name: foo
 *     namespace: foo-ns
 *   spec:
 *     type: foo
 *     version: "1"
 *     variables:
 *       replicas: "3"
 *     credentials:
 *       token:
 *         name: foo-secret
 *         key: token
 */
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "deployer.aks", version = "v1", kind = "AksApp", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct AksAppSpec {

    /* identifies the application kind, also the blob folder in the `aksapp` container */
    #[serde(rename = "type")]
    pub app_type: String,

    /* opaque version string */
    pub version: String,

    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    #[serde(default)]
    pub credentials: BTreeMap<String, SecretKeyRef>,
}

impl AksApp {

    /*
     * Name of the per-application ConfigMap carrying this app's document:
     * `<type>-<version>`.
     */
    pub fn config_map_name(&self) -> String {
	format!("{}-{}", self.spec.app_type, self.spec.version)
    }

    /*
     * Path of this app's own document in the `aksapp` blob container:
     * `<type>/<version>.yaml`.
     */
    pub fn blob_path(&self) -> String {
	format!("{}/{}.yaml", self.spec.app_type, self.spec.version)
    }
}

pub fn new(name: &str, namespace: &str, spec: AksAppSpec) -> AksApp {
    let mut metadata = ObjectMeta::default();
    metadata.name = Some(name.to_string());
    metadata.namespace = Some(namespace.to_string());

    AksApp{
	metadata: metadata,
	spec: spec,
    }
}
