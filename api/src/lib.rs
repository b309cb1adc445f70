/*
 * deployer/api - the AksApp custom resource, the well-known object names
 * shared by the syncer and the operator, and the bundle parser.
 */

pub mod aksapp;
pub use aksapp::AksApp;
pub use aksapp::AksAppSpec;
pub use aksapp::SecretKeyRef;

pub mod errors;
pub use errors::ParseError;

pub mod manifest;
pub use manifest::Manifest;
pub use manifest::Scheme;

pub const DEFAULT_NAMESPACE: &str = "deployer";

/* the ConfigMap carrying the whole bundle */
pub const CLUSTER_CONFIG_NAME: &str = "cluster-config";

/* data key holding YAML, on both cluster and per-application ConfigMaps */
pub const CONFIG_KEY: &str = "config";

/* annotation recording which blob a ConfigMap was materialized from */
pub const BLOB_URL_ANNOTATION: &str = "blob-url";

/* lease names, one per process */
pub const SYNCER_LEASE_NAME: &str = "syncer";
pub const OPERATOR_LEASE_NAME: &str = "operator";

/*
 * Parse a bundle into AksApp records.
 */
pub fn parse_apps(data: &str) -> Result<Vec<AksApp>, ParseError> {
    let scheme = Scheme::new().register::<AksApp>();
    manifest::parse_config(&scheme, data)
}
