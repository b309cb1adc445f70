use crate::errors::Error;

use clap::Parser;
use deployer_api as api;
use std::time::Duration;

pub const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/*
 * Pulls a cluster's application bundle from blob storage into ConfigMaps.
 */
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {

    /// Namespace the ConfigMaps and the lease live in
    #[arg(long, default_value = api::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Opaque toggle service URL, handed to the syncer as-is
    #[arg(long, env = "TOGGLE_URL")]
    pub toggle_url: Option<String>,

    /// Seconds between two sync cycles
    #[arg(long, default_value_t = 60)]
    pub sync_period: u64,

    #[arg(long, env = "STORAGE_ACCOUNT_NAME")]
    pub storage_account: Option<String>,

    #[arg(long, env = "STORAGE_ACCOUNT_KEY", hide_env_values = true)]
    pub storage_account_key: Option<String>,

    #[arg(long, env = "STORAGE_ENDPOINT_SUFFIX", default_value = DEFAULT_ENDPOINT_SUFFIX)]
    pub storage_endpoint_suffix: String,

    /// Full blob service URL, replacing the one derived from account and suffix
    #[arg(long, env = "STORAGE_ENDPOINT")]
    pub storage_endpoint: Option<String>,

    /// Resource id of a managed identity; when set the access key is not used
    #[arg(long, env = "IDENTITY_RESOURCE_ID")]
    pub identity_resource_id: Option<String>,

    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    #[arg(long, env = "DEPLOY_ENV")]
    pub deploy_env: Option<String>,

    #[arg(long, env = "REGION")]
    pub region: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageAuth {
    AccessKey(String),
    ManagedIdentity(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub account: String,
    pub endpoint_suffix: String,
    pub custom_endpoint: Option<String>,
    pub auth: StorageAuth,
}

impl StorageConfig {

    pub fn endpoint(&self) -> String {
	match &self.custom_endpoint {
	    Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
	    None => format!("https://{}.blob.{}", self.account, self.endpoint_suffix),
	}
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String, Error> {
    match value {
	Some(value) if !value.is_empty() => Ok(value.clone()),
	_ => Err(Error::Config(format!("{} is required", name))),
    }
}

impl Args {

    pub fn sync_period(&self) -> Duration {
	Duration::from_secs(self.sync_period)
    }

    pub fn cluster_name(&self) -> Result<String, Error> {
	required(&self.cluster_name, "CLUSTER_NAME")
    }

    /*
     * A managed identity wins over an access key; without either we can't
     * talk to storage at all.
     */
    pub fn storage(&self) -> Result<StorageConfig, Error> {
	let account = required(&self.storage_account, "STORAGE_ACCOUNT_NAME")?;

	let auth = match &self.identity_resource_id {
	    Some(id) if !id.is_empty() => StorageAuth::ManagedIdentity(id.clone()),
	    _ => StorageAuth::AccessKey(required(&self.storage_account_key, "STORAGE_ACCOUNT_KEY")?),
	};

	Ok(StorageConfig{
	    account: account,
	    endpoint_suffix: self.storage_endpoint_suffix.clone(),
	    custom_endpoint: self.storage_endpoint.clone().filter(|e| !e.is_empty()),
	    auth: auth,
	})
    }
}
