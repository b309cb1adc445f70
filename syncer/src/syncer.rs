use crate::blob::BlobStore;
use crate::configmaps::{Applied, ConfigMapStore};
use crate::errors::Error;

use deployer_api as api;
use log;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/* blob containers */
pub const CLUSTER_CONTAINER: &str = "cluster";
pub const AKSAPP_CONTAINER: &str = "aksapp";

/*
 * The per-application ConfigMap names materialized in this cycle, keyed by
 * application type.
 */
pub type CurrentApps = BTreeMap<String, BTreeSet<String>>;

/*
 * A ConfigMap is obsolete when the longest current type prefixing its name
 * expects a different `<type>-<version>`. Names no type prefixes, and names
 * equal to a bare type, are left alone.
 */
pub fn is_obsolete(name: &str, current: &CurrentApps) -> bool {
    let longest = current.keys()
	.filter(|app_type| name.starts_with(app_type.as_str()))
	.max_by_key(|app_type| app_type.len());

    match longest {
	None => false,
	Some(app_type) if name == app_type => false,
	Some(app_type) => !current[app_type].contains(name),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub records: usize,
    pub written: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub deleted: usize,
}

pub struct Syncer<B, C> {
    blobs: B,
    configmaps: C,
    cluster_name: String,
    namespace: String,
    toggle_url: Option<String>,
}

impl<B: BlobStore, C: ConfigMapStore> Syncer<B, C> {

    pub fn new(blobs: B, configmaps: C, cluster_name: &str) -> Self {
	Self{
	    blobs: blobs,
	    configmaps: configmaps,
	    cluster_name: cluster_name.to_string(),
	    namespace: api::DEFAULT_NAMESPACE.to_string(),
	    toggle_url: None,
	}
    }

    pub fn set_options(&mut self, toggle_url: Option<String>, namespace: &str) {
	self.toggle_url = toggle_url;
	self.namespace = namespace.to_string();
    }

    pub fn toggle_url(&self) -> Option<&str> {
	self.toggle_url.as_deref()
    }

    pub fn namespace(&self) -> &str {
	&self.namespace
    }

    /*
     * One full sync cycle. Failures are logged; the next tick tries again.
     */
    pub async fn run(&self) {
	match self.sync().await {
	    Ok(report) => {
		log::info!(
		    "sync of {} done: {} records, {} written, {} unchanged, {} skipped, {} deleted",
		    self.cluster_name, report.records, report.written, report.unchanged, report.skipped, report.deleted
		);
	    },
	    Err(err) => {
		log::warn!("sync of {} aborted: {}", self.cluster_name, err);
	    }
	}
    }

    /*
     * Run a cycle every `period` until the token is cancelled. A cancelled
     * cycle is dropped at its current await point.
     */
    pub async fn run_forever(&self, period: Duration, token: &CancellationToken) {
	let mut ticker = tokio::time::interval(period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
	    tokio::select! {
		_ = ticker.tick() => {},
		_ = token.cancelled() => break,
	    }

	    tokio::select! {
		_ = self.run() => {},
		_ = token.cancelled() => break,
	    }
	}

	log::info!("sync loop stopped");
    }

    /*
     * Concatenate every bundle blob of this cluster, each one followed by
     * the separator, in listing order.
     */
    async fn fetch_bundle(&self) -> Result<Option<String>, Error> {
	let prefix = format!("{}/", self.cluster_name);
	let names = self.blobs.list_blobs(CLUSTER_CONTAINER, &prefix).await?;
	if names.is_empty() {
	    return Ok(None);
	}

	let mut bundle = String::new();
	for name in names {
	    bundle.push_str(&self.blobs.get_blob(CLUSTER_CONTAINER, &name).await?);
	    bundle.push_str(api::manifest::SEPARATOR);
	}

	Ok(Some(bundle))
    }

    async fn materialize(&self, app: &api::AksApp) -> Result<Applied, Error> {
	let path = app.blob_path();
	let document = self.blobs.get_blob(AKSAPP_CONTAINER, &path).await?;

	self.configmaps.apply(&self.namespace, &app.config_map_name(), &document, &path).await
    }

    async fn sweep(&self, current: &CurrentApps) -> Result<usize, Error> {
	let mut deleted = 0;

	for name in self.configmaps.list_names(&self.namespace).await? {
	    if name == api::CLUSTER_CONFIG_NAME || !is_obsolete(&name, current) {
		continue;
	    }

	    match self.configmaps.delete(&self.namespace, &name).await {
		Ok(()) => deleted += 1,
		Err(err) => log::error!("Unable to delete obsolete configmap {}/{}: {}", self.namespace, name, err),
	    }
	}

	Ok(deleted)
    }

    /*
     * Per-application ConfigMaps are written before the cluster ConfigMap,
     * and the sweep runs only once the cluster ConfigMap is in place, so a
     * reader never sees a bundle whose documents are missing.
     */
    pub async fn sync(&self) -> Result<CycleReport, Error> {
	let mut report = CycleReport::default();

	let bundle = match self.fetch_bundle().await {
	    Ok(Some(bundle)) => bundle,
	    Ok(None) => {
		log::warn!("no bundle blobs found for cluster {}", self.cluster_name);
		return Ok(report);
	    },
	    Err(err) => return Err(err),
	};

	let apps = api::parse_apps(&bundle)?;
	report.records = apps.len();

	let mut current = CurrentApps::new();
	for app in &apps {
	    match self.materialize(app).await {
		Ok(applied) => {
		    if applied == Applied::Unchanged {
			report.unchanged += 1;
		    } else {
			report.written += 1;
		    }
		    current.entry(app.spec.app_type.clone())
			.or_default()
			.insert(app.config_map_name());
		},
		Err(err) => {
		    report.skipped += 1;
		    log::error!("Unable to materialize {}: {}", app.config_map_name(), err);
		}
	    }
	}

	let blob_url = format!("{}.yaml", self.cluster_name);
	self.configmaps.apply(&self.namespace, api::CLUSTER_CONFIG_NAME, &bundle, &blob_url).await?;

	report.deleted = self.sweep(&current).await?;
	Ok(report)
    }
}
