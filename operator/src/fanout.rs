use crate::client::AppClient;
use crate::errors::Error;
use crate::metrics::Metrics;

use deployer_api as api;
use kube::api::ObjectMeta;
use log;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Created,
    Updated,
    Unchanged,
}

async fn ensure_namespace<C: AppClient>(client: &C, metrics: &Metrics, namespace: &str) -> Result<(), Error> {
    if client.namespace_exists(namespace).await? {
	return Ok(());
    }

    client.create_namespace(namespace).await?;
    metrics.namespace_created();
    log::info!("created namespace {}", namespace);
    Ok(())
}

/*
 * Labels, annotations and finalizers others put on the stored AksApp survive
 * an update. Keys the record sets itself take the record's value.
 */
fn carry_over(stored: &ObjectMeta, desired: &mut ObjectMeta) {
    desired.resource_version = stored.resource_version.clone();

    for (key, value) in stored.labels.iter().flatten() {
	desired.labels.get_or_insert_with(Default::default)
	    .entry(key.clone())
	    .or_insert_with(|| value.clone());
    }
    for (key, value) in stored.annotations.iter().flatten() {
	desired.annotations.get_or_insert_with(Default::default)
	    .entry(key.clone())
	    .or_insert_with(|| value.clone());
    }
    if desired.finalizers.is_none() {
	desired.finalizers = stored.finalizers.clone();
    }
}

/*
 * Create the AksApp, or update it when the stored spec differs. An update
 * carries the stored resourceVersion so it fails on a concurrent change.
 */
async fn apply_app<C: AppClient>(client: &C, metrics: &Metrics, record: &api::AksApp, namespace: &str, name: &str) -> Result<Outcome, Error> {
    match client.get_app(namespace, name).await? {
	None => {
	    client.create_app(record).await?;
	    metrics.app_created();
	    log::info!("created aksapp {}/{}", namespace, name);
	    Ok(Outcome::Created)
	},
	Some(stored) if stored.spec == record.spec => Ok(Outcome::Unchanged),
	Some(stored) => {
	    let mut desired = record.clone();
	    carry_over(&stored.metadata, &mut desired.metadata);

	    client.replace_app(&desired).await?;
	    metrics.app_updated();
	    log::info!("updated aksapp {}/{}", namespace, name);
	    Ok(Outcome::Updated)
	},
    }
}

/*
 * Align the AksApps with the bundle held by `<namespace>/<name>`.
 *
 * Returns an error (so the controller re-queues) when the ConfigMap can't
 * be read or its bundle doesn't parse. A record that fails is logged and
 * skipped; the remaining records are still processed.
 */
pub async fn fan_out<C: AppClient>(client: &C, metrics: &Metrics, namespace: &str, name: &str) -> Result<FanOutReport, Error> {
    let mut report = FanOutReport::default();

    let cm = match client.get_config_map(namespace, name).await? {
	Some(cm) => cm,
	None => {
	    log::info!("configmap {}/{} is gone, nothing to do", namespace, name);
	    return Ok(report);
	}
    };

    let bundle = cm.data.as_ref()
	.and_then(|data| data.get(api::CONFIG_KEY))
	.map(String::as_str)
	.unwrap_or_default();
    let records = api::parse_apps(bundle)?;
    report.records = records.len();

    for record in &records {
	let (app_namespace, app_name) = match (&record.metadata.namespace, &record.metadata.name) {
	    (Some(ns), Some(name)) => (ns.as_str(), name.as_str()),
	    _ => {
		log::error!("Skipping AksApp without namespace/name: {:?}", record.metadata);
		report.skipped += 1;
		continue;
	    }
	};

	if let Err(err) = ensure_namespace(client, metrics, app_namespace).await {
	    log::error!("Unable to ensure namespace {}: {}", app_namespace, err);
	    report.skipped += 1;
	    continue;
	}

	match apply_app(client, metrics, record, app_namespace, app_name).await {
	    Ok(Outcome::Created) => report.created += 1,
	    Ok(Outcome::Updated) => report.updated += 1,
	    Ok(Outcome::Unchanged) => report.unchanged += 1,
	    Err(err) => {
		log::error!("Unable to apply aksapp {}/{}: {}", app_namespace, app_name, err);
		report.skipped += 1;
	    }
	}
    }

    Ok(report)
}
