use crate::client::KubeAppClient;
use crate::errors::Error;
use crate::fanout;
use crate::metrics::Metrics;

use deployer_api as api;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::ResourceExt;
use kube::runtime::controller::Action as KubeAction;
use kube::runtime::controller::Controller as KubeController;
use kube::runtime::watcher::Config as KubeWatcherConfig;
use log;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/* full re-list of the bundle even without changes */
const RESYNC_PERIOD: Duration = Duration::from_secs(3600);
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/*
 * Manager runs the operator's controllers: the ConfigMap controller that
 * fans the cluster bundle out to AksApps, and the AksApp controller.
 */
#[derive(Clone)]
pub struct Manager {
    namespace: String,
    app_client: KubeAppClient,
    configmap_api: KubeApi<KubeConfigMap>,
    aksapp_api: KubeApi<api::AksApp>,
    metrics: Metrics,
}

#[derive(Clone)]
pub struct ManagerCtx {
    manager: Manager,
}

/*
 * Only the well-known cluster ConfigMap triggers a fan-out; every other
 * ConfigMap in the namespace is ignored.
 */
fn is_cluster_config(cm: &KubeConfigMap, namespace: &str) -> bool {
    cm.name_any() == api::CLUSTER_CONFIG_NAME && cm.namespace().as_deref() == Some(namespace)
}

async fn reconcile(cm: Arc<KubeConfigMap>, ctx: Arc<ManagerCtx>) -> Result<KubeAction, Error> {
    let manager = &ctx.manager;

    if !is_cluster_config(&cm, &manager.namespace) {
	return Ok(KubeAction::await_change());
    }

    manager.metrics.reconciled();
    let report = fanout::fan_out(&manager.app_client, &manager.metrics, &manager.namespace, api::CLUSTER_CONFIG_NAME).await?;
    log::info!(
	"fan-out of {}/{} done: {} records, {} created, {} updated, {} unchanged, {} skipped",
	manager.namespace, api::CLUSTER_CONFIG_NAME,
	report.records, report.created, report.updated, report.unchanged, report.skipped
    );

    Ok(KubeAction::requeue(RESYNC_PERIOD))
}

fn error_policy(cm: Arc<KubeConfigMap>, error: &Error, ctx: Arc<ManagerCtx>) -> KubeAction {
    ctx.manager.metrics.reconcile_failed();
    log::warn!("fan-out of {} failed, retrying: {}", cm.name_any(), error);

    KubeAction::requeue(ERROR_REQUEUE)
}

/*
 * AksApps are acted upon by downstream controllers; here they are only
 * observed.
 */
async fn reconcile_app(app: Arc<api::AksApp>, _ctx: Arc<ManagerCtx>) -> Result<KubeAction, Error> {
    log::debug!(
	"observed aksapp {}/{} ({} {})",
	app.namespace().unwrap_or_default(), app.name_any(), app.spec.app_type, app.spec.version
    );

    Ok(KubeAction::await_change())
}

fn app_error_policy(_app: Arc<api::AksApp>, _error: &Error, _ctx: Arc<ManagerCtx>) -> KubeAction {
    KubeAction::requeue(ERROR_REQUEUE)
}

impl Manager {

    pub fn configmap_controller(&self) -> impl Future<Output = ()> {
	let ctx = Arc::new(ManagerCtx{
	    manager: self.clone(),
	});

	KubeController::new(self.configmap_api.clone(), KubeWatcherConfig::default())
	    .run(reconcile, error_policy, ctx)
	    .for_each(|reconcile| async move {
		if let Err(err) = reconcile {
		    log::debug!("configmap reconcile error: {:?}", err);
		}
	    })
    }

    pub fn aksapp_controller(&self) -> impl Future<Output = ()> {
	let ctx = Arc::new(ManagerCtx{
	    manager: self.clone(),
	});

	KubeController::new(self.aksapp_api.clone(), KubeWatcherConfig::default())
	    .run(reconcile_app, app_error_policy, ctx)
	    .for_each(|reconcile| async move {
		if let Err(err) = reconcile {
		    log::debug!("aksapp reconcile error: {:?}", err);
		}
	    })
    }

    pub fn new(kube_client: KubeClient, namespace: &str, metrics: Metrics) -> Self {
	Self{
	    namespace: namespace.to_string(),
	    app_client: KubeAppClient::new(kube_client.clone()),
	    configmap_api: KubeApi::namespaced(kube_client.clone(), namespace),
	    aksapp_api: KubeApi::all(kube_client),
	    metrics: metrics,
	}
    }
}
