mod auth;
mod blob;
mod config;
mod configmaps;
mod errors;
mod syncer;

use blob::AzureBlobClient;
use clap::Parser;
use config::Args;
use configmaps::KubeConfigMapStore;
use deployer_api as api;
use deployer_runtime as runtime;
use errors::Error;
use kube::Client as KubeClient;
use log;
use std::process::ExitCode;
use std::sync::Arc;
use syncer::Syncer;

/*
 * Startup failures return an error (exit 1). Losing the lease or being
 * asked to stop returns Ok (exit 0).
 */
async fn run(args: Args) -> Result<(), Error> {
    let cluster_name = args.cluster_name()?;
    let storage = args.storage()?;

    let kube_client = KubeClient::try_default().await?;
    let blobs = AzureBlobClient::new(&storage)?;

    let mut syncer = Syncer::new(blobs, KubeConfigMapStore::new(kube_client.clone()), &cluster_name);
    syncer.set_options(args.toggle_url.clone(), &args.namespace);

    log::info!(
	"starting syncer for cluster {} from {} into namespace {}",
	cluster_name, storage.endpoint(), syncer.namespace()
    );
    if let Some(url) = syncer.toggle_url() {
	log::info!("toggle url: {}", url);
    }

    let token = runtime::shutdown_token();
    let identity = runtime::identity();
    let elector = Arc::new(runtime::LeaderElector::new(
	kube_client, &args.namespace, api::SYNCER_LEASE_NAME, &identity,
    ));

    let mut guard = match elector.acquire(&token).await {
	Some(guard) => guard,
	None => return Ok(()),
    };

    let lost = tokio::select! {
	_ = syncer.run_forever(args.sync_period(), &token) => false,
	_ = guard.lost() => true,
    };

    if lost {
	log::error!("{} lost leadership, exiting", identity);
    } else {
	guard.release().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    runtime::init_logger(args.deploy_env.as_deref(), args.region.as_deref());

    match run(args).await {
	Ok(()) => ExitCode::SUCCESS,
	Err(err) => {
	    log::error!("syncer failed: {}", err);
	    ExitCode::FAILURE
	}
    }
}
