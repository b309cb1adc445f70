mod client;
mod errors;
mod fanout;
mod manager;
mod metrics;

use clap::Parser;
use deployer_api as api;
use deployer_runtime as runtime;
use errors::Error;
use kube::Client as KubeClient;
use kube::CustomResourceExt;
use log;
use manager::Manager;
use metrics::Metrics;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

/*
 * Fans the cluster bundle out into AksApp custom resources.
 */
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {

    /// Namespace holding the cluster ConfigMap and the lease
    #[arg(long, default_value = api::DEFAULT_NAMESPACE)]
    namespace: String,

    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Print the AksApp CustomResourceDefinition and exit
    #[arg(long)]
    crd: bool,

    #[arg(long, env = "DEPLOY_ENV")]
    deploy_env: Option<String>,

    #[arg(long, env = "REGION")]
    region: Option<String>,
}

async fn run(args: Args) -> Result<(), Error> {
    let kube_client = KubeClient::try_default().await?;
    let token = runtime::shutdown_token();

    let mut prom = Registry::default();
    let metrics = Metrics::register(&mut prom);
    let listener = metrics::bind(args.metrics_addr).await.map_err(Error::Metrics)?;
    let server = tokio::spawn(metrics::serve(listener, Arc::new(prom), token.clone()));

    let identity = runtime::identity();
    let elector = Arc::new(runtime::LeaderElector::new(
	kube_client.clone(), &args.namespace, api::OPERATOR_LEASE_NAME, &identity,
    ));

    let mut guard = match elector.acquire(&token).await {
	Some(guard) => guard,
	None => return Ok(()),
    };

    log::info!("starting operator controllers in namespace {}", args.namespace);
    let manager = Manager::new(kube_client, &args.namespace, metrics);

    let lost = tokio::select! {
	_ = manager.configmap_controller() => false,
	_ = manager.aksapp_controller() => false,
	_ = guard.lost() => true,

	// handle SIGINT/SIGTERM as gracefully as we can.
	_ = token.cancelled() => false,
    };

    if lost {
	log::error!("{} lost leadership, exiting", identity);
    } else {
	guard.release().await;
    }

    token.cancel();
    match server.await {
	Ok(result) => result?,
	Err(err) => log::warn!("metrics server task failed: {}", err),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.crd {
	return match serde_yaml::to_string(&api::AksApp::crd()) {
	    Ok(crd) => {
		println!("{}", crd);
		ExitCode::SUCCESS
	    },
	    Err(err) => {
		eprintln!("{}", Error::from(err));
		ExitCode::FAILURE
	    }
	};
    }

    runtime::init_logger(args.deploy_env.as_deref(), args.region.as_deref());

    match run(args).await {
	Ok(()) => ExitCode::SUCCESS,
	Err(err) => {
	    log::error!("operator failed: {}", err);
	    ExitCode::FAILURE
	}
    }
}
