use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const CONTENT_TYPE_OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WriteLabels {
    op: String,
}

#[derive(Clone, Default)]
pub struct Metrics {
    reconciles: Counter,
    reconcile_errors: Counter,
    app_writes: Family<WriteLabels, Counter>,
    namespaces_created: Counter,
}

impl Metrics {

    pub fn register(prom: &mut Registry) -> Self {
	let metrics = Self::default();

	prom.register(
	    "deployer_reconcile",
	    "Count of cluster-config fan-outs",
	    metrics.reconciles.clone(),
	);
	prom.register(
	    "deployer_reconcile_errors",
	    "Count of cluster-config fan-outs that failed",
	    metrics.reconcile_errors.clone(),
	);
	prom.register(
	    "deployer_aksapp_writes",
	    "Count of AksApp creates and updates",
	    metrics.app_writes.clone(),
	);
	prom.register(
	    "deployer_namespaces_created",
	    "Count of namespaces created for AksApps",
	    metrics.namespaces_created.clone(),
	);

	metrics
    }

    pub fn reconciled(&self) {
	self.reconciles.inc();
    }

    pub fn reconcile_failed(&self) {
	self.reconcile_errors.inc();
    }

    pub fn app_created(&self) {
	self.app_writes.get_or_create(&WriteLabels{ op: "create".to_string() }).inc();
    }

    pub fn app_updated(&self) {
	self.app_writes.get_or_create(&WriteLabels{ op: "update".to_string() }).inc();
    }

    pub fn namespace_created(&self) {
	self.namespaces_created.inc();
    }
}

fn render(prom: &Registry) -> Response<Full<Bytes>> {
    let mut body = String::new();

    match encode(&mut body, prom) {
	Ok(()) => {
	    let mut resp = Response::new(Full::new(Bytes::from(body)));
	    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_OPENMETRICS));
	    resp
	},
	Err(err) => {
	    log::error!("Unable to encode metrics: {}", err);
	    let mut resp = Response::new(Full::new(Bytes::new()));
	    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
	    resp
	}
    }
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("serving metrics on {}", listener.local_addr()?);
    Ok(listener)
}

/*
 * Serve the registry on every path until the token is cancelled.
 */
pub async fn serve(listener: TcpListener, prom: Arc<Registry>, token: CancellationToken) -> std::io::Result<()> {

    loop {
	let (stream, _) = tokio::select! {
	    accepted = listener.accept() => accepted?,
	    _ = token.cancelled() => return Ok(()),
	};

	let prom = prom.clone();
	tokio::spawn(async move {
	    let service = service_fn(move |_req: Request<Incoming>| {
		let prom = prom.clone();
		async move { Ok::<_, Infallible>(render(&prom)) }
	    });

	    if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
		log::debug!("metrics connection closed: {}", err);
	    }
	});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exposed() {
	let mut prom = Registry::default();
	let metrics = Metrics::register(&mut prom);

	metrics.reconciled();
	metrics.reconciled();
	metrics.app_created();
	metrics.app_updated();
	metrics.app_updated();
	metrics.namespace_created();

	let mut body = String::new();
	encode(&mut body, &prom).unwrap();

	assert!(body.contains("deployer_reconcile_total 2"));
	assert!(body.contains("deployer_reconcile_errors_total 0"));
	assert!(body.contains("deployer_aksapp_writes_total{op=\"create\"} 1"));
	assert!(body.contains("deployer_aksapp_writes_total{op=\"update\"} 2"));
	assert!(body.contains("deployer_namespaces_created_total 1"));
    }

    #[test]
    fn rendered_response() {
	let prom = Registry::default();
	let resp = render(&prom);

	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers()[CONTENT_TYPE], CONTENT_TYPE_OPENMETRICS);
    }

    #[tokio::test]
    async fn address_in_use_fails_bind() {
	let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let taken = first.local_addr().unwrap();

	assert!(bind(taken).await.is_err());
    }

    #[tokio::test]
    async fn serves_counters_until_cancelled() {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	let mut prom = Registry::default();
	let metrics = Metrics::register(&mut prom);
	metrics.namespace_created();

	let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let addr = listener.local_addr().unwrap();
	let token = CancellationToken::new();
	let server = tokio::spawn(serve(listener, Arc::new(prom), token.clone()));

	let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
	stream.write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await.unwrap();
	let mut response = String::new();
	stream.read_to_string(&mut response).await.unwrap();

	assert!(response.starts_with("HTTP/1.1 200"));
	assert!(response.contains("deployer_namespaces_created_total 1"));

	token.cancel();
	assert!(server.await.unwrap().is_ok());
    }
}
