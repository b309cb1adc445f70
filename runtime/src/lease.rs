/*
 * Leader election over a coordination.k8s.io/v1 Lease.
 *
 * Every write carries the resourceVersion that was read, so two replicas
 * racing for the same lease can't both win: the loser gets a 409 and
 * tries again on the next retry period.
 */

use crate::errors::LeaderElectionError;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::ObjectMeta;
use kube::api::PostParams as KubePostParams;
use log;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTimers {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseTimers {
    fn default() -> Self {
	Self{
	    lease_duration: Duration::from_secs(30),
	    renew_deadline: Duration::from_secs(15),
	    retry_period: Duration::from_secs(5),
	}
    }
}

/*
 * What to do with the lease as currently observed.
 */
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    HeldByOther,
}

fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> Decision {
    let lease = match lease {
	Some(lease) => lease,
	None => return Decision::Create,
    };
    let spec = lease.spec.as_ref();

    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
	return Decision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration) {
	(None, _, _) => true,
	(Some(_), Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(secs as i64),
	_ => true,
    };

    if expired {
	let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
	Decision::TakeOver{ transitions: transitions + 1 }
    } else {
	Decision::HeldByOther
    }
}

/*
 * Time left for the next renewal attempt. A renewal must complete within
 * the renew deadline counted from the last successful one; None once that
 * has run out.
 */
fn renew_budget(last_renewed: Instant, now: Instant, deadline: Duration) -> Option<Duration> {
    deadline.checked_sub(now.saturating_duration_since(last_renewed))
	.filter(|budget| !budget.is_zero())
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

pub struct LeaderElector {
    lease_api: KubeApi<Lease>,
    lease_name: String,
    namespace: String,
    identity: String,
    timers: LeaseTimers,
}

impl LeaderElector {

    pub fn new(kube_client: KubeClient, namespace: &str, lease_name: &str, identity: &str) -> Self {
	Self{
	    lease_api: KubeApi::namespaced(kube_client, namespace),
	    lease_name: lease_name.to_string(),
	    namespace: namespace.to_string(),
	    identity: identity.to_string(),
	    timers: LeaseTimers::default(),
	}
    }

    pub fn with_timers(mut self, timers: LeaseTimers) -> Self {
	self.timers = timers;
	self
    }

    /*
     * Blocks until this replica holds the lease. Returns None when the
     * token is cancelled first.
     */
    pub async fn acquire(self: Arc<Self>, token: &CancellationToken) -> Option<LeaderGuard> {
	log::info!("{} waiting for lease {}/{}", self.identity, self.namespace, self.lease_name);

	loop {
	    match self.try_acquire_or_renew().await {
		Ok(true) => {
		    log::info!("{} acquired lease {}/{}", self.identity, self.namespace, self.lease_name);
		    return Some(self.guard());
		},
		Ok(false) => {
		    log::debug!("lease {} is held by another replica", self.lease_name);
		},
		Err(err) => {
		    log::warn!("Unable to acquire lease {}: {}", self.lease_name, err);
		}
	    }

	    tokio::select! {
		_ = tokio::time::sleep(self.timers.retry_period) => {},
		_ = token.cancelled() => return None,
	    }
	}
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
	let (lost_tx, lost_rx) = oneshot::channel();
	let elector = Arc::clone(self);
	let renewal = tokio::spawn(async move {
	    elector.renewal_loop(lost_tx).await;
	});

	LeaderGuard{
	    elector: Arc::clone(self),
	    renewal: renewal,
	    lost_rx: Some(lost_rx),
	}
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
	let mut last_renewed = Instant::now();

	loop {
	    tokio::time::sleep(self.timers.retry_period).await;

	    let budget = match renew_budget(last_renewed, Instant::now(), self.timers.renew_deadline) {
		Some(budget) => budget,
		None => {
		    log::error!("lease {} not renewed within {:?}", self.lease_name, self.timers.renew_deadline);
		    break;
		}
	    };

	    match tokio::time::timeout(budget, self.try_acquire_or_renew()).await {
		Ok(Ok(true)) => {
		    last_renewed = Instant::now();
		},
		Ok(Ok(false)) => {
		    log::warn!("lease {} was taken by another replica", self.lease_name);
		    break;
		},
		Ok(Err(err)) => {
		    log::warn!("Unable to renew lease {}: {}", self.lease_name, err);
		},
		Err(_) => {
		    log::error!("lease {} not renewed within {:?}", self.lease_name, self.timers.renew_deadline);
		    break;
		}
	    }
	}

	let _ = lost_tx.send(());
    }

    fn spec(&self, now: DateTime<Utc>, acquired: DateTime<Utc>, transitions: i32) -> LeaseSpec {
	LeaseSpec{
	    holder_identity: Some(self.identity.clone()),
	    lease_duration_seconds: Some(self.timers.lease_duration.as_secs() as i32),
	    acquire_time: Some(MicroTime(acquired)),
	    renew_time: Some(MicroTime(now)),
	    lease_transitions: Some(transitions),
	    ..Default::default()
	}
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
	let now = Utc::now();
	let existing = self.lease_api.get_opt(&self.lease_name).await?;

	let (mut lease, spec) = match decide(existing.as_ref(), &self.identity, now) {
	    Decision::HeldByOther => return Ok(false),
	    Decision::Create => {
		let mut metadata = ObjectMeta::default();
		metadata.name = Some(self.lease_name.clone());
		metadata.namespace = Some(self.namespace.clone());

		let lease = Lease{
		    metadata: metadata,
		    spec: Some(self.spec(now, now, 0)),
		};
		return match self.lease_api.create(&KubePostParams::default(), &lease).await {
		    Ok(_) => Ok(true),
		    Err(err) if is_conflict(&err) => Ok(false),
		    Err(err) => Err(err.into()),
		};
	    },
	    Decision::Renew => {
		let lease = existing.unwrap_or_default();
		let spec = lease.spec.clone().unwrap_or_default();
		let acquired = spec.acquire_time.map(|t| t.0).unwrap_or(now);
		let transitions = spec.lease_transitions.unwrap_or(0);
		let spec = self.spec(now, acquired, transitions);
		(lease, spec)
	    },
	    Decision::TakeOver{ transitions } => {
		let lease = existing.unwrap_or_default();
		let spec = self.spec(now, now, transitions);
		(lease, spec)
	    },
	};

	if lease.metadata.resource_version.is_none() {
	    return Err(LeaderElectionError::MissingResourceVersion(self.lease_name.clone()));
	}
	lease.spec = Some(spec);

	match self.lease_api.replace(&self.lease_name, &KubePostParams::default(), &lease).await {
	    Ok(_) => Ok(true),
	    Err(err) if is_conflict(&err) => Ok(false),
	    Err(err) => Err(err.into()),
	}
    }

    /*
     * Clear the holder so a standby can take over without waiting for the
     * lease to expire.
     */
    async fn release(&self) -> Result<(), LeaderElectionError> {
	let mut lease = match self.lease_api.get(&self.lease_name).await {
	    Ok(lease) => lease,
	    Err(err) if is_not_found(&err) => return Ok(()),
	    Err(err) => return Err(err.into()),
	};

	let mut spec = lease.spec.clone().unwrap_or_default();
	if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
	    return Ok(());
	}
	spec.holder_identity = None;
	spec.renew_time = None;
	lease.spec = Some(spec);

	self.lease_api.replace(&self.lease_name, &KubePostParams::default(), &lease).await?;
	log::info!("{} released lease {}", self.identity, self.lease_name);
	Ok(())
    }
}

/*
 * Held while this replica is the leader. Renewal runs in the background
 * until the guard is dropped or leadership is lost.
 */
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {

    /*
     * Resolves once leadership has been lost.
     */
    pub async fn lost(&mut self) {
	if let Some(rx) = self.lost_rx.take() {
	    let _ = rx.await;
	}
    }

    /*
     * Stop renewing and hand the lease back. Used on graceful shutdown.
     */
    pub async fn release(self) {
	self.renewal.abort();
	if let Err(err) = self.elector.release().await {
	    log::warn!("Unable to release lease {}: {}", self.elector.lease_name, err);
	}
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
	self.renewal.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http::{Method, Request, Response};
    use http_body_util::{BodyExt, Full};
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    fn lease(holder: Option<&str>, renewed: DateTime<Utc>, transitions: i32) -> Lease {
	Lease{
	    metadata: ObjectMeta::default(),
	    spec: Some(LeaseSpec{
		holder_identity: holder.map(str::to_string),
		lease_duration_seconds: Some(30),
		renew_time: Some(MicroTime(renewed)),
		lease_transitions: Some(transitions),
		..Default::default()
	    }),
	}
    }

    #[test]
    fn default_timers() {
	let timers = LeaseTimers::default();
	assert_eq!(timers.lease_duration, Duration::from_secs(30));
	assert_eq!(timers.renew_deadline, Duration::from_secs(15));
	assert_eq!(timers.retry_period, Duration::from_secs(5));
    }

    #[test]
    fn missing_lease_is_created() {
	assert_eq!(decide(None, "me", Utc::now()), Decision::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
	let now = Utc::now();
	assert_eq!(decide(Some(&lease(Some("me"), now, 3)), "me", now), Decision::Renew);
    }

    #[test]
    fn live_lease_of_other_is_respected() {
	let now = Utc::now();
	let l = lease(Some("other"), now - chrono::Duration::seconds(10), 0);
	assert_eq!(decide(Some(&l), "me", now), Decision::HeldByOther);
    }

    #[test]
    fn expired_lease_is_taken_over() {
	let now = Utc::now();
	let l = lease(Some("other"), now - chrono::Duration::seconds(31), 4);
	assert_eq!(decide(Some(&l), "me", now), Decision::TakeOver{ transitions: 5 });
    }

    #[test]
    fn released_lease_is_taken_over() {
	let now = Utc::now();
	let l = lease(None, now, 1);
	assert_eq!(decide(Some(&l), "me", now), Decision::TakeOver{ transitions: 2 });
    }

    #[test]
    fn renew_budget_shrinks_to_nothing() {
	let renewed = Instant::now();
	let deadline = Duration::from_secs(15);

	assert_eq!(renew_budget(renewed, renewed + Duration::from_secs(10), deadline), Some(Duration::from_secs(5)));
	assert_eq!(renew_budget(renewed, renewed + Duration::from_secs(15), deadline), None);
	assert_eq!(renew_budget(renewed, renewed + Duration::from_secs(16), deadline), None);
    }

    /*
     * Just enough of the coordination API to hold one lease: GET, POST and
     * PUT with resourceVersion checks. Once stalled, no request completes.
     */
    #[derive(Default)]
    struct LeaseServer {
	lease: Mutex<Option<Lease>>,
	version: AtomicU64,
	gets: AtomicUsize,
	stalled: AtomicBool,
    }

    fn status(code: u16, reason: &str) -> (u16, Vec<u8>) {
	let body = serde_json::json!({
	    "kind": "Status",
	    "apiVersion": "v1",
	    "metadata": {},
	    "status": "Failure",
	    "message": reason,
	    "reason": reason,
	    "code": code,
	});
	(code, serde_json::to_vec(&body).unwrap())
    }

    impl LeaseServer {
	fn client(self: &Arc<Self>) -> KubeClient {
	    let server = Arc::clone(self);
	    let service = tower::service_fn(move |req: Request<kube::client::Body>| {
		let server = Arc::clone(&server);
		async move { server.handle(req).await }
	    });
	    KubeClient::new(service, "deployer")
	}

	fn stored(&self) -> Option<Lease> {
	    self.lease.lock().unwrap().clone()
	}

	fn hand_to(&self, holder: &str) {
	    let mut lease = self.stored().unwrap();
	    let spec = lease.spec.get_or_insert_with(Default::default);
	    spec.holder_identity = Some(holder.to_string());
	    spec.renew_time = Some(MicroTime(Utc::now()));
	    spec.lease_duration_seconds = Some(30);
	    lease.metadata.resource_version = Some(self.bump());
	    *self.lease.lock().unwrap() = Some(lease);
	}

	fn bump(&self) -> String {
	    (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
	}

	fn write(&self, mut lease: Lease, create: bool) -> (u16, Vec<u8>) {
	    let mut stored = self.lease.lock().unwrap();
	    match (stored.as_ref(), create) {
		(Some(_), true) => return status(409, "AlreadyExists"),
		(None, false) => return status(404, "NotFound"),
		(Some(current), false) if current.metadata.resource_version != lease.metadata.resource_version => {
		    return status(409, "Conflict");
		},
		_ => {}
	    }

	    lease.metadata.resource_version = Some(self.bump());
	    let body = serde_json::to_vec(&lease).unwrap();
	    *stored = Some(lease);
	    (if create { 201 } else { 200 }, body)
	}

	async fn handle(&self, req: Request<kube::client::Body>) -> Result<Response<Full<Bytes>>, Infallible> {
	    if self.stalled.load(Ordering::SeqCst) {
		std::future::pending::<()>().await;
	    }

	    let method = req.method().clone();
	    let body = req.into_body().collect().await.unwrap().to_bytes();

	    let (code, payload) = match method {
		Method::GET => {
		    self.gets.fetch_add(1, Ordering::SeqCst);
		    match self.stored() {
			Some(lease) => (200, serde_json::to_vec(&lease).unwrap()),
			None => status(404, "NotFound"),
		    }
		},
		Method::POST => self.write(serde_json::from_slice(&body).unwrap(), true),
		Method::PUT => self.write(serde_json::from_slice(&body).unwrap(), false),
		_ => status(405, "MethodNotAllowed"),
	    };

	    Ok(Response::builder()
	       .status(code)
	       .header("content-type", "application/json")
	       .body(Full::new(Bytes::from(payload)))
	       .unwrap())
	}
    }

    fn fast_timers() -> LeaseTimers {
	LeaseTimers{
	    lease_duration: Duration::from_secs(3),
	    renew_deadline: Duration::from_millis(600),
	    retry_period: Duration::from_millis(100),
	}
    }

    fn elector(server: &Arc<LeaseServer>, identity: &str) -> Arc<LeaderElector> {
	Arc::new(LeaderElector::new(server.client(), "deployer", "syncer", identity).with_timers(fast_timers()))
    }

    fn holder(server: &LeaseServer) -> Option<String> {
	server.stored().and_then(|l| l.spec).and_then(|s| s.holder_identity)
    }

    #[tokio::test]
    async fn acquires_missing_lease_and_keeps_renewing() {
	let server = Arc::new(LeaseServer::default());
	let token = CancellationToken::new();

	let mut guard = elector(&server, "me").acquire(&token).await.unwrap();
	assert_eq!(holder(&server).as_deref(), Some("me"));
	assert_eq!(server.stored().unwrap().spec.unwrap().lease_duration_seconds, Some(3));

	/* well past the renew deadline, renewals keep the lease */
	let lost = tokio::time::timeout(Duration::from_millis(1200), guard.lost()).await;
	assert!(lost.is_err());
	assert!(server.gets.load(Ordering::SeqCst) >= 5);
	assert_eq!(holder(&server).as_deref(), Some("me"));
    }

    #[tokio::test]
    async fn stalled_renewal_loses_leadership() {
	let server = Arc::new(LeaseServer::default());
	let token = CancellationToken::new();

	let mut guard = elector(&server, "me").acquire(&token).await.unwrap();
	server.stalled.store(true, Ordering::SeqCst);

	let lost = tokio::time::timeout(Duration::from_secs(3), guard.lost()).await;
	assert!(lost.is_ok(), "leadership not reported lost while renewals hang");
    }

    #[tokio::test]
    async fn lease_taken_by_other_loses_leadership() {
	let server = Arc::new(LeaseServer::default());
	let token = CancellationToken::new();

	let mut guard = elector(&server, "me").acquire(&token).await.unwrap();
	server.hand_to("other");

	let lost = tokio::time::timeout(Duration::from_secs(2), guard.lost()).await;
	assert!(lost.is_ok());
	assert_eq!(holder(&server).as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn live_lease_of_other_blocks_until_cancelled() {
	let server = Arc::new(LeaseServer::default());
	let token = CancellationToken::new();

	elector(&server, "other").acquire(&token).await.unwrap().release().await;
	server.hand_to("other");

	let canceller = token.clone();
	tokio::spawn(async move {
	    tokio::time::sleep(Duration::from_millis(300)).await;
	    canceller.cancel();
	});

	assert!(elector(&server, "me").acquire(&token).await.is_none());
	assert_eq!(holder(&server).as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn release_clears_holder_for_standby() {
	let server = Arc::new(LeaseServer::default());
	let token = CancellationToken::new();

	let guard = elector(&server, "me").acquire(&token).await.unwrap();
	guard.release().await;
	assert_eq!(holder(&server), None);

	let standby = tokio::time::timeout(Duration::from_secs(1), elector(&server, "standby").acquire(&token)).await;
	assert!(standby.unwrap().is_some());
	assert_eq!(holder(&server).as_deref(), Some("standby"));

	let transitions = server.stored().unwrap().spec.unwrap().lease_transitions;
	assert_eq!(transitions, Some(1));
    }
}
