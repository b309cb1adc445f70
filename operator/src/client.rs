use crate::errors::Error;

use async_trait::async_trait;
use deployer_api as api;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use k8s_openapi::api::core::v1::Namespace as KubeNamespace;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::ObjectMeta;
use kube::api::PostParams as KubePostParams;

/*
 * The cluster operations the fan-out performs.
 */
#[async_trait]
pub trait AppClient: Send + Sync {

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<KubeConfigMap>, Error>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    async fn create_namespace(&self, name: &str) -> Result<(), Error>;

    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<api::AksApp>, Error>;

    async fn create_app(&self, app: &api::AksApp) -> Result<(), Error>;

    /* replace an existing AksApp; `app` must carry the stored resourceVersion */
    async fn replace_app(&self, app: &api::AksApp) -> Result<(), Error>;
}

fn name_of(app: &api::AksApp) -> Result<(String, String), Error> {
    match (&app.metadata.namespace, &app.metadata.name) {
	(Some(namespace), Some(name)) => Ok((namespace.clone(), name.clone())),
	_ => Err(Error::Other(format!("AksApp without namespace/name: {:?}", app.metadata))),
    }
}

#[derive(Clone)]
pub struct KubeAppClient {
    kube_client: KubeClient,
    namespace_api: KubeApi<KubeNamespace>,
}

impl KubeAppClient {

    pub fn new(kube_client: KubeClient) -> Self {
	Self{
	    kube_client: kube_client.clone(),
	    namespace_api: KubeApi::all(kube_client),
	}
    }

    fn apps(&self, namespace: &str) -> KubeApi<api::AksApp> {
	KubeApi::namespaced(self.kube_client.clone(), namespace)
    }
}

#[async_trait]
impl AppClient for KubeAppClient {

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<KubeConfigMap>, Error> {
	let configmaps: KubeApi<KubeConfigMap> = KubeApi::namespaced(self.kube_client.clone(), namespace);
	Ok(configmaps.get_opt(name).await?)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
	Ok(self.namespace_api.get_opt(name).await?.is_some())
    }

    async fn create_namespace(&self, name: &str) -> Result<(), Error> {
	let mut metadata = ObjectMeta::default();
	metadata.name = Some(name.to_string());

	let ns = KubeNamespace{
	    metadata: metadata,
	    ..Default::default()
	};
	self.namespace_api.create(&KubePostParams::default(), &ns).await?;
	Ok(())
    }

    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<api::AksApp>, Error> {
	Ok(self.apps(namespace).get_opt(name).await?)
    }

    async fn create_app(&self, app: &api::AksApp) -> Result<(), Error> {
	let (namespace, _) = name_of(app)?;
	self.apps(&namespace).create(&KubePostParams::default(), app).await?;
	Ok(())
    }

    async fn replace_app(&self, app: &api::AksApp) -> Result<(), Error> {
	let (namespace, name) = name_of(app)?;
	self.apps(&namespace).replace(&name, &KubePostParams::default(), app).await?;
	Ok(())
    }
}
