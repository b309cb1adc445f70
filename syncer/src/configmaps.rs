use crate::errors::Error;

use async_trait::async_trait;
use deployer_api as api;
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::DeleteParams as KubeDeleteParams;
use kube::api::ListParams as KubeListParams;
use kube::api::ObjectMeta;
use kube::api::PostParams as KubePostParams;
use log;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/*
 * The ConfigMap operations the syncer needs. Every ConfigMap it writes
 * carries a single `config` data key and a `blob-url` annotation.
 */
#[async_trait]
pub trait ConfigMapStore: Send + Sync {

    async fn apply(&self, namespace: &str, name: &str, config: &str, blob_url: &str) -> Result<Applied, Error>;

    async fn list_names(&self, namespace: &str) -> Result<Vec<String>, Error>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

fn holds(cm: &KubeConfigMap, config: &str, blob_url: &str) -> bool {
    let data = cm.data.as_ref().and_then(|d| d.get(api::CONFIG_KEY));
    let url = cm.metadata.annotations.as_ref().and_then(|a| a.get(api::BLOB_URL_ANNOTATION));

    data.map(String::as_str) == Some(config) && url.map(String::as_str) == Some(blob_url)
}

fn set_payload(cm: &mut KubeConfigMap, config: &str, blob_url: &str) {
    cm.data.get_or_insert_with(BTreeMap::new)
	.insert(api::CONFIG_KEY.to_string(), config.to_string());
    cm.metadata.annotations.get_or_insert_with(BTreeMap::new)
	.insert(api::BLOB_URL_ANNOTATION.to_string(), blob_url.to_string());
}

pub struct KubeConfigMapStore {
    kube_client: KubeClient,
}

impl KubeConfigMapStore {

    pub fn new(kube_client: KubeClient) -> Self {
	Self{
	    kube_client: kube_client,
	}
    }

    fn configmaps(&self, namespace: &str) -> KubeApi<KubeConfigMap> {
	KubeApi::namespaced(self.kube_client.clone(), namespace)
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {

    /*
     * Create the ConfigMap, or replace it when its payload differs. The
     * replace carries the resourceVersion we read, so a concurrent writer
     * makes it fail with a conflict instead of being overwritten.
     */
    async fn apply(&self, namespace: &str, name: &str, config: &str, blob_url: &str) -> Result<Applied, Error> {
	let configmaps = self.configmaps(namespace);
	let opts = KubePostParams::default();

	match configmaps.get_opt(name).await? {
	    None => {
		let mut metadata = ObjectMeta::default();
		metadata.name = Some(name.to_string());
		metadata.namespace = Some(namespace.to_string());

		let mut cm = KubeConfigMap{
		    metadata: metadata,
		    ..Default::default()
		};
		set_payload(&mut cm, config, blob_url);

		configmaps.create(&opts, &cm).await?;
		log::info!("created configmap {}/{}", namespace, name);
		Ok(Applied::Created)
	    },
	    Some(cm) if holds(&cm, config, blob_url) => Ok(Applied::Unchanged),
	    Some(mut cm) => {
		set_payload(&mut cm, config, blob_url);

		configmaps.replace(name, &opts, &cm).await?;
		log::info!("updated configmap {}/{}", namespace, name);
		Ok(Applied::Updated)
	    },
	}
    }

    async fn list_names(&self, namespace: &str) -> Result<Vec<String>, Error> {
	let list = self.configmaps(namespace).list(&KubeListParams::default()).await?;

	Ok(list.items.into_iter().filter_map(|cm| cm.metadata.name).collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
	self.configmaps(namespace).delete(name, &KubeDeleteParams::default()).await?;
	log::info!("deleted configmap {}/{}", namespace, name);
	Ok(())
    }
}
