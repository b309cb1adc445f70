use crate::auth::{ManagedIdentity, SharedKey};
use crate::config::{StorageAuth, StorageConfig};
use crate::errors::BlobError;

use async_trait::async_trait;
use chrono::Utc;
use log;
use reqwest::Client as HttpClient;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::Url;
use serde::Deserialize;

const API_VERSION: &str = "2021-08-06";

/*
 * Read-only view of the object store the syncer pulls from.
 */
#[async_trait]
pub trait BlobStore: Send + Sync {

    /* names of every blob in `container` starting with `prefix`, in listing order */
    async fn list_blobs(&self, container: &str, prefix: &str) -> Result<Vec<String>, BlobError>;

    /* whole content of one blob; a missing blob is BlobError::NotFound */
    async fn get_blob(&self, container: &str, name: &str) -> Result<String, BlobError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,

    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
}

/*
 * Decode one page of a List Blobs response, returning the names and the
 * continuation marker, if any.
 */
fn parse_listing(body: &str) -> Result<(Vec<String>, Option<String>), BlobError> {
    // the service prefixes its XML with a byte order mark
    let body = body.trim_start_matches('\u{feff}');
    let results: EnumerationResults = quick_xml::de::from_str(body)?;

    let names = results.blobs.items.into_iter().map(|b| b.name).collect();
    let marker = results.next_marker.filter(|m| !m.is_empty());
    Ok((names, marker))
}

enum Credentials {
    SharedKey(SharedKey),
    ManagedIdentity(ManagedIdentity),
}

/*
 * Blob client speaking the Azure Blob REST API.
 */
pub struct AzureBlobClient {
    http: HttpClient,
    endpoint: Url,
    credentials: Credentials,
}

impl AzureBlobClient {

    pub fn new(config: &StorageConfig) -> Result<Self, BlobError> {
	let endpoint = Url::parse(&config.endpoint())
	    .map_err(|err| BlobError::Auth(format!("invalid storage endpoint {}: {}", config.endpoint(), err)))?;

	let credentials = match &config.auth {
	    StorageAuth::AccessKey(key) => Credentials::SharedKey(SharedKey::new(&config.account, key)?),
	    StorageAuth::ManagedIdentity(id) => Credentials::ManagedIdentity(ManagedIdentity::new(id)),
	};

	Ok(Self{
	    http: HttpClient::new(),
	    endpoint: endpoint,
	    credentials: credentials,
	})
    }

    fn url(&self, container: &str, name: Option<&str>) -> Result<Url, BlobError> {
	let mut url = self.endpoint.clone();
	{
	    let mut segments = url.path_segments_mut()
		.map_err(|_| BlobError::Auth(format!("storage endpoint {} cannot carry a path", self.endpoint)))?;
	    segments.clear().push(container);
	    if let Some(name) = name {
		segments.extend(name.split('/'));
	    }
	}
	Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, BlobError> {
	let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

	let authorization = match &self.credentials {
	    Credentials::SharedKey(key) => {
		let ms_headers = [("x-ms-date", date.as_str()), ("x-ms-version", API_VERSION)];
		key.authorization(&Method::GET, &url, &ms_headers)?
	    },
	    Credentials::ManagedIdentity(identity) => {
		format!("Bearer {}", identity.token(&self.http).await?)
	    },
	};

	let resp = self.http.get(url)
	    .header("x-ms-date", date)
	    .header("x-ms-version", API_VERSION)
	    .header("Authorization", authorization)
	    .send()
	    .await?;
	Ok(resp)
    }
}

#[async_trait]
impl BlobStore for AzureBlobClient {

    async fn list_blobs(&self, container: &str, prefix: &str) -> Result<Vec<String>, BlobError> {
	let mut names = Vec::new();
	let mut marker: Option<String> = None;

	loop {
	    let mut url = self.url(container, None)?;
	    {
		let mut query = url.query_pairs_mut();
		query.append_pair("restype", "container")
		    .append_pair("comp", "list")
		    .append_pair("prefix", prefix);
		if let Some(marker) = &marker {
		    query.append_pair("marker", marker);
		}
	    }

	    let resp = self.get(url.clone()).await?;
	    if !resp.status().is_success() {
		return Err(BlobError::Status{ status: resp.status().as_u16(), url: url.to_string() });
	    }

	    let (mut page, next) = parse_listing(&resp.text().await?)?;
	    log::debug!("listed {} blobs under {}/{}", page.len(), container, prefix);
	    names.append(&mut page);

	    match next {
		Some(next) => marker = Some(next),
		None => break,
	    }
	}

	Ok(names)
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<String, BlobError> {
	let url = self.url(container, Some(name))?;
	let resp = self.get(url.clone()).await?;

	match resp.status() {
	    StatusCode::NOT_FOUND => Err(BlobError::NotFound{
		container: container.to_string(),
		name: name.to_string(),
	    }),
	    status if !status.is_success() => Err(BlobError::Status{
		status: status.as_u16(),
		url: url.to_string(),
	    }),
	    _ => {
		let bytes = resp.bytes().await?;
		String::from_utf8(bytes.to_vec()).map_err(|_| BlobError::Encoding{
		    container: container.to_string(),
		    name: name.to_string(),
		})
	    }
	}
    }
}
