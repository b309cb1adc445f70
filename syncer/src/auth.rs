/*
 * Request authentication for the Blob REST API.
 *
 * Two schemes are supported: SharedKey, where the account key signs a
 * canonical form of each request, and a managed identity bearer token
 * obtained from the instance metadata service.
 */

use crate::errors::BlobError;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log;
use reqwest::Client as HttpClient;
use reqwest::Method;
use reqwest::Url;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

/* refresh tokens this long before they expire */
const TOKEN_EXPIRY_SLACK_SECS: i64 = 300;

/*
 * Build the string SharedKey signs. Only GET requests without a body are
 * issued, so every standard header slot is empty.
 */
pub fn string_to_sign(method: &Method, url: &Url, account: &str, ms_headers: &[(&str, &str)]) -> String {
    let mut sts = String::new();
    sts.push_str(method.as_str());
    sts.push('\n');

    // Content-Encoding .. Range
    for _ in 0..11 {
	sts.push('\n');
    }

    let mut headers: Vec<(String, &str)> = ms_headers.iter()
	.map(|(name, value)| (name.to_lowercase(), value.trim()))
	.collect();
    headers.sort();
    for (name, value) in headers {
	sts.push_str(&format!("{}:{}\n", name, value));
    }

    sts.push_str(&format!("/{}{}", account, url.path()));

    let mut params: Vec<(String, String)> = url.query_pairs()
	.map(|(k, v)| (k.to_lowercase(), v.into_owned()))
	.collect();
    params.sort();
    for (name, value) in params {
	sts.push_str(&format!("\n{}:{}", name, value));
    }

    sts
}

pub struct SharedKey {
    account: String,
    key: Vec<u8>,
}

impl SharedKey {

    pub fn new(account: &str, key: &str) -> Result<Self, BlobError> {
	let key = BASE64.decode(key.trim())
	    .map_err(|err| BlobError::Auth(format!("storage account key is not valid base64: {}", err)))?;

	Ok(Self{
	    account: account.to_string(),
	    key: key,
	})
    }

    pub fn sign(&self, string_to_sign: &str) -> Result<String, BlobError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
	    .map_err(|err| BlobError::Auth(err.to_string()))?;
	mac.update(string_to_sign.as_bytes());

	Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    pub fn authorization(&self, method: &Method, url: &Url, ms_headers: &[(&str, &str)]) -> Result<String, BlobError> {
	let sts = string_to_sign(method, url, &self.account, ms_headers);
	Ok(format!("SharedKey {}:{}", self.account, self.sign(&sts)?))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: String,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_on: DateTime<Utc>,
}

pub struct ManagedIdentity {
    resource_id: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ManagedIdentity {

    pub fn new(resource_id: &str) -> Self {
	Self{
	    resource_id: resource_id.to_string(),
	    cached: Mutex::new(None),
	}
    }

    /*
     * Returns a bearer token for storage, reusing the cached one while it
     * is comfortably valid.
     */
    pub async fn token(&self, http: &HttpClient) -> Result<String, BlobError> {
	let mut cached = self.cached.lock().await;

	if let Some(token) = cached.as_ref() {
	    if Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_SLACK_SECS) < token.expires_on {
		return Ok(token.token.clone());
	    }
	}

	log::debug!("requesting a storage token for identity {}", self.resource_id);
	let resp = http.get(IMDS_TOKEN_URL)
	    .header("Metadata", "true")
	    .query(&[
		("api-version", "2018-02-01"),
		("resource", STORAGE_RESOURCE),
		("msi_res_id", self.resource_id.as_str()),
	    ])
	    .send()
	    .await?;

	if !resp.status().is_success() {
	    return Err(BlobError::Auth(format!("metadata service answered {}", resp.status())));
	}

	let body: TokenResponse = resp.json().await?;
	let expires_on = body.expires_on.parse::<i64>().ok()
	    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
	    .ok_or_else(|| BlobError::Auth(format!("invalid token expiry {:?}", body.expires_on)))?;

	*cached = Some(CachedToken{
	    token: body.access_token.clone(),
	    expires_on: expires_on,
	});

	Ok(body.access_token)
    }
}
