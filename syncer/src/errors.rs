use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {

    #[error("blob {container}/{name} not found")]
    NotFound { container: String, name: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("unable to decode blob listing: {0}")]
    Listing(#[from] quick_xml::DeError),

    #[error("blob {container}/{name} is not valid UTF-8")]
    Encoding { container: String, name: String },

    #[error("authentication error: {0}")]
    Auth(String),
}

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("parse error: {0}")]
    Parse(#[from] deployer_api::ParseError),

    #[error("configuration error: {0}")]
    Config(String),
}
