use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("parse error: {0}")]
    Parse(#[from] deployer_api::ParseError),

    #[error("unable to serialize CRD: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("metrics server error: {0}")]
    Metrics(#[from] std::io::Error),

    #[error("`{0}`")]
    Other(String),
}
