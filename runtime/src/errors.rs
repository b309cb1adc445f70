use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaderElectionError {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}
