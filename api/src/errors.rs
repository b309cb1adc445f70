use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {

    /* a segment is not valid YAML, or doesn't fit the requested shape */
    #[error("document #{index} could not be decoded: {source}\n---\n{segment}")]
    Decode {
	index: usize,
	segment: String,
	#[source]
	source: serde_yaml::Error,
    },

    #[error("document #{index} has no apiVersion/kind")]
    MissingTypeMeta { index: usize },

    #[error("document #{index} is a {api_version}/{kind}, which is not registered in the scheme")]
    Unregistered {
	index: usize,
	api_version: String,
	kind: String,
    },
}
