/*
 * Multi-document YAML handling.
 *
 * Bundles travel as plain strings where every document is followed by
 * the literal separator `---\n`. Splitting is textual: YAML's own
 * document markers are not interpreted.
 */

use crate::errors::ParseError;

use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;

pub const SEPARATOR: &str = "---\n";

/*
 * Scheme keeps the (apiVersion, kind) pairs a caller knows how to decode
 * into a concrete type.
 */
#[derive(Clone, Debug, Default)]
pub struct Scheme {
    kinds: BTreeSet<(String, String)>,
}

impl Scheme {

    pub fn new() -> Self {
	Self::default()
    }

    pub fn register<K: Resource<DynamicType = ()>>(mut self) -> Self {
	self.kinds.insert((K::api_version(&()).to_string(), K::kind(&()).to_string()));
	self
    }

    pub fn recognizes(&self, types: &TypeMeta) -> bool {
	self.kinds.contains(&(types.api_version.clone(), types.kind.clone()))
    }

    fn recognizes_as<K: Resource<DynamicType = ()>>(&self, types: &TypeMeta) -> bool {
	self.recognizes(types)
	    && types.api_version == K::api_version(&())
	    && types.kind == K::kind(&())
    }
}

/*
 * A decoded document: either the caller's concrete type, or the
 * schema-agnostic form when the kind isn't registered.
 */
#[derive(Clone, Debug)]
pub enum Manifest<K> {
    Typed(K),
    Generic(DynamicObject),
}

impl<K: Resource<DynamicType = ()>> Manifest<K> {

    pub fn metadata(&self) -> &ObjectMeta {
	match self {
	    Manifest::Typed(obj) => obj.meta(),
	    Manifest::Generic(obj) => &obj.metadata,
	}
    }

    pub fn type_meta(&self) -> TypeMeta {
	match self {
	    Manifest::Typed(_) => TypeMeta{
		api_version: K::api_version(&()).to_string(),
		kind: K::kind(&()).to_string(),
	    },
	    Manifest::Generic(obj) => obj.types.clone().unwrap_or_default(),
	}
    }

    pub fn typed(self) -> Option<K> {
	match self {
	    Manifest::Typed(obj) => Some(obj),
	    Manifest::Generic(_) => None,
	}
    }
}

/*
 * Split on the literal separator, dropping the empty segments produced at
 * the boundaries. Order is preserved.
 */
pub fn split_documents(data: &str) -> Vec<&str> {
    data.split(SEPARATOR)
	.filter(|segment| !segment.is_empty())
	.collect()
}

/*
 * Inverse of split_documents: every document followed by the separator.
 */
pub fn join_documents<S: AsRef<str>>(docs: &[S]) -> String {
    let mut bundle = String::new();
    for doc in docs {
	bundle.push_str(doc.as_ref());
	bundle.push_str(SEPARATOR);
    }
    bundle
}

fn decode<T: DeserializeOwned>(index: usize, segment: &str) -> Result<T, ParseError> {
    serde_yaml::from_str(segment).map_err(|source| ParseError::Decode{
	index: index,
	segment: segment.to_string(),
	source: source,
    })
}

fn decode_generic(index: usize, segment: &str) -> Result<DynamicObject, ParseError> {
    let obj: DynamicObject = decode(index, segment)?;
    match &obj.types {
	Some(types) if !types.api_version.is_empty() && !types.kind.is_empty() => Ok(obj),
	_ => Err(ParseError::MissingTypeMeta{ index: index }),
    }
}

/*
 * Decode every document into K. Each document must declare the
 * apiVersion/kind registered for K; the first failure aborts the whole
 * parse and nothing is returned.
 */
pub fn parse_config<K>(scheme: &Scheme, data: &str) -> Result<Vec<K>, ParseError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let mut objects = Vec::new();

    for (index, segment) in split_documents(data).into_iter().enumerate() {
	let generic = decode_generic(index, segment)?;
	let types = generic.types.unwrap_or_default();
	if !scheme.recognizes_as::<K>(&types) {
	    return Err(ParseError::Unregistered{
		index: index,
		api_version: types.api_version,
		kind: types.kind,
	    });
	}

	objects.push(decode(index, segment)?);
    }

    Ok(objects)
}

/*
 * Decode every document into the schema-agnostic form.
 */
pub fn parse_config_to_unstructured(data: &str) -> Result<Vec<DynamicObject>, ParseError> {
    split_documents(data)
	.into_iter()
	.enumerate()
	.map(|(index, segment)| decode_generic(index, segment))
	.collect()
}

/*
 * Decode registered kinds into K and everything else generically.
 */
pub fn parse_manifests<K>(scheme: &Scheme, data: &str) -> Result<Vec<Manifest<K>>, ParseError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let mut manifests = Vec::new();

    for (index, segment) in split_documents(data).into_iter().enumerate() {
	let generic = decode_generic(index, segment)?;
	let is_typed = generic.types.as_ref()
	    .map(|types| scheme.recognizes_as::<K>(types))
	    .unwrap_or(false);

	if is_typed {
	    manifests.push(Manifest::Typed(decode(index, segment)?));
	} else {
	    manifests.push(Manifest::Generic(generic));
	}
    }

    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AksApp;

    const FOO: &str = "apiVersion: deployer.aks/v1
kind: AksApp
metadata:
  name: foo
  namespace: foo-ns
spec:
  type: foo
  version: \"1\"
";

    const BAR: &str = "apiVersion: deployer.aks/v1
kind: AksApp
metadata:
  name: bar
  namespace: bar-ns
spec:
  type: bar
  version: \"7\"
  variables:
    region: westus
";

    const CM: &str = "apiVersion: v1
kind: ConfigMap
metadata:
  name: extra
data:
  k: v
";

    fn scheme() -> Scheme {
	Scheme::new().register::<AksApp>()
    }

    #[test]
    fn split_drops_boundary_segments() {
	let docs = split_documents("---\ndoc1\n---\ndoc2\n");
	assert_eq!(docs, vec!["doc1\n", "doc2\n"]);
    }

    #[test]
    fn split_is_textual() {
	// `---` without a trailing newline is not a separator
	let docs = split_documents("a: 1\n--- \nb: 2\n");
	assert_eq!(docs, vec!["a: 1\n--- \nb: 2\n"]);
    }

    #[test]
    fn empty_bundle_has_no_records() {
	let apps: Vec<AksApp> = parse_config(&scheme(), "").unwrap();
	assert!(apps.is_empty());

	let apps: Vec<AksApp> = parse_config(&scheme(), SEPARATOR).unwrap();
	assert!(apps.is_empty());
    }

    #[test]
    fn typed_parse_preserves_order() {
	let bundle = join_documents(&[FOO, BAR]);
	let apps: Vec<AksApp> = parse_config(&scheme(), &bundle).unwrap();

	let names: Vec<_> = apps.iter().map(|a| a.metadata.name.clone().unwrap()).collect();
	assert_eq!(names, vec!["foo", "bar"]);
	assert_eq!(apps[1].spec.variables.get("region").map(String::as_str), Some("westus"));
	assert_eq!(apps[0].metadata.namespace.as_deref(), Some("foo-ns"));
    }

    #[test]
    fn malformed_document_fails_whole_parse() {
	let bundle = join_documents(&[FOO, "spec: [unterminated\n", BAR]);
	let err = parse_config::<AksApp>(&scheme(), &bundle).unwrap_err();

	match err {
	    ParseError::Decode{ index, segment, .. } => {
		assert_eq!(index, 1);
		assert_eq!(segment, "spec: [unterminated\n");
	    },
	    other => panic!("unexpected error: {:?}", other),
	}
    }

    #[test]
    fn single_malformed_document() {
	let err = parse_config::<AksApp>(&scheme(), "key: [\n---\n").unwrap_err();
	assert!(matches!(err, ParseError::Decode{ index: 0, .. }));
    }

    #[test]
    fn unregistered_kind_is_rejected_by_typed_parse() {
	let bundle = join_documents(&[FOO, CM]);
	let err = parse_config::<AksApp>(&scheme(), &bundle).unwrap_err();
	assert!(matches!(err, ParseError::Unregistered{ index: 1, .. }));

	let err = parse_config::<AksApp>(&Scheme::new(), FOO).unwrap_err();
	assert!(matches!(err, ParseError::Unregistered{ index: 0, .. }));
    }

    #[test]
    fn missing_type_meta() {
	let err = parse_config_to_unstructured("metadata:\n  name: x\n").unwrap_err();
	assert!(matches!(err, ParseError::MissingTypeMeta{ index: 0 }));
    }

    #[test]
    fn unstructured_parse() {
	let bundle = join_documents(&[CM, FOO]);
	let objs = parse_config_to_unstructured(&bundle).unwrap();

	assert_eq!(objs.len(), 2);
	assert_eq!(objs[0].types.as_ref().unwrap().kind, "ConfigMap");
	assert_eq!(objs[0].data["data"]["k"], "v");
	assert_eq!(objs[1].metadata.name.as_deref(), Some("foo"));
	assert_eq!(objs[1].data["spec"]["type"], "foo");
    }

    #[test]
    fn mixed_manifests_dispatch_on_scheme() {
	let bundle = join_documents(&[FOO, CM]);
	let manifests: Vec<Manifest<AksApp>> = parse_manifests(&scheme(), &bundle).unwrap();

	assert!(matches!(manifests[0], Manifest::Typed(_)));
	assert!(matches!(manifests[1], Manifest::Generic(_)));
	assert_eq!(manifests[0].type_meta().kind, "AksApp");
	assert_eq!(manifests[1].type_meta().kind, "ConfigMap");
	assert_eq!(manifests[1].metadata().name.as_deref(), Some("extra"));

	let apps: Vec<AksApp> = manifests.into_iter().filter_map(Manifest::typed).collect();
	assert_eq!(apps.len(), 1);
    }

    #[test]
    fn joined_bundle_round_trips() {
	let bundle = join_documents(&[FOO, BAR]);
	assert_eq!(split_documents(&bundle), vec![FOO, BAR]);
	assert_eq!(join_documents(&split_documents(&bundle)), bundle);
    }
}
