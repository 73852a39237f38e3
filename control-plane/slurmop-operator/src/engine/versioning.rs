//! Dependency versions stamped onto managed resources.
//!
//! A resource records the resource version of every object it depends on in
//! a single annotation. The same annotation is copied onto the pod template of
//! workload kinds, so a dependency change rolls the pods.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::engine::ManagedResource;
use crate::{Error, Result};

pub const VERSIONS_ANNOTATION: &str = "slurm.soperator.io/versions";

/// `"{namespace}.{name}"` to resource version, ordered by key.
pub type VersionMap = BTreeMap<String, String>;

/// An upstream object whose content a managed resource depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    pub namespace: String,
    pub name: String,
    pub revision: String,
}

impl Dependency {
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            revision: obj.resource_version().unwrap_or_default(),
        }
    }

    fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

pub fn compute_version_map(deps: &[Dependency]) -> VersionMap {
    deps.iter()
        .map(|d| (d.key(), d.revision.clone()))
        .collect()
}

/// Parses an annotation value. Absent or blank input is an empty map.
pub fn parse_version_map(
    raw: Option<&str>,
) -> std::result::Result<VersionMap, serde_yaml::Error> {
    match raw.map(str::trim) {
        None | Some("") => Ok(VersionMap::new()),
        Some(s) => serde_yaml::from_str(s),
    }
}

/// One `"key": "value"` line per entry, in key order.
pub fn render_version_map(map: &VersionMap) -> Result<String> {
    let lines = map
        .iter()
        .map(|(k, v)| -> Result<String> {
            Ok(format!(
                "{}: {}",
                serde_json::to_string(k)?,
                serde_json::to_string(v)?
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(lines.join("\n"))
}

pub fn read_version_map(meta: &ObjectMeta, resource: &str) -> Result<VersionMap> {
    let raw = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(VERSIONS_ANNOTATION))
        .map(String::as_str);
    parse_version_map(raw).map_err(|source| Error::VersionsAnnotation {
        resource: resource.to_string(),
        source,
    })
}

fn stamp_meta(
    meta: &mut ObjectMeta,
    fresh: &VersionMap,
    resource: &str,
) -> Result<()> {
    let mut merged = read_version_map(meta, resource)?;
    merged.extend(fresh.iter().map(|(k, v)| (k.clone(), v.clone())));
    if merged.is_empty() {
        return Ok(());
    }
    let rendered = render_version_map(&merged)?;
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(VERSIONS_ANNOTATION.to_string(), rendered);
    Ok(())
}

/// Merges the current versions of `deps` into the annotation of `obj` and,
/// for template-bearing kinds, of its pod template.
pub fn stamp_versions<K: ManagedResource>(
    obj: &mut K,
    deps: &[Dependency],
) -> Result<()> {
    let fresh = compute_version_map(deps);
    let resource = super::describe(obj);
    stamp_meta(obj.meta_mut(), &fresh, &resource)?;
    if let Some(template) = obj.template_meta_mut() {
        stamp_meta(template, &fresh, &resource)?;
    }
    Ok(())
}
