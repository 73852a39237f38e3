use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// True when `meta` carries an owner reference naming an owner of
/// `owner_kind` called `owner_name`.
pub fn is_owned_by(meta: &ObjectMeta, owner_kind: &str, owner_name: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.kind == owner_kind && r.name == owner_name)
}
