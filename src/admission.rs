//! Admission request intake types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub kind: Option<GroupVersionKind>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub user_info: UserInfo,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub old_object: Option<Value>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[default]
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// The identity of an object as seen by selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    /// Read `apiVersion`, `kind`, `metadata.namespace` and `metadata.name`.
    /// Missing fields become empty strings.
    pub fn from_manifest(manifest: &Value) -> Self {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_owned();
        let metadata = manifest.get("metadata");
        Self {
            api_version: text(manifest.get("apiVersion")),
            kind: text(manifest.get("kind")),
            namespace: text(metadata.and_then(|m| m.get("namespace"))),
            name: text(metadata.and_then(|m| m.get("name"))),
        }
    }
}

impl AdmissionRequest {
    /// Parse either a bare `AdmissionRequest` or an `AdmissionReview`
    /// wrapping one under `request`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_slice(bytes)?;
        if let Some(inner) = value.get_mut("request") {
            let inner = inner.take();
            return serde_json::from_value(inner);
        }
        serde_json::from_value(value)
    }

    /// Synthesize a CREATE request for a standalone manifest.
    pub fn for_resource(object: Value, username: &str) -> Self {
        let target = ObjectRef::from_manifest(&object);
        Self {
            uid: String::new(),
            kind: Some(GroupVersionKind {
                kind: target.kind,
                ..GroupVersionKind::default()
            }),
            name: target.name,
            namespace: target.namespace,
            operation: Operation::Create,
            user_info: UserInfo {
                username: username.to_owned(),
                groups: Vec::new(),
            },
            object: Some(object),
            old_object: None,
            dry_run: false,
        }
    }

    /// Identity of the object under review. Request-level name and namespace
    /// fill in what the object itself omits (e.g. generateName on CREATE).
    pub fn object_ref(&self) -> ObjectRef {
        let mut target = self
            .object
            .as_ref()
            .map(ObjectRef::from_manifest)
            .unwrap_or_default();
        if target.namespace.is_empty() {
            target.namespace = self.namespace.clone();
        }
        if target.name.is_empty() {
            target.name = self.name.clone();
        }
        if target.kind.is_empty() {
            if let Some(gvk) = &self.kind {
                target.kind = gvk.kind.clone();
            }
        }
        target
    }

    /// Annotations of the live object, if any.
    pub fn annotations(&self) -> Option<&serde_json::Map<String, Value>> {
        self.object
            .as_ref()?
            .get("metadata")?
            .get("annotations")?
            .as_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_review_wrapper_and_bare_request() {
        let bare = json!({
            "uid": "1",
            "operation": "DELETE",
            "namespace": "ns",
            "userInfo": {"username": "alice", "groups": ["dev"]},
            "object": null
        });
        let req = AdmissionRequest::from_json(bare.to_string().as_bytes()).unwrap();
        assert_eq!(req.operation, Operation::Delete);
        assert_eq!(req.user_info.username, "alice");
        assert!(req.object.is_none());

        let review = json!({"apiVersion": "admission.k8s.io/v1", "request": bare});
        let req = AdmissionRequest::from_json(review.to_string().as_bytes()).unwrap();
        assert_eq!(req.uid, "1");
    }

    #[test]
    fn object_ref_falls_back_to_request_fields() {
        let req = AdmissionRequest {
            namespace: "team-a".into(),
            name: "cm".into(),
            ..AdmissionRequest::for_resource(json!({"apiVersion": "v1", "kind": "ConfigMap"}), "bob")
        };
        let target = req.object_ref();
        assert_eq!(target.kind, "ConfigMap");
        assert_eq!(target.namespace, "team-a");
        assert_eq!(target.name, "cm");
    }

    #[test]
    fn annotations_are_read_from_object_metadata() {
        let req = AdmissionRequest::for_resource(
            json!({"metadata": {"annotations": {"a": "b"}}}),
            "",
        );
        assert_eq!(req.annotations().unwrap()["a"], "b");
        assert!(AdmissionRequest::for_resource(json!({}), "").annotations().is_none());
    }
}
