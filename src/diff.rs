//! Semantic diff between a live manifest and the manifest that was signed.
//!
//! Both sides are parsed into `serde_json::Value` trees, stripped of the
//! signature annotations and of array elements named by element-selecting
//! ignore patterns, then compared path by path. The resulting entries are
//! filtered through the ignore-field rules that select the object.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::admission::ObjectRef;
use crate::bundle::SIGNATURE_MATERIAL_KEYS;
use crate::config::EffectiveVerifyOptions;
use crate::error::VerifyError;
use crate::pattern::{FieldPath, FieldPattern};

/// Longest rendering of a value inside a diagnostic line.
const MAX_VALUE_DISPLAY: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only in the live manifest.
    Added,
    /// Present only in the signed manifest.
    Removed,
    /// Present in both with a different value or shape.
    Changed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEntry {
    pub path: FieldPath,
    pub change: ChangeKind,
    /// Value in the signed manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// Value in the live manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

/// Path-ordered differences between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub entries: Vec<DiffEntry>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.entries.iter().map(|e| &e.path)
    }

    /// Drop every entry covered by one of `patterns`.
    pub fn without(&self, patterns: &[&FieldPattern]) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|e| !patterns.iter().any(|p| p.matches(&e.path)))
            .cloned()
            .collect();
        Self { entries }
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map(render_value).unwrap_or_default();
        match self.change {
            ChangeKind::Added => write!(f, "{}: added {}", self.path, show(&self.new)),
            ChangeKind::Removed => write!(f, "{}: removed {}", self.path, show(&self.old)),
            ChangeKind::Changed => write!(
                f,
                "{}: changed {} -> {}",
                self.path,
                show(&self.old),
                show(&self.new)
            ),
        }
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

fn render_value(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= MAX_VALUE_DISPLAY {
        return text;
    }
    let cut: String = text.chars().take(MAX_VALUE_DISPLAY).collect();
    format!("{cut}...")
}

/// Parse a YAML or JSON manifest.
pub fn parse_manifest(bytes: &[u8], side: &'static str) -> Result<Value, VerifyError> {
    serde_yaml::from_slice(bytes).map_err(|e| VerifyError::parse(side, e))
}

/// Diff raw manifests. `None` means equivalent under masks and ignore rules.
pub fn diff(
    live: &[u8],
    recovered: &[u8],
    options: &EffectiveVerifyOptions,
    domain: &str,
) -> Result<Option<DiffResult>, VerifyError> {
    let live = parse_manifest(live, "live")?;
    let recovered = parse_manifest(recovered, "signed")?;
    let target = ObjectRef::from_manifest(&live);
    Ok(diff_values(&live, &recovered, &target, options, domain))
}

/// Diff already-parsed manifests. Ignore rules are selected by `target`,
/// which may carry identity the live manifest itself omits.
pub fn diff_values(
    live: &Value,
    recovered: &Value,
    target: &ObjectRef,
    options: &EffectiveVerifyOptions,
    domain: &str,
) -> Option<DiffResult> {
    let mut live = live.clone();
    let mut signed = recovered.clone();
    mask_signature_annotations(&mut live, domain);
    mask_signature_annotations(&mut signed, domain);
    inherit_namespace(&mut signed, &live);

    let patterns = options.patterns_for(target);
    for pattern in patterns.iter().filter(|p| p.selects_elements()) {
        pattern.prune(&mut live);
        pattern.prune(&mut signed);
    }

    let raw = structural_diff(&signed, &live);
    let filtered = raw.without(&patterns);
    debug!(
        kind = %target.kind,
        name = %target.name,
        raw_entries = raw.len(),
        remaining = filtered.len(),
        ignore_patterns = patterns.len(),
        "computed manifest diff"
    );

    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

/// Remove the annotations that carry signature material, and the
/// annotations map itself if nothing else is left in it.
pub fn mask_signature_annotations(manifest: &mut Value, domain: &str) {
    let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let emptied = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
        Some(annotations) => {
            for key in SIGNATURE_MATERIAL_KEYS {
                annotations.remove(&format!("{domain}{key}"));
            }
            annotations.is_empty()
        }
        None => false,
    };
    if emptied {
        metadata.remove("annotations");
    }
}

/// Manifests are usually signed without a namespace and applied into one.
fn inherit_namespace(signed: &mut Value, live: &Value) {
    let Some(namespace) = live
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
    else {
        return;
    };
    let Some(metadata) = signed.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let has_namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .is_some_and(|ns| !ns.is_empty());
    if !has_namespace {
        metadata.insert("namespace".into(), Value::String(namespace.to_owned()));
    }
}

/// Every path where `old` and `new` disagree.
pub fn structural_diff(old: &Value, new: &Value) -> DiffResult {
    let mut entries = Vec::new();
    walk(&FieldPath::root(), old, new, &mut entries);
    DiffResult { entries }
}

fn walk(path: &FieldPath, old: &Value, new: &Value, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => walk_objects(path, a, b, out),
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let child = path.index(i);
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => walk(&child, x, y, out),
                    (x, y) => out.push(one_sided(child, x, y)),
                }
            }
        }
        _ if old == new => {}
        _ => out.push(DiffEntry {
            path: path.clone(),
            change: ChangeKind::Changed,
            old: Some(old.clone()),
            new: Some(new.clone()),
        }),
    }
}

fn walk_objects(path: &FieldPath, a: &Map<String, Value>, b: &Map<String, Value>, out: &mut Vec<DiffEntry>) {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for key in keys {
        let child = path.key(key);
        match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) => walk(&child, x, y, out),
            (x, y) => out.push(one_sided(child, x, y)),
        }
    }
}

fn one_sided(path: FieldPath, old: Option<&Value>, new: Option<&Value>) -> DiffEntry {
    let change = if old.is_some() {
        ChangeKind::Removed
    } else {
        ChangeKind::Added
    };
    DiffEntry {
        path,
        change,
        old: old.cloned(),
        new: new.cloned(),
    }
}
