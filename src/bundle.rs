//! Signature bundle extraction.
//!
//! A signed resource carries two annotations under a domain prefix:
//! `<domain>signature` holds a base64 ECDSA signature and `<domain>message`
//! holds `base64(gzip(blob))`. The signature covers `blob`, which is a
//! gzip-compressed tar archive containing the signed manifest.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ExtractionError;

pub const DEFAULT_ANNOTATION_DOMAIN: &str = "cosign.sigstore.dev/";

pub const MESSAGE_KEY: &str = "message";
pub const SIGNATURE_KEY: &str = "signature";
pub const CERTIFICATE_KEY: &str = "certificate";
pub const BUNDLE_KEY: &str = "bundle";

/// Annotation suffixes that hold signature material.
pub const SIGNATURE_MATERIAL_KEYS: [&str; 4] = [MESSAGE_KEY, SIGNATURE_KEY, CERTIFICATE_KEY, BUNDLE_KEY];

/// Start of a manifest's type-identifier field.
pub const MANIFEST_MARKER: &[u8] = b"apiVersion";

/// Upper bound on each decompression pass.
pub const MAX_DECOMPRESSED_BYTES: u64 = 4 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const PACKED_FILE_NAME: &str = "manifest.yaml";

/// Raw signature material read off a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBundle {
    pub signature: Vec<u8>,
    pub compressed_message: Vec<u8>,
}

/// The signed message and the manifest recovered from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredManifest {
    /// Bytes covered by the signature.
    pub message: Vec<u8>,
    pub manifest: Vec<u8>,
}

/// Read and decode the signature bundle from a resource's annotations.
pub fn extract(
    annotations: Option<&Map<String, Value>>,
    domain: &str,
) -> Result<SignatureBundle, ExtractionError> {
    let message = annotation(annotations, domain, MESSAGE_KEY)?;
    let signature = annotation(annotations, domain, SIGNATURE_KEY)?;

    let compressed_message = BASE64
        .decode(message.trim())
        .map_err(|e| ExtractionError::Malformed(format!("message is not base64: {e}")))?;
    let signature = BASE64
        .decode(signature.trim())
        .map_err(|e| ExtractionError::Malformed(format!("signature is not base64: {e}")))?;

    debug!(
        message_bytes = compressed_message.len(),
        signature_bytes = signature.len(),
        "extracted signature bundle"
    );
    Ok(SignatureBundle {
        signature,
        compressed_message,
    })
}

fn annotation<'a>(
    annotations: Option<&'a Map<String, Value>>,
    domain: &str,
    suffix: &str,
) -> Result<&'a str, ExtractionError> {
    let key = format!("{domain}{suffix}");
    match annotations.and_then(|a| a.get(&key)) {
        None | Some(Value::Null) => Err(ExtractionError::NoSignature),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ExtractionError::NoSignature),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ExtractionError::Malformed(format!(
            "annotation {key} is not a string"
        ))),
    }
}

impl SignatureBundle {
    /// Decompress the message and pull the signed manifest out of its archive.
    pub fn recover(&self) -> Result<RecoveredManifest, ExtractionError> {
        let message = gunzip(&self.compressed_message, "message")?;
        let manifest = if message.starts_with(&GZIP_MAGIC) {
            locate_manifest(&gunzip(&message, "archive")?)?
        } else {
            locate_manifest(&message)?
        };
        debug!(
            signed_bytes = message.len(),
            manifest_bytes = manifest.len(),
            "recovered signed manifest"
        );
        Ok(RecoveredManifest { message, manifest })
    }
}

fn gunzip(bytes: &[u8], what: &str) -> Result<Vec<u8>, ExtractionError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::Malformed(format!("cannot decompress {what}: {e}")))?;
    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(ExtractionError::Malformed(format!(
            "decompressed {what} exceeds {MAX_DECOMPRESSED_BYTES} bytes"
        )));
    }
    Ok(out)
}

/// Take the bytes from the first manifest marker up to the first NUL.
///
/// Archive padding is NUL-filled, so this drops the tar header in front and
/// the block padding behind the manifest.
// TODO: read tar entries structurally instead of scanning for the marker.
pub fn locate_manifest(archive: &[u8]) -> Result<Vec<u8>, ExtractionError> {
    let start = archive
        .windows(MANIFEST_MARKER.len())
        .position(|w| w == MANIFEST_MARKER)
        .ok_or(ExtractionError::NoManifest)?;
    let rest = &archive[start..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Ok(rest[..end].to_vec())
}

/// A message ready to be signed and attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedMessage {
    /// Bytes to sign.
    pub message: Vec<u8>,
    /// Value for the `message` annotation.
    pub annotation: String,
}

/// Build the message for `manifest`: a single-entry tar archive, gzipped
/// into the signed blob, then gzipped and base64-encoded for the annotation.
pub fn pack_message(manifest: &[u8]) -> std::io::Result<PackedMessage> {
    let message = gzip(&tar_archive(PACKED_FILE_NAME, manifest)?)?;
    let annotation = BASE64.encode(gzip(&message)?);
    Ok(PackedMessage {
        message,
        annotation,
    })
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn tar_archive(name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_ustar();
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, content)?;
    builder.into_inner()
}

/// Write the signature and message annotations onto a manifest.
pub fn annotate(
    manifest: &mut Value,
    signature: &[u8],
    message_annotation: &str,
    domain: &str,
) -> Result<(), ExtractionError> {
    let root = manifest
        .as_object_mut()
        .ok_or_else(|| ExtractionError::Malformed("manifest is not an object".into()))?;
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| ExtractionError::Malformed("metadata is not an object".into()))?;
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if annotations.is_null() {
        *annotations = Value::Object(Map::new());
    }
    let annotations = annotations
        .as_object_mut()
        .ok_or_else(|| ExtractionError::Malformed("annotations is not an object".into()))?;
    annotations.insert(
        format!("{domain}{SIGNATURE_KEY}"),
        Value::String(BASE64.encode(signature)),
    );
    annotations.insert(
        format!("{domain}{MESSAGE_KEY}"),
        Value::String(message_annotation.to_owned()),
    );
    Ok(())
}
