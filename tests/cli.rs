//! Integration tests for the `mgate` binary.

#![allow(deprecated)] // Command::cargo_bin

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use predicates::prelude::*;

fn mgate() -> Command {
    Command::cargo_bin("mgate").expect("mgate binary not found")
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Write a deterministic key pair; returns (private, public) paths.
fn write_keys(dir: &Path, seed: u8) -> (PathBuf, PathBuf) {
    let secret = p256::SecretKey::from_slice(&[seed; 32]).expect("secret key");
    let private = dir.join("signer.key");
    let public = dir.join("signer.pub");
    std::fs::write(&private, secret.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
    std::fs::write(&public, secret.public_key().to_public_key_pem(LineEnding::LF).unwrap()).unwrap();
    (private, public)
}

const MANIFEST: &str = "apiVersion: v1
kind: ConfigMap
metadata:
  name: app-settings
data:
  mode: strict
";

#[test]
fn verifies_cosign_signed_request() {
    mgate()
        .args(["verify", "--request"])
        .arg(fixture("signed-configmap-request.json"))
        .arg("--key")
        .arg(fixture("cosign.pub"))
        .assert()
        .success()
        .stdout(predicate::str::contains("VERIFIED: Signed by a valid signer: cosign"));
}

#[test]
fn unsigned_resource_exits_one() {
    mgate()
        .args(["verify", "--resource"])
        .arg(fixture("unsigned-pod.json"))
        .arg("--key")
        .arg(fixture("cosign.pub"))
        .assert()
        .code(1)
        .stdout(predicate::str::contains("no signature found"));
}

#[test]
fn bad_key_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("bad.pub");
    std::fs::write(&key, "not a key").unwrap();
    mgate()
        .args(["verify", "--request"])
        .arg(fixture("signed-configmap-request.json"))
        .arg("--key")
        .arg(&key)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid public key"));
}

#[test]
fn sign_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let (private, public) = write_keys(dir.path(), 17);
    let manifest = dir.path().join("cm.yaml");
    std::fs::write(&manifest, MANIFEST).unwrap();

    let output = mgate()
        .arg("sign")
        .arg("--key")
        .arg(&private)
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let signed = dir.path().join("signed.yaml");
    std::fs::write(&signed, &output.stdout).unwrap();

    mgate()
        .args(["verify", "--json", "--resource"])
        .arg(&signed)
        .arg("--key")
        .arg(&public)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"verified\": true"));

    let tampered = String::from_utf8(output.stdout).unwrap().replace("strict", "relaxed");
    std::fs::write(&signed, tampered).unwrap();
    mgate()
        .args(["verify", "--resource"])
        .arg(&signed)
        .arg("--key")
        .arg(&public)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("data.mode"));
}

#[test]
fn status_lists_defaults() {
    mgate()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("ignore rules"));
}

#[test]
fn sign_accepts_flags_after_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let (private, _) = write_keys(dir.path(), 23);
    let manifest = dir.path().join("cm.yaml");
    std::fs::write(&manifest, MANIFEST).unwrap();

    mgate()
        .arg("sign")
        .arg("--key")
        .arg(&private)
        .arg(&manifest)
        .args(["--domain", "example.io/"])
        .assert()
        .success()
        .stdout(predicate::str::contains("example.io/signature:"))
        .stdout(predicate::str::contains("example.io/message:"));
}

#[test]
fn sign_rejects_two_manifests() {
    let dir = tempfile::tempdir().unwrap();
    let (private, _) = write_keys(dir.path(), 24);
    let manifest = dir.path().join("cm.yaml");
    std::fs::write(&manifest, MANIFEST).unwrap();

    mgate()
        .arg("sign")
        .arg("--key")
        .arg(&private)
        .arg(&manifest)
        .arg(&manifest)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("single manifest"));
}
