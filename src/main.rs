//! mgate: manifest signature verification CLI

use std::env;
use std::fs;
use std::path::Path;
use std::process;

use manifestgate::bundle::{self, DEFAULT_ANNOTATION_DOMAIN};
use manifestgate::diff::{mask_signature_annotations, parse_manifest};
use manifestgate::verifier::Stage;
use manifestgate::{
    crypto, AdmissionRequest, DefaultConfig, DiffResult, ManifestVerifier, SignerKey, VerifyRule,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: i32 = 1;
const EXIT_ERROR: i32 = 2;

fn main() {
    let args: Vec<String> = env::args().collect();
    init_logging();

    if args.len() < 2 {
        print_help();
        return;
    }

    let result = match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(0)
        }
        "verify" => run_verify(&args[2..]),
        "sign" => run_sign(&args[2..]),
        "status" => {
            print_status();
            Ok(0)
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            Ok(EXIT_ERROR)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_ERROR);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = env::var("MGATE_JSON_LOG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

/// Values of every occurrence of `--name <value>`.
fn flag_values(args: &[String], name: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == name)
        .map(|w| w[1].clone())
        .collect()
}

fn flag(args: &[String], name: &str) -> Option<String> {
    flag_values(args, name).pop()
}

/// Arguments that are neither flags nor the values of `value_flags`.
fn positionals<'a>(args: &'a [String], value_flags: &[&str]) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if value_flags.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with("--") {
            found.push(arg.as_str());
        }
    }
    found
}

fn read(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Cannot read {path}: {e}"))
}

#[derive(Serialize)]
struct Report<'a> {
    verified: bool,
    diagnostic: &'a str,
    signer: Option<&'a str>,
    stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<&'a DiffResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn run_verify(args: &[String]) -> Result<i32, String> {
    let env_config = flag(args, "--env-config").or_else(|| env::var("MGATE_ENV_CONFIG").ok());
    let defaults = DefaultConfig::init(env_config.as_deref().map(Path::new)).map_err(|e| e.to_string())?;

    let mut rule = match flag(args, "--rule") {
        Some(path) => VerifyRule::from_yaml(&read(&path)?, &path).map_err(|e| e.to_string())?,
        None => VerifyRule {
            name: "cli".into(),
            ..VerifyRule::default()
        },
    };
    for path in flag_values(args, "--key") {
        let name = Path::new(&path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        rule.keys.push(SignerKey::new(read(&path)?, name));
    }
    rule.signers.extend(flag_values(args, "--signer"));

    let request = match (flag(args, "--request"), flag(args, "--resource")) {
        (Some(path), _) => AdmissionRequest::from_json(read(&path)?.as_bytes())
            .map_err(|e| format!("Invalid admission request {path}: {e}"))?,
        (None, Some(path)) => {
            let object = parse_manifest(read(&path)?.as_bytes(), "live").map_err(|e| e.to_string())?;
            let user = flag(args, "--user").unwrap_or_default();
            AdmissionRequest::for_resource(object, &user)
        }
        (None, None) => {
            return Err("Usage: mgate verify --request <file.json> | --resource <file.yaml> --key <pub.pem>".into())
        }
    };

    let outcome = ManifestVerifier::new(defaults)
        .verify(&request, &rule)
        .map_err(|e| format!("failed to verify manifest: {e}"))?;

    if args.iter().any(|a| a == "--json") {
        let report = Report {
            verified: outcome.verified,
            diagnostic: &outcome.diagnostic,
            signer: outcome.signer.as_deref(),
            stage: outcome.stage,
            diff: outcome.diff.as_ref(),
            error: outcome.error.as_ref().map(ToString::to_string),
        };
        let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{text}");
    } else if outcome.verified {
        println!("VERIFIED: {}", outcome.diagnostic);
    } else {
        println!("NOT VERIFIED");
        for line in outcome.diagnostic.lines() {
            println!("  {line}");
        }
    }

    Ok(if outcome.verified { 0 } else { EXIT_FAILED })
}

fn run_sign(args: &[String]) -> Result<i32, String> {
    let key_path = flag(args, "--key").ok_or("Usage: mgate sign --key <private.pem> <manifest.yaml>")?;
    let manifest_path = match positionals(args, &["--key", "--domain"]).as_slice() {
        [path] => *path,
        [] => return Err("Missing manifest file".into()),
        _ => return Err("Expected a single manifest file".into()),
    };
    let domain = flag(args, "--domain").unwrap_or_else(|| DEFAULT_ANNOTATION_DOMAIN.to_owned());

    let mut manifest = parse_manifest(read(manifest_path)?.as_bytes(), "input").map_err(|e| e.to_string())?;
    mask_signature_annotations(&mut manifest, &domain);
    let canonical = serde_yaml::to_string(&manifest).map_err(|e| e.to_string())?;
    if !canonical.as_bytes().starts_with(bundle::MANIFEST_MARKER) {
        return Err("Manifest must have apiVersion as its first field".into());
    }

    let packed = bundle::pack_message(canonical.as_bytes()).map_err(|e| e.to_string())?;
    let signature = crypto::sign_message(&packed.message, &read(&key_path)?).map_err(|e| e.to_string())?;
    bundle::annotate(&mut manifest, &signature, &packed.annotation, &domain).map_err(|e| e.to_string())?;

    print!("{}", serde_yaml::to_string(&manifest).map_err(|e| e.to_string())?);
    Ok(0)
}

fn print_status() {
    println!("\nmgate (manifest signature verification)");
    println!("========================================");
    println!("Version:    {}", env!("CARGO_PKG_VERSION"));
    println!("Crypto:     ECDSA P-256 / SHA-256 (p256)");
    println!("Domain:     {DEFAULT_ANNOTATION_DOMAIN}");
    match DefaultConfig::load(None) {
        Ok(config) => println!(
            "Defaults:   {} builtin, {} environment ignore rules\n",
            config.builtin.len(),
            config.environment.len()
        ),
        Err(e) => println!("Defaults:   BROKEN ({e})\n"),
    }
}

fn print_help() {
    println!(
        "
mgate: manifest signature verification
======================================
Usage:
  mgate help                                Show this help
  mgate status                              Show engine status
  mgate verify [options]                    Verify a signed resource
      --request <file.json>                 AdmissionRequest or AdmissionReview
      --resource <file.yaml>                Standalone manifest (CREATE by --user)
      --key <pub.pem>                       Public key (repeatable)
      --signer <pattern>                    Allowed signer identity (repeatable)
      --rule <rule.yaml>                    Full rule: keys, ignoreFields, skipUsers, ...
      --env-config <file.yaml>              Replace environment ignore defaults
      --json                                Print a JSON report
  mgate sign --key <private.pem> [--domain <prefix>] <manifest.yaml>
                                            Print the manifest with signature annotations
"
    );
}
