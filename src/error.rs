//! Error taxonomy for manifest verification.

/// Errors loading or merging ignore-field configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration document is not valid YAML or has the wrong shape.
    #[error("invalid {asset} configuration: {source}")]
    Parse {
        /// Which asset failed (e.g. `builtin`, `environment`, a file path).
        asset: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A configuration file could not be read.
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The rule carries no usable verification material.
    #[error("rule misconfigured: {0}")]
    Rule(String),
}

/// Failures recovering the signature bundle from a resource's annotations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    /// The resource carries no message annotation; it is unsigned.
    #[error("no signature found")]
    NoSignature,

    /// The bundle is present but cannot be decoded or decompressed.
    #[error("malformed signature bundle: {0}")]
    Malformed(String),

    /// The decompressed archive contains no recognizable manifest.
    #[error("no manifest found in signed message")]
    NoManifest,
}

/// Cryptographic configuration errors. A signature that merely fails to
/// validate is not an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The configured public key cannot be parsed as a P-256 SPKI PEM.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// The private key given for signing is unusable.
    #[error("cannot sign message: {0}")]
    Signing(String),
}

/// Umbrella error for one rule evaluation.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Either manifest failed structural parsing.
    #[error("failed to parse {side} manifest: {reason}")]
    Parse { side: &'static str, reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VerifyError {
    /// True when the error points at policy or deployment configuration
    /// rather than at the resource under review.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::InvalidKey(_)) | Self::Config(_)
        )
    }

    pub(crate) fn parse(side: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            side,
            reason: err.to_string(),
        }
    }
}
