// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {authenticode_signature::AuthenticodeError, thiserror::Error};

/// Why a trust store operation failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstallErrorKind {
    /// The caller lacks the privileges to modify the store.
    PermissionDenied,
    /// The certificate could not be read or parsed.
    CorruptInput,
    /// The certificate is expired and policy forbids installing it.
    Expired,
    /// The store could not be reached or did not retain the entry.
    StoreUnavailable,
}

impl std::fmt::Display for InstallErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PermissionDenied => "permission denied",
            Self::CorruptInput => "corrupt input",
            Self::Expired => "certificate expired",
            Self::StoreUnavailable => "store unavailable",
        })
    }
}

/// Unified error type for this crate.
#[derive(Debug, Error)]
pub enum PublisherTrustError {
    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("unable to unlock private archive: {0}")]
    Authentication(String),

    #[error("unsupported input: {0}")]
    Format(String),

    #[error("time-stamp authority {url} unavailable after {attempts} attempt(s): {reason}")]
    TimestampUnavailable {
        url: String,
        attempts: usize,
        reason: String,
    },

    #[error("trust store {kind}: {reason}")]
    Install {
        kind: InstallErrorKind,
        reason: String,
    },

    #[error("signature verification failed: {0}")]
    VerificationMismatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("bad argument: {0}")]
    BadArgument(String),
}

impl PublisherTrustError {
    pub(crate) fn install(kind: InstallErrorKind, reason: impl ToString) -> Self {
        Self::Install {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Short, stable name of the failure category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Generation(_) => "GenerationError",
            Self::Export(_) => "ExportError",
            Self::Authentication(_) => "AuthenticationError",
            Self::Format(_) => "FormatError",
            Self::TimestampUnavailable { .. } => "TimestampUnavailable",
            Self::Install { .. } => "InstallError",
            Self::VerificationMismatch(_) => "VerificationMismatch",
            Self::Io(_) => "IoError",
            Self::Certificate(_) => "CertificateError",
            Self::BadArgument(_) => "BadArgument",
        }
    }

    /// A hint for the operator on how to recover.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Generation(_) => {
                Some("check that the subject and publisher are non-empty and the validity is positive")
            }
            Self::Export(_) => Some("check that the output directory exists and is writable"),
            Self::Authentication(_) => Some("check the archive password"),
            Self::Format(_) => Some("only Windows PE executables (.exe, .dll) can be signed"),
            Self::TimestampUnavailable { .. } => Some(
                "check network connectivity or pass a different time-stamp authority with --timestamp-url",
            ),
            Self::Install { kind, .. } => Some(match kind {
                InstallErrorKind::PermissionDenied => {
                    "run with elevated privileges or install with --scope user"
                }
                InstallErrorKind::CorruptInput => {
                    "check that the file is a PEM or DER encoded X.509 certificate"
                }
                InstallErrorKind::Expired => {
                    "check certificate expiry; generate a new identity or pass --force"
                }
                InstallErrorKind::StoreUnavailable => "retry; another process may hold the store",
            }),
            Self::VerificationMismatch(_) => {
                Some("the file was modified after signing or is not trusted on this machine")
            }
            Self::Io(_) => None,
            Self::Certificate(_) => {
                Some("check that the file is a PEM or DER encoded X.509 certificate")
            }
            Self::BadArgument(_) => Some("run with --help for usage"),
        }
    }

    /// Whether repeating the operation unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimestampUnavailable { .. }
                | Self::Install {
                    kind: InstallErrorKind::StoreUnavailable,
                    ..
                }
        )
    }
}

impl From<AuthenticodeError> for PublisherTrustError {
    fn from(e: AuthenticodeError) -> Self {
        match e {
            AuthenticodeError::Io(e) => Self::Io(e),
            AuthenticodeError::TimeStamp(e) => Self::TimestampUnavailable {
                url: String::new(),
                attempts: 1,
                reason: e.to_string(),
            },
            e => Self::Format(e.to_string()),
        }
    }
}
