// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of executables.

[ExecutableSigner] is the interface shared by the signing back-ends.
[AuthenticodeSigner] signs PE images in process; [crate::SigntoolSigner]
delegates to the Windows SDK.

Targets are never modified in place. The signed image is written to a
temporary file next to the target, verified, and only then moved over the
original. Any failure before that point leaves the original untouched.
*/

use {
    crate::{
        read_private_archive, Identity, MemoryTrustStore, PublicCertificate, PublisherTrustError,
        SignatureVerifier, SigningSettings, VerificationStatus,
    },
    authenticode_signature::{
        is_msi_header, is_signable_binary_header, HttpTimeStampClient, PeImage, SignedDataBuilder,
        TimeStampClient, TimeStampRequest,
    },
    chrono::{DateTime, Utc},
    log::{info, warn},
    std::{path::Path, rc::Rc},
};

/// Outcome of a signing operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureStatus {
    Valid,
    Invalid,
    NotSigned,
}

impl std::fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Valid => "Valid",
            Self::Invalid => "Invalid",
            Self::NotSigned => "NotSigned",
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureResult {
    pub status: SignatureStatus,
    pub signer_subject: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    /// Set when `status` is not [SignatureStatus::Valid].
    pub reason: Option<String>,
}

/// Something able to sign an executable with a private archive.
pub trait ExecutableSigner {
    fn name(&self) -> &'static str;

    /// Sign `executable` in place.
    ///
    /// An `Ok` result with [SignatureStatus::Invalid] means a signature was
    /// produced but did not pass verification. The target is left
    /// unmodified in that case.
    fn sign(
        &self,
        executable: &Path,
        private_archive: &Path,
        password: &str,
        settings: &SigningSettings,
    ) -> Result<SignatureResult, PublisherTrustError>;
}

/// Ensure `executable` exists, is non-empty and is a PE image.
pub(crate) fn check_signable(executable: &Path) -> Result<(), PublisherTrustError> {
    let metadata = std::fs::metadata(executable).map_err(|e| {
        PublisherTrustError::Format(format!("{}: {}", executable.display(), e))
    })?;

    if !metadata.is_file() || metadata.len() == 0 {
        return Err(PublisherTrustError::Format(format!(
            "{} is not a non-empty file",
            executable.display()
        )));
    }

    let mut header = [0u8; 16];
    let header_len = {
        use std::io::Read;
        let mut fh = std::fs::File::open(executable)?;
        fh.read(&mut header)?
    };
    let header = &header[0..header_len];

    if is_msi_header(header) {
        Err(PublisherTrustError::Format(format!(
            "{} is an MSI package; only PE executables can be signed",
            executable.display()
        )))
    } else if !is_signable_binary_header(header) {
        Err(PublisherTrustError::Format(format!(
            "{} is not a PE executable",
            executable.display()
        )))
    } else {
        Ok(())
    }
}

/// Produce a signed copy of a PE image.
///
/// Any existing signature is replaced. `time_stamp` receives the RSA
/// signature value and returns the DER of a time-stamp token to attach.
pub(crate) fn sign_image(
    data: &[u8],
    identity: &Identity,
    description: Option<&str>,
    time_stamp: impl FnOnce(&[u8]) -> Result<Option<Vec<u8>>, PublisherTrustError>,
) -> Result<Vec<u8>, PublisherTrustError> {
    let image = PeImage::parse(data)?;
    if image.certificate_table().is_some() {
        info!("replacing existing signature");
    }

    let prepared = image.unsigned_image()?;
    let prepared = PeImage::parse(&prepared)?;
    let digest = prepared.authenticode_digest();
    log::debug!("Authenticode digest: {}", hex::encode(&digest));

    let mut builder = SignedDataBuilder::new(&digest, identity.certificate().der())?;
    if let Some(description) = description {
        builder = builder.description(description);
    }

    let signature = identity
        .signing_key()?
        .sign(&builder.signed_attributes())?;
    let token = time_stamp(&signature)?;

    let pkcs7 = builder.build(&signature, token.as_deref());

    Ok(prepared.embed_signature(&pkcs7)?)
}

/// Verify `signed` and move it over `executable` if it is valid.
pub(crate) fn replace_if_verified(
    executable: &Path,
    signed: tempfile::NamedTempFile,
    certificate: &PublicCertificate,
) -> Result<SignatureResult, PublisherTrustError> {
    let permissions = std::fs::metadata(executable)?.permissions();
    std::fs::set_permissions(signed.path(), permissions)?;

    // The signer is not necessarily trusted on this machine. Pin it so the
    // check is about the bytes, not the environment.
    let store = MemoryTrustStore::new();
    let mut verifier = SignatureVerifier::new(&store);
    verifier.trust_certificate(certificate.clone());
    let verification = verifier.verify(signed.path())?;

    if verification.status != VerificationStatus::Valid {
        let reason = format!(
            "post-sign self-check reported {}: {}",
            verification.status,
            verification.detail.as_deref().unwrap_or("no detail")
        );
        warn!("{}; {} left unmodified", reason, executable.display());

        return Ok(SignatureResult {
            status: SignatureStatus::Invalid,
            signer_subject: verification.signer_subject,
            signed_at: verification.signed_at,
            reason: Some(reason),
        });
    }

    signed
        .persist(executable)
        .map_err(|e| PublisherTrustError::Io(e.error))?;
    info!("signed {}", executable.display());

    Ok(SignatureResult {
        status: SignatureStatus::Valid,
        signer_subject: verification.signer_subject,
        signed_at: verification.signed_at,
        reason: None,
    })
}

/// Create a temporary file in the directory of `executable`.
///
/// Same directory means same filesystem, so the final rename is atomic. The
/// extension is kept since `signtool` looks at it.
pub(crate) fn sibling_temp_file(
    executable: &Path,
) -> Result<tempfile::NamedTempFile, PublisherTrustError> {
    let dir = match executable.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let suffix = executable
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| ".tmp".to_string());

    Ok(tempfile::Builder::new()
        .prefix(".publisher-trust-")
        .suffix(&suffix)
        .tempfile_in(dir)?)
}

/// Signs PE images in process.
#[derive(Default)]
pub struct AuthenticodeSigner {
    time_stamp_client: Option<Rc<dyn TimeStampClient>>,
}

impl AuthenticodeSigner {
    /// A signer contacting time-stamp authorities over HTTP.
    pub fn new() -> Self {
        Self::default()
    }

    /// A signer obtaining time-stamps from `client`.
    pub fn with_time_stamp_client(client: Rc<dyn TimeStampClient>) -> Self {
        Self {
            time_stamp_client: Some(client),
        }
    }

    fn time_stamp(
        &self,
        settings: &SigningSettings,
        signature: &[u8],
    ) -> Result<Vec<u8>, PublisherTrustError> {
        let url = settings.timestamp_url();
        let attempts = settings.timestamp_attempts();
        let unavailable = |reason: String| PublisherTrustError::TimestampUnavailable {
            url: url.to_string(),
            attempts,
            reason,
        };

        let http;
        let client: &dyn TimeStampClient = match &self.time_stamp_client {
            Some(client) => client.as_ref(),
            None => {
                http = HttpTimeStampClient::new(settings.timestamp_timeout());
                &http
            }
        };

        let request = TimeStampRequest::for_message(signature)
            .map_err(|e| unavailable(e.to_string()))?;

        let mut last_error = None;
        for attempt in 1..=attempts {
            info!(
                "requesting time-stamp token from {} (attempt {} of {})",
                url, attempt, attempts
            );

            match client.time_stamp(url, &request) {
                Ok(token) => {
                    info!("time-stamped at {}", token.gen_time().to_rfc3339());
                    return Ok(token.der().to_vec());
                }
                Err(e) => {
                    if attempt < attempts {
                        warn!("time-stamp request failed: {}; retrying", e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(unavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        ))
    }
}

impl ExecutableSigner for AuthenticodeSigner {
    fn name(&self) -> &'static str {
        "authenticode"
    }

    fn sign(
        &self,
        executable: &Path,
        private_archive: &Path,
        password: &str,
        settings: &SigningSettings,
    ) -> Result<SignatureResult, PublisherTrustError> {
        check_signable(executable)?;

        let data = std::fs::read(executable)?;
        // Reject malformed images before the password is used.
        PeImage::parse(&data)?;

        let identity = read_private_archive(private_archive, password)?;
        info!(
            "signing {} as {}",
            executable.display(),
            identity.certificate().subject()
        );

        let signed = sign_image(&data, &identity, settings.description(), |signature| {
            self.time_stamp(settings, signature).map(Some)
        })?;

        let mut temp = sibling_temp_file(executable)?;
        {
            use std::io::Write;
            temp.write_all(&signed)?;
            temp.as_file().sync_all()?;
        }

        replace_if_verified(executable, temp, identity.certificate())
    }
}
