// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Serialization of identities to disk.

Two kinds of artifacts are produced. The private archive is a password
protected PKCS #12 (`.pfx`) holding the key and certificate; this is what
`signtool` and the in-process signer consume. Public certificates (`.cer` /
`.pem`) carry no secrets and are what gets distributed to machines that need
to trust the publisher.
*/

use {
    crate::{Identity, PublicCertificate, PublisherTrustError},
    log::info,
    std::{io::Write, path::Path, str::FromStr},
    zeroize::Zeroizing,
};

/// Encoding of a public certificate file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublicCertificateFormat {
    Pem,
    Der,
}

impl PublicCertificateFormat {
    /// Choose a format from a file extension, defaulting to DER.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pem") || ext.eq_ignore_ascii_case("crt") => {
                Self::Pem
            }
            _ => Self::Der,
        }
    }
}

impl FromStr for PublicCertificateFormat {
    type Err = PublisherTrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pem" => Ok(Self::Pem),
            "der" | "cer" => Ok(Self::Der),
            _ => Err(PublisherTrustError::BadArgument(format!(
                "unknown certificate format: {}",
                s
            ))),
        }
    }
}

fn export_error(path: &Path, e: impl std::fmt::Display) -> PublisherTrustError {
    PublisherTrustError::Export(format!("writing {}: {}", path.display(), e))
}

#[cfg(unix)]
fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut fh = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // Pre-existing files keep their mode unless told otherwise.
    fh.set_permissions(std::fs::Permissions::from_mode(mode))?;
    fh.write_all(data)?;
    fh.sync_all()
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, data: &[u8], _mode: u32) -> std::io::Result<()> {
    let mut fh = std::fs::File::create(path)?;
    fh.write_all(data)?;
    fh.sync_all()
}

/// Encode an identity as PKCS #12.
pub fn identity_to_pfx(identity: &Identity, password: &str) -> Result<Vec<u8>, PublisherTrustError> {
    if password.is_empty() {
        return Err(PublisherTrustError::Export(
            "private archive password must not be empty".into(),
        ));
    }

    let certificate = identity.certificate();
    let name = certificate
        .common_name()
        .unwrap_or_else(|| certificate.subject());

    let pfx = p12::PFX::new(
        certificate.der(),
        identity.private_key_pkcs8(),
        None,
        password,
        name,
    )
    .ok_or_else(|| PublisherTrustError::Export("unable to convert to pfx".into()))?;

    Ok(pfx.to_der())
}

/// Write the password protected private archive.
///
/// On Unix the file is readable and writable by its owner only.
pub fn export_private_archive(
    identity: &Identity,
    password: &str,
    path: impl AsRef<Path>,
) -> Result<(), PublisherTrustError> {
    let path = path.as_ref();
    let data = identity_to_pfx(identity, password)?;

    write_with_mode(path, &data, 0o600).map_err(|e| export_error(path, e))?;
    info!("wrote private archive to {}", path.display());

    Ok(())
}

/// Write a certificate without any private key material.
///
/// On Unix the file is world readable.
pub fn export_public_certificate(
    certificate: &PublicCertificate,
    path: impl AsRef<Path>,
    format: PublicCertificateFormat,
) -> Result<(), PublisherTrustError> {
    let path = path.as_ref();

    let data = match format {
        PublicCertificateFormat::Pem => certificate.to_pem().into_bytes(),
        PublicCertificateFormat::Der => certificate.der().to_vec(),
    };

    write_with_mode(path, &data, 0o644).map_err(|e| export_error(path, e))?;
    info!(
        "wrote public certificate {} to {}",
        certificate.thumbprint(),
        path.display()
    );

    Ok(())
}

/// Decode a PKCS #12 archive into an identity.
///
/// The first certificate and the first key are used; archives written by
/// [identity_to_pfx] hold one of each. A wrong password is reported as
/// [PublisherTrustError::Authentication].
pub fn identity_from_pfx(data: &[u8], password: &str) -> Result<Identity, PublisherTrustError> {
    let pfx = p12::PFX::parse(data)
        .map_err(|e| PublisherTrustError::Format(format!("not a PKCS #12 archive: {:?}", e)))?;

    if !pfx.verify_mac(password) {
        return Err(PublisherTrustError::Authentication(
            "archive integrity check failed; is the password correct?".into(),
        ));
    }

    let certificate = pfx
        .cert_x509_bags(password)
        .map_err(|e| PublisherTrustError::Format(format!("unreadable certificate bag: {:?}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| PublisherTrustError::Format("archive holds no certificate".into()))?;
    let private_key = pfx
        .key_bags(password)
        .map_err(|e| PublisherTrustError::Format(format!("unreadable key bag: {:?}", e)))?
        .into_iter()
        .next()
        .map(Zeroizing::new)
        .ok_or_else(|| PublisherTrustError::Format("archive holds no private key".into()))?;

    Identity::from_parts(PublicCertificate::from_der(certificate)?, private_key)
}

/// Read and unlock a private archive.
pub fn read_private_archive(
    path: impl AsRef<Path>,
    password: &str,
) -> Result<Identity, PublisherTrustError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| {
        PublisherTrustError::Authentication(format!("reading {}: {}", path.display(), e))
    })?;

    identity_from_pfx(&data, password)
}
