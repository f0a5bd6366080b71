// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Verification of Authenticode signed executables.

Checks run in a fixed order and the first failing one determines the
[VerificationStatus]:

1. A signature must be present ([VerificationStatus::NotSigned]).
2. The signature must parse, its image digest must match the file, its
   `messageDigest` attribute must match the signed content and the RSA
   signature must verify against the embedded signer certificate
   ([VerificationStatus::HashMismatch]). A file that still ends in a
   signature but whose headers no longer parse or no longer reference it
   fails here too.
3. The signer's chain must end at a certificate present in the trust store
   or pinned with [SignatureVerifier::trust_certificate]
   ([VerificationStatus::UntrustedRoot]).
4. Every certificate of the chain must be within its validity window at the
   time of signing when a valid time-stamp is attached, or at the time of
   verification otherwise ([VerificationStatus::Expired]).

The target file is only read.
*/

use {
    crate::{PublicCertificate, PublisherTrustError, Thumbprint, TrustStore},
    authenticode_signature::{
        find_trailing_certificate, AuthenticodeError, AuthenticodeSignature, PeImage,
    },
    chrono::{DateTime, Utc},
    log::debug,
    std::path::Path,
};

/// Upper bound on chain length. Guards against issuer loops.
const MAX_CHAIN_LENGTH: usize = 8;

/// Outcome of verifying a signed executable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerificationStatus {
    Valid,
    HashMismatch,
    UntrustedRoot,
    Expired,
    NotSigned,
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Valid => "Valid",
            Self::HashMismatch => "HashMismatch",
            Self::UntrustedRoot => "UntrustedRoot",
            Self::Expired => "Expired",
            Self::NotSigned => "NotSigned",
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub signer_subject: Option<String>,
    pub signer_issuer: Option<String>,
    pub signer_thumbprint: Option<Thumbprint>,
    /// Whether a time-stamp token is attached, is signed by the authority
    /// certificate it embeds, covers the signature and falls within the
    /// signer's validity window.
    pub timestamp_valid: bool,
    /// Generation time of the time-stamp token.
    pub signed_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    /// Why the status is not [VerificationStatus::Valid].
    pub detail: Option<String>,
}

impl VerificationResult {
    fn new(status: VerificationStatus) -> Self {
        Self {
            status,
            signer_subject: None,
            signer_issuer: None,
            signer_thumbprint: None,
            timestamp_valid: false,
            signed_at: None,
            description: None,
            detail: None,
        }
    }

    fn fail(mut self, status: VerificationStatus, detail: impl ToString) -> Self {
        self.status = status;
        self.detail = Some(detail.to_string());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.status == VerificationStatus::Valid
    }

    /// Caveat to print alongside the status, if any.
    pub fn note(&self) -> Option<&'static str> {
        match self.status {
            VerificationStatus::UntrustedRoot => Some(
                "the signer is not trusted on this machine; this depends on the local trust \
                 store and is not a property of the file",
            ),
            _ => None,
        }
    }
}

/// Verifies signed executables against a trust store.
pub struct SignatureVerifier<'a> {
    store: &'a dyn TrustStore,
    anchors: Vec<PublicCertificate>,
    time: Option<DateTime<Utc>>,
}

impl<'a> SignatureVerifier<'a> {
    pub fn new(store: &'a dyn TrustStore) -> Self {
        Self {
            store,
            anchors: vec![],
            time: None,
        }
    }

    /// Trust a certificate in addition to the store's contents.
    pub fn trust_certificate(&mut self, certificate: PublicCertificate) -> &mut Self {
        self.anchors.push(certificate);
        self
    }

    /// Evaluate validity windows at a fixed time instead of now.
    pub fn at_time(&mut self, time: DateTime<Utc>) -> &mut Self {
        self.time = Some(time);
        self
    }

    /// Verify the executable at `path`.
    pub fn verify(&self, path: impl AsRef<Path>) -> Result<VerificationResult, PublisherTrustError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        debug!("verifying {}", path.display());
        self.verify_data(&data)
    }

    /// Verify an in-memory executable.
    pub fn verify_data(&self, data: &[u8]) -> Result<VerificationResult, PublisherTrustError> {
        let result = VerificationResult::new(VerificationStatus::Valid);

        let image = match PeImage::parse(data) {
            Ok(image) => image,
            Err(e) if find_trailing_certificate(data).is_some() => {
                debug!("signed image no longer parses: {}", e);
                return Ok(result.fail(VerificationStatus::HashMismatch, e));
            }
            Err(e) => return Err(e.into()),
        };

        let signature_data = match image.signature_data() {
            Ok(Some(data)) => data,
            Ok(None) if find_trailing_certificate(data).is_some() => {
                return Ok(result.fail(
                    VerificationStatus::HashMismatch,
                    "security directory does not reference the attached signature",
                ));
            }
            Ok(None) => return Ok(VerificationResult::new(VerificationStatus::NotSigned)),
            Err(e @ AuthenticodeError::CorruptCertificateTable(_)) => {
                return Ok(result.fail(VerificationStatus::HashMismatch, e));
            }
            Err(e) => return Err(e.into()),
        };

        let signature = match AuthenticodeSignature::from_der(signature_data) {
            Ok(signature) => signature,
            Err(e) => return Ok(result.fail(VerificationStatus::HashMismatch, e)),
        };

        let signer = match signature
            .signer_certificate()
            .map(PublicCertificate::from_der)
        {
            Some(Ok(cert)) => cert,
            Some(Err(e)) => return Ok(result.fail(VerificationStatus::HashMismatch, e)),
            None => {
                return Ok(result.fail(
                    VerificationStatus::HashMismatch,
                    "signer certificate is not embedded in the signature",
                ))
            }
        };

        let mut result = result;
        result.signer_subject = Some(signer.subject().to_string());
        result.signer_issuer = Some(signer.issuer().to_string());
        result.signer_thumbprint = Some(signer.thumbprint());
        result.description = signature.description();

        let digest = image.authenticode_digest();
        if digest != signature.image_digest() {
            debug!(
                "image digest {} does not match signed digest {}",
                hex::encode(&digest),
                hex::encode(signature.image_digest())
            );
            return Ok(result.fail(
                VerificationStatus::HashMismatch,
                "file content does not match the signed digest",
            ));
        }

        if !signature.verify_message_digest() {
            return Ok(result.fail(
                VerificationStatus::HashMismatch,
                "signed content does not match its message digest attribute",
            ));
        }

        if !signer.verify_signed_data(signature.signed_attributes_der(), signature.signature()) {
            return Ok(result.fail(
                VerificationStatus::HashMismatch,
                "signature value does not verify against the signer certificate",
            ));
        }

        match signature.time_stamp_token() {
            Some(Ok(token)) if token.covers_message(signature.signature()) => {
                result.signed_at = Some(token.gen_time());
                result.timestamp_valid = signer.is_valid_at(token.gen_time());
            }
            Some(Ok(_)) => debug!("time-stamp token does not cover the signature"),
            Some(Err(e)) => debug!("ignoring time-stamp token: {}", e),
            None => {}
        }

        let chain = self.build_chain(&signer, &signature)?;
        let anchored = match chain.last() {
            Some(root) => self.is_anchor(root)?,
            None => false,
        };
        if !anchored {
            return Ok(result.fail(
                VerificationStatus::UntrustedRoot,
                "certificate chain does not end at a trusted certificate",
            ));
        }

        let evaluation_time = match (result.timestamp_valid, result.signed_at) {
            (true, Some(signed_at)) => signed_at,
            _ => self.time.unwrap_or_else(Utc::now),
        };
        if let Some(cert) = chain.iter().find(|cert| !cert.is_valid_at(evaluation_time)) {
            let detail = format!(
                "{} is not valid at {} (valid {} to {})",
                cert.subject(),
                evaluation_time.to_rfc3339(),
                cert.not_before().to_rfc3339(),
                cert.not_after().to_rfc3339()
            );
            return Ok(result.fail(VerificationStatus::Expired, detail));
        }

        Ok(result)
    }

    fn is_anchor(&self, cert: &PublicCertificate) -> Result<bool, PublisherTrustError> {
        let thumbprint = cert.thumbprint();

        if self
            .anchors
            .iter()
            .any(|anchor| anchor.thumbprint() == thumbprint)
        {
            return Ok(true);
        }

        self.store.contains(&thumbprint)
    }

    /// Walk issuers from the signer towards a root.
    ///
    /// Stops at the first trusted certificate, at a self-signed certificate
    /// or when no issuer is known.
    fn build_chain(
        &self,
        signer: &PublicCertificate,
        signature: &AuthenticodeSignature,
    ) -> Result<Vec<PublicCertificate>, PublisherTrustError> {
        let candidates = signature
            .certificates()
            .iter()
            .filter_map(|der| PublicCertificate::from_der(der.as_slice()).ok())
            .chain(self.anchors.iter().cloned())
            .collect::<Vec<_>>();

        let mut chain = vec![signer.clone()];

        while chain.len() < MAX_CHAIN_LENGTH {
            let current = &chain[chain.len() - 1];

            if current.is_self_signed() || self.is_anchor(current)? {
                break;
            }

            match candidates
                .iter()
                .find(|candidate| *candidate != current && candidate.issued(current))
            {
                Some(issuer) => chain.push(issuer.clone()),
                None => break,
            }
        }

        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            testutil::{sign_test_image, sign_test_image_with, TEST_IDENTITY},
            MemoryTrustStore, StoreScope,
        },
        authenticode_signature::testutil::{
            encode_forged_time_stamp_token, encode_unsigned_time_stamp_token, synthetic_pe_image,
        },
        chrono::Duration,
    };

    #[test]
    fn unsigned_image() -> anyhow::Result<()> {
        let store = MemoryTrustStore::new();
        let result = SignatureVerifier::new(&store).verify_data(&synthetic_pe_image(4096))?;

        assert_eq!(result.status, VerificationStatus::NotSigned);
        assert!(result.signer_subject.is_none());

        Ok(())
    }

    #[test]
    fn not_an_executable() {
        let store = MemoryTrustStore::new();

        assert!(matches!(
            SignatureVerifier::new(&store).verify_data(b"plain text, not a PE image"),
            Err(PublisherTrustError::Format(_))
        ));
    }

    #[test]
    fn pinned_certificate_is_valid() -> anyhow::Result<()> {
        let signed = sign_test_image(&synthetic_pe_image(4096), Some(Utc::now()))?;
        let store = MemoryTrustStore::new();

        let mut verifier = SignatureVerifier::new(&store);
        verifier.trust_certificate(TEST_IDENTITY.certificate().clone());
        let result = verifier.verify_data(&signed)?;

        assert_eq!(result.status, VerificationStatus::Valid, "{:?}", result.detail);
        assert!(result.signer_subject.as_deref().unwrap_or_default().contains("Test App"));
        assert_eq!(result.signer_subject, result.signer_issuer);
        assert_eq!(
            result.signer_thumbprint,
            Some(TEST_IDENTITY.certificate().thumbprint())
        );
        assert!(result.timestamp_valid);
        assert!(result.signed_at.is_some());
        assert_eq!(result.description.as_deref(), Some("Test App"));
        assert!(result.note().is_none());

        Ok(())
    }

    #[test]
    fn trust_follows_the_store() -> anyhow::Result<()> {
        let signed = sign_test_image(&synthetic_pe_image(4096), Some(Utc::now()))?;
        let store = MemoryTrustStore::new();

        let result = SignatureVerifier::new(&store).verify_data(&signed)?;
        assert_eq!(result.status, VerificationStatus::UntrustedRoot);
        assert!(result.note().is_some());
        // Identification is still reported.
        assert!(result.signer_subject.is_some());

        store.add(TEST_IDENTITY.certificate(), StoreScope::UserOnly)?;
        let result = SignatureVerifier::new(&store).verify_data(&signed)?;
        assert_eq!(result.status, VerificationStatus::Valid);

        Ok(())
    }

    #[test]
    fn verification_is_idempotent() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("app.exe");
        std::fs::write(
            &path,
            sign_test_image(&synthetic_pe_image(8192), Some(Utc::now()))?,
        )?;
        let before = std::fs::read(&path)?;

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier.trust_certificate(TEST_IDENTITY.certificate().clone());

        let first = verifier.verify(&path)?;
        let second = verifier.verify(&path)?;
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&path)?, before);

        Ok(())
    }

    #[test]
    fn any_modified_byte_is_detected() -> anyhow::Result<()> {
        let image = synthetic_pe_image(4096);
        let signed = sign_test_image(&image, Some(Utc::now()))?;
        let pe = PeImage::parse(&signed)?;
        let checksum_offset = pe.checksum_offset();
        let security_offset = pe.security_directory_offset();

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier.trust_certificate(TEST_IDENTITY.certificate().clone());

        // DOS header, e_lfanew, DOS stub, PE signature, COFF header, optional
        // header magic, headers padding, section content and the final byte
        // before the signature.
        let offsets = [
            0x02,
            0x3c,
            0x4e,
            0x80,
            0x90,
            0x99,
            0x200,
            0x400,
            0x400 + 2048,
            image.len() - 1,
        ];
        for offset in offsets {
            assert!(!(checksum_offset..checksum_offset + 4).contains(&offset));
            assert!(!(security_offset..security_offset + 8).contains(&offset));

            let mut tampered = signed.clone();
            tampered[offset] ^= 0x01;

            let result = verifier.verify_data(&tampered)?;
            assert_eq!(
                result.status,
                VerificationStatus::HashMismatch,
                "offset {:#x}",
                offset
            );
            assert!(result.detail.is_some());
        }

        Ok(())
    }

    #[test]
    fn damaged_headers_of_signed_image() -> anyhow::Result<()> {
        let signed = sign_test_image(&synthetic_pe_image(4096), None)?;

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier.trust_certificate(TEST_IDENTITY.certificate().clone());

        // The PE signature no longer matches.
        let mut tampered = signed.clone();
        tampered[0x80] = b'X';
        assert!(PeImage::parse(&tampered).is_err());
        let result = verifier.verify_data(&tampered)?;
        assert_eq!(result.status, VerificationStatus::HashMismatch);

        // The security directory is cleared but the signature is still attached.
        let security_offset = PeImage::parse(&signed)?.security_directory_offset();
        let mut detached = signed;
        detached[security_offset..security_offset + 8].fill(0);
        let result = verifier.verify_data(&detached)?;
        assert_eq!(result.status, VerificationStatus::HashMismatch);

        Ok(())
    }

    #[test]
    fn damaged_signature_block() -> anyhow::Result<()> {
        // Without a time-stamp the RSA signature value ends the block.
        let signed = sign_test_image(&synthetic_pe_image(4096), None)?;
        let table = PeImage::parse(&signed)?
            .certificate_table()
            .ok_or_else(|| anyhow::anyhow!("no certificate table"))?;

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier.trust_certificate(TEST_IDENTITY.certificate().clone());

        let mut tampered = signed.clone();
        tampered[table.offset + table.size - 100] ^= 0xff;
        let result = verifier.verify_data(&tampered)?;
        assert_eq!(result.status, VerificationStatus::HashMismatch);

        // WIN_CERTIFICATE revision.
        let mut tampered = signed;
        tampered[table.offset + 4] = 0x00;
        let result = verifier.verify_data(&tampered)?;
        assert_eq!(result.status, VerificationStatus::HashMismatch);

        Ok(())
    }

    #[test]
    fn expiry_without_time_stamp() -> anyhow::Result<()> {
        let signed = sign_test_image(&synthetic_pe_image(4096), None)?;
        let cert = TEST_IDENTITY.certificate();

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier.trust_certificate(cert.clone());

        let result = verifier.verify_data(&signed)?;
        assert_eq!(result.status, VerificationStatus::Valid);
        assert!(!result.timestamp_valid);

        verifier.at_time(cert.not_after() + Duration::days(1));
        let result = verifier.verify_data(&signed)?;
        assert_eq!(result.status, VerificationStatus::Expired);

        Ok(())
    }

    #[test]
    fn time_stamp_outlives_certificate() -> anyhow::Result<()> {
        let signed = sign_test_image(&synthetic_pe_image(4096), Some(Utc::now()))?;
        let cert = TEST_IDENTITY.certificate();

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier
            .trust_certificate(cert.clone())
            .at_time(cert.not_after() + Duration::days(365));

        let result = verifier.verify_data(&signed)?;
        assert_eq!(result.status, VerificationStatus::Valid);
        assert!(result.timestamp_valid);

        Ok(())
    }

    fn sha256(data: &[u8]) -> ring::digest::Digest {
        ring::digest::digest(&ring::digest::SHA256, data)
    }

    #[test]
    fn unverified_time_stamp_is_ignored() -> anyhow::Result<()> {
        let cert = TEST_IDENTITY.certificate();
        let gen_time = Utc::now();

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier
            .trust_certificate(cert.clone())
            .at_time(cert.not_after() + Duration::days(365));

        let forged = sign_test_image_with(&synthetic_pe_image(4096), |signature| {
            encode_forged_time_stamp_token(&gen_time, sha256(signature).as_ref(), None)
        })?;
        let result = verifier.verify_data(&forged)?;
        assert_eq!(result.status, VerificationStatus::Expired);
        assert!(!result.timestamp_valid);
        assert!(result.signed_at.is_none());

        let unsigned = sign_test_image_with(&synthetic_pe_image(4096), |signature| {
            encode_unsigned_time_stamp_token(&gen_time, sha256(signature).as_ref(), None)
        })?;
        let result = verifier.verify_data(&unsigned)?;
        assert_eq!(result.status, VerificationStatus::Expired);
        assert!(!result.timestamp_valid);

        Ok(())
    }

    #[test]
    fn time_stamp_outside_validity_is_ignored() -> anyhow::Result<()> {
        let cert = TEST_IDENTITY.certificate();
        let signed = sign_test_image(
            &synthetic_pe_image(4096),
            Some(cert.not_after() + Duration::days(10)),
        )?;

        let store = MemoryTrustStore::new();
        let mut verifier = SignatureVerifier::new(&store);
        verifier
            .trust_certificate(cert.clone())
            .at_time(cert.not_after() + Duration::days(20));

        let result = verifier.verify_data(&signed)?;
        assert!(!result.timestamp_valid);
        assert_eq!(result.status, VerificationStatus::Expired);

        Ok(())
    }
}
