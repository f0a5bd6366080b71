// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Generation of self-signed code signing identities. */

use {
    crate::{GenerationSettings, PublicCertificate, PublisherTrustError},
    log::info,
    pkcs8::EncodePrivateKey,
    rand::RngCore,
    zeroize::Zeroizing,
};

/// RSA modulus size of generated keys.
pub const RSA_KEY_BITS: usize = 2048;

/// An RSA key pair and the self-signed certificate binding it to a publisher.
///
/// The private key is held in memory only as long as this value lives and is
/// scrubbed on drop.
#[derive(Clone)]
pub struct Identity {
    certificate: PublicCertificate,
    private_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("certificate", &self.certificate.subject())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Identity {
    /// Assemble an identity from existing parts.
    ///
    /// The private key must be PKCS #8 DER and match the certificate.
    pub fn from_parts(
        certificate: PublicCertificate,
        private_key_pkcs8: Zeroizing<Vec<u8>>,
    ) -> Result<Self, PublisherTrustError> {
        let key = SigningKey::from_pkcs8(&private_key_pkcs8)?;

        if key.public_key() != certificate.public_key() {
            return Err(PublisherTrustError::Certificate(
                "private key does not belong to certificate".into(),
            ));
        }

        Ok(Self {
            certificate,
            private_key: private_key_pkcs8,
        })
    }

    pub fn certificate(&self) -> &PublicCertificate {
        &self.certificate
    }

    /// PKCS #8 DER encoding of the private key.
    pub fn private_key_pkcs8(&self) -> &[u8] {
        &self.private_key
    }

    pub fn signing_key(&self) -> Result<SigningKey, PublisherTrustError> {
        SigningKey::from_pkcs8(&self.private_key)
    }
}

/// An RSA private key able to produce PKCS #1 v1.5 SHA-256 signatures.
pub struct SigningKey {
    key_pair: ring::signature::RsaKeyPair,
}

impl SigningKey {
    pub fn from_pkcs8(data: &[u8]) -> Result<Self, PublisherTrustError> {
        let key_pair = ring::signature::RsaKeyPair::from_pkcs8(data).map_err(|e| {
            PublisherTrustError::Certificate(format!("unusable RSA private key: {}", e))
        })?;

        Ok(Self { key_pair })
    }

    /// The DER `RSAPublicKey` of this key.
    pub fn public_key(&self) -> &[u8] {
        use ring::signature::KeyPair;

        self.key_pair.public_key().as_ref()
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, PublisherTrustError> {
        let mut signature = vec![0; self.key_pair.public_modulus_len()];

        self.key_pair
            .sign(
                &ring::signature::RSA_PKCS1_SHA256,
                &ring::rand::SystemRandom::new(),
                message,
                &mut signature,
            )
            .map_err(|_| PublisherTrustError::Generation("RSA signing failed".into()))?;

        Ok(signature)
    }
}

/// Generate a new RSA private key, returned as PKCS #8 DER.
fn generate_rsa_key() -> Result<Zeroizing<Vec<u8>>, PublisherTrustError> {
    info!("generating {}-bit RSA key", RSA_KEY_BITS);

    let key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
        .map_err(|e| PublisherTrustError::Generation(format!("RSA key generation: {}", e)))?;

    let document = key
        .to_pkcs8_der()
        .map_err(|e| PublisherTrustError::Generation(format!("PKCS #8 encoding: {}", e)))?;
    let der: &[u8] = document.as_ref();

    Ok(Zeroizing::new(der.to_vec()))
}

/// Create parameters for a self-signed certificate suitable for Authenticode.
///
/// The certificate mirrors what
/// `New-SelfSignedCertificate -Type CodeSigningCert -KeyAlgorithm RSA` produces,
/// plus an organization in the subject.
fn code_signing_certificate_params(
    settings: &GenerationSettings,
    key_pair: rcgen::KeyPair,
) -> Result<rcgen::CertificateParams, PublisherTrustError> {
    let mut params = rcgen::CertificateParams::new(vec![]);
    params.alg = &rcgen::PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);
    params.key_identifier_method = rcgen::KeyIdMethod::Sha256;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, settings.subject_name());
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, settings.publisher_name());
    params
        .extended_key_usages
        .push(rcgen::ExtendedKeyUsagePurpose::CodeSigning);
    params.is_ca = rcgen::IsCa::ExplicitNoCa;

    // Serial numbers must differ between rotations.
    params.serial_number = Some(rand::rngs::OsRng.next_u64() >> 1);

    let now = chrono::Utc::now().timestamp();
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now)
        .map_err(|e| PublisherTrustError::Generation(format!("invalid clock: {}", e)))?;
    params.not_after = params
        .not_before
        .checked_add(time::Duration::days(settings.validity_days() as i64))
        .ok_or_else(|| PublisherTrustError::Generation("validity window overflows".into()))?;

    // KeyUsage(KeyUsage { flags: 1 }): digitalSignature only.
    let mut key_usage =
        rcgen::CustomExtension::from_oid_content(&[2, 5, 29, 15], vec![3, 2, 7, 128]);
    key_usage.set_criticality(true);
    params.custom_extensions.push(key_usage);

    Ok(params)
}

fn self_sign(
    settings: &GenerationSettings,
    private_key: Zeroizing<Vec<u8>>,
) -> Result<Identity, PublisherTrustError> {
    let key_pair = rcgen::KeyPair::from_der(&private_key)
        .map_err(|e| PublisherTrustError::Generation(format!("loading key pair: {}", e)))?;

    let params = code_signing_certificate_params(settings, key_pair)?;

    let certificate = rcgen::Certificate::from_params(params)
        .map_err(|e| PublisherTrustError::Generation(format!("building certificate: {}", e)))?;
    let der = certificate
        .serialize_der()
        .map_err(|e| PublisherTrustError::Generation(format!("signing certificate: {}", e)))?;

    Identity::from_parts(PublicCertificate::from_der(der)?, private_key)
}

/// Generate a fresh key pair and self-signed code signing certificate.
///
/// Nothing is written to disk.
pub fn generate_identity(settings: &GenerationSettings) -> Result<Identity, PublisherTrustError> {
    settings.validate()?;

    let identity = self_sign(settings, generate_rsa_key()?)?;

    info!(
        "generated certificate {} for {} (serial {})",
        identity.certificate().thumbprint(),
        identity.certificate().subject(),
        identity.certificate().serial_number_hex()
    );

    Ok(identity)
}

/// Convenience wrapper for [generate_identity].
pub fn generate(
    subject_name: &str,
    publisher_name: &str,
    validity_days: u32,
) -> Result<Identity, PublisherTrustError> {
    let mut settings = GenerationSettings::new(subject_name, publisher_name);
    settings.set_validity_days(validity_days);

    generate_identity(&settings)
}

/// Sign a new certificate over an existing key.
///
/// Only usable by tests: rotations must never reuse a key.
#[cfg(test)]
pub(crate) fn generate_identity_with_key(
    settings: &GenerationSettings,
    private_key: &[u8],
) -> Result<Identity, PublisherTrustError> {
    settings.validate()?;

    self_sign(settings, Zeroizing::new(private_key.to_vec()))
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::TEST_IDENTITY};

    #[test]
    fn validity_window_matches_request() -> anyhow::Result<()> {
        for days in [1, 30, 1825, 3650] {
            let mut settings = GenerationSettings::new("Test App", "Test Org");
            settings.set_validity_days(days);

            let identity =
                generate_identity_with_key(&settings, TEST_IDENTITY.private_key_pkcs8())?;
            let cert = identity.certificate();

            assert_eq!(
                cert.not_after() - cert.not_before(),
                chrono::Duration::days(days as i64)
            );
            assert!((chrono::Utc::now() - cert.not_before()).num_seconds().abs() < 60);
        }

        Ok(())
    }

    #[test]
    fn leaf_cannot_issue_certificates() -> anyhow::Result<()> {
        let settings = GenerationSettings::new("Test App", "Test Org");
        let identity = generate_identity_with_key(&settings, TEST_IDENTITY.private_key_pkcs8())?;
        let cert = identity.certificate();

        assert!(!cert.is_ca());
        assert!(cert.is_self_signed());

        // basicConstraints is present and marks the certificate as an end entity.
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.der())
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        assert!(matches!(
            parsed.basic_constraints(),
            Ok(Some(constraints)) if !constraints.value.ca
        ));

        Ok(())
    }

    #[test]
    fn serials_are_unique() -> anyhow::Result<()> {
        let settings = GenerationSettings::new("Test App", "Test Org");
        let a = generate_identity_with_key(&settings, TEST_IDENTITY.private_key_pkcs8())?;
        let b = generate_identity_with_key(&settings, TEST_IDENTITY.private_key_pkcs8())?;

        assert_ne!(a.certificate().serial_number(), b.certificate().serial_number());

        Ok(())
    }

    #[test]
    fn invalid_settings_rejected() {
        assert!(matches!(
            generate("", "Test Org", 10),
            Err(PublisherTrustError::Generation(_))
        ));
        assert!(matches!(
            generate("Test App", "  ", 10),
            Err(PublisherTrustError::Generation(_))
        ));
        assert!(matches!(
            generate("Test App", "Test Org", 0),
            Err(PublisherTrustError::Generation(_))
        ));
    }

    #[test]
    fn fresh_identity() -> anyhow::Result<()> {
        let identity = &*TEST_IDENTITY;
        let key = identity.signing_key()?;

        assert_eq!(key.public_key(), identity.certificate().public_key());
        assert!(identity.certificate().public_key().len() > 256);

        let signature = key.sign(b"message")?;
        assert_eq!(signature.len(), RSA_KEY_BITS / 8);
        assert!(identity
            .certificate()
            .verify_signed_data(b"message", &signature));
        assert!(!identity
            .certificate()
            .verify_signed_data(b"other message", &signature));

        Ok(())
    }

    #[test]
    fn debug_redacts_key() {
        let rendered = format!("{:?}", *TEST_IDENTITY);
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn mismatched_parts_rejected() -> anyhow::Result<()> {
        let settings = GenerationSettings::new("Other", "Other Org");
        let other = generate_identity_with_key(&settings, TEST_IDENTITY.private_key_pkcs8())?;

        // Same key, so this pairing is legitimate.
        Identity::from_parts(
            other.certificate().clone(),
            Zeroizing::new(TEST_IDENTITY.private_key_pkcs8().to_vec()),
        )?;

        assert!(Identity::from_parts(
            TEST_IDENTITY.certificate().clone(),
            Zeroizing::new(b"garbage".to_vec())
        )
        .is_err());

        Ok(())
    }
}
