// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Host specific selection of signing and trust store back-ends. */

use {
    crate::{
        export_private_archive, export_public_certificate, generate_identity, AuthenticodeSigner,
        ExecutableSigner, GenerationSettings, Identity, InstallOutcome, InstallSettings,
        PublicCertificate, PublicCertificateFormat, PublisherTrustError, SignatureResult,
        SignatureVerifier, SigningSettings, StoreScope, Thumbprint, TrustStore,
        TrustStoreInstaller, VerificationResult,
    },
    log::info,
    std::path::Path,
};

/// The full set of operations, bound to one signer and one store.
pub struct SigningPlatform {
    signer: Box<dyn ExecutableSigner>,
    store: Box<dyn TrustStore>,
}

impl SigningPlatform {
    pub fn new(signer: Box<dyn ExecutableSigner>, store: Box<dyn TrustStore>) -> Self {
        Self { signer, store }
    }

    /// Choose back-ends for the running host.
    ///
    /// Windows uses `signtool.exe` when the SDK is installed and the system
    /// certificate stores through `certutil`. Elsewhere signing happens in
    /// process and certificates are kept in a [crate::DirectoryTrustStore].
    pub fn detect() -> Result<Self, PublisherTrustError> {
        let platform = Self::new(Self::detect_signer(), Self::detect_store()?);

        info!(
            "using {} signer and {} trust store",
            platform.signer.name(),
            platform.store.name()
        );

        Ok(platform)
    }

    /// The preferred signer of the running host.
    #[cfg(windows)]
    pub fn detect_signer() -> Box<dyn ExecutableSigner> {
        match crate::SigntoolSigner::new() {
            Ok(signer) => Box::new(signer),
            Err(e) => {
                log::warn!("{}; falling back to the built-in signer", e);
                Box::new(AuthenticodeSigner::new())
            }
        }
    }

    /// The preferred signer of the running host.
    #[cfg(not(windows))]
    pub fn detect_signer() -> Box<dyn ExecutableSigner> {
        Box::new(AuthenticodeSigner::new())
    }

    #[cfg(windows)]
    fn detect_store() -> Result<Box<dyn TrustStore>, PublisherTrustError> {
        Ok(Box::new(crate::CertutilTrustStore::new()?))
    }

    #[cfg(not(windows))]
    fn detect_store() -> Result<Box<dyn TrustStore>, PublisherTrustError> {
        Ok(Box::new(crate::DirectoryTrustStore::new()?))
    }

    pub fn signer(&self) -> &dyn ExecutableSigner {
        self.signer.as_ref()
    }

    pub fn store(&self) -> &dyn TrustStore {
        self.store.as_ref()
    }

    pub fn generate(&self, settings: &GenerationSettings) -> Result<Identity, PublisherTrustError> {
        generate_identity(settings)
    }

    /// Write the private archive and, optionally, the public certificate.
    pub fn export(
        &self,
        identity: &Identity,
        password: &str,
        private_archive: &Path,
        public_certificate: Option<(&Path, PublicCertificateFormat)>,
    ) -> Result<(), PublisherTrustError> {
        export_private_archive(identity, password, private_archive)?;

        if let Some((path, format)) = public_certificate {
            export_public_certificate(identity.certificate(), path, format)?;
        }

        Ok(())
    }

    pub fn sign(
        &self,
        executable: &Path,
        private_archive: &Path,
        password: &str,
        settings: &SigningSettings,
    ) -> Result<SignatureResult, PublisherTrustError> {
        self.signer
            .sign(executable, private_archive, password, settings)
    }

    /// Verify against the platform store plus `pinned`.
    pub fn verify(
        &self,
        executable: &Path,
        pinned: Option<&PublicCertificate>,
    ) -> Result<VerificationResult, PublisherTrustError> {
        let mut verifier = SignatureVerifier::new(self.store.as_ref());
        if let Some(cert) = pinned {
            verifier.trust_certificate(cert.clone());
        }

        verifier.verify(executable)
    }

    pub fn install(
        &self,
        certificate: &Path,
        scope: StoreScope,
        settings: InstallSettings,
    ) -> Result<InstallOutcome, PublisherTrustError> {
        TrustStoreInstaller::new(self.store.as_ref(), settings).install(certificate, scope)
    }

    pub fn verify_installed(
        &self,
        thumbprint: &Thumbprint,
        scope: StoreScope,
    ) -> Result<bool, PublisherTrustError> {
        TrustStoreInstaller::new(self.store.as_ref(), InstallSettings::default())
            .verify_installed(thumbprint, scope)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            testutil::{write_test_executable, TEST_IDENTITY, TEST_PASSWORD},
            MemoryTrustStore, SignatureStatus, VerificationStatus,
        },
        authenticode_signature::testutil::FakeTimeStampClient,
        std::rc::Rc,
    };

    #[test]
    fn end_to_end() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let archive = temp_dir.path().join("identity.pfx");
        let public = temp_dir.path().join("identity.cer");
        let exe = write_test_executable(temp_dir.path(), 64 * 1024)?;

        let platform = SigningPlatform::new(
            Box::new(AuthenticodeSigner::with_time_stamp_client(Rc::new(
                FakeTimeStampClient::new(chrono::Utc::now()),
            ))),
            Box::new(MemoryTrustStore::without_machine_access()),
        );

        platform.export(
            &TEST_IDENTITY,
            TEST_PASSWORD,
            &archive,
            Some((public.as_path(), PublicCertificateFormat::Der)),
        )?;

        let mut settings = SigningSettings::default();
        settings.set_description("Test App");
        let signed = platform.sign(&exe, &archive, TEST_PASSWORD, &settings)?;
        assert_eq!(signed.status, SignatureStatus::Valid);

        // Not trusted until installed.
        let result = platform.verify(&exe, None)?;
        assert_eq!(result.status, VerificationStatus::UntrustedRoot);

        // A distributed certificate can be pinned instead.
        let cert = PublicCertificate::from_path(&public)?;
        assert_eq!(
            platform.verify(&exe, Some(&cert))?.status,
            VerificationStatus::Valid
        );

        let outcome = platform.install(&public, StoreScope::MachineWide, InstallSettings::default())?;
        assert!(outcome.degraded);
        assert!(platform.verify_installed(outcome.thumbprint(), StoreScope::UserOnly)?);

        let result = platform.verify(&exe, None)?;
        assert_eq!(result.status, VerificationStatus::Valid);
        assert_eq!(result.signer_thumbprint.as_ref(), Some(outcome.thumbprint()));

        Ok(())
    }
}
