// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Trusted publisher stores.

The operating system's certificate stores are process external, mutable
state. They are reached through the [TrustStore] trait so that callers hold
an explicit handle and tests can substitute [MemoryTrustStore].

Stores are keyed by [Thumbprint]. Concurrent writers race at the store
level; this crate adds no locking of its own and reports conflicts as
[InstallErrorKind::StoreUnavailable], which is retryable.
*/

use {
    crate::{
        process::run_logged, InstallErrorKind, InstallSettings, PublicCertificate,
        PublisherTrustError, Thumbprint,
    },
    chrono::{DateTime, Utc},
    log::{info, warn},
    std::{
        collections::BTreeMap,
        ffi::OsString,
        io::Write,
        path::{Path, PathBuf},
        str::FromStr,
        sync::Mutex,
    },
};

/// Default root of the machine-wide directory store.
///
/// This is outside the directories `update-ca-certificates` collects into
/// the system TLS bundle. Trusting a code signing publisher must not make it
/// a TLS authority.
pub const MACHINE_DIRECTORY_STORE: &str = "/usr/local/share/publisher-trust/trusted-publishers";

/// Name of the Windows store holding trusted publishers.
const WINDOWS_TRUSTED_PUBLISHER_STORE: &str = "TrustedPublisher";

/// Which store of a machine to operate on.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StoreScope {
    /// Applies to every user. Usually requires elevated privileges.
    MachineWide,
    /// Applies to the current user only.
    UserOnly,
}

impl std::fmt::Display for StoreScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::MachineWide => "machine",
            Self::UserOnly => "user",
        })
    }
}

impl FromStr for StoreScope {
    type Err = PublisherTrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "machine" | "machine-wide" => Ok(Self::MachineWide),
            "user" | "user-only" => Ok(Self::UserOnly),
            _ => Err(PublisherTrustError::BadArgument(format!(
                "unknown store scope: {}; expected machine or user",
                s
            ))),
        }
    }
}

/// A certificate accepted as trusted within a store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustStoreEntry {
    pub scope: StoreScope,
    pub thumbprint: Thumbprint,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl TrustStoreEntry {
    pub fn new(certificate: &PublicCertificate, scope: StoreScope) -> Self {
        Self {
            scope,
            thumbprint: certificate.thumbprint(),
            subject: certificate.subject().to_string(),
            not_before: certificate.not_before(),
            not_after: certificate.not_after(),
        }
    }
}

/// A store of trusted publisher certificates.
pub trait TrustStore {
    /// Human readable name of the store implementation.
    fn name(&self) -> &'static str;

    /// Whether the current process may add certificates to `scope`.
    fn can_write(&self, scope: StoreScope) -> bool;

    /// Add a certificate to the store.
    fn add(
        &self,
        certificate: &PublicCertificate,
        scope: StoreScope,
    ) -> Result<TrustStoreEntry, PublisherTrustError>;

    /// Look up a certificate by thumbprint.
    fn find(
        &self,
        thumbprint: &Thumbprint,
        scope: StoreScope,
    ) -> Result<Option<TrustStoreEntry>, PublisherTrustError>;

    /// Whether a certificate is trusted in any scope.
    fn contains(&self, thumbprint: &Thumbprint) -> Result<bool, PublisherTrustError> {
        for scope in [StoreScope::MachineWide, StoreScope::UserOnly] {
            if self.find(thumbprint, scope)?.is_some() {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// A process local store.
#[derive(Debug)]
pub struct MemoryTrustStore {
    entries: Mutex<BTreeMap<(StoreScope, Thumbprint), TrustStoreEntry>>,
    machine_access: bool,
    retain_writes: bool,
}

impl Default for MemoryTrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            machine_access: true,
            retain_writes: true,
        }
    }

    /// A store behaving as if the process were not elevated.
    pub fn without_machine_access() -> Self {
        Self {
            machine_access: false,
            ..Self::new()
        }
    }

    /// A store that acknowledges writes but does not keep them.
    pub fn forgetful() -> Self {
        Self {
            retain_writes: false,
            ..Self::new()
        }
    }

    fn lock(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, BTreeMap<(StoreScope, Thumbprint), TrustStoreEntry>>,
        PublisherTrustError,
    > {
        self.entries.lock().map_err(|_| {
            PublisherTrustError::install(InstallErrorKind::StoreUnavailable, "store lock poisoned")
        })
    }
}

impl TrustStore for MemoryTrustStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn can_write(&self, scope: StoreScope) -> bool {
        scope == StoreScope::UserOnly || self.machine_access
    }

    fn add(
        &self,
        certificate: &PublicCertificate,
        scope: StoreScope,
    ) -> Result<TrustStoreEntry, PublisherTrustError> {
        if !self.can_write(scope) {
            return Err(PublisherTrustError::install(
                InstallErrorKind::PermissionDenied,
                format!("{} store is read-only", scope),
            ));
        }

        let entry = TrustStoreEntry::new(certificate, scope);
        if self.retain_writes {
            self.lock()?
                .insert((scope, entry.thumbprint.clone()), entry.clone());
        }

        Ok(entry)
    }

    fn find(
        &self,
        thumbprint: &Thumbprint,
        scope: StoreScope,
    ) -> Result<Option<TrustStoreEntry>, PublisherTrustError> {
        Ok(self.lock()?.get(&(scope, thumbprint.clone())).cloned())
    }
}

fn store_io_error(context: &str, e: std::io::Error) -> PublisherTrustError {
    let kind = if e.kind() == std::io::ErrorKind::PermissionDenied {
        InstallErrorKind::PermissionDenied
    } else {
        InstallErrorKind::StoreUnavailable
    };

    PublisherTrustError::install(kind, format!("{}: {}", context, e))
}

/// A store of PEM files named by thumbprint.
///
/// Only this crate's verifier consults it.
#[derive(Clone, Debug)]
pub struct DirectoryTrustStore {
    machine_root: PathBuf,
    user_root: PathBuf,
}

impl DirectoryTrustStore {
    /// A store at the default system locations.
    pub fn new() -> Result<Self, PublisherTrustError> {
        let user_root = dirs::data_local_dir()
            .ok_or_else(|| {
                PublisherTrustError::install(
                    InstallErrorKind::StoreUnavailable,
                    "unable to resolve the user data directory",
                )
            })?
            .join("publisher-trust")
            .join("trusted-publishers");

        Ok(Self {
            machine_root: PathBuf::from(MACHINE_DIRECTORY_STORE),
            user_root,
        })
    }

    /// A store rooted at custom locations.
    pub fn with_roots(machine_root: impl AsRef<Path>, user_root: impl AsRef<Path>) -> Self {
        Self {
            machine_root: machine_root.as_ref().to_path_buf(),
            user_root: user_root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self, scope: StoreScope) -> &Path {
        match scope {
            StoreScope::MachineWide => &self.machine_root,
            StoreScope::UserOnly => &self.user_root,
        }
    }

    fn entry_path(&self, thumbprint: &Thumbprint, scope: StoreScope) -> PathBuf {
        self.root(scope).join(format!("{}.crt", thumbprint))
    }
}

impl TrustStore for DirectoryTrustStore {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn can_write(&self, scope: StoreScope) -> bool {
        // The nearest existing directory decides; `add` creates the rest.
        self.root(scope)
            .ancestors()
            .map(|dir| {
                if dir.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    dir
                }
            })
            .find(|dir| dir.is_dir())
            .map(|dir| tempfile::tempfile_in(dir).is_ok())
            .unwrap_or(false)
    }

    fn add(
        &self,
        certificate: &PublicCertificate,
        scope: StoreScope,
    ) -> Result<TrustStoreEntry, PublisherTrustError> {
        let root = self.root(scope);
        std::fs::create_dir_all(root)
            .map_err(|e| store_io_error(&format!("creating {}", root.display()), e))?;

        let entry = TrustStoreEntry::new(certificate, scope);
        let path = self.entry_path(&entry.thumbprint, scope);

        let mut temp = tempfile::NamedTempFile::new_in(root)
            .map_err(|e| store_io_error(&format!("writing to {}", root.display()), e))?;
        temp.write_all(certificate.to_pem().as_bytes())
            .map_err(|e| store_io_error("writing certificate", e))?;
        temp.persist(&path)
            .map_err(|e| store_io_error(&format!("replacing {}", path.display()), e.error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
                .map_err(|e| store_io_error("setting permissions", e))?;
        }

        info!("wrote {}", path.display());

        Ok(entry)
    }

    fn find(
        &self,
        thumbprint: &Thumbprint,
        scope: StoreScope,
    ) -> Result<Option<TrustStoreEntry>, PublisherTrustError> {
        let path = self.entry_path(thumbprint, scope);

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_io_error(&format!("reading {}", path.display()), e)),
        };

        match PublicCertificate::from_bytes(&data) {
            Ok(cert) if &cert.thumbprint() == thumbprint => {
                Ok(Some(TrustStoreEntry::new(&cert, scope)))
            }
            Ok(_) => {
                warn!("{} does not hold the certificate it is named after", path.display());
                Ok(None)
            }
            Err(e) => {
                warn!("ignoring unreadable store entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

/// The Windows certificate stores, driven through `certutil.exe`.
#[derive(Clone, Debug)]
pub struct CertutilTrustStore {
    certutil: PathBuf,
}

impl CertutilTrustStore {
    pub fn new() -> Result<Self, PublisherTrustError> {
        let certutil = which::which("certutil").map_err(|e| {
            PublisherTrustError::install(
                InstallErrorKind::StoreUnavailable,
                format!("unable to locate certutil: {}", e),
            )
        })?;

        Ok(Self { certutil })
    }

    fn scope_args(scope: StoreScope) -> Vec<OsString> {
        let mut args = vec!["-f".into()];
        if scope == StoreScope::UserOnly {
            args.push("-user".into());
        }
        args
    }

    fn is_elevated() -> bool {
        // `net session` only succeeds from an elevated process.
        duct::cmd!("net", "session")
            .stdout_null()
            .stderr_null()
            .unchecked()
            .run()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl TrustStore for CertutilTrustStore {
    fn name(&self) -> &'static str {
        "certutil"
    }

    fn can_write(&self, scope: StoreScope) -> bool {
        match scope {
            StoreScope::UserOnly => true,
            StoreScope::MachineWide => Self::is_elevated(),
        }
    }

    fn add(
        &self,
        certificate: &PublicCertificate,
        scope: StoreScope,
    ) -> Result<TrustStoreEntry, PublisherTrustError> {
        let mut temp = tempfile::Builder::new()
            .suffix(".cer")
            .tempfile()
            .map_err(|e| store_io_error("creating temporary certificate", e))?;
        temp.write_all(certificate.der())
            .map_err(|e| store_io_error("writing temporary certificate", e))?;

        let mut args = Self::scope_args(scope);
        args.push("-addstore".into());
        args.push(WINDOWS_TRUSTED_PUBLISHER_STORE.into());
        args.push(temp.path().as_os_str().to_os_string());

        let output = run_logged(&self.certutil, &args, &[])
            .map_err(|e| store_io_error("running certutil", e))?;

        if output.success {
            Ok(TrustStoreEntry::new(certificate, scope))
        } else {
            let denied = output.lines.iter().any(|line| {
                line.contains("0x80070005") || line.to_lowercase().contains("access is denied")
            });

            Err(PublisherTrustError::install(
                if denied {
                    InstallErrorKind::PermissionDenied
                } else {
                    InstallErrorKind::StoreUnavailable
                },
                format!(
                    "certutil -addstore {} failed",
                    WINDOWS_TRUSTED_PUBLISHER_STORE
                ),
            ))
        }
    }

    fn find(
        &self,
        thumbprint: &Thumbprint,
        scope: StoreScope,
    ) -> Result<Option<TrustStoreEntry>, PublisherTrustError> {
        let temp_dir = tempfile::tempdir().map_err(|e| store_io_error("creating temp dir", e))?;
        let out_path = temp_dir.path().join("found.cer");

        let mut args = Self::scope_args(scope);
        args.push("-store".into());
        args.push(WINDOWS_TRUSTED_PUBLISHER_STORE.into());
        args.push(thumbprint.as_str().into());
        args.push(out_path.as_os_str().to_os_string());

        let output = run_logged(&self.certutil, &args, &[])
            .map_err(|e| store_io_error("running certutil", e))?;

        if !output.success || !out_path.exists() {
            return Ok(None);
        }

        let cert = PublicCertificate::from_path(&out_path).map_err(|e| {
            PublisherTrustError::install(InstallErrorKind::StoreUnavailable, e.to_string())
        })?;

        if &cert.thumbprint() == thumbprint {
            Ok(Some(TrustStoreEntry::new(&cert, scope)))
        } else {
            Ok(None)
        }
    }
}

/// What [TrustStoreInstaller::install] did.
#[derive(Clone, Debug)]
pub struct InstallOutcome {
    pub entry: TrustStoreEntry,
    /// The scope asked for. Differs from `entry.scope` when degraded.
    pub requested_scope: StoreScope,
    pub degraded: bool,
    pub expired: bool,
    pub warnings: Vec<String>,
}

impl InstallOutcome {
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.entry.thumbprint
    }

    pub fn scope(&self) -> StoreScope {
        self.entry.scope
    }
}

/// Installs public certificates into a [TrustStore] and confirms the result.
pub struct TrustStoreInstaller<'a> {
    store: &'a dyn TrustStore,
    settings: InstallSettings,
}

impl<'a> TrustStoreInstaller<'a> {
    pub fn new(store: &'a dyn TrustStore, settings: InstallSettings) -> Self {
        Self { store, settings }
    }

    /// Install the certificate stored at `path`.
    pub fn install(
        &self,
        path: impl AsRef<Path>,
        scope: StoreScope,
    ) -> Result<InstallOutcome, PublisherTrustError> {
        let path = path.as_ref();

        let data = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                PublisherTrustError::install(
                    InstallErrorKind::PermissionDenied,
                    format!("reading {}: {}", path.display(), e),
                )
            } else {
                PublisherTrustError::install(
                    InstallErrorKind::CorruptInput,
                    format!("reading {}: {}", path.display(), e),
                )
            }
        })?;

        let certificate = PublicCertificate::from_bytes(&data).map_err(|e| {
            PublisherTrustError::install(
                InstallErrorKind::CorruptInput,
                format!("{}: {}", path.display(), e),
            )
        })?;

        self.install_certificate(&certificate, scope)
    }

    pub fn install_certificate(
        &self,
        certificate: &PublicCertificate,
        scope: StoreScope,
    ) -> Result<InstallOutcome, PublisherTrustError> {
        let mut warnings = vec![];

        let expired = certificate.is_expired_at(Utc::now());
        if expired {
            let message = format!(
                "certificate {} expired on {}",
                certificate.thumbprint(),
                certificate.not_after().to_rfc3339()
            );

            if self.settings.strict_expiry() && !self.settings.allow_expired() {
                return Err(PublisherTrustError::install(
                    InstallErrorKind::Expired,
                    message,
                ));
            }

            warn!("{}", message);
            warnings.push(message);
        }

        let mut effective_scope = scope;
        let mut degraded = false;

        if !self.store.can_write(scope) {
            if scope == StoreScope::MachineWide
                && self.settings.allow_degrade()
                && self.store.can_write(StoreScope::UserOnly)
            {
                let message = format!(
                    "insufficient privileges for the {} store; installing for the current user only",
                    scope
                );
                warn!("{}", message);
                warnings.push(message);

                effective_scope = StoreScope::UserOnly;
                degraded = true;
            } else {
                return Err(PublisherTrustError::install(
                    InstallErrorKind::PermissionDenied,
                    format!("cannot write to the {} {} store", scope, self.store.name()),
                ));
            }
        }

        let entry = self.store.add(certificate, effective_scope)?;

        if !self.verify_installed(&entry.thumbprint, effective_scope)? {
            return Err(PublisherTrustError::install(
                InstallErrorKind::StoreUnavailable,
                format!(
                    "{} was not found in the {} store after installation",
                    entry.thumbprint, effective_scope
                ),
            ));
        }

        info!(
            "installed {} ({}) into the {} {} store",
            entry.thumbprint,
            entry.subject,
            effective_scope,
            self.store.name()
        );

        Ok(InstallOutcome {
            entry,
            requested_scope: scope,
            degraded,
            expired,
            warnings,
        })
    }

    /// Query the store for a certificate.
    pub fn verify_installed(
        &self,
        thumbprint: &Thumbprint,
        scope: StoreScope,
    ) -> Result<bool, PublisherTrustError> {
        Ok(self.store.find(thumbprint, scope)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::TEST_IDENTITY,
    };

    /// A certificate that expired a day ago.
    fn expired_certificate() -> anyhow::Result<PublicCertificate> {
        let key_pair = rcgen::KeyPair::from_der(TEST_IDENTITY.private_key_pkcs8())?;
        let mut params = rcgen::CertificateParams::new(vec![]);
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Old App");
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(30);
        params.not_after = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        let der = rcgen::Certificate::from_params(params)?.serialize_der()?;

        Ok(PublicCertificate::from_der(der)?)
    }

    fn write_certificate(dir: &Path, cert: &PublicCertificate) -> anyhow::Result<PathBuf> {
        let path = dir.join("publisher.cer");
        std::fs::write(&path, cert.der())?;
        Ok(path)
    }

    #[test]
    fn install_then_verify() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = write_certificate(temp_dir.path(), TEST_IDENTITY.certificate())?;

        let store = MemoryTrustStore::new();
        let installer = TrustStoreInstaller::new(&store, InstallSettings::default());
        let thumbprint = TEST_IDENTITY.certificate().thumbprint();

        assert!(!installer.verify_installed(&thumbprint, StoreScope::MachineWide)?);

        let outcome = installer.install(&path, StoreScope::MachineWide)?;
        assert_eq!(outcome.thumbprint(), &thumbprint);
        assert_eq!(outcome.scope(), StoreScope::MachineWide);
        assert!(!outcome.degraded);
        assert!(!outcome.expired);
        assert!(outcome.warnings.is_empty());

        assert!(installer.verify_installed(&thumbprint, StoreScope::MachineWide)?);
        assert!(!installer.verify_installed(&thumbprint, StoreScope::UserOnly)?);
        assert!(store.contains(&thumbprint)?);

        Ok(())
    }

    #[test]
    fn unknown_thumbprint_not_installed() -> anyhow::Result<()> {
        let store = MemoryTrustStore::new();
        let installer = TrustStoreInstaller::new(&store, InstallSettings::default());

        let thumbprint = Thumbprint::from_str("00112233445566778899AABBCCDDEEFF00112233")?;
        assert!(!installer.verify_installed(&thumbprint, StoreScope::UserOnly)?);

        Ok(())
    }

    #[test]
    fn machine_scope_degrades_without_privileges() -> anyhow::Result<()> {
        let store = MemoryTrustStore::without_machine_access();
        let installer = TrustStoreInstaller::new(&store, InstallSettings::default());

        let outcome =
            installer.install_certificate(TEST_IDENTITY.certificate(), StoreScope::MachineWide)?;
        assert!(outcome.degraded);
        assert_eq!(outcome.requested_scope, StoreScope::MachineWide);
        assert_eq!(outcome.scope(), StoreScope::UserOnly);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(installer.verify_installed(outcome.thumbprint(), StoreScope::UserOnly)?);

        Ok(())
    }

    #[test]
    fn degradation_can_be_refused() {
        let store = MemoryTrustStore::without_machine_access();
        let mut settings = InstallSettings::default();
        settings.set_allow_degrade(false);
        let installer = TrustStoreInstaller::new(&store, settings);

        let res = installer.install_certificate(TEST_IDENTITY.certificate(), StoreScope::MachineWide);
        assert!(matches!(
            res,
            Err(PublisherTrustError::Install {
                kind: InstallErrorKind::PermissionDenied,
                ..
            })
        ));
    }

    #[test]
    fn expired_certificate_policy() -> anyhow::Result<()> {
        let cert = expired_certificate()?;
        let store = MemoryTrustStore::new();

        // Default: warn and proceed.
        let outcome = TrustStoreInstaller::new(&store, InstallSettings::default())
            .install_certificate(&cert, StoreScope::UserOnly)?;
        assert!(outcome.expired);
        assert!(outcome.warnings[0].contains("expired"));

        // Strict: refuse.
        let store = MemoryTrustStore::new();
        let mut settings = InstallSettings::default();
        settings.set_strict_expiry(true);
        let res = TrustStoreInstaller::new(&store, settings)
            .install_certificate(&cert, StoreScope::UserOnly);
        assert!(matches!(
            res,
            Err(PublisherTrustError::Install {
                kind: InstallErrorKind::Expired,
                ..
            })
        ));
        assert!(!store.contains(&cert.thumbprint())?);

        // Strict with explicit confirmation.
        settings.set_allow_expired(true);
        let outcome = TrustStoreInstaller::new(&store, settings)
            .install_certificate(&cert, StoreScope::UserOnly)?;
        assert!(outcome.expired);

        Ok(())
    }

    #[test]
    fn corrupt_input_rejected() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("garbage.cer");
        std::fs::write(&path, b"definitely not a certificate")?;

        let store = MemoryTrustStore::new();
        let installer = TrustStoreInstaller::new(&store, InstallSettings::default());

        for path in [path, temp_dir.path().join("missing.cer")] {
            assert!(matches!(
                installer.install(&path, StoreScope::UserOnly),
                Err(PublisherTrustError::Install {
                    kind: InstallErrorKind::CorruptInput,
                    ..
                })
            ));
        }

        Ok(())
    }

    #[test]
    fn unretained_write_detected() {
        let store = MemoryTrustStore::forgetful();
        let installer = TrustStoreInstaller::new(&store, InstallSettings::default());

        let err = installer
            .install_certificate(TEST_IDENTITY.certificate(), StoreScope::UserOnly)
            .unwrap_err();
        assert!(matches!(
            err,
            PublisherTrustError::Install {
                kind: InstallErrorKind::StoreUnavailable,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn directory_store_round_trip() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = DirectoryTrustStore::with_roots(
            temp_dir.path().join("machine"),
            temp_dir.path().join("user"),
        );
        let installer = TrustStoreInstaller::new(&store, InstallSettings::default());
        let cert = TEST_IDENTITY.certificate();

        assert!(!installer.verify_installed(&cert.thumbprint(), StoreScope::UserOnly)?);

        let outcome = installer.install_certificate(cert, StoreScope::UserOnly)?;
        let stored = temp_dir
            .path()
            .join("user")
            .join(format!("{}.crt", outcome.thumbprint()));
        assert_eq!(&PublicCertificate::from_path(&stored)?, cert);

        assert!(installer.verify_installed(&cert.thumbprint(), StoreScope::UserOnly)?);
        assert!(!installer.verify_installed(&cert.thumbprint(), StoreScope::MachineWide)?);

        // Installing twice replaces the entry.
        installer.install_certificate(cert, StoreScope::UserOnly)?;
        assert_eq!(std::fs::read_dir(temp_dir.path().join("user"))?.count(), 1);

        Ok(())
    }

    #[test]
    fn directory_store_writability_has_no_side_effects() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let machine = temp_dir.path().join("not").join("yet");
        let store = DirectoryTrustStore::with_roots(&machine, temp_dir.path().join("user"));

        assert!(store.can_write(StoreScope::MachineWide));
        assert!(store.can_write(StoreScope::UserOnly));
        assert!(!temp_dir.path().join("not").exists());
        assert!(!temp_dir.path().join("user").exists());
        assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 0);

        Ok(())
    }

    #[test]
    fn machine_store_is_not_a_tls_bundle_source() {
        let root = Path::new(MACHINE_DIRECTORY_STORE);

        for bundle_source in [
            "/usr/local/share/ca-certificates",
            "/usr/share/ca-certificates",
            "/etc/ssl",
        ] {
            assert!(!root.starts_with(bundle_source), "{}", bundle_source);
        }
    }

    #[test]
    fn scope_parsing() -> anyhow::Result<()> {
        assert_eq!(StoreScope::from_str("machine")?, StoreScope::MachineWide);
        assert_eq!(StoreScope::from_str("user")?, StoreScope::UserOnly);
        assert_eq!(StoreScope::UserOnly.to_string(), "user");
        assert!(StoreScope::from_str("global").is_err());

        Ok(())
    }

    #[cfg(windows)]
    #[test]
    fn certutil_store_lookup() -> anyhow::Result<()> {
        let store = CertutilTrustStore::new()?;
        let thumbprint = TEST_IDENTITY.certificate().thumbprint();

        // Never modify the real store from tests. Lookups are harmless.
        assert!(store.find(&thumbprint, StoreScope::UserOnly)?.is_none());

        Ok(())
    }
}
