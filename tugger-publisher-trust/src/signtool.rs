// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing through `signtool.exe`. */

use {
    crate::{
        process::run_logged,
        read_private_archive,
        signing::{check_signable, replace_if_verified, sibling_temp_file},
        ExecutableSigner, PublisherTrustError, SignatureResult, SigningSettings,
    },
    log::{info, warn},
    std::{
        ffi::OsString,
        path::{Path, PathBuf},
    },
};

/// Environment variable pointing at a specific `signtool.exe`.
pub const SIGNTOOL_ENV: &str = "SIGNTOOL";

/// Locate `signtool.exe`.
///
/// `SIGNTOOL` takes precedence over `PATH`.
pub fn find_signtool() -> Result<PathBuf, PublisherTrustError> {
    if let Some(path) = std::env::var_os(SIGNTOOL_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!(
            "{} points at {}, which does not exist",
            SIGNTOOL_ENV,
            path.display()
        );
    }

    which::which("signtool").map_err(|e| {
        PublisherTrustError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!(
                "unable to locate signtool.exe ({}); install the Windows SDK or set {}",
                e, SIGNTOOL_ENV
            ),
        ))
    })
}

/// Arguments to `signtool` for signing `file` with a PFX archive.
///
/// The password ends up on the command line, where other local users may
/// observe it. Prefer [crate::AuthenticodeSigner] where that matters.
pub fn signtool_sign_args(
    private_archive: &Path,
    password: &str,
    settings: &SigningSettings,
    file: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "sign".into(),
        "/f".into(),
        private_archive.as_os_str().to_os_string(),
        "/p".into(),
        password.into(),
        "/fd".into(),
        "sha256".into(),
        "/tr".into(),
        settings.timestamp_url().into(),
        "/td".into(),
        "sha256".into(),
    ];

    if let Some(description) = settings.description() {
        args.push("/d".into());
        args.push(description.into());
    }

    args.push(file.as_os_str().to_os_string());

    args
}

/// An [ExecutableSigner] driving `signtool sign`.
#[derive(Clone, Debug)]
pub struct SigntoolSigner {
    signtool: PathBuf,
}

impl SigntoolSigner {
    pub fn new() -> Result<Self, PublisherTrustError> {
        Ok(Self::with_path(find_signtool()?))
    }

    pub fn with_path(signtool: impl AsRef<Path>) -> Self {
        Self {
            signtool: signtool.as_ref().to_path_buf(),
        }
    }
}

impl ExecutableSigner for SigntoolSigner {
    fn name(&self) -> &'static str {
        "signtool"
    }

    fn sign(
        &self,
        executable: &Path,
        private_archive: &Path,
        password: &str,
        settings: &SigningSettings,
    ) -> Result<SignatureResult, PublisherTrustError> {
        check_signable(executable)?;

        // Unlocking here reports a bad password as such rather than as a
        // generic signtool failure. The certificate is needed for the
        // self-check anyway.
        let identity = read_private_archive(private_archive, password)?;
        let certificate = identity.certificate().clone();
        drop(identity);

        let temp = sibling_temp_file(executable)?;
        std::fs::copy(executable, temp.path())?;

        let args = signtool_sign_args(private_archive, password, settings, temp.path());
        let attempts = settings.timestamp_attempts();

        let mut last_output = vec![];
        let mut signed = false;
        for attempt in 1..=attempts {
            info!(
                "running signtool on {} (attempt {} of {})",
                executable.display(),
                attempt,
                attempts
            );

            let output = run_logged(&self.signtool, &args, &[password])?;
            if output.success {
                signed = true;
                break;
            }

            let timestamp_failure = output
                .lines
                .iter()
                .any(|line| line.to_lowercase().contains("timestamp"));
            last_output = output.lines;

            if !timestamp_failure {
                return Err(PublisherTrustError::Format(format!(
                    "signtool failed: {}",
                    last_output.last().map(|s| s.as_str()).unwrap_or("no output")
                )));
            }
            if attempt < attempts {
                warn!("signtool could not obtain a time-stamp; retrying");
            }
        }

        if !signed {
            return Err(PublisherTrustError::TimestampUnavailable {
                url: settings.timestamp_url().to_string(),
                attempts,
                reason: last_output
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "signtool failed".to_string()),
            });
        }

        replace_if_verified(executable, temp, &certificate)
    }
}
