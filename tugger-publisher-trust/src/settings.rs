// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Configuration of the individual operations. */

use {
    crate::PublisherTrustError,
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
    zeroize::Zeroizing,
};

/// Time-stamp authority used when none is configured.
pub const DEFAULT_TIMESTAMP_URL: &str = "http://timestamp.digicert.com";

/// Default validity of generated certificates: 5 years.
pub const DEFAULT_VALIDITY_DAYS: u32 = 1825;

/// Environment variable consulted for the archive password.
pub const PASSWORD_ENV: &str = "PUBLISHER_TRUST_PASSWORD";

/// Parameters for generating an identity.
#[derive(Clone, Debug)]
pub struct GenerationSettings {
    subject_name: String,
    publisher_name: String,
    validity_days: u32,
}

impl GenerationSettings {
    pub fn new(subject_name: impl ToString, publisher_name: impl ToString) -> Self {
        Self {
            subject_name: subject_name.to_string(),
            publisher_name: publisher_name.to_string(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    /// The product name. Becomes the certificate's common name.
    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    /// Becomes the certificate's organization.
    pub fn publisher_name(&self) -> &str {
        &self.publisher_name
    }

    pub fn validity_days(&self) -> u32 {
        self.validity_days
    }

    pub fn set_validity_days(&mut self, days: u32) -> &mut Self {
        self.validity_days = days;
        self
    }

    pub fn validate(&self) -> Result<(), PublisherTrustError> {
        if self.subject_name.trim().is_empty() {
            Err(PublisherTrustError::Generation(
                "subject name must not be empty".into(),
            ))
        } else if self.publisher_name.trim().is_empty() {
            Err(PublisherTrustError::Generation(
                "publisher name must not be empty".into(),
            ))
        } else if self.validity_days == 0 {
            Err(PublisherTrustError::Generation(
                "validity must be at least one day".into(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Parameters for signing an executable.
#[derive(Clone, Debug)]
pub struct SigningSettings {
    timestamp_url: String,
    timestamp_timeout: Duration,
    timestamp_attempts: usize,
    description: Option<String>,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            timestamp_url: DEFAULT_TIMESTAMP_URL.to_string(),
            timestamp_timeout: Duration::from_secs(30),
            timestamp_attempts: 2,
            description: None,
        }
    }
}

impl SigningSettings {
    pub fn timestamp_url(&self) -> &str {
        &self.timestamp_url
    }

    /// Set the RFC 3161 time-stamp authority to contact.
    pub fn set_timestamp_url(&mut self, url: impl ToString) -> &mut Self {
        self.timestamp_url = url.to_string();
        self
    }

    pub fn timestamp_timeout(&self) -> Duration {
        self.timestamp_timeout
    }

    pub fn set_timestamp_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timestamp_timeout = timeout;
        self
    }

    /// How many requests are made before giving up on the authority.
    pub fn timestamp_attempts(&self) -> usize {
        self.timestamp_attempts
    }

    /// Set the number of requests made to the authority.
    ///
    /// Values above 2 are clamped: a failing authority is retried at most once.
    pub fn set_timestamp_attempts(&mut self, attempts: usize) -> &mut Self {
        self.timestamp_attempts = attempts.clamp(1, 2);
        self
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Set the program description embedded in the signature.
    pub fn set_description(&mut self, description: impl ToString) -> &mut Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Policy knobs for installing certificates into a trust store.
#[derive(Clone, Copy, Debug)]
pub struct InstallSettings {
    allow_degrade: bool,
    strict_expiry: bool,
    allow_expired: bool,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            allow_degrade: true,
            strict_expiry: false,
            allow_expired: false,
        }
    }
}

impl InstallSettings {
    /// Whether a machine-wide install may fall back to the user scope.
    pub fn allow_degrade(&self) -> bool {
        self.allow_degrade
    }

    pub fn set_allow_degrade(&mut self, value: bool) -> &mut Self {
        self.allow_degrade = value;
        self
    }

    /// Whether expired certificates are refused rather than warned about.
    pub fn strict_expiry(&self) -> bool {
        self.strict_expiry
    }

    pub fn set_strict_expiry(&mut self, value: bool) -> &mut Self {
        self.strict_expiry = value;
        self
    }

    /// Explicit confirmation to install an expired certificate in strict mode.
    pub fn allow_expired(&self) -> bool {
        self.allow_expired
    }

    pub fn set_allow_expired(&mut self, value: bool) -> &mut Self {
        self.allow_expired = value;
        self
    }
}

/// Where the private archive password comes from.
#[derive(Clone)]
pub enum SecretSource {
    /// Given directly, e.g. on the command line.
    Value(Zeroizing<String>),
    /// Read from an environment variable.
    Environment(String),
    /// First line of a file.
    File(PathBuf),
}

impl std::fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Value(<redacted>)"),
            Self::Environment(name) => f.debug_tuple("Environment").field(name).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

impl SecretSource {
    pub fn value(value: impl ToString) -> Self {
        Self::Value(Zeroizing::new(value.to_string()))
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    /// Resolve the secret.
    pub fn resolve(&self) -> Result<Zeroizing<String>, PublisherTrustError> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::Environment(name) => std::env::var(name).map(Zeroizing::new).map_err(|_| {
                PublisherTrustError::BadArgument(format!("environment variable {} is not set", name))
            }),
            Self::File(path) => {
                let data = Zeroizing::new(std::fs::read_to_string(path)?);
                let line = data.lines().next().unwrap_or_default();

                Ok(Zeroizing::new(line.to_string()))
            }
        }
    }
}
