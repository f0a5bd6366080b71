// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Self-signed publisher trust for Windows executables.

This crate manages the life of a self-signed code signing identity:

1. [generate] an RSA key and a self-signed certificate with code signing
   extensions.
2. Export it as a password protected PKCS #12 archive
   ([export_private_archive]) and as a public certificate for distribution
   ([export_public_certificate]).
3. Sign PE executables with Authenticode and an RFC 3161 time-stamp
   ([ExecutableSigner], [AuthenticodeSigner], [SigntoolSigner]).
4. Verify signed executables ([SignatureVerifier]).
5. Install the public certificate into a trusted publisher store and confirm
   the installation ([TrustStoreInstaller]).

Stores are abstracted behind [TrustStore] so everything above can be
exercised against [MemoryTrustStore]. [SigningPlatform] picks the signer
and store variants for the running host.
*/

mod certificate;
mod error;
mod export;
mod identity;
mod platform;
mod process;
mod settings;
mod signing;
mod signtool;
mod trust_store;
mod verify;

#[cfg(test)]
mod testutil;

pub use {
    certificate::{PublicCertificate, Thumbprint},
    error::{InstallErrorKind, PublisherTrustError},
    export::{
        export_private_archive, export_public_certificate, identity_from_pfx, identity_to_pfx,
        read_private_archive, PublicCertificateFormat,
    },
    identity::{generate, generate_identity, Identity, SigningKey, RSA_KEY_BITS},
    platform::SigningPlatform,
    settings::{
        GenerationSettings, InstallSettings, SecretSource, SigningSettings,
        DEFAULT_TIMESTAMP_URL, DEFAULT_VALIDITY_DAYS, PASSWORD_ENV,
    },
    signing::{AuthenticodeSigner, ExecutableSigner, SignatureResult, SignatureStatus},
    signtool::{find_signtool, signtool_sign_args, SigntoolSigner},
    trust_store::{
        CertutilTrustStore, DirectoryTrustStore, InstallOutcome, MemoryTrustStore, StoreScope,
        TrustStore, TrustStoreEntry, TrustStoreInstaller,
    },
    verify::{SignatureVerifier, VerificationResult, VerificationStatus},
};
