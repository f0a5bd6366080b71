// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{export_private_archive, generate, signing::sign_image, Identity},
    authenticode_signature::{
        testutil::FakeTimeStampClient, AuthenticodeError, TimeStampClient, TimeStampRequest,
    },
    chrono::{DateTime, Utc},
    once_cell::sync::Lazy,
    std::path::{Path, PathBuf},
};

pub const TEST_PASSWORD: &str = "P@ss1";

/// RSA key generation is slow in debug builds. Share one identity.
pub static TEST_IDENTITY: Lazy<Identity> = Lazy::new(|| {
    generate("Test App", "Test Org", 1825).expect("unable to generate test identity")
});

/// Write the shared identity as a private archive under `dir`.
pub fn write_test_archive(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("identity.pfx");
    export_private_archive(&TEST_IDENTITY, TEST_PASSWORD, &path)?;

    Ok(path)
}

/// Write a synthetic PE image of `section_size` bytes under `dir`.
pub fn write_test_executable(dir: &Path, section_size: usize) -> anyhow::Result<PathBuf> {
    let path = dir.join("app.exe");
    std::fs::write(
        &path,
        authenticode_signature::testutil::synthetic_pe_image(section_size),
    )?;

    Ok(path)
}

/// Sign an in-memory image with the shared identity.
///
/// With `gen_time`, a token from a fake authority is attached.
pub fn sign_test_image(image: &[u8], gen_time: Option<DateTime<Utc>>) -> anyhow::Result<Vec<u8>> {
    Ok(sign_image(
        image,
        &TEST_IDENTITY,
        Some("Test App"),
        |signature| match gen_time {
            Some(gen_time) => {
                let request =
                    TimeStampRequest::for_message(signature).map_err(AuthenticodeError::from)?;
                let token = FakeTimeStampClient::new(gen_time)
                    .time_stamp("http://tsa.test", &request)
                    .map_err(AuthenticodeError::from)?;

                Ok(Some(token.der().to_vec()))
            }
            None => Ok(None),
        },
    )?)
}

/// Sign an in-memory image with the shared identity, attaching the token
/// `token` encodes for the signature value.
pub fn sign_test_image_with(
    image: &[u8],
    token: impl FnOnce(&[u8]) -> Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    Ok(sign_image(image, &TEST_IDENTITY, Some("Test App"), |signature| {
        Ok(Some(token(signature)))
    })?)
}
