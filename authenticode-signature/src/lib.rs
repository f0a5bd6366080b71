// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Authenticode signatures for PE images in pure Rust.

This crate implements the format-level pieces of Windows Authenticode:

* Locating the signable regions of a PE image and computing the
  Authenticode SHA-256 digest over them ([PeImage]).
* Building and parsing the PKCS #7 `SignedData` structure carrying an
  `SpcIndirectDataContent` ([SignedDataBuilder], [AuthenticodeSignature]).
* Embedding the signature in the attribute certificate table and fixing up
  the image checksum.
* Obtaining RFC 3161 time-stamp tokens over a signature
  ([TimeStampClient], [HttpTimeStampClient]) and verifying the authority's
  signature over them ([TimeStampToken]).

Time-stamp tokens are ordinary CMS `SignedData` and are handled by the
`cryptographic-message-syntax` crate. The Authenticode `SignedData` itself
encapsulates a `SEQUENCE` rather than an `OCTET STRING`, which that crate
does not model, so it is encoded and parsed here.

There is no private key handling here. Callers hand the bytes returned by
[SignedDataBuilder::signed_attributes] to whatever performs the RSA
operation and feed the signature value back.

# IMPORTANT SECURITY LIMITATIONS

Parsing a signature and confirming its digests only answers *do these bytes
match what was signed*. Deciding whether the signer is trusted (chain
building, trust anchors, expiry, revocation) is the caller's job.

A token is only accepted if its signers verify against the certificates
it embeds. The time-stamp authority's certificate is not chained to any
root, so a token proves which key vouched for a time, not that the key
belongs to a recognized authority.
*/

pub mod asn1;
mod pe;
mod signed_data;
mod time_stamp;

#[cfg(any(test, feature = "test"))]
pub mod testutil;

pub use {
    pe::{
        compute_checksum, find_trailing_certificate, is_file_signable, is_msi_header, is_signable_binary_header,
        CertificateTable, PeImage, WIN_CERT_REVISION_2_0, WIN_CERT_TYPE_PKCS_SIGNED_DATA,
    },
    signed_data::{AuthenticodeSignature, SignedDataBuilder, SignerIdentifier},
    time_stamp::{
        parse_time_stamp_response, HttpTimeStampClient, TimeStampClient, TimeStampError,
        TimeStampRequest, TimeStampToken, TstInfo, HTTP_CONTENT_TYPE_REQUEST,
        HTTP_CONTENT_TYPE_RESPONSE,
    },
};

use thiserror::Error;

/// Represents an error in this crate.
#[derive(Debug, Error)]
pub enum AuthenticodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a PE image: {0}")]
    NotPe(&'static str),

    #[error("signing {0} is not supported")]
    UnsupportedFormat(&'static str),

    #[error("corrupt attribute certificate table: {0}")]
    CorruptCertificateTable(&'static str),

    #[error("binary parsing error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("error reading ASN.1 data: {0}")]
    Asn1(#[from] yasna::ASN1Error),

    #[error("malformed Authenticode signature: {0}")]
    MalformedSignature(&'static str),

    #[error("unsupported digest algorithm: {0:?}")]
    UnsupportedDigestAlgorithm(Vec<u64>),

    #[error("time-stamp error: {0}")]
    TimeStamp(#[from] TimeStampError),
}
