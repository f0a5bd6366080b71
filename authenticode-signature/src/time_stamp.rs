// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-Stamp Protocol (TSP) / RFC 3161 client.

use {
    crate::asn1::{
        der_content, oid, parse_generalized_time, read_algorithm_oid, skip_remaining,
        write_sha256_algorithm, OID_CONTENT_TYPE_TST_INFO, OID_SHA256, TAG_INTEGER,
    },
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::{CmsError, SignedData},
    ring::rand::SecureRandom,
    sha2::Digest,
    std::time::Duration,
    thiserror::Error,
    yasna::{ASN1Error, ASN1ErrorKind},
};

pub const HTTP_CONTENT_TYPE_REQUEST: &str = "application/timestamp-query";

pub const HTTP_CONTENT_TYPE_RESPONSE: &str = "application/timestamp-reply";

#[derive(Debug, Error)]
pub enum TimeStampError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("ASN.1 decode error: {0}")]
    Asn1Decode(#[from] ASN1Error),

    #[error("{0}")]
    Http(String),

    #[error("error generating random nonce")]
    Random,

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("unsuccessful Time-Stamp Protocol response: status {0}")]
    Unsuccessful(i64),

    #[error("bad server response: {0}")]
    BadResponse(&'static str),

    #[error("invalid time-stamp token: {0}")]
    BadToken(&'static str),

    #[error("time-stamp token signature: {0}")]
    Cms(#[from] CmsError),
}

/// An RFC 3161 `TimeStampReq` over a SHA-256 message imprint.
#[derive(Clone, Debug)]
pub struct TimeStampRequest {
    message_imprint: Vec<u8>,
    nonce: u64,
}

impl TimeStampRequest {
    /// Construct a request for a message, hashing it with SHA-256.
    ///
    /// A random nonce is generated for every request.
    pub fn for_message(message: &[u8]) -> Result<Self, TimeStampError> {
        let mut random = [0u8; 8];
        ring::rand::SystemRandom::new()
            .fill(&mut random)
            .map_err(|_| TimeStampError::Random)?;

        Ok(Self {
            message_imprint: sha2::Sha256::digest(message).to_vec(),
            nonce: u64::from_le_bytes(random),
        })
    }

    pub fn message_imprint(&self) -> &[u8] {
        &self.message_imprint
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// DER encoding of the nonce `INTEGER`, as it should be echoed back.
    pub fn nonce_der(&self) -> Vec<u8> {
        yasna::construct_der(|writer| writer.write_u64(self.nonce))
    }

    pub fn encode_der(&self) -> Vec<u8> {
        yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_i64(1);
                writer.next().write_sequence(|writer| {
                    write_sha256_algorithm(writer.next());
                    writer.next().write_bytes(&self.message_imprint);
                });
                writer.next().write_u64(self.nonce);
                writer.next().write_bool(true);
            })
        })
    }
}

/// The fields of a `TSTInfo` we care about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TstInfo {
    pub policy: Vec<u64>,
    pub hash_algorithm: Vec<u64>,
    pub message_imprint: Vec<u8>,
    /// Encoded serial number `INTEGER`.
    pub serial_number: Vec<u8>,
    pub gen_time: DateTime<Utc>,
    /// Encoded nonce `INTEGER`, if present.
    pub nonce: Option<Vec<u8>>,
}

/// A time-stamp token: a `ContentInfo` wrapping `SignedData` over a `TSTInfo`.
///
/// Construction verifies every `SignerInfo` of the token against the
/// certificates it embeds. The authority's certificate itself is not
/// validated.
#[derive(Clone, Debug)]
pub struct TimeStampToken {
    der: Vec<u8>,
    info: TstInfo,
}

impl TimeStampToken {
    /// Parse a token from its encoded `ContentInfo` and verify its signature.
    pub fn from_der(data: &[u8]) -> Result<Self, TimeStampError> {
        let signed_data = SignedData::parse_ber(data)?;

        let mut signers = signed_data.signers().peekable();
        if signers.peek().is_none() {
            return Err(TimeStampError::BadToken("token has no signers"));
        }

        let tst_info_content_type = oid_content(OID_CONTENT_TYPE_TST_INFO);

        for signer in signers {
            let content_type: &[u8] = signer
                .signed_attributes()
                .ok_or(TimeStampError::BadToken("signer has no signed attributes"))?
                .content_type()
                .as_ref();
            if content_type != tst_info_content_type.as_slice() {
                return Err(TimeStampError::BadToken("signed content is not a TSTInfo"));
            }

            signer.verify_signature_with_signed_data(&signed_data)?;
            signer.verify_message_digest_with_signed_data(&signed_data)?;
        }

        let info = parse_tst_info(
            signed_data
                .signed_content()
                .ok_or(TimeStampError::BadToken("token has no TSTInfo"))?,
        )?;

        Ok(Self {
            der: data.to_vec(),
            info,
        })
    }

    /// The encoded `ContentInfo`.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn info(&self) -> &TstInfo {
        &self.info
    }

    pub fn gen_time(&self) -> DateTime<Utc> {
        self.info.gen_time
    }

    pub fn message_imprint(&self) -> &[u8] {
        &self.info.message_imprint
    }

    /// Whether this token vouches for `message`.
    ///
    /// Only the SHA-256 imprint is compared.
    pub fn covers_message(&self, message: &[u8]) -> bool {
        self.info.hash_algorithm == OID_SHA256
            && self.info.message_imprint == sha2::Sha256::digest(message).as_slice()
    }
}

/// Content octets of an encoded `OBJECT IDENTIFIER`.
fn oid_content(components: &[u64]) -> Vec<u8> {
    let der = yasna::construct_der(|writer| writer.write_oid(&oid(components)));
    der_content(&der).map(|content| content.to_vec()).unwrap_or_default()
}

fn parse_tst_info(data: &[u8]) -> Result<TstInfo, ASN1Error> {
    yasna::parse_ber(data, |reader| {
        reader.read_sequence(|reader| {
            let version = reader.next().read_i64()?;
            if version != 1 {
                return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
            }

            let policy = reader.next().read_oid()?.components().to_vec();

            let (hash_algorithm, message_imprint) = reader.next().read_sequence(|reader| {
                let algorithm = read_algorithm_oid(reader.next())?;
                let digest = reader.next().read_bytes()?;
                Ok((algorithm, digest))
            })?;

            let serial_number = reader.next().read_der()?;

            let gen_time = parse_generalized_time(&reader.next().read_der()?)
                .ok_or_else(|| ASN1Error::new(ASN1ErrorKind::Invalid))?;

            // accuracy, ordering, nonce, tsa and extensions are all optional
            // and distinguishable by tag.
            let mut nonce = None;
            while let Some(element) = reader.read_optional(|reader| reader.read_der())? {
                if nonce.is_none() && element.first() == Some(&TAG_INTEGER) {
                    nonce = Some(element);
                }
            }

            Ok(TstInfo {
                policy,
                hash_algorithm,
                message_imprint,
                serial_number,
                gen_time,
                nonce,
            })
        })
    })
}

/// Parse an encoded `TimeStampResp` answering `request`.
///
/// The response must be granted, carry a token and echo the request's
/// imprint and nonce.
pub fn parse_time_stamp_response(
    data: &[u8],
    request: &TimeStampRequest,
) -> Result<TimeStampToken, TimeStampError> {
    let (status, token) = yasna::parse_ber(data, |reader| {
        reader.read_sequence(|reader| {
            let status = reader.next().read_sequence(|reader| {
                let status = reader.next().read_i64()?;
                // statusString and failInfo.
                skip_remaining(reader)?;
                Ok(status)
            })?;

            let token = reader.read_optional(|reader| reader.read_der())?;

            Ok((status, token))
        })
    })?;

    // granted and grantedWithMods.
    if !matches!(status, 0 | 1) {
        return Err(TimeStampError::Unsuccessful(status));
    }

    let token = TimeStampToken::from_der(
        &token.ok_or(TimeStampError::BadResponse("granted response has no token"))?,
    )?;

    if token.message_imprint() != request.message_imprint() {
        return Err(TimeStampError::BadResponse(
            "token message imprint does not match request",
        ));
    }

    if token.info().nonce.as_deref() != Some(request.nonce_der().as_slice()) {
        return Err(TimeStampError::NonceMismatch);
    }

    Ok(token)
}

/// Something able to obtain a time-stamp token from an authority.
pub trait TimeStampClient {
    /// Submit `request` to the authority at `url`.
    fn time_stamp(
        &self,
        url: &str,
        request: &TimeStampRequest,
    ) -> Result<TimeStampToken, TimeStampError>;
}

/// A [TimeStampClient] speaking RFC 3161 over HTTP.
#[derive(Clone, Debug)]
pub struct HttpTimeStampClient {
    timeout: Duration,
}

impl Default for HttpTimeStampClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpTimeStampClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TimeStampClient for HttpTimeStampClient {
    fn time_stamp(
        &self,
        url: &str,
        request: &TimeStampRequest,
    ) -> Result<TimeStampToken, TimeStampError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;

        log::debug!("requesting time-stamp token from {}", url);
        let response = client
            .post(url)
            .header("Content-Type", HTTP_CONTENT_TYPE_REQUEST)
            .body(request.encode_der())
            .send()?;

        if response.status().is_success()
            && response.headers().get("Content-Type")
                == Some(&reqwest::header::HeaderValue::from_static(
                    HTTP_CONTENT_TYPE_RESPONSE,
                ))
        {
            let response_bytes = response.bytes()?;

            parse_time_stamp_response(response_bytes.as_ref(), request)
        } else {
            Err(TimeStampError::Http(format!(
                "bad HTTP response from {}: {}",
                url,
                response.status()
            )))
        }
    }
}
