// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures for exercising signing without a real toolchain or network.

use {
    crate::{
        asn1::{
            der_generalized_time, der_set_of, der_tlv, oid, write_sha256_algorithm,
            OID_CONTENT_TYPE, OID_CONTENT_TYPE_TST_INFO, OID_ECDSA_WITH_SHA256,
            OID_MESSAGE_DIGEST, OID_SIGNED_DATA,
        },
        parse_time_stamp_response,
        signed_data::encode_attribute,
        SignerIdentifier, TimeStampClient, TimeStampError, TimeStampRequest, TimeStampToken,
    },
    chrono::{DateTime, Utc},
    once_cell::sync::Lazy,
    ring::{
        rand::SystemRandom,
        signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING},
    },
    scroll::{Pwrite, LE},
    sha2::Digest,
    std::cell::Cell,
    yasna::Tag,
};

const PE_HEADER_OFFSET: usize = 0x80;
const SIZE_OF_HEADERS: usize = 0x400;
const DOS_STUB_MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";

fn write_pe_headers(data: &mut [u8], section_size: usize) -> Result<(), scroll::Error> {
    data[0..2].copy_from_slice(b"MZ");
    data.pwrite_with::<u32>(PE_HEADER_OFFSET as u32, 0x3c, LE)?;
    data[0x4e..0x4e + DOS_STUB_MESSAGE.len()].copy_from_slice(DOS_STUB_MESSAGE);

    data[PE_HEADER_OFFSET..PE_HEADER_OFFSET + 4].copy_from_slice(b"PE\0\0");

    // COFF file header: x86-64, one section, 240 byte optional header.
    let coff = PE_HEADER_OFFSET + 4;
    data.pwrite_with::<u16>(0x8664, coff, LE)?;
    data.pwrite_with::<u16>(1, coff + 2, LE)?;
    data.pwrite_with::<u16>(240, coff + 16, LE)?;
    data.pwrite_with::<u16>(0x0022, coff + 18, LE)?;

    // PE32+ optional header.
    let optional = coff + 20;
    data.pwrite_with::<u16>(0x20b, optional, LE)?;
    data.pwrite_with::<u32>(section_size as u32, optional + 4, LE)?;
    data.pwrite_with::<u32>(0x1000, optional + 16, LE)?;
    data.pwrite_with::<u32>(0x1000, optional + 20, LE)?;
    data.pwrite_with::<u64>(0x1_4000_0000, optional + 24, LE)?;
    data.pwrite_with::<u32>(0x1000, optional + 32, LE)?;
    data.pwrite_with::<u32>(0x200, optional + 36, LE)?;
    data.pwrite_with::<u16>(6, optional + 40, LE)?;
    data.pwrite_with::<u16>(6, optional + 48, LE)?;
    let size_of_image = 0x1000 + (section_size + 0xfff) / 0x1000 * 0x1000;
    data.pwrite_with::<u32>(size_of_image as u32, optional + 56, LE)?;
    data.pwrite_with::<u32>(SIZE_OF_HEADERS as u32, optional + 60, LE)?;
    // Windows GUI subsystem.
    data.pwrite_with::<u16>(2, optional + 68, LE)?;
    data.pwrite_with::<u16>(0x8160, optional + 70, LE)?;
    data.pwrite_with::<u64>(0x10_0000, optional + 72, LE)?;
    data.pwrite_with::<u64>(0x1000, optional + 80, LE)?;
    data.pwrite_with::<u64>(0x10_0000, optional + 88, LE)?;
    data.pwrite_with::<u64>(0x1000, optional + 96, LE)?;
    data.pwrite_with::<u32>(16, optional + 108, LE)?;

    let section = optional + 240;
    data[section..section + 8].copy_from_slice(b".text\0\0\0");
    data.pwrite_with::<u32>(section_size as u32, section + 8, LE)?;
    data.pwrite_with::<u32>(0x1000, section + 12, LE)?;
    data.pwrite_with::<u32>(section_size as u32, section + 16, LE)?;
    data.pwrite_with::<u32>(SIZE_OF_HEADERS as u32, section + 20, LE)?;
    data.pwrite_with::<u32>(0x6000_0020, section + 36, LE)?;

    Ok(())
}

/// Produce a minimal, well formed, unsigned PE32+ image.
///
/// The single section holds `section_size` bytes of deterministic filler
/// following 1 KiB of headers.
pub fn synthetic_pe_image(section_size: usize) -> Vec<u8> {
    let mut data = vec![0u8; SIZE_OF_HEADERS + section_size];

    write_pe_headers(&mut data, section_size).expect("headers fit in the image");

    for (i, b) in data[SIZE_OF_HEADERS..].iter_mut().enumerate() {
        *b = (i.wrapping_mul(31) ^ (i >> 7)) as u8;
    }

    data
}

/// A self-signed P-256 time-stamp authority.
struct TestAuthority {
    certificate: Vec<u8>,
    pkcs8: Vec<u8>,
}

impl TestAuthority {
    fn generate() -> Result<Self, rcgen::RcgenError> {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new());
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.serial_number = Some(0x75a);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test Time-Stamp Authority");
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::TimeStamping];

        let certificate = rcgen::Certificate::from_params(params)?;

        Ok(Self {
            certificate: certificate.serialize_der()?,
            pkcs8: certificate.serialize_private_key_der(),
        })
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.pkcs8)
            .expect("rcgen emits a valid PKCS#8 document");

        key.sign(&SystemRandom::new(), message)
            .expect("ECDSA signing succeeds")
            .as_ref()
            .to_vec()
    }
}

static AUTHORITY: Lazy<TestAuthority> =
    Lazy::new(|| TestAuthority::generate().expect("generating time-stamp authority"));

fn encode_tst_info(
    gen_time: &DateTime<Utc>,
    message_imprint: &[u8],
    nonce_der: Option<&[u8]>,
) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_i64(1);
            writer
                .next()
                .write_oid(&oid(&[1, 3, 6, 1, 4, 1, 4146, 2, 3]));
            writer.next().write_sequence(|writer| {
                write_sha256_algorithm(writer.next());
                writer.next().write_bytes(message_imprint);
            });
            writer.next().write_u64(0x5eed);
            writer.next().write_der(&der_generalized_time(gen_time));
            if let Some(nonce) = nonce_der {
                writer.next().write_der(nonce);
            }
        })
    })
}

/// Wrap `tst_info` in a `ContentInfo`, signed by the test authority.
///
/// The `message-digest` attribute is computed over `digested`, which callers
/// pass as `tst_info` unless they want a token that fails verification.
fn encode_token(tst_info: &[u8], digested: &[u8], signed: bool) -> Vec<u8> {
    let authority = &*AUTHORITY;
    let signer = SignerIdentifier::from_certificate(&authority.certificate)
        .expect("rcgen emits a parseable certificate");

    let content_type = yasna::construct_der(|writer| {
        writer.write_oid(&oid(OID_CONTENT_TYPE_TST_INFO));
    });
    let message_digest = yasna::construct_der(|writer| {
        writer.write_bytes(&sha2::Sha256::digest(digested));
    });
    let signed_attributes = der_set_of(vec![
        encode_attribute(OID_CONTENT_TYPE, &content_type),
        encode_attribute(OID_MESSAGE_DIGEST, &message_digest),
    ]);
    let signature = authority.sign(&signed_attributes);

    let mut implicit_attributes = signed_attributes;
    implicit_attributes[0] = 0xa0;

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_oid(&oid(OID_SIGNED_DATA));
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_i64(3);
                    writer.next().write_set_of(|writer| {
                        write_sha256_algorithm(writer.next());
                    });
                    writer.next().write_sequence(|writer| {
                        writer.next().write_oid(&oid(OID_CONTENT_TYPE_TST_INFO));
                        writer.next().write_tagged(Tag::context(0), |writer| {
                            writer.write_bytes(tst_info);
                        });
                    });
                    writer
                        .next()
                        .write_der(&der_tlv(0xa0, &authority.certificate));
                    writer.next().write_set_of(|writer| {
                        if !signed {
                            return;
                        }

                        writer.next().write_sequence(|writer| {
                            writer.next().write_i64(1);
                            signer.write(writer.next());
                            write_sha256_algorithm(writer.next());
                            writer.next().write_der(&implicit_attributes);
                            writer.next().write_sequence(|writer| {
                                writer.next().write_oid(&oid(OID_ECDSA_WITH_SHA256));
                            });
                            writer.next().write_bytes(&signature);
                        });
                    });
                })
            });
        })
    })
}

/// Encode a `ContentInfo` time-stamp token over `message_imprint`.
///
/// The token is signed by a P-256 authority generated once per process and
/// embeds its certificate.
pub fn encode_time_stamp_token(
    gen_time: &DateTime<Utc>,
    message_imprint: &[u8],
    nonce_der: Option<&[u8]>,
) -> Vec<u8> {
    let tst_info = encode_tst_info(gen_time, message_imprint, nonce_der);

    encode_token(&tst_info, &tst_info, true)
}

/// A token whose `TSTInfo` was rewritten after the authority signed it.
///
/// The signature and `message-digest` cover a `TSTInfo` generated now;
/// the embedded one claims `gen_time`.
pub fn encode_forged_time_stamp_token(
    gen_time: &DateTime<Utc>,
    message_imprint: &[u8],
    nonce_der: Option<&[u8]>,
) -> Vec<u8> {
    let genuine = encode_tst_info(&Utc::now(), message_imprint, nonce_der);
    let forged = encode_tst_info(gen_time, message_imprint, nonce_der);

    encode_token(&forged, &genuine, true)
}

/// A token whose `SignedData` carries no `SignerInfo`.
pub fn encode_unsigned_time_stamp_token(
    gen_time: &DateTime<Utc>,
    message_imprint: &[u8],
    nonce_der: Option<&[u8]>,
) -> Vec<u8> {
    let tst_info = encode_tst_info(gen_time, message_imprint, nonce_der);

    encode_token(&tst_info, &tst_info, false)
}

/// Wrap a token in a granted `TimeStampResp`.
pub fn encode_granted_response(token: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer.next().write_i64(0);
            });
            writer.next().write_der(token);
        })
    })
}

/// An in-process time-stamp authority.
///
/// It can be told to fail a number of times before answering, which is how
/// unreachable authorities are simulated.
#[derive(Debug)]
pub struct FakeTimeStampClient {
    gen_time: DateTime<Utc>,
    failures_remaining: Cell<usize>,
    requests: Cell<usize>,
}

impl FakeTimeStampClient {
    pub fn new(gen_time: DateTime<Utc>) -> Self {
        Self::failing(gen_time, 0)
    }

    /// An authority that fails the first `failures` requests.
    pub fn failing(gen_time: DateTime<Utc>, failures: usize) -> Self {
        Self {
            gen_time,
            failures_remaining: Cell::new(failures),
            requests: Cell::new(0),
        }
    }

    /// An authority that never answers.
    pub fn unreachable() -> Self {
        Self::failing(Utc::now(), usize::MAX)
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.get()
    }
}

impl TimeStampClient for FakeTimeStampClient {
    fn time_stamp(
        &self,
        url: &str,
        request: &TimeStampRequest,
    ) -> Result<TimeStampToken, TimeStampError> {
        self.requests.set(self.requests.get() + 1);

        let failures = self.failures_remaining.get();
        if failures > 0 {
            self.failures_remaining.set(failures - 1);
            return Err(TimeStampError::Http(format!("{} is unreachable", url)));
        }

        let token = encode_time_stamp_token(
            &self.gen_time,
            request.message_imprint(),
            Some(&request.nonce_der()),
        );

        parse_time_stamp_response(&encode_granted_response(&token), request)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::PeImage};

    #[test]
    fn synthetic_image_parses() -> anyhow::Result<()> {
        for size in [0, 1, 4096, 10_003] {
            let data = synthetic_pe_image(size);
            assert_eq!(data.len(), SIZE_OF_HEADERS + size);
            let image = PeImage::parse(&data)?;
            assert!(image.is_pe32_plus());
        }

        Ok(())
    }

    #[test]
    fn fake_authority_fails_then_answers() -> anyhow::Result<()> {
        let client = FakeTimeStampClient::failing(Utc::now(), 1);
        let request = TimeStampRequest::for_message(b"sig")?;

        assert!(client.time_stamp("http://tsa.invalid", &request).is_err());
        let token = client.time_stamp("http://tsa.invalid", &request)?;
        assert!(token.covers_message(b"sig"));
        assert_eq!(client.request_count(), 2);

        Ok(())
    }
}
