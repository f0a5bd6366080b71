// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PKCS #7 `SignedData` as used by Authenticode.
//!
//! The encapsulated content is an `SpcIndirectDataContent` holding the
//! Authenticode digest of the image. A single `SignerInfo` signs a set of
//! authenticated attributes, one of which is the SHA-256 of that content.
//! An RFC 3161 time-stamp token over the signature value may be attached as
//! an unauthenticated attribute.

use {
    crate::{
        asn1::{
            bmp_string, decode_bmp_string, der_content, der_set_of, der_tlv, oid,
            read_algorithm_oid, skip_remaining, write_sha256_algorithm, OID_CONTENT_TYPE,
            OID_MESSAGE_DIGEST, OID_MS_RFC3161_COUNTER_SIGNATURE, OID_RSA_ENCRYPTION,
            OID_SHA256, OID_SIGNED_DATA, OID_SPC_INDIRECT_DATA,
            OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE, OID_SPC_PE_IMAGE_DATA, OID_SPC_SP_OPUS_INFO,
            OID_SPC_STATEMENT_TYPE,
        },
        AuthenticodeError, TimeStampError, TimeStampToken,
    },
    sha2::Digest,
    yasna::{ASN1Error, ASN1ErrorKind, ASN1Result, BERReaderSeq, Tag},
};

/// Identifies a certificate by issuer and serial number.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignerIdentifier {
    /// Encoded issuer `Name`.
    pub issuer: Vec<u8>,
    /// Encoded serial number `INTEGER`.
    pub serial_number: Vec<u8>,
}

impl SignerIdentifier {
    /// Extract the issuer and serial number of an X.509 certificate.
    pub fn from_certificate(certificate: &[u8]) -> Result<Self, AuthenticodeError> {
        Ok(yasna::parse_der(certificate, |reader| {
            reader.read_sequence(|reader| {
                let id = reader.next().read_sequence(|reader| {
                    reader.read_optional(|reader| {
                        reader.read_tagged(Tag::context(0), |reader| reader.read_der())
                    })?;
                    let serial_number = reader.next().read_der()?;
                    // signature algorithm
                    reader.next().read_der()?;
                    let issuer = reader.next().read_der()?;
                    skip_remaining(reader)?;

                    Ok(Self {
                        issuer,
                        serial_number,
                    })
                })?;
                skip_remaining(reader)?;

                Ok(id)
            })
        })?)
    }

    pub(crate) fn write(&self, writer: yasna::DERWriter) {
        writer.write_sequence(|writer| {
            writer.next().write_der(&self.issuer);
            writer.next().write_der(&self.serial_number);
        })
    }
}

pub(crate) fn encode_attribute(attribute_oid: &[u64], value: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_oid(&oid(attribute_oid));
            writer.next().write_der(&der_set_of(vec![value.to_vec()]));
        })
    })
}

fn encode_spc_indirect_data(image_digest: &[u8]) -> Vec<u8> {
    // SpcPeImageData { flags: includeResources (empty BIT STRING),
    //                  file: [0] { [2] { [0] IMPLICIT BMPString } } }
    let file_link = der_tlv(
        0xa0,
        &der_tlv(0xa2, &der_tlv(0x80, &bmp_string("<<<Obsolete>>>"))),
    );
    let pe_image_data = der_tlv(0x30, &[vec![0x03, 0x01, 0x00], file_link].concat());

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                writer.next().write_oid(&oid(OID_SPC_PE_IMAGE_DATA));
                writer.next().write_der(&pe_image_data);
            });
            writer.next().write_sequence(|writer| {
                write_sha256_algorithm(writer.next());
                writer.next().write_bytes(image_digest);
            });
        })
    })
}

/// Assembles an Authenticode `SignedData`.
///
/// Signing happens in two steps because the time-stamp token covers the
/// signature value. First obtain the bytes to sign with
/// [Self::signed_attributes]. Then pass the resulting signature, and
/// optionally a token, to [Self::build].
#[derive(Clone, Debug)]
pub struct SignedDataBuilder {
    spc_indirect_data: Vec<u8>,
    signer_certificate: Vec<u8>,
    signer: SignerIdentifier,
    certificates: Vec<Vec<u8>>,
    description: Option<String>,
}

impl SignedDataBuilder {
    /// Start a signature over an Authenticode image digest.
    pub fn new(image_digest: &[u8], signer_certificate: &[u8]) -> Result<Self, AuthenticodeError> {
        Ok(Self {
            spc_indirect_data: encode_spc_indirect_data(image_digest),
            signer: SignerIdentifier::from_certificate(signer_certificate)?,
            signer_certificate: signer_certificate.to_vec(),
            certificates: vec![],
            description: None,
        })
    }

    /// Set the program description shown to users.
    pub fn description(mut self, description: impl ToString) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Include an additional certificate, typically an intermediate.
    pub fn chain_certificate(mut self, certificate: &[u8]) -> Self {
        self.certificates.push(certificate.to_vec());
        self
    }

    fn attributes(&self) -> Vec<Vec<u8>> {
        let content_type = yasna::construct_der(|writer| {
            writer.write_oid(&oid(OID_SPC_INDIRECT_DATA));
        });

        let statement_type = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer
                    .next()
                    .write_oid(&oid(OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE));
            })
        });

        // SpcSpOpusInfo { programName [0] EXPLICIT SpcString OPTIONAL }
        let opus_info = match &self.description {
            Some(description) => der_tlv(
                0x30,
                &der_tlv(0xa0, &der_tlv(0x80, &bmp_string(description))),
            ),
            None => der_tlv(0x30, &[]),
        };

        let content_digest = sha2::Sha256::digest(
            der_content(&self.spc_indirect_data).unwrap_or(&self.spc_indirect_data),
        );
        let message_digest = yasna::construct_der(|writer| writer.write_bytes(&content_digest));

        vec![
            encode_attribute(OID_CONTENT_TYPE, &content_type),
            encode_attribute(OID_SPC_STATEMENT_TYPE, &statement_type),
            encode_attribute(OID_SPC_SP_OPUS_INFO, &opus_info),
            encode_attribute(OID_MESSAGE_DIGEST, &message_digest),
        ]
    }

    /// The DER `SET OF` authenticated attributes.
    ///
    /// This is the message the signer's RSA key must sign with
    /// PKCS #1 v1.5 and SHA-256.
    pub fn signed_attributes(&self) -> Vec<u8> {
        der_set_of(self.attributes())
    }

    /// Produce the encoded `ContentInfo`.
    pub fn build(&self, signature: &[u8], time_stamp_token: Option<&[u8]>) -> Vec<u8> {
        // [0] IMPLICIT SET OF Attribute
        let mut signed_attributes = self.signed_attributes();
        signed_attributes[0] = 0xa0;

        let unsigned_attributes = time_stamp_token.map(|token| {
            let mut set = der_set_of(vec![encode_attribute(
                OID_MS_RFC3161_COUNTER_SIGNATURE,
                token,
            )]);
            set[0] = 0xa1;
            set
        });

        let signer_info = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_i64(1);
                self.signer.write(writer.next());
                write_sha256_algorithm(writer.next());
                writer.next().write_der(&signed_attributes);
                writer.next().write_sequence(|writer| {
                    writer.next().write_oid(&oid(OID_RSA_ENCRYPTION));
                    writer.next().write_null();
                });
                writer.next().write_bytes(signature);
                if let Some(attributes) = &unsigned_attributes {
                    writer.next().write_der(attributes);
                }
            })
        });

        let mut certificates = vec![self.signer_certificate.clone()];
        certificates.extend(self.certificates.iter().cloned());
        let mut certificates = der_set_of(certificates);
        certificates[0] = 0xa0;

        let algorithm = yasna::construct_der(|writer| write_sha256_algorithm(writer));

        yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_oid(&oid(OID_SIGNED_DATA));
                writer.next().write_tagged(Tag::context(0), |writer| {
                    writer.write_sequence(|writer| {
                        writer.next().write_i64(1);
                        writer.next().write_der(&der_set_of(vec![algorithm.clone()]));
                        writer.next().write_sequence(|writer| {
                            writer.next().write_oid(&oid(OID_SPC_INDIRECT_DATA));
                            writer.next().write_tagged(Tag::context(0), |writer| {
                                writer.write_der(&self.spc_indirect_data);
                            });
                        });
                        writer.next().write_der(&certificates);
                        writer.next().write_der(&der_set_of(vec![signer_info.clone()]));
                    })
                });
            })
        })
    }
}

#[derive(Clone, Debug)]
struct Attribute {
    oid: Vec<u64>,
    values: Vec<Vec<u8>>,
}

fn read_attributes(reader: yasna::BERReader) -> ASN1Result<Vec<Attribute>> {
    let mut attributes = vec![];

    reader.read_set_of(|reader| {
        attributes.push(reader.read_sequence(|reader| {
            let oid = reader.next().read_oid()?.components().to_vec();
            let mut values = vec![];
            reader.next().read_set_of(|reader| {
                values.push(reader.read_der()?);
                Ok(())
            })?;

            Ok(Attribute { oid, values })
        })?);
        Ok(())
    })?;

    Ok(attributes)
}

#[derive(Clone, Debug)]
struct SignerInfo {
    signer: SignerIdentifier,
    digest_algorithm: Vec<u64>,
    signed_attributes: Vec<Attribute>,
    signed_attributes_der: Vec<u8>,
    signature: Vec<u8>,
    unsigned_attributes: Vec<Attribute>,
}

fn read_signer_info(reader: &mut BERReaderSeq) -> ASN1Result<SignerInfo> {
    let version = reader.next().read_i64()?;
    if version != 1 {
        return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
    }

    let signer = reader.next().read_sequence(|reader| {
        Ok(SignerIdentifier {
            issuer: reader.next().read_der()?,
            serial_number: reader.next().read_der()?,
        })
    })?;
    let digest_algorithm = read_algorithm_oid(reader.next())?;

    let mut signed_attributes_der = reader
        .read_optional(|reader| reader.read_der())?
        .filter(|element| element.first() == Some(&0xa0))
        .ok_or_else(|| ASN1Error::new(ASN1ErrorKind::Invalid))?;
    // The signature covers the attributes encoded as a universal SET.
    signed_attributes_der[0] = 0x31;
    let signed_attributes = yasna::parse_ber(&signed_attributes_der, read_attributes)?;

    read_algorithm_oid(reader.next())?;
    let signature = reader.next().read_bytes()?;

    let unsigned_attributes = reader
        .read_optional(|reader| {
            reader.read_tagged_implicit(Tag::context(1), |reader| read_attributes(reader))
        })?
        .unwrap_or_default();

    Ok(SignerInfo {
        signer,
        digest_algorithm,
        signed_attributes,
        signed_attributes_der,
        signature,
        unsigned_attributes,
    })
}

/// A parsed Authenticode signature.
#[derive(Clone, Debug)]
pub struct AuthenticodeSignature {
    spc_indirect_data: Vec<u8>,
    image_digest_algorithm: Vec<u64>,
    image_digest: Vec<u8>,
    certificates: Vec<Vec<u8>>,
    signer_info: SignerInfo,
}

impl AuthenticodeSignature {
    /// Parse the encoded `ContentInfo` stored in a certificate table entry.
    pub fn from_der(data: &[u8]) -> Result<Self, AuthenticodeError> {
        let (spc_indirect_data, certificates, signer_infos) = yasna::parse_ber(data, |reader| {
            reader.read_sequence(|reader| {
                if reader.next().read_oid()? != oid(OID_SIGNED_DATA) {
                    return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
                }

                reader.next().read_tagged(Tag::context(0), |reader| {
                    reader.read_sequence(|reader| {
                        reader.next().read_i64()?;
                        // digestAlgorithms
                        reader.next().read_der()?;

                        let spc_indirect_data = reader.next().read_sequence(|reader| {
                            if reader.next().read_oid()? != oid(OID_SPC_INDIRECT_DATA) {
                                return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
                            }
                            reader
                                .next()
                                .read_tagged(Tag::context(0), |reader| reader.read_der())
                        })?;

                        let mut certificates = vec![];
                        reader.read_optional(|reader| {
                            reader.read_tagged_implicit(Tag::context(0), |reader| {
                                reader.read_set_of(|reader| {
                                    certificates.push(reader.read_der()?);
                                    Ok(())
                                })
                            })
                        })?;

                        // crls
                        reader.read_optional(|reader| {
                            reader.read_tagged_implicit(Tag::context(1), |reader| {
                                reader.read_set_of(|reader| {
                                    reader.read_der()?;
                                    Ok(())
                                })
                            })
                        })?;

                        let mut signer_infos = vec![];
                        reader.next().read_set_of(|reader| {
                            signer_infos.push(reader.read_sequence(read_signer_info)?);
                            Ok(())
                        })?;

                        Ok((spc_indirect_data, certificates, signer_infos))
                    })
                })
            })
        })?;

        let signer_info = match <[SignerInfo; 1]>::try_from(signer_infos) {
            Ok([signer_info]) => signer_info,
            Err(_) => {
                return Err(AuthenticodeError::MalformedSignature(
                    "expected exactly one signer",
                ))
            }
        };

        if signer_info.digest_algorithm != OID_SHA256 {
            return Err(AuthenticodeError::UnsupportedDigestAlgorithm(
                signer_info.digest_algorithm,
            ));
        }

        let (image_digest_algorithm, image_digest) =
            yasna::parse_ber(&spc_indirect_data, |reader| {
                reader.read_sequence(|reader| {
                    // SpcAttributeTypeAndOptionalValue
                    reader.next().read_der()?;

                    reader.next().read_sequence(|reader| {
                        let algorithm = read_algorithm_oid(reader.next())?;
                        let digest = reader.next().read_bytes()?;
                        Ok((algorithm, digest))
                    })
                })
            })?;

        Ok(Self {
            spc_indirect_data,
            image_digest_algorithm,
            image_digest,
            certificates,
            signer_info,
        })
    }

    /// Digest algorithm of the image digest.
    pub fn image_digest_algorithm(&self) -> &[u64] {
        &self.image_digest_algorithm
    }

    /// The Authenticode digest of the image at signing time.
    pub fn image_digest(&self) -> &[u8] {
        &self.image_digest
    }

    /// All embedded certificates, DER encoded.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    pub fn signer(&self) -> &SignerIdentifier {
        &self.signer_info.signer
    }

    /// Find the embedded certificate of the signer.
    pub fn signer_certificate(&self) -> Option<&[u8]> {
        self.certificates
            .iter()
            .find(|cert| {
                SignerIdentifier::from_certificate(cert)
                    .map(|id| &id == self.signer())
                    .unwrap_or(false)
            })
            .map(|cert| cert.as_slice())
    }

    /// The message the signature value was computed over.
    pub fn signed_attributes_der(&self) -> &[u8] {
        &self.signer_info.signed_attributes_der
    }

    /// The raw RSA signature value.
    pub fn signature(&self) -> &[u8] {
        &self.signer_info.signature
    }

    fn signed_attribute(&self, attribute_oid: &[u64]) -> Option<&[u8]> {
        self.signer_info
            .signed_attributes
            .iter()
            .find(|attr| attr.oid == attribute_oid)
            .and_then(|attr| attr.values.first())
            .map(|value| value.as_slice())
    }

    /// Whether the `messageDigest` attribute matches the signed content.
    ///
    /// Together with a valid signature over [Self::signed_attributes_der],
    /// this ties [Self::image_digest] to the signer.
    pub fn verify_message_digest(&self) -> bool {
        let expected = match self
            .signed_attribute(OID_MESSAGE_DIGEST)
            .and_then(|value| yasna::parse_der(value, |reader| reader.read_bytes()).ok())
        {
            Some(digest) => digest,
            None => return false,
        };

        let content = match der_content(&self.spc_indirect_data) {
            Some(content) => content,
            None => return false,
        };

        sha2::Sha256::digest(content).as_slice() == expected.as_slice()
    }

    /// The program description, if any.
    pub fn description(&self) -> Option<String> {
        let opus_info = self.signed_attribute(OID_SPC_SP_OPUS_INFO)?;
        let program_name = der_content(opus_info)?;
        if program_name.first()? != &0xa0 {
            return None;
        }

        let spc_string = der_content(program_name)?;
        let value = der_content(spc_string)?;

        match spc_string.first()? {
            // [0] IMPLICIT BMPString
            0x80 => decode_bmp_string(value),
            // [1] IMPLICIT IA5String
            0x81 => String::from_utf8(value.to_vec()).ok(),
            _ => None,
        }
    }

    /// The RFC 3161 time-stamp token, if one is attached.
    pub fn time_stamp_token(&self) -> Option<Result<TimeStampToken, TimeStampError>> {
        self.signer_info
            .unsigned_attributes
            .iter()
            .find(|attr| attr.oid == OID_MS_RFC3161_COUNTER_SIGNATURE)
            .and_then(|attr| attr.values.first())
            .map(|token| TimeStampToken::from_der(token))
    }
}
