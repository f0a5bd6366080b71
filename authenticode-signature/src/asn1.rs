// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Low-level DER primitives and object identifiers used by Authenticode.
//!
//! Structured values are produced with `yasna`. The helpers in this module
//! cover the handful of places where we need exact control over the emitted
//! bytes: `SET OF` ordering, implicitly tagged strings and splicing
//! pre-encoded values into a larger structure.

use {
    chrono::{DateTime, NaiveDateTime, TimeZone, Utc},
    yasna::{models::ObjectIdentifier, ASN1Result, BERReaderSeq, DERWriter},
};

/// `id-signedData` (RFC 5652).
pub const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 2];

/// `id-sha256` (RFC 5754).
pub const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];

/// `rsaEncryption` (RFC 8017).
pub const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];

/// `id-contentType` attribute (RFC 5652).
pub const OID_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113549, 1, 9, 3];

/// `id-messageDigest` attribute (RFC 5652).
pub const OID_MESSAGE_DIGEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 4];

/// `id-ct-TSTInfo` (RFC 3161).
pub const OID_CONTENT_TYPE_TST_INFO: &[u64] = &[1, 2, 840, 113549, 1, 9, 16, 1, 4];

/// `SPC_INDIRECT_DATA_OBJID`.
pub const OID_SPC_INDIRECT_DATA: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 4];

/// `SPC_STATEMENT_TYPE_OBJID`.
pub const OID_SPC_STATEMENT_TYPE: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 11];

/// `SPC_SP_OPUS_INFO_OBJID`. Carries the program description.
pub const OID_SPC_SP_OPUS_INFO: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 12];

/// `SPC_PE_IMAGE_DATAOBJ`.
pub const OID_SPC_PE_IMAGE_DATA: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 15];

/// `SPC_INDIVIDUAL_SP_KEY_PURPOSE_OBJID`.
pub const OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 21];

/// `ecdsa-with-SHA256` (RFC 5758).
pub const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];

/// `szOID_RFC3161_counterSign`. Unauthenticated attribute holding a time-stamp token.
pub const OID_MS_RFC3161_COUNTER_SIGNATURE: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 3, 3, 1];

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_SET: u8 = 0x31;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;

pub fn oid(components: &[u64]) -> ObjectIdentifier {
    ObjectIdentifier::from_slice(components)
}

/// Encode a DER length field.
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else {
        let bytes = length.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let mut res = vec![0x80 | (bytes.len() - skip) as u8];
        res.extend_from_slice(&bytes[skip..]);
        res
    }
}

/// Encode a single tag-length-value element with a one byte tag.
pub fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut res = vec![tag];
    res.extend(encode_length(content.len()));
    res.extend_from_slice(content);
    res
}

/// Encode a `SET OF` from already encoded elements.
///
/// DER requires elements sorted by their encodings.
pub fn der_set_of(mut elements: Vec<Vec<u8>>) -> Vec<u8> {
    elements.sort();
    der_tlv(TAG_SET, &elements.concat())
}

/// Resolve the (header length, content length) of the first element in `data`.
///
/// Indefinite lengths are not supported.
fn der_header(data: &[u8]) -> Option<(usize, usize)> {
    let mut offset = 1;

    // High tag number form.
    if data.first()? & 0x1f == 0x1f {
        while data.get(offset)? & 0x80 != 0 {
            offset += 1;
        }
        offset += 1;
    }

    let first = *data.get(offset)?;
    offset += 1;

    let length = if first < 0x80 {
        first as usize
    } else if first == 0x80 {
        return None;
    } else {
        let count = (first & 0x7f) as usize;
        if count > std::mem::size_of::<usize>() {
            return None;
        }
        let mut length = 0usize;
        for _ in 0..count {
            length = (length << 8) | *data.get(offset)? as usize;
            offset += 1;
        }
        length
    };

    Some((offset, length))
}

/// Total encoded size of the first element in `data`.
pub fn der_element_len(data: &[u8]) -> Option<usize> {
    let (header, length) = der_header(data)?;
    let total = header.checked_add(length)?;

    if total <= data.len() {
        Some(total)
    } else {
        None
    }
}

/// Content octets of the first element in `data`, without tag and length.
pub fn der_content(data: &[u8]) -> Option<&[u8]> {
    let (header, length) = der_header(data)?;
    data.get(header..header.checked_add(length)?)
}

/// Write an `AlgorithmIdentifier` for SHA-256 with explicit NULL parameters.
pub fn write_sha256_algorithm(writer: DERWriter) {
    writer.write_sequence(|writer| {
        writer.next().write_oid(&oid(OID_SHA256));
        writer.next().write_null();
    })
}

/// Read an `AlgorithmIdentifier` and return its OID components.
///
/// Parameters, if present, are ignored.
pub fn read_algorithm_oid(reader: yasna::BERReader) -> ASN1Result<Vec<u64>> {
    reader.read_sequence(|reader| {
        let algorithm = reader.next().read_oid()?;
        skip_remaining(reader)?;
        Ok(algorithm.components().to_vec())
    })
}

/// Encode a string as UTF-16BE, as `BMPString` content.
pub fn bmp_string(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|c| c.to_be_bytes()).collect()
}

/// Decode `BMPString` content.
pub fn decode_bmp_string(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }

    let units = data
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect::<Vec<_>>();

    String::from_utf16(&units).ok()
}

/// Encode a `GeneralizedTime` with second resolution.
pub fn der_generalized_time(time: &DateTime<Utc>) -> Vec<u8> {
    der_tlv(
        TAG_GENERALIZED_TIME,
        time.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

/// Decode an encoded `GeneralizedTime` element.
///
/// Fractional seconds are accepted and discarded.
pub fn parse_generalized_time(data: &[u8]) -> Option<DateTime<Utc>> {
    if *data.first()? != TAG_GENERALIZED_TIME {
        return None;
    }

    let value = std::str::from_utf8(der_content(data)?).ok()?;
    let value = value.strip_suffix('Z')?;
    let whole = value.split('.').next()?;

    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;

    Some(Utc.from_utc_datetime(&naive))
}

/// Consume every element left in a sequence.
///
/// Used to tolerate optional trailing fields we have no interest in.
pub fn skip_remaining(reader: &mut BERReaderSeq) -> ASN1Result<()> {
    while reader.read_optional(|reader| reader.read_der())?.is_some() {}

    Ok(())
}
