// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! PE/COFF image handling for Authenticode.

Authenticode signatures live in the *attribute certificate table*, which is
located by the `IMAGE_DIRECTORY_ENTRY_SECURITY` data directory and stored at
the end of the file. The signed digest covers the whole image except:

* the optional header `CheckSum` field,
* the security data directory entry itself,
* the attribute certificate table.

This means the checksum can be updated and the certificate table replaced
without invalidating the digest, while every other byte is covered.
*/

use {
    crate::AuthenticodeError,
    scroll::{Pread, Pwrite, LE},
    sha2::{Digest, Sha256},
    std::{io::Read, path::Path},
};

/// MSI file magic.
const CFB_MAGIC_NUMBER: [u8; 8] = [0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

const DOS_MAGIC: u16 = 0x5a4d;
const PE_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;

const COFF_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;

/// `WIN_CERT_REVISION_2_0`.
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;

/// `WIN_CERT_TYPE_PKCS_SIGNED_DATA`.
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

const WIN_CERTIFICATE_HEADER_SIZE: usize = 8;

/// Whether the bytes passed in look like a file header for a format that is signable.
///
/// The passed buffer must be at least 16 bytes long.
///
/// This could yield false positives.
#[allow(clippy::if_same_then_else)]
pub fn is_signable_binary_header(data: &[u8]) -> bool {
    if data.len() < 16 {
        false
    // DOS header.
    } else if data[0] == 0x4d && data[1] == 0x5a {
        true
    } else {
        data[0..CFB_MAGIC_NUMBER.len()] == CFB_MAGIC_NUMBER
    }
}

/// Whether the bytes passed in start with the compound file (MSI) magic.
pub fn is_msi_header(data: &[u8]) -> bool {
    data.len() >= CFB_MAGIC_NUMBER.len() && data[0..CFB_MAGIC_NUMBER.len()] == CFB_MAGIC_NUMBER
}

/// Determine whether a given filesystem path is signable.
///
/// This effectively answers whether the given path is a PE or MSI.
pub fn is_file_signable(path: impl AsRef<Path>) -> Result<bool, AuthenticodeError> {
    let path = path.as_ref();

    if path.metadata()?.len() < 16 {
        return Ok(false);
    }

    let mut fh = std::fs::File::open(path)?;
    let mut buffer: [u8; 16] = [0; 16];
    fh.read_exact(&mut buffer)?;

    Ok(is_signable_binary_header(&buffer))
}

/// Find a `WIN_CERTIFICATE` holding PKCS#7 data that ends the file.
///
/// Signing appends the certificate table at a quadword aligned offset at the
/// end of the image. This locates it without consulting the PE headers, so
/// signed files can be recognized after their headers are damaged.
pub fn find_trailing_certificate(data: &[u8]) -> Option<CertificateTable> {
    (0..data.len() / 8).map(|i| i * 8).find_map(|offset| {
        let length = data.pread_with::<u32>(offset, LE).ok()? as usize;
        let revision = data.pread_with::<u16>(offset + 4, LE).ok()?;
        let certificate_type = data.pread_with::<u16>(offset + 6, LE).ok()?;
        let padded_end = offset.checked_add(length.checked_add(7)? / 8 * 8)?;

        if length > WIN_CERTIFICATE_HEADER_SIZE
            && revision == WIN_CERT_REVISION_2_0
            && certificate_type == WIN_CERT_TYPE_PKCS_SIGNED_DATA
            && padded_end == data.len()
            && data.get(offset + WIN_CERTIFICATE_HEADER_SIZE) == Some(&0x30)
        {
            Some(CertificateTable {
                offset,
                size: data.len() - offset,
            })
        } else {
            None
        }
    })
}

/// Location of the attribute certificate table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CertificateTable {
    /// File offset of the table.
    pub offset: usize,
    /// Size of the table, including alignment padding.
    pub size: usize,
}

/// A parsed view of a PE image, holding the offsets that matter for signing.
#[derive(Clone, Debug)]
pub struct PeImage<'a> {
    data: &'a [u8],
    is_pe32_plus: bool,
    checksum_offset: usize,
    security_directory_offset: usize,
    certificate_table: Option<CertificateTable>,
}

impl<'a> PeImage<'a> {
    /// Parse PE headers from a buffer.
    ///
    /// Only the headers needed for Authenticode are validated. Section
    /// contents are treated as opaque bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, AuthenticodeError> {
        if is_msi_header(data) {
            return Err(AuthenticodeError::UnsupportedFormat(
                "MSI (compound file) packages",
            ));
        }

        if data.len() < 0x40 || data.pread_with::<u16>(0, LE)? != DOS_MAGIC {
            return Err(AuthenticodeError::NotPe("missing DOS header"));
        }

        let pe_offset = data.pread_with::<u32>(0x3c, LE)? as usize;
        if data.len() < pe_offset.saturating_add(4 + COFF_HEADER_SIZE) {
            return Err(AuthenticodeError::NotPe("PE header beyond end of file"));
        }
        if data.pread_with::<u32>(pe_offset, LE)? != PE_SIGNATURE {
            return Err(AuthenticodeError::NotPe("missing PE signature"));
        }

        let coff_offset = pe_offset + 4;
        let section_count = data.pread_with::<u16>(coff_offset + 2, LE)? as usize;
        let optional_header_size = data.pread_with::<u16>(coff_offset + 16, LE)? as usize;
        let optional_offset = coff_offset + COFF_HEADER_SIZE;

        let magic = data.pread_with::<u16>(optional_offset, LE)?;
        let (is_pe32_plus, rva_count_offset, directories_offset) = match magic {
            PE32_MAGIC => (false, 92, 96),
            PE32_PLUS_MAGIC => (true, 108, 112),
            _ => return Err(AuthenticodeError::NotPe("unknown optional header magic")),
        };

        let rva_count =
            data.pread_with::<u32>(optional_offset + rva_count_offset, LE)? as usize;
        if rva_count <= IMAGE_DIRECTORY_ENTRY_SECURITY
            || directories_offset + (IMAGE_DIRECTORY_ENTRY_SECURITY + 1) * 8 > optional_header_size
        {
            return Err(AuthenticodeError::NotPe(
                "optional header lacks a security data directory",
            ));
        }

        let headers_end = optional_offset
            + optional_header_size
            + section_count * SECTION_HEADER_SIZE;
        if headers_end > data.len() {
            return Err(AuthenticodeError::NotPe("section table beyond end of file"));
        }

        let checksum_offset = optional_offset + 64;
        let security_directory_offset =
            optional_offset + directories_offset + IMAGE_DIRECTORY_ENTRY_SECURITY * 8;

        let table_offset = data.pread_with::<u32>(security_directory_offset, LE)? as usize;
        let table_size = data.pread_with::<u32>(security_directory_offset + 4, LE)? as usize;

        let certificate_table = if table_offset == 0 || table_size == 0 {
            None
        } else if table_offset < headers_end
            || table_offset
                .checked_add(table_size)
                .map(|end| end > data.len())
                .unwrap_or(true)
        {
            return Err(AuthenticodeError::CorruptCertificateTable(
                "table lies outside the image",
            ));
        } else {
            Some(CertificateTable {
                offset: table_offset,
                size: table_size,
            })
        };

        Ok(Self {
            data,
            is_pe32_plus,
            checksum_offset,
            security_directory_offset,
            certificate_table,
        })
    }

    /// The raw image bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn is_pe32_plus(&self) -> bool {
        self.is_pe32_plus
    }

    pub fn checksum_offset(&self) -> usize {
        self.checksum_offset
    }

    pub fn security_directory_offset(&self) -> usize {
        self.security_directory_offset
    }

    /// The attribute certificate table, if the image carries one.
    pub fn certificate_table(&self) -> Option<CertificateTable> {
        self.certificate_table
    }

    /// The `CheckSum` value currently stored in the optional header.
    pub fn stored_checksum(&self) -> Result<u32, AuthenticodeError> {
        Ok(self.data.pread_with::<u32>(self.checksum_offset, LE)?)
    }

    /// End of the content covered by the Authenticode digest.
    fn signed_content_end(&self) -> usize {
        self.certificate_table
            .map(|table| table.offset)
            .unwrap_or(self.data.len())
    }

    /// Compute the Authenticode SHA-256 digest of the image.
    pub fn authenticode_digest(&self) -> Vec<u8> {
        let end = self.signed_content_end();

        let mut hasher = Sha256::new();
        hasher.update(&self.data[0..self.checksum_offset]);
        hasher.update(&self.data[self.checksum_offset + 4..self.security_directory_offset]);
        hasher.update(&self.data[self.security_directory_offset + 8..end]);

        hasher.finalize().to_vec()
    }

    /// Obtain the PKCS#7 blob from the first `WIN_CERTIFICATE` entry.
    ///
    /// Returns `Ok(None)` if the image is unsigned.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, AuthenticodeError> {
        let table = match self.certificate_table {
            Some(table) => table,
            None => return Ok(None),
        };

        if table.size < WIN_CERTIFICATE_HEADER_SIZE {
            return Err(AuthenticodeError::CorruptCertificateTable("table too small"));
        }

        let length = self.data.pread_with::<u32>(table.offset, LE)? as usize;
        let revision = self.data.pread_with::<u16>(table.offset + 4, LE)?;
        let certificate_type = self.data.pread_with::<u16>(table.offset + 6, LE)?;

        if length < WIN_CERTIFICATE_HEADER_SIZE || length > table.size {
            return Err(AuthenticodeError::CorruptCertificateTable(
                "entry length exceeds table",
            ));
        }
        if revision != WIN_CERT_REVISION_2_0 || certificate_type != WIN_CERT_TYPE_PKCS_SIGNED_DATA
        {
            return Err(AuthenticodeError::CorruptCertificateTable(
                "entry is not PKCS#7 signed data",
            ));
        }

        let entry = &self.data[table.offset + WIN_CERTIFICATE_HEADER_SIZE..table.offset + length];

        // The entry is zero padded to 8 bytes. Trim to the DER element.
        let der_length = crate::asn1::der_element_len(entry).ok_or(
            AuthenticodeError::CorruptCertificateTable("entry is not a DER element"),
        )?;

        Ok(Some(&entry[0..der_length]))
    }

    /// Produce a copy of the image ready to receive a signature.
    ///
    /// Any existing certificate table is removed, the security directory
    /// is zeroed and the file is padded to an 8 byte boundary. The digest of
    /// the returned image is the one to sign.
    pub fn unsigned_image(&self) -> Result<Vec<u8>, AuthenticodeError> {
        let mut data = self.data[0..self.signed_content_end()].to_vec();

        data.pwrite_with::<u32>(0, self.security_directory_offset, LE)?;
        data.pwrite_with::<u32>(0, self.security_directory_offset + 4, LE)?;

        while data.len() % 8 != 0 {
            data.push(0);
        }

        Ok(data)
    }

    /// Embed a PKCS#7 signature into an image returned by [Self::unsigned_image].
    ///
    /// The image checksum is recomputed.
    pub fn embed_signature(&self, pkcs7: &[u8]) -> Result<Vec<u8>, AuthenticodeError> {
        if self.certificate_table.is_some() || self.data.len() % 8 != 0 {
            return Err(AuthenticodeError::CorruptCertificateTable(
                "image was not prepared for signing",
            ));
        }

        let padding = (8 - pkcs7.len() % 8) % 8;
        let entry_size = WIN_CERTIFICATE_HEADER_SIZE + pkcs7.len() + padding;
        let entry_size_u32 = u32::try_from(entry_size)
            .map_err(|_| AuthenticodeError::CorruptCertificateTable("signature too large"))?;
        let offset_u32 = u32::try_from(self.data.len())
            .map_err(|_| AuthenticodeError::NotPe("image too large"))?;

        let mut data = Vec::with_capacity(self.data.len() + entry_size);
        data.extend_from_slice(self.data);

        let mut header = [0u8; WIN_CERTIFICATE_HEADER_SIZE];
        header.pwrite_with::<u32>(entry_size_u32, 0, LE)?;
        header.pwrite_with::<u16>(WIN_CERT_REVISION_2_0, 4, LE)?;
        header.pwrite_with::<u16>(WIN_CERT_TYPE_PKCS_SIGNED_DATA, 6, LE)?;
        data.extend_from_slice(&header);
        data.extend_from_slice(pkcs7);
        data.resize(data.len() + padding, 0);

        data.pwrite_with::<u32>(offset_u32, self.security_directory_offset, LE)?;
        data.pwrite_with::<u32>(entry_size_u32, self.security_directory_offset + 4, LE)?;

        let checksum = compute_checksum(&data, self.checksum_offset);
        data.pwrite_with::<u32>(checksum, self.checksum_offset, LE)?;

        Ok(data)
    }
}

/// Compute the PE image checksum as `ImageHlp!CheckSumMappedFile` does.
///
/// The 4 bytes at `checksum_offset` are treated as zero.
pub fn compute_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;

    for (index, chunk) in data.chunks(2).enumerate() {
        let offset = index * 2;
        if offset >= checksum_offset && offset < checksum_offset + 4 {
            continue;
        }

        let word = if chunk.len() == 2 {
            u16::from_le_bytes([chunk[0], chunk[1]])
        } else {
            chunk[0] as u16
        };

        sum += word as u64;
        sum = (sum & 0xffff) + (sum >> 16);
    }

    sum = (sum & 0xffff) + (sum >> 16);

    (sum as u32).wrapping_add(data.len() as u32)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::synthetic_pe_image, anyhow::Result};

    #[test]
    fn signable_headers() {
        assert!(!is_signable_binary_header(b"MZ"));
        assert!(is_signable_binary_header(&synthetic_pe_image(4096)));
        assert!(is_signable_binary_header(&[
            0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1, 0, 0, 0, 0, 0, 0, 0, 0
        ]));
        assert!(!is_signable_binary_header(&[0x7f, b'E', b'L', b'F', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn parse_synthetic() -> Result<()> {
        let data = synthetic_pe_image(64 * 1024);
        let image = PeImage::parse(&data)?;

        assert!(image.is_pe32_plus());
        assert!(image.certificate_table().is_none());
        assert!(image.signature_data()?.is_none());

        Ok(())
    }

    #[test]
    fn reject_non_pe() {
        assert!(matches!(
            PeImage::parse(&[0u8; 256]),
            Err(AuthenticodeError::NotPe(_))
        ));

        let mut msi = vec![0u8; 512];
        msi[0..8].copy_from_slice(&CFB_MAGIC_NUMBER);
        assert!(matches!(
            PeImage::parse(&msi),
            Err(AuthenticodeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn digest_ignores_checksum_and_security_directory() -> Result<()> {
        let data = synthetic_pe_image(8192);
        let image = PeImage::parse(&data)?;
        let digest = image.authenticode_digest();

        let mut modified = data.clone();
        modified[image.checksum_offset()] ^= 0xff;
        assert_eq!(PeImage::parse(&modified)?.authenticode_digest(), digest);

        let mut modified = data.clone();
        modified[0x50] ^= 0x01;
        assert_ne!(PeImage::parse(&modified)?.authenticode_digest(), digest);

        Ok(())
    }

    #[test]
    fn embed_and_extract() -> Result<()> {
        let data = synthetic_pe_image(10_001);
        let prepared = PeImage::parse(&data)?.unsigned_image()?;
        assert_eq!(prepared.len() % 8, 0);

        let prepared_image = PeImage::parse(&prepared)?;
        let digest = prepared_image.authenticode_digest();

        let blob = crate::asn1::der_tlv(0x30, &[0x05, 0x00, 0x02, 0x01, 0x07]);
        let signed = prepared_image.embed_signature(&blob)?;
        let signed_image = PeImage::parse(&signed)?;

        let table = signed_image.certificate_table().unwrap();
        assert_eq!(table.offset, prepared.len());
        assert_eq!(table.size % 8, 0);
        assert_eq!(signed_image.signature_data()?, Some(blob.as_slice()));
        assert_eq!(signed_image.authenticode_digest(), digest);
        assert_eq!(
            signed_image.stored_checksum()?,
            compute_checksum(&signed, signed_image.checksum_offset())
        );

        // Stripping the signature restores the prepared image.
        assert_eq!(signed_image.unsigned_image()?, prepared);

        Ok(())
    }

    #[test]
    fn trailing_certificate_found_without_headers() -> Result<()> {
        let data = synthetic_pe_image(10_001);
        assert!(find_trailing_certificate(&data).is_none());

        let prepared = PeImage::parse(&data)?.unsigned_image()?;
        let blob = crate::asn1::der_tlv(0x30, &[0x02, 0x01, 0x07]);
        let mut signed = PeImage::parse(&prepared)?.embed_signature(&blob)?;

        let expected = PeImage::parse(&signed)?.certificate_table();
        assert_eq!(find_trailing_certificate(&signed), expected);

        // Break the PE signature; the table is still recognized.
        signed[0x80] ^= 0x01;
        assert!(PeImage::parse(&signed).is_err());
        assert_eq!(find_trailing_certificate(&signed), expected);

        // Truncation leaves the entry short of the end of the file.
        signed.truncate(signed.len() - 8);
        assert!(find_trailing_certificate(&signed).is_none());

        Ok(())
    }

    #[test]
    fn embed_requires_prepared_image() -> Result<()> {
        let data = synthetic_pe_image(4097);
        let image = PeImage::parse(&data)?;

        if data.len() % 8 != 0 {
            assert!(image.embed_signature(&[0x30, 0x00]).is_err());
        }

        Ok(())
    }

    #[test]
    fn corrupt_table_rejected() -> Result<()> {
        let data = synthetic_pe_image(4096);
        let image = PeImage::parse(&data)?;

        let mut modified = data.clone();
        let offset = image.security_directory_offset();
        modified.pwrite_with::<u32>(data.len() as u32 - 4, offset, LE)?;
        modified.pwrite_with::<u32>(64, offset + 4, LE)?;

        assert!(matches!(
            PeImage::parse(&modified),
            Err(AuthenticodeError::CorruptCertificateTable(_))
        ));

        Ok(())
    }
}
