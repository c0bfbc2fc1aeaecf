// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content digests and I/O adapters. */

use {
    crate::error::{Result, RpmRepositoryError},
    serde::{Deserialize, Serialize},
    std::{
        fmt::Formatter,
        io::{BufRead, Read, Write},
        path::Path,
        str::FromStr,
    },
};

/// Content digest algorithm.
///
/// A single flavor is used for every artifact of an update cycle.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChecksumType {
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl ChecksumType {
    /// The name of this digest as it appears in `type` attributes of metadata files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Obtain a new hasher for this checksum flavor.
    pub fn new_hasher(&self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
        }
    }
}

impl std::fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumType {
    type Err = RpmRepositoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            // Older repositories advertise SHA-1 as `sha`.
            "sha" | "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(RpmRepositoryError::UnknownDigestFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChecksumType {
    type Error = RpmRepositoryError;

    fn try_from(v: String) -> std::result::Result<Self, Self::Error> {
        Self::from_str(&v)
    }
}

impl From<ChecksumType> for String {
    fn from(v: ChecksumType) -> Self {
        v.name().to_string()
    }
}

/// Represents a content digest.
#[derive(Clone, Eq, PartialEq, PartialOrd)]
pub enum ContentDigest {
    /// A SHA-1 digest.
    Sha1(Vec<u8>),
    /// A SHA-256 digest.
    Sha256(Vec<u8>),
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha1(data) => write!(f, "Sha1({})", hex::encode(data)),
            Self::Sha256(data) => write!(f, "Sha256({})", hex::encode(data)),
        }
    }
}

impl ContentDigest {
    /// Create a new SHA-1 instance by parsing a hex digest.
    pub fn sha1_hex(digest: &str) -> Result<Self> {
        Self::from_hex_digest(ChecksumType::Sha1, digest)
    }

    /// Create a new SHA-256 instance by parsing a hex digest.
    pub fn sha256_hex(digest: &str) -> Result<Self> {
        Self::from_hex_digest(ChecksumType::Sha256, digest)
    }

    /// Obtain an instance by parsing a hex string as a [ChecksumType].
    pub fn from_hex_digest(checksum: ChecksumType, digest: &str) -> Result<Self> {
        let digest = hex::decode(digest)
            .map_err(|e| RpmRepositoryError::ContentDigestBadHex(digest.to_string(), e))?;

        Ok(Self::from_bytes(checksum, digest))
    }

    fn from_bytes(checksum: ChecksumType, digest: Vec<u8>) -> Self {
        match checksum {
            ChecksumType::Sha1 => Self::Sha1(digest),
            ChecksumType::Sha256 => Self::Sha256(digest),
        }
    }

    /// Compute the digest of all content readable from a reader.
    pub fn from_reader(checksum: ChecksumType, reader: impl Read) -> std::io::Result<Self> {
        let mut reader = DigestingReader::new(reader, checksum);
        std::io::copy(&mut reader, &mut std::io::sink())?;

        Ok(reader.finish().1)
    }

    /// Compute the digest of the content of a file.
    ///
    /// The file is streamed; it is never buffered in memory as a whole.
    pub fn from_path(checksum: ChecksumType, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let fh = std::fs::File::open(path)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", path.display()), e))?;

        Self::from_reader(checksum, std::io::BufReader::new(fh))
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", path.display()), e))
    }

    /// Create a new hasher matching for the type of this digest.
    pub fn new_hasher(&self) -> Box<dyn digest::DynDigest + Send> {
        self.checksum_type().new_hasher()
    }

    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(x) => x,
            Self::Sha256(x) => x,
        }
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Obtain the [ChecksumType] for this digest.
    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Self::Sha1(_) => ChecksumType::Sha1,
            Self::Sha256(_) => ChecksumType::Sha256,
        }
    }
}

/// Compression format of a metadata file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    /// No compression.
    None,
    /// Gzip compression.
    Gzip,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
        }
    }

    /// Resolve the compression of a file from its path.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".gz") {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed<'a>(
    stream: impl BufRead + Send + 'a,
    compression: Compression,
) -> Box<dyn Read + Send + 'a> {
    match compression {
        Compression::None => Box::new(stream),
        Compression::Gzip => Box::new(flate2::bufread::GzDecoder::new(stream)),
    }
}

/// A reader that computes a content digest and byte count of everything read through it.
pub struct DigestingReader<R> {
    hasher: Box<dyn digest::DynDigest + Send>,
    checksum: ChecksumType,
    source: R,
    bytes_read: u64,
}

impl<R> DigestingReader<R> {
    pub fn new(source: R, checksum: ChecksumType) -> Self {
        Self {
            hasher: checksum.new_hasher(),
            checksum,
            source,
            bytes_read: 0,
        }
    }

    /// Finish reading, returning the total byte count and the digest.
    pub fn finish(self) -> (u64, ContentDigest) {
        let digest = self.hasher.finalize().to_vec();

        (self.bytes_read, ContentDigest::from_bytes(self.checksum, digest))
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.source.read(buf)?;

        self.hasher.update(&buf[0..size]);
        self.bytes_read += size as u64;

        Ok(size)
    }
}

/// A writer that computes a content digest and byte count of everything written through it.
pub struct DigestingWriter<W> {
    hasher: Box<dyn digest::DynDigest + Send>,
    checksum: ChecksumType,
    dest: W,
    bytes_written: u64,
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(dest: W, checksum: ChecksumType) -> Self {
        Self {
            hasher: checksum.new_hasher(),
            checksum,
            dest,
            bytes_written: 0,
        }
    }

    /// Finish writing, returning the inner writer, byte count, and digest.
    pub fn finish(self) -> (W, u64, ContentDigest) {
        let digest = self.hasher.finalize().to_vec();

        (
            self.dest,
            self.bytes_written,
            ContentDigest::from_bytes(self.checksum, digest),
        )
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let size = self.dest.write(buf)?;

        self.hasher.update(&buf[0..size]);
        self.bytes_written += size as u64;

        Ok(size)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.dest.flush()
    }
}

/// A reader that validates content size and digest once all content is read.
///
/// The digest is only compared once `expected_size` bytes have been read. A reader
/// that stops early has not been validated.
pub struct ContentValidatingReader<R> {
    hasher: Option<Box<dyn digest::DynDigest + Send>>,
    expected_size: u64,
    expected_digest: ContentDigest,
    source: R,
    bytes_read: u64,
}

impl<R> ContentValidatingReader<R> {
    pub fn new(source: R, expected_size: u64, expected_digest: ContentDigest) -> Self {
        Self {
            hasher: Some(expected_digest.new_hasher()),
            expected_size,
            expected_digest,
            source,
            bytes_read: 0,
        }
    }
}

impl<R: Read> Read for ContentValidatingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.source.read(buf)?;

        if size > 0 {
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&buf[0..size]);
            }

            self.bytes_read += size as u64;
        }

        match self.bytes_read.cmp(&self.expected_size) {
            std::cmp::Ordering::Equal => {
                if let Some(hasher) = self.hasher.take() {
                    let got_digest = hasher.finalize();

                    if got_digest.as_ref() != self.expected_digest.digest_bytes() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "digest mismatch of retrieved content: expected {}, got {}",
                                self.expected_digest.digest_hex(),
                                hex::encode(got_digest)
                            ),
                        ));
                    }
                }
            }
            std::cmp::Ordering::Greater => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "extra bytes read: expected {}; got {}",
                        self.expected_size, self.bytes_read
                    ),
                ));
            }
            std::cmp::Ordering::Less => {
                if size == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "content truncated: expected {} bytes; got {}",
                            self.expected_size, self.bytes_read
                        ),
                    ));
                }
            }
        }

        Ok(size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HELLO_SHA1: &str = "f572d396fae9206628714fb2ce00f72e94f2258f";
    const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn digest_reader() -> Result<()> {
        let sha1 = ContentDigest::from_reader(ChecksumType::Sha1, &b"hello\n"[..])?;
        assert_eq!(sha1.digest_hex(), HELLO_SHA1);
        assert_eq!(sha1.checksum_type(), ChecksumType::Sha1);

        let sha256 = ContentDigest::from_reader(ChecksumType::Sha256, &b"hello\n"[..])?;
        assert_eq!(sha256, ContentDigest::sha256_hex(HELLO_SHA256)?);

        Ok(())
    }

    #[test]
    fn digest_missing_file() {
        let err = ContentDigest::from_path(ChecksumType::Sha256, "/nonexistent/file")
            .expect_err("file should not exist");
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn checksum_type_names() -> Result<()> {
        assert_eq!(ChecksumType::from_str("SHA256")?, ChecksumType::Sha256);
        assert_eq!(ChecksumType::from_str("sha")?, ChecksumType::Sha1);

        let err = ChecksumType::from_str("md5").expect_err("md5 is unsupported");
        assert_eq!(err.kind(), crate::error::ErrorKind::Digest);

        Ok(())
    }

    #[test]
    fn digesting_writer() -> Result<()> {
        let mut writer = DigestingWriter::new(vec![], ChecksumType::Sha1);
        writer.write_all(b"hello\n")?;
        let (data, size, digest) = writer.finish();

        assert_eq!(data, b"hello\n");
        assert_eq!(size, 6);
        assert_eq!(digest.digest_hex(), HELLO_SHA1);

        Ok(())
    }

    #[test]
    fn validating_reader() -> Result<()> {
        let mut reader =
            ContentValidatingReader::new(&b"hello\n"[..], 6, ContentDigest::sha1_hex(HELLO_SHA1)?);
        let mut buf = vec![];
        reader.read_to_end(&mut buf)?;
        assert_eq!(buf, b"hello\n");

        let mut reader =
            ContentValidatingReader::new(&b"hallo\n"[..], 6, ContentDigest::sha1_hex(HELLO_SHA1)?);
        assert!(reader.read_to_end(&mut vec![]).is_err());

        let mut reader =
            ContentValidatingReader::new(&b"hello"[..], 6, ContentDigest::sha1_hex(HELLO_SHA1)?);
        assert!(reader.read_to_end(&mut vec![]).is_err());

        Ok(())
    }
}
