// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Broad classification of a [RpmRepositoryError].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Storage or filesystem failure reading or writing bytes.
    Io,
    /// Malformed XML input or output.
    Xml,
    /// Unsupported or misconfigured content digest.
    Digest,
}

/// Error type for this crate.
#[derive(Debug, Error)]
pub enum RpmRepositoryError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("repository I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] xml::reader::Error),

    #[error("XML write error: {0}")]
    XmlWrite(#[from] xml::writer::Error),

    #[error("XML deserialization error: {0:?}")]
    SerdeXml(#[from] serde_xml_rs::Error),

    #[error("unsupported XML document encoding: {0}")]
    XmlUnsupportedEncoding(String),

    #[error("malformed metadata document: {0}")]
    XmlMalformed(String),

    #[error("<package> element lacks a package id")]
    PackageMissingId,

    #[error("fragment has {0} <package> elements; expected exactly 1")]
    FragmentPackageCount(u64),

    #[error("fragment package id {actual} does not match package id {expected}")]
    FragmentPackageIdMismatch { expected: String, actual: String },

    #[error("invalid hex in content digest: {0}; {1:?}")]
    ContentDigestBadHex(String, hex::FromHexError),

    #[error("unknown content digest format: {0}")]
    UnknownDigestFormat(String),

    #[error("unknown naming policy: {0}")]
    UnknownNamingPolicy(String),

    #[error("repository metadata entry not found: {0}")]
    MetadataFileNotFound(&'static str),

    #[error("content size missing from metadata entry")]
    MetadataMissingSize,

    #[error("unexpected data path: {0}")]
    UnexpectedDataPath(String),

    #[error("repository has a failed package update: {message}")]
    UpdateFailed { kind: ErrorKind, message: String },

    #[error("package {0}: {1}")]
    Package(String, Box<RpmRepositoryError>),

    #[error("document {0}: {1}")]
    Document(String, Box<RpmRepositoryError>),
}

impl RpmRepositoryError {
    /// Classify this error.
    ///
    /// Errors tagged with a package or document resolve to the kind of the
    /// error they wrap.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::IoPath(_, _) | Self::MetadataFileNotFound(_) => ErrorKind::Io,
            Self::XmlWrite(xml::writer::Error::Io(_)) => ErrorKind::Io,
            Self::Xml(_)
            | Self::XmlWrite(_)
            | Self::SerdeXml(_)
            | Self::XmlUnsupportedEncoding(_)
            | Self::XmlMalformed(_)
            | Self::PackageMissingId
            | Self::FragmentPackageCount(_)
            | Self::FragmentPackageIdMismatch { .. }
            | Self::MetadataMissingSize
            | Self::UnexpectedDataPath(_) => ErrorKind::Xml,
            Self::ContentDigestBadHex(_, _)
            | Self::UnknownDigestFormat(_)
            | Self::UnknownNamingPolicy(_) => ErrorKind::Digest,
            Self::UpdateFailed { kind, .. } => *kind,
            Self::Package(_, inner) | Self::Document(_, inner) => inner.kind(),
        }
    }

    /// Tag this error with the id of the package being processed.
    pub fn for_package(self, pkgid: impl ToString) -> Self {
        Self::Package(pkgid.to_string(), Box::new(self))
    }

    /// Tag this error with the name of the document being processed.
    pub fn for_document(self, name: impl ToString) -> Self {
        Self::Document(name.to_string(), Box::new(self))
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, RpmRepositoryError>;
