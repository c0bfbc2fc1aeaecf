// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! RPM repository metadata XML definitions.

RPM repositories define metadata via a series of XML files. `repomd.xml` indexes
the others: `primary.xml`, `filelists.xml` and `other.xml`, which we call
*dialects*. Every dialect document has the same outer shape: a root element with a
`packages` attribute holding the number of `<package>` children.

This module defines these documents and the streaming primitives used to rewrite
them without materializing them in memory.
*/

pub mod codec;
pub mod maid;
pub mod merge;
pub mod primary;
pub mod repomd;

use crate::io::Compression;

/// XML namespace of `primary.xml`.
pub const COMMON_NAMESPACE: &str = "http://linux.duke.edu/metadata/common";
/// XML namespace of RPM specific elements.
pub const RPM_NAMESPACE: &str = "http://linux.duke.edu/metadata/rpm";
/// XML namespace of `filelists.xml`.
pub const FILELISTS_NAMESPACE: &str = "http://linux.duke.edu/metadata/filelists";
/// XML namespace of `other.xml`.
pub const OTHER_NAMESPACE: &str = "http://linux.duke.edu/metadata/other";
/// XML namespace of `repomd.xml`.
pub const REPO_NAMESPACE: &str = "http://linux.duke.edu/metadata/repo";

/// Where the id of a `<package>` record lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackageIdLocation {
    /// The `pkgid` attribute of the `<package>` element.
    Attribute,
    /// The text of the `<checksum pkgid="YES">` child of `<package>`.
    ChecksumElement,
}

/// A kind of package metadata document.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MetadataDialect {
    /// `primary.xml`.
    Primary,
    /// `filelists.xml`.
    Filelists,
    /// `other.xml`.
    Other,
}

impl MetadataDialect {
    /// All dialects, in the order they are advertised in `repomd.xml`.
    pub fn all() -> impl Iterator<Item = Self> {
        [Self::Primary, Self::Filelists, Self::Other].into_iter()
    }

    /// The `type` of this dialect's `<data>` entry in `repomd.xml`.
    pub fn data_type(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Filelists => "filelists",
            Self::Other => "other",
        }
    }

    /// Resolve a dialect from a `repomd.xml` data type.
    pub fn from_data_type(value: &str) -> Option<Self> {
        Self::all().find(|dialect| dialect.data_type() == value)
    }

    /// Local name of the document's root element.
    pub fn root_element(&self) -> &'static str {
        match self {
            Self::Primary => "metadata",
            Self::Filelists => "filelists",
            Self::Other => "otherdata",
        }
    }

    /// Namespace bindings declared on the root element, as `(prefix, uri)`.
    ///
    /// An empty prefix is the default namespace.
    pub fn namespaces(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Primary => &[("", COMMON_NAMESPACE), ("rpm", RPM_NAMESPACE)],
            Self::Filelists => &[("", FILELISTS_NAMESPACE)],
            Self::Other => &[("", OTHER_NAMESPACE)],
        }
    }

    /// Where `<package>` records of this dialect hold their id.
    pub fn package_id_location(&self) -> PackageIdLocation {
        match self {
            Self::Primary => PackageIdLocation::ChecksumElement,
            Self::Filelists | Self::Other => PackageIdLocation::Attribute,
        }
    }

    /// The file name of this dialect before any naming policy is applied.
    pub fn logical_name(&self, compression: Compression) -> String {
        format!("{}.xml{}", self.data_type(), compression.extension())
    }

    /// Render the `xmlns` declarations of the root element.
    pub(crate) fn namespace_declarations(&self) -> String {
        self.namespaces()
            .iter()
            .map(|(prefix, uri)| {
                if prefix.is_empty() {
                    format!(" xmlns=\"{}\"", uri)
                } else {
                    format!(" xmlns:{}=\"{}\"", prefix, uri)
                }
            })
            .collect()
    }

    /// A document of this dialect holding no packages.
    pub fn empty_document(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{root}{ns} packages=\"0\">\n</{root}>\n",
            root = self.root_element(),
            ns = self.namespace_declarations()
        )
    }
}

impl std::fmt::Display for MetadataDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.data_type())
    }
}
