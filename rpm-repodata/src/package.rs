// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Package metadata as consumed by metadata documents.

Extracting metadata from RPM headers is outside this crate. Producers implement
[PackageMetadataSource] and hand out [PackageMetadata] instances rendering one
XML fragment per [MetadataDialect].
*/

use {
    crate::{error::Result, io::ContentDigest, metadata::MetadataDialect},
    std::{borrow::Cow, collections::HashMap, path::Path},
};

/// Describes a single package.
pub trait PackageMetadata: Send + Sync {
    /// The package id.
    ///
    /// This is the hex digest of the package file's content.
    fn pkgid(&self) -> &str;

    /// The name of the package.
    fn name(&self) -> &str;

    /// Path of the package file relative to the repository root.
    ///
    /// e.g. `Packages/n/nginx-1.16.1-1.el8.x86_64.rpm`.
    fn location(&self) -> &str;

    /// Render the `<package>` element of this package in a metadata document.
    ///
    /// Fragments have no XML declaration and may use the namespace prefixes of the
    /// dialect without declaring them.
    fn fragment(&self, dialect: MetadataDialect) -> Result<Cow<'_, str>>;
}

/// Produces [PackageMetadata] from package files.
pub trait PackageMetadataSource: Send + Sync {
    /// Obtain metadata for the package file at `path`.
    ///
    /// `location` is the path the package is published at. `digest` is the content
    /// digest of the file, whose hex form is the package id.
    fn package_metadata(
        &self,
        path: &Path,
        location: &str,
        digest: &ContentDigest,
    ) -> Result<Box<dyn PackageMetadata>>;
}

impl<F> PackageMetadataSource for F
where
    F: Fn(&Path, &str, &ContentDigest) -> Result<Box<dyn PackageMetadata>> + Send + Sync,
{
    fn package_metadata(
        &self,
        path: &Path,
        location: &str,
        digest: &ContentDigest,
    ) -> Result<Box<dyn PackageMetadata>> {
        self(path, location, digest)
    }
}

/// [PackageMetadata] backed by pre-rendered fragments.
#[derive(Clone, Debug)]
pub struct PackageFragments {
    pkgid: String,
    name: String,
    location: String,
    fragments: HashMap<MetadataDialect, String>,
}

impl PackageFragments {
    pub fn new(pkgid: impl ToString, name: impl ToString, location: impl ToString) -> Self {
        Self {
            pkgid: pkgid.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            fragments: HashMap::new(),
        }
    }

    /// Set the fragment of a dialect.
    #[must_use]
    pub fn with_fragment(mut self, dialect: MetadataDialect, xml: impl ToString) -> Self {
        self.fragments.insert(dialect, xml.to_string());
        self
    }
}

impl PackageMetadata for PackageFragments {
    fn pkgid(&self) -> &str {
        &self.pkgid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> &str {
        &self.location
    }

    /// A missing fragment renders as empty and will be rejected by consumers.
    fn fragment(&self, dialect: MetadataDialect) -> Result<Cow<'_, str>> {
        Ok(self
            .fragments
            .get(&dialect)
            .map(|x| Cow::Borrowed(x.as_str()))
            .unwrap_or(Cow::Borrowed("")))
    }
}
