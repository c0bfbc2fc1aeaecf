// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! RPM repository metadata maintenance.

This crate produces and updates the metadata of RPM package repositories.

RPM repositories have a `repodata` directory containing a `repomd.xml` file.
This `repomd.xml` file (represented by [metadata::repomd::RepoMd]) describes other
_metadata_ files constituting the repository: `primary.xml`, `filelists.xml` and
`other.xml`. Each of these holds one `<package>` record per package.

These documents can be very large. This crate never holds a whole document in
memory: documents are rewritten as streams of XML events. The
[metadata::maid::XmlMaid] removes records from a document and the
[metadata::merge::MergedXml] combines removal with the addition of new records.

A [Repository] produces a complete set of metadata files in a local directory.
Packages are fed to it via [Repository::update], possibly from many threads.
[Repository::save] finalizes every file, names it according to a
[NamingPolicy] and writes `repomd.xml` last.

[RpmRepository] drives full and incremental updates of a repository held in
[storage::BlobStorage], publishing new metadata only once it has been completely
produced.

Extracting metadata from RPM package headers is not provided. Callers supply a
[package::PackageMetadataSource] rendering the `<package>` records of each
package.
*/

pub mod error;
pub mod io;
pub mod metadata;
pub mod naming;
pub mod output;
pub mod package;
pub mod repository;
pub mod storage;
pub mod update;

pub use crate::{
    error::{ErrorKind, Result, RpmRepositoryError},
    io::{ChecksumType, ContentDigest},
    metadata::MetadataDialect,
    naming::NamingPolicy,
    repository::{RepoConfig, Repository},
    update::{RpmRepository, UpdateSummary},
};
