// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Merging of new package records into metadata documents.

A merge is a single streaming transform of an existing document: records named by
a removal set are dropped, new `<package>` fragments are appended after the
surviving records and the root `packages` attribute is rewritten to the new total.

Replacing a package is removal of its old id plus an append of its new fragment.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ChecksumType, ContentDigest},
        metadata::{
            codec::{stream_fragments, RecordWriter},
            maid::{filter_records, NullSink, RecordSink},
            MetadataDialect,
        },
        package::{PackageMetadata, PackageMetadataSource},
    },
    log::debug,
    std::{
        collections::{BTreeMap, HashSet},
        io::{Read, Seek, SeekFrom, Write},
        path::PathBuf,
    },
    xml::reader::XmlEvent,
};

/// Outcome of a merge.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeResult {
    /// Number of `<package>` records in the merged document.
    pub count: u64,
    /// Number of records carried over from the input document.
    pub surviving: u64,
    /// Number of records appended.
    pub appended: u64,
}

/// Copies surviving events, writing appended records before the root end tag.
struct AppendingSink<'a, W: Write, F> {
    writer: &'a mut RecordWriter<W>,
    count: u64,
    append: Option<F>,
    appended: u64,
}

impl<'a, W, F> RecordSink for AppendingSink<'a, W, F>
where
    W: Write,
    F: FnOnce(&mut RecordWriter<W>) -> Result<u64>,
{
    fn root_start(&mut self, event: &XmlEvent) -> Result<()> {
        self.writer.start_document()?;
        self.writer.write_root_start(event, self.count)
    }

    fn root_end(&mut self, event: &XmlEvent) -> Result<()> {
        if let Some(append) = self.append.take() {
            self.appended = append(self.writer)?;
        }

        self.writer.write_event(event)
    }

    fn event(&mut self, event: &XmlEvent) -> Result<()> {
        self.writer.write_event(event)
    }
}

/// Merges package records into a metadata document.
///
/// The input is read twice, so it must be seekable. Output written before an error
/// is not a valid document.
pub struct MergedXml<R, W> {
    input: R,
    output: W,
    dialect: MetadataDialect,
    removal: HashSet<String>,
}

impl<R: Read + Seek, W: Write> MergedXml<R, W> {
    /// Construct an instance merging `input` into `output`.
    ///
    /// Records of `input` whose id is in `removal` are not carried over.
    pub fn new(input: R, output: W, dialect: MetadataDialect, removal: HashSet<String>) -> Self {
        Self {
            input,
            output,
            dialect,
            removal,
        }
    }

    /// Append the records of packages.
    ///
    /// Records are appended in iteration order. An existing record with the id of an
    /// appended package is replaced.
    pub fn merge(mut self, packages: &[&dyn PackageMetadata]) -> Result<MergeResult> {
        self.removal
            .extend(packages.iter().map(|p| p.pkgid().to_string()));

        let dialect = self.dialect;

        self.run(packages.len() as u64, |writer| {
            for package in packages {
                append_package(dialect, writer, *package)
                    .map_err(|e| e.for_package(package.pkgid()))?;
            }

            Ok(packages.len() as u64)
        })
    }

    /// Append the records of package files.
    ///
    /// `mapping` maps the local path of each package file to the location it is
    /// published at. Each file is digested with `checksum` and described by `source`.
    pub fn merge_paths(
        self,
        mapping: &BTreeMap<PathBuf, String>,
        checksum: ChecksumType,
        source: &dyn PackageMetadataSource,
    ) -> Result<MergeResult> {
        let packages = mapping
            .iter()
            .map(|(path, location)| {
                let digest = ContentDigest::from_path(checksum, path)
                    .map_err(|e| e.for_package(location))?;

                source
                    .package_metadata(path, location, &digest)
                    .map_err(|e| e.for_package(location))
            })
            .collect::<Result<Vec<_>>>()?;

        let refs = packages.iter().map(|p| p.as_ref()).collect::<Vec<_>>();

        self.merge(&refs)
    }

    /// Append `count` records read from concatenated fragments.
    ///
    /// The reader must yield exactly `count` `<package>` elements.
    pub fn merge_fragments(self, count: u64, fragments: impl Read) -> Result<MergeResult> {
        let dialect = self.dialect;

        self.run(count, move |writer| {
            let seen = stream_fragments(
                dialect,
                fragments,
                |event| writer.write_event(event),
                |_| Ok(()),
            )?;

            if seen != count {
                return Err(RpmRepositoryError::XmlMalformed(format!(
                    "expected {} {} fragments; got {}",
                    count, dialect, seen
                )));
            }

            Ok(seen)
        })
    }

    fn run<F>(mut self, appended: u64, append: F) -> Result<MergeResult>
    where
        F: FnOnce(&mut RecordWriter<W>) -> Result<u64>,
    {
        let surviving = filter_records(self.dialect, &mut self.input, &self.removal, &mut NullSink)?;

        self.input.seek(SeekFrom::Start(0))?;

        let count = surviving + appended;
        debug!(
            "merging {}: {} surviving + {} appended = {}",
            self.dialect, surviving, appended, count
        );

        let mut writer = RecordWriter::new(self.output);
        let mut sink = AppendingSink {
            writer: &mut writer,
            count,
            append: Some(append),
            appended: 0,
        };

        let written = filter_records(self.dialect, &mut self.input, &self.removal, &mut sink)?;

        if written != surviving || sink.appended != appended {
            return Err(RpmRepositoryError::XmlMalformed(format!(
                "{} record count changed during merge",
                self.dialect
            )));
        }

        writer.into_inner().flush()?;

        Ok(MergeResult {
            count,
            surviving,
            appended,
        })
    }
}

/// Write the fragment of a package after validating it holds exactly its own record.
pub(crate) fn append_package<W: Write>(
    dialect: MetadataDialect,
    writer: &mut RecordWriter<W>,
    package: &dyn PackageMetadata,
) -> Result<()> {
    let fragment = package.fragment(dialect)?;
    let mut events = vec![];
    let mut ids = vec![];

    let count = stream_fragments(
        dialect,
        fragment.as_bytes(),
        |event| {
            events.push(event.clone());
            Ok(())
        },
        |id| {
            ids.push(id.to_string());
            Ok(())
        },
    )?;

    validate_fragment(package, count, &ids)?;

    for event in &events {
        writer.write_event(event)?;
    }

    Ok(())
}

/// Verify a fragment held a single record carrying the package's id.
pub(crate) fn validate_fragment(
    package: &dyn PackageMetadata,
    count: u64,
    ids: &[String],
) -> Result<()> {
    if count != 1 {
        return Err(RpmRepositoryError::FragmentPackageCount(count));
    }

    match ids.first() {
        Some(id) if id == package.pkgid() => Ok(()),
        Some(id) => Err(RpmRepositoryError::FragmentPackageIdMismatch {
            expected: package.pkgid().to_string(),
            actual: id.clone(),
        }),
        None => Err(RpmRepositoryError::PackageMissingId),
    }
}
