// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Metadata files being produced.

A [MetadataFile] accumulates the records of one dialect during an update cycle and
finalizes them into a published, compressed document.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ChecksumType, Compression, ContentDigest, DigestingWriter},
        metadata::{
            codec::stream_fragments,
            merge::{validate_fragment, MergeResult, MergedXml},
            MetadataDialect,
        },
        naming::NamingPolicy,
        package::PackageMetadata,
    },
    log::{debug, info},
    std::{
        borrow::Cow,
        collections::HashSet,
        fs::File,
        io::{BufReader, BufWriter, Write},
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

/// Something that receives package metadata.
pub trait PackageOutput: Send + Sync {
    /// Add a package.
    fn accept(&self, package: &dyn PackageMetadata) -> Result<()>;
}

/// A finalized metadata file.
#[derive(Clone, Debug)]
pub struct PublishedFile {
    /// The dialect of the document.
    pub dialect: MetadataDialect,
    /// Published file name.
    pub name: String,
    /// Local path of the file.
    pub path: PathBuf,
    /// Digest of the file as stored.
    pub checksum: ContentDigest,
    /// Digest of the uncompressed document.
    pub open_checksum: ContentDigest,
    /// Size in bytes of the file as stored.
    pub size: u64,
    /// Size in bytes of the uncompressed document.
    pub open_size: u64,
    /// Seconds since UNIX epoch the file was finalized at.
    pub timestamp: i64,
    /// Record counts of the document.
    pub records: MergeResult,
}

/// Spooled fragments accepted so far.
struct FragmentSpool {
    writer: BufWriter<File>,
    count: u64,
}

fn io_path_error(path: &Path, e: std::io::Error) -> RpmRepositoryError {
    RpmRepositoryError::IoPath(format!("{}", path.display()), e)
}

/// The output file of a single metadata dialect.
///
/// Accepted fragments are spooled to disk. Closing the file merges them into a
/// base document, which is either an existing document being updated or an empty
/// one.
pub struct MetadataFile {
    dialect: MetadataDialect,
    dir: PathBuf,
    base: PathBuf,
    owns_base: bool,
    spool_path: PathBuf,
    removal: HashSet<String>,
    spool: Mutex<FragmentSpool>,
}

impl MetadataFile {
    /// Create a new, empty file in `dir`.
    pub fn new(dialect: MetadataDialect, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let base = dir.join(format!("{}.base.xml", dialect.data_type()));

        std::fs::write(&base, dialect.empty_document()).map_err(|e| io_path_error(&base, e))?;

        Self::with_base(dialect, dir, base, true, HashSet::new())
    }

    /// Create a file updating the existing uncompressed document at `existing`.
    ///
    /// Records of `existing` whose id is in `removal` are dropped.
    pub fn incremental(
        dialect: MetadataDialect,
        dir: impl AsRef<Path>,
        existing: impl AsRef<Path>,
        removal: HashSet<String>,
    ) -> Result<Self> {
        Self::with_base(
            dialect,
            dir.as_ref(),
            existing.as_ref().to_path_buf(),
            false,
            removal,
        )
    }

    fn with_base(
        dialect: MetadataDialect,
        dir: &Path,
        base: PathBuf,
        owns_base: bool,
        removal: HashSet<String>,
    ) -> Result<Self> {
        let spool_path = dir.join(format!("{}.fragments.xml", dialect.data_type()));
        let fh = File::create(&spool_path).map_err(|e| io_path_error(&spool_path, e))?;

        Ok(Self {
            dialect,
            dir: dir.to_path_buf(),
            base,
            owns_base,
            spool_path,
            removal,
            spool: Mutex::new(FragmentSpool {
                writer: BufWriter::new(fh),
                count: 0,
            }),
        })
    }

    /// The dialect of this file.
    pub fn dialect(&self) -> MetadataDialect {
        self.dialect
    }

    /// The number of packages accepted so far.
    pub fn accepted(&self) -> u64 {
        self.spool.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    /// Finalize the document and publish it under its final name.
    ///
    /// The document is compressed, named according to `naming` and digested with
    /// `checksum`. On error, no file with the published name is created.
    pub fn close(self, naming: NamingPolicy, checksum: ChecksumType) -> Result<PublishedFile> {
        self.stage(naming, checksum)?.commit()
    }

    /// Finalize the document without publishing it.
    ///
    /// The finalized document is held under a temporary name until
    /// [StagedFile::commit] is called. Dropping the [StagedFile] removes it.
    pub fn stage(self, naming: NamingPolicy, checksum: ChecksumType) -> Result<StagedFile> {
        let logical_name = self.dialect.logical_name(Compression::Gzip);
        let part = self.dir.join(format!("{}.part", logical_name));

        match self.finalize(&part, &logical_name, naming, checksum) {
            Ok(file) => Ok(StagedFile {
                part,
                file,
                committed: false,
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                Err(e.for_document(logical_name))
            }
        }
    }

    fn finalize(
        &self,
        part: &Path,
        logical_name: &str,
        naming: NamingPolicy,
        checksum: ChecksumType,
    ) -> Result<PublishedFile> {
        let count = {
            let mut spool = self.spool.lock().unwrap_or_else(|e| e.into_inner());
            spool
                .writer
                .flush()
                .map_err(|e| io_path_error(&self.spool_path, e))?;
            spool.count
        };

        let base = File::open(&self.base).map_err(|e| io_path_error(&self.base, e))?;
        let fragments =
            File::open(&self.spool_path).map_err(|e| io_path_error(&self.spool_path, e))?;
        let fh = File::create(part).map_err(|e| io_path_error(part, e))?;

        let mut writer = DigestingWriter::new(
            flate2::write::GzEncoder::new(BufWriter::new(fh), flate2::Compression::default()),
            checksum,
        );

        let records = MergedXml::new(
            BufReader::new(base),
            &mut writer,
            self.dialect,
            self.removal.clone(),
        )
        .merge_fragments(count, BufReader::new(fragments))?;

        let (encoder, open_size, open_checksum) = writer.finish();
        encoder
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()
            .map_err(|e| io_path_error(part, e))?;

        let name = naming.name(logical_name, part)?;
        let digest = ContentDigest::from_path(checksum, part)?;
        let size = std::fs::metadata(part)
            .map_err(|e| io_path_error(part, e))?
            .len();

        debug!(
            "staged {} with {} packages ({} kept, {} added)",
            name, records.count, records.surviving, records.appended
        );

        Ok(PublishedFile {
            dialect: self.dialect,
            path: self.dir.join(&name),
            name,
            checksum: digest,
            open_checksum,
            size,
            open_size,
            timestamp: chrono::Utc::now().timestamp(),
            records,
        })
    }

    /// Obtain the fragment of a package, verifying it describes exactly that package.
    pub(crate) fn render<'a>(&self, package: &'a dyn PackageMetadata) -> Result<Cow<'a, str>> {
        let fragment = package.fragment(self.dialect)?;

        let mut ids = vec![];
        let count = stream_fragments(
            self.dialect,
            fragment.as_bytes(),
            |_| Ok(()),
            |id| {
                ids.push(id.to_string());
                Ok(())
            },
        )?;

        validate_fragment(package, count, &ids)?;

        Ok(fragment)
    }

    /// Spool a fragment obtained from [Self::render].
    pub(crate) fn append(&self, package: &dyn PackageMetadata, fragment: &str) -> Result<()> {
        let mut spool = self.spool.lock().unwrap_or_else(|e| e.into_inner());
        spool
            .writer
            .write_all(fragment.as_bytes())
            .and_then(|_| spool.writer.write_all(b"\n"))
            .map_err(|e| io_path_error(&self.spool_path, e))?;
        spool.count += 1;

        debug!("{} accepted {}", self.dialect, package.pkgid());

        Ok(())
    }
}

impl Drop for MetadataFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.spool_path);
        if self.owns_base {
            let _ = std::fs::remove_file(&self.base);
        }
    }
}

impl PackageOutput for MetadataFile {
    fn accept(&self, package: &dyn PackageMetadata) -> Result<()> {
        let fragment = self.render(package)?;

        self.append(package, &fragment)
    }
}

/// A finalized metadata file not yet published under its final name.
pub struct StagedFile {
    part: PathBuf,
    file: PublishedFile,
    committed: bool,
}

impl StagedFile {
    /// Describes the file as it will be once published.
    pub fn published(&self) -> &PublishedFile {
        &self.file
    }

    /// Move the file to its final name.
    pub fn commit(mut self) -> Result<PublishedFile> {
        std::fs::rename(&self.part, &self.file.path)
            .map_err(|e| io_path_error(&self.file.path, e))?;
        self.committed = true;

        info!(
            "wrote {} with {} packages ({} kept, {} added)",
            self.file.name,
            self.file.records.count,
            self.file.records.surviving,
            self.file.records.appended
        );

        Ok(self.file.clone())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            io::read_decompressed,
            metadata::maid::test::summarize,
            package::{test::sample_package, PackageFragments},
        },
        std::io::Read,
    };

    const OTHER_XML: &str = include_str!("../testdata/other.xml");

    fn decompress(path: &Path) -> Result<Vec<u8>> {
        let mut data = vec![];
        read_decompressed(BufReader::new(File::open(path)?), Compression::Gzip)
            .read_to_end(&mut data)?;

        Ok(data)
    }

    #[test]
    fn empty_file() -> Result<()> {
        let td = tempfile::tempdir()?;

        let file = MetadataFile::new(MetadataDialect::Filelists, td.path())?;
        let published = file.close(NamingPolicy::PLAIN, ChecksumType::Sha256)?;

        assert_eq!(published.name, "filelists.xml.gz");
        assert_eq!(published.records.count, 0);
        assert_eq!(summarize(MetadataDialect::Filelists, &decompress(&published.path)?)?, (0, vec![]));

        // Only the published file remains.
        let entries = std::fs::read_dir(td.path())?.count();
        assert_eq!(entries, 1);

        Ok(())
    }

    #[test]
    fn accept_and_close() -> Result<()> {
        let td = tempfile::tempdir()?;

        let file = MetadataFile::new(MetadataDialect::Primary, td.path())?;
        file.accept(&sample_package("ng1", "nginx", "Packages/nginx.rpm"))?;
        file.accept(&sample_package("t1", "time", "Packages/time.rpm"))?;
        assert_eq!(file.accepted(), 2);

        let published = file.close(NamingPolicy::SHA256, ChecksumType::Sha256)?;

        let data = std::fs::read(&published.path)?;
        let digest = ContentDigest::from_reader(ChecksumType::Sha256, &data[..])?;
        assert_eq!(published.checksum, digest);
        assert_eq!(published.size, data.len() as u64);
        assert_eq!(
            published.name,
            format!("{}-primary.xml.gz", digest.digest_hex())
        );

        let open = decompress(&published.path)?;
        assert_eq!(published.open_size, open.len() as u64);
        assert_eq!(
            published.open_checksum,
            ContentDigest::from_reader(ChecksumType::Sha256, &open[..])?
        );
        assert_eq!(
            summarize(MetadataDialect::Primary, &open)?,
            (2, vec!["ng1".to_string(), "t1".to_string()])
        );

        Ok(())
    }

    #[test]
    fn incremental_close() -> Result<()> {
        let td = tempfile::tempdir()?;
        let existing = td.path().join("existing-other.xml");
        std::fs::write(&existing, OTHER_XML)?;

        let file = MetadataFile::incremental(
            MetadataDialect::Other,
            td.path(),
            &existing,
            ["abc123".to_string()].into_iter().collect(),
        )?;
        file.accept(&sample_package("t1", "time", "Packages/time.rpm"))?;

        let published = file.close(NamingPolicy::PLAIN, ChecksumType::Sha1)?;
        assert_eq!(published.records.surviving, 2);
        assert_eq!(published.records.appended, 1);
        assert_eq!(published.checksum.checksum_type(), ChecksumType::Sha1);

        let (count, ids) = summarize(MetadataDialect::Other, &decompress(&published.path)?)?;
        assert_eq!(count, 3);
        assert!(!ids.contains(&"abc123".to_string()));
        assert_eq!(ids.last(), Some(&"t1".to_string()));

        // Existing documents are not ours to delete.
        assert!(existing.exists());

        Ok(())
    }

    #[test]
    fn rejects_bad_fragments() -> Result<()> {
        let td = tempfile::tempdir()?;
        let file = MetadataFile::new(MetadataDialect::Other, td.path())?;

        let mismatch = PackageFragments::new("a", "a", "a.rpm")
            .with_fragment(MetadataDialect::Other, r#"<package pkgid="b"></package>"#);
        assert!(matches!(
            file.accept(&mismatch),
            Err(RpmRepositoryError::FragmentPackageIdMismatch { .. })
        ));

        let unbalanced = PackageFragments::new("a", "a", "a.rpm")
            .with_fragment(MetadataDialect::Other, r#"<package pkgid="a">"#);
        assert_eq!(
            file.accept(&unbalanced).unwrap_err().kind(),
            crate::error::ErrorKind::Xml
        );

        assert_eq!(file.accepted(), 0);

        Ok(())
    }

    #[test]
    fn staged_file_published_on_commit() -> Result<()> {
        let td = tempfile::tempdir()?;

        let file = MetadataFile::new(MetadataDialect::Other, td.path())?;
        file.accept(&sample_package("t1", "time", "Packages/time.rpm"))?;

        let staged = file.stage(NamingPolicy::PLAIN, ChecksumType::Sha256)?;
        let path = staged.published().path.clone();
        assert_eq!(path, td.path().join("other.xml.gz"));
        assert!(!path.exists());
        assert!(td.path().join("other.xml.gz.part").exists());

        let published = staged.commit()?;
        assert!(published.path.exists());
        assert_eq!(std::fs::read_dir(td.path())?.count(), 1);

        // Dropping an uncommitted file removes it.
        let file = MetadataFile::new(MetadataDialect::Primary, td.path())?;
        drop(file.stage(NamingPolicy::PLAIN, ChecksumType::Sha256)?);
        assert!(!td.path().join("primary.xml.gz").exists());
        assert!(!td.path().join("primary.xml.gz.part").exists());
        assert_eq!(std::fs::read_dir(td.path())?.count(), 1);

        Ok(())
    }

    #[test]
    fn failed_close_publishes_nothing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let existing = td.path().join("broken.xml");
        std::fs::write(&existing, "<otherdata packages=\"1\"><package name=\"x\"></package></otherdata>")?;

        let file = MetadataFile::incremental(
            MetadataDialect::Other,
            td.path(),
            &existing,
            HashSet::new(),
        )?;

        assert!(file.close(NamingPolicy::PLAIN, ChecksumType::Sha256).is_err());
        assert!(!td.path().join("other.xml.gz").exists());
        assert!(!td.path().join("other.xml.gz.part").exists());

        Ok(())
    }
}
