// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Production of a complete set of repository metadata. */

use {
    crate::{
        error::{ErrorKind, Result, RpmRepositoryError},
        io::ChecksumType,
        metadata::{repomd::RepoMd, MetadataDialect},
        naming::NamingPolicy,
        output::{MetadataFile, PublishedFile, StagedFile},
        package::PackageMetadata,
    },
    log::info,
    serde::{Deserialize, Serialize},
    std::{
        collections::{HashMap, HashSet},
        io::{BufWriter, Write},
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

/// Name of the repository index file.
pub const REPOMD_XML: &str = "repomd.xml";

/// Settings controlling how metadata is produced.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Digest used for package ids and metadata checksums.
    pub checksum: ChecksumType,
    /// Naming of published metadata files.
    pub naming: NamingPolicy,
    /// Whether to produce `filelists.xml`.
    pub filelists: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            checksum: ChecksumType::Sha256,
            naming: NamingPolicy::SHA256,
            filelists: true,
        }
    }
}

impl RepoConfig {
    /// Dialects produced under this configuration.
    pub fn dialects(&self) -> impl Iterator<Item = MetadataDialect> + '_ {
        MetadataDialect::all().filter(move |d| self.filelists || *d != MetadataDialect::Filelists)
    }
}

/// Result of saving a [Repository].
#[derive(Clone, Debug)]
pub struct SavedRepository {
    /// Finalized metadata files, in `repomd.xml` order.
    pub files: Vec<PublishedFile>,
    /// Path of the written `repomd.xml`.
    pub repomd: PathBuf,
}

impl SavedRepository {
    /// All written paths. `repomd.xml` is last.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .map(|f| f.path.clone())
            .chain(std::iter::once(self.repomd.clone()))
            .collect()
    }

    /// The published file of a dialect.
    pub fn file(&self, dialect: MetadataDialect) -> Option<&PublishedFile> {
        self.files.iter().find(|f| f.dialect == dialect)
    }
}

/// Accumulates packages into the metadata files of a repository.
///
/// Packages may be added concurrently. Saving consumes the instance: a repository
/// is written once. Once an update fails, the repository can no longer be saved.
pub struct Repository {
    dir: PathBuf,
    config: RepoConfig,
    outputs: Vec<MetadataFile>,
    failed: Mutex<Option<(ErrorKind, String)>>,
}

impl Repository {
    /// Start a new repository with no packages, writing files to `dir`.
    pub fn new(dir: impl AsRef<Path>, config: RepoConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dir.display()), e))?;

        let outputs = config
            .dialects()
            .map(|dialect| MetadataFile::new(dialect, dir))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            outputs,
            failed: Mutex::new(None),
        })
    }

    /// Start an update of existing metadata, writing files to `dir`.
    ///
    /// `existing` holds the uncompressed current document of each dialect. Dialects
    /// without one start empty. Packages whose id is in `removal` are dropped.
    pub fn incremental(
        dir: impl AsRef<Path>,
        config: RepoConfig,
        existing: &HashMap<MetadataDialect, PathBuf>,
        removal: HashSet<String>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dir.display()), e))?;

        let outputs = config
            .dialects()
            .map(|dialect| match existing.get(&dialect) {
                Some(path) => MetadataFile::incremental(dialect, dir, path, removal.clone()),
                None => MetadataFile::new(dialect, dir),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            outputs,
            failed: Mutex::new(None),
        })
    }

    /// The configuration of this repository.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Add a package to every metadata file.
    ///
    /// The fragments of every dialect are validated before any file takes the
    /// package. A failure prevents the repository from being saved.
    pub fn update(&self, package: &dyn PackageMetadata) -> Result<()> {
        let res = self
            .add(package)
            .map_err(|e| e.for_package(package.pkgid()));

        if let Err(e) = &res {
            self.failed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get_or_insert_with(|| (e.kind(), e.to_string()));
        }

        res
    }

    fn add(&self, package: &dyn PackageMetadata) -> Result<()> {
        let fragments = self
            .outputs
            .iter()
            .map(|output| output.render(package))
            .collect::<Result<Vec<_>>>()?;

        for (output, fragment) in self.outputs.iter().zip(&fragments) {
            output.append(package, fragment)?;
        }

        Ok(())
    }

    /// Finalize every metadata file and write `repomd.xml`.
    ///
    /// Returns the paths of all written files, `repomd.xml` last.
    pub fn save(self, naming: NamingPolicy, checksum: ChecksumType) -> Result<Vec<PathBuf>> {
        Ok(self.close(naming, checksum)?.paths())
    }

    /// Like [Self::save] but describing the written files.
    ///
    /// Every file is produced under a temporary name first. Files are renamed to
    /// their final names only once all of them exist, `repomd.xml` last. On error,
    /// previously published files are left untouched.
    pub fn close(self, naming: NamingPolicy, checksum: ChecksumType) -> Result<SavedRepository> {
        if let Some((kind, message)) = self
            .failed
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(RpmRepositoryError::UpdateFailed { kind, message });
        }

        let staged = self
            .outputs
            .into_iter()
            .map(|output| output.stage(naming, checksum))
            .collect::<Result<Vec<_>>>()?;

        let files = staged
            .iter()
            .map(|file| file.published().clone())
            .collect::<Vec<_>>();

        let revision = chrono::Utc::now().timestamp();
        let repomd = RepoMd::from_published(revision, &files);

        let part = self.dir.join(format!("{}.part", REPOMD_XML));
        let path = self.dir.join(REPOMD_XML);

        let write = || -> Result<()> {
            let fh = std::fs::File::create(&part)?;
            let mut writer = BufWriter::new(fh);
            repomd.to_writer(&mut writer)?;
            writer.flush()?;

            Ok(())
        };

        let commit = || -> Result<()> {
            write().map_err(|e| e.for_document(REPOMD_XML))?;

            staged
                .into_iter()
                .map(StagedFile::commit)
                .collect::<Result<Vec<_>>>()?;

            std::fs::rename(&part, &path)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", path.display()), e))
        };

        if let Err(e) = commit() {
            let _ = std::fs::remove_file(&part);
            return Err(e);
        }

        info!("wrote {} (revision {})", path.display(), revision);

        Ok(SavedRepository {
            files,
            repomd: path,
        })
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            io::{read_decompressed, Compression, ContentDigest},
            metadata::maid::test::summarize,
            package::test::sample_package,
        },
        std::io::{BufReader, Read},
    };

    fn decompress(path: &Path) -> Result<Vec<u8>> {
        let mut data = vec![];
        read_decompressed(BufReader::new(std::fs::File::open(path)?), Compression::Gzip)
            .read_to_end(&mut data)?;

        Ok(data)
    }

    #[test]
    fn config_serde() -> Result<()> {
        let config: RepoConfig = serde_xml_rs::from_str(
            "<config><checksum>sha1</checksum><naming>plain</naming></config>",
        )?;

        assert_eq!(config.checksum, ChecksumType::Sha1);
        assert_eq!(config.naming, NamingPolicy::PLAIN);
        assert!(config.filelists);
        assert_eq!(RepoConfig::default().dialects().count(), 3);
        assert_eq!(
            RepoConfig {
                filelists: false,
                ..Default::default()
            }
            .dialects()
            .collect::<Vec<_>>(),
            vec![MetadataDialect::Primary, MetadataDialect::Other]
        );

        Ok(())
    }

    #[test]
    fn empty_repository() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = Repository::new(td.path(), RepoConfig::default())?;

        let paths = repo.save(NamingPolicy::PLAIN, ChecksumType::Sha256)?;
        assert_eq!(
            paths,
            vec![
                td.path().join("primary.xml.gz"),
                td.path().join("filelists.xml.gz"),
                td.path().join("other.xml.gz"),
                td.path().join("repomd.xml"),
            ]
        );

        Ok(())
    }

    #[test]
    fn concurrent_updates() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = Repository::new(td.path(), RepoConfig::default())?;

        std::thread::scope(|s| {
            for thread in 0..4 {
                let repo = &repo;
                s.spawn(move || {
                    for i in 0..25 {
                        let name = format!("pkg-{}-{}", thread, i);
                        repo.update(&sample_package(&name, &name, &format!("{}.rpm", name)))
                            .unwrap();
                    }
                });
            }
        });

        let saved = repo.close(NamingPolicy::SHA256, ChecksumType::Sha256)?;

        for file in &saved.files {
            let (count, ids) = summarize(file.dialect, &decompress(&file.path)?)?;
            assert_eq!(count, 100);
            assert_eq!(ids.len(), 100);
            assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);
        }

        Ok(())
    }

    #[test]
    fn repomd_describes_files() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = Repository::new(
            td.path(),
            RepoConfig {
                filelists: false,
                ..Default::default()
            },
        )?;
        repo.update(&sample_package("ng1", "nginx", "Packages/nginx.rpm"))?;

        let saved = repo.close(NamingPolicy::SHA1, ChecksumType::Sha1)?;
        assert!(!td.path().join("repomd.xml.part").exists());

        let repomd = RepoMd::from_reader(std::fs::File::open(&saved.repomd)?)?;
        assert_eq!(repomd.data.len(), 2);
        assert!(repomd.data_for(MetadataDialect::Filelists).is_none());

        for dialect in [MetadataDialect::Primary, MetadataDialect::Other] {
            let data = repomd.data_for(dialect).unwrap();
            let file = saved.file(dialect).unwrap();

            assert_eq!(data.file_name()?, file.name);
            let (size, digest) = data.expected_content()?;
            assert_eq!(size, std::fs::metadata(&file.path)?.len());
            assert_eq!(digest, ContentDigest::from_path(ChecksumType::Sha1, &file.path)?);
            assert_eq!(data.open_size, Some(decompress(&file.path)?.len() as u64));
        }

        Ok(())
    }

    #[test]
    fn update_errors_name_package() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = Repository::new(td.path(), RepoConfig::default())?;

        let bad = crate::package::PackageFragments::new("bad1", "bad", "bad.rpm");
        let err = repo.update(&bad).unwrap_err();

        assert!(matches!(err, RpmRepositoryError::Package(ref id, _) if id == "bad1"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Xml);

        Ok(())
    }

    #[test]
    fn failed_update_prevents_save() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = Repository::new(td.path(), RepoConfig::default())?;
        repo.update(&sample_package("ok1", "ok", "ok.rpm"))?;

        // Only the primary fragment is valid.
        let primary = sample_package("p1", "p", "p.rpm")
            .fragment(MetadataDialect::Primary)?
            .to_string();
        let partial = crate::package::PackageFragments::new("p1", "p", "p.rpm")
            .with_fragment(MetadataDialect::Primary, primary);
        assert!(repo.update(&partial).is_err());

        for output in &repo.outputs {
            assert_eq!(output.accepted(), 1);
        }

        let err = repo
            .save(NamingPolicy::PLAIN, ChecksumType::Sha256)
            .expect_err("save after failed update");
        assert!(matches!(err, RpmRepositoryError::UpdateFailed { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Xml);
        assert_eq!(std::fs::read_dir(td.path())?.count(), 0);

        Ok(())
    }

    #[test]
    fn failed_save_keeps_published_files() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = td.path().join("repodata");

        let repo = Repository::new(&dir, RepoConfig::default())?;
        repo.update(&sample_package("old1", "old", "Packages/old.rpm"))?;
        repo.save(NamingPolicy::PLAIN, ChecksumType::Sha256)?;

        let primary_before = std::fs::read(dir.join("primary.xml.gz"))?;
        let repomd_before = std::fs::read(dir.join(REPOMD_XML))?;

        let primary = td.path().join("primary.xml");
        std::fs::write(&primary, decompress(&dir.join("primary.xml.gz"))?)?;
        let other = td.path().join("other.xml");
        std::fs::write(
            &other,
            "<otherdata packages=\"1\"><package name=\"x\"></package></otherdata>",
        )?;

        let existing: HashMap<_, _> = [
            (MetadataDialect::Primary, primary),
            (MetadataDialect::Other, other),
        ]
        .into_iter()
        .collect();

        let repo = Repository::incremental(&dir, RepoConfig::default(), &existing, HashSet::new())?;
        repo.update(&sample_package("new1", "new", "Packages/new.rpm"))?;

        assert!(repo.save(NamingPolicy::PLAIN, ChecksumType::Sha256).is_err());

        assert_eq!(std::fs::read(dir.join("primary.xml.gz"))?, primary_before);
        assert_eq!(std::fs::read(dir.join(REPOMD_XML))?, repomd_before);

        let mut names = std::fs::read_dir(&dir)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>>>()?;
        names.sort();
        assert_eq!(
            names,
            vec!["filelists.xml.gz", "other.xml.gz", "primary.xml.gz", "repomd.xml"]
        );

        Ok(())
    }

    #[test]
    fn incremental_repository() -> Result<()> {
        let td = tempfile::tempdir()?;
        let existing_path = td.path().join("other.xml");
        std::fs::write(&existing_path, include_str!("../testdata/other.xml"))?;

        let mut existing = HashMap::new();
        existing.insert(MetadataDialect::Other, existing_path);

        let repo = Repository::incremental(
            td.path().join("out"),
            RepoConfig::default(),
            &existing,
            ["abc123".to_string()].into_iter().collect(),
        )?;
        repo.update(&sample_package("t1", "time", "Packages/time.rpm"))?;

        let saved = repo.close(NamingPolicy::PLAIN, ChecksumType::Sha256)?;

        let other = saved.file(MetadataDialect::Other).unwrap();
        assert_eq!(other.records.count, 3);
        assert_eq!(other.records.surviving, 2);

        // No existing primary document: it holds only the new package.
        assert_eq!(saved.file(MetadataDialect::Primary).unwrap().records.count, 1);

        Ok(())
    }
}
