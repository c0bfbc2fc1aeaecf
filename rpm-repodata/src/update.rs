// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Maintenance of the metadata of a stored repository.

[RpmRepository] regenerates the `repodata` of a repository held in [BlobStorage]
from the `.rpm` files it contains, either from scratch or by updating the existing
metadata with only the packages that changed.

Metadata is produced in a local staging directory. Nothing is written to storage
until every file has been produced. Data files are then uploaded under temporary
keys and moved into place once all uploads succeed. `repomd.xml` follows, and
finally metadata files referenced only by the previous `repomd.xml` are deleted.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{read_decompressed, Compression, ContentDigest, ContentValidatingReader, DigestingReader},
        metadata::{
            primary::scan_packages,
            repomd::{RepoMd, RepoMdData, REPODATA_DIR},
            MetadataDialect,
        },
        package::{PackageMetadata, PackageMetadataSource},
        repository::{RepoConfig, Repository, SavedRepository, REPOMD_XML},
        storage::BlobStorage,
    },
    log::{debug, info, warn},
    rayon::prelude::*,
    std::{
        collections::{HashMap, HashSet},
        fs::File,
        io::{BufReader, BufWriter, Write},
        path::{Path, PathBuf},
    },
};

/// Filename extension of package files.
const RPM_EXTENSION: &str = ".rpm";

/// Suffix of metadata files being uploaded.
const UPLOAD_SUFFIX: &str = ".new";

/// Describes the outcome of an update.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateSummary {
    /// Number of packages in the repository.
    pub packages: u64,
    /// Number of packages whose metadata was added.
    pub added: u64,
    /// Number of package records dropped from the previous metadata.
    ///
    /// Always 0 for full rebuilds.
    pub removed: u64,
    /// Storage keys written, `repomd.xml` last.
    pub published: Vec<String>,
}

/// A package file copied into the staging directory.
struct StagedPackage {
    key: String,
    path: PathBuf,
    digest: ContentDigest,
}

/// A repository in blob storage whose metadata we maintain.
pub struct RpmRepository {
    storage: Box<dyn BlobStorage>,
    source: Box<dyn PackageMetadataSource>,
    config: RepoConfig,
}

impl RpmRepository {
    /// Construct a new instance.
    ///
    /// `source` describes package files. Package ids it reports must be the hex
    /// digest of the package file using the configured checksum.
    pub fn new(
        storage: impl BlobStorage + 'static,
        source: impl PackageMetadataSource + 'static,
        config: RepoConfig,
    ) -> Self {
        Self {
            storage: Box::new(storage),
            source: Box::new(source),
            config,
        }
    }

    /// The storage backing this repository.
    pub fn storage(&self) -> &dyn BlobStorage {
        self.storage.as_ref()
    }

    /// The configuration of this repository.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    fn repomd_key() -> String {
        format!("{}/{}", REPODATA_DIR, REPOMD_XML)
    }

    /// The current `repomd.xml`, if there is one.
    fn read_repomd(&self) -> Result<Option<RepoMd>> {
        let key = Self::repomd_key();

        if !self.storage.exists(&key)? {
            return Ok(None);
        }

        Ok(Some(
            RepoMd::from_reader(self.storage.get(&key)?).map_err(|e| e.for_document(&key))?,
        ))
    }

    /// Storage keys of package files under `prefix`.
    fn package_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let repodata = format!("{}/", REPODATA_DIR);

        Ok(self
            .storage
            .list(prefix)?
            .into_iter()
            .filter(|key| key.ends_with(RPM_EXTENSION) && !key.starts_with(&repodata))
            .collect())
    }

    /// Copy packages into `dir`, digesting them along the way.
    fn stage_packages(&self, keys: &[String], dir: &Path) -> Result<Vec<StagedPackage>> {
        std::fs::create_dir_all(dir)
            .map_err(|e| RpmRepositoryError::IoPath(format!("{}", dir.display()), e))?;

        keys.par_iter()
            .enumerate()
            .map(|(index, key)| {
                let path = dir.join(format!("{}{}", index, RPM_EXTENSION));

                let stage = || -> Result<ContentDigest> {
                    let mut reader = DigestingReader::new(self.storage.get(key)?, self.config.checksum);
                    let mut fh = BufWriter::new(File::create(&path)?);
                    std::io::copy(&mut reader, &mut fh)?;
                    fh.flush()?;

                    Ok(reader.finish().1)
                };

                let digest = stage().map_err(|e| e.for_package(key))?;
                debug!("staged {} ({})", key, digest.digest_hex());

                Ok(StagedPackage {
                    key: key.clone(),
                    path,
                    digest,
                })
            })
            .collect()
    }

    /// Obtain metadata of staged packages.
    ///
    /// Packages are described in parallel. Results are in input order.
    fn describe(&self, packages: &[&StagedPackage]) -> Result<Vec<Box<dyn PackageMetadata>>> {
        packages
            .par_iter()
            .map(|package| {
                let metadata = self
                    .source
                    .package_metadata(&package.path, &package.key, &package.digest)
                    .map_err(|e| e.for_package(&package.key))?;

                let expected = package.digest.digest_hex();
                if metadata.pkgid() != expected {
                    return Err(RpmRepositoryError::FragmentPackageIdMismatch {
                        expected,
                        actual: metadata.pkgid().to_string(),
                    }
                    .for_package(&package.key));
                }

                Ok(metadata)
            })
            .collect()
    }

    /// Rebuild metadata from every package under `prefix`.
    ///
    /// Existing metadata is ignored and replaced.
    pub fn batch_update(&self, prefix: &str) -> Result<UpdateSummary> {
        let previous = match self.read_repomd() {
            Ok(repomd) => repomd,
            Err(e) => {
                warn!("ignoring unreadable existing metadata: {}", e);
                None
            }
        };

        let keys = self.package_keys(prefix)?;
        info!(
            "rebuilding repository metadata from {} packages under {:?}",
            keys.len(),
            prefix
        );

        let staging = tempfile::Builder::new()
            .prefix("rpm-repodata-")
            .tempdir()?;

        let staged = self.stage_packages(&keys, &staging.path().join("packages"))?;
        let packages = self.describe(&staged.iter().collect::<Vec<_>>())?;

        let repo = Repository::new(staging.path().join(REPODATA_DIR), self.config)?;
        let added = populate(&repo, packages)?;
        let saved = repo.close(self.config.naming, self.config.checksum)?;

        self.finish(saved, previous.as_ref(), added, 0)
    }

    /// Update metadata to reflect the packages under `prefix`.
    ///
    /// Only packages that were added or changed since the metadata was produced are
    /// described. Falls back to [Self::batch_update] when there is no usable existing
    /// metadata.
    pub fn batch_update_incrementally(&self, prefix: &str) -> Result<UpdateSummary> {
        let repomd_key = Self::repomd_key();

        let repomd = match self.read_repomd()? {
            Some(repomd) => repomd,
            None => {
                info!("{} does not exist; performing full rebuild", repomd_key);
                return self.batch_update(prefix);
            }
        };

        let staging = tempfile::Builder::new()
            .prefix("rpm-repodata-")
            .tempdir()?;
        let existing_dir = staging.path().join("existing");
        std::fs::create_dir_all(&existing_dir)?;

        let mut existing = HashMap::new();

        for dialect in self.config.dialects() {
            let data = match repomd.data_for(dialect) {
                Some(data) => data,
                None => {
                    warn!(
                        "{} lacks {} metadata; performing full rebuild",
                        repomd_key, dialect
                    );
                    return self.batch_update(prefix);
                }
            };

            let path = existing_dir.join(format!("{}.xml", dialect.data_type()));
            self.fetch_existing(data, &existing_dir, &path)
                .map_err(|e| e.for_document(&data.location.href))?;

            existing.insert(dialect, path);
        }

        let present = match existing.get(&MetadataDialect::Primary) {
            Some(path) => scan_packages(BufReader::new(File::open(path)?))?,
            None => vec![],
        };

        let keys = self.package_keys(prefix)?;
        let staged = self.stage_packages(&keys, &staging.path().join("packages"))?;

        let desired = staged
            .iter()
            .map(|p| (p.digest.digest_hex(), p.key.as_str()))
            .collect::<HashSet<_>>();

        let removal = present
            .iter()
            .filter(|r| !desired.contains(&(r.pkgid.clone(), r.location.as_str())))
            .map(|r| r.pkgid.clone())
            .collect::<HashSet<_>>();

        let removed = present
            .iter()
            .filter(|r| removal.contains(&r.pkgid))
            .count() as u64;

        let surviving = present
            .iter()
            .filter(|r| !removal.contains(&r.pkgid))
            .map(|r| r.pkgid.as_str())
            .collect::<HashSet<_>>();

        let appended = staged
            .iter()
            .filter(|p| !surviving.contains(p.digest.digest_hex().as_str()))
            .collect::<Vec<_>>();

        info!(
            "updating repository metadata: {} packages present, {} removed, {} to add",
            present.len(),
            removed,
            appended.len()
        );

        let packages = self.describe(&appended)?;

        let repo = Repository::incremental(
            staging.path().join(REPODATA_DIR),
            self.config,
            &existing,
            removal,
        )?;
        let added = populate(&repo, packages)?;
        let saved = repo.close(self.config.naming, self.config.checksum)?;

        self.finish(saved, Some(&repomd), added, removed)
    }

    /// Fetch and verify an existing metadata file, decompressing it to `dest`.
    fn fetch_existing(&self, data: &RepoMdData, dir: &Path, dest: &Path) -> Result<()> {
        let file_name = data.file_name()?;
        let (size, digest) = data.expected_content()?;

        let raw = dir.join(format!("{}.raw", file_name));
        {
            let mut reader =
                ContentValidatingReader::new(self.storage.get(&data.location.href)?, size, digest);
            let mut fh = BufWriter::new(File::create(&raw)?);
            std::io::copy(&mut reader, &mut fh)?;
            fh.flush()?;
        }

        let mut reader = read_decompressed(
            BufReader::new(File::open(&raw)?),
            Compression::from_path(file_name),
        );
        let mut fh = BufWriter::new(File::create(dest)?);
        std::io::copy(&mut reader, &mut fh)?;
        fh.flush()?;

        debug!("fetched {}", data.location.href);

        Ok(())
    }

    /// Publish saved metadata and summarize the update.
    fn finish(
        &self,
        saved: SavedRepository,
        previous: Option<&RepoMd>,
        added: u64,
        removed: u64,
    ) -> Result<UpdateSummary> {
        let published = self.publish(&saved, previous)?;

        let packages = saved
            .file(MetadataDialect::Primary)
            .map(|f| f.records.count)
            .unwrap_or_default();

        info!(
            "published repository metadata with {} packages ({} added, {} removed)",
            packages, added, removed
        );

        Ok(UpdateSummary {
            packages,
            added,
            removed,
            published,
        })
    }

    fn put_file(&self, path: &Path, key: &str) -> Result<()> {
        let mut fh = BufReader::new(
            File::open(path)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", path.display()), e))?,
        );
        let size = self.storage.put(key, &mut fh)?;
        debug!("stored {} ({} bytes)", key, size);

        Ok(())
    }

    /// Upload data files under temporary keys, then move them into place.
    ///
    /// On error, no data file key is touched and uploads are removed.
    fn store_data_files(&self, saved: &SavedRepository) -> Result<Vec<String>> {
        let mut uploads = vec![];

        let res = saved.files.iter().try_for_each(|file| {
            let key = format!("{}/{}", REPODATA_DIR, file.name);
            let upload = format!("{}{}", key, UPLOAD_SUFFIX);
            uploads.push((upload.clone(), key));

            self.put_file(&file.path, &upload)
        });

        let res = res.and_then(|_| {
            uploads
                .iter()
                .try_for_each(|(upload, key)| self.storage.rename(upload, key))
        });

        if let Err(e) = res {
            for (upload, _) in &uploads {
                if self.storage.exists(upload).unwrap_or(false) {
                    let _ = self.storage.delete(upload);
                }
            }

            return Err(e);
        }

        Ok(uploads.into_iter().map(|(_, key)| key).collect())
    }

    /// Store saved metadata files and remove stale ones.
    ///
    /// Stale files are the metadata files of the dialects we maintain that
    /// `previous` references and that were not just stored. Other content of the
    /// `repodata` directory is left alone.
    fn publish(&self, saved: &SavedRepository, previous: Option<&RepoMd>) -> Result<Vec<String>> {
        let mut published = self.store_data_files(saved)?;

        let repomd_key = Self::repomd_key();
        self.put_file(&saved.repomd, &repomd_key)?;
        info!("stored {}", repomd_key);
        published.push(repomd_key);

        let keep = published.iter().map(|x| x.as_str()).collect::<HashSet<_>>();

        for data in previous.iter().flat_map(|repomd| repomd.data.iter()) {
            if data.dialect().is_none() {
                continue;
            }

            let key = match data.file_name() {
                Ok(name) => format!("{}/{}", REPODATA_DIR, name),
                Err(e) => {
                    warn!("not removing {}: {}", data.location.href, e);
                    continue;
                }
            };

            if !keep.contains(key.as_str()) && self.storage.exists(&key)? {
                info!("removing stale {}", key);
                self.storage.delete(&key)?;
            }
        }

        Ok(published)
    }
}

/// Add packages to a repository in order.
///
/// Only the first package with a given id is added. Returns the number added.
fn populate(repo: &Repository, packages: Vec<Box<dyn PackageMetadata>>) -> Result<u64> {
    let mut seen = HashSet::new();
    let mut added = 0;

    for package in packages {
        if !seen.insert(package.pkgid().to_string()) {
            warn!(
                "{} has the same content as another package; ignoring",
                package.location()
            );
            continue;
        }

        repo.update(package.as_ref())?;
        added += 1;
    }

    Ok(added)
}
