// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Storage of repository content.

Repository content is a set of named blobs. Keys are `/` delimited paths relative
to the repository root, e.g. `repodata/repomd.xml`.
*/

use {
    crate::error::{Result, RpmRepositoryError},
    std::{
        io::{Read, Write},
        path::{Path, PathBuf},
    },
};

/// Suffix of in-flight writes.
const PART_SUFFIX: &str = ".part";

/// A store of named blobs.
pub trait BlobStorage: Send + Sync {
    /// Obtain the keys starting with `prefix`, in sorted order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Obtain a reader of a blob's content.
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Store a blob, replacing any existing content.
    ///
    /// Returns the number of bytes written. Readers never observe a partially
    /// written blob.
    fn put(&self, key: &str, reader: &mut dyn Read) -> Result<u64>;

    /// Move a blob to another key, replacing any existing content there.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a blob.
    fn delete(&self, key: &str) -> Result<()>;

    /// Whether a blob exists.
    fn exists(&self, key: &str) -> Result<bool>;
}

/// [BlobStorage] backed by a filesystem directory.
#[derive(Clone, Debug)]
pub struct FilesystemStorage {
    root_dir: PathBuf,
}

impl FilesystemStorage {
    /// Construct a new instance rooted at the specified path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: path.into(),
        }
    }

    /// The directory blobs are stored in.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(RpmRepositoryError::UnexpectedDataPath(key.to_string()));
        }

        Ok(self.root_dir.join(key))
    }
}

fn write_file(path: &Path, reader: &mut dyn Read) -> std::io::Result<u64> {
    let mut fh = std::io::BufWriter::new(std::fs::File::create(path)?);
    let size = std::io::copy(reader, &mut fh)?;
    fh.flush()?;

    Ok(size)
}

impl BlobStorage for FilesystemStorage {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root_dir.exists() {
            return Ok(vec![]);
        }

        let mut keys = walkdir::WalkDir::new(&self.root_dir)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .map(|entry| {
                let entry = entry.map_err(std::io::Error::from)?;

                Ok(entry)
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&self.root_dir).ok()?;

                Some(
                    rel.components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                )
            })
            .filter(|key| key.starts_with(prefix) && !key.ends_with(PART_SUFFIX))
            .collect::<Vec<_>>();

        keys.sort();

        Ok(keys)
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path(key)?;

        let fh = std::fs::File::open(&path)
            .map_err(|e| RpmRepositoryError::IoPath(key.to_string(), e))?;

        Ok(Box::new(std::io::BufReader::new(fh)))
    }

    fn put(&self, key: &str, reader: &mut dyn Read) -> Result<u64> {
        let dest_path = self.path(key)?;
        let part_path = self.path(&format!("{}{}", key, PART_SUFFIX))?;

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", parent.display()), e))?;
        }

        let size = match write_file(&part_path, reader) {
            Ok(size) => size,
            Err(e) => {
                let _ = std::fs::remove_file(&part_path);
                return Err(RpmRepositoryError::IoPath(key.to_string(), e));
            }
        };

        std::fs::rename(&part_path, &dest_path)
            .map_err(|e| RpmRepositoryError::IoPath(key.to_string(), e))?;

        Ok(size)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.path(from)?;
        let to_path = self.path(to)?;

        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RpmRepositoryError::IoPath(format!("{}", parent.display()), e))?;
        }

        std::fs::rename(&from_path, &to_path)
            .map_err(|e| RpmRepositoryError::IoPath(from.to_string(), e))
    }

    fn delete(&self, key: &str) -> Result<()> {
        std::fs::remove_file(self.path(key)?)
            .map_err(|e| RpmRepositoryError::IoPath(key.to_string(), e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.is_file())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_get_list_delete() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemStorage::new(td.path());

        assert_eq!(storage.put("repodata/repomd.xml", &mut &b"<repomd/>"[..])?, 9);
        storage.put("Packages/b.rpm", &mut &b"b"[..])?;
        storage.put("Packages/a.rpm", &mut &b"a"[..])?;
        std::fs::write(td.path().join("Packages").join("c.rpm.part"), b"c")?;

        assert_eq!(
            storage.list("")?,
            vec![
                "Packages/a.rpm".to_string(),
                "Packages/b.rpm".to_string(),
                "repodata/repomd.xml".to_string()
            ]
        );
        assert_eq!(storage.list("repodata/")?, vec!["repodata/repomd.xml".to_string()]);

        let mut data = String::new();
        storage.get("repodata/repomd.xml")?.read_to_string(&mut data)?;
        assert_eq!(data, "<repomd/>");

        storage.put("repodata/repomd.xml", &mut &b"<repomd></repomd>"[..])?;
        let mut data = String::new();
        storage.get("repodata/repomd.xml")?.read_to_string(&mut data)?;
        assert_eq!(data, "<repomd></repomd>");

        assert!(storage.exists("Packages/a.rpm")?);
        storage.delete("Packages/a.rpm")?;
        assert!(!storage.exists("Packages/a.rpm")?);

        let err = storage.get("Packages/a.rpm").err().unwrap();
        assert!(matches!(err, RpmRepositoryError::IoPath(ref key, _) if key == "Packages/a.rpm"));

        Ok(())
    }

    #[test]
    fn rename_replaces() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemStorage::new(td.path());

        storage.put("repodata/other.xml.gz", &mut &b"old"[..])?;
        storage.put("repodata/other.xml.gz.new", &mut &b"new"[..])?;
        storage.rename("repodata/other.xml.gz.new", "repodata/other.xml.gz")?;

        assert_eq!(storage.list("repodata/")?, vec!["repodata/other.xml.gz".to_string()]);
        let mut data = String::new();
        storage.get("repodata/other.xml.gz")?.read_to_string(&mut data)?;
        assert_eq!(data, "new");

        assert!(storage.rename("missing", "repodata/x").is_err());
        assert!(matches!(
            storage.rename("repodata/other.xml.gz", "../x"),
            Err(RpmRepositoryError::UnexpectedDataPath(_))
        ));

        Ok(())
    }

    #[test]
    fn missing_root_is_empty() -> Result<()> {
        let td = tempfile::tempdir()?;
        let storage = FilesystemStorage::new(td.path().join("missing"));

        assert!(storage.list("")?.is_empty());
        assert!(!storage.exists("repodata/repomd.xml")?);

        Ok(())
    }

    #[test]
    fn rejects_escaping_keys() {
        let storage = FilesystemStorage::new("/nonexistent");

        for key in ["", "/etc/passwd", "../x", "a//b", "a/./b"] {
            assert!(matches!(
                storage.exists(key),
                Err(RpmRepositoryError::UnexpectedDataPath(_))
            ));
        }
    }
}
