// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `repomd.xml` file format. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        io::{ChecksumType, ContentDigest},
        metadata::{MetadataDialect, REPO_NAMESPACE, RPM_NAMESPACE},
        output::PublishedFile,
    },
    serde::{Deserialize, Serialize},
    std::{
        io::{Read, Write},
        str::FromStr,
    },
    xml::writer::{EmitterConfig, XmlEvent},
};

/// Directory of metadata files relative to the repository root.
pub const REPODATA_DIR: &str = "repodata";

/// A `repomd.xml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMd {
    /// Revision of the repository.
    ///
    /// Often an integer-like value.
    #[serde(default)]
    pub revision: String,
    /// Describes additional primary data files constituting this repository.
    #[serde(default)]
    pub data: Vec<RepoMdData>,
}

impl RepoMd {
    /// Construct an instance by parsing XML from a reader.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_xml_rs::from_reader(reader)?)
    }

    /// Construct an instance by parsing XML from a string.
    pub fn from_xml(s: &str) -> Result<Self> {
        Ok(serde_xml_rs::from_str(s)?)
    }

    /// Construct an instance describing published metadata files.
    pub fn from_published(revision: impl ToString, files: &[PublishedFile]) -> Self {
        Self {
            revision: revision.to_string(),
            data: files.iter().map(RepoMdData::from).collect(),
        }
    }

    /// Obtain the `<data>` entry of a dialect.
    pub fn data_for(&self, dialect: MetadataDialect) -> Option<&RepoMdData> {
        self.data
            .iter()
            .find(|d| d.data_type == dialect.data_type())
    }

    /// Write this instance as XML.
    pub fn to_writer(&self, writer: impl Write) -> Result<()> {
        let mut emitter = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(writer);

        emitter.write(
            XmlEvent::start_element("repomd")
                .default_ns(REPO_NAMESPACE)
                .ns("rpm", RPM_NAMESPACE),
        )?;

        write_text_element(&mut emitter, XmlEvent::start_element("revision"), &self.revision)?;

        for data in &self.data {
            emitter.write(XmlEvent::start_element("data").attr("type", &data.data_type))?;

            write_text_element(
                &mut emitter,
                XmlEvent::start_element("checksum").attr("type", &data.checksum.name),
                &data.checksum.value,
            )?;

            if let Some(checksum) = &data.open_checksum {
                write_text_element(
                    &mut emitter,
                    XmlEvent::start_element("open-checksum").attr("type", &checksum.name),
                    &checksum.value,
                )?;
            }

            emitter.write(XmlEvent::start_element("location").attr("href", &data.location.href))?;
            emitter.write(XmlEvent::end_element())?;

            for (name, value) in [
                ("timestamp", data.timestamp),
                ("size", data.size),
                ("open-size", data.open_size),
            ] {
                if let Some(value) = value {
                    write_text_element(
                        &mut emitter,
                        XmlEvent::start_element(name),
                        &value.to_string(),
                    )?;
                }
            }

            emitter.write(XmlEvent::end_element())?;
        }

        emitter.write(XmlEvent::end_element())?;
        emitter.into_inner().write_all(b"\n")?;

        Ok(())
    }

    /// Render this instance as an XML string.
    pub fn to_xml(&self) -> Result<String> {
        let mut buf = vec![];
        self.to_writer(&mut buf)?;

        String::from_utf8(buf)
            .map_err(|e| RpmRepositoryError::XmlMalformed(format!("non UTF-8 output: {}", e)))
    }
}

fn write_text_element<W: Write>(
    emitter: &mut xml::writer::EventWriter<W>,
    start: xml::writer::events::StartElementBuilder,
    text: &str,
) -> Result<()> {
    emitter.write(start)?;
    emitter.write(XmlEvent::characters(text))?;
    emitter.write(XmlEvent::end_element())?;

    Ok(())
}

/// A `<data>` element in a `repomd.xml` file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RepoMdData {
    /// The type of data.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Content checksum of this file.
    pub checksum: Checksum,
    /// Where the file is located.
    pub location: Location,
    /// Size in bytes of the file as stored in the repository.
    pub size: Option<u64>,
    /// Time file was created/modified.
    pub timestamp: Option<u64>,
    /// Content checksum of the decoded (often decompressed) file.
    #[serde(rename = "open-checksum")]
    pub open_checksum: Option<Checksum>,
    /// Size in bytes of the decoded (often decompressed) file.
    #[serde(rename = "open-size")]
    pub open_size: Option<u64>,
    /// Content checksum of header data.
    #[serde(rename = "header-checksum")]
    pub header_checksum: Option<Checksum>,
    /// Size in bytes of the header.
    #[serde(rename = "header-size")]
    pub header_size: Option<u64>,
}

impl RepoMdData {
    /// The dialect of this entry, if it is one we maintain.
    pub fn dialect(&self) -> Option<MetadataDialect> {
        MetadataDialect::from_data_type(&self.data_type)
    }

    /// The file name of this entry within the `repodata` directory.
    pub fn file_name(&self) -> Result<&str> {
        self.location
            .href
            .strip_prefix(REPODATA_DIR)
            .and_then(|x| x.strip_prefix('/'))
            .filter(|x| !x.is_empty() && !x.contains('/'))
            .ok_or_else(|| RpmRepositoryError::UnexpectedDataPath(self.location.href.clone()))
    }

    /// The size and digest the stored file must have.
    pub fn expected_content(&self) -> Result<(u64, ContentDigest)> {
        let size = self.size.ok_or(RpmRepositoryError::MetadataMissingSize)?;

        Ok((size, self.checksum.clone().try_into()?))
    }
}

impl From<&PublishedFile> for RepoMdData {
    fn from(file: &PublishedFile) -> Self {
        Self {
            data_type: file.dialect.data_type().to_string(),
            checksum: Checksum::from(&file.checksum),
            location: Location {
                href: format!("{}/{}", REPODATA_DIR, file.name),
            },
            size: Some(file.size),
            timestamp: Some(file.timestamp.max(0) as u64),
            open_checksum: Some(Checksum::from(&file.open_checksum)),
            open_size: Some(file.open_size),
            header_checksum: None,
            header_size: None,
        }
    }
}

/// The content checksum of a `<data>` element.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Checksum {
    /// The name of the content digest.
    #[serde(rename = "type")]
    pub name: String,
    /// The hex encoded content digest.
    #[serde(rename = "$value")]
    pub value: String,
}

impl From<&ContentDigest> for Checksum {
    fn from(digest: &ContentDigest) -> Self {
        Self {
            name: digest.checksum_type().name().to_string(),
            value: digest.digest_hex(),
        }
    }
}

impl TryFrom<Checksum> for ContentDigest {
    type Error = RpmRepositoryError;

    fn try_from(v: Checksum) -> std::result::Result<Self, Self::Error> {
        ContentDigest::from_hex_digest(ChecksumType::from_str(&v.name)?, v.value.trim())
    }
}

/// The location of a `<data>` element.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Location {
    pub href: String,
}
