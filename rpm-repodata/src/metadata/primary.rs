// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `primary.xml` file format. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        metadata::{
            codec::{attribute_value, is_start_of, PackageIdScanner, RecordReader, PACKAGE_ELEMENT},
            MetadataDialect,
        },
    },
    std::io::Read,
    xml::reader::XmlEvent,
};

/// A package as advertised in a `primary.xml` file.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PackageRecord {
    /// The package id.
    pub pkgid: String,

    /// The name of the package.
    pub name: String,

    /// The `href` of the package's `<location>`.
    pub location: String,
}

#[derive(Default)]
struct PartialRecord {
    pkgid: Option<String>,
    name: Option<String>,
    location: Option<String>,
    in_name: bool,
}

/// Read the package records of a `primary.xml` document.
///
/// The document is streamed. Only the extracted records are retained.
pub fn scan_packages(reader: impl Read) -> Result<Vec<PackageRecord>> {
    let mut reader = RecordReader::new(reader);
    let mut scanner = PackageIdScanner::new(MetadataDialect::Primary);
    let mut current: Option<PartialRecord> = None;
    let mut records = vec![];

    loop {
        let (depth, event) = reader.next_event()?;

        if let XmlEvent::EndDocument = event {
            break;
        }

        let id = scanner.observe(depth, &event)?;

        let record = match current.as_mut() {
            Some(record) => record,
            None => {
                if depth == 1 && is_start_of(&event, PACKAGE_ELEMENT) {
                    current = Some(PartialRecord::default());
                }

                continue;
            }
        };

        if let Some(id) = id {
            record.pkgid = Some(id);
        }

        match &event {
            XmlEvent::StartElement { name, .. } if depth == 2 => match name.local_name.as_str() {
                "name" => {
                    record.in_name = true;
                    record.name = Some(String::new());
                }
                "location" => {
                    record.location = attribute_value(&event, "href").map(|x| x.to_string());
                }
                _ => {}
            },
            XmlEvent::Characters(data) if record.in_name => {
                if let Some(name) = record.name.as_mut() {
                    name.push_str(data);
                }
            }
            XmlEvent::EndElement { .. } if depth == 2 => {
                record.in_name = false;
            }
            XmlEvent::EndElement { .. } if depth == 1 => {
                if let Some(record) = current.take() {
                    let pkgid = record.pkgid.ok_or(RpmRepositoryError::PackageMissingId)?;
                    let location = record.location.ok_or_else(|| {
                        RpmRepositoryError::XmlMalformed(format!(
                            "package {} has no <location>",
                            pkgid
                        ))
                    })?;

                    records.push(PackageRecord {
                        pkgid,
                        name: record.name.unwrap_or_default().trim().to_string(),
                        location,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(records)
}
