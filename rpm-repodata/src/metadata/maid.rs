// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Removal of package records from metadata documents. */

use {
    crate::{
        error::{Result, RpmRepositoryError},
        metadata::{
            codec::{
                check_start_document, PackageIdScanner, RecordReader, RecordWriter,
                PACKAGE_ELEMENT,
            },
            MetadataDialect,
        },
    },
    log::debug,
    std::{
        collections::HashSet,
        io::{Read, Seek, SeekFrom, Write},
        path::Path,
    },
    xml::reader::XmlEvent,
};

/// Receives the events of a document whose package records are being filtered.
pub(crate) trait RecordSink {
    /// The start of the root element.
    fn root_start(&mut self, event: &XmlEvent) -> Result<()>;

    /// The end of the root element.
    fn root_end(&mut self, event: &XmlEvent) -> Result<()>;

    /// Any other event that survived filtering.
    fn event(&mut self, event: &XmlEvent) -> Result<()>;
}

/// Discards everything. Used to count surviving records.
pub(crate) struct NullSink;

impl RecordSink for NullSink {
    fn root_start(&mut self, _event: &XmlEvent) -> Result<()> {
        Ok(())
    }

    fn root_end(&mut self, _event: &XmlEvent) -> Result<()> {
        Ok(())
    }

    fn event(&mut self, _event: &XmlEvent) -> Result<()> {
        Ok(())
    }
}

/// Copies surviving events to a writer, setting the root's package count.
pub(crate) struct CountingWriterSink<'a, W: Write> {
    pub writer: &'a mut RecordWriter<W>,
    pub count: u64,
}

impl<'a, W: Write> RecordSink for CountingWriterSink<'a, W> {
    fn root_start(&mut self, event: &XmlEvent) -> Result<()> {
        self.writer.start_document()?;
        self.writer.write_root_start(event, self.count)
    }

    fn root_end(&mut self, event: &XmlEvent) -> Result<()> {
        self.writer.write_event(event)
    }

    fn event(&mut self, event: &XmlEvent) -> Result<()> {
        self.writer.write_event(event)
    }
}

/// Disposition of the package record being read.
enum RecordState {
    /// Events are copied.
    ///
    /// This is also the state between records.
    Keeping,
    /// Events are discarded until the record ends.
    Dropping,
    /// The record's id hasn't been seen yet. Events are held until it is.
    Pending(Vec<XmlEvent>),
}

/// Drive the record state machine over a document.
///
/// Every `<package>` child of the root whose id is in `ids` is discarded. Everything
/// else is handed to `sink`. Returns the number of surviving records.
pub(crate) fn filter_records<R: Read>(
    dialect: MetadataDialect,
    source: R,
    ids: &HashSet<String>,
    sink: &mut impl RecordSink,
) -> Result<u64> {
    let mut reader = RecordReader::new(source);
    let mut scanner = PackageIdScanner::new(dialect);
    let mut state = RecordState::Keeping;
    let mut surviving = 0;
    let mut root_seen = false;
    // Set after a dropped record so the whitespace separating it from the next
    // sibling goes with it.
    let mut after_drop = false;

    loop {
        let (depth, event) = reader.next_event()?;

        match &event {
            XmlEvent::EndDocument => break,
            XmlEvent::StartDocument { .. } => {
                check_start_document(&event)?;
                continue;
            }
            XmlEvent::StartElement { name, .. } if depth == 0 => {
                if name.local_name != dialect.root_element() {
                    return Err(RpmRepositoryError::XmlMalformed(format!(
                        "expected <{}> root element; got <{}>",
                        dialect.root_element(),
                        name.local_name
                    )));
                }

                root_seen = true;
                sink.root_start(&event)?;
                continue;
            }
            XmlEvent::EndElement { .. } if depth == 0 => {
                sink.root_end(&event)?;
                continue;
            }
            // Whitespace, comments and processing instructions outside the root.
            _ if depth == 0 => continue,
            XmlEvent::StartElement { name, .. }
                if depth == 1 && name.local_name == PACKAGE_ELEMENT =>
            {
                after_drop = false;
                state = RecordState::Pending(vec![]);
            }
            _ => {}
        }

        let is_record_end =
            matches!(&event, XmlEvent::EndElement { name, .. } if depth == 1 && name.local_name == PACKAGE_ELEMENT);

        let id = scanner.observe(depth, &event)?;

        let separator = depth == 1
            && matches!(&event, XmlEvent::Characters(data) if data.trim().is_empty());

        state = match state {
            RecordState::Keeping => {
                if !(after_drop && separator) {
                    sink.event(&event)?;
                }
                after_drop = false;
                RecordState::Keeping
            }
            RecordState::Dropping => RecordState::Dropping,
            RecordState::Pending(mut events) => {
                events.push(event);

                if let Some(id) = id {
                    if ids.contains(&id) {
                        debug!("dropping {} record {}", dialect, id);
                        RecordState::Dropping
                    } else {
                        surviving += 1;

                        for event in &events {
                            sink.event(event)?;
                        }

                        RecordState::Keeping
                    }
                } else if is_record_end {
                    return Err(RpmRepositoryError::PackageMissingId);
                } else {
                    RecordState::Pending(events)
                }
            }
        };

        if is_record_end {
            after_drop = matches!(state, RecordState::Dropping);
            state = RecordState::Keeping;
        }
    }

    if !root_seen {
        return Err(RpmRepositoryError::XmlMalformed(
            "document has no root element".to_string(),
        ));
    }

    Ok(surviving)
}

/// Cleans package records out of metadata documents.
///
/// Records are matched by package id: the `pkgid` attribute in `filelists.xml` and
/// `other.xml`, the `<checksum pkgid="YES">` value in `primary.xml`.
pub struct XmlMaid {
    dialect: MetadataDialect,
}

impl XmlMaid {
    pub fn new(dialect: MetadataDialect) -> Self {
        Self { dialect }
    }

    /// Copy `input` to `output` without the records whose id is in `ids`.
    ///
    /// The root's `packages` attribute is set to the number of surviving records, which
    /// is returned. The input is read twice: once to count survivors and once to copy.
    pub fn clean<R: Read + Seek, W: Write>(
        &self,
        mut input: R,
        output: W,
        ids: &HashSet<String>,
    ) -> Result<u64> {
        let count = filter_records(self.dialect, &mut input, ids, &mut NullSink)?;

        input.seek(SeekFrom::Start(0))?;

        let mut writer = RecordWriter::new(output);
        let written = filter_records(
            self.dialect,
            &mut input,
            ids,
            &mut CountingWriterSink {
                writer: &mut writer,
                count,
            },
        )?;

        writer.into_inner().flush()?;

        debug_assert_eq!(count, written);

        Ok(count)
    }

    /// Clean a file in place.
    ///
    /// Output is written to `<file>.part`, which replaces the file on success.
    pub fn clean_file(&self, path: impl AsRef<Path>, ids: &HashSet<String>) -> Result<u64> {
        let path = path.as_ref();
        let part = path.with_file_name(format!(
            "{}.part",
            path.file_name()
                .map(|x| x.to_string_lossy().to_string())
                .unwrap_or_default()
        ));

        let io_err = |p: &Path, e| RpmRepositoryError::IoPath(format!("{}", p.display()), e);

        let input = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
        let output = std::fs::File::create(&part).map_err(|e| io_err(part.as_path(), e))?;

        let res = self.clean(
            std::io::BufReader::new(input),
            std::io::BufWriter::new(output),
            ids,
        );

        match res {
            Ok(count) => {
                std::fs::rename(&part, path).map_err(|e| io_err(path, e))?;
                Ok(count)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                Err(e.for_document(path.display()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use {
        super::*,
        crate::metadata::codec::{attribute_value, is_start_of},
        std::io::Cursor,
    };

    const OTHER_XML: &str = include_str!("../../testdata/other.xml");
    const FILELISTS_XML: &str = include_str!("../../testdata/filelists.xml");
    const PRIMARY_XML: &str = include_str!("../../testdata/primary.xml");

    /// Declared package count and the ids of every record in a document.
    pub(crate) fn summarize(dialect: MetadataDialect, xml: &[u8]) -> Result<(u64, Vec<String>)> {
        let mut reader = RecordReader::new(xml);
        let mut scanner = PackageIdScanner::new(dialect);
        let mut declared = None;
        let mut ids = vec![];

        loop {
            let (depth, event) = reader.next_event()?;

            if matches!(event, XmlEvent::EndDocument) {
                break;
            }

            if depth == 0 && is_start_of(&event, dialect.root_element()) {
                declared = attribute_value(&event, "packages").map(|v| v.parse().unwrap());
            }

            if let Some(id) = scanner.observe(depth, &event)? {
                ids.push(id);
            }
        }

        Ok((declared.expect("packages attribute"), ids))
    }

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|x| x.to_string()).collect()
    }

    fn clean(dialect: MetadataDialect, xml: &str, remove: &[&str]) -> Result<(u64, Vec<u8>)> {
        let mut out = vec![];
        let count = XmlMaid::new(dialect).clean(Cursor::new(xml), &mut out, &ids(remove))?;

        Ok((count, out))
    }

    #[test]
    fn clean_other() -> Result<()> {
        let (count, out) = clean(MetadataDialect::Other, OTHER_XML, &["abc123"])?;
        assert_eq!(count, 2);

        let (declared, found) = summarize(MetadataDialect::Other, &out)?;
        assert_eq!(declared, 2);
        assert_eq!(found.len(), 2);
        assert!(!found.contains(&"abc123".to_string()));

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("xmlns=\"http://linux.duke.edu/metadata/other\""));
        assert!(!text.contains("abc123"));

        Ok(())
    }

    #[test]
    fn clean_is_idempotent() -> Result<()> {
        let (first, out) = clean(MetadataDialect::Filelists, FILELISTS_XML, &["abc123"])?;
        let (second, again) = clean(
            MetadataDialect::Filelists,
            std::str::from_utf8(&out).unwrap(),
            &["abc123"],
        )?;

        assert_eq!(first, second);
        assert_eq!(
            summarize(MetadataDialect::Filelists, &out)?,
            summarize(MetadataDialect::Filelists, &again)?
        );

        Ok(())
    }

    #[test]
    fn clean_nothing_keeps_everything() -> Result<()> {
        let (count, out) = clean(MetadataDialect::Other, OTHER_XML, &["unknown"])?;
        assert_eq!(count, 3);
        assert_eq!(summarize(MetadataDialect::Other, &out)?.0, 3);

        Ok(())
    }

    #[test]
    fn clean_primary_by_checksum() -> Result<()> {
        let (count, out) = clean(MetadataDialect::Primary, PRIMARY_XML, &["abc123"])?;
        assert_eq!(count, 1);

        let (declared, found) = summarize(MetadataDialect::Primary, &out)?;
        assert_eq!(declared, 1);
        assert_eq!(found.len(), 1);
        assert!(!found.contains(&"abc123".to_string()));

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("xmlns:rpm=\"http://linux.duke.edu/metadata/rpm\""));
        assert!(text.contains("<rpm:license>"));

        Ok(())
    }

    #[test]
    fn removal_takes_separator_along() -> Result<()> {
        let xml = "<otherdata packages=\"3\">\n<package pkgid=\"a\"></package>\n<package pkgid=\"b\"></package>\n<package pkgid=\"c\"></package>\n</otherdata>";

        let (_, out) = clean(MetadataDialect::Other, xml, &["a", "c"])?;
        let text = String::from_utf8(out).unwrap();

        assert!(text.ends_with("packages=\"1\">\n<package pkgid=\"b\"></package>\n</otherdata>"));

        // Repeated cleaning does not accumulate blank lines.
        let (_, again) = clean(MetadataDialect::Other, &text, &["b"])?;
        let again = String::from_utf8(again).unwrap();
        assert!(again.ends_with("packages=\"0\">\n</otherdata>"));
        assert!(!again.contains("\n\n"));

        Ok(())
    }

    #[test]
    fn missing_pkgid_is_fatal() {
        let xml = r#"<otherdata xmlns="http://linux.duke.edu/metadata/other" packages="2">
            <package pkgid="a" name="a"></package>
            <package name="b"></package>
        </otherdata>"#;

        let res = clean(MetadataDialect::Other, xml, &["a"]);
        assert!(matches!(res, Err(RpmRepositoryError::PackageMissingId)));
    }

    #[test]
    fn unbalanced_is_fatal() {
        let xml = r#"<otherdata packages="1"><package pkgid="a"><version></package></otherdata>"#;

        let err = clean(MetadataDialect::Other, xml, &[]).expect_err("malformed");
        assert_eq!(err.kind(), crate::error::ErrorKind::Xml);
    }

    #[test]
    fn wrong_root_is_fatal() {
        let res = clean(MetadataDialect::Filelists, OTHER_XML, &[]);
        assert!(matches!(res, Err(RpmRepositoryError::XmlMalformed(_))));
    }

    #[test]
    fn clean_file_in_place() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("other.xml");
        std::fs::write(&path, OTHER_XML)?;

        let count = XmlMaid::new(MetadataDialect::Other).clean_file(&path, &ids(&["abc123"]))?;
        assert_eq!(count, 2);
        assert!(!td.path().join("other.xml.part").exists());

        let (declared, found) = summarize(MetadataDialect::Other, &std::fs::read(&path)?)?;
        assert_eq!(declared, 2);
        assert_eq!(found.len(), 2);

        Ok(())
    }

    #[test]
    fn clean_file_failure_leaves_original() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("other.xml");
        let xml = r#"<otherdata packages="1"><package name="a"></package></otherdata>"#;
        std::fs::write(&path, xml)?;

        assert!(XmlMaid::new(MetadataDialect::Other)
            .clean_file(&path, &ids(&["a"]))
            .is_err());
        assert_eq!(std::fs::read_to_string(&path)?, xml);
        assert!(!td.path().join("other.xml.part").exists());

        Ok(())
    }
}
