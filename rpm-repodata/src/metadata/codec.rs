// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Streaming reading and writing of metadata XML.

Documents are processed as a sequence of [XmlEvent]s. Nothing here holds more
than the current event (or, for `primary.xml`, the current `<package>` record)
in memory.
*/

use {
    crate::{
        error::{Result, RpmRepositoryError},
        metadata::{MetadataDialect, PackageIdLocation},
    },
    std::{
        borrow::Cow,
        io::{Read, Write},
    },
    xml::{
        attribute::Attribute,
        common::XmlVersion,
        name::Name,
        reader::{EventReader, ParserConfig, XmlEvent},
        writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent},
    },
};

/// Local name of package record elements.
pub const PACKAGE_ELEMENT: &str = "package";

/// Name of the root attribute holding the number of package records.
pub const PACKAGES_ATTRIBUTE: &str = "packages";

/// Name of the package id attribute.
pub const PKGID_ATTRIBUTE: &str = "pkgid";

/// Local name of the element holding package ids in `primary.xml`.
pub const CHECKSUM_ELEMENT: &str = "checksum";

/// Element wrapping fragments so they can be parsed with their dialect's namespaces in scope.
const FRAGMENT_WRAPPER: &str = "rpm-repodata-fragments";

fn parser_config() -> ParserConfig {
    ParserConfig::new()
        .trim_whitespace(false)
        .whitespace_to_characters(true)
        .cdata_to_characters(false)
        .ignore_comments(false)
        .coalesce_characters(true)
}

fn emitter_config() -> EmitterConfig {
    EmitterConfig::new()
        .perform_indent(false)
        .write_document_declaration(true)
        .normalize_empty_elements(false)
        .autopad_comments(false)
        .keep_element_names_stack(true)
}

/// Obtain the value of a named attribute on a start element.
pub fn attribute_value<'a>(event: &'a XmlEvent, name: &str) -> Option<&'a str> {
    match event {
        XmlEvent::StartElement { attributes, .. } => attributes
            .iter()
            .find(|a| a.name.local_name == name && a.name.prefix.is_none())
            .map(|a| a.value.as_str()),
        _ => None,
    }
}

/// Whether an event starts an element with the given local name.
pub fn is_start_of(event: &XmlEvent, local_name: &str) -> bool {
    matches!(event, XmlEvent::StartElement { name, .. } if name.local_name == local_name)
}

/// Reads events from a metadata document.
pub struct RecordReader<R: Read> {
    events: EventReader<R>,
    depth: usize,
}

impl<R: Read> RecordReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            events: EventReader::new_with_config(source, parser_config()),
            depth: 0,
        }
    }

    /// Obtain the next event and the element depth it occurs at.
    ///
    /// The root element starts and ends at depth 0, its children at depth 1, and so
    /// on. Character data occurs at the depth of the elements enclosing it.
    pub fn next_event(&mut self) -> Result<(usize, XmlEvent)> {
        let event = self.events.next()?;

        let depth = match &event {
            XmlEvent::StartElement { .. } => {
                self.depth += 1;
                self.depth - 1
            }
            XmlEvent::EndElement { .. } => {
                self.depth = self.depth.saturating_sub(1);
                self.depth
            }
            _ => self.depth,
        };

        Ok((depth, event))
    }
}

/// Validate the `<?xml ?>` declaration of a document.
pub fn check_start_document(event: &XmlEvent) -> Result<()> {
    if let XmlEvent::StartDocument { encoding, .. } = event {
        if !encoding.eq_ignore_ascii_case("utf-8") {
            return Err(RpmRepositoryError::XmlUnsupportedEncoding(encoding.clone()));
        }
    }

    Ok(())
}

/// Writes events of a metadata document.
pub struct RecordWriter<W: Write> {
    writer: EventWriter<W>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(dest: W) -> Self {
        Self {
            writer: emitter_config().create_writer(dest),
        }
    }

    /// Emit the `<?xml ?>` declaration.
    pub fn start_document(&mut self) -> Result<()> {
        self.writer.write(WriterEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("UTF-8"),
            standalone: None,
        })?;

        Ok(())
    }

    /// Copy an event read from another document.
    ///
    /// Document start and end events are not copied.
    pub fn write_event(&mut self, event: &XmlEvent) -> Result<()> {
        match event {
            XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => Ok(()),
            event => {
                if let Some(event) = event.as_writer_event() {
                    self.writer.write(event)?;
                }

                Ok(())
            }
        }
    }

    /// Copy the start event of a root element, replacing its package count.
    pub fn write_root_start(&mut self, event: &XmlEvent, count: u64) -> Result<()> {
        let (name, attributes, namespace) = match event {
            XmlEvent::StartElement {
                name,
                attributes,
                namespace,
            } => (name, attributes, namespace),
            _ => {
                return Err(RpmRepositoryError::XmlMalformed(
                    "expected root element".to_string(),
                ))
            }
        };

        let count = count.to_string();

        let mut attrs = attributes
            .iter()
            .map(|a| {
                if a.name.local_name == PACKAGES_ATTRIBUTE && a.name.prefix.is_none() {
                    Attribute::new(a.name.borrow(), &count)
                } else {
                    a.borrow()
                }
            })
            .collect::<Vec<_>>();

        if !attributes
            .iter()
            .any(|a| a.name.local_name == PACKAGES_ATTRIBUTE && a.name.prefix.is_none())
        {
            attrs.push(Attribute::new(Name::local(PACKAGES_ATTRIBUTE), &count));
        }

        self.writer.write(WriterEvent::StartElement {
            name: name.borrow(),
            attributes: Cow::Owned(attrs),
            namespace: Cow::Borrowed(namespace),
        })?;

        Ok(())
    }

    /// Obtain the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Extracts package ids from the events of `<package>` records.
pub(crate) struct PackageIdScanner {
    location: PackageIdLocation,
    in_checksum: bool,
    text: String,
}

impl PackageIdScanner {
    pub fn new(dialect: MetadataDialect) -> Self {
        Self {
            location: dialect.package_id_location(),
            in_checksum: false,
            text: String::new(),
        }
    }

    /// Observe an event within a record.
    ///
    /// Returns the package id once the event carrying it has been seen.
    pub fn observe(&mut self, depth: usize, event: &XmlEvent) -> Result<Option<String>> {
        match (self.location, event) {
            (PackageIdLocation::Attribute, XmlEvent::StartElement { .. })
                if depth == 1 && is_start_of(event, PACKAGE_ELEMENT) =>
            {
                attribute_value(event, PKGID_ATTRIBUTE)
                    .map(|id| Some(id.to_string()))
                    .ok_or(RpmRepositoryError::PackageMissingId)
            }
            (PackageIdLocation::ChecksumElement, XmlEvent::StartElement { .. })
                if depth == 2 && is_start_of(event, CHECKSUM_ELEMENT) =>
            {
                self.in_checksum = attribute_value(event, PKGID_ATTRIBUTE)
                    .map(|v| v.eq_ignore_ascii_case("yes"))
                    .unwrap_or(false);
                self.text.clear();

                Ok(None)
            }
            (PackageIdLocation::ChecksumElement, XmlEvent::Characters(data))
                if self.in_checksum =>
            {
                self.text.push_str(data);

                Ok(None)
            }
            (PackageIdLocation::ChecksumElement, XmlEvent::EndElement { .. })
                if self.in_checksum =>
            {
                self.in_checksum = false;
                let id = self.text.trim();

                if id.is_empty() {
                    Err(RpmRepositoryError::PackageMissingId)
                } else {
                    Ok(Some(id.to_string()))
                }
            }
            _ => Ok(None),
        }
    }
}

/// Stream the `<package>` elements of one or more concatenated fragments.
///
/// Fragments are bare `<package>` elements without an XML declaration. They may use
/// the namespace prefixes of their dialect (e.g. `rpm:` in `primary.xml`) without
/// declaring them.
///
/// `emit` receives every event belonging to the fragments. `on_package` receives the
/// id of each package. Returns the number of packages seen.
pub fn stream_fragments<R, E, P>(
    dialect: MetadataDialect,
    source: R,
    mut emit: E,
    mut on_package: P,
) -> Result<u64>
where
    R: Read,
    E: FnMut(&XmlEvent) -> Result<()>,
    P: FnMut(&str) -> Result<()>,
{
    let prefix = format!(
        "<{}{}>",
        FRAGMENT_WRAPPER,
        dialect.namespace_declarations()
    );
    let suffix = format!("</{}>", FRAGMENT_WRAPPER);

    let mut reader = RecordReader::new(
        std::io::Cursor::new(prefix.into_bytes())
            .chain(source)
            .chain(std::io::Cursor::new(suffix.into_bytes())),
    );

    let mut scanner = PackageIdScanner::new(dialect);
    let mut count = 0;
    let mut id_seen = false;

    loop {
        let (depth, event) = reader.next_event()?;

        match &event {
            XmlEvent::EndDocument => break,
            XmlEvent::StartDocument { .. } => continue,
            XmlEvent::StartElement { .. } | XmlEvent::EndElement { .. } if depth == 0 => continue,
            XmlEvent::StartElement { name, .. } if depth == 1 => {
                if name.local_name != PACKAGE_ELEMENT {
                    return Err(RpmRepositoryError::XmlMalformed(format!(
                        "unexpected <{}> element in {} fragment",
                        name.local_name, dialect
                    )));
                }

                count += 1;
                id_seen = false;
            }
            XmlEvent::EndElement { .. } if depth == 1 && !id_seen => {
                return Err(RpmRepositoryError::PackageMissingId);
            }
            XmlEvent::Characters(data) if depth == 1 && !data.trim().is_empty() => {
                return Err(RpmRepositoryError::XmlMalformed(format!(
                    "unexpected text in {} fragment",
                    dialect
                )));
            }
            _ => {}
        }

        if let Some(id) = scanner.observe(depth, &event)? {
            id_seen = true;
            on_package(&id)?;
        }

        emit(&event)?;
    }

    Ok(count)
}
