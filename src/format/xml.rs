//! Minimal element tree over `quick-xml`.
//!
//! OME, CZI, LIF and ND2 metadata are all XML documents that the backends
//! query by path. A small owned tree keeps those lookups simple; documents
//! are at most a few megabytes.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::FormatError;

/// One XML element with namespace prefixes stripped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    /// Parse a document and return its root element.
    pub fn parse(document: &str) -> Result<Element, FormatError> {
        let mut reader = Reader::from_str(document);
        reader.trim_text(true);

        // Sentinel holding the root once parsing completes.
        let mut stack = vec![Element::default()];

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let mut element = Element {
                        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                        ..Element::default()
                    };
                    read_attributes(e, &mut element)?;
                    stack.push(element);
                }
                Ok(Event::Empty(ref e)) => {
                    let mut element = Element {
                        name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
                        ..Element::default()
                    };
                    read_attributes(e, &mut element)?;
                    push_child(&mut stack, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .filter(|_| !stack.is_empty())
                        .ok_or_else(|| FormatError::Xml("unbalanced end tag".to_string()))?;
                    push_child(&mut stack, element)?;
                }
                Ok(Event::Text(ref e)) => {
                    let text = e.unescape().map_err(|e| FormatError::Xml(e.to_string()))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(&e.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(FormatError::Xml(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(FormatError::Xml("document ends inside an element".to_string()));
        }
        stack
            .pop()
            .and_then(|sentinel| sentinel.children.into_iter().next())
            .ok_or_else(|| FormatError::Xml("document has no root element".to_string()))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attribute parsed as a number, `None` when absent or malformed.
    pub fn attr_parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a `/`-separated path of child names.
    pub fn find(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }

    /// Trimmed text of the element at `path`, `None` when missing or empty.
    pub fn find_text(&self, path: &str) -> Option<&str> {
        self.find(path)
            .map(|e| e.text.trim())
            .filter(|t| !t.is_empty())
    }

    /// Every descendant with the given name, depth first.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }
}

fn read_attributes(
    start: &quick_xml::events::BytesStart<'_>,
    element: &mut Element,
) -> Result<(), FormatError> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| FormatError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| FormatError::Xml(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(())
}

fn push_child(stack: &mut [Element], element: Element) -> Result<(), FormatError> {
    stack
        .last_mut()
        .map(|parent| parent.children.push(element))
        .ok_or_else(|| FormatError::Xml("element outside the document".to_string()))
}
