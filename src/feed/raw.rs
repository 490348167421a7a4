//! Best-effort element trees for feed items.
//!
//! `feed-rs` flattens each entry into its own model and drops elements it
//! does not know about. The normalizer needs some of those (`updated` dates in
//! odd places, `media:thumbnail` and friends), so each `<item>`/`<entry>` is
//! also read into a small generic tree with `quick-xml`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;

/// Elements nested deeper than this inside an item are dropped.
const MAX_DEPTH: usize = 32;

/// One XML element with its namespace prefix removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawElement {
    /// Local name (`media:thumbnail` becomes `thumbnail`)
    pub name: String,
    /// Attributes keyed by local name
    pub attributes: Vec<(String, String)>,
    /// Concatenated text and CDATA directly inside this element
    pub text: String,
    pub children: Vec<RawElement>,
}

impl RawElement {
    /// Value of the attribute with the given local name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Every element below this one, in document order. Excludes `self`.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    /// First descendant with the given local name.
    pub fn find(&self, name: &str) -> Option<&RawElement> {
        self.descendants().find(|e| e.name == name)
    }

    /// Trimmed text of the first direct child with the given local name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }
}

/// Pre-order iterator returned by [`RawElement::descendants`].
pub struct Descendants<'a> {
    stack: Vec<&'a RawElement>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a RawElement;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        self.stack.extend(next.children.iter().rev());
        Some(next)
    }
}

fn is_item(name: &[u8]) -> bool {
    name == b"item" || name == b"entry"
}

fn local_name(name: &[u8]) -> String {
    let local = match name.iter().rposition(|&b| b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    };
    String::from_utf8_lossy(local).into_owned()
}

fn element_from(start: &BytesStart<'_>) -> RawElement {
    let attributes = start
        .attributes()
        .flatten()
        .map(|attr| {
            let key = local_name(attr.key.as_ref());
            let value = attr
                .unescape_value()
                .map(Cow::into_owned)
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            (key, value)
        })
        .collect();

    RawElement {
        name: local_name(start.name().as_ref()),
        attributes,
        ..Default::default()
    }
}

/// Collect the element tree of every `<item>`/`<entry>` in document order.
///
/// Returns `None` if the document is not well-formed enough to walk. Items
/// nested inside other items are treated as ordinary children.
pub fn collect_items(xml: &[u8]) -> Option<Vec<RawElement>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    // Open elements of the item currently being read, outermost first
    let mut stack: Vec<RawElement> = Vec::new();
    // Open elements skipped for exceeding MAX_DEPTH
    let mut skipped = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if stack.is_empty() {
                    if is_item(start.local_name().as_ref()) {
                        stack.push(element_from(&start));
                    }
                } else if skipped > 0 || stack.len() >= MAX_DEPTH {
                    skipped += 1;
                } else {
                    stack.push(element_from(&start));
                }
            }
            Ok(Event::Empty(start)) => {
                if stack.is_empty() {
                    if is_item(start.local_name().as_ref()) {
                        items.push(element_from(&start));
                    }
                } else if skipped == 0 {
                    let element = element_from(&start);
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    }
                }
            }
            Ok(Event::End(_)) => {
                if skipped > 0 {
                    skipped -= 1;
                } else if let Some(done) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => items.push(done),
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if skipped == 0 {
                    if let Some(current) = stack.last_mut() {
                        let decoded = text
                            .unescape()
                            .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned().into());
                        current.text.push_str(&decoded);
                    }
                }
            }
            Ok(Event::CData(data)) => {
                if skipped == 0 {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    position = reader.buffer_position(),
                    "Raw item tree unavailable"
                );
                return None;
            }
        }
    }

    Some(items)
}
