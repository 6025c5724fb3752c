//! In-memory notation model.
//!
//! The recognition engine writes one partwise MusicXML document per page.
//! [`NotationFragment::parse`] reads it with `roxmltree` into an owned tree
//! so the merger can renumber measures and rename parts without caring about
//! the rest of the markup. Unknown elements are carried through untouched.

use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use roxmltree::{Document, Node, ParsingOptions};
use thiserror::Error;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// `prefix:local` for a namespaced name, `local` otherwise.
fn qualified(node: Node<'_, '_>, namespace: Option<&str>, local: &str) -> String {
    let prefix = match namespace {
        None => None,
        Some(XML_NAMESPACE) => Some("xml"),
        Some(uri) => node.lookup_prefix(uri),
    };
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}:{local}"),
        _ => local.to_string(),
    }
}

/// The engine's output could not be turned into a [`NotationFragment`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotationError {
    #[error("MusicXML is not well-formed: {0}")]
    Parse(String),

    #[error("unsupported MusicXML root <{0}>, expected <score-partwise>")]
    UnsupportedRoot(String),
}

/// A child of an [`XmlElement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// An owned XML element. Whitespace-only text between elements is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Element with a single text child, e.g. `<part-name>Piano</part-name>`.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut el = Self::new(name);
        el.children.push(XmlNode::Text(text.into()));
        el
    }

    /// Copy `node` and its subtree.
    ///
    /// Prefixed names (`xlink:href`, `xml:lang`) keep their prefix, and every
    /// namespace the subtree uses but does not declare itself is declared on
    /// the copy, so it stays well-formed when written out on its own.
    pub(crate) fn from_node(node: Node<'_, '_>) -> Self {
        let mut el = Self::copy_node(node);
        let mut declared = Vec::new();
        let mut missing = Vec::new();
        el.undeclared_prefixes(&mut declared, &mut missing);
        for prefix in missing {
            if let Some(uri) = node.lookup_namespace_uri(Some(prefix.as_str())) {
                el.attributes.insert(0, (format!("xmlns:{prefix}"), uri.to_string()));
            }
        }
        el
    }

    fn copy_node(node: Node<'_, '_>) -> Self {
        let tag = node.tag_name();
        let mut el = Self::new(qualified(node, tag.namespace(), tag.name()));

        let inherited: Vec<(Option<&str>, &str)> = node
            .parent_element()
            .map(|p| p.namespaces().map(|ns| (ns.name(), ns.uri())).collect())
            .unwrap_or_default();
        for ns in node.namespaces() {
            if ns.name() == Some("xml") || inherited.contains(&(ns.name(), ns.uri())) {
                continue;
            }
            let key = match ns.name() {
                Some(prefix) => format!("xmlns:{prefix}"),
                None => "xmlns".to_string(),
            };
            el.attributes.push((key, ns.uri().to_string()));
        }
        el.attributes.extend(node.attributes().map(|a| {
            (
                qualified(node, a.namespace(), a.name()),
                a.value().to_string(),
            )
        }));

        for child in node.children() {
            if child.is_element() {
                el.children.push(XmlNode::Element(Self::copy_node(child)));
            } else if child.is_text() {
                if let Some(text) = child.text() {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        el.children.push(XmlNode::Text(trimmed.to_string()));
                    }
                }
            }
        }
        el
    }

    /// Prefixes used in this subtree without an `xmlns:` declaration in scope.
    fn undeclared_prefixes(&self, declared: &mut Vec<String>, missing: &mut Vec<String>) {
        let scope = declared.len();
        declared.extend(
            self.attributes
                .iter()
                .filter_map(|(k, _)| k.strip_prefix("xmlns:").map(str::to_string)),
        );
        let names = std::iter::once(self.name.as_str())
            .chain(self.attributes.iter().map(|(k, _)| k.as_str()));
        for name in names {
            if let Some((prefix, _)) = name.split_once(':') {
                if prefix != "xml"
                    && prefix != "xmlns"
                    && !declared.iter().any(|d| d == prefix)
                    && !missing.iter().any(|m| m == prefix)
                {
                    missing.push(prefix.to_string());
                }
            }
        }
        for child in self.child_elements() {
            child.undeclared_prefixes(declared, missing);
        }
        declared.truncate(scope);
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replace an attribute value, or append it when absent.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.child_elements().find(|e| e.name == name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .children
            .iter()
            .filter_map(|c| match c {
                XmlNode::Text(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect();
        (!text.is_empty()).then_some(text)
    }

    /// Number of descendant elements (self excluded) with the given name.
    pub fn count_descendants(&self, name: &str) -> usize {
        self.child_elements()
            .map(|e| usize::from(e.name == name) + e.count_descendants(name))
            .sum()
    }

    /// Serialise this element and its subtree.
    pub fn write<W: Write>(&self, writer: &mut Writer<W>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attributes {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
        writer.write_event(Event::Start(start))?;
        for child in &self.children {
            match child {
                XmlNode::Element(e) => e.write(writer)?,
                XmlNode::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

/// A `<score-part>` declaration from the page's part list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScorePart {
    pub id: String,
    pub name: Option<String>,
    pub element: XmlElement,
}

/// One `<measure>` as the engine numbered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measure {
    /// The engine's `number` attribute, which restarts on every page.
    pub number: String,
    pub element: XmlElement,
}

/// One `<part>` and its measures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFragment {
    pub id: String,
    pub measures: Vec<Measure>,
}

/// Structured notation recognised from one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotationFragment {
    pub title: Option<String>,
    pub part_list: Vec<ScorePart>,
    pub parts: Vec<PartFragment>,
}

impl NotationFragment {
    /// Parse a partwise MusicXML document.
    pub fn parse(xml: &str) -> Result<Self, NotationError> {
        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let doc = Document::parse_with_options(xml, options)
            .map_err(|e| NotationError::Parse(e.to_string()))?;
        let root = doc.root_element();
        let root_name = root.tag_name().name();
        if root_name != "score-partwise" {
            return Err(NotationError::UnsupportedRoot(root_name.to_string()));
        }

        let title = root
            .children()
            .filter(|n| n.is_element())
            .find_map(|n| match n.tag_name().name() {
                "movement-title" => n.text(),
                "work" => n
                    .children()
                    .find(|c| c.has_tag_name("work-title"))
                    .and_then(|c| c.text()),
                _ => None,
            })
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let part_list = root
            .children()
            .find(|n| n.has_tag_name("part-list"))
            .map(|list| {
                list.children()
                    .filter(|n| n.has_tag_name("score-part"))
                    .map(|n| {
                        let element = XmlElement::from_node(n);
                        ScorePart {
                            id: element.attr("id").unwrap_or_default().to_string(),
                            name: element.child("part-name").and_then(XmlElement::text),
                            element,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let parts = root
            .children()
            .filter(|n| n.has_tag_name("part"))
            .map(|p| PartFragment {
                id: p.attribute("id").unwrap_or_default().to_string(),
                measures: p
                    .children()
                    .filter(|m| m.has_tag_name("measure"))
                    .map(|m| Measure {
                        number: m.attribute("number").unwrap_or_default().to_string(),
                        element: XmlElement::from_node(m),
                    })
                    .collect(),
            })
            .collect();

        Ok(Self {
            title,
            part_list,
            parts,
        })
    }

    /// Length of the longest part on this page.
    pub fn measure_count(&self) -> usize {
        self.parts.iter().map(|p| p.measures.len()).max().unwrap_or(0)
    }

    pub fn clef_count(&self) -> usize {
        self.count("clef")
    }

    pub fn note_count(&self) -> usize {
        self.count("note")
    }

    /// A page counts as recognised once it yields a measure or a clef.
    pub fn has_notation(&self) -> bool {
        self.measure_count() > 0 || self.clef_count() > 0
    }

    fn count(&self, name: &str) -> usize {
        self.parts
            .iter()
            .flat_map(|p| &p.measures)
            .map(|m| m.element.count_descendants(name))
            .sum()
    }
}
