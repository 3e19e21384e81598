//! Document tree: an arena of nodes built from markup reader events.
//!
//! The tree is built once per compile and never mutated afterwards; the
//! execution engine walks it read-only, possibly many times over the same
//! subtree (repeater iterations). Parent links are arena indices, so the
//! upward references needed for diagnostics carry no ownership.

use std::io::BufRead;

use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::CompileError;

/// Index into [`Document::nodes`]. Slot 0 is always the document root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element,
    Text,
}

/// One construct in the document.
///
/// `name` is set for elements, `value` for text; attributes keep their
/// raw, unresolved values in encounter order.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub name: String,
    pub value: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    /// Whether the element was written as `<x/>`, preserved so empty
    /// elements round-trip in the same form.
    pub self_closing: bool,
}

impl Node {
    fn document() -> Self {
        Self {
            kind: NodeKind::Document,
            name: String::new(),
            value: String::new(),
            attributes: Vec::new(),
            children: Vec::new(),
            parent: None,
            self_closing: false,
        }
    }

    /// Look up an attribute value by exact name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// An immutable tree of [`Node`]s. Built by [`Document::from_reader`],
/// walked by the execution engine.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Document {
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn push(&mut self, mut node: Node, parent: NodeId) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Append text under `parent`, merging with a preceding text sibling.
    ///
    /// quick-xml splits text around entity references; the tree keeps one
    /// Text node per contiguous run so injection sees the whole string.
    fn append_text(&mut self, parent: NodeId, text: &str) {
        if let Some(&last) = self.nodes[parent.0].children.last() {
            if self.nodes[last.0].kind == NodeKind::Text {
                self.nodes[last.0].value.push_str(text);
                return;
            }
        }
        self.push(
            Node {
                kind: NodeKind::Text,
                name: String::new(),
                value: text.to_string(),
                attributes: Vec::new(),
                children: Vec::new(),
                parent: None,
                self_closing: false,
            },
            parent,
        );
    }

    /// Consume reader events into a tree.
    ///
    /// Element-start pushes a new cursor, element-end pops it, text is
    /// parented to the cursor. Declarations, comments, processing
    /// instructions, and doctypes never enter the tree. Any structural
    /// problem is a fatal parse error.
    pub fn from_reader<R: BufRead>(mut reader: Reader<R>) -> Result<Self, CompileError> {
        let mut doc = Document {
            nodes: vec![Node::document()],
        };
        let mut cursor = doc.root();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| {
                    CompileError::parse_at(format!("malformed markup: {e}"), reader.buffer_position())
                })?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let self_closing = matches!(event, Event::Empty(_));
                    let name = decode_name(e.name().as_ref(), &reader)?;

                    let mut attributes = Vec::new();
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| {
                            CompileError::parse_at(
                                format!("bad attribute: {e}"),
                                reader.buffer_position(),
                            )
                        })?;
                        let key = decode_name(attr.key.as_ref(), &reader)?;
                        let value = attr
                            .unescape_value()
                            .map_err(|e| {
                                CompileError::parse_at(
                                    format!("bad attribute value: {e}"),
                                    reader.buffer_position(),
                                )
                            })?
                            .into_owned();
                        attributes.push((key, value));
                    }

                    let id = doc.push(
                        Node {
                            kind: NodeKind::Element,
                            name,
                            value: String::new(),
                            attributes,
                            children: Vec::new(),
                            parent: None,
                            self_closing,
                        },
                        cursor,
                    );
                    if !self_closing {
                        cursor = id;
                    }
                }
                Event::End(ref e) => {
                    let name = decode_name(e.name().as_ref(), &reader)?;
                    let current = doc.node(cursor);
                    if current.kind == NodeKind::Document {
                        return Err(CompileError::parse_at(
                            format!("closing tag </{name}> with no open element"),
                            reader.buffer_position(),
                        ));
                    }
                    if current.name != name {
                        return Err(CompileError::parse_at(
                            format!("expected </{}>, found </{name}>", current.name),
                            reader.buffer_position(),
                        ));
                    }
                    cursor = current.parent.expect("non-document nodes have a parent");
                }
                Event::Text(e) => {
                    let text = e.decode().map_err(|e| {
                        CompileError::parse_at(
                            format!("bad text content: {e}"),
                            reader.buffer_position(),
                        )
                    })?;
                    doc.append_text(cursor, &text);
                }
                Event::CData(e) => {
                    let text = std::str::from_utf8(e.as_ref()).map_err(|e| {
                        CompileError::parse_at(
                            format!("CDATA is not valid UTF-8: {e}"),
                            reader.buffer_position(),
                        )
                    })?;
                    doc.append_text(cursor, text);
                }
                Event::GeneralRef(e) => {
                    let raw = e.decode().map_err(|e| {
                        CompileError::parse_at(
                            format!("bad entity reference: {e}"),
                            reader.buffer_position(),
                        )
                    })?;
                    doc.append_text(cursor, &resolve_entity(&raw));
                }
                // Ignorable events never enter the tree.
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => {
                    if doc.node(cursor).kind != NodeKind::Document {
                        return Err(CompileError::parse(format!(
                            "unexpected end of input: <{}> is still open",
                            doc.node(cursor).name
                        )));
                    }
                    break;
                }
            }
        }

        Ok(doc)
    }
}

fn decode_name<R>(bytes: &[u8], reader: &Reader<R>) -> Result<String, CompileError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| CompileError::parse_at(format!("name is not valid UTF-8: {e}"), reader.buffer_position()))
}

/// Resolve predefined XML entities and numeric character references.
/// Unknown entities pass through verbatim.
fn resolve_entity(raw: &str) -> String {
    if let Some(resolved) = resolve_xml_entity(raw) {
        return resolved.to_string();
    }

    let numeric = raw.strip_prefix('#').and_then(|rest| {
        let code = if let Some(hex) = rest.strip_prefix('x').or_else(|| rest.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            rest.parse::<u32>().ok()?
        };
        char::from_u32(code)
    });
    match numeric {
        Some(c) => c.to_string(),
        None => format!("&{raw};"),
    }
}
