//! Owned XML document model.
//!
//! Uses quick-xml, which is safe against XXE by default (doesn't expand
//! entities). DOCTYPE declarations are rejected outright since no request or
//! response of the service carries one.

use crate::error::{OpdmError, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// A node in an element's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

/// An XML element. The name is kept as written, prefix included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    /// Qualified name, e.g. `sm:part`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map_or(self.name.as_str(), |(_, local)| local)
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set an attribute, replacing an existing one of the same name.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// Replace all text content. Child elements are kept.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children
            .retain(|node| !matches!(node, Node::Text(_) | Node::CData(_)));
        let text = text.into();
        if !text.is_empty() {
            self.children.push(Node::Text(text));
        }
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn first_child_element(&self) -> Option<&Element> {
        self.child_elements().next()
    }

    /// First child element with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.child_elements()
            .find(|element| element.local_name() == local_name)
    }

    /// First descendant (depth-first, document order) with the given local name.
    pub fn descendant(&self, local_name: &str) -> Option<&Element> {
        for child in self.child_elements() {
            if child.local_name() == local_name {
                return Some(child);
            }
            if let Some(found) = child.descendant(local_name) {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated direct text content, trimmed.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for node in &self.children {
            if let Node::Text(t) | Node::CData(t) = node {
                text.push_str(t);
            }
        }
        text.trim().to_string()
    }

    /// Namespace declarations carried by this element (`None` = default namespace).
    pub fn namespace_declarations(&self) -> impl Iterator<Item = (Option<&str>, &str)> {
        self.attributes.iter().filter_map(|(key, value)| {
            if key == "xmlns" {
                Some((None, value.as_str()))
            } else {
                key.strip_prefix("xmlns:")
                    .map(|prefix| (Some(prefix), value.as_str()))
            }
        })
    }

    /// Serialize with two-space indentation.
    pub fn to_pretty_string(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out, Some(0));
        out
    }

    /// Serialize without added whitespace.
    pub fn to_compact_string(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out, None);
        out
    }

    fn write_to(&self, out: &mut String, depth: Option<usize>) {
        let indent = depth.map(|d| "  ".repeat(d)).unwrap_or_default();
        out.push_str(&indent);
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push_str(&format!(" {}=\"{}\"", key, escape(value.as_str())));
        }

        if self.children.is_empty() {
            out.push_str("/>");
            if depth.is_some() {
                out.push('\n');
            }
            return;
        }

        let has_elements = self
            .children
            .iter()
            .any(|node| matches!(node, Node::Element(_)));

        if !has_elements || depth.is_none() {
            out.push('>');
            for node in &self.children {
                write_inline(node, out);
            }
        } else {
            out.push_str(">\n");
            let child_depth = depth.map(|d| d + 1);
            for node in &self.children {
                match node {
                    Node::Element(element) => element.write_to(out, child_depth),
                    other => {
                        out.push_str(&"  ".repeat(child_depth.unwrap_or_default()));
                        write_inline(other, out);
                        out.push('\n');
                    }
                }
            }
            out.push_str(&indent);
        }

        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
        if depth.is_some() {
            out.push('\n');
        }
    }
}

fn write_inline(node: &Node, out: &mut String) {
    match node {
        Node::Element(element) => element.write_to(out, None),
        Node::Text(text) => out.push_str(&escape(text.as_str())),
        Node::CData(text) => {
            out.push_str("<![CDATA[");
            out.push_str(text);
            out.push_str("]]>");
        }
        Node::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
    }
}

/// A parsed XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    declaration: bool,
    root: Element,
}

impl Document {
    /// Parse raw bytes as an XML document.
    pub fn parse_bytes(data: &[u8]) -> Result<Self> {
        let xml = std::str::from_utf8(data)
            .map_err(|e| OpdmError::XmlParse(format!("Invalid UTF-8: {}", e)))?;
        Self::parse(xml)
    }

    /// Parse an XML document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut declaration = false;

        loop {
            match reader.read_event()? {
                Event::Decl(_) => declaration = true,
                Event::DocType(_) => {
                    return Err(OpdmError::XmlParse(
                        "DOCTYPE declarations are not allowed".to_string(),
                    ));
                }
                Event::Start(ref e) => stack.push(element_from_start(e)?),
                Event::Empty(ref e) => {
                    let element = element_from_start(e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        OpdmError::XmlParse("Unexpected closing tag".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(ref e) => {
                    let text = e.unescape()?.into_owned();
                    if text.is_empty() {
                        continue;
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Text(text)),
                        None => {
                            return Err(OpdmError::XmlParse(
                                "Text outside of the root element".to_string(),
                            ));
                        }
                    }
                }
                Event::CData(ref e) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8_lossy(e).into_owned();
                        parent.children.push(Node::CData(text));
                    }
                }
                Event::Comment(ref e) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8_lossy(e).into_owned();
                        parent.children.push(Node::Comment(text));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(OpdmError::XmlParse(format!(
                "Unclosed element '{}'",
                open.name
            )));
        }

        let root = root
            .ok_or_else(|| OpdmError::XmlParse("Document has no root element".to_string()))?;

        Ok(Self { declaration, root })
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }

    /// Namespace map of the root element: prefix (or `None` for the
    /// default namespace) to URI.
    pub fn namespaces(&self) -> Vec<(Option<&str>, &str)> {
        self.root.namespace_declarations().collect()
    }

    /// URI bound to `prefix` on the root element.
    pub fn namespace_uri(&self, prefix: &str) -> Option<&str> {
        self.root
            .namespace_declarations()
            .find(|(p, _)| *p == Some(prefix))
            .map(|(_, uri)| uri)
    }

    /// Find the first element matching `path`.
    pub fn find(&self, path: &str) -> Result<Option<&Element>> {
        let indices = self.locate(path)?;
        Ok(indices.and_then(|indices| self.element_at(&indices)))
    }

    /// Mutable variant of [`Document::find`].
    pub fn find_mut(&mut self, path: &str) -> Result<Option<&mut Element>> {
        let indices = self.locate(path)?;
        Ok(indices.and_then(move |indices| self.element_at_mut(&indices)))
    }

    /// Serialize with two-space indentation.
    pub fn to_pretty_string(&self) -> String {
        let mut out = String::new();
        if self.declaration {
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        }
        out.push_str(&self.root.to_pretty_string());
        out
    }

    fn locate(&self, path: &str) -> Result<Option<Vec<usize>>> {
        let (axis, steps) = self.compile_path(path)?;
        let mut scope = NamespaceScope::default();
        scope.push(&self.root);
        let mut indices = Vec::new();

        let found = match axis {
            Axis::Child => match_children(&self.root, &steps, &mut scope, &mut indices),
            Axis::Descendant => search_descendants(&self.root, &steps, &mut scope, &mut indices),
        };

        Ok(found.then_some(indices))
    }

    fn compile_path(&self, path: &str) -> Result<(Axis, Vec<PathStep>)> {
        let trimmed = path.trim();
        let (axis, rest) = if let Some(rest) = trimmed.strip_prefix(".//") {
            (Axis::Descendant, rest)
        } else if let Some(rest) = trimmed.strip_prefix("./") {
            (Axis::Child, rest)
        } else {
            (Axis::Child, trimmed)
        };

        let mut steps = Vec::new();
        for step in rest.split('/') {
            if step.is_empty() {
                return Err(OpdmError::AnchorNotFound(format!(
                    "{} (empty path step)",
                    path
                )));
            }
            let (uri, local) = match step.split_once(':') {
                Some((prefix, local)) => {
                    let uri = self.namespace_uri(prefix).ok_or_else(|| {
                        OpdmError::AnchorNotFound(format!(
                            "{} (prefix '{}' is not declared)",
                            path, prefix
                        ))
                    })?;
                    (Some(uri.to_string()), local.to_string())
                }
                None => (None, step.to_string()),
            };
            steps.push(PathStep { uri, local });
        }

        Ok((axis, steps))
    }

    fn element_at(&self, indices: &[usize]) -> Option<&Element> {
        let mut current = &self.root;
        for &index in indices {
            current = match current.children.get(index) {
                Some(Node::Element(child)) => child,
                _ => return None,
            };
        }
        Some(current)
    }

    fn element_at_mut(&mut self, indices: &[usize]) -> Option<&mut Element> {
        let mut current = &mut self.root;
        for &index in indices {
            current = match current.children.get_mut(index) {
                Some(Node::Element(child)) => child,
                _ => return None,
            };
        }
        Some(current)
    }
}

enum Axis {
    Child,
    Descendant,
}

struct PathStep {
    /// Resolved namespace URI; `None` matches any namespace
    uri: Option<String>,
    /// Local name, `*` matches any element
    local: String,
}

/// In-scope namespace declarations while walking the tree.
#[derive(Default)]
struct NamespaceScope {
    frames: Vec<Vec<(Option<String>, String)>>,
}

impl NamespaceScope {
    fn push(&mut self, element: &Element) {
        self.frames.push(
            element
                .namespace_declarations()
                .map(|(prefix, uri)| (prefix.map(str::to_string), uri.to_string()))
                .collect(),
        );
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| {
            frame
                .iter()
                .find(|(p, _)| p.as_deref() == prefix)
                .map(|(_, uri)| uri.as_str())
        })
    }
}

fn step_matches(step: &PathStep, element: &Element, scope: &NamespaceScope) -> bool {
    if step.local != "*" && step.local != element.local_name() {
        return false;
    }
    match step.uri {
        Some(ref uri) => scope.resolve(element.prefix()) == Some(uri.as_str()),
        None => true,
    }
}

fn match_children(
    parent: &Element,
    steps: &[PathStep],
    scope: &mut NamespaceScope,
    indices: &mut Vec<usize>,
) -> bool {
    let Some((step, rest)) = steps.split_first() else {
        return true;
    };

    for (index, node) in parent.children.iter().enumerate() {
        let Node::Element(child) = node else {
            continue;
        };
        scope.push(child);
        if step_matches(step, child, scope) {
            indices.push(index);
            if match_children(child, rest, scope, indices) {
                scope.pop();
                return true;
            }
            indices.pop();
        }
        scope.pop();
    }

    false
}

fn search_descendants(
    parent: &Element,
    steps: &[PathStep],
    scope: &mut NamespaceScope,
    indices: &mut Vec<usize>,
) -> bool {
    let Some((step, rest)) = steps.split_first() else {
        return true;
    };

    for (index, node) in parent.children.iter().enumerate() {
        let Node::Element(child) = node else {
            continue;
        };
        scope.push(child);
        indices.push(index);
        if step_matches(step, child, scope) && match_children(child, rest, scope, indices) {
            scope.pop();
            return true;
        }
        if search_descendants(child, steps, scope, indices) {
            scope.pop();
            return true;
        }
        indices.pop();
        scope.pop();
    }

    false
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        Ok(())
    } else if root.is_some() {
        Err(OpdmError::XmlParse(
            "Document has more than one root element".to_string(),
        ))
    } else {
        *root = Some(element);
        Ok(())
    }
}

fn element_from_start(start: &BytesStart) -> Result<Element> {
    let mut element = Element::new(utf8(start.name().as_ref())?);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| OpdmError::XmlParse(e.to_string()))?;
        let key = utf8(attr.key.as_ref())?;
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| OpdmError::XmlParse(format!("Invalid UTF-8: {}", e)))
}
