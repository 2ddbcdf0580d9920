//! Minimal XML element model used by every stream state.
//!
//! Elements are parsed one top-level stanza at a time against the namespace
//! scope declared on the enclosing `<stream:stream>` header, so prefixes such
//! as `db:` resolve even though they are declared on the stream element.

use std::collections::HashMap;
use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::ns;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Malformed(String),
    #[error("undeclared namespace prefix '{0}'")]
    UnboundPrefix(String),
    #[error("document contains no element")]
    Empty,
}

/// Prefix → namespace bindings. The empty prefix is the default namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NsScope {
    bindings: HashMap<String, String>,
}

impl NsScope {
    pub fn new() -> Self {
        let mut scope = Self::default();
        scope.bindings.insert("xml".into(), ns::XML.into());
        scope
    }

    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.bindings.get(prefix).map(String::as_str)
    }

    /// Child scope with the `xmlns` declarations from `attrs` applied.
    fn extend(&self, attrs: &[(String, String)]) -> NsScope {
        let mut child = self.clone();
        for (key, value) in attrs {
            if key == "xmlns" {
                child.bindings.insert(String::new(), value.clone());
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                child.bindings.insert(prefix.to_owned(), value.clone());
            }
        }
        child
    }
}

/// A parsed or constructed XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// New element without a namespace declaration; it inherits the
    /// default namespace of wherever it is written.
    pub fn new(name: &str) -> Self {
        let (prefix, local) = split_qname(name);
        Self {
            prefix: prefix.map(str::to_owned),
            name: local.to_owned(),
            ns: None,
            attrs: Vec::new(),
            children: Vec::new(),
            text: String::new(),
        }
    }

    /// New element declaring `ns` (as `xmlns` or `xmlns:prefix`).
    pub fn with_ns(name: &str, namespace: &str) -> Self {
        let mut el = Self::new(name);
        let decl = match &el.prefix {
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_owned(),
        };
        el.attrs.push((decl, namespace.to_owned()));
        el.ns = Some(namespace.to_owned());
        el
    }

    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// True when the element has local name `name` in namespace `namespace`.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(namespace)
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key.to_owned(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(idx).1)
    }

    /// Attributes excluding namespace declarations.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs
            .iter()
            .filter(|(k, _)| k != "xmlns" && !k.starts_with("xmlns:"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Namespace declarations carried on this element.
    pub fn namespace_decls(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs
            .iter()
            .filter(|(k, _)| k == "xmlns" || k.starts_with("xmlns:"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn find_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name, namespace))
    }

    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.find_child(name, namespace).is_some()
    }

    pub fn text_content(&self) -> &str {
        &self.text
    }

    /// Serialize the complete element.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_into(&mut out);
        out
    }

    /// Serialize only the opening tag, as used for `<stream:stream>` headers.
    pub fn to_open_tag(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_start(&mut out);
        out.push('>');
        out
    }

    fn qname(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.name),
            None => self.name.clone(),
        }
    }

    fn write_start(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.qname());
        for (key, value) in &self.attrs {
            let _ = write!(out, " {key}='{}'", escape(value));
        }
    }

    fn write_into(&self, out: &mut String) {
        self.write_start(out);
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(&self.text));
        for child in &self.children {
            child.write_into(out);
        }
        let _ = write!(out, "</{}>", self.qname());
    }

    /// Parse a single element from `input`, resolving prefixes against `scope`.
    pub fn parse(input: &[u8], scope: &NsScope) -> Result<Element, XmlError> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<(Element, NsScope)> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let parent_scope = stack.last().map(|(_, s)| s).unwrap_or(scope);
                    let (el, child_scope) = Element::from_start(&start, parent_scope)?;
                    stack.push((el, child_scope));
                }
                Ok(Event::Empty(start)) => {
                    let parent_scope = stack.last().map(|(_, s)| s).unwrap_or(scope);
                    let (el, _) = Element::from_start(&start, parent_scope)?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.children.push(el),
                        None => return Ok(el),
                    }
                }
                Ok(Event::End(_)) => {
                    let (el, _) = stack.pop().ok_or_else(|| XmlError::Malformed("unbalanced end tag".into()))?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.children.push(el),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Text(text)) => {
                    if let Some((el, _)) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| XmlError::Malformed(e.to_string()))?;
                        el.text.push_str(&text);
                    }
                }
                Ok(Event::CData(data)) => {
                    if let Some((el, _)) = stack.last_mut() {
                        el.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Ok(Event::Eof) => {
                    return Err(if stack.is_empty() {
                        XmlError::Empty
                    } else {
                        XmlError::Malformed("unexpected end of input".into())
                    });
                }
                Ok(_) => {}
                Err(e) => return Err(XmlError::Malformed(e.to_string())),
            }
        }
    }

    /// Build an element (without children) from a start tag, returning the
    /// scope its children resolve against.
    pub fn from_start(start: &BytesStart<'_>, scope: &NsScope) -> Result<(Element, NsScope), XmlError> {
        let qname = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| XmlError::Malformed(e.to_string()))?
                .into_owned();
            attrs.push((key, value));
        }
        let child_scope = scope.extend(&attrs);
        let (prefix, local) = split_qname(&qname);
        let ns = match prefix {
            Some(p) => Some(
                child_scope
                    .resolve(p)
                    .ok_or_else(|| XmlError::UnboundPrefix(p.to_owned()))?
                    .to_owned(),
            ),
            None => child_scope.resolve("").map(str::to_owned),
        };
        let el = Element {
            prefix: prefix.map(str::to_owned),
            name: local.to_owned(),
            ns,
            attrs,
            children: Vec::new(),
            text: String::new(),
        };
        Ok((el, child_scope))
    }

    /// Scope declared by this element relative to `parent`.
    pub fn scope(&self, parent: &NsScope) -> NsScope {
        parent.extend(&self.attrs)
    }
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

/// Escape text for use in attribute values and character data.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
