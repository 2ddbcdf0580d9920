//! Splits an incoming XML byte stream into stream-level frames.
//!
//! A connection carries one long-lived `<stream:stream>` document. The framer
//! buffers raw bytes and yields the stream header, each complete top-level
//! element (parsed against the namespaces the header declared) and the
//! closing `</stream:stream>` tag.

use quick_xml::Reader;
use quick_xml::errors::{Error as XmlParseError, SyntaxError};
use quick_xml::events::Event;
use trellis_common::StreamError;
use trellis_common::xml::{Element, NsScope};

/// One unit of stream input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `<stream:stream>` header, without children.
    Open(Element),
    /// A complete top-level element.
    Element(Element),
    /// `</stream:stream>`.
    Close,
}

enum Scan {
    Open { end: usize },
    Element { start: usize, end: usize },
    Close { end: usize },
    /// Nothing complete yet; `consumed` bytes of prolog or whitespace can go.
    Incomplete { consumed: usize },
}

pub struct StreamFramer {
    buf: Vec<u8>,
    scope: NsScope,
    max_frame_size: usize,
}

impl StreamFramer {
    pub fn new(max_frame_size: usize) -> Self {
        Self { buf: Vec::new(), scope: NsScope::new(), max_frame_size }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discard buffered input and the header's namespace scope. Used when the
    /// stream restarts after TLS or SASL negotiation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scope = NsScope::new();
    }

    /// Extract the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        match self.scan()? {
            Scan::Open { end } => {
                let (header, scope) = parse_header(&self.buf[..end])?;
                self.scope = scope;
                self.buf.drain(..end);
                Ok(Some(Frame::Open(header)))
            }
            Scan::Element { start, end } => {
                if end - start > self.max_frame_size {
                    return Err(StreamError::PolicyViolation(format!(
                        "element of {} bytes exceeds framing limit of {}",
                        end - start,
                        self.max_frame_size
                    )));
                }
                let el = Element::parse(&self.buf[start..end], &self.scope)
                    .map_err(|_| StreamError::NotWellFormed)?;
                self.buf.drain(..end);
                Ok(Some(Frame::Element(el)))
            }
            Scan::Close { end } => {
                self.buf.drain(..end);
                Ok(Some(Frame::Close))
            }
            Scan::Incomplete { consumed } => {
                self.buf.drain(..consumed);
                if self.buf.len() > self.max_frame_size {
                    return Err(StreamError::PolicyViolation(format!(
                        "buffered {} bytes without a complete stanza",
                        self.buf.len()
                    )));
                }
                Ok(None)
            }
        }
    }

    fn scan(&self) -> Result<Scan, StreamError> {
        let mut reader = Reader::from_reader(self.buf.as_slice());
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        let mut open: Vec<Vec<u8>> = Vec::new();
        let mut start = 0;
        let mut consumed = 0;

        loop {
            let pos = reader.buffer_position() as usize;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(XmlParseError::Syntax(
                    SyntaxError::UnclosedTag
                    | SyntaxError::UnclosedComment
                    | SyntaxError::UnclosedCData
                    | SyntaxError::UnclosedDoctype
                    | SyntaxError::UnclosedPIOrXmlDecl,
                )) => return Ok(Scan::Incomplete { consumed }),
                Err(_) => return Err(StreamError::NotWellFormed),
            };
            let here = reader.buffer_position() as usize;

            match event {
                Event::Start(e) => {
                    if open.is_empty() && is_stream_tag(e.name().as_ref()) {
                        return Ok(Scan::Open { end: here });
                    }
                    if open.is_empty() {
                        start = pos;
                    }
                    open.push(e.name().as_ref().to_vec());
                }
                Event::Empty(e) => {
                    if open.is_empty() {
                        if is_stream_tag(e.name().as_ref()) {
                            return Err(StreamError::NotWellFormed);
                        }
                        return Ok(Scan::Element { start: pos, end: here });
                    }
                }
                Event::End(e) => match open.pop() {
                    Some(name) if name.as_slice() == e.name().as_ref() => {
                        if open.is_empty() {
                            return Ok(Scan::Element { start, end: here });
                        }
                    }
                    Some(_) => return Err(StreamError::NotWellFormed),
                    None if is_stream_tag(e.name().as_ref()) => return Ok(Scan::Close { end: here }),
                    None => return Err(StreamError::NotWellFormed),
                },
                Event::Text(text) => {
                    if open.is_empty() {
                        if !text.iter().all(u8::is_ascii_whitespace) {
                            return Err(StreamError::NotWellFormed);
                        }
                        consumed = here;
                    }
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {
                    if open.is_empty() {
                        consumed = here;
                    }
                }
                Event::CData(_) => {
                    if open.is_empty() {
                        return Err(StreamError::NotWellFormed);
                    }
                }
                Event::Eof => return Ok(Scan::Incomplete { consumed }),
            }
        }
    }
}

fn is_stream_tag(qname: &[u8]) -> bool {
    qname == b"stream:stream" || qname == b"stream"
}

fn parse_header(bytes: &[u8]) -> Result<(Element, NsScope), StreamError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                return Element::from_start(&start, &NsScope::new()).map_err(|_| StreamError::NotWellFormed);
            }
            Ok(Event::Eof) | Err(_) => return Err(StreamError::NotWellFormed),
            Ok(_) => {}
        }
    }
}
