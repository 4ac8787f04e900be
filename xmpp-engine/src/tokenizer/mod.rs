// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Incremental XML tokenizer
//!
//! An XMPP stream is a single XML document which is only complete when the
//! session ends. Bytes arrive in whatever chunks the transport hands us,
//! which means that element names, attribute values, entity references and
//! even UTF-8 sequences may be cut at any point.
//!
//! The [`Tokenizer`] drives an [`rxml::Parser`] in feed mode and translates
//! its namespace-resolved events into [`Token`]s. Character data is
//! coalesced until the next element boundary, so the produced token sequence
//! does not depend on how the input was split.
//!
//! Each token carries the nesting depth at which it was emitted:
//!
//! - the document (stream) element starts and ends at depth 0,
//! - its children (stanzas and nonzas) start and end at depth 1,
//! - text carries the number of elements open around it.
//!
//! A self-closing element produces an [`TokenKind::ElementStart`] with
//! [`StartTag::self_closing`] set, immediately followed by an
//! [`TokenKind::ElementEnd`] at the same depth.
//!
//! The parser accepts exactly the restricted XML subset allowed on an XMPP
//! stream: comments, document type declarations and processing instructions
//! are rejected. Any error is sticky: once malformed input has been seen,
//! the framing of the stream is lost and only [`Tokenizer::reset`] makes the
//! tokenizer usable again.

use core::fmt;
use std::collections::VecDeque;
use std::error::Error as StdError;

use bytes::{Buf, BytesMut};
use rxml::error::XmlError;
use rxml::{Event, Namespace, Parse, WithOptions};


/// Default limit for a single name, attribute value or run of text.
pub const DEFAULT_MAX_UNIT_SIZE: usize = 64 * 1024;

/// An element start tag with namespaces resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag {
    /// Local name of the element.
    pub name: String,

    /// Namespace URI the element belongs to.
    pub namespace: Option<String>,

    /// Attributes, ordered by name.
    ///
    /// Namespace declarations are not included. Attributes in the XML
    /// namespace are named `xml:<local>`, attributes in any other namespace
    /// use Clark notation (`{uri}local`).
    pub attributes: Vec<(String, String)>,

    /// Whether the element was written as `<foo/>`.
    pub self_closing: bool,
}

impl StartTag {
    /// Look up an attribute by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check the local name and namespace of the element.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }
}

/// Kind of a structural parse event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Emitted once per document, before the root element.
    DocumentStart,

    /// An element was opened.
    ElementStart(StartTag),

    /// An element was closed.
    ElementEnd {
        /// Local name of the closed element.
        name: String,
    },

    /// Character data, with references expanded and CDATA sections
    /// unwrapped.
    Text(String),

    /// The root element was closed.
    DocumentEnd,
}

/// One structural parse event and the nesting depth it was emitted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// What happened.
    pub kind: TokenKind,

    /// Nesting depth at the time of emission.
    pub depth: usize,
}

/// Detailed reason of a [`TokenizeError`].
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizeErrorKind {
    /// The input is not valid UTF-8.
    InvalidUtf8,

    /// A code point which is not allowed in XML.
    InvalidChar(u32),

    /// A construct which is well-formed XML but not allowed on an XMPP
    /// stream, such as comments or processing instructions.
    Restricted(&'static str),

    /// A well-formedness or namespace-well-formedness violation.
    Malformed(XmlError),

    /// A single name, attribute value or run of text exceeds the configured
    /// size limit.
    UnitTooLarge {
        /// The limit in bytes.
        limit: usize,
    },
}

impl fmt::Display for TokenizeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidUtf8 => f.write_str("invalid UTF-8"),
            Self::InvalidChar(cp) => write!(f, "invalid character U+{:04X}", cp),
            Self::Restricted(what) => write!(f, "{} are not allowed", what),
            Self::Malformed(e) => write!(f, "malformed XML: {}", e),
            Self::UnitTooLarge { limit } => write!(f, "lexical unit exceeds {} bytes", limit),
        }
    }
}

/// Malformed markup, with the byte offset at which it was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizeError {
    /// Byte offset into the stream (counted across resets) up to which the
    /// input had been consumed when the error was detected.
    pub position: u64,

    /// What is wrong.
    pub kind: TokenizeErrorKind,
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at byte {}", self.kind, self.position)
    }
}

impl StdError for TokenizeError {}

/// Incremental, chunk-boundary agnostic XML tokenizer.
///
/// See the [module documentation](self) for details.
pub struct Tokenizer {
    parser: rxml::Parser,

    /// Bytes which have not been handed to the parser yet.
    buf: BytesMut,

    /// Number of bytes handed to the parser so far.
    position: u64,

    /// Local names of the open elements.
    open: Vec<String>,

    /// Character data collected since the last element boundary.
    text: String,

    /// Event (or error) read ahead while looking for a self-closing tag.
    peeked: Option<Result<Event, TokenizeErrorKind>>,

    /// Tokens produced by the last event which have not been handed out yet.
    pending: VecDeque<Token>,

    /// Whether `DocumentStart` has been emitted.
    started: bool,

    /// Whether the root element has been closed.
    finished: bool,

    failed: Option<TokenizeError>,

    max_unit_size: usize,
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tokenizer")
            .field("position", &self.position)
            .field("buffered", &self.buf.len())
            .field("depth", &self.open.len())
            .field("started", &self.started)
            .field("finished", &self.finished)
            .field("failed", &self.failed)
            .finish()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

fn new_parser(max_unit_size: usize) -> rxml::Parser {
    rxml::Parser::with_options(rxml::Options {
        max_token_length: max_unit_size,
        ..rxml::Options::default()
    })
}

fn attribute_name(namespace: &Namespace, local: rxml::NcName) -> String {
    if namespace.is_none() {
        String::from(local)
    } else if namespace.as_str() == rxml::XMLNS_XML {
        format!("xml:{}", local)
    } else {
        format!("{{{}}}{}", namespace, local)
    }
}

impl Tokenizer {
    /// Create a tokenizer with the default unit size limit.
    pub fn new() -> Self {
        Self::with_max_unit_size(DEFAULT_MAX_UNIT_SIZE)
    }

    /// Create a tokenizer which rejects names, attribute values and runs of
    /// text larger than `limit` bytes.
    pub fn with_max_unit_size(limit: usize) -> Self {
        Self {
            parser: new_parser(limit),
            buf: BytesMut::new(),
            position: 0,
            open: Vec::new(),
            text: String::new(),
            peeked: None,
            pending: VecDeque::new(),
            started: false,
            finished: false,
            failed: None,
            max_unit_size: limit,
        }
    }

    /// Number of currently open elements.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Whether the root element has been closed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Discard all state and start a new document.
    ///
    /// Used whenever the stream is restarted (after STARTTLS and after
    /// successful authentication). The byte position keeps counting.
    pub fn reset(&mut self) {
        self.parser = new_parser(self.max_unit_size);
        self.position += self.buf.len() as u64;
        self.buf.clear();
        self.open.clear();
        self.text.clear();
        self.peeked = None;
        self.pending.clear();
        self.started = false;
        self.finished = false;
        self.failed = None;
    }

    /// Append bytes to the internal buffer without tokenizing them.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Append bytes and return an iterator over all tokens which can be
    /// produced so far.
    ///
    /// The iterator stops when more input is needed, or after yielding an
    /// error.
    pub fn feed(&mut self, chunk: &[u8]) -> Tokens<'_> {
        self.push(chunk);
        Tokens {
            tokenizer: self,
            done: false,
        }
    }

    /// Produce the next token from the buffered input.
    ///
    /// Returns `Ok(None)` if more input is needed.
    pub fn next_token(&mut self) -> Result<Option<Token>, TokenizeError> {
        if let Some(ref e) = self.failed {
            return Err(e.clone());
        }
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            let result = match self.next_event() {
                Ok(Some(event)) => self.process(event),
                Ok(None) => return Ok(None),
                Err(kind) => Err(kind),
            };
            if let Err(kind) = result {
                let e = TokenizeError {
                    position: self.position,
                    kind,
                };
                log::debug!("tokenizer failed: {}", e);
                self.failed = Some(e.clone());
                return Err(e);
            }
        }
    }

    fn next_event(&mut self) -> Result<Option<Event>, TokenizeErrorKind> {
        match self.peeked.take() {
            Some(peeked) => peeked.map(Some),
            None => self.parse_event(),
        }
    }

    /// Hand the buffered bytes to the parser until it produces an event.
    fn parse_event(&mut self) -> Result<Option<Event>, TokenizeErrorKind> {
        let mut input = &self.buf[..];
        let result = self.parser.parse(&mut input, false);
        let used = self.buf.len() - input.len();
        self.buf.advance(used);
        self.position += used as u64;
        // With slice input, the only I/O error is "would block".
        match result {
            Ok(event) => Ok(event),
            Err(rxml::Error::IO(_)) => Ok(None),
            Err(rxml::Error::InvalidUtf8Byte(_)) => Err(TokenizeErrorKind::InvalidUtf8),
            Err(rxml::Error::InvalidChar(cp)) => Err(TokenizeErrorKind::InvalidChar(cp)),
            Err(rxml::Error::Xml(e)) => Err(TokenizeErrorKind::Malformed(e)),
            Err(rxml::Error::RestrictedXml("long name or reference" | "event too long")) => {
                Err(TokenizeErrorKind::UnitTooLarge {
                    limit: self.max_unit_size,
                })
            }
            Err(rxml::Error::RestrictedXml(what)) => Err(TokenizeErrorKind::Restricted(what)),
        }
    }

    fn process(&mut self, event: Event) -> Result<(), TokenizeErrorKind> {
        match event {
            Event::XmlDeclaration(..) => self.start_document(),
            Event::StartElement(_, (namespace, name), attributes) => {
                self.start_document();
                self.flush_text();
                // The parser reports `<foo/>` as a start immediately followed
                // by an end which consumed no further input.
                let self_closing = match self.parse_event() {
                    Ok(Some(Event::EndElement(metrics))) if metrics.len() == 0 => true,
                    Ok(None) => false,
                    other => {
                        self.peeked = other.transpose();
                        false
                    }
                };
                let name = String::from(name);
                let depth = self.open.len();
                let tag = StartTag {
                    name: name.clone(),
                    namespace: namespace.is_some().then(|| namespace.to_string()),
                    attributes: attributes
                        .into_iter()
                        .map(|((ns, local), value)| (attribute_name(&ns, local), value))
                        .collect(),
                    self_closing,
                };
                self.pending.push_back(Token {
                    kind: TokenKind::ElementStart(tag),
                    depth,
                });
                if self_closing {
                    self.close_element(name, depth);
                } else {
                    self.open.push(name);
                }
            }
            Event::EndElement(_) => {
                self.flush_text();
                let name = self
                    .open
                    .pop()
                    .ok_or(TokenizeErrorKind::Malformed(XmlError::ElementMismatch))?;
                let depth = self.open.len();
                self.close_element(name, depth);
            }
            Event::Text(_, text) => {
                // Whitespace around the root element is not content.
                if self.open.is_empty() {
                    return Ok(());
                }
                if self.text.len() + text.len() > self.max_unit_size {
                    return Err(TokenizeErrorKind::UnitTooLarge {
                        limit: self.max_unit_size,
                    });
                }
                self.text.push_str(&text);
            }
        }
        Ok(())
    }

    fn start_document(&mut self) {
        if !self.started {
            self.started = true;
            self.pending.push_back(Token {
                kind: TokenKind::DocumentStart,
                depth: 0,
            });
        }
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.pending.push_back(Token {
                kind: TokenKind::Text(std::mem::take(&mut self.text)),
                depth: self.open.len(),
            });
        }
    }

    fn close_element(&mut self, name: String, depth: usize) {
        self.pending.push_back(Token {
            kind: TokenKind::ElementEnd { name },
            depth,
        });
        if depth == 0 {
            self.finished = true;
            self.pending.push_back(Token {
                kind: TokenKind::DocumentEnd,
                depth: 0,
            });
        }
    }
}

/// Iterator returned by [`Tokenizer::feed`].
#[derive(Debug)]
pub struct Tokens<'a> {
    tokenizer: &'a mut Tokenizer,
    done: bool,
}

impl Iterator for Tokens<'_> {
    type Item = Result<Token, TokenizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.tokenizer.next_token() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
