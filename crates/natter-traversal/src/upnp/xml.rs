//! Minimal streaming XML tokenizer
//!
//! Single left-to-right pass over an in-memory buffer, good enough for UPnP
//! device descriptions and SOAP replies. It is not a validating parser:
//!
//! - Namespace prefixes are dropped: the element name is re-anchored after
//!   the last `:` seen before a delimiter, so `<s:Body>` reports `Body`.
//! - `<?...?>` prologs, `<!DOCTYPE ...>` declarations and `<!-- -->` comments
//!   are skipped as opaque noise.
//! - Character data is only reported for the text directly following a start
//!   tag, with leading whitespace trimmed. `<![CDATA[...]]>` content is
//!   reported verbatim.
//! - Malformed input fails open. An unterminated tag, attribute or quote stops
//!   the event stream; events derived before the cut-off are still delivered.
//!
//! # Example
//!
//! ```
//! use natter_traversal::upnp::xml::{XmlEvent, XmlParser};
//!
//! let events: Vec<_> = XmlParser::new(b"<a><b>x</b></a>").collect();
//! assert_eq!(events[2], XmlEvent::Text(b"x"));
//! ```

use std::collections::VecDeque;

/// A single tokenizer event. Spans borrow from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlEvent<'a> {
    /// Element start, namespace prefix removed
    StartElement(&'a [u8]),
    /// Attribute of the most recent start element
    Attribute {
        /// Attribute name as written
        name: &'a [u8],
        /// Unquoted attribute value
        value: &'a [u8],
    },
    /// Character data following a start tag
    Text(&'a [u8]),
    /// Element end (also emitted for self-closing elements)
    EndElement(&'a [u8]),
}

/// Callback interface for consumers that prefer push-style parsing.
///
/// All methods default to no-ops so handlers only implement what they need.
pub trait XmlHandler {
    /// Called for every element start
    fn start_element(&mut self, _name: &[u8]) {}
    /// Called for every element end
    fn end_element(&mut self, _name: &[u8]) {}
    /// Called for character data
    fn text(&mut self, _data: &[u8]) {}
    /// Called for every attribute
    fn attribute(&mut self, _name: &[u8], _value: &[u8]) {}
}

/// Drive `handler` with every event found in `buf`.
pub fn parse<H: XmlHandler + ?Sized>(buf: &[u8], handler: &mut H) {
    for event in XmlParser::new(buf) {
        match event {
            XmlEvent::StartElement(name) => handler.start_element(name),
            XmlEvent::Attribute { name, value } => handler.attribute(name, value),
            XmlEvent::Text(data) => handler.text(data),
            XmlEvent::EndElement(name) => handler.end_element(name),
        }
    }
}

/// Lazy event iterator over an XML buffer.
#[derive(Debug)]
pub struct XmlParser<'a> {
    buf: &'a [u8],
    pos: usize,
    pending: VecDeque<XmlEvent<'a>>,
    done: bool,
}

impl<'a> XmlParser<'a> {
    /// Create a parser over `buf`. Nothing is scanned until the first `next()`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Scan one markup construct starting at the next `<`.
    ///
    /// Every call either moves `pos` forward or sets `done`.
    fn step(&mut self) {
        let buf = self.buf;
        let Some(lt) = find(buf, self.pos, b'<') else {
            self.done = true;
            return;
        };

        if buf[lt..].starts_with(b"<!--") {
            match find_seq(buf, lt + 4, b"-->") {
                Some(end) => self.pos = end + 3,
                None => self.done = true,
            }
            return;
        }

        match buf.get(lt + 1) {
            None => self.done = true,
            Some(b'?' | b'!') => match find(buf, lt + 2, b'>') {
                Some(gt) => self.pos = gt + 1,
                None => self.done = true,
            },
            Some(b'/') => self.end_tag(lt + 2),
            Some(_) => self.start_tag(lt + 1),
        }
    }

    /// Scan an element name beginning at `start`.
    ///
    /// Returns the name (after the last `:`) and the index of the delimiter,
    /// or `None` when the buffer ends inside the name.
    fn scan_name(&self, start: usize) -> Option<(&'a [u8], usize)> {
        let buf = self.buf;
        let mut anchor = start;
        for (i, &b) in buf.iter().enumerate().skip(start) {
            if is_space(b) || b == b'>' || b == b'/' {
                return Some((&buf[anchor..i], i));
            }
            if b == b':' {
                anchor = i + 1;
            }
        }
        None
    }

    fn start_tag(&mut self, start: usize) {
        let buf = self.buf;
        let Some((name, mut i)) = self.scan_name(start) else {
            self.done = true;
            return;
        };
        if name.is_empty() {
            self.pos = start;
            return;
        }

        self.pending.push_back(XmlEvent::StartElement(name));

        loop {
            let Some(&b) = buf.get(i) else {
                self.done = true;
                return;
            };
            match b {
                b'>' => break,
                b'/' => {
                    self.pending.push_back(XmlEvent::EndElement(name));
                    match find(buf, i, b'>') {
                        Some(gt) => self.pos = gt + 1,
                        None => self.done = true,
                    }
                    return;
                }
                b if is_space(b) => i += 1,
                _ => match self.scan_attribute(i) {
                    Some((attr, value, next)) => {
                        self.pending.push_back(XmlEvent::Attribute { name: attr, value });
                        i = next;
                    }
                    None => {
                        self.done = true;
                        return;
                    }
                },
            }
        }

        self.pos = i + 1;
        self.scan_text();
    }

    /// Scan `name="value"`, `name='value'`, `name=value` or a bare `name`.
    fn scan_attribute(&self, start: usize) -> Option<(&'a [u8], &'a [u8], usize)> {
        let buf = self.buf;
        let mut i = start;
        while i < buf.len() && !matches!(buf[i], b'=' | b'>' | b'/') && !is_space(buf[i]) {
            i += 1;
        }
        let name = &buf[start..i];
        while i < buf.len() && is_space(buf[i]) {
            i += 1;
        }
        if *buf.get(i)? != b'=' {
            return Some((name, &buf[i..i], i));
        }
        i += 1;
        while i < buf.len() && is_space(buf[i]) {
            i += 1;
        }

        let sep = *buf.get(i)?;
        if sep == b'"' || sep == b'\'' {
            let value_start = i + 1;
            let end = find(buf, value_start, sep)?;
            Some((name, &buf[value_start..end], end + 1))
        } else {
            let value_start = i;
            while i < buf.len() && !is_space(buf[i]) && buf[i] != b'>' && buf[i] != b'/' {
                i += 1;
            }
            if i >= buf.len() {
                return None;
            }
            Some((name, &buf[value_start..i], i))
        }
    }

    fn scan_text(&mut self) {
        let buf = self.buf;
        let mut i = self.pos;
        while i < buf.len() && is_space(buf[i]) {
            i += 1;
        }

        if buf[i..].starts_with(b"<![CDATA[") {
            let start = i + 9;
            match find_seq(buf, start, b"]]>") {
                Some(end) => {
                    if end > start {
                        self.pending.push_back(XmlEvent::Text(&buf[start..end]));
                    }
                    self.pos = end + 3;
                }
                None => self.done = true,
            }
            return;
        }

        match find(buf, i, b'<') {
            Some(lt) => {
                if lt > i {
                    self.pending.push_back(XmlEvent::Text(&buf[i..lt]));
                }
                self.pos = lt;
            }
            // Text running into the end of the buffer is unterminated.
            None => self.done = true,
        }
    }

    fn end_tag(&mut self, start: usize) {
        let Some((name, i)) = self.scan_name(start) else {
            self.done = true;
            return;
        };
        match find(self.buf, i, b'>') {
            Some(gt) => {
                self.pending.push_back(XmlEvent::EndElement(name));
                self.pos = gt + 1;
            }
            None => self.done = true,
        }
    }
}

impl<'a> Iterator for XmlParser<'a> {
    type Item = XmlEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() && !self.done {
            self.step();
        }
        self.pending.pop_front()
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn find(buf: &[u8], from: usize, needle: u8) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == needle)
        .map(|p| from + p)
}

fn find_seq(buf: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    buf.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn events(input: &[u8]) -> Vec<XmlEvent<'_>> {
        XmlParser::new(input).collect()
    }

    #[test]
    fn test_nested_elements() {
        assert_eq!(
            events(b"<a><b>x</b></a>"),
            vec![
                XmlEvent::StartElement(b"a"),
                XmlEvent::StartElement(b"b"),
                XmlEvent::Text(b"x"),
                XmlEvent::EndElement(b"b"),
                XmlEvent::EndElement(b"a"),
            ]
        );
    }

    #[test]
    fn test_unterminated_input_stops() {
        assert_eq!(
            events(b"<a><b>x"),
            vec![XmlEvent::StartElement(b"a"), XmlEvent::StartElement(b"b")]
        );
        assert_eq!(events(b"<a"), vec![]);
        assert_eq!(events(b"<a></a"), vec![XmlEvent::StartElement(b"a")]);
    }

    #[test]
    fn test_namespace_prefix_removed() {
        let got = events(b"<s:Envelope><s:Body></s:Body></s:Envelope>");
        assert_eq!(
            got,
            vec![
                XmlEvent::StartElement(b"Envelope"),
                XmlEvent::StartElement(b"Body"),
                XmlEvent::EndElement(b"Body"),
                XmlEvent::EndElement(b"Envelope"),
            ]
        );
    }

    #[test]
    fn test_prolog_and_comments_skipped() {
        let got = events(b"<?xml version=\"1.0\"?>\r\n<!-- hi <x> --><root>v</root>");
        assert_eq!(
            got,
            vec![
                XmlEvent::StartElement(b"root"),
                XmlEvent::Text(b"v"),
                XmlEvent::EndElement(b"root"),
            ]
        );
    }

    #[test]
    fn test_attributes() {
        let got = events(b"<u:Act xmlns:u=\"urn:x\" a='1' b=2 flag>t</u:Act>");
        assert_eq!(
            got,
            vec![
                XmlEvent::StartElement(b"Act"),
                XmlEvent::Attribute {
                    name: b"xmlns:u",
                    value: b"urn:x"
                },
                XmlEvent::Attribute {
                    name: b"a",
                    value: b"1"
                },
                XmlEvent::Attribute {
                    name: b"b",
                    value: b"2"
                },
                XmlEvent::Attribute {
                    name: b"flag",
                    value: b""
                },
                XmlEvent::Text(b"t"),
                XmlEvent::EndElement(b"Act"),
            ]
        );
    }

    #[test]
    fn test_unterminated_quote_stops_after_start() {
        let got = events(b"<a href=\"oops><b>x</b>");
        assert_eq!(got, vec![XmlEvent::StartElement(b"a")]);
    }

    #[test]
    fn test_self_closing_element() {
        let got = events(b"<a><b/><c x=\"1\"/></a>");
        assert_eq!(
            got,
            vec![
                XmlEvent::StartElement(b"a"),
                XmlEvent::StartElement(b"b"),
                XmlEvent::EndElement(b"b"),
                XmlEvent::StartElement(b"c"),
                XmlEvent::Attribute {
                    name: b"x",
                    value: b"1"
                },
                XmlEvent::EndElement(b"c"),
                XmlEvent::EndElement(b"a"),
            ]
        );
    }

    #[test]
    fn test_leading_whitespace_trimmed() {
        let got = events(b"<a>\r\n   hello world</a>");
        assert_eq!(got[1], XmlEvent::Text(b"hello world"));
    }

    #[test]
    fn test_cdata() {
        let got = events(b"<a><![CDATA[<not markup>]]></a>");
        assert_eq!(
            got,
            vec![
                XmlEvent::StartElement(b"a"),
                XmlEvent::Text(b"<not markup>"),
                XmlEvent::EndElement(b"a"),
            ]
        );
    }

    #[test]
    fn test_handler_receives_events() {
        #[derive(Default)]
        struct Counter {
            starts: usize,
            ends: usize,
            text: Vec<u8>,
        }
        impl XmlHandler for Counter {
            fn start_element(&mut self, _name: &[u8]) {
                self.starts += 1;
            }
            fn end_element(&mut self, _name: &[u8]) {
                self.ends += 1;
            }
            fn text(&mut self, data: &[u8]) {
                self.text.extend_from_slice(data);
            }
        }

        let mut counter = Counter::default();
        parse(b"<a><b>1</b><c>2</c></a>", &mut counter);
        assert_eq!(counter.starts, 3);
        assert_eq!(counter.ends, 3);
        assert_eq!(counter.text, b"12");
    }

    #[test]
    fn test_stray_angle_brackets() {
        let got = events(b"< a><:><b>y</b>");
        assert_eq!(
            got,
            vec![
                XmlEvent::StartElement(b"b"),
                XmlEvent::Text(b"y"),
                XmlEvent::EndElement(b"b"),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_never_panics(input in proptest::collection::vec(any::<u8>(), 0..512)) {
            let count = XmlParser::new(&input).count();
            prop_assert!(count <= input.len() * 2);
        }

        #[test]
        fn prop_markup_like_input(input in "[<>/=\"' a-c:?!\\-\\[\\]]{0,128}") {
            let _ = XmlParser::new(input.as_bytes()).count();
        }
    }
}
