//! Minimal XML element scanner.
//!
//! Firehose frames and rawprogram/patch manifests are flat lists of
//! attribute-only elements, so this only extracts element names and
//! attributes in document order. Text content is ignored.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("Unterminated {what} at byte {pos}")]
    Unterminated { what: &'static str, pos: usize },

    #[error("Malformed XML at byte {pos}: {message}")]
    Malformed { pos: usize, message: String },
}

/// An element and its attributes, in source order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

impl XmlElement {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn skip_past(&mut self, marker: &str, what: &'static str) -> Result<(), XmlError> {
        match self.rest().find(marker) {
            Some(idx) => {
                self.pos += idx + marker.len();
                Ok(())
            }
            None => Err(XmlError::Unterminated {
                what,
                pos: self.pos,
            }),
        }
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn take_name(&mut self) -> &'a str {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '/' | '>' | '='))
            .unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn malformed(&self, message: impl Into<String>) -> XmlError {
        XmlError::Malformed {
            pos: self.pos,
            message: message.into(),
        }
    }

    fn element(&mut self) -> Result<XmlElement, XmlError> {
        let name = self.take_name();
        if name.is_empty() {
            return Err(self.malformed("empty element name"));
        }
        let mut element = XmlElement {
            name: name.to_string(),
            attributes: Vec::new(),
        };

        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    return Err(XmlError::Unterminated {
                        what: "element",
                        pos: self.pos,
                    });
                }
                Some('>') => {
                    self.pos += 1;
                    return Ok(element);
                }
                Some('/') => {
                    self.pos += 1;
                    if self.peek() != Some('>') {
                        return Err(self.malformed("expected '>' after '/'"));
                    }
                    self.pos += 1;
                    return Ok(element);
                }
                Some(_) => {
                    let key = self.take_name();
                    if key.is_empty() {
                        return Err(self.malformed("empty attribute name"));
                    }
                    self.skip_ws();
                    if self.peek() != Some('=') {
                        return Err(self.malformed(format!("attribute {key} has no value")));
                    }
                    self.pos += 1;
                    self.skip_ws();
                    let quote = match self.peek() {
                        Some(q @ ('"' | '\'')) => q,
                        _ => return Err(self.malformed("expected quoted attribute value")),
                    };
                    self.pos += 1;
                    let rest = self.rest();
                    let end = rest.find(quote).ok_or(XmlError::Unterminated {
                        what: "attribute value",
                        pos: self.pos,
                    })?;
                    let value = unescape(&rest[..end]);
                    self.pos += end + 1;
                    element.attributes.push((key.to_string(), value));
                }
            }
        }
    }
}

/// All start and empty-element tags in `src`, in order.
pub fn parse_elements(src: &str) -> Result<Vec<XmlElement>, XmlError> {
    let mut scanner = Scanner { src, pos: 0 };
    let mut elements = Vec::new();

    while let Some(idx) = scanner.rest().find('<') {
        scanner.pos += idx;
        let rest = scanner.rest();
        if rest.starts_with("<?") {
            scanner.skip_past("?>", "declaration")?;
        } else if rest.starts_with("<!--") {
            scanner.skip_past("-->", "comment")?;
        } else if rest.starts_with("<![CDATA[") {
            scanner.skip_past("]]>", "CDATA section")?;
        } else if rest.starts_with("<!") || rest.starts_with("</") {
            scanner.skip_past(">", "tag")?;
        } else {
            scanner.pos += 1;
            elements.push(scanner.element()?);
        }
    }
    Ok(elements)
}

/// Replace the predefined entities and numeric character references.
pub fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape a string for use inside a double-quoted attribute.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_frame() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" MemoryName="eMMC" /></data>"#;
        let elements = parse_elements(doc).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].name, "data");
        assert_eq!(elements[1].name, "response");
        assert_eq!(elements[1].attr("value"), Some("ACK"));
        assert_eq!(elements[1].attr("MemoryName"), Some("eMMC"));
    }

    #[test]
    fn test_values_with_spaces_and_markup() {
        let doc = r#"<data><log value="INFO: a > b &amp; c &lt;d&gt;" /><log value='x="1"'/></data>"#;
        let elements = parse_elements(doc).unwrap();
        assert_eq!(elements[1].attr("value"), Some("INFO: a > b & c <d>"));
        assert_eq!(elements[2].attr("value"), Some("x=\"1\""));
    }

    #[test]
    fn test_comments_and_multiline_manifest() {
        let doc = "<?xml version=\"1.0\" ?>\n<!-- generated -->\n<data>\n  <program\n    label=\"boot\"\n    sparse=\"false\"/>\n</data>\n";
        let elements = parse_elements(doc).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].attr("label"), Some("boot"));
        assert_eq!(elements[1].attr("sparse"), Some("false"));
    }

    #[test]
    fn test_unterminated() {
        assert!(matches!(
            parse_elements("<data><response value=\"ACK"),
            Err(XmlError::Unterminated { .. })
        ));
        assert!(matches!(
            parse_elements("<data><response value=ACK/>"),
            Err(XmlError::Malformed { .. })
        ));
    }

    #[test]
    fn test_escape_roundtrip() {
        let raw = "a&b<c>\"d\"";
        assert_eq!(unescape(&escape_attr(raw)), raw);
        assert_eq!(unescape("&#65;&#x42;&bogus;"), "AB&bogus;");
    }
}
