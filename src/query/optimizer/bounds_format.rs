use crate::query::optimizer::bounds::ValueInterval;
use bson::Bson;
use std::fmt::Write;
use std::ops::Bound;

#[cfg(test)]
use crate::error::{Error, Result};
#[cfg(test)]
use crate::query::BsonValue;
#[cfg(test)]
use crate::util::interval::Interval;
#[cfg(test)]
use bson::{oid::ObjectId, spec::BinarySubtype, Binary, Document, Regex, Timestamp};
#[cfg(test)]
use std::str::FromStr;

/// Renders an interval the way explain reports index bounds:
/// `[1, 5)`, `(1.0, inf.0]`, `["a", "a"]`, `[MinKey, MaxKey]`.
pub fn format_interval(interval: &ValueInterval) -> String {
    let mut out = String::new();
    let (open, low) = match interval.start() {
        Bound::Included(v) => ('[', &v.0),
        Bound::Excluded(v) => ('(', &v.0),
        Bound::Unbounded => ('[', &Bson::MinKey),
    };
    let (close, high) = match interval.end() {
        Bound::Included(v) => (']', &v.0),
        Bound::Excluded(v) => (')', &v.0),
        Bound::Unbounded => (']', &Bson::MaxKey),
    };
    out.push(open);
    write_value(&mut out, low);
    out.push_str(", ");
    write_value(&mut out, high);
    out.push(close);
    out
}

fn write_value(out: &mut String, value: &Bson) {
    match value {
        Bson::MinKey => out.push_str("MinKey"),
        Bson::MaxKey => out.push_str("MaxKey"),
        Bson::Null => out.push_str("null"),
        Bson::Undefined => out.push_str("undefined"),
        Bson::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Bson::Int32(i) => {
            let _ = write!(out, "{}", i);
        }
        Bson::Int64(i) => {
            let _ = write!(out, "{}", i);
        }
        Bson::Double(d) => write_double(out, *d),
        Bson::Decimal128(d) => {
            let _ = write!(out, "NumberDecimal(\"{}\")", d);
        }
        Bson::String(s) | Bson::Symbol(s) => write_string(out, s),
        Bson::Document(doc) => {
            if doc.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{ ");
            for (i, (key, value)) in doc.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_string(out, key);
                out.push_str(": ");
                write_value(out, value);
            }
            out.push_str(" }");
        }
        Bson::Array(elements) => {
            if elements.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push_str("[ ");
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, element);
            }
            out.push_str(" ]");
        }
        Bson::Binary(binary) => {
            let subtype: u8 = binary.subtype.into();
            let _ = write!(out, "BinData({}, ", subtype);
            for byte in &binary.bytes {
                let _ = write!(out, "{:02x}", byte);
            }
            out.push(')');
        }
        Bson::ObjectId(oid) => {
            let _ = write!(out, "ObjectId('{}')", oid.to_hex());
        }
        Bson::DateTime(date) => {
            let _ = write!(out, "new Date({})", date.timestamp_millis());
        }
        Bson::Timestamp(ts) => {
            let _ = write!(out, "Timestamp({}, {})", ts.time, ts.increment);
        }
        Bson::RegularExpression(regex) => {
            let _ = write!(out, "/{}/{}", regex.pattern, regex.options);
        }
        Bson::JavaScriptCode(code) => {
            out.push_str("Code(");
            write_string(out, code);
            out.push(')');
        }
        other => {
            let _ = write!(out, "{}", other);
        }
    }
}

fn write_double(out: &mut String, d: f64) {
    if d.is_nan() {
        out.push_str("nan.0");
    } else if d.is_infinite() {
        out.push_str(if d > 0.0 { "inf.0" } else { "-inf.0" });
    } else if d.fract() == 0.0 && d.abs() < 1e16 {
        let _ = write!(out, "{:.1}", d);
    } else if d.fract() == 0.0 {
        let _ = write!(out, "{:e}", d);
    } else {
        let _ = write!(out, "{}", d);
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Parses an interval rendered by [`format_interval`].
#[cfg(test)]
pub fn parse_interval(input: &str) -> Result<ValueInterval> {
    let mut parser = Parser { input, pos: 0 };
    let interval = parser.interval()?;
    parser.skip_whitespace();
    if parser.pos != input.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(interval)
}

/// Recursive descent parser over the rendered form.
#[cfg(test)]
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

#[cfg(test)]
impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> Error {
        Error::InvalidRequest(format!(
            "Invalid interval '{}' at offset {}: {}",
            self.input, self.pos, message
        ))
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        match self.next_char() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", expected))),
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn interval(&mut self) -> Result<ValueInterval> {
        self.skip_whitespace();
        let start_inclusive = match self.next_char() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(self.error("expected '[' or '('")),
        };
        let low = self.value()?;
        self.expect(',')?;
        let high = self.value()?;
        self.skip_whitespace();
        let end_inclusive = match self.next_char() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(self.error("expected ']' or ')'")),
        };
        let low = BsonValue(low);
        let high = BsonValue(high);
        Ok(Interval::new(
            if start_inclusive { Bound::Included(low) } else { Bound::Excluded(low) },
            if end_inclusive { Bound::Included(high) } else { Bound::Excluded(high) },
        ))
    }

    fn value(&mut self) -> Result<Bson> {
        self.skip_whitespace();
        let keywords: [(&str, Bson); 11] = [
            ("MinKey", Bson::MinKey),
            ("MaxKey", Bson::MaxKey),
            ("null", Bson::Null),
            ("undefined", Bson::Undefined),
            ("true", Bson::Boolean(true)),
            ("false", Bson::Boolean(false)),
            ("inf.0", Bson::Double(f64::INFINITY)),
            ("-inf.0", Bson::Double(f64::NEG_INFINITY)),
            ("nan.0", Bson::Double(f64::NAN)),
            ("{}", Bson::Document(Document::new())),
            ("[]", Bson::Array(vec![])),
        ];
        for (keyword, value) in keywords {
            if self.eat(keyword) {
                return Ok(value);
            }
        }

        match self.peek() {
            Some('"') => Ok(Bson::String(self.string()?)),
            Some('{') => self.document(),
            Some('[') => self.array(),
            Some('/') => self.regex(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            _ => self.constructor(),
        }
    }

    fn string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.next_char() {
                None => return Err(self.error("unterminated string")),
                Some('"') => return Ok(s),
                Some('\\') => match self.next_char() {
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some('n') => s.push('\n'),
                    Some('r') => s.push('\r'),
                    Some('t') => s.push('\t'),
                    Some('u') => {
                        self.expect('{')?;
                        let end = self.rest().find('}').ok_or_else(|| self.error("unterminated escape"))?;
                        let code = u32::from_str_radix(&self.rest()[..end], 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| self.error("invalid escape"))?;
                        self.pos += end + 1;
                        s.push(code);
                    }
                    _ => return Err(self.error("invalid escape")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Bson> {
        let len = self
            .rest()
            .find(|c: char| !(c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')))
            .unwrap_or(self.rest().len());
        let text = &self.rest()[..len];
        let value = if text.contains(['.', 'e', 'E']) {
            f64::from_str(text).map(Bson::Double).ok()
        } else {
            i64::from_str(text)
                .ok()
                .map(|i| i32::try_from(i).map(Bson::Int32).unwrap_or(Bson::Int64(i)))
        };
        let value = value.ok_or_else(|| self.error("invalid number"))?;
        self.pos += len;
        Ok(value)
    }

    fn document(&mut self) -> Result<Bson> {
        self.expect('{')?;
        let mut doc = Document::new();
        loop {
            self.skip_whitespace();
            let key = self.string()?;
            self.expect(':')?;
            let value = self.value()?;
            doc.insert(key, value);
            self.skip_whitespace();
            match self.next_char() {
                Some(',') => continue,
                Some('}') => return Ok(Bson::Document(doc)),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn array(&mut self) -> Result<Bson> {
        self.expect('[')?;
        let mut elements = Vec::new();
        loop {
            elements.push(self.value()?);
            self.skip_whitespace();
            match self.next_char() {
                Some(',') => continue,
                Some(']') => return Ok(Bson::Array(elements)),
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn regex(&mut self) -> Result<Bson> {
        self.expect('/')?;
        let mut escaped = false;
        let end = self
            .rest()
            .char_indices()
            .find(|(_, c)| {
                let end = *c == '/' && !escaped;
                escaped = *c == '\\' && !escaped;
                end
            })
            .map(|(i, _)| i)
            .ok_or_else(|| self.error("unterminated regex"))?;
        let pattern = self.rest()[..end].to_string();
        self.pos += end + 1;
        let len = self
            .rest()
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(self.rest().len());
        let options = self.rest()[..len].to_string();
        self.pos += len;
        Ok(Bson::RegularExpression(Regex { pattern, options }))
    }

    /// `Timestamp(t, i)`, `new Date(ms)`, `ObjectId('hex')`, `BinData(subtype, hex)`,
    /// `NumberDecimal("d")` and `Code("c")`.
    fn constructor(&mut self) -> Result<Bson> {
        if self.eat("Timestamp(") {
            let time = self.unsigned()?;
            self.expect(',')?;
            let increment = self.unsigned()?;
            self.expect(')')?;
            return Ok(Bson::Timestamp(Timestamp { time, increment }));
        }
        if self.eat("new Date(") {
            self.skip_whitespace();
            let millis = match self.number()? {
                Bson::Int32(i) => i as i64,
                Bson::Int64(i) => i,
                _ => return Err(self.error("invalid date")),
            };
            self.expect(')')?;
            return Ok(Bson::DateTime(bson::DateTime::from_millis(millis)));
        }
        if self.eat("ObjectId('") {
            let end = self.rest().find('\'').ok_or_else(|| self.error("unterminated ObjectId"))?;
            let oid = ObjectId::parse_str(&self.rest()[..end]).map_err(|_| self.error("invalid ObjectId"))?;
            self.pos += end;
            self.expect('\'')?;
            self.expect(')')?;
            return Ok(Bson::ObjectId(oid));
        }
        if self.eat("BinData(") {
            let subtype = u8::try_from(self.unsigned()?).map_err(|_| self.error("invalid subtype"))?;
            self.expect(',')?;
            self.skip_whitespace();
            let end = self.rest().find(')').ok_or_else(|| self.error("unterminated BinData"))?;
            let hex = &self.rest()[..end];
            if hex.len() % 2 != 0 {
                return Err(self.error("odd number of hex digits"));
            }
            let bytes = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                .collect::<std::result::Result<Vec<u8>, _>>()
                .map_err(|_| self.error("invalid hex digit"))?;
            self.pos += end + 1;
            return Ok(Bson::Binary(Binary { subtype: BinarySubtype::from(subtype), bytes }));
        }
        if self.eat("NumberDecimal(") {
            // Decimals compare through their closest double
            let text = self.string()?;
            self.expect(')')?;
            let value = f64::from_str(&text).map_err(|_| self.error("invalid decimal"))?;
            return Ok(Bson::Double(value));
        }
        if self.eat("Code(") {
            let code = self.string()?;
            self.expect(')')?;
            return Ok(Bson::JavaScriptCode(code));
        }
        Err(self.error("unknown value"))
    }

    fn unsigned(&mut self) -> Result<u32> {
        self.skip_whitespace();
        let len = self
            .rest()
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.rest().len());
        let value = u32::from_str(&self.rest()[..len]).map_err(|_| self.error("invalid integer"))?;
        self.pos += len;
        Ok(value)
    }
}
