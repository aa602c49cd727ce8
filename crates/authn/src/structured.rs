//! Structured field values (RFC 8941) for the signature headers.
//!
//! Only what `Signature-Input`, `Signature` and `Signature-Agent` need:
//! dictionaries, items, inner lists and parameters over integers, strings,
//! tokens, decimals, byte sequences and booleans.

use std::fmt::Write as _;

use base64::{Engine, engine::general_purpose::STANDARD};

/// Largest integer RFC 8941 permits (15 digits).
const MAX_INTEGER_DIGITS: usize = 15;

/// Decimal limits: 12 integer digits, 3 fractional digits.
const MAX_DECIMAL_INTEGER_DIGITS: usize = 12;
const MAX_DECIMAL_FRACTION_DIGITS: usize = 3;

/// A bare item value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BareItem {
    /// `-?[0-9]{1,15}`
    Integer(i64),
    /// `-?[0-9]{1,12}.[0-9]{1,3}`, held in thousandths.
    Decimal(i64),
    /// Quoted string.
    String(String),
    /// Unquoted token.
    Token(String),
    /// `:base64:`
    ByteSeq(Vec<u8>),
    /// `?1` / `?0`
    Boolean(bool),
}

impl BareItem {
    /// The integer value, if this is an integer.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// The string value, if this is a string.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// The string or token text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(value) | Self::Token(value) => Some(value),
            _ => None,
        }
    }

    /// The decoded bytes, if this is a byte sequence.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::ByteSeq(value) => Some(value),
            _ => None,
        }
    }
}

/// Ordered parameters. Later duplicates overwrite earlier values in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(Vec<(String, BareItem)>);

impl Parameters {
    /// Looks up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BareItem> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    /// Iterates parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BareItem)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Returns `true` if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends or overwrites a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: BareItem) {
        let name = name.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }
}

/// A bare item with parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The value.
    pub bare: BareItem,
    /// Its parameters.
    pub params: Parameters,
}

/// A parenthesized list of items with parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InnerList {
    /// The member items.
    pub items: Vec<Item>,
    /// Parameters on the list itself.
    pub params: Parameters,
}

/// A dictionary member value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    /// A single item.
    Item(Item),
    /// An inner list.
    InnerList(InnerList),
}

/// An ordered dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary(Vec<(String, Member)>);

impl Dictionary {
    /// Looks up a member by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Member> {
        self.0.iter().find(|(name, _)| name == key).map(|(_, member)| member)
    }

    /// Iterates members in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.0.iter().map(|(name, member)| (name.as_str(), member))
    }

    /// The first member, if any.
    #[must_use]
    pub fn first(&self) -> Option<(&str, &Member)> {
        self.0.first().map(|(name, member)| (name.as_str(), member))
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the dictionary has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, key: String, member: Member) {
        match self.0.iter_mut().find(|(name, _)| *name == key) {
            Some(slot) => slot.1 = member,
            None => self.0.push((key, member)),
        }
    }
}

/// A parse failure with the byte offset where it happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    /// What was expected.
    pub message: &'static str,
    /// Byte offset into the input.
    pub offset: usize,
}

type ParseResult<T> = Result<T, ParseError>;

/// Parses a dictionary field value.
///
/// # Errors
///
/// Returns [`ParseError`] on any deviation from RFC 8941 dictionary syntax.
/// An empty input yields an empty dictionary.
pub fn parse_dictionary(input: &str) -> ParseResult<Dictionary> {
    let mut parser = Parser::new(input);
    parser.skip_sp();
    let dictionary = parser.dictionary()?;
    parser.skip_sp();
    parser.finish()?;
    Ok(dictionary)
}

/// Parses an item field value.
///
/// # Errors
///
/// Returns [`ParseError`] if the input is not a single item.
pub fn parse_item(input: &str) -> ParseResult<Item> {
    let mut parser = Parser::new(input);
    parser.skip_sp();
    let item = parser.item()?;
    parser.skip_sp();
    parser.finish()?;
    Ok(item)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input: input.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn error<T>(&self, message: &'static str) -> ParseResult<T> {
        Err(ParseError { message, offset: self.pos })
    }

    fn expect(&mut self, byte: u8, message: &'static str) -> ParseResult<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(message)
        }
    }

    fn skip_sp(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn finish(&self) -> ParseResult<()> {
        if self.pos == self.input.len() { Ok(()) } else { self.error("unexpected trailing input") }
    }

    fn dictionary(&mut self) -> ParseResult<Dictionary> {
        let mut dictionary = Dictionary::default();
        if self.peek().is_none() {
            return Ok(dictionary);
        }

        loop {
            let key = self.key()?;
            let member = if self.peek() == Some(b'=') {
                self.pos += 1;
                self.item_or_inner_list()?
            } else {
                Member::Item(Item { bare: BareItem::Boolean(true), params: self.parameters()? })
            };
            dictionary.insert(key, member);

            self.skip_ows();
            if self.peek().is_none() {
                return Ok(dictionary);
            }
            self.expect(b',', "expected ',' between dictionary members")?;
            self.skip_ows();
            if self.peek().is_none() {
                return self.error("trailing comma in dictionary");
            }
        }
    }

    fn item_or_inner_list(&mut self) -> ParseResult<Member> {
        if self.peek() == Some(b'(') {
            Ok(Member::InnerList(self.inner_list()?))
        } else {
            Ok(Member::Item(self.item()?))
        }
    }

    fn inner_list(&mut self) -> ParseResult<InnerList> {
        self.expect(b'(', "expected '('")?;
        let mut items = Vec::new();
        loop {
            self.skip_sp();
            if self.peek() == Some(b')') {
                self.pos += 1;
                return Ok(InnerList { items, params: self.parameters()? });
            }
            items.push(self.item()?);
            match self.peek() {
                Some(b' ' | b')') => {},
                _ => return self.error("expected ' ' or ')' in inner list"),
            }
        }
    }

    fn item(&mut self) -> ParseResult<Item> {
        let bare = self.bare_item()?;
        let params = self.parameters()?;
        Ok(Item { bare, params })
    }

    fn parameters(&mut self) -> ParseResult<Parameters> {
        let mut params = Parameters::default();
        while self.peek() == Some(b';') {
            self.pos += 1;
            self.skip_sp();
            let key = self.key()?;
            let value = if self.peek() == Some(b'=') {
                self.pos += 1;
                self.bare_item()?
            } else {
                BareItem::Boolean(true)
            };
            params.insert(key, value);
        }
        Ok(params)
    }

    fn key(&mut self) -> ParseResult<String> {
        let start = self.pos;
        match self.peek() {
            Some(b'a'..=b'z' | b'*') => self.pos += 1,
            _ => return self.error("expected key"),
        }
        while matches!(self.peek(), Some(b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'*')) {
            self.pos += 1;
        }
        Ok(self.slice(start))
    }

    fn bare_item(&mut self) -> ParseResult<BareItem> {
        match self.peek() {
            Some(b'-' | b'0'..=b'9') => self.integer(),
            Some(b'"') => self.string(),
            Some(b':') => self.byte_seq(),
            Some(b'?') => self.boolean(),
            Some(b'*' | b'A'..=b'Z' | b'a'..=b'z') => self.token(),
            _ => self.error("expected bare item"),
        }
    }

    fn integer(&mut self) -> ParseResult<BareItem> {
        let negative = self.peek() == Some(b'-');
        if negative {
            self.pos += 1;
        }
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let digits = self.pos - start;
        if digits == 0 {
            return self.error("expected digit");
        }
        if digits > MAX_INTEGER_DIGITS {
            return self.error("integer too long");
        }
        let magnitude: i64 = self.slice(start).parse().map_err(|_| ParseError {
            message: "integer out of range",
            offset: start,
        })?;
        if self.peek() != Some(b'.') {
            return Ok(BareItem::Integer(if negative { -magnitude } else { magnitude }));
        }

        if digits > MAX_DECIMAL_INTEGER_DIGITS {
            return self.error("decimal too long");
        }
        self.pos += 1;
        let fraction_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let fraction_digits = self.pos - fraction_start;
        if fraction_digits == 0 {
            return self.error("expected fractional digit");
        }
        if fraction_digits > MAX_DECIMAL_FRACTION_DIGITS {
            return self.error("decimal fraction too long");
        }

        let mut fraction: i64 = 0;
        for &digit in &self.input[fraction_start..self.pos] {
            fraction = fraction * 10 + i64::from(digit - b'0');
        }
        for _ in fraction_digits..MAX_DECIMAL_FRACTION_DIGITS {
            fraction *= 10;
        }
        let thousandths = magnitude * 1000 + fraction;
        Ok(BareItem::Decimal(if negative { -thousandths } else { thousandths }))
    }

    fn string(&mut self) -> ParseResult<BareItem> {
        self.expect(b'"', "expected '\"'")?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return self.error("unterminated string"),
                Some(b'"') => return Ok(BareItem::String(out)),
                Some(b'\\') => match self.bump() {
                    Some(escaped @ (b'"' | b'\\')) => out.push(char::from(escaped)),
                    _ => return self.error("invalid escape in string"),
                },
                Some(byte @ 0x20..=0x7e) => out.push(char::from(byte)),
                Some(_) => return self.error("invalid character in string"),
            }
        }
    }

    fn token(&mut self) -> ParseResult<BareItem> {
        let start = self.pos;
        self.pos += 1;
        while self.peek().is_some_and(|byte| is_tchar(byte) || byte == b':' || byte == b'/') {
            self.pos += 1;
        }
        Ok(BareItem::Token(self.slice(start)))
    }

    fn byte_seq(&mut self) -> ParseResult<BareItem> {
        self.expect(b':', "expected ':'")?;
        let start = self.pos;
        while self.peek().is_some_and(|byte| byte.is_ascii_alphanumeric() || b"+/=".contains(&byte)) {
            self.pos += 1;
        }
        let encoded = self.slice(start);
        self.expect(b':', "unterminated byte sequence")?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(BareItem::ByteSeq)
            .map_err(|_| ParseError { message: "invalid base64 in byte sequence", offset: start })
    }

    fn boolean(&mut self) -> ParseResult<BareItem> {
        self.expect(b'?', "expected '?'")?;
        match self.bump() {
            Some(b'1') => Ok(BareItem::Boolean(true)),
            Some(b'0') => Ok(BareItem::Boolean(false)),
            _ => self.error("expected '0' or '1' after '?'"),
        }
    }

    fn slice(&self, start: usize) -> String {
        // Every accepted byte is ASCII.
        self.input[start..self.pos].iter().map(|&byte| char::from(byte)).collect()
    }
}

fn is_tchar(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

/// Serializes a bare item.
#[must_use]
pub fn serialize_bare_item(item: &BareItem) -> String {
    let mut out = String::new();
    write_bare_item(&mut out, item);
    out
}

/// Serializes parameters, including the leading `;`.
#[must_use]
pub fn serialize_parameters(params: &Parameters) -> String {
    let mut out = String::new();
    write_parameters(&mut out, params);
    out
}

/// Serializes an inner list with its parameters.
#[must_use]
pub fn serialize_inner_list(list: &InnerList) -> String {
    let mut out = String::from("(");
    for (idx, item) in list.items.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        write_bare_item(&mut out, &item.bare);
        write_parameters(&mut out, &item.params);
    }
    out.push(')');
    write_parameters(&mut out, &list.params);
    out
}

fn write_bare_item(out: &mut String, item: &BareItem) {
    match item {
        BareItem::Integer(value) => {
            let _ = write!(out, "{value}");
        },
        BareItem::Decimal(thousandths) => {
            if *thousandths < 0 {
                out.push('-');
            }
            let magnitude = thousandths.unsigned_abs();
            let fraction = format!("{:03}", magnitude % 1000);
            let fraction = fraction.trim_end_matches('0');
            let fraction = if fraction.is_empty() { "0" } else { fraction };
            let _ = write!(out, "{}.{fraction}", magnitude / 1000);
        },
        BareItem::String(value) => {
            out.push('"');
            for ch in value.chars() {
                if ch == '"' || ch == '\\' {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        },
        BareItem::Token(value) => out.push_str(value),
        BareItem::ByteSeq(value) => {
            out.push(':');
            out.push_str(&STANDARD.encode(value));
            out.push(':');
        },
        BareItem::Boolean(value) => out.push_str(if *value { "?1" } else { "?0" }),
    }
}

fn write_parameters(out: &mut String, params: &Parameters) {
    for (key, value) in params.iter() {
        out.push(';');
        out.push_str(key);
        if *value != BareItem::Boolean(true) {
            out.push('=');
            write_bare_item(out, value);
        }
    }
}
