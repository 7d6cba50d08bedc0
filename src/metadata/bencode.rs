use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Deepest list/dictionary nesting accepted by the decoder.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("{num_remaining} byte(s) left over after the value")]
    UnconsumedContents { num_remaining: usize },
    #[error("unexpected end of input")]
    InsufficientContents,
    #[error("unknown value type {value:#04x} at byte {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("integer with leading zeros at byte {pos}")]
    IntegerWithLeadingZeros { pos: usize },
    #[error("empty integer at byte {pos}")]
    EmptyInteger { pos: usize },
    #[error("illegal integer at byte {pos}")]
    IllegalInteger { pos: usize },
    #[error("value at byte {pos} is not terminated by 'e'")]
    UnterminatedValue { pos: usize },
    #[error("illegal string length at byte {pos}")]
    IllegalStringLength { pos: usize },
    #[error("string length at byte {pos} is not followed by ':'")]
    StringMissingSeparator { pos: usize },
    #[error("duplicate dictionary key `{name}`")]
    DuplicateDictionaryKey { name: String },
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    NestingTooDeep,
    #[error("cannot bencode a value of type {0}")]
    UnsupportedType(&'static str),
    #[error("expected {expected}, found {found}")]
    WrongVariant { expected: &'static str, found: &'static str },
}

impl BencodeError {
    /// True for every error produced by the decoder on bad input.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, BencodeError::UnsupportedType(_) | BencodeError::WrongVariant { .. })
    }
}

type Result<T> = std::result::Result<T, BencodeError>;

/// Decodes exactly one value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<BencodeValue> {
    let mut parser = BencodeParser::new(bytes);
    parser.deserialize()
}

/// Decodes one value from the start of `bytes` and returns the index just past it.
pub fn decode_prefix(bytes: &[u8]) -> Result<(BencodeValue, usize)> {
    let mut parser = BencodeParser::new(bytes);
    let value = parser.parse_value(0)?;
    Ok((value, parser.pos))
}

pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode_into(&mut out);
    out
}

fn write_bytes(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(s) if bytes.iter().all(|&byte| (0x20..=0x7e).contains(&byte)) => write!(f, "{}", s),
        _ => write_bytes(bytes, f),
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{}", num),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            }
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {}", value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;
    fn try_from(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        encode(value)
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        BencodeValue::ByteString(s.as_bytes().to_vec())
    }
}

impl From<i64> for BencodeValue {
    fn from(i: i64) -> Self {
        BencodeValue::Integer(i)
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(elements: Vec<BencodeValue>) -> Self {
        BencodeValue::List(elements)
    }
}

impl From<&BencodeValue> for serde_json::Value {
    fn from(value: &BencodeValue) -> Self {
        match value {
            BencodeValue::Integer(i) => serde_json::Value::from(*i),
            BencodeValue::ByteString(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            BencodeValue::List(elements) => {
                serde_json::Value::Array(elements.iter().map(serde_json::Value::from).collect())
            }
            BencodeValue::Dictionary(items) => serde_json::Value::Object(
                items
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl TryFrom<&serde_json::Value> for BencodeValue {
    type Error = BencodeError;

    fn try_from(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Err(BencodeError::UnsupportedType("null")),
            serde_json::Value::Bool(_) => Err(BencodeError::UnsupportedType("boolean")),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(BencodeValue::Integer)
                .ok_or(BencodeError::UnsupportedType("non-integer number")),
            serde_json::Value::String(s) => Ok(BencodeValue::from(s.as_str())),
            serde_json::Value::Array(elements) => elements
                .iter()
                .map(BencodeValue::try_from)
                .collect::<Result<Vec<_>>>()
                .map(BencodeValue::List),
            serde_json::Value::Object(items) => {
                let mut map = BTreeMap::new();
                for (key, value) in items {
                    map.insert(key.as_bytes().to_vec(), BencodeValue::try_from(value)?);
                }
                Ok(BencodeValue::Dictionary(map))
            }
        }
    }
}

impl BencodeValue {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => {
                out.extend(format!("i{}e", i).as_bytes());
            }
            BencodeValue::ByteString(bytes) => encode_byte_string(bytes, out),
            BencodeValue::List(elements) => {
                out.push(b'l');
                for element in elements {
                    element.encode_into(out);
                }
                out.push(b'e');
            }
            BencodeValue::Dictionary(items) => {
                // BTreeMap iterates keys in byte-wise order, which is the canonical order.
                out.push(b'd');
                for (key, value) in items {
                    encode_byte_string(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            BencodeValue::Integer(_) => "integer",
            BencodeValue::ByteString(_) => "byte string",
            BencodeValue::List(_) => "list",
            BencodeValue::Dictionary(_) => "dictionary",
        }
    }

    fn wrong_variant(&self, expected: &'static str) -> BencodeError {
        BencodeError::WrongVariant { expected, found: self.variant_name() }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            BencodeValue::Integer(i) => Ok(*i),
            _ => Err(self.wrong_variant("integer")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Ok(bytes),
            _ => Err(self.wrong_variant("byte string")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| BencodeError::WrongVariant {
            expected: "utf-8 string",
            found: "non utf-8 byte string",
        })
    }

    pub fn as_list(&self) -> Result<&[BencodeValue]> {
        match self {
            BencodeValue::List(elements) => Ok(elements),
            _ => Err(self.wrong_variant("list")),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dictionary(items) => Ok(items),
            _ => Err(self.wrong_variant("dictionary")),
        }
    }

    /// Looks up `key` in a dictionary value.
    pub fn get(&self, key: &[u8]) -> Result<Option<&BencodeValue>> {
        Ok(self.as_dict()?.get(key))
    }
}

fn encode_byte_string(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend(format!("{}:", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
}

#[derive(Debug)]
struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
}

impl<'a> BencodeParser<'a> {
    fn new(contents: &'a [u8]) -> Self {
        Self { contents, pos: 0 }
    }

    fn deserialize(&mut self) -> Result<BencodeValue> {
        let value = self.parse_value(0)?;
        if self.pos != self.contents.len() {
            Err(BencodeError::UnconsumedContents { num_remaining: self.contents.len() - self.pos })
        } else {
            Ok(value)
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<BencodeValue> {
        let first = self.peek()?;
        match first {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(depth + 1),
            b'd' => self.parse_dictionary(depth + 1),
            b'0'..=b'9' => self.parse_string().map(BencodeValue::ByteString),
            _ => Err(BencodeError::UnknownType { pos: self.pos, value: first }),
        }
    }

    fn scan_digits(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        Ok(&self.contents[start..self.pos])
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let digits_start = self.pos;
        let digits = self.scan_digits()?;
        if digits.is_empty() {
            return Err(BencodeError::EmptyInteger { pos: digits_start });
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(BencodeError::IntegerWithLeadingZeros { pos: digits_start });
        }
        if negative && digits == b"0" {
            return Err(BencodeError::IllegalInteger { pos: start });
        }
        self.expect_end()?;

        // The slice is ASCII sign and digits only; i64 overflow is the only way parsing fails.
        let value = std::str::from_utf8(&self.contents[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::IllegalInteger { pos: start })?;
        self.pos += 1;
        Ok(BencodeValue::Integer(value))
    }

    fn parse_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let digits = self.scan_digits()?;
        let length: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::IllegalStringLength { pos: start })?;
        if self.peek()? != b':' {
            return Err(BencodeError::StringMissingSeparator { pos: self.pos });
        }
        self.pos += 1;
        let end = self.pos.checked_add(length).ok_or(BencodeError::IllegalStringLength { pos: start })?;
        if end > self.contents.len() {
            return Err(BencodeError::InsufficientContents);
        }
        let bytes = self.contents[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self, depth: usize) -> Result<BencodeValue> {
        Self::check_depth(depth)?;
        self.pos += 1;
        let mut values: Vec<BencodeValue> = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value(depth)?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self, depth: usize) -> Result<BencodeValue> {
        Self::check_depth(depth)?;
        self.pos += 1;
        let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            let first = self.peek()?;
            if !first.is_ascii_digit() {
                return Err(BencodeError::UnknownType { pos: key_pos, value: first });
            }
            let key = self.parse_string()?;
            if map.contains_key(&key) {
                return Err(BencodeError::DuplicateDictionaryKey {
                    name: String::from_utf8_lossy(&key).into_owned(),
                });
            }
            let value = self.parse_value(depth)?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(map))
    }

    fn check_depth(depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            Err(BencodeError::NestingTooDeep)
        } else {
            Ok(())
        }
    }

    fn peek(&self) -> Result<u8> {
        self.contents.get(self.pos).copied().ok_or(BencodeError::InsufficientContents)
    }

    fn expect_end(&self) -> Result<()> {
        if self.peek()? != b'e' {
            Err(BencodeError::UnterminatedValue { pos: self.pos })
        } else {
            Ok(())
        }
    }
}
