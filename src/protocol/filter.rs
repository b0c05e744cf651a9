// Search filters: BER form (RFC 4511 4.5.1.7) and string form (RFC 4515)

use std::fmt;

use super::{boolean, child, children, octets, string, FromAsn1, StringKind, ToAsn1};
use crate::asn1::{Asn1, TagClass};
use crate::error::ProtocolError;

const AND: u32 = 0;
const OR: u32 = 1;
const NOT: u32 = 2;
const EQUALITY: u32 = 3;
const SUBSTRINGS: u32 = 4;
const GREATER_OR_EQUAL: u32 = 5;
const LESS_OR_EQUAL: u32 = 6;
const PRESENT: u32 = 7;
const APPROX: u32 = 8;
const EXTENSIBLE: u32 = 9;

/// and/or/not filters nested deeper than this are rejected.
const MAX_FILTER_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::Equality(attribute.into(), value.into())
    }

    /// Parse an RFC 4515 filter string. Outer parentheses are optional.
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let trimmed = input.trim();
        let owned;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({})", trimmed);
            &owned
        };
        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        if parser.pos != parser.input.len() {
            return Err(ProtocolError::new(format!(
                "unexpected text after filter at offset {}",
                parser.pos
            )));
        }
        Ok(filter)
    }

    /// `(objectClass=*)`, the match-everything filter.
    pub fn any_object() -> Self {
        Filter::present("objectClass")
    }
}

fn assertion(tag: u32, attribute: &str, value: &[u8]) -> Asn1 {
    Asn1::sequence(vec![Asn1::string(attribute), Asn1::octet_string(value.to_vec())]).context(tag)
}

fn decode_assertion(asn1: &Asn1) -> Result<(String, Vec<u8>), ProtocolError> {
    let parts = children(asn1, "attribute value assertion")?;
    if parts.len() != 2 {
        return Err(ProtocolError::new("attribute value assertion must have 2 elements"));
    }
    Ok((
        string(&parts[0], StringKind::LdapString, "assertion attribute")?,
        octets(&parts[1], "assertion value")?,
    ))
}

impl ToAsn1 for Filter {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let asn1 = match self {
            Filter::And(filters) | Filter::Or(filters) => {
                let tag = if matches!(self, Filter::And(_)) { AND } else { OR };
                Asn1::set_of(filters.iter().map(ToAsn1::to_asn1).collect::<Result<Vec<_>, _>>()?)
                    .context(tag)
            }
            Filter::Not(inner) => Asn1::explicit_context(NOT, inner.to_asn1()?),
            Filter::Equality(a, v) => assertion(EQUALITY, a, v),
            Filter::GreaterOrEqual(a, v) => assertion(GREATER_OR_EQUAL, a, v),
            Filter::LessOrEqual(a, v) => assertion(LESS_OR_EQUAL, a, v),
            Filter::Approx(a, v) => assertion(APPROX, a, v),
            Filter::Present(a) => Asn1::string(a).context(PRESENT),
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                let mut parts = Vec::new();
                if let Some(i) = initial {
                    parts.push(Asn1::octet_string(i.clone()).context(0));
                }
                parts.extend(any.iter().map(|a| Asn1::octet_string(a.clone()).context(1)));
                if let Some(f) = final_ {
                    parts.push(Asn1::octet_string(f.clone()).context(2));
                }
                if parts.is_empty() {
                    return Err(ProtocolError::new("substrings filter needs at least one component"));
                }
                Asn1::sequence(vec![Asn1::string(attribute), Asn1::sequence_of(parts)]).context(SUBSTRINGS)
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                if matching_rule.is_none() && attribute.is_none() {
                    return Err(ProtocolError::new(
                        "extensible match needs a matching rule or an attribute",
                    ));
                }
                let mut parts = Vec::new();
                if let Some(rule) = matching_rule {
                    parts.push(Asn1::string(rule).context(1));
                }
                if let Some(attr) = attribute {
                    parts.push(Asn1::string(attr).context(2));
                }
                parts.push(Asn1::octet_string(value.clone()).context(3));
                if *dn_attributes {
                    parts.push(Asn1::boolean(true).context(4));
                }
                Asn1::sequence(parts).context(EXTENSIBLE)
            }
        };
        Ok(asn1)
    }
}

impl FromAsn1 for Filter {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        decode_filter(asn1, 0)
    }
}

fn decode_filter(asn1: &Asn1, depth: usize) -> Result<Filter, ProtocolError> {
    if depth > MAX_FILTER_DEPTH {
        return Err(ProtocolError::new(format!("filter nested deeper than {}", MAX_FILTER_DEPTH)));
    }
    if asn1.class != TagClass::Context {
        return Err(ProtocolError::new(format!(
            "filter must be context tagged, got {:?} [{}]",
            asn1.class, asn1.tag
        )));
    }
    let filter = match asn1.tag {
        AND | OR => {
            let filters = children(asn1, "filter set")?
                .iter()
                .map(|f| decode_filter(f, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            if asn1.tag == AND {
                Filter::And(filters)
            } else {
                Filter::Or(filters)
            }
        }
        NOT => {
            let inner = children(asn1, "not filter")?;
            if inner.len() != 1 {
                return Err(ProtocolError::new("not filter must wrap exactly one filter"));
            }
            Filter::Not(Box::new(decode_filter(&inner[0], depth + 1)?))
        }
        EQUALITY => {
            let (a, v) = decode_assertion(asn1)?;
            Filter::Equality(a, v)
        }
        GREATER_OR_EQUAL => {
            let (a, v) = decode_assertion(asn1)?;
            Filter::GreaterOrEqual(a, v)
        }
        LESS_OR_EQUAL => {
            let (a, v) = decode_assertion(asn1)?;
            Filter::LessOrEqual(a, v)
        }
        APPROX => {
            let (a, v) = decode_assertion(asn1)?;
            Filter::Approx(a, v)
        }
        PRESENT => Filter::Present(string(asn1, StringKind::LdapString, "present filter")?),
        SUBSTRINGS => {
            let parts = children(asn1, "substrings filter")?;
            let attribute = string(child(&parts, 0, "substrings attribute")?, StringKind::LdapString, "substrings attribute")?;
            let components = children(child(&parts, 1, "substrings components")?, "substrings components")?;
            if components.is_empty() {
                return Err(ProtocolError::new("substrings filter has no components"));
            }
            let mut initial = None;
            let mut any = Vec::new();
            let mut final_ = None;
            for (i, c) in components.iter().enumerate() {
                let value = octets(c, "substring")?;
                match (c.class, c.tag) {
                    (TagClass::Context, 0) if i == 0 && initial.is_none() => initial = Some(value),
                    (TagClass::Context, 1) if final_.is_none() => any.push(value),
                    (TagClass::Context, 2) if final_.is_none() && i == components.len() - 1 => {
                        final_ = Some(value)
                    }
                    _ => {
                        return Err(ProtocolError::new(format!(
                            "unexpected substring component [{}] at position {}",
                            c.tag, i
                        )))
                    }
                }
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            }
        }
        EXTENSIBLE => {
            let mut matching_rule = None;
            let mut attribute = None;
            let mut value = None;
            let mut dn_attributes = false;
            for part in children(asn1, "extensible match")? {
                match (part.class, part.tag) {
                    (TagClass::Context, 1) => {
                        matching_rule = Some(string(&part, StringKind::Oid, "matching rule")?)
                    }
                    (TagClass::Context, 2) => {
                        attribute = Some(string(&part, StringKind::LdapString, "extensible attribute")?)
                    }
                    (TagClass::Context, 3) => value = Some(octets(&part, "match value")?),
                    (TagClass::Context, 4) => dn_attributes = boolean(&part, "dnAttributes")?,
                    _ => {
                        return Err(ProtocolError::new(format!(
                            "unexpected extensible match element [{}]",
                            part.tag
                        )))
                    }
                }
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value: value.ok_or_else(|| ProtocolError::new("extensible match without a value"))?,
                dn_attributes,
            }
        }
        other => return Err(ProtocolError::new(format!("unknown filter type [{}]", other))),
    };
    Ok(filter)
}

fn escape(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => s
            .chars()
            .map(|c| match c {
                '*' | '(' | ')' | '\\' | '\0' => format!("\\{:02x}", c as u32),
                c => c.to_string(),
            })
            .collect(),
        Err(_) => value
            .iter()
            .map(|b| {
                if b.is_ascii_alphanumeric() {
                    (*b as char).to_string()
                } else {
                    format!("\\{:02x}", b)
                }
            })
            .collect(),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality(a, v) => write!(f, "({}={})", a, escape(v)),
            Filter::GreaterOrEqual(a, v) => write!(f, "({}>={})", a, escape(v)),
            Filter::LessOrEqual(a, v) => write!(f, "({}<={})", a, escape(v)),
            Filter::Approx(a, v) => write!(f, "({}~={})", a, escape(v)),
            Filter::Present(a) => write!(f, "({}=*)", a),
            Filter::Substrings {
                attribute,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(i) = initial {
                    f.write_str(&escape(i))?;
                }
                f.write_str("*")?;
                for a in any {
                    write!(f, "{}*", escape(a))?;
                }
                if let Some(v) = final_ {
                    f.write_str(&escape(v))?;
                }
                f.write_str(")")
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(a) = attribute {
                    f.write_str(a)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape(value))
            }
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<(), ProtocolError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ProtocolError::new(format!(
                "expected '{}' at offset {}",
                c as char, self.pos
            )))
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, ProtocolError> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(ProtocolError::new("unterminated filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, ProtocolError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter()?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter, ProtocolError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'=' | b'~' | b'>' | b'<' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let description = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| ProtocolError::new("filter attribute is not valid UTF-8"))?
            .trim()
            .to_string();

        let operator = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                "="
            }
            Some(c @ (b'~' | b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                match c {
                    b'~' => "~=",
                    b'>' => ">=",
                    _ => "<=",
                }
            }
            _ => {
                return Err(ProtocolError::new(format!(
                    "missing filter operator at offset {}",
                    self.pos
                )))
            }
        };

        let value_start = self.pos;
        while let Some(c) = self.peek() {
            if c == b')' || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        let raw = &self.input[value_start..self.pos];

        if operator == "=" && description.ends_with(':') {
            return parse_extensible(&description[..description.len() - 1], raw);
        }
        if description.is_empty() {
            return Err(ProtocolError::new("filter item without an attribute"));
        }

        match operator {
            "~=" => Ok(Filter::Approx(description, unescape(raw)?)),
            ">=" => Ok(Filter::GreaterOrEqual(description, unescape(raw)?)),
            "<=" => Ok(Filter::LessOrEqual(description, unescape(raw)?)),
            _ if raw == b"*" => Ok(Filter::Present(description)),
            _ if raw.contains(&b'*') => {
                let pieces: Vec<&[u8]> = raw.split(|b| *b == b'*').collect();
                let last = pieces.len() - 1;
                let initial = if pieces[0].is_empty() { None } else { Some(unescape(pieces[0])?) };
                let final_ = if pieces[last].is_empty() { None } else { Some(unescape(pieces[last])?) };
                let mut any = Vec::new();
                for piece in &pieces[1..last] {
                    if piece.is_empty() {
                        return Err(ProtocolError::new("empty substring between '*' characters"));
                    }
                    any.push(unescape(piece)?);
                }
                Ok(Filter::Substrings {
                    attribute: description,
                    initial,
                    any,
                    final_,
                })
            }
            _ => Ok(Filter::Equality(description, unescape(raw)?)),
        }
    }
}

fn parse_extensible(left: &str, raw: &[u8]) -> Result<Filter, ProtocolError> {
    let mut tokens = left.split(':');
    let attribute = tokens
        .next()
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    let mut dn_attributes = false;
    let mut matching_rule = None;
    for token in tokens {
        if token.eq_ignore_ascii_case("dn") && matching_rule.is_none() && !dn_attributes {
            dn_attributes = true;
        } else if matching_rule.is_none() && StringKind::Oid.validate(token) {
            matching_rule = Some(token.to_string());
        } else {
            return Err(ProtocolError::new(format!("invalid extensible match: {}", left)));
        }
    }
    if attribute.is_none() && matching_rule.is_none() {
        return Err(ProtocolError::new("extensible match needs a matching rule or an attribute"));
    }
    Ok(Filter::Extensible {
        matching_rule,
        attribute,
        value: unescape(raw)?,
        dn_attributes,
    })
}

fn unescape(raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| ProtocolError::new("invalid escape sequence in filter value"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}
