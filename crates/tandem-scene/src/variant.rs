//! Property values of the text scene format

use serde::{Deserialize, Serialize};
use std::fmt;

/// A property or header attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// `&"name"`
    StringName(String),
    /// `^"path"` or `NodePath("path")`
    NodePath(String),
    ExtResource(String),
    SubResource(String),
    Array(Vec<Variant>),
    /// Entries in source order
    Dictionary(Vec<(Variant, Variant)>),
    /// `Vector2(1, 2)`, `PackedStringArray("a")`, `Array[int]([1])`
    Constructor {
        name: String,
        type_args: Option<String>,
        args: Vec<Variant>,
    },
    /// `Object(Class, "key": value, ...)`
    Object {
        class: String,
        properties: Vec<(String, Variant)>,
    },
    /// A bare identifier, e.g. a class name
    Ident(String),
}

impl Variant {
    /// Short name of the variant kind
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Nil => "null",
            Variant::Bool(_) => "bool",
            Variant::Int(_) => "int",
            Variant::Float(_) => "float",
            Variant::String(_) => "string",
            Variant::StringName(_) => "string_name",
            Variant::NodePath(_) => "node_path",
            Variant::ExtResource(_) => "ext_resource",
            Variant::SubResource(_) => "sub_resource",
            Variant::Array(_) => "array",
            Variant::Dictionary(_) => "dictionary",
            Variant::Constructor { .. } => "constructor",
            Variant::Object { .. } => "object",
            Variant::Ident(_) => "ident",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Variant::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn ext_resource_id(&self) -> Option<&str> {
        match self {
            Variant::ExtResource(id) => Some(id),
            _ => None,
        }
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_variant(s)
    }
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Variant::String(s.to_string())
    }
}

impl From<String> for Variant {
    fn from(s: String) -> Self {
        Variant::String(s)
    }
}

impl From<i64> for Variant {
    fn from(n: i64) -> Self {
        Variant::Int(n)
    }
}

impl From<f64> for Variant {
    fn from(n: f64) -> Self {
        Variant::Float(n)
    }
}

impl From<bool> for Variant {
    fn from(b: bool) -> Self {
        Variant::Bool(b)
    }
}

/// Parse one complete value
pub fn parse_variant(text: &str) -> Result<Variant, String> {
    let mut parser = ValueParser::new(text);
    let value = parser.parse_value()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(format!("unexpected trailing text {:?}", parser.snippet()));
    }
    Ok(value)
}

/// Recursive-descent value reader over a string slice
pub(crate) struct ValueParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> ValueParser<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub(crate) fn snippet(&self) -> String {
        self.rest().chars().take(16).collect()
    }

    pub(crate) fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    pub(crate) fn expect(&mut self, c: char) -> Result<(), String> {
        self.skip_ws();
        if self.eat(c) {
            Ok(())
        } else {
            Err(format!("expected '{}' at {:?}", c, self.snippet()))
        }
    }

    pub(crate) fn take_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if f(c)) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    pub(crate) fn parse_value(&mut self) -> Result<Variant, String> {
        self.skip_ws();
        match self.peek() {
            None => Err("unexpected end of value".into()),
            Some('"') => self.parse_string().map(Variant::String),
            Some('&') => {
                self.bump();
                self.parse_string().map(Variant::StringName)
            }
            Some('^') => {
                self.bump();
                self.parse_string().map(Variant::NodePath)
            }
            Some('[') => {
                self.bump();
                self.parse_list(']').map(Variant::Array)
            }
            Some('{') => self.parse_dictionary(),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => {
                self.parse_number()
            }
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_word(),
            Some(c) => Err(format!("unexpected character '{}'", c)),
        }
    }

    pub(crate) fn parse_string(&mut self) -> Result<String, String> {
        if !self.eat('"') {
            return Err(format!("expected string at {:?}", self.snippet()));
        }

        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string".into()),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('u') => {
                        let code = self.parse_hex4()?;
                        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                    Some(c) => out.push(c),
                    None => return Err("unterminated escape sequence".into()),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32, String> {
        let start = self.pos;
        for _ in 0..4 {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => {}
                _ => return Err("invalid unicode escape".into()),
            }
        }
        u32::from_str_radix(&self.src[start..self.pos], 16).map_err(|e| e.to_string())
    }

    fn parse_number(&mut self) -> Result<Variant, String> {
        let token =
            self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | '_'));

        match token {
            "inf" | "+inf" => return Ok(Variant::Float(f64::INFINITY)),
            "-inf" => return Ok(Variant::Float(f64::NEG_INFINITY)),
            "nan" | "-nan" => return Ok(Variant::Float(f64::NAN)),
            _ => {}
        }

        if let Some(hex) = token.strip_prefix("0x") {
            return i64::from_str_radix(hex, 16)
                .map(Variant::Int)
                .map_err(|_| format!("invalid number {:?}", token));
        }

        if token.contains(|c| matches!(c, '.' | 'e' | 'E')) {
            token
                .parse::<f64>()
                .map(Variant::Float)
                .map_err(|_| format!("invalid number {:?}", token))
        } else {
            token
                .parse::<i64>()
                .map(Variant::Int)
                .map_err(|_| format!("invalid number {:?}", token))
        }
    }

    fn parse_word(&mut self) -> Result<Variant, String> {
        let word = self.take_while(|c| c.is_alphanumeric() || c == '_');

        match word {
            "true" => return Ok(Variant::Bool(true)),
            "false" => return Ok(Variant::Bool(false)),
            "null" | "nil" => return Ok(Variant::Nil),
            "inf" => return Ok(Variant::Float(f64::INFINITY)),
            "nan" => return Ok(Variant::Float(f64::NAN)),
            _ => {}
        }

        // Typed containers: Array[int]([...])
        let mut type_args = None;
        if self.peek() == Some('[') {
            self.bump();
            let start = self.pos;
            let mut depth = 1;
            while depth > 0 {
                match self.bump() {
                    Some('[') => depth += 1,
                    Some(']') => depth -= 1,
                    Some(_) => {}
                    None => return Err("unterminated type arguments".into()),
                }
            }
            type_args = Some(self.src[start..self.pos - 1].to_string());
        }

        if !self.eat('(') {
            if type_args.is_some() {
                return Err(format!("expected '(' after {}[...]", word));
            }
            return Ok(Variant::Ident(word.to_string()));
        }

        if word == "Object" {
            return self.parse_object_body();
        }

        let args = self.parse_list(')')?;
        Ok(match (word, args.as_slice()) {
            ("ExtResource", [Variant::String(id)]) => Variant::ExtResource(id.clone()),
            ("SubResource", [Variant::String(id)]) => Variant::SubResource(id.clone()),
            ("NodePath", [Variant::String(path)]) => Variant::NodePath(path.clone()),
            _ => Variant::Constructor {
                name: word.to_string(),
                type_args,
                args,
            },
        })
    }

    fn parse_list(&mut self, close: char) -> Result<Vec<Variant>, String> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat(close) {
                return Ok(items);
            }
            return Err(format!("expected ',' or '{}' at {:?}", close, self.snippet()));
        }
    }

    fn parse_dictionary(&mut self) -> Result<Variant, String> {
        self.expect('{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Ok(Variant::Dictionary(entries));
            }
            let key = self.parse_value()?;
            self.expect(':')?;
            let value = self.parse_value()?;
            entries.push((key, value));
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat('}') {
                return Ok(Variant::Dictionary(entries));
            }
            return Err(format!("expected ',' or '}}' at {:?}", self.snippet()));
        }
    }

    fn parse_object_body(&mut self) -> Result<Variant, String> {
        self.skip_ws();
        let class = self.take_while(|c| c.is_alphanumeric() || c == '_').to_string();
        if class.is_empty() {
            return Err("expected class name in Object(...)".into());
        }

        let mut properties = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(')') {
                return Ok(Variant::Object { class, properties });
            }
            self.expect(',')?;
            self.skip_ws();
            if self.eat(')') {
                return Ok(Variant::Object { class, properties });
            }
            let key = self.parse_string()?;
            self.expect(':')?;
            let value = self.parse_value()?;
            properties.push((key, value));
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn write_float(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        write!(f, "nan")
    } else if n.is_infinite() {
        write!(f, "{}", if n > 0.0 { "inf" } else { "-inf" })
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{:.1}", n)
    } else {
        write!(f, "{}", n)
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Variant]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Nil => write!(f, "null"),
            Variant::Bool(b) => write!(f, "{}", b),
            Variant::Int(n) => write!(f, "{}", n),
            Variant::Float(n) => write_float(f, *n),
            Variant::String(s) => write_quoted(f, s),
            Variant::StringName(s) => {
                write!(f, "&")?;
                write_quoted(f, s)
            }
            Variant::NodePath(p) => {
                write!(f, "NodePath(")?;
                write_quoted(f, p)?;
                write!(f, ")")
            }
            Variant::ExtResource(id) => {
                write!(f, "ExtResource(")?;
                write_quoted(f, id)?;
                write!(f, ")")
            }
            Variant::SubResource(id) => {
                write!(f, "SubResource(")?;
                write_quoted(f, id)?;
                write!(f, ")")
            }
            Variant::Array(items) => {
                write!(f, "[")?;
                write_joined(f, items)?;
                write!(f, "]")
            }
            Variant::Dictionary(entries) => {
                if entries.is_empty() {
                    return write!(f, "{{}}");
                }
                writeln!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        writeln!(f, ",")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "\n}}")
            }
            Variant::Constructor {
                name,
                type_args,
                args,
            } => {
                write!(f, "{}", name)?;
                if let Some(t) = type_args {
                    write!(f, "[{}]", t)?;
                }
                write!(f, "(")?;
                write_joined(f, args)?;
                write!(f, ")")
            }
            Variant::Object { class, properties } => {
                write!(f, "Object({}", class)?;
                for (key, value) in properties {
                    write!(f, ",")?;
                    write_quoted(f, key)?;
                    write!(f, ":{}", value)?;
                }
                write!(f, ")")
            }
            Variant::Ident(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Variant {
        parse_variant(s).unwrap()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(parse("null"), Variant::Nil);
        assert_eq!(parse("true"), Variant::Bool(true));
        assert_eq!(parse("-42"), Variant::Int(-42));
        assert_eq!(parse("0.5"), Variant::Float(0.5));
        assert_eq!(parse("1e-05"), Variant::Float(1e-5));
        assert_eq!(parse("-inf"), Variant::Float(f64::NEG_INFINITY));
        assert_eq!(parse("\"a \\\"quoted\\\" word\""), Variant::from("a \"quoted\" word"));
        assert_eq!(parse("&\"idle\""), Variant::StringName("idle".into()));
        assert_eq!(parse("^\"../Player\""), Variant::NodePath("../Player".into()));
    }

    #[test]
    fn test_multiline_string_keeps_newlines() {
        assert_eq!(parse("\"line one\nline two\""), Variant::from("line one\nline two"));
    }

    #[test]
    fn test_constructors_and_resources() {
        assert_eq!(
            parse("Vector2(1, -2.5)"),
            Variant::Constructor {
                name: "Vector2".into(),
                type_args: None,
                args: vec![Variant::Int(1), Variant::Float(-2.5)],
            }
        );
        assert_eq!(parse("ExtResource(\"1_abc\")"), Variant::ExtResource("1_abc".into()));
        assert_eq!(parse("SubResource(\"Shape_x\")"), Variant::SubResource("Shape_x".into()));
        assert_eq!(parse("NodePath(\"A/B\")"), Variant::NodePath("A/B".into()));
    }

    #[test]
    fn test_typed_array() {
        assert_eq!(
            parse("Array[int]([1, 2])"),
            Variant::Constructor {
                name: "Array".into(),
                type_args: Some("int".into()),
                args: vec![Variant::Array(vec![Variant::Int(1), Variant::Int(2)])],
            }
        );
    }

    #[test]
    fn test_containers() {
        let dict = parse("{\n\"speed\": 10,\n\"tags\": [\"a\", \"b\"]\n}");
        match dict {
            Variant::Dictionary(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0], (Variant::from("speed"), Variant::Int(10)));
            }
            other => panic!("expected dictionary, got {:?}", other),
        }
        assert_eq!(parse("[]"), Variant::Array(vec![]));
        assert_eq!(parse("[1, 2,]"), Variant::Array(vec![Variant::Int(1), Variant::Int(2)]));
    }

    #[test]
    fn test_object() {
        assert_eq!(
            parse("Object(InputEventKey,\"resource_local_to_scene\":false,\"keycode\":65)"),
            Variant::Object {
                class: "InputEventKey".into(),
                properties: vec![
                    ("resource_local_to_scene".into(), Variant::Bool(false)),
                    ("keycode".into(), Variant::Int(65)),
                ],
            }
        );
    }

    #[test]
    fn test_errors() {
        assert!(parse_variant("\"unterminated").is_err());
        assert!(parse_variant("Vector2(1, 2").is_err());
        assert!(parse_variant("1 2").is_err());
        assert!(parse_variant("12abc").is_err());
        assert!(parse_variant("").is_err());
    }

    #[test]
    fn test_display_reparses() {
        for text in [
            "Vector2(1.0, 2.5)",
            "[1, \"two\", &\"three\"]",
            "ExtResource(\"1_abc\")",
            "Object(Node,\"script\":null)",
            "Array[String]([\"a\"])",
            "{\n\"a\": 1,\n\"b\": 2\n}",
        ] {
            let value = parse(text);
            assert_eq!(value.to_string(), text);
            assert_eq!(parse(&value.to_string()), value);
        }
    }
}
