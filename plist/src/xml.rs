use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::{events::Event, Reader};

use crate::{Dictionary, Format, FormatError, Value};

const NAME: &str = "SimpleXML";

/// XML property lists (`<plist><dict><key>..</key>..</dict></plist>`). Read only: there is no
/// writer, so `serialize` always fails. Never auto-detected.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleXml;

impl SimpleXml {
    pub fn new() -> SimpleXml {
        SimpleXml
    }
}

fn invalid<S: Into<String>>(message: S) -> FormatError {
    FormatError::Invalid {
        format: NAME,
        message: message.into(),
    }
}

fn element_name(bytes: &[u8]) -> Result<String, FormatError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| invalid("element name is not UTF-8"))
}

// Markup between values. Text there must be whitespace.
enum Token {
    Start(String),
    Empty(String),
    End(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Start(name) => write!(f, "<{}>", name),
            Token::Empty(name) => write!(f, "<{}/>", name),
            Token::End(name) => write!(f, "</{}>", name),
        }
    }
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(contents: &'a [u8]) -> Parser<'a> {
        Parser {
            reader: Reader::from_reader(contents),
        }
    }

    fn event(&mut self) -> Result<Event<'a>, FormatError> {
        self.reader.read_event().map_err(|e| {
            invalid(format!(
                "at byte {}: {}",
                self.reader.buffer_position(),
                e
            ))
        })
    }

    // None at the end of input.
    fn token(&mut self) -> Result<Option<Token>, FormatError> {
        loop {
            match self.event()? {
                Event::Start(e) => return Ok(Some(Token::Start(element_name(e.name().as_ref())?))),
                Event::Empty(e) => return Ok(Some(Token::Empty(element_name(e.name().as_ref())?))),
                Event::End(e) => return Ok(Some(Token::End(element_name(e.name().as_ref())?))),
                Event::Text(text) => {
                    if !text.iter().all(u8::is_ascii_whitespace) {
                        return Err(invalid("text outside of a value element"));
                    }
                }
                Event::CData(_) => return Err(invalid("character data outside of a value element")),
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    fn expect_token(&mut self, inside: &str) -> Result<Token, FormatError> {
        self.token()?
            .ok_or_else(|| invalid(format!("unterminated <{}>", inside)))
    }

    // Contents of a scalar element up to its end tag.
    fn text(&mut self, element: &str) -> Result<String, FormatError> {
        let mut text = String::new();
        loop {
            match self.event()? {
                Event::Text(t) => {
                    let unescaped = t.unescape().map_err(|e| invalid(e.to_string()))?;
                    text.push_str(&unescaped);
                }
                Event::CData(data) => text.push_str(
                    std::str::from_utf8(&data)
                        .map_err(|_| invalid(format!("<{}> is not UTF-8", element)))?,
                ),
                Event::End(_) => return Ok(text),
                Event::Comment(_) => {}
                Event::Eof => return Err(invalid(format!("unterminated <{}>", element))),
                _ => return Err(invalid(format!("unexpected markup inside <{}>", element))),
            }
        }
    }

    fn value(&mut self, token: Token) -> Result<Value, FormatError> {
        let name = match token {
            Token::Empty(name) => {
                return match name.as_str() {
                    "true" => Ok(Value::Boolean(true)),
                    "false" => Ok(Value::Boolean(false)),
                    "string" => Ok(Value::String(String::new())),
                    "data" => Ok(Value::Data(vec![])),
                    "array" => Ok(Value::Array(vec![])),
                    "dict" => Ok(Value::Dictionary(Dictionary::new())),
                    _ => Err(invalid(format!("unknown element <{}/>", name))),
                }
            }
            Token::Start(name) => name,
            Token::End(name) => return Err(invalid(format!("unexpected </{}>", name))),
        };
        match name.as_str() {
            "string" => Ok(Value::String(self.text(&name)?)),
            "integer" => {
                let text = self.text(&name)?;
                text.trim()
                    .parse()
                    .map(Value::Integer)
                    .map_err(|_| invalid(format!("bad integer '{}'", text.trim())))
            }
            "real" => {
                let text = self.text(&name)?;
                text.trim()
                    .parse()
                    .map(Value::Real)
                    .map_err(|_| invalid(format!("bad real '{}'", text.trim())))
            }
            "true" | "false" => {
                let text = self.text(&name)?;
                if !text.trim().is_empty() {
                    return Err(invalid(format!("<{}> has contents", name)));
                }
                Ok(Value::Boolean(name == "true"))
            }
            "data" => {
                let text = self.text(&name)?;
                let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                STANDARD
                    .decode(compact.as_bytes())
                    .map(Value::Data)
                    .map_err(|e| invalid(format!("bad data: {}", e)))
            }
            "array" => self.array(),
            "dict" => self.dictionary(),
            _ => Err(invalid(format!("unknown element <{}>", name))),
        }
    }

    fn array(&mut self) -> Result<Value, FormatError> {
        let mut items = vec![];
        loop {
            match self.expect_token("array")? {
                Token::End(_) => return Ok(Value::Array(items)),
                token => items.push(self.value(token)?),
            }
        }
    }

    fn dictionary(&mut self) -> Result<Value, FormatError> {
        let mut dict = Dictionary::new();
        loop {
            let key = match self.expect_token("dict")? {
                Token::End(_) => return Ok(Value::Dictionary(dict)),
                Token::Start(name) if name == "key" => self.text("key")?,
                Token::Empty(name) if name == "key" => String::new(),
                other => {
                    return Err(invalid(format!(
                        "expected <key> in <dict>, found {}",
                        other
                    )))
                }
            };
            let value = match self.expect_token("dict")? {
                Token::End(_) => return Err(invalid(format!("key '{}' has no value", key))),
                token => self.value(token)?,
            };
            if dict.contains_key(&key) {
                return Err(invalid(format!("duplicate key '{}'", key)));
            }
            dict.insert(key, value);
        }
    }

    fn document(mut self) -> Result<Value, FormatError> {
        let root = match self.token()? {
            Some(Token::Start(name)) if name == "plist" => {
                let value = match self.expect_token("plist")? {
                    Token::End(_) => return Err(invalid("empty <plist>")),
                    token => self.value(token)?,
                };
                match self.expect_token("plist")? {
                    Token::End(_) => value,
                    other => return Err(invalid(format!("second root value {}", other))),
                }
            }
            Some(token) => self.value(token)?,
            None => return Err(invalid("no root element")),
        };
        match self.token()? {
            None => Ok(root),
            Some(other) => Err(invalid(format!("trailing {}", other))),
        }
    }
}

impl Format for SimpleXml {
    fn name(&self) -> &'static str {
        NAME
    }

    fn identify(&self, _contents: &[u8]) -> bool {
        false
    }

    fn deserialize(&self, contents: &[u8]) -> Result<Value, FormatError> {
        Parser::new(contents).document()
    }

    fn serialize(&self, _value: &Value) -> Result<Vec<u8>, FormatError> {
        Err(FormatError::Unsupported {
            format: NAME,
            what: "a value tree",
        })
    }
}
