use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::error::TissError;

const ATTRIBUTE_PREFIX: &str = "@_";
const TEXT_KEY: &str = "#text";

struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart) -> Result<Self, TissError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut fields = Map::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| TissError::Parse(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| TissError::Parse(e.to_string()))?;
            fields.insert(format!("{}{}", ATTRIBUTE_PREFIX, key), Value::String(value.into_owned()));
        }

        Ok(Self { name, fields, text: String::new() })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = if self.fields.is_empty() {
            Value::String(text)
        } else {
            let mut fields = self.fields;
            if !text.is_empty() {
                fields.insert(TEXT_KEY.to_string(), Value::String(text));
            }
            Value::Object(fields)
        };
        (self.name, value)
    }

    /// Repeated children collapse into an array in document order.
    fn attach(&mut self, name: String, value: Value) {
        match self.fields.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                self.fields.insert(name, value);
            }
        }
    }
}

/// Converts an XML document into a JSON value tree the deep-search helpers
/// understand. Element names keep their namespace prefix.
pub fn xml_to_value(xml: &str) -> Result<Value, TissError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root = Map::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            TissError::Parse(format!("XML inválido na posição {}: {}", reader.buffer_position(), e))
        })?;

        match event {
            Event::Start(start) => stack.push(Frame::open(&start)?),
            Event::Empty(start) => {
                let (name, value) = Frame::open(&start)?.close();
                match stack.last_mut() {
                    Some(parent) => parent.attach(name, value),
                    None => {
                        root.insert(name, value);
                    }
                }
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    let unescaped = text.unescape().map_err(|e| TissError::Parse(e.to_string()))?;
                    frame.text.push_str(&unescaped);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| TissError::Parse("Elemento de fechamento sem abertura".to_string()))?;
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => parent.attach(name, value),
                    None => {
                        root.insert(name, value);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(TissError::Parse("Documento XML incompleto".to_string()));
    }
    if root.is_empty() {
        return Err(TissError::Parse("Documento XML vazio".to_string()));
    }

    Ok(Value::Object(root))
}
