//! The `xml` namespace: XML text to compact guest maps and back.
//!
//! An element becomes a map keyed by child element name. Attributes sit
//! under `_attributes`, character data under `_text` and the XML
//! declaration under `_declaration`. Repeated child names collect into an
//! array in document order.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rhai::{Array, Dynamic, ImmutableString, Map, Module, Shared};
use thiserror::Error;

use crate::error::{GuestResult, guest_error};
use crate::value::HostValue;

pub const NAMESPACE: &str = "xml";

const ATTRIBUTES: &str = "_attributes";
const TEXT: &str = "_text";
const DECLARATION: &str = "_declaration";

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml parse error: {0}")]
    Parse(String),

    #[error("xml parse error: element <{0}> is never closed")]
    Unclosed(String),

    #[error("xml write error: {0}")]
    Write(String),
}

fn parse_error(err: impl std::fmt::Display) -> XmlError {
    XmlError::Parse(err.to_string())
}

fn write_error(err: impl std::fmt::Display) -> XmlError {
    XmlError::Write(err.to_string())
}

/// Parse `text` into a compact document map.
pub fn parse(text: &str) -> Result<Map, XmlError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    // Bottom entry is the document itself.
    let mut stack: Vec<(String, Map)> = vec![(String::new(), Map::new())];

    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Decl(decl) => {
                let mut node = Map::new();
                node.insert(ATTRIBUTES.into(), Dynamic::from_map(declaration_attributes(&decl)?));
                top(&mut stack)?.insert(DECLARATION.into(), Dynamic::from_map(node));
            }
            Event::Start(start) => {
                let node = element(&start)?;
                stack.push((element_name(&start), node));
            }
            Event::Empty(start) => {
                let node = element(&start)?;
                add_child(top(&mut stack)?, element_name(&start), Dynamic::from_map(node));
            }
            Event::End(_) => {
                let (name, node) = match stack.pop() {
                    Some(entry) if !stack.is_empty() => entry,
                    _ => return Err(XmlError::Parse("closing tag without an open element".into())),
                };
                add_child(top(&mut stack)?, name, Dynamic::from_map(node));
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(parse_error)?;
                append_text(top(&mut stack)?, &text);
            }
            Event::CData(data) => {
                let data = data.into_inner();
                append_text(top(&mut stack)?, &String::from_utf8_lossy(&data));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() > 1 {
        let (name, _) = stack.swap_remove(1);
        return Err(XmlError::Unclosed(name));
    }
    stack
        .pop()
        .map(|(_, document)| document)
        .ok_or_else(|| XmlError::Parse("empty document".into()))
}

/// Render a compact document map back to XML text.
///
/// Sibling elements with different names are written in map key order.
pub fn render(document: &Map) -> Result<String, XmlError> {
    let mut writer = Writer::new(Vec::new());
    if let Some(declaration) = document.get(DECLARATION) {
        write_declaration(&mut writer, declaration)?;
    }
    write_children(&mut writer, document)?;
    String::from_utf8(writer.into_inner()).map_err(write_error)
}

fn top(stack: &mut [(String, Map)]) -> Result<&mut Map, XmlError> {
    stack
        .last_mut()
        .map(|(_, node)| node)
        .ok_or_else(|| XmlError::Parse("content outside the document".into()))
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn element(start: &BytesStart<'_>) -> Result<Map, XmlError> {
    let mut attributes = Map::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(parse_error)?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(parse_error)?;
        attributes.insert(key.into(), value.into_owned().into());
    }

    let mut node = Map::new();
    if !attributes.is_empty() {
        node.insert(ATTRIBUTES.into(), Dynamic::from_map(attributes));
    }
    Ok(node)
}

fn declaration_attributes(decl: &BytesDecl<'_>) -> Result<Map, XmlError> {
    let mut attributes = Map::new();
    let version = decl.version().map_err(parse_error)?;
    attributes.insert("version".into(), String::from_utf8_lossy(&version).into_owned().into());
    if let Some(encoding) = decl.encoding() {
        let encoding = encoding.map_err(parse_error)?;
        attributes.insert("encoding".into(), String::from_utf8_lossy(&encoding).into_owned().into());
    }
    if let Some(standalone) = decl.standalone() {
        let standalone = standalone.map_err(parse_error)?;
        attributes.insert("standalone".into(), String::from_utf8_lossy(&standalone).into_owned().into());
    }
    Ok(attributes)
}

fn add_child(parent: &mut Map, name: String, child: Dynamic) {
    match parent.get_mut(name.as_str()) {
        Some(existing) if existing.is_array() => {
            if let Some(mut siblings) = existing.write_lock::<Array>() {
                siblings.push(child);
            }
        }
        Some(existing) => {
            let first = std::mem::take(existing);
            *existing = Dynamic::from_array(vec![first, child]);
        }
        None => {
            parent.insert(name.into(), child);
        }
    }
}

fn append_text(node: &mut Map, text: &str) {
    if text.is_empty() {
        return;
    }
    match node.get_mut(TEXT) {
        Some(existing) => {
            let joined = format!("{existing}{text}");
            *existing = joined.into();
        }
        None => {
            node.insert(TEXT.into(), text.into());
        }
    }
}

fn as_map(value: &Dynamic) -> Option<Map> {
    value.clone().try_cast::<Map>()
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), XmlError> {
    writer.write_event(event).map_err(write_error)
}

fn write_declaration(writer: &mut Writer<Vec<u8>>, declaration: &Dynamic) -> Result<(), XmlError> {
    let attributes = as_map(declaration)
        .and_then(|node| node.get(ATTRIBUTES).and_then(as_map))
        .unwrap_or_default();
    let field = |key: &str| attributes.get(key).map(ToString::to_string);

    let version = field("version").unwrap_or_else(|| "1.0".to_string());
    let encoding = field("encoding");
    let standalone = field("standalone");
    emit(
        writer,
        Event::Decl(BytesDecl::new(&version, encoding.as_deref(), standalone.as_deref())),
    )
}

fn write_children(writer: &mut Writer<Vec<u8>>, node: &Map) -> Result<(), XmlError> {
    for (name, value) in node {
        if name.starts_with('_') {
            continue;
        }
        match value.clone().try_cast::<Array>() {
            Some(siblings) => {
                for sibling in &siblings {
                    write_element(writer, name, sibling)?;
                }
            }
            None => write_element(writer, name, value)?,
        }
    }
    Ok(())
}

fn write_element(writer: &mut Writer<Vec<u8>>, name: &str, value: &Dynamic) -> Result<(), XmlError> {
    let Some(node) = as_map(value) else {
        // Scalars become text-only elements.
        emit(writer, Event::Start(BytesStart::new(name)))?;
        emit(writer, Event::Text(BytesText::new(&value.to_string())))?;
        return emit(writer, Event::End(BytesEnd::new(name)));
    };

    let mut start = BytesStart::new(name);
    if let Some(attributes) = node.get(ATTRIBUTES).and_then(as_map) {
        for (key, value) in &attributes {
            start.push_attribute((key.as_str(), value.to_string().as_str()));
        }
    }
    if node.keys().all(|key| key.as_str() == ATTRIBUTES) {
        return emit(writer, Event::Empty(start));
    }

    emit(writer, Event::Start(start))?;
    if let Some(text) = node.get(TEXT) {
        emit(writer, Event::Text(BytesText::new(&text.to_string())))?;
    }
    write_children(writer, &node)?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

/// Build the `xml` module. Built once and shared by every instance.
pub fn module() -> Shared<Module> {
    let mut module = Module::new();

    module.set_native_fn("xml2js", |text: ImmutableString| -> GuestResult<Map> {
        parse(&text).map_err(guest_error)
    });

    module.set_native_fn("xml2json", |text: ImmutableString| -> GuestResult<String> {
        let document = parse(&text).map_err(guest_error)?;
        let value = HostValue::from_dynamic(&Dynamic::from_map(document)).map_err(guest_error)?;
        serde_json::to_string(&value).map_err(guest_error)
    });

    module.set_native_fn("js2xml", |document: Map| -> GuestResult<String> {
        render(&document).map_err(guest_error)
    });

    module.build_index();
    module.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = concat!(
        r#"<?xml version="1.0" encoding="utf-8"?>"#,
        r#"<note importance="high" logged="true">"#,
        "    <title>Happy</title>",
        "    <todo>Work</todo>",
        "    <todo>Play</todo>",
        "</note>",
    );

    fn json(document: &Map) -> serde_json::Value {
        let value = HostValue::from_dynamic(&Dynamic::from_map(document.clone())).unwrap();
        serde_json::to_value(value).unwrap()
    }

    #[test]
    fn parses_into_compact_form() {
        let document = parse(NOTE).unwrap();
        assert_eq!(
            json(&document),
            serde_json::json!({
                "_declaration": { "_attributes": { "version": "1.0", "encoding": "utf-8" } },
                "note": {
                    "_attributes": { "importance": "high", "logged": "true" },
                    "title": { "_text": "Happy" },
                    "todo": [{ "_text": "Work" }, { "_text": "Play" }],
                },
            })
        );
    }

    #[test]
    fn empty_elements_and_entities() {
        let document = parse(r#"<a><b/><c k="x &amp; y">1 &lt; 2</c></a>"#).unwrap();
        assert_eq!(
            json(&document),
            serde_json::json!({
                "a": { "b": {}, "c": { "_attributes": { "k": "x & y" }, "_text": "1 < 2" } },
            })
        );
    }

    #[test]
    fn render_round_trips_through_parse() {
        let document = parse(NOTE).unwrap();
        let text = render(&document).unwrap();
        assert!(text.starts_with(r#"<?xml version="1.0" encoding="utf-8"?>"#));
        assert!(text.contains("<todo>Work</todo><todo>Play</todo>"));
        assert_eq!(json(&parse(&text).unwrap()), json(&document));
    }

    #[test]
    fn mismatched_and_unclosed_tags_fail() {
        assert!(matches!(parse("<a></b>"), Err(XmlError::Parse(_))));
        assert!(parse("<a><b></b>").is_err());
    }
}
