use std::io::Cursor;

use anyhow::{Context, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Selects elements in an existing XML document by name, an optional
/// required attribute value, and an optional ancestor element name.
#[derive(Clone, Copy, Debug)]
pub struct ElementMatch<'a> {
    pub name: &'a str,
    pub attr: Option<(&'a str, &'a str)>,
    pub within: Option<&'a str>,
}

impl<'a> ElementMatch<'a> {
    pub fn named(name: &'a str) -> Self {
        Self { name, attr: None, within: None }
    }

    pub fn with_attr(name: &'a str, key: &'a str, value: &'a str) -> Self {
        Self { name, attr: Some((key, value)), within: None }
    }

    pub fn within(mut self, ancestor: &'a str) -> Self {
        self.within = Some(ancestor);
        self
    }

    fn matches(&self, element: &BytesStart, stack: &[Vec<u8>]) -> bool {
        if element.name() != self.name.as_bytes() {
            return false;
        }
        if let Some(ancestor) = self.within {
            if !stack.iter().any(|n| n.as_slice() == ancestor.as_bytes()) {
                return false;
            }
        }
        if let Some((key, value)) = self.attr {
            let found = element.attributes().flatten().any(|a| {
                a.key == key.as_bytes() && a.value.as_ref() == value.as_bytes()
            });
            if !found {
                return false;
            }
        }
        true
    }
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Builds a fully owned element so the result can outlive any borrowed
/// attribute values. Attribute values are escaped here.
pub(crate) fn owned_element(name: &str, attrs: &[(&str, &str)]) -> BytesStart<'static> {
    let mut content = name.as_bytes().to_vec();
    for (key, value) in attrs {
        content.push(b' ');
        content.extend_from_slice(key.as_bytes());
        content.extend_from_slice(b"=\"");
        content.extend_from_slice(escape_attribute(value).as_bytes());
        content.push(b'"');
    }
    BytesStart::owned(content, name.len())
}

fn merged_element(element: &BytesStart, updates: &[(&str, &str)]) -> BytesStart<'static> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut applied = vec![false; updates.len()];
    for attr in element.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key).into_owned();
        let replacement = updates.iter().position(|(k, _)| k.as_bytes() == attr.key);
        match replacement {
            Some(i) => {
                attrs.push((key, updates[i].1.to_string()));
                applied[i] = true;
            }
            None => {
                // Re-escaped on write, so store the unescaped value.
                let value = attr.unescaped_value().unwrap_or_else(|_| attr.value.clone());
                attrs.push((key, String::from_utf8_lossy(&value).into_owned()));
            }
        }
    }
    for (i, (key, value)) in updates.iter().enumerate() {
        if !applied[i] {
            attrs.push((key.to_string(), value.to_string()));
        }
    }
    let name = String::from_utf8_lossy(element.name()).into_owned();
    let borrowed: Vec<(&str, &str)> =
        attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    owned_element(&name, &borrowed)
}

/// Rewrites attributes on every element matching `target`, leaving the rest
/// of the document byte-for-byte alone. Returns the new document and the
/// number of elements touched.
pub fn update_attributes(
    xml: &str,
    target: &ElementMatch,
    updates: &[(&str, &str)],
) -> Result<(String, usize)> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut touched = 0usize;

    loop {
        match reader.read_event(&mut buf).context("parsing XML")? {
            Event::Start(e) => {
                if target.matches(&e, &stack) {
                    touched += 1;
                    let merged = merged_element(&e, updates);
                    stack.push(e.name().to_vec());
                    writer.write_event(Event::Start(merged))?;
                } else {
                    stack.push(e.name().to_vec());
                    writer.write_event(Event::Start(e.to_owned()))?;
                }
            }
            Event::Empty(e) => {
                if target.matches(&e, &stack) {
                    touched += 1;
                    writer.write_event(Event::Empty(merged_element(&e, updates)))?;
                } else {
                    writer.write_event(Event::Empty(e.to_owned()))?;
                }
            }
            Event::End(e) => {
                stack.pop();
                writer.write_event(Event::End(BytesEnd::owned(e.name().to_vec())))?;
            }
            Event::Eof => break,
            other => writer.write_event(other.into_owned())?,
        }
        buf.clear();
    }

    let bytes = writer.into_inner().into_inner();
    Ok((String::from_utf8(bytes)?, touched))
}

/// Reads one attribute off the first element matching `target`.
pub fn read_attribute(xml: &str, target: &ElementMatch, attr: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event(&mut buf).context("parsing XML")? {
            Event::Start(e) => {
                if target.matches(&e, &stack) {
                    for a in e.attributes().flatten() {
                        if a.key == attr.as_bytes() {
                            return Ok(Some(String::from_utf8_lossy(&a.value).into_owned()));
                        }
                    }
                    return Ok(None);
                }
                stack.push(e.name().to_vec());
            }
            Event::Empty(e) => {
                if target.matches(&e, &stack) {
                    for a in e.attributes().flatten() {
                        if a.key == attr.as_bytes() {
                            return Ok(Some(String::from_utf8_lossy(&a.value).into_owned()));
                        }
                    }
                    return Ok(None);
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

/// Inserts a raw XML fragment just before the closing tag of every element
/// matching `parent`. A self-closing parent is expanded into a start/end
/// pair holding the fragment.
pub fn insert_into(xml: &str, parent: &ElementMatch, fragment: &str) -> Result<(String, usize)> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut matched: Vec<bool> = Vec::new();
    let mut inserted = 0usize;

    loop {
        match reader.read_event(&mut buf).context("parsing XML")? {
            Event::Start(e) => {
                let is_match = parent.matches(&e, &stack);
                stack.push(e.name().to_vec());
                matched.push(is_match);
                writer.write_event(Event::Start(e.to_owned()))?;
            }
            Event::Empty(e) => {
                if parent.matches(&e, &stack) {
                    inserted += 1;
                    let name = e.name().to_vec();
                    writer.write_event(Event::Start(e.to_owned()))?;
                    writer.write_event(Event::Text(BytesText::from_escaped_str(fragment)))?;
                    writer.write_event(Event::End(BytesEnd::owned(name)))?;
                } else {
                    writer.write_event(Event::Empty(e.to_owned()))?;
                }
            }
            Event::End(e) => {
                stack.pop();
                if matched.pop() == Some(true) {
                    inserted += 1;
                    writer.write_event(Event::Text(BytesText::from_escaped_str(fragment)))?;
                }
                writer.write_event(Event::End(BytesEnd::owned(e.name().to_vec())))?;
            }
            Event::Eof => break,
            other => writer.write_event(other.into_owned())?,
        }
        buf.clear();
    }

    let bytes = writer.into_inner().into_inner();
    Ok((String::from_utf8(bytes)?, inserted))
}

/// Builder for XML fragments later spliced in with [`insert_into`].
pub struct XmlFragment {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlFragment {
    pub fn new() -> Self {
        Self { writer: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2) }
    }

    pub fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.writer.write_event(Event::Start(owned_element(name, attrs)))?;
        Ok(())
    }

    pub fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.writer.write_event(Event::Empty(owned_element(name, attrs)))?;
        Ok(())
    }

    pub fn end(&mut self, name: &str) -> Result<()> {
        self.writer.write_event(Event::End(BytesEnd::owned(name.as_bytes().to_vec())))?;
        Ok(())
    }

    pub fn into_string(self) -> Result<String> {
        let bytes = self.writer.into_inner().into_inner();
        Ok(String::from_utf8(bytes)?)
    }
}

impl Default for XmlFragment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<i3D name="map"><Scene><Light name="sun" range="100"/><TerrainTransformGroup heightScale="255" name="terrain"><Layers><DisplacementLayer size="1024"/></Layers></TerrainTransformGroup></Scene></i3D>"#;

    #[test]
    fn updates_only_the_matching_element() {
        let target = ElementMatch::named("TerrainTransformGroup").within("Scene");
        let (out, touched) =
            update_attributes(SAMPLE, &target, &[("heightScale", "400")]).unwrap();
        assert_eq!(touched, 1);
        assert!(out.contains(r#"heightScale="400""#));
        assert!(out.contains(r#"range="100""#));
    }

    #[test]
    fn attr_condition_narrows_the_match() {
        let target = ElementMatch::with_attr("Light", "name", "sun");
        let (out, touched) =
            update_attributes(SAMPLE, &target, &[("range", "200"), ("extra", "1")]).unwrap();
        assert_eq!(touched, 1);
        assert!(out.contains(r#"range="200""#));
        assert!(out.contains(r#"extra="1""#));

        let miss = ElementMatch::with_attr("Light", "name", "moon");
        let (_, touched) = update_attributes(SAMPLE, &miss, &[("range", "9")]).unwrap();
        assert_eq!(touched, 0);
    }

    #[test]
    fn reads_an_attribute_back() {
        let target = ElementMatch::named("TerrainTransformGroup");
        let value = read_attribute(SAMPLE, &target, "heightScale").unwrap();
        assert_eq!(value.as_deref(), Some("255"));
        assert_eq!(read_attribute(SAMPLE, &target, "missing").unwrap(), None);
    }

    #[test]
    fn inserts_fragment_into_open_and_self_closing_parents() {
        let target = ElementMatch::named("Layers");
        let (out, inserted) = insert_into(SAMPLE, &target, "<InfoLayer/>").unwrap();
        assert_eq!(inserted, 1);
        assert!(out.contains("<InfoLayer/></Layers>"));

        let empty_parent = r#"<root><farmlands/></root>"#;
        let target = ElementMatch::named("farmlands");
        let (out, inserted) =
            insert_into(empty_parent, &target, r#"<farmland id="1"/>"#).unwrap();
        assert_eq!(inserted, 1);
        assert!(out.contains(r#"<farmlands><farmland id="1"/></farmlands>"#));
    }

    #[test]
    fn fragment_builder_nests_elements() {
        let mut fragment = XmlFragment::new();
        fragment.start("TransformGroup", &[("name", "field1")]).unwrap();
        fragment.empty("Note", &[("text", "field1")]).unwrap();
        fragment.end("TransformGroup").unwrap();
        let text = fragment.into_string().unwrap();
        assert!(text.contains(r#"<TransformGroup name="field1">"#));
        assert!(text.contains(r#"<Note text="field1"/>"#));
    }
}
