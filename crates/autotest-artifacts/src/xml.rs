use anyhow::{anyhow, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn iter_named<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        collect_named(self, name, &mut out);
        out
    }
}

fn collect_named<'a>(el: &'a Element, name: &str, out: &mut Vec<&'a Element>) {
    if el.name == name {
        out.push(el);
    }
    for child in &el.children {
        collect_named(child, name, out);
    }
}

pub fn parse_document(text: &str) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let el = element_from(&start)?;
                attach(el, &mut stack, &mut root)?;
            }
            Event::End(end) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| anyhow!("unexpected closing tag"))?;
                let closing = std::str::from_utf8(end.name().as_ref())?.to_string();
                if closing != el.name {
                    return Err(anyhow!(
                        "closing tag </{}> does not match <{}>",
                        closing,
                        el.name
                    ));
                }
                attach(el, &mut stack, &mut root)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(anyhow!("unclosed element <{}> at end of document", open.name));
    }
    root.ok_or_else(|| anyhow!("document has no root element"))
}

fn element_from(start: &BytesStart<'_>) -> Result<Element> {
    let name = std::str::from_utf8(start.name().as_ref())?.to_string();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
        let value = attr.unescape_value()?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn attach(el: Element, stack: &mut [Element], root: &mut Option<Element>) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(el);
        return Ok(());
    }
    if root.is_some() {
        return Err(anyhow!("document has more than one root element"));
    }
    *root = Some(el);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_tree_with_attributes() {
        let doc = parse_document(
            r#"<?xml version="1.0"?>
<a x="1"><b y="&quot;q&quot;"/><c><b y="2">text</b></c></a>"#,
        )
        .expect("well-formed");
        assert_eq!(doc.name, "a");
        assert_eq!(doc.attr("x"), Some("1"));
        assert_eq!(doc.child("b").and_then(|b| b.attr("y")), Some("\"q\""));
        let bs: Vec<_> = doc.iter_named("b").iter().map(|b| b.attr("y")).collect();
        assert_eq!(bs, vec![Some("\"q\""), Some("2")]);
        assert!(doc.child("missing").is_none());
    }

    #[test]
    fn rejects_unclosed_and_mismatched_documents() {
        assert!(parse_document("<a><b></b>").is_err());
        assert!(parse_document("<a><b></a></b>").is_err());
        assert!(parse_document("").is_err());
        assert!(parse_document("plain text, not markup").is_err());
        assert!(parse_document("<a/><b/>").is_err());
    }
}
