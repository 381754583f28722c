/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: MIT
 *
 * Permission is hereby granted, free of charge, to any person obtaining a
 * copy of this software and associated documentation files (the "Software"),
 * to deal in the Software without restriction, including without limitation
 * the rights to use, copy, modify, merge, publish, distribute, sublicense,
 * and/or sell copies of the Software, and to permit persons to whom the
 * Software is furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
 * THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
 * DEALINGS IN THE SOFTWARE.
 */

// xml.rs
// Helpers for building and picking apart XML documents, which every
// vendor protocol here is made of. Element names are matched on their
// local part, namespace prefixes are ignored.

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::FirmwareError;

// element builds an element with the given attributes.
pub(crate) fn element(name: &str, attrs: &[(&str, &str)]) -> Element {
    let mut e = Element::new(name);
    for (k, v) in attrs {
        e.attributes.insert(k.to_string(), v.to_string());
    }
    e
}

// text_element builds <name>text</name>.
pub(crate) fn text_element(name: &str, text: &str) -> Element {
    let mut e = Element::new(name);
    e.children.push(XMLNode::Text(text.to_string()));
    e
}

// push appends a child element.
pub(crate) fn push(parent: &mut Element, child: Element) {
    parent.children.push(XMLNode::Element(child));
}

// children iterates direct child elements, skipping text and comments.
pub(crate) fn children(e: &Element) -> impl Iterator<Item = &Element> {
    e.children.iter().filter_map(|n| match n {
        XMLNode::Element(c) => Some(c),
        _ => None,
    })
}

// descendants collects every element below `e` named `name`, in document order.
pub(crate) fn descendants<'a>(e: &'a Element, name: &str) -> Vec<&'a Element> {
    let mut found = Vec::new();
    collect(e, name, &mut found);
    found
}

fn collect<'a>(e: &'a Element, name: &str, found: &mut Vec<&'a Element>) {
    for c in children(e) {
        if c.name == name {
            found.push(c);
        }
        collect(c, name, found);
    }
}

// find returns `e` itself or the first descendant named `name`.
pub(crate) fn find<'a>(e: &'a Element, name: &str) -> Option<&'a Element> {
    if e.name == name {
        return Some(e);
    }
    children(e).find_map(|c| find(c, name))
}

// child_text is the trimmed text of a direct child. Absent, empty and nil
// elements all give None.
pub(crate) fn child_text(e: &Element, name: &str) -> Option<String> {
    let text = e.get_child(name)?.get_text()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

// child_texts collects the text of every direct child named `name`.
pub(crate) fn child_texts(e: &Element, name: &str) -> Vec<String> {
    children(e)
        .filter(|c| c.name == name)
        .filter_map(|c| c.get_text().map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect()
}

// attr looks up an attribute value.
pub(crate) fn attr<'a>(e: &'a Element, name: &str) -> Option<&'a str> {
    e.attributes.get(name).map(String::as_str)
}

pub(crate) fn parse(data: &[u8], context: &str) -> Result<Element, FirmwareError> {
    Element::parse(data).map_err(|source| FirmwareError::XmlParseError {
        context: context.to_string(),
        source,
    })
}

// to_bytes serializes without an XML declaration, the controllers want the
// bare element.
pub(crate) fn to_bytes(e: &Element, context: &str) -> Result<Vec<u8>, FirmwareError> {
    let mut out = Vec::new();
    let config = EmitterConfig::new().write_document_declaration(false);
    e.write_with_config(&mut out, config)
        .map_err(|source| FirmwareError::XmlWriteError {
            context: context.to_string(),
            source,
        })?;
    Ok(out)
}
