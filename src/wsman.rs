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
use std::collections::BTreeMap;

use tracing::debug;
use xmltree::{Element, Namespace};

use crate::clock::Pacer;
use crate::{xml, FirmwareError};

/// A WS-Management custom action call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub resource_uri: String,
    pub method: String,
    pub selectors: BTreeMap<String, String>,
    pub namespace: Option<String>,
    pub input: Option<Element>,
}

impl Invocation {
    pub fn new(resource_uri: &str, method: &str) -> Self {
        Invocation {
            resource_uri: resource_uri.to_string(),
            method: method.to_string(),
            selectors: BTreeMap::new(),
            namespace: None,
            input: None,
        }
    }

    pub fn selector(mut self, name: &str, value: &str) -> Self {
        self.selectors.insert(name.to_string(), value.to_string());
        self
    }

    pub fn selectors(mut self, selectors: BTreeMap<String, String>) -> Self {
        self.selectors.extend(selectors);
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn input(mut self, input: Element) -> Self {
        self.input = Some(input);
        self
    }
}

/// One page of an enumeration. `context` is None once the enumeration is
/// exhausted.
#[derive(Debug, Clone, Default)]
pub struct PullResponse {
    pub items: Vec<Element>,
    pub context: Option<String>,
}

/// WS-Management client bound to one controller. Envelope construction,
/// transport and authentication all live behind this trait.
pub trait WsmanClient: Send + Sync {
    /// Start enumerating a resource. None means nothing to enumerate.
    fn enumerate(&self, resource_uri: &str) -> Result<Option<String>, FirmwareError>;

    fn pull(&self, resource_uri: &str, context: &str) -> Result<PullResponse, FirmwareError>;

    fn invoke(&self, invocation: &Invocation) -> Result<Element, FirmwareError>;
}

/// Drain a whole enumeration.
pub fn enumerate_all(
    client: &dyn WsmanClient,
    resource_uri: &str,
    pacer: &Pacer,
) -> Result<Vec<Element>, FirmwareError> {
    pacer.checkpoint()?;
    let mut items = Vec::new();
    let mut context = client.enumerate(resource_uri)?;
    while let Some(ctx) = context {
        pacer.checkpoint()?;
        let page = client.pull(resource_uri, &ctx)?;
        debug!("RX {} items from {resource_uri}", page.items.len());
        items.extend(page.items);
        context = page.context;
    }
    Ok(items)
}

/// The `{method}_INPUT` document for an action on `schema`.
pub fn input_document(method: &str, schema: &str, children: Vec<Element>) -> Element {
    let mut root = prefixed(&format!("{method}_INPUT"), schema);
    let mut ns = Namespace::empty();
    ns.put("p", schema);
    root.namespaces = Some(ns);
    for mut c in children {
        c.prefix = Some("p".to_string());
        c.namespace = Some(schema.to_string());
        xml::push(&mut root, c);
    }
    root
}

fn prefixed(name: &str, schema: &str) -> Element {
    let mut e = Element::new(name);
    e.prefix = Some("p".to_string());
    e.namespace = Some(schema.to_string());
    e
}

/// The `ReturnValue` status of an action response.
pub fn return_value(result: &Element, context: &str) -> Result<String, FirmwareError> {
    xml::find(result, "ReturnValue")
        .and_then(|e| e.get_text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| FirmwareError::missing("ReturnValue", context))
}

/// The value of the named selector in an action response, e.g. the
/// `InstanceID` of a job that was created.
pub fn response_selector(result: &Element, name: &str) -> Option<String> {
    xml::descendants(result, "Selector")
        .into_iter()
        .find(|s| xml::attr(s, "Name") == Some(name))
        .and_then(|s| s.get_text())
        .map(|t| t.trim().to_string())
}
