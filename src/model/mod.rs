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
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod cisco;
pub mod dell;
pub mod ibm;

/// All settings read from one controller, keyed by vendor-neutral option name.
pub type Options = BTreeMap<String, FirmwareOption>;

/// A setting value. Boot orders and other sequences are lists of labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Scalar(String),
    List(Vec<String>),
}

impl OptionValue {
    pub fn is_empty(&self) -> bool {
        match self {
            OptionValue::Scalar(s) => s.is_empty(),
            OptionValue::List(l) => l.is_empty(),
        }
    }

    /// The labels carried by this value, one for a scalar.
    pub fn labels(&self) -> Vec<&str> {
        match self {
            OptionValue::Scalar(s) => vec![s.as_str()],
            OptionValue::List(l) => l.iter().map(String::as_str).collect(),
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            OptionValue::Scalar(s) => Some(s),
            OptionValue::List(_) => None,
        }
    }

    fn into_list(self) -> OptionValue {
        match self {
            OptionValue::Scalar(s) => OptionValue::List(vec![s]),
            list => list,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Scalar(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Scalar(s)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(l: Vec<String>) -> Self {
        OptionValue::List(l)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(l: Vec<&str>) -> Self {
        OptionValue::List(l.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Scalar(s) => write!(f, "{s}"),
            OptionValue::List(l) => write!(f, "[{}]", l.join(", ")),
        }
    }
}

/// Vendor routing needed to address a setting on the wire. Only the adapter
/// that produced a record looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VendorMetadata {
    Cisco(cisco::CiscoRoute),
    Dell(dell::DellRoute),
    Ibm(ibm::IbmRoute),
}

/// One configurable setting.
///
/// `current`, `pending` and the other controller-reported fields are only
/// written by adapters, after a read or an acknowledged write. Callers can
/// only request a change through `set_new_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareOption {
    current: Option<OptionValue>,
    default: Option<OptionValue>,
    possible: Vec<String>,
    pending: Option<OptionValue>,
    new_value: Option<OptionValue>,
    is_list: bool,
    metadata: VendorMetadata,
}

impl FirmwareOption {
    pub(crate) fn new(metadata: VendorMetadata, is_list: bool) -> FirmwareOption {
        FirmwareOption {
            current: None,
            default: None,
            possible: Vec::new(),
            pending: None,
            new_value: None,
            is_list,
            metadata,
        }
    }

    pub(crate) fn with_current(mut self, current: Option<OptionValue>) -> Self {
        self.current = current;
        self
    }

    pub(crate) fn with_default(mut self, default: Option<OptionValue>) -> Self {
        self.default = default;
        self
    }

    pub(crate) fn with_possible(mut self, possible: Vec<String>) -> Self {
        self.possible = possible;
        self
    }

    pub(crate) fn with_pending(mut self, pending: Option<OptionValue>) -> Self {
        self.pending = pending.filter(|p| !p.is_empty());
        self
    }

    pub fn current(&self) -> Option<&OptionValue> {
        self.current.as_ref()
    }

    pub fn default_value(&self) -> Option<&OptionValue> {
        self.default.as_ref()
    }

    pub fn possible(&self) -> &[String] {
        &self.possible
    }

    pub fn pending(&self) -> Option<&OptionValue> {
        self.pending.as_ref()
    }

    pub fn new_value(&self) -> Option<&OptionValue> {
        self.new_value.as_ref()
    }

    pub fn is_list(&self) -> bool {
        self.is_list
    }

    pub fn metadata(&self) -> &VendorMetadata {
        &self.metadata
    }

    /// Is something queued on the controller that has not taken effect yet?
    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Request a value for the next `set_fw_options`.
    pub fn set_new_value(&mut self, value: impl Into<OptionValue>) {
        self.new_value = Some(value.into());
    }

    pub fn clear_new_value(&mut self) {
        self.new_value = None;
    }

    /// Request the factory default. List settings with a single default label
    /// get a one element list. Records without a known default are left alone.
    pub fn reset_to_default(&mut self) {
        if let Some(default) = self.default.clone() {
            self.new_value = Some(if self.is_list {
                default.into_list()
            } else {
                default
            });
        }
    }

    /// The value that has to be written, if any.
    ///
    /// Nothing is written when no value was requested, when the requested
    /// value is already active and nothing else is queued, or when exactly
    /// the requested value is already queued.
    pub fn requested_change(&self) -> Option<&OptionValue> {
        let new_value = self.new_value.as_ref()?;
        if self.pending.as_ref() == Some(new_value) {
            return None;
        }
        if self.current.as_ref() == Some(new_value) && !self.has_pending() {
            return None;
        }
        Some(new_value)
    }

    /// Called once the controller acknowledged the write of `new_value`.
    pub(crate) fn commit_pending(&mut self) {
        self.pending = self.new_value.clone();
    }
}
