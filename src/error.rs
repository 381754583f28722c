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
use std::fmt;

use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum FirmwareError {
    #[error("Login to {host} failed: {reason}")]
    AuthError { host: String, reason: String },

    #[error("Network error talking to BMC at {url}. {source}")]
    NetworkError { url: String, source: reqwest::Error },

    #[error("HTTP {status_code} at {url}. See debug logs for details.")]
    HTTPErrorCode {
        url: String,
        status_code: StatusCode,
    },

    #[error("Transport failure during {operation}: {message}")]
    TransportError { operation: String, message: String },

    #[error("IPMI {operation} command failed with completion code {code:#04x}")]
    CompletionCode { operation: &'static str, code: u8 },

    #[error("Could not parse XML response to {context}. {source}")]
    XmlParseError {
        context: String,
        source: xmltree::ParseError,
    },

    #[error("Could not serialize XML request for {context}. {source}")]
    XmlWriteError {
        context: String,
        source: xmltree::Error,
    },

    #[error("Missing element {element} in response to {context}")]
    MissingElement { element: String, context: String },

    #[error("Response to {context} is {actual} bytes, expected at least {expected}")]
    ShortResponse {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Field {field} in response to {context} has invalid value '{value}'")]
    InvalidValue {
        context: String,
        field: String,
        value: String,
    },

    #[error("Compression codec failed: {0}")]
    CodecError(String),

    #[error("{operation} still failing after {attempts} attempts. Last error: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{target} rejected {operation} with status {code}")]
    ApplyRejected {
        target: String,
        operation: String,
        code: String,
    },

    #[error("No {0} connector configured for this client pool")]
    MissingConnector(&'static str),

    #[error("Operation cancelled")]
    Cancelled,
}

/// The broad failure categories callers are expected to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Transport,
    Protocol,
    RetryExhausted,
    ApplyRejected,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FirmwareError {
    pub fn kind(&self) -> ErrorKind {
        use FirmwareError::*;
        match self {
            AuthError { .. } => ErrorKind::Auth,
            NetworkError { .. }
            | HTTPErrorCode { .. }
            | TransportError { .. }
            | CompletionCode { .. }
            | MissingConnector(_) => ErrorKind::Transport,
            XmlParseError { .. }
            | XmlWriteError { .. }
            | MissingElement { .. }
            | ShortResponse { .. }
            | InvalidValue { .. }
            | CodecError(_) => ErrorKind::Protocol,
            RetryExhausted { .. } => ErrorKind::RetryExhausted,
            ApplyRejected { .. } => ErrorKind::ApplyRejected,
            Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn missing(element: &str, context: &str) -> FirmwareError {
        FirmwareError::MissingElement {
            element: element.to_string(),
            context: context.to_string(),
        }
    }
}
