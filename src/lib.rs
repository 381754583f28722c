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

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod ipmi;
pub mod jobs;
pub mod model;
pub mod reconcile;
pub mod transfer;
pub mod wsman;
mod xml;

mod cisco;
mod dell;
mod error;
mod ibm;
mod network;

pub use clock::{CancellationToken, Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, FirmwareError};
pub use model::{FirmwareOption, OptionValue, Options, VendorMetadata};
pub use network::{
    ClientPool, ClientPoolBuilder, Connector, Endpoint, HttpXmlApi, XmlApi, XML_API_ENDPOINT,
};
pub use reconcile::{ApplyOutcome, BatchResult, BatchStatus, SetOutcome};
pub use transfer::{Compressor, TransferConfig};

/// Settings interface to one management controller. Every call makes one or
/// more round trips to the controller.
pub trait FirmwareConfig: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Every configurable setting, boot order included, with `new_value` unset.
    fn get_fw_options(&self) -> Result<Options, FirmwareError>;

    /// Writes the settings whose `new_value` differs from what the controller
    /// already has or has queued. Nothing to write means no round trip at all.
    fn set_fw_options(&self, options: &mut Options) -> Result<SetOutcome, FirmwareError>;

    /// Commits queued settings, waiting for the controller where it works
    /// asynchronously.
    fn apply_settings(&self, options: &Options) -> Result<ApplyOutcome, FirmwareError>;

    /// Makes queued settings take effect, power cycling the host if needed.
    fn reboot_system(&self, options: &Options) -> Result<ApplyOutcome, FirmwareError>;

    /// Requests the factory default of every setting.
    fn factory_reset(&self) -> Result<SetOutcome, FirmwareError> {
        let mut options = self.get_fw_options()?;
        for option in options.values_mut() {
            option.reset_to_default();
        }
        self.set_fw_options(&mut options)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Cisco,
    Dell,
    Ibm,
}

impl Vendor {
    /// Case-insensitive lookup, None for vendors without an adapter.
    pub fn from_name(name: &str) -> Option<Vendor> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cisco" => Some(Vendor::Cisco),
            "dell" => Some(Vendor::Dell),
            "ibm" => Some(Vendor::Ibm),
            _ => None,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Client for `vendor` with default settings. Only Cisco can be reached
/// without extra collaborators, Dell and IBM need a `ClientPool` configured
/// with their connectors.
pub fn create(
    vendor: &str,
    host: &str,
    user: &str,
    password: &str,
) -> Result<Option<Box<dyn FirmwareConfig>>, FirmwareError> {
    ClientPool::builder()
        .build()?
        .create(vendor, Endpoint::new(host, user, password))
}
