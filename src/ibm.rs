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
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use xmltree::Element;

use crate::{
    clock::Pacer,
    ipmi::{IpmiSession, PowerAction, PowerState},
    model::{
        ibm::{self, IbmRoute},
        FirmwareOption, OptionValue, Options, VendorMetadata,
    },
    network::{Connector, Endpoint},
    reconcile::{reconcile, Submission, WriteStrategy},
    transfer::{Compressor, FileChannel, TransferConfig},
    xml, ApplyOutcome, FirmwareConfig, FirmwareError, SetOutcome, Vendor,
};

pub struct Bmc {
    host: String,
    codec: Arc<dyn Compressor>,
    // one file transfer at a time per controller
    channel: Mutex<FileChannel>,
}

impl Bmc {
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector<dyn IpmiSession>>,
        codec: Arc<dyn Compressor>,
        transfer: TransferConfig,
        pacer: Pacer,
    ) -> Bmc {
        Bmc {
            host: endpoint.host.clone(),
            codec,
            channel: Mutex::new(FileChannel::new(endpoint, connector, transfer, pacer)),
        }
    }

    fn channel(&self) -> MutexGuard<'_, FileChannel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FirmwareConfig for Bmc {
    fn vendor(&self) -> Vendor {
        Vendor::Ibm
    }

    fn get_fw_options(&self) -> Result<Options, FirmwareError> {
        let data = self
            .channel()
            .read_file(ibm::CONFIG_FILE, self.codec.as_ref())?;
        debug!("RX {} bytes of {} from {}", data.len(), ibm::CONFIG_FILE, self.host);
        ibm::parse_config(&data)
    }

    fn set_fw_options(&self, options: &mut Options) -> Result<SetOutcome, FirmwareError> {
        let mut outcome = SetOutcome::default();
        outcome.record(reconcile(options, &mut UpdateBatch { bmc: self })?);
        Ok(outcome)
    }

    fn apply_settings(&self, options: &Options) -> Result<ApplyOutcome, FirmwareError> {
        // the IMM hands the update to UEFI on the next boot
        if options
            .values()
            .any(|o| o.has_pending() || o.requested_change().is_some())
        {
            Ok(ApplyOutcome::AwaitingReboot)
        } else {
            Ok(ApplyOutcome::Idle)
        }
    }

    fn reboot_system(&self, _options: &Options) -> Result<ApplyOutcome, FirmwareError> {
        let mut channel = self.channel();
        let action = match channel.power_state()? {
            PowerState::On => PowerAction::Reset,
            PowerState::Off => PowerAction::On,
        };
        channel.set_power(action)?;
        info!("Power {action} on {}", self.host);
        Ok(ApplyOutcome::PowerCycled)
    }
}

/// Every change in one ASU update file.
struct UpdateBatch<'a> {
    bmc: &'a Bmc,
}

impl WriteStrategy for UpdateBatch<'_> {
    type Fragment = Element;

    fn target(&self) -> String {
        ibm::UPDATE_FILE.to_string()
    }

    fn selects(&self, _name: &str, option: &FirmwareOption) -> bool {
        matches!(option.metadata(), VendorMetadata::Ibm(_))
    }

    fn fragment(
        &self,
        name: &str,
        option: &FirmwareOption,
        value: &OptionValue,
    ) -> Result<Element, FirmwareError> {
        let VendorMetadata::Ibm(route) = option.metadata() else {
            return Err(FirmwareError::missing("IBM setting route", name));
        };
        if !option.is_list() && value.as_scalar().is_none() {
            return Err(FirmwareError::InvalidValue {
                context: route.setting_id.clone(),
                field: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(ibm::setting_fragment(route, value, option.is_list()))
    }

    fn requires_reboot(&self, option: &FirmwareOption) -> bool {
        matches!(
            option.metadata(),
            VendorMetadata::Ibm(IbmRoute {
                reboot_required: true,
                ..
            })
        )
    }

    fn submit(&mut self, fragments: Vec<Element>) -> Result<Submission, FirmwareError> {
        let id = ibm::update_id();
        let document = ibm::update_document(&id, fragments);
        let data = xml::to_bytes(&document, ibm::UPDATE_FILE)?;
        debug!("TX {id} {} bytes to {}", data.len(), self.bmc.host);
        self.bmc
            .channel()
            .write_file(ibm::UPDATE_FILE, &data, self.bmc.codec.as_ref())?;
        Ok(Submission::default())
    }
}
