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
use tracing::{debug, warn};
use xmltree::Element;

use crate::{
    clock::Pacer,
    model::{
        cisco::{self, BootDevice, CiscoRoute},
        FirmwareOption, OptionValue, Options, VendorMetadata,
    },
    network::{Endpoint, XmlApi},
    reconcile::{reconcile, Submission, WriteStrategy},
    ApplyOutcome, FirmwareConfig, FirmwareError, SetOutcome, Vendor,
};

pub struct Bmc {
    endpoint: Endpoint,
    api: Box<dyn XmlApi>,
    pacer: Pacer,
}

impl Bmc {
    pub fn new(endpoint: Endpoint, api: Box<dyn XmlApi>, pacer: Pacer) -> Bmc {
        Bmc {
            endpoint,
            api,
            pacer,
        }
    }

    fn request(&self, document: &Element) -> Result<Element, FirmwareError> {
        self.pacer.checkpoint()?;
        self.api.request(document)
    }

    /// Runs `f` inside an aaaLogin / aaaLogout bracket. Logout is attempted
    /// even when `f` fails or the call was cancelled.
    fn with_session<T>(
        &self,
        f: impl FnOnce(&Session) -> Result<T, FirmwareError>,
    ) -> Result<T, FirmwareError> {
        let response = self.request(&cisco::login(&self.endpoint.user, &self.endpoint.password))?;
        let session = Session {
            bmc: self,
            cookie: cisco::login_cookie(&response, &self.endpoint.host)?,
        };
        let result = f(&session);
        // bypasses the cancellation checkpoint
        if let Err(e) = self.api.request(&cisco::logout(&session.cookie)) {
            warn!("aaaLogout from {} failed: {e}", self.endpoint.host);
        }
        result
    }
}

struct Session<'a> {
    bmc: &'a Bmc,
    cookie: String,
}

impl Session<'_> {
    fn request(&self, document: &Element) -> Result<Element, FirmwareError> {
        self.bmc.request(document)
    }
}

impl FirmwareConfig for Bmc {
    fn vendor(&self) -> Vendor {
        Vendor::Cisco
    }

    fn get_fw_options(&self) -> Result<Options, FirmwareError> {
        self.with_session(|s| {
            let settings = s.request(&cisco::resolve_class(&s.cookie, "biosSettings"))?;
            let mut options = cisco::parse_bios_settings(&settings);
            let boot = s.request(&cisco::resolve_class(&s.cookie, "lsbootDef"))?;
            options.insert(cisco::BOOT_ORDER.to_string(), cisco::parse_boot_order(&boot)?);
            debug!("Read {} options from {}", options.len(), self.endpoint.host);
            Ok(options)
        })
    }

    fn set_fw_options(&self, options: &mut Options) -> Result<SetOutcome, FirmwareError> {
        let mut outcome = SetOutcome::default();
        if options.values().all(|o| o.requested_change().is_none()) {
            return Ok(outcome);
        }
        self.with_session(|s| {
            outcome.record(reconcile(options, &mut BiosBatch { session: s })?);
            outcome.record(reconcile(options, &mut BootBatch { session: s })?);
            Ok(())
        })?;
        Ok(outcome)
    }

    fn apply_settings(&self, options: &Options) -> Result<ApplyOutcome, FirmwareError> {
        // CIMC stores settings synchronously, they activate on the next boot
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
        self.with_session(|s| {
            let response = s.request(&cisco::power_cycle(&s.cookie))?;
            cisco::check_response(&response, cisco::RACK_UNIT_DN)
        })?;
        Ok(ApplyOutcome::PowerCycled)
    }

    /// BIOS tokens go back to platform-default, the boot policy is kept.
    fn factory_reset(&self) -> Result<SetOutcome, FirmwareError> {
        let mut options = self.get_fw_options()?;
        for option in options.values_mut().filter(|o| !o.is_list()) {
            option.set_new_value(cisco::PLATFORM_DEFAULT);
        }
        self.set_fw_options(&mut options)
    }
}

struct BiosBatch<'a, 'b> {
    session: &'a Session<'b>,
}

impl WriteStrategy for BiosBatch<'_, '_> {
    type Fragment = Element;

    fn target(&self) -> String {
        cisco::BIOS_SETTINGS_DN.to_string()
    }

    fn selects(&self, _name: &str, option: &FirmwareOption) -> bool {
        matches!(
            option.metadata(),
            VendorMetadata::Cisco(CiscoRoute::Setting { .. })
        )
    }

    fn fragment(
        &self,
        name: &str,
        option: &FirmwareOption,
        value: &OptionValue,
    ) -> Result<Element, FirmwareError> {
        let VendorMetadata::Cisco(CiscoRoute::Setting { tag, rn }) = option.metadata() else {
            return Err(FirmwareError::missing("Cisco route", name));
        };
        let value = value.as_scalar().ok_or_else(|| FirmwareError::InvalidValue {
            context: "biosSettings".to_string(),
            field: name.to_string(),
            value: value.to_string(),
        })?;
        Ok(cisco::setting_fragment(tag, rn, name, value))
    }

    fn requires_reboot(&self, _option: &FirmwareOption) -> bool {
        true
    }

    fn submit(&mut self, fragments: Vec<Element>) -> Result<Submission, FirmwareError> {
        let s = self.session;
        let response = s.request(&cisco::bios_conf_mo(&s.cookie, fragments))?;
        cisco::check_response(&response, cisco::BIOS_SETTINGS_DN)?;
        Ok(Submission {
            reboot_required: true,
            job: None,
        })
    }
}

struct BootBatch<'a, 'b> {
    session: &'a Session<'b>,
}

impl WriteStrategy for BootBatch<'_, '_> {
    type Fragment = Vec<BootDevice>;

    fn target(&self) -> String {
        cisco::BOOT_POLICY_DN.to_string()
    }

    fn selects(&self, _name: &str, option: &FirmwareOption) -> bool {
        matches!(
            option.metadata(),
            VendorMetadata::Cisco(CiscoRoute::BootOrder)
        )
    }

    fn fragment(
        &self,
        name: &str,
        _option: &FirmwareOption,
        value: &OptionValue,
    ) -> Result<Vec<BootDevice>, FirmwareError> {
        value
            .labels()
            .into_iter()
            .map(|label| {
                BootDevice::from_label(label).ok_or_else(|| FirmwareError::InvalidValue {
                    context: "lsbootDef".to_string(),
                    field: name.to_string(),
                    value: label.to_string(),
                })
            })
            .collect()
    }

    fn requires_reboot(&self, _option: &FirmwareOption) -> bool {
        true
    }

    fn submit(&mut self, fragments: Vec<Vec<BootDevice>>) -> Result<Submission, FirmwareError> {
        let s = self.session;
        let devices: Vec<BootDevice> = fragments.into_iter().flatten().collect();
        let response = s.request(&cisco::boot_conf_mo(&s.cookie, &devices))?;
        cisco::check_response(&response, cisco::BOOT_POLICY_DN)?;
        Ok(Submission {
            reboot_required: true,
            job: None,
        })
    }
}
