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

//! Documents of the CIMC XML API.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xmltree::Element;

use super::{FirmwareOption, OptionValue, Options, VendorMetadata};
use crate::{xml, FirmwareError};

pub const RACK_UNIT_DN: &str = "sys/rack-unit-1";
pub const BIOS_SETTINGS_DN: &str = "sys/rack-unit-1/bios/bios-settings";
pub const BOOT_POLICY_DN: &str = "sys/rack-unit-1/boot-policy";

/// Name of the list option holding the boot device order.
pub const BOOT_ORDER: &str = "boot_order";
/// Value that asks CIMC to restore a BIOS token's factory setting.
pub const PLATFORM_DEFAULT: &str = "platform-default";

const VALUE_PREFIX: &str = "vp";

/// Where a Cisco option lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiscoRoute {
    /// A `vp*` attribute of the BIOS token element `tag`, addressed by `rn`
    /// below the bios-settings dn.
    Setting { tag: String, rn: String },
    /// The `lsbootDef` boot policy.
    BootOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    VirtualCdrom,
    VirtualFdd,
    Lan,
    Hdd,
    Efi,
}

impl BootDevice {
    pub const ALL: [BootDevice; 5] = [
        BootDevice::VirtualCdrom,
        BootDevice::VirtualFdd,
        BootDevice::Lan,
        BootDevice::Hdd,
        BootDevice::Efi,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BootDevice::VirtualCdrom => "virt-cdrom",
            BootDevice::VirtualFdd => "virt-fdd",
            BootDevice::Lan => "lan",
            BootDevice::Hdd => "hdd",
            BootDevice::Efi => "efi",
        }
    }

    pub fn from_label(label: &str) -> Option<BootDevice> {
        BootDevice::ALL.into_iter().find(|d| d.label() == label)
    }

    fn from_element(e: &Element) -> Option<BootDevice> {
        match e.name.as_str() {
            "lsbootVirtualMedia" if xml::attr(e, "access") == Some("read-only") => {
                Some(BootDevice::VirtualCdrom)
            }
            "lsbootVirtualMedia" => Some(BootDevice::VirtualFdd),
            "lsbootLan" => Some(BootDevice::Lan),
            "lsbootStorage" => Some(BootDevice::Hdd),
            "lsbootEfi" => Some(BootDevice::Efi),
            _ => None,
        }
    }

    fn to_element(self, order: usize) -> Element {
        let order = order.to_string();
        match self {
            BootDevice::VirtualCdrom => xml::element(
                "lsbootVirtualMedia",
                &[
                    ("rn", "vm-read-only"),
                    ("access", "read-only"),
                    ("type", "virtual-media"),
                    ("order", order.as_str()),
                ],
            ),
            BootDevice::VirtualFdd => xml::element(
                "lsbootVirtualMedia",
                &[
                    ("rn", "vm-read-write"),
                    ("access", "read-write"),
                    ("type", "virtual-media"),
                    ("order", order.as_str()),
                ],
            ),
            BootDevice::Lan => xml::element(
                "lsbootLan",
                &[
                    ("rn", "lan-read-only"),
                    ("access", "read-only"),
                    ("prot", "pxe"),
                    ("type", "lan"),
                    ("order", order.as_str()),
                ],
            ),
            BootDevice::Hdd => {
                let mut hdd = xml::element(
                    "lsbootStorage",
                    &[
                        ("rn", "storage-read-write"),
                        ("access", "read-write"),
                        ("type", "storage"),
                        ("order", order.as_str()),
                    ],
                );
                xml::push(
                    &mut hdd,
                    xml::element("lsbootLocalStorage", &[("rn", "local-storage")]),
                );
                hdd
            }
            BootDevice::Efi => xml::element(
                "lsbootEfi",
                &[
                    ("rn", "efi-read-only"),
                    ("access", "read-only"),
                    ("type", "efi"),
                    ("order", order.as_str()),
                ],
            ),
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn login(user: &str, password: &str) -> Element {
    xml::element("aaaLogin", &[("inName", user), ("inPassword", password)])
}

pub fn logout(cookie: &str) -> Element {
    xml::element("aaaLogout", &[("cookie", cookie), ("inCookie", cookie)])
}

/// The session cookie from an aaaLogin response.
pub fn login_cookie(response: &Element, host: &str) -> Result<String, FirmwareError> {
    let auth_error = |reason: String| FirmwareError::AuthError {
        host: host.to_string(),
        reason,
    };
    if xml::attr(response, "response") != Some("yes") {
        return Err(auth_error("login not acknowledged".to_string()));
    }
    if let Some(code) = xml::attr(response, "errorCode") {
        let descr = xml::attr(response, "errorDescr").unwrap_or_default();
        return Err(auth_error(format!("error {code}: {descr}")));
    }
    match xml::attr(response, "outCookie") {
        Some(c) if !c.is_empty() => Ok(c.to_string()),
        _ => Err(auth_error("no session cookie in response".to_string())),
    }
}

pub fn resolve_class(cookie: &str, class_id: &str) -> Element {
    xml::element(
        "configResolveClass",
        &[
            ("cookie", cookie),
            ("inHierarchical", "true"),
            ("classId", class_id),
        ],
    )
}

/// Every `vp*` attribute below `biosSettings` as a scalar option.
pub fn parse_bios_settings(response: &Element) -> Options {
    let mut options = Options::new();
    for settings in xml::descendants(response, "biosSettings") {
        for token in all_below(settings) {
            let Some(rn) = xml::attr(token, "rn") else {
                debug!("Skipping BIOS token {} without rn", token.name);
                continue;
            };
            for (attr, value) in &token.attributes {
                let Some(name) = attr.strip_prefix(VALUE_PREFIX) else {
                    continue;
                };
                let route = CiscoRoute::Setting {
                    tag: token.name.clone(),
                    rn: rn.to_string(),
                };
                let option = FirmwareOption::new(VendorMetadata::Cisco(route), false)
                    .with_current(Some(value.as_str().into()));
                options.insert(name.to_string(), option);
            }
        }
    }
    options
}

// every element below `e`, in document order
fn all_below(e: &Element) -> Vec<&Element> {
    let mut found = Vec::new();
    for c in xml::children(e) {
        found.push(c);
        found.extend(all_below(c));
    }
    found
}

/// The boot policy as the `boot_order` list option, devices sorted by their
/// `order` attribute.
pub fn parse_boot_order(response: &Element) -> Result<FirmwareOption, FirmwareError> {
    let policy = xml::find(response, "lsbootDef")
        .ok_or_else(|| FirmwareError::missing("lsbootDef", "configResolveClass lsbootDef"))?;
    let mut devices: Vec<(u32, BootDevice)> = xml::children(policy)
        .filter_map(|e| {
            let device = BootDevice::from_element(e)?;
            let order = xml::attr(e, "order")
                .and_then(|o| o.parse().ok())
                .unwrap_or(u32::MAX);
            Some((order, device))
        })
        .collect();
    devices.sort_by_key(|(order, _)| *order);
    let current: Vec<String> = devices
        .into_iter()
        .map(|(_, d)| d.label().to_string())
        .collect();

    Ok(
        FirmwareOption::new(VendorMetadata::Cisco(CiscoRoute::BootOrder), true)
            .with_current(Some(OptionValue::List(current)))
            .with_possible(BootDevice::ALL.iter().map(|d| d.label().to_string()).collect()),
    )
}

/// `<tag dn="{bios-settings}/{rn}" vp{name}="{value}"/>`
pub fn setting_fragment(tag: &str, rn: &str, name: &str, value: &str) -> Element {
    let dn = format!("{BIOS_SETTINGS_DN}/{rn}");
    let attr = format!("{VALUE_PREFIX}{name}");
    xml::element(tag, &[("dn", dn.as_str()), (attr.as_str(), value)])
}

fn conf_mo(cookie: &str, dn: &str, hierarchical: bool, config: Element) -> Element {
    let mut root = xml::element(
        "configConfMo",
        &[
            ("cookie", cookie),
            ("dn", dn),
            ("inHierarchical", if hierarchical { "true" } else { "false" }),
        ],
    );
    let mut in_config = Element::new("inConfig");
    xml::push(&mut in_config, config);
    xml::push(&mut root, in_config);
    root
}

/// One configConfMo carrying every BIOS token change.
pub fn bios_conf_mo(cookie: &str, fragments: Vec<Element>) -> Element {
    let mut settings = Element::new("biosSettings");
    for f in fragments {
        xml::push(&mut settings, f);
    }
    conf_mo(cookie, BIOS_SETTINGS_DN, true, settings)
}

/// Replace the boot policy with `devices`, first boots first.
pub fn boot_conf_mo(cookie: &str, devices: &[BootDevice]) -> Element {
    let mut policy = xml::element(
        "lsbootDef",
        &[("dn", BOOT_POLICY_DN), ("rebootOnUpdate", "no")],
    );
    for (i, d) in devices.iter().enumerate() {
        xml::push(&mut policy, d.to_element(i + 1));
    }
    conf_mo(cookie, BOOT_POLICY_DN, true, policy)
}

pub fn power_cycle(cookie: &str) -> Element {
    let action = xml::element(
        "computeRackUnit",
        &[("adminPower", "cycle-immediate"), ("dn", RACK_UNIT_DN)],
    );
    conf_mo(cookie, &format!("{RACK_UNIT_DN}/"), false, action)
}

/// Fails with `ApplyRejected` unless CIMC acknowledged the change.
pub fn check_response(response: &Element, target: &str) -> Result<(), FirmwareError> {
    let acknowledged = xml::attr(response, "response") == Some("yes");
    let error_code = xml::attr(response, "errorCode");
    if acknowledged && error_code.is_none() {
        return Ok(());
    }
    Err(FirmwareError::ApplyRejected {
        target: target.to_string(),
        operation: response.name.clone(),
        code: error_code.unwrap_or("no-response").to_string(),
    })
}
