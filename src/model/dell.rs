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

//! DCIM classes and methods of the iDRAC WS-Management interface.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xmltree::Element;

use super::{FirmwareOption, OptionValue, VendorMetadata};
use crate::jobs::Job;
use crate::wsman::{self, Invocation};
use crate::{xml, FirmwareError};

pub const DCIM_SCHEMA: &str = "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/root/dcim";
pub const DELL_SCHEMA: &str = "http://schemas.dell.com/wbem/wscim/1/cim-schema/2";
pub const CIM_NAMESPACE: &str = "root/dcim";

pub const BIOS_TARGET: &str = "BIOS.Setup.1-1";
pub const IDRAC_TARGET: &str = "iDRAC.Embedded.1";
pub const TIME_NOW: &str = "TIME_NOW";

// ReturnValue meanings
pub const STATUS_OK: &str = "0";
pub const STATUS_JOB_CREATED: &str = "4096";
const STATUS_FAILED: &str = "2";

const BOOT_ORDER_PREFIX: &str = "BootOrder";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DellService {
    Bios,
    Lc,
    IdracCard,
    Nic,
}

impl DellService {
    pub const ALL: [DellService; 4] = [
        DellService::Bios,
        DellService::Lc,
        DellService::IdracCard,
        DellService::Nic,
    ];

    /// The DCIM class infix, e.g. `iDRACCard` in `DCIM_iDRACCardService`.
    pub fn name(&self) -> &'static str {
        match self {
            DellService::Bios => "BIOS",
            DellService::Lc => "LC",
            DellService::IdracCard => "iDRACCard",
            DellService::Nic => "NIC",
        }
    }

    pub fn enumeration_class(&self) -> String {
        format!("DCIM_{}Enumeration", self.name())
    }

    pub fn enumeration_uri(&self) -> String {
        format!("{DCIM_SCHEMA}/{}", self.enumeration_class())
    }

    pub fn service_uri(&self) -> String {
        format!("{DCIM_SCHEMA}/DCIM_{}Service", self.name())
    }

    pub fn selectors(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Name".to_string(), format!("DCIM:{}Service", self.name())),
            ("SystemName".to_string(), "DCIM:ComputerSystem".to_string()),
            (
                "SystemCreationClassName".to_string(),
                "DCIM_ComputerSystem".to_string(),
            ),
            (
                "CreationClassName".to_string(),
                format!("DCIM_{}Service", self.name()),
            ),
        ])
    }

    /// Target FQDD of SetAttributes when it is the same for every attribute
    /// of the service.
    pub fn fixed_target(&self) -> Option<&'static str> {
        match self {
            DellService::Bios => Some(BIOS_TARGET),
            DellService::IdracCard => Some(IDRAC_TARGET),
            DellService::Lc | DellService::Nic => None,
        }
    }
}

impl fmt::Display for DellService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DellRoute {
    /// A DCIM attribute, written with SetAttributes on `service`.
    Attribute {
        service: DellService,
        /// `AttributeName` as SetAttributes wants it
        wire_name: String,
        fqdd: Option<String>,
    },
    /// One boot list of `DCIM_BootConfigSetting`.
    Boot {
        boot_type: String,
        /// BootString label -> InstanceID
        instance_ids: BTreeMap<String, String>,
    },
}

pub fn boot_source_uri() -> String {
    format!("{DCIM_SCHEMA}/DCIM_BootSourceSetting")
}

pub fn boot_config_uri() -> String {
    format!("{DELL_SCHEMA}/DCIM_BootConfigSetting")
}

pub fn lifecycle_job_uri() -> String {
    format!("{DCIM_SCHEMA}/DCIM_LifecycleJob")
}

pub fn power_service_uri() -> String {
    format!("{DELL_SCHEMA}/DCIM_CSPowerManagementService")
}

// the pulled item may be the instance itself or wrap it
fn instance<'a>(item: &'a Element, class: &str) -> &'a Element {
    xml::find(item, class).unwrap_or(item)
}

/// One enumerated attribute as `(option name, record)`. Items without an
/// `AttributeName` are skipped.
pub fn parse_attribute(service: DellService, item: &Element) -> Option<(String, FirmwareOption)> {
    let e = instance(item, &service.enumeration_class());
    let Some(attribute) = xml::child_text(e, "AttributeName") else {
        debug!("Skipping {} item without AttributeName", service);
        return None;
    };
    let fqdd = xml::child_text(e, "FQDD");
    let group = xml::child_text(e, "GroupID");

    let (name, wire_name) = match group {
        None => (format!("{service}.{attribute}"), attribute.clone()),
        Some(group) => {
            let name = match service {
                DellService::Nic => format!(
                    "{service}.{}.{attribute}",
                    fqdd.as_deref().unwrap_or_default()
                ),
                _ => format!("{service}.{group}.{attribute}"),
            };
            let wire_name = match service {
                DellService::Bios | DellService::Nic => attribute.clone(),
                _ => format!("{group}#{attribute}"),
            };
            (name, wire_name)
        }
    };

    let route = DellRoute::Attribute {
        service,
        wire_name,
        fqdd,
    };
    let option = FirmwareOption::new(VendorMetadata::Dell(route), false)
        .with_current(xml::child_text(e, "CurrentValue").map(OptionValue::from))
        .with_pending(xml::child_text(e, "PendingValue").map(OptionValue::from))
        .with_default(xml::child_text(e, "DefaultValue").map(OptionValue::from))
        .with_possible(xml::child_texts(e, "PossibleValues"));
    Some((name, option))
}

struct BootSource {
    label: String,
    instance_id: String,
    enabled: bool,
    sequence: u32,
    pending_enabled: bool,
    pending_sequence: u32,
}

/// One list option `BootOrder{type}` per boot source type.
///
/// Current lists the enabled sources in assigned order. Pending lists the
/// sources enabled after the next commit, in their pending order, and is
/// left empty when that is the current list.
pub fn parse_boot_sources(items: &[Element]) -> BTreeMap<String, FirmwareOption> {
    let mut by_type: BTreeMap<String, Vec<BootSource>> = BTreeMap::new();
    for item in items {
        let e = instance(item, "DCIM_BootSourceSetting");
        let (Some(boot_type), Some(label), Some(instance_id)) = (
            xml::child_text(e, "BootSourceType"),
            xml::child_text(e, "BootString"),
            xml::child_text(e, "InstanceID"),
        ) else {
            debug!("Skipping incomplete DCIM_BootSourceSetting");
            continue;
        };
        let number = |name: &str| {
            xml::child_text(e, name)
                .and_then(|s| s.parse().ok())
                .unwrap_or(u32::MAX)
        };
        let source = BootSource {
            label,
            instance_id,
            enabled: xml::child_text(e, "CurrentEnabledStatus").as_deref() != Some("0"),
            sequence: number("CurrentAssignedSequence"),
            pending_enabled: xml::child_text(e, "PendingEnabledStatus").as_deref() == Some("1"),
            pending_sequence: number("PendingAssignedSequence"),
        };
        by_type.entry(boot_type).or_default().push(source);
    }

    let mut options = BTreeMap::new();
    for (boot_type, mut sources) in by_type {
        let possible: Vec<String> = sources.iter().map(|s| s.label.clone()).collect();
        let instance_ids = sources
            .iter()
            .map(|s| (s.label.clone(), s.instance_id.clone()))
            .collect();

        sources.sort_by_key(|s| s.sequence);
        let current: Vec<String> = sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.label.clone())
            .collect();
        sources.sort_by_key(|s| s.pending_sequence);
        let pending: Vec<String> = sources
            .iter()
            .filter(|s| s.pending_enabled)
            .map(|s| s.label.clone())
            .collect();
        let pending = (pending != current).then_some(OptionValue::List(pending));

        let route = DellRoute::Boot {
            boot_type: boot_type.clone(),
            instance_ids,
        };
        let option = FirmwareOption::new(VendorMetadata::Dell(route), true)
            .with_current(Some(OptionValue::List(current)))
            .with_pending(pending)
            .with_possible(possible);
        options.insert(format!("{BOOT_ORDER_PREFIX}{boot_type}"), option);
    }
    options
}

/// A `DCIM_LifecycleJob` instance. PercentComplete values that are not a
/// number (the controller reports "NA" for some job types) count as 0.
pub fn parse_job(item: &Element) -> Option<Job> {
    let e = instance(item, "DCIM_LifecycleJob");
    let id = xml::child_text(e, "InstanceID")?;
    let percent_complete = xml::child_text(e, "PercentComplete")
        .and_then(|p| p.parse::<u8>().ok())
        .unwrap_or(0);
    Some(Job {
        id,
        percent_complete,
        state: xml::child_text(e, "JobStatus").unwrap_or_default(),
    })
}

fn call(uri: &str, method: &str, children: Vec<Element>) -> Invocation {
    Invocation::new(uri, method).input(wsman::input_document(method, uri, children))
}

/// SetAttributes with one name/value pair per attribute.
pub fn set_attributes(
    service: DellService,
    target: Option<&str>,
    attributes: Vec<(String, String)>,
) -> Invocation {
    let mut children = Vec::with_capacity(attributes.len() * 2 + 1);
    if let Some(t) = target {
        children.push(xml::text_element("Target", t));
    }
    for (name, value) in attributes {
        children.push(xml::text_element("AttributeName", &name));
        children.push(xml::text_element("AttributeValue", &value));
    }
    call(&service.service_uri(), "SetAttributes", children).selectors(service.selectors())
}

/// Commit job for the lifecycle controller's own attributes.
pub fn create_config_job(service: DellService) -> Invocation {
    Invocation::new(&service.service_uri(), "CreateConfigJob").selectors(service.selectors())
}

/// Config job for `target` starting now, rebooting the host first when
/// `reboot` is set (RebootJobType 2, graceful with forced fallback).
pub fn create_targeted_config_job(service: DellService, target: &str, reboot: bool) -> Invocation {
    let mut children = vec![xml::text_element("Target", target)];
    if reboot {
        children.push(xml::text_element("RebootJobType", "2"));
    }
    children.push(xml::text_element("ScheduledStartTime", TIME_NOW));
    call(&service.service_uri(), "CreateTargetedConfigJob", children)
        .selectors(service.selectors())
}

pub fn change_boot_source_state(boot_type: &str, instance_ids: &[String]) -> Invocation {
    let mut children = vec![xml::text_element("EnabledState", "1")];
    children.extend(instance_ids.iter().map(|id| xml::text_element("source", id)));
    call(&boot_config_uri(), "ChangeBootSourceState", children)
        .selector("InstanceID", boot_type)
        .namespace(CIM_NAMESPACE)
}

pub fn change_boot_order(boot_type: &str, instance_ids: &[String]) -> Invocation {
    let children = instance_ids
        .iter()
        .map(|id| xml::text_element("source", id))
        .collect();
    call(&boot_config_uri(), "ChangeBootOrderByInstanceID", children)
        .selector("InstanceID", boot_type)
        .namespace(CIM_NAMESPACE)
}

/// Power cycle of the host (PowerState 5).
pub fn request_power_cycle() -> Invocation {
    call(
        &power_service_uri(),
        "RequestPowerStateChange",
        vec![xml::text_element("PowerState", "5")],
    )
    .selector("Name", "pwrmgtsvc:1")
    .selector("SystemName", "systemmc")
    .selector("CreationClassName", "DCIM_CSPowerManagementService")
    .selector("SystemCreationClassName", "DCIM_SPComputerSystem")
}

pub fn lc_wipe() -> Invocation {
    Invocation::new(&DellService::Lc.service_uri(), "LCWipe").selectors(DellService::Lc.selectors())
}

/// The ReturnValue if it is one of `accepted`, `ApplyRejected` otherwise.
pub fn expect_status(
    result: &Element,
    target: &str,
    invocation: &Invocation,
    accepted: &[&str],
) -> Result<String, FirmwareError> {
    let status = wsman::return_value(result, &invocation.method)?;
    if accepted.contains(&status.as_str()) {
        Ok(status)
    } else {
        Err(rejected(target, invocation, status))
    }
}

/// Fails only on the generic failure status.
pub fn reject_failed(
    result: &Element,
    target: &str,
    invocation: &Invocation,
) -> Result<String, FirmwareError> {
    let status = wsman::return_value(result, &invocation.method)?;
    if status == STATUS_FAILED {
        Err(rejected(target, invocation, status))
    } else {
        Ok(status)
    }
}

fn rejected(target: &str, invocation: &Invocation, code: String) -> FirmwareError {
    FirmwareError::ApplyRejected {
        target: target.to_string(),
        operation: invocation.method.clone(),
        code,
    }
}

pub fn reboot_required(result: &Element) -> bool {
    xml::find(result, "RebootRequired")
        .and_then(|e| e.get_text())
        .is_some_and(|t| t.trim() == "Yes")
}
