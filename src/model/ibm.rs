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

//! ASU settings documents exchanged with the IMM as files.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xmltree::Element;

use super::{FirmwareOption, OptionValue, Options, VendorMetadata};
use crate::{xml, FirmwareError};

/// Current settings, read from the IMM.
pub const CONFIG_FILE: &str = "config.efi";
/// Requested changes, written to the IMM.
pub const UPDATE_FILE: &str = "asu_update.efi";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbmRoute {
    pub config_id: String,
    pub group_id: String,
    pub setting_id: String,
    /// `ID` of the `instance` elements in an update
    pub instance: String,
    /// Some choice of the setting is marked reset-required
    pub reboot_required: bool,
}

/// Every `config/group/setting` of a decompressed `config.efi`, named
/// `{config ID}.{mriName}`.
pub fn parse_config(data: &[u8]) -> Result<Options, FirmwareError> {
    let root = xml::parse(data, CONFIG_FILE)?;
    let mut options = Options::new();
    for config in xml::descendants(&root, "config") {
        let Some(config_id) = xml::attr(config, "ID") else {
            debug!("Skipping config without ID");
            continue;
        };
        for group in xml::descendants(config, "group") {
            let group_id = xml::attr(group, "ID").unwrap_or_default();
            for setting in xml::descendants(group, "setting") {
                if let Some((name, option)) = parse_setting(config_id, group_id, setting) {
                    options.insert(name, option);
                }
            }
        }
    }
    Ok(options)
}

fn parse_setting(
    config_id: &str,
    group_id: &str,
    setting: &Element,
) -> Option<(String, FirmwareOption)> {
    let setting_id = xml::attr(setting, "ID").unwrap_or_default();
    let Some(mri_name) = xml::child_text(setting, "mriName") else {
        debug!("Skipping {config_id}/{group_id}/{setting_id} without mriName");
        return None;
    };
    let is_list = setting.get_child("list_data").is_some();

    let mut possible = Vec::new();
    let mut selected: Vec<(u32, String)> = Vec::new();
    let mut default = None;
    let mut reboot_required = false;
    for choice in xml::descendants(setting, "choice") {
        let Some(label) = xml::child_text(choice, "label") else {
            continue;
        };
        if let Some(instance) = choice.get_child("instance") {
            let order = xml::attr(instance, "order")
                .and_then(|o| o.parse().ok())
                .unwrap_or(u32::MAX);
            selected.push((order, label.clone()));
        }
        if xml::attr(choice, "default") == Some("true") {
            default = Some(label.clone());
        }
        if xml::attr(choice, "reset-required") == Some("true") {
            reboot_required = true;
        }
        possible.push(label);
    }
    selected.sort_by_key(|(order, _)| *order);

    let current = if is_list {
        Some(OptionValue::List(
            selected.into_iter().map(|(_, label)| label).collect(),
        ))
    } else {
        selected.pop().map(|(_, label)| OptionValue::Scalar(label))
    };

    let route = IbmRoute {
        config_id: config_id.to_string(),
        group_id: group_id.to_string(),
        setting_id: setting_id.to_string(),
        instance: String::new(),
        reboot_required,
    };
    let option = FirmwareOption::new(VendorMetadata::Ibm(route), is_list)
        .with_current(current)
        .with_default(default.map(OptionValue::Scalar))
        .with_possible(possible);
    Some((format!("{config_id}.{mri_name}"), option))
}

/// A fresh `ASU-<48 bit>-<32 bit>-<64 bit>-0` update identifier.
pub fn update_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "ASU-{:x}-{:x}-{:x}-0",
        rng.gen::<u64>() & 0xffff_ffff_ffff,
        rng.gen::<u32>(),
        rng.gen::<u64>()
    )
}

/// The `config/group/setting` path selecting `value`.
pub fn setting_fragment(route: &IbmRoute, value: &OptionValue, is_list: bool) -> Element {
    let instance = route.instance.as_str();
    let mut data = Element::new(if is_list { "list_data" } else { "enumerate_data" });
    for (i, label) in value.labels().into_iter().enumerate() {
        let mut choice = Element::new("choice");
        xml::push(&mut choice, xml::text_element("label", label));
        let mut selected = xml::element("instance", &[("ID", instance)]);
        if is_list {
            selected
                .attributes
                .insert("order".to_string(), (i + 1).to_string());
        }
        xml::push(&mut choice, selected);
        xml::push(&mut data, choice);
    }

    let mut setting = xml::element("setting", &[("ID", route.setting_id.as_str())]);
    xml::push(&mut setting, data);
    let mut group = xml::element("group", &[("ID", route.group_id.as_str())]);
    xml::push(&mut group, setting);
    let mut config = xml::element("config", &[("ID", route.config_id.as_str())]);
    xml::push(&mut config, group);
    config
}

/// The `configurations` update document carrying `fragments`.
pub fn update_document(id: &str, fragments: Vec<Element>) -> Element {
    let mut root = xml::element(
        "configurations",
        &[("ID", id), ("type", "update"), ("update", "ASU Client")],
    );
    for f in fragments {
        xml::push(&mut root, f);
    }
    root
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> Options {
        parse_config(include_bytes!("testdata/ibm_config.xml")).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let options = config();
        // SerialPort has no mriName
        assert_eq!(
            options.keys().collect::<Vec<_>>(),
            vec![
                "BootOrder.BootOrder",
                "uEFI.ProcessorHyperThreading",
                "uEFI.TurboMode"
            ]
        );

        let ht = &options["uEFI.ProcessorHyperThreading"];
        assert!(!ht.is_list());
        assert_eq!(ht.current(), Some(&"Enable".into()));
        assert_eq!(ht.default_value(), Some(&"Enable".into()));
        assert_eq!(ht.possible(), ["Enable", "Disable"]);
        let VendorMetadata::Ibm(route) = ht.metadata() else {
            panic!("not an IBM route");
        };
        assert_eq!(route.group_id, "Processors");
        assert_eq!(route.setting_id, "HyperThreading");
        assert!(!route.reboot_required);

        let turbo = &options["uEFI.TurboMode"];
        assert_eq!(turbo.current(), Some(&"Disable".into()));
        assert!(matches!(
            turbo.metadata(),
            VendorMetadata::Ibm(IbmRoute {
                reboot_required: true,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_list_in_instance_order() {
        let boot = &config()["BootOrder.BootOrder"];
        assert!(boot.is_list());
        assert_eq!(
            boot.current(),
            Some(&vec!["Hard Disk 0", "CD/DVD Rom"].into())
        );
        assert_eq!(boot.possible().len(), 3);
        assert_eq!(boot.pending(), None);
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_config(b"\x00\x01not xml").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[test]
    fn test_update_id_format() {
        let id = update_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "ASU");
        assert!(parts[1].len() <= 12);
        assert!(parts[2].len() <= 8);
        assert!(parts[3].len() <= 16);
        assert_eq!(parts[4], "0");
        assert!(parts[1..4]
            .iter()
            .all(|p| u64::from_str_radix(p, 16).is_ok()));
        assert_ne!(update_id(), id);
    }

    #[test]
    fn test_update_document() {
        let options = config();
        let VendorMetadata::Ibm(boot) = options["BootOrder.BootOrder"].metadata() else {
            panic!("not an IBM route");
        };
        let VendorMetadata::Ibm(ht) = options["uEFI.ProcessorHyperThreading"].metadata() else {
            panic!("not an IBM route");
        };
        let doc = update_document(
            "ASU-1-2-3-0",
            vec![
                setting_fragment(ht, &"Disable".into(), false),
                setting_fragment(boot, &vec!["PXE Network", "Hard Disk 0"].into(), true),
            ],
        );
        assert_eq!(xml::attr(&doc, "type"), Some("update"));
        assert_eq!(xml::attr(&doc, "update"), Some("ASU Client"));

        let configs: Vec<&Element> = xml::children(&doc).collect();
        assert_eq!(configs.len(), 2);
        assert_eq!(xml::attr(configs[0], "ID"), Some("uEFI"));
        let scalar = xml::find(configs[0], "enumerate_data").unwrap();
        assert_eq!(xml::descendants(scalar, "choice").len(), 1);
        assert_eq!(xml::attr(xml::find(scalar, "instance").unwrap(), "order"), None);

        let list = xml::find(configs[1], "list_data").unwrap();
        let orders: Vec<(String, &str)> = xml::descendants(list, "choice")
            .into_iter()
            .map(|c| {
                (
                    xml::child_text(c, "label").unwrap(),
                    xml::attr(c.get_child("instance").unwrap(), "order").unwrap(),
                )
            })
            .collect();
        assert_eq!(
            orders,
            vec![
                ("PXE Network".to_string(), "1"),
                ("Hard Disk 0".to_string(), "2")
            ]
        );
    }
}
