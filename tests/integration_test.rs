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
/// End to end runs of every vendor adapter through the public API, against
/// in-memory controllers serving the captured responses in src/model/testdata.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{anyhow, Context};
use firmware_config::{
    ipmi::{IpmiSession, PowerAction, PowerState, RawResponse},
    model::cisco::BOOT_ORDER,
    wsman::{Invocation, PullResponse, WsmanClient},
    ApplyOutcome, CancellationToken, ClientPool, Compressor, Endpoint, ErrorKind, FirmwareConfig,
    FirmwareError, ManualClock, XmlApi,
};
use xmltree::Element;

fn parse(text: &str) -> Result<Element, FirmwareError> {
    Element::parse(text.as_bytes()).map_err(|e| FirmwareError::CodecError(e.to_string()))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn endpoint() -> Endpoint {
    Endpoint::new("10.0.0.1", "admin", "password")
}

#[derive(Clone, Default)]
struct Cimc {
    requests: Arc<Mutex<Vec<String>>>,
}

impl XmlApi for Cimc {
    fn request(&self, document: &Element) -> Result<Element, FirmwareError> {
        lock(&self.requests).push(document.name.clone());
        let class = document.attributes.get("classId").map(String::as_str);
        let text = match (document.name.as_str(), class) {
            ("aaaLogin", _) => include_str!("../src/model/testdata/cisco_login.xml"),
            ("configResolveClass", Some("biosSettings")) => {
                include_str!("../src/model/testdata/cisco_bios_settings.xml")
            }
            ("configResolveClass", Some("lsbootDef")) => {
                include_str!("../src/model/testdata/cisco_boot_order.xml")
            }
            ("configConfMo", _) => r#"<configConfMo response="yes"/>"#,
            ("aaaLogout", _) => r#"<aaaLogout response="yes" outStatus="success"/>"#,
            (other, _) => return Err(FirmwareError::CodecError(format!("unexpected {other}"))),
        };
        parse(text)
    }
}

#[derive(Clone, Default)]
struct Idrac {
    methods: Arc<Mutex<Vec<String>>>,
}

impl WsmanClient for Idrac {
    fn enumerate(&self, resource_uri: &str) -> Result<Option<String>, FirmwareError> {
        Ok(Some(resource_uri.to_string()))
    }

    fn pull(&self, resource_uri: &str, _context: &str) -> Result<PullResponse, FirmwareError> {
        let text = match resource_uri.rsplit('/').next() {
            Some("DCIM_BIOSEnumeration") => {
                include_str!("../src/model/testdata/dell_bios_enumeration.xml")
            }
            Some("DCIM_LCEnumeration") => {
                include_str!("../src/model/testdata/dell_lc_enumeration.xml")
            }
            Some("DCIM_iDRACCardEnumeration") => {
                include_str!("../src/model/testdata/dell_idrac_enumeration.xml")
            }
            Some("DCIM_NICEnumeration") => {
                include_str!("../src/model/testdata/dell_nic_enumeration.xml")
            }
            Some("DCIM_BootSourceSetting") => {
                include_str!("../src/model/testdata/dell_boot_sources.xml")
            }
            Some("DCIM_LifecycleJob") => {
                include_str!("../src/model/testdata/dell_lifecycle_jobs.xml")
            }
            _ => return Err(FirmwareError::CodecError(resource_uri.to_string())),
        };
        let items = parse(text)?
            .children
            .into_iter()
            .filter_map(|n| n.as_element().cloned())
            .collect();
        Ok(PullResponse {
            items,
            context: None,
        })
    }

    fn invoke(&self, invocation: &Invocation) -> Result<Element, FirmwareError> {
        lock(&self.methods).push(invocation.method.clone());
        let text = match invocation.method.as_str() {
            "SetAttributes" => include_str!("../src/model/testdata/dell_set_attributes.xml"),
            "CreateTargetedConfigJob" => include_str!("../src/model/testdata/dell_create_job.xml"),
            _ => "<Output><ReturnValue>0</ReturnValue></Output>",
        };
        parse(text)
    }
}

#[derive(Default)]
struct ImmState {
    files: HashMap<String, Vec<u8>>,
    handles: Vec<String>,
    power: Vec<PowerAction>,
}

/// Serves the OEM file commands out of a map of file contents.
#[derive(Clone, Default)]
struct Imm(Arc<Mutex<ImmState>>);

fn le32(data: &[u8], at: usize) -> usize {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as usize
}

impl IpmiSession for Imm {
    fn raw_command(
        &mut self,
        netfn: u8,
        command: u8,
        data: &[u8],
    ) -> Result<RawResponse, FirmwareError> {
        assert_eq!((netfn, command), (0x2e, 0x90));
        let mut s = lock(&self.0);
        let mut out = data[..3].to_vec();
        match data[3] {
            // open, file name after the mode arguments
            0x01 => {
                let name: Vec<u8> = data[12..].iter().copied().take_while(|b| *b != 0).collect();
                let name = String::from_utf8_lossy(&name).into_owned();
                if data[4] == 0x03 {
                    s.files.insert(name.clone(), Vec::new());
                }
                s.handles.push(name);
                out.extend_from_slice(&(s.handles.len() as u32).to_le_bytes());
            }
            // size
            0x06 => {
                let name = String::from_utf8_lossy(&data[4..]).into_owned();
                let size = s.files.get(&name).map_or(0, Vec::len) as u32;
                out.extend_from_slice(&size.to_le_bytes());
            }
            // read
            0x02 => {
                let file = &s.files[&s.handles[le32(data, 4) - 1]];
                let offset = le32(data, 8).min(file.len());
                let len = u16::from_le_bytes([data[12], data[13]]) as usize;
                let end = (offset + len).min(file.len());
                out.extend_from_slice(&((end - offset) as u16).to_le_bytes());
                out.extend_from_slice(&file[offset..end]);
            }
            // write
            0x03 => {
                let name = s.handles[le32(data, 4) - 1].clone();
                let offset = le32(data, 8);
                let file = s.files.entry(name).or_default();
                file.truncate(offset);
                file.extend_from_slice(&data[12..]);
            }
            // close
            0x05 => {}
            _ => {
                return Ok(RawResponse {
                    code: 0xc1,
                    data: vec![],
                })
            }
        }
        Ok(RawResponse { code: 0, data: out })
    }

    fn power_state(&mut self) -> Result<PowerState, FirmwareError> {
        Ok(PowerState::On)
    }

    fn set_power(&mut self, action: PowerAction) -> Result<(), FirmwareError> {
        lock(&self.0).power.push(action);
        Ok(())
    }
}

struct Identity;

impl Compressor for Identity {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError> {
        Ok(data.to_vec())
    }
}

fn cisco_pool(cimc: &Cimc, cancel: CancellationToken) -> Result<ClientPool, anyhow::Error> {
    let cimc = cimc.clone();
    let connector = move |_: &Endpoint| -> Result<Box<dyn XmlApi>, FirmwareError> {
        Ok(Box::new(cimc.clone()))
    };
    Ok(ClientPool::builder()
        .xml_api(Arc::new(connector))
        .cancellation(cancel)
        .build()?)
}

fn client(pool: &ClientPool, vendor: &str) -> Result<Box<dyn FirmwareConfig>, anyhow::Error> {
    pool.create(vendor, endpoint())?
        .ok_or_else(|| anyhow!("no adapter for {vendor}"))
}

#[test]
fn test_cisco() -> Result<(), anyhow::Error> {
    let cimc = Cimc::default();
    let bmc = client(&cisco_pool(&cimc, CancellationToken::new())?, "cisco")?;

    let mut options = bmc.get_fw_options()?;
    options
        .get_mut("IntelTurboBoostTech")
        .context("IntelTurboBoostTech")?
        .set_new_value("disabled");
    options
        .get_mut(BOOT_ORDER)
        .context(BOOT_ORDER)?
        .set_new_value(vec!["hdd", "lan"]);

    let outcome = bmc.set_fw_options(&mut options)?;
    assert!(outcome.is_success());
    assert_eq!(outcome.batches.len(), 2);
    assert_eq!(bmc.apply_settings(&options)?, ApplyOutcome::AwaitingReboot);

    // nothing left to write
    let requests = lock(&cimc.requests).len();
    assert!(bmc.set_fw_options(&mut options)?.is_noop());
    assert_eq!(lock(&cimc.requests).len(), requests);
    Ok(())
}

#[test]
fn test_cancelled_before_first_request() -> Result<(), anyhow::Error> {
    let cimc = Cimc::default();
    let cancel = CancellationToken::new();
    let bmc = client(&cisco_pool(&cimc, cancel.clone())?, "Cisco")?;
    cancel.cancel();

    let err = bmc
        .get_fw_options()
        .err()
        .context("expected cancellation")?;
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(lock(&cimc.requests).is_empty());
    Ok(())
}

#[test]
fn test_dell() -> Result<(), anyhow::Error> {
    let idrac = Idrac::default();
    let clock = ManualClock::new();
    let fake = idrac.clone();
    let connector = move |_: &Endpoint| -> Result<Box<dyn WsmanClient>, FirmwareError> {
        Ok(Box::new(fake.clone()))
    };
    let pool = ClientPool::builder()
        .wsman(Arc::new(connector))
        .clock(Arc::new(clock.clone()))
        .build()?;
    let bmc = client(&pool, "dell")?;

    let mut options = bmc.get_fw_options()?;
    options
        .get_mut("BIOS.ProcSettings.LogicalProc")
        .context("LogicalProc")?
        .set_new_value("Disabled");
    let outcome = bmc.set_fw_options(&mut options)?;
    assert!(outcome.reboot_required());

    let applied = bmc.apply_settings(&options)?;
    assert_eq!(
        applied,
        ApplyOutcome::JobsCompleted {
            jobs: vec!["JID_001300720080".to_string()],
            failed: vec![],
        }
    );
    // the job was already complete on the first poll
    assert!(clock.sleeps().is_empty());
    assert_eq!(
        *lock(&idrac.methods),
        vec!["SetAttributes", "CreateTargetedConfigJob"]
    );
    Ok(())
}

#[test]
fn test_ibm() -> Result<(), anyhow::Error> {
    let imm = Imm::default();
    lock(&imm.0).files.insert(
        "config.efi".to_string(),
        include_bytes!("../src/model/testdata/ibm_config.xml").to_vec(),
    );
    let fake = imm.clone();
    let connector = move |_: &Endpoint| -> Result<Box<dyn IpmiSession>, FirmwareError> {
        Ok(Box::new(fake.clone()))
    };
    let pool = ClientPool::builder()
        .ipmi(Arc::new(connector))
        .codec(Arc::new(Identity))
        .clock(Arc::new(ManualClock::new()))
        .build()?;
    let bmc = client(&pool, "ibm")?;

    let mut options = bmc.get_fw_options()?;
    options
        .get_mut("uEFI.TurboMode")
        .context("TurboMode")?
        .set_new_value("Enable");
    let outcome = bmc.set_fw_options(&mut options)?;
    assert!(outcome.reboot_required());

    let update = lock(&imm.0)
        .files
        .get("asu_update.efi")
        .cloned()
        .context("no update written")?;
    let update = String::from_utf8(update)?;
    assert!(update.starts_with("<configurations"));
    assert!(update.contains("<label>Enable</label>"));

    assert_eq!(bmc.reboot_system(&options)?, ApplyOutcome::PowerCycled);
    assert_eq!(lock(&imm.0).power, vec![PowerAction::Reset]);
    Ok(())
}

#[test]
fn test_unknown_vendor() -> Result<(), anyhow::Error> {
    let pool = ClientPool::builder().build()?;
    assert!(pool.create("supermicro", endpoint())?.is_none());

    // known vendors without their collaborators are a configuration error
    let err = pool
        .create("ibm", endpoint())
        .err()
        .context("expected a missing connector")?;
    assert_eq!(err.kind(), ErrorKind::Transport);
    Ok(())
}
