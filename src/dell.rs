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
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, warn};
use xmltree::Element;

use crate::{
    clock::Pacer,
    jobs::{self, Job, JobSource},
    model::{
        dell::{self, DellRoute, DellService, STATUS_JOB_CREATED, STATUS_OK},
        FirmwareOption, OptionValue, Options, VendorMetadata,
    },
    reconcile::{reconcile, BatchResult, BatchStatus, Submission, WriteStrategy},
    wsman::{self, Invocation, WsmanClient},
    ApplyOutcome, ErrorKind, FirmwareConfig, FirmwareError, SetOutcome, Vendor,
};

pub struct Bmc {
    client: Box<dyn WsmanClient>,
    pacer: Pacer,
    poll_interval: Duration,
}

impl Bmc {
    pub fn new(client: Box<dyn WsmanClient>, pacer: Pacer, poll_interval: Duration) -> Bmc {
        Bmc {
            client,
            pacer,
            poll_interval,
        }
    }

    fn invoke(&self, invocation: &Invocation) -> Result<Element, FirmwareError> {
        self.pacer.checkpoint()?;
        debug!(
            "TX {} on {} {:?}",
            invocation.method, invocation.resource_uri, invocation.selectors
        );
        let result = self.client.invoke(invocation)?;
        debug!("RX {} {}", invocation.method, result.name);
        Ok(result)
    }

    fn enumerate(&self, resource_uri: &str) -> Result<Vec<Element>, FirmwareError> {
        wsman::enumerate_all(self.client.as_ref(), resource_uri, &self.pacer)
    }

    /// Every NIC FQDD that has attributes.
    fn nic_fqdds(options: &Options) -> BTreeSet<String> {
        options
            .values()
            .filter_map(|o| match o.metadata() {
                VendorMetadata::Dell(DellRoute::Attribute {
                    service: DellService::Nic,
                    fqdd: Some(fqdd),
                    ..
                }) => Some(fqdd.clone()),
                _ => None,
            })
            .collect()
    }

    fn boot_types(options: &Options) -> BTreeSet<String> {
        options
            .values()
            .filter_map(|o| match o.metadata() {
                VendorMetadata::Dell(DellRoute::Boot { boot_type, .. }) => Some(boot_type.clone()),
                _ => None,
            })
            .collect()
    }

    /// Config job targets that have something requested or queued. LC and
    /// iDRAC attributes are committed by their own jobs during the write.
    fn commit_targets(options: &Options) -> BTreeMap<String, DellService> {
        let mut targets = BTreeMap::new();
        for option in options.values() {
            if option.new_value().is_none() && !option.has_pending() {
                continue;
            }
            match option.metadata() {
                VendorMetadata::Dell(DellRoute::Attribute {
                    service: DellService::Bios,
                    ..
                })
                | VendorMetadata::Dell(DellRoute::Boot { .. }) => {
                    targets.insert(dell::BIOS_TARGET.to_string(), DellService::Bios);
                }
                VendorMetadata::Dell(DellRoute::Attribute {
                    service: DellService::Nic,
                    fqdd: Some(fqdd),
                    ..
                }) => {
                    targets.insert(fqdd.clone(), DellService::Nic);
                }
                _ => {}
            }
        }
        targets
    }

    /// The InstanceID of the created job, None when the controller refused.
    fn create_commit_job(
        &self,
        service: DellService,
        target: &str,
    ) -> Result<Option<String>, FirmwareError> {
        let invocation = dell::create_targeted_config_job(service, target, true);
        let result = self.invoke(&invocation)?;
        match dell::expect_status(&result, target, &invocation, &[STATUS_OK, STATUS_JOB_CREATED]) {
            Ok(_) => {
                let job = wsman::response_selector(&result, "InstanceID");
                if job.is_none() {
                    warn!("Config job for {target} was accepted without an InstanceID");
                }
                Ok(job)
            }
            Err(e) if e.kind() == ErrorKind::ApplyRejected => {
                warn!("{e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn force_power_cycle(&self) -> Result<(), FirmwareError> {
        let invocation = dell::request_power_cycle();
        let result = self.invoke(&invocation)?;
        dell::expect_status(&result, "host", &invocation, &[STATUS_OK])?;
        info!("Forced power cycle");
        Ok(())
    }
}

impl JobSource for Bmc {
    fn jobs(&self) -> Result<Vec<Job>, FirmwareError> {
        Ok(self
            .enumerate(&dell::lifecycle_job_uri())?
            .iter()
            .filter_map(dell::parse_job)
            .collect())
    }
}

impl FirmwareConfig for Bmc {
    fn vendor(&self) -> Vendor {
        Vendor::Dell
    }

    fn get_fw_options(&self) -> Result<Options, FirmwareError> {
        let mut options = Options::new();
        for service in DellService::ALL {
            let items = self.enumerate(&service.enumeration_uri())?;
            options.extend(
                items
                    .iter()
                    .filter_map(|item| dell::parse_attribute(service, item)),
            );
        }
        let boot_sources = self.enumerate(&dell::boot_source_uri())?;
        options.extend(dell::parse_boot_sources(&boot_sources));
        Ok(options)
    }

    fn set_fw_options(&self, options: &mut Options) -> Result<SetOutcome, FirmwareError> {
        let mut outcome = SetOutcome::default();

        for service in [DellService::Bios, DellService::Lc, DellService::IdracCard] {
            let mut batch = AttributeBatch {
                bmc: self,
                service,
                target: service.fixed_target().map(str::to_string),
            };
            outcome.record(reconcile(options, &mut batch)?);
        }
        for fqdd in Bmc::nic_fqdds(options) {
            let mut batch = AttributeBatch {
                bmc: self,
                service: DellService::Nic,
                target: Some(fqdd),
            };
            outcome.record(reconcile(options, &mut batch)?);
        }
        for boot_type in Bmc::boot_types(options) {
            let mut batch = BootBatch {
                bmc: self,
                boot_type,
            };
            outcome.record(reconcile(options, &mut batch)?);
        }
        Ok(outcome)
    }

    fn apply_settings(&self, options: &Options) -> Result<ApplyOutcome, FirmwareError> {
        let targets = Bmc::commit_targets(options);
        if targets.is_empty() {
            return Ok(ApplyOutcome::Idle);
        }

        let mut jobs = Vec::new();
        let mut job_targets = BTreeMap::new();
        let mut failed = Vec::new();
        for (target, service) in targets {
            match self.create_commit_job(service, &target)? {
                Some(job) => {
                    info!("Created config job {job} for {target}");
                    jobs.push(job.clone());
                    job_targets.insert(job, target);
                }
                None => failed.push(target),
            }
        }

        let finished = jobs::wait_for_jobs(self, &jobs, &self.pacer, self.poll_interval)?;
        for job in finished.iter().filter(|j| j.is_failed()) {
            warn!("Config job {job} failed");
            if let Some(target) = job_targets.remove(&job.id) {
                failed.push(target);
            }
        }
        Ok(ApplyOutcome::JobsCompleted { jobs, failed })
    }

    fn reboot_system(&self, options: &Options) -> Result<ApplyOutcome, FirmwareError> {
        let outcome = self.apply_settings(options)?;
        match &outcome {
            ApplyOutcome::JobsCompleted { failed, .. } if !failed.is_empty() => {
                warn!("Could not commit {failed:?}, forcing a power cycle");
                self.force_power_cycle()?;
                Ok(ApplyOutcome::PowerCycled)
            }
            _ => Ok(outcome),
        }
    }

    /// Wipes the lifecycle controller configuration back to factory state.
    fn factory_reset(&self) -> Result<SetOutcome, FirmwareError> {
        let invocation = dell::lc_wipe();
        let result = self.invoke(&invocation)?;
        let target = DellService::Lc.service_uri();
        let status = match dell::expect_status(&result, &target, &invocation, &[STATUS_OK]) {
            Ok(_) => BatchStatus::Accepted,
            Err(FirmwareError::ApplyRejected { code, .. }) => BatchStatus::Rejected { code },
            Err(e) => return Err(e),
        };
        let reboot_required = status == BatchStatus::Accepted;
        Ok(SetOutcome {
            batches: vec![BatchResult {
                target,
                settings: Vec::new(),
                status,
                reboot_required,
                job: None,
            }],
        })
    }
}

/// SetAttributes on one DCIM service, one NIC FQDD at a time for NICs.
struct AttributeBatch<'a> {
    bmc: &'a Bmc,
    service: DellService,
    target: Option<String>,
}

impl WriteStrategy for AttributeBatch<'_> {
    type Fragment = (String, String);

    fn target(&self) -> String {
        match &self.target {
            Some(t) => format!("{} {t}", self.service),
            None => self.service.to_string(),
        }
    }

    fn selects(&self, _name: &str, option: &FirmwareOption) -> bool {
        let VendorMetadata::Dell(DellRoute::Attribute { service, fqdd, .. }) = option.metadata()
        else {
            return false;
        };
        *service == self.service
            && (self.service != DellService::Nic || fqdd.as_ref() == self.target.as_ref())
    }

    fn fragment(
        &self,
        name: &str,
        option: &FirmwareOption,
        value: &OptionValue,
    ) -> Result<(String, String), FirmwareError> {
        let VendorMetadata::Dell(DellRoute::Attribute { wire_name, .. }) = option.metadata() else {
            return Err(FirmwareError::missing("Dell attribute route", name));
        };
        let value = value.as_scalar().ok_or_else(|| FirmwareError::InvalidValue {
            context: "SetAttributes".to_string(),
            field: name.to_string(),
            value: value.to_string(),
        })?;
        Ok((wire_name.clone(), value.to_string()))
    }

    fn submit(&mut self, fragments: Vec<(String, String)>) -> Result<Submission, FirmwareError> {
        let target = self.target();
        let invocation = dell::set_attributes(self.service, self.target.as_deref(), fragments);
        let result = self.bmc.invoke(&invocation)?;
        dell::expect_status(&result, &target, &invocation, &[STATUS_OK])?;
        let reboot_required = dell::reboot_required(&result);

        // LC and iDRAC attributes only stick once their config job ran
        let follow_up = match self.service {
            DellService::Lc => Some(dell::create_config_job(self.service)),
            DellService::IdracCard => Some(
                dell::create_targeted_config_job(self.service, dell::IDRAC_TARGET, false)
                    .namespace(dell::CIM_NAMESPACE),
            ),
            DellService::Bios | DellService::Nic => None,
        };
        let mut job = None;
        if let Some(invocation) = follow_up {
            let result = self.bmc.invoke(&invocation)?;
            dell::expect_status(&result, &target, &invocation, &[STATUS_OK, STATUS_JOB_CREATED])?;
            job = wsman::response_selector(&result, "InstanceID");
        }
        Ok(Submission {
            reboot_required,
            job,
        })
    }
}

/// Enable and reorder one boot list.
struct BootBatch<'a> {
    bmc: &'a Bmc,
    boot_type: String,
}

impl WriteStrategy for BootBatch<'_> {
    type Fragment = Vec<String>;

    fn target(&self) -> String {
        format!("BootOrder{}", self.boot_type)
    }

    fn selects(&self, _name: &str, option: &FirmwareOption) -> bool {
        matches!(
            option.metadata(),
            VendorMetadata::Dell(DellRoute::Boot { boot_type, .. }) if *boot_type == self.boot_type
        )
    }

    fn fragment(
        &self,
        name: &str,
        option: &FirmwareOption,
        value: &OptionValue,
    ) -> Result<Vec<String>, FirmwareError> {
        let VendorMetadata::Dell(DellRoute::Boot { instance_ids, .. }) = option.metadata() else {
            return Err(FirmwareError::missing("Dell boot route", name));
        };
        value
            .labels()
            .into_iter()
            .map(|label| {
                instance_ids
                    .get(label)
                    .cloned()
                    .ok_or_else(|| FirmwareError::InvalidValue {
                        context: "DCIM_BootSourceSetting".to_string(),
                        field: name.to_string(),
                        value: label.to_string(),
                    })
            })
            .collect()
    }

    fn requires_reboot(&self, _option: &FirmwareOption) -> bool {
        true
    }

    fn submit(&mut self, fragments: Vec<Vec<String>>) -> Result<Submission, FirmwareError> {
        let target = self.target();
        let sources: Vec<String> = fragments.into_iter().flatten().collect();

        let enable = dell::change_boot_source_state(&self.boot_type, &sources);
        let result = self.bmc.invoke(&enable)?;
        dell::reject_failed(&result, &target, &enable)?;

        let order = dell::change_boot_order(&self.boot_type, &sources);
        let result = self.bmc.invoke(&order)?;
        dell::expect_status(&result, &target, &order, &[STATUS_OK])?;
        Ok(Submission {
            reboot_required: true,
            job: None,
        })
    }
}
