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

//! Decides which settings need writing and drives one batched write per
//! strategy. Vendor adapters only supply the wire format.

use std::fmt;

use tracing::{info, warn};

use crate::model::{FirmwareOption, OptionValue, Options};
use crate::FirmwareError;

/// What the controller said about an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    /// The controller asked for a reboot to activate the batch.
    pub reboot_required: bool,
    /// Asynchronous job created to commit the batch, if any.
    pub job: Option<String>,
}

/// Vendor half of a batched write.
pub trait WriteStrategy {
    type Fragment;

    /// Human readable name of what this batch writes to, for logs and results.
    fn target(&self) -> String;

    /// Does this batch own the record?
    fn selects(&self, name: &str, option: &FirmwareOption) -> bool;

    /// Wire fragment setting `option` to `value`.
    fn fragment(
        &self,
        name: &str,
        option: &FirmwareOption,
        value: &OptionValue,
    ) -> Result<Self::Fragment, FirmwareError>;

    /// Does changing this record need a reboot regardless of what the
    /// controller answers?
    fn requires_reboot(&self, _option: &FirmwareOption) -> bool {
        false
    }

    /// Send all fragments as one request. A controller refusal must be
    /// reported as `FirmwareError::ApplyRejected`.
    fn submit(&mut self, fragments: Vec<Self::Fragment>) -> Result<Submission, FirmwareError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    Accepted,
    Rejected { code: String },
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Accepted => write!(f, "accepted"),
            BatchStatus::Rejected { code } => write!(f, "rejected ({code})"),
        }
    }
}

/// One submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub target: String,
    pub settings: Vec<String>,
    pub status: BatchStatus,
    pub reboot_required: bool,
    pub job: Option<String>,
}

/// Everything `set_fw_options` submitted. Empty when there was nothing to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOutcome {
    pub batches: Vec<BatchResult>,
}

impl SetOutcome {
    pub fn record(&mut self, batch: Option<BatchResult>) {
        self.batches.extend(batch);
    }

    /// Nothing needed writing, no request was made.
    pub fn is_noop(&self) -> bool {
        self.batches.is_empty()
    }

    /// Every submitted batch was accepted (trivially true for a no-op).
    pub fn is_success(&self) -> bool {
        self.batches
            .iter()
            .all(|b| b.status == BatchStatus::Accepted)
    }

    /// Some accepted change only takes effect after a reboot or activation.
    pub fn reboot_required(&self) -> bool {
        self.batches
            .iter()
            .any(|b| b.status == BatchStatus::Accepted && b.reboot_required)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &BatchResult> {
        self.batches
            .iter()
            .filter(|b| b.status != BatchStatus::Accepted)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().filter_map(|b| b.job.as_deref())
    }
}

/// How `apply_settings` / `reboot_system` left the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing was requested or pending.
    Idle,
    /// Settings are stored on the controller and activate on next boot.
    AwaitingReboot,
    /// Commit jobs ran to completion. `failed` lists targets whose job could
    /// not be created or finished in a failed state.
    JobsCompleted {
        jobs: Vec<String>,
        failed: Vec<String>,
    },
    /// The host was power cycled.
    PowerCycled,
}

/// Diff every record `strategy` owns and submit the changed ones as one
/// batch.
///
/// Returns None, without calling `submit`, when nothing changed. `pending`
/// is only updated once the controller accepted the batch; a rejected batch
/// leaves the records exactly as they were read.
pub fn reconcile<S: WriteStrategy>(
    options: &mut Options,
    strategy: &mut S,
) -> Result<Option<BatchResult>, FirmwareError> {
    let mut fragments = Vec::new();
    let mut settings = Vec::new();
    let mut reboot_required = false;

    for (name, option) in options.iter() {
        if !strategy.selects(name, option) {
            continue;
        }
        let Some(value) = option.requested_change() else {
            continue;
        };
        fragments.push(strategy.fragment(name, option, value)?);
        reboot_required |= strategy.requires_reboot(option);
        settings.push(name.clone());
    }

    if fragments.is_empty() {
        return Ok(None);
    }

    let target = strategy.target();
    match strategy.submit(fragments) {
        Ok(submission) => {
            for name in &settings {
                if let Some(option) = options.get_mut(name) {
                    option.commit_pending();
                }
            }
            info!("{target} accepted {} setting(s)", settings.len());
            Ok(Some(BatchResult {
                target,
                settings,
                status: BatchStatus::Accepted,
                reboot_required: reboot_required || submission.reboot_required,
                job: submission.job,
            }))
        }
        Err(FirmwareError::ApplyRejected { code, operation, .. }) => {
            warn!("{target} rejected {operation} for {settings:?}: status {code}");
            Ok(Some(BatchResult {
                target,
                settings,
                status: BatchStatus::Rejected { code },
                reboot_required: false,
                job: None,
            }))
        }
        Err(e) => Err(e),
    }
}
