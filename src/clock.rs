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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::FirmwareError;

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Source of the fixed-interval waits used for retry and job polling.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Block for `duration`, or less if `cancel` fires first.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken);
}

/// Real wall clock. Sleeps in short slices so a cancellation is noticed
/// without waiting out a whole poll interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        let mut remaining = duration;
        while !remaining.is_zero() && !cancel.is_cancelled() {
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration, _cancel: &CancellationToken) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

/// Shared flag a caller flips to abandon a long running operation. Clones
/// observe the same flag.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Clock and cancellation token together. Adapters call `checkpoint`
/// before every round trip and `wait` for every backoff.
#[derive(Debug, Clone)]
pub struct Pacer {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Default for Pacer {
    fn default() -> Self {
        Pacer::new(Arc::new(SystemClock), CancellationToken::new())
    }
}

impl Pacer {
    pub fn new(clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Pacer { clock, cancel }
    }

    pub fn checkpoint(&self) -> Result<(), FirmwareError> {
        if self.cancel.is_cancelled() {
            Err(FirmwareError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn wait(&self, duration: Duration) -> Result<(), FirmwareError> {
        self.checkpoint()?;
        self.clock.sleep(duration, &self.cancel);
        self.checkpoint()
    }
}
