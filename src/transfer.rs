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

//! File transfer to and from the IMM over the raw IPMI command primitive.
//!
//! Every request is one OEM command frame (netfn 0x2e, cmd 0x90) starting
//! with the IBM enterprise number, followed by a sub-command byte and its
//! arguments. Multi-byte integers are little-endian. Files move in chunks
//! of at most `TransferConfig::chunk_size` bytes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Pacer;
use crate::ipmi::{IpmiSession, PowerAction, PowerState, RawResponse};
use crate::network::{Connector, Endpoint};
use crate::{ErrorKind, FirmwareError};

pub const IMM_NETFN: u8 = 0x2e;
pub const IMM_COMMAND: u8 = 0x90;
pub const IBM_ENTERPRISE: [u8; 3] = [0x4d, 0x4f, 0x00];

pub const OPEN_COMMAND: u8 = 0x01;
pub const READ_COMMAND: u8 = 0x02;
pub const WRITE_COMMAND: u8 = 0x03;
pub const CLOSE_COMMAND: u8 = 0x05;
pub const SIZE_COMMAND: u8 = 0x06;

const OPEN_READ_ARGS: [u8; 8] = [0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10];
const OPEN_WRITE_ARGS: [u8; 2] = [0x03, 0x01];
const OPEN_WRITE_TRAILER: [u8; 2] = [0x01, 0x10];
// Open frames are zero padded to this length, enterprise number included.
const OPEN_FRAME_LEN: usize = 38;

// Response layout: enterprise echo, then the payload.
const VALUE_OFFSET: usize = 3;
const READ_DATA_OFFSET: usize = 5;

pub const DEFAULT_CHUNK_SIZE: u16 = 0xc8;

/// Tuning for the transfer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Largest payload moved by one read or write command
    pub chunk_size: u16,
    pub open_attempts: u32,
    pub open_retry_interval: Duration,
    /// How often a whole read cycle is repeated while the file comes back empty
    pub read_attempts: u32,
    pub read_retry_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            open_attempts: 6,
            open_retry_interval: Duration::from_secs(10),
            read_attempts: 10,
            read_retry_interval: Duration::from_secs(10),
        }
    }
}

/// Compression applied to files on the IMM. Must round trip arbitrary bytes.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Write-only, the final size has to be announced up front.
    Write { size: u32 },
}

/// Handle of an open file on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub u32);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

pub struct FileChannel {
    endpoint: Endpoint,
    connector: Arc<dyn Connector<dyn IpmiSession>>,
    session: Option<Box<dyn IpmiSession>>,
    config: TransferConfig,
    pacer: Pacer,
}

impl fmt::Debug for FileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChannel")
            .field("host", &self.endpoint.host)
            .field("connected", &self.session.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl FileChannel {
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector<dyn IpmiSession>>,
        config: TransferConfig,
        pacer: Pacer,
    ) -> Self {
        FileChannel {
            endpoint,
            connector,
            session: None,
            config,
            pacer,
        }
    }

    /// Drops the current session, if any, and opens a fresh one.
    pub fn reconnect(&mut self) -> Result<(), FirmwareError> {
        self.pacer.checkpoint()?;
        self.session = None;
        debug!("Opening IPMI session to {}", self.endpoint.host);
        self.session = Some(self.connector.connect(&self.endpoint)?);
        Ok(())
    }

    /// The live session, connecting first if there is none.
    pub fn session(&mut self) -> Result<&mut dyn IpmiSession, FirmwareError> {
        if self.session.is_none() {
            self.reconnect()?;
        }
        match self.session.as_deref_mut() {
            Some(s) => Ok(s),
            None => Err(FirmwareError::TransportError {
                operation: "connect".to_string(),
                message: format!("no IPMI session to {}", self.endpoint.host),
            }),
        }
    }

    // One OEM round trip. The completion code is left to the caller.
    fn command(
        &mut self,
        operation: &'static str,
        sub_command: u8,
        args: &[u8],
    ) -> Result<RawResponse, FirmwareError> {
        self.pacer.checkpoint()?;
        self.exchange(operation, sub_command, args)
    }

    // command without the cancellation checkpoint
    fn exchange(
        &mut self,
        operation: &'static str,
        sub_command: u8,
        args: &[u8],
    ) -> Result<RawResponse, FirmwareError> {
        let mut frame = Vec::with_capacity(IBM_ENTERPRISE.len() + 1 + args.len());
        frame.extend_from_slice(&IBM_ENTERPRISE);
        frame.push(sub_command);
        frame.extend_from_slice(args);
        debug!("TX IMM {operation} {} bytes", frame.len());
        let response = self
            .session()?
            .raw_command(IMM_NETFN, IMM_COMMAND, &frame)?;
        debug!(
            "RX IMM {operation} code {:#04x} {} bytes",
            response.code,
            response.data.len()
        );
        Ok(response)
    }

    fn checked(
        &mut self,
        operation: &'static str,
        sub_command: u8,
        args: &[u8],
    ) -> Result<Vec<u8>, FirmwareError> {
        let response = self.command(operation, sub_command, args)?;
        if response.code != 0 {
            return Err(FirmwareError::CompletionCode {
                operation,
                code: response.code,
            });
        }
        Ok(response.data)
    }

    /// Size in bytes of a file on the controller.
    pub fn size(&mut self, name: &str) -> Result<u32, FirmwareError> {
        let data = self.checked("size", SIZE_COMMAND, name.as_bytes())?;
        read_u32(&data, "size")
    }

    /// Opens `name`, reconnecting and retrying while the controller refuses.
    pub fn open(&mut self, name: &str, mode: OpenMode) -> Result<FileHandle, FirmwareError> {
        let args = open_args(name, mode);
        let attempts = self.config.open_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!("open {name} attempt {} of {attempts} failed: {last_error}", attempt - 1);
                self.pacer.wait(self.config.open_retry_interval)?;
                // the session may have timed out
                if let Err(e) = self.reconnect() {
                    if e.kind() == ErrorKind::Cancelled {
                        return Err(e);
                    }
                    last_error = e.to_string();
                    continue;
                }
            }
            match self.command("open", OPEN_COMMAND, &args) {
                Ok(r) if r.code == 0 => {
                    let handle = FileHandle(read_u32(&r.data, "open")?);
                    debug!("Opened {name} as {handle}");
                    return Ok(handle);
                }
                Ok(r) => last_error = format!("completion code {:#04x}", r.code),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(FirmwareError::RetryExhausted {
            operation: format!("open {name}"),
            attempts,
            last_error,
        })
    }

    /// Reads `size` bytes from the start of the file.
    pub fn read(&mut self, handle: FileHandle, size: u32) -> Result<Vec<u8>, FirmwareError> {
        let chunk = u32::from(self.config.chunk_size.max(1));
        let mut output = Vec::with_capacity(size as usize);
        let mut offset: u32 = 0;
        let mut remaining = size;

        while remaining > 0 {
            // remaining.min(chunk) never exceeds the u16 chunk size
            let amount = remaining.min(chunk) as u16;
            let mut args = Vec::with_capacity(10);
            args.extend_from_slice(&handle.0.to_le_bytes());
            args.extend_from_slice(&offset.to_le_bytes());
            args.extend_from_slice(&amount.to_le_bytes());
            let data = self.checked("read", READ_COMMAND, &args)?;
            let payload = data
                .get(READ_DATA_OFFSET..)
                .ok_or(FirmwareError::ShortResponse {
                    context: "read".to_string(),
                    expected: READ_DATA_OFFSET,
                    actual: data.len(),
                })?;
            output.extend_from_slice(payload);
            remaining = remaining.saturating_sub(chunk);
            offset = offset.wrapping_add(chunk);
        }
        Ok(output)
    }

    /// Writes the first `size` bytes of `data` from the start of the file.
    pub fn write(
        &mut self,
        handle: FileHandle,
        size: u32,
        data: &[u8],
    ) -> Result<(), FirmwareError> {
        let chunk = usize::from(self.config.chunk_size.max(1));
        let data = &data[..data.len().min(size as usize)];
        let mut offset: u32 = 0;

        for piece in data.chunks(chunk) {
            let mut args = Vec::with_capacity(8 + piece.len());
            args.extend_from_slice(&handle.0.to_le_bytes());
            args.extend_from_slice(&offset.to_le_bytes());
            args.extend_from_slice(piece);
            self.checked("write", WRITE_COMMAND, &args)?;
            offset = offset.wrapping_add(chunk as u32);
        }
        Ok(())
    }

    /// Best effort, a refusal is only logged. Sent even after cancellation so
    /// the controller's file handle is released.
    pub fn close(&mut self, handle: FileHandle) -> Result<(), FirmwareError> {
        let response = self.exchange("close", CLOSE_COMMAND, &handle.0.to_le_bytes())?;
        if response.code != 0 {
            warn!(
                "close of {handle} returned completion code {:#04x}",
                response.code
            );
        }
        Ok(())
    }

    // Closes `handle` once `result` is known. A failed close is returned only
    // when `result` succeeded.
    fn close_after<T>(
        &mut self,
        handle: FileHandle,
        result: Result<T, FirmwareError>,
    ) -> Result<T, FirmwareError> {
        let closed = self.close(handle);
        match (result, closed) {
            (Ok(value), closed) => closed.map(|()| value),
            (Err(e), Err(close_error)) => {
                warn!("close of {handle} failed: {close_error}");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Fetches and decompresses a whole file, repeating the cycle while the
    /// controller hands back an empty file.
    pub fn read_file(
        &mut self,
        name: &str,
        codec: &dyn Compressor,
    ) -> Result<Vec<u8>, FirmwareError> {
        let attempts = self.config.read_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!("{name} was empty, retrying ({attempt} of {attempts})");
                self.pacer.wait(self.config.read_retry_interval)?;
            }
            self.reconnect()?;
            let handle = self.open(name, OpenMode::Read)?;
            let raw = self.size(name).and_then(|size| self.read(handle, size));
            let raw = self.close_after(handle, raw)?;
            if raw.is_empty() {
                continue;
            }
            let data = codec.decompress(&raw)?;
            if !data.is_empty() {
                return Ok(data);
            }
        }
        Err(FirmwareError::RetryExhausted {
            operation: format!("read {name}"),
            attempts,
            last_error: "controller returned an empty file".to_string(),
        })
    }

    /// Compresses `data` and stores it as `name`.
    pub fn write_file(
        &mut self,
        name: &str,
        data: &[u8],
        codec: &dyn Compressor,
    ) -> Result<(), FirmwareError> {
        let payload = codec.compress(data)?;
        let size = u32::try_from(payload.len()).map_err(|_| FirmwareError::InvalidValue {
            context: format!("write {name}"),
            field: "size".to_string(),
            value: payload.len().to_string(),
        })?;
        self.reconnect()?;
        let handle = self.open(name, OpenMode::Write { size })?;
        let written = self.write(handle, size, &payload);
        self.close_after(handle, written)
    }

    pub fn power_state(&mut self) -> Result<PowerState, FirmwareError> {
        self.pacer.checkpoint()?;
        self.session()?.power_state()
    }

    pub fn set_power(&mut self, action: PowerAction) -> Result<(), FirmwareError> {
        self.pacer.checkpoint()?;
        debug!("Power {action} on {}", self.endpoint.host);
        self.session()?.set_power(action)
    }
}

fn open_args(name: &str, mode: OpenMode) -> Vec<u8> {
    let mut args = vec![];
    match mode {
        OpenMode::Read => args.extend_from_slice(&OPEN_READ_ARGS),
        OpenMode::Write { size } => {
            args.extend_from_slice(&OPEN_WRITE_ARGS);
            args.extend_from_slice(&size.to_le_bytes());
            args.extend_from_slice(&OPEN_WRITE_TRAILER);
        }
    }
    args.extend_from_slice(name.as_bytes());
    // enterprise number and sub-command byte are added by `command`
    let framed = IBM_ENTERPRISE.len() + 1;
    if args.len() + framed < OPEN_FRAME_LEN {
        args.resize(OPEN_FRAME_LEN - framed, 0);
    }
    args
}

fn read_u32(data: &[u8], context: &str) -> Result<u32, FirmwareError> {
    data.get(VALUE_OFFSET..VALUE_OFFSET + 4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_le_bytes)
        .ok_or(FirmwareError::ShortResponse {
            context: context.to_string(),
            expected: VALUE_OFFSET + 4,
            actual: data.len(),
        })
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};

    use proptest::prelude::*;

    use super::*;
    use crate::clock::{CancellationToken, ManualClock};

    #[derive(Debug)]
    pub(crate) struct ImmState {
        pub(crate) files: HashMap<String, Vec<u8>>,
        handles: HashMap<u32, String>,
        next_handle: u32,
        frames: Vec<Vec<u8>>,
        // open attempts still to refuse
        pub(crate) refuse_opens: u32,
        pub(crate) connects: u32,
        pub(crate) power: PowerState,
        pub(crate) power_actions: Vec<PowerAction>,
        // token cancelled when this sub-command arrives
        cancel_on: Option<(u8, CancellationToken)>,
        fail_reads: bool,
        fail_close: bool,
    }

    impl Default for ImmState {
        fn default() -> Self {
            ImmState {
                files: HashMap::new(),
                handles: HashMap::new(),
                next_handle: 0,
                frames: Vec::new(),
                refuse_opens: 0,
                connects: 0,
                power: PowerState::On,
                power_actions: Vec::new(),
                cancel_on: None,
                fail_reads: false,
                fail_close: false,
            }
        }
    }

    /// In-memory IMM serving the OEM file commands.
    #[derive(Clone, Default)]
    pub(crate) struct FakeImm(Arc<Mutex<ImmState>>);

    impl FakeImm {
        pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, ImmState> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn with_file(self, name: &str, data: Vec<u8>) -> Self {
            self.state().files.insert(name.to_string(), data);
            self
        }

        pub(crate) fn connector(&self) -> Arc<dyn Connector<dyn IpmiSession>> {
            let imm = self.clone();
            let connector = move |_: &Endpoint| -> Result<Box<dyn IpmiSession>, FirmwareError> {
                imm.state().connects += 1;
                Ok(Box::new(imm.clone()))
            };
            Arc::new(connector)
        }

        fn frames(&self, sub_command: u8) -> Vec<Vec<u8>> {
            self.state()
                .frames
                .iter()
                .filter(|f| f[3] == sub_command)
                .cloned()
                .collect()
        }

        fn channel(&self, config: TransferConfig, clock: &ManualClock) -> FileChannel {
            FileChannel::new(
                Endpoint::new("imm", "USERID", "PASSW0RD"),
                self.connector(),
                config,
                Pacer::new(Arc::new(clock.clone()), CancellationToken::new()),
            )
        }
    }

    fn name_at(data: &[u8], start: usize) -> String {
        let raw: Vec<u8> = data[start..].iter().copied().take_while(|b| *b != 0).collect();
        String::from_utf8(raw).unwrap()
    }

    fn le32(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    }

    impl IpmiSession for FakeImm {
        fn raw_command(
            &mut self,
            netfn: u8,
            command: u8,
            data: &[u8],
        ) -> Result<RawResponse, FirmwareError> {
            assert_eq!((netfn, command), (IMM_NETFN, IMM_COMMAND));
            assert_eq!(data[..3], IBM_ENTERPRISE);
            let mut s = self.state();
            s.frames.push(data.to_vec());
            if let Some((sub_command, cancel)) = &s.cancel_on {
                if data[3] == *sub_command {
                    cancel.cancel();
                }
            }
            let mut out = IBM_ENTERPRISE.to_vec();
            match data[3] {
                OPEN_COMMAND => {
                    assert_eq!(data.len(), OPEN_FRAME_LEN);
                    if s.refuse_opens > 0 {
                        s.refuse_opens -= 1;
                        return Ok(RawResponse { code: 0xc3, data: vec![] });
                    }
                    let name = name_at(data, 12);
                    if data[4] == 0x03 {
                        s.files.insert(name.clone(), vec![0; le32(data, 6) as usize]);
                    }
                    s.next_handle += 1;
                    let handle = s.next_handle;
                    s.handles.insert(handle, name);
                    out.extend_from_slice(&handle.to_le_bytes());
                }
                SIZE_COMMAND => {
                    let name = String::from_utf8(data[4..].to_vec()).unwrap();
                    let size = s.files.get(&name).map_or(0, Vec::len) as u32;
                    out.extend_from_slice(&size.to_le_bytes());
                }
                READ_COMMAND if s.fail_reads => {
                    return Ok(RawResponse { code: 0xc0, data: vec![] });
                }
                READ_COMMAND => {
                    let name = s.handles[&le32(data, 4)].clone();
                    let offset = le32(data, 8) as usize;
                    let len = u16::from_le_bytes([data[12], data[13]]) as usize;
                    let file = &s.files[&name];
                    let end = (offset + len).min(file.len());
                    let piece = file[offset.min(end)..end].to_vec();
                    out.extend_from_slice(&(piece.len() as u16).to_le_bytes());
                    out.extend_from_slice(&piece);
                }
                WRITE_COMMAND => {
                    let name = s.handles[&le32(data, 4)].clone();
                    let offset = le32(data, 8) as usize;
                    let piece = &data[12..];
                    let file = s.files.get_mut(&name).unwrap();
                    file[offset..offset + piece.len()].copy_from_slice(piece);
                }
                CLOSE_COMMAND if s.fail_close => {
                    return Err(FirmwareError::TransportError {
                        operation: "close".to_string(),
                        message: "session dropped".to_string(),
                    });
                }
                CLOSE_COMMAND => {
                    let handle = le32(data, 4);
                    s.handles.remove(&handle);
                }
                other => panic!("unexpected sub-command {other:#04x}"),
            }
            Ok(RawResponse { code: 0, data: out })
        }

        fn power_state(&mut self) -> Result<PowerState, FirmwareError> {
            Ok(self.state().power)
        }

        fn set_power(&mut self, action: PowerAction) -> Result<(), FirmwareError> {
            let mut s = self.state();
            s.power_actions.push(action);
            s.power = match action {
                PowerAction::Off => PowerState::Off,
                _ => PowerState::On,
            };
            Ok(())
        }
    }

    pub(crate) struct Identity;

    impl Compressor for Identity {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError> {
            Ok(data.to_vec())
        }
        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError> {
            Ok(data.to_vec())
        }
    }

    const MARKER: u8 = 0xaa;

    /// Stores files reversed with a trailing marker byte.
    pub(crate) struct Reversed;

    impl Compressor for Reversed {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError> {
            let mut out: Vec<u8> = data.iter().rev().copied().collect();
            out.push(MARKER);
            Ok(out)
        }
        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FirmwareError> {
            match data.split_last() {
                Some((&MARKER, body)) => Ok(body.iter().rev().copied().collect()),
                _ => Err(FirmwareError::CodecError("missing marker".to_string())),
            }
        }
    }

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_open_frame_layout() {
        let args = open_args("config.efi", OpenMode::Read);
        assert_eq!(args.len() + 4, OPEN_FRAME_LEN);
        assert_eq!(args[..8], OPEN_READ_ARGS);
        assert_eq!(&args[8..18], b"config.efi");
        assert!(args[18..].iter().all(|b| *b == 0));

        let args = open_args("asu_update.efi", OpenMode::Write { size: 0x0102 });
        assert_eq!(args[..8], [0x03, 0x01, 0x02, 0x01, 0x00, 0x00, 0x01, 0x10]);
        assert_eq!(&args[8..22], b"asu_update.efi");
    }

    #[test]
    fn test_write_offsets() {
        let imm = FakeImm::default();
        let clock = ManualClock::new();
        let mut channel = imm.channel(TransferConfig::default(), &clock);
        let data = blob(2000);
        channel.write_file("asu_update.efi", &data, &Identity).unwrap();

        let writes = imm.frames(WRITE_COMMAND);
        assert_eq!(writes.len(), 10);
        for (i, w) in writes.iter().enumerate() {
            assert_eq!(le32(w, 8), i as u32 * 200);
            assert_eq!(w.len() - 12, 200);
        }
        assert_eq!(imm.state().files["asu_update.efi"], data);
        assert!(imm.state().handles.is_empty());
    }

    #[test]
    fn test_read_clamps_last_chunk() {
        let imm = FakeImm::default().with_file("config.efi", blob(450));
        let clock = ManualClock::new();
        let mut channel = imm.channel(TransferConfig::default(), &clock);
        let data = channel.read_file("config.efi", &Identity).unwrap();

        assert_eq!(data, blob(450));
        let lengths: Vec<u16> = imm
            .frames(READ_COMMAND)
            .iter()
            .map(|r| u16::from_le_bytes([r[12], r[13]]))
            .collect();
        assert_eq!(lengths, vec![200, 200, 50]);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_open_retry_exhausted() {
        let imm = FakeImm::default().with_file("config.efi", blob(10));
        imm.state().refuse_opens = u32::MAX;
        let clock = ManualClock::new();
        let mut channel = imm.channel(TransferConfig::default(), &clock);
        channel.reconnect().unwrap();

        let err = channel.open("config.efi", OpenMode::Read).unwrap_err();
        assert!(matches!(err, FirmwareError::RetryExhausted { attempts: 6, .. }));
        assert_eq!(imm.frames(OPEN_COMMAND).len(), 6);
        // one initial connect, then one before each retry
        assert_eq!(imm.state().connects, 6);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10); 5]);
    }

    #[test]
    fn test_open_recovers_after_reconnect() {
        let imm = FakeImm::default().with_file("config.efi", blob(10));
        imm.state().refuse_opens = 2;
        let clock = ManualClock::new();
        let mut channel = imm.channel(TransferConfig::default(), &clock);
        let handle = channel.open("config.efi", OpenMode::Read).unwrap();
        assert_eq!(handle, FileHandle(1));
        assert_eq!(imm.frames(OPEN_COMMAND).len(), 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn test_empty_file_exhausts_read_cycle() {
        let imm = FakeImm::default().with_file("config.efi", vec![]);
        let clock = ManualClock::new();
        let config = TransferConfig {
            read_attempts: 3,
            read_retry_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let mut channel = imm.channel(config, &clock);
        let err = channel.read_file("config.efi", &Identity).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 2]);
        assert_eq!(imm.frames(CLOSE_COMMAND).len(), 3);
    }

    #[test]
    fn test_cancelled_channel_sends_nothing() {
        let imm = FakeImm::default().with_file("config.efi", blob(10));
        let cancel = CancellationToken::new();
        let imm2 = imm.clone();
        let connector = move |_: &Endpoint| -> Result<Box<dyn IpmiSession>, FirmwareError> {
            Ok(Box::new(imm2.clone()))
        };
        let mut channel = FileChannel::new(
            Endpoint::default(),
            Arc::new(connector),
            TransferConfig::default(),
            Pacer::new(Arc::new(ManualClock::new()), cancel.clone()),
        );
        cancel.cancel();
        let err = channel.read_file("config.efi", &Identity).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(imm.state().frames.is_empty());
    }

    #[test]
    fn test_files_are_stored_compressed() {
        let imm = FakeImm::default();
        let mut channel = imm.channel(TransferConfig::default(), &ManualClock::new());
        channel.write_file("asu_update.efi", &blob(450), &Reversed).unwrap();

        let stored = imm.state().files["asu_update.efi"].clone();
        assert_eq!(stored.len(), 451);
        assert_eq!(stored.last(), Some(&MARKER));
        assert_eq!(stored, Reversed.compress(&blob(450)).unwrap());
        // the announced size is the compressed one
        assert_eq!(le32(&imm.frames(OPEN_COMMAND)[0], 6), 451);
        assert_eq!(
            channel.read_file("asu_update.efi", &Reversed).unwrap(),
            blob(450)
        );

        let imm = FakeImm::default().with_file("config.efi", blob(450));
        let mut channel = imm.channel(TransferConfig::default(), &ManualClock::new());
        let err = channel.read_file("config.efi", &Reversed).unwrap_err();
        assert!(matches!(err, FirmwareError::CodecError(_)));
    }

    fn cancel_during(sub_command: u8) -> (FakeImm, FirmwareError) {
        let imm = FakeImm::default().with_file("config.efi", blob(450));
        let cancel = CancellationToken::new();
        imm.state().cancel_on = Some((sub_command, cancel.clone()));
        let mut channel = FileChannel::new(
            Endpoint::default(),
            imm.connector(),
            TransferConfig::default(),
            Pacer::new(Arc::new(ManualClock::new()), cancel),
        );
        let err = match sub_command {
            WRITE_COMMAND => channel.write_file("asu_update.efi", &blob(450), &Identity),
            _ => channel.read_file("config.efi", &Identity).map(|_| ()),
        }
        .unwrap_err();
        (imm, err)
    }

    #[test]
    fn test_cancelled_transfer_still_closes() {
        for sub_command in [READ_COMMAND, WRITE_COMMAND] {
            let (imm, err) = cancel_during(sub_command);
            assert_eq!(err.kind(), ErrorKind::Cancelled);
            // the second chunk is never sent
            assert_eq!(imm.frames(sub_command).len(), 1);
            assert_eq!(imm.frames(CLOSE_COMMAND).len(), 1);
            assert!(imm.state().handles.is_empty());
        }
    }

    #[test]
    fn test_failed_close_keeps_read_error() {
        let imm = FakeImm::default().with_file("config.efi", blob(10));
        imm.state().fail_reads = true;
        imm.state().fail_close = true;
        let mut channel = imm.channel(TransferConfig::default(), &ManualClock::new());
        let err = channel.read_file("config.efi", &Identity).unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::CompletionCode {
                operation: "read",
                code: 0xc0
            }
        ));
        assert_eq!(imm.frames(CLOSE_COMMAND).len(), 1);
    }

    #[test]
    fn test_failed_close_after_good_write_is_reported() {
        let imm = FakeImm::default();
        imm.state().fail_close = true;
        let mut channel = imm.channel(TransferConfig::default(), &ManualClock::new());
        let err = channel
            .write_file("asu_update.efi", &blob(10), &Identity)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    proptest! {
        #[test]
        fn prop_chunked_read_reconstructs(
            chunk in 1u16..300,
            pick in 0usize..6,
            seed in any::<u8>(),
        ) {
            let b = usize::from(chunk);
            let sizes = [0, b - 1, b, b + 1, 3 * b, 3 * b + 7];
            let data: Vec<u8> = (0..sizes[pick]).map(|i| (i as u8) ^ seed).collect();
            let imm = FakeImm::default().with_file("f", data.clone());
            let config = TransferConfig { chunk_size: chunk, ..Default::default() };
            let mut channel = imm.channel(config, &ManualClock::new());
            let handle = channel.open("f", OpenMode::Read).unwrap();
            let size = channel.size("f").unwrap();
            prop_assert_eq!(channel.read(handle, size).unwrap(), data);
        }

        #[test]
        fn prop_write_then_read(data in proptest::collection::vec(any::<u8>(), 1..1500)) {
            let imm = FakeImm::default();
            let mut channel = imm.channel(TransferConfig::default(), &ManualClock::new());
            channel.write_file("f", &data, &Identity).unwrap();
            prop_assert_eq!(channel.read_file("f", &Identity).unwrap(), data);
        }
    }
}
