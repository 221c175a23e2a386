// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Polled XMODEM / YMODEM receiver
//!
//! [`Machine`] is the protocol: a state enum and a transition function that
//! turns one input event into a list of [`Effect`]s without touching any I/O.
//! [`Session`] owns the block buffer and destination file, feeds the machine
//! from the channel and carries out its effects.

use std::io::Write;
use std::mem::discriminant;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::buffer::BlockBuffer;
use crate::checksum::BlockCheck;
use crate::header::{parse_header, FileHeader, HeaderError};
use crate::path::{self, PathError};
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::Storage;

// ============================================================================
// Error Types
// ============================================================================

/// Why the receiver sent CAN
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelReason {
    #[error("unexpected block {got} (expected {expected})")]
    UnexpectedBlock { got: u8, expected: u8 },

    #[error("malformed header block: {0}")]
    MalformedHeader(HeaderError),

    #[error("destination file refused")]
    FileRefused,

    #[error("sender cancelled")]
    SenderCancelled,

    #[error("no response after cancel")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("cannot allocate {0}-byte block buffer")]
    Allocation(usize),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("channel error: {0}")]
    Channel(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("channel error: {0}")]
    Channel(#[source] std::io::Error),

    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Path(PathError),

    #[error("transfer cancelled: {0}")]
    Cancelled(CancelReason),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Inter-byte gap that ends a block in progress
    pub short: Duration,
    /// Idle wait before prodding the sender again
    pub long: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            short: Duration::from_millis(1000),
            long: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub mode: Mode,
    /// Destination file (XMODEM) or receive directory (YMODEM)
    pub target: String,
    /// Allocate a 1024-byte buffer so STX blocks are accepted
    pub one_k: bool,
    pub use_crc: bool,
    pub timeouts: Timeouts,
}

impl ReceiveConfig {
    pub fn xmodem(path: &str) -> Self {
        ReceiveConfig {
            mode: Mode::Xmodem,
            target: path.to_string(),
            one_k: true,
            use_crc: true,
            timeouts: Timeouts::default(),
        }
    }

    pub fn ymodem(dir: &str) -> Self {
        ReceiveConfig {
            mode: Mode::Ymodem,
            target: dir.to_string(),
            ..ReceiveConfig::xmodem("")
        }
    }

    pub fn with_crc(mut self, use_crc: bool) -> Self {
        self.use_crc = use_crc;
        self
    }

    pub fn with_one_k(mut self, one_k: bool) -> Self {
        self.one_k = one_k;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

// ============================================================================
// States, Events and Effects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    BlockStart,
    BlockNum { size: BlockSize },
    BlockCheck { size: BlockSize, number: u8 },
    DataBlock { size: BlockSize, number: u8 },
    DataCheck { size: BlockSize, number: u8 },
    DataCheckCrc { size: BlockSize, number: u8, high: Option<u8> },
    DataPurge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Byte(u8),
    /// The current deadline passed with nothing received
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write one control byte to the sender
    Reply(u8),
    /// Append the first `n` bytes of the block buffer to the destination
    Persist(usize),
    /// YMODEM header accepted: open the named file and report back
    OpenFile(FileHeader),
    CloseFile,
    /// Restart the long timeout
    ArmLong,
    /// Transfer finished normally
    Finish,
    Abort(CancelReason),
}

// ============================================================================
// Protocol Machine
// ============================================================================

pub struct Machine {
    mode: Mode,
    use_crc: bool,
    state: State,
    buffer: BlockBuffer,
    check: BlockCheck,
    expected: u8,
    // YMODEM: only block 0 is acceptable until a file is open
    awaiting_header: bool,
    file_open: bool,
    remaining: Option<u64>,
    last_reply: u8,
    pending_cancel: Option<CancelReason>,
    cancels_seen: u8,
}

impl Machine {
    /// XMODEM machines assume the caller already opened the destination.
    pub fn new(mode: Mode, use_crc: bool, buffer: BlockBuffer) -> Self {
        Machine {
            mode,
            use_crc,
            state: State::BlockStart,
            buffer,
            check: BlockCheck::new(use_crc),
            expected: 1,
            awaiting_header: mode == Mode::Ymodem,
            file_open: mode == Mode::Xmodem,
            remaining: None,
            last_reply: initial_reply(use_crc),
            pending_cancel: None,
            cancels_seen: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn last_reply(&self) -> u8 {
        self.last_reply
    }

    pub fn block(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Advance by one event. Performs no I/O.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();
        let next = match event {
            Event::Byte(byte) => self.on_byte(byte, &mut effects),
            Event::Timeout => self.on_timeout(&mut effects),
        };

        if discriminant(&next) != discriminant(&self.state) {
            debug!(from = ?self.state, to = ?next, "state change");
        }
        self.state = next;
        effects
    }

    /// The destination named by the last header block is open
    pub fn begin_file(&mut self, size: Option<u64>) -> Vec<Effect> {
        self.awaiting_header = false;
        self.file_open = true;
        self.remaining = size;
        self.expected = 1;
        self.pending_cancel = None;
        self.last_reply = initial_reply(self.use_crc);
        vec![Effect::Reply(self.last_reply), Effect::ArmLong]
    }

    /// The destination named by the last header block could not be opened.
    /// A resent header is still accepted; otherwise the next timeout cancels.
    pub fn refuse_file(&mut self) {
        self.cancel(CancelReason::FileRefused);
    }

    /// Drop straight to idle after a failure outside the protocol
    pub fn abort(&mut self) {
        self.file_open = false;
        self.state = State::Idle;
    }

    fn cancel(&mut self, reason: CancelReason) {
        debug!(%reason, "cancel pending");
        self.last_reply = CAN;
        self.pending_cancel = Some(reason);
    }

    fn on_timeout(&mut self, effects: &mut Vec<Effect>) -> State {
        match self.state {
            State::Idle => State::Idle,
            _ if self.last_reply == CAN => {
                effects.push(Effect::Reply(CAN));
                self.file_open = false;
                let reason = self.pending_cancel.take().unwrap_or(CancelReason::TimedOut);
                effects.push(Effect::Abort(reason));
                State::Idle
            }
            _ => {
                effects.push(Effect::Reply(self.last_reply));
                effects.push(Effect::ArmLong);
                State::BlockStart
            }
        }
    }

    fn on_byte(&mut self, byte: u8, effects: &mut Vec<Effect>) -> State {
        match self.state {
            State::Idle => State::Idle,
            State::BlockStart => self.on_block_start(byte, effects),
            State::BlockNum { size } => State::BlockCheck { size, number: byte },
            State::BlockCheck { size, number } => self.on_block_check(size, number, byte),
            State::DataBlock { size, number } => {
                if !self.buffer.push(byte) {
                    self.last_reply = NAK;
                    return State::DataPurge;
                }
                self.check.update(byte);

                if self.buffer.len() < size.len() {
                    State::DataBlock { size, number }
                } else if self.check.trailer_len() == 2 {
                    State::DataCheckCrc { size, number, high: None }
                } else {
                    State::DataCheck { size, number }
                }
            }
            State::DataCheck { size, number } => {
                self.verify(size, number, u16::from(byte), effects)
            }
            State::DataCheckCrc { size, number, high: None } => {
                State::DataCheckCrc { size, number, high: Some(byte) }
            }
            State::DataCheckCrc { size, number, high: Some(high) } => {
                self.verify(size, number, u16::from_be_bytes([high, byte]), effects)
            }
            // Drained until the line goes quiet and the timeout answers
            State::DataPurge => State::DataPurge,
        }
    }

    fn on_block_start(&mut self, byte: u8, effects: &mut Vec<Effect>) -> State {
        if byte == CAN {
            self.cancels_seen += 1;
            if self.cancels_seen >= 2 {
                self.file_open = false;
                effects.push(Effect::Abort(CancelReason::SenderCancelled));
                return State::Idle;
            }
            return State::BlockStart;
        }
        self.cancels_seen = 0;

        if let Some(size) = BlockSize::from_marker(byte) {
            if size.len() > self.buffer.capacity() {
                debug!(size = size.len(), capacity = self.buffer.capacity(), "block too large");
                self.last_reply = NAK;
                return State::DataPurge;
            }
            return State::BlockNum { size };
        }

        if byte == EOT {
            return self.on_end_of_file(effects);
        }

        debug!("ignoring 0x{:02X} between blocks", byte);
        State::BlockStart
    }

    fn on_end_of_file(&mut self, effects: &mut Vec<Effect>) -> State {
        effects.push(Effect::Reply(ACK));
        self.expected = 1;

        let had_file = self.file_open;
        if had_file {
            effects.push(Effect::CloseFile);
            self.file_open = false;
        }

        if self.mode == Mode::Ymodem && had_file {
            // Next header block names the following file (or ends the batch)
            self.awaiting_header = true;
            self.remaining = None;
            State::BlockStart
        } else {
            effects.push(Effect::Finish);
            State::Idle
        }
    }

    fn on_block_check(&mut self, size: BlockSize, number: u8, complement: u8) -> State {
        if complement != !number {
            debug!(number, complement, "block number complement mismatch");
            self.last_reply = NAK;
            return State::DataPurge;
        }

        let acceptable = if self.awaiting_header {
            number == 0
        } else {
            number == self.expected || number == self.expected.wrapping_sub(1)
        };
        if !acceptable {
            let expected = if self.awaiting_header { 0 } else { self.expected };
            self.cancel(CancelReason::UnexpectedBlock { got: number, expected });
            return State::DataPurge;
        }

        self.buffer.clear();
        self.check = BlockCheck::new(self.use_crc);
        State::DataBlock { size, number }
    }

    fn verify(&mut self, size: BlockSize, number: u8, received: u16, effects: &mut Vec<Effect>) -> State {
        if !self.check.matches(received) {
            debug!(number, computed = ?self.check, received, "block check failed");
            effects.push(Effect::Reply(NAK));
            return State::BlockStart;
        }

        effects.push(Effect::Reply(ACK));
        self.dispatch(size, number, effects)
    }

    fn dispatch(&mut self, size: BlockSize, number: u8, effects: &mut Vec<Effect>) -> State {
        if self.awaiting_header {
            return self.on_header(effects);
        }

        if number == self.expected {
            self.expected = self.expected.wrapping_add(1);

            // XMODEM has no length, so padding in the last block is kept
            let len = match self.remaining {
                Some(remaining) => remaining.min(size.len() as u64) as usize,
                None => size.len(),
            };
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= len as u64;
            }

            debug!(number, len, "block accepted");
            if len > 0 {
                effects.push(Effect::Persist(len));
            }
            effects.push(Effect::ArmLong);
        } else {
            debug!(number, "duplicate block acknowledged again");
        }
        State::BlockStart
    }

    fn on_header(&mut self, effects: &mut Vec<Effect>) -> State {
        match parse_header(self.buffer.as_slice()) {
            Ok(None) => {
                debug!("empty header, end of batch");
                effects.push(Effect::Finish);
                State::Idle
            }
            Ok(Some(header)) => {
                effects.push(Effect::OpenFile(header));
                State::BlockStart
            }
            Err(e) => {
                warn!(error = %e, "malformed header block");
                self.cancel(CancelReason::MalformedHeader(e));
                State::BlockStart
            }
        }
    }
}

// ============================================================================
// Session Driver
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    InProgress,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: String,
    pub bytes: u64,
}

struct Destination {
    path: String,
    handle: Box<dyn Write>,
    written: u64,
}

pub struct Session {
    machine: Machine,
    base_dir: String,
    timeouts: Timeouts,
    deadline: Instant,
    destination: Option<Destination>,
    received: Vec<ReceivedFile>,
    error: Option<ReceiveError>,
    // Why the last header was refused; cleared if a resent header opens
    refused: Option<ReceiveError>,
}

fn send(port: &mut dyn SerialPort, byte: u8) -> std::io::Result<()> {
    debug!("sent {}", control_name(byte));
    port.write_all(&[byte])?;
    port.flush()
}

impl Session {
    pub fn start(
        config: &ReceiveConfig,
        port: &mut dyn SerialPort,
        storage: &mut dyn Storage,
    ) -> Result<Self, StartError> {
        Self::start_at(config, port, storage, Instant::now())
    }

    pub fn start_at(
        config: &ReceiveConfig,
        port: &mut dyn SerialPort,
        storage: &mut dyn Storage,
        now: Instant,
    ) -> Result<Self, StartError> {
        let capacity = if config.one_k { BlockSize::OneK.len() } else { BlockSize::Standard.len() };
        let buffer = BlockBuffer::try_with_capacity(capacity)
            .map_err(|_| StartError::Allocation(capacity))?;

        let mut destination = None;
        let mut base_dir = String::from("/");
        match config.mode {
            Mode::Xmodem => {
                let path = path::join("/", &config.target)?;
                // Absent file is fine, open_write reports anything worse
                let _ = storage.remove(&path);
                let handle = storage
                    .open_write(&path)
                    .map_err(|source| StartError::Open { path: path.clone(), source })?;
                info!(path = %path, "XMODEM receive starting");
                destination = Some(Destination { path, handle, written: 0 });
            }
            Mode::Ymodem => {
                if !config.target.is_empty() {
                    base_dir = config.target.clone();
                }
                info!(dir = %base_dir, "YMODEM batch receive starting");
            }
        }

        let machine = Machine::new(config.mode, config.use_crc, buffer);
        send(port, machine.last_reply())?;

        Ok(Session {
            machine,
            base_dir,
            timeouts: config.timeouts,
            deadline: now + config.timeouts.long,
            destination,
            received: Vec::new(),
            error: None,
            refused: None,
        })
    }

    pub fn status(&self) -> SessionStatus {
        if self.machine.is_idle() { SessionStatus::Idle } else { SessionStatus::InProgress }
    }

    /// First fatal error, or why the pending header was refused
    pub fn error(&self) -> Option<&ReceiveError> {
        self.error.as_ref().or(self.refused.as_ref())
    }

    /// Files closed after a complete transfer, in arrival order
    pub fn received(&self) -> &[ReceivedFile] {
        &self.received
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    /// Outcome of a session that has gone idle
    pub fn finish(mut self) -> Result<Vec<ReceivedFile>, ReceiveError> {
        match self.error.take().or(self.refused.take()) {
            Some(e) => Err(e),
            None => Ok(std::mem::take(&mut self.received)),
        }
    }

    pub fn advance(&mut self, port: &mut dyn SerialPort, storage: &mut dyn Storage) -> SessionStatus {
        self.advance_at(port, storage, Instant::now())
    }

    /// Consume whatever input is available right now. Never waits.
    pub fn advance_at(
        &mut self,
        port: &mut dyn SerialPort,
        storage: &mut dyn Storage,
        now: Instant,
    ) -> SessionStatus {
        if self.machine.is_idle() {
            return SessionStatus::Idle;
        }

        if now > self.deadline {
            debug!(state = ?self.machine.state(), "timeout");
            let effects = self.machine.handle(Event::Timeout);
            self.apply(effects, port, storage, now);
            return self.status();
        }

        while !self.machine.is_idle() {
            let byte = match port.bytes_available() {
                Ok(0) => break,
                Ok(_) => port.read_byte(),
                Err(e) => Err(e),
            };
            let byte = match byte {
                Ok(Some(byte)) => byte,
                Ok(None) => break,
                Err(e) => {
                    self.fail(ReceiveError::Channel(e), port);
                    break;
                }
            };

            self.deadline = now + self.timeouts.short;
            let effects = self.machine.handle(Event::Byte(byte));
            self.apply(effects, port, storage, now);
        }

        self.status()
    }

    fn apply(&mut self, effects: Vec<Effect>, port: &mut dyn SerialPort, storage: &mut dyn Storage, now: Instant) {
        for effect in effects {
            if let Err(e) = self.apply_one(effect, port, storage, now) {
                self.fail(e, port);
                break;
            }
        }
    }

    fn apply_one(
        &mut self,
        effect: Effect,
        port: &mut dyn SerialPort,
        storage: &mut dyn Storage,
        now: Instant,
    ) -> Result<(), ReceiveError> {
        match effect {
            Effect::Reply(byte) => send(port, byte).map_err(ReceiveError::Channel)?,
            Effect::Persist(len) => self.persist(len)?,
            Effect::OpenFile(header) => {
                for effect in self.open_file(header, storage)? {
                    self.apply_one(effect, port, storage, now)?;
                }
            }
            Effect::CloseFile => self.close_file(true)?,
            Effect::ArmLong => self.deadline = now + self.timeouts.long,
            Effect::Finish => {
                self.close_file(true)?;
                if let Some(refused) = self.refused.take() {
                    self.error.get_or_insert(refused);
                }
                info!(files = self.received.len(), "transfer complete");
            }
            Effect::Abort(reason) => {
                warn!(%reason, "transfer aborted");
                let error = self.refused.take().unwrap_or(ReceiveError::Cancelled(reason));
                self.error.get_or_insert(error);
                self.discard_file();
            }
        }
        Ok(())
    }

    fn persist(&mut self, len: usize) -> Result<(), ReceiveError> {
        let data = &self.machine.block()[..len];
        match self.destination.as_mut() {
            Some(dest) => {
                dest.handle.write_all(data).map_err(|source| ReceiveError::Write {
                    path: dest.path.clone(),
                    source,
                })?;
                dest.written += len as u64;
            }
            None => warn!(len, "accepted block with no destination open"),
        }
        Ok(())
    }

    fn open_file(&mut self, header: FileHeader, storage: &mut dyn Storage) -> Result<Vec<Effect>, ReceiveError> {
        self.close_file(false)?;

        let path = match path::join(&self.base_dir, &header.name) {
            Ok(path) => path,
            Err(e) => {
                warn!(name = %header.name, error = %e, "cannot resolve received filename");
                self.refused = Some(ReceiveError::Path(e));
                self.machine.refuse_file();
                return Ok(Vec::new());
            }
        };

        let _ = storage.remove(&path);
        match storage.open_write(&path) {
            Ok(handle) => {
                info!(path = %path, size = ?header.size, "receiving file");
                self.destination = Some(Destination { path, handle, written: 0 });
                self.refused = None;
                Ok(self.machine.begin_file(header.size))
            }
            Err(source) => {
                warn!(path = %path, error = %source, "cannot open received file");
                self.refused = Some(ReceiveError::Open { path, source });
                self.machine.refuse_file();
                Ok(Vec::new())
            }
        }
    }

    /// Flush and release the destination. The handle is dropped even when
    /// the flush fails.
    fn close_file(&mut self, complete: bool) -> Result<(), ReceiveError> {
        let Some(mut dest) = self.destination.take() else {
            return Ok(());
        };

        dest.handle.flush().map_err(|source| ReceiveError::Write {
            path: dest.path.clone(),
            source,
        })?;

        info!(path = %dest.path, bytes = dest.written, "closed file");
        if complete {
            self.received.push(ReceivedFile { path: dest.path, bytes: dest.written });
        }
        Ok(())
    }

    /// Close a destination the session is giving up on
    fn discard_file(&mut self) {
        if let Err(e) = self.close_file(false) {
            warn!(error = %e, "close after failure");
        }
    }

    fn fail(&mut self, error: ReceiveError, port: &mut dyn SerialPort) {
        warn!(%error, "receive failed");
        let send_cancel = !matches!(error, ReceiveError::Channel(_));
        self.error.get_or_insert(error);

        if send_cancel {
            let _ = send(port, CAN);
        }
        self.discard_file();
        self.machine.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut dest) = self.destination.take() {
            let _ = dest.handle.flush();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::trailer;
    use crate::serial::MockSerialPort;
    use crate::storage::MemoryStorage;

    const PAD: u8 = 0x1A;

    fn frame(marker: u8, number: u8, payload: &[u8], use_crc: bool) -> Vec<u8> {
        let size = BlockSize::from_marker(marker).unwrap().len();
        let mut data = payload.to_vec();
        data.resize(size, PAD);

        let mut out = vec![marker, number, !number];
        out.extend_from_slice(&data);
        out.extend(trailer(use_crc, &data));
        out
    }

    fn header_frame(content: &[u8]) -> Vec<u8> {
        let mut data = content.to_vec();
        data.resize(128, 0);
        frame(SOH, 0, &data, true)
    }

    /// Each chunk is delivered on its own poll
    fn script(chunks: &[&[u8]]) -> Vec<Option<u8>> {
        let mut out = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                out.push(None);
            }
            out.extend(chunk.iter().map(|&b| Some(b)));
        }
        out
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn poll(session: &mut Session, port: &mut MockSerialPort, storage: &mut MemoryStorage, now: Instant, times: usize) -> SessionStatus {
        let mut status = session.status();
        for _ in 0..times {
            status = session.advance_at(port, storage, now);
        }
        status
    }

    fn machine(mode: Mode, use_crc: bool) -> Machine {
        Machine::new(mode, use_crc, BlockBuffer::try_with_capacity(1024).unwrap())
    }

    fn feed(machine: &mut Machine, bytes: &[u8]) -> Vec<Effect> {
        bytes.iter().flat_map(|&b| machine.handle(Event::Byte(b))).collect()
    }

    // ------------------------------------------------------------------
    // Machine
    // ------------------------------------------------------------------

    #[test]
    fn test_machine_walks_block_states() {
        let mut m = machine(Mode::Xmodem, true);
        let block = frame(SOH, 1, b"abc", true);

        assert_eq!(m.state(), State::BlockStart);
        m.handle(Event::Byte(block[0]));
        assert_eq!(m.state(), State::BlockNum { size: BlockSize::Standard });
        m.handle(Event::Byte(block[1]));
        assert_eq!(m.state(), State::BlockCheck { size: BlockSize::Standard, number: 1 });
        m.handle(Event::Byte(block[2]));
        assert_eq!(m.state(), State::DataBlock { size: BlockSize::Standard, number: 1 });

        assert!(feed(&mut m, &block[3..131]).is_empty());
        assert_eq!(m.state(), State::DataCheckCrc { size: BlockSize::Standard, number: 1, high: None });
        m.handle(Event::Byte(block[131]));
        assert_eq!(
            m.state(),
            State::DataCheckCrc { size: BlockSize::Standard, number: 1, high: Some(block[131]) }
        );

        let effects = m.handle(Event::Byte(block[132]));
        assert_eq!(effects, vec![Effect::Reply(ACK), Effect::Persist(128), Effect::ArmLong]);
        assert_eq!(m.state(), State::BlockStart);
        assert_eq!(m.expected, 2);
    }

    #[test]
    fn test_machine_checksum_mode_uses_one_trailer_byte() {
        let mut m = machine(Mode::Xmodem, false);
        assert_eq!(m.last_reply(), NAK);

        let block = frame(SOH, 1, b"abc", false);
        assert_eq!(block.len(), 132);
        let effects = feed(&mut m, &block);
        assert_eq!(effects, vec![Effect::Reply(ACK), Effect::Persist(128), Effect::ArmLong]);
    }

    #[test]
    fn test_block_number_acceptance() {
        for number in 0..=255u8 {
            let mut m = machine(Mode::Xmodem, true);
            feed(&mut m, &[SOH, number, !number]);

            if number == 1 || number == 0 {
                assert_eq!(m.state(), State::DataBlock { size: BlockSize::Standard, number });
                assert_eq!(m.last_reply(), CRC_PROBE);
            } else {
                assert_eq!(m.state(), State::DataPurge, "block {}", number);
                assert_eq!(m.last_reply(), CAN, "block {}", number);
            }
            assert_eq!(m.expected, 1);
        }
    }

    #[test]
    fn test_bad_complement_rejected() {
        for complement in 0..=255u8 {
            if complement == !1u8 {
                continue;
            }
            let mut m = machine(Mode::Xmodem, true);
            feed(&mut m, &[SOH, 1, complement]);
            assert_eq!(m.state(), State::DataPurge);
            assert_eq!(m.last_reply(), NAK);
            assert_eq!(m.expected, 1);
        }
    }

    #[test]
    fn test_purge_discards_until_timeout() {
        let mut m = machine(Mode::Xmodem, true);
        feed(&mut m, &[SOH, 1, 0x00]);
        assert!(feed(&mut m, &[SOH, 1, 0xFE, 1, 2, 3]).is_empty());
        assert_eq!(m.state(), State::DataPurge);

        let effects = m.handle(Event::Timeout);
        assert_eq!(effects, vec![Effect::Reply(NAK), Effect::ArmLong]);
        assert_eq!(m.state(), State::BlockStart);
    }

    #[test]
    fn test_block_numbers_wrap() {
        let mut m = machine(Mode::Xmodem, true);
        m.expected = 255;

        let effects = feed(&mut m, &frame(SOH, 255, b"x", true));
        assert!(effects.contains(&Effect::Persist(128)));
        assert_eq!(m.expected, 0);

        let effects = feed(&mut m, &frame(SOH, 0, b"y", true));
        assert!(effects.contains(&Effect::Persist(128)));
        assert_eq!(m.expected, 1);

        // Duplicate of block 0 is not a header in XMODEM
        let effects = feed(&mut m, &frame(SOH, 0, b"y", true));
        assert_eq!(effects, vec![Effect::Reply(ACK)]);
    }

    #[test]
    fn test_oversized_block_purged() {
        let mut m = Machine::new(Mode::Xmodem, true, BlockBuffer::try_with_capacity(128).unwrap());
        m.handle(Event::Byte(STX));
        assert_eq!(m.state(), State::DataPurge);
        assert_eq!(m.last_reply(), NAK);
    }

    #[test]
    fn test_timeout_resends_last_reply() {
        let mut m = machine(Mode::Xmodem, true);
        assert_eq!(m.handle(Event::Timeout), vec![Effect::Reply(CRC_PROBE), Effect::ArmLong]);

        // Mid-block silence forces resynchronisation
        feed(&mut m, &[SOH, 1, 0xFE, 0, 0]);
        assert_eq!(m.handle(Event::Timeout), vec![Effect::Reply(CRC_PROBE), Effect::ArmLong]);
        assert_eq!(m.state(), State::BlockStart);
    }

    #[test]
    fn test_timeout_after_cancel_goes_idle() {
        let mut m = machine(Mode::Xmodem, true);
        feed(&mut m, &[SOH, 9, !9u8]);

        let effects = m.handle(Event::Timeout);
        assert_eq!(
            effects,
            vec![
                Effect::Reply(CAN),
                Effect::Abort(CancelReason::UnexpectedBlock { got: 9, expected: 1 }),
            ]
        );
        assert!(m.is_idle());
        assert!(m.handle(Event::Timeout).is_empty());
        assert!(m.handle(Event::Byte(SOH)).is_empty());
    }

    #[test]
    fn test_ymodem_requires_header_first() {
        let mut m = machine(Mode::Ymodem, true);
        feed(&mut m, &[SOH, 1, 0xFE]);
        assert_eq!(m.state(), State::DataPurge);
        assert_eq!(m.last_reply(), CAN);
    }

    #[test]
    fn test_ymodem_header_effects() {
        let mut m = machine(Mode::Ymodem, true);
        let effects = feed(&mut m, &header_frame(b"a.txt\0100\0"));
        assert_eq!(
            effects,
            vec![
                Effect::Reply(ACK),
                Effect::OpenFile(FileHeader { name: "a.txt".into(), size: Some(100) }),
            ]
        );

        assert_eq!(m.begin_file(Some(100)), vec![Effect::Reply(CRC_PROBE), Effect::ArmLong]);

        let effects = feed(&mut m, &frame(SOH, 1, &pattern(128), true));
        assert_eq!(effects, vec![Effect::Reply(ACK), Effect::Persist(100), Effect::ArmLong]);

        // Past the declared size nothing more is written
        let effects = feed(&mut m, &frame(SOH, 2, &pattern(128), true));
        assert_eq!(effects, vec![Effect::Reply(ACK), Effect::ArmLong]);

        let effects = m.handle(Event::Byte(EOT));
        assert_eq!(effects, vec![Effect::Reply(ACK), Effect::CloseFile]);
        assert_eq!(m.state(), State::BlockStart);
    }

    #[test]
    fn test_sender_cancel() {
        let mut m = machine(Mode::Xmodem, true);
        assert!(feed(&mut m, &[CAN]).is_empty());
        assert_eq!(
            feed(&mut m, &[CAN]),
            vec![Effect::Abort(CancelReason::SenderCancelled)]
        );
        assert!(m.is_idle());
    }

    #[test]
    fn test_single_cancel_is_noise() {
        let mut m = machine(Mode::Xmodem, true);
        feed(&mut m, &[CAN, 0x00, CAN]);
        assert_eq!(m.state(), State::BlockStart);
    }

    // ------------------------------------------------------------------
    // XMODEM sessions
    // ------------------------------------------------------------------

    #[test]
    fn test_xmodem_single_block_then_eot() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let block = frame(SOH, 1, b"hello", true);
        let mut port = MockSerialPort::new(script(&[&block, &[EOT]]), vec![CRC_PROBE, ACK, ACK]);

        let config = ReceiveConfig::xmodem("/out.bin");
        let mut session = Session::start_at(&config, &mut port, &mut storage, t0).unwrap();
        assert_eq!(storage.open_handles(), 1);

        assert_eq!(session.advance_at(&mut port, &mut storage, t0), SessionStatus::InProgress);
        assert_eq!(session.advance_at(&mut port, &mut storage, t0), SessionStatus::Idle);

        assert!(session.error().is_none());
        assert_eq!(storage.open_handles(), 0);
        assert_eq!(session.received(), &[ReceivedFile { path: "/out.bin".into(), bytes: 128 }]);

        // The protocol carries no length, so the padding is part of the file
        let content = storage.file("/out.bin").unwrap();
        assert_eq!(content.len(), 128);
        assert_eq!(&content[..5], b"hello");
        assert!(content[5..].iter().all(|&b| b == PAD));
    }

    #[test]
    fn test_xmodem_checksum_mode() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let mut input = frame(SOH, 1, &pattern(128), false);
        input.extend(frame(SOH, 2, &pattern(128), false));
        input.push(EOT);
        let mut port = MockSerialPort::new(script(&[&input]), vec![NAK, ACK, ACK, ACK]);

        let config = ReceiveConfig::xmodem("/sum.bin").with_crc(false).with_one_k(false);
        let mut session = Session::start_at(&config, &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        let mut expected = pattern(128);
        expected.extend(pattern(128));
        assert_eq!(storage.file("/sum.bin").unwrap(), expected);
    }

    #[test]
    fn test_xmodem_1k_blocks() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let mut input = frame(STX, 1, &pattern(1024), true);
        input.extend(frame(SOH, 2, b"tail", true));
        input.push(EOT);
        let mut port = MockSerialPort::new(script(&[&input]), vec![CRC_PROBE, ACK, ACK, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/big.bin"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        let content = storage.file("/big.bin").unwrap();
        assert_eq!(content.len(), 1024 + 128);
        assert_eq!(&content[..1024], &pattern(1024)[..]);
        assert_eq!(&content[1024..1028], b"tail");
    }

    #[test]
    fn test_xmodem_duplicate_block_written_once() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let block = frame(SOH, 1, b"only once", true);
        let mut port = MockSerialPort::new(
            script(&[&block, &block, &[EOT]]),
            vec![CRC_PROBE, ACK, ACK, ACK],
        );

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/dup.txt"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 3), SessionStatus::Idle);

        let content = storage.file("/dup.txt").unwrap();
        assert_eq!(content.len(), 128);
        assert_eq!(&content[..9], b"only once");
    }

    #[test]
    fn test_xmodem_corrupt_payload_is_nakked() {
        for use_crc in [false, true] {
            let t0 = Instant::now();
            let mut storage = MemoryStorage::new();
            let good = frame(SOH, 1, b"payload", use_crc);
            let mut bad = good.clone();
            bad[3 + 10] ^= 0x01;

            let first = initial_reply(use_crc);
            let mut port = MockSerialPort::new(script(&[&bad, &good, &[EOT]]), vec![first, NAK, ACK, ACK]);

            let config = ReceiveConfig::xmodem("/c.bin").with_crc(use_crc);
            let mut session = Session::start_at(&config, &mut port, &mut storage, t0).unwrap();
            assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 3), SessionStatus::Idle);

            let content = storage.file("/c.bin").unwrap();
            assert_eq!(&content[..7], b"payload", "use_crc={}", use_crc);
            assert_eq!(content.len(), 128);
        }
    }

    #[test]
    fn test_xmodem_bad_complement_purges_then_naks() {
        let t0 = Instant::now();
        let t1 = t0 + Timeouts::default().short + Duration::from_millis(1);
        let mut storage = MemoryStorage::new();

        let good = frame(SOH, 1, b"retry", true);
        let mut garbled = good.clone();
        garbled[2] = 0x00;

        let mut port = MockSerialPort::new(script(&[&garbled, &good, &[EOT]]), vec![CRC_PROBE, NAK, ACK, ACK]);
        let mut session = Session::start_at(&ReceiveConfig::xmodem("/r.bin"), &mut port, &mut storage, t0).unwrap();

        session.advance_at(&mut port, &mut storage, t0);
        assert_eq!(session.state(), State::DataPurge);

        // Line quiet for the short timeout: NAK goes out
        session.advance_at(&mut port, &mut storage, t1);
        assert_eq!(session.state(), State::BlockStart);

        assert_eq!(poll(&mut session, &mut port, &mut storage, t1, 2), SessionStatus::Idle);
        assert_eq!(&storage.file("/r.bin").unwrap()[..5], b"retry");
    }

    #[test]
    fn test_xmodem_unexpected_block_cancels() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        let mut storage = MemoryStorage::new();
        let block = frame(SOH, 3, b"lost", true);
        let mut port = MockSerialPort::new(script(&[&block]), vec![CRC_PROBE, CAN]);

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/u.bin"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(session.advance_at(&mut port, &mut storage, t0), SessionStatus::InProgress);
        assert_eq!(session.advance_at(&mut port, &mut storage, t1), SessionStatus::Idle);

        assert!(matches!(
            session.error(),
            Some(ReceiveError::Cancelled(CancelReason::UnexpectedBlock { got: 3, expected: 1 }))
        ));
        assert_eq!(storage.open_handles(), 0);
        assert!(session.received().is_empty());
        assert_eq!(storage.file("/u.bin").unwrap(), Vec::<u8>::new());
        assert!(matches!(session.finish(), Err(ReceiveError::Cancelled(_))));
    }

    #[test]
    fn test_idle_line_reprobes_sender() {
        let t0 = Instant::now();
        let long = Timeouts::default().long;
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(vec![], vec![CRC_PROBE, CRC_PROBE, CRC_PROBE]);

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/w.bin"), &mut port, &mut storage, t0).unwrap();

        // Not yet due
        assert_eq!(session.advance_at(&mut port, &mut storage, t0 + long), SessionStatus::InProgress);

        let t1 = t0 + long + Duration::from_millis(1);
        assert_eq!(session.advance_at(&mut port, &mut storage, t1), SessionStatus::InProgress);
        let t2 = t1 + long + Duration::from_millis(1);
        assert_eq!(session.advance_at(&mut port, &mut storage, t2), SessionStatus::InProgress);
    }

    #[test]
    fn test_sender_cancel_closes_file() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let block = frame(SOH, 1, b"part", true);
        let mut port = MockSerialPort::new(script(&[&block, &[CAN, CAN]]), vec![CRC_PROBE, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/p.bin"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 2), SessionStatus::Idle);

        assert!(matches!(session.error(), Some(ReceiveError::Cancelled(CancelReason::SenderCancelled))));
        assert_eq!(storage.open_handles(), 0);
        // Partial data stays where it is
        assert_eq!(storage.file("/p.bin").unwrap().len(), 128);
    }

    #[test]
    fn test_xmodem_start_open_failure() {
        let mut storage = MemoryStorage::new();
        storage.fail_open(true);
        let mut port = MockSerialPort::new(vec![], vec![]);

        let result = Session::start(&ReceiveConfig::xmodem("/nope.bin"), &mut port, &mut storage);
        assert!(matches!(result, Err(StartError::Open { .. })));
    }

    #[test]
    fn test_xmodem_start_path_too_long() {
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(vec![], vec![]);
        let name = format!("/{}", "n".repeat(200));

        let result = Session::start(&ReceiveConfig::xmodem(&name), &mut port, &mut storage);
        assert!(matches!(result, Err(StartError::Path(PathError::TooLong { .. }))));
    }

    #[test]
    fn test_xmodem_replaces_existing_file() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new().with_file("/old.txt", &[0xEE; 4000]);
        let mut port = MockSerialPort::new(script(&[&[EOT]]), vec![CRC_PROBE, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/old.txt"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);
        assert_eq!(storage.file("/old.txt").unwrap(), Vec::<u8>::new());
    }

    // ------------------------------------------------------------------
    // YMODEM sessions
    // ------------------------------------------------------------------

    #[test]
    fn test_ymodem_single_file_exact_size() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        let mut storage = MemoryStorage::new().with_dir("/recv");

        let header = header_frame(b"a.txt\0100\0");
        let data = frame(STX, 1, &pattern(1024), true);
        let end = header_frame(b"");
        let mut port = MockSerialPort::new(
            script(&[&header, &data, &[EOT], &end]),
            vec![CRC_PROBE, ACK, CRC_PROBE, ACK, ACK, CRC_PROBE, ACK],
        );

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/recv"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 3), SessionStatus::InProgress);
        assert_eq!(storage.open_handles(), 0);

        // Sender waits for a fresh probe before the next header
        session.advance_at(&mut port, &mut storage, t1);
        assert_eq!(session.advance_at(&mut port, &mut storage, t1), SessionStatus::Idle);

        assert!(session.error().is_none());
        assert_eq!(storage.file("/recv/a.txt").unwrap(), pattern(100));
        assert_eq!(
            session.finish().unwrap(),
            vec![ReceivedFile { path: "/recv/a.txt".into(), bytes: 100 }]
        );
    }

    #[test]
    fn test_ymodem_batch_of_two() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();

        let mut input = header_frame(b"one.bin\0200\0");
        input.extend(frame(SOH, 1, &pattern(128), true));
        input.extend(frame(SOH, 2, &pattern(128)[..72], true));
        input.push(EOT);
        input.extend(header_frame(b"two.bin\05\0"));
        input.extend(frame(SOH, 1, b"hello", true));
        input.push(EOT);
        input.extend(header_frame(b""));

        let mut port = MockSerialPort::new(
            script(&[&input]),
            vec![CRC_PROBE, ACK, CRC_PROBE, ACK, ACK, ACK, ACK, CRC_PROBE, ACK, ACK, ACK],
        );

        let mut session = Session::start_at(&ReceiveConfig::ymodem(""), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        let mut first = pattern(128);
        first.extend_from_slice(&pattern(128)[..72]);
        assert_eq!(storage.file("/one.bin").unwrap(), first);
        assert_eq!(storage.file("/two.bin").unwrap(), b"hello");
        assert_eq!(session.received().len(), 2);
    }

    #[test]
    fn test_ymodem_empty_batch() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(script(&[&header_frame(b"")]), vec![CRC_PROBE, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        assert!(session.error().is_none());
        assert!(session.received().is_empty());
        assert!(storage.list_dir("/").unwrap().is_empty());
    }

    #[test]
    fn test_ymodem_replaces_existing_file() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new().with_file("/a.txt", &[0xEE; 4000]);

        let mut input = header_frame(b"a.txt\010\0");
        input.extend(frame(SOH, 1, &pattern(128), true));
        input.push(EOT);
        let mut port = MockSerialPort::new(script(&[&input]), vec![CRC_PROBE, ACK, CRC_PROBE, ACK, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        poll(&mut session, &mut port, &mut storage, t0, 1);
        assert_eq!(storage.file("/a.txt").unwrap(), pattern(10));
    }

    #[test]
    fn test_ymodem_unknown_size_keeps_whole_blocks() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();

        let mut input = header_frame(b"nosize\0");
        input.extend(frame(SOH, 1, b"abc", true));
        input.push(EOT);
        let mut port = MockSerialPort::new(script(&[&input]), vec![CRC_PROBE, ACK, CRC_PROBE, ACK, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        poll(&mut session, &mut port, &mut storage, t0, 1);
        assert_eq!(storage.file("/nosize").unwrap().len(), 128);
    }

    #[test]
    fn test_ymodem_duplicate_header_not_reopened() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let header = header_frame(b"d.txt\03\0");

        let mut input = header.clone();
        input.extend_from_slice(&header);
        input.extend(frame(SOH, 1, b"xyz", true));
        input.push(EOT);
        let mut port = MockSerialPort::new(script(&[&input]), vec![CRC_PROBE, ACK, CRC_PROBE, ACK, ACK, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        poll(&mut session, &mut port, &mut storage, t0, 1);
        assert_eq!(storage.file("/d.txt").unwrap(), b"xyz");
        assert_eq!(session.received().len(), 1);
    }

    #[test]
    fn test_ymodem_open_failure_cancels() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(script(&[&header_frame(b"a.txt\01\0")]), vec![CRC_PROBE, ACK, CAN]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/missing"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(session.advance_at(&mut port, &mut storage, t0), SessionStatus::InProgress);
        assert_eq!(session.state(), State::BlockStart);
        assert!(matches!(session.error(), Some(ReceiveError::Open { .. })));

        assert_eq!(session.advance_at(&mut port, &mut storage, t1), SessionStatus::Idle);
        match session.error() {
            Some(ReceiveError::Open { path, .. }) => assert_eq!(path, "/missing/a.txt"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_ymodem_filename_too_long() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        let mut storage = MemoryStorage::new();

        let mut content = "f".repeat(120).into_bytes();
        content.extend_from_slice(b"\01\0");
        let mut port = MockSerialPort::new(script(&[&header_frame(&content)]), vec![CRC_PROBE, ACK, CAN]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/a/deep/dir"), &mut port, &mut storage, t0).unwrap();
        session.advance_at(&mut port, &mut storage, t0);
        assert_eq!(session.advance_at(&mut port, &mut storage, t1), SessionStatus::Idle);
        assert!(matches!(session.error(), Some(ReceiveError::Path(PathError::TooLong { .. }))));
    }

    #[test]
    fn test_ymodem_malformed_header_cancels() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(script(&[&frame(SOH, 0, &[b'z'; 128], true)]), vec![CRC_PROBE, ACK, CAN]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        session.advance_at(&mut port, &mut storage, t0);
        assert_eq!(session.advance_at(&mut port, &mut storage, t1), SessionStatus::Idle);
        assert!(matches!(
            session.error(),
            Some(ReceiveError::Cancelled(CancelReason::MalformedHeader(HeaderError::Unterminated)))
        ));
    }

    #[test]
    fn test_ymodem_resent_header_clears_refusal() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        storage.fail_open(true);

        let header = header_frame(b"a.txt\03\0");
        let mut rest = header.clone();
        rest.extend(frame(SOH, 1, b"xyz", true));
        rest.push(EOT);
        rest.extend(header_frame(b""));
        let mut port = MockSerialPort::new(
            script(&[&header, &rest]),
            vec![CRC_PROBE, ACK, ACK, CRC_PROBE, ACK, ACK, ACK],
        );

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(session.advance_at(&mut port, &mut storage, t0), SessionStatus::InProgress);
        assert!(matches!(session.error(), Some(ReceiveError::Open { .. })));

        storage.fail_open(false);
        assert_eq!(session.advance_at(&mut port, &mut storage, t0), SessionStatus::Idle);
        assert!(session.error().is_none());
        assert_eq!(
            session.finish().unwrap(),
            vec![ReceivedFile { path: "/a.txt".to_string(), bytes: 3 }]
        );
    }

    #[test]
    fn test_ymodem_refused_file_reported_at_end_of_batch() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        storage.fail_open(true);

        let mut input = header_frame(b"a.txt\03\0");
        input.extend(header_frame(b""));
        let mut port = MockSerialPort::new(script(&[&input]), vec![CRC_PROBE, ACK, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);
        assert!(matches!(session.finish(), Err(ReceiveError::Open { .. })));
    }

    #[test]
    fn test_ymodem_flush_failure_aborts_batch() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        storage.fail_flush("/one.bin");

        let mut input = header_frame(b"one.bin\05\0");
        input.extend(frame(SOH, 1, b"first", true));
        input.push(EOT);
        let mut port = MockSerialPort::new(
            script(&[&input]),
            vec![CRC_PROBE, ACK, CRC_PROBE, ACK, ACK, CAN],
        );

        let mut session = Session::start_at(&ReceiveConfig::ymodem("/"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        assert!(session.received().is_empty());
        assert_eq!(storage.open_handles(), 0);
        match session.finish() {
            Err(ReceiveError::Write { path, .. }) => assert_eq!(path, "/one.bin"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_xmodem_write_failure_cancels() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(
            script(&[&frame(SOH, 1, b"data", true)]),
            vec![CRC_PROBE, ACK, CAN],
        );

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/w.bin"), &mut port, &mut storage, t0).unwrap();
        storage.fail_write(true);
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        assert_eq!(storage.open_handles(), 0);
        match session.finish() {
            Err(ReceiveError::Write { path, source }) => {
                assert_eq!(path, "/w.bin");
                assert_eq!(source.kind(), std::io::ErrorKind::StorageFull);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_write_failure_outlives_flush_failure() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        storage.fail_flush("/w.bin");
        let mut port = MockSerialPort::new(
            script(&[&frame(SOH, 1, b"data", true)]),
            vec![CRC_PROBE, ACK, CAN],
        );

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/w.bin"), &mut port, &mut storage, t0).unwrap();
        storage.fail_write(true);
        poll(&mut session, &mut port, &mut storage, t0, 1);

        assert_eq!(storage.open_handles(), 0);
        match session.finish() {
            Err(ReceiveError::Write { source, .. }) => assert_eq!(source.kind(), std::io::ErrorKind::StorageFull),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_channel_failure_closes_file_without_cancel() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(script(&[&frame(SOH, 1, b"data", true)]), vec![CRC_PROBE, ACK])
            .break_when_drained();

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/c.bin"), &mut port, &mut storage, t0).unwrap();
        assert_eq!(poll(&mut session, &mut port, &mut storage, t0, 1), SessionStatus::Idle);

        assert_eq!(storage.open_handles(), 0);
        assert_eq!(storage.file("/c.bin").unwrap().len(), 128);
        assert!(matches!(session.finish(), Err(ReceiveError::Channel(_))));
    }

    #[test]
    fn test_advance_after_idle_does_nothing() {
        let t0 = Instant::now();
        let mut storage = MemoryStorage::new();
        let mut port = MockSerialPort::new(script(&[&[EOT]]), vec![CRC_PROBE, ACK]);

        let mut session = Session::start_at(&ReceiveConfig::xmodem("/e"), &mut port, &mut storage, t0).unwrap();
        poll(&mut session, &mut port, &mut storage, t0, 1);
        port.push_input(&[SOH]);
        assert_eq!(session.advance_at(&mut port, &mut storage, t0 + Duration::from_secs(60)), SessionStatus::Idle);
        assert_eq!(port.read_byte().unwrap(), Some(SOH));
    }
}
