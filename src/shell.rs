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

//! Line-oriented file browser served over the serial port

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, warn};
use crate::path;
use crate::receiver::{ReceiveConfig, Session, SessionStatus, Timeouts};
use crate::serial::SerialPort;
use crate::storage::Storage;

pub const PROMPT: &[u8] = b"$ ";

/// Line length that triggers execution without a carriage return
pub const MAX_LINE: usize = 80;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7F;

const TYPE_CHUNK: usize = 512;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub use_crc: bool,
    pub one_k: bool,
    pub timeouts: Timeouts,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            use_crc: true,
            one_k: true,
            timeouts: Timeouts::default(),
        }
    }
}

type Handler<P, S> = Rc<dyn Fn(&mut Shell<P, S>, Option<&str>, Instant) -> io::Result<()>>;

/// Command names mapped to their handlers. `names` keeps registration
/// order for `help`.
struct CommandTable<P, S> {
    names: Vec<&'static str>,
    handlers: HashMap<&'static str, Handler<P, S>>,
}

impl<P, S> CommandTable<P, S> {
    fn new() -> Self {
        CommandTable {
            names: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    fn register(&mut self, names: &[&'static str], handler: Handler<P, S>) {
        for &name in names {
            self.names.push(name);
            self.handlers.insert(name, Rc::clone(&handler));
        }
    }

    fn get(&self, name: &str) -> Option<Handler<P, S>> {
        self.handlers.get(name).cloned()
    }
}

enum Activity {
    Command,
    Capture { path: String, file: Box<dyn Write> },
    Transfer(Session),
}

pub struct Shell<P, S> {
    port: P,
    storage: S,
    config: ShellConfig,
    cwd: String,
    line: Vec<u8>,
    activity: Activity,
    commands: CommandTable<P, S>,
}

impl<P: SerialPort + 'static, S: Storage + 'static> Shell<P, S> {
    pub fn new(port: P, storage: S, config: ShellConfig) -> Self {
        Shell {
            port,
            storage,
            config,
            cwd: String::from("/"),
            line: Vec::with_capacity(MAX_LINE),
            activity: Activity::Command,
            commands: Self::command_table(),
        }
    }

    fn command_table() -> CommandTable<P, S> {
        let mut table = CommandTable::new();
        table.register(&["dir", "ls"], Rc::new(Self::list_dir));
        table.register(&["pwd"], Rc::new(Self::print_working_dir));
        table.register(&["cd"], Rc::new(Self::change_dir));
        table.register(&["mkdir"], Rc::new(Self::make_dir));
        table.register(&["rmdir"], Rc::new(Self::remove_dir));
        table.register(&["del", "rm"], Rc::new(Self::remove_file));
        table.register(&["type", "cat"], Rc::new(Self::type_file));
        table.register(&["capture"], Rc::new(Self::capture_file));
        table.register(&["rx"], Rc::new(Self::receive_xmodem));
        table.register(&["rb"], Rc::new(Self::receive_ymodem));
        table.register(&["help", "?"], Rc::new(Self::print_commands));
        table
    }

    /// Print the first prompt
    pub fn start(&mut self) -> io::Result<()> {
        self.port.write_all(PROMPT)?;
        self.port.flush()
    }

    pub fn poll(&mut self) -> io::Result<()> {
        self.poll_at(Instant::now())
    }

    /// Handle whatever input is waiting. Only channel errors are returned;
    /// everything else is reported to the user on the port.
    pub fn poll_at(&mut self, now: Instant) -> io::Result<()> {
        let finished = match &mut self.activity {
            Activity::Transfer(session) => {
                session.advance_at(&mut self.port, &mut self.storage, now) == SessionStatus::Idle
            }
            _ => false,
        };
        if finished {
            if let Activity::Transfer(session) = std::mem::replace(&mut self.activity, Activity::Command) {
                debug!(state = ?session.state(), "transfer finished");
                self.report(&session)?;
            }
            return self.port.flush();
        }
        if matches!(self.activity, Activity::Transfer(_)) {
            return Ok(());
        }

        while self.port.bytes_available()? > 0 {
            let Some(byte) = self.port.read_byte()? else {
                break;
            };

            match self.activity {
                Activity::Capture { .. } => self.capture_byte(byte)?,
                Activity::Command => self.edit_line(byte, now)?,
                Activity::Transfer(_) => {}
            }

            // Anything still buffered belongs to the sender
            if matches!(self.activity, Activity::Transfer(_)) {
                break;
            }
        }
        self.port.flush()
    }

    // ========================================================================
    // Input Handling
    // ========================================================================

    fn edit_line(&mut self, byte: u8, now: Instant) -> io::Result<()> {
        match byte {
            b'\n' => Ok(()),
            b'\r' => {
                self.port.write_all(b"\r\n")?;
                self.execute_line(now)
            }
            BACKSPACE | DEL => {
                if self.line.pop().is_some() {
                    self.port.write_all(b"\x08 \x08")?;
                }
                Ok(())
            }
            CTRL_C => {
                self.line.clear();
                self.port.write_all(b"^C\r\n")?;
                self.port.write_all(PROMPT)
            }
            _ => {
                self.port.write_all(&[byte])?;
                self.line.push(byte);
                if self.line.len() >= MAX_LINE {
                    self.port.write_all(b"\r\n")?;
                    self.execute_line(now)?;
                }
                Ok(())
            }
        }
    }

    fn capture_byte(&mut self, byte: u8) -> io::Result<()> {
        if byte == CTRL_D {
            if let Activity::Capture { path, mut file } = std::mem::replace(&mut self.activity, Activity::Command) {
                if let Err(e) = file.flush() {
                    warn!(path = %path, error = %e, "capture flush failed");
                }
                info!(path = %path, "capture finished");
            }
            return self.port.write_all(PROMPT);
        }

        if let Activity::Capture { path, file } = &mut self.activity {
            if let Err(e) = file.write_all(&[byte]) {
                warn!(path = %path, error = %e, "capture write failed");
                self.activity = Activity::Command;
                return self.port.write_all(PROMPT);
            }
        }
        Ok(())
    }

    fn execute_line(&mut self, now: Instant) -> io::Result<()> {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        self.execute(&line, now)?;

        if matches!(self.activity, Activity::Command) {
            self.port.write_all(PROMPT)?;
        }
        Ok(())
    }

    fn execute(&mut self, line: &str, now: Instant) -> io::Result<()> {
        let mut tokens = line.split([' ', '\t']).filter(|t| !t.is_empty());
        let Some(name) = tokens.next() else {
            return Ok(());
        };
        let name = name.to_ascii_lowercase();
        let arg = tokens.next();

        match self.commands.get(&name) {
            Some(handler) => {
                debug!(command = %name, arg = ?arg, "executing");
                handler(self, arg, now)
            }
            None => self.println("command not found"),
        }
    }

    fn println(&mut self, text: &str) -> io::Result<()> {
        self.port.write_all(text.as_bytes())?;
        self.port.write_all(b"\r\n")
    }

    /// Resolve a command argument against the working directory, printing
    /// the reason when it cannot be.
    fn resolve(&mut self, arg: Option<&str>) -> io::Result<Option<String>> {
        match path::join(&self.cwd, arg.unwrap_or("")) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                self.println(&e.to_string())?;
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn list_dir(&mut self, _arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let entries = match self.storage.list_dir(&self.cwd) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.cwd, error = %e, "list failed");
                return self.println("Directory open failed");
            }
        };

        for entry in entries {
            let mut text = format!("{} {}", entry.name, entry.size);
            if entry.is_dir {
                text.push_str(" <DIR>");
            }
            self.println(&text)?;
        }
        Ok(())
    }

    fn print_working_dir(&mut self, _arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let cwd = self.cwd.clone();
        self.println(&cwd)
    }

    fn change_dir(&mut self, arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        let path = path::normalize(&path);

        if path != "/" {
            if !self.storage.exists(&path) {
                return self.println("Directory does not exist.");
            }
            if !self.storage.is_dir(&path) {
                return self.println("Not a directory");
            }
        }
        self.cwd = path;
        Ok(())
    }

    fn make_dir(&mut self, arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        if self.storage.exists(&path) {
            return Ok(());
        }
        if let Err(e) = self.storage.mkdir(&path) {
            debug!(path = %path, error = %e, "mkdir failed");
            return self.println("Error, failed to create directory!");
        }
        Ok(())
    }

    fn remove_dir(&mut self, arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        if let Err(e) = self.storage.rmdir(&path) {
            debug!(path = %path, error = %e, "rmdir failed");
            return self.println("Error, couldn't delete directory!");
        }
        Ok(())
    }

    fn remove_file(&mut self, arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        if let Err(e) = self.storage.remove(&path) {
            debug!(path = %path, error = %e, "remove failed");
            return self.println("Error, couldn't delete file!");
        }
        Ok(())
    }

    fn type_file(&mut self, arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        let mut reader = match self.storage.open_read(&path) {
            Ok(reader) => reader,
            Err(e) => {
                debug!(path = %path, error = %e, "open for reading failed");
                return self.println("Error, failed to open file for reading!");
            }
        };

        let mut chunk = [0u8; TYPE_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.port.write_all(&chunk[..n])?,
                Err(e) => {
                    warn!(path = %path, error = %e, "read failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn capture_file(&mut self, arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        match self.storage.open_write(&path) {
            Ok(file) => {
                info!(path = %path, "capturing until ^D");
                self.activity = Activity::Capture { path, file };
                Ok(())
            }
            Err(e) => {
                debug!(path = %path, error = %e, "open for writing failed");
                self.println("Error, failed to open file!")
            }
        }
    }

    fn receive_xmodem(&mut self, arg: Option<&str>, now: Instant) -> io::Result<()> {
        let Some(path) = self.resolve(arg)? else {
            return Ok(());
        };
        let config = ReceiveConfig::xmodem(&path);
        self.start_transfer(config, now)
    }

    fn receive_ymodem(&mut self, arg: Option<&str>, now: Instant) -> io::Result<()> {
        let dir = match arg {
            Some(_) => match self.resolve(arg)? {
                Some(dir) => dir,
                None => return Ok(()),
            },
            None => self.cwd.clone(),
        };
        let config = ReceiveConfig::ymodem(&dir);
        self.start_transfer(config, now)
    }

    fn start_transfer(&mut self, config: ReceiveConfig, now: Instant) -> io::Result<()> {
        let config = config
            .with_crc(self.config.use_crc)
            .with_one_k(self.config.one_k)
            .with_timeouts(self.config.timeouts);

        match Session::start_at(&config, &mut self.port, &mut self.storage, now) {
            Ok(session) => {
                self.activity = Activity::Transfer(session);
                Ok(())
            }
            Err(e) => self.println(&format!("transfer failed: {}", e)),
        }
    }

    fn print_commands(&mut self, _arg: Option<&str>, _now: Instant) -> io::Result<()> {
        let text = self.commands.names.join(",");
        self.println(&text)
    }

    fn report(&mut self, session: &Session) -> io::Result<()> {
        self.port.write_all(b"\r\n")?;
        match session.error() {
            Some(e) => self.println(&format!("transfer failed: {}", e))?,
            None => {
                for file in session.received() {
                    self.println(&format!("received {} ({} bytes)", file.path, file.bytes))?;
                }
            }
        }
        self.port.write_all(PROMPT)
    }
}
