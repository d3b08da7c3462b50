//! CP/M style BDOS services.
//!
//! A program calls 0x0005 with the function number in C and its parameter
//! in E (bytes) or DE (addresses). The session intercepts the call and hands
//! it here as a [`BdosCall`]. The return value is 0 on success, 1 at end of
//! file and 0xFFFF for every failure.

use thiserror::Error;
use tracing::{debug, warn};

use crate::cpu::Intel8080;
use crate::disk::{self, DiskError, Drive, EXT_LEN, NAME_LEN, RECORD_SIZE};
use crate::memory::Memory;

pub const DEFAULT_DMA: u16 = 0x0080;
pub const CPM_VERSION: u16 = 0x0022;

pub const SUCCESS: u16 = 0x0000;
pub const END_OF_FILE: u16 = 0x0001;
pub const DISK_FULL: u16 = 0x0002;
pub const FAILURE: u16 = 0xFFFF;

// FCB layout
pub const FCB_NAME: u16 = 0x01;
pub const FCB_EXTENT: u16 = 0x0C;
pub const FCB_RECORD_COUNT: u16 = 0x0F;
pub const FCB_RENAME_TARGET: u16 = 0x10;
pub const FCB_CURRENT_RECORD: u16 = 0x20;

const EOF_PAD: u8 = 0x1A;

/// Records addressed by one extent; the current record byte counts 0..=128
/// within the extent selected by the EX byte.
pub const RECORDS_PER_EXTENT: usize = 128;
/// Sequential access ends where EX can no longer advance.
pub const MAX_RECORDS: usize = 256 * RECORDS_PER_EXTENT;

/// BDOS function numbers
pub mod function {
    pub const SYSTEM_RESET: u8 = 0;
    pub const CONSOLE_INPUT: u8 = 1;
    pub const CONSOLE_OUTPUT: u8 = 2;
    pub const PRINT_STRING: u8 = 9;
    pub const READ_CONSOLE_BUFFER: u8 = 10;
    pub const CONSOLE_STATUS: u8 = 11;
    pub const VERSION: u8 = 12;
    pub const RESET_DISK_SYSTEM: u8 = 13;
    pub const SELECT_DISK: u8 = 14;
    pub const OPEN_FILE: u8 = 15;
    pub const CLOSE_FILE: u8 = 16;
    pub const SEARCH_FIRST: u8 = 17;
    pub const SEARCH_NEXT: u8 = 18;
    pub const DELETE_FILE: u8 = 19;
    pub const READ_SEQUENTIAL: u8 = 20;
    pub const WRITE_SEQUENTIAL: u8 = 21;
    pub const MAKE_FILE: u8 = 22;
    pub const RENAME_FILE: u8 = 23;
    pub const CURRENT_DISK: u8 = 25;
    pub const SET_DMA: u8 = 26;
    pub const USER_NUMBER: u8 = 32;
    pub const SET_USER_NUMBER: u8 = 33;

    pub fn name(function: u8) -> &'static str {
        match function {
            SYSTEM_RESET => "system reset",
            CONSOLE_INPUT => "console input",
            CONSOLE_OUTPUT => "console output",
            PRINT_STRING => "print string",
            READ_CONSOLE_BUFFER => "read console buffer",
            CONSOLE_STATUS => "console status",
            VERSION => "version",
            RESET_DISK_SYSTEM => "reset disk system",
            SELECT_DISK => "select disk",
            OPEN_FILE => "open file",
            CLOSE_FILE => "close file",
            SEARCH_FIRST => "search first",
            SEARCH_NEXT => "search next",
            DELETE_FILE => "delete file",
            READ_SEQUENTIAL => "read sequential",
            WRITE_SEQUENTIAL => "write sequential",
            MAKE_FILE => "make file",
            RENAME_FILE => "rename file",
            CURRENT_DISK => "current disk",
            SET_DMA => "set dma",
            USER_NUMBER => "get user number",
            SET_USER_NUMBER => "set user number",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum BdosError {
    #[error("unknown BDOS function {0}")]
    UnknownFunction(u8),
    #[error("no such drive {0}")]
    NoSuchDrive(usize),
    #[error("no more directory entries")]
    NoMatch,
    #[error(transparent)]
    Disk(#[from] DiskError),
}

/// Registers handed to the BDOS at the 0x0005 entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdosCall {
    pub function: u8,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
}

impl BdosCall {
    pub fn new(function: u8, de: u16) -> Self {
        BdosCall {
            function,
            bc: function as u16,
            de,
            hl: 0,
        }
    }

    pub fn from_cpu(cpu: &Intel8080) -> Self {
        BdosCall {
            function: cpu.c,
            bc: cpu.bc(),
            de: cpu.de(),
            hl: cpu.hl(),
        }
    }

    /// Byte parameter, register E.
    pub fn e(&self) -> u8 {
        self.de as u8
    }
}

/// Host side of the console.
pub trait Console {
    fn put_char(&mut self, ch: u8);

    fn put_str(&mut self, text: &[u8]) {
        for &ch in text {
            self.put_char(ch);
        }
    }

    /// Next queued character, `None` when the host has nothing queued.
    fn get_char(&mut self) -> Option<u8>;

    /// Next queued line with its terminator stripped.
    fn get_line(&mut self) -> Option<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            match self.get_char() {
                Some(b'\r') | Some(b'\n') => return Some(line),
                Some(ch) => line.push(ch),
                None if line.is_empty() => return None,
                None => return Some(line),
            }
        }
    }
}

#[derive(Debug)]
struct SearchState {
    matches: Vec<String>,
    next: usize,
}

pub struct Bdos {
    drives: Vec<Box<dyn Drive>>,
    current_drive: usize,
    dma: u16,
    user: u8,
    search: Option<SearchState>,
}

impl Bdos {
    pub fn new(drives: Vec<Box<dyn Drive>>) -> Self {
        Bdos {
            drives,
            current_drive: 0,
            dma: DEFAULT_DMA,
            user: 0,
            search: None,
        }
    }

    pub fn reset(&mut self) {
        self.current_drive = 0;
        self.dma = DEFAULT_DMA;
        self.search = None;
    }

    pub fn current_drive(&self) -> usize { self.current_drive }
    pub fn drive_count(&self) -> usize { self.drives.len() }
    pub fn dma(&self) -> u16 { self.dma }
    pub fn user(&self) -> u8 { self.user }

    pub fn select_drive(&mut self, index: usize) -> Result<(), BdosError> {
        if index >= self.drives.len() {
            return Err(BdosError::NoSuchDrive(index));
        }
        self.current_drive = index;
        Ok(())
    }

    pub fn drive(&self, index: usize) -> Option<&dyn Drive> {
        self.drives.get(index).map(|drive| drive.as_ref())
    }

    pub fn drive_mut(&mut self, index: usize) -> Option<&mut (dyn Drive + 'static)> {
        self.drives.get_mut(index).map(|drive| drive.as_mut())
    }

    pub fn current(&self) -> &dyn Drive {
        self.drives[self.current_drive].as_ref()
    }

    pub fn current_mut(&mut self) -> &mut (dyn Drive + 'static) {
        self.drives[self.current_drive].as_mut()
    }

    /// Run one BDOS function and return the value for HL.
    pub fn execute(&mut self, memory: &mut Memory, console: &mut dyn Console, call: BdosCall) -> u16 {
        debug!("bdos {} ({}) de={:04X}", call.function, function::name(call.function), call.de);

        match self.dispatch(memory, console, call) {
            Ok(result) => result,
            Err(BdosError::UnknownFunction(number)) => {
                warn!("unknown BDOS function {}", number);
                FAILURE
            }
            Err(err) => {
                debug!("bdos {} failed: {}", function::name(call.function), err);
                FAILURE
            }
        }
    }

    fn dispatch(&mut self, memory: &mut Memory, console: &mut dyn Console, call: BdosCall) -> Result<u16, BdosError> {
        use function::*;

        let fcb = call.de;
        match call.function {
            SYSTEM_RESET | RESET_DISK_SYSTEM => {
                self.reset();
                Ok(SUCCESS)
            }
            CONSOLE_INPUT => Ok(self.console_input(console)),
            CONSOLE_OUTPUT => {
                console.put_char(call.e());
                Ok(SUCCESS)
            }
            PRINT_STRING => {
                self.print_string(memory, console, call.de);
                Ok(SUCCESS)
            }
            READ_CONSOLE_BUFFER => {
                self.read_console_buffer(memory, console, call.de);
                Ok(SUCCESS)
            }
            CONSOLE_STATUS => Ok(0x00FF),
            VERSION => Ok(CPM_VERSION),
            SELECT_DISK => {
                self.select_drive(call.e() as usize)?;
                Ok(SUCCESS)
            }
            OPEN_FILE => self.open_file(memory, fcb),
            CLOSE_FILE => self.close_file(memory, fcb),
            SEARCH_FIRST => self.search_first(memory, fcb),
            SEARCH_NEXT => self.search_next(memory),
            DELETE_FILE => self.delete_files(memory, fcb),
            READ_SEQUENTIAL => self.read_sequential(memory, fcb),
            WRITE_SEQUENTIAL => self.write_sequential(memory, fcb),
            MAKE_FILE => self.make_file(memory, fcb),
            RENAME_FILE => self.rename_file(memory, fcb),
            CURRENT_DISK => Ok(self.current_drive as u16),
            SET_DMA => {
                self.dma = call.de;
                Ok(SUCCESS)
            }
            USER_NUMBER => Ok(self.user as u16),
            SET_USER_NUMBER => {
                self.user = call.e() & 0x1F;
                Ok(SUCCESS)
            }
            other => Err(BdosError::UnknownFunction(other)),
        }
    }

    fn console_input(&mut self, console: &mut dyn Console) -> u16 {
        match console.get_char() {
            Some(ch) => {
                console.put_char(ch);
                ch as u16
            }
            None => 0,
        }
    }

    fn print_string(&mut self, memory: &Memory, console: &mut dyn Console, address: u16) {
        let mut text = Vec::new();
        let mut addr = address;
        // At most one full pass over memory
        for _ in 0..=u16::MAX {
            let ch = memory.read(addr);
            if ch == b'$' {
                break;
            }
            text.push(ch);
            addr = addr.wrapping_add(1);
        }
        console.put_str(&text);
    }

    fn read_console_buffer(&mut self, memory: &mut Memory, console: &mut dyn Console, address: u16) {
        let max_len = memory.read(address) as usize;
        let line = console.get_line().unwrap_or_default();

        let accepted = &line[..line.len().min(max_len)];
        console.put_str(accepted);
        console.put_str(b"\r\n");

        memory.write(address.wrapping_add(1), accepted.len() as u8);
        for (i, &ch) in accepted.iter().enumerate() {
            memory.write(address.wrapping_add(2 + i as u16), ch);
        }
    }

    // File operations

    /// Drive selected by the FCB drive byte, 0 meaning the current drive.
    fn fcb_drive(&self, memory: &Memory, fcb: u16) -> Result<usize, BdosError> {
        let index = match memory.read(fcb) as usize {
            0 => self.current_drive,
            n => n - 1,
        };
        if index >= self.drives.len() {
            return Err(BdosError::NoSuchDrive(index));
        }
        Ok(index)
    }

    fn fcb_name(memory: &Memory, fcb: u16) -> String {
        let raw: Vec<u8> = (0..(NAME_LEN + EXT_LEN) as u16)
            .map(|i| memory.read(fcb.wrapping_add(FCB_NAME + i)))
            .collect();
        disk::name_from_fcb(&raw)
    }

    fn file_len(&self, drive: usize, name: &str) -> Result<usize, BdosError> {
        self.drives[drive]
            .get_file(name)
            .map(|data| data.len())
            .ok_or_else(|| DiskError::NotFound(name.to_string()).into())
    }

    fn open_file(&mut self, memory: &mut Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let name = Self::fcb_name(memory, fcb);
        let len = self.file_len(drive, &name)?;

        set_position(memory, fcb, 0, len.div_ceil(RECORD_SIZE));
        Ok(SUCCESS)
    }

    fn close_file(&mut self, memory: &Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let name = Self::fcb_name(memory, fcb);
        self.file_len(drive, &name)?;
        Ok(SUCCESS)
    }

    fn search_first(&mut self, memory: &mut Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let pattern = Self::fcb_name(memory, fcb);

        let matches = self.drives[drive]
            .list_files()
            .into_iter()
            .filter(|name| disk::matches_pattern(name, &pattern))
            .collect();
        self.search = Some(SearchState { matches, next: 0 });
        self.search_next(memory)
    }

    fn search_next(&mut self, memory: &mut Memory) -> Result<u16, BdosError> {
        let search = self.search.as_mut().ok_or(BdosError::NoMatch)?;
        let name = search.matches.get(search.next).cloned().ok_or(BdosError::NoMatch)?;
        search.next += 1;

        self.write_directory_entry(memory, &name);
        Ok(SUCCESS)
    }

    fn write_directory_entry(&self, memory: &mut Memory, name: &str) {
        memory.write(self.dma, self.user);
        for (i, &byte) in disk::fcb_name(name).iter().enumerate() {
            memory.write(self.dma.wrapping_add(1 + i as u16), byte);
        }
    }

    fn delete_files(&mut self, memory: &Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let pattern = Self::fcb_name(memory, fcb);

        let doomed: Vec<String> = self.drives[drive]
            .list_files()
            .into_iter()
            .filter(|name| disk::matches_pattern(name, &pattern))
            .collect();
        if doomed.is_empty() {
            return Err(DiskError::NotFound(pattern).into());
        }
        for name in &doomed {
            self.drives[drive].delete_file(name)?;
        }
        Ok(SUCCESS)
    }

    fn read_sequential(&mut self, memory: &mut Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let name = Self::fcb_name(memory, fcb);
        let data = self.drives[drive]
            .get_file(&name)
            .ok_or_else(|| DiskError::NotFound(name.clone()))?;

        let record = position(memory, fcb);
        let offset = record * RECORD_SIZE;
        if record >= MAX_RECORDS || offset >= data.len() {
            return Ok(END_OF_FILE);
        }

        let chunk = &data[offset..data.len().min(offset + RECORD_SIZE)];
        for i in 0..RECORD_SIZE {
            let byte = chunk.get(i).copied().unwrap_or(EOF_PAD);
            memory.write(self.dma.wrapping_add(i as u16), byte);
        }
        let records = data.len().div_ceil(RECORD_SIZE);
        set_position(memory, fcb, record + 1, records);
        Ok(SUCCESS)
    }

    fn write_sequential(&mut self, memory: &mut Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let name = Self::fcb_name(memory, fcb);
        let mut data = self.drives[drive]
            .get_file(&name)
            .ok_or_else(|| DiskError::NotFound(name.clone()))?
            .to_vec();

        let record = position(memory, fcb);
        if record >= MAX_RECORDS {
            warn!("{} is at the last extent", name);
            return Ok(DISK_FULL);
        }
        let offset = record * RECORD_SIZE;
        if data.len() < offset + RECORD_SIZE {
            data.resize(offset + RECORD_SIZE, 0);
        }
        for i in 0..RECORD_SIZE {
            data[offset + i] = memory.read(self.dma.wrapping_add(i as u16));
        }
        let records = data.len().div_ceil(RECORD_SIZE);
        self.drives[drive].save_file(&name, data)?;

        set_position(memory, fcb, record + 1, records);
        Ok(SUCCESS)
    }

    fn make_file(&mut self, memory: &mut Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let name = Self::fcb_name(memory, fcb);
        if self.drives[drive].contains(&name) {
            return Err(DiskError::AlreadyExists(name).into());
        }

        self.drives[drive].save_file(&name, Vec::new())?;
        set_position(memory, fcb, 0, 0);
        Ok(SUCCESS)
    }

    fn rename_file(&mut self, memory: &Memory, fcb: u16) -> Result<u16, BdosError> {
        let drive = self.fcb_drive(memory, fcb)?;
        let old_name = Self::fcb_name(memory, fcb);
        let new_name = Self::fcb_name(memory, fcb.wrapping_add(FCB_RENAME_TARGET));

        self.drives[drive].rename_file(&old_name, &new_name)?;
        Ok(SUCCESS)
    }
}

/// Write `name` into the FCB at `fcb` with the given drive byte and a
/// zeroed record cursor.
pub fn write_fcb(memory: &mut Memory, fcb: u16, drive: u8, name: &str) {
    memory.write(fcb, drive);
    for (i, &byte) in disk::fcb_name(name).iter().enumerate() {
        memory.write(fcb.wrapping_add(FCB_NAME + i as u16), byte);
    }
    set_position(memory, fcb, 0, 0);
}

/// Sequential record number held in the FCB: EX * 128 + CR.
pub fn position(memory: &Memory, fcb: u16) -> usize {
    let extent = memory.read(fcb.wrapping_add(FCB_EXTENT)) as usize;
    let record = memory.read(fcb.wrapping_add(FCB_CURRENT_RECORD)) as usize;
    extent * RECORDS_PER_EXTENT + record.min(RECORDS_PER_EXTENT)
}

/// Point the FCB at record `next` of a file `records` long. EX, CR and
/// the extent's record count RC are all updated. Past the last extent
/// the cursor parks at EX=255, CR=128.
fn set_position(memory: &mut Memory, fcb: u16, next: usize, records: usize) {
    let (extent, record) = if next < MAX_RECORDS {
        (next / RECORDS_PER_EXTENT, next % RECORDS_PER_EXTENT)
    } else {
        (MAX_RECORDS / RECORDS_PER_EXTENT - 1, RECORDS_PER_EXTENT)
    };
    let in_extent = records
        .saturating_sub(extent * RECORDS_PER_EXTENT)
        .min(RECORDS_PER_EXTENT);

    memory.write(fcb.wrapping_add(FCB_EXTENT), extent as u8);
    memory.write(fcb.wrapping_add(FCB_CURRENT_RECORD), record as u8);
    memory.write(fcb.wrapping_add(FCB_RECORD_COUNT), in_extent as u8);
}
