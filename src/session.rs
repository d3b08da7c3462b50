//! Emulator sessions.
//!
//! A [`Session`] owns one complete machine: memory, processor, BDOS with its
//! drives, and the console buffers the HTTP layer reads and writes. The run
//! loop intercepts the BDOS entry point at 0x0005, so neither the processor
//! nor the BDOS knows about the other.
//!
//! Console lines go to the command processor, or to the line editor or
//! BASIC while one of them is open.
//!
//! [`SessionManager`] keeps sessions by id and drops the ones nobody has
//! touched for longer than the configured timeout.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assembler::{self, Assembly};
use crate::basic::{Basic, BasicStatus};
use crate::bdos::{function, Bdos, BdosCall, Console};
use crate::ccp::{self, CommandOutcome};
use crate::config::Config;
use crate::cpu::{CpuEvents, Intel8080};
use crate::disk::{DirectoryDrive, DiskError, Drive, MemoryDrive};
use crate::editor::{EditorStatus, LineEditor};
use crate::memory::{Memory, MemoryError};
use crate::metrics::{self, Timer};
use crate::opcodes;

/// Programs that return or jump here end up on a HLT.
pub const WARM_BOOT: u16 = 0x0000;
pub const BDOS_ENTRY: u16 = 0x0005;
/// Top of the transient program area, published at 0x0006
pub const BDOS_BASE: u16 = 0xFE00;
pub const STACK_TOP: u16 = BDOS_BASE;

const HLT: u8 = 0x76;
const RET: u8 = 0xC9;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Disk(#[from] DiskError),
}

#[derive(Debug, Default)]
struct ConsoleBuffers {
    input: VecDeque<u8>,
    output: Vec<u8>,
    /// Last byte queued was a CR, so a following LF ends the same line
    after_cr: bool,
}

/// Console shared between the processor's port events and the BDOS.
#[derive(Debug, Clone, Default)]
pub struct SharedConsole(Arc<Mutex<ConsoleBuffers>>);

impl SharedConsole {
    fn lock(&self) -> MutexGuard<'_, ConsoleBuffers> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue keyboard input. CRLF is folded to a single CR.
    pub fn push_input(&self, bytes: &[u8]) {
        let mut buffers = self.lock();
        for &byte in bytes {
            if !(byte == b'\n' && buffers.after_cr) {
                buffers.input.push_back(byte);
            }
            buffers.after_cr = byte == b'\r';
        }
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().output)
    }

    pub fn has_input(&self) -> bool {
        !self.lock().input.is_empty()
    }

    /// True when a terminated line is waiting.
    pub fn has_line(&self) -> bool {
        self.lock().input.iter().any(|&ch| ch == b'\r' || ch == b'\n')
    }

    fn clear_input(&self) {
        let mut buffers = self.lock();
        buffers.input.clear();
        buffers.after_cr = false;
    }
}

impl Console for SharedConsole {
    fn put_char(&mut self, ch: u8) {
        self.lock().output.push(ch);
    }

    fn put_str(&mut self, text: &[u8]) {
        self.lock().output.extend_from_slice(text);
    }

    fn get_char(&mut self) -> Option<u8> {
        self.lock().input.pop_front()
    }
}

// Unclaimed ports are the console's data port
impl CpuEvents for SharedConsole {
    fn output(&mut self, _port: u8, value: u8) {
        self.put_char(value);
    }

    fn input(&mut self, _port: u8) -> u8 {
        self.get_char().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    Halted,
    /// Stopped on a console read with nothing queued; PC stays at 0x0005
    AwaitingInput,
    CycleLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub cycles: u64,
    pub instructions: u64,
    pub halted: bool,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuState {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub flags: u8,
    pub sp: u16,
    pub pc: u16,
    pub halted: bool,
    pub interrupts_enabled: bool,
    pub cycles: u64,
    pub instructions: u64,
    pub awaiting_input: bool,
}

/// Who reads the next console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionMode {
    Ccp,
    Editor,
    Basic,
    /// `EXIT` was entered; the session takes no more commands
    Exited,
}

enum Mode {
    Ccp,
    Editor(LineEditor),
    Basic(Basic),
    Exited,
}

enum Advance {
    Executed(u32),
    Halted,
    WaitingForInput,
}

pub struct Session {
    id: String,
    cpu: Intel8080,
    memory: Memory,
    bdos: Bdos,
    console: SharedConsole,
    cycles: u64,
    instructions: u64,
    awaiting_input: bool,
    // Started from the command line; prompt again when it ends
    from_ccp: bool,
    mode: Mode,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, drives: Vec<Box<dyn Drive>>) -> Self {
        let console = SharedConsole::default();
        let mut session = Session {
            id: id.into(),
            cpu: Intel8080::with_events(Box::new(console.clone())),
            memory: Memory::new(),
            bdos: Bdos::new(drives),
            console,
            cycles: 0,
            instructions: 0,
            awaiting_input: false,
            from_ccp: false,
            mode: Mode::Ccp,
            created_at: Utc::now(),
        };
        session.install_low_memory();
        session.write_prompt();
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cpu(&self) -> &Intel8080 {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Intel8080 {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn bdos(&self) -> &Bdos {
        &self.bdos
    }

    pub fn bdos_mut(&mut self) -> &mut Bdos {
        &mut self.bdos
    }

    pub fn awaiting_input(&self) -> bool {
        self.awaiting_input
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn mode(&self) -> SessionMode {
        match self.mode {
            Mode::Ccp => SessionMode::Ccp,
            Mode::Editor(_) => SessionMode::Editor,
            Mode::Basic(_) => SessionMode::Basic,
            Mode::Exited => SessionMode::Exited,
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.mode, Mode::Exited)
    }

    /// Clear memory and processor and return the BDOS to drive A.
    /// Files on the drives and pending console output survive.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.memory.clear();
        self.install_low_memory();
        self.bdos.reset();
        self.console.clear_input();
        self.cycles = 0;
        self.instructions = 0;
        self.awaiting_input = false;
        self.from_ccp = false;
        if !self.has_exited() {
            self.mode = Mode::Ccp;
        }
        info!("session {} reset", self.id);
    }

    fn install_low_memory(&mut self) {
        self.memory.write(WARM_BOOT, HLT);
        self.memory.write(BDOS_ENTRY, RET);
        self.memory.write_u16(BDOS_ENTRY + 1, BDOS_BASE);
    }

    pub fn load(&mut self, address: u16, bytes: &[u8]) -> Result<(), SessionError> {
        self.memory.load(address, bytes)?;
        debug!("session {} loaded {} bytes at {:04X}", self.id, bytes.len(), address);
        Ok(())
    }

    pub fn dump(&self, address: u16, length: usize) -> Result<Vec<u8>, SessionError> {
        Ok(self.memory.dump(address, length)?)
    }

    /// Assemble `source` at `origin` and load the result when it is clean.
    pub fn assemble(&mut self, source: &str, origin: u16) -> Result<Assembly, SessionError> {
        let assembly = assembler::assemble_at(source, origin);
        metrics::record_assembly(assembly.is_ok());
        if assembly.is_ok() {
            self.load(assembly.origin, &assembly.bytes)?;
        }
        info!(
            "session {} assembled {} bytes, {} diagnostics",
            self.id,
            assembly.bytes.len(),
            assembly.diagnostics.len()
        );
        Ok(assembly)
    }

    /// Set the processor up to run a program at `entry` the way CP/M
    /// starts a transient: fresh registers, stack below the BDOS and a
    /// return address pointing at warm boot.
    fn start_program(&mut self, entry: u16) {
        self.cpu.reset();
        self.cpu.sp = STACK_TOP;
        self.cpu.push(&mut self.memory, WARM_BOOT);
        self.cpu.pc = entry;
        self.awaiting_input = false;
        self.from_ccp = false;
    }

    /// Run until halt, a console read with no input, or `max_cycles`.
    ///
    /// With a `start` address the program is started fresh from there,
    /// otherwise execution resumes where it stopped.
    pub fn run(&mut self, start: Option<u16>, max_cycles: u64) -> RunReport {
        if let Some(entry) = start {
            self.start_program(entry);
        }
        let timer = Timer::new();
        let mut cycles = 0u64;
        let mut instructions = 0u64;
        self.awaiting_input = false;

        while cycles < max_cycles {
            match self.advance() {
                Advance::Executed(cost) => {
                    cycles += cost as u64;
                    instructions += 1;
                }
                Advance::Halted => break,
                Advance::WaitingForInput => {
                    self.awaiting_input = true;
                    break;
                }
            }
        }

        self.cycles += cycles;
        self.instructions += instructions;
        metrics::record_execution(instructions, cycles, timer.elapsed());

        let halted = self.cpu.is_halted();
        let outcome = if halted {
            RunOutcome::Halted
        } else if self.awaiting_input {
            RunOutcome::AwaitingInput
        } else {
            RunOutcome::CycleLimit
        };

        if halted && self.from_ccp {
            self.from_ccp = false;
            self.console.clone().put_str(b"\r\n");
            self.write_prompt();
        }
        debug!("session {} ran {} cycles: {:?}", self.id, cycles, outcome);

        RunReport {
            cycles,
            instructions,
            halted,
            outcome,
        }
    }

    /// One instruction, or one BDOS call when PC is at the entry point.
    pub fn step(&mut self) -> u32 {
        match self.advance() {
            Advance::Executed(cost) => {
                self.cycles += cost as u64;
                self.instructions += 1;
                self.awaiting_input = false;
                cost
            }
            Advance::WaitingForInput => {
                self.awaiting_input = true;
                0
            }
            Advance::Halted => 0,
        }
    }

    fn advance(&mut self) -> Advance {
        if self.cpu.is_halted() {
            return Advance::Halted;
        }
        if self.cpu.pc == BDOS_ENTRY {
            return match self.call_bdos() {
                Some(cost) => Advance::Executed(cost),
                None => Advance::WaitingForInput,
            };
        }
        Advance::Executed(self.cpu.step(&mut self.memory))
    }

    /// Service the call at the entry point and return like the RET there
    /// would. `None` when the call needs console input that is not queued.
    fn call_bdos(&mut self) -> Option<u32> {
        let call = BdosCall::from_cpu(&self.cpu);
        match call.function {
            function::CONSOLE_INPUT if !self.console.has_input() => return None,
            function::READ_CONSOLE_BUFFER if !self.console.has_line() => return None,
            _ => {}
        }

        metrics::record_bdos_call(call.function);
        let mut console = self.console.clone();
        let result = self.bdos.execute(&mut self.memory, &mut console, call);

        self.cpu.set_hl(result);
        self.cpu.a = result as u8;
        self.cpu.b = (result >> 8) as u8;

        if call.function == function::SYSTEM_RESET {
            self.cpu.pc = WARM_BOOT;
        } else {
            self.cpu.pc = self.cpu.pop(&self.memory);
        }
        Some(opcodes::opcode_info(RET).cycles as u32)
    }

    /// Queue raw console input.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.console.push_input(bytes);
    }

    /// Queue one line of console input, terminated with CR.
    pub fn push_line(&mut self, line: &str) {
        self.console.push_input(line.as_bytes());
        self.console.push_input(b"\r");
    }

    /// Drain everything written to the console since the last call.
    pub fn take_output(&mut self) -> String {
        String::from_utf8_lossy(&self.console.take_output()).into_owned()
    }

    /// A line typed at the console. It feeds the editor or BASIC when one
    /// is open and otherwise waits in the input queue, resuming a program
    /// that stopped for input.
    pub fn input_line(&mut self, line: &str, max_cycles: u64) -> Option<RunReport> {
        match self.mode {
            Mode::Editor(_) | Mode::Basic(_) => self.execute_command(line, max_cycles),
            Mode::Exited => None,
            Mode::Ccp => {
                self.push_line(line);
                if self.awaiting_input {
                    Some(self.run(None, max_cycles))
                } else {
                    None
                }
            }
        }
    }

    /// Run a command line through the CCP, or hand it to the editor or
    /// BASIC while one is open. Programs the CCP starts run for at most
    /// `max_cycles`, and BASIC executes at most that many statements.
    pub fn execute_command(&mut self, line: &str, max_cycles: u64) -> Option<RunReport> {
        if matches!(self.mode, Mode::Ccp) {
            return self.ccp_command(line, max_cycles);
        }
        let mut console = self.console.clone();
        let closed = match &mut self.mode {
            Mode::Editor(editor) => editor.handle_line(line, &mut self.bdos, &mut console) == EditorStatus::Quit,
            Mode::Basic(basic) => {
                basic.handle_line(line, &mut self.bdos, &mut console, max_cycles) == BasicStatus::Quit
            }
            Mode::Ccp | Mode::Exited => false,
        };
        if closed {
            debug!("session {} back at the command line", self.id);
            self.mode = Mode::Ccp;
            self.write_prompt();
        }
        None
    }

    fn ccp_command(&mut self, line: &str, max_cycles: u64) -> Option<RunReport> {
        let mut console = self.console.clone();
        match ccp::execute(line, &mut self.bdos, &mut self.memory, &mut console) {
            CommandOutcome::Done => self.write_prompt(),
            CommandOutcome::Run { entry } => {
                self.start_program(entry);
                self.from_ccp = true;
                return Some(self.run(None, max_cycles));
            }
            CommandOutcome::Edit { drive, name } => {
                self.mode = Mode::Editor(LineEditor::open(drive, &name, &self.bdos, &mut console));
            }
            CommandOutcome::Basic => self.mode = Mode::Basic(Basic::start(&mut console)),
            CommandOutcome::Exit => {
                console.put_str(b"GOODBYE\r\n");
                self.mode = Mode::Exited;
                info!("session {} exited", self.id);
            }
        }
        None
    }

    fn write_prompt(&mut self) {
        let prompt = ccp::prompt(&self.bdos);
        self.console.clone().put_str(prompt.as_bytes());
    }

    pub fn state(&self) -> CpuState {
        CpuState {
            a: self.cpu.a,
            b: self.cpu.b,
            c: self.cpu.c,
            d: self.cpu.d,
            e: self.cpu.e,
            h: self.cpu.h,
            l: self.cpu.l,
            flags: self.cpu.flags,
            sp: self.cpu.sp,
            pc: self.cpu.pc,
            halted: self.cpu.is_halted(),
            interrupts_enabled: self.cpu.interrupts_enabled(),
            cycles: self.cycles,
            instructions: self.instructions,
            awaiting_input: self.awaiting_input,
        }
    }
}

/// A session not accessed for longer than `timeout` is expired.
pub fn is_expired(last_access: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(last_access) > timeout
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Lock a session, recovering it if a previous holder panicked.
pub fn lock_session(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionEntry {
    session: SharedSession,
    last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub last_access: DateTime<Utc>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    drives: usize,
    disk_root: Option<PathBuf>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(drives: usize, disk_root: Option<PathBuf>, timeout: Duration) -> Self {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
            drives: drives.clamp(1, 16),
            disk_root,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.drives as usize,
            config.disk_root.clone(),
            config.session_timeout(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_drives(&self, id: &str) -> Result<Vec<Box<dyn Drive>>, SessionError> {
        (0..self.drives)
            .map(|index| -> Result<Box<dyn Drive>, SessionError> {
                let letter = (b'A' + index as u8) as char;
                let drive: Box<dyn Drive> = match &self.disk_root {
                    Some(root) => Box::new(DirectoryDrive::open(root.join(id).join(letter.to_string()))?),
                    None => Box::new(MemoryDrive::new()),
                };
                Ok(drive)
            })
            .collect()
    }

    pub fn create(&self) -> Result<String, SessionError> {
        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), self.open_drives(&id)?);

        let mut sessions = self.lock();
        sessions.insert(
            id.clone(),
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                last_access: Utc::now(),
            },
        );
        metrics::set_active_sessions(sessions.len());
        info!("created session {} ({} active)", id, sessions.len());
        Ok(id)
    }

    /// Look a session up and mark it as used.
    pub fn get(&self, id: &str) -> Result<SharedSession, SessionError> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.last_access = Utc::now();
        Ok(entry.session.clone())
    }

    pub fn remove(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        metrics::set_active_sessions(sessions.len());
        info!("deleted session {}", id);
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .lock()
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.clone(),
                last_access: entry.last_access,
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session idle for longer than the timeout as of `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let expired = is_expired(entry.last_access, now, self.timeout);
            if expired {
                info!("session {} expired", id);
            }
            !expired
        });
        let removed = before - sessions.len();
        if removed > 0 {
            metrics::record_expired_sessions(removed);
            metrics::set_active_sessions(sessions.len());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Drive;

    fn session() -> Session {
        let drives: Vec<Box<dyn Drive>> = vec![Box::new(MemoryDrive::new()), Box::new(MemoryDrive::new())];
        let mut session = Session::new("test", drives);
        session.take_output();
        session
    }

    fn assemble(session: &mut Session, source: &str) {
        let assembly = session.assemble(source, 0x0100).unwrap();
        assert!(assembly.is_ok(), "{:?}", assembly.diagnostics);
    }

    #[test]
    fn test_new_session_prompts_and_sets_low_memory() {
        let drives: Vec<Box<dyn Drive>> = vec![Box::new(MemoryDrive::new())];
        let mut session = Session::new("s1", drives);

        assert_eq!(session.take_output(), "A>");
        assert_eq!(session.memory().read(WARM_BOOT), HLT);
        assert_eq!(session.memory().read(BDOS_ENTRY), RET);
        assert_eq!(session.memory().read_u16(0x0006), BDOS_BASE);
    }

    #[test]
    fn test_run_to_halt() {
        let mut session = session();
        assemble(&mut session, "MVI A,5\nMVI B,3\nADD B\nHLT");

        let report = session.run(Some(0x0100), 1000);

        assert_eq!(report.outcome, RunOutcome::Halted);
        assert!(report.halted);
        assert_eq!(report.cycles, 25);
        assert_eq!(report.instructions, 4);
        assert_eq!(session.state().a, 8);
    }

    #[test]
    fn test_cycle_limit() {
        let mut session = session();
        assemble(&mut session, "LOOP: JMP LOOP");

        let report = session.run(Some(0x0100), 100);

        assert_eq!(report.outcome, RunOutcome::CycleLimit);
        assert!(!report.halted);
        // JMP costs 10 cycles
        assert_eq!(report.cycles, 100);
    }

    #[test]
    fn test_print_string_through_trampoline() {
        let mut session = session();
        assemble(
            &mut session,
            "LXI D,MSG\nMVI C,9\nCALL 5\nHLT\nMSG: DB 'HELLO$'",
        );

        let report = session.run(Some(0x0100), 10_000);

        assert_eq!(report.outcome, RunOutcome::Halted);
        assert_eq!(session.take_output(), "HELLO");
        assert_eq!(session.state().pc, 0x0109);
    }

    #[test]
    fn test_bdos_result_lands_in_a_and_hl() {
        let mut session = session();
        assemble(&mut session, "MVI C,12\nCALL 5\nHLT");

        session.run(Some(0x0100), 10_000);
        let state = session.state();

        assert_eq!(state.a, 0x22);
        assert_eq!(state.l, 0x22);
        assert_eq!(state.b, 0x00);
        assert_eq!(state.h, 0x00);
    }

    #[test]
    fn test_return_to_warm_boot_halts() {
        let mut session = session();
        assemble(&mut session, "MVI A,1\nRET");

        let report = session.run(Some(0x0100), 1000);

        assert_eq!(report.outcome, RunOutcome::Halted);
        assert_eq!(session.state().pc, WARM_BOOT + 1);
    }

    #[test]
    fn test_system_reset_call_ends_program() {
        let mut session = session();
        assemble(&mut session, "MVI C,0\nCALL 5\nMVI A,0FFH\nHLT");

        let report = session.run(Some(0x0100), 1000);

        assert_eq!(report.outcome, RunOutcome::Halted);
        assert_eq!(session.state().a, 0x00);
    }

    #[test]
    fn test_console_input_waits_for_input() {
        let mut session = session();
        assemble(&mut session, "MVI C,1\nCALL 5\nSTA 0200H\nHLT");

        let report = session.run(Some(0x0100), 10_000);
        assert_eq!(report.outcome, RunOutcome::AwaitingInput);
        assert!(session.awaiting_input());
        assert_eq!(session.state().pc, BDOS_ENTRY);

        session.push_input(b"x");
        let report = session.run(None, 10_000);

        assert_eq!(report.outcome, RunOutcome::Halted);
        assert!(!session.awaiting_input());
        assert_eq!(session.memory().read(0x0200), b'x');
        assert_eq!(session.take_output(), "x");
    }

    #[test]
    fn test_read_line_needs_complete_line() {
        let mut session = session();
        // BUF follows 9 bytes of code
        assemble(
            &mut session,
            "LXI D,BUF\nMVI C,10\nCALL 5\nHLT\nBUF: DB 10\nDS 12",
        );
        session.push_input(b"HEL");
        assert_eq!(session.run(Some(0x0100), 10_000).outcome, RunOutcome::AwaitingInput);

        session.push_line("LO");
        assert_eq!(session.run(None, 10_000).outcome, RunOutcome::Halted);

        assert_eq!(session.memory().read(0x0109 + 1), 5);
        assert_eq!(session.dump(0x0109 + 2, 5).unwrap(), b"HELLO".to_vec());
        assert_eq!(session.take_output(), "HELLO\r\n");
    }

    #[test]
    fn test_crlf_input_is_one_line_end() {
        let mut console = SharedConsole::default();
        console.push_input(b"ab\r\n\ncd\r");
        console.push_input(b"\nx");

        let mut queued = Vec::new();
        while let Some(ch) = console.get_char() {
            queued.push(ch);
        }
        assert_eq!(queued, b"ab\r\ncd\rx".to_vec());
    }

    #[test]
    fn test_second_line_after_crlf_is_not_empty() {
        let mut session = session();
        let assembly = session
            .assemble(
                "LXI D,FIRST\nMVI C,10\nCALL 5\nLXI D,SECOND\nMVI C,10\nCALL 5\nHLT\n\
                 FIRST: DB 10\nDS 12\nSECOND: DB 10\nDS 12",
                0x0100,
            )
            .unwrap();
        assert!(assembly.is_ok(), "{:?}", assembly.diagnostics);
        let second = assembly.symbols["SECOND"];

        session.push_input(b"AB\r\nCD\r\n");
        assert_eq!(session.run(Some(0x0100), 10_000).outcome, RunOutcome::Halted);

        assert_eq!(session.memory().read(second + 1), 2);
        assert_eq!(session.dump(second + 2, 2).unwrap(), b"CD".to_vec());
    }

    #[test]
    fn test_step_services_bdos_call() {
        let mut session = session();
        assemble(&mut session, "MVI E,'!'\nMVI C,2\nCALL 5\nHLT");
        session.run(Some(0x0100), 0);

        assert_eq!(session.step(), 7);
        assert_eq!(session.step(), 7);
        assert_eq!(session.step(), 17);
        assert_eq!(session.state().pc, BDOS_ENTRY);
        assert_eq!(session.step(), 10);
        assert_eq!(session.state().pc, 0x0107);
        assert_eq!(session.take_output(), "!");
    }

    #[test]
    fn test_out_instruction_writes_console() {
        let mut session = session();
        assemble(&mut session, "MVI A,'Z'\nOUT 1\nHLT");

        session.run(Some(0x0100), 1000);

        assert_eq!(session.take_output(), "Z");
    }

    #[test]
    fn test_command_runs_program_and_prompts_again() {
        let mut session = session();
        session
            .bdos_mut()
            .current_mut()
            .save_file("HI.ASM", b"MVI E,'H'\nMVI C,2\nCALL 5\nRET\n".to_vec())
            .unwrap();

        assert!(session.execute_command("ASM HI", 10_000).is_none());
        assert_eq!(session.take_output(), "HI.COM: 8 BYTES\r\nA>");

        let report = session.execute_command("hi", 10_000).unwrap();
        assert_eq!(report.outcome, RunOutcome::Halted);
        assert_eq!(session.take_output(), "H\r\nA>");
    }

    #[test]
    fn test_editor_writes_source_for_asm() {
        let mut session = session();
        assert!(session.execute_command("ED HELLO.ASM", 10_000).is_none());
        assert_eq!(session.mode(), SessionMode::Editor);
        assert!(session.take_output().ends_with("Editing: HELLO.ASM\r\nCommands: I=Insert, D=Delete, L=List, S=Save, Q=Quit\r\n\r\n*"));

        for line in ["I", "MVI E,'K'", "MVI C,2", "CALL 5", "RET", "", "S", "Q"] {
            assert!(session.input_line(line, 10_000).is_none());
        }
        assert_eq!(session.mode(), SessionMode::Ccp);
        assert!(session.take_output().ends_with("Saved 4 lines to HELLO.ASM\r\n*A>"));

        session.execute_command("ASM HELLO", 10_000);
        assert_eq!(session.take_output(), "HELLO.COM: 8 BYTES\r\nA>");
        let report = session.execute_command("HELLO", 10_000).unwrap();
        assert_eq!(report.outcome, RunOutcome::Halted);
        assert_eq!(session.take_output(), "K\r\nA>");
    }

    #[test]
    fn test_basic_takes_console_lines() {
        let mut session = session();
        session.execute_command("BASIC", 10_000);
        assert_eq!(session.mode(), SessionMode::Basic);
        session.input_line("10 INPUT X", 10_000);
        session.input_line("20 PRINT X * X", 10_000);
        session.take_output();

        session.input_line("RUN", 10_000);
        assert_eq!(session.take_output(), "? ");
        session.input_line("7", 10_000);
        assert_eq!(session.take_output(), "49\r\n] ");

        session.input_line("QUIT", 10_000);
        assert_eq!(session.mode(), SessionMode::Ccp);
        assert_eq!(session.take_output(), "A>");
    }

    #[test]
    fn test_exit_ends_the_session() {
        let mut session = session();
        assert!(session.execute_command("exit", 10_000).is_none());

        assert!(session.has_exited());
        assert_eq!(session.take_output(), "GOODBYE\r\n");

        assert!(session.execute_command("DIR", 10_000).is_none());
        assert!(session.input_line("DIR", 10_000).is_none());
        assert_eq!(session.take_output(), "");
    }

    #[test]
    fn test_input_line_queues_for_programs() {
        let mut session = session();
        session.input_line("early", 10_000);
        assemble(&mut session, "MVI C,1\nCALL 5\nHLT");

        let report = session.run(Some(0x0100), 10_000);

        assert_eq!(report.outcome, RunOutcome::Halted);
        assert_eq!(session.state().a, b'e');
    }

    #[test]
    fn test_reset_clears_machine_but_keeps_files() {
        let mut session = session();
        session.bdos_mut().current_mut().save_file("KEEP.TXT", b"x".to_vec()).unwrap();
        assemble(&mut session, "MVI A,5\nHLT");
        session.run(Some(0x0100), 1000);

        session.reset();

        assert!(!session.state().halted);
        assert_eq!(session.state().cycles, 0);
        assert_eq!(session.memory().read(0x0100), 0);
        assert_eq!(session.memory().read(BDOS_ENTRY), RET);
        assert!(session.bdos().current().contains("KEEP.TXT"));
    }

    #[test]
    fn test_load_out_of_range() {
        let mut session = session();
        let result = session.load(0xFFFF, &[1, 2]);
        assert!(matches!(result, Err(SessionError::Memory(_))));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let timeout = Duration::seconds(60);

        assert!(!is_expired(now, now, timeout));
        assert!(!is_expired(now - Duration::seconds(60), now, timeout));
        assert!(is_expired(now - Duration::seconds(61), now, timeout));
    }

    #[test]
    fn test_manager_lifecycle() {
        let manager = SessionManager::new(2, None, Duration::seconds(60));
        let id = manager.create().unwrap();

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.list()[0].session_id, id);

        let session = manager.get(&id).unwrap();
        assert_eq!(lock_session(&session).bdos().drive_count(), 2);

        manager.remove(&id).unwrap();
        assert!(manager.is_empty());
        assert!(matches!(manager.get(&id), Err(SessionError::NotFound(_))));
        assert!(matches!(manager.remove(&id), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_manager_sweeps_idle_sessions() {
        let manager = SessionManager::new(1, None, Duration::seconds(60));
        let id = manager.create().unwrap();

        assert_eq!(manager.sweep_expired(Utc::now()), 0);
        assert_eq!(manager.sweep_expired(Utc::now() + Duration::seconds(120)), 1);
        assert!(manager.get(&id).is_err());
    }

    #[test]
    fn test_manager_directory_drives() {
        let root = std::env::temp_dir().join(format!("i8080-sessions-{}", Uuid::new_v4()));
        let manager = SessionManager::new(2, Some(root.clone()), Duration::seconds(60));
        let id = manager.create().unwrap();

        {
            let session = manager.get(&id).unwrap();
            let mut session = lock_session(&session);
            session.bdos_mut().current_mut().save_file("NOTE.TXT", b"hi".to_vec()).unwrap();
        }

        assert_eq!(std::fs::read(root.join(&id).join("A").join("NOTE.TXT")).unwrap(), b"hi");
        assert!(root.join(&id).join("B").is_dir());
        std::fs::remove_dir_all(&root).unwrap();
    }
}
