//! # Intel 8080 CP/M Emulator
//!
//! An instruction-level Intel 8080 emulator with a small CP/M personality on
//! top: a BDOS serving console and file calls through the 0x0005 entry
//! point, a command processor with built-in commands, and a two-pass
//! assembler. Sessions bundle one machine each and are served over a JSON
//! HTTP API.
//!
//! ## Features
//!
//! - All 256 opcodes, with the documented flag behaviour including DAA and
//!   the auxiliary carry quirks of DCR, ANA and CMC
//! - Per-opcode cycle accounting
//! - BDOS console, disk and file functions over in-memory or host-directory
//!   drives
//! - `DIR`, `TYPE`, `ERA`, `REN`, `SAVE`, `ASM` and `.COM` loading from the
//!   command line
//! - A line editor (`ED`) and a small BASIC (`BASIC`) fed one console line
//!   at a time
//! - Non-blocking console input: a program waiting for a key stops the run
//!   instead of blocking it
//!
//! ## Example
//!
//! ```rust
//! use i8080_cpm::assembler;
//! use i8080_cpm::disk::{Drive, MemoryDrive};
//! use i8080_cpm::session::{RunOutcome, Session};
//!
//! let drives: Vec<Box<dyn Drive>> = vec![Box::new(MemoryDrive::new())];
//! let mut session = Session::new("demo", drives);
//!
//! let assembly = assembler::assemble("MVI A,5\nMVI B,3\nADD B\nHLT");
//! session.load(assembly.origin, &assembly.bytes).unwrap();
//!
//! let report = session.run(Some(0x0100), 1000);
//! assert_eq!(report.outcome, RunOutcome::Halted);
//! assert_eq!(report.cycles, 25);
//! assert_eq!(session.cpu().a, 8);
//! ```

#![recursion_limit = "2048"]

pub mod assembler;
pub mod basic;
pub mod bdos;
pub mod ccp;
pub mod config;
pub mod cpu;
pub mod disk;
pub mod editor;
pub mod memory;
pub mod metrics;
pub mod opcodes;
pub mod server;
pub mod session;

pub use cpu::Intel8080;
pub use memory::Memory;
pub use session::{Session, SessionManager};
