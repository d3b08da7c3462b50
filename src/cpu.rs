use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::memory::Memory;
use crate::opcodes::opcode_info;

// Flag register bits
pub const CARRY_FLAG: u8 = 0x01;
pub const PSW_FIXED_BIT: u8 = 0x02; // always 1 in a pushed flags byte
pub const PARITY_FLAG: u8 = 0x04;
pub const AUX_CARRY_FLAG: u8 = 0x10;
pub const ZERO_FLAG: u8 = 0x40;
pub const SIGN_FLAG: u8 = 0x80;

const FLAG_MASK: u8 = SIGN_FLAG | ZERO_FLAG | AUX_CARRY_FLAG | PARITY_FLAG | CARRY_FLAG;

// Register codes used in the opcode encoding (DDD / SSS fields)
const REG_M: u8 = 6;
const REG_A: u8 = 7;

pub type InputHandler = Box<dyn FnMut(u8) -> u8 + Send>;
pub type OutputHandler = Box<dyn FnMut(u8, u8) + Send>;

/// Receiver for everything the processor emits outside of memory.
///
/// IN and OUT on a port without a registered handler land here, as does the
/// HLT notification. A machine has exactly one sink, installed with
/// [`Intel8080::with_events`] or [`Intel8080::set_events`].
pub trait CpuEvents: Send {
    fn output(&mut self, _port: u8, _value: u8) {}

    fn input(&mut self, _port: u8) -> u8 {
        0
    }

    fn halted(&mut self) {}
}

/// Sink that drops output and reads zero.
pub struct NullEvents;

impl CpuEvents for NullEvents {}

pub struct Intel8080 {
    // Registers (public so the host can seed and inspect state)
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

    halted: bool,
    interrupts_enabled: bool,
    input_ports: HashMap<u8, InputHandler>,
    output_ports: HashMap<u8, OutputHandler>,
    events: Box<dyn CpuEvents>,
}

impl Intel8080 {
    pub fn new() -> Self {
        Self::with_events(Box::new(NullEvents))
    }

    pub fn with_events(events: Box<dyn CpuEvents>) -> Self {
        Intel8080 {
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            flags: 0,
            sp: 0,
            pc: 0,
            halted: false,
            interrupts_enabled: false,
            input_ports: HashMap::new(),
            output_ports: HashMap::new(),
            events,
        }
    }

    pub fn set_events(&mut self, events: Box<dyn CpuEvents>) {
        self.events = events;
    }

    /// Clear every register and flag and leave the halted state.
    ///
    /// Port handlers and the event sink stay installed.
    pub fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
        self.c = 0;
        self.d = 0;
        self.e = 0;
        self.h = 0;
        self.l = 0;
        self.flags = 0;
        self.sp = 0;
        self.pc = 0;
        self.halted = false;
        self.interrupts_enabled = false;
    }

    pub fn register_input_port(&mut self, port: u8, handler: InputHandler) {
        self.input_ports.insert(port, handler);
    }

    pub fn register_output_port(&mut self, port: u8, handler: OutputHandler) {
        self.output_ports.insert(port, handler);
    }

    /// Execute one instruction and return its cycle cost.
    ///
    /// A halted processor does nothing and costs 0 cycles.
    pub fn step(&mut self, memory: &mut Memory) -> u32 {
        if self.halted {
            return 0;
        }

        let pc = self.pc;
        let opcode = self.fetch_byte(memory);
        trace!("{:04X}: {:02X} {}", pc, opcode, opcode_info(opcode).mnemonic);

        self.execute(opcode, memory);
        opcode_info(opcode).cycles as u32
    }

    /// Inject `opcode` as if it had been fetched, when interrupts are enabled.
    ///
    /// Accepting the interrupt disables further interrupts. Returns the cycles
    /// consumed, 0 when the interrupt was ignored.
    pub fn interrupt(&mut self, opcode: u8, memory: &mut Memory) -> u32 {
        if !self.interrupts_enabled {
            return 0;
        }
        self.interrupts_enabled = false;
        debug!("interrupt accepted: {:02X}", opcode);

        self.execute(opcode, memory);
        opcode_info(opcode).cycles as u32
    }

    // Getters
    pub fn is_halted(&self) -> bool { self.halted }
    pub fn interrupts_enabled(&self) -> bool { self.interrupts_enabled }
    pub fn bc(&self) -> u16 { ((self.b as u16) << 8) | self.c as u16 }
    pub fn de(&self) -> u16 { ((self.d as u16) << 8) | self.e as u16 }
    pub fn hl(&self) -> u16 { ((self.h as u16) << 8) | self.l as u16 }

    pub fn set_bc(&mut self, value: u16) {
        self.b = (value >> 8) as u8;
        self.c = value as u8;
    }

    pub fn set_de(&mut self, value: u16) {
        self.d = (value >> 8) as u8;
        self.e = value as u8;
    }

    pub fn set_hl(&mut self, value: u16) {
        self.h = (value >> 8) as u8;
        self.l = value as u8;
    }

    // Flag operations
    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.flags & flag) != 0
    }

    fn update_zero_sign_parity(&mut self, value: u8) {
        self.set_flag(ZERO_FLAG, value == 0);
        self.set_flag(SIGN_FLAG, (value & 0x80) != 0);
        self.set_flag(PARITY_FLAG, value.count_ones() % 2 == 0);
    }

    fn fetch_byte(&mut self, memory: &Memory) -> u8 {
        let value = memory.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, memory: &Memory) -> u16 {
        let low = self.fetch_byte(memory) as u16;
        let high = self.fetch_byte(memory) as u16;
        (high << 8) | low
    }

    // Stack operations
    pub fn push(&mut self, memory: &mut Memory, value: u16) {
        self.sp = self.sp.wrapping_sub(2);
        memory.write_u16(self.sp, value);
    }

    pub fn pop(&mut self, memory: &Memory) -> u16 {
        let value = memory.read_u16(self.sp);
        self.sp = self.sp.wrapping_add(2);
        value
    }

    fn get_reg(&self, code: u8, memory: &Memory) -> u8 {
        match code & 0x07 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            REG_M => memory.read(self.hl()),
            _ => self.a,
        }
    }

    fn set_reg(&mut self, code: u8, value: u8, memory: &mut Memory) {
        match code & 0x07 {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => self.h = value,
            5 => self.l = value,
            REG_M => memory.write(self.hl(), value),
            _ => self.a = value,
        }
    }

    // Register pair selected by bits 4-5; code 3 is SP
    fn get_pair(&self, code: u8) -> u16 {
        match code & 0x03 {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl(),
            _ => self.sp,
        }
    }

    fn set_pair(&mut self, code: u8, value: u16) {
        match code & 0x03 {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_hl(value),
            _ => self.sp = value,
        }
    }

    fn condition(&self, code: u8) -> bool {
        match code & 0x07 {
            0 => !self.get_flag(ZERO_FLAG),
            1 => self.get_flag(ZERO_FLAG),
            2 => !self.get_flag(CARRY_FLAG),
            3 => self.get_flag(CARRY_FLAG),
            4 => !self.get_flag(PARITY_FLAG),
            5 => self.get_flag(PARITY_FLAG),
            6 => !self.get_flag(SIGN_FLAG),
            _ => self.get_flag(SIGN_FLAG),
        }
    }

    fn execute(&mut self, opcode: u8, memory: &mut Memory) {
        let ddd = (opcode >> 3) & 0x07;
        let sss = opcode & 0x07;
        let rp = (opcode >> 4) & 0x03;

        match opcode {
            0x00 => {} // NOP

            // Undefined opcodes execute as single byte NOPs
            0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {}
            0xCB | 0xD9 | 0xDD | 0xED | 0xFD => {}

            // LXI rp,d16
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_word(memory);
                self.set_pair(rp, value);
            }

            // STAX / LDAX
            0x02 | 0x12 => memory.write(self.get_pair(rp), self.a),
            0x0A | 0x1A => self.a = memory.read(self.get_pair(rp)),

            // Direct addressing
            0x22 => {
                let addr = self.fetch_word(memory);
                memory.write_u16(addr, self.hl());
            }
            0x2A => {
                let addr = self.fetch_word(memory);
                let value = memory.read_u16(addr);
                self.set_hl(value);
            }
            0x32 => {
                let addr = self.fetch_word(memory);
                memory.write(addr, self.a);
            }
            0x3A => {
                let addr = self.fetch_word(memory);
                self.a = memory.read(addr);
            }

            // INX / DCX / DAD
            0x03 | 0x13 | 0x23 | 0x33 => {
                let value = self.get_pair(rp).wrapping_add(1);
                self.set_pair(rp, value);
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let value = self.get_pair(rp).wrapping_sub(1);
                self.set_pair(rp, value);
            }
            0x09 | 0x19 | 0x29 | 0x39 => self.dad(self.get_pair(rp)),

            // INR / DCR / MVI
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let value = self.inr(self.get_reg(ddd, memory));
                self.set_reg(ddd, value, memory);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let value = self.dcr(self.get_reg(ddd, memory));
                self.set_reg(ddd, value, memory);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let value = self.fetch_byte(memory);
                self.set_reg(ddd, value, memory);
            }

            // Accumulator and carry operations
            0x07 => self.rlc(),
            0x0F => self.rrc(),
            0x17 => self.ral(),
            0x1F => self.rar(),
            0x27 => self.daa(),
            0x2F => self.a = !self.a,
            0x37 => self.set_flag(CARRY_FLAG, true),
            0x3F => {
                self.flags ^= CARRY_FLAG;
                self.set_flag(AUX_CARRY_FLAG, false);
            }

            0x76 => self.hlt(),

            // MOV dst,src
            0x40..=0x75 | 0x77..=0x7F => {
                let value = self.get_reg(sss, memory);
                self.set_reg(ddd, value, memory);
            }

            // Register / memory arithmetic
            0x80..=0xBF => {
                let value = self.get_reg(sss, memory);
                self.alu(ddd, value);
            }

            // Immediate arithmetic
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let value = self.fetch_byte(memory);
                self.alu(ddd, value);
            }

            // Jumps
            0xC3 => self.pc = self.fetch_word(memory),
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let addr = self.fetch_word(memory);
                if self.condition(ddd) {
                    self.pc = addr;
                }
            }
            0xE9 => self.pc = self.hl(),

            // Calls
            0xCD => {
                let addr = self.fetch_word(memory);
                self.call(memory, addr);
            }
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let addr = self.fetch_word(memory);
                if self.condition(ddd) {
                    self.call(memory, addr);
                }
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.call(memory, (ddd as u16) * 8);
            }

            // Returns
            0xC9 => self.pc = self.pop(memory),
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                if self.condition(ddd) {
                    self.pc = self.pop(memory);
                }
            }

            // Stack
            0xC5 | 0xD5 | 0xE5 => {
                let value = self.get_pair(rp);
                self.push(memory, value);
            }
            0xF5 => {
                let psw = ((self.a as u16) << 8) | (self.flags | PSW_FIXED_BIT) as u16;
                self.push(memory, psw);
            }
            0xC1 | 0xD1 | 0xE1 => {
                let value = self.pop(memory);
                self.set_pair(rp, value);
            }
            0xF1 => {
                let psw = self.pop(memory);
                self.a = (psw >> 8) as u8;
                self.flags = (psw as u8 & FLAG_MASK) | AUX_CARRY_FLAG;
            }
            0xE3 => {
                let value = memory.read_u16(self.sp);
                memory.write_u16(self.sp, self.hl());
                self.set_hl(value);
            }
            0xEB => {
                let de = self.de();
                self.set_de(self.hl());
                self.set_hl(de);
            }
            0xF9 => self.sp = self.hl(),

            // I/O and interrupt control
            0xD3 => {
                let port = self.fetch_byte(memory);
                self.port_out(port, self.a);
            }
            0xDB => {
                let port = self.fetch_byte(memory);
                self.a = self.port_in(port);
            }
            0xF3 => self.interrupts_enabled = false,
            0xFB => self.interrupts_enabled = true,
        }
    }

    fn alu(&mut self, operation: u8, value: u8) {
        match operation & 0x07 {
            0 => self.a = self.add(self.a, value, false),
            1 => self.a = self.add(self.a, value, self.get_flag(CARRY_FLAG)),
            2 => self.a = self.sub(self.a, value, false),
            3 => self.a = self.sub(self.a, value, self.get_flag(CARRY_FLAG)),
            4 => self.ana(value),
            5 => self.xra(value),
            6 => self.ora(value),
            _ => {
                // CMP only keeps the flags
                self.sub(self.a, value, false);
            }
        }
    }

    fn add(&mut self, a: u8, b: u8, carry_in: bool) -> u8 {
        let carry = carry_in as u16;
        let result = a as u16 + b as u16 + carry;

        self.set_flag(AUX_CARRY_FLAG, (a & 0x0F) as u16 + (b & 0x0F) as u16 + carry > 0x0F);
        self.set_flag(CARRY_FLAG, result > 0xFF);

        let result = result as u8;
        self.update_zero_sign_parity(result);
        result
    }

    fn sub(&mut self, a: u8, b: u8, borrow_in: bool) -> u8 {
        let borrow = borrow_in as i16;
        let result = a as i16 - b as i16 - borrow;

        self.set_flag(AUX_CARRY_FLAG, ((a & 0x0F) as i16) < (b & 0x0F) as i16 + borrow);
        self.set_flag(CARRY_FLAG, result < 0);

        let result = result as u8;
        self.update_zero_sign_parity(result);
        result
    }

    fn ana(&mut self, value: u8) {
        self.a &= value;
        self.set_flag(CARRY_FLAG, false);
        self.set_flag(AUX_CARRY_FLAG, true);
        self.update_zero_sign_parity(self.a);
    }

    fn xra(&mut self, value: u8) {
        self.a ^= value;
        self.set_flag(CARRY_FLAG, false);
        self.set_flag(AUX_CARRY_FLAG, false);
        self.update_zero_sign_parity(self.a);
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.set_flag(CARRY_FLAG, false);
        self.set_flag(AUX_CARRY_FLAG, false);
        self.update_zero_sign_parity(self.a);
    }

    // INR and DCR leave the carry flag alone
    fn inr(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.set_flag(AUX_CARRY_FLAG, (value & 0x0F) == 0x0F);
        self.update_zero_sign_parity(result);
        result
    }

    fn dcr(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        self.set_flag(AUX_CARRY_FLAG, true);
        self.update_zero_sign_parity(result);
        result
    }

    fn dad(&mut self, value: u16) {
        let result = self.hl() as u32 + value as u32;
        self.set_flag(CARRY_FLAG, result > 0xFFFF);
        self.set_hl(result as u16);
    }

    fn daa(&mut self) {
        let low = self.a & 0x0F;
        let high = self.a >> 4;
        let mut correction = 0;
        let mut carry = self.get_flag(CARRY_FLAG);

        if low > 9 || self.get_flag(AUX_CARRY_FLAG) {
            correction |= 0x06;
        }
        if high > 9 || carry || (high >= 9 && low > 9) {
            correction |= 0x60;
            carry = true;
        }

        self.a = self.add(self.a, correction, false);
        self.set_flag(AUX_CARRY_FLAG, low > 9);
        if carry {
            self.set_flag(CARRY_FLAG, true);
        }
    }

    // Rotates only touch the carry flag
    fn rlc(&mut self) {
        let out = self.a & 0x80 != 0;
        self.a = self.a.rotate_left(1);
        self.set_flag(CARRY_FLAG, out);
    }

    fn rrc(&mut self) {
        let out = self.a & 0x01 != 0;
        self.a = self.a.rotate_right(1);
        self.set_flag(CARRY_FLAG, out);
    }

    fn ral(&mut self) {
        let carry_in = self.get_flag(CARRY_FLAG) as u8;
        let out = self.a & 0x80 != 0;
        self.a = (self.a << 1) | carry_in;
        self.set_flag(CARRY_FLAG, out);
    }

    fn rar(&mut self) {
        let carry_in = if self.get_flag(CARRY_FLAG) { 0x80 } else { 0 };
        let out = self.a & 0x01 != 0;
        self.a = (self.a >> 1) | carry_in;
        self.set_flag(CARRY_FLAG, out);
    }

    fn call(&mut self, memory: &mut Memory, addr: u16) {
        let ret = self.pc;
        self.push(memory, ret);
        self.pc = addr;
    }

    fn hlt(&mut self) {
        self.halted = true;
        debug!("halted at {:04X}", self.pc.wrapping_sub(1));
        self.events.halted();
    }

    fn port_in(&mut self, port: u8) -> u8 {
        match self.input_ports.get_mut(&port) {
            Some(handler) => handler(port),
            None => self.events.input(port),
        }
    }

    fn port_out(&mut self, port: u8, value: u8) {
        match self.output_ports.get_mut(&port) {
            Some(handler) => handler(port, value),
            None => self.events.output(port, value),
        }
    }
}

impl Default for Intel8080 {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Intel8080 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intel8080")
            .field("a", &self.a)
            .field("bc", &self.bc())
            .field("de", &self.de())
            .field("hl", &self.hl())
            .field("flags", &self.flags)
            .field("sp", &self.sp)
            .field("pc", &self.pc)
            .field("halted", &self.halted)
            .field("interrupts_enabled", &self.interrupts_enabled)
            .finish()
    }
}

impl fmt::Display for Intel8080 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: u8, name: char| if self.get_flag(bit) { name } else { '-' };
        write!(
            f,
            "A={:02X} BC={:04X} DE={:04X} HL={:04X} SP={:04X} PC={:04X} [{}{}{}{}{}]",
            self.a,
            self.bc(),
            self.de(),
            self.hl(),
            self.sp,
            self.pc,
            flag(SIGN_FLAG, 'S'),
            flag(ZERO_FLAG, 'Z'),
            flag(AUX_CARRY_FLAG, 'A'),
            flag(PARITY_FLAG, 'P'),
            flag(CARRY_FLAG, 'C'),
        )
    }
}
