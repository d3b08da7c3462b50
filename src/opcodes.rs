//! Opcode metadata for the 8080 instruction set.
//!
//! One entry per opcode byte. The table is total: the twelve opcodes the
//! 8080 leaves undefined are listed with the `???` mnemonic, a one byte
//! encoding and the cost of a NOP, which is how the CPU executes them.
//!
//! Cycle counts are fixed per opcode. Conditional returns and calls are
//! listed with their taken cost and charge it whether or not the branch is
//! taken.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// Instruction mnemonic, e.g. "MOV", "JNZ", "???" for undefined opcodes
    pub mnemonic: &'static str,
    /// Operand template for disassembly, e.g. "B,C", "A,d8", "a16"
    pub operands: &'static str,
    /// Encoded length in bytes, opcode included (1-3)
    pub size: u8,
    pub cycles: u8,
}

impl OpcodeInfo {
    pub fn is_defined(&self) -> bool {
        self.mnemonic != "???"
    }
}

const fn op(mnemonic: &'static str, operands: &'static str, size: u8, cycles: u8) -> OpcodeInfo {
    OpcodeInfo {
        mnemonic,
        operands,
        size,
        cycles,
    }
}

pub static OPCODE_TABLE: [OpcodeInfo; 256] = [
    op("NOP", "", 1, 4), // 0x00
    op("LXI", "B,d16", 3, 10), // 0x01
    op("STAX", "B", 1, 7), // 0x02
    op("INX", "B", 1, 5), // 0x03
    op("INR", "B", 1, 5), // 0x04
    op("DCR", "B", 1, 5), // 0x05
    op("MVI", "B,d8", 2, 7), // 0x06
    op("RLC", "", 1, 4), // 0x07
    op("???", "", 1, 4), // 0x08
    op("DAD", "B", 1, 10), // 0x09
    op("LDAX", "B", 1, 7), // 0x0A
    op("DCX", "B", 1, 5), // 0x0B
    op("INR", "C", 1, 5), // 0x0C
    op("DCR", "C", 1, 5), // 0x0D
    op("MVI", "C,d8", 2, 7), // 0x0E
    op("RRC", "", 1, 4), // 0x0F
    op("???", "", 1, 4), // 0x10
    op("LXI", "D,d16", 3, 10), // 0x11
    op("STAX", "D", 1, 7), // 0x12
    op("INX", "D", 1, 5), // 0x13
    op("INR", "D", 1, 5), // 0x14
    op("DCR", "D", 1, 5), // 0x15
    op("MVI", "D,d8", 2, 7), // 0x16
    op("RAL", "", 1, 4), // 0x17
    op("???", "", 1, 4), // 0x18
    op("DAD", "D", 1, 10), // 0x19
    op("LDAX", "D", 1, 7), // 0x1A
    op("DCX", "D", 1, 5), // 0x1B
    op("INR", "E", 1, 5), // 0x1C
    op("DCR", "E", 1, 5), // 0x1D
    op("MVI", "E,d8", 2, 7), // 0x1E
    op("RAR", "", 1, 4), // 0x1F
    op("???", "", 1, 4), // 0x20
    op("LXI", "H,d16", 3, 10), // 0x21
    op("SHLD", "a16", 3, 16), // 0x22
    op("INX", "H", 1, 5), // 0x23
    op("INR", "H", 1, 5), // 0x24
    op("DCR", "H", 1, 5), // 0x25
    op("MVI", "H,d8", 2, 7), // 0x26
    op("DAA", "", 1, 4), // 0x27
    op("???", "", 1, 4), // 0x28
    op("DAD", "H", 1, 10), // 0x29
    op("LHLD", "a16", 3, 16), // 0x2A
    op("DCX", "H", 1, 5), // 0x2B
    op("INR", "L", 1, 5), // 0x2C
    op("DCR", "L", 1, 5), // 0x2D
    op("MVI", "L,d8", 2, 7), // 0x2E
    op("CMA", "", 1, 4), // 0x2F
    op("???", "", 1, 4), // 0x30
    op("LXI", "SP,d16", 3, 10), // 0x31
    op("STA", "a16", 3, 13), // 0x32
    op("INX", "SP", 1, 5), // 0x33
    op("INR", "M", 1, 10), // 0x34
    op("DCR", "M", 1, 10), // 0x35
    op("MVI", "M,d8", 2, 10), // 0x36
    op("STC", "", 1, 4), // 0x37
    op("???", "", 1, 4), // 0x38
    op("DAD", "SP", 1, 10), // 0x39
    op("LDA", "a16", 3, 13), // 0x3A
    op("DCX", "SP", 1, 5), // 0x3B
    op("INR", "A", 1, 5), // 0x3C
    op("DCR", "A", 1, 5), // 0x3D
    op("MVI", "A,d8", 2, 7), // 0x3E
    op("CMC", "", 1, 4), // 0x3F
    op("MOV", "B,B", 1, 5), // 0x40
    op("MOV", "B,C", 1, 5), // 0x41
    op("MOV", "B,D", 1, 5), // 0x42
    op("MOV", "B,E", 1, 5), // 0x43
    op("MOV", "B,H", 1, 5), // 0x44
    op("MOV", "B,L", 1, 5), // 0x45
    op("MOV", "B,M", 1, 7), // 0x46
    op("MOV", "B,A", 1, 5), // 0x47
    op("MOV", "C,B", 1, 5), // 0x48
    op("MOV", "C,C", 1, 5), // 0x49
    op("MOV", "C,D", 1, 5), // 0x4A
    op("MOV", "C,E", 1, 5), // 0x4B
    op("MOV", "C,H", 1, 5), // 0x4C
    op("MOV", "C,L", 1, 5), // 0x4D
    op("MOV", "C,M", 1, 7), // 0x4E
    op("MOV", "C,A", 1, 5), // 0x4F
    op("MOV", "D,B", 1, 5), // 0x50
    op("MOV", "D,C", 1, 5), // 0x51
    op("MOV", "D,D", 1, 5), // 0x52
    op("MOV", "D,E", 1, 5), // 0x53
    op("MOV", "D,H", 1, 5), // 0x54
    op("MOV", "D,L", 1, 5), // 0x55
    op("MOV", "D,M", 1, 7), // 0x56
    op("MOV", "D,A", 1, 5), // 0x57
    op("MOV", "E,B", 1, 5), // 0x58
    op("MOV", "E,C", 1, 5), // 0x59
    op("MOV", "E,D", 1, 5), // 0x5A
    op("MOV", "E,E", 1, 5), // 0x5B
    op("MOV", "E,H", 1, 5), // 0x5C
    op("MOV", "E,L", 1, 5), // 0x5D
    op("MOV", "E,M", 1, 7), // 0x5E
    op("MOV", "E,A", 1, 5), // 0x5F
    op("MOV", "H,B", 1, 5), // 0x60
    op("MOV", "H,C", 1, 5), // 0x61
    op("MOV", "H,D", 1, 5), // 0x62
    op("MOV", "H,E", 1, 5), // 0x63
    op("MOV", "H,H", 1, 5), // 0x64
    op("MOV", "H,L", 1, 5), // 0x65
    op("MOV", "H,M", 1, 7), // 0x66
    op("MOV", "H,A", 1, 5), // 0x67
    op("MOV", "L,B", 1, 5), // 0x68
    op("MOV", "L,C", 1, 5), // 0x69
    op("MOV", "L,D", 1, 5), // 0x6A
    op("MOV", "L,E", 1, 5), // 0x6B
    op("MOV", "L,H", 1, 5), // 0x6C
    op("MOV", "L,L", 1, 5), // 0x6D
    op("MOV", "L,M", 1, 7), // 0x6E
    op("MOV", "L,A", 1, 5), // 0x6F
    op("MOV", "M,B", 1, 7), // 0x70
    op("MOV", "M,C", 1, 7), // 0x71
    op("MOV", "M,D", 1, 7), // 0x72
    op("MOV", "M,E", 1, 7), // 0x73
    op("MOV", "M,H", 1, 7), // 0x74
    op("MOV", "M,L", 1, 7), // 0x75
    op("HLT", "", 1, 7), // 0x76
    op("MOV", "M,A", 1, 7), // 0x77
    op("MOV", "A,B", 1, 5), // 0x78
    op("MOV", "A,C", 1, 5), // 0x79
    op("MOV", "A,D", 1, 5), // 0x7A
    op("MOV", "A,E", 1, 5), // 0x7B
    op("MOV", "A,H", 1, 5), // 0x7C
    op("MOV", "A,L", 1, 5), // 0x7D
    op("MOV", "A,M", 1, 7), // 0x7E
    op("MOV", "A,A", 1, 5), // 0x7F
    op("ADD", "B", 1, 4), // 0x80
    op("ADD", "C", 1, 4), // 0x81
    op("ADD", "D", 1, 4), // 0x82
    op("ADD", "E", 1, 4), // 0x83
    op("ADD", "H", 1, 4), // 0x84
    op("ADD", "L", 1, 4), // 0x85
    op("ADD", "M", 1, 7), // 0x86
    op("ADD", "A", 1, 4), // 0x87
    op("ADC", "B", 1, 4), // 0x88
    op("ADC", "C", 1, 4), // 0x89
    op("ADC", "D", 1, 4), // 0x8A
    op("ADC", "E", 1, 4), // 0x8B
    op("ADC", "H", 1, 4), // 0x8C
    op("ADC", "L", 1, 4), // 0x8D
    op("ADC", "M", 1, 7), // 0x8E
    op("ADC", "A", 1, 4), // 0x8F
    op("SUB", "B", 1, 4), // 0x90
    op("SUB", "C", 1, 4), // 0x91
    op("SUB", "D", 1, 4), // 0x92
    op("SUB", "E", 1, 4), // 0x93
    op("SUB", "H", 1, 4), // 0x94
    op("SUB", "L", 1, 4), // 0x95
    op("SUB", "M", 1, 7), // 0x96
    op("SUB", "A", 1, 4), // 0x97
    op("SBB", "B", 1, 4), // 0x98
    op("SBB", "C", 1, 4), // 0x99
    op("SBB", "D", 1, 4), // 0x9A
    op("SBB", "E", 1, 4), // 0x9B
    op("SBB", "H", 1, 4), // 0x9C
    op("SBB", "L", 1, 4), // 0x9D
    op("SBB", "M", 1, 7), // 0x9E
    op("SBB", "A", 1, 4), // 0x9F
    op("ANA", "B", 1, 4), // 0xA0
    op("ANA", "C", 1, 4), // 0xA1
    op("ANA", "D", 1, 4), // 0xA2
    op("ANA", "E", 1, 4), // 0xA3
    op("ANA", "H", 1, 4), // 0xA4
    op("ANA", "L", 1, 4), // 0xA5
    op("ANA", "M", 1, 7), // 0xA6
    op("ANA", "A", 1, 4), // 0xA7
    op("XRA", "B", 1, 4), // 0xA8
    op("XRA", "C", 1, 4), // 0xA9
    op("XRA", "D", 1, 4), // 0xAA
    op("XRA", "E", 1, 4), // 0xAB
    op("XRA", "H", 1, 4), // 0xAC
    op("XRA", "L", 1, 4), // 0xAD
    op("XRA", "M", 1, 7), // 0xAE
    op("XRA", "A", 1, 4), // 0xAF
    op("ORA", "B", 1, 4), // 0xB0
    op("ORA", "C", 1, 4), // 0xB1
    op("ORA", "D", 1, 4), // 0xB2
    op("ORA", "E", 1, 4), // 0xB3
    op("ORA", "H", 1, 4), // 0xB4
    op("ORA", "L", 1, 4), // 0xB5
    op("ORA", "M", 1, 7), // 0xB6
    op("ORA", "A", 1, 4), // 0xB7
    op("CMP", "B", 1, 4), // 0xB8
    op("CMP", "C", 1, 4), // 0xB9
    op("CMP", "D", 1, 4), // 0xBA
    op("CMP", "E", 1, 4), // 0xBB
    op("CMP", "H", 1, 4), // 0xBC
    op("CMP", "L", 1, 4), // 0xBD
    op("CMP", "M", 1, 7), // 0xBE
    op("CMP", "A", 1, 4), // 0xBF
    op("RNZ", "", 1, 11), // 0xC0
    op("POP", "B", 1, 10), // 0xC1
    op("JNZ", "a16", 3, 10), // 0xC2
    op("JMP", "a16", 3, 10), // 0xC3
    op("CNZ", "a16", 3, 17), // 0xC4
    op("PUSH", "B", 1, 11), // 0xC5
    op("ADI", "d8", 2, 7), // 0xC6
    op("RST", "0", 1, 11), // 0xC7
    op("RZ", "", 1, 11), // 0xC8
    op("RET", "", 1, 10), // 0xC9
    op("JZ", "a16", 3, 10), // 0xCA
    op("???", "", 1, 4), // 0xCB
    op("CZ", "a16", 3, 17), // 0xCC
    op("CALL", "a16", 3, 17), // 0xCD
    op("ACI", "d8", 2, 7), // 0xCE
    op("RST", "1", 1, 11), // 0xCF
    op("RNC", "", 1, 11), // 0xD0
    op("POP", "D", 1, 10), // 0xD1
    op("JNC", "a16", 3, 10), // 0xD2
    op("OUT", "d8", 2, 10), // 0xD3
    op("CNC", "a16", 3, 17), // 0xD4
    op("PUSH", "D", 1, 11), // 0xD5
    op("SUI", "d8", 2, 7), // 0xD6
    op("RST", "2", 1, 11), // 0xD7
    op("RC", "", 1, 11), // 0xD8
    op("???", "", 1, 4), // 0xD9
    op("JC", "a16", 3, 10), // 0xDA
    op("IN", "d8", 2, 10), // 0xDB
    op("CC", "a16", 3, 17), // 0xDC
    op("???", "", 1, 4), // 0xDD
    op("SBI", "d8", 2, 7), // 0xDE
    op("RST", "3", 1, 11), // 0xDF
    op("RPO", "", 1, 11), // 0xE0
    op("POP", "H", 1, 10), // 0xE1
    op("JPO", "a16", 3, 10), // 0xE2
    op("XTHL", "", 1, 18), // 0xE3
    op("CPO", "a16", 3, 17), // 0xE4
    op("PUSH", "H", 1, 11), // 0xE5
    op("ANI", "d8", 2, 7), // 0xE6
    op("RST", "4", 1, 11), // 0xE7
    op("RPE", "", 1, 11), // 0xE8
    op("PCHL", "", 1, 5), // 0xE9
    op("JPE", "a16", 3, 10), // 0xEA
    op("XCHG", "", 1, 5), // 0xEB
    op("CPE", "a16", 3, 17), // 0xEC
    op("???", "", 1, 4), // 0xED
    op("XRI", "d8", 2, 7), // 0xEE
    op("RST", "5", 1, 11), // 0xEF
    op("RP", "", 1, 11), // 0xF0
    op("POP", "PSW", 1, 10), // 0xF1
    op("JP", "a16", 3, 10), // 0xF2
    op("DI", "", 1, 4), // 0xF3
    op("CP", "a16", 3, 17), // 0xF4
    op("PUSH", "PSW", 1, 11), // 0xF5
    op("ORI", "d8", 2, 7), // 0xF6
    op("RST", "6", 1, 11), // 0xF7
    op("RM", "", 1, 11), // 0xF8
    op("SPHL", "", 1, 5), // 0xF9
    op("JM", "a16", 3, 10), // 0xFA
    op("EI", "", 1, 4), // 0xFB
    op("CM", "a16", 3, 17), // 0xFC
    op("???", "", 1, 4), // 0xFD
    op("CPI", "d8", 2, 7), // 0xFE
    op("RST", "7", 1, 11), // 0xFF
];

/// Look up the metadata for an opcode byte.
pub fn opcode_info(opcode: u8) -> &'static OpcodeInfo {
    &OPCODE_TABLE[opcode as usize]
}

/// Render the instruction starting at `bytes[0]`, e.g. `MVI A,05H`.
///
/// Missing operand bytes (a slice shorter than the encoding) are shown as zero.
pub fn disassemble(bytes: &[u8]) -> String {
    let opcode = bytes.first().copied().unwrap_or(0);
    let info = opcode_info(opcode);
    let low = bytes.get(1).copied().unwrap_or(0);
    let high = bytes.get(2).copied().unwrap_or(0);

    let operands = info
        .operands
        .replace("d16", &format!("{:02X}{:02X}H", high, low))
        .replace("a16", &format!("{:02X}{:02X}H", high, low))
        .replace("d8", &format!("{:02X}H", low));

    if operands.is_empty() {
        info.mnemonic.to_string()
    } else {
        format!("{} {}", info.mnemonic, operands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sizes() {
        assert_eq!(opcode_info(0x00).size, 1);
        assert_eq!(opcode_info(0x3E).size, 2); // MVI A
        assert_eq!(opcode_info(0x21).size, 3); // LXI H
        assert_eq!(opcode_info(0xCA).size, 3); // JZ
        assert_eq!(opcode_info(0xD3).size, 2); // OUT
    }

    #[test]
    fn test_table_cycles() {
        assert_eq!(opcode_info(0x3E).cycles, 7); // MVI A
        assert_eq!(opcode_info(0x80).cycles, 4); // ADD B
        assert_eq!(opcode_info(0x86).cycles, 7); // ADD M
        assert_eq!(opcode_info(0x76).cycles, 7); // HLT
        assert_eq!(opcode_info(0xCD).cycles, 17); // CALL
        assert_eq!(opcode_info(0xE3).cycles, 18); // XTHL
    }

    #[test]
    fn test_undefined_opcodes() {
        for opcode in [0x08, 0x10, 0x18, 0x20, 0x28, 0x30, 0x38, 0xCB, 0xD9, 0xDD, 0xED, 0xFD] {
            let info = opcode_info(opcode);
            assert!(!info.is_defined(), "0x{:02X} should be undefined", opcode);
            assert_eq!(info.size, 1);
        }
        let defined = OPCODE_TABLE.iter().filter(|info| info.is_defined()).count();
        assert_eq!(defined, 244);
    }

    #[test]
    fn test_disassemble() {
        assert_eq!(disassemble(&[0x3E, 0x05]), "MVI A,05H");
        assert_eq!(disassemble(&[0xC3, 0x00, 0x01]), "JMP 0100H");
        assert_eq!(disassemble(&[0x41]), "MOV B,C");
        assert_eq!(disassemble(&[0x76]), "HLT");
        assert_eq!(disassemble(&[0xF5]), "PUSH PSW");
    }
}
