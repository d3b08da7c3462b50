use thiserror::Error;

pub const MEMORY_SIZE: usize = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory access out of bounds: address ${address:04X}, length {length}")]
    OutOfBounds { address: u16, length: usize },
}

pub struct Memory {
    data: Box<[u8; MEMORY_SIZE]>, // 64KB memory space
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: Box::new([0; MEMORY_SIZE]),
        }
    }

    pub fn read(&self, address: u16) -> u8 {
        self.data[address as usize]
    }

    pub fn write(&mut self, address: u16, value: u8) {
        self.data[address as usize] = value;
    }

    // Read a 16-bit value in little-endian format
    pub fn read_u16(&self, address: u16) -> u16 {
        let low = self.read(address) as u16;
        let high = self.read(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    // Write a 16-bit value in little-endian format
    pub fn write_u16(&mut self, address: u16, value: u16) {
        self.write(address, (value & 0xFF) as u8);
        self.write(address.wrapping_add(1), (value >> 8) as u8);
    }

    /// Copy `bytes` into memory starting at `address`.
    ///
    /// The whole block must fit below the top of the address space; a block
    /// that would run past 0xFFFF is rejected rather than wrapped.
    pub fn load(&mut self, address: u16, bytes: &[u8]) -> Result<(), MemoryError> {
        let start = Self::check_range(address, bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `length` bytes out of memory starting at `address`.
    pub fn dump(&self, address: u16, length: usize) -> Result<Vec<u8>, MemoryError> {
        let start = Self::check_range(address, length)?;
        Ok(self.data[start..start + length].to_vec())
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    fn check_range(address: u16, length: usize) -> Result<usize, MemoryError> {
        let start = address as usize;
        match start.checked_add(length) {
            Some(end) if end <= MEMORY_SIZE => Ok(start),
            _ => Err(MemoryError::OutOfBounds { address, length }),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}
