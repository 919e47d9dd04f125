use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use crate::fault::Fault;

/// Flat byte-addressable memory capacity: 128 KiB.
pub const MEMORY_SIZE: u32 = 0x20000;

/// Byte buffer shared between the execution core and the output drain.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

// Flag register bit assignments, low to high.
pub const RF_CMP: u8 = 1 << 0;
pub const RF_SIGN: u8 = 1 << 1; // reserved, never produced by the ALU
pub const RF_CARRY: u8 = 1 << 2;
pub const RF_OVERFLOW: u8 = 1 << 3;
pub const RF_IRQ_ENABLE: u8 = 1 << 4;

pub struct Cpu {
    pub(crate) ra: u32,
    pub(crate) rb: u32,
    pub(crate) rc: u32,
    pub(crate) rd: u32,
    pub(crate) pc: u32,
    /// Stack pointer, counted in bytes from the stack base.
    pub(crate) sp: u32,
    /// Stack base, a byte offset into memory.
    pub(crate) bp: u32,
    /// Selects the compare predicate evaluated by CMP.
    pub(crate) cmpreg: u8,
    pub(crate) rf: u8,
    /// Interrupt vector: where the interrupt controller points PC on entry.
    pub(crate) hireg: u32,
    pub(crate) mem: Vec<u8>,
    pub(crate) in_interrupt: bool,
    pub(crate) irq_pending: bool,
    pub(crate) halted: bool,
    pub(crate) cycles: u64,
    fault: Option<Fault>,
    pub(crate) out_buf: SharedBuffer,
}

impl Cpu {
    pub fn new() -> Self {
        Self::with_output(Arc::new(Mutex::new(Vec::new())))
    }

    /// Builds a machine whose OUT instruction appends to `out_buf`.
    pub fn with_output(out_buf: SharedBuffer) -> Self {
        Self {
            ra: 0,
            rb: 0,
            rc: 0,
            rd: 0,
            pc: 0,
            sp: 0,
            bp: 0,
            cmpreg: 0,
            rf: 0,
            hireg: 0,
            mem: vec![0; MEMORY_SIZE as usize],
            in_interrupt: false,
            irq_pending: false,
            halted: false,
            cycles: 0,
            fault: None,
            out_buf,
        }
    }

    /// Copies a raw binary image into memory starting at offset 0.
    /// Images longer than memory are clipped to capacity.
    pub fn load_image(&mut self, image: &[u8]) {
        let len = image.len().min(MEMORY_SIZE as usize);
        if len < image.len() {
            warn!("image is {} bytes, clipping to {} byte memory", image.len(), MEMORY_SIZE);
        }
        self.mem[..len].copy_from_slice(&image[..len]);
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles
    }

    /// Sets the hardware-interrupt edge latch. The latch is consumed (and
    /// cleared) by the next tick whether or not the interrupt is taken.
    pub fn assert_interrupt(&mut self) {
        self.irq_pending = true;
    }

    /// The fault that halted the machine, if any. HALT leaves this empty.
    pub fn last_fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Soft-halt: flag the machine halted and record the diagnostic. The
    /// caller keeps running; the halt is observed at the top of the next
    /// tick. Only the first fault is kept, later ones are just logged.
    pub(crate) fn fault(&mut self, fault: Fault) {
        error!("cpu debug check: {fault}");
        self.halted = true;
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    // --- register file -------------------------------------------------

    /// Indexed register read: 0-3 = RA-RD, 4 = CMPREG, 5 = SP, 6 = BP,
    /// 7 = RF, 8 = HIREG. Out-of-range indices fault and read as 0.
    pub fn read_reg(&mut self, index: u32) -> u32 {
        match index {
            0 => self.ra,
            1 => self.rb,
            2 => self.rc,
            3 => self.rd,
            4 => self.cmpreg as u32,
            5 => self.sp,
            6 => self.bp,
            7 => self.rf as u32,
            8 => self.hireg,
            _ => {
                self.fault(Fault::IllegalRegisterIndex { index });
                0
            }
        }
    }

    /// Indexed register write. RF (index 7) is read-only; writing it faults,
    /// as does any out-of-range index.
    pub fn write_reg(&mut self, index: u32, value: u32) {
        match index {
            0 => self.ra = value,
            1 => self.rb = value,
            2 => self.rc = value,
            3 => self.rd = value,
            4 => self.cmpreg = value as u8,
            5 => self.sp = value,
            6 => self.bp = value,
            8 => self.hireg = value,
            _ => self.fault(Fault::IllegalRegisterIndex { index }),
        }
    }

    // --- memory --------------------------------------------------------

    // Accesses are unaligned little-endian. Only the starting offset is
    // range-checked; a wider access clipped by the end of memory keeps the
    // bytes that fit, and reads zero-extend the missing bytes.

    fn load_le(mem: &[u8], address: u32, width: usize) -> u32 {
        let mut word = [0u8; 4];
        for (i, slot) in word.iter_mut().enumerate().take(width) {
            if let Some(&byte) = mem.get(address as usize + i) {
                *slot = byte;
            }
        }
        u32::from_le_bytes(word)
    }

    fn store_le(mem: &mut [u8], address: u32, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            if let Some(slot) = mem.get_mut(address as usize + i) {
                *slot = byte;
            }
        }
    }

    pub fn read_mem1(&mut self, address: u32) -> u8 {
        if address < MEMORY_SIZE {
            self.mem[address as usize]
        } else {
            self.fault(Fault::MemoryOutOfBounds { address });
            0
        }
    }

    pub fn read_mem2(&mut self, address: u32) -> u16 {
        if address < MEMORY_SIZE {
            Self::load_le(&self.mem, address, 2) as u16
        } else {
            self.fault(Fault::MemoryOutOfBounds { address });
            0
        }
    }

    pub fn read_mem4(&mut self, address: u32) -> u32 {
        if address < MEMORY_SIZE {
            Self::load_le(&self.mem, address, 4)
        } else {
            self.fault(Fault::MemoryOutOfBounds { address });
            0
        }
    }

    pub fn write_mem1(&mut self, address: u32, value: u8) {
        if address < MEMORY_SIZE {
            self.mem[address as usize] = value;
        } else {
            self.fault(Fault::MemoryOutOfBounds { address });
        }
    }

    pub fn write_mem2(&mut self, address: u32, value: u16) {
        if address < MEMORY_SIZE {
            Self::store_le(&mut self.mem, address, &value.to_le_bytes());
        } else {
            self.fault(Fault::MemoryOutOfBounds { address });
        }
    }

    pub fn write_mem4(&mut self, address: u32, value: u32) {
        if address < MEMORY_SIZE {
            Self::store_le(&mut self.mem, address, &value.to_le_bytes());
        } else {
            self.fault(Fault::MemoryOutOfBounds { address });
        }
    }

    /// Raw instruction-word read for the fetch stage; the caller has already
    /// bounds-checked PC.
    pub(crate) fn fetch_word(&self, address: u32) -> u32 {
        Self::load_le(&self.mem, address, 4)
    }

    // --- stack ---------------------------------------------------------

    // The active stack cell sits at byte offset BP - SP - 3, computed with
    // wrapping 32-bit arithmetic: growing SP moves the cell toward lower
    // addresses relative to BP. One bound check covers underflow and
    // overflow alike; both raise the same fault.

    fn stack_offset(&self) -> u32 {
        self.bp.wrapping_sub(self.sp).wrapping_sub(3)
    }

    pub fn push(&mut self, value: u32) {
        let offset = self.stack_offset();
        if offset < MEMORY_SIZE {
            Self::store_le(&mut self.mem, offset, &value.to_le_bytes());
            self.sp = self.sp.wrapping_add(4);
        } else {
            self.fault(Fault::StackUnderflow);
        }
    }

    pub fn pop(&mut self) -> u32 {
        self.sp = self.sp.wrapping_sub(4);
        let offset = self.stack_offset();
        if offset < MEMORY_SIZE {
            Self::load_le(&self.mem, offset, 4)
        } else {
            self.fault(Fault::StackUnderflow);
            0
        }
    }

    // --- arithmetic/flag unit -------------------------------------------

    fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.rf |= bit;
        } else {
            self.rf &= !bit;
        }
    }

    /// 32-bit wrapping add. Carry is exact (the 64-bit sum does not fit in
    /// 32 bits); the overflow bit uses the ISA's documented heuristic, which
    /// is not a true signed-overflow test.
    pub(crate) fn add_with_flags(&mut self, a: u32, b: u32) -> u32 {
        let sum = a as i64 + b as i64;
        self.set_flag(RF_CARRY, (sum >> 32) != 0);
        self.set_flag(RF_OVERFLOW, a > 0 && b > u32::MAX - b);
        sum as u32
    }

    /// 32-bit wrapping subtract. Carry is set on borrow; the overflow
    /// heuristic never fires for zero-extended operands and is kept as the
    /// ISA documents it.
    pub(crate) fn sub_with_flags(&mut self, a: u32, b: u32) -> u32 {
        let diff = a as i64 - b as i64;
        self.set_flag(RF_CARRY, (diff >> 32) != 0);
        self.set_flag(
            RF_OVERFLOW,
            (b as i64) < 0 && a as i64 > i32::MAX as i64 + b as i64,
        );
        diff as u32
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
