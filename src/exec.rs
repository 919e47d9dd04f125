use log::{debug, trace};

use crate::cpu::{Cpu, MEMORY_SIZE, RF_CMP, RF_IRQ_ENABLE};
use crate::fault::Fault;
use crate::isa::{CmpPredicate, Instruction, Opcode, INSTRUCTION_BYTES};

impl Cpu {
    /// Advances the machine by one clock tick: either interrupt entry or one
    /// fetched instruction. Returns false only when the machine was already
    /// halted, in which case nothing happens.
    pub fn tick(&mut self) -> bool {
        if self.halted {
            return false;
        }
        self.cycles += 1;

        let instruction = if self.take_interrupt() {
            // Interrupt entry consumes the cycle; the execute stage runs
            // against an empty record, which decodes to NOP.
            Instruction::default()
        } else {
            self.fetch()
        };
        self.execute(&instruction);

        // The latch is edge-triggered: consumed once per tick, taken or not.
        self.irq_pending = false;
        true
    }

    /// Diverts this tick into the interrupt vector when the line is enabled,
    /// the latch is set, and no interrupt is already being serviced.
    fn take_interrupt(&mut self) -> bool {
        if self.irq_pending && !self.in_interrupt && self.rf & RF_IRQ_ENABLE != 0 {
            trace!("interrupt entry, vector {:#x}", self.hireg);
            self.rf &= !RF_IRQ_ENABLE; // masked until the handler returns
            let return_pc = self.pc;
            self.push(return_pc);
            self.pc = self.hireg;
            self.in_interrupt = true;
            true
        } else {
            false
        }
    }

    /// Reads the 16-byte record at PC and advances PC past it. A PC inside
    /// the last record's worth of memory faults before the fetch, leaving PC
    /// where it was and yielding the empty record.
    fn fetch(&mut self) -> Instruction {
        if self.pc > MEMORY_SIZE - INSTRUCTION_BYTES {
            let pc = self.pc;
            self.fault(Fault::PcOverflow { pc });
            return Instruction::default();
        }
        let instruction = Instruction {
            opcode: self.fetch_word(self.pc),
            a: self.fetch_word(self.pc + 4),
            b: self.fetch_word(self.pc + 8),
            c: self.fetch_word(self.pc + 12),
        };
        self.pc += INSTRUCTION_BYTES;
        instruction
    }

    fn execute(&mut self, ins: &Instruction) {
        let Some(opcode) = Opcode::from_u32(ins.opcode) else {
            self.fault(Fault::UnknownInstruction { opcode: ins.opcode });
            return;
        };
        trace!("executing {} a={:#x} b={:#x} c={:#x}", opcode, ins.a, ins.b, ins.c);

        match opcode {
            Opcode::Nop => {}
            Opcode::Mov => self.write_reg(ins.a, ins.b),
            Opcode::WriteImm4 => self.write_mem4(ins.a, ins.b),
            Opcode::WriteImm2 => self.write_mem2(ins.a, ins.b as u16),
            Opcode::WriteImm1 => self.write_mem1(ins.a, ins.b as u8),
            Opcode::ReadPtr1 => {
                let address = self.read_reg(ins.b);
                let byte = self.read_mem1(address);
                self.write_reg(ins.a, byte as u32);
            }
            Opcode::Add => {
                let a = self.read_reg(ins.a);
                let b = self.read_reg(ins.b);
                let result = self.add_with_flags(a, b);
                self.write_reg(ins.a, result);
            }
            Opcode::Sub => {
                let a = self.read_reg(ins.a);
                let b = self.read_reg(ins.b);
                let result = self.sub_with_flags(a, b);
                self.write_reg(ins.a, result);
            }
            Opcode::Mul => {
                let a = self.read_reg(ins.a);
                let b = self.read_reg(ins.b);
                let product = a as u64 * b as u64;
                self.write_reg(ins.a, product as u32);
            }
            Opcode::Div => {
                let a = self.read_reg(ins.a);
                let b = self.read_reg(ins.b);
                if b == 0 {
                    self.fault(Fault::DivisionByZero);
                }
                // The handler keeps running after the fault; a zero divisor
                // yields zero quotient and remainder.
                let quotient = a.checked_div(b).unwrap_or(0);
                let remainder = a.checked_rem(b).unwrap_or(0);
                self.write_reg(ins.a, quotient);
                self.write_reg(ins.c, remainder);
            }
            Opcode::And => {
                let result = self.read_reg(ins.a) & self.read_reg(ins.b);
                self.write_reg(ins.a, result);
            }
            Opcode::Or => {
                let result = self.read_reg(ins.a) | self.read_reg(ins.b);
                self.write_reg(ins.a, result);
            }
            Opcode::Xor => {
                let result = self.read_reg(ins.a) ^ self.read_reg(ins.b);
                self.write_reg(ins.a, result);
            }
            Opcode::Inc => {
                let value = self.read_reg(ins.a);
                let result = self.add_with_flags(value, 1);
                self.write_reg(ins.a, result);
            }
            Opcode::Dec => {
                let value = self.read_reg(ins.a);
                let result = self.sub_with_flags(value, 1);
                self.write_reg(ins.a, result);
            }
            Opcode::Cmp => self.execute_cmp(ins),
            Opcode::Jmp => {
                let address = self.read_reg(ins.a);
                if address < MEMORY_SIZE {
                    self.pc = address;
                }
            }
            Opcode::JmpImm => {
                if ins.a < MEMORY_SIZE {
                    self.pc = ins.a;
                }
            }
            Opcode::JmpIf => {
                let address = self.read_reg(ins.a);
                if address < MEMORY_SIZE && self.rf & RF_CMP != 0 {
                    self.pc = address;
                }
            }
            Opcode::Push => {
                let value = self.read_reg(ins.a);
                self.push(value);
            }
            Opcode::Pop => {
                let value = self.pop();
                self.write_reg(ins.a, value);
            }
            Opcode::PushReg => {
                let (ra, rb, rc, rd, cmpreg) = (self.ra, self.rb, self.rc, self.rd, self.cmpreg);
                self.push(ra);
                self.push(rb);
                self.push(rc);
                self.push(rd);
                self.push(cmpreg as u32);
            }
            Opcode::PopReg => {
                self.cmpreg = self.pop() as u8;
                self.rd = self.pop();
                self.rc = self.pop();
                self.rb = self.pop();
                self.ra = self.pop();
            }
            Opcode::Call => {
                let return_pc = self.pc;
                self.push(return_pc);
                self.pc = ins.a;
            }
            Opcode::Ret => self.pc = self.pop(),
            Opcode::Out => self.execute_out(ins),
            Opcode::Halt => {
                debug!("HALT at cycle {}", self.cycles);
                self.halted = true;
            }
            Opcode::Clhi => self.rf &= !RF_IRQ_ENABLE,
            Opcode::Sthi => {
                // Cannot re-enable from inside the handler.
                if !self.in_interrupt {
                    self.rf |= RF_IRQ_ENABLE;
                }
            }
            Opcode::Hiret => self.execute_hiret(),
            // Declared in the ISA but never wired to a handler; these fault
            // exactly like an opcode value with no meaning at all.
            Opcode::ReadImm4
            | Opcode::ReadImm2
            | Opcode::ReadImm1
            | Opcode::ReadPtr4
            | Opcode::ReadPtr2
            | Opcode::WritePtr4
            | Opcode::WritePtr2
            | Opcode::WritePtr1
            | Opcode::Lshift
            | Opcode::Rshift
            | Opcode::JmpRel
            | Opcode::JmpRelIf
            | Opcode::In
            | Opcode::Int
            | Opcode::Imul
            | Opcode::Idiv => {
                self.fault(Fault::UnknownInstruction { opcode: ins.opcode });
            }
        }
    }

    fn execute_cmp(&mut self, ins: &Instruction) {
        let a = self.read_reg(ins.a);
        let b = self.read_reg(ins.b);
        let result = match CmpPredicate::from_u8(self.cmpreg) {
            Some(predicate) => predicate.eval(a, b),
            None => {
                let predicate = self.cmpreg;
                self.fault(Fault::UndefinedComparePredicate { predicate });
                false // the flag update below still runs
            }
        };
        self.rf = (self.rf & !RF_CMP) | result as u8;
    }

    fn execute_out(&mut self, ins: &Instruction) {
        match ins.b {
            0 => {
                let byte = (self.read_reg(ins.a) & 0xFF) as u8;
                self.out_buf.lock().push(byte);
            }
            _ => {} // only channel 0 is wired up
        }
    }

    fn execute_hiret(&mut self) {
        if !self.in_interrupt {
            // Misuse halts the machine, but the state changes below still
            // land before the halt takes effect on the next tick.
            self.fault(Fault::InterruptMisuse);
        }
        self.rf |= RF_IRQ_ENABLE;
        self.in_interrupt = false;
        self.pc = self.pop();
    }
}
