//! Per-thread user execution context
//!
//! The saved user register file and the owning address space. Every
//! trap marshals arguments out of and results back into this value;
//! process migration serializes it directly.

use super::Machine;
use crate::config::machine_layout::*;
use crate::config::memory_layout::PAGE_SIZE;
use crate::mm::AddrSpace;
use std::sync::Arc;

pub struct UserContext {
    pub regs: [i32; NUM_TOTAL_REGS],
    pub space: Arc<AddrSpace>,
}

impl UserContext {
    pub fn new(space: Arc<AddrSpace>) -> Self {
        Self {
            regs: [0; NUM_TOTAL_REGS],
            space,
        }
    }

    /// Zero the register file and point PC at the program start, with
    /// the stack register just under the top of the address space.
    pub fn init_registers(&mut self) {
        self.regs = [0; NUM_TOTAL_REGS];
        self.regs[PC_REG] = 0;
        // The branch-delay convention keeps NextPC one word ahead.
        self.regs[NEXT_PC_REG] = 4;
        let sp = self.space.size() - 16;
        self.regs[STACK_REG] = sp as i32;
        log::debug!(target: "mm", "initializing stack register to {sp}");
    }

    /// Advance the PC chain past the trapping instruction.
    pub fn advance_pc(&mut self) {
        let pc = self.regs[PC_REG];
        self.regs[PREV_PC_REG] = pc;
        let pc = self.regs[NEXT_PC_REG];
        self.regs[PC_REG] = pc;
        self.regs[NEXT_PC_REG] = pc + 4;
    }

    pub fn pc(&self) -> u32 {
        self.regs[PC_REG] as u32
    }

    /// Read a 1-, 2- or 4-byte little-endian value at a user virtual
    /// address, through this context's page table.
    pub fn read_mem(&self, machine: &Machine, vaddr: u32, size: usize) -> i32 {
        let phys = self.translate(vaddr, size);
        let mut buf = [0u8; 4];
        machine.read_phys(phys, &mut buf[..size]);
        i32::from_le_bytes(buf)
    }

    /// Write a 1-, 2- or 4-byte little-endian value at a user virtual
    /// address, through this context's page table.
    pub fn write_mem(&self, machine: &Machine, vaddr: u32, size: usize, value: i32) {
        let phys = self.translate(vaddr, size);
        machine.write_phys(phys, &value.to_le_bytes()[..size]);
    }

    fn translate(&self, vaddr: u32, size: usize) -> usize {
        assert!(
            size == 1 || size == 2 || size == 4,
            "invalid transfer size {size}"
        );
        assert!(
            vaddr as usize % size == 0,
            "unaligned user access at {vaddr:#x}"
        );
        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;
        let frame = self
            .space
            .translate(vpn)
            .unwrap_or_else(|| panic!("address error in user space at {vaddr:#x}"));
        frame * PAGE_SIZE + offset
    }
}
