//! Executable loader
//!
//! Object files carry a fixed header naming three segments (code,
//! initialized data, uninitialized data); the loader sizes an address
//! space over them plus the user stack and copies the file-backed
//! segments in through virtual memory, one byte at a time, so the page
//! table is exercised exactly as user accesses will exercise it.

use crate::config::memory_layout::{PAGE_SIZE, USER_STACK_SIZE};
use crate::error::{KernelError, Result};
use crate::fs::OpenFile;
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::mm::AddrSpace;
use crate::utils::div_round_up;
use std::sync::Arc;

pub const OBJ_MAGIC: u32 = 0x4D494E4F;

/// One segment descriptor from the object header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub virtual_addr: u32,
    pub in_file_addr: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObjHeader {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

pub const OBJ_HEADER_SIZE: usize = 4 + 3 * 12;

impl ObjHeader {
    /// Read and validate the header at the start of an executable.
    pub fn read_from(file: &OpenFile) -> Result<Self> {
        let mut buf = [0u8; OBJ_HEADER_SIZE];
        if file.read_at(&mut buf, 0) != OBJ_HEADER_SIZE {
            return Err(KernelError::TypeMismatch);
        }
        let word = |i: usize| u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        if word(0) != OBJ_MAGIC {
            log::debug!(target: "mm", "bad object magic {:#x}", word(0));
            return Err(KernelError::TypeMismatch);
        }
        let seg = |base: usize| Segment {
            virtual_addr: word(base),
            size: word(base + 1),
            in_file_addr: word(base + 2),
        };
        Ok(Self {
            code: seg(1),
            init_data: seg(4),
            uninit_data: seg(7),
        })
    }

    /// Serialize, for tools and tests that synthesize executables.
    pub fn to_bytes(&self) -> [u8; OBJ_HEADER_SIZE] {
        let mut buf = [0u8; OBJ_HEADER_SIZE];
        let mut put = |i: usize, v: u32| buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        put(0, OBJ_MAGIC);
        for (base, seg) in [(1, self.code), (4, self.init_data), (7, self.uninit_data)] {
            put(base, seg.virtual_addr);
            put(base + 1, seg.size);
            put(base + 2, seg.in_file_addr);
        }
        buf
    }
}

/// Build the address space for `exe`: code + data + bss + user stack,
/// rounded up to pages, with the file-backed segments copied in.
pub fn new_space_from(kernel: &Arc<Kernel>, pid: usize, exe: &mut OpenFile) -> Result<AddrSpace> {
    let header = ObjHeader::read_from(exe)?;
    let size = (header.code.size + header.init_data.size + header.uninit_data.size) as usize
        + USER_STACK_SIZE;
    let n_pages = div_round_up(size, PAGE_SIZE);
    let space = AddrSpace::new(pid, n_pages, &kernel.machine, &kernel.frames)?;

    for seg in [header.code, header.init_data] {
        if seg.size > 0 {
            log::debug!(
                target: "mm",
                "initializing segment at {:#x}, size {}",
                seg.virtual_addr,
                seg.size
            );
            read_at_virtual(
                &kernel.machine,
                &space,
                exe,
                seg.virtual_addr,
                seg.size as usize,
                seg.in_file_addr as usize,
            );
        }
    }
    Ok(space)
}

/// Copy `n_bytes` at file offset `position` into the space's virtual
/// memory starting at `virtual_addr`.
fn read_at_virtual(
    machine: &Machine,
    space: &AddrSpace,
    exe: &OpenFile,
    virtual_addr: u32,
    n_bytes: usize,
    position: usize,
) {
    let mut bytes = vec![0u8; n_bytes];
    exe.read_at(&mut bytes, position);
    for (i, byte) in bytes.iter().enumerate() {
        let vaddr = virtual_addr as usize + i;
        let frame = space
            .translate(vaddr / PAGE_SIZE)
            .expect("executable segment outside its address space");
        machine.write_phys(frame * PAGE_SIZE + vaddr % PAGE_SIZE, &[*byte]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = ObjHeader {
            code: Segment {
                virtual_addr: 0,
                size: 16,
                in_file_addr: 40,
            },
            init_data: Segment {
                virtual_addr: 16,
                size: 8,
                in_file_addr: 56,
            },
            uninit_data: Segment {
                virtual_addr: 24,
                size: 32,
                in_file_addr: 0,
            },
        };
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[..4], &OBJ_MAGIC.to_le_bytes());
        // Parsing happens through OpenFile in the real path; here just
        // check the layout directly.
        let word =
            |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(1), 0);
        assert_eq!(word(2), 16);
        assert_eq!(word(3), 40);
        assert_eq!(word(8), 32);
    }
}
