//! Kernel configuration constants

pub mod disk_layout {
    /// Bytes per disk sector, also the transfer unit of the disk device
    pub const SECTOR_SIZE: usize = 128;

    /// Total sectors on the simulated disk (512 KiB)
    pub const NUM_SECTORS: usize = 4096;

    /// Sector holding the free-sector bitmap's file header
    pub const FREE_MAP_SECTOR: usize = 0;

    /// Sector holding the root directory's file header
    pub const ROOT_SECTOR: usize = 1;

    /// Size of the free-sector bitmap file in bytes
    pub const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;

    /// Entries per directory
    pub const NUM_DIR_ENTRIES: usize = 10;

    /// Longest file name stored in a directory entry (excluding NUL)
    pub const FILE_NAME_MAX: usize = 9;

    /// On-disk size of one directory entry: in_use + name field + sector
    pub const DIR_ENTRY_SIZE: usize = 4 + (FILE_NAME_MAX + 1) + 4;

    /// Size of a directory file in bytes
    pub const DIRECTORY_FILE_SIZE: usize = DIR_ENTRY_SIZE * NUM_DIR_ENTRIES;

    /// Pointer slots in one file header sector: (SECTOR_SIZE - 3 * 4) / 4
    pub const NUM_DIRECT: usize = (SECTOR_SIZE - 3 * 4) / 4;

    /// Sector pointers held by one sector of the indirect block
    pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

    /// Longest representable file: direct prefix plus a full indirect block
    pub const MAX_FILE_SIZE: usize =
        (NUM_DIRECT - 1) * SECTOR_SIZE + NUM_DIRECT * PTRS_PER_SECTOR * SECTOR_SIZE;

    /// Live entries in the user open-file table
    pub const MAX_OPENED_FILES: usize = 10;
}

pub mod memory_layout {
    /// Bytes per page; equal to the sector size so a page is one transfer
    pub const PAGE_SIZE: usize = 128;

    /// Physical frames backing all address spaces on one machine (128 KiB)
    pub const NUM_PHYS_PAGES: usize = 1024;

    /// Bytes of user stack appended to every executable image
    pub const USER_STACK_SIZE: usize = 1024;

    /// Stack bytes carved out of the user stack for one user thread
    pub const THREAD_STACK_SIZE: usize = 256;
}

pub mod task_limits {
    /// Kernel threads alive at once, across all processes
    pub const MAX_THREADS: usize = 128;

    /// User threads per process, beyond the main thread
    pub const MAX_THREADS_PER_PROCESS: usize = 3;

    /// Concurrently live processes
    pub const MAX_PROCESSES: usize = 8;

    /// Semaphore slots per process
    pub const MAX_SEM: usize = 10;
}

pub mod machine_layout {
    /// User-visible register file size: 32 general registers plus the
    /// Hi/Lo multiply registers, the PC chain and load-delay bookkeeping
    pub const NUM_TOTAL_REGS: usize = 40;

    pub const STACK_REG: usize = 29;
    pub const RET_ADDR_REG: usize = 31;
    pub const HI_REG: usize = 32;
    pub const LO_REG: usize = 33;
    pub const PC_REG: usize = 34;
    pub const NEXT_PC_REG: usize = 35;
    pub const PREV_PC_REG: usize = 36;
    pub const LOAD_REG: usize = 37;
    pub const LOAD_VALUE_REG: usize = 38;
    pub const BAD_VADDR_REG: usize = 39;

    /// Register carrying the syscall code in and the result out
    pub const RET_REG: usize = 2;

    /// First of the four argument registers (r4..r7)
    pub const ARG_REG: usize = 4;

    /// Bound on strings marshalled between user and kernel space
    pub const MAX_STRING_SIZE: usize = 256;
}

pub mod net_layout {
    /// Packet body capacity after the network's own packet header
    pub const MAX_PACKET_SIZE: usize = 64;

    /// Serialized mail header: to, from, length, type, message_id
    pub const MAIL_HEADER_SIZE: usize = 20;

    /// Payload bytes carried by one segment
    pub const MAX_SEGMENT_SIZE: usize = MAX_PACKET_SIZE - MAIL_HEADER_SIZE;

    /// Mailboxes per post office
    pub const NUM_BOXES: usize = 16;

    /// Well-known mailbox where connection requests arrive
    pub const LISTEN_BOX: usize = 0;

    /// Retransmissions of one segment before the send is abandoned
    pub const MAX_REEMISSIONS: usize = 50;

    /// Period of the ack-condition broadcast timer
    pub const TEMPO: core::time::Duration = core::time::Duration::from_millis(25);

    /// Period of the disconnect drain timer
    pub const DISCONNECT_TEMPO: core::time::Duration = core::time::Duration::from_millis(100);

    /// Client machines an FTP server will track, indexed by machine id
    pub const MAX_CLIENTS: usize = 50;
}
