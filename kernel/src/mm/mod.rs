//! Memory management
//!
//! Physical frames are a machine-wide pool handed out by the
//! [`FrameProvider`]; each process owns a page table over that pool in
//! its [`AddrSpace`], which also carries the per-process thread-slot
//! and semaphore tables.

pub mod addr_space;
pub mod frame_allocator;
pub mod page_table;

pub use addr_space::AddrSpace;
pub use frame_allocator::FrameProvider;
pub use page_table::{PageTable, PteFlags, TranslationEntry};
