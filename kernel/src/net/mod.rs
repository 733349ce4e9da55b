//! Reliable messaging over the lossy packet network
//!
//! The post office de-multiplexes incoming packets into per-machine
//! mailboxes and layers segmented, acknowledged, in-order delivery on
//! top; connections, process migration and the file-transfer protocol
//! all ride on it.

pub mod connection;
pub mod ftp;
pub mod migrate;
pub mod post;

pub use connection::Connection;
pub use post::{MailHeader, MessageType, Payload, PostOffice};
