//! Transport abstractions and framing for zippy-link.
//!
//! The command channel between two paired peers is consumed as an opaque
//! bidirectional byte-message link. This crate defines that seam, a TCP
//! implementation, the connection-state vocabulary shared by the runtime,
//! and in-process transports for tests.

pub mod traits;
pub mod framing;
pub mod connection;
pub mod tcp;
pub mod testing;

pub use traits::*;
pub use framing::*;
pub use connection::*;
pub use tcp::*;
pub use testing::*;
