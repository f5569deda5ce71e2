//! # Network and Local I/O
//!
//! OS-level plumbing: the shared UDP socket, the per-channel FIFO endpoints,
//! and the poll infrastructure used by the session's threads.

pub mod event;
pub mod fifo;
pub mod udp;

pub use event::{EventLoop, WakePipe, POLLIN, WAKE_REBUILD, WAKE_STOP};
pub use fifo::{fd_readable, InFifo, OutFifo};
pub use udp::{ReceivedDatagram, UdpPort};
