//! Network layer: kind descriptor konkret di atas mio.
//!
//! - Non-blocking I/O dengan epoll/kqueue lewat mio
//! - Stream: buffering + partial-write bookkeeping + TLS + proxy
//! - Listener: accept burst, satu StreamConnection per client
//! - Datagram: per-message queue dengan reply-to address
//! - Signal: wakeup lintas thread dan file-watch (internal loop)

mod datagram;
mod listener;
pub mod signal;
mod stream;

pub use datagram::{DatagramSocket, DatagramTransport};
pub use listener::{ListenSocket, ListenerTransport};
pub use signal::{WakeupHandle, WakeupSignal};
pub use stream::{StreamConnection, StreamTransport};

#[cfg(target_os = "linux")]
pub use signal::FileWatchSource;
