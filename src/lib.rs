//! argus - Event-Driven Socket Descriptor Core
//!
//! Reactor core untuk library I/O socket event-driven: mengelola
//! kumpulan descriptor socket-like, me-multiplex readiness lewat OS
//! poller (mio), dan men-dispatch event read/write/error/heartbeat ke
//! callback teregistrasi. Embedding framework memakai ini untuk
//! membangun server/client async tanpa polling loop manual.
//!
//! Arsitektur:
//! - Single-threaded kooperatif: semua callback jalan di thread poller
//! - Poll loop milik embedding; core hanya kontrak `Multiplexer`
//! - Descriptor hidup di `DescriptorArena` dengan binding
//!   generation-checked; binding basi gagal tertutup
//! - Satu-satunya primitive lintas thread: `WakeupSignal`
//!
//! Yang BUKAN urusan core ini: wire protocol, thread pool, kebijakan
//! retry/backoff aplikasi.

pub mod core;
pub mod error;
pub mod network;
pub mod tls;

pub use crate::core::{
    Binding, Callback, DescriptorArena, DescriptorBase, Eventable, Micros, Multiplexer,
    OutboundPage, PageQueue, ReactorCtx, SendOutcome, SocketEvent,
};
pub use crate::error::Fault;
pub use crate::network::{
    DatagramSocket, DatagramTransport, ListenSocket, ListenerTransport, StreamConnection,
    StreamTransport, WakeupHandle, WakeupSignal,
};
pub use crate::tls::{TlsBox, TlsParams, PROTO_TLSV1_2, PROTO_TLSV1_3};

#[cfg(target_os = "linux")]
pub use crate::network::FileWatchSource;
