//! Core module: descriptor base, outbound pages, arena, kontrak reactor.
//!
//! Prinsip desain:
//! - Satu interface tertutup (`Eventable`) untuk semua kind descriptor
//! - Opaque generation-checked `Binding`, tidak ada pointer antar object
//! - Poll loop eksternal; core hanya bereaksi pada dispatch

mod arena;
mod descriptor;
mod page;
mod reactor;

pub use arena::{Binding, DescriptorArena};
pub use descriptor::{DescriptorBase, Eventable, SendOutcome, DEFAULT_PENDING_CONNECT_TIMEOUT};
pub use page::{OutboundPage, PageQueue, MAX_GATHER_PAGES};
pub use reactor::{Callback, Micros, Multiplexer, ReactorCtx, SocketEvent};
