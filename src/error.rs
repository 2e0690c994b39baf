//! Fault taxonomy untuk API misuse dan kondisi unrecoverable.
//!
//! Transient I/O (WouldBlock/Interrupted) TIDAK pernah muncul di sini -
//! kondisi itu diserap di dalam komponen dan di-retry pada wake berikutnya.
//! `Fault` hanya untuk kesalahan yang harus dilihat caller secara sinkron.

use std::io;
use thiserror::Error;

/// Synchronous fault dari mutating API calls (send, start-TLS, start-proxy).
///
/// Kondisi fatal yang ditemukan saat poll-driven I/O tidak lewat sini -
/// itu direkam sebagai reason code dan muncul lewat `ConnectionUnbound`.
#[derive(Debug, Error)]
pub enum Fault {
    /// Binding sudah stale (slot dipakai ulang) atau bukan kind yang diminta.
    #[error("descriptor not found: stale binding or wrong descriptor kind")]
    NotFound,

    /// I/O diminta pada koneksi watch-only.
    #[error("cannot perform i/o on a watch-only connection")]
    WatchOnly,

    /// Operasi notify-readable/writable butuh mode watch-only.
    #[error("notify readable/writable requires a watch-only connection")]
    NotWatchOnly,

    /// TLS sudah jalan di koneksi ini.
    #[error("TLS already running on this connection")]
    TlsAlreadyStarted,

    /// TLS parameters beku setelah `start_tls`.
    #[error("TLS parameters are immutable once TLS has started")]
    TlsParamsFrozen,

    /// Proxy target sudah punya source aktif.
    #[error("proxy target is already attached to another source")]
    ProxyTargetBusy,

    /// Destination address tidak bisa di-resolve.
    #[error("malformed destination address: {0}")]
    BadAddress(String),

    /// Alokasi buffer outbound gagal. Data caller TIDAK di-drop diam-diam.
    #[error("outbound buffer allocation failed")]
    OutOfMemory,

    /// Code path yang seharusnya tidak pernah tercapai oleh kind ini.
    #[error("bad code path: {0}")]
    BadCodePath(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}
