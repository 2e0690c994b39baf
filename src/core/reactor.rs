//! Kontrak antara descriptor core dan poll loop milik embedding.
//!
//! Core ini TIDAK punya event loop sendiri. Embedding (misal `argus_echo`)
//! memiliki `mio::Poll`, mengimplementasikan [`Multiplexer`], dan memanggil
//! dispatch di [`DescriptorArena`] setiap kali OS melaporkan readiness.
//! Semua callback berjalan di thread poller; tidak boleh blocking.

use mio::event::Source;
use mio::Interest;

use crate::core::arena::{Binding, DescriptorArena};

/// Waktu dalam microseconds. Loop time monotonic, real time = wall clock.
pub type Micros = u64;

/// Layanan yang wajib disediakan poll loop untuk para descriptor.
///
/// Urutan penting: `Close()` descriptor selalu `deregister` DULU baru
/// melepas OS handle. Menutup fd sebelum deregister berisiko event basi
/// terkirim untuk nilai fd yang sudah dipakai ulang kernel (bahaya klasik
/// dengan pipe ends yang alias satu kernel object).
pub trait Multiplexer {
    /// Daftarkan source baru ke poll set. `interest == None` berarti
    /// descriptor belum mau event apa pun (belum di-arm).
    fn add(
        &mut self,
        source: &mut dyn Source,
        binding: Binding,
        interest: Option<Interest>,
    ) -> std::io::Result<()>;

    /// Ubah interest source yang sudah terdaftar. `None` = lepaskan dari
    /// poll set tanpa menutup (paused / tidak ada interest sama sekali).
    fn modify(
        &mut self,
        source: &mut dyn Source,
        binding: Binding,
        interest: Option<Interest>,
    ) -> std::io::Result<()>;

    /// Cabut source dari poll set. Dipanggil `Close()` SEBELUM fd dilepas.
    fn deregister(&mut self, source: &mut dyn Source) -> std::io::Result<()>;

    /// Daftarkan deadline heartbeat (wall clock, microseconds).
    fn queue_heartbeat(&mut self, binding: Binding, deadline: Micros);

    /// Hapus satu entry deadline yang pernah didaftarkan.
    fn clear_heartbeat(&mut self, deadline: Micros, binding: Binding);

    /// Monotonic loop clock (microseconds sejak loop start).
    fn loop_time_us(&self) -> Micros;

    /// Wall clock (microseconds sejak epoch).
    fn real_time_us(&self) -> Micros;

    /// Resolusi scheduler; dipakai kompensasi skew saat cek inactivity.
    fn timer_quantum_us(&self) -> Micros;

    /// Sebuah close baru saja dijadwalkan (pertama kali, bukan eskalasi).
    fn note_close_scheduled(&mut self);

    /// Descriptor dengan close terjadwal sudah benar-benar dilepas.
    fn note_close_finished(&mut self);

    /// WakeupSignal terbaca: thread lain minta loop bangun.
    fn on_wakeup(&mut self) {}

    /// FileWatchSource readable: ada change-notification yang harus
    /// dibaca dan di-dispatch oleh embedding.
    fn on_watch_events(&mut self) {}
}

/// Event yang di-dispatch ke callback descriptor.
///
/// Satu discriminated type, payload beda per kind. Payload byte-slice
/// meminjam buffer milik dispatch; copy kalau mau disimpan.
#[derive(Debug)]
pub enum SocketEvent<'a> {
    /// Listener menerima koneksi baru; payload = binding descriptor baru.
    ConnectionAccepted(Binding),
    /// Outbound connect selesai sukses.
    ConnectionCompleted,
    /// Data inbound (sesudah TLS unwrap kalau aktif).
    ConnectionRead(&'a [u8]),
    /// Descriptor dilepas; payload = OS reason code (0 = clean).
    ConnectionUnbound(i32),
    /// Proxy target mati duluan; dikirim ke source yang masih hidup.
    ProxyTargetUnbound,
    /// Byte limit proxy tercapai, relasi dilepas otomatis.
    ProxyCompleted,
    /// Handshake TLS selesai. Dijamin fire tepat sekali.
    TlsHandshakeCompleted,
    /// Sertifikat peer (DER) untuk diverifikasi aplikasi.
    /// Return `false` dari callback = tolak, koneksi di-abort.
    TlsVerifyPeer(&'a [u8]),
    /// Watch-only: socket readable (tanpa I/O dari core).
    NotifyReadable,
    /// Watch-only: socket writable (tanpa I/O dari core).
    NotifyWritable,
}

/// Callback per descriptor.
///
/// Return value hanya dibaca untuk `TlsVerifyPeer` (true = accept);
/// untuk event lain diabaikan.
pub type Callback = Box<dyn FnMut(Binding, SocketEvent<'_>) -> bool>;

/// Context yang diterima setiap dispatch.
///
/// `arena` adalah arena yang sama yang memuat descriptor ini - slot
/// miliknya sedang dikosongkan selama dispatch (slot stealing), jadi
/// lookup binding sendiri akan fail-closed. Akses ke descriptor LAIN
/// (proxy sink, paired source) lewat sini.
pub struct ReactorCtx<'a> {
    pub mux: &'a mut dyn Multiplexer,
    pub arena: &'a mut DescriptorArena,
}
