//! Full-duplex byte-stream connection.
//!
//! Descriptor paling berat di crate ini: outbound buffering dengan
//! partial-write bookkeeping, pending-connect handling, TLS framing,
//! backpressure untuk relasi proxy, watch-only mode, dan timeout
//! heartbeats. Semua I/O non-blocking; WouldBlock diserap dan dicoba
//! lagi pada readiness wake berikutnya.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::time::Duration;

use mio::event::Source;
use mio::net::TcpStream;
use mio::Interest;
use socket2::{SockRef, TcpKeepalive};

use crate::core::{
    DescriptorBase, Eventable, Multiplexer, OutboundPage, PageQueue, ReactorCtx, SendOutcome,
    SocketEvent, MAX_GATHER_PAGES,
};
use crate::error::Fault;
use crate::tls::{TlsBox, TlsParams};

/// Maksimum read attempt per wake. Amortisasi syscall cost sambil tetap
/// memberi giliran ke descriptor lain di loop single-threaded.
const READ_BURST: usize = 10;

/// Read buffer per attempt. Kita baca satu byte KURANG dari kapasitas
/// supaya ada tempat untuk guard byte di belakang chunk.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Plaintext dipotong sebesar ini sebelum masuk TLS box.
const TLS_INPUT_CHUNK: usize = 2048;

/// Buffer untuk menarik plaintext keluar dari TLS box.
const TLS_PLAIN_BUFFER: usize = 16 * 1024;

#[inline]
fn transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || e.raw_os_error() == Some(libc::EINPROGRESS)
}

#[inline]
fn reason_code(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(0)
}

/// Transport byte-stream yang bisa dikendarai `StreamConnection`.
///
/// Produksi memakai `mio::net::TcpStream`; test memakai transport
/// simulasi (partial write, error injection) lewat trait ini.
pub trait StreamTransport: Read + Write + Source + 'static {
    /// Poll SO_ERROR: `Ok(None)` berarti tidak ada error pending.
    fn take_socket_error(&mut self) -> io::Result<Option<io::Error>>;
    fn shutdown_write(&mut self) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn set_nodelay(&self, on: bool) -> io::Result<()>;
    fn raw_fd(&self) -> RawFd;
    /// Serahkan kepemilikan fd TANPA menutupnya (attached / reserved fd).
    fn surrender(self);
}

impl StreamTransport for TcpStream {
    fn take_socket_error(&mut self) -> io::Result<Option<io::Error>> {
        self.take_error()
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn set_nodelay(&self, on: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, on)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn surrender(self) {
        let _ = self.into_raw_fd();
    }
}

/// Koneksi byte-stream full-duplex di atas satu socket non-blocking.
///
/// State: PendingConnect -> Connected{Active|Paused} -> Closing -> Closed.
/// Mode watch-only orthogonal: readiness dilaporkan mentah lewat
/// `NotifyReadable`/`NotifyWritable` tanpa I/O dari core.
pub struct StreamConnection<S: StreamTransport = TcpStream> {
    base: DescriptorBase,
    socket: Option<S>,
    queue: PageQueue,
    connect_pending: bool,
    notify_readable: bool,
    notify_writable: bool,
    server_mode: bool,
    tls: Option<TlsBox>,
    tls_params: TlsParams,
    handshake_signaled: bool,
    verify_fired: bool,
    /// Interest terakhir yang didaftarkan; Modify di-skip kalau tidak
    /// berubah (satu titik recompute untuk semua poller).
    last_interest: Option<Interest>,
    read_attempted_after_close: bool,
    write_attempted_after_close: bool,
}

impl StreamConnection<TcpStream> {
    /// Mulai outbound connect non-blocking. Descriptor lahir dalam
    /// state pending-connect; promosi terjadi di `write()` pertama.
    pub fn connect(addr: SocketAddr, mux: &dyn Multiplexer) -> io::Result<Self> {
        let sock = TcpStream::connect(addr)?;
        let mut conn = Self::from_transport(sock, mux);
        conn.connect_pending = true;
        Ok(conn)
    }

    /// Bungkus socket hasil accept (server mode, sudah connected).
    pub fn accepted(sock: TcpStream, mux: &dyn Multiplexer) -> Self {
        let mut conn = Self::from_transport(sock, mux);
        conn.server_mode = true;
        conn
    }

    /// Attach fd milik embedding. Handle TIDAK akan pernah ditutup oleh
    /// core; saat teardown fd diserahkan balik lewat `into_raw_fd`.
    /// `watch_only` = true berarti core tidak melakukan I/O sama sekali,
    /// hanya melaporkan readiness.
    pub fn attach(sock: TcpStream, watch_only: bool, mux: &dyn Multiplexer) -> Self {
        let mut conn = Self::from_transport(sock, mux);
        conn.base.attached = true;
        conn.base.watch_only = watch_only;
        conn
    }
}

impl<S: StreamTransport> StreamConnection<S> {
    /// Constructor generik; dipakai produksi lewat wrapper di atas dan
    /// test lewat transport simulasi.
    pub fn from_transport(sock: S, mux: &dyn Multiplexer) -> Self {
        Self {
            base: DescriptorBase::new(mux.loop_time_us()),
            socket: Some(sock),
            queue: PageQueue::new(),
            connect_pending: false,
            notify_readable: false,
            notify_writable: false,
            server_mode: false,
            tls: None,
            tls_params: TlsParams::default(),
            handshake_signaled: false,
            verify_fired: false,
            last_interest: None,
            read_attempted_after_close: false,
            write_attempted_after_close: false,
        }
    }

    pub fn set_server_mode(&mut self) {
        self.server_mode = true;
    }

    pub fn is_server_mode(&self) -> bool {
        self.server_mode
    }

    pub fn is_connect_pending(&self) -> bool {
        self.connect_pending
    }

    pub fn is_paused(&self) -> bool {
        self.base.paused
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.as_ref() {
            Some(s) => s.peer_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.as_ref() {
            Some(s) => s.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Tandai koneksi sedang menunggu hasil connect; write interest
    /// di-arm supaya disposisi connect terlihat, dan heartbeat mulai
    /// menghitung pending-connect timeout.
    pub fn set_connect_pending(&mut self, pending: bool, mux: &mut dyn Multiplexer) {
        self.connect_pending = pending;
        self.reschedule_heartbeat(mux);
        self.update_events(mux);
    }

    // ------------------------------------------------------------------
    // Readiness selection - satu titik kebenaran untuk poll interest
    // ------------------------------------------------------------------

    /// Koneksi selalu mau readable KECUALI pending-connect. Di Linux,
    /// socket non-blocking yang connect-nya gagal tidak selalu select
    /// readable+writable; disposisi connect baru ketahuan saat writable.
    /// Socket yang sukses connect dan select writable bisa saja sudah
    /// punya data, jadi readable baru di-arm setelah state connected.
    fn select_for_read(&self) -> bool {
        if self.base.paused {
            false
        } else if self.connect_pending {
            false
        } else if self.base.watch_only {
            self.notify_readable
        } else {
            true
        }
    }

    /// Pending-connect SELALU writable; normal state hanya kalau ada
    /// data outbound yang antri.
    fn select_for_write(&self) -> bool {
        if self.base.paused {
            false
        } else if self.connect_pending {
            true
        } else if self.base.watch_only {
            self.notify_writable
        } else {
            self.queue.len_bytes() > 0
        }
    }

    fn compute_interest(&self) -> Option<Interest> {
        match (self.select_for_read(), self.select_for_write()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn update_events(&mut self, mux: &mut dyn Multiplexer) {
        let interest = self.compute_interest();
        if interest == self.last_interest {
            return;
        }
        let binding = self.base.binding();
        if let Some(sock) = self.socket.as_mut() {
            if mux.modify(sock, binding, interest).is_ok() {
                self.last_interest = interest;
            }
        }
    }

    // ------------------------------------------------------------------
    // Watch-only knobs
    // ------------------------------------------------------------------

    /// Alihkan ke/dari mode watch-only: readiness dilaporkan mentah,
    /// core tidak membaca/menulis atas nama descriptor.
    pub fn set_watch_only(&mut self, watching: bool, mux: &mut dyn Multiplexer) {
        self.base_mut().watch_only = watching;
        self.update_events(mux);
    }

    pub fn is_watch_only(&self) -> bool {
        self.base.watch_only
    }

    pub fn set_notify_readable(
        &mut self,
        on: bool,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        if !self.base.watch_only {
            return Err(Fault::NotWatchOnly);
        }
        self.notify_readable = on;
        self.update_events(mux);
        Ok(())
    }

    pub fn set_notify_writable(
        &mut self,
        on: bool,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        if !self.base.watch_only {
            return Err(Fault::NotWatchOnly);
        }
        self.notify_writable = on;
        self.update_events(mux);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Queue plaintext (atau, tanpa TLS, raw bytes) untuk dikirim.
    ///
    /// Kontrak return: `Ok(n)` dengan `n` = byte plaintext caller yang
    /// diterima - all-or-nothing, `n == data.len()` saat sukses,
    /// `Ok(0)` kalau close sudah terjadwal (send diabaikan). Tidak ada
    /// partial count.
    pub fn send(&mut self, data: &[u8], mux: &mut dyn Multiplexer) -> Result<usize, Fault> {
        Ok(self.send_outbound(data, mux)?.accepted)
    }

    /// Jalur internal tanpa TLS wrap; dipakai juga oleh drain loop TLS
    /// untuk menaruh ciphertext ke queue.
    fn send_raw(&mut self, data: &[u8], mux: &mut dyn Multiplexer) -> Result<usize, Fault> {
        if self.base.is_close_scheduled() {
            return Ok(0);
        }
        // Paket 0 byte tidak berarti di TCP; juga menghindari page kosong
        // menumpuk di queue.
        if data.is_empty() {
            return Ok(0);
        }
        self.queue.push(OutboundPage::new(data)?);
        self.update_events(mux);
        Ok(data.len())
    }

    fn send_tls(&mut self, data: &[u8], mux: &mut dyn Multiplexer) -> Result<usize, Fault> {
        if data.is_empty() {
            return Ok(0);
        }
        for piece in data.chunks(TLS_INPUT_CHUNK) {
            let res = match self.tls.as_mut() {
                Some(tls) => tls.put_plaintext(piece),
                None => return Err(Fault::BadCodePath("tls send without session")),
            };
            if let Err(e) = res {
                let _ = self.schedule_close(false, mux);
                return Err(Fault::Io(e));
            }
            self.pump_tls(mux);
        }
        Ok(data.len())
    }

    // ------------------------------------------------------------------
    // TLS plumbing
    // ------------------------------------------------------------------

    /// Pasang parameter TLS. Beku setelah `start_tls`.
    pub fn set_tls_params(&mut self, params: TlsParams) -> Result<(), Fault> {
        if self.tls.is_some() {
            return Err(Fault::TlsParamsFrozen);
        }
        self.tls_params = params;
        Ok(())
    }

    /// Mulai sesi TLS di atas koneksi ini. Server mode memakai cert/key
    /// dari params; client mode memakai SNI dari params (fallback ke
    /// alamat peer).
    pub fn start_tls(&mut self, mux: &mut dyn Multiplexer) -> Result<(), Fault> {
        if self.tls.is_some() {
            return Err(Fault::TlsAlreadyStarted);
        }
        if self.base.watch_only {
            return Err(Fault::WatchOnly);
        }
        let tls = if self.server_mode {
            TlsBox::server(&self.tls_params)?
        } else {
            let fallback = self
                .socket
                .as_ref()
                .and_then(|s| s.peer_addr().ok())
                .map(|a| a.ip().to_string());
            TlsBox::client(&self.tls_params, fallback)?
        };
        self.tls = Some(tls);
        // Client hello (atau server flight pertama) keluar sekarang.
        self.pump_tls(mux);
        Ok(())
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls.is_some()
    }

    /// TLS gagal di level protokol: reason EPROTO, close immediate,
    /// surfaced asinkron lewat unbind.
    fn abort_tls_session(&mut self, mux: &mut dyn Multiplexer) {
        self.base.unbind_reason = libc::EPROTO;
        let _ = self.schedule_close(false, mux);
    }

    fn check_handshake_status(&mut self) {
        if self.handshake_signaled {
            return;
        }
        if self.tls.as_ref().map_or(false, |t| t.is_handshake_completed()) {
            self.handshake_signaled = true;
            self.base.fire(SocketEvent::TlsHandshakeCompleted);
        }
    }

    /// Drain loop: (a) pindahkan ciphertext siap-kirim ke outbound queue,
    /// (b) biarkan session memproduksi record dari plaintext internal,
    /// ulang sampai tidak ada kemajuan. Mencegah livelock sekaligus
    /// pekerjaan yang ketinggalan.
    fn pump_tls(&mut self, mux: &mut dyn Multiplexer) {
        loop {
            let mut did_work = false;
            let chunk = match self.tls.as_mut() {
                Some(tls) => tls.take_ciphertext().unwrap_or_default(),
                None => Vec::new(),
            };
            if !chunk.is_empty() {
                let _ = self.send_raw(&chunk, mux);
                did_work = true;
            }
            self.check_handshake_status();
            if !did_work {
                break;
            }
        }
    }

    /// Sertifikat peer tertangkap saat handshake: pancarkan
    /// `TlsVerifyPeer` tepat sekali; reject = abort sesi.
    fn maybe_fire_verify(&mut self, mux: &mut dyn Multiplexer) {
        if self.verify_fired {
            return;
        }
        let der = match self.tls.as_mut().and_then(|t| t.take_peer_cert()) {
            Some(d) => d,
            None => return,
        };
        self.verify_fired = true;
        if !self.tls_params.verify_peer {
            return;
        }
        if !self.base.fire(SocketEvent::TlsVerifyPeer(&der)) {
            self.abort_tls_session(mux);
        }
    }

    /// Chunk inbound dari socket: lewat TLS unwrap kalau aktif, lalu
    /// generic/proxy dispatch.
    fn dispatch_inbound_data(&mut self, chunk: &[u8], ctx: &mut ReactorCtx<'_>) {
        if self.tls.is_none() {
            self.dispatch_inbound(chunk, ctx);
            return;
        }

        let put = self
            .tls
            .as_mut()
            .map(|tls| tls.put_ciphertext(chunk))
            .unwrap_or(Ok(()));
        if put.is_err() {
            self.abort_tls_session(ctx.mux);
            return;
        }

        let mut plain = [0u8; TLS_PLAIN_BUFFER];
        loop {
            let n = match self.tls.as_mut() {
                // Satu byte disisakan untuk guard byte, sama seperti
                // jalur non-TLS.
                Some(tls) => tls.get_plaintext(&mut plain[..TLS_PLAIN_BUFFER - 1]),
                None => 0,
            };
            if n == 0 {
                break;
            }
            plain[n] = 0;
            self.check_handshake_status();
            self.dispatch_inbound(&plain[..n], ctx);
        }

        self.check_handshake_status();
        self.pump_tls(ctx.mux);
        self.maybe_fire_verify(ctx.mux);
    }

    // ------------------------------------------------------------------
    // Flush path
    // ------------------------------------------------------------------

    /// Sink proxy yang queue-nya sudah turun <= threshold membangunkan
    /// kembali source yang tadi di-pause. Edge-triggered: hanya kalau
    /// source memang paused.
    fn resume_source_if_drained(&mut self, ctx: &mut ReactorCtx<'_>) {
        let source = match self.base.proxied_from {
            Some(s) => s,
            None => return,
        };
        let threshold = self.base.max_outbound_buf_size;
        if threshold == 0 || self.queue.len_bytes() > threshold {
            return;
        }
        if let Ok(src) = ctx.arena.get_mut(source) {
            if src.is_paused() {
                let _ = src.resume(ctx.mux);
            }
        }
    }

    fn flush_outbound(&mut self, ctx: &mut ReactorCtx<'_>) {
        if self.socket.is_none() {
            // Socket bisa saja sudah ditutup di pass loop yang sama
            // (interleaved read/write). Sekali boleh; dua kali berarti
            // loop mem-busy-spin descriptor mati.
            debug_assert!(!self.write_attempted_after_close);
            self.write_attempted_after_close = true;
            return;
        }
        self.base.last_activity = ctx.mux.loop_time_us();

        if self.queue.is_empty() {
            // Writable palsu (kernel buffer berubah antara poll dan
            // sekarang). Bukan error; cukup re-arm interest.
            self.update_events(ctx.mux);
            return;
        }

        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_GATHER_PAGES);
        let nbytes = self.queue.gather(&mut slices);
        debug_assert!(nbytes > 0);

        let result = match self.socket.as_mut() {
            Some(sock) => sock.write_vectored(&slices),
            None => return,
        };
        drop(slices);

        match result {
            Ok(written) => {
                self.queue.advance(written);
                self.resume_source_if_drained(ctx);
                self.update_events(ctx.mux);
            }
            Err(ref e) if transient(e) => {
                // Kernel kehabisan output buffer antara select dan write.
                // Bukan error; sisanya menunggu wake berikutnya.
                self.update_events(ctx.mux);
            }
            Err(e) => {
                self.base.unbind_reason = reason_code(&e);
                self.update_events(ctx.mux);
                self.close(ctx.mux);
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket options
    // ------------------------------------------------------------------

    /// Poll SO_ERROR tanpa efek samping lain: 0 = sehat, errno kalau ada
    /// error pending, -1 kalau handle sudah invalid.
    pub fn report_error_status(&mut self) -> i32 {
        match self.socket.as_mut() {
            None => -1,
            Some(sock) => match sock.take_socket_error() {
                Ok(None) => 0,
                Ok(Some(e)) => e.raw_os_error().unwrap_or(-1),
                Err(_) => -1,
            },
        }
    }

    /// Nyalakan TCP keepalive dengan parameter opsional (None = default
    /// sistem).
    pub fn enable_keepalive(
        &mut self,
        idle: Option<Duration>,
        interval: Option<Duration>,
        count: Option<u32>,
    ) -> Result<(), Fault> {
        let fd = match self.socket.as_ref() {
            Some(s) => s.raw_fd(),
            None => return Err(Fault::Io(io::ErrorKind::NotConnected.into())),
        };
        // SAFETY: fd milik socket yang masih hidup di atas; SockRef
        // tidak mengambil alih kepemilikan.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let sock = SockRef::from(&borrowed);
        sock.set_keepalive(true).map_err(Fault::Io)?;

        let mut ka = TcpKeepalive::new();
        if let Some(d) = idle {
            ka = ka.with_time(d);
        }
        if let Some(d) = interval {
            ka = ka.with_interval(d);
        }
        if let Some(c) = count {
            ka = ka.with_retries(c);
        }
        sock.set_tcp_keepalive(&ka).map_err(Fault::Io)?;
        Ok(())
    }

    pub fn disable_keepalive(&mut self) -> Result<(), Fault> {
        let fd = match self.socket.as_ref() {
            Some(s) => s.raw_fd(),
            None => return Err(Fault::Io(io::ErrorKind::NotConnected.into())),
        };
        // SAFETY: lihat enable_keepalive.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        SockRef::from(&borrowed)
            .set_keepalive(false)
            .map_err(Fault::Io)?;
        Ok(())
    }
}

impl<S: StreamTransport> Eventable for StreamConnection<S> {
    fn base(&self) -> &DescriptorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DescriptorBase {
        &mut self.base
    }

    fn handle_valid(&self) -> bool {
        self.socket.is_some()
    }

    fn outbound_data_size(&self) -> usize {
        self.queue.len_bytes()
    }

    fn connect_pending(&self) -> bool {
        self.connect_pending
    }

    fn desired_interest(&self) -> Option<Interest> {
        self.compute_interest()
    }

    fn register_with(&mut self, mux: &mut dyn Multiplexer) -> io::Result<()> {
        let interest = self.compute_interest();
        let binding = self.base.binding();
        if let Some(sock) = self.socket.as_mut() {
            mux.add(sock, binding, interest)?;
        }
        self.last_interest = interest;
        Ok(())
    }

    /// Baca dan dispatch data pada socket yang select readable.
    ///
    /// Data bisa saja datang pada socket yang sudah dijadwalkan close;
    /// itu urusan protocol handler di atas (biasanya diabaikan).
    fn read(&mut self, ctx: &mut ReactorCtx<'_>) {
        if self.socket.is_none() {
            debug_assert!(!self.read_attempted_after_close);
            self.read_attempted_after_close = true;
            return;
        }

        if self.base.watch_only {
            if self.notify_readable {
                self.base.fire(SocketEvent::NotifyReadable);
            }
            return;
        }

        self.base.last_activity = ctx.mux.loop_time_us();

        let mut total_bytes_read = 0usize;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        for _ in 0..READ_BURST {
            // Jangan baca cuma satu buffer lalu pergi - lebih cepat kalau
            // inbound banyak. Tapi jangan juga tanpa batas; descriptor
            // lain butuh giliran. Kita baca satu byte kurang dari
            // kapasitas untuk guard byte di belakang chunk.
            let r = match self.socket.as_mut() {
                Some(sock) => sock.read(&mut buf[..READ_BUFFER_SIZE - 1]),
                None => break,
            };

            match r {
                Ok(0) => break,
                Ok(n) => {
                    total_bytes_read += n;
                    // Guard byte di belakang chunk yang kita dispatch.
                    // JANGAN DIUBAH: konsumen boleh bergantung pada ini,
                    // dan ini pagar terakhir terhadap overflow.
                    buf[n] = 0;
                    self.dispatch_inbound_data(&buf[..n], ctx);
                    if self.base.paused {
                        break;
                    }
                }
                Err(ref e) if transient(e) => break,
                Err(e) => {
                    // ECONNRESET, ENOTCONN, dkk: rekam reason, langsung
                    // lepas handle (bukan sekadar jadwal).
                    self.base.unbind_reason = reason_code(&e);
                    self.close(ctx.mux);
                    break;
                }
            }
        }

        if total_bytes_read == 0 && !self.base.watch_only {
            // Readable tapi nol byte = peer menutup dengan rapi.
            let _ = self.schedule_close(false, ctx.mux);
        }
    }

    /// Socket pending-connect select writable saat disposisi connect
    /// ketahuan; cek error dulu, baru promosi keluar dari pending.
    fn write(&mut self, ctx: &mut ReactorCtx<'_>) {
        if self.connect_pending {
            let status = match self.socket.as_mut() {
                Some(sock) => sock.take_socket_error(),
                None => return,
            };
            match status {
                Ok(None) => {
                    self.base.fire(SocketEvent::ConnectionCompleted);
                    self.connect_pending = false;
                    self.reschedule_heartbeat(ctx.mux);
                    self.update_events(ctx.mux);
                }
                Ok(Some(e)) => {
                    self.base.unbind_reason = reason_code(&e);
                    let _ = self.schedule_close(false, ctx.mux);
                }
                Err(e) => {
                    self.base.unbind_reason = reason_code(&e);
                    let _ = self.schedule_close(false, ctx.mux);
                }
            }
            return;
        }

        if self.notify_writable {
            self.base.fire(SocketEvent::NotifyWritable);
            self.update_events(ctx.mux);
            return;
        }

        debug_assert!(!self.base.watch_only);
        self.flush_outbound(ctx);
    }

    /// EPOLLERR/EPOLLHUP. Watch-only descriptor tidak bisa ditutup oleh
    /// core; readiness-nya disintesis sendiri karena poller lain
    /// biasanya melaporkan kondisi ini sebagai readable+writable.
    fn handle_error(&mut self, ctx: &mut ReactorCtx<'_>) {
        if self.base.watch_only {
            // EPOLLHUP|EPOLLIN memanggil read() duluan; kalau socket
            // sudah dilepas di sana, tidak ada yang perlu dilakukan.
            if self.socket.is_none() {
                return;
            }
            if self.notify_readable {
                self.read(ctx);
            }
            if self.notify_writable {
                self.write(ctx);
            }
        } else {
            let _ = self.schedule_close(false, ctx.mux);
        }
    }

    /// TLS bisa menggeser pembukuan last-activity ratusan microseconds;
    /// timer-quantum dipakai sebagai kompensasi skew supaya perbandingan
    /// yang hampir sama tetap kena.
    fn heartbeat(&mut self, ctx: &mut ReactorCtx<'_>) {
        let skew = ctx.mux.timer_quantum_us();
        let now = ctx.mux.loop_time_us();

        if self.connect_pending {
            if now.saturating_sub(self.base.created_at) >= self.base.pending_connect_timeout {
                self.base.unbind_reason = libc::ETIMEDOUT;
                let _ = self.schedule_close(false, ctx.mux);
            }
        } else if self.base.inactivity_timeout != 0
            && skew + now.saturating_sub(self.base.last_activity) >= self.base.inactivity_timeout
        {
            self.base.unbind_reason = libc::ETIMEDOUT;
            let _ = self.schedule_close(false, ctx.mux);
        }
    }

    fn send_outbound(
        &mut self,
        data: &[u8],
        mux: &mut dyn Multiplexer,
    ) -> Result<SendOutcome, Fault> {
        if self.base.watch_only {
            return Err(Fault::WatchOnly);
        }
        // Backpressure dicek SEBELUM queueing: sink yang akan melewati
        // threshold minta source upstream-nya di-pause.
        let pause_source = self.base.proxied_from.is_some()
            && self.base.max_outbound_buf_size > 0
            && self.queue.len_bytes() + data.len() > self.base.max_outbound_buf_size;

        let accepted = if self.tls.is_some() {
            self.send_tls(data, mux)?
        } else {
            self.send_raw(data, mux)?
        };
        Ok(SendOutcome {
            accepted,
            pause_source,
        })
    }

    fn pause(&mut self, mux: &mut dyn Multiplexer) -> Result<bool, Fault> {
        if self.base.watch_only {
            return Err(Fault::WatchOnly);
        }
        let old = self.base.paused;
        self.base.paused = true;
        self.update_events(mux);
        Ok(!old)
    }

    fn resume(&mut self, mux: &mut dyn Multiplexer) -> Result<bool, Fault> {
        if self.base.watch_only {
            return Err(Fault::WatchOnly);
        }
        let old = self.base.paused;
        self.base.paused = false;
        self.update_events(mux);
        Ok(old)
    }

    fn is_paused(&self) -> bool {
        self.base.paused
    }

    /// Deregister SEBELUM fd dilepas; fd 0/1/2 dan attached fd hanya
    /// diserahkan balik, tidak pernah ditutup.
    fn close(&mut self, mux: &mut dyn Multiplexer) {
        if let Some(mut sock) = self.socket.take() {
            let _ = mux.deregister(&mut sock);
            let fd = sock.raw_fd();
            if self.base.attached || fd <= libc::STDERR_FILENO {
                sock.surrender();
            } else {
                let _ = sock.shutdown_write();
                drop(sock);
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
