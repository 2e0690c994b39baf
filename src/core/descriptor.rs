//! Descriptor base: lifecycle, close-state machine, proxy link, dispatch.
//!
//! Ada tiga jalan menutup descriptor, semuanya berujung pada poll loop
//! melihat `should_delete() == true` lalu memanggil `Arena::unbind`:
//! - Force close: error fatal. Handle langsung dilepas, object masuk
//!   error state.
//! - `schedule_close(false)`: immediate. Menghambat penulisan data baru.
//! - `schedule_close(true)`: after-writing. Menghambat data baru dan
//!   otomatis naik jadi immediate begitu outbound queue kosong.
//!
//! Close state monotonic: after-writing boleh naik jadi immediate,
//! tidak pernah turun balik.

use std::any::Any;

use mio::Interest;

use crate::core::arena::Binding;
use crate::core::reactor::{Callback, Micros, Multiplexer, ReactorCtx, SocketEvent};
use crate::error::Fault;

/// Default pending-connect timeout: 20 detik (microseconds).
pub const DEFAULT_PENDING_CONNECT_TIMEOUT: Micros = 20_000_000;

/// Hasil `send_outbound` di jalur proxy forwarding.
#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    /// Bytes plaintext caller yang diterima (all-or-nothing).
    pub accepted: usize,
    /// Sink minta source upstream-nya di-pause (threshold terlampaui).
    pub pause_source: bool,
}

impl SendOutcome {
    pub fn accepted(n: usize) -> Self {
        Self {
            accepted: n,
            pause_source: false,
        }
    }
}

/// State yang dimiliki semua kind descriptor.
pub struct DescriptorBase {
    binding: Binding,
    /// Loop time saat dibuat; dipakai pending-connect timeout.
    pub(crate) created_at: Micros,
    /// Loop time aktivitas I/O terakhir; dipakai inactivity timeout.
    pub(crate) last_activity: Micros,
    pub(crate) close_now: bool,
    pub(crate) close_after_writing: bool,
    /// Sudah pernah dihitung di pending-close counter milik Multiplexer.
    pub(crate) close_counted: bool,
    pub(crate) callback: Option<Callback>,
    /// Unbind event tidak dipancarkan untuk kind internal
    /// (wakeup/file-watch).
    pub(crate) suppress_unbind: bool,
    /// Raw OS errno yang menyertai unbind (0 = clean).
    pub(crate) unbind_reason: i32,
    /// 0 = disabled.
    pub(crate) inactivity_timeout: Micros,
    pub(crate) pending_connect_timeout: Micros,
    /// Deadline heartbeat yang sedang terdaftar (wall clock, 0 = none).
    pub(crate) next_heartbeat: Micros,
    /// Downstream: descriptor yang menerima byte forwarding dari kita.
    pub(crate) proxy_target: Option<Binding>,
    /// Upstream: descriptor yang mem-forward ke kita (kita = sink).
    pub(crate) proxied_from: Option<Binding>,
    /// Sisa byte limit proxy; 0 = unlimited.
    pub(crate) bytes_to_proxy: u64,
    pub(crate) proxied_bytes: u64,
    /// Sink-side backpressure threshold (bytes); 0 = disabled.
    pub(crate) max_outbound_buf_size: usize,
    /// Handle bukan milik kita - jangan pernah dilepas ke OS.
    pub(crate) attached: bool,
    pub(crate) watch_only: bool,
    pub(crate) paused: bool,
}

impl DescriptorBase {
    pub fn new(loop_time: Micros) -> Self {
        Self {
            binding: Binding::unbound(),
            created_at: loop_time,
            last_activity: loop_time,
            close_now: false,
            close_after_writing: false,
            close_counted: false,
            callback: None,
            suppress_unbind: false,
            unbind_reason: 0,
            inactivity_timeout: 0,
            pending_connect_timeout: DEFAULT_PENDING_CONNECT_TIMEOUT,
            next_heartbeat: 0,
            proxy_target: None,
            proxied_from: None,
            bytes_to_proxy: 0,
            proxied_bytes: 0,
            max_outbound_buf_size: 0,
            attached: false,
            watch_only: false,
            paused: false,
        }
    }

    /// Identitas di arena. Di-assign saat insert.
    #[inline(always)]
    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub(crate) fn bind(&mut self, binding: Binding) {
        self.binding = binding;
    }

    pub fn set_callback(&mut self, cb: Callback) {
        self.callback = Some(cb);
    }

    /// Pancarkan event ke callback. Return value callback diteruskan
    /// (hanya berarti untuk `TlsVerifyPeer`).
    pub(crate) fn fire(&mut self, event: SocketEvent<'_>) -> bool {
        let binding = self.binding;
        match self.callback.as_mut() {
            Some(cb) => cb(binding, event),
            None => true,
        }
    }

    #[inline(always)]
    pub fn is_close_scheduled(&self) -> bool {
        self.close_now || self.close_after_writing
    }

    #[inline(always)]
    pub fn unbind_reason(&self) -> i32 {
        self.unbind_reason
    }

    #[inline(always)]
    pub fn proxied_bytes(&self) -> u64 {
        self.proxied_bytes
    }

    /// Inactivity timeout, API dalam milliseconds (internal microseconds).
    pub fn inactivity_timeout_ms(&self) -> u64 {
        self.inactivity_timeout / 1000
    }

    pub fn pending_connect_timeout_ms(&self) -> u64 {
        self.pending_connect_timeout / 1000
    }
}

/// Interface tertutup yang dipegang poll loop untuk semua kind:
/// stream, listener, datagram, wakeup, file-watch.
///
/// Method provided di sini adalah logika yang di semua kind identik;
/// kind-specific behavior masuk lewat method required.
pub trait Eventable: Any {
    fn base(&self) -> &DescriptorBase;
    fn base_mut(&mut self) -> &mut DescriptorBase;

    /// Socket readable (atau, untuk kind internal, ada kejadian).
    fn read(&mut self, ctx: &mut ReactorCtx<'_>);

    /// Socket writable.
    fn write(&mut self, ctx: &mut ReactorCtx<'_>);

    /// EPOLLERR/EPOLLHUP. Default: jadwalkan immediate close.
    fn handle_error(&mut self, ctx: &mut ReactorCtx<'_>) {
        let _ = self.schedule_close(false, ctx.mux);
    }

    /// Cek timeout periodik. Default no-op (listener, kind internal).
    fn heartbeat(&mut self, _ctx: &mut ReactorCtx<'_>) {}

    /// OS handle masih hidup?
    fn handle_valid(&self) -> bool;

    /// Total byte outbound yang masih antri.
    fn outbound_data_size(&self) -> usize {
        0
    }

    /// Sedang menunggu hasil non-blocking connect?
    fn connect_pending(&self) -> bool {
        false
    }

    /// Interest yang diinginkan sekarang (read?, write?). `None` berarti
    /// tidak mau event apa pun. Semua perubahan state readiness lewat
    /// satu titik ini supaya registrasi OS-specific tinggal satu call.
    fn desired_interest(&self) -> Option<Interest>;

    /// Registrasi awal ke poll set sesuai `desired_interest`.
    fn register_with(&mut self, mux: &mut dyn Multiplexer) -> std::io::Result<()>;

    /// Deregister lalu lepaskan OS handle. Idempotent. Fd 0/1/2 dan
    /// attached fd tidak pernah ditutup, hanya diserahkan kembali.
    fn close(&mut self, mux: &mut dyn Multiplexer);

    /// Queue data outbound (jalur proxy forwarding dan `Arena::send`).
    fn send_outbound(
        &mut self,
        _data: &[u8],
        _mux: &mut dyn Multiplexer,
    ) -> Result<SendOutcome, Fault> {
        Err(Fault::BadCodePath("descriptor kind cannot send"))
    }

    /// Stop polling readable + dispatch. Hanya stream yang meng-override;
    /// untuk kind lain pause dari backpressure adalah no-op.
    fn pause(&mut self, _mux: &mut dyn Multiplexer) -> Result<bool, Fault> {
        Ok(false)
    }

    fn resume(&mut self, _mux: &mut dyn Multiplexer) -> Result<bool, Fault> {
        Ok(false)
    }

    fn is_paused(&self) -> bool {
        self.base().paused
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Manager pakai ini untuk tahu kapan object dilepas dari scheduling.
    /// True jika handle sudah invalid, immediate close terjadwal, atau
    /// after-writing terjadwal DAN outbound queue kosong.
    fn should_delete(&self) -> bool {
        !self.handle_valid()
            || self.base().close_now
            || (self.base().close_after_writing && self.outbound_data_size() == 0)
    }

    /// Jadwalkan close. Advisory dan monotonic: kalau sudah terjadwal
    /// after-writing, panggilan immediate meng-eskalasi; tidak ada jalan
    /// balik. Counter pending-close di Multiplexer hanya naik sekali.
    fn schedule_close(
        &mut self,
        after_writing: bool,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        if self.base().watch_only {
            return Err(Fault::WatchOnly);
        }
        {
            let base = self.base_mut();
            if base.close_now || base.close_after_writing {
                if !after_writing {
                    // Close jadi lebih urgent: upgrade ke NOW.
                    base.close_now = true;
                }
                return Ok(());
            }
            if after_writing {
                base.close_after_writing = true;
            } else {
                base.close_now = true;
            }
            base.close_counted = true;
        }
        mux.note_close_scheduled();
        Ok(())
    }

    /// Inbound dispatch generik: route ke proxy target kalau ada,
    /// selain itu ke callback sebagai `ConnectionRead`.
    ///
    /// Byte limit proxy dihormati eksak: begitu limit tercapai relasi
    /// dilepas, `ProxyCompleted` dipancarkan, dan sisa chunk yang sama
    /// di-dispatch ulang sebagai inbound biasa - tidak di-drop, tidak
    /// diduplikasi.
    fn dispatch_inbound(&mut self, chunk: &[u8], ctx: &mut ReactorCtx<'_>) {
        let target = match self.base().proxy_target {
            Some(t) => t,
            None => {
                self.base_mut().fire(SocketEvent::ConnectionRead(chunk));
                return;
            }
        };

        let limit = self.base().bytes_to_proxy;
        let forward_len = if limit > 0 {
            (limit as usize).min(chunk.len())
        } else {
            chunk.len()
        };

        let outcome = match ctx.arena.get_mut(target) {
            Ok(sink) => sink.send_outbound(&chunk[..forward_len], ctx.mux),
            Err(_) => {
                // Sink sudah hilang dari arena (binding basi). Lepaskan
                // relasi dan perlakukan chunk sebagai inbound biasa.
                self.base_mut().proxy_target = None;
                self.base_mut().max_outbound_buf_size = 0;
                self.base_mut().fire(SocketEvent::ConnectionRead(chunk));
                return;
            }
        };
        if let Ok(out) = outcome {
            if out.pause_source {
                let _ = self.pause(ctx.mux);
            }
        }

        {
            let base = self.base_mut();
            base.proxied_bytes += forward_len as u64;
            if limit > 0 {
                base.bytes_to_proxy -= forward_len as u64;
            }
        }

        if limit > 0 && self.base().bytes_to_proxy == 0 {
            self.stop_proxy(ctx.arena);
            self.base_mut().fire(SocketEvent::ProxyCompleted);
            if forward_len < chunk.len() {
                self.base_mut()
                    .fire(SocketEvent::ConnectionRead(&chunk[forward_len..]));
            }
        }
    }

    /// Lepas relasi proxy dari sisi source. Return true kalau memang
    /// ada relasi yang dilepas.
    fn stop_proxy(&mut self, arena: &mut crate::core::arena::DescriptorArena) -> bool {
        let target = match self.base_mut().proxy_target.take() {
            Some(t) => t,
            None => return false,
        };
        if let Ok(sink) = arena.get_mut(target) {
            sink.base_mut().proxied_from = None;
            sink.base_mut().max_outbound_buf_size = 0;
        }
        true
    }

    /// Hitung ulang dan daftarkan deadline heartbeat berikutnya:
    /// min(sisa pending-connect, sisa inactivity); 0 = tidak ada deadline.
    fn reschedule_heartbeat(&mut self, mux: &mut dyn Multiplexer) {
        let binding = self.base().binding();
        let old = self.base().next_heartbeat;
        if old != 0 {
            mux.clear_heartbeat(old, binding);
        }
        self.base_mut().next_heartbeat = 0;

        if self.should_delete() {
            return;
        }

        let mut time_til_next = self.base().inactivity_timeout;
        if self.connect_pending() {
            let pct = self.base().pending_connect_timeout;
            if time_til_next == 0 || pct < time_til_next {
                time_til_next = pct;
            }
        }
        if time_til_next == 0 {
            return;
        }

        let deadline = time_til_next + mux.real_time_us();
        self.base_mut().next_heartbeat = deadline;
        mux.queue_heartbeat(binding, deadline);
    }

    /// Set inactivity timeout (ms; 0 = disable) dan jadwalkan ulang
    /// heartbeat.
    fn set_inactivity_timeout_ms(&mut self, value: u64, mux: &mut dyn Multiplexer) {
        self.base_mut().inactivity_timeout = value * 1000;
        self.reschedule_heartbeat(mux);
    }

    /// Set pending-connect timeout (ms). Nilai 0 diabaikan.
    fn set_pending_connect_timeout_ms(&mut self, value: u64, mux: &mut dyn Multiplexer) -> bool {
        if value == 0 {
            return false;
        }
        self.base_mut().pending_connect_timeout = value * 1000;
        self.reschedule_heartbeat(mux);
        true
    }
}
