//! Arena descriptor dengan generation-checked keys.
//!
//! Prinsip desain:
//! - Opaque handle: embedding hanya pegang `Binding` (index + generation),
//!   tidak pernah pointer. Binding basi fail-closed jadi `Fault::NotFound`,
//!   bukan akses ke state yang sudah dilepas.
//! - Slot stealing: selama dispatch, descriptor diambil keluar dari
//!   slot-nya supaya dia bisa menyentuh descriptor LAIN (proxy sink,
//!   paired source) lewat `ReactorCtx` tanpa aliasing.
//! - Teardown satu pintu: `unbind` adalah satu-satunya jalan descriptor
//!   keluar dari arena, dengan urutan yang dijamin (callback dulu, proxy
//!   unwind, baru OS handle dilepas).

use crate::core::descriptor::Eventable;
use crate::core::reactor::{Micros, Multiplexer, ReactorCtx, SocketEvent};
use crate::error::Fault;

/// Opaque key untuk satu descriptor di arena.
///
/// Generation naik setiap slot dipakai ulang; lookup dengan generation
/// lama gagal tertutup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binding {
    index: u32,
    generation: u32,
}

impl Binding {
    /// Placeholder sebelum descriptor masuk arena.
    pub(crate) fn unbound() -> Self {
        Self {
            index: u32::MAX,
            generation: 0,
        }
    }

    /// Index slot; cocok dipakai sebagai nilai `mio::Token` oleh embedding.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ed-{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    /// `None` berarti slot kosong ATAU descriptor-nya sedang dipinjam
    /// oleh dispatch (slot stealing) - dua-duanya fail-closed.
    entry: Option<Box<dyn Eventable>>,
    /// Slot hidup (binding valid) meskipun entry sedang dipinjam.
    live: bool,
}

/// Kumpulan homogen semua descriptor yang dipegang poll loop.
#[derive(Default)]
pub struct DescriptorArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl DescriptorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jumlah descriptor hidup.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Masukkan descriptor baru; binding di-assign di sini.
    pub fn insert(&mut self, mut desc: Box<dyn Eventable>) -> Binding {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                    live: false,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let binding = Binding {
            index,
            generation: slot.generation,
        };
        desc.base_mut().bind(binding);
        slot.entry = Some(desc);
        slot.live = true;
        self.len += 1;
        binding
    }

    fn slot(&self, binding: Binding) -> Result<&Slot, Fault> {
        let slot = self
            .slots
            .get(binding.index())
            .ok_or(Fault::NotFound)?;
        if !slot.live || slot.generation != binding.generation {
            return Err(Fault::NotFound);
        }
        Ok(slot)
    }

    /// Lookup; gagal tertutup untuk binding basi atau slot yang sedang
    /// dipinjam dispatch.
    pub fn get_mut(&mut self, binding: Binding) -> Result<&mut dyn Eventable, Fault> {
        self.slot(binding)?;
        self.slots[binding.index()]
            .entry
            .as_deref_mut()
            .ok_or(Fault::NotFound)
    }

    /// Downcast lookup untuk API kind-specific (konfigurasi TLS, send_to,
    /// notify flags, dll).
    pub fn get_as<T: Eventable>(&mut self, binding: Binding) -> Result<&mut T, Fault> {
        self.get_mut(binding)?
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(Fault::NotFound)
    }

    /// Dua descriptor sekaligus (proxy attach). Index harus beda.
    fn get2_mut(
        &mut self,
        a: Binding,
        b: Binding,
    ) -> Result<(&mut dyn Eventable, &mut dyn Eventable), Fault> {
        if a.index() == b.index() {
            return Err(Fault::NotFound);
        }
        self.slot(a)?;
        self.slot(b)?;
        let (lo, hi) = if a.index() < b.index() { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi.index());
        let lo_entry = left[lo.index()].entry.as_deref_mut().ok_or(Fault::NotFound)?;
        let hi_entry = right[0].entry.as_deref_mut().ok_or(Fault::NotFound)?;
        if a.index() < b.index() {
            Ok((lo_entry, hi_entry))
        } else {
            Ok((hi_entry, lo_entry))
        }
    }

    fn take(&mut self, binding: Binding) -> Result<Box<dyn Eventable>, Fault> {
        self.slot(binding)?;
        self.slots[binding.index()]
            .entry
            .take()
            .ok_or(Fault::NotFound)
    }

    fn restore(&mut self, binding: Binding, desc: Box<dyn Eventable>) {
        let slot = &mut self.slots[binding.index()];
        debug_assert!(slot.live && slot.entry.is_none());
        slot.entry = Some(desc);
    }

    fn with_taken(
        &mut self,
        binding: Binding,
        mux: &mut dyn Multiplexer,
        f: impl FnOnce(&mut dyn Eventable, &mut ReactorCtx<'_>),
    ) -> Result<(), Fault> {
        let mut desc = self.take(binding)?;
        let mut ctx = ReactorCtx { mux, arena: self };
        f(&mut *desc, &mut ctx);
        self.restore(binding, desc);
        Ok(())
    }

    /// Registrasi awal ke poll set + penjadwalan heartbeat pertama.
    /// Dipanggil embedding setelah `insert`.
    pub fn register(&mut self, binding: Binding, mux: &mut dyn Multiplexer) -> Result<(), Fault> {
        let desc = self.get_mut(binding)?;
        desc.register_with(mux).map_err(Fault::Io)?;
        desc.reschedule_heartbeat(mux);
        Ok(())
    }

    /// Dispatch readiness readable dari poll loop.
    pub fn dispatch_read(
        &mut self,
        binding: Binding,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        self.with_taken(binding, mux, |d, ctx| d.read(ctx))
    }

    /// Dispatch readiness writable.
    pub fn dispatch_write(
        &mut self,
        binding: Binding,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        self.with_taken(binding, mux, |d, ctx| d.write(ctx))
    }

    /// Dispatch kondisi error (EPOLLERR/EPOLLHUP).
    pub fn dispatch_error(
        &mut self,
        binding: Binding,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        self.with_taken(binding, mux, |d, ctx| d.handle_error(ctx))
    }

    /// Jalankan heartbeat yang deadline-nya lewat, lalu jadwalkan ulang.
    pub fn dispatch_heartbeat(
        &mut self,
        binding: Binding,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        self.with_taken(binding, mux, |d, ctx| {
            d.heartbeat(ctx);
            d.reschedule_heartbeat(ctx.mux);
        })
    }

    /// Descriptor ini sudah boleh dilepas? Binding basi dianggap "sudah".
    pub fn should_delete(&self, binding: Binding) -> bool {
        match self.slot(binding) {
            Ok(slot) => match slot.entry.as_deref() {
                Some(d) => d.should_delete(),
                None => false,
            },
            Err(_) => true,
        }
    }

    /// Semua binding hidup (untuk sweep loop embedding).
    pub fn bindings(&self) -> Vec<Binding> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, s)| Binding {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Lepas descriptor secara permanen. Urutan destructor dijaga:
    /// 1. hapus registrasi heartbeat
    /// 2. pancarkan unbind callback dengan reason code (kecuali suppressed)
    /// 3. kalau ada proxy source yang menunjuk kita: beritahu
    ///    (`ProxyTargetUnbound`) dan putuskan proxy-nya
    /// 4. turunkan pending-close counter (kalau close memang terjadwal)
    /// 5. putuskan proxy milik kita sendiri (detach sink)
    /// 6. deregister dari poll set, baru lepas OS handle
    pub fn unbind(&mut self, binding: Binding, mux: &mut dyn Multiplexer) -> Result<(), Fault> {
        let mut desc = self.take(binding)?;
        // Slot mati sekarang supaya callback tidak bisa resolve binding ini.
        {
            let slot = &mut self.slots[binding.index()];
            slot.live = false;
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.free.push(binding.index);
        self.len -= 1;

        let next_heartbeat = desc.base().next_heartbeat;
        if next_heartbeat != 0 {
            mux.clear_heartbeat(next_heartbeat, binding);
        }

        if !desc.base().suppress_unbind {
            let reason = desc.base().unbind_reason;
            desc.base_mut().fire(SocketEvent::ConnectionUnbound(reason));
        }

        if let Some(source) = desc.base().proxied_from {
            if let Ok(src) = self.get_mut(source) {
                src.base_mut().fire(SocketEvent::ProxyTargetUnbound);
                src.base_mut().proxy_target = None;
            }
        }

        if desc.base().close_counted {
            mux.note_close_finished();
        }

        desc.stop_proxy(self);
        desc.close(mux);
        log::trace!("unbound {}", binding);
        Ok(())
    }

    /// Pasang relasi proxy: `source` mem-forward inbound bytes ke
    /// `target`, maksimum `byte_limit` bytes (0 = unlimited), dengan
    /// `buffer_threshold` sebagai batas backpressure di sisi sink.
    ///
    /// Target yang sudah punya source aktif adalah fault.
    pub fn start_proxy(
        &mut self,
        source: Binding,
        target: Binding,
        buffer_threshold: usize,
        byte_limit: u64,
    ) -> Result<(), Fault> {
        // Relasi lama source dilepas dulu, baru target baru dipasang.
        let old = self.get_mut(source)?.base_mut().proxy_target.take();
        if let Some(old) = old {
            if let Ok(old_sink) = self.get_mut(old) {
                old_sink.base_mut().proxied_from = None;
                old_sink.base_mut().max_outbound_buf_size = 0;
            }
        }
        let (src, sink) = self.get2_mut(source, target)?;
        if sink.base().proxied_from.is_some() {
            return Err(Fault::ProxyTargetBusy);
        }
        src.base_mut().proxy_target = Some(target);
        src.base_mut().bytes_to_proxy = byte_limit;
        src.base_mut().proxied_bytes = 0;
        sink.base_mut().proxied_from = Some(source);
        sink.base_mut().max_outbound_buf_size = buffer_threshold;
        Ok(())
    }

    /// Putuskan relasi proxy dari sisi source.
    pub fn stop_proxy(&mut self, source: Binding) -> Result<bool, Fault> {
        let mut desc = self.take(source)?;
        let stopped = desc.stop_proxy(self);
        self.restore(source, desc);
        Ok(stopped)
    }

    /// Queue data outbound lewat binding. Kalau descriptor adalah sink
    /// proxy dan threshold terlampaui, source upstream-nya di-pause di
    /// sini juga.
    pub fn send(
        &mut self,
        binding: Binding,
        data: &[u8],
        mux: &mut dyn Multiplexer,
    ) -> Result<usize, Fault> {
        let (outcome, source) = {
            let desc = self.get_mut(binding)?;
            let outcome = desc.send_outbound(data, mux)?;
            (outcome, desc.base().proxied_from)
        };
        if outcome.pause_source {
            if let Some(source) = source {
                if let Ok(src) = self.get_mut(source) {
                    let _ = src.pause(mux);
                }
            }
        }
        Ok(outcome.accepted)
    }

    /// Jadwalkan close lewat binding.
    pub fn schedule_close(
        &mut self,
        binding: Binding,
        after_writing: bool,
        mux: &mut dyn Multiplexer,
    ) -> Result<(), Fault> {
        self.get_mut(binding)?.schedule_close(after_writing, mux)
    }

    /// Deadline heartbeat descriptor (0 = tidak terdaftar).
    pub fn next_heartbeat(&self, binding: Binding) -> Micros {
        match self.slot(binding) {
            Ok(slot) => slot
                .entry
                .as_deref()
                .map(|d| d.base().next_heartbeat)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}
