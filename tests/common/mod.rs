//! Perkakas bersama untuk integration test: multiplexer perekam,
//! transport simulasi, dan perekam event callback.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use mio::event::Source;
use mio::{Interest, Registry, Token};

use argus::{
    Binding, DatagramTransport, Eventable, ListenerTransport, Micros, Multiplexer, SocketEvent,
    StreamTransport,
};

// ----------------------------------------------------------------------
// RecordingMux
// ----------------------------------------------------------------------

/// Multiplexer untuk test: jam bisa diatur, semua panggilan direkam.
pub struct RecordingMux {
    pub loop_time: Micros,
    pub real_time: Micros,
    pub quantum: Micros,
    pub heartbeats: BTreeSet<(Micros, Binding)>,
    pub adds: Vec<(Binding, Option<Interest>)>,
    pub modifies: Vec<(Binding, Option<Interest>)>,
    pub deregisters: usize,
    pub closes_scheduled: usize,
    pub closes_finished: usize,
    pub wakeups: usize,
    pub watch_events: usize,
}

impl RecordingMux {
    pub fn new() -> Self {
        Self {
            loop_time: 0,
            real_time: 0,
            quantum: 0,
            heartbeats: BTreeSet::new(),
            adds: Vec::new(),
            modifies: Vec::new(),
            deregisters: 0,
            closes_scheduled: 0,
            closes_finished: 0,
            wakeups: 0,
            watch_events: 0,
        }
    }

    /// Majukan kedua jam sekaligus (mikrodetik).
    pub fn advance(&mut self, us: Micros) {
        self.loop_time += us;
        self.real_time += us;
    }

    /// Deadline heartbeat yang sudah lewat, diurutkan.
    pub fn due_heartbeats(&mut self) -> Vec<Binding> {
        let now = self.real_time;
        let due: Vec<(Micros, Binding)> = self
            .heartbeats
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .copied()
            .collect();
        for entry in &due {
            self.heartbeats.remove(entry);
        }
        due.into_iter().map(|(_, b)| b).collect()
    }
}

impl Multiplexer for RecordingMux {
    fn add(
        &mut self,
        _source: &mut dyn Source,
        binding: Binding,
        interest: Option<Interest>,
    ) -> io::Result<()> {
        self.adds.push((binding, interest));
        Ok(())
    }

    fn modify(
        &mut self,
        _source: &mut dyn Source,
        binding: Binding,
        interest: Option<Interest>,
    ) -> io::Result<()> {
        self.modifies.push((binding, interest));
        Ok(())
    }

    fn deregister(&mut self, _source: &mut dyn Source) -> io::Result<()> {
        self.deregisters += 1;
        Ok(())
    }

    fn queue_heartbeat(&mut self, binding: Binding, deadline: Micros) {
        self.heartbeats.insert((deadline, binding));
    }

    fn clear_heartbeat(&mut self, deadline: Micros, binding: Binding) {
        self.heartbeats.remove(&(deadline, binding));
    }

    fn loop_time_us(&self) -> Micros {
        self.loop_time
    }

    fn real_time_us(&self) -> Micros {
        self.real_time
    }

    fn timer_quantum_us(&self) -> Micros {
        self.quantum
    }

    fn note_close_scheduled(&mut self) {
        self.closes_scheduled += 1;
    }

    fn note_close_finished(&mut self) {
        self.closes_finished += 1;
    }

    fn on_wakeup(&mut self) {
        self.wakeups += 1;
    }

    fn on_watch_events(&mut self) {
        self.watch_events += 1;
    }
}

// ----------------------------------------------------------------------
// FakeStream
// ----------------------------------------------------------------------

pub const FAKE_ADDR: &str = "127.0.0.1:19999";

/// Transport stream simulasi: read dari script atau pipe, write dengan
/// cap per call (partial write) dan injeksi error.
pub struct FakeStream {
    pub incoming: Rc<RefCell<VecDeque<u8>>>,
    pub written: Rc<RefCell<Vec<u8>>>,
    /// Piped mode: byte yang ditulis juga masuk incoming milik peer.
    pub peer_incoming: Option<Rc<RefCell<VecDeque<u8>>>>,
    /// Maksimum byte yang diterima per write call; 0 = tanpa batas.
    pub write_cap: usize,
    /// Kalau tidak kosong, read memakai script ini (bukan pipe).
    pub read_script: Rc<RefCell<VecDeque<io::Result<Vec<u8>>>>>,
    pub write_errors: Rc<RefCell<VecDeque<io::Error>>>,
    pub so_error: Rc<RefCell<Option<io::Error>>>,
    pub write_calls: Rc<RefCell<usize>>,
}

impl FakeStream {
    pub fn new() -> Self {
        Self {
            incoming: Rc::new(RefCell::new(VecDeque::new())),
            written: Rc::new(RefCell::new(Vec::new())),
            peer_incoming: None,
            write_cap: 0,
            read_script: Rc::new(RefCell::new(VecDeque::new())),
            write_errors: Rc::new(RefCell::new(VecDeque::new())),
            so_error: Rc::new(RefCell::new(None)),
            write_calls: Rc::new(RefCell::new(0)),
        }
    }

    /// Pasangan stream yang saling terhubung (tulisan A terbaca B).
    pub fn pair() -> (Self, Self) {
        let a_in = Rc::new(RefCell::new(VecDeque::new()));
        let b_in = Rc::new(RefCell::new(VecDeque::new()));
        let mut a = Self::new();
        let mut b = Self::new();
        a.incoming = a_in.clone();
        a.peer_incoming = Some(b_in.clone());
        b.incoming = b_in;
        b.peer_incoming = Some(a_in);
        (a, b)
    }

    pub fn push_read(&self, chunk: &[u8]) {
        self.read_script
            .borrow_mut()
            .push_back(Ok(chunk.to_vec()));
    }

    pub fn push_read_error(&self, errno: i32) {
        self.read_script
            .borrow_mut()
            .push_back(Err(io::Error::from_raw_os_error(errno)));
    }

    fn accept_bytes(&mut self, data: &[u8]) -> usize {
        let n = if self.write_cap > 0 {
            data.len().min(self.write_cap)
        } else {
            data.len()
        };
        self.written.borrow_mut().extend_from_slice(&data[..n]);
        if let Some(peer) = &self.peer_incoming {
            peer.borrow_mut().extend(data[..n].iter().copied());
        }
        n
    }
}

impl Read for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let scripted = self.read_script.borrow_mut().pop_front();
        if let Some(entry) = scripted {
            return match entry {
                Ok(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Err(e) => Err(e),
            };
        }
        let mut incoming = self.incoming.borrow_mut();
        if incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut n = 0;
        while n < buf.len() {
            match incoming.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        *self.write_calls.borrow_mut() += 1;
        if let Some(e) = self.write_errors.borrow_mut().pop_front() {
            return Err(e);
        }
        Ok(self.accept_bytes(buf))
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        *self.write_calls.borrow_mut() += 1;
        if let Some(e) = self.write_errors.borrow_mut().pop_front() {
            return Err(e);
        }
        let mut total = 0;
        let mut budget = if self.write_cap > 0 {
            self.write_cap
        } else {
            usize::MAX
        };
        for slice in bufs {
            if budget == 0 {
                break;
            }
            let take = slice.len().min(budget);
            let n = {
                // accept_bytes menghormati cap per-call; di sini cap
                // dibagi lintas slice, jadi bypass lewat field langsung.
                self.written.borrow_mut().extend_from_slice(&slice[..take]);
                if let Some(peer) = &self.peer_incoming {
                    peer.borrow_mut().extend(slice[..take].iter().copied());
                }
                take
            };
            total += n;
            budget -= n;
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for FakeStream {
    fn register(&mut self, _r: &Registry, _t: Token, _i: Interest) -> io::Result<()> {
        Ok(())
    }
    fn reregister(&mut self, _r: &Registry, _t: Token, _i: Interest) -> io::Result<()> {
        Ok(())
    }
    fn deregister(&mut self, _r: &Registry) -> io::Result<()> {
        Ok(())
    }
}

impl StreamTransport for FakeStream {
    fn take_socket_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(self.so_error.borrow_mut().take())
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(FAKE_ADDR.parse().expect("fake addr"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(FAKE_ADDR.parse().expect("fake addr"))
    }

    fn set_nodelay(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        // Di atas range reserved supaya jalur close biasa yang dites.
        1000
    }

    fn surrender(self) {}
}

// ----------------------------------------------------------------------
// FakeListener
// ----------------------------------------------------------------------

/// Listener simulasi dengan antrian accept yang bisa diisi test.
pub struct FakeListener {
    pub pending: Rc<RefCell<VecDeque<io::Result<FakeStream>>>>,
}

impl FakeListener {
    pub fn new() -> Self {
        Self {
            pending: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn enqueue(&self, conn: FakeStream) {
        self.pending.borrow_mut().push_back(Ok(conn));
    }
}

impl Source for FakeListener {
    fn register(&mut self, _r: &Registry, _t: Token, _i: Interest) -> io::Result<()> {
        Ok(())
    }
    fn reregister(&mut self, _r: &Registry, _t: Token, _i: Interest) -> io::Result<()> {
        Ok(())
    }
    fn deregister(&mut self, _r: &Registry) -> io::Result<()> {
        Ok(())
    }
}

impl ListenerTransport for FakeListener {
    type Conn = FakeStream;

    fn accept_conn(&self) -> io::Result<(FakeStream, SocketAddr)> {
        match self.pending.borrow_mut().pop_front() {
            Some(Ok(conn)) => Ok((conn, FAKE_ADDR.parse().expect("fake addr"))),
            Some(Err(e)) => Err(e),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(FAKE_ADDR.parse().expect("fake addr"))
    }

    fn raw_fd(&self) -> RawFd {
        1001
    }

    fn surrender(self) {}
}

// ----------------------------------------------------------------------
// FakeDatagram
// ----------------------------------------------------------------------

/// Socket datagram simulasi: inbound dari antrian, outbound direkam.
pub struct FakeDatagram {
    pub incoming: Rc<RefCell<VecDeque<(Vec<u8>, SocketAddr)>>>,
    pub sent: Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>,
    pub send_errors: Rc<RefCell<VecDeque<io::Error>>>,
}

impl FakeDatagram {
    pub fn new() -> Self {
        Self {
            incoming: Rc::new(RefCell::new(VecDeque::new())),
            sent: Rc::new(RefCell::new(Vec::new())),
            send_errors: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn push_datagram(&self, payload: &[u8], from: SocketAddr) {
        self.incoming
            .borrow_mut()
            .push_back((payload.to_vec(), from));
    }
}

impl Source for FakeDatagram {
    fn register(&mut self, _r: &Registry, _t: Token, _i: Interest) -> io::Result<()> {
        Ok(())
    }
    fn reregister(&mut self, _r: &Registry, _t: Token, _i: Interest) -> io::Result<()> {
        Ok(())
    }
    fn deregister(&mut self, _r: &Registry) -> io::Result<()> {
        Ok(())
    }
}

impl DatagramTransport for FakeDatagram {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.incoming.borrow_mut().pop_front() {
            Some((payload, from)) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok((n, from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if let Some(e) = self.send_errors.borrow_mut().pop_front() {
            return Err(e);
        }
        self.sent.borrow_mut().push((buf.to_vec(), target));
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(FAKE_ADDR.parse().expect("fake addr"))
    }

    fn set_broadcast(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        1002
    }

    fn surrender(self) {}
}

// ----------------------------------------------------------------------
// Event recorder
// ----------------------------------------------------------------------

/// Versi owned dari `SocketEvent` untuk direkam.
#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    Accepted(Binding),
    Completed,
    Read(Vec<u8>),
    Unbound(i32),
    ProxyTargetUnbound,
    ProxyCompleted,
    TlsHandshakeCompleted,
    TlsVerifyPeer(usize),
    NotifyReadable,
    NotifyWritable,
}

impl Ev {
    pub fn from_event(event: &SocketEvent<'_>) -> Self {
        match event {
            SocketEvent::ConnectionAccepted(b) => Ev::Accepted(*b),
            SocketEvent::ConnectionCompleted => Ev::Completed,
            SocketEvent::ConnectionRead(data) => Ev::Read(data.to_vec()),
            SocketEvent::ConnectionUnbound(r) => Ev::Unbound(*r),
            SocketEvent::ProxyTargetUnbound => Ev::ProxyTargetUnbound,
            SocketEvent::ProxyCompleted => Ev::ProxyCompleted,
            SocketEvent::TlsHandshakeCompleted => Ev::TlsHandshakeCompleted,
            SocketEvent::TlsVerifyPeer(der) => Ev::TlsVerifyPeer(der.len()),
            SocketEvent::NotifyReadable => Ev::NotifyReadable,
            SocketEvent::NotifyWritable => Ev::NotifyWritable,
        }
    }
}

pub type EventLog = Rc<RefCell<Vec<(Binding, Ev)>>>;

/// Pasang callback perekam; return value callback selalu `verdict`
/// (dipakai test TlsVerifyPeer).
pub fn record_events_with(target: &mut dyn Eventable, verdict: bool) -> EventLog {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    target.base_mut().set_callback(Box::new(move |binding, event| {
        sink.borrow_mut().push((binding, Ev::from_event(&event)));
        verdict
    }));
    log
}

pub fn record_events(target: &mut dyn Eventable) -> EventLog {
    record_events_with(target, true)
}

/// Hitung kemunculan satu varian event di log.
pub fn count_events(log: &EventLog, pred: impl Fn(&Ev) -> bool) -> usize {
    log.borrow().iter().filter(|(_, e)| pred(e)).count()
}
