//! Listening socket: accept burst, lahirkan StreamConnection per client.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;

use crate::core::{
    DescriptorBase, Eventable, Multiplexer, ReactorCtx, SocketEvent,
};
use crate::network::stream::{StreamConnection, StreamTransport};

/// Default jumlah accept per wake. Jangan habiskan seluruh antrian
/// kernel dalam satu wake - itu membuka DoS di mana tidak ada data yang
/// pernah dibaca/ditulis - tapi lebih dari satu supaya backlog tidak
/// menumpuk saat connection flood.
const DEFAULT_ACCEPT_BURST: usize = 10;

/// Transport listening yang bisa dikendarai `ListenSocket`.
pub trait ListenerTransport: Source + 'static {
    type Conn: StreamTransport;

    /// Satu accept non-blocking. WouldBlock berarti antrian habis.
    fn accept_conn(&self) -> io::Result<(Self::Conn, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn raw_fd(&self) -> RawFd;
    fn surrender(self);
}

impl ListenerTransport for TcpListener {
    type Conn = TcpStream;

    /// mio memakai accept4: socket hasil accept sudah non-blocking dan
    /// close-on-exec.
    fn accept_conn(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.accept()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn surrender(self) {
        let _ = self.into_raw_fd();
    }
}

/// Bound listening socket. `read()` menerima burst koneksi; setiap
/// client dibungkus StreamConnection server-mode, dimasukkan ke arena,
/// diregistrasi, lalu event `ConnectionAccepted` menyala di callback
/// listener. Stop listener = `Arena::schedule_close` pada binding-nya.
pub struct ListenSocket<L: ListenerTransport = TcpListener> {
    base: DescriptorBase,
    socket: Option<L>,
    accept_burst: usize,
}

impl ListenSocket<TcpListener> {
    /// Bind dan siapkan listener non-blocking.
    pub fn bind(addr: SocketAddr, mux: &dyn Multiplexer) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::from_transport(listener, mux))
    }
}

impl<L: ListenerTransport> ListenSocket<L> {
    pub fn from_transport(listener: L, mux: &dyn Multiplexer) -> Self {
        Self {
            base: DescriptorBase::new(mux.loop_time_us()),
            socket: Some(listener),
            accept_burst: DEFAULT_ACCEPT_BURST,
        }
    }

    /// Atur jumlah maksimum accept per wake.
    pub fn set_accept_burst(&mut self, count: usize) {
        self.accept_burst = count.max(1);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.as_ref() {
            Some(l) => l.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl<L: ListenerTransport> Eventable for ListenSocket<L> {
    fn base(&self) -> &DescriptorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DescriptorBase {
        &mut self.base
    }

    fn handle_valid(&self) -> bool {
        self.socket.is_some()
    }

    fn desired_interest(&self) -> Option<Interest> {
        Some(Interest::READABLE)
    }

    fn register_with(&mut self, mux: &mut dyn Multiplexer) -> io::Result<()> {
        let binding = self.base.binding();
        if let Some(listener) = self.socket.as_mut() {
            mux.add(listener, binding, Some(Interest::READABLE))?;
        }
        Ok(())
    }

    /// Accept sampai `accept_burst` koneksi. Accept yang gagal mengakhiri
    /// burst (antrian dianggap habis - bisa juga peer reset antara select
    /// dan accept, per Stevens UNP; bukan fatal). Setup yang gagal pada
    /// satu socket hanya membuang socket itu.
    fn read(&mut self, ctx: &mut ReactorCtx<'_>) {
        for _ in 0..self.accept_burst {
            let accepted = match self.socket.as_ref() {
                Some(listener) => listener.accept_conn(),
                None => return,
            };
            let (conn, peer) = match accepted {
                Ok(pair) => pair,
                Err(_) => break,
            };

            // Matikan Nagle di socket baru; gagal = buang socket ini saja.
            if conn.set_nodelay(true).is_err() {
                continue;
            }

            let mut stream = StreamConnection::from_transport(conn, &*ctx.mux);
            stream.set_server_mode();
            let binding = ctx.arena.insert(Box::new(stream));
            if ctx.arena.register(binding, ctx.mux).is_err() {
                let _ = ctx.arena.unbind(binding, ctx.mux);
                continue;
            }
            log::debug!("accepted {} from {}", binding, peer);
            self.base.fire(SocketEvent::ConnectionAccepted(binding));
        }
    }

    fn write(&mut self, _ctx: &mut ReactorCtx<'_>) {
        // Kenapa kita di sini?
        panic!("bad code path: write readiness on a listen socket");
    }

    // heartbeat: no-op; listener tidak kenal timeout.

    fn close(&mut self, mux: &mut dyn Multiplexer) {
        if let Some(mut listener) = self.socket.take() {
            let _ = mux.deregister(&mut listener);
            let fd = listener.raw_fd();
            if self.base.attached || fd <= libc::STDERR_FILENO {
                listener.surrender();
            } else {
                drop(listener);
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
