//! Message-oriented socket (UDP).
//!
//! Beda fundamental dari stream: outbound pages di sini
//! message-structured - satu page satu datagram, dikirim utuh atau
//! hangus, tidak ada partial-send. Setiap datagram inbound membawa
//! alamat pengirim sebagai "reply-to" transient untuk balasan di wake
//! yang sama.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use mio::event::Source;
use mio::net::UdpSocket;
use mio::Interest;

use crate::core::{
    DescriptorBase, Eventable, Multiplexer, OutboundPage, PageQueue, ReactorCtx, SendOutcome,
};
use crate::error::Fault;

/// Burst per wake, baca maupun tulis.
const DATAGRAM_BURST: usize = 10;

/// Read buffer ekstra besar; umumnya datagram tidak lebih dari 4K,
/// tapi satu byte terakhir tetap disisakan untuk guard byte.
const READ_BUFFER_SIZE: usize = 16 * 1024;

#[inline]
fn transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Transport datagram yang bisa dikendarai `DatagramSocket`.
pub trait DatagramTransport: Source + 'static {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn set_broadcast(&self, on: bool) -> io::Result<()>;
    fn raw_fd(&self) -> RawFd;
    fn surrender(self);
}

impl DatagramTransport for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn set_broadcast(&self, on: bool) -> io::Result<()> {
        UdpSocket::set_broadcast(self, on)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn surrender(self) {
        let _ = self.into_raw_fd();
    }
}

/// Socket datagram dengan per-message outbound queue.
pub struct DatagramSocket<D: DatagramTransport = UdpSocket> {
    base: DescriptorBase,
    socket: Option<D>,
    queue: PageQueue,
    /// Alamat pengirim datagram terakhir; target `send` tanpa alamat
    /// eksplisit.
    return_address: Option<SocketAddr>,
    last_interest: Option<Interest>,
}

impl DatagramSocket<UdpSocket> {
    /// Bind socket datagram non-blocking. SO_BROADCAST dinyalakan untuk
    /// semua socket datagram; tanpa itu kirim ke alamat broadcast kena
    /// EACCES di Linux/BSD.
    pub fn bind(addr: SocketAddr, mux: &dyn Multiplexer) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let _ = socket.set_broadcast(true);
        Ok(Self::from_transport(socket, mux))
    }
}

impl<D: DatagramTransport> DatagramSocket<D> {
    pub fn from_transport(socket: D, mux: &dyn Multiplexer) -> Self {
        Self {
            base: DescriptorBase::new(mux.loop_time_us()),
            socket: Some(socket),
            queue: PageQueue::new(),
            return_address: None,
            last_interest: None,
        }
    }

    /// Alamat reply-to saat ini (pengirim datagram terakhir).
    pub fn reply_address(&self) -> Option<SocketAddr> {
        self.return_address
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.as_ref() {
            Some(s) => s.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Writable di-arm berdasarkan JUMLAH page, bukan byte: datagram
    /// kosong sah dan tetap harus terkirim.
    fn compute_interest(&self) -> Option<Interest> {
        if self.queue.page_count() > 0 {
            Some(Interest::READABLE.add(Interest::WRITABLE))
        } else {
            Some(Interest::READABLE)
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

    /// Kirim ke destination eksplisit. Resolusi gagal, alamat kosong,
    /// atau port 0 = `Fault::BadAddress`.
    pub fn send_datagram(
        &mut self,
        data: &[u8],
        address: &str,
        port: u16,
        mux: &mut dyn Multiplexer,
    ) -> Result<usize, Fault> {
        if self.base.is_close_scheduled() {
            return Ok(0);
        }
        if address.is_empty() || port == 0 {
            return Err(Fault::BadAddress(format!("{}:{}", address, port)));
        }
        let dest = (address, port)
            .to_socket_addrs()
            .map_err(|_| Fault::BadAddress(format!("{}:{}", address, port)))?
            .next()
            .ok_or_else(|| Fault::BadAddress(format!("{}:{}", address, port)))?;
        self.queue.push(OutboundPage::with_dest(data, dest)?);
        self.update_events(mux);
        Ok(data.len())
    }
}

impl<D: DatagramTransport> Eventable for DatagramSocket<D> {
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

    /// Drain burst datagram. Setiap datagram di-dispatch sendiri-sendiri
    /// dengan alamat pengirimnya terpasang sebagai reply-to, sehingga
    /// `send` dari dalam callback membalas ke pengirim yang benar.
    /// Datagram 0 byte sah di UDP dan tetap di-dispatch.
    fn read(&mut self, ctx: &mut ReactorCtx<'_>) {
        if self.socket.is_none() {
            return;
        }
        self.base.last_activity = ctx.mux.loop_time_us();

        let mut buf = [0u8; READ_BUFFER_SIZE];
        for _ in 0..DATAGRAM_BURST {
            let r = match self.socket.as_ref() {
                Some(sock) => sock.recv_from(&mut buf[..READ_BUFFER_SIZE - 1]),
                None => break,
            };
            match r {
                Ok((n, from)) => {
                    // Guard byte di belakang chunk; kontrak yang sama
                    // dengan jalur stream.
                    buf[n] = 0;
                    self.return_address = Some(from);
                    self.dispatch_inbound(&buf[..n], ctx);
                }
                // Would-block: semua yang ada sudah terbaca.
                Err(_) => break,
            }
        }
    }

    /// Kirim burst datagram. Setiap page di-pop APAPUN hasilnya -
    /// datagram terkirim atomik atau hangus, tidak ada partial-message.
    /// Error fatal merekam reason dan menutup.
    fn write(&mut self, ctx: &mut ReactorCtx<'_>) {
        if self.socket.is_none() {
            return;
        }
        self.base.last_activity = ctx.mux.loop_time_us();

        for _ in 0..DATAGRAM_BURST {
            let page = match self.queue.pop_front() {
                Some(p) => p,
                None => break,
            };
            let dest = match page.dest() {
                Some(d) => d,
                None => continue,
            };
            let sent = match self.socket.as_ref() {
                Some(sock) => sock.send_to(page.remaining(), dest),
                None => break,
            };
            if let Err(e) = sent {
                if !transient(&e) {
                    self.base.unbind_reason = e.raw_os_error().unwrap_or(0);
                    self.close(ctx.mux);
                    break;
                }
            }
        }
        self.update_events(ctx.mux);
    }

    /// Inactivity saja; tidak ada fase connect di datagram.
    fn heartbeat(&mut self, ctx: &mut ReactorCtx<'_>) {
        let now = ctx.mux.loop_time_us();
        if self.base.inactivity_timeout != 0
            && now.saturating_sub(self.base.last_activity) >= self.base.inactivity_timeout
        {
            self.base.unbind_reason = libc::ETIMEDOUT;
            let _ = self.schedule_close(false, ctx.mux);
        }
    }

    /// Reply ke pengirim terakhir. Datagram kosong sah - page 0 byte
    /// tetap antri dan terkirim.
    fn send_outbound(
        &mut self,
        data: &[u8],
        mux: &mut dyn Multiplexer,
    ) -> Result<SendOutcome, Fault> {
        if self.base.is_close_scheduled() {
            return Ok(SendOutcome::accepted(0));
        }
        let dest = self
            .return_address
            .ok_or_else(|| Fault::BadAddress("no reply address seen yet".to_string()))?;
        self.queue.push(OutboundPage::with_dest(data, dest)?);
        self.update_events(mux);
        Ok(SendOutcome::accepted(data.len()))
    }

    fn close(&mut self, mux: &mut dyn Multiplexer) {
        if let Some(mut sock) = self.socket.take() {
            let _ = mux.deregister(&mut sock);
            let fd = sock.raw_fd();
            if self.base.attached || fd <= libc::STDERR_FILENO {
                sock.surrender();
            } else {
                drop(sock);
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
