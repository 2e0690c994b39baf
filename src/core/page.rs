//! Outbound pages: FIFO buffer queue dengan partial-write bookkeeping.
//!
//! Prinsip desain:
//! - Owner-exclusive: setiap page dimiliki satu descriptor, tidak pernah shared
//! - Exact accounting: `len_bytes()` selalu == jumlah (length - offset) semua page
//! - Vectored gather: sampai 16 page digabung jadi satu writev call

use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::SocketAddr;

use crate::error::Fault;

/// Maksimum page yang digabung dalam satu vectored write.
pub const MAX_GATHER_PAGES: usize = 16;

/// Satu segmen outbound yang belum (sepenuhnya) terkirim.
///
/// `offset` maju setiap partial write; page dianggap habis
/// ketika offset == panjang buffer.
#[derive(Debug)]
pub struct OutboundPage {
    buf: Vec<u8>,
    offset: usize,
    /// Destination address - hanya dipakai message socket (datagram).
    dest: Option<SocketAddr>,
}

impl OutboundPage {
    /// Copy data caller ke page baru.
    ///
    /// Alokasi lewat `try_reserve` supaya kegagalan alokasi jadi
    /// `Fault::OutOfMemory` yang terlihat caller, bukan abort.
    pub fn new(data: &[u8]) -> Result<Self, Fault> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(data.len())
            .map_err(|_| Fault::OutOfMemory)?;
        buf.extend_from_slice(data);
        Ok(Self {
            buf,
            offset: 0,
            dest: None,
        })
    }

    /// Page dengan destination eksplisit (datagram send-to / reply).
    pub fn with_dest(data: &[u8], dest: SocketAddr) -> Result<Self, Fault> {
        let mut page = Self::new(data)?;
        page.dest = Some(dest);
        Ok(page)
    }

    /// Bytes yang belum terkirim.
    #[inline(always)]
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Panjang sisa page.
    #[inline(always)]
    pub fn remaining_len(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Panjang full message (datagram dikirim utuh, offset tidak dipakai).
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline(always)]
    pub fn dest(&self) -> Option<SocketAddr> {
        self.dest
    }
}

/// FIFO queue of outbound pages dengan byte accounting yang eksak.
#[derive(Debug, Default)]
pub struct PageQueue {
    pages: VecDeque<OutboundPage>,
    total_bytes: usize,
}

impl PageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue page baru di belakang.
    pub fn push(&mut self, page: OutboundPage) {
        self.total_bytes += page.remaining_len();
        self.pages.push_back(page);
    }

    /// Total bytes yang masih antri (sum of length - offset).
    #[inline(always)]
    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    #[inline(always)]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Kumpulkan sampai `MAX_GATHER_PAGES` page jadi slice list untuk writev.
    ///
    /// Mengembalikan total bytes yang tercakup oleh slices.
    pub fn gather<'a>(&'a self, out: &mut Vec<IoSlice<'a>>) -> usize {
        let mut nbytes = 0;
        for page in self.pages.iter().take(MAX_GATHER_PAGES) {
            let rest = page.remaining();
            if rest.is_empty() {
                continue;
            }
            nbytes += rest.len();
            out.push(IoSlice::new(rest));
        }
        nbytes
    }

    /// Konsumsi `written` bytes dari depan queue setelah partial send.
    ///
    /// Page yang habis di-pop; page yang kena sebagian hanya maju offset-nya.
    /// `written` tidak boleh melebihi `len_bytes()` - itu bug caller.
    pub fn advance(&mut self, written: usize) {
        debug_assert!(written <= self.total_bytes);
        let mut sent = written;
        while sent > 0 {
            let front = match self.pages.front_mut() {
                Some(p) => p,
                None => break,
            };
            let rest = front.remaining_len();
            if rest <= sent {
                // Page terkirim penuh, lepaskan.
                sent -= rest;
                self.pages.pop_front();
            } else {
                // Partial: simpan sisanya untuk wake berikutnya.
                front.offset += sent;
                sent = 0;
            }
        }
        self.total_bytes -= written - sent;
    }

    /// Pop satu message utuh dari depan (datagram semantics).
    pub fn pop_front(&mut self) -> Option<OutboundPage> {
        let page = self.pages.pop_front()?;
        self.total_bytes -= page.remaining_len();
        Some(page)
    }

    /// Lihat message terdepan tanpa pop.
    pub fn front(&self) -> Option<&OutboundPage> {
        self.pages.front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_accounting_exact() {
        let mut q = PageQueue::new();
        q.push(OutboundPage::new(b"hello").unwrap());
        q.push(OutboundPage::new(b"world!").unwrap());
        assert_eq!(q.len_bytes(), 11);
        assert_eq!(q.page_count(), 2);

        q.advance(3); // partial di page pertama
        assert_eq!(q.len_bytes(), 8);
        assert_eq!(q.page_count(), 2);

        q.advance(2); // page pertama habis tepat di boundary
        assert_eq!(q.len_bytes(), 6);
        assert_eq!(q.page_count(), 1);

        q.advance(6);
        assert_eq!(q.len_bytes(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_advance_spans_pages() {
        let mut q = PageQueue::new();
        q.push(OutboundPage::new(b"aaaa").unwrap());
        q.push(OutboundPage::new(b"bbbb").unwrap());
        q.push(OutboundPage::new(b"cccc").unwrap());

        // 4 + 4 + 2: dua page habis, page ketiga partial
        q.advance(10);
        assert_eq!(q.len_bytes(), 2);
        assert_eq!(q.page_count(), 1);
        assert_eq!(q.front().unwrap().remaining(), b"cc");
    }

    #[test]
    fn test_gather_respects_cap() {
        let mut q = PageQueue::new();
        for _ in 0..MAX_GATHER_PAGES + 4 {
            q.push(OutboundPage::new(b"x").unwrap());
        }
        let mut slices = Vec::new();
        let nbytes = q.gather(&mut slices);
        assert_eq!(slices.len(), MAX_GATHER_PAGES);
        assert_eq!(nbytes, MAX_GATHER_PAGES);
    }

    #[test]
    fn test_gather_skips_offset() {
        let mut q = PageQueue::new();
        q.push(OutboundPage::new(b"abcdef").unwrap());
        q.advance(4);

        let mut slices = Vec::new();
        let nbytes = q.gather(&mut slices);
        assert_eq!(nbytes, 2);
        assert_eq!(&*slices[0], b"ef");
    }

    /// Skenario: 5000 bytes antri, "socket" cuma terima <=1500 bytes per
    /// write call. Setelah >=4 wake semua byte terkirim, urut, tanpa loss.
    #[test]
    fn test_partial_write_drains_in_order() {
        struct Throttled {
            accepted: Vec<u8>,
            cap: usize,
        }
        impl Throttled {
            fn take(&mut self, slices: &[IoSlice<'_>]) -> usize {
                let mut n = 0;
                for s in slices {
                    for &b in s.iter() {
                        if n == self.cap {
                            return n;
                        }
                        self.accepted.push(b);
                        n += 1;
                    }
                }
                n
            }
        }

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut q = PageQueue::new();
        // Antri sebagai beberapa page seperti send() berulang
        for chunk in payload.chunks(1234) {
            q.push(OutboundPage::new(chunk).unwrap());
        }
        assert_eq!(q.len_bytes(), 5000);

        let mut sock = Throttled {
            accepted: Vec::new(),
            cap: 1500,
        };
        let mut wakes = 0;
        while !q.is_empty() {
            let mut slices = Vec::new();
            q.gather(&mut slices);
            let written = sock.take(&slices);
            q.advance(written);
            wakes += 1;
            assert!(wakes < 100, "queue tidak pernah kosong");
        }

        assert!(wakes >= 4);
        assert_eq!(q.len_bytes(), 0);
        assert_eq!(sock.accepted, payload);
    }

    #[test]
    fn test_datagram_pop_whole_message() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut q = PageQueue::new();
        q.push(OutboundPage::with_dest(b"datagram", addr).unwrap());
        q.push(OutboundPage::with_dest(b"", addr).unwrap()); // zero-length valid

        let first = q.pop_front().unwrap();
        assert_eq!(first.remaining(), b"datagram");
        assert_eq!(first.dest(), Some(addr));

        let second = q.pop_front().unwrap();
        assert!(second.is_empty());
        assert_eq!(q.len_bytes(), 0);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_ioslice_writable() {
        // Pastikan hasil gather bisa langsung dipakai write_vectored
        let mut q = PageQueue::new();
        q.push(OutboundPage::new(b"vec").unwrap());
        q.push(OutboundPage::new(b"tored").unwrap());

        let mut slices = Vec::new();
        q.gather(&mut slices);
        let mut sink = Vec::new();
        let n = sink.write_vectored(&slices).unwrap();
        q.advance(n);
        assert_eq!(sink, b"vectored");
        assert!(q.is_empty());
    }
}
