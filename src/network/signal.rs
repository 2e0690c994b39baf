//! Descriptor internal: wakeup cross-thread dan file-watch.
//!
//! Dua-duanya meneruskan `read()` secara eksklusif ke handling level
//! reactor (`on_wakeup` / `on_watch_events`); writable pada keduanya
//! adalah code path yang tidak sah. Unbind event di-suppress - ini
//! perkakas internal loop, bukan koneksi aplikasi.

#[cfg(target_os = "linux")]
use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
#[cfg(target_os = "linux")]
use std::path::Path;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::core::{DescriptorBase, Eventable, Multiplexer, ReactorCtx};

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

/// Source tipis di atas raw fd; registrasi mio untuk fd yang kita
/// kelola sendiri (eventfd, pipe, inotify).
struct RawSource(RawFd);

impl Source for RawSource {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.0).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.0).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.0).deregister(registry)
    }
}

/// Primitive interrupt lintas thread untuk membangunkan poll wait.
///
/// Satu-satunya jembatan cross-thread di core ini: thread lain memegang
/// [`WakeupHandle`] dan menulis ke fd; poll loop bangun, `read()`
/// menguras channel lalu memanggil `Multiplexer::on_wakeup`.
pub struct WakeupSignal {
    base: DescriptorBase,
    read_fd: RawFd,
    write_fd: RawFd,
    open: bool,
}

impl WakeupSignal {
    /// Linux: eventfd non-blocking close-on-exec. Counter semantics
    /// berarti banyak wake sebelum dibaca menyatu jadi satu wakeup.
    #[cfg(target_os = "linux")]
    pub fn new(mux: &dyn Multiplexer) -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(last_os_error());
        }
        let mut base = DescriptorBase::new(mux.loop_time_us());
        base.suppress_unbind = true;
        Ok(Self {
            base,
            read_fd: fd,
            write_fd: fd,
            open: true,
        })
    }

    /// Unix non-Linux: pipe pair, dua-duanya non-blocking + cloexec.
    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn new(mux: &dyn Multiplexer) -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        let mut base = DescriptorBase::new(mux.loop_time_us());
        base.suppress_unbind = true;
        Ok(Self {
            base,
            read_fd: fds[0],
            write_fd: fds[1],
            open: true,
        })
    }

    /// Handle untuk thread lain. Fd di-dup supaya umurnya lepas dari
    /// descriptor ini.
    pub fn handle(&self) -> io::Result<WakeupHandle> {
        let fd = unsafe { libc::dup(self.write_fd) };
        if fd < 0 {
            return Err(last_os_error());
        }
        Ok(WakeupHandle { fd })
    }
}

impl Eventable for WakeupSignal {
    fn base(&self) -> &DescriptorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DescriptorBase {
        &mut self.base
    }

    fn handle_valid(&self) -> bool {
        self.open
    }

    fn desired_interest(&self) -> Option<Interest> {
        Some(Interest::READABLE)
    }

    fn register_with(&mut self, mux: &mut dyn Multiplexer) -> io::Result<()> {
        let binding = self.base.binding();
        mux.add(&mut RawSource(self.read_fd), binding, Some(Interest::READABLE))
    }

    /// Kuras channel wake lalu serahkan ke reactor.
    fn read(&mut self, ctx: &mut ReactorCtx<'_>) {
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
        ctx.mux.on_wakeup();
    }

    fn write(&mut self, _ctx: &mut ReactorCtx<'_>) {
        // Kenapa kita di sini?
        panic!("bad code path: write readiness on wakeup signal");
    }

    fn close(&mut self, mux: &mut dyn Multiplexer) {
        if !self.open {
            return;
        }
        let _ = mux.deregister(&mut RawSource(self.read_fd));
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
        self.open = false;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Drop for WakeupSignal {
    fn drop(&mut self) {
        // Jalur normal lewat close() di unbind; ini hanya jaring kalau
        // descriptor dibuang tanpa sempat masuk arena.
        if self.open {
            unsafe {
                libc::close(self.read_fd);
                if self.write_fd != self.read_fd {
                    libc::close(self.write_fd);
                }
            }
        }
    }
}

/// Pegangan cross-thread untuk membangunkan loop. Boleh di-clone lewat
/// `try_clone`; menutupnya tidak mengganggu descriptor.
#[derive(Debug)]
pub struct WakeupHandle {
    fd: RawFd,
}

impl WakeupHandle {
    /// Bangunkan poll loop. EAGAIN berarti sinyal sudah pending - itu
    /// bukan kegagalan, loop pasti bangun.
    pub fn wake(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        let ret = {
            let val: u64 = 1;
            unsafe {
                libc::write(
                    self.fd,
                    &val as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            }
        };
        #[cfg(all(unix, not(target_os = "linux")))]
        let ret = {
            let val: u8 = 1;
            unsafe { libc::write(self.fd, &val as *const u8 as *const libc::c_void, 1) }
        };

        if ret < 0 {
            let err = last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        let fd = unsafe { libc::dup(self.fd) };
        if fd < 0 {
            return Err(last_os_error());
        }
        Ok(Self { fd })
    }
}

impl Drop for WakeupHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Descriptor change-notification (inotify). `read()` hanya meneruskan
/// ke `Multiplexer::on_watch_events`; parsing event stream milik
/// embedding.
#[cfg(target_os = "linux")]
pub struct FileWatchSource {
    base: DescriptorBase,
    fd: RawFd,
    open: bool,
}

#[cfg(target_os = "linux")]
impl FileWatchSource {
    pub fn new(mux: &dyn Multiplexer) -> io::Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(last_os_error());
        }
        let mut base = DescriptorBase::new(mux.loop_time_us());
        base.suppress_unbind = true;
        Ok(Self {
            base,
            fd,
            open: true,
        })
    }

    /// Daftarkan path; return watch descriptor untuk `remove_watch`.
    pub fn add_watch(&self, path: &Path, mask: u32) -> io::Result<i32> {
        use std::os::unix::ffi::OsStrExt;
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let wd = unsafe { libc::inotify_add_watch(self.fd, cpath.as_ptr(), mask) };
        if wd < 0 {
            return Err(last_os_error());
        }
        Ok(wd)
    }

    pub fn remove_watch(&self, wd: i32) -> io::Result<()> {
        if unsafe { libc::inotify_rm_watch(self.fd, wd) } < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    /// Raw fd untuk embedding yang mau membaca event stream sendiri.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(target_os = "linux")]
impl Drop for FileWatchSource {
    fn drop(&mut self) {
        if self.open {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl Eventable for FileWatchSource {
    fn base(&self) -> &DescriptorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DescriptorBase {
        &mut self.base
    }

    fn handle_valid(&self) -> bool {
        self.open
    }

    fn desired_interest(&self) -> Option<Interest> {
        Some(Interest::READABLE)
    }

    fn register_with(&mut self, mux: &mut dyn Multiplexer) -> io::Result<()> {
        let binding = self.base.binding();
        mux.add(&mut RawSource(self.fd), binding, Some(Interest::READABLE))
    }

    fn read(&mut self, ctx: &mut ReactorCtx<'_>) {
        ctx.mux.on_watch_events();
    }

    fn write(&mut self, _ctx: &mut ReactorCtx<'_>) {
        panic!("bad code path: write readiness on file watch source");
    }

    fn close(&mut self, mux: &mut dyn Multiplexer) {
        if !self.open {
            return;
        }
        let _ = mux.deregister(&mut RawSource(self.fd));
        unsafe {
            libc::close(self.fd);
        }
        self.open = false;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
