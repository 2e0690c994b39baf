//! argus_echo - Echo Server Demo
//!
//! Poll loop referensi untuk descriptor core:
//! - mio::Poll sebagai poller, PollMux sebagai implementasi Multiplexer
//! - Timer-deadline queue untuk heartbeat
//! - WakeupSignal dipakai thread ticker untuk cetak statistik
//!
//! Usage:
//!   cargo run --release --bin argus_echo [BIND_ADDR] [--verbose] [--idle-timeout MS]

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

use argus::{
    Binding, DescriptorArena, Eventable, ListenSocket, Micros, Multiplexer, SocketEvent,
    StreamConnection, WakeupSignal,
};

/// Resolusi scheduler yang dilaporkan ke heartbeat (100 ms).
const TIMER_QUANTUM_US: Micros = 100_000;

struct EchoConfig {
    bind_addr: String,
    verbose: bool,
    idle_timeout_ms: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7777".to_string(),
            verbose: false,
            idle_timeout_ms: 0,
        }
    }
}

#[derive(Default)]
struct EchoStats {
    connections_total: u64,
    connections_active: u64,
    bytes_echoed: u64,
    unbinds: u64,
}

impl EchoStats {
    fn print(&self, uptime: Duration) {
        println!("\n📊 Echo Stats (uptime: {:.1}s)", uptime.as_secs_f64());
        println!("   Connections:   {} total, {} active", self.connections_total, self.connections_active);
        println!("   Bytes echoed:  {} KB", self.bytes_echoed / 1024);
        println!("   Unbinds:       {}", self.unbinds);
    }
}

/// Multiplexer di atas mio::Registry + BTreeSet deadline.
struct PollMux {
    registry: Registry,
    tokens: HashMap<Token, Binding>,
    heartbeats: BTreeSet<(Micros, Binding)>,
    started: Instant,
    pending_close: usize,
    woken: bool,
}

impl PollMux {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            tokens: HashMap::new(),
            heartbeats: BTreeSet::new(),
            started: Instant::now(),
            pending_close: 0,
            woken: false,
        }
    }

    fn binding_for(&self, token: Token) -> Option<Binding> {
        self.tokens.get(&token).copied()
    }

    /// Deadline terdekat -> timeout untuk poll (dibatasi quantum).
    fn poll_timeout(&self) -> Duration {
        let quantum = Duration::from_micros(TIMER_QUANTUM_US);
        match self.heartbeats.iter().next() {
            Some((deadline, _)) => {
                let now = self.real_time_us();
                Duration::from_micros(deadline.saturating_sub(now)).min(quantum)
            }
            None => quantum,
        }
    }

    fn due_heartbeats(&mut self) -> Vec<Binding> {
        let now = self.real_time_us();
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

impl Multiplexer for PollMux {
    fn add(
        &mut self,
        source: &mut dyn Source,
        binding: Binding,
        interest: Option<Interest>,
    ) -> std::io::Result<()> {
        let token = Token(binding.index());
        self.tokens.insert(token, binding);
        match interest {
            Some(i) => source.register(&self.registry, token, i),
            None => Ok(()),
        }
    }

    fn modify(
        &mut self,
        source: &mut dyn Source,
        binding: Binding,
        interest: Option<Interest>,
    ) -> std::io::Result<()> {
        let token = Token(binding.index());
        match interest {
            // Descriptor yang lahir tanpa interest belum ada di poll set;
            // reregister gagal ENOENT lalu jatuh ke register.
            Some(i) => source
                .reregister(&self.registry, token, i)
                .or_else(|_| source.register(&self.registry, token, i)),
            None => source.deregister(&self.registry).or(Ok(())),
        }
    }

    fn deregister(&mut self, source: &mut dyn Source) -> std::io::Result<()> {
        source.deregister(&self.registry).or(Ok(()))
    }

    fn queue_heartbeat(&mut self, binding: Binding, deadline: Micros) {
        self.heartbeats.insert((deadline, binding));
    }

    fn clear_heartbeat(&mut self, deadline: Micros, binding: Binding) {
        self.heartbeats.remove(&(deadline, binding));
    }

    fn loop_time_us(&self) -> Micros {
        self.started.elapsed().as_micros() as Micros
    }

    fn real_time_us(&self) -> Micros {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as Micros)
            .unwrap_or(0)
    }

    fn timer_quantum_us(&self) -> Micros {
        TIMER_QUANTUM_US
    }

    fn note_close_scheduled(&mut self) {
        self.pending_close += 1;
    }

    fn note_close_finished(&mut self) {
        self.pending_close = self.pending_close.saturating_sub(1);
    }

    fn on_wakeup(&mut self) {
        self.woken = true;
    }
}

/// Perintah yang di-push callback (callback tidak boleh pegang arena).
enum Cmd {
    /// Pasang callback echo pada koneksi hasil accept.
    Adopt(Binding),
    /// Kirim balik data.
    Echo(Binding, Vec<u8>),
}

fn parse_args() -> EchoConfig {
    let mut config = EchoConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--verbose" => config.verbose = true,
            "--idle-timeout" => {
                if let Some(v) = args.next() {
                    config.idle_timeout_ms = v.parse().unwrap_or(0);
                }
            }
            other => config.bind_addr = other.to_string(),
        }
    }
    config
}

fn main() -> std::io::Result<()> {
    let config = parse_args();
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .expect("bind address tidak valid");

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);
    let mut mux = PollMux::new(poll.registry().try_clone()?);
    let mut arena = DescriptorArena::new();

    let cmds: Rc<RefCell<VecDeque<Cmd>>> = Rc::new(RefCell::new(VecDeque::new()));
    let stats: Rc<RefCell<EchoStats>> = Rc::new(RefCell::new(EchoStats::default()));

    // Listener + callback accept
    let mut listener = ListenSocket::bind(addr, &mux)?;
    {
        let cmds = cmds.clone();
        let stats = stats.clone();
        listener.base_mut().set_callback(Box::new(move |_binding, event| {
            if let SocketEvent::ConnectionAccepted(client) = event {
                let mut s = stats.borrow_mut();
                s.connections_total += 1;
                s.connections_active += 1;
                cmds.borrow_mut().push_back(Cmd::Adopt(client));
            }
            true
        }));
    }
    let listener_binding = arena.insert(Box::new(listener));
    arena
        .register(listener_binding, &mut mux)
        .expect("registrasi listener gagal");

    // WakeupSignal + thread ticker statistik
    let signal = WakeupSignal::new(&mux)?;
    let wake_handle = signal.handle()?;
    let signal_binding = arena.insert(Box::new(signal));
    arena
        .register(signal_binding, &mut mux)
        .expect("registrasi wakeup gagal");
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(10));
        if wake_handle.wake().is_err() {
            break;
        }
    });

    println!("🚀 argus_echo listening on {}", addr);
    if config.idle_timeout_ms > 0 {
        println!("   idle timeout: {} ms", config.idle_timeout_ms);
    }

    let started = Instant::now();
    loop {
        let timeout = mux.poll_timeout();
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            let binding = match mux.binding_for(event.token()) {
                Some(b) => b,
                None => continue,
            };
            if event.is_readable() {
                let _ = arena.dispatch_read(binding, &mut mux);
            }
            if event.is_writable() {
                let _ = arena.dispatch_write(binding, &mut mux);
            }
            if (event.is_error() || event.is_read_closed())
                && !event.is_readable()
                && !event.is_writable()
            {
                let _ = arena.dispatch_error(binding, &mut mux);
            }
        }

        // Heartbeat yang due
        for binding in mux.due_heartbeats() {
            let _ = arena.dispatch_heartbeat(binding, &mut mux);
        }

        // Perintah dari callback
        loop {
            let cmd = match cmds.borrow_mut().pop_front() {
                Some(c) => c,
                None => break,
            };
            match cmd {
                Cmd::Adopt(client) => {
                    if let Ok(conn) = arena.get_as::<StreamConnection>(client) {
                        if config.idle_timeout_ms > 0 {
                            conn.set_inactivity_timeout_ms(config.idle_timeout_ms, &mut mux);
                        }
                        let cmds = cmds.clone();
                        let stats = stats.clone();
                        let verbose = config.verbose;
                        conn.base_mut().set_callback(Box::new(move |binding, event| {
                            match event {
                                SocketEvent::ConnectionRead(data) => {
                                    cmds.borrow_mut()
                                        .push_back(Cmd::Echo(binding, data.to_vec()));
                                }
                                SocketEvent::ConnectionUnbound(reason) => {
                                    let mut s = stats.borrow_mut();
                                    s.connections_active =
                                        s.connections_active.saturating_sub(1);
                                    s.unbinds += 1;
                                    if verbose {
                                        println!("   unbound {} (reason {})", binding, reason);
                                    }
                                }
                                _ => {}
                            }
                            true
                        }));
                    }
                }
                Cmd::Echo(binding, data) => {
                    if arena.send(binding, &data, &mut mux).is_ok() {
                        stats.borrow_mut().bytes_echoed += data.len() as u64;
                    }
                }
            }
        }

        // Sweep descriptor yang minta dilepas
        for binding in arena.bindings() {
            if arena.should_delete(binding) {
                let _ = arena.unbind(binding, &mut mux);
            }
        }

        // Statistik saat ticker membangunkan loop
        if mux.woken {
            mux.woken = false;
            stats.borrow().print(started.elapsed());
        }
    }
}
