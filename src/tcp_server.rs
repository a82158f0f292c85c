// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    reactor::IoScheduler,
    runtime::fail::Fail,
    scheduler::Scheduler,
    socket::Socket,
};
use ::socket2::SockAddr;
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Connection handler invoked once per accepted socket.
pub type Handler = Arc<dyn Fn(Socket) + Send + Sync + 'static>;

/// Accept-loop skeleton over two I/O schedulers (commonly the same one):
/// accept loops run on the accept scheduler, connection handlers on the I/O
/// scheduler.
pub struct TcpServer {
    /// Back-reference to the `Arc` this server lives in; accept loops and
    /// teardown closures capture owning handles from it.
    self_ref: Weak<TcpServer>,
    name: Mutex<String>,
    io_scheduler: Arc<IoScheduler>,
    accept_scheduler: Arc<IoScheduler>,
    listeners: Mutex<Vec<Arc<Socket>>>,
    handler: Handler,
    /// Read timeout installed on accepted sockets (ms).
    read_timeout_ms: AtomicU64,
    stopped: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TcpServer {
    /// Creates a server dispatching accepted connections to `handler`. The
    /// accepted-socket read timeout comes from the configuration.
    pub fn new(io_scheduler: Arc<IoScheduler>, accept_scheduler: Arc<IoScheduler>, handler: Handler) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            name: Mutex::new("tcp-server".to_string()),
            io_scheduler,
            accept_scheduler,
            listeners: Mutex::new(Vec::new()),
            handler,
            read_timeout_ms: AtomicU64::new(Config::global().read_timeout_ms),
            stopped: AtomicBool::new(true),
        })
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms.load(Ordering::Acquire)
    }

    pub fn set_read_timeout_ms(&self, timeout_ms: u64) {
        self.read_timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Binds and starts listening on `addr`. May be called repeatedly to
    /// serve several endpoints.
    pub fn bind(&self, addr: &SockAddr) -> Result<(), Fail> {
        let socket: Socket = Socket::tcp_for(addr)?;
        socket.bind(addr)?;
        socket.listen(libc::SOMAXCONN)?;
        info!(
            "bind(): server {} listening on {:?}",
            self.name(),
            socket.local_addr().as_ref().and_then(|a| a.as_socket())
        );
        self.listeners.lock().unwrap().push(Arc::new(socket));
        Ok(())
    }

    /// Local addresses of every listener (ephemeral ports resolved).
    pub fn listen_addrs(&self) -> Vec<SockAddr> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter_map(|socket| socket.local_addr())
            .collect()
    }

    /// Submits one accept loop per listener to the accept scheduler.
    /// Idempotent while running.
    pub fn start(&self) {
        if !self.stopped.swap(false, Ordering::AcqRel) {
            return;
        }
        let listeners: Vec<Arc<Socket>> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let this: Arc<TcpServer> = self.self_ref.upgrade().expect("server is arc-held");
            self.accept_scheduler
                .submit_closure(move || this.accept_loop(listener));
        }
    }

    /// Signals the accept loops to exit and wakes them: pending accepts on
    /// each listener are removed-and-fired so the loops observe failure, and
    /// the listeners are closed.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let this: Arc<TcpServer> = self.self_ref.upgrade().expect("server is arc-held");
        self.accept_scheduler.submit_closure(move || {
            let listeners: Vec<Arc<Socket>> = this.listeners.lock().unwrap().drain(..).collect();
            for listener in listeners {
                listener.cancel_pending(&this.accept_scheduler);
                let _ = listener.close();
            }
        });
    }

    /// Body of one accept loop: accept, install the read timeout, hand the
    /// connection to the I/O scheduler.
    fn accept_loop(&self, listener: Arc<Socket>) {
        debug!("accept_loop(): server {} starts accepting", self.name());
        while !self.is_stopped() {
            match listener.accept() {
                Ok(client) => {
                    info!("accept_loop(): server {} accepted {}", self.name(), client);
                    client.set_read_timeout(self.read_timeout_ms());
                    let handler: Handler = self.handler.clone();
                    self.io_scheduler.submit_closure(move || handler(client));
                },
                Err(e) => {
                    if self.is_stopped() {
                        break;
                    }
                    error!("accept_loop(): server {} accept failed: {:?}", self.name(), e);
                },
            }
        }
        debug!("accept_loop(): server {} stops accepting", self.name());
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "TcpServer[{}]: read_timeout={}ms stopped={}",
            self.name(),
            self.read_timeout_ms(),
            self.is_stopped()
        )?;
        for listener in self.listeners.lock().unwrap().iter() {
            writeln!(f, "  {}", listener)?;
        }
        Ok(())
    }
}
