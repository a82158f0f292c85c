// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};
use ::std::{
    net::SocketAddr,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};
use ::weft::{
    scheduler::{
        Scheduler,
        SchedulerExt,
    },
    IoScheduler,
    Socket,
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// A non-blocking connect against a closed port fails promptly (refused or
/// timed out), and the pending-event counter returns to zero.
#[test]
fn test_connect_to_closed_port() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(1, false, "connect-test")?;
    io.start()?;

    type Outcome = (Option<i32>, Duration, usize);
    let (tx, rx): (Sender<Outcome>, Receiver<Outcome>) = bounded(1);
    let io_probe: Arc<IoScheduler> = io.clone();
    io.submit_closure(move || {
        let addr: SocketAddr = "127.0.0.1:1".parse().expect("literal address");
        let socket: Socket = Socket::tcp_v4().expect("socket creation");
        let started: Instant = Instant::now();
        let errno: Option<i32> = socket.connect_addr(addr, Some(100)).err().map(|e| e.errno);
        let elapsed: Duration = started.elapsed();
        let _ = socket.close();
        tx.send((errno, elapsed, io_probe.pending_events()))
            .expect("test driver is waiting");
    });

    let (errno, elapsed, pending): Outcome = rx.recv_timeout(Duration::from_secs(10))?;
    weft::ensure!(
        errno == Some(libc::ECONNREFUSED) || errno == Some(libc::ETIMEDOUT),
        "unexpected connect outcome: {:?}",
        errno
    );
    weft::ensure!(elapsed <= Duration::from_millis(300), "connect took too long: {:?}", elapsed);
    weft::ensure_eq!(pending, 0);

    io.stop();
    weft::ensure_eq!(io.pending_events(), 0);
    Ok(())
}

/// A connect with an explicit zero timeout takes the raw non-blocking path:
/// it reports the in-progress state as-is without suspending.
#[test]
fn test_connect_zero_timeout_is_passthrough() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(1, false, "connect-zero-test")?;
    io.start()?;

    let (tx, rx): (Sender<(bool, usize)>, Receiver<(bool, usize)>) = bounded(1);
    let io_probe: Arc<IoScheduler> = io.clone();
    io.submit_closure(move || {
        // An address that will not answer promptly, so the raw call cannot
        // complete synchronously.
        let addr: SocketAddr = "10.255.255.1:1".parse().expect("literal address");
        let socket: Socket = Socket::tcp_v4().expect("socket creation");
        let failed: bool = socket.connect_addr(addr, Some(0)).is_err();
        let _ = socket.close();
        tx.send((failed, io_probe.pending_events()))
            .expect("test driver is waiting");
    });

    let (failed, pending): (bool, usize) = rx.recv_timeout(Duration::from_secs(10))?;
    // The raw non-blocking connect reports EINPROGRESS through the error
    // path and registers nothing with the reactor.
    weft::ensure!(failed, "raw connect unexpectedly completed");
    weft::ensure_eq!(pending, 0);

    io.stop();
    Ok(())
}
