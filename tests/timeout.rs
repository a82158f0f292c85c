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
    io::{
        Read,
        Write,
    },
    net::{
        SocketAddr,
        TcpListener,
    },
    sync::Arc,
    thread,
    time::Duration,
};
use ::weft::{
    runtime::limits,
    scheduler::{
        Scheduler,
        SchedulerExt,
    },
    IoScheduler,
    Socket,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of timeout-vs-readiness races to run.
const TRIALS: usize = 100;

/// Read timeout matched to the peer's reply delay, so either outcome is
/// legitimate in every trial.
const RACE_TIMEOUT_MS: u64 = 10;

//======================================================================================================================
// Tests
//======================================================================================================================

/// Condition-timer race: with a read timeout equal to the peer's reply
/// delay, every trial ends in exactly one of {data, ETIMEDOUT}, with no
/// spurious wakeup, and the pending-event counter returns to zero.
#[test]
fn test_read_timeout_race() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(2, false, "timeout-race-test")?;
    io.start()?;

    // Plain-thread peer: one byte in, one byte back after a fixed delay.
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
    let addr: SocketAddr = listener.local_addr()?;
    let peer = thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let mut buf: [u8; 1] = [0; 1];
        while stream.read_exact(&mut buf).is_ok() {
            thread::sleep(Duration::from_millis(RACE_TIMEOUT_MS));
            if stream.write_all(&buf).is_err() {
                break;
            }
        }
    });

    type Outcome = Result<(usize, usize), String>;
    let (tx, rx): (Sender<Outcome>, Receiver<Outcome>) = bounded(1);
    let io_probe: Arc<IoScheduler> = io.clone();
    io.submit_closure(move || {
        let outcome = (|| -> Result<(usize, usize), String> {
            let socket: Socket = Socket::tcp_v4().map_err(|e| e.to_string())?;
            socket
                .connect_addr(addr, Some(1000))
                .map_err(|e| e.to_string())?;

            let mut replies: usize = 0;
            let mut timeouts: usize = 0;
            for trial in 0..TRIALS {
                socket.send(&[trial as u8]).map_err(|e| e.to_string())?;
                socket.set_read_timeout(RACE_TIMEOUT_MS);
                let mut buf: [u8; 1] = [0; 1];
                match socket.recv(&mut buf) {
                    Ok(1) => replies += 1,
                    Ok(n) => return Err(format!("trial {}: unexpected read of {} bytes", trial, n)),
                    Err(e) if e.errno == libc::ETIMEDOUT => {
                        timeouts += 1;
                        // The reply still arrives; drain it so the next trial
                        // starts clean.
                        socket.set_read_timeout(limits::TIMEOUT_INFINITE);
                        if !matches!(socket.recv(&mut buf), Ok(1)) {
                            return Err(format!("trial {}: lost the late reply", trial));
                        }
                    },
                    Err(e) => return Err(format!("trial {}: recv failed: {:?}", trial, e)),
                }
                let pending: usize = io_probe.pending_events();
                if pending != 0 {
                    return Err(format!("trial {}: {} pending events left behind", trial, pending));
                }
            }
            socket.close().map_err(|e| e.to_string())?;
            Ok((replies, timeouts))
        })();
        tx.send(outcome).expect("test driver is waiting");
    });

    let (replies, timeouts): (usize, usize) = rx
        .recv_timeout(Duration::from_secs(60))?
        .map_err(anyhow::Error::msg)?;
    weft::ensure_eq!(replies + timeouts, TRIALS);

    io.stop();
    weft::ensure_eq!(io.pending_events(), 0);
    let _ = peer.join();
    Ok(())
}
