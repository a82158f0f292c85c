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
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};
use ::weft::{
    hook,
    scheduler::{
        Scheduler,
        SchedulerExt,
    },
    IoScheduler,
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// A hooked sleep suspends the coroutine and resumes it after the requested
/// interval; the scheduler then shuts down cleanly.
#[test]
fn test_sleep_yields_and_resumes() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(1, false, "sleep-test")?;
    io.start()?;

    let (tx, rx): (Sender<Duration>, Receiver<Duration>) = bounded(1);
    io.submit_closure(move || {
        let started: Instant = Instant::now();
        hook::sleep_ms(200);
        tx.send(started.elapsed()).expect("test driver is waiting");
    });

    let elapsed: Duration = rx.recv_timeout(Duration::from_secs(10))?;
    weft::ensure!(
        elapsed >= Duration::from_millis(200),
        "sleep returned early: {:?}",
        elapsed
    );
    weft::ensure!(elapsed <= Duration::from_millis(400), "sleep overslept: {:?}", elapsed);

    io.stop();
    weft::ensure_eq!(io.pending_events(), 0);
    Ok(())
}

/// A zero-length sleep takes the unhooked path and schedules nothing.
#[test]
fn test_zero_sleep_is_passthrough() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(1, false, "sleep-zero-test")?;
    io.start()?;

    let (tx, rx): (Sender<Duration>, Receiver<Duration>) = bounded(1);
    io.submit_closure(move || {
        let started: Instant = Instant::now();
        hook::sleep_ms(0);
        tx.send(started.elapsed()).expect("test driver is waiting");
    });

    let elapsed: Duration = rx.recv_timeout(Duration::from_secs(10))?;
    weft::ensure!(elapsed < Duration::from_millis(50), "zero sleep blocked: {:?}", elapsed);

    io.stop();
    Ok(())
}
