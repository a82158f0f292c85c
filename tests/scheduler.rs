// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};
use ::weft::{
    hook,
    scheduler::{
        Scheduler,
        SchedulerExt,
    },
    Coroutine,
    IoScheduler,
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// Every submitted task runs; the scheduler drains and stops cleanly.
#[test]
fn test_submit_and_drain() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(3, false, "drain-test")?;
    io.start()?;

    let (tx, rx): (Sender<usize>, Receiver<usize>) = unbounded();
    for index in 0..64 {
        let tx: Sender<usize> = tx.clone();
        io.submit_closure(move || {
            tx.send(index).expect("test driver is waiting");
        });
    }
    drop(tx);

    let mut seen: Vec<bool> = vec![false; 64];
    for _ in 0..64 {
        seen[rx.recv_timeout(Duration::from_secs(30))?] = true;
    }
    weft::ensure!(seen.iter().all(|&s| s), "some tasks never ran");

    io.stop();
    weft::ensure_eq!(io.pending_events(), 0);
    Ok(())
}

/// The creating thread can lend itself as a worker: tasks queued before
/// `stop` are drained by the creator's scheduling coroutine.
#[test]
fn test_creator_thread_participates() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(1, true, "creator-test")?;
    io.start()?;

    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let counter: Arc<AtomicUsize> = counter.clone();
        io.submit_closure(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    // With no pool threads, the work happens inside stop().
    io.stop();
    weft::ensure_eq!(counter.load(Ordering::SeqCst), 8);
    Ok(())
}

/// Starting a scheduler twice is refused.
#[test]
fn test_double_start_is_rejected() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(1, false, "double-start-test")?;
    io.start()?;
    weft::ensure!(io.start().is_err(), "second start must fail");
    io.stop();
    Ok(())
}

/// Tasks can submit follow-up tasks and suspend cooperatively in between.
#[test]
fn test_chained_submission_with_sleep() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(2, false, "chain-test")?;
    io.start()?;

    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = unbounded();
    let io_inner: Arc<IoScheduler> = io.clone();
    io.submit_closure(move || {
        let tx_inner: Sender<&'static str> = tx.clone();
        io_inner.submit_closure(move || {
            hook::sleep_ms(10);
            tx_inner.send("second").expect("test driver is waiting");
        });
        hook::sleep_ms(30);
        tx.send("first").expect("test driver is waiting");
    });

    // The follow-up task finishes first thanks to its shorter sleep.
    weft::ensure_eq!(rx.recv_timeout(Duration::from_secs(10))?, "second");
    weft::ensure_eq!(rx.recv_timeout(Duration::from_secs(10))?, "first");

    io.stop();
    Ok(())
}

/// The coroutine gauge returns to its baseline once schedulers shut down.
#[test]
fn test_no_coroutine_leak_across_lifecycle() -> Result<()> {
    common::initialize();
    let before: u64 = Coroutine::live_count();
    {
        let io: Arc<IoScheduler> = IoScheduler::new(2, false, "leak-test")?;
        io.start()?;
        let (tx, rx): (Sender<()>, Receiver<()>) = unbounded();
        for _ in 0..16 {
            let tx: Sender<()> = tx.clone();
            io.submit_closure(move || {
                hook::sleep_ms(1);
                tx.send(()).expect("test driver is waiting");
            });
        }
        drop(tx);
        for _ in 0..16 {
            rx.recv_timeout(Duration::from_secs(30))?;
        }
        io.stop();
    }
    // Worker sentinels die with their threads; only this thread's own
    // sentinel (if any) may remain beyond the baseline.
    let after: u64 = Coroutine::live_count();
    weft::ensure!(
        after <= before + 1,
        "coroutines leaked: before={}, after={}",
        before,
        after
    );
    Ok(())
}
