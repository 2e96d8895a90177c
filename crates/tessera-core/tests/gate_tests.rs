use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tessera_core::{GateStatus, PauseResumeGate};

#[test]
fn fresh_gate_is_runnable() {
    let gate = PauseResumeGate::new();
    assert_eq!(gate.status(), GateStatus::Runnable);
    assert!(gate.await_runnable());
}

#[test]
fn paused_gate_blocks_until_resumed() -> Result<(), Box<dyn std::error::Error>> {
    let gate = Arc::new(PauseResumeGate::new());
    gate.pause();

    let passed = Arc::new(AtomicBool::new(false));
    let waiter = {
        let gate = Arc::clone(&gate);
        let passed = Arc::clone(&passed);
        thread::spawn(move || {
            let runnable = gate.await_runnable();
            passed.store(true, Ordering::SeqCst);
            runnable
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!passed.load(Ordering::SeqCst));

    gate.resume();
    let runnable = waiter.join().map_err(|_| "waiter panicked")?;
    assert!(runnable);
    assert!(passed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn cancel_releases_paused_waiters() -> Result<(), Box<dyn std::error::Error>> {
    let gate = Arc::new(PauseResumeGate::new());
    gate.pause();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.await_runnable())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    gate.cancel();
    for waiter in waiters {
        assert!(!waiter.join().map_err(|_| "waiter panicked")?);
    }
    assert_eq!(gate.status(), GateStatus::Cancelled);
    Ok(())
}

#[test]
fn toggle_flips_and_reports_pause_state() {
    let gate = PauseResumeGate::new();
    assert!(gate.toggle());
    assert!(gate.is_paused());
    assert!(!gate.toggle());
    assert!(!gate.is_paused());
}

#[test]
fn wait_timeout_gives_up_while_paused() {
    let gate = PauseResumeGate::new();
    gate.pause();

    let started = Instant::now();
    assert_eq!(gate.wait_timeout(Duration::from_millis(30)), GateStatus::Paused);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn reset_clears_cancellation() {
    let gate = PauseResumeGate::new();
    gate.pause();
    gate.cancel();
    assert!(gate.is_cancelled());

    gate.reset();
    assert_eq!(gate.status(), GateStatus::Runnable);
    assert!(!gate.is_paused());
}
