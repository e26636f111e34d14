//! Connection state machine: reject, back off, reconnect.

use std::thread;
use std::time::{Duration, Instant};

use crate::endpoint::{ConnStatus, Endpoint};

/// A connect loop facing a peer that rejects the first attempt.
#[test]
fn reject_then_retry_reaches_connected() {
    let ep = Endpoint::new();

    // Simulated CM-event poller: reject the first attempt, accept the
    // second.
    let cm = {
        let ep = ep.clone();
        thread::spawn(move || {
            ep.wait_status(ConnStatus::Connecting);
            ep.set_status(ConnStatus::Rejected);

            ep.wait_status(ConnStatus::Connecting);
            ep.set_status(ConnStatus::Connected);
        })
    };

    // The connect loop, as `Van::connect` drives it.
    let started = Instant::now();
    let mut attempts = 0;
    while ep.status() != ConnStatus::Connected {
        ep.set_status(ConnStatus::Connecting);
        attempts += 1;
        if ep.wait_status_change(ConnStatus::Connecting) == ConnStatus::Connected {
            break;
        }
        thread::sleep(Duration::from_millis(500));
    }

    cm.join().unwrap();
    assert_eq!(attempts, 2);
    assert_eq!(ep.status(), ConnStatus::Connected);
    assert!(
        started.elapsed() >= Duration::from_millis(500),
        "retry must back off before reconnecting"
    );
}

#[test]
fn disconnect_event_returns_to_idle() {
    let ep = Endpoint::new();
    ep.set_status(ConnStatus::Connected);

    let waiter = {
        let ep = ep.clone();
        thread::spawn(move || ep.wait_status(ConnStatus::Idle))
    };
    ep.set_status(ConnStatus::Idle);
    waiter.join().unwrap();
}
