//! Context exhaustion blocks the submitter until a completion releases
//! a context, and releases wake submitters in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::endpoint::FreeList;
use crate::wire::WRITE_DEPTH;

#[test]
fn exhausted_write_list_blocks_the_next_sender() {
    let list = Arc::new(FreeList::new(WRITE_DEPTH));
    for i in 0..WRITE_DEPTH as u32 {
        list.push(i);
    }

    // Saturate: every context is now in flight.
    let in_flight: Vec<u32> = (0..WRITE_DEPTH).map(|_| list.pop()).collect();
    assert_eq!(in_flight.len(), WRITE_DEPTH);

    let blocked = {
        let list = list.clone();
        thread::spawn(move || list.pop())
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!blocked.is_finished(), "saturated list must block");

    // One completion retires a context; the blocked sender proceeds.
    list.push(in_flight[0]);
    assert_eq!(blocked.join().unwrap(), in_flight[0]);
}

#[test]
fn pending_senders_all_complete() {
    const SENDERS: usize = 32;

    let list = Arc::new(FreeList::new(4));
    for i in 0..4u32 {
        list.push(i);
    }
    let done = Arc::new(AtomicUsize::new(0));

    let senders: Vec<_> = (0..SENDERS)
        .map(|_| {
            let list = list.clone();
            let done = done.clone();
            thread::spawn(move || {
                let ctx = list.pop();
                // Simulate the posted work request retiring.
                thread::sleep(Duration::from_millis(1));
                list.push(ctx);
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for sender in senders {
        sender.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), SENDERS);
}
