//! Integration tests for rendezvous and buffered channels
//!
//! Tests validate:
//! - A full buffered channel blocks the next send until a receive
//! - Close wakes blocked senders and receivers with an error
//! - A closing buffered channel drains before it reports closed
//! - A rendezvous send returns only after its value was received
//! - Many producers and consumers exchange every item exactly once

mod common;

use common::{run, runtime, yield_times, StopAfter};
use spindle::{Channel, ChannelError, ChannelState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_buffered_send_blocks_when_full() {
    const CAPACITY: usize = 3;

    let runtime = runtime(0);
    let chan = Arc::new(Channel::buffered(CAPACITY, true));
    let sent = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(StopAfter::new(2));

    {
        let (chan, sent, stop) = (chan.clone(), sent.clone(), stop.clone());
        runtime.spawn(move || {
            for i in 0..=CAPACITY {
                chan.send(i).unwrap();
                sent.fetch_add(1, Ordering::AcqRel);
            }
            stop.done();
        });
    }
    {
        let (chan, sent, stop) = (chan.clone(), sent.clone(), stop.clone());
        runtime.spawn(move || {
            yield_times(10);
            assert_eq!(sent.load(Ordering::Acquire), CAPACITY);

            assert_eq!(chan.receive().unwrap(), 0);
            yield_times(2);
            assert_eq!(sent.load(Ordering::Acquire), CAPACITY + 1);
            for expected in 1..=CAPACITY {
                assert_eq!(chan.receive().unwrap(), expected);
            }
            stop.done();
        });
    }

    run(&runtime);
    assert_eq!(sent.load(Ordering::Acquire), CAPACITY + 1);
    assert_eq!(chan.state(), ChannelState::Open);
}

#[test]
fn test_close_wakes_blocked_receivers() {
    const RECEIVERS: usize = 4;

    for chan in [Channel::<u32>::rendezvous(), Channel::buffered(2, true)] {
        let runtime = runtime(2);
        let chan = Arc::new(chan);
        let waiting = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(StopAfter::new(RECEIVERS));

        for _ in 0..RECEIVERS {
            let (chan, waiting, closed, stop) =
                (chan.clone(), waiting.clone(), closed.clone(), stop.clone());
            runtime.spawn(move || {
                waiting.fetch_add(1, Ordering::AcqRel);
                match chan.receive() {
                    Err(ChannelError::Closed) => closed.fetch_add(1, Ordering::AcqRel),
                    other => panic!("receive on closed channel returned {:?}", other),
                };
                stop.done();
            });
        }
        {
            let (chan, waiting) = (chan.clone(), waiting.clone());
            runtime.spawn(move || {
                while waiting.load(Ordering::Acquire) < RECEIVERS {
                    spindle::yield_now().unwrap();
                }
                yield_times(10);
                chan.close();
            });
        }

        run(&runtime);
        assert_eq!(closed.load(Ordering::Acquire), RECEIVERS, "{:?}", chan);
        assert_eq!(chan.state(), ChannelState::Closed);
    }
}

#[test]
fn test_close_wakes_blocked_senders_and_drains() {
    let runtime = runtime(0);
    let chan = Arc::new(Channel::buffered(1, true));
    let rejected = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let stop = Arc::new(StopAfter::new(3));

    // The first sender fills the buffer, the other two block behind it.
    for value in [10u32, 20, 30] {
        let (chan, rejected, stop) = (chan.clone(), rejected.clone(), stop.clone());
        runtime.spawn(move || {
            if let Err(err) = chan.send(value) {
                assert!(err.is_closed());
                rejected.lock().push(err.into_inner());
            }
            stop.done();
        });
    }
    {
        let chan = chan.clone();
        runtime.spawn(move || {
            yield_times(5);
            chan.close();
            assert_eq!(chan.state(), ChannelState::Closing);
        });
    }

    run(&runtime);
    let mut rejected = rejected.lock().clone();
    rejected.sort_unstable();
    assert_eq!(rejected, [20, 30]);
    assert_eq!(chan.state(), ChannelState::Closing);

    // drain what was accepted before the close
    let drainer = common::runtime(0);
    let drained = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let (chan, drained) = (chan.clone(), drained.clone());
        drainer.spawn(move || {
            while let Ok(value) = chan.receive() {
                drained.lock().push(value);
            }
            assert!(chan.send(40).unwrap_err().is_closed());
            spindle::handle().unwrap().stop();
        });
    }

    run(&drainer);
    assert_eq!(*drained.lock(), [10]);
    assert_eq!(chan.state(), ChannelState::Closed);
}

#[test]
fn test_synchronous_buffered_send_waits_for_receive() {
    let runtime = runtime(0);
    let chan = Arc::new(Channel::buffered(4, false));
    let returned = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(StopAfter::new(2));

    {
        let (chan, returned, stop) = (chan.clone(), returned.clone(), stop.clone());
        runtime.spawn(move || {
            chan.send("ping").unwrap();
            returned.store(true, Ordering::Release);
            stop.done();
        });
    }
    {
        let (chan, returned, stop) = (chan.clone(), returned.clone(), stop.clone());
        runtime.spawn(move || {
            yield_times(10);
            // buffered, but not yet consumed
            assert!(!returned.load(Ordering::Acquire));
            assert_eq!(chan.receive().unwrap(), "ping");
            yield_times(2);
            assert!(returned.load(Ordering::Acquire));
            stop.done();
        });
    }

    run(&runtime);
    assert!(returned.load(Ordering::Acquire));
}

#[test]
fn test_rendezvous_send_waits_for_receiver() {
    const VALUES: u64 = 100;

    let runtime = runtime(0);
    let chan = Arc::new(Channel::rendezvous());
    let completed_sends = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(StopAfter::new(2));

    {
        let (chan, completed_sends, stop) = (chan.clone(), completed_sends.clone(), stop.clone());
        runtime.spawn(move || {
            for value in 0..VALUES {
                chan.send(value).unwrap();
                completed_sends.fetch_add(1, Ordering::AcqRel);
            }
            stop.done();
        });
    }
    {
        let (chan, completed_sends, stop) = (chan.clone(), completed_sends.clone(), stop.clone());
        runtime.spawn(move || {
            for expected in 0..VALUES {
                yield_times(3);
                // the sender is stuck until this receive
                assert_eq!(completed_sends.load(Ordering::Acquire), expected as usize);
                assert_eq!(chan.receive().unwrap(), expected);
            }
            stop.done();
        });
    }

    run(&runtime);
    assert_eq!(completed_sends.load(Ordering::Acquire), VALUES as usize);
}

fn producers_and_consumers(chan: Channel<usize>, threads: usize) {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: usize = 250;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let runtime = runtime(threads);
    let chan = Arc::new(chan);
    let producing = Arc::new(AtomicUsize::new(PRODUCERS));
    let received = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(TOTAL)));
    let stop = Arc::new(StopAfter::new(CONSUMERS));

    for p in 0..PRODUCERS {
        let (chan, producing) = (chan.clone(), producing.clone());
        runtime.spawn(move || {
            for i in 0..PER_PRODUCER {
                chan.send(p * PER_PRODUCER + i).unwrap();
            }
            if producing.fetch_sub(1, Ordering::AcqRel) == 1 {
                chan.close();
            }
        });
    }
    for _ in 0..CONSUMERS {
        let (chan, received, stop) = (chan.clone(), received.clone(), stop.clone());
        runtime.spawn(move || {
            let mut mine = Vec::new();
            loop {
                match chan.receive() {
                    Ok(value) => mine.push(value),
                    Err(ChannelError::Closed) => break,
                    Err(err) => panic!("receive failed: {}", err),
                }
            }
            received.lock().extend(mine);
            stop.done();
        });
    }

    run(&runtime);
    let received = received.lock();
    assert_eq!(received.len(), TOTAL, "{:?}", chan);
    let unique: HashSet<_> = received.iter().copied().collect();
    assert_eq!(unique.len(), TOTAL);
    assert!(unique.iter().all(|&value| value < TOTAL));
    assert_eq!(chan.state(), ChannelState::Closed);
}

#[test]
fn test_rendezvous_producers_and_consumers() {
    producers_and_consumers(Channel::rendezvous(), 4);
}

#[test]
fn test_async_buffered_producers_and_consumers() {
    producers_and_consumers(Channel::buffered(8, true), 4);
}

#[test]
fn test_sync_buffered_producers_and_consumers() {
    producers_and_consumers(Channel::buffered(4, false), 4);
}

#[test]
fn test_producers_and_consumers_inline() {
    producers_and_consumers(Channel::buffered(2, true), 0);
}
