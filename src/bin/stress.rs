//! Endless mixed stress of the queue, map and ring.
//!
//! Usage: stress [thread-count] [iterations]
//!
//! Runs rounds forever; a wedged round or a failed assertion is the signal.

use std::env;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use quiesce::sync::{Map, Queue, RingMrmw};

fn main() {
    let mut args = env::args().skip(1);
    let threads: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(4);
    let iterations: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);

    println!("stress: {} threads, {} iterations per round", threads, iterations);

    for round in 1u64.. {
        queue_round(threads, iterations);
        map_round(threads, iterations);
        ring_round(threads, iterations);
        println!("round {} ok", round);
    }
}

fn queue_round(threads: usize, iterations: u64) {
    let queue: Queue<u64> = Queue::new();
    let total = threads as u64 * iterations;
    let popped = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for id in 0..threads as u64 {
            let queue = &queue;
            scope.spawn(move || {
                for i in 0..iterations {
                    queue.push(id * iterations + i);
                }
            });
        }
        for _ in 0..threads {
            let queue = &queue;
            let popped = &popped;
            scope.spawn(move || {
                while (popped.load(Relaxed) as u64) < total {
                    if queue.try_pop().is_some() {
                        popped.fetch_add(1, Relaxed);
                    }
                }
            });
        }
    });

    assert!(queue.try_pop().is_none());
}

fn map_round(threads: usize, iterations: u64) {
    let map: Map<u64, u64> = Map::new();

    std::thread::scope(|scope| {
        for id in 0..threads as u64 {
            let map = &map;
            scope.spawn(move || {
                let base = id * iterations;
                for i in 0..iterations {
                    assert!(map.insert(base + i, i).unwrap());
                }
                for i in 0..iterations {
                    assert_eq!(map.find(&(base + i)), Some(i));
                }
                for i in 0..iterations {
                    assert_eq!(map.remove(&(base + i)), Some(i));
                }
            });
        }
    });

    assert_eq!(map.len(), 0);
}

fn ring_round(threads: usize, iterations: u64) {
    let ring: RingMrmw<u64, 64> = RingMrmw::new();
    let total = threads as u64 * iterations;
    let popped = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for id in 0..threads as u64 {
            let ring = &ring;
            scope.spawn(move || {
                for i in 1..=iterations {
                    while !ring.push(id * iterations + i) {
                        std::hint::spin_loop();
                    }
                }
            });
        }
        for _ in 0..threads {
            let ring = &ring;
            let popped = &popped;
            scope.spawn(move || {
                while (popped.load(Relaxed) as u64) < total {
                    if ring.pop().is_some() {
                        popped.fetch_add(1, Relaxed);
                    }
                }
            });
        }
    });

    assert!(ring.is_empty());
}
