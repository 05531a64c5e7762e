use criterion::{black_box, criterion_group, criterion_main, Criterion};

use quiesce::sync::{Map, Queue, RingMrmw, Snzi};
use quiesce::{Rcu, RcuGuard};

fn rcu_enter_exit(c: &mut Criterion) {
    let rcu = Rcu::new();
    c.bench_function("rcu enter/exit", |b| {
        b.iter(|| {
            let guard = RcuGuard::new(&rcu);
            black_box(guard.epoch());
        });
    });
}

fn queue_push_pop(c: &mut Criterion) {
    let queue: Queue<u64> = Queue::new();
    c.bench_function("queue push+pop", |b| {
        b.iter(|| {
            queue.push(black_box(1));
            black_box(queue.try_pop());
        });
    });
}

fn map_mixed(c: &mut Criterion) {
    let map: Map<u64, u64> = Map::with_capacity(1 << 16);
    for i in 0..10_000u64 {
        map.insert(i, i).unwrap();
    }
    let mut i = 0u64;
    c.bench_function("map insert+find+remove", |b| {
        b.iter(|| {
            let key = 10_000 + (i % 1_000);
            i += 1;
            map.insert(key, i).unwrap();
            black_box(map.find(&key));
            map.remove(&key);
        });
    });

    let mut key = 0u64;
    c.bench_function("map find hit", |b| {
        b.iter(|| {
            key = (key + 1) % 10_000;
            black_box(map.find(&key));
        });
    });
}

fn ring_push_pop(c: &mut Criterion) {
    let ring: RingMrmw<u64, 64> = RingMrmw::new();
    c.bench_function("ring mrmw push+pop", |b| {
        b.iter(|| {
            ring.push(black_box(1));
            black_box(ring.pop());
        });
    });
}

fn snzi_inc_dec(c: &mut Criterion) {
    let snzi: Snzi<8> = Snzi::new();
    c.bench_function("snzi inc+dec", |b| {
        b.iter(|| {
            snzi.inc();
            black_box(snzi.test());
            snzi.dec();
        });
    });
}

criterion_group!(
    benches,
    rcu_enter_exit,
    queue_push_pop,
    map_mixed,
    ring_push_pop,
    snzi_inc_dec
);
criterion_main!(benches);
