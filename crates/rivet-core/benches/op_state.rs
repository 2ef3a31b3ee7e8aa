//! Micro-benchmarks for the operation state machine hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rivet_core::op_state::{action_for, transition, OpEvent, OpState, OpStateMachine};

fn bench_transition_lookup(c: &mut Criterion) {
    c.bench_function("transition_lookup", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for state in [
                OpState::Spooled,
                OpState::Working,
                OpState::CancelSpooled,
                OpState::CancelWorking,
                OpState::Complete,
                OpState::Terminal,
            ] {
                for event in OpEvent::ALL {
                    acc = acc.wrapping_add(transition(black_box(state), black_box(event)) as u32);
                    acc = acc.wrapping_add(action_for(black_box(state)) as u32);
                }
            }
            acc
        })
    });
}

fn bench_happy_path(c: &mut Criterion) {
    c.bench_function("happy_path_cycle", |b| {
        b.iter(|| {
            let mut sm = OpStateMachine::new();
            sm.handle_event(black_box(OpEvent::Submission));
            sm.handle_event(black_box(OpEvent::Completion));
            sm.handle_event(black_box(OpEvent::Notification));
            sm.reset();
            sm
        })
    });
}

criterion_group!(benches, bench_transition_lookup, bench_happy_path);
criterion_main!(benches);
