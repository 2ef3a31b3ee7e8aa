//! End-to-end smoke test: reactor + executor round trip.
//!
//! Spawns one task that runs a NOP and then a short TIMER through a
//! resource, awaiting each completion, then winds the engine down in
//! order: stop, drain, shutdown. Exercises the whole pipeline on the real
//! io_uring backend when the kernel allows it, the loopback otherwise.
//!
//! Knobs: RVT_LOG_LEVEL, RVT_SQ_ENTRIES, RVT_MAX_OPS, RVT_QUANTUM_US, ...

use std::time::Duration;

use rivet_core::{rerror, rinfo, RivetError, RivetResult};
use rivet_exec::{Awaitable, Executor, ExecutorConfig, TaskPoll, TaskPriority};
use rivet_reactor::{OpHandle, Reactor, ReactorConfig, Resource};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn make_reactor(config: ReactorConfig) -> Reactor {
            use rivet_reactor::UringBackend;
            match UringBackend::from_env() {
                Ok(backend) => {
                    rinfo!("backend: io_uring");
                    Reactor::new(Box::new(backend), config)
                }
                Err(e) => {
                    rinfo!("io_uring unavailable ({}), using loopback", e);
                    Reactor::with_loopback(config).0
                }
            }
        }
    } else {
        fn make_reactor(config: ReactorConfig) -> Reactor {
            rinfo!("backend: loopback");
            Reactor::with_loopback(config).0
        }
    }
}

enum Stage {
    Start,
    AwaitNop { res: Resource, h: OpHandle, aw: Awaitable },
    AwaitTimer { res: Resource, h: OpHandle, aw: Awaitable },
}

fn run() -> RivetResult<()> {
    let reactor = make_reactor(ReactorConfig::from_env());
    reactor.start()?;
    let exec = Executor::new(ExecutorConfig::from_env());

    let task = {
        let reactor = reactor.clone();
        let mut stage = Stage::Start;
        exec.spawn(TaskPriority::Normal, move |cx| {
            loop {
                stage = match std::mem::replace(&mut stage, Stage::Start) {
                    Stage::Start => {
                        let res = Resource::new(&reactor);
                        let h = match res.nop() {
                            Ok(h) => h,
                            Err(e) => return TaskPoll::Complete(Err(e)),
                        };
                        Stage::AwaitNop { res, h, aw: Awaitable::new() }
                    }
                    Stage::AwaitNop { res, h, aw } => {
                        if !aw.wait_op(&h, cx) {
                            stage = Stage::AwaitNop { res, h, aw };
                            return TaskPoll::Pending;
                        }
                        match h.try_result() {
                            Some(Ok(v)) => rinfo!("nop completed: {}", v),
                            Some(Err(e)) => return TaskPoll::Complete(Err(e)),
                            None => return TaskPoll::Complete(Err(RivetError::StaleHandle)),
                        }
                        let timer = match res.timer(Duration::from_millis(25)) {
                            Ok(h) => h,
                            Err(e) => return TaskPoll::Complete(Err(e)),
                        };
                        Stage::AwaitTimer { res, h: timer, aw: Awaitable::new() }
                    }
                    Stage::AwaitTimer { res, h, aw } => {
                        if !aw.wait_op(&h, cx) {
                            stage = Stage::AwaitTimer { res, h, aw };
                            return TaskPoll::Pending;
                        }
                        return match h.try_result() {
                            Some(Ok(_)) => {
                                rinfo!("timer fired");
                                TaskPoll::Complete(Ok(()))
                            }
                            Some(Err(e)) => TaskPoll::Complete(Err(e)),
                            None => TaskPoll::Complete(Err(RivetError::StaleHandle)),
                        };
                    }
                };
            }
        })
    };

    let done = task.completion().clone();
    drop(task);

    while !done.is_set() {
        reactor.step()?;
        exec.run();
        std::thread::sleep(Duration::from_millis(1));
    }

    reactor.stop();
    while !reactor.is_drained() {
        reactor.step()?;
    }
    reactor.shutdown()?;
    rinfo!("smoke test passed");
    Ok(())
}

fn main() {
    rivet_core::rlog::init();
    if let Err(e) = run() {
        rerror!("smoke test failed: {}", e);
        std::process::exit(1);
    }
}
