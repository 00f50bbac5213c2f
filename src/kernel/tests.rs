//! End-to-end scenarios, each run under every context factory.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use crate::activity::{ActivityKind, ExecSpec};
use crate::actor::{ActorId, ActorSpec};
use crate::builder::SimulationBuilder;
use crate::config::SimConfig;
use crate::error::{KernelError, SimError};
use crate::model::LinearModel;
use crate::observer::{ChangeKind, ExitKind, StateChange, Subject};
use crate::platform::{HostId, StaticPlatform};
use crate::simulation::{Simulation, SimulationReport};
use crate::time::VirtualTime;

// ── Helpers ───────────────────────────────────────────────────────────

fn factories() -> [SimConfig; 3] {
    [SimConfig::serial(), SimConfig::threads(), SimConfig::parallel(3)]
}

fn h(i: u32) -> HostId {
    HostId::new(i)
}

fn t(secs: f64) -> VirtualTime {
    VirtualTime::new(secs)
}

fn new_sim(platform: StaticPlatform, config: SimConfig) -> Simulation {
    SimulationBuilder::new(platform)
        .config(config)
        .with_logging()
        .build()
        .unwrap()
}

fn finish_order(sim: &Simulation) -> Vec<u64> {
    sim.change_log()
        .unwrap()
        .changes()
        .iter()
        .filter(|c| matches!(c.kind, ChangeKind::ActorFinished(_)))
        .filter_map(|c| match c.subject {
            Subject::Actor(id) => Some(id.raw()),
            Subject::Activity(_) => None,
        })
        .collect()
}

// ── Rendezvous ────────────────────────────────────────────────────────

#[test]
fn test_async_send_pairs_with_blocking_receive() {
    for config in factories() {
        let got = Arc::new(Mutex::new(None));
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("P", h(0), |me| {
            let mut comm = me.put_async("mbox", "hi".to_string(), 2.0)?;
            me.wait(&mut comm)?;
            assert_eq!(me.now(), VirtualTime::ZERO);
            Ok(())
        })
        .unwrap();
        let sink = Arc::clone(&got);
        sim.spawn("Q", h(0), move |me| {
            let msg: String = me.get("mbox")?;
            *sink.lock() = Some((msg, me.now()));
            Ok(())
        })
        .unwrap();

        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2, "{}", sim.factory_name());
        assert_eq!(*got.lock(), Some(("hi".to_string(), VirtualTime::ZERO)));
        let finishes: Vec<VirtualTime> = sim
            .change_log()
            .unwrap()
            .changes()
            .iter()
            .filter(|c| matches!(c.kind, ChangeKind::ActorFinished(ExitKind::Normal)))
            .map(|c| c.at)
            .collect();
        assert_eq!(finishes, vec![VirtualTime::ZERO, VirtualTime::ZERO]);
        assert_eq!(sim.live_activities(), 0);
    }
}

#[test]
fn test_mailbox_pairs_nth_send_with_nth_receive() {
    for config in factories() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1e6, 0.01), config);
        let sink = Arc::clone(&got);
        // Receives are posted first, sends arrive later.
        sim.spawn("receiver", h(1), move |me| {
            let mut gets = vec![me.get_async("m")?, me.get_async("m")?, me.get_async("m")?];
            me.wait_all(&mut gets)?;
            let mut sink = sink.lock();
            for get in &mut gets {
                sink.extend(get.take_payload::<u32>());
            }
            Ok(())
        })
        .unwrap();
        sim.spawn("sender", h(0), |me| {
            me.sleep_for(1.0)?;
            for v in 1..=3u32 {
                me.put("m", v, 1e3 * v as f64)?;
            }
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
        assert_eq!(*got.lock(), vec![1, 2, 3]);
    }
}

#[test]
fn test_listen_and_front_see_queued_send() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("sender", h(0), |me| me.put("m", 5u64, 8.0)).unwrap();
        sim.spawn("watcher", h(0), |me| {
            assert!(!me.listen("elsewhere")?);
            assert!(me.listen("m")?);
            let peeked = me.front("m")?.expect("a queued send");
            assert_eq!(peeked.kind(), ActivityKind::Comm);
            drop(peeked);
            let v: u64 = me.get("m")?;
            assert_eq!(v, 5);
            assert!(me.front("m")?.is_none());
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(sim.live_activities(), 0);
    }
}

#[test]
fn test_permanent_receiver_gets_eager_send() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1e9, 1.0), config);
        sim.spawn("receiver", h(1), |me| {
            let myself = me.me();
            me.set_receiver("m", Some(&myself))?;
            me.sleep_for(5.0)?;
            assert!(me.listen("m")?);
            let v: u32 = me.get("m")?;
            assert_eq!(v, 7);
            // Already transferred while we slept.
            assert_eq!(me.now(), t(5.0));
            Ok(())
        })
        .unwrap();
        sim.spawn("sender", h(0), |me| {
            me.put("m", 7u32, 0.0)?;
            assert_eq!(me.now(), t(1.0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.end_time, t(5.0));
    }
}

#[test]
fn test_waiting_on_someone_elses_detached_send_is_fatal() {
    let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
    sim.spawn("sender", h(0), |me| me.put_detached("m", 1u8, 8.0)).unwrap();
    sim.spawn("snoop", h(0), |me| {
        let mut peeked = me.front("m")?.expect("a queued send");
        me.wait(&mut peeked)
    })
    .unwrap();
    let err = sim.run().unwrap_err();
    assert!(matches!(err, KernelError::InvalidState { ref actor, .. } if actor.contains("snoop")));
    assert_eq!(sim.live_actors(), 0);
}

#[test]
fn test_detached_send_reaches_receiver() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e3, 1e3, 0.5), config);
        sim.spawn("sender", h(0), |me| {
            me.put_detached("m", "fire".to_string(), 1e3)?;
            // Does not wait for the transfer.
            assert_eq!(me.now(), VirtualTime::ZERO);
            Ok(())
        })
        .unwrap();
        sim.spawn("receiver", h(1), |me| {
            let s: String = me.get("m")?;
            assert_eq!(s, "fire");
            assert_eq!(me.now(), t(1.5));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
    }
}

#[test]
fn test_put_for_times_out_and_withdraws_send() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("impatient", h(0), |me| {
            assert_eq!(me.put_for("m", 1u8, 8.0, 2.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(2.0));
            Ok(())
        })
        .unwrap();
        sim.spawn("late", h(0), |me| {
            me.sleep_for(3.0)?;
            assert!(me.mailbox_empty("m")?);
            // The withdrawn send never pairs with this receive.
            assert_eq!(me.get_for::<u8>("m", 1.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(4.0));
            assert!(me.mailbox_empty("m")?);
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.end_time, t(4.0));
        assert_eq!(sim.live_activities(), 0);
    }
}

#[test]
fn test_get_for_times_out_and_withdraws_receive() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("listener", h(0), |me| {
            assert_eq!(me.get_for::<u32>("m", 1.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(1.0));
            Ok(())
        })
        .unwrap();
        sim.spawn("talker", h(0), |me| {
            me.sleep_for(2.0)?;
            let mut send = me.put_async("m", 3u32, 8.0)?;
            // Nobody is receiving any more: the send is queued, unmatched.
            assert!(me.listen("m")?);
            assert!(!me.test(&mut send)?);
            me.cancel(&mut send)?;
            assert_eq!(me.wait(&mut send), Err(SimError::OperationCanceled));
            assert!(me.mailbox_empty("m")?);
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.end_time, t(2.0));
    }
}

#[test]
fn test_unbound_mailbox_no_longer_starts_sends_early() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1e9, 1.0), config);
        sim.spawn("receiver", h(1), |me| {
            let myself = me.me();
            me.set_receiver("m", Some(&myself))?;
            assert_eq!(me.receiver("m")?, Some(myself.id()));
            me.set_receiver("m", None)?;
            assert_eq!(me.receiver("m")?, None);
            me.sleep_for(5.0)?;
            // Queued as a plain rendezvous: nothing was transferred yet.
            assert!(me.listen("m")?);
            assert!(!me.mailbox_ready("m")?);
            assert_eq!(me.listen_from("m")?, Some(ActorId::new(2)));
            let v: u32 = me.get("m")?;
            assert_eq!(v, 9);
            assert_eq!(me.now(), t(6.0));
            Ok(())
        })
        .unwrap();
        sim.spawn("sender", h(0), |me| {
            me.sleep_for(1.0)?;
            me.put("m", 9u32, 0.0)?;
            assert_eq!(me.now(), t(6.0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.end_time, t(6.0));
    }
}

#[test]
fn test_mailbox_queries_follow_eager_send() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1e9, 1.0), config);
        sim.spawn("receiver", h(1), |me| {
            let myself = me.me();
            me.set_receiver("m", Some(&myself))?;
            me.sleep_for(0.5)?;
            assert!(!me.mailbox_empty("m")?);
            assert!(!me.mailbox_ready("m")?);
            assert_eq!(me.listen_from("m")?, Some(ActorId::new(2)));
            me.sleep_for(1.5)?;
            assert!(me.mailbox_ready("m")?);
            let v: u16 = me.get("m")?;
            assert_eq!((v, me.now()), (4, t(2.0)));
            assert!(me.mailbox_empty("m")?);
            assert!(!me.mailbox_ready("m")?);
            assert_eq!(me.listen_from("m")?, None);

            assert!(me.mailbox_empty("void")?);
            assert!(!me.mailbox_ready("void")?);
            assert_eq!(me.listen_from("void")?, None);
            assert_eq!(me.receiver("void")?, None);
            Ok(())
        })
        .unwrap();
        sim.spawn("sender", h(0), |me| me.put_detached("m", 4u16, 0.0)).unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(sim.live_activities(), 0);
    }
}

#[test]
fn test_unclaimed_sends_are_reclaimed_when_run_ends() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1e9, 1.0), config);
        sim.spawn("forgetful", h(1), |me| {
            let myself = me.me();
            me.set_receiver("m", Some(&myself))?;
            me.sleep_for(2.0)
        })
        .unwrap();
        sim.spawn("sender", h(0), |me| {
            me.put_detached("m", 1u8, 0.0)?;
            me.put_detached("nowhere", 2u8, 8.0)
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.end_time, t(2.0));
        assert_eq!(sim.live_activities(), 0);
        let log = sim.change_log().unwrap();
        let terminal: Vec<(ChangeKind, VirtualTime)> =
            log.completions().map(|c| (c.kind, c.at)).collect();
        assert_eq!(
            terminal,
            vec![
                (ChangeKind::ActivityDone, t(1.0)),
                (ChangeKind::ActivityCanceled, t(2.0)),
            ]
        );
        let destroyed = log
            .changes()
            .iter()
            .filter(|c| c.kind == ChangeKind::ActivityDestroyed)
            .count();
        assert_eq!(destroyed, 2);
    }
}

// ── Waiting ───────────────────────────────────────────────────────────

#[test]
fn test_wait_all_returns_once_at_common_instant() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("waiter", h(0), |me| {
            let mut both = vec![me.exec_async(3e9)?, me.exec_async(3e9)?];
            me.wait_all(&mut both)?;
            assert_eq!(me.now(), t(3.0));
            assert!(both.iter().all(|a| a.outcome() == Some(&Ok(()))));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 1);
        assert_eq!(report.end_time, t(3.0));
        assert_eq!(sim.change_log().unwrap().completions().count(), 2);
    }
}

#[test]
fn test_wait_any_tie_resolves_to_lowest_index() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("waiter", h(0), |me| {
            let mut pair = vec![me.exec_async(2e9)?, me.exec_async(2e9)?];
            assert_eq!(me.wait_any(&mut pair)?, 0);
            pair.swap(0, 1);
            assert_eq!(me.wait_any(&mut pair)?, 0);
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
    }
}

#[test]
fn test_cached_later_outcome_does_not_hide_earlier_completion() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("waiter", h(0), |me| {
            let mut pair = vec![me.exec_async(2e9)?, me.exec_async(2e9)?];
            me.sleep_for(5.0)?;
            // Only the second handle has seen its outcome.
            assert!(me.test(&mut pair[1])?);
            assert!(!pair[0].is_settled());
            assert_eq!(me.test_any(&mut pair)?, Some(0));
            assert!(pair[0].is_settled());
            assert_eq!(me.wait_any(&mut pair)?, 0);

            let mut later = vec![me.exec_async(1e9)?, me.exec_async(1e9)?];
            me.sleep_for(2.0)?;
            assert!(me.test(&mut later[1])?);
            assert_eq!(me.wait_any(&mut later)?, 0);
            assert_eq!(me.now(), t(7.0));
            Ok(())
        })
        .unwrap();
        assert_eq!(sim.run().unwrap().exited_normally, 1);
    }
}

#[test]
fn test_test_any_reports_first_terminal_or_none() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("poller", h(0), |me| {
            let mut set = vec![me.exec_async(4e9)?, me.exec_async(1e9)?];
            assert_eq!(me.test_any(&mut set)?, None);
            let mut none: Vec<_> = Vec::new();
            assert_eq!(me.test_any(&mut none)?, None);
            me.sleep_for(1.0)?;
            assert_eq!(me.test_any(&mut set)?, Some(1));
            assert_eq!(set[1].outcome(), Some(&Ok(())));
            assert!(!set[0].is_settled());
            me.sleep_for(3.0)?;
            assert_eq!(me.test_any(&mut set)?, Some(0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 1);
        assert_eq!(report.end_time, t(4.0));
    }
}

#[test]
fn test_wait_all_for_times_out_before_the_slowest() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("waiter", h(0), |me| {
            let mut set = vec![me.exec_async(1e9)?, me.exec_async(4e9)?];
            assert_eq!(me.wait_all_for(&mut set, 2.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(2.0));
            assert!(me.test(&mut set[0])?);
            assert!(!me.test(&mut set[1])?);
            me.wait_all_for(&mut set, 10.0)?;
            assert_eq!(me.now(), t(4.0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 1);
        assert_eq!(report.end_time, t(4.0));
    }
}

#[test]
fn test_completion_beats_timeout_at_same_instant() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("racer", h(0), |me| {
            let mut exec = me.exec_async(3e9)?;
            me.wait_for(&mut exec, 3.0)?;
            assert_eq!(me.now(), t(3.0));
            Ok(())
        })
        .unwrap();
        assert_eq!(sim.run().unwrap().exited_normally, 1);
    }
}

#[test]
fn test_wait_timeout_leaves_activity_running() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("patient", h(0), |me| {
            let mut exec = me.exec_async(5e9)?;
            assert_eq!(me.wait_for(&mut exec, 2.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(2.0));
            assert!(!me.test(&mut exec)?);
            me.wait(&mut exec)?;
            assert_eq!(me.now(), t(5.0));
            let mut none: Vec<_> = Vec::new();
            assert_eq!(me.wait_any_for(&mut none, 1.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(6.0));
            Ok(())
        })
        .unwrap();
        assert_eq!(sim.run().unwrap().end_time, t(6.0));
    }
}

#[test]
fn test_terminal_state_is_stable() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("observer", h(0), |me| {
            let mut done = me.exec_async(1e9)?;
            let mut canceled = me.exec_async(1e12)?;
            assert!(!me.test(&mut done)?);
            me.wait(&mut done)?;
            me.cancel(&mut canceled)?;
            for _ in 0..3 {
                assert_eq!(me.test(&mut done), Ok(true));
                assert_eq!(me.wait(&mut done), Ok(()));
                assert_eq!(me.test(&mut canceled), Err(SimError::OperationCanceled));
                assert_eq!(me.wait(&mut canceled), Err(SimError::OperationCanceled));
                me.cancel(&mut done)?;
                me.yield_now()?;
            }
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
        let log = sim.change_log().unwrap();
        let terminal: Vec<ChangeKind> = log.completions().map(|c| c.kind).collect();
        assert_eq!(
            terminal,
            vec![ChangeKind::ActivityDone, ChangeKind::ActivityCanceled]
        );
    }
}

#[test]
fn test_activity_deadline_fails_every_waiter() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("bounded", h(0), |me| {
            let mut exec = me.exec_start(ExecSpec::new(1e10).timeout(4.0))?;
            assert_eq!(me.wait(&mut exec), Err(SimError::Timeout));
            assert_eq!(me.now(), t(4.0));
            assert_eq!(me.test(&mut exec), Err(SimError::Timeout));
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
    }
}

// ── Executions ────────────────────────────────────────────────────────

#[test]
fn test_infinite_execution_ends_only_by_timeout_or_cancel() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("runner", h(0), |me| {
            let mut endless = me.exec_async(f64::INFINITY)?;
            assert_eq!(me.wait_for(&mut endless, 3.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(3.0));
            assert!(!me.test(&mut endless)?);
            me.cancel(&mut endless)?;
            assert_eq!(me.test(&mut endless), Err(SimError::OperationCanceled));

            let mut bounded = me.exec_start(ExecSpec::new(f64::INFINITY).timeout(2.0))?;
            assert_eq!(me.wait(&mut bounded), Err(SimError::Timeout));
            assert_eq!(me.now(), t(5.0));

            assert_eq!(me.execute(f64::NAN), Err(SimError::HostFailure));
            assert_eq!(me.now(), t(5.0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 1);
        assert_eq!(report.end_time, t(5.0));
    }
}

#[test]
fn test_suspended_execution_resumes_with_remaining_work() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("pauser", h(0), |me| {
            let mut exec = me.exec_async(4e9)?;
            me.sleep_for(1.0)?;
            me.suspend_activity(&exec)?;
            me.suspend_activity(&exec)?;
            me.sleep_for(5.0)?;
            assert!(!me.test(&mut exec)?);
            me.resume_activity(&exec)?;
            me.wait(&mut exec)?;
            // Three seconds of work were left at the suspension.
            assert_eq!(me.now(), t(9.0));
            me.resume_activity(&exec)?;

            // A frozen activity still hits its deadline.
            let mut bounded = me.exec_start(ExecSpec::new(1e9).timeout(3.0))?;
            me.suspend_activity(&bounded)?;
            assert_eq!(me.wait(&mut bounded), Err(SimError::Timeout));
            assert_eq!(me.now(), t(12.0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 1);
        let log = sim.change_log().unwrap();
        let count = |kind: ChangeKind| log.changes().iter().filter(|c| c.kind == kind).count();
        assert_eq!(count(ChangeKind::ActivitySuspended), 2);
        assert_eq!(count(ChangeKind::ActivityResumed), 1);
    }
}

#[test]
fn test_suspended_transfer_delays_receiver() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1e9, 1.0), config);
        sim.spawn("sender", h(0), |me| {
            let mut send = me.put_async("m", 11u8, 0.0)?;
            me.suspend_activity(&send)?;
            me.sleep_for(3.0)?;
            me.resume_activity(&send)?;
            me.wait(&mut send)?;
            assert_eq!(me.now(), t(4.0));
            Ok(())
        })
        .unwrap();
        sim.spawn("receiver", h(1), |me| {
            let v: u8 = me.get("m")?;
            assert_eq!((v, me.now()), (11, t(4.0)));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.end_time, t(4.0));
    }
}

// ── Mutexes ───────────────────────────────────────────────────────────

#[test]
fn test_mutex_is_granted_in_lock_order() {
    for config in factories() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        let lock = sim.create_mutex();
        for name in ["first", "second", "third"] {
            let sink = Arc::clone(&got);
            sim.spawn(name, h(0), move |me| {
                me.lock(lock)?;
                sink.lock().push((me.name().to_string(), me.now()));
                me.sleep_for(1.0)?;
                me.unlock(lock)
            })
            .unwrap();
        }
        sim.spawn("poller", h(0), move |me| {
            me.sleep_for(0.5)?;
            assert!(!me.try_lock(lock)?);
            me.sleep_for(3.0)?;
            assert!(me.try_lock(lock)?);
            me.unlock(lock)
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 4);
        assert_eq!(
            *got.lock(),
            vec![
                ("first".to_string(), t(0.0)),
                ("second".to_string(), t(1.0)),
                ("third".to_string(), t(2.0)),
            ]
        );
    }
}

#[test]
fn test_killed_actors_let_go_of_mutex() {
    for config in factories() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        let sink = Arc::clone(&got);
        sim.spawn("controller", h(0), move |me| {
            let lock = me.mutex_create()?;
            let mut victims = Vec::new();
            for name in ["holder", "queued", "heir"] {
                let sink = Arc::clone(&sink);
                victims.push(me.spawn(name, me.host(), move |me| {
                    me.lock(lock)?;
                    sink.lock().push((me.name().to_string(), me.now()));
                    me.sleep_for(10.0)?;
                    me.unlock(lock)
                })?);
            }
            me.sleep_for(1.0)?;
            me.kill(&victims[1])?;
            me.sleep_for(1.0)?;
            me.kill(&victims[0])?;
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.killed, 2);
        assert_eq!(report.end_time, t(12.0));
        assert_eq!(
            *got.lock(),
            vec![("holder".to_string(), t(0.0)), ("heir".to_string(), t(2.0))]
        );
    }
}

#[test]
fn test_mutex_misuse_is_fatal() {
    let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
    let lock = sim.create_mutex();
    sim.spawn("owner", h(0), move |me| {
        me.lock(lock)?;
        me.sleep_for(5.0)
    })
    .unwrap();
    sim.spawn("thief", h(0), move |me| {
        me.sleep_for(1.0)?;
        me.unlock(lock)
    })
    .unwrap();
    let err = sim.run().unwrap_err();
    assert!(matches!(err, KernelError::InvalidState { ref actor, .. } if actor.contains("thief")));

    let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
    let lock = sim.create_mutex();
    sim.spawn("greedy", h(0), move |me| {
        me.lock(lock)?;
        me.lock(lock)
    })
    .unwrap();
    let err = sim.run().unwrap_err();
    assert!(matches!(err, KernelError::InvalidState { ref detail, .. } if detail.contains("twice")));
}

#[test]
fn test_deadlock_report_names_the_mutex() {
    let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
    let lock = sim.create_mutex();
    sim.spawn("hog", h(0), move |me| {
        me.lock(lock)?;
        me.get::<u8>("never").map(|_| ())
    })
    .unwrap();
    sim.spawn("starved", h(0), move |me| me.lock(lock)).unwrap();
    let report = sim.run().unwrap();
    assert_eq!(report.killed, 2);
    assert!(report
        .deadlocked
        .iter()
        .any(|line| line.starts_with("'starved' (A2) blocked (lock M1)")));
}

// ── Actor control ─────────────────────────────────────────────────────

#[test]
fn test_join_timeout_leaves_target_running() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("P", h(0), |me| {
            let q = me.spawn("Q", me.host(), |me| me.sleep_for(10.0))?;
            assert_eq!(me.join_for(&q, 5.0), Err(SimError::Timeout));
            assert_eq!(me.now(), t(5.0));
            assert!(me.is_alive(&q)?);
            me.join(&q)?;
            assert_eq!(me.now(), t(10.0));
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.end_time, t(10.0));
    }
}

#[test]
fn test_killing_comm_owner_cancels_peer() {
    for config in factories() {
        let seen = Arc::new(Mutex::new(None));
        let mut sim = new_sim(StaticPlatform::uniform(2, 1e9, 1.0, 0.0), config);
        let sink = Arc::clone(&seen);
        sim.spawn("controller", h(0), move |me| {
            let sender = me.spawn("sender", h(0), |me| me.put("m", 0u8, 1e6))?;
            let sink = Arc::clone(&sink);
            me.spawn("receiver", h(1), move |me| {
                let r = me.get::<u8>("m").map(|_| ());
                *sink.lock() = Some((r, me.now()));
                Ok(())
            })?;
            me.sleep_for(1.0)?;
            me.kill(&sender)?;
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(*seen.lock(), Some((Err(SimError::OperationCanceled), t(1.0))));
        assert_eq!(report.killed, 1);
        assert_eq!(report.exited_normally, 2);
    }
}

#[test]
fn test_spawned_actors_run_in_same_instant_in_order() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("P", h(0), |me| {
            me.spawn("C1", me.host(), |_| Ok(()))?;
            me.spawn("C2", me.host(), |_| Ok(()))?;
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.end_time, VirtualTime::ZERO);
        assert_eq!(report.rounds, 3);
        // C1 and C2 each run before P resumes from the spawn.
        assert_eq!(finish_order(&sim), vec![2, 3, 1]);
    }
}

#[test]
fn test_suspended_actor_waits_for_resume() {
    for config in factories() {
        let woke = Arc::new(Mutex::new(None));
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        let sink = Arc::clone(&woke);
        sim.spawn("controller", h(0), move |me| {
            let sink = Arc::clone(&sink);
            let worker = me.spawn("worker", me.host(), move |me| {
                me.sleep_for(1.0)?;
                *sink.lock() = Some(me.now());
                Ok(())
            })?;
            me.suspend(&worker)?;
            me.sleep_for(5.0)?;
            me.resume(&worker)?;
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
        assert_eq!(*woke.lock(), Some(t(5.0)));
    }
}

#[test]
fn test_self_suspend_until_resumed() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("controller", h(0), |me| {
            let sleeper = me.spawn("sleeper", me.host(), |me| {
                me.suspend_self()?;
                assert_eq!(me.now(), t(2.0));
                Ok(())
            })?;
            me.sleep_for(2.0)?;
            me.resume(&sleeper)?;
            me.join(&sleeper)
        })
        .unwrap();
        assert_eq!(sim.run().unwrap().exited_normally, 2);
    }
}

#[test]
fn test_kill_time_and_exit_handlers() {
    for config in factories() {
        let failed = Arc::new(AtomicBool::new(false));
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        let flag = Arc::clone(&failed);
        sim.spawn_with(
            ActorSpec::new("doomed", h(0), move |me| {
                let flag = Arc::clone(&flag);
                me.on_exit(move |failed| flag.store(failed, Ordering::SeqCst));
                me.sleep_for(10.0)
            })
            .kill_at(t(2.0)),
        )
        .unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.killed, 1);
        assert_eq!(report.end_time, t(2.0));
        assert!(failed.load(Ordering::SeqCst));
    }
}

#[test]
fn test_kill_time_can_be_cleared() {
    let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
    sim.spawn("controller", h(0), |me| {
        let target = me.spawn("target", me.host(), |me| me.sleep_for(3.0))?;
        me.set_kill_time(&target, Some(t(1.0)))?;
        me.set_kill_time(&target, None)?;
        me.join(&target)
    })
    .unwrap();
    let report = sim.run().unwrap();
    assert_eq!(report.killed, 0);
    assert_eq!(report.end_time, t(3.0));
}

#[test]
fn test_daemons_are_killed_when_regular_actors_finish() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn_with(
            ActorSpec::new("ticker", h(0), |me| loop {
                me.sleep_for(1.0)?;
            })
            .daemon(),
        )
        .unwrap();
        sim.spawn("main", h(0), |me| me.sleep_for(3.5)).unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.end_time, t(3.5));
        assert_eq!(report.exited_normally, 1);
        assert_eq!(report.killed, 1);
    }
}

#[test]
fn test_deadlock_is_reported_and_broken() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("lonely", h(0), |me| me.get::<u8>("nobody").map(|_| ()))
            .unwrap();
        let report: SimulationReport = sim.run().unwrap();
        assert_eq!(report.killed, 1);
        assert_eq!(report.deadlocked.len(), 1);
        assert!(report.deadlocked[0].starts_with("'lonely' (A1) blocked"));
    }
}

#[test]
fn test_kill_all_and_exit() {
    let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
    sim.spawn("reaper", h(0), |me| {
        for i in 0..3 {
            me.spawn(&format!("victim{i}"), me.host(), |me| me.sleep_for(100.0))?;
        }
        me.sleep_for(1.0)?;
        me.kill_all()?;
        me.exit()
    })
    .unwrap();
    let report = sim.run().unwrap();
    assert_eq!(report.killed, 4);
    assert_eq!(report.end_time, t(1.0));
}

#[test]
fn test_migration_uses_new_host_speed() {
    for config in factories() {
        let mut b = StaticPlatform::builder();
        let slow = b.host("slow", 1e9);
        let fast = b.host("fast", 4e9);
        let mut sim = new_sim(b.build(), config);
        sim.spawn("nomad", slow, move |me| {
            me.migrate_self(fast)?;
            assert_eq!(me.host(), fast);
            me.execute(4e9)?;
            assert_eq!(me.now(), t(1.0));
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
        let migrated = sim
            .change_log()
            .unwrap()
            .changes()
            .iter()
            .any(|c| c.kind == ChangeKind::ActorMigrated { to: fast });
        assert!(migrated);
    }
}

#[test]
fn test_panicking_body_aborts_run() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("fine", h(0), |me| me.sleep_for(100.0)).unwrap();
        sim.spawn("bad", h(0), |_| -> crate::error::SimResult<()> { panic!("boom") })
            .unwrap();
        match sim.run() {
            Err(KernelError::ActorPanicked { actor, message }) => {
                assert_eq!(actor, "'bad' (A2)");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(sim.live_actors(), 0);
    }
}

// ── Host availability ─────────────────────────────────────────────────

#[test]
fn test_host_failure_kills_and_restarts() {
    for config in factories() {
        let starts = Arc::new(AtomicUsize::new(0));
        let mut model = LinearModel::default();
        model
            .schedule_host_off(h(1), t(2.0))
            .schedule_host_on(h(1), t(5.0));
        let mut sim = SimulationBuilder::new(StaticPlatform::uniform(2, 1e9, 1e9, 0.0))
            .config(config)
            .model(model)
            .build()
            .unwrap();
        sim.spawn("remote-exec", h(0), |me| {
            let mut exec = me.exec_start(ExecSpec::new(1e10).on_host(h(1)))?;
            assert_eq!(me.wait(&mut exec), Err(SimError::HostFailure));
            assert_eq!(me.now(), t(2.0));
            Ok(())
        })
        .unwrap();
        sim.spawn("resident", h(1), |me| me.sleep_for(100.0)).unwrap();
        let counter = Arc::clone(&starts);
        sim.spawn_with(
            ActorSpec::new("phoenix", h(1), move |me| {
                counter.fetch_add(1, Ordering::SeqCst);
                me.sleep_for(10.0)
            })
            .auto_restart(),
        )
        .unwrap();

        let report = sim.run().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(report.end_time, t(15.0));
        assert_eq!(report.exited_normally, 2);
        assert_eq!(report.killed, 2);
    }
}

#[test]
fn test_spawn_on_off_host_fails() {
    let mut model = LinearModel::default();
    model.schedule_host_off(h(1), t(0.5));
    let mut sim = SimulationBuilder::new(StaticPlatform::uniform(2, 1e9, 1e9, 0.0))
        .model(model)
        .build()
        .unwrap();
    sim.spawn("spawner", h(0), |me| {
        me.sleep_for(1.0)?;
        let r = me.spawn("late", h(1), |_| Ok(()));
        assert_eq!(r.err(), Some(SimError::HostFailure));
        Ok(())
    })
    .unwrap();
    assert_eq!(sim.run().unwrap().exited_normally, 1);
}

// ── Driver ────────────────────────────────────────────────────────────

#[test]
fn test_run_until_pauses_and_resumes() {
    for config in factories() {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), config);
        sim.spawn("sleeper", h(0), |me| me.sleep_for(10.0)).unwrap();
        assert_eq!(sim.run_until(t(4.0)).unwrap(), None);
        assert_eq!(sim.now(), t(4.0));
        assert_eq!(sim.live_actors(), 1);
        let report = sim.run_until(t(20.0)).unwrap().expect("finished");
        assert_eq!(report.end_time, t(10.0));
        assert_eq!(report.exited_normally, 1);
    }
}

// ── Determinism ───────────────────────────────────────────────────────

fn master_worker(config: SimConfig) -> (u64, VirtualTime, Vec<StateChange>) {
    let mut sim = new_sim(StaticPlatform::uniform(4, 1e9, 1e8, 1e-3), config);
    sim.spawn("master", h(0), |me| {
        let mut sends = Vec::new();
        for task in 1..=6u32 {
            sends.push(me.put_async("tasks", task, 1e5)?);
        }
        let mut sum = 0;
        for _ in 0..6 {
            sum += me.get::<u32>("results")?;
        }
        assert_eq!(sum, 42);
        me.wait_all(&mut sends)?;
        for _ in 0..3 {
            me.put("tasks", u32::MAX, 1.0)?;
        }
        Ok(())
    })
    .unwrap();
    for w in 1..=3 {
        sim.spawn(&format!("worker{w}"), h(w), |me| loop {
            let task: u32 = me.get("tasks")?;
            if task == u32::MAX {
                return Ok(());
            }
            me.execute(task as f64 * 1e8)?;
            me.put("results", task * 2, 1e4)?;
        })
        .unwrap();
    }
    sim.spawn_with(
        ActorSpec::new("ticker", h(0), |me| loop {
            me.sleep_for(0.25)?;
        })
        .daemon(),
    )
    .unwrap();
    sim.spawn("quitter", h(2), |me| {
        let mut exec = me.exec_async(1e12)?;
        let _ = me.wait_for(&mut exec, 0.1);
        me.cancel(&mut exec)
    })
    .unwrap();

    let report = sim.run().unwrap();
    assert_eq!(report.exited_normally, 5);
    let log = sim.change_log().unwrap();
    (
        log.log_hash(),
        report.end_time,
        log.completions().copied().collect(),
    )
}

#[test]
fn test_serial_and_parallel_runs_are_identical() {
    let reference = master_worker(SimConfig::serial());
    for config in [
        SimConfig::threads(),
        SimConfig::parallel(2),
        SimConfig::parallel(4).with_parallel_threshold(1),
    ] {
        assert_eq!(master_worker(config), reference);
    }
    assert_eq!(master_worker(SimConfig::serial()), reference);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Random lifetimes and kill times never reschedule a finished
    /// context; the run would abort with `InvalidState` if they did.
    #[test]
    fn prop_no_actor_runs_after_finishing(
        plan in proptest::collection::vec((0.0f64..5.0, proptest::option::of(0.0f64..5.0)), 1..8)
    ) {
        let mut sim = new_sim(StaticPlatform::single_host(1e9), SimConfig::serial());
        let steps = plan.clone();
        sim.spawn("controller", h(0), move |me| {
            let host = me.host();
            let mut victims = Vec::new();
            for (i, (life, _)) in steps.iter().enumerate() {
                let life = *life;
                victims.push(me.spawn(&format!("w{i}"), host, move |me| {
                    me.sleep_for(life)?;
                    me.yield_now()
                })?);
            }
            let mut kills: Vec<(f64, usize)> = steps
                .iter()
                .enumerate()
                .filter_map(|(i, (_, kill))| kill.map(|k| (k, i)))
                .collect();
            kills.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (at, i) in kills {
                me.sleep_until(VirtualTime::new(at))?;
                me.kill(&victims[i])?;
            }
            Ok(())
        })
        .unwrap();
        let report = sim.run().unwrap();
        prop_assert_eq!(report.exited_normally + report.killed, plan.len() + 1);
        prop_assert_eq!(sim.live_actors(), 0);
        prop_assert!(report.deadlocked.is_empty());
    }
}
