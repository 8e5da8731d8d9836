//! Tests for run dispatch: freezing, traps, exceptions, halts, and errors

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tether_core::backend::replay::{Exhausted, ReplayBackend};
use tether_core::backend::NativeEvent;
use tether_core::error::{BackendError, CoreError};
use tether_core::events::{ErrorKind, Event, EventKind, ExceptionKind};
use tether_core::memory::MemoryProtect;
use tether_core::types::{Address, Architecture, RegisterBlock, RegsX64};
use tether_core::{EntityKind, Handle, RunCtrls, RunPhase, Session, SessionConfig};

const PID: u32 = 200;
const MAIN_TID: u32 = 201;
const WORKER_TID: u32 = 202;
const CODE: u64 = 0x40_1000;
const PROLOGUE: [u8; 4] = [0x55, 0x48, 0x89, 0xe5];

struct Fixture
{
    session: Session<ReplayBackend>,
    process: Handle,
    main: Handle,
    worker: Handle,
}

fn fixture() -> Fixture
{
    let backend = ReplayBackend::new();
    backend.map_memory(PID, Address::new(CODE), PROLOGUE.to_vec());
    backend.push_run(vec![
        NativeEvent::CreateProcess {
            pid: PID,
            arch: Architecture::X86_64,
            ext: Default::default(),
        },
        NativeEvent::CreateThread {
            pid: PID,
            tid: MAIN_TID,
            ext: Default::default(),
        },
        NativeEvent::CreateThread {
            pid: PID,
            tid: WORKER_TID,
            ext: Default::default(),
        },
    ]);
    let session = Session::new(backend, SessionConfig::default()).unwrap();
    session.attach_process(PID).unwrap();
    session.run(&RunCtrls::default()).unwrap();

    Fixture {
        process: session.find(EntityKind::Process, u64::from(PID)).unwrap(),
        main: session.find(EntityKind::Thread, u64::from(MAIN_TID)).unwrap(),
        worker: session.find(EntityKind::Thread, u64::from(WORKER_TID)).unwrap(),
        session,
    }
}

fn trap_at(tid: u32, address: u64) -> NativeEvent
{
    NativeEvent::Trap {
        pid: PID,
        tid,
        address: Address::new(address),
    }
}

fn segfault() -> NativeEvent
{
    NativeEvent::Exception {
        pid: PID,
        tid: MAIN_TID,
        address: Address::new(0x10),
        code: 0xc000_0005,
        signo: 11,
        kind: ExceptionKind::MemoryRead,
    }
}

fn wait_for_phase(session: &Session<ReplayBackend>, phase: RunPhase)
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.run_phase() != phase {
        assert!(Instant::now() < deadline, "run never reached {phase:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_run_without_target_reports_not_attached()
{
    let session = Session::new(ReplayBackend::new(), SessionConfig::default()).unwrap();
    let events = session.run(&RunCtrls::default()).unwrap();

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events.as_slice()[0],
        Event::Error {
            kind: ErrorKind::NotAttached,
            ..
        }
    ));
    assert!(session.backend().run_controls().is_empty());
}

#[test]
fn test_stale_handle_in_controls_rejects_run()
{
    let f = fixture();
    let before = f.session.backend().run_controls().len();
    let bogus = Handle::from_parts(f.main.index(), f.main.generation() + 1);

    let events = f.session.run(&RunCtrls::default().resume_threads([bogus])).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events.as_slice()[0],
        Event::Error {
            kind: ErrorKind::InvalidHandle,
            ..
        }
    ));
    assert_eq!(f.session.backend().run_controls().len(), before);
}

#[test]
fn test_process_handle_where_thread_expected_rejects_run()
{
    let f = fixture();
    let events = f.session.run(&RunCtrls::default().single_step(f.process)).unwrap();
    assert_eq!(events.of_kind(EventKind::Error).count(), 1);
}

#[test]
fn test_resume_threads_freezes_the_rest()
{
    let f = fixture();
    f.session.backend().push_run(vec![]);
    f.session.run(&RunCtrls::default().resume_threads([f.main])).unwrap();

    assert!(!f.session.is_frozen(f.main).unwrap());
    assert!(f.session.is_frozen(f.worker).unwrap());
    assert!(!f.session.is_frozen(f.process).unwrap());

    let ctrls = f.session.backend().run_controls().pop().unwrap();
    assert_eq!(ctrls.resume.iter().map(|t| t.id).collect::<Vec<_>>(), vec![u64::from(MAIN_TID)]);
    assert_eq!(ctrls.frozen.iter().map(|t| t.id).collect::<Vec<_>>(), vec![u64::from(WORKER_TID)]);
}

#[test]
fn test_freeze_threads_and_process_freeze_mark()
{
    let f = fixture();
    f.session.backend().push_run(vec![]);
    f.session
        .run(&RunCtrls::default().freeze_threads([f.main, f.worker]))
        .unwrap();

    assert!(f.session.is_frozen(f.main).unwrap());
    assert!(f.session.is_frozen(f.worker).unwrap());
    assert!(f.session.is_frozen(f.process).unwrap());

    f.session.backend().push_run(vec![]);
    f.session.run(&RunCtrls::default()).unwrap();
    assert!(!f.session.is_frozen(f.main).unwrap());
    assert!(!f.session.is_frozen(f.process).unwrap());
}

#[test]
fn test_resume_processes_runs_all_their_threads()
{
    let f = fixture();
    f.session.backend().push_run(vec![]);
    f.session.run(&RunCtrls::default().resume_processes([f.process])).unwrap();

    let ctrls = f.session.backend().run_controls().pop().unwrap();
    assert_eq!(ctrls.resume.len(), 2);
    assert!(ctrls.frozen.is_empty());
}

#[test]
fn test_single_step_freezes_other_threads()
{
    let f = fixture();
    f.session.backend().push_run(vec![trap_at(WORKER_TID, CODE + 4)]);
    let events = f
        .session
        .run(&RunCtrls::default().resume_processes([f.process]).single_step(f.worker))
        .unwrap();

    assert!(f.session.is_frozen(f.main).unwrap());
    assert!(!f.session.is_frozen(f.worker).unwrap());
    assert_eq!(
        events.as_slice(),
        &[Event::SingleStep {
            process: f.process,
            thread: f.worker,
            address: Address::new(CODE + 4),
        }]
    );

    let ctrls = f.session.backend().run_controls().pop().unwrap();
    assert_eq!(ctrls.single_step.map(|t| t.id), Some(u64::from(WORKER_TID)));
}

#[test]
fn test_unrequested_trap_is_reported_as_trap()
{
    let f = fixture();
    f.session.backend().push_run(vec![trap_at(MAIN_TID, 0x40_2000)]);
    let events = f.session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.as_slice()[0].kind(), EventKind::Trap);
}

#[test]
fn test_trap_is_planted_and_removed()
{
    let f = fixture();
    f.session.backend().set_registers(
        MAIN_TID,
        RegisterBlock::X64(RegsX64 {
            rip: CODE + 1,
            ..RegsX64::default()
        }),
    );
    f.session.backend().push_run(vec![trap_at(MAIN_TID, CODE)]);

    let events = f
        .session
        .run(&RunCtrls::default().with_trap(f.process, Address::new(CODE), Some(7)))
        .unwrap();

    assert_eq!(
        events.as_slice(),
        &[Event::Breakpoint {
            process: f.process,
            thread: f.main,
            address: Address::new(CODE),
            trap_id: Some(7),
        }]
    );
    assert_eq!(
        f.session.backend().memory(PID, Address::new(CODE), 4),
        Some(PROLOGUE.to_vec())
    );
    let ctrls = f.session.backend().run_controls().pop().unwrap();
    assert_eq!(ctrls.traps.len(), 1);
    assert_eq!(ctrls.traps[0].address, Address::new(CODE));

    // The thread re-executes the original instruction.
    assert_eq!(f.session.read_ip(f.main).unwrap(), Address::new(CODE));
}

#[test]
fn test_duplicate_traps_are_planted_once()
{
    let f = fixture();
    f.session.backend().push_run(vec![]);
    f.session
        .run(
            &RunCtrls::default()
                .with_trap(f.process, Address::new(CODE), Some(1))
                .with_trap(f.process, Address::new(CODE), Some(2)),
        )
        .unwrap();

    let ctrls = f.session.backend().run_controls().pop().unwrap();
    assert_eq!(ctrls.traps.len(), 1);
    assert_eq!(
        f.session.backend().memory(PID, Address::new(CODE), 4),
        Some(PROLOGUE.to_vec())
    );
}

#[test]
fn test_pre_existing_trap_is_left_alone()
{
    let f = fixture();
    let patched = Address::new(CODE + 0x100);
    f.session.backend().map_memory(PID, patched, vec![0xcc, 0x90]);
    f.session.backend().push_run(vec![trap_at(MAIN_TID, CODE + 0x100)]);

    let events = f
        .session
        .run(&RunCtrls::default().with_trap(f.process, patched, Some(3)))
        .unwrap();

    assert_eq!(events.as_slice()[0].kind(), EventKind::Breakpoint);
    assert_eq!(f.session.backend().memory(PID, patched, 2), Some(vec![0xcc, 0x90]));
    assert!(f.session.backend().run_controls().pop().unwrap().traps.is_empty());
    assert_eq!(f.session.backend().register_writes(), 0);
}

#[test]
fn test_unreadable_trap_address_is_skipped()
{
    let f = fixture();
    f.session.backend().push_run(vec![]);
    let events = f
        .session
        .run(&RunCtrls::default().with_trap(f.process, Address::new(0xdead_0000), None))
        .unwrap();

    assert!(events.is_empty());
    assert!(f.session.backend().run_controls().pop().unwrap().traps.is_empty());
}

#[test]
fn test_exception_is_redelivered_unless_ignored()
{
    let f = fixture();

    f.session.backend().push_run(vec![segfault()]);
    let events = f.session.run(&RunCtrls::default()).unwrap();
    assert!(matches!(
        &events.as_slice()[0],
        Event::Exception {
            repeated: false,
            kind: ExceptionKind::MemoryRead,
            ..
        }
    ));

    f.session.backend().push_run(vec![segfault()]);
    let events = f.session.run(&RunCtrls::default()).unwrap();
    let ctrls = f.session.backend().run_controls().pop().unwrap();
    let redelivered = ctrls.redeliver_exception.unwrap();
    assert_eq!(redelivered.code, 0xc000_0005);
    assert_eq!(redelivered.thread.id, u64::from(MAIN_TID));
    assert!(matches!(&events.as_slice()[0], Event::Exception { repeated: true, .. }));

    f.session.backend().push_run(vec![segfault()]);
    let events = f
        .session
        .run(&RunCtrls::default().ignoring_previous_exception())
        .unwrap();
    assert!(f.session.backend().run_controls().pop().unwrap().redeliver_exception.is_none());
    assert!(matches!(&events.as_slice()[0], Event::Exception { repeated: false, .. }));

    // Consumed either way: a clean run leaves nothing to redeliver.
    f.session.backend().push_run(vec![]);
    f.session.run(&RunCtrls::default()).unwrap();
    f.session.backend().push_run(vec![]);
    f.session.run(&RunCtrls::default()).unwrap();
    let ctrls = f.session.backend().run_controls().pop().unwrap();
    assert!(ctrls.redeliver_exception.is_none());
}

#[test]
fn test_process_exit_mid_run_is_reported_once()
{
    let f = fixture();
    f.session.backend().push_run(vec![
        NativeEvent::ExitThread {
            pid: PID,
            tid: WORKER_TID,
            code: 0,
        },
        NativeEvent::ExitProcess { pid: PID, code: 1 },
    ]);

    let events = f
        .session
        .run(
            &RunCtrls::default()
                .resume_processes([f.process])
                .ignoring_previous_exception(),
        )
        .unwrap();

    let exits: Vec<&Event> = events.of_kind(EventKind::ExitProcess).collect();
    assert_eq!(exits, vec![&Event::ExitProcess { process: f.process, code: 1 }]);
    assert_eq!(events.of_kind(EventKind::ExitThread).count(), 2);
    assert!(!f.session.object_exists(f.process));
    assert_eq!(f.session.find(EntityKind::Process, u64::from(PID)), None);
    assert_eq!(f.session.find(EntityKind::Thread, u64::from(MAIN_TID)), None);
    assert!(f.session.all_processes().is_empty());

    // Nothing left to run.
    let events = f.session.run(&RunCtrls::default()).unwrap();
    assert!(matches!(
        &events.as_slice()[0],
        Event::Error {
            kind: ErrorKind::NotAttached,
            ..
        }
    ));
}

#[test]
fn test_session_is_shareable_across_threads()
{
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Session<ReplayBackend>>();
}

#[test]
fn test_backend_failure_is_folded_into_events()
{
    let f = fixture();
    f.session.backend().push_failure(
        vec![NativeEvent::DebugString {
            pid: PID,
            tid: MAIN_TID,
            text: "about to crash\n".into(),
        }],
        BackendError::TargetVanished("ptrace: No such process".into()),
    );

    let events = f.session.run(&RunCtrls::default()).unwrap();
    let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
    assert_eq!(kinds, vec![EventKind::DebugString, EventKind::Error]);
    match &events.as_slice()[1] {
        Event::Error { kind, message, .. } => {
            assert_eq!(*kind, ErrorKind::BackendFailure);
            assert!(message.contains("No such process"));
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert_eq!(f.session.run_phase(), RunPhase::Idle);
}

#[test]
fn test_events_for_unknown_threads_are_dropped()
{
    let f = fixture();
    f.session.backend().push_run(vec![
        trap_at(999, CODE),
        NativeEvent::SetThreadName {
            pid: PID,
            tid: MAIN_TID,
            name: "main".into(),
        },
    ]);
    let events = f.session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events.as_slice()[0].kind(), EventKind::SetThreadName);
}

#[test]
fn test_step_counter_advances_per_run_and_event()
{
    let f = fixture();
    let before = f.session.step_counter();
    f.session.backend().push_run(vec![trap_at(MAIN_TID, 0x40_2000), trap_at(WORKER_TID, 0x40_3000)]);
    f.session.run(&RunCtrls::default()).unwrap();
    assert_eq!(f.session.step_counter(), before + 3);
}

#[test]
fn test_halt_from_another_thread_ends_the_run()
{
    let f = fixture();
    let (process, main) = (f.process, f.main);
    let session = Arc::new(f.session);

    let runner = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.run(&RunCtrls::default().with_trap(process, Address::new(CODE), Some(1))))
    };

    wait_for_phase(&session, RunPhase::Waiting);
    assert!(session.is_running());
    // Entities stay readable while the backend blocks.
    assert!(session.object_exists(main));
    session.halt(5, 0xfeed);

    let events = runner.join().unwrap().unwrap();
    let halts: Vec<&Event> = events.of_kind(EventKind::Halt).collect();
    assert_eq!(halts.len(), 1);
    assert!(matches!(
        halts[0],
        Event::Halt {
            code: 5,
            user_data: 0xfeed,
            ..
        }
    ));
    assert_eq!(session.backend().halts(), vec![(5, 0xfeed)]);
    assert_eq!(
        session.backend().memory(PID, Address::new(CODE), 4),
        Some(PROLOGUE.to_vec())
    );
    assert_eq!(session.run_phase(), RunPhase::Idle);
    assert!(!session.is_running());
}

#[test]
fn test_target_changes_are_refused_while_waiting()
{
    let f = fixture();
    let (process, main) = (f.process, f.main);
    let session = Arc::new(f.session);

    let runner = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.run(&RunCtrls::default().with_trap(process, Address::new(CODE), Some(1))))
    };
    wait_for_phase(&session, RunPhase::Waiting);

    let refused = [
        session.detach_process(process),
        session.kill_process(process, 9),
        session.attach_process(PID + 1),
        session.write_memory(process, Address::new(CODE), &[0x90]),
        session.write_registers(main, &RegisterBlock::X64(RegsX64::default())),
        session.write_ip(main, Address::new(CODE)),
        session.set_memory_protect_flags(process, Address::new(CODE), 4, MemoryProtect::READ),
        session.release_memory(process, Address::new(CODE), 4),
        session.reserve_memory(process, 0x1000).map(|_| ()),
    ];
    for result in refused {
        assert!(matches!(result, Err(CoreError::RunInProgress)), "{result:?}");
    }
    // Inspection keeps working.
    assert!(session.object_exists(process));
    assert_eq!(session.threads_from_process(process).unwrap().len(), 2);

    session.halt(1, 0);
    runner.join().unwrap().unwrap();

    assert!(session.backend().detached().is_empty());
    assert_eq!(
        session.backend().memory(PID, Address::new(CODE), 4),
        Some(PROLOGUE.to_vec())
    );
    // Once the run is over the trap is gone and detaching is allowed.
    session.detach_process(process).unwrap();
    assert_eq!(session.backend().detached(), vec![PID]);
    assert!(!session.object_exists(process));
}

#[test]
fn test_second_run_is_rejected_while_one_is_in_flight()
{
    let session = Arc::new(fixture().session);
    let runner = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.run(&RunCtrls::default()))
    };

    wait_for_phase(&session, RunPhase::Waiting);
    assert!(matches!(
        session.run(&RunCtrls::default()),
        Err(CoreError::RunInProgress)
    ));

    session.halt(0, 0);
    runner.join().unwrap().unwrap();
    assert!(!session.is_running());
}

#[test]
fn test_halt_before_run_skips_the_backend()
{
    let f = fixture();
    let before = f.session.backend().run_controls().len();
    f.session.halt(9, 1);

    let events = f.session.run(&RunCtrls::default()).unwrap();
    assert_eq!(
        events.as_slice(),
        &[Event::Halt {
            process: None,
            thread: None,
            code: 9,
            user_data: 1,
        }]
    );
    assert_eq!(f.session.backend().run_controls().len(), before);
}

#[test]
fn test_exhausted_script_can_vanish()
{
    let f = fixture();
    f.session.backend().set_on_exhausted(Exhausted::Vanish);
    let events = f.session.run(&RunCtrls::default()).unwrap();
    assert!(matches!(
        &events.as_slice()[0],
        Event::Error {
            kind: ErrorKind::BackendFailure,
            ..
        }
    ));
}

#[test]
fn test_run_while_holding_state_borrow_is_a_violation()
{
    let f = fixture();
    let scope = f.session.access_begin();
    let state = scope.state().unwrap();
    assert_eq!(state.entities.count(EntityKind::Thread), 2);

    assert!(matches!(
        f.session.run(&RunCtrls::default()),
        Err(CoreError::ConcurrentAccessViolation(_))
    ));
    drop(state);
    drop(scope);
    assert_eq!(f.session.run_phase(), RunPhase::Idle);
}
