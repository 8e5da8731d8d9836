//! Tests for entity lifecycle and introspection through a session

use tether_core::backend::replay::{ReplayBackend, ReplayLaunch};
use tether_core::backend::NativeEvent;
use tether_core::error::{BackendError, CoreError};
use tether_core::events::{Event, EventKind};
use tether_core::memory::MemoryProtect;
use tether_core::types::{Address, Architecture, RegisterBlock, RegsX64};
use tether_core::{EntityKind, Handle, RunCtrls, Session, SessionConfig};

const PID: u32 = 100;
const TID: u32 = 101;
const LIBC_BASE: u64 = 0x7fff_0000_0000;

fn create_process(pid: u32) -> NativeEvent
{
    NativeEvent::CreateProcess {
        pid,
        arch: Architecture::X86_64,
        ext: Default::default(),
    }
}

fn create_thread(pid: u32, tid: u32) -> NativeEvent
{
    NativeEvent::CreateThread {
        pid,
        tid,
        ext: Default::default(),
    }
}

fn load_module(pid: u32, base: u64) -> NativeEvent
{
    NativeEvent::LoadModule {
        pid,
        base: Address::new(base),
        size: 0x1000,
        name: "libc.so.6".into(),
        ext: Default::default(),
    }
}

/// Session attached to PID with one thread TID and libc loaded
fn attached_session() -> (Session<ReplayBackend>, Handle, Handle)
{
    let backend = ReplayBackend::new();
    backend.push_run(vec![
        create_process(PID),
        create_thread(PID, TID),
        load_module(PID, LIBC_BASE),
    ]);
    let session = Session::new(backend, SessionConfig::default()).unwrap();
    session.attach_process(PID).unwrap();
    let events = session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.len(), 3);

    let process = session.find(EntityKind::Process, u64::from(PID)).unwrap();
    let thread = session.find(EntityKind::Thread, u64::from(TID)).unwrap();
    (session, process, thread)
}

#[test]
fn test_attach_builds_entity_tree()
{
    let (session, process, thread) = attached_session();

    assert_eq!(session.all_processes(), vec![process]);
    assert_eq!(session.threads_from_process(process).unwrap(), vec![thread]);
    assert_eq!(session.parent_from_object(thread).unwrap(), process);
    assert_eq!(session.parent_from_object(process).unwrap(), Handle::NULL);
    assert_eq!(session.kind_from_object(thread).unwrap(), EntityKind::Thread);
    assert_eq!(session.id_from_object(thread).unwrap(), u64::from(TID));
    assert_eq!(session.arch_from_object(thread).unwrap(), Architecture::X86_64);
    assert_eq!(session.backend().attached(), vec![PID]);
}

#[test]
fn test_creation_events_carry_handles()
{
    let backend = ReplayBackend::new();
    backend.push_run(vec![create_process(PID), create_thread(PID, TID)]);
    let session = Session::new(backend, SessionConfig::default()).unwrap();
    session.attach_process(PID).unwrap();
    let events = session.run(&RunCtrls::default()).unwrap();

    let process = session.find(EntityKind::Process, u64::from(PID)).unwrap();
    let thread = session.find(EntityKind::Thread, u64::from(TID)).unwrap();
    assert_eq!(events.as_slice()[0], Event::CreateProcess { process, pid: PID });
    assert_eq!(
        events.as_slice()[1],
        Event::CreateThread {
            process,
            thread,
            tid: TID
        }
    );
}

#[test]
fn test_same_id_different_kinds_coexist()
{
    let backend = ReplayBackend::new();
    backend.push_run(vec![create_process(PID), create_thread(PID, PID)]);
    backend.push_run(vec![NativeEvent::ExitThread {
        pid: PID,
        tid: PID,
        code: 0,
    }]);
    let session = Session::new(backend, SessionConfig::default()).unwrap();
    session.attach_process(PID).unwrap();
    session.run(&RunCtrls::default()).unwrap();

    let process = session.find(EntityKind::Process, u64::from(PID)).unwrap();
    let thread = session.find(EntityKind::Thread, u64::from(PID)).unwrap();
    assert_ne!(process, thread);

    let events = session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.of_kind(EventKind::ExitThread).count(), 1);
    assert!(!session.object_exists(thread));
    assert!(session.object_exists(process));
    assert_eq!(session.find(EntityKind::Process, u64::from(PID)), Some(process));
    assert_eq!(session.find(EntityKind::Thread, u64::from(PID)), None);
}

#[test]
fn test_handle_goes_stale_after_thread_exit()
{
    let (session, process, thread) = attached_session();
    session.backend().push_run(vec![
        NativeEvent::ExitThread {
            pid: PID,
            tid: TID,
            code: 0,
        },
        create_thread(PID, TID + 1),
    ]);
    session.run(&RunCtrls::default()).unwrap();

    assert!(!session.object_exists(thread));
    assert!(matches!(session.kind_from_object(thread), Err(CoreError::StaleHandle(h)) if h == thread));

    let replacement = session.find(EntityKind::Thread, u64::from(TID + 1)).unwrap();
    assert_ne!(replacement, thread);
    assert_eq!(session.threads_from_process(process).unwrap(), vec![replacement]);
}

#[test]
fn test_process_exit_reports_children_then_process()
{
    let (session, process, thread) = attached_session();
    session.backend().push_run(vec![NativeEvent::ExitProcess { pid: PID, code: 3 }]);
    let module = session.modules_from_process(process).unwrap()[0];

    let events = session.run(&RunCtrls::default()).unwrap();
    let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::ExitThread, EventKind::UnloadModule, EventKind::ExitProcess]
    );
    assert_eq!(events.of_kind(EventKind::ExitProcess).count(), 1);
    assert_eq!(events.as_slice()[2], Event::ExitProcess { process, code: 3 });

    for handle in [process, thread, module] {
        assert!(!session.object_exists(handle));
    }
    assert_eq!(session.find(EntityKind::Process, u64::from(PID)), None);
    assert_eq!(session.find(EntityKind::Module, LIBC_BASE), None);
    assert!(session.all_processes().is_empty());

    let cleaned = session.backend().cleaned_up();
    assert_eq!(cleaned.len(), 3);
    assert_eq!(cleaned.last().map(|t| t.kind), Some(EntityKind::Process));
}

#[test]
fn test_unloaded_module_is_forgotten()
{
    let (session, process, _) = attached_session();
    let module = session.modules_from_process(process).unwrap()[0];
    session.backend().push_run(vec![NativeEvent::UnloadModule {
        pid: PID,
        base: Address::new(LIBC_BASE),
    }]);

    let events = session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.as_slice(), &[Event::UnloadModule { process, module }]);
    assert!(!session.object_exists(module));
    assert!(matches!(session.base_vaddr_from_module(module), Err(CoreError::StaleHandle(_))));
    assert_eq!(session.find(EntityKind::Module, LIBC_BASE), None);
    assert!(session.modules_from_process(process).unwrap().is_empty());
    assert!(session.object_exists(process));
}

#[test]
fn test_unload_from_another_process_is_ignored()
{
    const OTHER: u32 = 300;
    let (session, process, _) = attached_session();
    let module = session.modules_from_process(process).unwrap()[0];
    session.backend().push_run(vec![
        create_process(OTHER),
        load_module(OTHER, LIBC_BASE),
        NativeEvent::UnloadModule {
            pid: OTHER,
            base: Address::new(LIBC_BASE),
        },
    ]);

    let events = session.run(&RunCtrls::default()).unwrap();
    // The clashing load is an error; the unload that follows names a module
    // the other process never owned.
    assert_eq!(events.of_kind(EventKind::Error).count(), 1);
    assert_eq!(events.of_kind(EventKind::UnloadModule).count(), 0);
    assert!(session.object_exists(module));
    assert_eq!(session.modules_from_process(process).unwrap(), vec![module]);
    assert_eq!(session.find(EntityKind::Module, LIBC_BASE), Some(module));
}

#[test]
fn test_thread_exit_from_another_process_is_ignored()
{
    const OTHER: u32 = 300;
    let (session, process, thread) = attached_session();
    session.backend().push_run(vec![
        create_process(OTHER),
        NativeEvent::ExitThread {
            pid: OTHER,
            tid: TID,
            code: 0,
        },
    ]);

    let events = session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.of_kind(EventKind::ExitThread).count(), 0);
    assert!(session.object_exists(thread));
    assert_eq!(session.threads_from_process(process).unwrap(), vec![thread]);
}

#[test]
fn test_kill_is_reported_by_next_run()
{
    let (session, process, _) = attached_session();
    session.kill_process(process, 9).unwrap();
    assert_eq!(session.backend().killed(), vec![(PID, 9)]);
    assert!(session.object_exists(process));

    let events = session.run(&RunCtrls::default()).unwrap();
    assert!(events.iter().any(|e| *e == Event::ExitProcess { process, code: 9 }));
    assert!(!session.object_exists(process));
}

#[test]
fn test_detach_releases_subtree_immediately()
{
    let (session, process, thread) = attached_session();
    session.detach_process(process).unwrap();

    assert_eq!(session.backend().detached(), vec![PID]);
    assert!(!session.object_exists(process));
    assert!(!session.object_exists(thread));
    assert_eq!(session.backend().cleaned_up().len(), 3);
    assert!(matches!(
        session.detach_process(process),
        Err(CoreError::StaleHandle(_))
    ));
}

#[test]
fn test_launch_counts_as_pending_attach()
{
    let backend = ReplayBackend::new();
    backend.push_run(vec![create_process(42)]);
    let session = Session::new(backend, SessionConfig::default()).unwrap();
    let pid = session
        .launch_process(&ReplayLaunch {
            program: "/bin/true".into(),
            pid: 42,
        })
        .unwrap();
    assert_eq!(pid, 42);

    let events = session.run(&RunCtrls::default()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events.as_slice()[0].kind(), EventKind::CreateProcess);
    assert_eq!(session.backend().launched()[0].program, "/bin/true");
}

#[test]
fn test_module_path_is_cached()
{
    let (session, process, _) = attached_session();
    session
        .backend()
        .set_module_path(Address::new(LIBC_BASE), "/usr/lib/x86_64-linux-gnu/libc.so.6");
    let module = session.modules_from_process(process).unwrap()[0];

    for _ in 0..3 {
        assert_eq!(
            session.full_path_from_module(module).unwrap(),
            "/usr/lib/x86_64-linux-gnu/libc.so.6"
        );
    }
    assert_eq!(session.backend().path_queries(), 1);
    assert_eq!(session.base_vaddr_from_module(module).unwrap(), Address::new(LIBC_BASE));
    assert_eq!(
        session.vaddr_range_from_module(module).unwrap(),
        (Address::new(LIBC_BASE), Address::new(LIBC_BASE + 0x1000))
    );
}

#[test]
fn test_module_query_rejects_threads()
{
    let (session, _, thread) = attached_session();
    assert!(matches!(
        session.full_path_from_module(thread),
        Err(CoreError::WrongKind {
            expected: EntityKind::Module,
            found: EntityKind::Thread,
            ..
        })
    ));
}

#[test]
fn test_stack_and_tls_bases()
{
    let (session, _, thread) = attached_session();
    session.backend().set_stack_base(TID, Address::new(0x7ffd_0000_0000));
    session.backend().set_tls_root(TID, Address::new(0x7f12_3456_7000));

    assert_eq!(
        session.stack_base_vaddr_from_thread(thread).unwrap(),
        Address::new(0x7ffd_0000_0000)
    );
    assert_eq!(
        session.tls_root_vaddr_from_thread(thread).unwrap(),
        Address::new(0x7f12_3456_7000)
    );

    // Served from the cache even if the backend's answer changes.
    session.backend().set_stack_base(TID, Address::new(0x1000));
    assert_eq!(
        session.stack_base_vaddr_from_thread(thread).unwrap(),
        Address::new(0x7ffd_0000_0000)
    );
}

fn regs_at(rip: u64) -> RegisterBlock
{
    RegisterBlock::X64(RegsX64 {
        rip,
        rsp: 0x7ffd_0000_f000,
        ..RegsX64::default()
    })
}

#[test]
fn test_register_reads_are_cached_within_a_step()
{
    let (session, _, thread) = attached_session();
    session.backend().set_registers(TID, regs_at(0x40_1000));

    assert_eq!(session.read_ip(thread).unwrap(), Address::new(0x40_1000));
    assert_eq!(session.read_sp(thread).unwrap(), Address::new(0x7ffd_0000_f000));
    session.read_registers(thread).unwrap();
    assert_eq!(session.backend().register_reads(), 1);

    session.backend().set_registers(TID, regs_at(0x40_2000));
    session.backend().push_run(vec![]);
    session.run(&RunCtrls::default()).unwrap();

    assert_eq!(session.read_ip(thread).unwrap(), Address::new(0x40_2000));
    assert_eq!(session.backend().register_reads(), 2);
}

#[test]
fn test_failed_register_write_keeps_cache()
{
    let (session, _, thread) = attached_session();
    session.backend().set_registers(TID, regs_at(0x40_1000));
    let before = session.read_registers(thread).unwrap();

    session.backend().fail_register_writes(true);
    let result = session.write_registers(thread, &regs_at(0x40_5000));
    assert!(matches!(
        result,
        Err(CoreError::BackendFailure(BackendError::Os { code: 3, .. }))
    ));
    assert_eq!(session.read_registers(thread).unwrap(), before);
    assert_eq!(session.backend().register_reads(), 1);
    assert_eq!(session.backend().register_writes(), 0);

    session.backend().fail_register_writes(false);
    session.write_ip(thread, Address::new(0x40_5000)).unwrap();
    assert_eq!(session.read_ip(thread).unwrap(), Address::new(0x40_5000));
    assert_eq!(session.backend().register_reads(), 1);
    assert_eq!(session.backend().register_writes(), 1);
}

#[test]
fn test_register_write_rejects_foreign_architecture()
{
    let (session, _, thread) = attached_session();
    let arm = RegisterBlock::zeroed(Architecture::Arm64).unwrap();
    assert!(matches!(
        session.write_registers(thread, &arm),
        Err(CoreError::NotSupported(_))
    ));
    assert_eq!(session.backend().register_writes(), 0);
}

#[test]
fn test_memory_round_trip_and_protection()
{
    let (session, process, _) = attached_session();
    let region = session.reserve_memory(process, 0x100).unwrap();
    session
        .set_memory_protect_flags(process, region, 0x100, MemoryProtect::READ | MemoryProtect::WRITE)
        .unwrap();
    assert_eq!(
        session.backend().protection(PID, region),
        Some(MemoryProtect::READ | MemoryProtect::WRITE)
    );

    session.write_memory(process, region + 0x10, b"tether").unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(session.read_memory(process, region + 0x10, &mut buf).unwrap(), 6);
    assert_eq!(&buf, b"tether");

    session.release_memory(process, region, 0x100).unwrap();
    assert!(matches!(
        session.read_memory(process, region, &mut buf),
        Err(CoreError::BackendFailure(BackendError::MemoryAccess { .. }))
    ));
}

#[test]
fn test_read_memory_amap_stops_at_unmapped_page()
{
    let (session, process, _) = attached_session();
    let bytes: Vec<u8> = (0..0x2000u32).map(|i| (i % 251) as u8).collect();
    session.backend().map_memory(PID, Address::new(0x1000), bytes.clone());

    let mut buf = vec![0u8; 0x3000];
    let n = session.read_memory_amap(process, Address::new(0x1800), &mut buf).unwrap();
    assert_eq!(n, 0x1800);
    assert_eq!(&buf[..n], &bytes[0x800..]);
}

#[test]
fn test_snapshots()
{
    let (session, _, thread) = attached_session();
    let snapshot = session.snapshot_thread(thread).unwrap();
    session.release_snapshot(thread, snapshot).unwrap();
    assert!(matches!(
        session.release_snapshot(thread, snapshot),
        Err(CoreError::BackendFailure(_))
    ));
}

#[test]
fn test_host_processes()
{
    let backend = ReplayBackend::new();
    backend.add_host_process(1, "init");
    backend.add_host_process(4242, "server");
    let session = Session::new(backend, SessionConfig::default()).unwrap();

    let names: Vec<String> = session.host_processes().unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["init", "server"]);
}

#[test]
fn test_invalid_config_is_rejected()
{
    let config = SessionConfig {
        map_buckets: 1000,
        ..SessionConfig::default()
    };
    assert!(matches!(
        Session::new(ReplayBackend::new(), config),
        Err(CoreError::InvalidConfig(_))
    ));
}

#[test]
fn test_capacity_overflow_surfaces_as_error_event()
{
    let backend = ReplayBackend::new();
    backend.push_run(vec![
        create_process(PID),
        create_thread(PID, 1),
        create_thread(PID, 2),
    ]);
    let config = SessionConfig {
        entity_capacity: 3,
        ..SessionConfig::default()
    };
    let session = Session::new(backend, config).unwrap();
    session.attach_process(PID).unwrap();

    let events = session.run(&RunCtrls::default()).unwrap();
    let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::CreateProcess, EventKind::CreateThread, EventKind::Error]
    );
    assert_eq!(session.find(EntityKind::Thread, 2), None);
}
