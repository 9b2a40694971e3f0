use std::sync::Arc;

use vmxdbg_events::{
    ActionSet, ActionType, CallingStage, Config, DebuggerEngine, Error, EventKind, MockVmx,
    PassingOver, ResourceArbiter, ResourceKind,
};

const CORES: usize = 4;

fn setup() -> (Arc<MockVmx>, DebuggerEngine) {
    let hw = Arc::new(MockVmx::new(CORES));
    let engine = DebuggerEngine::new(Config::new(CORES), hw.clone()).unwrap();
    engine.enable_debugger();
    (hw, engine)
}

fn actions() -> ActionSet {
    [ActionType::BreakToDebugger].into_iter().collect()
}

/// Physical state matches (refcount > 0 || passing-over non-empty) everywhere.
fn assert_consistent(hw: &MockVmx, arb: &ResourceArbiter) {
    for core in 0..arb.core_count() {
        for resource in ResourceKind::ALL {
            let demanded =
                arb.refcount(core, resource) > 0 || !arb.passing_over(core, resource).is_empty();
            assert_eq!(
                hw.is_trapping(core, resource),
                demanded,
                "core {} {}",
                core,
                resource.label()
            );
            assert_eq!(arb.is_enabled(core, resource), demanded);
        }
    }
}

#[test]
fn require_release_toggle_on_edges() {
    let hw = Arc::new(MockVmx::new(1));
    let arb = ResourceArbiter::new(1, hw.clone());
    let r = ResourceKind::ExternalInterruptExiting;

    arb.require(0, r, 1).unwrap();
    arb.require(0, r, 2).unwrap();
    assert_eq!(arb.refcount(0, r), 2);
    assert_eq!(hw.write_count(), 1);

    arb.release(0, r, 1).unwrap();
    assert!(hw.is_trapping(0, r));
    arb.release(0, r, 2).unwrap();
    assert!(!hw.is_trapping(0, r));
    assert_eq!(hw.write_count(), 2);

    assert_eq!(
        arb.release(0, r, 2),
        Err(Error::ResourceUnderflow { core: 0, resource: r })
    );
    assert_eq!(arb.refcount(0, r), 0);
    assert_consistent(&hw, &arb);
}

#[test]
fn round_trip_restores_resource() {
    let (hw, engine) = setup();
    let tag = engine
        .register_event(EventKind::DebugRegistersAccessed, actions(), CallingStage::PreEventEmulation)
        .unwrap();

    engine.enable_event(tag).unwrap();
    for core in 0..CORES {
        assert_eq!(engine.arbiter().refcount(core, ResourceKind::MovToDebugRegisterExiting), 1);
    }
    assert_consistent(&hw, engine.arbiter());

    engine.disable_event(tag).unwrap();
    for core in 0..CORES {
        assert_eq!(engine.arbiter().refcount(core, ResourceKind::MovToDebugRegisterExiting), 0);
    }
    assert!(!hw.any_trapping());
}

#[test]
fn shared_resource_stays_on_until_last_user() {
    let (hw, engine) = setup();
    let a = engine
        .register_event(EventKind::ExceptionOccurred, actions(), CallingStage::PreEventEmulation)
        .unwrap();
    let b = engine
        .register_event(EventKind::HiddenHookExecCc, actions(), CallingStage::PreEventEmulation)
        .unwrap();

    engine.enable_event(a).unwrap();
    engine.enable_event(b).unwrap();
    assert_eq!(engine.arbiter().refcount(0, ResourceKind::ExceptionBitmap), 2);

    engine.disable_event(a).unwrap();
    for core in 0..CORES {
        assert!(hw.is_trapping(core, ResourceKind::ExceptionBitmap));
    }

    engine.disable_event(b).unwrap();
    for core in 0..CORES {
        assert!(!hw.is_trapping(core, ResourceKind::ExceptionBitmap));
    }
    assert_consistent(&hw, engine.arbiter());
}

#[test]
fn passing_over_outlives_event_demand() {
    let (hw, engine) = setup();
    let r = ResourceKind::RdtscRdtscpExiting;
    let tag = engine
        .register_event(EventKind::TscInstructionExecution, actions(), CallingStage::PreEventEmulation)
        .unwrap();

    engine.enable_event(tag).unwrap();
    engine.set_passing_over(r, PassingOver::TSC_EVENTS).unwrap();
    engine.disable_event(tag).unwrap();

    for core in 0..CORES {
        assert_eq!(engine.arbiter().refcount(core, r), 0);
        assert!(hw.is_trapping(core, r));
    }
    assert_consistent(&hw, engine.arbiter());

    engine.clear_passing_over(r, PassingOver::TSC_EVENTS).unwrap();
    assert!(!hw.any_trapping());
}

#[test]
fn reasons_combine_independently() {
    let hw = Arc::new(MockVmx::new(1));
    let arb = ResourceArbiter::new(1, hw.clone());
    let r = ResourceKind::ExceptionBitmap;

    arb.set_passing_over(0, r, PassingOver::BREAKPOINTS).unwrap();
    arb.set_passing_over(0, r, PassingOver::EXCEPTION_EVENTS).unwrap();
    arb.clear_passing_over(0, r, PassingOver::BREAKPOINTS).unwrap();
    assert!(hw.is_trapping(0, r));
    assert_eq!(arb.passing_over(0, r), PassingOver::EXCEPTION_EVENTS);

    arb.clear_passing_over(0, r, PassingOver::EXCEPTION_EVENTS).unwrap();
    assert!(!hw.is_trapping(0, r));
}

#[test]
fn syscall_hook_reserves_exception_bitmap() {
    let (hw, engine) = setup();
    let tag = engine
        .register_event(EventKind::SyscallHookEferSyscall, actions(), CallingStage::PreEventEmulation)
        .unwrap();

    engine.enable_event(tag).unwrap();
    for core in 0..CORES {
        assert_eq!(engine.arbiter().refcount(core, ResourceKind::ExceptionBitmap), 0);
        assert!(
            engine
                .arbiter()
                .passing_over(core, ResourceKind::ExceptionBitmap)
                .contains(PassingOver::UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK)
        );
        assert!(hw.is_trapping(core, ResourceKind::ExceptionBitmap));
    }

    // An exception event coming and going does not drop the #UD reservation.
    let exc = engine
        .register_event(EventKind::ExceptionOccurred, actions(), CallingStage::PreEventEmulation)
        .unwrap();
    engine.enable_event(exc).unwrap();
    engine.disable_event(exc).unwrap();
    assert!(hw.is_trapping(0, ResourceKind::ExceptionBitmap));

    engine.disable_event(tag).unwrap();
    assert!(!hw.any_trapping());
}

#[test]
fn control_register_events_share_cr_exiting_only() {
    let (hw, engine) = setup();
    let modified = engine
        .register_event(EventKind::ControlRegisterModified, actions(), CallingStage::PreEventEmulation)
        .unwrap();
    let read = engine
        .register_event(EventKind::ControlRegisterRead, actions(), CallingStage::PreEventEmulation)
        .unwrap();

    engine.enable_event(modified).unwrap();
    engine.enable_event(read).unwrap();
    assert_eq!(engine.arbiter().refcount(1, ResourceKind::MovControlRegisterExiting), 2);
    assert_eq!(engine.arbiter().refcount(1, ResourceKind::MovToCr3Exiting), 0);
    assert!(!hw.is_trapping(1, ResourceKind::MovToCr3Exiting));

    engine.disable_event(modified).unwrap();
    assert_eq!(engine.arbiter().refcount(1, ResourceKind::MovControlRegisterExiting), 1);
    assert!(hw.is_trapping(1, ResourceKind::MovControlRegisterExiting));
    assert_consistent(&hw, engine.arbiter());
}

#[test]
fn kinds_without_controls_touch_nothing() {
    let (hw, engine) = setup();
    let tag = engine
        .register_event(EventKind::CpuidInstructionExecution, actions(), CallingStage::PreEventEmulation)
        .unwrap();
    engine.enable_event(tag).unwrap();
    assert!(engine.lookup(tag).unwrap().enabled);
    assert_eq!(hw.write_count(), 0);
}
