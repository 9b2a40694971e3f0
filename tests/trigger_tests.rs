use std::sync::Arc;

use vmxdbg_events::platform::set_mock_cpu_id;
use vmxdbg_events::{
    ActionType, CallingStage, Config, DebuggerEngine, EventKind, MockVmx, OPERATION_SUCCESSFUL,
    ShortCircuitRequest, TriggeringStatus,
};

const CORES: usize = 2;

fn setup() -> DebuggerEngine {
    let hw = Arc::new(MockVmx::new(CORES));
    let engine = DebuggerEngine::new(Config::new(CORES), hw).unwrap();
    engine.enable_debugger();
    engine
}

#[test]
fn enabled_events_of_kind_and_stage_fire() {
    let engine = setup();
    let pre = engine
        .register_event(
            EventKind::ExceptionOccurred,
            [ActionType::BreakToDebugger, ActionType::RunScript].into_iter().collect(),
            CallingStage::PreEventEmulation,
        )
        .unwrap();
    let post = engine
        .register_event(
            EventKind::ExceptionOccurred,
            [ActionType::RunCustomCode].into_iter().collect(),
            CallingStage::PostEventEmulation,
        )
        .unwrap();
    let other = engine
        .register_event(
            EventKind::TscInstructionExecution,
            [ActionType::BreakToDebugger].into_iter().collect(),
            CallingStage::PreEventEmulation,
        )
        .unwrap();
    for tag in [pre, post, other] {
        engine.enable_event(tag).unwrap();
    }

    let outcome = engine.trigger(1, EventKind::ExceptionOccurred, CallingStage::PreEventEmulation);
    assert_eq!(outcome.status, TriggeringStatus::Successful);
    assert_eq!(outcome.matched.len(), 1);
    assert_eq!(outcome.matched[0].0, pre);
    let actions: Vec<_> = outcome.matched[0].1.iter().collect();
    assert_eq!(actions, vec![ActionType::BreakToDebugger, ActionType::RunScript]);

    let outcome = engine.trigger(0, EventKind::ExceptionOccurred, CallingStage::PostEventEmulation);
    assert_eq!(outcome.matched.len(), 1);
    assert_eq!(outcome.matched[0].0, post);
}

#[test]
fn disabled_events_do_not_fire() {
    let engine = setup();
    let tag = engine
        .register_event(
            EventKind::CpuidInstructionExecution,
            [ActionType::BreakToDebugger].into_iter().collect(),
            CallingStage::PreEventEmulation,
        )
        .unwrap();

    let outcome =
        engine.trigger(0, EventKind::CpuidInstructionExecution, CallingStage::PreEventEmulation);
    assert_eq!(outcome.status, TriggeringStatus::SUCCESSFUL_NO_INITIALIZED);
    assert!(outcome.matched.is_empty());

    engine.enable_event(tag).unwrap();
    engine.disable_event(tag).unwrap();
    let outcome =
        engine.trigger(0, EventKind::CpuidInstructionExecution, CallingStage::PreEventEmulation);
    assert!(outcome.matched.is_empty());
}

#[test]
fn short_circuit_skips_evaluation() {
    let engine = setup();
    let tag = engine
        .register_event(
            EventKind::VmcallInstructionExecution,
            [ActionType::BreakToDebugger].into_iter().collect(),
            CallingStage::PreEventEmulation,
        )
        .unwrap();
    engine.enable_event(tag).unwrap();

    let mut req = ShortCircuitRequest::new(true);
    engine.handle_short_circuit(&mut req);
    assert!(req.is_short_circuiting);
    assert_eq!(req.kernel_status, OPERATION_SUCCESSFUL);
    assert_eq!(engine.get_short_circuit(), (true, OPERATION_SUCCESSFUL));

    let outcome =
        engine.trigger(0, EventKind::VmcallInstructionExecution, CallingStage::PreEventEmulation);
    assert_eq!(outcome.status, TriggeringStatus::SuccessfulIgnoreEvent);
    assert!(outcome.status.is_success());
    assert!(outcome.matched.is_empty());

    engine.set_short_circuit(false);
    let outcome =
        engine.trigger(0, EventKind::VmcallInstructionExecution, CallingStage::PreEventEmulation);
    assert_eq!(outcome.matched.len(), 1);
}

#[test]
fn inactive_debugger_and_unknown_kind() {
    let engine = setup();
    assert_eq!(
        engine.trigger_raw(0, 77, CallingStage::PreEventEmulation).status,
        TriggeringStatus::InvalidEventType
    );
    assert!(!TriggeringStatus::InvalidEventType.is_success());

    engine.disable_debugger();
    let outcome = engine.trigger(0, EventKind::ExceptionOccurred, CallingStage::PreEventEmulation);
    assert_eq!(outcome.status, TriggeringStatus::DebuggerNotEnabled);
}

#[test]
fn trigger_on_current_core() {
    let engine = setup();
    let tag = engine
        .register_event_raw(
            EventKind::RdmsrInstructionExecution as u32,
            [ActionType::BreakToDebugger].into_iter().collect(),
            CallingStage::PreEventEmulation,
        )
        .unwrap();
    engine.enable_event(tag).unwrap();

    set_mock_cpu_id(1);
    let outcome =
        engine.trigger_current(EventKind::RdmsrInstructionExecution, CallingStage::PreEventEmulation);
    assert_eq!(outcome.matched.len(), 1);
    set_mock_cpu_id(0);
}
