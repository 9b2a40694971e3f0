use std::sync::Arc;

use axerrno::AxResult;
use vmxdbg_events::breakpoint::{parse_breakpoint_id, request_breakpoint_modification};
use vmxdbg_events::{
    APPLY_TO_ALL_BREAKPOINTS, ActionType, BreakpointModification, BreakpointPacket, CallingStage,
    Config, DebuggeeLink, DebuggerEngine, Error, EventKind, MockVmx, PassingOver, ResourceKind,
};

const CORES: usize = 2;

fn setup() -> (Arc<MockVmx>, Arc<DebuggerEngine>) {
    let hw = Arc::new(MockVmx::new(CORES));
    let engine = Arc::new(DebuggerEngine::new(Config::new(CORES), hw.clone()).unwrap());
    engine.enable_debugger();
    (hw, engine)
}

/// Delivers packets straight to a local engine.
struct Loopback {
    engine: Arc<DebuggerEngine>,
    connected: bool,
    sent: usize,
}

impl DebuggeeLink for Loopback {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send_breakpoint_packet(&mut self, packet: &mut BreakpointPacket) -> AxResult {
        self.sent += 1;
        let _ = self.engine.handle_breakpoint_packet(packet);
        Ok(())
    }
}

#[test]
fn breakpoints_hold_exception_bitmap() {
    let (hw, engine) = setup();
    let a = engine.add_breakpoint(0xffff_8000_0000_1000).unwrap();
    let b = engine.add_breakpoint(0xffff_8000_0000_2000).unwrap();
    for core in 0..CORES {
        assert!(
            engine
                .arbiter()
                .passing_over(core, ResourceKind::ExceptionBitmap)
                .contains(PassingOver::BREAKPOINTS)
        );
        assert!(hw.is_trapping(core, ResourceKind::ExceptionBitmap));
    }

    let mut link = Loopback {
        engine: engine.clone(),
        connected: true,
        sent: 0,
    };
    request_breakpoint_modification(&mut link, a, BreakpointModification::Disable).unwrap();
    assert!(hw.is_trapping(0, ResourceKind::ExceptionBitmap));

    request_breakpoint_modification(&mut link, b, BreakpointModification::Disable).unwrap();
    assert!(!hw.any_trapping());
    assert_eq!(engine.list_breakpoints().len(), 2);

    request_breakpoint_modification(&mut link, APPLY_TO_ALL_BREAKPOINTS, BreakpointModification::Enable)
        .unwrap();
    assert!(engine.list_breakpoints().iter().all(|bp| bp.enabled));
    assert!(hw.is_trapping(1, ResourceKind::ExceptionBitmap));

    request_breakpoint_modification(&mut link, APPLY_TO_ALL_BREAKPOINTS, BreakpointModification::Clear)
        .unwrap();
    assert!(engine.list_breakpoints().is_empty());
    assert!(!hw.any_trapping());
    assert_eq!(link.sent, 4);
}

#[test]
fn breakpoint_reason_coexists_with_exception_events() {
    let (hw, engine) = setup();
    let tag = engine
        .register_event(
            EventKind::ExceptionOccurred,
            [ActionType::BreakToDebugger].into_iter().collect(),
            CallingStage::PreEventEmulation,
        )
        .unwrap();
    engine.enable_event(tag).unwrap();

    let id = engine.add_breakpoint(0x1000).unwrap();
    engine.disable_event(tag).unwrap();
    assert!(hw.is_trapping(0, ResourceKind::ExceptionBitmap));

    let mut packet = BreakpointPacket::new(id, BreakpointModification::Clear);
    engine.handle_breakpoint_packet(&mut packet).unwrap();
    assert!(!hw.any_trapping());
}

#[test]
fn disconnected_link_sends_nothing() {
    let (_hw, engine) = setup();
    let mut link = Loopback {
        engine,
        connected: false,
        sent: 0,
    };
    assert_eq!(
        request_breakpoint_modification(&mut link, 0, BreakpointModification::Disable),
        Err(Error::NotConnected)
    );
    assert_eq!(link.sent, 0);
}

#[test]
fn unknown_breakpoint_reports_status() {
    let (_hw, engine) = setup();
    let mut link = Loopback {
        engine: engine.clone(),
        connected: true,
        sent: 0,
    };
    assert_eq!(
        request_breakpoint_modification(&mut link, 0x42, BreakpointModification::Disable),
        Err(Error::InvalidBreakpointId(0x42))
    );

    let mut packet = BreakpointPacket::new(0x42, BreakpointModification::Enable);
    assert!(engine.handle_breakpoint_packet(&mut packet).is_err());
    assert_eq!(packet.kernel_status, Error::InvalidBreakpointId(0x42).kernel_status());
}

#[test]
fn id_argument_parsing() {
    assert_eq!(parse_breakpoint_id("all"), Some(APPLY_TO_ALL_BREAKPOINTS));
    assert_eq!(parse_breakpoint_id("2"), Some(2));
    assert_eq!(parse_breakpoint_id("0xA"), Some(10));
    assert_eq!(parse_breakpoint_id("0x"), None);
}
