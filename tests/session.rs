mod common;

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use common::{msg, Event, Recorder, RecordingLink, SentFrames, StubAccessor, TestHook};
use ride_bridge::runtime::codec::Decoded;
use ride_bridge::runtime::error::Error;
use ride_bridge::runtime::queue::COALESCE_WINDOW;
use ride_bridge::runtime::{
    LaunchOptions, Session, SessionState, StopReason, EXIT_TIMEOUT, TIP_TIMEOUT,
};

/// Comfortably past the rundown quiescence window.
const STEP: Duration = Duration::from_millis(25);

fn make_session(
    opts: LaunchOptions,
    link_dump: Option<&str>,
) -> (Session<TestHook>, Recorder, SentFrames) {
    common::init_logs();
    let rec = Recorder::default();
    let frames = SentFrames::default();
    let session = Session::new(
        opts,
        TestHook::new(rec.clone()),
        Arc::new(StubAccessor {
            link_dump: link_dump.map(str::to_string),
        }),
        Box::new(RecordingLink {
            frames: frames.clone(),
        }),
        None,
    );
    (session, rec, frames)
}

fn entry_opts(program: &str) -> LaunchOptions {
    LaunchOptions {
        exe: "dyalog".to_string(),
        program: Some(program.to_string()),
        folder: "/ws".to_string(),
        ..Default::default()
    }
}

fn folder_opts() -> LaunchOptions {
    LaunchOptions {
        exe: "dyalog".to_string(),
        folder: "/ws".to_string(),
        ..Default::default()
    }
}

fn connect(session: &mut Session<TestHook>, now: Instant) {
    session
        .ingest(
            Decoded::Handshake {
                accepted: true,
                version: "2".to_string(),
            },
            now,
        )
        .unwrap();
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn test_deferred_breakpoint_pushed_once_after_link() {
    let (mut session, _rec, frames) =
        make_session(entry_opts("/ws/test.aplf"), Some("X\t/ws/test.aplf\t10"));
    let mut now = Instant::now();
    connect(&mut session, now);

    // not linked yet: nothing goes out
    session.set_breakpoint("/ws/test.aplf", 5).unwrap();
    assert!(frames.containing("⎕STOP").is_empty());

    // first interactive prompt: fix, link, push, run
    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();

    let pushes = frames.containing("⎕STOP");
    assert_eq!(pushes.len(), 1, "one stop-set push per routine: {pushes:?}");
    assert!(pushes[0].contains(r"5 ⎕STOP 'X'"), "push was: {}", pushes[0]);
    assert!(frames.containing("⎕FIX").len() == 1);
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn test_breakpoint_edit_on_linked_path_pushes_full_set() {
    let (mut session, _rec, frames) =
        make_session(entry_opts("/ws/test.aplf"), Some("X\t/ws/test.aplf\t10"));
    let mut now = Instant::now();
    connect(&mut session, now);
    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();

    session.set_breakpoint("/ws/test.aplf", 5).unwrap();
    session.set_breakpoint("/ws/test.aplf", 2).unwrap();
    let pushes = frames.containing("⎕STOP");
    assert!(pushes.last().unwrap().contains(r"2 5 ⎕STOP 'X'"));

    session.clear_breakpoints("/ws/test.aplf").unwrap();
    let pushes = frames.containing("⎕STOP");
    assert!(pushes.last().unwrap().contains(r"⍬ ⎕STOP 'X'"));
}

#[test]
fn test_breakpoint_beyond_routine_length_not_pushed() {
    let (mut session, _rec, frames) =
        make_session(entry_opts("/ws/test.aplf"), Some("X\t/ws/test.aplf\t10"));
    let mut now = Instant::now();
    connect(&mut session, now);
    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();

    session.set_breakpoint("/ws/test.aplf", 42).unwrap();
    let push = frames.containing("⎕STOP").pop().unwrap();
    assert!(push.contains(r"⍬ ⎕STOP 'X'"), "line 42 is past the routine end: {push}");
}

#[test]
fn test_stop_reason_derived_from_pending_error() {
    let (mut session, rec, _frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    now += STEP;
    session
        .ingest(msg("HadError", json!({ "error": 1001, "dmx": 1 })), now)
        .unwrap();
    now += STEP;
    session
        .ingest(msg("SetHighlightLine", json!({ "win": 7, "line": 3 })), now)
        .unwrap();

    // the pending error code maps to a breakpoint stop and is consumed
    assert_eq!(rec.stops(), [(StopReason::Breakpoint, 3)]);
    assert_eq!(session.state(), SessionState::Stopped);

    now += STEP;
    session
        .ingest(msg("SetHighlightLine", json!({ "win": 7, "line": 4 })), now)
        .unwrap();
    assert_eq!(
        rec.stops(),
        [(StopReason::Breakpoint, 3), (StopReason::Step, 4)]
    );
}

#[test]
fn test_entry_stop_reported_once() {
    let mut opts = entry_opts("/ws/test.aplf");
    opts.stop_on_entry = true;
    let (mut session, rec, _frames) = make_session(opts, Some("X\t/ws/test.aplf\t10"));
    let mut now = Instant::now();
    connect(&mut session, now);
    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();

    now += STEP;
    session
        .ingest(msg("SetHighlightLine", json!({ "win": 7, "line": 0 })), now)
        .unwrap();
    now += STEP;
    session
        .ingest(msg("SetHighlightLine", json!({ "win": 7, "line": 1 })), now)
        .unwrap();
    assert_eq!(rec.stops(), [(StopReason::Entry, 0), (StopReason::Step, 1)]);
}

#[test]
fn test_output_coalescing_and_order() {
    let (mut session, rec, _frames) = make_session(folder_opts(), None);
    let now = Instant::now();
    connect(&mut session, now);

    // first message dispatches immediately, the rest land in the same
    // rundown window and coalesce
    session
        .ingest(msg("EchoInput", json!({ "input": "a" })), now)
        .unwrap();
    for t in ["t1", "t2", "t3"] {
        session
            .ingest(msg("AppendSessionOutput", json!({ "result": t })), now)
            .unwrap();
    }
    session
        .ingest(msg("EchoInput", json!({ "input": "b" })), now)
        .unwrap();

    session.tick(now + COALESCE_WINDOW).unwrap();
    assert_eq!(rec.outputs(), ["a", "t1t2t3", "b"]);
}

#[test]
fn test_send_gating_queues_until_first_prompt() {
    let (mut session, _rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    // Execute is not always-safe: queued while the interpreter is busy
    session.evaluate("1+1").unwrap();
    assert!(frames.containing("Execute").is_empty());

    // interrupts bypass the gate
    session.interrupt(false).unwrap();
    assert_eq!(frames.containing("WeakInterrupt").len(), 1);

    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();
    let executes = frames.containing("Execute");
    assert!(
        executes.iter().any(|p| p.contains("1+1")),
        "deferred evaluate flushed on first prompt: {executes:?}"
    );
}

#[test]
fn test_unknown_kind_answered_with_unknown_command() {
    let (mut session, _rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);
    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();

    now += STEP;
    session
        .ingest(msg("FancyNewThing", json!({ "x": 1 })), now)
        .unwrap();
    assert_eq!(
        frames.all().last().unwrap(),
        r#"["UnknownCommand",{"name":"FancyNewThing"}]"#
    );
}

#[test]
fn test_value_tip_timeout_resolves_empty() {
    let (mut session, _rec, frames) = make_session(folder_opts(), None);
    let now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    session.request_value_tip(3, 10, Some(42), tx, now).unwrap();
    assert_eq!(frames.containing("GetValueTip").len(), 1);
    assert!(rx.try_recv().is_err());

    session.tick(now + TIP_TIMEOUT).unwrap();
    let tip = rx.try_recv().expect("timeout resolves the tip");
    assert!(tip.tip.is_empty());

    // the late reply is a no-op
    session
        .ingest(
            msg("ValueTip", json!({ "token": 42, "tip": ["late"] })),
            now + TIP_TIMEOUT + STEP,
        )
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_value_tip_reply_resolves_once() {
    let (mut session, _rec, _frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    session.request_value_tip(3, 10, Some(42), tx, now).unwrap();
    now += STEP;
    session
        .ingest(
            msg("ValueTip", json!({ "token": 42, "tip": ["1 2 3"], "class": 2 })),
            now,
        )
        .unwrap();
    assert_eq!(rx.try_recv().unwrap().tip, ["1 2 3"]);

    // a duplicate reply has no one to resolve
    now += STEP;
    session
        .ingest(msg("ValueTip", json!({ "token": 42, "tip": ["again"] })), now)
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_stack_requests_share_one_round_trip() {
    let (mut session, _rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    let (tx1, rx1) = channel();
    let (tx2, rx2) = channel();
    session.request_stack(tx1).unwrap();
    session.request_stack(tx2).unwrap();
    assert_eq!(frames.containing("GetSIStack").len(), 1);

    now += STEP;
    session
        .ingest(
            msg(
                "ReplyGetSIStack",
                json!({ "stack": [{ "description": "#.Fib[3]" }, { "description": "⍎" }], "tid": 0 }),
            ),
            now,
        )
        .unwrap();

    for rx in [rx1, rx2] {
        let stack = rx.try_recv().unwrap();
        assert_eq!(stack.frames.len(), 2);
        assert_eq!(stack.frames[0].name, "#.Fib");
        assert_eq!(stack.frames[0].line, Some(3));
        assert_eq!(stack.frames[1].name, "⍎");
        assert_eq!(stack.frames[1].line, None);
    }

    // memoized per stop: a third request is served from cache
    let (tx3, rx3) = channel();
    session.request_stack(tx3).unwrap();
    assert_eq!(frames.containing("GetSIStack").len(), 1);
    assert!(rx3.try_recv().is_ok());

    // a new stop invalidates the memo
    now += STEP;
    session
        .ingest(msg("SetHighlightLine", json!({ "win": 7, "line": 1 })), now)
        .unwrap();
    let (tx4, _rx4) = channel();
    session.request_stack(tx4).unwrap();
    assert_eq!(frames.containing("GetSIStack").len(), 2);
}

#[test]
fn test_tree_expansion_keyed_by_node_id() {
    let (mut session, _rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    session.request_tree(4, tx).unwrap();
    assert_eq!(frames.containing("TreeList").len(), 1);

    now += STEP;
    session
        .ingest(
            msg(
                "ReplyTreeList",
                json!({
                    "nodeId": 4,
                    "nodeIds": [11, 0],
                    "names": ["counts", "total"],
                    "classes": [2.1, 2.1],
                    "err": "",
                }),
            ),
            now,
        )
        .unwrap();
    let reply = rx.try_recv().unwrap();
    assert_eq!(reply.names, ["counts", "total"]);
    assert_eq!(reply.node_ids, [11, 0]);
}

#[test]
fn test_autocomplete_resolved_by_token() {
    let (mut session, _rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    let token = session.request_autocomplete("⎕S", 2, tx).unwrap();
    assert_eq!(frames.containing("GetAutocomplete").len(), 1);

    now += STEP;
    session
        .ingest(
            msg(
                "ReplyGetAutocomplete",
                json!({ "options": ["⎕SE", "⎕SH", "⎕SI"], "skip": 0, "token": token }),
            ),
            now,
        )
        .unwrap();
    assert_eq!(rx.try_recv().unwrap().options, ["⎕SE", "⎕SH", "⎕SI"]);
}

#[test]
fn test_breakpoint_verification_follows_window_reports() {
    let (mut session, rec, _frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    session.set_breakpoint("/ws/test.aplf", 2).unwrap();
    session.set_breakpoint("/ws/test.aplf", 5).unwrap();
    assert!(rec.breakpoint_changes().is_empty());

    now += STEP;
    session
        .ingest(
            msg(
                "OpenWindow",
                json!({
                    "token": 7,
                    "name": "X",
                    "filename": "/ws/test.aplf",
                    "debugger": 1,
                    "stop": [2],
                    "text": [],
                }),
            ),
            now,
        )
        .unwrap();
    let changes = rec.breakpoint_changes();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].verified);
    assert_eq!(changes[0].line, 2);

    // the next report drops line 2 and accepts line 5
    now += STEP;
    session
        .ingest(
            msg(
                "UpdateWindow",
                json!({
                    "token": 7,
                    "name": "X",
                    "filename": "/ws/test.aplf",
                    "debugger": 1,
                    "stop": [5],
                    "text": [],
                }),
            ),
            now,
        )
        .unwrap();
    let states: Vec<(u32, bool)> = rec
        .breakpoint_changes()
        .iter()
        .skip(1)
        .map(|bp| (bp.line, bp.verified))
        .collect();
    assert!(states.contains(&(2, false)));
    assert!(states.contains(&(5, true)));
}

#[test]
fn test_terminate_resolves_with_goodbye_message() {
    let (mut session, rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    session.terminate(tx, now).unwrap();
    assert_eq!(frames.containing("Exit").len(), 1);
    assert_eq!(session.state(), SessionState::Terminating);

    now += STEP;
    session
        .ingest(msg("Disconnect", json!({ "message": "bye" })), now)
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), "bye");
    assert!(session.is_ended());
    assert_eq!(rec.terminations(), ["disconnect:bye"]);
}

#[test]
fn test_terminate_watchdog_fires_without_acknowledgment() {
    let (mut session, rec, _frames) = make_session(folder_opts(), None);
    let now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    session.terminate(tx, now).unwrap();
    assert!(rx.try_recv().is_err());

    session.tick(now + EXIT_TIMEOUT).unwrap();
    assert_eq!(rx.try_recv().unwrap(), "");
    assert!(session.is_ended());
    assert_eq!(rec.terminations(), ["exited"]);
}

#[test]
fn test_sys_error_ends_session_with_output() {
    let (mut session, rec, _frames) = make_session(folder_opts(), None);
    let now = Instant::now();
    connect(&mut session, now);

    session
        .ingest(msg("SysError", json!({ "text": "broken", "stack": "" })), now)
        .unwrap();
    assert!(session.is_ended());
    assert_eq!(rec.terminations(), ["syserror:broken"]);
    assert!(rec.outputs().iter().any(|o| o.contains("SysError: broken")));
}

#[test]
fn test_stream_close_before_handshake_is_an_error() {
    let (mut session, _rec, _frames) = make_session(folder_opts(), None);
    assert!(matches!(
        session.on_stream_closed(),
        Err(Error::DisconnectBeforeHandshake)
    ));
}

#[test]
fn test_stream_close_after_handshake_ends_cleanly() {
    let (mut session, rec, _frames) = make_session(folder_opts(), None);
    connect(&mut session, Instant::now());
    session.on_stream_closed().unwrap();
    assert!(session.is_ended());
    assert_eq!(rec.terminations(), ["exited"]);
}

#[test]
fn test_status_snapshot_replaced_wholesale() {
    let (mut session, _rec, _frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);
    assert!(session.status().is_none());

    session
        .ingest(
            msg("InterpreterStatus", json!({ "ML": 1, "IO": 1, "SI": 0 })),
            now,
        )
        .unwrap();
    now += STEP;
    session
        .ingest(msg("InterpreterStatus", json!({ "ML": 3, "TRAP": 1 })), now)
        .unwrap();

    let status = session.status().unwrap();
    assert_eq!(status.ml, 3);
    assert_eq!(status.trap, 1);
    // replaced, not merged
    assert_eq!(status.io, 0);
}

#[test]
fn test_step_commands_and_continued_events() {
    let (mut session, rec, frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);
    now += STEP;
    session
        .ingest(msg("SetPromptType", json!({ "type": 1 })), now)
        .unwrap();
    now += STEP;
    session
        .ingest(msg("SetHighlightLine", json!({ "win": 7, "line": 2 })), now)
        .unwrap();
    assert_eq!(session.state(), SessionState::Stopped);

    session.step(false).unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(frames.containing("RunCurrentLine").len(), 1);

    session.step(true).unwrap();
    assert_eq!(frames.containing("TraceBackward").len(), 1);

    session.continue_execution(false).unwrap();
    assert_eq!(frames.containing(r#"["Continue""#).len(), 1);

    session.step_in().unwrap();
    assert_eq!(frames.containing("StepInto").len(), 1);

    assert_eq!(
        rec.events()
            .iter()
            .filter(|e| matches!(e, Event::Continued))
            .count(),
        4
    );

    // step out never talks to the interpreter, it synthesizes a stop
    let frames_before = frames.all().len();
    session.step_out();
    assert_eq!(frames.all().len(), frames_before);
    assert_eq!(rec.stops().last(), Some(&(StopReason::Step, 2)));
}

#[test]
fn test_task_dialog_reported_and_answered() {
    let (mut session, rec, frames) = make_session(folder_opts(), None);
    let now = Instant::now();
    connect(&mut session, now);

    session
        .ingest(
            msg(
                "TaskDialog",
                json!({ "token": 5, "text": "save?", "buttonText": ["yes", "no"] }),
            ),
            now,
        )
        .unwrap();
    assert!(matches!(rec.events().last(), Some(Event::TaskDialog(5))));

    // replies bypass the prompt gate
    session.reply_task_dialog(100, 5).unwrap();
    assert_eq!(frames.containing("ReplyTaskDialog").len(), 1);
}

#[test]
fn test_data_breakpoints_tracked_locally() {
    let (mut session, _rec, _frames) = make_session(folder_opts(), None);
    connect(&mut session, Instant::now());

    assert!(!session.set_data_breakpoint(""));
    assert!(session.set_data_breakpoint("counts"));
    assert!(session.set_data_breakpoint("total"));
    assert_eq!(session.data_breakpoints().count(), 2);

    session.clear_data_breakpoints();
    assert_eq!(session.data_breakpoints().count(), 0);
}

#[test]
fn test_cancelled_request_resolves_empty() {
    let (mut session, _rec, _frames) = make_session(folder_opts(), None);
    let mut now = Instant::now();
    connect(&mut session, now);

    let (tx, rx) = channel();
    session.request_value_tip(1, 1, Some(7), tx, now).unwrap();
    session.cancel(7);

    now += STEP;
    session
        .ingest(msg("ValueTip", json!({ "token": 7, "tip": ["secret"] })), now)
        .unwrap();
    let tip = rx.try_recv().unwrap();
    assert!(tip.tip.is_empty(), "cancelled requests resolve empty");
}
