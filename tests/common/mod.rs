#![allow(dead_code)]

use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use ride_bridge::fs::FileAccessor;
use ride_bridge::runtime::breakpoint::SourceBreakpoint;
use ride_bridge::runtime::codec::{encode_frame, Decoded};
use ride_bridge::runtime::error::Error;
use ride_bridge::runtime::protocol::TaskDialogInfo;
use ride_bridge::runtime::transport::RideTransport;
use ride_bridge::runtime::{EndReason, SessionHook, StopReason};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub enum Event {
    Stop(StopReason, u32),
    Continued,
    Output(String),
    Breakpoint(SourceBreakpoint),
    TaskDialog(i64),
    Format(i64, Vec<String>),
    Terminated(String),
}

/// Event recorder shared with the session under test.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn outputs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Output(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<(StopReason, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Stop(reason, line) => Some((reason, line)),
                _ => None,
            })
            .collect()
    }

    pub fn breakpoint_changes(&self) -> Vec<SourceBreakpoint> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Breakpoint(bp) => Some(bp),
                _ => None,
            })
            .collect()
    }

    pub fn terminations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Terminated(reason) => Some(reason),
                _ => None,
            })
            .collect()
    }
}

pub struct TestHook {
    pub rec: Recorder,
}

impl TestHook {
    pub fn new(rec: Recorder) -> Self {
        Self { rec }
    }
}

impl SessionHook for TestHook {
    fn on_stop(&self, reason: StopReason, line: u32) -> anyhow::Result<()> {
        self.rec.push(Event::Stop(reason, line));
        Ok(())
    }

    fn on_continued(&self) {
        self.rec.push(Event::Continued);
    }

    fn on_output(&self, text: &str) {
        self.rec.push(Event::Output(text.to_string()));
    }

    fn on_breakpoint_change(&self, bp: &SourceBreakpoint) {
        self.rec.push(Event::Breakpoint(bp.clone()));
    }

    fn on_task_dialog(&self, dialog: &TaskDialogInfo) {
        self.rec.push(Event::TaskDialog(dialog.token));
    }

    fn on_format_code(&self, win: i64, text: &[String]) {
        self.rec.push(Event::Format(win, text.to_vec()));
    }

    fn on_terminated(&self, reason: &EndReason) {
        let tag = match reason {
            EndReason::Disconnect(msg) => format!("disconnect:{msg}"),
            EndReason::SysError(text) => format!("syserror:{text}"),
            EndReason::Exited => "exited".to_string(),
        };
        self.rec.push(Event::Terminated(tag));
    }
}

/// Records outbound command payloads instead of writing to a socket.
#[derive(Clone, Default)]
pub struct SentFrames(Arc<Mutex<Vec<String>>>);

impl SentFrames {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn containing(&self, needle: &str) -> Vec<String> {
        self.all().into_iter().filter(|p| p.contains(needle)).collect()
    }
}

pub struct RecordingLink {
    pub frames: SentFrames,
}

impl RideTransport for RecordingLink {
    fn send(&mut self, payload: &str) -> Result<(), Error> {
        self.frames.0.lock().unwrap().push(payload.to_string());
        Ok(())
    }
}

/// File accessor that serves a canned link-table dump and swallows writes.
#[derive(Default)]
pub struct StubAccessor {
    pub link_dump: Option<String>,
}

impl FileAccessor for StubAccessor {
    fn read_file(&self, path: &str) -> io::Result<String> {
        if path.contains(".ride-links-") {
            if let Some(dump) = &self.link_dump {
                return Ok(dump.clone());
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn write_file(&self, _path: &str, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn delete_file(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    fn check_exists(&self, path: &str, _timeout: Duration) -> bool {
        path.contains(".ride-links-") && self.link_dump.is_some()
    }
}

pub fn msg(name: &str, body: Value) -> Decoded {
    Decoded::Message {
        name: name.to_string(),
        body,
    }
}

/// The other end of the wire: a scripted interpreter for socket-level tests.
pub struct FakeInterpreter {
    stream: TcpStream,
}

impl FakeInterpreter {
    pub fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    /// Read one frame and return its payload text.
    pub fn recv_payload(&mut self) -> String {
        let mut preamble = [0u8; 8];
        self.stream.read_exact(&mut preamble).unwrap();
        let total = u32::from_be_bytes(preamble[..4].try_into().unwrap()) as usize;
        assert_eq!(&preamble[4..], b"RIDE");
        let mut payload = vec![0u8; total - 8];
        self.stream.read_exact(&mut payload).unwrap();
        String::from_utf8(payload).unwrap()
    }

    /// Read frames until one is a `[name, body]` message; returns the pair.
    pub fn recv_message(&mut self) -> (String, Value) {
        loop {
            let payload = self.recv_payload();
            if payload.starts_with('[') {
                let (name, body): (String, Value) = serde_json::from_str(&payload).unwrap();
                return (name, body);
            }
        }
    }

    pub fn send(&mut self, payload: &str) {
        self.stream.write_all(&encode_frame(payload)).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn send_msg(&mut self, name: &str, body: Value) {
        self.send(&serde_json::json!([name, body]).to_string());
    }
}
