//! Threaded front end over the single-flow [`Session`]: a reader thread
//! decodes the inbound byte stream, a dispatch thread owns the session and
//! drains inputs one at a time, and the [`Bridge`] handle turns outward
//! operations into queued `Op`s with one-shot reply channels. Nothing
//! outside the dispatch thread ever touches session state.

use std::io::Read;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::fs::FileAccessor;

use super::breakpoint::SourceBreakpoint;
use super::codec::{Decoded, FrameCodec};
use super::correlation::Token;
use super::error::Error;
use super::protocol::{AutocompleteReply, TreeListReply, ValueTipReply};
use super::transport::{self, TcpLink};
use super::{LaunchOptions, Session, SessionHook, SessionState, StackInfo};

/// Bounded wait in [`Bridge::launch`] for the decoded `UsingProtocol=2` ack.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const IDLE_WAKEUP: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 64 * 1024;

enum Input {
    Wire(Decoded),
    WireError(Error),
    Closed,
    Op(Op),
}

enum Op {
    SetBreakpoint {
        path: String,
        line: u32,
        reply: Sender<SourceBreakpoint>,
    },
    ClearBreakpoints {
        path: String,
    },
    BreakpointLocations {
        path: String,
        line: u32,
        reply: Sender<bool>,
    },
    Continue {
        reverse: bool,
    },
    Step {
        reverse: bool,
    },
    StepIn,
    StepOut,
    TraceForward,
    Cutback,
    Evaluate {
        expression: String,
    },
    ValueTip {
        line: u32,
        pos: u32,
        token: Option<Token>,
        reply: Sender<ValueTipReply>,
    },
    Tree {
        node_id: i64,
        reply: Sender<TreeListReply>,
    },
    Stack {
        reply: Sender<StackInfo>,
    },
    Autocomplete {
        line: String,
        pos: u32,
        reply: Sender<AutocompleteReply>,
    },
    ReplyTaskDialog {
        index: i64,
        token: i64,
    },
    Interrupt {
        strong: bool,
    },
    Format {
        text: Vec<String>,
    },
    Cancel {
        token: Token,
    },
    SetDataBreakpoint {
        address: String,
        reply: Sender<bool>,
    },
    ClearDataBreakpoints,
    Terminate {
        reply: Sender<String>,
    },
}

/// Handle to a running debug session. Cheap to use from any thread: every
/// method enqueues work for the dispatch thread and returns immediately,
/// correlated operations hand back a one-shot receiver.
pub struct Bridge {
    inputs: Sender<Input>,
    dispatcher: Option<JoinHandle<Result<(), Error>>>,
    reader: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Spawn the interpreter, accept its connection, greet it, and wait for
    /// the protocol acknowledgment.
    pub fn launch<H>(
        opts: LaunchOptions,
        hook: H,
        accessor: Arc<dyn FileAccessor>,
    ) -> Result<Self, Error>
    where
        H: SessionHook + Send + 'static,
    {
        let listener = transport::bind_listener()?;
        let addr = listener.local_addr().map_err(Error::Bind)?;
        let mut child =
            transport::spawn_interpreter(&opts.exe, &opts.folder, &addr, opts.config_file.as_deref())?;

        let stream =
            match transport::accept_interpreter(&listener, Some(&mut child), transport::ACCEPT_TIMEOUT)
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = child.kill();
                    return Err(e);
                }
            };
        drop(listener);

        let mut link = TcpLink::new(stream.try_clone()?)?;
        transport::send_greeting(&mut link)?;
        let session = Session::new(opts, hook, accessor, Box::new(link), Some(child));
        Self::start(session, stream)
    }

    /// Drive an already-connected stream without spawning a process. The
    /// greeting is still sent and the handshake still awaited; embedders (and
    /// tests) manage the interpreter themselves.
    pub fn attach<H>(
        opts: LaunchOptions,
        hook: H,
        accessor: Arc<dyn FileAccessor>,
        stream: TcpStream,
    ) -> Result<Self, Error>
    where
        H: SessionHook + Send + 'static,
    {
        let mut link = TcpLink::new(stream.try_clone()?)?;
        transport::send_greeting(&mut link)?;
        let session = Session::new(opts, hook, accessor, Box::new(link), None);
        Self::start(session, stream)
    }

    fn start<H>(session: Session<H>, stream: TcpStream) -> Result<Self, Error>
    where
        H: SessionHook + Send + 'static,
    {
        let (inputs, input_rx) = channel();
        let (ready_tx, ready_rx) = channel();

        let wire_tx = inputs.clone();
        let read_stream = stream.try_clone()?;
        let reader = thread::Builder::new()
            .name("ride-reader".to_string())
            .spawn(move || read_loop(read_stream, wire_tx))?;

        let dispatcher = thread::Builder::new()
            .name("ride-dispatch".to_string())
            .spawn(move || run_loop(session, input_rx, stream, ready_tx))?;

        match ready_rx.recv_timeout(HANDSHAKE_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                inputs,
                dispatcher: Some(dispatcher),
                reader: Some(reader),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        }
    }

    fn op(&self, op: Op) {
        if self.inputs.send(Input::Op(op)).is_err() {
            warn!(target: "bridge", "operation after session end dropped");
        }
    }

    pub fn set_breakpoint(&self, path: &str, line: u32) -> Receiver<SourceBreakpoint> {
        let (reply, rx) = channel();
        self.op(Op::SetBreakpoint {
            path: path.to_string(),
            line,
            reply,
        });
        rx
    }

    pub fn clear_breakpoints(&self, path: &str) {
        self.op(Op::ClearBreakpoints {
            path: path.to_string(),
        });
    }

    pub fn breakpoint_locations(&self, path: &str, line: u32) -> Receiver<bool> {
        let (reply, rx) = channel();
        self.op(Op::BreakpointLocations {
            path: path.to_string(),
            line,
            reply,
        });
        rx
    }

    pub fn continue_execution(&self, reverse: bool) {
        self.op(Op::Continue { reverse });
    }

    pub fn step(&self, reverse: bool) {
        self.op(Op::Step { reverse });
    }

    pub fn step_in(&self) {
        self.op(Op::StepIn);
    }

    pub fn step_out(&self) {
        self.op(Op::StepOut);
    }

    pub fn trace_forward(&self) {
        self.op(Op::TraceForward);
    }

    pub fn cutback(&self) {
        self.op(Op::Cutback);
    }

    pub fn evaluate(&self, expression: &str) {
        self.op(Op::Evaluate {
            expression: expression.to_string(),
        });
    }

    pub fn value_tip(&self, line: u32, pos: u32, token: Option<Token>) -> Receiver<ValueTipReply> {
        let (reply, rx) = channel();
        self.op(Op::ValueTip {
            line,
            pos,
            token,
            reply,
        });
        rx
    }

    pub fn tree_children(&self, node_id: i64) -> Receiver<TreeListReply> {
        let (reply, rx) = channel();
        self.op(Op::Tree { node_id, reply });
        rx
    }

    pub fn stack(&self) -> Receiver<StackInfo> {
        let (reply, rx) = channel();
        self.op(Op::Stack { reply });
        rx
    }

    pub fn autocomplete(&self, line: &str, pos: u32) -> Receiver<AutocompleteReply> {
        let (reply, rx) = channel();
        self.op(Op::Autocomplete {
            line: line.to_string(),
            pos,
            reply,
        });
        rx
    }

    pub fn reply_task_dialog(&self, index: i64, token: i64) {
        self.op(Op::ReplyTaskDialog { index, token });
    }

    pub fn interrupt(&self, strong: bool) {
        self.op(Op::Interrupt { strong });
    }

    pub fn format_code(&self, text: Vec<String>) {
        self.op(Op::Format { text });
    }

    pub fn cancel(&self, token: Token) {
        self.op(Op::Cancel { token });
    }

    pub fn set_data_breakpoint(&self, address: &str) -> Receiver<bool> {
        let (reply, rx) = channel();
        self.op(Op::SetDataBreakpoint {
            address: address.to_string(),
            reply,
        });
        rx
    }

    pub fn clear_data_breakpoints(&self) {
        self.op(Op::ClearDataBreakpoints);
    }

    /// Orderly shutdown; resolves with the interpreter's goodbye message, or
    /// an empty string if the process had to be killed.
    pub fn terminate(&self) -> Receiver<String> {
        let (reply, rx) = channel();
        self.op(Op::Terminate { reply });
        rx
    }

    /// Wait for the session to end and surface its final result.
    pub fn join(mut self) -> Result<(), Error> {
        let dispatcher = self.dispatcher.take();
        let reader = self.reader.take();
        drop(self); // close the input channel so the loop can drain out
        let result = match dispatcher {
            Some(handle) => handle.join().unwrap_or(Ok(())),
            None => Ok(()),
        };
        if let Some(handle) = reader {
            let _ = handle.join();
        }
        result
    }
}

fn read_loop(mut stream: TcpStream, tx: Sender<Input>) {
    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(Input::Closed);
                return;
            }
            Ok(n) => {
                codec.feed(&buf[..n]);
                loop {
                    match codec.next() {
                        Ok(Some(item)) => {
                            if tx.send(Input::Wire(item)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Input::WireError(e));
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Input::WireError(e.into()));
                return;
            }
        }
    }
}

fn run_loop<H: SessionHook>(
    mut session: Session<H>,
    rx: Receiver<Input>,
    stream: TcpStream,
    ready: Sender<Result<(), Error>>,
) -> Result<(), Error> {
    let mut ready = Some(ready);
    let result = loop {
        if session.is_ended() {
            break Ok(());
        }
        let now = Instant::now();
        let timeout = session
            .next_deadline()
            .map(|d| d.saturating_duration_since(now).max(Duration::from_millis(1)))
            .unwrap_or(IDLE_WAKEUP);

        let step = match rx.recv_timeout(timeout) {
            Ok(Input::Wire(item)) => session.ingest(item, Instant::now()),
            Ok(Input::WireError(e)) => Err(e),
            Ok(Input::Closed) => session.on_stream_closed(),
            Ok(Input::Op(op)) => handle_op(&mut session, op),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        };
        if let Err(e) = step {
            break Err(e);
        }
        if let Err(e) = session.tick(Instant::now()) {
            break Err(e);
        }
        if session.state() != SessionState::Launching {
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
        }
    };

    // unblock the reader whichever side ended first
    let _ = stream.shutdown(Shutdown::Both);
    info!(target: "bridge", "dispatch loop finished");

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(target: "bridge", "session ended with error: {e:#}");
            match ready.take() {
                // surface startup failures to the launch caller, not the join
                Some(tx) => {
                    let _ = tx.send(Err(e));
                    Ok(())
                }
                None => Err(e),
            }
        }
    }
}

fn handle_op<H: SessionHook>(session: &mut Session<H>, op: Op) -> Result<(), Error> {
    match op {
        Op::SetBreakpoint { path, line, reply } => {
            let bp = session.set_breakpoint(&path, line)?;
            let _ = reply.send(bp);
            Ok(())
        }
        Op::ClearBreakpoints { path } => session.clear_breakpoints(&path).map(|_| ()),
        Op::BreakpointLocations { path, line, reply } => {
            let _ = reply.send(session.breakpoint_locations(&path, line));
            Ok(())
        }
        Op::Continue { reverse } => session.continue_execution(reverse),
        Op::Step { reverse } => session.step(reverse),
        Op::StepIn => session.step_in(),
        Op::StepOut => {
            session.step_out();
            Ok(())
        }
        Op::TraceForward => session.trace_forward(),
        Op::Cutback => session.cutback(),
        Op::Evaluate { expression } => session.evaluate(&expression),
        Op::ValueTip {
            line,
            pos,
            token,
            reply,
        } => session
            .request_value_tip(line, pos, token, reply, Instant::now())
            .map(|_| ()),
        Op::Tree { node_id, reply } => session.request_tree(node_id, reply),
        Op::Stack { reply } => session.request_stack(reply),
        Op::Autocomplete { line, pos, reply } => {
            session.request_autocomplete(&line, pos, reply).map(|_| ())
        }
        Op::ReplyTaskDialog { index, token } => session.reply_task_dialog(index, token),
        Op::Interrupt { strong } => session.interrupt(strong),
        Op::Format { text } => session.request_format(&text),
        Op::Cancel { token } => {
            session.cancel(token);
            Ok(())
        }
        Op::SetDataBreakpoint { address, reply } => {
            let _ = reply.send(session.set_data_breakpoint(&address));
            Ok(())
        }
        Op::ClearDataBreakpoints => {
            session.clear_data_breakpoints();
            Ok(())
        }
        Op::Terminate { reply } => session.terminate(reply, Instant::now()),
    }
}
