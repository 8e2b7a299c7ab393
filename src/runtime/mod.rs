//! The debugger-session core: one spawned interpreter, one connection, one
//! dispatch flow. Decoded interpreter messages run through the ordered queue
//! and an exhaustive dispatch; outward operations (continue, step, evaluate,
//! inspect) send commands and never block on interpreter I/O.

pub mod breakpoint;
pub mod client;
pub mod codec;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod window;

use std::collections::{HashSet, VecDeque};
use std::process::Child;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::fs::FileAccessor;
use crate::weak_error;

use breakpoint::{stop_expression, BreakpointRegistry, LinkMap, SourceBreakpoint};
use codec::Decoded;
use correlation::{CorrelationTable, Token};
use error::Error;
use protocol::{
    AutocompleteReply, Command, HighlightLine, Identity, InterpreterStatus, RideMessage,
    SiStackReply, TaskDialogInfo, TreeListReply, ValueTipReply, WindowContent,
};
use queue::{Dispatch, MessageQueue, Rundown, RundownTimer};
use transport::RideTransport;
use window::WindowRegistry;

/// A value-tip request the interpreter never answers resolves empty after
/// this long; tips for invalid expressions are legitimately unanswered.
pub const TIP_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded wait for the interpreter's disconnect acknowledgment after `Exit`
/// before the process is killed outright.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for the link-table dump file to appear.
pub const LINK_DUMP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Launching,
    Connected,
    Ready,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Entry,
    Step,
    Breakpoint,
    DataBreakpoint,
    Exception,
}

#[derive(Debug, Clone)]
pub enum EndReason {
    /// Orderly disconnect; carries the interpreter's goodbye message.
    Disconnect(String),
    /// The interpreter reported a fatal system error.
    SysError(String),
    /// The process or its connection went away.
    Exited,
}

/// One synthesized stack frame. `file`/`line` are present when the frame
/// description resolves through the link map.
#[derive(Debug, Clone, Default)]
pub struct StackFrame {
    pub index: usize,
    pub name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct StackInfo {
    pub frames: Vec<StackFrame>,
    pub tid: i64,
}

/// Callbacks into the outer debugger-session layer.
pub trait SessionHook {
    fn on_stop(&self, reason: StopReason, line: u32) -> anyhow::Result<()>;
    fn on_continued(&self);
    fn on_output(&self, text: &str);
    fn on_breakpoint_change(&self, bp: &SourceBreakpoint);
    fn on_task_dialog(&self, dialog: &TaskDialogInfo);
    fn on_format_code(&self, win: i64, text: &[String]);
    fn on_terminated(&self, reason: &EndReason);
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Interpreter executable.
    pub exe: String,
    /// Optional interpreter configuration file, passed through the environment.
    pub config_file: Option<String>,
    /// Entry source file; without one the working folder is linked instead.
    pub program: Option<String>,
    /// Working folder.
    pub folder: String,
    /// Trace into the entry file instead of running it.
    pub stop_on_entry: bool,
    /// Run without debugging: no link resolution, no breakpoint pushes.
    pub no_debug: bool,
}

/// `#.Foo[3]` → name + line; plain descriptions stay opaque frames.
static STACK_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)\[(\d+)\]").expect("valid stack frame pattern"));

pub struct Session<H: SessionHook> {
    state: SessionState,
    opts: LaunchOptions,
    hook: H,
    accessor: Arc<dyn FileAccessor>,
    link: Box<dyn RideTransport>,
    child: Option<Child>,

    queue: MessageQueue,
    timer: RundownTimer,

    prompt_type: i64,
    banner_done: bool,
    deferred: VecDeque<Command>,

    breakpoints: BreakpointRegistry,
    links: LinkMap,
    windows: WindowRegistry,
    break_addresses: HashSet<String>,

    tips: CorrelationTable<ValueTipReply>,
    trees: CorrelationTable<TreeListReply>,
    completions: CorrelationTable<AutocompleteReply>,

    stack_waiters: Vec<Sender<StackInfo>>,
    stack_cache: Option<StackInfo>,
    stack_inflight: bool,

    status: Option<InterpreterStatus>,
    identity: Option<Identity>,
    display_name: String,

    had_error: Option<i64>,
    entry_stop_pending: bool,
    current_win: i64,
    current_line: u32,
    current_column: Option<u32>,

    cancelled: HashSet<Token>,
    terminate_deadline: Option<Instant>,
    terminate_waiters: Vec<Sender<String>>,
    end: Option<EndReason>,
}

impl<H: SessionHook> Session<H> {
    pub fn new(
        opts: LaunchOptions,
        hook: H,
        accessor: Arc<dyn FileAccessor>,
        link: Box<dyn RideTransport>,
        child: Option<Child>,
    ) -> Self {
        Self {
            state: SessionState::Launching,
            opts,
            hook,
            accessor,
            link,
            child,
            queue: MessageQueue::default(),
            timer: RundownTimer::default(),
            prompt_type: 0,
            banner_done: false,
            deferred: VecDeque::new(),
            breakpoints: BreakpointRegistry::default(),
            links: LinkMap::default(),
            windows: WindowRegistry::default(),
            break_addresses: HashSet::new(),
            tips: CorrelationTable::default(),
            trees: CorrelationTable::default(),
            completions: CorrelationTable::default(),
            stack_waiters: vec![],
            stack_cache: None,
            stack_inflight: false,
            status: None,
            identity: None,
            display_name: String::new(),
            had_error: None,
            entry_stop_pending: false,
            current_win: 0,
            current_line: 0,
            current_column: None,
            cancelled: HashSet::new(),
            terminate_deadline: None,
            terminate_waiters: vec![],
            end: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Terminated
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end.as_ref()
    }

    /// Last interpreter status push, replaced wholesale on each update.
    pub fn status(&self) -> Option<&InterpreterStatus> {
        self.status.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn current_line(&self) -> u32 {
        self.current_line
    }

    // ------------------------------- inbound flow -----------------------------------------------

    /// Feed one decoded wire item. Messages are queued and run down on the
    /// debounced schedule; a rejected handshake is fatal.
    pub fn ingest(&mut self, item: Decoded, now: Instant) -> Result<(), Error> {
        match item {
            Decoded::Handshake { accepted, version } => {
                if !accepted {
                    return Err(Error::UnsupportedProtocol(version));
                }
                info!(target: "bridge", "interpreter speaks protocol {version}");
                if self.state == SessionState::Launching {
                    self.state = SessionState::Connected;
                }
                Ok(())
            }
            Decoded::LegacyGreeting => {
                log::error!(target: "bridge", "cannot talk to interpreters older than v15.0");
                Ok(())
            }
            Decoded::Message { name, body } => {
                self.queue.push(RideMessage::decode(&name, body)?);
                if self.timer.request(now) == Rundown::Now {
                    self.rundown(now)?;
                }
                Ok(())
            }
        }
    }

    /// Periodic housekeeping: due rundowns, tip expiry, the terminate watchdog.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        if self.timer.due(now) {
            self.rundown(now)?;
        }
        self.tips.expire(now);
        if self.terminate_deadline.is_some_and(|d| now >= d) {
            self.force_terminate();
        }
        Ok(())
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.timer.deadline(),
            self.tips.next_deadline(),
            self.terminate_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// The stream went away. Before the handshake that is a connectivity
    /// error; afterwards it is a normal end of session.
    pub fn on_stream_closed(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Terminated => Ok(()),
            SessionState::Launching => Err(Error::DisconnectBeforeHandshake),
            _ => {
                info!(target: "bridge", "interpreter connection closed");
                for tx in self.terminate_waiters.drain(..) {
                    let _ = tx.send(String::new());
                }
                self.terminate_deadline = None;
                self.finish(EndReason::Exited);
                Ok(())
            }
        }
    }

    fn rundown(&mut self, now: Instant) -> Result<(), Error> {
        debug!(target: "bridge", "rundown: {} queued", self.queue.len());
        while let Some(item) = self.queue.next_item() {
            match item {
                Dispatch::Output(text) => self.hook.on_output(&text),
                Dispatch::Message(msg) => self.dispatch(msg)?,
            }
        }
        self.timer.finished(now);
        Ok(())
    }

    fn dispatch(&mut self, msg: RideMessage) -> Result<(), Error> {
        match msg {
            RideMessage::Identify(x) => {
                info!(
                    target: "bridge",
                    "connected to {} {} ({})", x.language, x.version, x.platform
                );
                self.identity = Some(x);
            }
            RideMessage::InvalidSyntax => log::error!(target: "bridge", "invalid syntax"),
            RideMessage::Disconnect(x) => self.handle_disconnect(x.message),
            RideMessage::SysError(x) => {
                log::error!(target: "bridge", "SysError: {} {}", x.text, x.stack);
                self.hook.on_output(&format!("SysError: {}\n", x.text));
                self.finish(EndReason::SysError(x.text));
            }
            RideMessage::InternalError(x) => {
                log::error!(
                    target: "bridge",
                    "an error ({}) occurred processing {}", x.error, x.message
                );
            }
            RideMessage::Notification(x) => self.hook.on_output(&format!("{}\n", x.message)),
            RideMessage::UpdateDisplayName(x) => self.display_name = x.display_name,
            RideMessage::EchoInput(x) => self.hook.on_output(&x.input),
            RideMessage::SetPromptType(x) => self.handle_prompt(x.kind)?,
            RideMessage::HadError(x) => self.had_error = Some(x.error),
            RideMessage::GotoWindow(x) => self.current_win = x.win,
            RideMessage::WindowTypeChanged(x) => self.windows.set_tracer(x.win, x.tracer != 0),
            RideMessage::ReplyGetAutocomplete(x) => {
                let value = if self.cancelled.remove(&x.token) {
                    AutocompleteReply::default()
                } else {
                    x.clone()
                };
                self.completions.resolve(x.token, value);
            }
            RideMessage::ValueTip(x) => {
                let value = if self.cancelled.remove(&x.token) {
                    ValueTipReply::default()
                } else {
                    x.clone()
                };
                self.tips.resolve(x.token, value);
            }
            RideMessage::SetHighlightLine(x) => self.handle_highlight(x),
            RideMessage::OpenWindow(x) => {
                self.current_win = x.token;
                self.apply_window(&x);
            }
            RideMessage::UpdateWindow(x) => self.apply_window(&x),
            RideMessage::CloseWindow(x) => {
                self.windows.close(x.win);
            }
            RideMessage::ReplySaveChanges(x) => {
                debug!(target: "bridge", "save changes for win {}: err {}", x.win, x.err);
            }
            RideMessage::TaskDialog(x) => {
                if self.state == SessionState::Running {
                    self.state = SessionState::Stopped;
                }
                self.hook.on_task_dialog(&x);
            }
            RideMessage::ReplyGetSIStack(x) => self.handle_stack_reply(x),
            RideMessage::ReplyTreeList(x) => {
                let token = x.node_id;
                let value = if self.cancelled.remove(&token) {
                    TreeListReply::default()
                } else {
                    x
                };
                self.trees.resolve(token, value);
            }
            RideMessage::InterpreterStatus(x) => self.status = Some(x),
            RideMessage::StatusOutput(x) => {
                info!(target: "bridge", "status: {}", x.text.trim_end());
            }
            RideMessage::ReplyGetLog(x) => self.hook.on_output(&format!("{}\n", x.result.join("\n"))),
            RideMessage::AppendSessionOutput(x) => self.hook.on_output(&x.result),
            RideMessage::UnknownCommand(x) => {
                warn!(target: "bridge", "interpreter does not support `{}`", x.name);
            }
            RideMessage::ReplyFormatCode(x) => self.hook.on_format_code(x.win, &x.text),
            RideMessage::ShowHtml(_)
            | RideMessage::OptionsDialog(_)
            | RideMessage::StringDialog(_)
            | RideMessage::ReplyGetThreads(_)
            | RideMessage::ReplyGetConfiguration(_) => {
                debug!(target: "bridge", "ignoring GUI-level message");
            }
            RideMessage::Unrecognized { name, .. } => {
                warn!(target: "bridge", "unrecognized interpreter command `{name}`");
                self.send(protocol::unknown_command(&name))?;
            }
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, message: String) {
        if self.state == SessionState::Terminating {
            // orderly: the interpreter acknowledged our Exit and will go
            // away by itself, no force-kill
            for tx in self.terminate_waiters.drain(..) {
                let _ = tx.send(message.clone());
            }
            self.terminate_deadline = None;
            if let Some(child) = self.child.as_mut() {
                let _ = child.try_wait();
            }
        } else {
            log::error!(target: "bridge", "interpreter disconnected: {message}");
        }
        self.finish(EndReason::Disconnect(message));
    }

    fn handle_prompt(&mut self, kind: i64) -> Result<(), Error> {
        self.prompt_type = kind;
        if kind != 0 {
            self.flush_deferred()?;
        }
        if kind == 1 && !self.banner_done {
            self.banner_done = true;
            if matches!(self.state, SessionState::Launching | SessionState::Connected) {
                self.state = SessionState::Ready;
            }
            self.startup_sequence()?;
        } else if kind == 1 && self.state == SessionState::Running {
            // execution ran to completion without another stop
            self.state = SessionState::Ready;
        }
        Ok(())
    }

    fn handle_highlight(&mut self, h: HighlightLine) {
        self.current_win = h.win;
        self.current_line = h.line;
        self.current_column = None;
        self.stack_cache = None;
        self.state = SessionState::Stopped;

        let reason = if self.had_error.take().is_some() {
            StopReason::Breakpoint
        } else if self.entry_stop_pending {
            self.entry_stop_pending = false;
            StopReason::Entry
        } else {
            StopReason::Step
        };
        weak_error!(self.hook.on_stop(reason, h.line), "stop hook:");
    }

    fn apply_window(&mut self, content: &WindowContent) {
        self.windows.upsert(content);
        let path = self
            .links
            .path_for_name(&content.name)
            .map(|e| e.path.clone())
            .or_else(|| (!content.filename.is_empty()).then(|| content.filename.clone()));
        let Some(path) = path else { return };
        for bp in self.breakpoints.apply_stop_report(&path, &content.stop) {
            self.hook.on_breakpoint_change(&bp);
        }
    }

    fn handle_stack_reply(&mut self, reply: SiStackReply) {
        let info = self.synthesize_stack(&reply);
        self.stack_inflight = false;
        self.stack_cache = Some(info.clone());
        for tx in self.stack_waiters.drain(..) {
            let _ = tx.send(info.clone());
        }
    }

    fn synthesize_stack(&self, reply: &SiStackReply) -> StackInfo {
        let frames = reply
            .stack
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let desc = entry.description.trim();
                match STACK_FRAME.captures(desc) {
                    Some(c) => {
                        let name = c[1].to_string();
                        let line = c[2].parse().ok();
                        let file = self.links.path_for_name(&name).map(|e| e.path.clone());
                        StackFrame {
                            index,
                            name,
                            file,
                            line,
                            column: if index == 0 { self.current_column } else { None },
                        }
                    }
                    None => StackFrame {
                        index,
                        name: desc.to_string(),
                        ..Default::default()
                    },
                }
            })
            .collect();
        StackInfo {
            frames,
            tid: reply.tid,
        }
    }

    // ------------------------------- outbound flow ----------------------------------------------

    /// Gate and send: always-safe commands go out immediately, anything else
    /// waits for an interactive prompt (queued, not dropped).
    fn send(&mut self, cmd: Command) -> Result<(), Error> {
        if self.prompt_type != 0 || protocol::is_always_allowed(cmd.name) {
            self.transmit(&cmd)
        } else {
            debug!(target: "bridge", "deferring `{}` until the first interactive prompt", cmd.name);
            self.deferred.push_back(cmd);
            Ok(())
        }
    }

    fn transmit(&mut self, cmd: &Command) -> Result<(), Error> {
        self.link.send(&cmd.encode())
    }

    fn flush_deferred(&mut self) -> Result<(), Error> {
        while let Some(cmd) = self.deferred.pop_front() {
            self.transmit(&cmd)?;
        }
        Ok(())
    }

    fn exec(&mut self, trace: bool, expression: &str) -> Result<(), Error> {
        self.send(protocol::execute(trace, expression))
    }

    /// First interactive prompt: fix and run the entry file (or link the
    /// working folder), resolving links and flushing deferred breakpoint
    /// pushes in between.
    fn startup_sequence(&mut self) -> Result<(), Error> {
        if let Some(program) = self.opts.program.clone() {
            self.exec(false, &format!("name←⊃2 ⎕FIX 'file://{program}'"))?;
            if !self.opts.no_debug {
                self.resolve_links()?;
                let linked: Vec<String> = self
                    .breakpoints
                    .paths()
                    .filter(|p| self.links.name_for_path(p).is_some())
                    .map(str::to_string)
                    .collect();
                for path in linked {
                    self.push_stop_set(&path)?;
                }
            }
            self.entry_stop_pending = self.opts.stop_on_entry;
            let trace = self.opts.stop_on_entry && !self.opts.no_debug;
            self.exec(trace, "⍎name")?;
            self.state = SessionState::Running;
        } else {
            let folder = self.opts.folder.clone();
            self.exec(false, &format!("⎕SE.Link.Create # '{folder}'"))?;
        }
        Ok(())
    }

    /// Ask the interpreter to dump its name/file/line-count table to a temp
    /// file, wait for the file, and fold it into the link map.
    fn resolve_links(&mut self) -> Result<(), Error> {
        let dump_path = format!(
            "{}/.ride-links-{}.tsv",
            self.opts.folder.trim_end_matches('/'),
            Uuid::new_v4()
        );
        // one `name TAB source-file TAB line-count` row per fixed item
        let expr = format!(
            "({{⍵,(⎕UCS 9),(⊃(5179⌶)⍵),(⎕UCS 9),⍕≢⎕CR ⍵}}¨↓⎕NL ¯3 ¯4) ⎕NPUT '{dump_path}' 1"
        );
        self.exec(false, &expr)?;

        if !self.accessor.check_exists(&dump_path, LINK_DUMP_TIMEOUT) {
            warn!(target: "bridge", "link table dump did not appear at {dump_path}");
            return Ok(());
        }
        match self.accessor.read_file(&dump_path) {
            Ok(text) => {
                let entries = LinkMap::parse_dump(&text);
                info!(target: "bridge", "linked {} routine(s)", entries.len());
                for entry in entries {
                    self.links.insert(entry);
                }
                weak_error!(self.accessor.delete_file(&dump_path), "remove link dump:");
            }
            Err(e) => warn!(target: "bridge", "read link dump: {e:#}"),
        }
        Ok(())
    }

    /// Push the full stop-line set for the routine linked to `path`: one
    /// command per routine, through the open tracer window when there is one.
    fn push_stop_set(&mut self, path: &str) -> Result<(), Error> {
        let Some(entry) = self.links.name_for_path(path) else {
            debug!(target: "bridge", "breakpoints for {path} deferred until linked");
            return Ok(());
        };
        let name = entry.name.clone();
        let line_count = entry.line_count;
        let mut lines = self.breakpoints.lines(path);
        if line_count > 0 {
            lines.retain(|&l| l < line_count);
        }
        match self.windows.tracer_for(&name).map(|w| w.token) {
            Some(win) => self.send(protocol::set_line_attributes(win, &lines)),
            None => self.exec(false, &stop_expression(&lines, &name)),
        }
    }

    // ------------------------------- operations -------------------------------------------------

    /// Insert (or find) a breakpoint and push the updated stop set if the
    /// path is already linked; otherwise the push happens at link time.
    pub fn set_breakpoint(&mut self, path: &str, line: u32) -> Result<SourceBreakpoint, Error> {
        let bp = self.breakpoints.set(path, line);
        self.push_stop_set(path)?;
        Ok(bp)
    }

    pub fn clear_breakpoints(&mut self, path: &str) -> Result<Vec<SourceBreakpoint>, Error> {
        let removed = self.breakpoints.clear(path);
        self.push_stop_set(path)?;
        Ok(removed)
    }

    /// Whether the exact line holds a breakpoint (the interpreter has no
    /// column-granular stops, so this is a presence indicator).
    pub fn breakpoint_locations(&self, path: &str, line: u32) -> bool {
        self.breakpoints.exists(path, line)
    }

    pub fn set_data_breakpoint(&mut self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        self.break_addresses.insert(address.to_string());
        true
    }

    pub fn clear_data_breakpoints(&mut self) {
        self.break_addresses.clear();
    }

    pub fn data_breakpoints(&self) -> impl Iterator<Item = &str> {
        self.break_addresses.iter().map(String::as_str)
    }

    pub fn continue_execution(&mut self, reverse: bool) -> Result<(), Error> {
        let cmd = if reverse {
            protocol::trace_backward(self.current_win)
        } else {
            protocol::continue_run(self.current_win)
        };
        self.resume(cmd)
    }

    pub fn step(&mut self, reverse: bool) -> Result<(), Error> {
        let cmd = if reverse {
            protocol::trace_backward(self.current_win)
        } else {
            protocol::run_current_line(self.current_win)
        };
        self.resume(cmd)
    }

    pub fn step_in(&mut self) -> Result<(), Error> {
        self.resume(protocol::step_into(self.current_win))
    }

    pub fn trace_forward(&mut self) -> Result<(), Error> {
        self.resume(protocol::trace_forward(self.current_win))
    }

    pub fn cutback(&mut self) -> Result<(), Error> {
        self.resume(protocol::cutback(self.current_win))
    }

    /// "Step out" retreats one character position within the current line:
    /// the interpreter has no call-stack pop at this granularity, so this
    /// stays a local adjustment with a synthetic stop.
    pub fn step_out(&mut self) {
        if let Some(col) = self.current_column {
            self.current_column = (col > 1).then(|| col - 1);
        }
        weak_error!(
            self.hook.on_stop(StopReason::Step, self.current_line),
            "stop hook:"
        );
    }

    fn resume(&mut self, cmd: Command) -> Result<(), Error> {
        self.stack_cache = None;
        self.send(cmd)?;
        self.state = SessionState::Running;
        self.hook.on_continued();
        Ok(())
    }

    /// Free-form console evaluation; results come back as session output.
    pub fn evaluate(&mut self, expression: &str) -> Result<(), Error> {
        self.exec(false, expression)
    }

    /// Hover evaluation: a positional value tip against the current window.
    /// Resolves empty if the interpreter never answers. The caller may bring
    /// its own token (e.g. its request id, so [`cancel`](Self::cancel) can
    /// address it); it must be unique among outstanding tip requests.
    pub fn request_value_tip(
        &mut self,
        line: u32,
        pos: u32,
        token: Option<Token>,
        tx: Sender<ValueTipReply>,
        now: Instant,
    ) -> Result<Token, Error> {
        let token = token.unwrap_or_else(|| self.tips.allocate());
        self.tips.register_sender(token, tx, Some(now + TIP_TIMEOUT));
        self.send(protocol::get_value_tip(self.current_win, line, pos, token))?;
        Ok(token)
    }

    /// Expand one variable subtree; the node id doubles as the correlation
    /// token, so one round trip serves each distinct node.
    pub fn request_tree(&mut self, node_id: i64, tx: Sender<TreeListReply>) -> Result<(), Error> {
        self.trees.register_sender(node_id, tx, None);
        self.send(protocol::tree_list(node_id))
    }

    /// Retrieve the call stack, memoized per stop: concurrent callers share
    /// one interpreter round trip, later callers get the cached result.
    pub fn request_stack(&mut self, tx: Sender<StackInfo>) -> Result<(), Error> {
        if let Some(cached) = &self.stack_cache {
            let _ = tx.send(cached.clone());
            return Ok(());
        }
        self.stack_waiters.push(tx);
        if !self.stack_inflight {
            self.stack_inflight = true;
            self.send(protocol::get_si_stack())?;
        }
        Ok(())
    }

    pub fn request_autocomplete(
        &mut self,
        line: &str,
        pos: u32,
        tx: Sender<AutocompleteReply>,
    ) -> Result<Token, Error> {
        let token = self.completions.allocate();
        self.completions.register_sender(token, tx, None);
        self.send(protocol::get_autocomplete(line, pos, token))?;
        Ok(token)
    }

    pub fn reply_task_dialog(&mut self, index: i64, token: i64) -> Result<(), Error> {
        self.send(protocol::reply_task_dialog(index, token))
    }

    pub fn interrupt(&mut self, strong: bool) -> Result<(), Error> {
        self.send(protocol::interrupt(strong))
    }

    pub fn request_format(&mut self, text: &[String]) -> Result<(), Error> {
        self.send(protocol::format_code(self.current_win, text))
    }

    /// Cooperative cancellation: a later reply for this token resolves empty.
    /// The in-flight round trip itself is not aborted.
    pub fn cancel(&mut self, token: Token) {
        self.cancelled.insert(token);
    }

    /// Orderly shutdown: send `Exit` and wait (bounded) for the disconnect
    /// acknowledgment; the watchdog in [`tick`](Self::tick) force-kills if
    /// the interpreter never answers.
    pub fn terminate(&mut self, tx: Sender<String>, now: Instant) -> Result<(), Error> {
        self.state = SessionState::Terminating;
        self.terminate_waiters.push(tx);
        self.terminate_deadline = Some(now + EXIT_TIMEOUT);
        self.send(protocol::exit(0))
    }

    fn force_terminate(&mut self) {
        warn!(target: "bridge", "no disconnect acknowledgment, killing the interpreter");
        if let Some(child) = self.child.as_mut() {
            weak_error!(child.kill(), "kill interpreter:");
            weak_error!(child.wait(), "reap interpreter:");
        }
        for tx in self.terminate_waiters.drain(..) {
            let _ = tx.send(String::new());
        }
        self.terminate_deadline = None;
        self.finish(EndReason::Exited);
    }

    fn finish(&mut self, reason: EndReason) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;
        self.hook.on_terminated(&reason);
        self.end = Some(reason);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stack_frame_pattern() {
        let c = STACK_FRAME.captures("#.Fib[3]").unwrap();
        assert_eq!(&c[1], "#.Fib");
        assert_eq!(&c[2], "3");

        let c = STACK_FRAME.captures("#.Util.Log[12]").unwrap();
        assert_eq!(&c[1], "#.Util.Log");

        assert!(STACK_FRAME.captures("⍎").is_none());
    }
}
