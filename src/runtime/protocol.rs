//! Typed view of the RIDE protocol: inbound messages as one closed enum with
//! per-kind payload structs, and builders for the outbound command set.
//!
//! Payload schemas follow the interpreter's JSON field names; unknown fields
//! are ignored and missing ones default, so minor interpreter version drift
//! does not break decoding.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::Error;

// ---------------------------------- inbound payloads ---------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub version: String,
    pub arch: String,
    pub platform: String,
    #[serde(rename = "Language")]
    pub language: String,
    pub pid: i64,
}

impl Identity {
    /// Classic-edition interpreters announce an architecture starting with `C`.
    pub fn is_classic(&self) -> bool {
        self.arch.starts_with('C')
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DisconnectInfo {
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SysErrorInfo {
    pub text: String,
    pub stack: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InternalErrorInfo {
    pub error: i64,
    pub error_text: String,
    pub dmx: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationInfo {
    pub message: String,
    pub token: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DisplayName {
    #[serde(rename = "displayName")]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EchoInputInfo {
    pub input: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptInfo {
    /// 0 = busy, 1 = the six-space session prompt, 2/4 = character input,
    /// 3 = quote-quad, anything else is treated as "some prompt".
    #[serde(rename = "type")]
    pub kind: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HadErrorInfo {
    pub error: i64,
    pub dmx: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowRef {
    pub win: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowTypeChange {
    pub win: i64,
    pub tracer: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutocompleteReply {
    pub options: Vec<String>,
    pub skip: i64,
    pub token: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ValueTipReply {
    pub tip: Vec<String>,
    #[serde(rename = "class")]
    pub name_class: i64,
    #[serde(rename = "startCol")]
    pub start_col: i64,
    #[serde(rename = "endCol")]
    pub end_col: i64,
    pub token: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HighlightLine {
    pub win: i64,
    pub line: u32,
}

/// Body of `OpenWindow` and `UpdateWindow`: the interpreter's editor/tracer
/// window content, including the line sets it actually accepted for
/// stop/trace/monitor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowContent {
    #[serde(rename = "currentRow")]
    pub current_row: i64,
    pub debugger: i64,
    #[serde(rename = "entityType")]
    pub entity_type: i64,
    pub filename: String,
    pub monitor: Vec<u32>,
    pub name: String,
    pub offset: i64,
    #[serde(rename = "readOnly")]
    pub read_only: i64,
    pub size: i64,
    pub stop: Vec<u32>,
    pub text: Vec<String>,
    pub tid: i64,
    pub tname: String,
    pub token: i64,
    pub trace: Vec<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SaveChangesReply {
    pub err: i64,
    pub win: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskDialogInfo {
    #[serde(rename = "buttonText")]
    pub button_text: Vec<String>,
    pub footer: String,
    pub options: Vec<String>,
    pub subtext: String,
    pub text: String,
    pub title: String,
    pub token: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiStackEntry {
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiStackReply {
    pub stack: Vec<SiStackEntry>,
    pub tid: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TreeListReply {
    #[serde(rename = "nodeId")]
    pub node_id: i64,
    #[serde(rename = "nodeIds")]
    pub node_ids: Vec<i64>,
    pub names: Vec<String>,
    pub classes: Vec<f64>,
    pub err: String,
}

/// Wholesale status snapshot pushed by a subscribed interpreter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InterpreterStatus {
    #[serde(rename = "CompactCount")]
    pub compact_count: i64,
    #[serde(rename = "DQ")]
    pub dq: i64,
    #[serde(rename = "GarbageCount")]
    pub garbage_count: i64,
    #[serde(rename = "IO")]
    pub io: i64,
    #[serde(rename = "ML")]
    pub ml: i64,
    #[serde(rename = "NumThreads")]
    pub num_threads: i64,
    #[serde(rename = "SI")]
    pub si: i64,
    #[serde(rename = "TID")]
    pub tid: i64,
    #[serde(rename = "TRAP")]
    pub trap: i64,
    #[serde(rename = "WA")]
    pub wa: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusOutputInfo {
    pub text: String,
    pub flags: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogReply {
    pub result: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionOutput {
    pub result: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UnknownCommandInfo {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormatCodeReply {
    pub win: i64,
    pub text: Vec<String>,
}

// ---------------------------------- the message union --------------------------------------------

/// Every interpreter message the bridge reacts to, as one closed union.
/// Kinds the bridge recognises but deliberately leaves to a GUI front end
/// (HTML panes, option/string dialogs) keep their raw bodies and are only
/// logged on dispatch.
#[derive(Debug, Clone)]
pub enum RideMessage {
    Identify(Identity),
    InvalidSyntax,
    Disconnect(DisconnectInfo),
    SysError(SysErrorInfo),
    InternalError(InternalErrorInfo),
    Notification(NotificationInfo),
    UpdateDisplayName(DisplayName),
    EchoInput(EchoInputInfo),
    SetPromptType(PromptInfo),
    HadError(HadErrorInfo),
    GotoWindow(WindowRef),
    WindowTypeChanged(WindowTypeChange),
    ReplyGetAutocomplete(AutocompleteReply),
    ValueTip(ValueTipReply),
    SetHighlightLine(HighlightLine),
    OpenWindow(WindowContent),
    UpdateWindow(WindowContent),
    CloseWindow(WindowRef),
    ReplySaveChanges(SaveChangesReply),
    TaskDialog(TaskDialogInfo),
    ReplyGetSIStack(SiStackReply),
    ReplyTreeList(TreeListReply),
    InterpreterStatus(InterpreterStatus),
    StatusOutput(StatusOutputInfo),
    ReplyGetLog(LogReply),
    AppendSessionOutput(SessionOutput),
    UnknownCommand(UnknownCommandInfo),
    ReplyFormatCode(FormatCodeReply),
    ShowHtml(Value),
    OptionsDialog(Value),
    StringDialog(Value),
    ReplyGetThreads(Value),
    ReplyGetConfiguration(Value),
    /// A kind this bridge does not know; answered with `UnknownCommand`.
    Unrecognized { name: String, body: Value },
}

impl RideMessage {
    pub fn decode(name: &str, body: Value) -> Result<Self, Error> {
        fn de<T: serde::de::DeserializeOwned>(name: &str, body: Value) -> Result<T, Error> {
            serde_json::from_value(body).map_err(|e| Error::Payload(name.to_string(), e))
        }

        Ok(match name {
            "Identify" => Self::Identify(de(name, body)?),
            "InvalidSyntax" => Self::InvalidSyntax,
            "Disconnect" => Self::Disconnect(de(name, body)?),
            "SysError" => Self::SysError(de(name, body)?),
            "InternalError" => Self::InternalError(de(name, body)?),
            "NotificationMessage" => Self::Notification(de(name, body)?),
            "UpdateDisplayName" => Self::UpdateDisplayName(de(name, body)?),
            "EchoInput" => Self::EchoInput(de(name, body)?),
            "SetPromptType" => Self::SetPromptType(de(name, body)?),
            "HadError" => Self::HadError(de(name, body)?),
            "GotoWindow" => Self::GotoWindow(de(name, body)?),
            "WindowTypeChanged" => Self::WindowTypeChanged(de(name, body)?),
            "ReplyGetAutocomplete" => Self::ReplyGetAutocomplete(de(name, body)?),
            "ValueTip" => Self::ValueTip(de(name, body)?),
            "SetHighlightLine" => Self::SetHighlightLine(de(name, body)?),
            "OpenWindow" => Self::OpenWindow(de(name, body)?),
            "UpdateWindow" => Self::UpdateWindow(de(name, body)?),
            "CloseWindow" => Self::CloseWindow(de(name, body)?),
            "ReplySaveChanges" => Self::ReplySaveChanges(de(name, body)?),
            "TaskDialog" => Self::TaskDialog(de(name, body)?),
            "ReplyGetSIStack" => Self::ReplyGetSIStack(de(name, body)?),
            "ReplyTreeList" => Self::ReplyTreeList(de(name, body)?),
            "InterpreterStatus" => Self::InterpreterStatus(de(name, body)?),
            "StatusOutput" => Self::StatusOutput(de(name, body)?),
            "ReplyGetLog" => Self::ReplyGetLog(de(name, body)?),
            "AppendSessionOutput" => Self::AppendSessionOutput(de(name, body)?),
            "UnknownCommand" => Self::UnknownCommand(de(name, body)?),
            "ReplyFormatCode" => Self::ReplyFormatCode(de(name, body)?),
            "ShowHTML" => Self::ShowHtml(body),
            "OptionsDialog" => Self::OptionsDialog(body),
            "StringDialog" => Self::StringDialog(body),
            "ReplyGetThreads" => Self::ReplyGetThreads(body),
            "ReplyGetConfiguration" => Self::ReplyGetConfiguration(body),
            _ => Self::Unrecognized {
                name: name.to_string(),
                body,
            },
        })
    }
}

// ---------------------------------- outbound commands --------------------------------------------

/// An outbound command: kind name plus JSON body, encoded as `[name, body]`.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: &'static str,
    pub body: Value,
}

impl Command {
    pub fn encode(&self) -> String {
        Value::Array(vec![Value::String(self.name.to_string()), self.body.clone()]).to_string()
    }
}

/// Commands the interpreter accepts even while it is busy executing. Anything
/// else must wait for an interactive prompt.
static ALWAYS_ALLOWED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "Interrupt$|TreeList|Reply|FormatCode|GetAutocomplete|GetValueTip|GetSIStack\
         |SaveChanges|CloseWindow|Exit",
    )
    .expect("valid command pattern")
});

pub fn is_always_allowed(name: &str) -> bool {
    ALWAYS_ALLOWED.is_match(name)
}

pub fn execute(trace: bool, expression: &str) -> Command {
    Command {
        name: "Execute",
        body: json!({ "trace": trace as i32, "text": format!("{expression}\n") }),
    }
}

pub fn set_line_attributes(win: i64, stop: &[u32]) -> Command {
    Command {
        name: "SetLineAttributes",
        body: json!({ "win": win, "stop": stop }),
    }
}

pub fn get_value_tip(win: i64, line: u32, pos: u32, token: i64) -> Command {
    Command {
        name: "GetValueTip",
        body: json!({
            "win": win,
            "line": line,
            "pos": pos,
            "maxWidth": 200,
            "maxHeight": 100,
            "token": token,
        }),
    }
}

pub fn tree_list(node_id: i64) -> Command {
    Command {
        name: "TreeList",
        body: json!({ "nodeId": node_id }),
    }
}

pub fn get_si_stack() -> Command {
    Command {
        name: "GetSIStack",
        body: json!({}),
    }
}

pub fn get_autocomplete(line: &str, pos: u32, token: i64) -> Command {
    Command {
        name: "GetAutocomplete",
        body: json!({ "line": line, "pos": pos, "token": token }),
    }
}

pub fn reply_task_dialog(index: i64, token: i64) -> Command {
    Command {
        name: "ReplyTaskDialog",
        body: json!({ "index": index, "token": token }),
    }
}

pub fn format_code(win: i64, text: &[String]) -> Command {
    Command {
        name: "FormatCode",
        body: json!({ "win": win, "text": text }),
    }
}

pub fn unknown_command(name: &str) -> Command {
    Command {
        name: "UnknownCommand",
        body: json!({ "name": name }),
    }
}

pub fn exit(code: i64) -> Command {
    Command {
        name: "Exit",
        body: json!({ "code": code }),
    }
}

pub fn continue_run(win: i64) -> Command {
    Command {
        name: "Continue",
        body: json!({ "win": win }),
    }
}

pub fn run_current_line(win: i64) -> Command {
    Command {
        name: "RunCurrentLine",
        body: json!({ "win": win }),
    }
}

pub fn step_into(win: i64) -> Command {
    Command {
        name: "StepInto",
        body: json!({ "win": win }),
    }
}

pub fn trace_backward(win: i64) -> Command {
    Command {
        name: "TraceBackward",
        body: json!({ "win": win }),
    }
}

pub fn trace_forward(win: i64) -> Command {
    Command {
        name: "TraceForward",
        body: json!({ "win": win }),
    }
}

pub fn cutback(win: i64) -> Command {
    Command {
        name: "Cutback",
        body: json!({ "win": win }),
    }
}

pub fn interrupt(strong: bool) -> Command {
    Command {
        name: if strong { "StrongInterrupt" } else { "WeakInterrupt" },
        body: json!({}),
    }
}
