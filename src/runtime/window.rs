//! Interpreter-side window records. Every editor/tracer buffer the
//! interpreter opens carries an integer token; open/update/close events keep
//! this registry current so the session can address the active tracer and
//! reconcile breakpoint verification against reported stop lines.

use std::collections::HashMap;

use super::protocol::WindowContent;

#[derive(Debug, Clone)]
pub struct WindowRecord {
    pub token: i64,
    pub name: String,
    pub filename: String,
    pub tracer: bool,
    pub stop: Vec<u32>,
    pub trace: Vec<u32>,
    pub current_row: i64,
}

#[derive(Default)]
pub struct WindowRegistry {
    wins: HashMap<i64, WindowRecord>,
}

impl WindowRegistry {
    pub fn upsert(&mut self, content: &WindowContent) -> &WindowRecord {
        let record = WindowRecord {
            token: content.token,
            name: content.name.clone(),
            filename: content.filename.clone(),
            tracer: content.debugger != 0,
            stop: content.stop.clone(),
            trace: content.trace.clone(),
            current_row: content.current_row,
        };
        self.wins.insert(content.token, record);
        &self.wins[&content.token]
    }

    pub fn close(&mut self, token: i64) -> Option<WindowRecord> {
        self.wins.remove(&token)
    }

    pub fn get(&self, token: i64) -> Option<&WindowRecord> {
        self.wins.get(&token)
    }

    pub fn set_tracer(&mut self, token: i64, tracer: bool) {
        if let Some(w) = self.wins.get_mut(&token) {
            w.tracer = tracer;
        }
    }

    /// The open tracer window for a routine name, if any. Used to prefer a
    /// `SetLineAttributes` push over a `⎕STOP` expression.
    pub fn tracer_for(&self, name: &str) -> Option<&WindowRecord> {
        self.wins.values().find(|w| w.tracer && w.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn content(token: i64, name: &str, debugger: i64) -> WindowContent {
        WindowContent {
            token,
            name: name.to_string(),
            debugger,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_and_close() {
        let mut reg = WindowRegistry::default();
        reg.upsert(&content(3, "#.Fib", 1));
        assert!(reg.get(3).unwrap().tracer);

        reg.upsert(&content(3, "#.Fib", 0));
        assert!(!reg.get(3).unwrap().tracer);

        assert!(reg.close(3).is_some());
        assert!(reg.close(3).is_none());
    }

    #[test]
    fn test_tracer_lookup_by_name() {
        let mut reg = WindowRegistry::default();
        reg.upsert(&content(1, "#.Fib", 0));
        reg.upsert(&content(2, "#.Fib", 1));
        assert_eq!(reg.tracer_for("#.Fib").unwrap().token, 2);
        assert!(reg.tracer_for("#.Other").is_none());
    }
}
