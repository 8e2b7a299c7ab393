//! Source breakpoints and the path ↔ interpreter-routine link map.
//!
//! The interpreter knows nothing about files: stop points live on a
//! namespace-qualified routine name. The link map ties a loaded source file
//! to that name so breakpoint edits can be pushed as one stop-set per
//! routine, and so stack frames can be mapped back to files.

use std::collections::HashMap;

/// A line breakpoint. Lines are 0-based; `verified` flips only when the
/// interpreter reports the line in a window's accepted stop set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBreakpoint {
    pub id: u32,
    pub line: u32,
    pub verified: bool,
}

/// Normalise a source path for map keys: backslashes become slashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Render the stop-set push for a routine: `5 7 ⎕STOP 'X'`, or the empty
/// vector when the set is empty.
pub fn stop_expression(lines: &[u32], routine: &str) -> String {
    if lines.is_empty() {
        return format!("⍬ ⎕STOP '{routine}'");
    }
    let rendered = lines
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!("{rendered} ⎕STOP '{routine}'")
}

#[derive(Default)]
pub struct BreakpointRegistry {
    by_path: HashMap<String, Vec<SourceBreakpoint>>,
    next_id: u32,
}

impl BreakpointRegistry {
    /// Insert a breakpoint at `line`, or return the existing one: lines are
    /// unique per path.
    pub fn set(&mut self, path: &str, line: u32) -> SourceBreakpoint {
        let set = self.by_path.entry(normalize_path(path)).or_default();
        if let Some(bp) = set.iter().find(|bp| bp.line == line) {
            return bp.clone();
        }
        self.next_id += 1;
        let bp = SourceBreakpoint {
            id: self.next_id,
            line,
            verified: false,
        };
        set.push(bp.clone());
        bp
    }

    /// Remove every breakpoint for `path`, returning the removed set.
    pub fn clear(&mut self, path: &str) -> Vec<SourceBreakpoint> {
        self.by_path.remove(&normalize_path(path)).unwrap_or_default()
    }

    /// Whether a breakpoint exists at exactly `line`.
    pub fn exists(&self, path: &str, line: u32) -> bool {
        self.by_path
            .get(&normalize_path(path))
            .is_some_and(|set| set.iter().any(|bp| bp.line == line))
    }

    /// Ascending line set for `path`, the shape pushed to the interpreter.
    pub fn lines(&self, path: &str) -> Vec<u32> {
        let mut lines: Vec<u32> = self
            .by_path
            .get(&normalize_path(path))
            .map(|set| set.iter().map(|bp| bp.line).collect())
            .unwrap_or_default();
        lines.sort_unstable();
        lines
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(String::as_str)
    }

    /// Reconcile against the stop lines the interpreter reports for `path`.
    /// Returns the breakpoints whose verification state changed.
    pub fn apply_stop_report(&mut self, path: &str, reported: &[u32]) -> Vec<SourceBreakpoint> {
        let Some(set) = self.by_path.get_mut(&normalize_path(path)) else {
            return vec![];
        };
        let mut changed = vec![];
        for bp in set.iter_mut() {
            let verified = reported.contains(&bp.line);
            if bp.verified != verified {
                bp.verified = verified;
                changed.push(bp.clone());
            }
        }
        changed
    }
}

/// One loaded source file linked to an interpreter routine.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub name: String,
    pub path: String,
    pub line_count: u32,
}

#[derive(Default)]
pub struct LinkMap {
    entries: Vec<LinkEntry>,
    by_path: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl LinkMap {
    /// Insert or replace (a reload re-links the same path).
    pub fn insert(&mut self, entry: LinkEntry) {
        let path = normalize_path(&entry.path);
        if let Some(&ix) = self.by_path.get(&path) {
            self.by_name.remove(&self.entries[ix].name);
            self.by_name.insert(entry.name.clone(), ix);
            self.entries[ix] = entry;
            return;
        }
        let ix = self.entries.len();
        self.by_path.insert(path, ix);
        self.by_name.insert(entry.name.clone(), ix);
        self.entries.push(entry);
    }

    pub fn name_for_path(&self, path: &str) -> Option<&LinkEntry> {
        self.by_path
            .get(&normalize_path(path))
            .map(|&ix| &self.entries[ix])
    }

    pub fn path_for_name(&self, name: &str) -> Option<&LinkEntry> {
        self.by_name.get(name).map(|&ix| &self.entries[ix])
    }

    /// Parse a link-dump file: one `name<TAB>path<TAB>line-count` row per
    /// routine. Rows without a source path are interpreter internals and are
    /// skipped.
    pub fn parse_dump(text: &str) -> Vec<LinkEntry> {
        text.lines()
            .filter_map(|line| {
                let mut cols = line.split('\t');
                let name = cols.next()?.trim();
                let path = cols.next()?.trim();
                if name.is_empty() || path.is_empty() {
                    return None;
                }
                let line_count = cols
                    .next()
                    .and_then(|c| c.trim().parse().ok())
                    .unwrap_or(0);
                Some(LinkEntry {
                    name: name.to_string(),
                    path: path.to_string(),
                    line_count,
                })
            })
            .collect()
    }
}
