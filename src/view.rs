//! Terminal rendering of the drawer.
//!
//! Log text goes to one writer as it grows; tab changes and session notices
//! go to another. Only the newly known suffix is written each time, so the
//! output reads as one continuous log even when a snapshot fills a gap.

use std::io::Write;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::drawer::runtime::DrawerObserver;
use crate::tabs::{TabId, VisibleTabSet};

/// Strip ANSI escape sequences from captured terminal output.
pub fn strip_ansi(input: &str) -> String {
    // CSI (ESC [ ... final byte), OSC (ESC ] ... ST), and two-byte escapes.
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

pub struct TerminalView<W: Write + Send, E: Write + Send> {
    out: W,
    err: E,
    /// Bytes of the reconciled log already handed to `out` (or `pending`).
    printed: usize,
    plain: bool,
    /// Incomplete trailing line held back in plain mode.
    pending: String,
}

impl<W: Write + Send, E: Write + Send> TerminalView<W, E> {
    pub fn new(out: W, err: E, plain: bool) -> Self {
        Self {
            out,
            err,
            printed: 0,
            plain,
            pending: String::new(),
        }
    }

    pub fn out(&self) -> &W {
        &self.out
    }

    pub fn err(&self) -> &E {
        &self.err
    }

    fn write_out(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            warn!(error = %e, "failed to write log output");
        }
    }

    fn notice(&mut self, line: &str) {
        if let Err(e) = writeln!(self.err, "{line}") {
            warn!(error = %e, "failed to write notice");
        }
    }

    fn emit(&mut self, suffix: &str) {
        if !self.plain {
            self.write_out(suffix);
            return;
        }
        // Escape sequences can straddle chunk boundaries; strip whole lines only.
        self.pending.push_str(suffix);
        let Some(cut) = self.pending.rfind('\n') else {
            return;
        };
        let complete: String = self.pending.drain(..=cut).collect();
        let cleaned: String = complete
            .split_inclusive('\n')
            .map(|line| {
                let line = strip_ansi(line);
                let body = line.trim_end_matches(['\n', '\r']);
                format!("{body}\n")
            })
            .collect();
        self.write_out(&cleaned);
    }
}

impl<W: Write + Send, E: Write + Send> DrawerObserver for TerminalView<W, E> {
    fn on_log_text(&mut self, text: &str) {
        if text.len() < self.printed {
            // A different execution's log; start over.
            self.printed = 0;
            self.pending.clear();
        }
        let mut start = self.printed;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        let suffix = &text[start..];
        self.printed = text.len();
        if !suffix.is_empty() {
            self.emit(suffix);
        }
    }

    fn on_tab(&mut self, tab: TabId, visible: &VisibleTabSet) {
        self.notice(&format!("[tab] {tab} (visible: {visible})"));
    }

    fn on_auth_expired(&mut self) {
        self.notice("[auth] credentials rejected; sign in again and re-run");
    }

    fn on_finish(&mut self) {
        if self.plain && !self.pending.is_empty() {
            let rest = strip_ansi(&std::mem::take(&mut self.pending));
            self.write_out(&format!("{rest}\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(plain: bool) -> TerminalView<Vec<u8>, Vec<u8>> {
        TerminalView::new(Vec::new(), Vec::new(), plain)
    }

    fn stdout(view: &TerminalView<Vec<u8>, Vec<u8>>) -> String {
        String::from_utf8(view.out().clone()).unwrap()
    }

    fn stderr(view: &TerminalView<Vec<u8>, Vec<u8>>) -> String {
        String::from_utf8(view.err().clone()).unwrap()
    }

    #[test]
    fn strip_ansi_removes_csi() {
        let input = "\x1b[31mERROR\x1b[0m: something broke";
        assert_eq!(strip_ansi(input), "ERROR: something broke");
    }

    #[test]
    fn strip_ansi_removes_osc() {
        assert_eq!(strip_ansi("\x1b]0;title\x07some text"), "some text");
    }

    #[test]
    fn strip_ansi_passthrough_clean_text() {
        assert_eq!(strip_ansi("just normal text"), "just normal text");
    }

    #[test]
    fn writes_only_the_new_suffix() {
        let mut view = view(false);
        view.on_log_text("line1\n");
        view.on_log_text("line1\nline2\n");
        view.on_log_text("line1\nline2\nline3");
        assert_eq!(stdout(&view), "line1\nline2\nline3");
    }

    #[test]
    fn snapshot_filling_a_gap_prints_once() {
        let mut view = view(false);
        view.on_log_text("a\n");
        view.on_log_text("a\nb\nc\nd\n");
        view.on_log_text("a\nb\nc\nd\n");
        assert_eq!(stdout(&view), "a\nb\nc\nd\n");
    }

    #[test]
    fn shorter_text_restarts_output() {
        let mut view = view(false);
        view.on_log_text("first execution\n");
        view.on_log_text("x\n");
        assert_eq!(stdout(&view), "first execution\nx\n");
    }

    #[test]
    fn plain_mode_strips_ansi_split_across_chunks() {
        let mut view = view(true);
        view.on_log_text("\x1b[3");
        assert_eq!(stdout(&view), "");
        view.on_log_text("\x1b[32mok\x1b[0m\r\nnext");
        assert_eq!(stdout(&view), "ok\n");
        view.on_finish();
        assert_eq!(stdout(&view), "ok\nnext\n");
    }

    #[test]
    fn tab_changes_and_auth_go_to_stderr() {
        let mut view = view(false);
        let visible = crate::tabs::visible_tabs(
            &crate::execution::ExecutionStatus::Running,
            true,
            false,
        );
        view.on_tab(TabId::Artifacts, &visible);
        view.on_auth_expired();
        let err = stderr(&view);
        assert!(err.contains("[tab] artifacts (visible: terminal, artifacts, ai-analysis)"));
        assert!(err.contains("[auth]"));
        assert_eq!(stdout(&view), "");
    }
}
