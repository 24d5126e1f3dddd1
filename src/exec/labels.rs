// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Lazy discovery and memoization of structured control-flow jump targets.
//!
//! A function's labels are keyed by the byte position of their opening
//! `block`/`loop`/`if`. The first time execution (or a forward scan on
//! behalf of a branch) reaches an opener, it is inserted into the function's
//! label table; the position of its matching `end` (and, for `if`, `else`)
//! is back-filled once discovered. The table survives an interpreter
//! [`reset`](crate::exec::Interpreter::reset), since it is a pure function of
//! the code bytes.

use crate::core_compat::vec::Vec;
use crate::exec::ExhaustionError;
use crate::exec::reader::ExprCursor;
use crate::types::Opcode;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LabelKind {
    Block,
    Loop,
    If,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Label {
    pub(crate) kind: LabelKind,
    pub(crate) opener: usize,
    pub(crate) end: Option<usize>,
    pub(crate) els: Option<usize>,
}

/// Per-function label cache. Indices into `labels` are stable for the
/// lifetime of the table and are what the resolver stack records.
#[derive(Clone, Debug, Default)]
pub(crate) struct LabelTable {
    labels: Vec<Label>,
}

impl LabelTable {
    pub(crate) fn get(&self, idx: usize) -> Label {
        self.labels[idx]
    }

    pub(crate) fn set_end(&mut self, idx: usize, pos: usize) {
        if self.labels[idx].end.is_none() {
            self.labels[idx].end = Some(pos);
        }
    }

    pub(crate) fn set_else(&mut self, idx: usize, pos: usize) {
        if self.labels[idx].els.is_none() {
            self.labels[idx].els = Some(pos);
        }
    }

    // Finds the label opened at `opener`, inserting a fresh unresolved entry
    // if this is the first time it has been seen.
    pub(crate) fn find_or_insert(
        &mut self,
        opener: usize,
        kind: LabelKind,
        max_labels: usize,
    ) -> Result<usize, ExhaustionError> {
        if let Some(idx) = self.labels.iter().position(|l| l.opener == opener) {
            return Ok(idx);
        }
        if self.labels.len() >= max_labels {
            return Err(ExhaustionError::LabelTable);
        }
        self.labels.push(Label {
            kind,
            opener,
            end: None,
            els: None,
        });
        Ok(self.labels.len() - 1)
    }
}

/// A region opened within the current call frame, pushed when a
/// `block`/`loop`/`if` is entered and popped when its matching closer is
/// reached.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Resolver {
    pub(crate) label: usize,
    /// Value-stack depth at entry, below which a branch out of this
    /// construct truncates.
    pub(crate) stack_height: u32,
}

/// Scans forward from a label's opener to discover (and memoize, for every
/// nested opener passed over along the way) the byte position just past its
/// matching `end`, and, if it is an `if` block, the position just past its
/// `else` should one be encountered first.
///
/// `bytes` must be the same expression the label table was built against.
pub(crate) fn resolve_forward(
    table: &mut LabelTable,
    cursor: &mut ExprCursor<'_>,
    label_idx: usize,
    max_labels: usize,
) -> Result<(), ExhaustionError> {
    let opener = table.get(label_idx).opener;
    cursor.seek(opener);

    // Re-read the opener itself so we're positioned at its body.
    let op = cursor.read_opcode();
    debug_assert!(matches!(op, Opcode::Block | Opcode::If | Opcode::Loop));
    cursor.skip_operand(op);

    let mut depth: u32 = 0;
    loop {
        let pos = cursor.pos();
        let op = cursor.read_opcode();
        match op {
            Opcode::Block | Opcode::If | Opcode::Loop => {
                let kind = match op {
                    Opcode::Block => LabelKind::Block,
                    Opcode::If => LabelKind::If,
                    Opcode::Loop => LabelKind::Loop,
                    _ => unreachable!(),
                };
                // Memoize nested openers passed over along the way, per the
                // forward-scan's amortization contract.
                table.find_or_insert(pos, kind, max_labels)?;
                cursor.skip_operand(op);
                depth += 1;
            }
            Opcode::Else if depth == 0 => {
                table.set_else(label_idx, cursor.pos());
            }
            Opcode::End => {
                if depth == 0 {
                    table.set_end(label_idx, cursor.pos());
                    return Ok(());
                }
                depth -= 1;
            }
            _ => cursor.skip_operand(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_insert_hits_cache_on_repeat_opener() {
        let mut table = LabelTable::default();
        let first = table.find_or_insert(10, LabelKind::Loop, 4).unwrap();
        // A loop body revisits the same opener on every iteration; the table
        // must hand back the existing entry rather than growing.
        let second = table.find_or_insert(10, LabelKind::Loop, 4).unwrap();
        let third = table.find_or_insert(10, LabelKind::Loop, 4).unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(table.labels.len(), 1);
    }

    #[test]
    fn find_or_insert_assigns_distinct_indices_per_opener() {
        let mut table = LabelTable::default();
        let a = table.find_or_insert(0, LabelKind::Block, 4).unwrap();
        let b = table.find_or_insert(20, LabelKind::Loop, 4).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.labels.len(), 2);
    }

    #[test]
    fn find_or_insert_reports_exhaustion() {
        let mut table = LabelTable::default();
        table.find_or_insert(0, LabelKind::Block, 1).unwrap();
        let err = table.find_or_insert(8, LabelKind::Loop, 1).unwrap_err();
        assert_eq!(err, ExhaustionError::LabelTable);
    }

    #[test]
    fn set_end_and_set_else_are_first_write_wins() {
        let mut table = LabelTable::default();
        let idx = table.find_or_insert(0, LabelKind::If, 4).unwrap();
        table.set_else(idx, 50);
        table.set_else(idx, 999);
        table.set_end(idx, 100);
        table.set_end(idx, 999);
        let label = table.get(idx);
        assert_eq!(label.els, Some(50));
        assert_eq!(label.end, Some(100));
    }
}
