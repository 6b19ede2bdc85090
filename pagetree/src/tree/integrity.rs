//! Structural integrity checking.

use super::node::{Node, NodeState};
use super::policy::IndexPolicy;
use super::Tree;
use crate::container::PageId;
use crate::errors::{ErrorKind, TreeResult};

/// Findings of [`Tree::check_integrity`]
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    /// Total pages visited from the root
    pub pages_checked: u64,
    pub leaf_pages: u64,
    pub index_pages: u64,
    /// Entries found in leaves
    pub entries: u64,
    /// Pages that failed to decode
    pub corrupted_pages: Vec<PageId>,
    /// Summary of findings
    pub is_valid: bool,
    /// Detailed error messages
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            pages_checked: 0,
            leaf_pages: 0,
            index_pages: 0,
            entries: 0,
            corrupted_pages: Vec::new(),
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub(crate) fn fail(&mut self, msg: String) {
        self.is_valid = false;
        self.errors.push(msg);
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}

struct Visit<'r, R> {
    page: PageId,
    recorded: Option<&'r R>,
    level: u32,
    is_root: bool,
}

impl<P: IndexPolicy> Tree<P> {
    /// Walks the whole tree and validates ordering, regions, fill ratio and
    /// uniform leaf depth.
    ///
    /// Pages that cannot be decoded are reported as corrupted; storage
    /// failures abort the check.
    pub fn check_integrity(&self) -> TreeResult<IntegrityReport> {
        self.check_closed()?;

        let mut report = IntegrityReport::new();
        let mut last_entry = None;
        let root = Visit {
            page: self.meta.root,
            recorded: None,
            level: self.meta.height.saturating_sub(1),
            is_root: true,
        };
        self.check_node(root, &mut report, &mut last_entry)?;

        if report.entries != self.meta.entry_count {
            report.fail(format!(
                "metadata counts {} entries, leaves hold {}",
                self.meta.entry_count, report.entries
            ));
        }
        Ok(report)
    }

    fn check_node(
        &self,
        visit: Visit<'_, P::Region>,
        report: &mut IntegrityReport,
        last_entry: &mut Option<P::Entry>,
    ) -> TreeResult<()> {
        let page = visit.page;
        let node = match self.store.read(page) {
            Ok(node) => node,
            Err(e) if e.kind() == ErrorKind::Serialization => {
                report.corrupted_pages.push(page);
                report.fail(format!("Page {}: {}", page, e));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.pages_checked += 1;

        if node.level() != visit.level {
            report.fail(format!(
                "Page {} sits at level {} but is tagged level {}",
                page,
                visit.level,
                node.level()
            ));
        }
        match self.state_of(&node) {
            NodeState::Overflow => report.fail(format!(
                "Page {} holds {} entries, capacity is {}",
                page,
                node.len(),
                self.capacity(&node)
            )),
            NodeState::Underflow if !visit.is_root => report.fail(format!(
                "Page {} is underfull: {} entries, minimum {}",
                page,
                node.len(),
                self.min_entries(&node)
            )),
            _ => {}
        }
        if let Some(recorded) = visit.recorded {
            match self.region_of(&node) {
                Some(actual) if self.policy.covers(recorded, &actual) => {}
                Some(actual) => report.fail(format!(
                    "Page {}: parent records {:?}, content spans {:?}",
                    page, recorded, actual
                )),
                None => report.fail(format!("Page {} is an empty non-root node", page)),
            }
        }

        match node {
            Node::Leaf { entries } => {
                report.leaf_pages += 1;
                report.entries += entries.len() as u64;

                let mut run = Vec::with_capacity(entries.len() + 1);
                run.extend(last_entry.take());
                run.extend(entries);
                if let Some(msg) = self.policy.check_entries(&run) {
                    report.fail(format!("Page {}: {}", page, msg));
                }
                *last_entry = run.pop();
            }
            Node::Index { children, .. } => {
                report.index_pages += 1;
                if let Some(msg) = self.policy.check_children(&children) {
                    report.fail(format!("Page {}: {}", page, msg));
                }
                for child in &children {
                    let visit = Visit {
                        page: child.child,
                        recorded: Some(&child.region),
                        level: visit.level.saturating_sub(1),
                        is_root: false,
                    };
                    self.check_node(visit, report, last_entry)?;
                }
            }
        }
        Ok(())
    }
}
