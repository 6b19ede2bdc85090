//! Spatial join of two R-Trees.
//!
//! Both trees are traversed top-down in lockstep. A stack holds pairs of
//! pages whose regions intersect; each popped pair is joined in memory by a
//! plane sweep along the first axis, restricted to the intersection of the
//! two regions. Once the shorter tree reaches its leaves, the rest of the
//! taller tree is searched with the leaf rectangles as windows, breadth
//! first.

use std::collections::VecDeque;

use super::{RTreePolicy, SpatialEntry};
use crate::btree::TreeValue;
use crate::container::PageId;
use crate::errors::{TreeError, TreeResult};
use crate::region::{Descriptor, Rectangle};
use crate::tree::{Node, Tree};

/// Pairs of overlapping rectangles found in one sweep, as index pairs into
/// the inputs.
///
/// Both inputs are filtered to `window` first; the remaining items are
/// sorted by their lower bound on axis 0 and swept so that only pairs whose
/// axis-0 extents intersect are tested.
fn plane_sweep(left: &[&Rectangle], right: &[&Rectangle], window: &Rectangle) -> Vec<(usize, usize)> {
    let lower = |r: &Rectangle| r.min()[0];
    let filter = |rects: &[&Rectangle]| {
        let mut kept: Vec<usize> = (0..rects.len()).filter(|&i| rects[i].overlaps(window)).collect();
        kept.sort_by(|&a, &b| lower(rects[a]).total_cmp(&lower(rects[b])));
        kept
    };
    let l = filter(left);
    let r = filter(right);

    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < l.len() && j < r.len() {
        if lower(left[l[i]]) <= lower(right[r[j]]) {
            let a = left[l[i]];
            for &k in r[j..].iter().take_while(|&&k| lower(right[k]) <= a.max()[0]) {
                if a.overlaps(right[k]) {
                    pairs.push((l[i], k));
                }
            }
            i += 1;
        } else {
            let b = right[r[j]];
            for &k in l[i..].iter().take_while(|&&k| lower(left[k]) <= b.max()[0]) {
                if left[k].overlaps(b) {
                    pairs.push((k, r[j]));
                }
            }
            j += 1;
        }
    }
    pairs
}

/// Work left for the join
enum Task<V, W> {
    /// Two pages at the same remaining depth
    Pair {
        left: PageId,
        right: PageId,
        window: Rectangle,
    },
    /// A left leaf entry searched in a right subtree
    ProbeRight { entry: SpatialEntry<V>, right: PageId },
    /// A right leaf entry searched in a left subtree
    ProbeLeft { entry: SpatialEntry<W>, left: PageId },
}

/// Lazy iterator over overlapping entry pairs of two R-Trees.
///
/// Yields `(left entry, right entry)` pairs in no particular order. After an
/// error the join yields it once and is exhausted.
pub struct SpatialJoin<'a, V: TreeValue + PartialEq, W: TreeValue + PartialEq> {
    left: &'a Tree<RTreePolicy<V>>,
    right: &'a Tree<RTreePolicy<W>>,
    stack: Vec<Task<V, W>>,
    queue: VecDeque<Task<V, W>>,
    pending: VecDeque<(SpatialEntry<V>, SpatialEntry<W>)>,
}

impl<'a, V: TreeValue + PartialEq, W: TreeValue + PartialEq> SpatialJoin<'a, V, W> {
    pub(crate) fn new(
        left: &'a Tree<RTreePolicy<V>>,
        right: &'a Tree<RTreePolicy<W>>,
    ) -> TreeResult<Self> {
        let dims = left.policy().dimensions();
        if dims != right.policy().dimensions() {
            return Err(TreeError::invariant(format!(
                "cannot join a {}-dimensional tree with a {}-dimensional tree",
                dims,
                right.policy().dimensions()
            )));
        }

        let mut stack = Vec::new();
        if let (Some(l), Some(r)) = (left.root_descriptor()?, right.root_descriptor()?) {
            if let Some(window) = l.intersection(&r) {
                stack.push(Task::Pair {
                    left: left.root_page(),
                    right: right.root_page(),
                    window,
                });
            }
        }
        Ok(Self {
            left,
            right,
            stack,
            queue: VecDeque::new(),
            pending: VecDeque::new(),
        })
    }

    fn process(&mut self, task: Task<V, W>) -> TreeResult<()> {
        match task {
            Task::Pair {
                left,
                right,
                window,
            } => {
                let l = self.left.read_node(left)?;
                let r = self.right.read_node(right)?;
                self.join_pair(l, r, &window);
            }
            Task::ProbeRight { entry, right } => match self.right.read_node(right)? {
                Node::Leaf { entries } => self.pending.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.rect.overlaps(&entry.rect))
                        .map(|e| (entry.clone(), e)),
                ),
                Node::Index { children, .. } => {
                    for child in children.iter().filter(|c| c.region.overlaps(&entry.rect)) {
                        self.queue.push_back(Task::ProbeRight {
                            entry: entry.clone(),
                            right: child.child,
                        });
                    }
                }
            },
            Task::ProbeLeft { entry, left } => match self.left.read_node(left)? {
                Node::Leaf { entries } => self.pending.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.rect.overlaps(&entry.rect))
                        .map(|e| (e, entry.clone())),
                ),
                Node::Index { children, .. } => {
                    for child in children.iter().filter(|c| c.region.overlaps(&entry.rect)) {
                        self.queue.push_back(Task::ProbeLeft {
                            entry: entry.clone(),
                            left: child.child,
                        });
                    }
                }
            },
        }
        Ok(())
    }

    fn join_pair(
        &mut self,
        l: Node<SpatialEntry<V>, Rectangle>,
        r: Node<SpatialEntry<W>, Rectangle>,
        window: &Rectangle,
    ) {
        match (l, r) {
            (Node::Index { children: lc, .. }, Node::Index { children: rc, .. }) => {
                let lr: Vec<&Rectangle> = lc.iter().map(|c| &c.region).collect();
                let rr: Vec<&Rectangle> = rc.iter().map(|c| &c.region).collect();
                for (i, j) in plane_sweep(&lr, &rr, window) {
                    if let Some(window) = lc[i].region.intersection(&rc[j].region) {
                        self.stack.push(Task::Pair {
                            left: lc[i].child,
                            right: rc[j].child,
                            window,
                        });
                    }
                }
            }
            (Node::Leaf { entries: le }, Node::Leaf { entries: re }) => {
                let lr: Vec<&Rectangle> = le.iter().map(|e| &e.rect).collect();
                let rr: Vec<&Rectangle> = re.iter().map(|e| &e.rect).collect();
                for (i, j) in plane_sweep(&lr, &rr, window) {
                    self.pending.push_back((le[i].clone(), re[j].clone()));
                }
            }
            (Node::Leaf { entries: le }, Node::Index { children: rc, .. }) => {
                let lr: Vec<&Rectangle> = le.iter().map(|e| &e.rect).collect();
                let rr: Vec<&Rectangle> = rc.iter().map(|c| &c.region).collect();
                for (i, j) in plane_sweep(&lr, &rr, window) {
                    self.queue.push_back(Task::ProbeRight {
                        entry: le[i].clone(),
                        right: rc[j].child,
                    });
                }
            }
            (Node::Index { children: lc, .. }, Node::Leaf { entries: re }) => {
                let lr: Vec<&Rectangle> = lc.iter().map(|c| &c.region).collect();
                let rr: Vec<&Rectangle> = re.iter().map(|e| &e.rect).collect();
                for (i, j) in plane_sweep(&lr, &rr, window) {
                    self.queue.push_back(Task::ProbeLeft {
                        entry: re[j].clone(),
                        left: lc[i].child,
                    });
                }
            }
        }
    }
}

impl<'a, V: TreeValue + PartialEq, W: TreeValue + PartialEq> Iterator for SpatialJoin<'a, V, W> {
    type Item = TreeResult<(SpatialEntry<V>, SpatialEntry<W>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.pending.pop_front() {
                return Some(Ok(pair));
            }
            let task = self.queue.pop_front().or_else(|| self.stack.pop())?;
            if let Err(e) = self.process(task) {
                self.stack.clear();
                self.queue.clear();
                return Some(Err(e));
            }
        }
    }
}
