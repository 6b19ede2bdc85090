use std::collections::VecDeque;

use super::node::Node;
use super::policy::IndexPolicy;
use super::Tree;
use crate::container::PageId;
use crate::errors::TreeResult;

/// Lazy depth-first query over a [`Tree`].
///
/// Pages are fetched one at a time as the cursor advances. After an error the
/// cursor yields it once and is exhausted.
pub struct QueryCursor<'a, P: IndexPolicy> {
    tree: &'a Tree<P>,
    query: Option<P::Query>,
    stack: Vec<PageId>,
    pending: VecDeque<P::Entry>,
}

impl<'a, P: IndexPolicy> QueryCursor<'a, P> {
    pub(crate) fn new(tree: &'a Tree<P>, query: Option<P::Query>, root: PageId) -> Self {
        Self {
            tree,
            query,
            stack: vec![root],
            pending: VecDeque::new(),
        }
    }
}

impl<'a, P: IndexPolicy> Iterator for QueryCursor<'a, P> {
    type Item = TreeResult<P::Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            let page = self.stack.pop()?;
            let node = match self.tree.read_node(page) {
                Ok(node) => node,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };

            let policy = self.tree.policy();
            let query = self.query.as_ref();
            match node {
                Node::Leaf { entries } => {
                    self.pending.extend(
                        entries
                            .into_iter()
                            .filter(|e| query.map_or(true, |q| policy.matches(e, q))),
                    );
                }
                Node::Index { children, .. } => {
                    let selected = match query {
                        Some(q) => policy.query_children(&children, q),
                        None => (0..children.len()).collect(),
                    };
                    // reversed so the first selected child is visited first
                    self.stack
                        .extend(selected.into_iter().rev().map(|i| children[i].child));
                }
            }
        }
    }
}
