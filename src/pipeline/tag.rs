// src/pipeline/tag.rs

//! Correlation tags carried by every pipeline item.
//!
//! A scatter pushes a tag `{id, seq, count}` on top of the item's stack; the
//! matching gather pops it. Items with identical stacks belong together,
//! which is what sync stages match on.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TAG_ID: AtomicU64 = AtomicU64::new(1);

fn next_tag_id() -> u64 {
    NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Shared by all siblings of one scatter.
    pub id: u64,
    /// Position among the siblings.
    pub seq: usize,
    /// Number of siblings.
    pub count: usize,
}

/// A value with its tag stack (top of stack = last element).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged<V> {
    pub tags: Vec<Tag>,
    pub value: V,
}

impl<V> Tagged<V> {
    /// A root item with a fresh identity.
    pub fn root(value: V) -> Self {
        Self {
            tags: vec![Tag {
                id: next_tag_id(),
                seq: 0,
                count: 1,
            }],
            value,
        }
    }

    pub fn top(&self) -> Option<&Tag> {
        self.tags.last()
    }

    /// Same tags, different value.
    pub fn with_value<U>(&self, value: U) -> Tagged<U> {
        Tagged {
            tags: self.tags.clone(),
            value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Tagged<U> {
        Tagged {
            tags: self.tags,
            value: f(self.value),
        }
    }

    /// Split into `children`, each tagged with its position.
    pub(crate) fn scatter<C>(&self, children: Vec<C>) -> Vec<Tagged<C>> {
        let id = next_tag_id();
        let count = children.len();
        children
            .into_iter()
            .enumerate()
            .map(|(seq, value)| {
                let mut tags = self.tags.clone();
                tags.push(Tag { id, seq, count });
                Tagged { tags, value }
            })
            .collect()
    }
}
