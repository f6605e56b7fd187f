//! Page-number paging.

use serde::{Deserialize, Serialize};

/// A requested page, already clamped: `size >= 0`, `index >= 1` (1-based).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    size: u64,
    index: u64,
}

impl PageRequest {
    /// Negative sizes become 0, indexes below 1 become 1.
    #[must_use]
    pub fn new(size: i64, index: i64) -> Self {
        Self {
            size: u64::try_from(size).unwrap_or(0),
            index: u64::try_from(index).unwrap_or(0).max(1),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Rows to skip: `size * (index - 1)`, saturating.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.size.saturating_mul(self.index - 1)
    }
}

/// One page of results plus the unpaged total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page_size: u64,
    pub page_index: u64,
}

impl<T> Page<T> {
    /// Number of pages at this page size; 0 when the size is 0.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.total_count.div_ceil(self.page_size)
        }
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.page_index < self.page_count()
    }

    /// Convert the items, keeping the paging metadata.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total_count: self.total_count,
            page_size: self.page_size,
            page_index: self.page_index,
        }
    }
}
