//! Query parameters and paged results for ledger listings

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::LedgerError;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

// ============================================================================
// Period
// ============================================================================

/// Half-open time window `[start, end_exclusive)`
///
/// The caller's end bound is inclusive through the end of its calendar day
/// (UTC), so it is stored as the following midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodFilter {
    pub start: DateTime<Utc>,
    pub end_exclusive: DateTime<Utc>,
}

impl PeriodFilter {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, LedgerError> {
        if start > end {
            return Err(LedgerError::InvalidArgument(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }

        let end_exclusive = end
            .date_naive()
            .succ_opt()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|midnight| midnight.and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(Self {
            start,
            end_exclusive,
        })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end_exclusive
    }
}

// ============================================================================
// Paging
// ============================================================================

/// 1-based page request; out-of-range values are clamped, never rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        let page = if page < 1 {
            1
        } else {
            u32::try_from(page).unwrap_or(u32::MAX)
        };
        let page_size = if (1..=MAX_PAGE_SIZE as i64).contains(&page_size) {
            page_size as u32
        } else {
            DEFAULT_PAGE_SIZE
        };
        Self { page, page_size }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }

    pub fn limit(&self) -> u64 {
        self.page_size as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One page of results plus navigation metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u64,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total_count: u64) -> Self {
        let total_pages = total_count.div_ceil(request.page_size as u64);
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total_count,
            total_pages,
            has_next_page: (request.page as u64) < total_pages,
            has_previous_page: request.page > 1,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            page_size: self.page_size,
            total_count: self.total_count,
            total_pages: self.total_pages,
            has_next_page: self.has_next_page,
            has_previous_page: self.has_previous_page,
        }
    }
}
