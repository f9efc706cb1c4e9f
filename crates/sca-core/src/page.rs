//! # Pages and Sorting
//!
//! A [`PageRequest`] names a zero-based page, a page size and a list of sort
//! keys. Sort keys address the same catalogue as filters. Fault-level keys
//! become the SQL `ORDER BY`; at most one feeder-level key is allowed and is
//! applied in memory to each fault's feeder list, because a collection sort
//! cannot be expressed on the paged identity query.
//!
//! [`resolve_sort`] always appends the fault identity as the final key so
//! that page boundaries are stable even when the primary keys tie.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::filter::{
    lookup_field, Entity, FieldSpec, FilterError, DEFAULT_FEEDER_SORT, FAULT_IDENTITY,
};
use crate::model::FeederResultView;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Upper bound on a page. Also keeps the hydration `IN (...)` list small.
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub const fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    pub property: String,
    #[serde(default)]
    pub direction: Direction,
}

impl SortOrder {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
    #[serde(default)]
    pub sort: Vec<SortOrder>,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size,
            sort: Vec::new(),
        }
    }

    pub fn sorted_by(mut self, order: SortOrder) -> Self {
        self.sort.push(order);
        self
    }

    /// Effective page size: `size` clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> u32 {
        self.size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Rows skipped before this page. Cannot overflow: both factors are `u32`.
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit())
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: u64,
    pub total_pages: u64,
    pub number: u32,
    pub size: u32,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, total_elements: u64, request: &PageRequest) -> Self {
        let size = request.limit();
        Self {
            content,
            total_elements,
            total_pages: total_elements.div_ceil(u64::from(size)),
            number: request.page,
            size,
        }
    }

    pub fn empty(total_elements: u64, request: &PageRequest) -> Self {
        Self::new(Vec::new(), total_elements, request)
    }

    pub fn is_last(&self) -> bool {
        u64::from(self.number) + 1 >= self.total_pages
    }
}

// =============================================================================
// Sort resolution
// =============================================================================

/// A sort split into the SQL part and the in-memory feeder part.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSort {
    /// Fault-level keys, always ending with the identity tie-breaker.
    pub parent: Vec<(&'static FieldSpec, Direction)>,
    /// The feeder-level key, if one was requested.
    pub child: Option<(&'static FieldSpec, Direction)>,
}

pub fn resolve_sort(sort: &[SortOrder]) -> Result<ResolvedSort, FilterError> {
    let mut parent = Vec::with_capacity(sort.len() + 1);
    let mut child = None;

    for order in sort {
        let field = lookup_field(&order.property)
            .ok_or_else(|| FilterError::UnknownField(order.property.clone()))?;
        match field.entity {
            Entity::Fault => parent.push((field, order.direction)),
            Entity::Feeder => {
                if child.replace((field, order.direction)).is_some() {
                    return Err(FilterError::MultipleChildSorts);
                }
            }
        }
    }

    if !parent.iter().any(|(field, _)| *field == FAULT_IDENTITY) {
        parent.push((FAULT_IDENTITY, Direction::Asc));
    }

    Ok(ResolvedSort { parent, child })
}

/// Order a fault's feeders by the requested key, or by the default
/// (`feeders.current` descending) when none was requested. Ties fall back to
/// the feeder identity so the output never depends on storage order.
pub fn sort_feeders(
    feeders: &mut [FeederResultView],
    child: Option<(&'static FieldSpec, Direction)>,
) {
    let (field, direction) = child.unwrap_or((DEFAULT_FEEDER_SORT, Direction::Desc));
    feeders.sort_by(|a, b| {
        direction
            .apply(compare_feeder_field(a, b, field))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn compare_feeder_field(a: &FeederResultView, b: &FeederResultView, field: &FieldSpec) -> Ordering {
    match field.column {
        "connectable_id" => a.connectable_id.cmp(&b.connectable_id),
        "voltage" => a.voltage.total_cmp(&b.voltage),
        _ => a.current.total_cmp(&b.current),
    }
}

#[cfg(kani)]
mod proofs {
    use super::*;

    /// **Proof: consecutive pages are contiguous and disjoint**
    ///
    /// Page `k` covers `[offset(k), offset(k) + limit)` and page `k + 1`
    /// starts exactly where page `k` ends.
    #[kani::proof]
    fn verify_consecutive_windows_touch() {
        let page: u32 = kani::any();
        let size: u32 = kani::any();
        kani::assume(page < u32::MAX);

        let current = PageRequest::new(page, size);
        let next = PageRequest::new(page + 1, size);

        assert!(current.limit() >= 1 && current.limit() <= MAX_PAGE_SIZE);
        assert_eq!(current.offset() + u64::from(current.limit()), next.offset());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feeder(id: i64, name: &str, current: f64) -> FeederResultView {
        FeederResultView {
            id,
            connectable_id: name.into(),
            current,
            voltage: 0.0,
        }
    }

    #[test]
    fn test_tie_breaker_is_appended() {
        let sort = resolve_sort(&[SortOrder::desc("summary.current")]).unwrap();
        assert_eq!(sort.parent.len(), 2);
        assert_eq!(sort.parent[0].0.path, "summary.current");
        assert_eq!(sort.parent[1], (FAULT_IDENTITY, Direction::Asc));
        assert!(sort.child.is_none());
    }

    #[test]
    fn test_explicit_identity_sort_is_not_duplicated() {
        let sort = resolve_sort(&[SortOrder::desc("id")]).unwrap();
        assert_eq!(sort.parent, vec![(FAULT_IDENTITY, Direction::Desc)]);
    }

    #[test]
    fn test_child_key_is_extracted() {
        let sort = resolve_sort(&[
            SortOrder::asc("feeders.id"),
            SortOrder::asc("fault.id"),
        ])
        .unwrap();
        assert_eq!(sort.parent.len(), 2);
        assert_eq!(sort.child.unwrap().0.path, "feeders.id");
    }

    #[test]
    fn test_two_child_keys_are_rejected() {
        let err = resolve_sort(&[
            SortOrder::asc("feeders.id"),
            SortOrder::desc("feeders.current"),
        ])
        .unwrap_err();
        assert_eq!(err, FilterError::MultipleChildSorts);
    }

    #[test]
    fn test_unknown_sort_property() {
        assert!(matches!(
            resolve_sort(&[SortOrder::asc("fault.name")]),
            Err(FilterError::UnknownField(_))
        ));
    }

    #[test]
    fn test_default_feeder_sort_is_current_descending() {
        let mut feeders = vec![feeder(1, "A", 5.0), feeder(2, "B", 9.0), feeder(3, "C", 1.0)];
        sort_feeders(&mut feeders, None);
        let order: Vec<f64> = feeders.iter().map(|f| f.current).collect();
        assert_eq!(order, vec![9.0, 5.0, 1.0]);
    }

    #[test]
    fn test_feeder_ties_fall_back_to_identity() {
        let mut feeders = vec![feeder(7, "X", 2.0), feeder(3, "Y", 2.0), feeder(5, "Z", 2.0)];
        sort_feeders(&mut feeders, None);
        let ids: Vec<i64> = feeders.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_explicit_feeder_sort() {
        let mut feeders = vec![feeder(1, "LINE_B", 5.0), feeder(2, "LINE_A", 9.0)];
        let key = resolve_sort(&[SortOrder::asc("feeders.id")]).unwrap().child;
        sort_feeders(&mut feeders, key);
        assert_eq!(feeders[0].connectable_id, "LINE_A");
    }

    #[test]
    fn test_window_arithmetic() {
        let request = PageRequest::new(3, 0);
        assert_eq!(request.limit(), 1);
        assert_eq!(request.offset(), 3);

        let request = PageRequest::new(2, 10_000);
        assert_eq!(request.limit(), MAX_PAGE_SIZE);
        assert_eq!(request.offset(), 2 * u64::from(MAX_PAGE_SIZE));
    }

    #[test]
    fn test_page_totals() {
        let request = PageRequest::new(1, 2);
        let page: Page<u8> = Page::new(vec![1], 3, &request);
        assert_eq!(page.total_pages, 2);
        assert!(page.is_last());

        let empty: Page<u8> = Page::empty(0, &PageRequest::default());
        assert_eq!(empty.total_pages, 0);
        assert!(empty.is_last());
    }
}
