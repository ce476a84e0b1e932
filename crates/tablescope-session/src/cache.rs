use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use tablescope_model::CellValue;

use crate::engine::QueryResult;

/// A contiguous block of rows of the current view.
///
/// Pages are created by a fetch and replaced wholesale; they are never
/// patched in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub start_row: u64,
    pub rows: Vec<Vec<CellValue>>,
    pub column_names: Arc<[String]>,
    pub last_accessed: Instant,
}

impl Page {
    pub fn new(start_row: u64, column_names: Arc<[String]>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            start_row,
            rows,
            column_names,
            last_accessed: Instant::now(),
        }
    }

    pub(crate) fn from_result(start_row: u64, result: QueryResult) -> Self {
        Self::new(start_row, result.columns.into(), result.rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.column_names.iter().position(|name| name == column)
    }

    /// Rows covered by this page.
    pub fn row_range(&self) -> Range<u64> {
        self.start_row..self.start_row + self.rows.len() as u64
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserted: u64,
    pub evicted: u64,
}

/// Bounded LRU map from page index to [`Page`].
///
/// The cache only stores and looks up; fetching missing pages is the
/// session's job.
pub struct PageCache {
    pages: LruCache<u64, Page>,
    page_size: u64,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(page_size: u64, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(capacity),
            page_size: page_size.max(1),
            stats: CacheStats::default(),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.pages.cap().get()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page_index(&self, row: u64) -> u64 {
        row / self.page_size
    }

    pub fn page_range(&self, index: u64) -> Range<u64> {
        let start = index.saturating_mul(self.page_size);
        start..start.saturating_add(self.page_size)
    }

    pub fn contains_page(&self, index: u64) -> bool {
        self.pages.contains(&index)
    }

    /// Cached page `index`, marked most recently used.
    pub fn page(&mut self, index: u64) -> Option<&Page> {
        match self.pages.get_mut(&index) {
            Some(page) => {
                self.stats.hits += 1;
                page.last_accessed = Instant::now();
                Some(&*page)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn row(&mut self, row: u64) -> Option<&[CellValue]> {
        let index = self.page_index(row);
        let offset = (row - index * self.page_size) as usize;
        self.page(index)
            .and_then(|page| page.rows.get(offset))
            .map(Vec::as_slice)
    }

    pub fn value(&mut self, row: u64, column: &str) -> Option<&CellValue> {
        let index = self.page_index(row);
        let offset = (row - index * self.page_size) as usize;
        let page = self.page(index)?;
        let col = page.column_index(column)?;
        page.rows.get(offset).and_then(|r| r.get(col))
    }

    /// Store `page` under the index derived from its start row.
    ///
    /// Returns the index of the page evicted to make room, if any.
    pub fn insert_page(&mut self, page: Page) -> Option<u64> {
        let index = self.page_index(page.start_row);
        self.stats.inserted += 1;
        match self.pages.push(index, page) {
            Some((evicted, _)) if evicted != index => {
                self.stats.evicted += 1;
                log::debug!("page cache: evicted page {evicted}");
                Some(evicted)
            }
            _ => None,
        }
    }

    pub fn invalidate_all(&mut self) {
        self.pages.clear();
    }

    pub fn invalidate_page(&mut self, index: u64) -> bool {
        self.pages.pop(&index).is_some()
    }

    /// Indices of every cached page, ascending.
    pub fn cached_page_indices(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.pages.iter().map(|(index, _)| *index).collect();
        indices.sort_unstable();
        indices
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(start_row: u64, rows: u64) -> Page {
        let names: Arc<[String]> = vec!["__rowid".to_string(), "a".to_string()].into();
        let rows = (start_row..start_row + rows)
            .map(|r| vec![CellValue::Integer(r as i64 + 1), CellValue::Integer(r as i64 * 10)])
            .collect();
        Page::new(start_row, names, rows)
    }

    #[test]
    fn page_math() {
        let cache = PageCache::new(500, 20);
        assert_eq!(cache.page_index(0), 0);
        assert_eq!(cache.page_index(499), 0);
        assert_eq!(cache.page_index(500), 1);
        assert_eq!(cache.page_index(750), 1);
        assert_eq!(cache.page_range(2), 1000..1500);
    }

    #[test]
    fn lookups_resolve_rows_and_columns() {
        let mut cache = PageCache::new(10, 4);
        cache.insert_page(page(10, 10));
        assert_eq!(cache.value(13, "a"), Some(&CellValue::Integer(130)));
        assert_eq!(cache.value(13, "missing"), None);
        assert_eq!(cache.row(19).map(|r| r.len()), Some(2));
        assert_eq!(cache.row(20), None);
        assert_eq!(cache.value(3, "a"), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (3, 2));
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let mut cache = PageCache::new(10, 2);
        assert_eq!(cache.insert_page(page(0, 10)), None);
        assert_eq!(cache.insert_page(page(10, 10)), None);
        // Touch page 0 so page 1 becomes the eviction candidate.
        assert!(cache.page(0).is_some());
        assert_eq!(cache.insert_page(page(20, 10)), Some(1));
        assert_eq!(cache.cached_page_indices(), vec![0, 2]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn replacing_a_page_is_not_an_eviction() {
        let mut cache = PageCache::new(10, 2);
        cache.insert_page(page(0, 10));
        assert_eq!(cache.insert_page(page(0, 5)), None);
        assert_eq!(cache.page(0).map(Page::len), Some(5));
        assert_eq!(cache.stats().evicted, 0);
    }

    #[test]
    fn invalidation() {
        let mut cache = PageCache::new(10, 4);
        cache.insert_page(page(0, 10));
        cache.insert_page(page(10, 10));
        assert!(cache.invalidate_page(1));
        assert!(!cache.invalidate_page(1));
        assert_eq!(cache.cached_page_indices(), vec![0]);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
