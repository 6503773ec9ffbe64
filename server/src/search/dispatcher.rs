//! Search dispatch: capability probing over the backend stack, a paginated
//! LRU query cache, and concurrent multi-pattern fan-out.

use super::external::backend_stack;
use super::{SearchBackend, SearchQuery};
use crate::config::SearchSection;
use crate::errors::{Result, ServerError};
use code_index_core::cache::PersistentCache;
use code_index_core::types::{PageInfo, SearchMatches, SearchPage};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SearchDispatcher {
    backends: Vec<Arc<dyn SearchBackend>>,
    /// Indices into `backends` that probed available, in priority order.
    available: RwLock<Vec<usize>>,
    preferred: Option<String>,
    cache: PersistentCache<SearchPage>,
    default_page_size: usize,
}

impl SearchDispatcher {
    /// Build the backend stack, probe availability, and load the persisted
    /// query cache.
    pub fn new(config: &SearchSection, trigram_index_dir: &Path, cache_path: &Path, cache_capacity: usize) -> Self {
        let dispatcher = Self {
            backends: backend_stack(trigram_index_dir),
            available: RwLock::new(Vec::new()),
            preferred: config.preferred_tool.clone(),
            cache: PersistentCache::new(
                cache_path,
                cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
                config.cache_compact_threshold,
            ),
            default_page_size: config.page_size,
        };
        dispatcher.probe();
        dispatcher
    }

    /// Re-probe every backend; returns the available tool names in priority
    /// order.
    pub fn probe(&self) -> Vec<String> {
        let mut indices = Vec::new();
        let mut names = Vec::new();
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.is_available() {
                indices.push(i);
                names.push(backend.name().to_string());
            }
        }
        info!(tools = ?names, "Probed search backends");
        *self.available.write().unwrap() = indices;
        names
    }

    /// The tool a plain search would use right now.
    pub fn active_tool(&self) -> String {
        self.candidates()
            .first()
            .map(|b| b.name().to_string())
            .unwrap_or_else(|| "basic".to_string())
    }

    pub fn available_tools(&self) -> Vec<String> {
        self.candidates().iter().map(|b| b.name().to_string()).collect()
    }

    // Available backends with the preferred tool (when present) moved first.
    fn candidates(&self) -> Vec<Arc<dyn SearchBackend>> {
        let available = self.available.read().unwrap();
        let mut out: Vec<Arc<dyn SearchBackend>> = available
            .iter()
            .map(|&i| Arc::clone(&self.backends[i]))
            .collect();
        if let Some(preferred) = &self.preferred {
            if let Some(pos) = out.iter().position(|b| b.name() == preferred) {
                let chosen = out.remove(pos);
                out.insert(0, chosen);
            }
        }
        out
    }

    /// Run the query against the best backend, falling through the priority
    /// order on `SearchFailed`. Timeouts propagate: the next tool would very
    /// likely hit the same wall.
    fn run_query(&self, query: &SearchQuery) -> Result<(SearchMatches, String)> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(ServerError::SearchFailed {
                tool: "none".to_string(),
                stderr: "no search backend available".to_string(),
            });
        }
        let mut last_err = None;
        for backend in &candidates {
            match backend.search(query) {
                Ok(matches) => return Ok((matches, backend.name().to_string())),
                Err(e @ ServerError::Timeout { .. }) => return Err(e),
                Err(e) => {
                    warn!(tool = backend.name(), error = %e, "Backend failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }

    /// Cached, paginated search.
    pub fn search(&self, query: &SearchQuery, page: usize, page_size: Option<usize>) -> Result<SearchPage> {
        let page = page.max(1);
        let page_size = page_size.unwrap_or(self.default_page_size).max(1);
        let key = cache_key(query, page, page_size);

        if let Some(hit) = self.cache.get(&key) {
            debug!(key = key.as_str(), "Query cache hit");
            return Ok(hit);
        }

        let (matches, tool) = self.run_query(query)?;
        let result = paginate(&matches, page, page_size);
        debug!(tool = tool.as_str(), matches = result.pagination.total_matches, "Search executed");
        self.cache.put(&key, result.clone(), None);
        Ok(result)
    }

    /// Fan a set of patterns out to the chosen backend concurrently.
    /// Per-pattern failures surface as `{error}` entries; the keys of the
    /// returned map are exactly the input patterns.
    pub fn search_multiple(
        &self,
        patterns: &[String],
        template: &SearchQuery,
    ) -> BTreeMap<String, serde_json::Value> {
        if patterns.is_empty() {
            return BTreeMap::new();
        }
        let workers = patterns.len().min(num_cpus::get()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build();
        let Ok(pool) = pool else {
            // Pool construction failing is effectively resource exhaustion;
            // degrade to sequential execution.
            return patterns
                .iter()
                .map(|p| (p.clone(), self.single_pattern_entry(p, template)))
                .collect();
        };

        use rayon::prelude::*;
        pool.install(|| {
            patterns
                .par_iter()
                .map(|p| (p.clone(), self.single_pattern_entry(p, template)))
                .collect()
        })
    }

    fn single_pattern_entry(&self, pattern: &str, template: &SearchQuery) -> serde_json::Value {
        let query = SearchQuery {
            pattern: pattern.to_string(),
            ..template.clone()
        };
        match self.run_query(&query) {
            Ok((matches, _)) => serde_json::to_value(matches).unwrap_or_else(|_| json!({})),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    /// Build (or rebuild) any backend-side index for the active tool.
    pub fn prepare(&self, base: &Path) {
        if let Some(backend) = self.candidates().first() {
            if let Err(e) = backend.prepare(base) {
                warn!(tool = backend.name(), error = %e, "Backend preparation failed");
            }
        }
    }

    pub fn refresh_indexes(&self, base: &Path) {
        for backend in self.candidates() {
            if let Err(e) = backend.refresh_index(base) {
                warn!(tool = backend.name(), error = %e, "Index refresh failed");
            }
        }
    }

    // -- cache management ---------------------------------------------------

    pub fn cache_stats(&self) -> serde_json::Value {
        serde_json::to_value(self.cache.stats()).unwrap_or_else(|_| json!({}))
    }

    pub fn cached_query_count(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_maintain(&self) {
        self.cache.maintain();
    }

    pub fn cache_save(&self) {
        self.cache.save();
    }

    pub fn cache_clear(&self) -> usize {
        self.cache.clear()
    }

    /// Snapshot of the cache contents for spill-to-disk.
    pub fn cache_contents(&self) -> serde_json::Value {
        let entries: BTreeMap<String, SearchPage> = self.cache.entries().into_iter().collect();
        serde_json::to_value(entries).unwrap_or_else(|_| json!({}))
    }
}

fn cache_key(query: &SearchQuery, page: usize, page_size: usize) -> String {
    format!(
        "{}|case={}|ctx={}|glob={}|fuzzy={}|page={}|size={}",
        query.pattern,
        query.case_sensitive,
        query.context_lines,
        query.file_glob.as_deref().unwrap_or(""),
        query.fuzzy,
        page,
        page_size
    )
}

/// Flatten matches ordered by (path, line), slice out the requested page,
/// and regroup by file.
pub fn paginate(matches: &SearchMatches, page: usize, page_size: usize) -> SearchPage {
    let flat: Vec<(&String, &(usize, String))> = matches
        .iter()
        .flat_map(|(path, lines)| lines.iter().map(move |m| (path, m)))
        .collect();
    let total_matches = flat.len();
    let total_pages = total_matches.div_ceil(page_size).max(1);
    let page = page.min(total_pages);
    let start = (page - 1) * page_size;

    let mut results = SearchMatches::new();
    for (path, (line, content)) in flat.into_iter().skip(start).take(page_size) {
        results
            .entry(path.clone())
            .or_default()
            .push((*line, content.clone()));
    }

    SearchPage {
        results,
        pagination: PageInfo {
            page,
            page_size,
            total_matches,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches_with(count: usize) -> SearchMatches {
        let mut m = SearchMatches::new();
        m.insert(
            "one.py".to_string(),
            (1..=count).map(|i| (i, format!("line {i}"))).collect(),
        );
        m
    }

    #[test]
    fn test_pagination_sizes() {
        let matches = matches_with(45);
        let p1 = paginate(&matches, 1, 20);
        let p2 = paginate(&matches, 2, 20);
        let p3 = paginate(&matches, 3, 20);

        let count = |p: &SearchPage| p.results.values().map(|v| v.len()).sum::<usize>();
        assert_eq!(count(&p1), 20);
        assert_eq!(count(&p2), 20);
        assert_eq!(count(&p3), 5);
        assert_eq!(p3.pagination.total_pages, 3);
        assert!(!p3.pagination.has_next);
        assert!(p3.pagination.has_prev);
        assert!(p1.pagination.has_next);
        assert!(!p1.pagination.has_prev);
    }

    #[test]
    fn test_pagination_union_equals_unpaginated() {
        let mut matches = SearchMatches::new();
        matches.insert("a.py".to_string(), vec![(1, "x".into()), (5, "y".into())]);
        matches.insert("b.py".to_string(), vec![(2, "z".into())]);

        let mut union: Vec<(String, usize, String)> = Vec::new();
        for page in 1..=2 {
            let p = paginate(&matches, page, 2);
            for (path, lines) in &p.results {
                for (line, content) in lines {
                    union.push((path.clone(), *line, content.clone()));
                }
            }
        }
        let mut expected: Vec<(String, usize, String)> = Vec::new();
        for (path, lines) in &matches {
            for (line, content) in lines {
                expected.push((path.clone(), *line, content.clone()));
            }
        }
        union.sort();
        expected.sort();
        assert_eq!(union, expected);
    }

    #[test]
    fn test_pagination_empty_result() {
        let page = paginate(&SearchMatches::new(), 1, 20);
        assert_eq!(page.pagination.total_matches, 0);
        assert_eq!(page.pagination.total_pages, 1);
        assert!(!page.pagination.has_next);
        assert!(page.results.is_empty());
    }

    #[test]
    fn test_cache_key_distinguishes_parameters() {
        let base = Path::new("/p");
        let q1 = SearchQuery::new("x", base);
        let mut q2 = SearchQuery::new("x", base);
        q2.fuzzy = true;
        assert_ne!(cache_key(&q1, 1, 20), cache_key(&q2, 1, 20));
        assert_ne!(cache_key(&q1, 1, 20), cache_key(&q1, 2, 20));
    }
}
