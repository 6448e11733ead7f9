pub mod cli;
pub mod resolver;

/// How far analysis follows links away from the page it was given.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Link hops followed from the seed page; 0 scans the seed page only.
    pub max_depth: u32,
    /// Pages fetched per analysis, the seed page included.
    pub max_pages: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self { max_depth: 1, max_pages: 50 }
    }
}
