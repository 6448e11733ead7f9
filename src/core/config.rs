use crate::core::pool::PoolConfig;
use crate::core::retry::RetryPolicy;
use crate::plugins::hls::HlsSettings;
use crate::plugins::html::CrawlSettings;
use crate::plugins::registry::DriverContext;

/// Everything the engine needs, filled in from defaults and CLI plugins.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub driver: DriverContext,
    pub hls: HlsSettings,
    pub crawl: CrawlSettings,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            driver: DriverContext::default(),
            hls: HlsSettings::default(),
            crawl: CrawlSettings::default(),
            event_capacity: 1024,
        }
    }
}
