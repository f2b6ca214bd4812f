//! Service wiring shared by the subcommands.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use safewalk_alerts::AlertService;
use safewalk_risk::{RiskService, RouteRiskAnnotator};
use safewalk_routing::{
    MapAdapterFactory, QuotaManager, RetryExecutor, TrafficCacheManager,
    service_registry::{ProviderService, enabled_services},
};
use safewalk_spatial::RegionIndex;
use safewalk_store::{MemoryStore, RegionRepository, StoreError};

use crate::config::AppConfig;

/// Loaded configuration and data for one CLI invocation.
///
/// Services are built on demand from the shared store and cache.
pub struct App {
    pub config: AppConfig,
    /// Everything persisted in the data snapshot.
    pub store: Arc<MemoryStore>,
    /// Provider response cache. Not persisted.
    pub cache: Arc<TrafficCacheManager>,
    data_path: PathBuf,
}

impl App {
    /// Loads the data snapshot at `data_path`, starting empty if it does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the snapshot is unreadable.
    pub fn open(config: AppConfig, data_path: &Path) -> Result<Self, StoreError> {
        let store = Arc::new(MemoryStore::load(data_path)?);
        let cache = Arc::new(TrafficCacheManager::new(config.cache));
        Ok(Self {
            config,
            store,
            cache,
            data_path: data_path.to_path_buf(),
        })
    }

    /// Writes the data snapshot back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn save(&self) -> Result<(), StoreError> {
        self.store.save(&self.data_path).await?;
        log::debug!("Saved data to {}", self.data_path.display());
        Ok(())
    }

    /// Risk scoring over the store with the configured parameters.
    #[must_use]
    pub fn risk(&self) -> Arc<RiskService> {
        Arc::new(RiskService::new(
            self.store.clone(),
            self.store.clone(),
            self.config.risk,
        ))
    }

    /// Spatial index over the stored regions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the regions cannot be read.
    pub async fn region_index(&self) -> Result<Arc<RegionIndex>, StoreError> {
        let regions = self.store.all_regions().await?;
        Ok(Arc::new(RegionIndex::build(&regions)))
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the regions cannot be read.
    pub async fn annotator(&self) -> Result<RouteRiskAnnotator, StoreError> {
        Ok(
            RouteRiskAnnotator::new(self.region_index().await?, self.store.clone())
                .with_threshold(self.config.risk.high_risk_threshold),
        )
    }

    /// # Errors
    ///
    /// Returns [`StoreError`] if the regions cannot be read.
    pub async fn alerts(&self) -> Result<AlertService, StoreError> {
        Ok(AlertService::new(
            self.region_index().await?,
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.risk(),
            self.config.alerts,
        ))
    }

    /// Enabled provider services with the configured order and quota
    /// overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if an embedded service definition is malformed.
    pub fn services(&self) -> Result<Vec<ProviderService>, Box<dyn std::error::Error>> {
        let mut services = enabled_services()?;
        self.config.providers.apply(&mut services);
        Ok(services)
    }

    /// # Errors
    ///
    /// Returns an error if a service definition is malformed or an HTTP
    /// client cannot be built.
    pub fn factory(&self) -> Result<MapAdapterFactory, Box<dyn std::error::Error>> {
        let factory = MapAdapterFactory::from_services(
            &self.services()?,
            Arc::new(QuotaManager::new()),
            self.cache.clone(),
            RetryExecutor::new(self.config.retry),
        )?;
        Ok(match self.config.providers.call_timeout_secs {
            Some(secs) => factory.with_call_timeout(Duration::from_secs(secs.max(1))),
            None => factory,
        })
    }
}
