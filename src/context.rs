use crate::config::RuntimeSettings;
use crate::data_context::{MarketData, PriceSeriesProvider};
use crate::optimizer::OptimizationDriver;
use crate::optimizer_status::OptimizerStatus;
use crate::price_api_client::PriceApiClient;
use crate::scheduler::WindowScheduler;
use crate::task_store::TaskStore;
use anyhow::{anyhow, Result};
use log::info;
use std::path::Path;
use std::sync::Arc;

/// Process-wide wiring: where prices come from, where tasks live, and the
/// runtime knobs every command shares.
#[derive(Clone)]
pub struct AppContext {
    provider: Arc<dyn PriceSeriesProvider>,
    tasks: TaskStore,
    runtime: RuntimeSettings,
}

impl AppContext {
    /// A local snapshot wins over the remote price service when both are configured.
    pub fn initialize(data_file: Option<&Path>, runtime: RuntimeSettings) -> Result<Self> {
        let provider: Arc<dyn PriceSeriesProvider> = match (data_file, runtime.price_api_url.as_deref()) {
            (Some(path), _) => {
                let market_data = MarketData::load_from_file(path)?;
                if !market_data.has_data() {
                    return Err(anyhow!("Market data file {} contains no bars", path.display()));
                }
                info!(
                    "Using market data snapshot from {} ({} symbols)",
                    path.display(),
                    market_data.symbols().len()
                );
                Arc::new(market_data)
            }
            (None, Some(url)) => {
                info!("Using price service at {}", url);
                Arc::new(PriceApiClient::new(url, runtime.price_api_timeout)?)
            }
            (None, None) => {
                return Err(anyhow!(
                    "Either --data-file or WALKFORWARD_PRICE_API_URL must be set to load prices."
                ))
            }
        };
        Ok(Self::with_provider(provider, runtime))
    }

    pub fn with_provider(provider: Arc<dyn PriceSeriesProvider>, runtime: RuntimeSettings) -> Self {
        Self {
            provider,
            tasks: TaskStore::new(),
            runtime,
        }
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub fn provider(&self) -> Arc<dyn PriceSeriesProvider> {
        Arc::clone(&self.provider)
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn scheduler(&self) -> WindowScheduler {
        WindowScheduler::new(
            self.provider(),
            self.tasks.clone(),
            self.runtime.workers,
            self.runtime.poll_interval,
        )
    }

    pub fn optimizer(&self, status: OptimizerStatus) -> OptimizationDriver {
        OptimizationDriver::new(self.scheduler(), self.runtime.clone(), status)
    }
}
