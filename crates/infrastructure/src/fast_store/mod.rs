pub mod memory;
pub mod redis;

pub use memory::InMemoryFastStore;
pub use redis::RedisFastStore;

use std::sync::Arc;

use stellar_config::{FastStoreBackend, FastStoreConfig};
use stellar_domain::FastStore;
use stellar_errors::StellarResult;
use tracing::info;

/// 根据配置创建快速存储
pub async fn create_fast_store(config: &FastStoreConfig) -> StellarResult<Arc<dyn FastStore>> {
    match config.backend {
        FastStoreBackend::Memory => {
            info!("使用进程内快速存储");
            Ok(Arc::new(InMemoryFastStore::new()))
        }
        FastStoreBackend::Redis => Ok(Arc::new(RedisFastStore::connect(config).await?)),
    }
}
