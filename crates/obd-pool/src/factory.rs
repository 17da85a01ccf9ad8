//! Driver construction for the pool

use obd_protocol::{
    DriverOptions, DtcCatalog, DtcDescriptionCache, Elm327Driver, ObdError, PidCatalog, TransportConfig,
};
use std::sync::Arc;

/// Builds unconnected drivers on demand; the pool connects them
pub trait DriverFactory: Send + Sync {
    fn create(&self, vehicle_id: &str) -> Result<Elm327Driver, ObdError>;
}

impl<F> DriverFactory for F
where
    F: Fn(&str) -> Result<Elm327Driver, ObdError> + Send + Sync,
{
    fn create(&self, vehicle_id: &str) -> Result<Elm327Driver, ObdError> {
        self(vehicle_id)
    }
}

/// Factory for drivers over a configured transport.
///
/// Catalogs and the DTC description cache are shared by every driver it
/// creates.
pub struct TransportDriverFactory {
    transport: TransportConfig,
    options: DriverOptions,
    pids: Arc<PidCatalog>,
    dtcs: Arc<DtcCatalog>,
    dtc_cache: Arc<DtcDescriptionCache>,
}

impl TransportDriverFactory {
    pub fn new(transport: TransportConfig, options: DriverOptions) -> Self {
        Self {
            transport,
            options,
            pids: Arc::new(PidCatalog::standard()),
            dtcs: Arc::new(DtcCatalog::standard()),
            dtc_cache: Arc::new(DtcDescriptionCache::new()),
        }
    }

    pub fn dtc_cache(&self) -> &Arc<DtcDescriptionCache> {
        &self.dtc_cache
    }
}

impl DriverFactory for TransportDriverFactory {
    fn create(&self, _vehicle_id: &str) -> Result<Elm327Driver, ObdError> {
        Ok(Elm327Driver::new(self.transport.build(), self.options.clone())
            .with_catalogs(Arc::clone(&self.pids), Arc::clone(&self.dtcs))
            .with_dtc_cache(Arc::clone(&self.dtc_cache)))
    }
}
