//! Shared table of the sample rates recommended to clients, per service.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::collections::FastHashMap;
use crate::signature::{ServiceSignature, ServiceSignatureRef};

/// A published set of rates by service.
///
/// The empty service signature holds the default rate. When serialized, keys are rendered as
/// `service:<name>,env:<env>`, so the default rate is keyed by `service:,env:`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RatesByService {
    rate_by_service: FastHashMap<ServiceSignature, f64>,
    #[serde(skip)]
    version: u64,
}

impl RatesByService {
    /// Returns the rates, keyed by service signature.
    pub fn rates(&self) -> &FastHashMap<ServiceSignature, f64> {
        &self.rate_by_service
    }

    /// Returns the version of this set of rates.
    ///
    /// Versions increase every time the published rates change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the rate for the given service signature, falling back to the default rate.
    pub fn rate_for(&self, service: &str, env: &str) -> Option<f64> {
        self.rate_by_service
            .get(&ServiceSignatureRef::new(service, env))
            .or_else(|| self.rate_by_service.get(&ServiceSignatureRef::new("", "")))
            .copied()
    }

    /// Returns `true` if no rate has been published.
    pub fn is_empty(&self) -> bool {
        self.rate_by_service.is_empty()
    }
}

/// Store of the latest rates by service.
///
/// Writers replace the whole table at once, and readers get a consistent snapshot without ever taking a lock.
#[derive(Default)]
pub struct RateByService {
    current: ArcSwap<RatesByService>,
    next_version: AtomicU64,
    write_lock: Mutex<()>,
}

impl RateByService {
    /// Creates a new, empty `RateByService`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all rates.
    ///
    /// Rates are clamped to `[0, 1]`. The version is only bumped if the rates differ from the current ones.
    pub fn set_all(&self, rates: FastHashMap<ServiceSignature, f64>) {
        let rate_by_service: FastHashMap<ServiceSignature, f64> = rates
            .into_iter()
            .map(|(svc_sig, rate)| (svc_sig, rate.clamp(0.0, 1.0)))
            .collect();

        let _write = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load();
        if current.rate_by_service == rate_by_service {
            return;
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.store(Arc::new(RatesByService {
            rate_by_service,
            version,
        }));
    }

    /// Returns the latest rates.
    pub fn get_all(&self) -> Arc<RatesByService> {
        self.current.load_full()
    }
}
