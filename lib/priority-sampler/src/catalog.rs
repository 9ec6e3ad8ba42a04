//! Service key catalog for mapping service signatures to compact signatures and back.
//!
//! Each `(service, env)` pair gets a [`Signature`] the first time it is registered. The mapping lives as long as the
//! catalog does and is never evicted, which bounds it by the number of distinct pairs actually observed.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::collections::{FastConcurrentHashMap, FastHashMap};
use crate::signature::{ServiceSignature, ServiceSignatureRef, Signature};

/// Concurrent catalog of service signatures.
///
/// Registration never takes a lock: lookups and inserts go through a concurrent map, and concurrent registrations of
/// the same pair always observe the same signature.
#[derive(Default)]
pub struct ServiceKeyCatalog {
    lookup: FastConcurrentHashMap<ServiceSignature, Signature>,
    next_signature: AtomicU64,
}

impl ServiceKeyCatalog {
    /// Creates a new, empty `ServiceKeyCatalog`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service signature and returns its signature.
    ///
    /// If the service signature was registered before, the existing signature is returned.
    pub fn register(&self, svc_sig: ServiceSignature) -> Signature {
        let lookup = self.lookup.pin();
        if let Some(sig) = lookup.get(&svc_sig) {
            return *sig;
        }

        // Losing a race to another registration only burns an identifier; the stored signature is the winner's.
        *lookup.get_or_insert_with(svc_sig, || Signature(self.next_signature.fetch_add(1, Relaxed)))
    }

    /// Registers the service signature of the given service and environment, and returns its signature.
    ///
    /// Only allocates the first time a pair is seen.
    pub fn register_service(&self, service: &str, env: &str) -> Signature {
        let svc_sig = ServiceSignatureRef::new(service, env);
        if let Some(sig) = self.lookup.pin().get(&svc_sig) {
            return *sig;
        }

        self.register(svc_sig.into_owned())
    }

    /// Returns the number of registered service signatures.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    /// Returns `true` if no service signature has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Projects per-signature rates back to rates keyed by service signature.
    ///
    /// Service signatures with no entry in `rates` get `default_rate`. The empty service signature is always present,
    /// mapped to `default_rate`, so that clients with a service this catalog has not seen yet still get a rate.
    pub fn rates_by_service(
        &self, rates: &FastHashMap<Signature, f64>, default_rate: f64,
    ) -> FastHashMap<ServiceSignature, f64> {
        let lookup = self.lookup.pin();
        let mut rates_by_service = FastHashMap::with_capacity_and_hasher(lookup.len() + 1, Default::default());
        for (svc_sig, sig) in lookup.iter() {
            let rate = rates.get(sig).copied().unwrap_or(default_rate);
            rates_by_service.insert(svc_sig.clone(), rate);
        }
        rates_by_service.insert(ServiceSignature::default(), default_rate);
        rates_by_service
    }
}
