//! Provider registry implementation
//!
//! The registry owns the immutable provider catalog together with one usage
//! ledger per provider. Ledgers are only reachable through the registry's
//! methods, each of which holds that provider's lock for the whole update.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{ProviderDescriptor, ProviderUsage, UsageReport};
use config::{default_provider_catalog, load_credentials, load_provider_catalog, ConfigManager};

use crate::clock::{Clock, SystemClock};
use crate::credentials::CredentialPool;

/// Catalog entry with its mutable ledger
pub(crate) struct ProviderEntry {
    pub(crate) descriptor: ProviderDescriptor,
    pub(crate) credentials: CredentialPool,
    pub(crate) usage: Mutex<ProviderUsage>,
}

impl ProviderEntry {
    /// Remaining quota for today if the provider can be selected
    pub(crate) fn headroom(&self, usage: &ProviderUsage, today: chrono::NaiveDate) -> Option<u32> {
        if !self.descriptor.enabled {
            return None;
        }

        if self.descriptor.requires_auth && self.credentials.is_empty() {
            return None;
        }

        let used = usage.committed_on(today);
        (used < self.descriptor.daily_quota).then(|| self.descriptor.daily_quota - used)
    }

    /// Holds one call of today's quota if the provider can still be selected
    pub(crate) fn try_reserve(&self, today: chrono::NaiveDate) -> Option<u32> {
        let mut usage = self.usage.lock();
        usage.rebase(today);

        let remaining = self.headroom(&usage, today)?;
        usage.in_flight += 1;

        Some(remaining)
    }
}

/// One provider call's share of the daily quota, held from selection until
/// the call is charged
///
/// Dropping an unsettled reservation hands the quota back without charging
/// the provider.
#[must_use = "dropping a reservation releases its quota"]
pub struct QuotaReservation<'a> {
    registry: &'a ProviderRegistry,
    position: usize,
    settled: bool,
}

impl<'a> QuotaReservation<'a> {
    pub(crate) fn new(registry: &'a ProviderRegistry, position: usize) -> Self {
        Self {
            registry,
            position,
            settled: false,
        }
    }

    pub fn provider_id(&self) -> &'a str {
        &self.descriptor().id
    }

    pub fn descriptor(&self) -> &'a ProviderDescriptor {
        let registry: &'a ProviderRegistry = self.registry;
        &registry.entries[self.position].descriptor
    }

    /// Charges the reserved call as one that produced an image
    pub fn record_success(mut self) {
        self.settle(Some(true));
    }

    /// Charges the reserved call as one that did not produce an image
    pub fn record_failure(mut self) {
        self.settle(Some(false));
    }

    /// Returns the quota without charging a call
    pub fn release(mut self) {
        self.settle(None);
    }

    fn settle(&mut self, outcome: Option<bool>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let entry = &self.registry.entries[self.position];

        // Release and charge under one lock so the quota never looks free in between
        let mut usage = entry.usage.lock();
        usage.in_flight = usage.in_flight.saturating_sub(1);

        match outcome {
            Some(success) => self.registry.charge(entry, &mut usage, success),
            None => debug!("Released quota reservation on {}", entry.descriptor.id),
        }
    }
}

impl Drop for QuotaReservation<'_> {
    fn drop(&mut self) {
        self.settle(None);
    }
}

/// Registry of generation providers
pub struct ProviderRegistry {
    /// Providers in catalog order
    pub(crate) entries: Vec<ProviderEntry>,

    /// Provider id -> position in `entries`
    index: HashMap<String, usize>,

    /// Date and time source
    pub(crate) clock: Arc<dyn Clock>,

    /// Provider returned by the most recent selection
    pub(crate) last_selected: Mutex<Option<String>>,
}

impl ProviderRegistry {
    /// Creates a registry from a catalog and per-provider credential lists
    pub fn new(
        descriptors: Vec<ProviderDescriptor>,
        mut credentials: HashMap<String, Vec<String>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_catalog(&descriptors)?;

        let today = clock.today();
        let mut index = HashMap::with_capacity(descriptors.len());
        let mut entries = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let credentials = CredentialPool::new(credentials.remove(&descriptor.id).unwrap_or_default());

            if descriptor.requires_auth && credentials.is_empty() {
                warn!("Provider {} requires credentials but has none; it will not be selected", descriptor.id);
            }

            debug!(
                "Registered provider {} ({}, quota {}, {} credentials)",
                descriptor.id,
                descriptor.kind.name(),
                descriptor.daily_quota,
                credentials.len()
            );

            index.insert(descriptor.id.clone(), entries.len());
            entries.push(ProviderEntry {
                descriptor,
                credentials,
                usage: Mutex::new(ProviderUsage::new(today)),
            });
        }

        info!("Provider registry initialized with {} providers", entries.len());

        Ok(Self {
            entries,
            index,
            clock,
            last_selected: Mutex::new(None),
        })
    }

    /// Creates a registry on the system clock
    pub fn with_system_clock(
        descriptors: Vec<ProviderDescriptor>,
        credentials: HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        Self::new(descriptors, credentials, Arc::new(SystemClock))
    }

    /// Loads the catalog from `providers.catalog` (or the built-in one) and
    /// credentials from `providers.credentials_dir`
    pub fn from_config(config_manager: &ConfigManager, clock: Arc<dyn Clock>) -> Result<Self> {
        let descriptors = match config_manager.get_path("providers.catalog") {
            Ok(path) => load_provider_catalog(path)?,
            Err(_) => default_provider_catalog(),
        };

        let credentials_dir = config_manager.get_path("providers.credentials_dir")?;
        let credentials = load_credentials(&credentials_dir, descriptors.iter().map(|d| d.id.as_str()))?;

        Self::new(descriptors, credentials, clock)
    }

    pub(crate) fn entry(&self, provider_id: &str) -> Result<&ProviderEntry> {
        self.index
            .get(provider_id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| Error::NotFound(format!("Provider {}", provider_id)))
    }

    /// Descriptor of a provider
    pub fn descriptor(&self, provider_id: &str) -> Result<&ProviderDescriptor> {
        self.entry(provider_id).map(|entry| &entry.descriptor)
    }

    /// All descriptors in catalog order
    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of credentials configured for a provider
    pub fn credential_count(&self, provider_id: &str) -> Result<usize> {
        self.entry(provider_id).map(|entry| entry.credentials.len())
    }

    /// Returns the next credential in rotation
    pub fn next_credential(&self, provider_id: &str) -> Result<String> {
        let entry = self.entry(provider_id)?;
        let mut usage = entry.usage.lock();

        let key = entry
            .credentials
            .at(usage.next_key_index)
            .ok_or_else(|| Error::NoCredential(provider_id.to_string()))?
            .to_string();

        usage.next_key_index = usage.next_key_index.wrapping_add(1);

        Ok(key)
    }

    /// Charges a call that produced an image
    pub fn record_success(&self, provider_id: &str) -> Result<()> {
        self.record_call(provider_id, true)
    }

    /// Charges a call that did not produce an image
    pub fn record_failure(&self, provider_id: &str) -> Result<()> {
        self.record_call(provider_id, false)
    }

    fn record_call(&self, provider_id: &str, success: bool) -> Result<()> {
        let entry = self.entry(provider_id)?;
        self.charge(entry, &mut entry.usage.lock(), success);
        Ok(())
    }

    fn charge(&self, entry: &ProviderEntry, usage: &mut ProviderUsage, success: bool) {
        let today = self.clock.today();

        usage.record_call(today, self.clock.now(), success);

        debug!(
            "Provider {} call {} ({} of {} today)",
            entry.descriptor.id,
            if success { "succeeded" } else { "failed" },
            usage.calls_on(today),
            entry.descriptor.daily_quota
        );
    }

    /// Calls still allowed today once charged and reserved calls are counted
    pub fn remaining_quota(&self, provider_id: &str) -> Result<u32> {
        let entry = self.entry(provider_id)?;
        let today = self.clock.today();

        let mut usage = entry.usage.lock();
        usage.rebase(today);

        Ok(entry.descriptor.daily_quota.saturating_sub(usage.committed_on(today)))
    }

    /// Resets every ledger still holding another day's counts
    ///
    /// Returns the number of ledgers that were reset.
    pub fn rebase_all(&self) -> usize {
        let today = self.clock.today();

        let rebased = self
            .entries
            .iter()
            .filter(|entry| entry.usage.lock().rebase(today))
            .count();

        if rebased > 0 {
            info!("Daily quotas rolled over to {} for {} providers", today, rebased);
        }

        rebased
    }

    /// Copy of one provider's ledger
    pub fn usage(&self, provider_id: &str) -> Result<ProviderUsage> {
        let entry = self.entry(provider_id)?;
        let mut usage = entry.usage.lock();
        usage.rebase(self.clock.today());

        Ok(usage.clone())
    }

    /// Cumulative usage per provider
    pub fn usage_report(&self) -> BTreeMap<String, UsageReport> {
        let today = self.clock.today();

        self.entries
            .iter()
            .map(|entry| {
                let mut usage = entry.usage.lock();
                usage.rebase(today);

                let report = UsageReport {
                    total_calls: usage.total_calls,
                    success_rate: usage.success_rate(),
                    today_calls: usage.calls_on(today),
                };

                (entry.descriptor.id.clone(), report)
            })
            .collect()
    }

    /// Copies of every ledger, for callers that persist statistics
    pub fn usage_snapshot(&self) -> BTreeMap<String, ProviderUsage> {
        let today = self.clock.today();

        self.entries
            .iter()
            .map(|entry| {
                let mut usage = entry.usage.lock();
                usage.rebase(today);
                (entry.descriptor.id.clone(), usage.clone())
            })
            .collect()
    }

    /// Provider returned by the most recent successful selection
    pub fn last_selected(&self) -> Option<String> {
        self.last_selected.lock().clone()
    }
}

fn validate_catalog(descriptors: &[ProviderDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();

    for descriptor in descriptors {
        if descriptor.id.trim().is_empty() {
            return Err(Error::Config("Provider id must not be empty".to_string()));
        }

        if !seen.insert(descriptor.id.as_str()) {
            return Err(Error::Config(format!("Duplicate provider id {}", descriptor.id)));
        }

        Url::parse(&descriptor.base_url).map_err(|e| {
            Error::Config(format!("Provider {} has an invalid base URL {}: {}", descriptor.id, descriptor.base_url, e))
        })?;

        if descriptor.models.is_empty() {
            return Err(Error::Config(format!("Provider {} lists no models", descriptor.id)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn credentials(ids: &[&str]) -> HashMap<String, Vec<String>> {
        ids.iter()
            .map(|id| (id.to_string(), vec![format!("{}_key_1", id), format!("{}_key_2", id)]))
            .collect()
    }

    fn registry(clock: Arc<ManualClock>) -> ProviderRegistry {
        ProviderRegistry::new(
            default_provider_catalog(),
            credentials(&["huggingface", "replicate", "stability"]),
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_catalog_validation() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(day(18)));

        let mut duplicated = default_provider_catalog();
        duplicated[1].id = "huggingface".to_string();
        assert!(matches!(
            ProviderRegistry::new(duplicated, HashMap::new(), clock.clone()),
            Err(Error::Config(_))
        ));

        let mut bad_url = default_provider_catalog();
        bad_url[0].base_url = "not a url".to_string();
        assert!(ProviderRegistry::new(bad_url, HashMap::new(), clock.clone()).is_err());

        let mut no_models = default_provider_catalog();
        no_models[2].models.clear();
        assert!(ProviderRegistry::new(no_models, HashMap::new(), clock).is_err());
    }

    #[test]
    fn test_round_robin_credentials() {
        let registry = registry(Arc::new(ManualClock::new(day(18))));

        let keys: Vec<_> = (0..3)
            .map(|_| registry.next_credential("replicate").unwrap())
            .collect();
        assert_eq!(keys, vec!["replicate_key_1", "replicate_key_2", "replicate_key_1"]);
        assert_eq!(registry.usage("replicate").unwrap().next_key_index, 3);
    }

    #[test]
    fn test_credential_errors() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(day(18)));
        let registry = ProviderRegistry::new(default_provider_catalog(), HashMap::new(), clock).unwrap();

        assert!(matches!(registry.next_credential("stability"), Err(Error::NoCredential(id)) if id == "stability"));
        assert!(registry.next_credential("midjourney").unwrap_err().is_not_found());
    }

    #[test]
    fn test_usage_report_and_rollover() {
        let clock = Arc::new(ManualClock::new(day(18)));
        let registry = registry(clock.clone());

        registry.record_success("huggingface").unwrap();
        registry.record_success("huggingface").unwrap();
        registry.record_success("huggingface").unwrap();
        registry.record_failure("huggingface").unwrap();

        let report = registry.usage_report();
        assert_eq!(report["huggingface"].total_calls, 4);
        assert_eq!(report["huggingface"].success_rate, 75.0);
        assert_eq!(report["huggingface"].today_calls, 4);
        assert_eq!(report["replicate"].success_rate, 0.0);
        assert_eq!(registry.remaining_quota("huggingface").unwrap(), 96);

        clock.advance_days(1);

        let report = registry.usage_report();
        assert_eq!(report["huggingface"].today_calls, 0);
        assert_eq!(report["huggingface"].total_calls, 4);
        assert_eq!(registry.usage_snapshot()["huggingface"].daily_calls.len(), 1);
        assert_eq!(registry.remaining_quota("huggingface").unwrap(), 100);
    }

    #[test]
    fn test_rebase_all_counts_stale_ledgers() {
        let clock = Arc::new(ManualClock::new(day(18)));
        let registry = registry(clock.clone());

        assert_eq!(registry.rebase_all(), 0);
        clock.set_today(day(19));
        assert_eq!(registry.rebase_all(), 3);
        assert_eq!(registry.rebase_all(), 0);
    }

    #[test]
    fn test_from_config_reads_credentials_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stability_keys.json"), r#"{"keys": ["sk-1"]}"#).unwrap();

        let config_manager = ConfigManager::with_defaults();
        config_manager.set("providers.credentials_dir", dir.path().to_string_lossy().to_string());

        let registry = ProviderRegistry::from_config(&config_manager, Arc::new(ManualClock::new(day(18)))).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.credential_count("stability").unwrap(), 1);
        assert_eq!(registry.credential_count("huggingface").unwrap(), 0);
    }
}
