//! Quota-aware provider selection
//!
//! A provider is eligible when it is enabled, has credentials (if it needs
//! them) and has quota left today. Eligible providers are drawn at random,
//! weighted by their remaining quota.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::{debug, trace, warn};

use common::error::{Error, Result};

use crate::registry::{ProviderRegistry, QuotaReservation};

impl ProviderRegistry {
    /// Picks a provider using the thread-local RNG
    ///
    /// The pick holds no quota; use [`reserve_provider`](Self::reserve_provider)
    /// before making a call.
    pub fn select_provider(&self) -> Result<String> {
        self.select_provider_with(&mut rand::thread_rng())
    }

    /// Picks a provider using the given RNG
    pub fn select_provider_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<String> {
        let (position, remaining) = self.draw(rng)?;
        Ok(self.mark_selected(position, remaining))
    }

    /// Picks a provider and holds one call of its quota, using the
    /// thread-local RNG
    pub fn reserve_provider(&self) -> Result<QuotaReservation<'_>> {
        self.reserve_provider_with(&mut rand::thread_rng())
    }

    /// Picks a provider and holds one call of its quota
    ///
    /// The quota check and the hold happen under the provider's lock, so
    /// concurrent callers never hold more calls than the quota allows. A
    /// provider that filled up between the draw and the hold is drawn again.
    pub fn reserve_provider_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<QuotaReservation<'_>> {
        loop {
            let (position, _) = self.draw(rng)?;

            match self.entries[position].try_reserve(self.clock.today()) {
                Some(remaining) => {
                    self.mark_selected(position, remaining);
                    return Ok(QuotaReservation::new(self, position));
                }
                None => trace!("Provider {} filled up before it could be reserved", self.entries[position].descriptor.id),
            }
        }
    }

    /// Weighted draw over eligible providers
    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<(usize, u32)> {
        let mut candidates = self.eligible();

        if candidates.is_empty() {
            // Counts from a previous day may be all that blocks selection
            self.rebase_all();
            candidates = self.eligible();
        }

        if candidates.is_empty() {
            warn!("No provider available: all are disabled, uncredentialed or over quota");
            return Err(Error::NoProviderAvailable);
        }

        let weights = candidates.iter().map(|&(_, remaining)| remaining);
        let distribution =
            WeightedIndex::new(weights).map_err(|e| Error::Internal(format!("Invalid selection weights: {}", e)))?;

        Ok(candidates[distribution.sample(rng)])
    }

    fn mark_selected(&self, position: usize, remaining: u32) -> String {
        let provider_id = self.entries[position].descriptor.id.clone();

        debug!("Selected provider {} ({} calls left today)", provider_id, remaining);
        *self.last_selected.lock() = Some(provider_id.clone());

        provider_id
    }

    /// Eligible providers with their remaining quota, in catalog order
    fn eligible(&self) -> Vec<(usize, u32)> {
        let today = self.clock.today();

        self.entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let usage = entry.usage.lock();
                entry.headroom(&usage, today).map(|remaining| (position, remaining))
            })
            .collect()
    }
}
