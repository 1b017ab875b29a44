//! Path Selection
//!
//! Picks guard, middle and exit relays for a circuit. No two hops of a
//! path may share a country or a coarse subnet (/16 IPv4, /32 IPv6).
//! Exits are drawn from the preferred countries when any qualify; an
//! explicit exit-country override is strict.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::directory::RelayDescriptor;
use crate::error::{CoreError, CoreResult};

/// Guards tried before giving up on a path
const MAX_GUARD_TRIES: usize = 8;
/// Middles tried per guard
const MAX_MIDDLE_TRIES: usize = 16;

/// True when `a` and `b` may appear in the same path
pub fn is_diverse(a: &RelayDescriptor, b: &RelayDescriptor) -> bool {
    a.fingerprint != b.fingerprint && a.country != b.country && a.subnet() != b.subnet()
}

/// A selected guard, middle and exit
#[derive(Debug, Clone)]
pub struct SelectedPath {
    pub guard: RelayDescriptor,
    pub middle: RelayDescriptor,
    pub exit: RelayDescriptor,
}

impl SelectedPath {
    pub fn relays(&self) -> [&RelayDescriptor; 3] {
        [&self.guard, &self.middle, &self.exit]
    }
}

/// Path selector for choosing relay nodes
pub struct PathSelector {
    preferred_exit_countries: Vec<String>,
    exit_override: Option<String>,
    /// Entry points used instead of flagged guards (bridges)
    entry_guards: Option<Vec<RelayDescriptor>>,
    exclude: HashSet<String>,
}

impl PathSelector {
    pub fn new() -> Self {
        Self {
            preferred_exit_countries: Vec::new(),
            exit_override: None,
            entry_guards: None,
            exclude: HashSet::new(),
        }
    }

    /// Prefer exits in these countries
    pub fn preferred_exit_countries(mut self, countries: &[String]) -> Self {
        self.preferred_exit_countries = countries.iter().map(|c| c.to_ascii_uppercase()).collect();
        self
    }

    /// Require the exit to be in this country
    pub fn exit_override(mut self, country: Option<&str>) -> Self {
        self.exit_override = country.map(|c| c.to_ascii_uppercase());
        self
    }

    /// Enter only through these relays
    pub fn entry_guards(mut self, guards: Option<Vec<RelayDescriptor>>) -> Self {
        self.entry_guards = guards;
        self
    }

    /// Exclude relays by fingerprint
    pub fn exclude(mut self, fingerprints: impl IntoIterator<Item = String>) -> Self {
        self.exclude.extend(fingerprints);
        self
    }

    /// Select a diverse guard → middle → exit path
    pub fn select_path(&self, relays: &[RelayDescriptor]) -> CoreResult<SelectedPath> {
        let mut rng = rand::thread_rng();

        let usable: Vec<&RelayDescriptor> = relays
            .iter()
            .filter(|r| !self.exclude.contains(&r.fingerprint))
            .collect();

        let mut guards: Vec<&RelayDescriptor> = match &self.entry_guards {
            Some(entries) => entries
                .iter()
                .filter(|r| !self.exclude.contains(&r.fingerprint))
                .collect(),
            None => usable.iter().copied().filter(|r| r.flags.guard).collect(),
        };
        if guards.is_empty() {
            return Err(CoreError::CircuitBuildFailed("no guard available".into()));
        }
        guards.shuffle(&mut rng);

        for guard in guards.into_iter().take(MAX_GUARD_TRIES) {
            let mut middles: Vec<&RelayDescriptor> = usable
                .iter()
                .copied()
                .filter(|r| is_diverse(guard, r))
                .collect();
            middles.shuffle(&mut rng);

            for middle in middles.into_iter().take(MAX_MIDDLE_TRIES) {
                if let Some(exit) = self.pick_exit(&usable, guard, middle) {
                    debug!(
                        "Selected path {} ({}) -> {} ({}) -> {} ({})",
                        guard.fingerprint,
                        guard.country,
                        middle.fingerprint,
                        middle.country,
                        exit.fingerprint,
                        exit.country
                    );
                    return Ok(SelectedPath {
                        guard: guard.clone(),
                        middle: middle.clone(),
                        exit: exit.clone(),
                    });
                }
            }
        }

        Err(CoreError::CircuitBuildFailed("no diverse path available".into()))
    }

    /// Bandwidth-weighted exit diverse from both earlier hops
    fn pick_exit<'a>(
        &self,
        usable: &[&'a RelayDescriptor],
        guard: &RelayDescriptor,
        middle: &RelayDescriptor,
    ) -> Option<&'a RelayDescriptor> {
        let exits: Vec<&RelayDescriptor> = usable
            .iter()
            .copied()
            .filter(|r| r.flags.exit)
            .filter(|r| is_diverse(guard, r) && is_diverse(middle, r))
            .collect();

        let pool: Vec<&RelayDescriptor> = if let Some(country) = &self.exit_override {
            exits.into_iter().filter(|r| &r.country == country).collect()
        } else {
            let preferred: Vec<&RelayDescriptor> = exits
                .iter()
                .copied()
                .filter(|r| self.preferred_exit_countries.contains(&r.country))
                .collect();
            if preferred.is_empty() {
                exits
            } else {
                preferred
            }
        };

        let mut rng = rand::thread_rng();
        pool.choose_weighted(&mut rng, |r| r.bandwidth.max(1))
            .ok()
            .copied()
    }
}

impl Default for PathSelector {
    fn default() -> Self {
        Self::new()
    }
}
