//! Identifier universe
//!
//! Records are created at load and never removed while the service runs, so a
//! scan in progress can always resolve the identifiers it started with.

use crate::types::{DataClass, Identifier};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sigscan_common::config::UniverseEntry;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifierRecord {
    pub id: Identifier,
    pub sector: Option<String>,
    pub tier: Option<String>,
    /// Last successful fetch per data class
    pub last_fetched: BTreeMap<DataClass, DateTime<Utc>>,
    pub attributes_updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Universe {
    records: DashMap<Identifier, IdentifierRecord>,
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[UniverseEntry], at: DateTime<Utc>) -> Self {
        let universe = Self::new();
        universe.load(entries, at);
        universe
    }

    /// Merge entries: new identifiers are added, known ones get their
    /// attributes refreshed. Returns how many were added.
    pub fn load(&self, entries: &[UniverseEntry], at: DateTime<Utc>) -> usize {
        let mut added = 0;
        for entry in entries {
            let id = Identifier::new(entry.id.trim());
            if id.as_str().is_empty() {
                continue;
            }
            if !self.refresh_attributes(&id, entry.sector.clone(), entry.tier.clone(), at) {
                self.records.insert(
                    id.clone(),
                    IdentifierRecord {
                        id,
                        sector: entry.sector.clone(),
                        tier: entry.tier.clone(),
                        last_fetched: BTreeMap::new(),
                        attributes_updated_at: at,
                    },
                );
                added += 1;
            }
        }
        if added > 0 {
            info!(added, total = self.records.len(), "Universe loaded");
        }
        added
    }

    /// Update static attributes of a known identifier
    pub fn refresh_attributes(
        &self,
        id: &Identifier,
        sector: Option<String>,
        tier: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.sector = sector;
                record.tier = tier;
                record.attributes_updated_at = at;
                true
            }
            None => false,
        }
    }

    /// Timestamps only move forward
    pub fn mark_fetched(&self, id: &Identifier, data_class: &DataClass, at: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(id) {
            let slot = record.last_fetched.entry(data_class.clone()).or_insert(at);
            if *slot < at {
                *slot = at;
            }
        }
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &Identifier) -> Option<IdentifierRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Every identifier, sorted
    pub fn ids(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, sector: Option<&str>) -> UniverseEntry {
        UniverseEntry {
            id: id.to_string(),
            sector: sector.map(str::to_string),
            tier: None,
        }
    }

    #[test]
    fn test_load_merges_without_removing() {
        let t0 = Utc::now();
        let universe = Universe::from_entries(&[entry("ACME", Some("tech")), entry("BOLT", None)], t0);
        assert_eq!(universe.len(), 2);

        let added = universe.load(&[entry("ACME", Some("energy")), entry("CORE", None)], t0);
        assert_eq!(added, 1);
        assert_eq!(universe.ids(), vec![Identifier::new("ACME"), "BOLT".into(), "CORE".into()]);
        assert_eq!(universe.get(&"ACME".into()).unwrap().sector.as_deref(), Some("energy"));
    }

    #[test]
    fn test_mark_fetched_is_monotonic() {
        let t0 = Utc::now();
        let universe = Universe::from_entries(&[entry("ACME", None)], t0);
        let class = DataClass::new("options");

        universe.mark_fetched(&"ACME".into(), &class, t0 + chrono::Duration::seconds(10));
        universe.mark_fetched(&"ACME".into(), &class, t0);
        assert_eq!(
            universe.get(&"ACME".into()).unwrap().last_fetched[&class],
            t0 + chrono::Duration::seconds(10)
        );

        // Unknown identifiers are ignored
        universe.mark_fetched(&"NOPE".into(), &class, t0);
        assert!(!universe.contains(&"NOPE".into()));
    }

    #[test]
    fn test_blank_ids_skipped() {
        let universe = Universe::from_entries(&[entry("  ", None)], Utc::now());
        assert!(universe.is_empty());
    }
}
