//! Zone store: the single source of truth for intended state.
//!
//! The daemon consumes the store through the [`ZoneStore`] trait; the
//! relational backing store lives in the control plane and is out of scope
//! here. [`MemoryZoneStore`] is the in-tree implementation, used by the
//! daemon (seeded from a file) and by tests.
//!
//! Cached RR rows (`zone_nses`, `zone_dnskeys`) record what this system put
//! on each signer; live DNS responses are what the world sees. Convergence
//! between the two is what most transitions verify.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EnsembleError, Result};
use crate::model::{FsmMode, FsmStatus, KeyIdentity, Signer, SignerGroup, Zone};

/// Read and write operations the core needs from the zone database.
pub trait ZoneStore: Send + Sync {
    /// All zones with `fsm_mode = auto`, a non-empty process, and a status
    /// other than stop. These are the scheduler's candidates.
    fn auto_zones(&self) -> Vec<Zone>;

    /// Look up a zone by apex name.
    fn zone(&self, name: &str) -> Option<Zone>;

    /// Look up a signer group by name.
    fn signer_group(&self, name: &str) -> Option<SignerGroup>;

    /// Look up a signer by name, regardless of group membership.
    fn signer(&self, name: &str) -> Option<Signer>;

    /// Commit a new FSM state for a zone.
    fn set_fsm_state(&self, zone: &str, state: &str);

    /// Record the result of the last step.
    fn set_fsm_status(&self, zone: &str, status: FsmStatus);

    /// Record the human-readable reason for the last failing step.
    fn set_stop_reason(&self, zone: &str, reason: Option<&str>);

    /// The NS names recorded for `(zone, signer)`.
    fn zone_nses(&self, zone: &str, signer: &str) -> Vec<String>;

    /// Replace the NS rows for `(zone, signer)`.
    fn record_zone_nses(&self, zone: &str, signer: &str, nses: &[String]);

    /// Clear the NS rows for `(zone, signer)`.
    fn clear_zone_nses(&self, zone: &str, signer: &str);

    /// The DNSKEY identities recorded for `(zone, signer)`.
    fn zone_dnskeys(&self, zone: &str, signer: &str) -> Vec<KeyIdentity>;

    /// DNSKEY identities recorded for the zone across all signers.
    fn all_zone_dnskeys(&self, zone: &str) -> Vec<KeyIdentity>;

    /// Replace the DNSKEY rows for `(zone, signer)`.
    fn record_zone_dnskeys(&self, zone: &str, signer: &str, keys: &[KeyIdentity]);

    /// Clear the DNSKEY rows for `(zone, signer)`.
    fn clear_zone_dnskeys(&self, zone: &str, signer: &str);

    /// Promote a pending-add signer to full group membership.
    fn promote_pending_add(&self, group: &str, signer: &str) -> Result<()>;

    /// Drop a leaving signer from a group entirely.
    fn complete_removal(&self, group: &str, signer: &str) -> Result<()>;

    /// Entity counts `(zones, signers, groups)`, for metrics.
    fn counts(&self) -> (usize, usize, usize);

    /// Zone counts by FSM status `(ok, blocked, stopped)`, for metrics.
    fn status_counts(&self) -> (usize, usize, usize);
}

/// Seed file contents for [`MemoryZoneStore`].
#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    /// Signers to load.
    #[serde(default)]
    pub signers: Vec<Signer>,
    /// Signer groups to load.
    #[serde(default)]
    pub groups: Vec<SignerGroup>,
    /// Zones to load.
    #[serde(default)]
    pub zones: Vec<Zone>,
}

/// Thread-safe in-memory zone store.
#[derive(Debug, Clone, Default)]
pub struct MemoryZoneStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    zones: HashMap<String, Zone>,
    groups: HashMap<String, SignerGroup>,
    signers: HashMap<String, Signer>,

    /// (zone, signer) -> NS names put there by this system.
    nses: HashMap<(String, String), Vec<String>>,

    /// (zone, signer) -> DNSKEY identity tuples put there by this system.
    dnskeys: HashMap<(String, String), Vec<KeyIdentity>>,
}

impl MemoryZoneStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store populated from a parsed seed file.
    pub fn from_seed(seed: StoreSeed) -> Result<Self> {
        let store = Self::new();
        for signer in seed.signers {
            store.upsert_signer(signer);
        }
        for group in seed.groups {
            for member in group
                .members
                .iter()
                .chain(&group.pending_add)
                .chain(&group.pending_removal)
            {
                if store.signer(member).is_none() {
                    return Err(EnsembleError::Config(format!(
                        "group {} references unknown signer {member}",
                        group.name
                    )));
                }
            }
            store.upsert_group(group);
        }
        for zone in seed.zones {
            if store.signer_group(&zone.signer_group).is_none() {
                return Err(EnsembleError::Config(format!(
                    "zone {} references unknown signer group {}",
                    zone.name, zone.signer_group
                )));
            }
            store.upsert_zone(zone);
        }
        Ok(store)
    }

    /// Insert or replace a signer.
    pub fn upsert_signer(&self, signer: Signer) {
        let mut inner = self.inner.write();
        debug!(signer = %signer.name, method = %signer.method, "upserting signer");
        inner.signers.insert(signer.name.clone(), signer);
    }

    /// Insert or replace a signer group.
    pub fn upsert_group(&self, group: SignerGroup) {
        let mut inner = self.inner.write();
        debug!(group = %group.name, members = group.members.len(), "upserting signer group");
        inner.groups.insert(group.name.clone(), group);
    }

    /// Insert or replace a zone.
    pub fn upsert_zone(&self, zone: Zone) {
        let mut inner = self.inner.write();
        debug!(zone = %zone.name, fsm = %zone.fsm, state = %zone.fsm_state, "upserting zone");
        inner.zones.insert(zone.name.clone(), zone);
    }
}

impl ZoneStore for MemoryZoneStore {
    fn auto_zones(&self) -> Vec<Zone> {
        let inner = self.inner.read();
        inner
            .zones
            .values()
            .filter(|z| {
                z.fsm_mode == FsmMode::Auto && !z.fsm.is_empty() && z.fsm_status != FsmStatus::Stop
            })
            .cloned()
            .collect()
    }

    fn zone(&self, name: &str) -> Option<Zone> {
        self.inner.read().zones.get(name).cloned()
    }

    fn signer_group(&self, name: &str) -> Option<SignerGroup> {
        self.inner.read().groups.get(name).cloned()
    }

    fn signer(&self, name: &str) -> Option<Signer> {
        self.inner.read().signers.get(name).cloned()
    }

    fn set_fsm_state(&self, zone: &str, state: &str) {
        let mut inner = self.inner.write();
        if let Some(z) = inner.zones.get_mut(zone) {
            debug!(zone, from = %z.fsm_state, to = state, "fsm state transition");
            z.fsm_state = state.to_string();
        }
    }

    fn set_fsm_status(&self, zone: &str, status: FsmStatus) {
        let mut inner = self.inner.write();
        if let Some(z) = inner.zones.get_mut(zone) {
            z.fsm_status = status;
        }
    }

    fn set_stop_reason(&self, zone: &str, reason: Option<&str>) {
        let mut inner = self.inner.write();
        if let Some(z) = inner.zones.get_mut(zone) {
            z.stop_reason = reason.map(str::to_string);
        }
    }

    fn zone_nses(&self, zone: &str, signer: &str) -> Vec<String> {
        self.inner
            .read()
            .nses
            .get(&(zone.to_string(), signer.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn record_zone_nses(&self, zone: &str, signer: &str, nses: &[String]) {
        let mut inner = self.inner.write();
        debug!(zone, signer, count = nses.len(), "recording zone_nses rows");
        inner
            .nses
            .insert((zone.to_string(), signer.to_string()), nses.to_vec());
    }

    fn clear_zone_nses(&self, zone: &str, signer: &str) {
        let mut inner = self.inner.write();
        inner.nses.remove(&(zone.to_string(), signer.to_string()));
    }

    fn zone_dnskeys(&self, zone: &str, signer: &str) -> Vec<KeyIdentity> {
        self.inner
            .read()
            .dnskeys
            .get(&(zone.to_string(), signer.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn all_zone_dnskeys(&self, zone: &str) -> Vec<KeyIdentity> {
        let inner = self.inner.read();
        inner
            .dnskeys
            .iter()
            .filter(|((z, _), _)| z == zone)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    fn record_zone_dnskeys(&self, zone: &str, signer: &str, keys: &[KeyIdentity]) {
        let mut inner = self.inner.write();
        debug!(zone, signer, count = keys.len(), "recording zone_dnskeys rows");
        inner
            .dnskeys
            .insert((zone.to_string(), signer.to_string()), keys.to_vec());
    }

    fn clear_zone_dnskeys(&self, zone: &str, signer: &str) {
        let mut inner = self.inner.write();
        inner
            .dnskeys
            .remove(&(zone.to_string(), signer.to_string()));
    }

    fn promote_pending_add(&self, group: &str, signer: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| EnsembleError::not_found("signer group", group))?;
        g.promote_pending_add(signer)
    }

    fn complete_removal(&self, group: &str, signer: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let g = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| EnsembleError::not_found("signer group", group))?;
        g.complete_removal(signer);
        Ok(())
    }

    fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read();
        (inner.zones.len(), inner.signers.len(), inner.groups.len())
    }

    fn status_counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read();
        let mut ok = 0;
        let mut blocked = 0;
        let mut stopped = 0;
        for z in inner.zones.values() {
            match z.fsm_status {
                FsmStatus::Ok => ok += 1,
                FsmStatus::Blocked => blocked += 1,
                FsmStatus::Stop => stopped += 1,
            }
        }
        (ok, blocked, stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SignerMethod, ZoneType};

    fn make_signer(name: &str) -> Signer {
        Signer {
            name: name.to_string(),
            method: SignerMethod::Ddns,
            address: "10.0.0.1".to_string(),
            port: 53,
            auth: "key:c2VjcmV0".to_string(),
        }
    }

    fn make_zone(name: &str, fsm: &str, mode: FsmMode) -> Zone {
        Zone {
            name: name.to_string(),
            zone_type: ZoneType::Normal,
            signer_group: "g1".to_string(),
            fsm: fsm.to_string(),
            fsm_state: String::new(),
            fsm_signer: None,
            fsm_status: FsmStatus::Ok,
            fsm_mode: mode,
            stop_reason: None,
        }
    }

    #[test]
    fn test_auto_zones_selection() {
        let store = MemoryZoneStore::new();
        store.upsert_zone(make_zone("a.example.", "ADD-SIGNER", FsmMode::Auto));
        store.upsert_zone(make_zone("b.example.", "", FsmMode::Auto));
        store.upsert_zone(make_zone("c.example.", "ADD-SIGNER", FsmMode::Manual));

        let mut stopped = make_zone("d.example.", "ADD-SIGNER", FsmMode::Auto);
        stopped.fsm_status = FsmStatus::Stop;
        store.upsert_zone(stopped);

        let auto = store.auto_zones();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].name, "a.example.");
    }

    #[test]
    fn test_fsm_field_writes() {
        let store = MemoryZoneStore::new();
        store.upsert_zone(make_zone("a.example.", "ADD-SIGNER", FsmMode::Auto));

        store.set_fsm_state("a.example.", "dnskeys-synced");
        store.set_fsm_status("a.example.", FsmStatus::Blocked);
        store.set_stop_reason("a.example.", Some("DNSKEY missing on s2"));

        let zone = store.zone("a.example.").unwrap();
        assert_eq!(zone.fsm_state, "dnskeys-synced");
        assert_eq!(zone.fsm_status, FsmStatus::Blocked);
        assert_eq!(zone.stop_reason.as_deref(), Some("DNSKEY missing on s2"));

        store.set_stop_reason("a.example.", None);
        assert!(store.zone("a.example.").unwrap().stop_reason.is_none());
    }

    #[test]
    fn test_cached_rr_rows_roundtrip() {
        let store = MemoryZoneStore::new();
        store.record_zone_nses("z.", "s1.", &["ns1.s1.".to_string(), "ns2.s1.".to_string()]);
        assert_eq!(store.zone_nses("z.", "s1.").len(), 2);
        assert!(store.zone_nses("z.", "s2.").is_empty());

        store.clear_zone_nses("z.", "s1.");
        assert!(store.zone_nses("z.", "s1.").is_empty());
    }

    #[test]
    fn test_all_zone_dnskeys_spans_signers() {
        let store = MemoryZoneStore::new();
        store.record_zone_dnskeys("z.", "s1.", &[KeyIdentity::new(3, 13, "AAA=")]);
        store.record_zone_dnskeys("z.", "s2.", &[KeyIdentity::new(3, 13, "BBB=")]);
        store.record_zone_dnskeys("other.", "s1.", &[KeyIdentity::new(3, 13, "CCC=")]);

        let keys = store.all_zone_dnskeys("z.");
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_group_membership_through_store() {
        let store = MemoryZoneStore::new();
        store.upsert_signer(make_signer("s1."));
        store.upsert_signer(make_signer("s3."));
        store.upsert_group(SignerGroup {
            name: "g1".to_string(),
            members: vec!["s1.".to_string()],
            pending_add: vec!["s3.".to_string()],
            pending_removal: vec![],
        });

        store.promote_pending_add("g1", "s3.").unwrap();
        let group = store.signer_group("g1").unwrap();
        assert!(group.members.iter().any(|s| s == "s3."));
        assert!(group.pending_add.is_empty());

        store.complete_removal("g1", "s1.").unwrap();
        assert!(!store.signer_group("g1").unwrap().contains("s1."));
    }

    #[test]
    fn test_seed_rejects_dangling_references() {
        let seed = StoreSeed {
            signers: vec![],
            groups: vec![SignerGroup {
                name: "g1".to_string(),
                members: vec!["missing.".to_string()],
                ..Default::default()
            }],
            zones: vec![],
        };
        assert!(MemoryZoneStore::from_seed(seed).is_err());

        let seed = StoreSeed {
            signers: vec![],
            groups: vec![],
            zones: vec![make_zone("z.", "", FsmMode::Auto)],
        };
        assert!(MemoryZoneStore::from_seed(seed).is_err());
    }
}
