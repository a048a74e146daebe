//! Shared test infrastructure for FSM engine integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::rr::{Name, Record, RecordType};

use ensemble_dns::dns;
use ensemble_dns::error::Result;
use ensemble_dns::fsm::FsmEngine;
use ensemble_dns::model::{FsmMode, FsmStatus, Signer, SignerGroup, SignerMethod, Zone, ZoneType};
use ensemble_dns::store::MemoryZoneStore;
use ensemble_dns::updater::{Updater, UpdaterRegistry};

pub const ZONE: &str = "example.com.";
pub const GROUP: &str = "g1";
pub const RECORD_TTL: u32 = 300;

// --- Record builders ---

/// Build a record at the zone apex from presentation-format rdata.
pub fn apex_record(rtype: RecordType, rdata: &str) -> Record {
    let owner = Name::from_ascii(ZONE).unwrap();
    let rdata = dns::parse_rdata(rtype, rdata).expect("test rdata parses");
    Record::from_rdata(owner, RECORD_TTL, rdata)
}

/// A KSK DNSKEY record (flags 257) with the given base64 key material.
pub fn ksk(key_b64: &str) -> Record {
    apex_record(RecordType::DNSKEY, &format!("257 3 13 {key_b64}"))
}

/// A ZSK DNSKEY record (flags 256) with the given base64 key material.
pub fn zsk(key_b64: &str) -> Record {
    apex_record(RecordType::DNSKEY, &format!("256 3 13 {key_b64}"))
}

/// An NS record at the apex.
pub fn ns(target: &str) -> Record {
    apex_record(RecordType::NS, target)
}

/// An SOA record at the apex with the given serial.
pub fn soa(serial: u32) -> Record {
    apex_record(
        RecordType::SOA,
        &format!("ns1.example.com. hostmaster.example.com. {serial} 3600 600 604800 60"),
    )
}

// --- MockUpdater ---

/// One recorded update call.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub signer: String,
    pub inserts: Vec<Record>,
    pub removes: Vec<Record>,
    pub removed_rrsets: Vec<RecordType>,
}

#[derive(Default)]
struct MockInner {
    /// (signer, rtype) -> live records, mutated by updates like a real signer.
    rrsets: HashMap<(String, RecordType), Vec<Record>>,
    updates: Vec<RecordedUpdate>,
    fetches: usize,
}

/// An in-memory updater standing in for all signer transports. Updates
/// mutate the simulated live state so multi-step processes converge the
/// same way they would against real signers.
#[derive(Clone, Default)]
pub struct MockUpdater {
    inner: Arc<Mutex<MockInner>>,
}

impl MockUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the simulated live RRset of one signer.
    pub fn set_rrset(&self, signer: &str, rtype: RecordType, records: Vec<Record>) {
        let mut inner = self.inner.lock().unwrap();
        inner.rrsets.insert((signer.to_string(), rtype), records);
    }

    /// The simulated live RRset of one signer.
    pub fn rrset(&self, signer: &str, rtype: RecordType) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .rrsets
            .get(&(signer.to_string(), rtype))
            .cloned()
            .unwrap_or_default()
    }

    /// All update calls seen so far.
    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.inner.lock().unwrap().updates.clone()
    }

    /// Number of fetch calls seen so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.lock().unwrap().fetches
    }

    /// True if no signer traffic at all was issued.
    pub fn no_traffic(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.updates.is_empty() && inner.fetches == 0
    }
}

#[async_trait]
impl Updater for MockUpdater {
    async fn update(
        &self,
        signer: &Signer,
        _zone: &str,
        _owner: &str,
        inserts: &[Record],
        removes: &[Record],
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for rr in inserts {
            let set = inner
                .rrsets
                .entry((signer.name.clone(), rr.record_type()))
                .or_default();
            if !set.iter().any(|r| r.data() == rr.data()) {
                set.push(rr.clone());
            }
        }
        for rr in removes {
            if let Some(set) = inner
                .rrsets
                .get_mut(&(signer.name.clone(), rr.record_type()))
            {
                set.retain(|r| r.data() != rr.data());
            }
        }
        inner.updates.push(RecordedUpdate {
            signer: signer.name.clone(),
            inserts: inserts.to_vec(),
            removes: removes.to_vec(),
            removed_rrsets: Vec::new(),
        });
        Ok(())
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        _owner: &str,
        rtypes: &[RecordType],
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for rtype in rtypes {
            inner.rrsets.remove(&(signer.name.clone(), *rtype));
        }
        inner.updates.push(RecordedUpdate {
            signer: signer.name.clone(),
            inserts: Vec::new(),
            removes: Vec::new(),
            removed_rrsets: rtypes.to_vec(),
        });
        Ok(())
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        _owner: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>> {
        let mut inner = self.inner.lock().unwrap();
        inner.fetches += 1;
        Ok(inner
            .rrsets
            .get(&(signer.name.clone(), rtype))
            .cloned()
            .unwrap_or_default())
    }
}

// --- Harness ---

/// Store + mock updater + engine wired together.
pub struct TestHarness {
    pub store: Arc<MemoryZoneStore>,
    pub mock: Arc<MockUpdater>,
    pub engine: FsmEngine,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryZoneStore::new());
        let mock = Arc::new(MockUpdater::new());

        let mut registry = UpdaterRegistry::new();
        registry.register(SignerMethod::Ddns, mock.clone());

        let engine = FsmEngine::new(store.clone(), Arc::new(registry), RECORD_TTL);
        Self {
            store,
            mock,
            engine,
        }
    }

    /// Add a signer using the mock-backed `ddns` method.
    pub fn add_signer(&self, name: &str) {
        self.store.upsert_signer(Signer {
            name: name.to_string(),
            method: SignerMethod::Ddns,
            address: "10.0.0.1".to_string(),
            port: 53,
            auth: "key:c2VjcmV0".to_string(),
        });
    }

    /// Add the signer group.
    pub fn add_group(&self, members: &[&str], pending_add: &[&str], pending_removal: &[&str]) {
        self.store.upsert_group(SignerGroup {
            name: GROUP.to_string(),
            members: members.iter().map(|s| s.to_string()).collect(),
            pending_add: pending_add.iter().map(|s| s.to_string()).collect(),
            pending_removal: pending_removal.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Add the zone, in the given process at the given state.
    pub fn add_zone(&self, fsm: &str, state: &str, fsm_signer: Option<&str>, zone_type: ZoneType) {
        self.store.upsert_zone(Zone {
            name: ZONE.to_string(),
            zone_type,
            signer_group: GROUP.to_string(),
            fsm: fsm.to_string(),
            fsm_state: state.to_string(),
            fsm_signer: fsm_signer.map(str::to_string),
            fsm_status: FsmStatus::Ok,
            fsm_mode: FsmMode::Auto,
            stop_reason: None,
        });
    }

    /// The current zone row.
    pub fn zone(&self) -> Zone {
        use ensemble_dns::store::ZoneStore;
        self.store.zone(ZONE).expect("zone exists")
    }
}
