//! Updaters: the per-method fetch/update contract and its registry.
//!
//! Exactly one updater exists per signer `method` tag. The registry is
//! assembled once by the composition root and read-only afterwards; an
//! unknown method is a fatal configuration error.

use async_trait::async_trait;
use hickory_proto::rr::{Name, Record, RecordType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::api::{self, ApiRrset, ProviderApi, DEFAULT_THROTTLE_HOLD};
use crate::dns::{self, DdnsClient};
use crate::error::{EnsembleError, Result};
use crate::model::{Signer, SignerMethod};
use crate::ratelimit::{OpDisposition, OpExecutor, OpKind, OpManager, SignerOp, SignerOpResult};

/// The fetch/update contract every transport implements.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Apply inserts and single-RR removes on one signer.
    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Record],
        removes: &[Record],
    ) -> Result<()>;

    /// Remove whole RRsets of the given types at `owner` on one signer.
    async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rtypes: &[RecordType],
    ) -> Result<()>;

    /// Fetch one RRset from one signer.
    async fn fetch_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>>;
}

/// Process-wide mapping from method tag to updater.
#[derive(Default)]
pub struct UpdaterRegistry {
    map: HashMap<SignerMethod, Arc<dyn Updater>>,
}

impl UpdaterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the updater for a method. Called only during composition.
    pub fn register(&mut self, method: SignerMethod, updater: Arc<dyn Updater>) {
        self.map.insert(method, updater);
    }

    /// Select the updater for a signer's method.
    pub fn get(&self, method: SignerMethod) -> Result<Arc<dyn Updater>> {
        self.map.get(&method).cloned().ok_or_else(|| {
            EnsembleError::Config(format!("no updater registered for method {method}"))
        })
    }
}

/// Direct DNS UPDATE with TSIG; no rate limiting.
pub struct DdnsUpdater {
    client: DdnsClient,
}

impl DdnsUpdater {
    /// Create an updater over the given DNS client.
    pub fn new(client: DdnsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Updater for DdnsUpdater {
    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        _owner: &str,
        inserts: &[Record],
        removes: &[Record],
    ) -> Result<()> {
        self.client
            .send_update(signer, zone, inserts, removes, &[])
            .await
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rtypes: &[RecordType],
    ) -> Result<()> {
        let owner = Name::from_ascii(owner)?;
        let remove_rrsets: Vec<(Name, RecordType)> =
            rtypes.iter().map(|t| (owner.clone(), *t)).collect();
        self.client
            .send_update(signer, zone, &[], &[], &remove_rrsets)
            .await
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        owner: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>> {
        self.client.fetch_rrset(signer, owner, rtype, true).await
    }
}

/// An updater whose every op is boxed as a [`SignerOp`] and serialized
/// through the rate-limited manager. Used for `rlddns` and for the REST
/// provider methods; only the manager's executor differs.
pub struct QueuedUpdater {
    manager: OpManager,
}

impl QueuedUpdater {
    /// Create an updater submitting to the given manager's lanes.
    pub fn new(manager: OpManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Updater for QueuedUpdater {
    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Record],
        removes: &[Record],
    ) -> Result<()> {
        self.manager
            .submit(
                signer.clone(),
                zone,
                owner,
                OpKind::Update {
                    inserts: inserts.to_vec(),
                    removes: removes.to_vec(),
                    remove_rrsets: Vec::new(),
                },
            )
            .await
            .map(|_| ())
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rtypes: &[RecordType],
    ) -> Result<()> {
        self.manager
            .submit(
                signer.clone(),
                zone,
                owner,
                OpKind::Update {
                    inserts: Vec::new(),
                    removes: Vec::new(),
                    remove_rrsets: rtypes.to_vec(),
                },
            )
            .await
            .map(|_| ())
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>> {
        self.manager
            .submit(signer.clone(), zone, owner, OpKind::Fetch { rtype })
            .await
            .map(|result| result.rrs)
    }
}

/// Fetch-only updater for signers with no update mechanism.
pub struct NoneUpdater {
    client: DdnsClient,
}

impl NoneUpdater {
    /// Create the fetch-only updater.
    pub fn new(client: DdnsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Updater for NoneUpdater {
    async fn update(
        &self,
        signer: &Signer,
        _zone: &str,
        _owner: &str,
        _inserts: &[Record],
        _removes: &[Record],
    ) -> Result<()> {
        Err(EnsembleError::Unsupported(format!(
            "signer {} has method none, updates are not possible",
            signer.name
        )))
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        _owner: &str,
        _rtypes: &[RecordType],
    ) -> Result<()> {
        Err(EnsembleError::Unsupported(format!(
            "signer {} has method none, updates are not possible",
            signer.name
        )))
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        owner: &str,
        rtype: RecordType,
    ) -> Result<Vec<Record>> {
        // unsigned query; a method-none signer has no shared TSIG key
        self.client.fetch_rrset(signer, owner, rtype, false).await
    }
}

/// Lane executor performing TSIG-signed DNS exchanges. The wire protocol
/// never reports server-side throttling; the per-minute budget is the only
/// limit (it is voluntary).
pub struct DdnsExecutor {
    client: DdnsClient,
}

impl DdnsExecutor {
    /// Create the executor over the given DNS client.
    pub fn new(client: DdnsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OpExecutor for DdnsExecutor {
    async fn execute(&self, op: &SignerOp) -> OpDisposition {
        let result = match &op.kind {
            OpKind::Fetch { rtype } => self
                .client
                .fetch_rrset(&op.signer, &op.owner, *rtype, true)
                .await
                .map(|rrs| SignerOpResult { rrs }),
            OpKind::Update {
                inserts,
                removes,
                remove_rrsets,
            } => {
                let owner = match Name::from_ascii(&op.owner) {
                    Ok(name) => name,
                    Err(e) => return OpDisposition::Done(Err(e.into())),
                };
                let remove_rrsets: Vec<(Name, RecordType)> =
                    remove_rrsets.iter().map(|t| (owner.clone(), *t)).collect();
                self.client
                    .send_update(&op.signer, &op.zone, inserts, removes, &remove_rrsets)
                    .await
                    .map(|()| SignerOpResult::default())
            }
        };
        OpDisposition::Done(result)
    }
}

/// Lane executor speaking a deSEC-style RRset REST API.
///
/// Updates are expressed declaratively: the current RRset is fetched,
/// inserts and removes are merged in, and the result is PUT back. A 429
/// anywhere makes the whole op retry after the provider's hold, which is
/// safe because the PUT is idempotent.
pub struct RestExecutor {
    api: Arc<ProviderApi>,
    ttl: u32,
}

impl RestExecutor {
    /// Create the executor for one provider endpoint.
    pub fn new(api: Arc<ProviderApi>, ttl: u32) -> Self {
        Self { api, ttl }
    }

    fn rrset_endpoint(zone: &str, subname: &str, rtype: RecordType) -> String {
        let zone = zone.trim_end_matches('.');
        let subname = if subname.is_empty() { "@" } else { subname };
        format!("/domains/{zone}/rrsets/{subname}/{rtype}/")
    }

    /// Fetch the current presentation-format contents of one RRset; a 404
    /// means the RRset does not exist.
    async fn fetch_texts(
        &self,
        zone: &str,
        subname: &str,
        rtype: RecordType,
    ) -> std::result::Result<Vec<String>, OpDisposition> {
        let endpoint = Self::rrset_endpoint(zone, subname, rtype);
        let response = match self.api.get(&endpoint).await {
            Ok(r) => r,
            Err(e) => return Err(OpDisposition::Done(Err(e))),
        };
        if response.is_throttled() {
            return Err(OpDisposition::Throttled {
                hold: api::retry_hold(&response).unwrap_or(DEFAULT_THROTTLE_HOLD),
            });
        }
        if response.status == 404 {
            return Ok(Vec::new());
        }
        if !response.is_success() {
            return Err(OpDisposition::Done(Err(response.into_api_error())));
        }
        match serde_json::from_slice::<ApiRrset>(&response.body) {
            Ok(rrset) => Ok(rrset.records),
            Err(e) => Err(OpDisposition::Done(Err(EnsembleError::Transport(format!(
                "malformed RRset response from {}: {e}",
                self.api.name()
            ))))),
        }
    }

    /// PUT the full replacement RRsets.
    async fn put_rrsets(&self, zone: &str, rrsets: &[ApiRrset]) -> OpDisposition {
        let zone = zone.trim_end_matches('.');
        let endpoint = format!("/domains/{zone}/rrsets/");
        let body = match serde_json::to_value(rrsets) {
            Ok(v) => v,
            Err(e) => {
                return OpDisposition::Done(Err(EnsembleError::Transport(format!(
                    "serializing RRsets failed: {e}"
                ))))
            }
        };
        let response = match self.api.put(&endpoint, &body).await {
            Ok(r) => r,
            Err(e) => return OpDisposition::Done(Err(e.into())),
        };
        if response.is_throttled() {
            return OpDisposition::Throttled {
                hold: api::retry_hold(&response).unwrap_or(DEFAULT_THROTTLE_HOLD),
            };
        }
        if !response.is_success() {
            return OpDisposition::Done(Err(response.into_api_error()));
        }
        OpDisposition::Done(Ok(SignerOpResult::default()))
    }
}

#[async_trait]
impl OpExecutor for RestExecutor {
    async fn execute(&self, op: &SignerOp) -> OpDisposition {
        let subname = api::subname(&op.owner, &op.zone);

        match &op.kind {
            OpKind::Fetch { rtype } => {
                let texts = match self.fetch_texts(&op.zone, &subname, *rtype).await {
                    Ok(texts) => texts,
                    Err(disposition) => return disposition,
                };
                let owner = match Name::from_ascii(&op.owner) {
                    Ok(name) => name,
                    Err(e) => return OpDisposition::Done(Err(e.into())),
                };
                let mut rrs = Vec::with_capacity(texts.len());
                for text in &texts {
                    match dns::parse_rdata(*rtype, text) {
                        Ok(rdata) => {
                            rrs.push(Record::from_rdata(owner.clone(), self.ttl, rdata))
                        }
                        Err(e) => return OpDisposition::Done(Err(e)),
                    }
                }
                debug!(provider = %self.api.name(), owner = %op.owner, %rtype, count = rrs.len(), "fetched RRset via API");
                OpDisposition::Done(Ok(SignerOpResult { rrs }))
            }

            OpKind::Update {
                inserts,
                removes,
                remove_rrsets,
            } => {
                let mut replacements: Vec<ApiRrset> = Vec::new();

                // group inserts/removes by type and merge into current state
                let mut touched: Vec<RecordType> = Vec::new();
                for rr in inserts.iter().chain(removes.iter()) {
                    if !touched.contains(&rr.record_type()) {
                        touched.push(rr.record_type());
                    }
                }

                for rtype in touched {
                    let mut texts = match self.fetch_texts(&op.zone, &subname, rtype).await {
                        Ok(texts) => texts,
                        Err(disposition) => return disposition,
                    };
                    for rr in inserts.iter().filter(|rr| rr.record_type() == rtype) {
                        let text = dns::rdata_text(rr);
                        if !texts.contains(&text) {
                            texts.push(text);
                        }
                    }
                    for rr in removes.iter().filter(|rr| rr.record_type() == rtype) {
                        let text = dns::rdata_text(rr);
                        texts.retain(|t| *t != text);
                    }
                    replacements.push(ApiRrset {
                        subname: subname.clone(),
                        rrtype: rtype.to_string(),
                        ttl: self.ttl,
                        records: texts,
                    });
                }

                for rtype in remove_rrsets {
                    replacements.push(ApiRrset {
                        subname: subname.clone(),
                        rrtype: rtype.to_string(),
                        ttl: self.ttl,
                        records: Vec::new(),
                    });
                }

                if replacements.is_empty() {
                    return OpDisposition::Done(Err(EnsembleError::Unsupported(
                        "inserts and removes empty, nothing to do".to_string(),
                    )));
                }

                self.put_rrsets(&op.zone, &replacements).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn none_signer() -> Signer {
        Signer {
            name: "s9.example.".to_string(),
            method: SignerMethod::None,
            address: "10.0.0.9".to_string(),
            port: 53,
            auth: String::new(),
        }
    }

    #[test]
    fn test_registry_selects_by_method() {
        let client = DdnsClient::new(Duration::from_secs(5));
        let mut registry = UpdaterRegistry::new();
        registry.register(SignerMethod::Ddns, Arc::new(DdnsUpdater::new(client)));

        assert!(registry.get(SignerMethod::Ddns).is_ok());
        match registry.get(SignerMethod::Desec) {
            Err(err) => assert!(matches!(err, EnsembleError::Config(_))),
            Ok(_) => panic!("expected no updater registered for method"),
        }
    }

    #[tokio::test]
    async fn test_none_updater_rejects_updates() {
        let updater = NoneUpdater::new(DdnsClient::new(Duration::from_secs(5)));
        let err = updater
            .update(&none_signer(), "z.example.", "z.example.", &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Unsupported(_)));
    }

    #[test]
    fn test_rest_endpoint_shape() {
        assert_eq!(
            RestExecutor::rrset_endpoint("example.com.", "", RecordType::NS),
            "/domains/example.com/rrsets/@/NS/"
        );
        assert_eq!(
            RestExecutor::rrset_endpoint("example.com.", "www", RecordType::NS),
            "/domains/example.com/rrsets/www/NS/"
        );
    }
}
