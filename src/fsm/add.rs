//! The ADD-SIGNER process: bring a new signer into a group while the zone
//! stays validatable.
//!
//! The joining signer is resolved via `Zone.fsm_signer`; it normally sits
//! in the group's pending-add set and is addressed alongside the members
//! in every step.

use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_proto::dnssec::rdata::DNSKEY;
use hickory_proto::rr::{Record, RecordType};
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::{post_true, pre_true, Process, StepCtx, StepError, StepResult, Transition};
use crate::dns;
use crate::model::{KeyIdentity, Signer};

/// The ADD-SIGNER process definition.
pub static ADD_SIGNER: Process = Process {
    name: "ADD-SIGNER",
    initial: "signer-joining",
    requires_signer: true,
    transitions: &[
        Transition {
            name: "ADD_SYNC_DNSKEYS",
            from: "signer-joining",
            to: "dnskeys-synced",
            description: "Cross-publish the union of all signers' DNSKEYs and record per-signer origin rows",
            pre: pre_true,
            action: add_sync_dnskeys_action,
            post: post_true,
        },
        Transition {
            name: "ADD_CDS",
            from: "dnskeys-synced",
            to: "cds-added",
            description: "Once every signer serves every recorded DNSKEY, build CDS/CDNSKEY RRsets and push to all signers",
            pre: add_cds_pre,
            action: add_cds_action,
            post: post_true,
        },
        Transition {
            name: "ADD_SYNC_NSES",
            from: "cds-added",
            to: "nses-synced",
            description: "Cross-publish the union of all signers' NS records and record per-signer origin rows",
            pre: pre_true,
            action: add_sync_nses_action,
            post: post_true,
        },
        Transition {
            name: "ADD_CSYNC",
            from: "nses-synced",
            to: "csync-added",
            description: "Once every signer serves the full NS union, build CSYNC records and push to every signer",
            pre: add_csync_pre,
            action: add_csync_action,
            post: post_true,
        },
        Transition {
            name: "ADD_FINALIZE",
            from: "csync-added",
            to: "stop",
            description: "Withdraw CSYNC and CDS/CDNSKEY RRsets and promote the joining signer to full membership",
            pre: pre_true,
            action: add_finalize_action,
            post: post_true,
        },
    ],
};

/// All signers participating in the add: members plus the joining signer.
fn participants(ctx: &StepCtx) -> std::result::Result<(Vec<Signer>, Signer), StepError> {
    let group = ctx.group()?;
    let joining = ctx.process_signer()?;
    let all = ctx.signers_with(&group, &joining)?;
    Ok((all, joining))
}

fn add_sync_dnskeys_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, _joining) = participants(ctx)?;

        // fetch each signer's current keys and remember their origin
        let mut per_signer: HashMap<String, Vec<Record>> = HashMap::new();
        for signer in &signers {
            let live = ctx.fetch(signer, RecordType::DNSKEY).await?;
            let identities: Vec<KeyIdentity> = live
                .iter()
                .filter_map(dns::as_dnskey)
                .map(dns::key_identity)
                .collect();
            ctx.store
                .record_zone_dnskeys(&ctx.zone.name, &signer.name, &identities);
            per_signer.insert(signer.name.clone(), live);
        }

        // the union every signer must end up serving
        let mut union: Vec<Record> = Vec::new();
        let mut seen: HashSet<KeyIdentity> = HashSet::new();
        for live in per_signer.values() {
            for rr in live {
                let Some(key) = dns::as_dnskey(rr) else { continue };
                if seen.insert(dns::key_identity(key)) {
                    union.push(rr.clone());
                }
            }
        }

        for signer in &signers {
            let have: HashSet<KeyIdentity> = per_signer
                .get(&signer.name)
                .into_iter()
                .flatten()
                .filter_map(dns::as_dnskey)
                .map(dns::key_identity)
                .collect();
            let missing: Vec<Record> = union
                .iter()
                .filter(|rr| {
                    dns::as_dnskey(rr)
                        .map(|key| !have.contains(&dns::key_identity(key)))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            info!(
                zone = %ctx.zone.name,
                signer = %signer.name,
                count = missing.len(),
                "publishing missing DNSKEYs"
            );
            ctx.publish(signer, &missing, &[], "DNSKEY record set").await?;
        }
        Ok(())
    }
    .boxed()
}

fn add_cds_pre<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, _joining) = participants(ctx)?;
        let recorded = ctx.store.all_zone_dnskeys(&ctx.zone.name);

        for signer in &signers {
            let live: HashSet<KeyIdentity> = ctx
                .fetch(signer, RecordType::DNSKEY)
                .await?
                .iter()
                .filter_map(dns::as_dnskey)
                .map(dns::key_identity)
                .collect();
            for identity in &recorded {
                if !live.contains(identity) {
                    return Err(StepError::Blocked(format!(
                        "signer {} does not yet serve DNSKEY {}",
                        signer.name,
                        identity.public_key_b64()
                    )));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

fn add_cds_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, _joining) = participants(ctx)?;
        let apex = ctx.apex()?;

        info!(zone = %ctx.zone.name, "creating CDS/CDNSKEY record sets");
        let mut seen = HashSet::new();
        let mut ksks: Vec<DNSKEY> = Vec::new();
        for signer in &signers {
            let live = ctx.fetch(signer, RecordType::DNSKEY).await?;
            for rr in &live {
                let Some(key) = dns::as_dnskey(rr) else { continue };
                if dns::is_ksk(key) && seen.insert(dns::key_identity(key)) {
                    ksks.push(key.clone());
                }
            }
        }

        let (cdses, cdnskeys) = dns::synthesize_cds(&apex, ctx.record_ttl, &ksks)
            .map_err(|e| StepError::Blocked(format!("unable to build CDS/CDNSKEY: {e}")))?;
        let inserts: Vec<Record> = cdses.into_iter().chain(cdnskeys).collect();

        for signer in &signers {
            ctx.publish(signer, &inserts, &[], "CDS/CDNSKEY record sets")
                .await?;
        }
        Ok(())
    }
    .boxed()
}

fn add_sync_nses_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, _joining) = participants(ctx)?;
        let apex = ctx.apex()?;

        let mut per_signer: HashMap<String, HashSet<String>> = HashMap::new();
        for signer in &signers {
            let live = ctx.fetch(signer, RecordType::NS).await?;
            let names: Vec<String> = live
                .iter()
                .filter_map(dns::as_ns)
                .map(|n| n.to_ascii())
                .collect();
            ctx.store
                .record_zone_nses(&ctx.zone.name, &signer.name, &names);
            per_signer.insert(signer.name.clone(), names.into_iter().collect());
        }

        let union: HashSet<String> = per_signer.values().flatten().cloned().collect();

        for signer in &signers {
            let have = &per_signer[&signer.name];
            let mut missing: Vec<Record> = Vec::new();
            for ns in union.difference(have) {
                let target = hickory_proto::rr::Name::from_ascii(ns)
                    .map_err(|e| StepError::Fatal(format!("NS name {ns} invalid: {e}")))?;
                missing.push(dns::ns_record(&apex, target, ctx.record_ttl));
            }
            if missing.is_empty() {
                continue;
            }
            info!(
                zone = %ctx.zone.name,
                signer = %signer.name,
                count = missing.len(),
                "publishing missing NS records"
            );
            ctx.publish(signer, &missing, &[], "NS record set").await?;
        }
        Ok(())
    }
    .boxed()
}

fn add_csync_pre<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, _joining) = participants(ctx)?;

        let mut union: HashSet<String> = HashSet::new();
        for signer in &signers {
            for ns in ctx.store.zone_nses(&ctx.zone.name, &signer.name) {
                union.insert(ns.trim_end_matches('.').to_string());
            }
        }

        for signer in &signers {
            let live: HashSet<String> = ctx
                .fetch(signer, RecordType::NS)
                .await?
                .iter()
                .filter_map(dns::as_ns)
                .map(|n| n.to_ascii().trim_end_matches('.').to_string())
                .collect();
            for ns in &union {
                if !live.contains(ns) {
                    return Err(StepError::Blocked(format!(
                        "signer {} does not yet serve NS {ns}",
                        signer.name
                    )));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

fn add_csync_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, _joining) = participants(ctx)?;
        let apex = ctx.apex()?;

        info!(zone = %ctx.zone.name, "creating CSYNC record sets");
        for signer in &signers {
            let soa = ctx.fetch(signer, RecordType::SOA).await?;
            let serial = soa
                .iter()
                .find_map(dns::as_soa_serial)
                .ok_or_else(|| {
                    StepError::Blocked(format!("no SOA in answer from {}", signer.name))
                })?;
            let csync = dns::csync_record(&apex, serial, ctx.record_ttl);
            ctx.publish(signer, &[csync], &[], "CSYNC record set").await?;
        }
        Ok(())
    }
    .boxed()
}

fn add_finalize_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (signers, joining) = participants(ctx)?;

        for signer in &signers {
            ctx.remove_rrsets(
                signer,
                &[RecordType::CSYNC, RecordType::CDS, RecordType::CDNSKEY],
                "CSYNC and CDS/CDNSKEY record sets",
            )
            .await?;
        }

        let group = ctx.group()?;
        if group.pending_add.iter().any(|s| s == &joining.name) {
            ctx.store
                .promote_pending_add(&ctx.zone.signer_group, &joining.name)
                .map_err(|e| StepError::Fatal(e.to_string()))?;
        } else if !group.members.iter().any(|s| s == &joining.name) {
            return Err(StepError::Fatal(format!(
                "joining signer {} is neither pending-add nor a member of group {}",
                joining.name, ctx.zone.signer_group
            )));
        }

        info!(
            zone = %ctx.zone.name,
            signer = %joining.name,
            group = %ctx.zone.signer_group,
            "signer addition complete"
        );
        Ok(())
    }
    .boxed()
}
