//! The REMOVE-SIGNER process: drive a zone while one signer leaves its
//! group, keeping the zone validatable throughout.
//!
//! Every step resolves the leaving signer via `Zone.fsm_signer` through the
//! store and skips it when iterating the member set, so it behaves the same
//! whether or not group metadata still lists it as a member.

use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_proto::rr::{Name, Record, RecordType};
use std::collections::HashSet;
use tracing::info;

use super::{post_true, pre_true, Process, StepCtx, StepError, StepResult, Transition};
use crate::dns;

/// The REMOVE-SIGNER process definition.
pub static REMOVE_SIGNER: Process = Process {
    name: "REMOVE-SIGNER",
    initial: "signer-leaving",
    requires_signer: true,
    transitions: &[
        Transition {
            name: "LEAVE_SYNC_NSES",
            from: "signer-leaving",
            to: "nses-synced",
            description: "Remove NS records that originated from the leaving signer from every signer",
            pre: pre_true,
            action: leave_sync_nses_action,
            post: post_true,
        },
        Transition {
            name: "LEAVE_SYNC_DNSKEYS",
            from: "nses-synced",
            to: "dnskeys-synced",
            description: "Remove the leaving signer's DNSKEYs from the remaining signers",
            pre: pre_true,
            action: leave_sync_dnskeys_action,
            post: post_true,
        },
        Transition {
            name: "LEAVE_ADD_CDS",
            from: "dnskeys-synced",
            to: "cds-added",
            description: "Once no leaving-signer DNSKEY remains anywhere, build CDS/CDNSKEY RRsets and push to the remaining signers",
            pre: leave_add_cds_pre,
            action: leave_add_cds_action,
            post: post_true,
        },
        Transition {
            name: "LEAVE_ADD_CSYNC",
            from: "cds-added",
            to: "csync-added",
            description: "Once no leaving-signer NS remains anywhere, build CSYNC records and push to every signer",
            pre: leave_add_csync_pre,
            action: leave_add_csync_action,
            post: post_true,
        },
        Transition {
            name: "LEAVE_FINALIZE",
            from: "csync-added",
            to: "stop",
            description: "Withdraw CSYNC and CDS/CDNSKEY RRsets, clear cached rows, drop the signer from the group",
            pre: pre_true,
            action: leave_finalize_action,
            post: post_true,
        },
    ],
};

/// Members without the leaving signer, plus the leaving signer itself as
/// the final element.
fn targets_with_leaving(
    ctx: &StepCtx,
) -> std::result::Result<(Vec<crate::model::Signer>, crate::model::Signer), StepError> {
    let group = ctx.group()?;
    let leaving = ctx.process_signer()?;
    let remaining = ctx.member_signers(&group, Some(&leaving.name))?;
    Ok((remaining, leaving))
}

fn leave_sync_nses_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, leaving) = targets_with_leaving(ctx)?;

        let nses = ctx.store.zone_nses(&ctx.zone.name, &leaving.name);
        if nses.is_empty() {
            info!(zone = %ctx.zone.name, signer = %leaving.name, "no recorded NS rows for leaving signer");
            return Ok(());
        }

        let apex = ctx.apex()?;
        let mut removes: Vec<Record> = Vec::with_capacity(nses.len());
        for ns in &nses {
            let target = Name::from_ascii(ns)
                .map_err(|e| StepError::Fatal(format!("recorded NS {ns} invalid: {e}")))?;
            removes.push(dns::ns_record(&apex, target, 0));
        }

        info!(
            zone = %ctx.zone.name,
            signer = %leaving.name,
            count = removes.len(),
            "removing NS records originating from leaving signer"
        );
        for signer in remaining.iter().chain(std::iter::once(&leaving)) {
            ctx.publish(signer, &[], &removes, "NS removals").await?;
        }
        Ok(())
    }
    .boxed()
}

fn leave_sync_dnskeys_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, leaving) = targets_with_leaving(ctx)?;

        let recorded: HashSet<_> = ctx
            .store
            .zone_dnskeys(&ctx.zone.name, &leaving.name)
            .into_iter()
            .collect();
        if recorded.is_empty() {
            info!(zone = %ctx.zone.name, signer = %leaving.name, "no recorded DNSKEY rows for leaving signer");
            return Ok(());
        }

        for signer in &remaining {
            let live = ctx.fetch(signer, RecordType::DNSKEY).await?;
            let removes: Vec<Record> = live
                .into_iter()
                .filter(|rr| {
                    dns::as_dnskey(rr)
                        .map(|key| recorded.contains(&dns::key_identity(key)))
                        .unwrap_or(false)
                })
                .collect();
            if removes.is_empty() {
                continue;
            }
            ctx.publish(signer, &[], &removes, "DNSKEY removals").await?;
        }
        Ok(())
    }
    .boxed()
}

fn leave_add_cds_pre<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, leaving) = targets_with_leaving(ctx)?;

        let recorded: HashSet<_> = ctx
            .store
            .zone_dnskeys(&ctx.zone.name, &leaving.name)
            .into_iter()
            .collect();

        info!(
            zone = %ctx.zone.name,
            signer = %leaving.name,
            "verifying that the leaving signer's DNSKEYs are gone from all signers"
        );
        for signer in &remaining {
            let live = ctx.fetch(signer, RecordType::DNSKEY).await?;
            for rr in &live {
                let Some(key) = dns::as_dnskey(rr) else { continue };
                let identity = dns::key_identity(key);
                if recorded.contains(&identity) {
                    return Err(StepError::Blocked(format!(
                        "DNSKEY {} of leaving signer {} still exists in signer {}",
                        identity.public_key_b64(),
                        leaving.name,
                        signer.name
                    )));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

fn leave_add_cds_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, _leaving) = targets_with_leaving(ctx)?;
        let apex = ctx.apex()?;

        info!(zone = %ctx.zone.name, "creating CDS/CDNSKEY record sets");
        let mut seen = HashSet::new();
        let mut ksks = Vec::new();
        for signer in &remaining {
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

        for signer in &remaining {
            ctx.publish(signer, &inserts, &[], "CDS/CDNSKEY record sets")
                .await?;
        }
        Ok(())
    }
    .boxed()
}

fn leave_add_csync_pre<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, leaving) = targets_with_leaving(ctx)?;

        let recorded: HashSet<String> = ctx
            .store
            .zone_nses(&ctx.zone.name, &leaving.name)
            .into_iter()
            .map(|ns| ns.trim_end_matches('.').to_string())
            .collect();

        info!(
            zone = %ctx.zone.name,
            signer = %leaving.name,
            "verifying that the leaving signer's NSes are gone from all signers"
        );
        // the leaving signer itself must agree before CSYNC goes out
        for signer in remaining.iter().chain(std::iter::once(&leaving)) {
            let live = ctx.fetch(signer, RecordType::NS).await?;
            for rr in &live {
                let Some(target) = dns::as_ns(rr) else { continue };
                let target = target.to_ascii();
                if recorded.contains(target.trim_end_matches('.')) {
                    return Err(StepError::Blocked(format!(
                        "NS {target} of leaving signer {} still exists in signer {}",
                        leaving.name, signer.name
                    )));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

fn leave_add_csync_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, leaving) = targets_with_leaving(ctx)?;
        let apex = ctx.apex()?;

        info!(zone = %ctx.zone.name, "creating CSYNC record sets");
        for signer in remaining.iter().chain(std::iter::once(&leaving)) {
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

fn leave_finalize_action<'a>(ctx: &'a StepCtx) -> BoxFuture<'a, StepResult> {
    async move {
        let (remaining, leaving) = targets_with_leaving(ctx)?;

        for signer in &remaining {
            ctx.remove_rrsets(
                signer,
                &[RecordType::CSYNC, RecordType::CDS, RecordType::CDNSKEY],
                "CSYNC and CDS/CDNSKEY record sets",
            )
            .await?;
        }
        // the CSYNC was also published on the leaving signer
        ctx.remove_rrsets(&leaving, &[RecordType::CSYNC], "CSYNC record set")
            .await?;

        ctx.store.clear_zone_nses(&ctx.zone.name, &leaving.name);
        ctx.store.clear_zone_dnskeys(&ctx.zone.name, &leaving.name);
        ctx.store
            .complete_removal(&ctx.zone.signer_group, &leaving.name)
            .map_err(|e| StepError::Fatal(e.to_string()))?;

        info!(
            zone = %ctx.zone.name,
            signer = %leaving.name,
            group = %ctx.zone.signer_group,
            "signer removal complete"
        );
        Ok(())
    }
    .boxed()
}
