//! Core entities: signers, signer groups, and zones.
//!
//! Entities reference one another by name only; resolution always goes
//! through the zone store. A `Zone` never owns its `SignerGroup` and a
//! group never owns its `Signer`s.

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

/// Transport used to fetch from and update one signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignerMethod {
    /// Direct DNS UPDATE with TSIG, no rate limiting.
    #[serde(rename = "ddns")]
    Ddns,
    /// DNS UPDATE with TSIG, queued through the rate-limited manager.
    #[serde(rename = "rlddns")]
    RlDdns,
    /// deSEC HTTPS API.
    #[serde(rename = "desec-api")]
    Desec,
    /// Google Cloud DNS HTTPS API.
    #[serde(rename = "google")]
    Google,
    /// AWS Route53 HTTPS API.
    #[serde(rename = "aws")]
    Aws,
    /// Signer without any update mechanism (fetch only).
    #[serde(rename = "none")]
    None,
}

impl SignerMethod {
    /// The configuration tag for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerMethod::Ddns => "ddns",
            SignerMethod::RlDdns => "rlddns",
            SignerMethod::Desec => "desec-api",
            SignerMethod::Google => "google",
            SignerMethod::Aws => "aws",
            SignerMethod::None => "none",
        }
    }
}

impl std::fmt::Display for SignerMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authoritative signer holding a copy of a zone's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signer {
    /// Stable signer name (dotted DNS label).
    pub name: String,
    /// Transport used to reach this signer.
    pub method: SignerMethod,
    /// Host name or IP address of the signer.
    pub address: String,
    /// DNS port on the signer.
    #[serde(default = "default_dns_port")]
    pub port: u16,
    /// Credential: `keyname:secret` for TSIG methods, API token otherwise.
    #[serde(default)]
    pub auth: String,
}

fn default_dns_port() -> u16 {
    53
}

impl Signer {
    /// Split the `keyname:secret` TSIG credential, normalizing the key name
    /// to an FQDN. The secret stays base64 as stored.
    pub fn tsig_credential(&self) -> Result<(String, String)> {
        if self.address.is_empty() {
            return Err(EnsembleError::Transport(format!(
                "no ip|host for signer {}",
                self.name
            )));
        }
        if self.auth.is_empty() {
            return Err(EnsembleError::Tsig(format!("no TSIG for signer {}", self.name)));
        }
        let Some((key, secret)) = self.auth.split_once(':') else {
            return Err(EnsembleError::Tsig(format!(
                "incorrect TSIG for signer {}",
                self.name
            )));
        };
        if key.is_empty() || secret.is_empty() {
            return Err(EnsembleError::Tsig(format!(
                "incorrect TSIG for signer {}",
                self.name
            )));
        }
        let key = if key.ends_with('.') {
            key.to_string()
        } else {
            format!("{key}.")
        };
        Ok((key, secret.to_string()))
    }
}

/// A named set of signers jointly serving the group's zones.
///
/// A signer never sits in both `members` and `pending_add`. A leaving
/// signer stays in `members` while also listed in `pending_removal` until
/// its removal process completes; leave transitions must not rely on
/// either staging and always address the leaving signer explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerGroup {
    /// Group name.
    pub name: String,
    /// Current full members, in configuration order.
    pub members: Vec<String>,
    /// Signers staged to join.
    #[serde(default)]
    pub pending_add: Vec<String>,
    /// Members staged to leave.
    #[serde(default)]
    pub pending_removal: Vec<String>,
}

impl SignerGroup {
    /// True if the signer appears anywhere in the group.
    pub fn contains(&self, signer: &str) -> bool {
        self.members.iter().any(|s| s == signer)
            || self.pending_add.iter().any(|s| s == signer)
            || self.pending_removal.iter().any(|s| s == signer)
    }

    /// Stage a new signer for joining.
    pub fn stage_add(&mut self, signer: &str) -> Result<()> {
        if self.contains(signer) {
            return Err(EnsembleError::Config(format!(
                "signer {signer} already present in group {}",
                self.name
            )));
        }
        self.pending_add.push(signer.to_string());
        Ok(())
    }

    /// Promote a pending-add signer to full membership.
    pub fn promote_pending_add(&mut self, signer: &str) -> Result<()> {
        let Some(idx) = self.pending_add.iter().position(|s| s == signer) else {
            return Err(EnsembleError::not_found(
                "pending-add signer",
                &format!("{signer} in group {}", self.name),
            ));
        };
        self.pending_add.remove(idx);
        self.members.push(signer.to_string());
        Ok(())
    }

    /// Stage a member for removal. The signer stays in `members` until the
    /// leave process completes; leave transitions must not rely on either
    /// staging (see the engine's leaving-signer handling).
    pub fn stage_removal(&mut self, signer: &str) -> Result<()> {
        if !self.members.iter().any(|s| s == signer) {
            return Err(EnsembleError::not_found(
                "member",
                &format!("{signer} in group {}", self.name),
            ));
        }
        if !self.pending_removal.iter().any(|s| s == signer) {
            self.pending_removal.push(signer.to_string());
        }
        Ok(())
    }

    /// Drop a leaving signer from the group entirely.
    pub fn complete_removal(&mut self, signer: &str) {
        self.members.retain(|s| s != signer);
        self.pending_removal.retain(|s| s != signer);
    }
}

/// Whether a zone runs real signer traffic or short-circuits every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    /// Normal operation.
    #[default]
    Normal,
    /// Every precondition and action succeeds without signer traffic.
    Debug,
}

/// Result of the last FSM step for a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsmStatus {
    /// Last step succeeded (or no step has run yet).
    #[default]
    Ok,
    /// Last step's precondition or action did not hold; will be retried.
    Blocked,
    /// Unrecoverable; operator intervention required.
    Stop,
}

impl FsmStatus {
    /// Lowercase tag, as persisted and as used in metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmStatus::Ok => "ok",
            FsmStatus::Blocked => "blocked",
            FsmStatus::Stop => "stop",
        }
    }
}

/// Whether the auto-push scheduler drives this zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsmMode {
    /// Stepped automatically by the scheduler.
    #[default]
    Auto,
    /// Stepped only via the control plane.
    Manual,
}

/// One zone owned by the operator, signed by every signer in its group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Apex name, FQDN with trailing dot.
    pub name: String,
    /// Normal or debug.
    #[serde(default)]
    pub zone_type: ZoneType,
    /// Name of the signer group serving this zone.
    pub signer_group: String,
    /// Current process name; empty when idle.
    #[serde(default)]
    pub fsm: String,
    /// Current state within the process; empty means the process initial.
    #[serde(default)]
    pub fsm_state: String,
    /// The signer parameterizing a per-signer process (joining or leaving).
    #[serde(default)]
    pub fsm_signer: Option<String>,
    /// Result of the last step.
    #[serde(default)]
    pub fsm_status: FsmStatus,
    /// Scheduler participation.
    #[serde(default)]
    pub fsm_mode: FsmMode,
    /// Human-readable reason recorded by the last failing step.
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl Zone {
    /// True when the zone short-circuits all preconditions and actions.
    pub fn is_debug(&self) -> bool {
        self.zone_type == ZoneType::Debug
    }
}

/// Identity of a DNSKEY independent of its flags or TTL, persisted as
/// `<protocol>-<algorithm>-<publickey-base64>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyIdentity(String);

impl KeyIdentity {
    /// Assemble an identity from its parts.
    pub fn new(protocol: u8, algorithm: u8, public_key_b64: &str) -> Self {
        KeyIdentity(format!("{protocol}-{algorithm}-{public_key_b64}"))
    }

    /// The persisted tuple form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base64 public key component, for log messages.
    pub fn public_key_b64(&self) -> &str {
        self.0.splitn(3, '-').nth(2).unwrap_or("")
    }
}

impl std::fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with(members: &[&str]) -> SignerGroup {
        SignerGroup {
            name: "g1".to_string(),
            members: members.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_tsig_credential_split() {
        let signer = Signer {
            name: "s1.example.".to_string(),
            method: SignerMethod::Ddns,
            address: "10.0.0.1".to_string(),
            port: 53,
            auth: "mykey:c2VjcmV0".to_string(),
        };
        let (key, secret) = signer.tsig_credential().unwrap();
        assert_eq!(key, "mykey.");
        assert_eq!(secret, "c2VjcmV0");
    }

    #[test]
    fn test_tsig_credential_rejects_malformed() {
        let mut signer = Signer {
            name: "s1.example.".to_string(),
            method: SignerMethod::Ddns,
            address: "10.0.0.1".to_string(),
            port: 53,
            auth: "no-colon-here".to_string(),
        };
        assert!(signer.tsig_credential().is_err());

        signer.auth = String::new();
        assert!(signer.tsig_credential().is_err());

        signer.auth = "key:secret".to_string();
        signer.address = String::new();
        assert!(signer.tsig_credential().is_err());
    }

    #[test]
    fn test_stage_add_rejects_existing_member() {
        let mut group = group_with(&["s1.", "s2."]);
        assert!(group.stage_add("s1.").is_err());
        assert!(group.stage_add("s3.").is_ok());
        assert!(group.stage_add("s3.").is_err());
    }

    #[test]
    fn test_promote_pending_add() {
        let mut group = group_with(&["s1."]);
        group.stage_add("s2.").unwrap();
        group.promote_pending_add("s2.").unwrap();
        assert!(group.members.iter().any(|s| s == "s2."));
        assert!(group.pending_add.is_empty());
    }

    #[test]
    fn test_removal_lifecycle() {
        let mut group = group_with(&["s1.", "s2."]);
        group.stage_removal("s2.").unwrap();
        // still a member while the leave process runs
        assert!(group.members.iter().any(|s| s == "s2."));

        group.complete_removal("s2.");
        assert!(!group.contains("s2."));
    }

    #[test]
    fn test_key_identity_tuple() {
        let id = KeyIdentity::new(3, 13, "AwEAAa==");
        assert_eq!(id.as_str(), "3-13-AwEAAa==");
        assert_eq!(id.public_key_b64(), "AwEAAa==");
    }
}
