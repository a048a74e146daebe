//! DNS wire adapter: QUERY/UPDATE construction, TSIG signing, TCP exchange.
//!
//! Updates are standard RFC 2136 messages: the zone goes into the query
//! section with QTYPE SOA, record changes into the authority section
//! (inserts class IN, single-RR deletes class NONE with TTL 0, whole-RRset
//! deletes class ANY with empty RDATA). TSIG is HMAC-SHA256 with a
//! 300-second fudge, appended as the last additional record.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hickory_proto::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::dnssec::rdata::{CDNSKEY, CDS, DNSKEY, DNSSECRData};
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::dnssec::{DigestType, PublicKey, PublicKeyBuf, Verifier};
use hickory_proto::op::{Message, MessageFinalizer, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{CSYNC, NS};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{EnsembleError, Result};
use crate::model::{KeyIdentity, Signer};

/// TSIG fudge in seconds for every signed message.
pub const TSIG_FUDGE: u16 = 300;

/// DNSKEY protocol field, fixed at 3 by RFC 4034.
const DNSKEY_PROTOCOL: u8 = 3;

/// Build a QUERY for `{owner, rtype}`.
pub fn build_query(owner: &Name, rtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(false);
    let mut query = Query::new();
    query.set_name(owner.clone());
    query.set_query_type(rtype);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg
}

/// Build an UPDATE carrying inserts, single-RR removes, and whole-RRset
/// removes for the given zone.
pub fn build_update(
    zone: &Name,
    inserts: &[Record],
    removes: &[Record],
    remove_rrsets: &[(Name, RecordType)],
) -> Message {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Update);

    let mut zone_query = Query::new();
    zone_query.set_name(zone.clone());
    zone_query.set_query_type(RecordType::SOA);
    zone_query.set_query_class(DNSClass::IN);
    msg.add_query(zone_query);

    for rr in inserts {
        let mut rr = rr.clone();
        rr.set_dns_class(DNSClass::IN);
        msg.add_name_server(rr);
    }
    for rr in removes {
        let mut rr = rr.clone();
        rr.set_dns_class(DNSClass::NONE);
        rr.set_ttl(0);
        msg.add_name_server(rr);
    }
    for (owner, rtype) in remove_rrsets {
        let mut rr = Record::from_rdata(owner.clone(), 0, RData::Update0(*rtype));
        rr.set_dns_class(DNSClass::ANY);
        msg.add_name_server(rr);
    }

    msg
}

/// Sign a message with the signer's TSIG credential.
pub fn sign_tsig(msg: &mut Message, signer: &Signer) -> Result<()> {
    let (key_name, secret_b64) = signer.tsig_credential()?;
    let secret = BASE64.decode(secret_b64.as_bytes()).map_err(|e| {
        EnsembleError::Tsig(format!("TSIG secret for signer {} is not base64: {e}", signer.name))
    })?;
    let key_name = Name::from_ascii(&key_name)?;

    let tsigner = TSigner::new(secret, TsigAlgorithm::HmacSha256, key_name, TSIG_FUDGE)
        .map_err(|e| EnsembleError::Tsig(format!("TSIG signer setup failed: {e}")))?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    let (tsig_records, _verifier) = tsigner.finalize_message(msg, now)?;
    for rr in tsig_records {
        msg.add_additional(rr);
    }
    Ok(())
}

/// Keep only answer records of the queried type, dropping RRSIGs and other
/// types sharing the answer section.
pub fn filter_answers(answers: &[Record], rtype: RecordType) -> Vec<Record> {
    answers
        .iter()
        .filter(|rr| rr.record_type() == rtype)
        .cloned()
        .collect()
}

/// DNSKEY flags word reassembled from the parsed record.
pub fn dnskey_flags(key: &DNSKEY) -> u16 {
    let mut flags = 0u16;
    if key.zone_key() {
        flags |= 0x0100;
    }
    if key.revoke() {
        flags |= 0x0080;
    }
    if key.secure_entry_point() {
        flags |= 0x0001;
    }
    flags
}

/// KSK test over the raw flags word: zone key and SEP both set.
pub fn is_ksk_flags(flags: u16) -> bool {
    flags & 0x101 == 257
}

/// True if the key is a key-signing key.
pub fn is_ksk(key: &DNSKEY) -> bool {
    is_ksk_flags(dnskey_flags(key))
}

/// The persisted identity tuple of a DNSKEY.
pub fn key_identity(key: &DNSKEY) -> KeyIdentity {
    KeyIdentity::new(
        DNSKEY_PROTOCOL,
        key.algorithm().into(),
        &BASE64.encode(key.public_key().public_bytes()),
    )
}

/// Extract the DNSKEY rdata out of a fetched record, if it is one.
pub fn as_dnskey(rr: &Record) -> Option<&DNSKEY> {
    match rr.data() {
        RData::DNSSEC(DNSSECRData::DNSKEY(key)) => Some(key),
        _ => None,
    }
}

/// Extract the NS target out of a fetched record, if it is one.
pub fn as_ns(rr: &Record) -> Option<&Name> {
    match rr.data() {
        RData::NS(NS(target)) => Some(target),
        _ => None,
    }
}

/// Extract the SOA serial out of a fetched record, if it is one.
pub fn as_soa_serial(rr: &Record) -> Option<u32> {
    match rr.data() {
        RData::SOA(soa) => Some(soa.serial()),
        _ => None,
    }
}

/// Build an NS record for publication or removal.
pub fn ns_record(owner: &Name, target: Name, ttl: u32) -> Record {
    Record::from_rdata(owner.clone(), ttl, RData::NS(NS(target)))
}

/// Synthesize CDS and CDNSKEY records from the KSKs among `keys`.
///
/// Every DNSKEY with `flags & 0x101 == 257` contributes one CDS (SHA-256
/// digest) and one CDNSKEY echoing the DNSKEY payload.
pub fn synthesize_cds(
    owner: &Name,
    ttl: u32,
    keys: &[DNSKEY],
) -> Result<(Vec<Record>, Vec<Record>)> {
    let mut cdses = Vec::new();
    let mut cdnskeys = Vec::new();

    for key in keys.iter().filter(|k| is_ksk(k)) {
        let key_tag = key.calculate_key_tag()?;
        let digest = key.to_digest(owner, DigestType::SHA256)?;
        let cds = CDS::new(
            key_tag,
            Some(key.algorithm()),
            DigestType::SHA256,
            digest.as_ref().to_vec(),
        );
        cdses.push(Record::from_rdata(
            owner.clone(),
            ttl,
            RData::DNSSEC(DNSSECRData::CDS(cds)),
        ));

        let cdnskey = CDNSKEY::new(
            key.zone_key(),
            key.secure_entry_point(),
            key.revoke(),
            Some(key.algorithm()),
            key.public_key().public_bytes().to_vec(),
        );
        cdnskeys.push(Record::from_rdata(
            owner.clone(),
            ttl,
            RData::DNSSEC(DNSSECRData::CDNSKEY(cdnskey)),
        ));
    }

    Ok((cdses, cdnskeys))
}

/// Build a CSYNC record with the given SOA serial, flags 3 (immediate +
/// soaminimum), and the type bitmap {A, NS, AAAA}.
pub fn csync_record(owner: &Name, serial: u32, ttl: u32) -> Record {
    let csync = CSYNC::new(
        serial,
        true,
        true,
        vec![RecordType::A, RecordType::NS, RecordType::AAAA],
    );
    Record::from_rdata(owner.clone(), ttl, RData::CSYNC(csync))
}

/// Render a record's RDATA in presentation format, as provider APIs expect.
pub fn rdata_text(rr: &Record) -> String {
    rr.data().to_string()
}

/// Parse presentation-format RDATA of the types this system coordinates.
///
/// Covers the inverse of [`rdata_text`] for DNSKEY, CDS, CDNSKEY, NS, DS,
/// SOA, and CSYNC; anything else is rejected.
pub fn parse_rdata(rtype: RecordType, text: &str) -> Result<RData> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let malformed = || {
        EnsembleError::Transport(format!("malformed {rtype} rdata in provider response: {text}"))
    };

    match rtype {
        RecordType::NS => {
            let target = fields.first().ok_or_else(malformed)?;
            Ok(RData::NS(NS(Name::from_ascii(target)?)))
        }
        RecordType::SOA => {
            if fields.len() != 7 {
                return Err(malformed());
            }
            let num = |i: usize| fields[i].parse::<u32>().map_err(|_| malformed());
            Ok(RData::SOA(hickory_proto::rr::rdata::SOA::new(
                Name::from_ascii(fields[0])?,
                Name::from_ascii(fields[1])?,
                num(2)?,
                num(3)? as i32,
                num(4)? as i32,
                num(5)? as i32,
                num(6)?,
            )))
        }
        RecordType::DNSKEY | RecordType::CDNSKEY => {
            if fields.len() < 4 {
                return Err(malformed());
            }
            let flags: u16 = fields[0].parse().map_err(|_| malformed())?;
            let algorithm: u8 = fields[2].parse().map_err(|_| malformed())?;
            let key = BASE64
                .decode(fields[3..].concat().as_bytes())
                .map_err(|_| malformed())?;
            let algorithm = hickory_proto::dnssec::Algorithm::from_u8(algorithm);
            if rtype == RecordType::DNSKEY {
                Ok(RData::DNSSEC(DNSSECRData::DNSKEY(DNSKEY::new(
                    flags & 0x0100 != 0,
                    flags & 0x0001 != 0,
                    flags & 0x0080 != 0,
                    PublicKeyBuf::new(key, algorithm),
                ))))
            } else {
                Ok(RData::DNSSEC(DNSSECRData::CDNSKEY(CDNSKEY::new(
                    flags & 0x0100 != 0,
                    flags & 0x0001 != 0,
                    flags & 0x0080 != 0,
                    Some(algorithm),
                    key,
                ))))
            }
        }
        RecordType::DS | RecordType::CDS => {
            if fields.len() < 4 {
                return Err(malformed());
            }
            let key_tag: u16 = fields[0].parse().map_err(|_| malformed())?;
            let algorithm =
                hickory_proto::dnssec::Algorithm::from_u8(fields[1].parse().map_err(|_| malformed())?);
            let digest_type = match fields[2] {
                "2" => DigestType::SHA256,
                "4" => DigestType::SHA384,
                _ => return Err(malformed()),
            };
            let digest = from_hex(&fields[3..].concat()).ok_or_else(malformed)?;
            if rtype == RecordType::DS {
                Ok(RData::DNSSEC(DNSSECRData::DS(
                    hickory_proto::dnssec::rdata::DS::new(key_tag, algorithm, digest_type, digest),
                )))
            } else {
                Ok(RData::DNSSEC(DNSSECRData::CDS(CDS::new(
                    key_tag,
                    Some(algorithm),
                    digest_type,
                    digest,
                ))))
            }
        }
        RecordType::CSYNC => {
            if fields.len() < 2 {
                return Err(malformed());
            }
            let serial: u32 = fields[0].parse().map_err(|_| malformed())?;
            let flags: u16 = fields[1].parse().map_err(|_| malformed())?;
            let types = fields[2..]
                .iter()
                .map(|t| t.parse::<RecordType>().map_err(|_| malformed()))
                .collect::<Result<Vec<_>>>()?;
            Ok(RData::CSYNC(CSYNC::new(
                serial,
                flags & 0x01 != 0,
                flags & 0x02 != 0,
                types,
            )))
        }
        other => Err(EnsembleError::Unsupported(format!(
            "record type {other} is not coordinated by this system"
        ))),
    }
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// TCP client for direct DNS exchanges with signers.
#[derive(Debug, Clone)]
pub struct DdnsClient {
    timeout: Duration,
}

impl DdnsClient {
    /// Create a client with the given per-exchange timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Query one signer for `{owner, rtype}`, TSIG-signed when `sign` is
    /// set, returning the type-filtered answer section.
    pub async fn fetch_rrset(
        &self,
        signer: &Signer,
        owner: &str,
        rtype: RecordType,
        sign: bool,
    ) -> Result<Vec<Record>> {
        let owner = Name::from_ascii(owner)?;
        let mut msg = build_query(&owner, rtype);
        if sign {
            sign_tsig(&mut msg, signer)?;
        }

        let response = self.exchange(signer, &msg).await?;
        if response.response_code() != ResponseCode::NoError {
            return Err(EnsembleError::Rcode {
                op: format!("fetch of {rtype} RRset from {}", signer.name),
                rcode: format!("{:?}", response.response_code()),
            });
        }

        debug!(
            signer = %signer.name,
            %rtype,
            answers = response.answers().len(),
            "fetched RRset"
        );
        Ok(filter_answers(response.answers(), rtype))
    }

    /// Send a TSIG-signed UPDATE to one signer.
    pub async fn send_update(
        &self,
        signer: &Signer,
        zone: &str,
        inserts: &[Record],
        removes: &[Record],
        remove_rrsets: &[(Name, RecordType)],
    ) -> Result<()> {
        if inserts.is_empty() && removes.is_empty() && remove_rrsets.is_empty() {
            return Err(EnsembleError::Unsupported(
                "inserts and removes empty, nothing to do".to_string(),
            ));
        }

        let zone = Name::from_ascii(zone)?;
        let mut msg = build_update(&zone, inserts, removes, remove_rrsets);
        sign_tsig(&mut msg, signer)?;

        let response = self.exchange(signer, &msg).await?;
        if response.response_code() != ResponseCode::NoError {
            return Err(EnsembleError::Rcode {
                op: format!("update of {}", signer.name),
                rcode: format!("{:?}", response.response_code()),
            });
        }
        Ok(())
    }

    /// One length-prefixed exchange over TCP.
    async fn exchange(&self, signer: &Signer, msg: &Message) -> Result<Message> {
        let bytes = msg.to_vec()?;
        if bytes.len() > u16::MAX as usize {
            return Err(EnsembleError::Transport(format!(
                "message to {} exceeds TCP frame size",
                signer.name
            )));
        }
        let addr = format!("{}:{}", signer.address, signer.port);

        let io = async {
            let mut stream = TcpStream::connect(&addr).await?;
            stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
            stream.write_all(&bytes).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await?;
            Ok::<Message, EnsembleError>(Message::from_vec(&buf)?)
        };

        match tokio::time::timeout(self.timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(EnsembleError::Transport(format!(
                "timeout talking to {} ({addr})",
                signer.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignerMethod;
    use hickory_proto::dnssec::rdata::tsig::TSIG;

    fn test_signer() -> Signer {
        Signer {
            name: "s1.example.".to_string(),
            method: SignerMethod::Ddns,
            address: "127.0.0.1".to_string(),
            port: 53,
            auth: format!("testkey:{}", BASE64.encode(b"shared-secret")),
        }
    }

    fn tsig_rdata(msg: &Message) -> Option<&TSIG> {
        msg.additionals().iter().find_map(|rr| match rr.data() {
            RData::DNSSEC(DNSSECRData::TSIG(tsig)) => Some(tsig),
            _ => None,
        })
    }

    #[test]
    fn test_build_query_shape() {
        let owner = Name::from_ascii("example.com.").unwrap();
        let msg = build_query(&owner, RecordType::DNSKEY);
        assert_eq!(msg.op_code(), OpCode::Query);
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::DNSKEY);
    }

    #[test]
    fn test_build_update_sections() {
        let zone = Name::from_ascii("example.com.").unwrap();
        let insert = ns_record(&zone, Name::from_ascii("ns1.s1.example.").unwrap(), 300);
        let remove = ns_record(&zone, Name::from_ascii("ns1.s2.example.").unwrap(), 300);

        let msg = build_update(
            &zone,
            &[insert],
            &[remove],
            &[(zone.clone(), RecordType::CSYNC)],
        );

        assert_eq!(msg.op_code(), OpCode::Update);
        // zone section carries an SOA query for the zone
        assert_eq!(msg.queries()[0].query_type(), RecordType::SOA);

        let updates = msg.name_servers();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].dns_class(), DNSClass::IN);
        assert_eq!(updates[1].dns_class(), DNSClass::NONE);
        assert_eq!(updates[1].ttl(), 0);
        assert_eq!(updates[2].dns_class(), DNSClass::ANY);
        assert_eq!(updates[2].record_type(), RecordType::CSYNC);
    }

    #[test]
    fn test_tsig_signing_appends_one_tsig() {
        let zone = Name::from_ascii("example.com.").unwrap();
        let insert = ns_record(&zone, Name::from_ascii("ns1.s1.example.").unwrap(), 300);
        let mut msg = build_update(&zone, &[insert], &[], &[]);

        sign_tsig(&mut msg, &test_signer()).unwrap();

        let tsigs: Vec<_> = msg
            .additionals()
            .iter()
            .filter(|rr| rr.record_type() == RecordType::TSIG)
            .collect();
        assert_eq!(tsigs.len(), 1);

        let tsig = tsig_rdata(&msg).expect("TSIG rdata present");
        assert_eq!(tsig.fudge(), TSIG_FUDGE);
        assert_eq!(*tsig.algorithm(), TsigAlgorithm::HmacSha256);
    }

    #[test]
    fn test_sign_tsig_rejects_non_base64_secret() {
        let zone = Name::from_ascii("example.com.").unwrap();
        let mut msg = build_query(&zone, RecordType::SOA);
        let mut signer = test_signer();
        signer.auth = "testkey:!!!not-base64!!!".to_string();
        assert!(matches!(
            sign_tsig(&mut msg, &signer),
            Err(EnsembleError::Tsig(_))
        ));
    }

    #[test]
    fn test_filter_answers_drops_other_types() {
        let zone = Name::from_ascii("example.com.").unwrap();
        let ns = ns_record(&zone, Name::from_ascii("ns1.example.").unwrap(), 300);
        let csync = csync_record(&zone, 7, 300);

        let filtered = filter_answers(&[ns.clone(), csync], RecordType::NS);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].record_type(), RecordType::NS);
    }

    #[test]
    fn test_ksk_flag_mask() {
        assert!(is_ksk_flags(257)); // ZONE | SEP
        assert!(!is_ksk_flags(256)); // ZONE only (ZSK)
        assert!(!is_ksk_flags(1)); // SEP without ZONE
        assert!(is_ksk_flags(257 | 0x80)); // revoked bit is not part of the mask
    }

    #[test]
    fn test_parse_rdata_ns() {
        let rdata = parse_rdata(RecordType::NS, "ns1.example.com.").unwrap();
        match rdata {
            RData::NS(NS(name)) => assert_eq!(name.to_ascii(), "ns1.example.com."),
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rdata_dnskey_flags() {
        let rdata = parse_rdata(RecordType::DNSKEY, "257 3 13 AwEAAa==").unwrap();
        match rdata {
            RData::DNSSEC(DNSSECRData::DNSKEY(key)) => {
                assert!(key.zone_key());
                assert!(key.secure_entry_point());
                assert!(!key.revoke());
            }
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rdata_csync() {
        let rdata = parse_rdata(RecordType::CSYNC, "42 3 A NS AAAA").unwrap();
        match rdata {
            RData::CSYNC(csync) => {
                let soa_serial: u32 = csync
                    .to_string()
                    .split_whitespace()
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert_eq!(soa_serial, 42);
                assert!(csync.flags() & 0b01 != 0);
                assert!(csync.flags() & 0b10 != 0);
            }
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rdata_rejects_uncoordinated_type() {
        assert!(parse_rdata(RecordType::TXT, "\"hello\"").is_err());
        assert!(parse_rdata(RecordType::NS, "").is_err());
    }

    #[test]
    fn test_csync_record_shape() {
        let zone = Name::from_ascii("example.com.").unwrap();
        let rr = csync_record(&zone, 2023120101, 300);
        assert_eq!(rr.record_type(), RecordType::CSYNC);
        match rr.data() {
            RData::CSYNC(csync) => {
                let soa_serial: u32 = csync
                    .to_string()
                    .split_whitespace()
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert_eq!(soa_serial, 2023120101);
                assert!(csync.flags() & 0b01 != 0);
                assert!(csync.flags() & 0b10 != 0);
            }
            other => panic!("unexpected rdata: {other:?}"),
        }
    }
}
