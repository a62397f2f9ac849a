//! Query processing
//!
//! A pure mapping from a parsed DNS query to an answer packet. The handler
//! consults the zone store (and, for ANAME targets, the external resolver),
//! synthesizes the pseudo-record answers, and never touches the transport.
//!
//! The interesting rules live here: query-type expansion, health-aware
//! address filtering (fail-open), ANAME/URL synthesis, CNAME chasing with a
//! recursion bound, TXT chunking and the chaos-class identity answers.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CAA, CNAME, MX, NS, SOA, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::{debug, warn};
use url::Url;

use pendingdns_common::types::QuerySource;
use pendingdns_config::Config;
use pendingdns_store::record::RecordType as StoreType;
use pendingdns_store::{
    names, ExternalResolver, LookupKind, RecordSource, RecordValue, StoredRecord,
};

/// Deepest CNAME chase performed for one question.
const MAX_CHASE_DEPTH: usize = 10;

/// TXT payloads at or above this length are split into chunks.
const TXT_SPLIT_THRESHOLD: usize = 128;
/// Size of each TXT chunk once splitting kicks in.
const TXT_CHUNK_LEN: usize = 84;

/// Chaos-class names we may answer.
const CHAOS_NAMES: [&str; 4] = [
    "version.bind",
    "hostname.bind",
    "id.server",
    "authors.bind",
];

/// The answer-building half of the DNS server.
pub struct DnsHandler {
    records: Arc<dyn RecordSource>,
    external: Arc<dyn ExternalResolver>,
    config: Arc<Config>,
}

enum QuestionOutcome {
    Answers(Vec<Record>),
    Refused,
    Ignored,
}

impl DnsHandler {
    pub fn new(
        records: Arc<dyn RecordSource>,
        external: Arc<dyn ExternalResolver>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            records,
            external,
            config,
        }
    }

    /// Build the full response for a request. Always returns a packet, even
    /// when every question was unanswerable.
    pub async fn handle(&self, request: &Message, src: QuerySource) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_authoritative(true);
        for query in request.queries() {
            response.add_query(query.clone());
        }

        let outcomes = join_all(
            request
                .queries()
                .iter()
                .map(|query| self.process_question(query, src)),
        )
        .await;

        let mut refused = false;
        for outcome in outcomes {
            match outcome {
                QuestionOutcome::Answers(records) => {
                    for record in records {
                        response.add_answer(record);
                    }
                }
                QuestionOutcome::Refused => refused = true,
                QuestionOutcome::Ignored => {}
            }
        }

        if refused && response.answers().is_empty() {
            response.set_response_code(ResponseCode::Refused);
        }

        response
    }

    async fn process_question(&self, query: &Query, src: QuerySource) -> QuestionOutcome {
        let name = query.name().to_ascii();
        let name = name.trim_end_matches('.');
        let qtype = query.query_type();

        debug!(
            name = %name,
            qtype = %qtype,
            class = ?query.query_class(),
            proto = %src.proto,
            client = %src.address,
            "processing question"
        );

        match query.query_class() {
            DNSClass::CH => self.chaos_question(name, qtype),
            DNSClass::IN => {
                if !supported_qtype(qtype) {
                    return QuestionOutcome::Ignored;
                }
                let answers = self.resolve_question(name.to_string(), qtype, 0).await;
                QuestionOutcome::Answers(answers)
            }
            _ => QuestionOutcome::Ignored,
        }
    }

    /// CH-class identity queries: answered iff the operator configured a
    /// value for the name, refused otherwise.
    fn chaos_question(&self, name: &str, qtype: RecordType) -> QuestionOutcome {
        let lowered = name.to_ascii_lowercase();
        if qtype != RecordType::TXT || !CHAOS_NAMES.contains(&lowered.as_str()) {
            return QuestionOutcome::Refused;
        }
        match self.config.chaos.lookup(&lowered) {
            Some(value) => {
                let Some(owner) = to_name(&lowered) else {
                    return QuestionOutcome::Refused;
                };
                let mut record =
                    Record::from_rdata(owner, 0, RData::TXT(TXT::new(vec![value.to_string()])));
                record.set_dns_class(DNSClass::CH);
                QuestionOutcome::Answers(vec![record])
            }
            None => QuestionOutcome::Refused,
        }
    }

    /// Resolve one (name, qtype) pair into answer records, chasing CNAMEs.
    fn resolve_question(
        &self,
        name: String,
        qtype: RecordType,
        depth: usize,
    ) -> BoxFuture<'_, Vec<Record>> {
        Box::pin(async move {
            let Some(name) = names::normalize_name(&name) else {
                return Vec::new();
            };
            let ttl = self.config.dns.ttl;
            let mut answers = Vec::new();
            let mut chase_targets = Vec::new();

            for consult in consult_types(qtype) {
                let rows = match self.records.resolve(&name, consult, false).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(name = %name, rtype = %consult, error = %e, "record lookup failed");
                        continue;
                    }
                };
                if rows.is_empty() {
                    continue;
                }

                match consult {
                    StoreType::A | StoreType::Aaaa => {
                        let mut rows = rows;
                        rows.shuffle(&mut thread_rng());
                        for row in filter_unhealthy(rows) {
                            if let Some(record) = address_record(&name, &row, ttl) {
                                answers.push(record);
                            }
                        }
                    }
                    StoreType::Cname => {
                        for row in rows {
                            let RecordValue::Cname { target } = &row.value else {
                                continue;
                            };
                            let target = resolve_apex_target(target, &row);
                            if let Some(target_name) = to_name(&target) {
                                answers.push(Record::from_rdata(
                                    owner(&name),
                                    ttl,
                                    RData::CNAME(CNAME(target_name)),
                                ));
                            }
                            if qtype != RecordType::CNAME && depth < MAX_CHASE_DEPTH {
                                chase_targets.push(target);
                            }
                        }
                    }
                    StoreType::Aname => {
                        let kind = match qtype {
                            RecordType::A => LookupKind::A,
                            RecordType::AAAA => LookupKind::Aaaa,
                            _ => continue,
                        };
                        for row in rows {
                            let RecordValue::Aname { target } = &row.value else {
                                continue;
                            };
                            let target = resolve_apex_target(target, &row);
                            match self.external.resolve(&target, kind).await {
                                Ok(mut addresses) => {
                                    addresses.shuffle(&mut thread_rng());
                                    for address in addresses {
                                        if let Some(record) =
                                            synthetic_address(&name, qtype, &address, ttl)
                                        {
                                            answers.push(record);
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(name = %name, target = %target, error = %e, "ANAME resolution failed");
                                }
                            }
                        }
                    }
                    StoreType::Url => {
                        let mut addresses = match qtype {
                            RecordType::A => self.config.public.hosts.a.clone(),
                            RecordType::AAAA => self.config.public.hosts.aaaa.clone(),
                            _ => continue,
                        };
                        addresses.shuffle(&mut thread_rng());
                        for address in addresses {
                            if let Some(record) = synthetic_address(&name, qtype, &address, ttl) {
                                answers.push(record);
                            }
                        }
                    }
                    StoreType::Mx => {
                        let mut rows = rows;
                        rows.sort_by_key(|row| match &row.value {
                            RecordValue::Mx { priority, .. } => *priority,
                            _ => u16::MAX,
                        });
                        for row in rows {
                            let RecordValue::Mx { exchange, priority } = &row.value else {
                                continue;
                            };
                            if let Some(exchange) = to_name(exchange) {
                                answers.push(Record::from_rdata(
                                    owner(&name),
                                    ttl,
                                    RData::MX(MX::new(*priority, exchange)),
                                ));
                            }
                        }
                    }
                    StoreType::Txt => {
                        for row in rows {
                            let RecordValue::Txt { data } = &row.value else {
                                continue;
                            };
                            answers.push(Record::from_rdata(
                                owner(&name),
                                ttl,
                                RData::TXT(TXT::from_bytes(chunk_txt(data))),
                            ));
                        }
                    }
                    StoreType::Caa => {
                        for row in rows {
                            let RecordValue::Caa { value, tag, flags } = &row.value else {
                                continue;
                            };
                            if let Some(rdata) = caa_rdata(value, *tag, *flags) {
                                answers.push(Record::from_rdata(owner(&name), ttl, rdata));
                            }
                        }
                    }
                    StoreType::Ns => {
                        for row in rows {
                            let RecordValue::Ns { ns } = &row.value else {
                                continue;
                            };
                            if let Some(host) = to_name(ns) {
                                answers.push(Record::from_rdata(
                                    owner(&name),
                                    ttl,
                                    RData::NS(NS(host)),
                                ));
                            }
                        }
                    }
                }
            }

            if answers.is_empty() && chase_targets.is_empty() {
                return self.synthesize(&name, qtype, ttl);
            }

            for target in chase_targets {
                let mut chased = self.resolve_question(target, qtype, depth + 1).await;
                answers.append(&mut chased);
            }

            answers
        })
    }

    /// Answers produced without any stored record backing them.
    fn synthesize(&self, name: &str, qtype: RecordType, ttl: u32) -> Vec<Record> {
        match qtype {
            RecordType::NS => self
                .config
                .ns
                .iter()
                .filter_map(|ns| to_name(&ns.domain))
                .map(|host| Record::from_rdata(owner(name), ttl, RData::NS(NS(host))))
                .collect(),
            RecordType::A => {
                // A nameserver's own name answers with its configured address.
                for ns in &self.config.ns {
                    if ns.domain.eq_ignore_ascii_case(name) {
                        if let Ok(addr) = Ipv4Addr::from_str(&ns.ip) {
                            return vec![Record::from_rdata(
                                owner(name),
                                ttl,
                                RData::A(A(addr)),
                            )];
                        }
                    }
                }
                Vec::new()
            }
            RecordType::CAA => {
                let Some(issuer) = to_name("letsencrypt.org") else {
                    return Vec::new();
                };
                vec![
                    Record::from_rdata(
                        owner(name),
                        ttl,
                        RData::CAA(CAA::new_issue(false, Some(issuer.clone()), Vec::new())),
                    ),
                    Record::from_rdata(
                        owner(name),
                        ttl,
                        RData::CAA(CAA::new_issuewild(false, Some(issuer), Vec::new())),
                    ),
                ]
            }
            RecordType::SOA => {
                let Some(primary) = self.config.ns.first() else {
                    return Vec::new();
                };
                let Some(mname) = to_name(&primary.domain) else {
                    return Vec::new();
                };
                let admin = self.config.soa.admin.replace('@', ".");
                let Some(rname) = to_name(&admin) else {
                    return Vec::new();
                };
                let soa = SOA::new(
                    mname,
                    rname,
                    self.config.soa.serial,
                    self.config.soa.refresh as i32,
                    self.config.soa.retry as i32,
                    self.config.soa.expiration as i32,
                    self.config.soa.minimum,
                );
                vec![Record::from_rdata(owner(name), ttl, RData::SOA(soa))]
            }
            _ => Vec::new(),
        }
    }
}

/// QTYPES the responder serves; everything else is ignored.
fn supported_qtype(qtype: RecordType) -> bool {
    matches!(
        qtype,
        RecordType::A
            | RecordType::AAAA
            | RecordType::CNAME
            | RecordType::MX
            | RecordType::TXT
            | RecordType::NS
            | RecordType::SOA
            | RecordType::CAA
            | RecordType::ANY
    )
}

/// Store record types consulted for a query type.
fn consult_types(qtype: RecordType) -> Vec<StoreType> {
    match qtype {
        RecordType::ANY => vec![StoreType::A, StoreType::Aaaa, StoreType::Cname],
        RecordType::A => vec![
            StoreType::A,
            StoreType::Cname,
            StoreType::Aname,
            StoreType::Url,
        ],
        RecordType::AAAA => vec![
            StoreType::Aaaa,
            StoreType::Cname,
            StoreType::Aname,
            StoreType::Url,
        ],
        RecordType::TXT => vec![StoreType::Txt, StoreType::Cname],
        RecordType::CNAME => vec![StoreType::Cname],
        RecordType::MX => vec![StoreType::Mx],
        RecordType::NS => vec![StoreType::Ns],
        RecordType::CAA => vec![StoreType::Caa],
        _ => Vec::new(),
    }
}

/// Drop unhealthy addresses unless that would empty the answer: an
/// authoritative server never NXDOMAINs a live record.
fn filter_unhealthy(rows: Vec<StoredRecord>) -> Vec<StoredRecord> {
    let healthy: Vec<StoredRecord> = rows
        .iter()
        .filter(|row| row.health.as_ref().map(|h| h.status).unwrap_or(true))
        .cloned()
        .collect();
    if healthy.is_empty() {
        rows
    } else {
        healthy
    }
}

/// `@` in a CNAME/ANAME target means the record's own zone apex.
fn resolve_apex_target(target: &str, row: &StoredRecord) -> String {
    if target == "@" {
        row.zone.clone().unwrap_or_else(|| row.name.clone())
    } else {
        target.to_string()
    }
}

fn owner(name: &str) -> Name {
    to_name(name).unwrap_or_else(Name::root)
}

/// Build a wire name. Domain-valued fields may carry internationalized
/// labels (CNAME/ANAME targets, MX exchanges, NS hosts, CAA issuers), so
/// every name is punycode-normalized before it is serialized.
fn to_name(name: &str) -> Option<Name> {
    let ascii = names::normalize_name(name)?;
    Name::from_ascii(format!("{}.", ascii)).ok()
}

fn address_record(name: &str, row: &StoredRecord, ttl: u32) -> Option<Record> {
    match &row.value {
        RecordValue::A { address, .. } => {
            let addr = Ipv4Addr::from_str(address).ok()?;
            Some(Record::from_rdata(owner(name), ttl, RData::A(A(addr))))
        }
        RecordValue::Aaaa { address, .. } => {
            let addr = Ipv6Addr::from_str(address).ok()?;
            Some(Record::from_rdata(owner(name), ttl, RData::AAAA(AAAA(addr))))
        }
        _ => None,
    }
}

/// Build an address answer of the requested type from a textual address.
fn synthetic_address(name: &str, qtype: RecordType, address: &str, ttl: u32) -> Option<Record> {
    match qtype {
        RecordType::A => {
            let addr = Ipv4Addr::from_str(address).ok()?;
            Some(Record::from_rdata(owner(name), ttl, RData::A(A(addr))))
        }
        RecordType::AAAA => {
            let addr = Ipv6Addr::from_str(address).ok()?;
            Some(Record::from_rdata(owner(name), ttl, RData::AAAA(AAAA(addr))))
        }
        _ => None,
    }
}

/// Split long TXT payloads into wire chunks. Values under the threshold
/// stay a single character-string. Octet strings are chunked on byte
/// boundaries and reassemble losslessly on the receiving side.
fn chunk_txt(data: &[u8]) -> Vec<&[u8]> {
    if data.len() < TXT_SPLIT_THRESHOLD {
        return vec![data];
    }
    data.chunks(TXT_CHUNK_LEN).collect()
}

/// An issue/issuewild row whose issuer cannot be encoded is dropped; an
/// empty issuer on the wire would read as a deny-all policy, which is not
/// what a malformed record means.
fn caa_rdata(value: &str, tag: pendingdns_store::CaaTag, flags: u8) -> Option<RData> {
    use pendingdns_store::CaaTag;
    let critical = flags & 0x80 != 0;
    let rdata = match tag {
        CaaTag::Issue => CAA::new_issue(critical, Some(to_name(value)?), Vec::new()),
        CaaTag::IssueWild => CAA::new_issuewild(critical, Some(to_name(value)?), Vec::new()),
        CaaTag::Iodef => {
            let url = Url::parse(value).ok()?;
            CAA::new_iodef(critical, url)
        }
    };
    Some(RData::CAA(rdata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hickory_proto::op::OpCode;
    use parking_lot::Mutex;
    use pendingdns_common::types::{HealthState, Proto};
    use pendingdns_config::NsConfig;
    use pendingdns_store::StoreResult;
    use std::collections::HashMap;
    use std::net::IpAddr;

    struct MockRecords {
        rows: HashMap<(String, StoreType), Vec<StoredRecord>>,
    }

    impl MockRecords {
        fn new() -> Self {
            Self {
                rows: HashMap::new(),
            }
        }

        fn with(self, name: &str, value: RecordValue) -> Self {
            self.with_health(name, value, None)
        }

        fn with_health(
            mut self,
            name: &str,
            value: RecordValue,
            health: Option<HealthState>,
        ) -> Self {
            let rtype = value.rtype();
            let zone = name
                .split('.')
                .rev()
                .take(2)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(".");
            self.rows
                .entry((name.to_string(), rtype))
                .or_default()
                .push(StoredRecord {
                    name: name.to_string(),
                    rtype,
                    value,
                    hid: "test01".to_string(),
                    id: None,
                    zone: Some(zone),
                    subdomain: None,
                    wildcard: None,
                    health,
                });
            self
        }
    }

    #[async_trait]
    impl RecordSource for MockRecords {
        async fn resolve(
            &self,
            domain: &str,
            rtype: StoreType,
            _short: bool,
        ) -> StoreResult<Vec<StoredRecord>> {
            Ok(self
                .rows
                .get(&(domain.to_string(), rtype))
                .cloned()
                .unwrap_or_default())
        }

        async fn resolve_zone(&self, _name: &str) -> StoreResult<Option<String>> {
            Ok(None)
        }
    }

    struct MockExternal {
        answers: Mutex<HashMap<String, Vec<String>>>,
    }

    impl MockExternal {
        fn new() -> Self {
            Self {
                answers: Mutex::new(HashMap::new()),
            }
        }

        fn with(self, target: &str, addresses: &[&str]) -> Self {
            self.answers.lock().insert(
                target.to_string(),
                addresses.iter().map(|a| a.to_string()).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl ExternalResolver for MockExternal {
        async fn resolve(&self, target: &str, _kind: LookupKind) -> StoreResult<Vec<String>> {
            self.answers
                .lock()
                .get(target)
                .cloned()
                .ok_or_else(|| pendingdns_store::StoreError::upstream(target, "no such host"))
        }
    }

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.acme.email = "ops@example.com".to_string();
        config.ns = vec![
            NsConfig {
                domain: "ns1.example.net".to_string(),
                ip: "198.51.100.1".to_string(),
            },
            NsConfig {
                domain: "ns2.example.net".to_string(),
                ip: "198.51.100.2".to_string(),
            },
        ];
        config.public.hosts.a = vec!["203.0.113.80".to_string()];
        config.public.hosts.aaaa = vec!["2001:db8::80".to_string()];
        Arc::new(config)
    }

    fn handler(records: MockRecords, external: MockExternal) -> DnsHandler {
        DnsHandler::new(Arc::new(records), Arc::new(external), test_config())
    }

    fn src() -> QuerySource {
        QuerySource {
            proto: Proto::Udp,
            address: IpAddr::from([127, 0, 0, 1]),
            port: 53000,
        }
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(4321);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.add_query(Query::query(
            Name::from_ascii(format!("{}.", name)).unwrap(),
            qtype,
        ));
        message
    }

    fn chaos_query(name: &str) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Query);
        let mut q = Query::query(Name::from_ascii(format!("{}.", name)).unwrap(), RecordType::TXT);
        q.set_query_class(DNSClass::CH);
        message.add_query(q);
        message
    }

    #[tokio::test]
    async fn test_simple_a_answer() {
        let records = MockRecords::new().with(
            "example.com",
            RecordValue::A {
                address: "192.0.2.10".into(),
                health_check: None,
            },
        );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::A), src()).await;

        assert!(response.authoritative());
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(192, 0, 2, 10)),
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cname_chase_to_apex() {
        let records = MockRecords::new()
            .with(
                "www.example.com",
                RecordValue::Cname { target: "@".into() },
            )
            .with(
                "example.com",
                RecordValue::A {
                    address: "192.0.2.20".into(),
                    health_check: None,
                },
            );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("www.example.com", RecordType::A), src()).await;

        let answers = response.answers();
        assert_eq!(answers.len(), 2);
        assert!(matches!(answers[0].data(), RData::CNAME(c) if c.0.to_ascii() == "example.com."));
        assert!(matches!(answers[1].data(), RData::A(a) if a.0 == Ipv4Addr::new(192, 0, 2, 20)));
    }

    #[tokio::test]
    async fn test_cname_loop_terminates() {
        let records = MockRecords::new()
            .with(
                "a.example.com",
                RecordValue::Cname {
                    target: "b.example.com".into(),
                },
            )
            .with(
                "b.example.com",
                RecordValue::Cname {
                    target: "a.example.com".into(),
                },
            );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("a.example.com", RecordType::A), src()).await;

        // One CNAME per chase level, bounded by the depth limit.
        assert!(response.answers().len() <= MAX_CHASE_DEPTH + 1);
        assert!(!response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_mx_ascending_priority() {
        let records = MockRecords::new()
            .with(
                "example.com",
                RecordValue::Mx {
                    exchange: "mx1.example.com".into(),
                    priority: 10,
                },
            )
            .with(
                "example.com",
                RecordValue::Mx {
                    exchange: "mx2.example.com".into(),
                    priority: 1,
                },
            );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::MX), src()).await;

        let priorities: Vec<u16> = response
            .answers()
            .iter()
            .map(|record| match record.data() {
                RData::MX(mx) => mx.preference(),
                _ => panic!("not MX"),
            })
            .collect();
        assert_eq!(priorities, vec![1, 10]);
    }

    #[tokio::test]
    async fn test_health_filter_drops_unhealthy() {
        let records = MockRecords::new()
            .with_health(
                "example.com",
                RecordValue::A {
                    address: "192.0.2.1".into(),
                    health_check: Some("tcp://192.0.2.1:80".into()),
                },
                Some(HealthState::down("refused")),
            )
            .with_health(
                "example.com",
                RecordValue::A {
                    address: "192.0.2.2".into(),
                    health_check: Some("tcp://192.0.2.2:80".into()),
                },
                Some(HealthState::up()),
            );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::A), src()).await;

        assert_eq!(response.answers().len(), 1);
        assert!(matches!(response.answers()[0].data(), RData::A(a) if a.0 == Ipv4Addr::new(192, 0, 2, 2)));
    }

    #[tokio::test]
    async fn test_health_fail_open_when_all_down() {
        let records = MockRecords::new().with_health(
            "example.com",
            RecordValue::A {
                address: "192.0.2.1".into(),
                health_check: Some("tcp://192.0.2.1:80".into()),
            },
            Some(HealthState::down("refused")),
        );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::A), src()).await;

        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_aname_synthesis() {
        let records = MockRecords::new().with(
            "example.com",
            RecordValue::Aname {
                target: "origin.example.net".into(),
            },
        );
        let external = MockExternal::new().with("origin.example.net", &["203.0.113.5"]);
        let h = handler(records, external);
        let response = h.handle(&query("example.com", RecordType::A), src()).await;

        assert_eq!(response.answers().len(), 1);
        assert!(matches!(response.answers()[0].data(), RData::A(a) if a.0 == Ipv4Addr::new(203, 0, 113, 5)));
    }

    #[tokio::test]
    async fn test_url_record_answers_public_hosts() {
        let records = MockRecords::new().with(
            "example.com",
            RecordValue::Url {
                url: "https://target.example.net/".into(),
                status_code: 301,
                proxy: false,
            },
        );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::A), src()).await;

        assert_eq!(response.answers().len(), 1);
        assert!(matches!(response.answers()[0].data(), RData::A(a) if a.0 == Ipv4Addr::new(203, 0, 113, 80)));

        // URL answers are suppressed on other query types.
        let response = h.handle(&query("example.com", RecordType::MX), src()).await;
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_ns_synthesis() {
        let h = handler(MockRecords::new(), MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::NS), src()).await;

        let hosts: Vec<String> = response
            .answers()
            .iter()
            .map(|record| match record.data() {
                RData::NS(ns) => ns.0.to_ascii(),
                _ => panic!("not NS"),
            })
            .collect();
        assert_eq!(hosts, vec!["ns1.example.net.", "ns2.example.net."]);
    }

    #[tokio::test]
    async fn test_nameserver_own_a_answer() {
        let h = handler(MockRecords::new(), MockExternal::new());
        let response = h.handle(&query("ns1.example.net", RecordType::A), src()).await;

        assert_eq!(response.answers().len(), 1);
        assert!(matches!(response.answers()[0].data(), RData::A(a) if a.0 == Ipv4Addr::new(198, 51, 100, 1)));
    }

    #[tokio::test]
    async fn test_caa_synthesis() {
        let h = handler(MockRecords::new(), MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::CAA), src()).await;
        assert_eq!(response.answers().len(), 2);
    }

    #[tokio::test]
    async fn test_soa_synthesis_uses_first_ns() {
        let h = handler(MockRecords::new(), MockExternal::new());
        let response = h.handle(&query("anything.example.com", RecordType::SOA), src()).await;

        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::SOA(soa) => {
                assert_eq!(soa.mname().to_ascii(), "ns1.example.net.");
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chaos_refused_when_unconfigured() {
        let h = handler(MockRecords::new(), MockExternal::new());
        let response = h.handle(&chaos_query("version.bind"), src()).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn test_chaos_answered_when_configured() {
        let records = MockRecords::new();
        let mut config = (*test_config()).clone();
        config.chaos.version_bind = Some("PendingDNS test".to_string());
        let h = DnsHandler::new(
            Arc::new(records),
            Arc::new(MockExternal::new()),
            Arc::new(config),
        );
        let response = h.handle(&chaos_query("version.bind"), src()).await;

        assert_eq!(response.answers().len(), 1);
        let record = &response.answers()[0];
        assert_eq!(record.dns_class(), DNSClass::CH);
        assert!(matches!(record.data(), RData::TXT(_)));
    }

    #[tokio::test]
    async fn test_unknown_qtype_ignored() {
        let records = MockRecords::new().with(
            "example.com",
            RecordValue::A {
                address: "192.0.2.1".into(),
                health_check: None,
            },
        );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::SRV), src()).await;
        assert!(response.answers().is_empty());
        assert_eq!(response.response_code(), ResponseCode::NoError);
    }

    #[tokio::test]
    async fn test_txt_answer_through_handler() {
        let long = "a".repeat(200).into_bytes();
        let records = MockRecords::new().with("example.com", RecordValue::Txt { data: long });
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::TXT), src()).await;

        match response.answers()[0].data() {
            RData::TXT(txt) => {
                let parts: Vec<&[u8]> = txt.txt_data().iter().map(|part| part.as_ref()).collect();
                assert_eq!(parts.len(), 3);
                assert!(parts.iter().all(|part| part.len() <= TXT_CHUNK_LEN));
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idn_cname_target_is_punycoded_on_the_wire() {
        let records = MockRecords::new().with(
            "www.example.com",
            RecordValue::Cname {
                target: "bücher.example".into(),
            },
        );
        let h = handler(records, MockExternal::new());
        let response = h
            .handle(&query("www.example.com", RecordType::CNAME), src())
            .await;

        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::CNAME(cname) => assert_eq!(cname.0.to_ascii(), "xn--bcher-kva.example."),
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_caa_unencodable_issuer_dropped_not_denied() {
        use pendingdns_store::CaaTag;

        let records = MockRecords::new()
            .with(
                "example.com",
                RecordValue::Caa {
                    value: "letsencrypt.org".into(),
                    tag: CaaTag::Issue,
                    flags: 0,
                },
            )
            .with(
                "example.com",
                RecordValue::Caa {
                    value: "bad..issuer".into(),
                    tag: CaaTag::Issue,
                    flags: 0,
                },
            );
        let h = handler(records, MockExternal::new());
        let response = h.handle(&query("example.com", RecordType::CAA), src()).await;

        // The malformed row vanishes instead of surfacing as an
        // empty-issuer (deny-all) answer.
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            RData::CAA(caa) => match caa.value() {
                hickory_proto::rr::rdata::caa::Value::Issuer(Some(issuer), _) => {
                    assert_eq!(issuer.to_ascii(), "letsencrypt.org.");
                }
                other => panic!("unexpected CAA value {:?}", other),
            },
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_chunk_txt_boundaries() {
        let short = vec![b'x'; 127];
        assert_eq!(chunk_txt(&short), vec![&short[..]]);
        let long = vec![b'x'; 128];
        let chunks = chunk_txt(&long);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 84);
        assert_eq!(chunks[1].len(), 44);
    }

    #[test]
    fn test_chunk_txt_is_lossless_for_multibyte_payloads() {
        // 100 two-byte characters: a chunk boundary lands mid-character.
        let data = "é".repeat(100).into_bytes();
        assert_eq!(data.len(), 200);

        let chunks = chunk_txt(&data);
        assert!(chunks.iter().all(|chunk| chunk.len() <= TXT_CHUNK_LEN));

        let reassembled: Vec<u8> = chunks.concat();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_consult_types_expansion() {
        assert_eq!(
            consult_types(RecordType::ANY),
            vec![StoreType::A, StoreType::Aaaa, StoreType::Cname]
        );
        assert!(consult_types(RecordType::A).contains(&StoreType::Url));
        assert!(consult_types(RecordType::TXT).contains(&StoreType::Cname));
        assert!(!consult_types(RecordType::TXT).contains(&StoreType::Url));
        assert!(consult_types(RecordType::SOA).is_empty());
    }
}
