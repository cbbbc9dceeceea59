//! Domain-pinned route refresher.
//!
//! Takes a list of domains whose traffic must flow through the tunnel,
//! periodically resolves their A records, and keeps `/32` host routes to
//! every resolved address pointing at the TUN device. Domains wait in a
//! min-heap ordered by their next refresh time; already-routed addresses
//! back off geometrically (bounded by a day), fresh ones are installed
//! and re-checked within seconds.

use crate::config::RETRY_DELAY;
use crate::resolver;
use crate::route::{RouteError, RouteTable};
use crate::tun::TunDevice;
use rand::Rng;
use simple_dns::rdata::RData;
use simple_dns::{Name, Packet, Question, CLASS, QCLASS, QTYPE, TYPE};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::BufRead;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Ceiling for the backed-off refresh interval of a routed address.
const MAX_EXTENDED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound (exclusive) of the initial refresh jitter, seconds.
const MAX_JITTER_SECS: u64 = 10;

/// Errors from the domain router.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("failed to read domains: {0}")]
    Read(std::io::Error),

    #[error("dns i/o error: {0}")]
    Io(std::io::Error),

    #[error("dns message error: {0}")]
    Dns(#[from] simple_dns::SimpleDnsError),

    #[error("no dns answer within {RETRY_DELAY:?}")]
    Timeout,

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// A tracked domain and its refresh schedule.
///
/// Ordering follows `refresh_at` (`None` sorts first: due immediately),
/// so a `BinaryHeap<Reverse<DomainEntity>>` pops the next due domain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DomainEntity {
    refresh_at: Option<Instant>,
    domain: String,
    ttl: Duration,
    retries: u32,
}

impl DomainEntity {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            refresh_at: None,
            domain: domain.into(),
            ttl: Duration::ZERO,
            retries: 0,
        }
    }
}

/// Read domains from CSV-style input, one record per line, domain in the
/// first column.
pub fn read_domains(reader: impl BufRead) -> Result<Vec<DomainEntity>, DomainError> {
    let mut domains = Vec::new();

    for line in reader.lines() {
        let line = line.map_err(DomainError::Read)?;
        let Some(domain) = line.split(',').next() else {
            continue;
        };
        let domain = domain.trim();
        if domain.is_empty() {
            continue;
        }
        domains.push(DomainEntity::new(domain));
    }

    Ok(domains)
}

/// Start the refresher over the given domains.
///
/// Every A record resolved for a due domain is pinned to the TUN with a
/// host route; an event-source tick re-schedules everything immediately.
pub fn keep_routes_to_domains(
    tun: Arc<TunDevice>,
    events: mpsc::Receiver<()>,
    domains: Vec<DomainEntity>,
) -> Result<JoinHandle<()>, DomainError> {
    let router = RouteTable::new()?;
    let heap: BinaryHeap<Reverse<DomainEntity>> = domains.into_iter().map(Reverse).collect();

    Ok(tokio::spawn(refresh_loop(tun, router, heap, events)))
}

async fn refresh_loop(
    tun: Arc<TunDevice>,
    router: RouteTable,
    mut heap: BinaryHeap<Reverse<DomainEntity>>,
    mut events: mpsc::Receiver<()>,
) {
    info!(domains = heap.len(), "domain route refresher started");

    loop {
        let Some(Reverse(mut entity)) = heap.pop() else {
            warn!("no domains to refresh, stopping");
            return;
        };

        // Wait out the schedule, but a network change re-resolves
        // everything right away.
        if let Some(refresh_at) = entity.refresh_at {
            if refresh_at > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(refresh_at) => {}
                    Some(_) = events.recv() => {
                        debug!("network change, rescheduling all domains");
                        heap.push(Reverse(entity));
                        reset_all(&mut heap);
                        continue;
                    }
                }
            }
        }

        let config = resolver::read_system_config();
        let nameserver = config
            .servers
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1:53".to_string());

        let records = match resolve_a(&entity.domain, &nameserver).await {
            Ok(records) => records,
            Err(e) => {
                warn!(domain = %entity.domain, error = %e, "dns lookup failed");
                heap.push(Reverse(entity));
                continue;
            }
        };

        let now = Instant::now();
        for (ip, record_ttl) in records {
            let jitter =
                Duration::from_secs(rand::thread_rng().gen_range(0..MAX_JITTER_SECS));

            let exists = match router.route_exists(&tun, ip).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(ip = %ip, error = %e, "route check failed");
                    continue;
                }
            };

            if apply_record(&mut entity, record_ttl, exists, now, jitter) {
                info!(
                    ip = %ip,
                    domain = %entity.domain,
                    ttl = ?entity.ttl,
                    "adding route"
                );
                if let Err(e) = router.add_route(&tun, ip).await {
                    warn!(ip = %ip, error = %e, "add route failed");
                    continue;
                }
            } else {
                debug!(ip = %ip, "route already exists");
            }
        }

        heap.push(Reverse(entity));
    }
}

/// Update a domain's schedule for one resolved address. Returns whether
/// a route should be installed.
///
/// A fresh address gets a short jittered recheck. An already-routed
/// address backs off: each consecutive no-op refresh multiplies the
/// record TTL, bounded by [`MAX_EXTENDED_TTL`].
fn apply_record(
    entity: &mut DomainEntity,
    record_ttl_secs: u32,
    route_exists: bool,
    now: Instant,
    jitter: Duration,
) -> bool {
    entity.ttl = jitter;
    entity.refresh_at = Some(now + jitter);

    if route_exists {
        entity.retries += 1;
        let extended = Duration::from_secs(entity.retries as u64 * record_ttl_secs as u64)
            .min(MAX_EXTENDED_TTL);
        entity.ttl = extended;
        entity.refresh_at = Some(now + extended);
        false
    } else {
        entity.retries = 0;
        true
    }
}

/// Mark every queued domain due immediately.
fn reset_all(heap: &mut BinaryHeap<Reverse<DomainEntity>>) {
    let mut entities: Vec<DomainEntity> = std::mem::take(heap)
        .into_iter()
        .map(|Reverse(entity)| entity)
        .collect();

    for entity in &mut entities {
        entity.refresh_at = None;
        entity.ttl = Duration::ZERO;
    }

    *heap = entities.into_iter().map(Reverse).collect();
}

/// Query `nameserver` for the A records of `domain` with a short
/// deadline. Returns `(address, record ttl)` pairs.
async fn resolve_a(domain: &str, nameserver: &str) -> Result<Vec<(Ipv4Addr, u32)>, DomainError> {
    let name = domain.trim_end_matches('.');

    let mut query = Packet::new_query(rand::random());
    query.questions.push(Question::new(
        Name::new_unchecked(name).into_owned(),
        QTYPE::TYPE(TYPE::A),
        QCLASS::CLASS(CLASS::IN),
        false,
    ));
    let query_bytes = query.build_bytes_vec()?;

    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(DomainError::Io)?;
    socket
        .send_to(&query_bytes, nameserver)
        .await
        .map_err(DomainError::Io)?;

    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(RETRY_DELAY, socket.recv_from(&mut buf))
        .await
        .map_err(|_| DomainError::Timeout)?
        .map_err(DomainError::Io)?;

    let response = Packet::parse(&buf[..len])?;
    Ok(response
        .answers
        .iter()
        .filter_map(|answer| match &answer.rdata {
            RData::A(a) => Some((Ipv4Addr::from(a.address), answer.ttl)),
            _ => None,
        })
        .collect())
}
