//! Local-segment peer discovery over mDNS.
//!
//! A broadcasting initiator answers queries for the `_microcloud._tcp`
//! service with PTR/SRV/TXT/A records; the TXT record carries a chunked
//! JSON [`ServerInfo`]. Lookup multicasts a PTR query once a second from an
//! ephemeral port and takes the first matching unicast reply (legacy
//! unicast resolution), so responder and lookup agree with each other and
//! with standards-following responders on the segment.
//!
//! Discovery is best-effort and unauthenticated; everything that follows
//! it is gated by HMAC and mTLS.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{anyhow, bail, Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, PTR, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use microcloud_core::{ServerInfo, SERVICE_NAME};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::context::SessionContext;

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
const RECORD_TTL: u32 = 120;

/// Handle to a running mDNS responder.
///
/// Shutting it down (or dropping it) stops the responder task and
/// reclaims its socket.
pub struct Broadcast {
    task: JoinHandle<()>,
}

impl Broadcast {
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Broadcast {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start answering `_microcloud._tcp` queries on the given interface.
///
/// `address` is the advertised endpoint (`host` or `host:port` string),
/// `txt` the pre-chunked TXT payload.
pub async fn broadcast(
    name: &str,
    address: &str,
    iface: &str,
    port: u16,
    txt: Vec<Vec<u8>>,
) -> Result<Broadcast> {
    let iface_ip = interface_ipv4(iface)
        .ok_or_else(|| anyhow!("Interface {iface:?} has no usable IPv4 address"))?;
    let advertised_ip = host_of(address).parse().unwrap_or(iface_ip);

    let service = Name::from_utf8(SERVICE_NAME).context("Invalid service name")?;
    let instance = Name::from_utf8(format!("{name}.{SERVICE_NAME}"))
        .with_context(|| format!("Invalid instance name for {name:?}"))?;
    let host = Name::from_utf8(format!("{name}.local."))
        .with_context(|| format!("Invalid host name for {name:?}"))?;

    let records = vec![
        Record::from_rdata(service.clone(), RECORD_TTL, RData::PTR(PTR(instance.clone()))),
        Record::from_rdata(
            instance.clone(),
            RECORD_TTL,
            RData::SRV(SRV::new(0, 0, port, host.clone())),
        ),
        Record::from_rdata(
            instance.clone(),
            RECORD_TTL,
            RData::TXT(TXT::from_bytes(
                txt.iter().map(Vec::as_slice).collect(),
            )),
        ),
        Record::from_rdata(host, RECORD_TTL, RData::A(A::from(advertised_ip))),
    ];

    let socket = responder_socket(iface_ip)
        .with_context(|| format!("Failed to open mDNS responder socket on {iface:?}"))?;
    let socket = UdpSocket::from_std(socket)?;

    debug!(%iface, %iface_ip, "Started mDNS broadcast");

    let task = tokio::spawn(respond_loop(socket, service, instance, records));
    Ok(Broadcast { task })
}

async fn respond_loop(socket: UdpSocket, service: Name, instance: Name, records: Vec<Record>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("mDNS responder receive failed: {e}");
                continue;
            }
        };

        let request = match Message::from_vec(&buf[..len]) {
            Ok(message) => message,
            Err(_) => continue,
        };
        if request.message_type() != MessageType::Query {
            continue;
        }

        let matches = request.queries().iter().any(|query| {
            let name = query.name();
            let for_service = name == &service
                && matches!(query.query_type(), RecordType::PTR | RecordType::ANY);
            let for_instance = name == &instance;
            for_service || for_instance
        });
        if !matches {
            continue;
        }

        trace!(%src, "Answering mDNS query");

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_authoritative(true)
            .add_answers(records.iter().cloned());

        match response.to_vec() {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, src).await {
                    warn!("Failed to send mDNS response to {src}: {e}");
                }
            }
            Err(e) => warn!("Failed to encode mDNS response: {e}"),
        }
    }
}

/// Query the segment for a broadcasting peer until one with a matching
/// version answers or the context fires.
///
/// When several initiators answer, the first valid response wins; there is
/// no further tie-break.
pub async fn lookup_peer(ctx: &SessionContext, iface: &str, version: &str) -> Result<ServerInfo> {
    let iface_ip = interface_ipv4(iface)
        .ok_or_else(|| anyhow!("Interface {iface:?} has no usable IPv4 address"))?;

    let socket = lookup_socket(iface_ip)
        .with_context(|| format!("Failed to open mDNS lookup socket on {iface:?}"))?;
    let socket = UdpSocket::from_std(socket)?;

    let service = Name::from_utf8(SERVICE_NAME).context("Invalid service name")?;
    let mut query = Message::new();
    query
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .add_query(Query::query(service, RecordType::PTR));
    let query_bytes = query.to_vec().context("Failed to encode mDNS query")?;

    let destination = SocketAddr::from((MDNS_GROUP, MDNS_PORT));
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(&query_bytes, destination).await {
                    warn!("Failed to send mDNS query: {e}");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = received.context("mDNS lookup receive failed")?;
                if let Some(info) = parse_response(&buf[..len], version) {
                    debug!(%src, name = %info.name, "Discovered eligible peer");
                    return Ok(info);
                }
            }
            cause = ctx.done() => bail!(cause),
        }
    }
}

/// Extract a matching [`ServerInfo`] from an mDNS response, if any.
fn parse_response(data: &[u8], version: &str) -> Option<ServerInfo> {
    let message = Message::from_vec(data).ok()?;
    if message.message_type() != MessageType::Response {
        return None;
    }

    message
        .answers()
        .iter()
        .chain(message.additionals())
        .filter_map(|record| match record.data() {
            Some(RData::TXT(txt)) => {
                ServerInfo::from_txt(txt.txt_data().iter().map(|segment| segment.as_ref()))
            }
            _ => None,
        })
        .find(|info| info.version == version)
}

fn responder_socket(iface_ip: Ipv4Addr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, &iface_ip)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

fn lookup_socket(iface_ip: Ipv4Addr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_multicast_if_v4(&iface_ip)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// First IPv4 address of the named interface.
fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sockaddr) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(sockaddr.ip());
        }
    }

    None
}

/// Host portion of a `host` or `host:port` address string.
fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionContext;
    use std::time::Duration;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("10.0.0.1:9444"), "10.0.0.1");
        assert_eq!(host_of("node-a.local"), "node-a.local");
    }

    #[test]
    fn test_parse_response_filters_version() {
        let service = Name::from_utf8(SERVICE_NAME).unwrap();
        let instance = Name::from_utf8(format!("node-a.{SERVICE_NAME}")).unwrap();

        let info = ServerInfo::new("node-a", "10.0.0.1:9444");
        let mut message = Message::new();
        message
            .set_message_type(MessageType::Response)
            .set_authoritative(true)
            .add_answer(Record::from_rdata(
                service,
                RECORD_TTL,
                RData::PTR(PTR(instance.clone())),
            ))
            .add_answer({
                let txt = info.to_txt();
                Record::from_rdata(
                    instance,
                    RECORD_TTL,
                    RData::TXT(TXT::from_bytes(txt.iter().map(Vec::as_slice).collect())),
                )
            });
        let bytes = message.to_vec().unwrap();

        let parsed = parse_response(&bytes, microcloud_core::PROTOCOL_VERSION).unwrap();
        assert_eq!(parsed, info);

        assert!(parse_response(&bytes, "MicroCloud-9.9").is_none());
    }

    #[test]
    fn test_parse_response_ignores_queries() {
        let service = Name::from_utf8(SERVICE_NAME).unwrap();
        let mut query = Message::new();
        query
            .set_message_type(MessageType::Query)
            .add_query(Query::query(service, RecordType::PTR));
        let bytes = query.to_vec().unwrap();

        assert!(parse_response(&bytes, microcloud_core::PROTOCOL_VERSION).is_none());
    }

    #[tokio::test]
    async fn test_lookup_aborts_with_context_cause() {
        let ctx = SessionContext::new();
        ctx.cancel("Session timeout exceeded: peer lookup timed out");

        let err = lookup_peer(&ctx, "lo", microcloud_core::PROTOCOL_VERSION)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Session timeout exceeded"));
    }

    /// Full broadcast/lookup round-trip over loopback multicast. Ignored by
    /// default: CI sandboxes often do not route 224.0.0.251.
    #[tokio::test]
    #[ignore]
    async fn test_broadcast_lookup_round_trip() {
        let info = ServerInfo::new("node-a", "127.0.0.1:9444");
        let _broadcast = broadcast("node-a", "127.0.0.1:9444", "lo", 9444, info.to_txt())
            .await
            .unwrap();

        let ctx = SessionContext::new();
        let found = tokio::time::timeout(
            Duration::from_secs(5),
            lookup_peer(&ctx, "lo", microcloud_core::PROTOCOL_VERSION),
        )
        .await
        .expect("lookup timed out")
        .unwrap();

        assert_eq!(found.name, "node-a");
        assert_eq!(found.address, "127.0.0.1:9444");
    }
}
