//! DNS transport: UDP datagrams and length-prefixed TCP
//!
//! Each datagram is parsed once and handed to the handler; unparseable
//! input is dropped silently (trace level). TCP frames messages with a
//! 2-byte big-endian length, allows 10 s of idleness, and closes after one
//! reply. EDNS is not supported: OPT records in requests are ignored and
//! never echoed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use pendingdns_common::observability::metrics;
use pendingdns_common::types::{Proto, QuerySource};

use super::handler::DnsHandler;

/// Largest UDP payload we ever send; EDNS is unsupported so the classic
/// limit applies.
const MAX_UDP_RESPONSE: usize = 512;

/// Receive buffer for datagrams.
const UDP_RECV_BUF: usize = 4096;

/// Idle budget for a TCP client to deliver its query.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the UDP responder on one bound socket.
pub async fn run_udp(handler: Arc<DnsHandler>, addr: SocketAddr) -> io::Result<()> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    info!(addr = %addr, "DNS UDP listener started");

    let mut buf = [0u8; UDP_RECV_BUF];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                continue;
            }
        };
        let data = buf[..len].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            let request = match Message::from_vec(&data) {
                Ok(request) => request,
                Err(e) => {
                    trace!(peer = %peer, error = %e, "dropping unparseable datagram");
                    return;
                }
            };
            let src = QuerySource {
                proto: Proto::Udp,
                address: peer.ip(),
                port: peer.port(),
            };
            let response = handler.handle(&request, src).await;
            record_query(&request, &response, Proto::Udp);

            let bytes = match response.to_vec() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "response serialization failed");
                    return;
                }
            };

            // Too big for the wire: send an empty authoritative reply and
            // let the client retry over TCP.
            let bytes = if bytes.len() > MAX_UDP_RESPONSE {
                debug!(peer = %peer, size = bytes.len(), "response over UDP budget; sending empty reply");
                match empty_reply(&request).to_vec() {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            } else {
                bytes
            };

            if let Err(e) = socket.send_to(&bytes, peer).await {
                debug!(peer = %peer, error = %e, "UDP send failed");
            }
        });
    }
}

/// Run the TCP responder: 2-byte big-endian framing, one exchange per
/// connection.
pub async fn run_tcp(handler: Arc<DnsHandler>, addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "DNS TCP listener started");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tcp_client(handler, stream, peer).await {
                debug!(peer = %peer, error = %e, "TCP exchange ended with error");
            }
        });
    }
}

async fn serve_tcp_client(
    handler: Arc<DnsHandler>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let data = match timeout(TCP_IDLE_TIMEOUT, read_frame(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => {
            trace!(peer = %peer, "TCP client idle; closing");
            return Ok(());
        }
    };

    let request = match Message::from_vec(&data) {
        Ok(request) => request,
        Err(e) => {
            trace!(peer = %peer, error = %e, "dropping unparseable TCP message");
            return Ok(());
        }
    };
    let src = QuerySource {
        proto: Proto::Tcp,
        address: peer.ip(),
        port: peer.port(),
    };
    let response = handler.handle(&request, src).await;
    record_query(&request, &response, Proto::Tcp);
    let bytes = response
        .to_vec()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

fn record_query(request: &Message, response: &Message, proto: Proto) {
    let qtype = request
        .queries()
        .first()
        .map(|query| query.query_type().to_string())
        .unwrap_or_else(|| "NONE".to_string());
    let outcome = if response.response_code() == ResponseCode::Refused {
        "refused"
    } else if response.answers().is_empty() {
        "empty"
    } else {
        "answered"
    };
    metrics()
        .dns_queries
        .with_label_values(&[&proto.to_string(), &qtype, outcome])
        .inc();
}

/// Header-only authoritative response used when the real answer exceeds the
/// UDP budget.
fn empty_reply(request: &Message) -> Message {
    use hickory_proto::op::MessageType;

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_authoritative(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};

    #[test]
    fn test_empty_reply_mirrors_request() {
        let mut request = Message::new();
        request.set_id(777);
        request.set_message_type(MessageType::Query);
        request.set_op_code(OpCode::Query);
        request.add_query(Query::query(
            Name::from_ascii("big.example.com.").unwrap(),
            RecordType::TXT,
        ));

        let reply = empty_reply(&request);
        assert_eq!(reply.id(), 777);
        assert!(reply.authoritative());
        assert_eq!(reply.queries().len(), 1);
        assert!(reply.answers().is_empty());
    }
}
