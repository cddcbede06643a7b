//! Network transports. One `Backend::query` call is one send/receive attempt against one
//! server IP; retrying and TCP escalation live in [`crate::response`], which is the only
//! caller that knows about the bigger picture (a traversal, not a single query).

use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, Query as WireQuery};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::instrument;

use crate::error::QueryError;
use crate::query::Query;

/// Max size for the UDP receive buffer as recommended by
/// [RFC6891](https://datatracker.ietf.org/doc/html/rfc6891#section-6.2.5).
pub const MAX_RECEIVE_BUFFER_SIZE: usize = 4096;

const DEFAULT_TARGET_PORT: u16 = 53;

/// A backend passes on one query to one server IP and returns the raw response message (or
/// a transport-level failure). It never interprets the response; classification is the
/// caller's job.
#[async_trait]
pub trait Backend: Debug {
    async fn query(
        &self,
        target: IpAddr,
        query: &Query,
        use_tcp: bool,
        udp_size: u16,
        attempt_timeout: Duration,
    ) -> Result<Message, QueryError>;
}

/// Sends RD-clear (we are querying authoritative servers, not asking for recursion)
/// queries, EDNS0-sized as configured, over UDP or TCP.
#[derive(Debug)]
pub struct UdpBackend {
    target_port: u16,
}

impl UdpBackend {
    pub fn new() -> Self {
        UdpBackend { target_port: DEFAULT_TARGET_PORT }
    }
}

impl Default for UdpBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn make_query(query: &Query, udp_size: u16) -> Message {
    let mut wire_query = WireQuery::new();
    wire_query.set_name(query.qname.clone()).set_query_type(query.qtype).set_query_class(query.qclass);
    let mut message = Message::new();
    message.add_query(wire_query);
    message.set_recursion_desired(false);
    message.set_id(rand::random());
    // udp_size == 512 disables EDNS0 entirely, per spec.
    if udp_size > 512 {
        let mut edns = Edns::new();
        edns.set_max_payload(udp_size);
        message.set_edns(edns);
    }
    message
}

async fn udp_connect(target: IpAddr, target_port: u16) -> Result<UdpSocket, QueryError> {
    let local = SocketAddr::new(
        match target {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        },
        0,
    );
    let socket = UdpSocket::bind(local).await?;
    socket.connect(SocketAddr::new(target, target_port)).await?;
    Ok(socket)
}

async fn query_udp(
    target: IpAddr,
    target_port: u16,
    request: &Message,
    attempt_timeout: Duration,
) -> Result<Message, QueryError> {
    let attempt = async {
        let socket = udp_connect(target, target_port).await?;
        socket.send(request.to_vec()?.as_slice()).await?;
        let mut buf = vec![0u8; MAX_RECEIVE_BUFFER_SIZE];
        let read_count = socket.recv(&mut buf).await?;
        Ok::<Message, QueryError>(Message::from_bytes(&buf[..read_count])?)
    };
    match timeout(attempt_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout(1)),
    }
}

async fn query_tcp(
    target: IpAddr,
    target_port: u16,
    request: &Message,
    attempt_timeout: Duration,
) -> Result<Message, QueryError> {
    let attempt = async {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = TcpStream::connect(SocketAddr::new(target, target_port)).await?;
        let wire = request.to_vec()?;
        let len = (wire.len() as u16).to_be_bytes();
        stream.write_all(&len).await?;
        stream.write_all(&wire).await?;
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; resp_len];
        stream.read_exact(&mut buf).await?;
        Ok::<Message, QueryError>(Message::from_bytes(&buf)?)
    };
    match timeout(attempt_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout(1)),
    }
}

#[async_trait]
impl Backend for UdpBackend {
    #[instrument(skip(self), fields(%target, %query, use_tcp))]
    async fn query(
        &self,
        target: IpAddr,
        query: &Query,
        use_tcp: bool,
        udp_size: u16,
        attempt_timeout: Duration,
    ) -> Result<Message, QueryError> {
        let request = make_query(query, udp_size);
        if use_tcp {
            query_tcp(target, self.target_port, &request, attempt_timeout).await
        } else {
            query_udp(target, self.target_port, &request, attempt_timeout).await
        }
    }
}

/// Test-only backend: a canned table of `(target, qname, qtype) -> Message` responses (or a
/// canned failure), so traversal scenarios can be exercised without a real network.
#[cfg(test)]
pub mod fake {
    use super::*;
    use hickory_proto::rr::{Name, RecordType};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(PartialEq, Eq, Hash, Clone)]
    struct Key {
        target: IpAddr,
        name: Name,
        record_type: RecordType,
    }

    #[derive(Clone)]
    enum Canned {
        Message(Message),
        Timeout,
    }

    #[derive(Default)]
    pub struct FakeBackend {
        answers: Mutex<HashMap<Key, Canned>>,
    }

    impl std::fmt::Debug for FakeBackend {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FakeBackend")
                .field("answer_count", &self.answers.lock().unwrap().len())
                .finish()
        }
    }

    impl FakeBackend {
        pub fn new() -> Self {
            FakeBackend::default()
        }

        pub fn add(&self, ip: &str, name: &str, record_type: RecordType, message: Message) {
            let key = Key { target: ip.parse().unwrap(), name: name.parse().unwrap(), record_type };
            self.answers.lock().unwrap().insert(key, Canned::Message(message));
        }

        pub fn add_timeout(&self, ip: &str, name: &str, record_type: RecordType) {
            let key = Key { target: ip.parse().unwrap(), name: name.parse().unwrap(), record_type };
            self.answers.lock().unwrap().insert(key, Canned::Timeout);
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn query(
            &self,
            target: IpAddr,
            query: &Query,
            _use_tcp: bool,
            _udp_size: u16,
            _attempt_timeout: Duration,
        ) -> Result<Message, QueryError> {
            let key = Key { target, name: query.qname.clone(), record_type: query.qtype };
            match self.answers.lock().unwrap().get(&key).cloned() {
                Some(Canned::Message(m)) => Ok(m),
                Some(Canned::Timeout) | None => Err(QueryError::Timeout(1)),
            }
        }
    }
}
