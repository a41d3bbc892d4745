//! UDP transport.
//!
//! Two sockets per node: the *unicast* socket is bound to the node's
//! unicast port, carries outgoing broadcasts (so peers learn our unicast
//! endpoint from the datagram source) and receives directed replies; the
//! *broadcast* socket is bound to the shared broadcast port and receives
//! everything sent to the LAN, doubling as the sender for unicast replies.
//!
//! One receiver thread polls both sockets in non-blocking mode, parses each
//! datagram and pushes `(Message, sender)` onto a bounded queue for the
//! protocol thread. Time-sync and election traffic is never dropped on
//! overflow; everything else is.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use flk_protocol::{Message, MessageType};

use crate::engine::Outbound;
use crate::error::{NetError, Result};

/// Socket receive buffer size. UDP datagrams up to the protocol maximum
/// fit many times over.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Receiver -> protocol queue depth.
pub const RECEIVE_QUEUE_DEPTH: usize = 1024;

/// Sleep between empty polls.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Messages that must survive queue pressure.
fn is_critical(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::TimeSync
            | MessageType::MasterAnnouncement
            | MessageType::MasterResponse
            | MessageType::MasterElection
            | MessageType::MasterVote
            | MessageType::MasterResign
    )
}

/// Shared counters for dropped datagrams.
#[derive(Default)]
pub struct TransportCounters {
    pub parse_failures: AtomicU64,
    pub queue_drops: AtomicU64,
}

/// The two sockets plus the receiver thread.
pub struct Transport {
    unicast_socket: UdpSocket,
    broadcast_socket: UdpSocket,
    broadcast_dest: SocketAddr,
    local_unicast: SocketAddr,
    scratch: Vec<u8>,
    stop: Arc<AtomicBool>,
    counters: Arc<TransportCounters>,
    receiver: Option<JoinHandle<()>>,
}

impl Transport {
    /// Bind both sockets. Failure here is fatal for the node.
    pub fn bind(unicast_port: u16, broadcast_port: u16) -> Result<Self> {
        let unicast_socket = Self::make_socket(unicast_port, true)?;
        let broadcast_socket = Self::make_socket(broadcast_port, false)?;

        let local_unicast = unicast_socket
            .local_addr()
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let actual_broadcast_port = broadcast_socket
            .local_addr()
            .map_err(|e| NetError::BindFailed(e.to_string()))?
            .port();

        let broadcast_dest =
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, actual_broadcast_port));

        info!(
            unicast = %local_unicast,
            broadcast_port = actual_broadcast_port,
            "transport bound"
        );

        Ok(Self {
            unicast_socket,
            broadcast_socket,
            broadcast_dest,
            local_unicast,
            scratch: Vec::with_capacity(flk_protocol::MAX_PAYLOAD_SIZE),
            stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(TransportCounters::default()),
            receiver: None,
        })
    }

    fn make_socket(port: u16, broadcast: bool) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetError::BindFailed(format!("failed to create socket: {e}")))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| NetError::BindFailed(format!("failed to set SO_REUSEADDR: {e}")))?;

        // SO_REUSEPORT lets several nodes share a host during testing.
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|e| NetError::BindFailed(format!("failed to set SO_REUSEPORT: {e}")))?;

        socket
            .set_recv_buffer_size(RECV_BUFFER_SIZE)
            .map_err(|e| NetError::BindFailed(format!("failed to size receive buffer: {e}")))?;

        if broadcast {
            socket
                .set_broadcast(true)
                .map_err(|e| NetError::BindFailed(format!("failed to enable broadcast: {e}")))?;
        }

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&socket2::SockAddr::from(addr))
            .map_err(|e| NetError::BindFailed(format!("failed to bind port {port}: {e}")))?;

        let socket: UdpSocket = socket.into();
        socket
            .set_nonblocking(true)
            .map_err(|e| NetError::BindFailed(format!("failed to set non-blocking: {e}")))?;
        Ok(socket)
    }

    /// Local unicast endpoint (useful with ephemeral test ports).
    pub fn local_unicast(&self) -> SocketAddr {
        self.local_unicast
    }

    pub fn broadcast_dest(&self) -> SocketAddr {
        self.broadcast_dest
    }

    pub fn counters(&self) -> Arc<TransportCounters> {
        Arc::clone(&self.counters)
    }

    /// Spawn the receiver thread feeding `tx`.
    pub fn start_receiver(&mut self, tx: Sender<(Message, SocketAddr)>) -> Result<()> {
        let unicast = self
            .unicast_socket
            .try_clone()
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let broadcast = self
            .broadcast_socket
            .try_clone()
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let stop = Arc::clone(&self.stop);
        let counters = Arc::clone(&self.counters);

        let handle = thread::Builder::new()
            .name("flk-receiver".to_string())
            .spawn(move || {
                receiver_loop(&[unicast, broadcast], &tx, &stop, &counters);
            })
            .map_err(|e| NetError::BindFailed(e.to_string()))?;

        self.receiver = Some(handle);
        Ok(())
    }

    /// Signal and join the receiver thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }

    /// Send one outbound datagram. Send failures are expected on UDP and
    /// logged rather than propagated.
    pub fn send(&mut self, outbound: &Outbound) {
        let result = match outbound {
            Outbound::Broadcast(msg) => self.send_to(msg, self.broadcast_dest, true),
            Outbound::Unicast(addr, msg) => self.send_to(msg, *addr, false),
        };
        if let Err(err) = result {
            warn!(error = %err, "send failed");
        }
    }

    fn send_to(&mut self, msg: &Message, dest: SocketAddr, via_broadcast: bool) -> Result<()> {
        msg.encode_into(&mut self.scratch)?;
        let socket = if via_broadcast {
            // Broadcasts leave the unicast-bound socket so receivers learn
            // our unicast endpoint from the source address.
            &self.unicast_socket
        } else {
            &self.broadcast_socket
        };
        socket
            .send_to(&self.scratch, dest)
            .map_err(|e| NetError::SendFailed(format!("{dest}: {e}")))?;
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receiver_loop(
    sockets: &[UdpSocket],
    tx: &Sender<(Message, SocketAddr)>,
    stop: &AtomicBool,
    counters: &TransportCounters,
) {
    info!("receiver thread started");
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while !stop.load(Ordering::SeqCst) {
        let mut received_any = false;

        for socket in sockets {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, sender)) => {
                        received_any = true;
                        match Message::decode(&buf[..len]) {
                            Ok(msg) => dispatch(msg, sender, tx, counters),
                            Err(err) => {
                                counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                                debug!(from = %sender, error = %err, "dropping malformed datagram");
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, "receive error");
                        break;
                    }
                }
            }
        }

        if !received_any {
            thread::sleep(IDLE_SLEEP);
        }
    }
    info!("receiver thread stopped");
}

fn dispatch(
    msg: Message,
    sender: SocketAddr,
    tx: &Sender<(Message, SocketAddr)>,
    counters: &TransportCounters,
) {
    let critical = is_critical(msg.msg_type);
    match tx.try_send((msg, sender)) {
        Ok(()) => {}
        Err(TrySendError::Full(item)) => {
            if critical {
                // Back-pressure: PTP and election traffic must get through,
                // so block briefly instead of dropping.
                if tx.send_timeout(item, Duration::from_millis(50)).is_err() {
                    counters.queue_drops.fetch_add(1, Ordering::Relaxed);
                    warn!("receive queue wedged, critical message lost");
                }
            } else {
                counters.queue_drops.fetch_add(1, Ordering::Relaxed);
                debug!("receive queue full, datagram dropped");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Build the receiver -> protocol queue.
pub fn receive_queue() -> (Sender<(Message, SocketAddr)>, Receiver<(Message, SocketAddr)>) {
    crossbeam_channel::bounded(RECEIVE_QUEUE_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flk_protocol::{encode_utf16_payload, MessageType};
    use uuid::Uuid;

    #[test]
    fn unicast_roundtrip_between_two_transports() {
        // Ephemeral ports so parallel test runs never collide.
        let mut a = Transport::bind(0, 0).unwrap();
        let mut b = Transport::bind(0, 0).unwrap();

        let (tx, rx) = receive_queue();
        b.start_receiver(tx).unwrap();

        let msg = Message::new(
            MessageType::Discovery,
            Uuid::new_v4(),
            1,
            encode_utf16_payload("transport-test"),
        );
        let dest = SocketAddr::new("127.0.0.1".parse().unwrap(), b.local_unicast().port());
        a.send(&Outbound::Unicast(dest, msg.clone()));

        let (received, sender) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("datagram did not arrive");
        assert_eq!(received, msg);
        assert_eq!(sender.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());

        b.stop();
        a.stop();
    }

    #[test]
    fn malformed_datagrams_counted_not_delivered() {
        let mut t = Transport::bind(0, 0).unwrap();
        let (tx, rx) = receive_queue();
        t.start_receiver(tx).unwrap();
        let counters = t.counters();

        let plain = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = SocketAddr::new("127.0.0.1".parse().unwrap(), t.local_unicast().port());
        plain.send_to(b"definitely not a framelock datagram", dest).unwrap();

        // Give the receiver a moment to poll.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counters.parse_failures.load(Ordering::Relaxed) == 0
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counters.parse_failures.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err());

        t.stop();
    }

    #[test]
    fn critical_classification() {
        assert!(is_critical(MessageType::TimeSync));
        assert!(is_critical(MessageType::MasterElection));
        assert!(is_critical(MessageType::MasterVote));
        assert!(!is_critical(MessageType::PingRequest));
        assert!(!is_critical(MessageType::Discovery));
        assert!(!is_critical(MessageType::SettingsSync));
    }
}
