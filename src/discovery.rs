use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

const DEFAULT_PORT: u16 = 9999;
const DEFAULT_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const DEFAULT_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
const MULTICAST_TTL: u32 = 2;
const RESPONSE_BUFFER: usize = 1000;

/// Finds cooperating services on the local network over UDP multicast.
///
/// A finder broadcasts a caller-supplied payload on the group and collects
/// the payloads other hosts broadcast back, deduplicated by source host,
/// until a time limit, a response cap, or a caller predicate says stop. An
/// announcer runs the broadcast half only.
pub struct ServiceDiscoverer {
    /// Port the services being discovered listen on. Zero means the default
    /// (9999).
    pub port: u16,

    /// The multicast group to broadcast on. `None` picks the default for the
    /// chosen IP version.
    pub multicast_address: Option<IpAddr>,

    /// How long to wait between broadcasts.
    pub broadcast_delay: Duration,

    /// Stop after this many distinct services respond. `None` means no cap.
    pub max_services: Option<usize>,

    /// How long to spend searching.
    pub time_limit: Duration,

    /// Use UDP over IPv6 instead of IPv4.
    pub use_ipv6: bool,

    /// Report services running on this host. Off by default.
    pub allow_local: bool,
}

impl Default for ServiceDiscoverer {
    fn default() -> Self {
        ServiceDiscoverer {
            port: DEFAULT_PORT,
            multicast_address: None,
            broadcast_delay: Duration::from_millis(500),
            max_services: None,
            time_limit: Duration::from_secs(5),
            use_ipv6: false,
            allow_local: false,
        }
    }
}

/// An address that responded to the discovery broadcast, with its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub address: String,
    pub payload_response: Vec<u8>,
}

impl ServiceDiscoverer {
    fn group(&self) -> IpAddr {
        self.multicast_address.unwrap_or(if self.use_ipv6 {
            IpAddr::V6(DEFAULT_GROUP_V6)
        } else {
            IpAddr::V4(DEFAULT_GROUP_V4)
        })
    }

    fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    fn unspecified(&self) -> IpAddr {
        if self.use_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }

    /// Search for services, returning every responder collected before a
    /// stop condition was reached.
    pub async fn find_services(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<Vec<Service>, Error> {
        self.find_services_where(cancel, payload, |_| false).await
    }

    /// Like [`find_services`](Self::find_services), additionally stopping as
    /// soon as `stop` returns true for a collected service.
    pub async fn find_services_where<F>(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
        mut stop: F,
    ) -> Result<Vec<Service>, Error>
    where
        F: FnMut(&Service) -> bool,
    {
        let group = self.group();
        let port = self.port();

        let listener = self.bind_group_listener(group, port)?;
        let broadcaster = self.bind_broadcaster(group).await?;
        let local_ip = local_source_ip(group, port);

        let destination = SocketAddr::new(group, port);
        let deadline = tokio::time::Instant::now() + self.time_limit;
        let mut ticker = tokio::time::interval(self.broadcast_delay);
        let mut responses: HashMap<String, Vec<u8>> = HashMap::new();
        let mut buf = [0u8; RESPONSE_BUFFER];

        'collect: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'collect,
                _ = tokio::time::sleep_until(deadline) => break 'collect,
                _ = ticker.tick() => {
                    if let Err(err) = broadcaster.send_to(payload, destination).await {
                        log::debug!("discovery broadcast failed: {}", err);
                    }
                }
                received = listener.recv_from(&mut buf) => {
                    let (n, src) = received?;
                    if !self.allow_local && is_local_source(src.ip(), local_ip) {
                        continue;
                    }

                    let service = Service {
                        address: src.ip().to_string(),
                        payload_response: buf[..n].to_vec(),
                    };
                    let known = responses.insert(service.address.clone(), service.payload_response.clone());

                    if known.is_none() {
                        log::debug!("discovered service at {}", service.address);
                    }
                    if stop(&service) {
                        break 'collect;
                    }
                    if let Some(max) = self.max_services {
                        if responses.len() >= max {
                            break 'collect;
                        }
                    }
                }
            }
        }

        Ok(responses
            .into_iter()
            .map(|(address, payload_response)| Service {
                address,
                payload_response,
            })
            .collect())
    }

    /// Announce a payload on the group so finders can collect it. Runs until
    /// the time limit passes or the token is cancelled.
    pub async fn broadcast_service(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<(), Error> {
        let group = self.group();
        let port = self.port();
        let broadcaster = self.bind_broadcaster(group).await?;

        let destination = SocketAddr::new(group, port);
        let deadline = tokio::time::Instant::now() + self.time_limit;
        let mut ticker = tokio::time::interval(self.broadcast_delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = broadcaster.send_to(payload, destination).await {
                        log::debug!("discovery broadcast failed: {}", err);
                    }
                }
            }
        }
    }

    /// Bind the group listener on the discovery port and join the group on
    /// the default interface.
    fn bind_group_listener(&self, group: IpAddr, port: u16) -> Result<UdpSocket, Error> {
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(self.unspecified(), port))?;
        match group {
            IpAddr::V4(group) => std_socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group) => std_socket.join_multicast_v6(&group, 0)?,
        }
        std_socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Bind the sending socket on an ephemeral port with a small TTL so
    /// broadcasts stay on the local network.
    async fn bind_broadcaster(&self, group: IpAddr) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind(SocketAddr::new(self.unspecified(), 0)).await?;
        if let IpAddr::V4(_) = group {
            socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
            socket.set_multicast_loop_v4(true)?;
        }
        Ok(socket)
    }
}

/// Which source address this host's discovery packets will appear to come
/// from, learned by "connecting" a scratch UDP socket toward the group.
fn local_source_ip(group: IpAddr, port: u16) -> Option<IpAddr> {
    let unspecified = match group {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let probe = std::net::UdpSocket::bind(SocketAddr::new(unspecified, 0)).ok()?;
    probe.connect(SocketAddr::new(group, port)).ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}

fn is_local_source(src: IpAddr, local_ip: Option<IpAddr>) -> bool {
    src.is_loopback() || Some(src) == local_ip
}
