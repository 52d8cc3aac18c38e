use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::framing;
use crate::message::Role;

/// Relays idle longer than this are eligible for eviction.
pub const RELAY_IDLE_LIMIT: Duration = Duration::from_secs(10 * 60);

/// How often the evictor wakes to sweep idle relays.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Handed to a connection's context when it is installed in a slot while the
/// other half is still missing. When `claim` fires, the connection loop sends
/// its socket through `conn_tx` and exits.
#[derive(Debug)]
pub struct Handover {
    pub(crate) claim: CancellationToken,
    pub(crate) conn_tx: oneshot::Sender<TcpStream>,
}

/// The mailbox half of a waiting slot.
struct PendingConn {
    claim: CancellationToken,
    conn_rx: oneshot::Receiver<TcpStream>,
}

/// One half of a relay: a registered connection for a role. `pending` is
/// present until forwarding starts; the role marker outlives it so conflict
/// checks keep working for the lifetime of the entry.
struct Slot {
    pending: Option<PendingConn>,
}

struct Relay {
    sender: Option<Slot>,
    receiver: Option<Slot>,
    opened_at: Instant,
    last_used: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl Relay {
    fn new(now: Instant) -> Self {
        Relay {
            sender: None,
            receiver: None,
            opened_at: now,
            last_used: Arc::new(Mutex::new(now)),
            cancel: CancellationToken::new(),
        }
    }

    fn slot(&self, role: Role) -> &Option<Slot> {
        match role {
            Role::Sender => &self.sender,
            Role::Receiver => &self.receiver,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Slot> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    fn is_idle(&self, max_idle: Duration) -> bool {
        self.last_used.lock().elapsed() > max_idle
    }

    /// Tear the relay down: stop any forwarders and release any parked
    /// connection. Dropping the handover receivers makes parked loops drop
    /// their sockets, so close errors have nowhere to surface and are
    /// effectively ignored.
    fn shutdown(self) {
        self.cancel.cancel();
        for slot in [self.sender, self.receiver].into_iter().flatten() {
            if let Some(pending) = slot.pending {
                pending.claim.cancel();
            }
        }
    }
}

/// Outcome of installing a connection into a slot.
#[derive(Debug)]
pub enum Registration {
    /// First half of the pair: park the connection with this handover.
    Waiting(Handover),
    /// The pair is complete: spawn forwarders with [`Mailbox::activate`].
    Completed(Pairing),
}

/// Everything the pairing task needs to connect the two halves together.
#[derive(Debug)]
pub struct Pairing {
    key: String,
    completer_role: Role,
    peer_claim: CancellationToken,
    peer_conn_rx: oneshot::Receiver<TcpStream>,
    cancel: CancellationToken,
    last_used: Arc<Mutex<Instant>>,
}

/// In-memory map from a user-chosen slot key to a relay pairing a sender and
/// a receiver connection. One mutex covers lookup, insert, slot mutation, and
/// delete; no I/O happens under it.
#[derive(Default)]
pub struct Mailbox {
    relays: Mutex<HashMap<String, Relay>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox::default()
    }

    /// Install a connection into the slot for `key` and `role`.
    ///
    /// Role conflicts are reported before the slots-full case so a duplicate
    /// role always names itself in the error.
    pub fn register(&self, key: &str, role: Role) -> Result<Registration, Error> {
        let mut relays = self.relays.lock();

        if let Some(relay) = relays.get_mut(key) {
            if relay.slot(role).is_some() {
                return Err(Error::RoleTaken(role));
            }
            if relay.sender.is_some() && relay.receiver.is_some() {
                return Err(Error::SlotsFull);
            }

            let peer = relay
                .slot_mut(role.other())
                .as_mut()
                .and_then(|slot| slot.pending.take())
                .ok_or(Error::SlotsFull)?;
            *relay.slot_mut(role) = Some(Slot { pending: None });

            return Ok(Registration::Completed(Pairing {
                key: key.to_string(),
                completer_role: role,
                peer_claim: peer.claim,
                peer_conn_rx: peer.conn_rx,
                cancel: relay.cancel.clone(),
                last_used: relay.last_used.clone(),
            }));
        }

        let mut relay = Relay::new(Instant::now());
        let claim = CancellationToken::new();
        let (conn_tx, conn_rx) = oneshot::channel();
        *relay.slot_mut(role) = Some(Slot {
            pending: Some(PendingConn {
                claim: claim.clone(),
                conn_rx,
            }),
        });
        relays.insert(key.to_string(), relay);

        Ok(Registration::Waiting(Handover { claim, conn_tx }))
    }

    /// Claim the parked half of a completed pair and start one forwarder per
    /// direction. `conn` is the completer's own connection.
    pub fn activate(self: &Arc<Self>, pairing: Pairing, conn: TcpStream) {
        let mailbox = Arc::clone(self);
        tokio::spawn(async move {
            pairing.peer_claim.cancel();
            let peer_conn = match pairing.peer_conn_rx.await {
                Ok(conn) => conn,
                Err(_) => {
                    // The parked half died before handing its socket over.
                    log::debug!("slot {}: peer vanished before pairing", pairing.key);
                    mailbox.remove(&pairing.key);
                    return;
                }
            };

            let (mine, theirs) = (conn, peer_conn);
            let (sender_conn, receiver_conn) = match pairing.completer_role {
                Role::Sender => (mine, theirs),
                Role::Receiver => (theirs, mine),
            };

            log::info!("slot {}: paired, forwarding", pairing.key);
            let (sender_read, sender_write) = sender_conn.into_split();
            let (receiver_read, receiver_write) = receiver_conn.into_split();

            tokio::spawn(forward(
                sender_read,
                receiver_write,
                pairing.last_used.clone(),
                pairing.cancel.clone(),
                Arc::clone(&mailbox),
                pairing.key.clone(),
            ));
            tokio::spawn(forward(
                receiver_read,
                sender_write,
                pairing.last_used,
                pairing.cancel,
                mailbox,
                pairing.key,
            ));
        });
    }

    /// Remove and tear down the relay for `key`, if any.
    pub fn remove(&self, key: &str) {
        let removed = self.relays.lock().remove(key);
        if let Some(relay) = removed {
            relay.shutdown();
        }
    }

    /// Sweep out relays idle longer than `max_idle`. Candidates are gathered
    /// and unlinked under the lock; sockets close outside it. Returns how
    /// many relays were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut expired = Vec::new();
        {
            let mut relays = self.relays.lock();
            let keys: Vec<String> = relays
                .iter()
                .filter(|(_, relay)| relay.is_idle(max_idle))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(relay) = relays.remove(&key) {
                    log::debug!(
                        "evicting idle relay {} (open {:?})",
                        key,
                        relay.opened_at.elapsed()
                    );
                    expired.push(relay);
                }
            }
        }

        let count = expired.len();
        for relay in expired {
            relay.shutdown();
        }
        count
    }

    /// Tear down every relay. Called at server shutdown.
    pub fn drain(&self) {
        let drained: Vec<Relay> = {
            let mut relays = self.relays.lock();
            relays.drain().map(|(_, relay)| relay).collect()
        };
        for relay in drained {
            relay.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.relays.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Which slots of `key` are occupied, as `(sender, receiver)`.
    pub fn occupancy(&self, key: &str) -> Option<(bool, bool)> {
        let relays = self.relays.lock();
        relays
            .get(key)
            .map(|relay| (relay.sender.is_some(), relay.receiver.is_some()))
    }
}

/// Move frames from `src` to `dst` until either side fails or the relay is
/// torn down. Frames are forwarded opaquely; nothing past the length prefix
/// is inspected. A failure in either direction cancels the shared token, so
/// both directions stop and every half closes on drop.
async fn forward(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    last_used: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    mailbox: Arc<Mailbox>,
    key: String,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = framing::read_frame(&mut src) => match result {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("slot {}: forward read ended: {}", key, err);
                    break;
                }
            },
        };

        if let Err(err) = framing::write_frame(&mut dst, &frame).await {
            log::debug!("slot {}: forward write failed: {}", key, err);
            break;
        }
        *last_used.lock() = Instant::now();
    }

    cancel.cancel();
    mailbox.remove(&key);
}

/// Background sweep: wake on an interval, evict idle relays, and drain the
/// mailbox when shutdown is observed.
pub async fn run_evictor(mailbox: Arc<Mailbox>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("shutting down relay evictor");
                mailbox.drain();
                return;
            }
            _ = tokio::time::sleep(EVICTION_INTERVAL) => {
                let evicted = mailbox.evict_idle(RELAY_IDLE_LIMIT);
                if evicted > 0 {
                    log::info!("evicted {} idle relays", evicted);
                }
            }
        }
    }
}
