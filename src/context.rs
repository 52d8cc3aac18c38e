use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::framing;
use crate::mailbox::Handover;
use crate::message::Message;
use crate::KEY_SIZE;

/// Per-connection state handed to every middleware and action handler.
///
/// A context is created on accept, owned by exactly one connection task, and
/// destroyed when that task's loop exits. Handlers must route every outbound
/// write through it so the encryption flag is honored.
pub struct Context {
    conn: Option<TcpStream>,
    remote_addr: SocketAddr,
    msg: Message,
    encryption_key: Option<[u8; KEY_SIZE]>,
    encryption_on: bool,
    store: HashMap<String, Box<dyn Any + Send>>,
    handover: Option<Handover>,
}

impl Context {
    pub fn new(conn: TcpStream, remote_addr: SocketAddr) -> Self {
        Context {
            conn: Some(conn),
            remote_addr,
            msg: Message::default(),
            encryption_key: None,
            encryption_on: false,
            store: HashMap::new(),
            handover: None,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The action name of the current inbound message.
    pub fn action(&self) -> &str {
        &self.msg.action
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    /// Decode the current message body into a typed payload.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, Error> {
        self.msg.bind()
    }

    pub fn set_encryption_key(&mut self, key: [u8; KEY_SIZE]) {
        self.encryption_key = Some(key);
    }

    pub fn encryption_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.encryption_key
    }

    /// Every subsequent frame in either direction is AEAD-sealed. Fails if no
    /// session key has been set.
    pub fn turn_encryption_on(&mut self) -> Result<(), Error> {
        if self.encryption_key.is_none() {
            return Err(Error::NoEncryptionKey);
        }
        self.encryption_on = true;
        Ok(())
    }

    pub fn turn_encryption_off(&mut self) -> Result<(), Error> {
        if self.encryption_key.is_none() {
            return Err(Error::NoEncryptionKey);
        }
        self.encryption_on = false;
        Ok(())
    }

    /// Read one message from the connection into the context, honoring the
    /// encryption flag.
    pub async fn read_msg(&mut self) -> Result<(), Error> {
        let encryption_key = self.encryption_key;
        let encrypted = self.encryption_on;
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;

        let bytes = if encrypted {
            let key = encryption_key.ok_or(Error::NoEncryptionKey)?;
            framing::read_encrypted_frame(conn, &key).await?
        } else {
            framing::read_frame(conn).await?
        };

        self.msg = Message::decode(&bytes)?;
        Ok(())
    }

    /// Write an envelope, honoring the encryption flag.
    pub async fn write_msg(&mut self, msg: &Message) -> Result<(), Error> {
        let bytes = msg.encode()?;
        let encryption_key = self.encryption_key;
        let encrypted = self.encryption_on;
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;

        if encrypted {
            let key = encryption_key.ok_or(Error::NoEncryptionKey)?;
            framing::write_encrypted_frame(conn, &bytes, &key).await?;
        } else {
            framing::write_frame(conn, &bytes).await?;
        }
        Ok(())
    }

    /// Encode `value`, wrap it in an envelope tagged `action`, and write it.
    pub async fn json<T: Serialize>(&mut self, action: &str, value: &T) -> Result<(), Error> {
        let msg = Message::with_value(action, value)?;
        self.write_msg(&msg).await
    }

    /// Report an error to the peer through the envelope's error field.
    pub async fn write_error(&mut self, err: &Error) -> Result<(), Error> {
        let msg = Message::from_error(err);
        self.write_msg(&msg).await
    }

    /// Store a value in the scratch store for other middleware or handlers on
    /// this connection.
    pub fn set<T: Any + Send>(&mut self, key: &str, value: T) {
        self.store.insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.store.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.store.get_mut(key).and_then(|v| v.downcast_mut())
    }

    /// Fetch a scratch entry, inserting it first if absent.
    pub fn get_or_insert_with<T, F>(&mut self, key: &str, init: F) -> &mut T
    where
        T: Any + Send,
        F: FnOnce() -> T,
    {
        use std::collections::hash_map::Entry;

        let slot = match self.store.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let value = occupied.into_mut();
                if !value.is::<T>() {
                    *value = Box::new(init());
                }
                value
            }
            Entry::Vacant(vacant) => vacant.insert(Box::new(init())),
        };
        slot.downcast_mut::<T>()
            .expect("scratch entry was just checked against T")
    }

    /// Move the socket out of the context; the connection loop exits once the
    /// socket is gone. Used by the rendezvous to take ownership of a paired
    /// connection.
    pub fn take_conn(&mut self) -> Option<TcpStream> {
        self.conn.take()
    }

    pub fn has_conn(&self) -> bool {
        self.conn.is_some()
    }

    /// Park this connection in a relay slot: keep dispatching, but surrender
    /// the socket through the handover once the slot's pair completes.
    pub fn park(&mut self, handover: Handover) {
        self.handover = Some(handover);
    }

    pub(crate) fn claim_token(&self) -> Option<CancellationToken> {
        self.handover.as_ref().map(|h| h.claim.clone())
    }

    /// Hand the socket to whoever claimed the slot. If the claimer is gone
    /// the socket is simply dropped, which closes it.
    pub(crate) fn surrender(&mut self) {
        if let (Some(handover), Some(conn)) = (self.handover.take(), self.conn.take()) {
            let _ = handover.conn_tx.send(conn);
        }
    }
}
