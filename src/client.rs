use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::Error;
use crate::framing;
use crate::message::{Hello, Message, Pake, Role};
use crate::{crypto, CONNECT_TIMEOUT, DEFAULT_APP_ID, DEFAULT_RELAY_PASSWORD, KEY_SIZE};

#[derive(Debug, Clone)]
pub struct ClientOpts {
    pub relay_address: String,
    pub relay_password: String,
    pub app_id: String,
}

impl Default for ClientOpts {
    fn default() -> Self {
        ClientOpts {
            relay_address: format!("127.0.0.1:{}", crate::DEFAULT_RELAY_PORT),
            relay_password: DEFAULT_RELAY_PASSWORD.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
        }
    }
}

/// Endpoint-side relay client: dials the relay, authenticates with SPAKE2,
/// announces a role on a slot, and from then on treats the connection as an
/// opaque bidirectional frame pipe to whatever peer fills the other slot.
pub struct Client {
    opts: ClientOpts,
    conn: TcpStream,
    session_key: Option<[u8; KEY_SIZE]>,
}

impl Client {
    /// Dial the relay with a 30-second connect timeout.
    pub async fn connect(opts: ClientOpts) -> Result<Self, Error> {
        let conn = timeout(CONNECT_TIMEOUT, TcpStream::connect(&opts.relay_address))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        log::debug!("connected to relay at {}", opts.relay_address);

        Ok(Client {
            opts,
            conn,
            session_key: None,
        })
    }

    /// Run the client side of the PAKE exchange and store the session key.
    /// Every message to the relay after this is AEAD-sealed.
    pub async fn exchange_pake(&mut self) -> Result<(), Error> {
        let (spake, outbound) = crypto::start_pake(&self.opts.relay_password, &self.opts.app_id);

        let msg = Message::with_value("pake", &Pake { body: outbound })?;
        framing::write_frame(&mut self.conn, &msg.encode()?).await?;

        let reply = Message::decode(&framing::read_frame(&mut self.conn).await?)?;
        if !reply.error.is_empty() {
            return Err(Error::Remote(reply.error));
        }
        if reply.action != "pake" {
            return Err(Error::UnexpectedAction {
                expected: "pake".to_string(),
                got: reply.action,
            });
        }

        let pake_reply: Pake = reply.bind()?;
        self.session_key = Some(crypto::finish_pake(spake, &pake_reply.body)?);
        log::debug!("relay session key established");
        Ok(())
    }

    /// Announce which slot to rendezvous on and which half of it we are.
    /// Must follow [`exchange_pake`](Self::exchange_pake); the relay only
    /// accepts `hello` on an authenticated connection.
    pub async fn join(&mut self, relay_key: &str, role: Role) -> Result<(), Error> {
        let key = self.session_key.ok_or(Error::NoEncryptionKey)?;
        let msg = Message::with_value(
            "hello",
            &Hello {
                relay_key: relay_key.to_string(),
                connection_type: role,
            },
        )?;
        framing::write_encrypted_frame(&mut self.conn, &msg.encode()?, &key).await?;
        log::debug!("joined slot {} as {}", relay_key, role);
        Ok(())
    }

    /// Send one opaque frame to the peer through the relay.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<usize, Error> {
        framing::write_frame(&mut self.conn, payload).await
    }

    /// Receive one opaque frame from the peer through the relay.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>, Error> {
        framing::read_frame(&mut self.conn).await
    }

    /// Read one envelope from the relay leg, decrypting with the session key
    /// when one is established. Used to pick up rendezvous error reports.
    pub async fn recv_message(&mut self) -> Result<Message, Error> {
        let bytes = match self.session_key {
            Some(key) => framing::read_encrypted_frame(&mut self.conn, &key).await?,
            None => framing::read_frame(&mut self.conn).await?,
        };
        Message::decode(&bytes)
    }

    pub fn session_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.session_key
    }

    /// Give up the wrapper and use the raw stream as the transfer pipe.
    pub fn into_stream(self) -> TcpStream {
        self.conn
    }
}
