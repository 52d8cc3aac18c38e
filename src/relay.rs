use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::crypto;
use crate::dispatcher::{Dispatcher, Handler, HandlerFuture};
use crate::error::Error;
use crate::mailbox::{self, Mailbox, Registration};
use crate::message::{Hello, Pake};
use crate::states::{server_states, StateGraph};
use crate::{DEFAULT_APP_ID, DEFAULT_RELAY_ADDRESS, DEFAULT_RELAY_PASSWORD};

/// Scratch-store key the state gate keeps a connection's graph under.
const STATES_KEY: &str = "states";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub address: String,
    pub password: String,
    pub app_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            address: DEFAULT_RELAY_ADDRESS.to_string(),
            password: DEFAULT_RELAY_PASSWORD.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
        }
    }
}

/// The rendezvous server: authenticates connections with SPAKE2, pairs them
/// on user-chosen slot keys, and forwards frames between paired halves.
pub struct RelayServer {
    config: RelayConfig,
    mailbox: Arc<Mailbox>,
}

struct RelayState {
    mailbox: Arc<Mailbox>,
    password: String,
    app_id: String,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        RelayServer::with_mailbox(config, Arc::new(Mailbox::new()))
    }

    /// Build a server around an existing mailbox, so tests can inspect and
    /// inject rendezvous state.
    pub fn with_mailbox(config: RelayConfig, mailbox: Arc<Mailbox>) -> Self {
        RelayServer { config, mailbox }
    }

    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.config.address).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already-bound listener until cancelled.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<(), Error> {
        let state = Arc::new(RelayState {
            mailbox: Arc::clone(&self.mailbox),
            password: self.config.password.clone(),
            app_id: self.config.app_id.clone(),
        });

        tokio::spawn(mailbox::run_evictor(self.mailbox(), cancel.clone()));

        let mut dispatcher = Dispatcher::new(self.config.address.clone());
        dispatcher.add_middleware(StateGate);
        dispatcher.action(
            "pake",
            PakeAction {
                state: Arc::clone(&state),
            },
        );
        dispatcher.action("hello", HelloAction { state });

        dispatcher.serve(listener, cancel).await
    }
}

/// Gates every dispatched action through the server's connection-lifecycle
/// graph: a connection must authenticate before anything else, then announce
/// its slot, then signal readiness.
struct StateGate;

impl Handler for StateGate {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let action = ctx.action().to_string();
            let graph = ctx.get_or_insert_with(STATES_KEY, server_states);
            graph.validate_and_advance(&action)
        })
    }
}

struct PakeAction {
    state: Arc<RelayState>,
}

impl Handler for PakeAction {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(pake_handler(&self.state, ctx))
    }
}

/// One round trip of symmetric SPAKE2: combine the peer's start message with
/// our own, reply with ours, and flip the connection to encrypted mode under
/// the derived session key.
async fn pake_handler(state: &RelayState, ctx: &mut Context) -> Result<(), Error> {
    let inbound: Pake = ctx.bind()?;

    let (spake, outbound) = crypto::start_pake(&state.password, &state.app_id);
    let session_key = crypto::finish_pake(spake, &inbound.body)?;

    ctx.json("pake", &Pake { body: outbound }).await?;

    ctx.set_encryption_key(session_key);
    ctx.turn_encryption_on()?;
    log::debug!("connection from {} authenticated", ctx.remote_addr());
    Ok(())
}

struct HelloAction {
    state: Arc<RelayState>,
}

impl Handler for HelloAction {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(hello_handler(&self.state, ctx))
    }
}

/// The rendezvous: install the caller in the slot it asked for. The first
/// half of a pair parks until its peer arrives; the second half completes the
/// pair and forwarding begins.
async fn hello_handler(state: &RelayState, ctx: &mut Context) -> Result<(), Error> {
    let hello: Hello = ctx.bind()?;
    log::info!(
        "hello from {} for slot {} as {}",
        ctx.remote_addr(),
        hello.relay_key,
        hello.connection_type
    );

    match state.mailbox.register(&hello.relay_key, hello.connection_type) {
        Ok(Registration::Waiting(handover)) => {
            ctx.park(handover);
            Ok(())
        }
        Ok(Registration::Completed(pairing)) => {
            let conn = ctx.take_conn().ok_or(Error::ConnectionClosed)?;
            state.mailbox.activate(pairing, conn);
            Ok(())
        }
        Err(err) => {
            // Rewind so the peer may retry with a different slot or role.
            if let Some(graph) = ctx.get_mut::<StateGraph>(STATES_KEY) {
                graph.set_start("pake");
            }
            Err(err)
        }
    }
}
