use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::Error;
use crate::CONNECT_TIMEOUT;

/// Future returned by a handler invocation, borrowing the session context for
/// the duration of the call.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// An action handler or middleware. Handlers must not retain the context
/// beyond their return.
pub trait Handler: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a>;
}

/// Plain-function form of a handler, for actions that need no captured state.
pub type HandlerFn = for<'a> fn(&'a mut Context) -> HandlerFuture<'a>;

impl Handler for HandlerFn {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        (*self)(ctx)
    }
}

/// Action-dispatch server: accepts connections and drives a per-connection
/// read→dispatch loop over registered actions and middleware.
///
/// Registration happens before [`start`](Dispatcher::start); starting
/// consumes the dispatcher, so the handler table is immutable once the
/// accept loop runs.
pub struct Dispatcher {
    address: String,
    actions: HashMap<String, Arc<dyn Handler>>,
    middleware: Vec<Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(address: impl Into<String>) -> Self {
        Dispatcher {
            address: address.into(),
            actions: HashMap::new(),
            middleware: Vec::new(),
        }
    }

    /// Install a handler for a named action.
    pub fn action(&mut self, name: &str, handler: impl Handler + 'static) {
        self.actions.insert(name.to_string(), Arc::new(handler));
    }

    /// Append a middleware. Middleware run before the handler for every
    /// inbound message, in reverse registration order; the first failure
    /// skips the handler and is reported to the peer.
    pub fn add_middleware(&mut self, middleware: impl Handler + 'static) {
        self.middleware.push(Arc::new(middleware));
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.address).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already-bound listener until cancelled. Shutdown closes
    /// the listener and every per-connection task observes the signal at its
    /// next read.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<(), Error> {
        let inner = Arc::new(self);
        log::info!("listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("shutting down accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("accepted connection from {}", addr);
                            let inner = Arc::clone(&inner);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                let ctx = Context::new(stream, addr);
                                run_connection(inner, ctx, cancel).await;
                            });
                        }
                        Err(err) => {
                            log::error!("accept failed: {}", err);
                        }
                    }
                }
            }
        }
    }

    /// Client-initiated connection: dial `addr`, run the named start action,
    /// then enter the same read loop the server side uses.
    pub async fn dial(
        self,
        addr: &str,
        start_action: &str,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        let remote_addr = stream.peer_addr()?;

        let inner = Arc::new(self);
        let starter = inner
            .actions
            .get(start_action)
            .cloned()
            .ok_or_else(|| Error::UnknownAction(start_action.to_string()))?;

        let mut ctx = Context::new(stream, remote_addr);
        starter.call(&mut ctx).await?;

        run_connection(inner, ctx, cancel).await;
        Ok(())
    }
}

async fn run_connection(dispatcher: Arc<Dispatcher>, mut ctx: Context, cancel: CancellationToken) {
    let remote = ctx.remote_addr();
    loop {
        // A connection parked in a relay slot stops dispatching: every frame
        // it sends from here on belongs to its future peer, so the loop only
        // waits to surrender the socket to the forwarders.
        if let Some(claim) = ctx.claim_token() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = claim.cancelled() => ctx.surrender(),
            }
            return;
        }

        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            result = ctx.read_msg() => result,
        };

        match received {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => {
                log::debug!("connection from {} closed", remote);
                return;
            }
            Err(Error::Auth) => {
                // A frame that fails to open is never recoverable on this
                // socket: the peer holds a different key.
                log::debug!("dropping connection from {}: frame failed to open", remote);
                return;
            }
            Err(err) => {
                // The peer may recover from a transient framing hiccup with
                // the next frame.
                log::debug!("skipping unreadable message from {}: {}", remote, err);
                continue;
            }
        }

        if dispatch(&dispatcher, &mut ctx).await.is_err() {
            return;
        }

        if !ctx.has_conn() {
            // A handler moved the socket into a relay slot.
            return;
        }
    }
}

/// Dispatch the context's current message. Returns `Err` only when the
/// connection must close.
async fn dispatch(dispatcher: &Dispatcher, ctx: &mut Context) -> Result<(), ()> {
    let name = ctx.action().to_string();

    let Some(action) = dispatcher.actions.get(&name).cloned() else {
        let err = Error::UnknownAction(name);
        log::debug!("{}", err);
        return report(ctx, &err).await;
    };

    for middleware in dispatcher.middleware.iter().rev() {
        if let Err(err) = middleware.call(ctx).await {
            return report(ctx, &err).await;
        }
    }

    if let Err(err) = action.call(ctx).await {
        log::debug!("action {} returned error: {}", name, err);
        match err {
            // Auth failures close immediately and say nothing.
            Error::Auth => return Err(()),
            // Any failure inside the PAKE exchange is fatal once reported.
            _ if name == "pake" => {
                let _ = ctx.write_error(&err).await;
                return Err(());
            }
            _ => return report(ctx, &err).await,
        }
    }

    Ok(())
}

async fn report(ctx: &mut Context, err: &Error) -> Result<(), ()> {
    if let Err(write_err) = ctx.write_error(err).await {
        log::debug!("unable to write error to connection: {}", write_err);
        return Err(());
    }
    Ok(())
}
