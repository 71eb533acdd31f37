//! Listener object: accepts connections and announces them up the stack.

use crate::connection::Connection;
use crate::object::{Object, ObjectBehavior, Signal, WeakObject};
use omapi_types::{OmapiConfig, OmapiError, OmapiResult};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A listening socket layered over the object that wants its connections.
///
/// Each accepted connection is announced with [`Signal::Connect`], which
/// falls through to the inner object. Whatever handles it decides what to
/// layer on the new connection.
#[derive(Default)]
pub struct Listener {
    address: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Listen on the wildcard address at `port`, layered over `caller`.
    ///
    /// Fails if the socket cannot be bound or put into listening state; the
    /// half-built listener is then unlinked from `caller` and released.
    pub async fn listen(
        caller: &Object,
        port: u16,
        backlog: u32,
        config: &OmapiConfig,
    ) -> OmapiResult<Object> {
        let object = Object::create(Listener::default());
        Object::link(&object, caller)?;

        match bind(port, backlog) {
            Ok((socket, address)) => {
                let this = object
                    .downcast_ref::<Listener>()
                    .ok_or_else(|| OmapiError::InvalidArgument("not a listener".into()))?;
                *this.address.lock().unwrap_or_else(|e| e.into_inner()) = Some(address);
                info!("OMAPI: listening on {}", address);

                let task = tokio::spawn(accept_loop(socket, object.downgrade(), config.clone()));
                *this.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
                Ok(object)
            }
            Err(e) => {
                error!("OMAPI: cannot listen on port {}: {}", port, e);
                object.unlink_inner();
                Err(e.into())
            }
        }
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.address.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ObjectBehavior for Listener {
    fn type_name(&self) -> &'static str {
        "listener"
    }

    fn destroy(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!("OMAPI: listener on {:?} shutting down", self.local_addr());
            task.abort();
        }
    }
}

fn bind(port: u16, backlog: u32) -> std::io::Result<(TcpListener, SocketAddr)> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    let listener = socket.listen(backlog)?;
    let address = listener.local_addr()?;
    Ok((listener, address))
}

async fn accept_loop(socket: TcpListener, listener: WeakObject, config: OmapiConfig) {
    loop {
        match socket.accept().await {
            Ok((stream, addr)) => {
                debug!("OMAPI: accepted connection from {}", addr);
                // Hand off so the next accept is pending immediately.
                let listener = listener.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = on_accept(stream, &listener, &config) {
                        debug!("OMAPI: connection from {} dropped: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("OMAPI: accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn on_accept(stream: TcpStream, listener: &WeakObject, config: &OmapiConfig) -> OmapiResult<()> {
    let listener = listener.upgrade().ok_or(OmapiError::NotConnected)?;
    let connection = Connection::from_stream(stream, false, config)?;
    // On failure `connection` is the only reference and is torn down here.
    listener.signal(&Signal::Connect(&connection))?;
    Connection::start(&connection)
}
