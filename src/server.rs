//! TCP server for chat connections.
//!
//! Binds every configured port, accepts connections, and hands each one
//! to its own task bound to the single shared room.

use crate::config::Config;
use crate::connection::{Connection, ConnectionId, SessionOptions};
use crate::room::Room;
use slab::Slab;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Listen backlog for each socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Upper bound on registry slots allocated up front.
const INITIAL_CAPACITY: usize = 1024;

/// Server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}': {1}")]
    Address(String, #[source] io::Error),
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),
}

/// A live connection as tracked by the registry.
struct LiveConnection {
    peer: SocketAddr,
    task: Option<AbortHandle>,
}

/// Registry of live connections using slab allocation.
///
/// Slab keys double as connection ids. A key is only reused after the
/// previous holder has left the room.
struct ConnectionRegistry {
    connections: Slab<LiveConnection>,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    fn new(max_connections: Option<usize>) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.unwrap_or(0).min(INITIAL_CAPACITY)),
            max_connections,
        }
    }

    /// Reserve an id for a new connection.
    ///
    /// Returns `None` if the registry is at capacity.
    fn insert(&mut self, peer: SocketAddr) -> Option<ConnectionId> {
        if let Some(max) = self.max_connections {
            if self.connections.len() >= max {
                return None;
            }
        }
        Some(self.connections.insert(LiveConnection { peer, task: None }))
    }

    /// Attach the running task so it can be aborted on shutdown.
    fn attach(&mut self, id: ConnectionId, task: AbortHandle) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.task = Some(task);
        }
    }

    fn remove(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.try_remove(id).map(|conn| conn.peer)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.connections.len()
    }

    /// Abort every live connection task.
    fn abort_all(&mut self) -> usize {
        let count = self.connections.len();
        for (_, conn) in self.connections.iter() {
            if let Some(task) = &conn.task {
                task.abort();
            }
        }
        self.connections.clear();
        count
    }
}

/// Server instance
pub struct Server {
    config: Config,
    room: Room,
    options: SessionOptions,
    registry: Arc<Mutex<ConnectionRegistry>>,
}

impl Server {
    /// Create a new server instance. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Self {
        let options = SessionOptions {
            codec: config.codec.into(),
            relay_unknown: config.relay_unknown,
        };
        let registry = ConnectionRegistry::new(config.max_connections);

        Server {
            config,
            room: Room::spawn(),
            options,
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    /// Bind `listeners_per_port` sockets on every configured port.
    pub fn bind(&self) -> Result<Vec<TcpListener>, ServerError> {
        let mut listeners = Vec::new();

        for &port in &self.config.ports {
            let target = format!("{}:{}", self.config.host, port);
            let addr = target
                .to_socket_addrs()
                .map_err(|e| ServerError::Address(target.clone(), e))?
                .next()
                .ok_or_else(|| {
                    ServerError::Address(
                        target.clone(),
                        io::Error::new(io::ErrorKind::InvalidInput, "no addresses resolved"),
                    )
                })?;

            for _ in 0..self.config.listeners_per_port {
                let listener = create_listener_with_reuseport(addr)
                    .and_then(TcpListener::from_std)
                    .map_err(|e| ServerError::Bind(addr, e))?;
                info!(address = %listener.local_addr().unwrap_or(addr), "Server listening");
                listeners.push(listener);
            }
        }

        Ok(listeners)
    }

    /// Bind and serve until Ctrl-C.
    pub async fn run(self) -> Result<(), ServerError> {
        let listeners = self.bind()?;
        self.serve(listeners, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;
        Ok(())
    }

    /// Run one accept loop per listener until `shutdown` resolves, then
    /// close every live connection.
    pub async fn serve(&self, listeners: Vec<TcpListener>, shutdown: impl Future<Output = ()>) {
        let mut accept_loops = JoinSet::new();
        for listener in listeners {
            accept_loops.spawn(accept_loop(
                listener,
                self.room.clone(),
                self.options,
                Arc::clone(&self.registry),
            ));
        }

        shutdown.await;
        info!("Shutting down");
        accept_loops.shutdown().await;

        let closed = lock(&self.registry).abort_all();
        match self.room.stats().await {
            Some(stats) => info!(
                closed,
                members = stats.members,
                history = stats.history,
                delivered = stats.delivered,
                "Server stopped"
            ),
            None => info!(closed, "Server stopped"),
        }
    }

    /// Number of live connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

fn lock(registry: &Mutex<ConnectionRegistry>) -> std::sync::MutexGuard<'_, ConnectionRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accept connections forever. Accept errors are logged and retried.
async fn accept_loop(
    listener: TcpListener,
    room: Room,
    options: SessionOptions,
    registry: Arc<Mutex<ConnectionRegistry>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => spawn_connection(stream, peer, &room, options, &registry),
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    room: &Room,
    options: SessionOptions,
    registry: &Arc<Mutex<ConnectionRegistry>>,
) {
    let mut guard = lock(registry);
    let Some(id) = guard.insert(peer) else {
        warn!(peer = %peer, "Connection limit reached, rejecting connection");
        return;
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    debug!(conn_id = id, peer = %peer, "New connection");

    let connection = Connection::new(id, stream, room.clone(), options);
    let task_registry = Arc::clone(registry);
    let task = tokio::spawn(async move {
        if let Err(e) = connection.run().await {
            debug!(conn_id = id, error = %e, "Connection error");
        }
        lock(&task_registry).remove(id);
        debug!(conn_id = id, peer = %peer, "Connection closed");
    });
    guard.attach(id, task.abort_handle());
}

fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, Payload};
    use crate::config::CodecType;
    use crate::connection::FrameReader;
    use crate::frame::{MessageFrame, MessageType};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            ports: vec![0],
            listeners_per_port: 1,
            workers: None,
            max_connections: None,
            codec: CodecType::Raw,
            relay_unknown: false,
            log_level: "info".to_string(),
        }
    }

    async fn start(config: Config) -> (Arc<Server>, Vec<SocketAddr>, oneshot::Sender<()>) {
        let server = Arc::new(Server::new(config));
        let listeners = server.bind().unwrap();
        let addrs = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving
                .serve(listeners, async {
                    let _ = stopped.await;
                })
                .await;
        });
        (server, addrs, stop)
    }

    async fn send(stream: &mut TcpStream, payload: Payload) {
        let frame = Codec::Raw.encode_frame(&payload).unwrap();
        stream.write_all(&frame.to_bytes()).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Option<MessageFrame> {
        FrameReader::new(stream).next_frame().await.unwrap()
    }

    async fn wait_for_connections(server: &Server, count: usize) {
        for _ in 0..100 {
            if server.connection_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} connections, have {}", server.connection_count());
    }

    #[test]
    fn test_registry_capacity() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut registry = ConnectionRegistry::new(Some(2));

        let id1 = registry.insert(peer).unwrap();
        let _id2 = registry.insert(peer).unwrap();
        assert!(registry.insert(peer).is_none());

        assert_eq!(registry.remove(id1), Some(peer));
        assert_eq!(registry.remove(id1), None);
        assert_eq!(registry.len(), 1);
        assert!(registry.insert(peer).is_some());
    }

    #[test]
    fn test_registry_unbounded() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut registry = ConnectionRegistry::new(None);
        for _ in 0..1000 {
            assert!(registry.insert(peer).is_some());
        }
        assert_eq!(registry.abort_all(), 1000);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_registry_huge_cap() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut registry = ConnectionRegistry::new(Some(usize::MAX / 2));
        for _ in 0..2000 {
            assert!(registry.insert(peer).is_some());
        }
        assert_eq!(registry.len(), 2000);
    }

    #[tokio::test]
    async fn test_chat_over_tcp() {
        let (server, addrs, stop) = start(test_config()).await;

        let mut alice = TcpStream::connect(addrs[0]).await.unwrap();
        let mut bob = TcpStream::connect(addrs[0]).await.unwrap();
        wait_for_connections(&server, 2).await;

        send(&mut alice, Payload::BindName { name: "alice".into() }).await;
        send(&mut alice, Payload::ChatInfo { text: "hello".into() }).await;

        for stream in [&mut alice, &mut bob] {
            let frame = recv(stream).await.unwrap();
            assert_eq!(frame.message_type(), Some(MessageType::RoomInfo));
            assert_eq!(
                Codec::Raw.decode(MessageType::RoomInfo, frame.body()).unwrap(),
                Payload::RoomInfo {
                    name: "alice".into(),
                    text: "hello".into()
                }
            );
        }

        drop(bob);
        wait_for_connections(&server, 1).await;
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_all_ports_share_one_room() {
        let mut config = test_config();
        config.ports = vec![0, 0];
        let (server, addrs, stop) = start(config).await;
        assert_eq!(addrs.len(), 2);

        let mut first = TcpStream::connect(addrs[0]).await.unwrap();
        let mut second = TcpStream::connect(addrs[1]).await.unwrap();
        wait_for_connections(&server, 2).await;

        send(&mut second, Payload::ChatInfo { text: "across".into() }).await;
        assert!(recv(&mut first).await.is_some());
        assert!(recv(&mut second).await.is_some());

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config();
        config.max_connections = Some(1);
        let (server, addrs, stop) = start(config).await;

        let _kept = TcpStream::connect(addrs[0]).await.unwrap();
        wait_for_connections(&server, 1).await;

        let mut rejected = TcpStream::connect(addrs[0]).await.unwrap();
        assert!(recv(&mut rejected).await.is_none());
        assert_eq!(server.connection_count(), 1);

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, addrs, stop) = start(test_config()).await;
        let mut client = TcpStream::connect(addrs[0]).await.unwrap();
        wait_for_connections(&server, 1).await;

        stop.send(()).unwrap();
        assert!(recv(&mut client).await.is_none());
        wait_for_connections(&server, 0).await;
    }
}
