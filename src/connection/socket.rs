use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use rand::seq::SliceRandom;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use crate::address::Endpoint;
use crate::config::{ConnectionConfig, PortReuseMode};
use crate::error::{TransportError, TransportErrorKind};

/// Local ports that were bound successfully before, to be tried again for new connections
pub struct LocalPortPool {
    ports: Mutex<Vec<u16>>,
    max_ports: usize,
}

impl LocalPortPool {
    pub fn new(max_ports: usize) -> LocalPortPool {
        LocalPortPool {
            ports: Mutex::new(Vec::new()),
            max_ports,
        }
    }

    /// up to `count` pooled ports in random order
    pub fn candidates(&self, count: usize) -> Vec<u16> {
        let mut result = self.ports.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        result.shuffle(&mut rand::thread_rng());
        result.truncate(count);
        result
    }

    pub fn on_bound(&self, port: u16) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        if ports.len() < self.max_ports && !ports.contains(&port) {
            trace!("adding local port {} to the pool", port);
            ports.push(port);
        }
    }

    pub fn evict(&self, port: u16) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.retain(|p| *p != port);
    }

    pub fn len(&self) -> usize {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves the endpoint and opens a TCP connection to it, with keep-alive enabled
pub async fn connect(endpoint: &Endpoint, config: &ConnectionConfig, port_pool: &LocalPortPool) -> Result<TcpStream, TransportError> {
    let addr = lookup_host((endpoint.host(), endpoint.port())).await
        .map_err(|e| TransportError::new(TransportErrorKind::DnsResolutionFailed, e.to_string()))?
        .next()
        .ok_or_else(|| TransportError::new(TransportErrorKind::DnsResolutionFailed, format!("no address for {}", endpoint)))?;

    let stream = match timeout(config.connect_timeout, connect_addr(addr, config.port_reuse_mode, port_pool, config.port_candidate_count)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TransportError::new(TransportErrorKind::ConnectFailed, format!("connecting to {}: {}", addr, e))),
        Err(_) => return Err(TransportError::new(TransportErrorKind::ConnectTimeout, format!("connecting to {} took longer than {:?}", addr, config.connect_timeout))),
    };

    configure_keepalive(&stream, config.keepalive_time, config.keepalive_interval);
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to disable Nagle's algorithm for {}: {}", addr, e);
    }
    Ok(stream)
}

async fn connect_addr(addr: SocketAddr, mode: PortReuseMode, port_pool: &LocalPortPool, candidate_count: usize) -> io::Result<TcpStream> {
    if mode == PortReuseMode::PrivatePortPool {
        for port in port_pool.candidates(candidate_count) {
            let socket = match bind_socket(addr, port) {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("local port {} can not be bound any more, evicting it from the pool: {}", port, e);
                    port_pool.evict(port);
                    continue;
                }
            };

            match socket.connect(addr).await {
                Ok(stream) => {
                    trace!("connected to {} from pooled local port {}", addr, port);
                    return Ok(stream);
                }
                Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable) => {
                    debug!("local port {} is in use for {}, trying the next one", port, addr);
                }
                Err(e) => return Err(e),
            }
        }
    }

    let stream = bind_socket(addr, 0)?.connect(addr).await?;
    if mode == PortReuseMode::PrivatePortPool {
        if let Ok(local) = stream.local_addr() {
            port_pool.on_bound(local.port());
        }
    }
    Ok(stream)
}

fn bind_socket(addr: SocketAddr, local_port: u16) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    }
    else {
        TcpSocket::new_v6()?
    };

    if local_port != 0 {
        socket.set_reuseaddr(true)?;
        let local_ip = if addr.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        }
        else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        socket.bind(SocketAddr::new(local_ip, local_port))?;
    }
    Ok(socket)
}

/// Platforms differ in which keep-alive parameters they support, so failure is logged rather
///  than propagated.
pub fn configure_keepalive(stream: &TcpStream, time: Duration, interval: Duration) {
    let keepalive = TcpKeepalive::new()
        .with_time(time)
        .with_interval(interval);

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("failed to configure TCP keep-alive (time {:?}, interval {:?}): {}", time, interval, e);
    }
}
