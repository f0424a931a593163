// kube-endpoints - health-checked service endpoints for Kubernetes
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::anyhow;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, lookup_host};

pub struct BoundTcpSocket {
  socket: TcpSocket,
}

impl BoundTcpSocket {
  #[must_use]
  pub const fn new(socket: TcpSocket) -> Self {
    Self { socket }
  }

  pub fn listen(self) -> anyhow::Result<TcpListener> {
    Ok(self.socket.listen(1024)?)
  }

  pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
    Ok(self.socket.local_addr()?)
  }
}

// Resolves an admin listener address to a bound socket. Tests inject a resolver that binds port 0
// so that several servers can run side by side.
#[mockall::automock]
#[async_trait::async_trait]
pub trait BindResolver: Send + Sync {
  async fn resolve_tcp(&self, name: &str) -> anyhow::Result<BoundTcpSocket>;
}

pub struct RealBindResolver {}

#[async_trait::async_trait]
impl BindResolver for RealBindResolver {
  async fn resolve_tcp(&self, name: &str) -> anyhow::Result<BoundTcpSocket> {
    make_reuse_addr_tcp_socket(name).await
  }
}

pub async fn make_reuse_addr_tcp_socket(name: &str) -> anyhow::Result<BoundTcpSocket> {
  let mut last_err = None;
  for addr in lookup_host(name).await? {
    let socket = match addr {
      SocketAddr::V4(_) => TcpSocket::new_v4()?,
      SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Lets a restarted controller rebind its health port while the old socket is in TIME_WAIT.
    socket.set_reuseaddr(true)?;
    match socket.bind(addr) {
      Ok(()) => return Ok(BoundTcpSocket::new(socket)),
      Err(e) => last_err = Some(e.into()),
    }
  }

  Err(last_err.unwrap_or_else(|| anyhow!("could not resolve {name} to any address")))
}
