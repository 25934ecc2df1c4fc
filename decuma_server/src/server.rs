//! A single-threaded, manual-poll TCP server. No `mio`/`epoll`: each tick
//! scans every connected client in a freshly shuffled order (matching the
//! fairness policy of randomizing which ready sockets get serviced first),
//! probes it non-blockingly for data, and — once a request frame starts
//! arriving — switches that one socket to blocking mode just long enough
//! to read the whole frame and write the response.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::protocol;
use decuma_core::{Database, Dispatcher};
use rand::seq::SliceRandom;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Server {
    listener: TcpListener,
    clients: Vec<TcpStream>,
    dispatcher: Dispatcher,
    config: ServerConfig,
}

impl Server {
    pub fn bind(config: ServerConfig) -> ServerResult<Self> {
        let db = Database::open(&config.engine)?;
        let listener = TcpListener::bind(config.listen_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Server {
            listener,
            clients: Vec::new(),
            dispatcher: Dispatcher::new(db),
            config,
        })
    }

    /// Run until a client issues a `Shutdown` request.
    pub fn run(&mut self) -> ServerResult<()> {
        info!(addr = %self.config.listen_addr, "decuma_server listening");
        loop {
            let did_work = self.tick()?;
            if self.dispatcher.is_shutting_down() {
                info!("shutdown requested, stopping server loop");
                return Ok(());
            }
            if !did_work {
                self.dispatcher
                    .database_mut()
                    .commit(self.config.idle_commit_batch)?;
                thread::sleep(Duration::from_millis(self.config.patience_millis));
            }
        }
    }

    fn tick(&mut self) -> ServerResult<bool> {
        let mut did_work = self.accept_new_clients()?;

        let mut order: Vec<usize> = (0..self.clients.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut closed = Vec::new();
        for idx in order {
            match self.service_client(idx) {
                Ok(true) => did_work = true,
                Ok(false) => {}
                Err(ServerError::ConnectionClosed { peer }) => {
                    debug!(%peer, "client disconnected");
                    closed.push(idx);
                }
                Err(e) => {
                    warn!(error = %e, "client error, dropping connection");
                    closed.push(idx);
                }
            }
        }

        closed.sort_unstable_by(|a, b| b.cmp(a));
        for idx in closed {
            self.clients.swap_remove(idx);
        }
        Ok(did_work)
    }

    fn accept_new_clients(&mut self) -> ServerResult<bool> {
        let mut accepted = false;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.clients.len() >= self.config.max_clients {
                        debug!(%addr, "rejecting connection: at capacity");
                        drop(stream);
                        continue;
                    }
                    stream.set_nonblocking(true)?;
                    info!(%addr, "client connected");
                    self.clients.push(stream);
                    accepted = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(accepted)
    }

    /// Returns `Ok(true)` if a request was fully handled, `Ok(false)` if
    /// the client had nothing to say this tick.
    fn service_client(&mut self, idx: usize) -> ServerResult<bool> {
        let peer = self.clients[idx]
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let mut probe = [0u8; 1];
        match self.clients[idx].peek(&mut probe) {
            Ok(0) => {
                return Err(ServerError::ConnectionClosed { peer });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        self.clients[idx].set_nonblocking(false)?;
        let outcome = (|| -> ServerResult<()> {
            let request = protocol::read_request(&mut self.clients[idx], &peer)?;
            let response = self.dispatcher.handle(request);
            protocol::write_response(&mut self.clients[idx], &response)
        })();
        self.clients[idx].set_nonblocking(true)?;
        outcome?;
        Ok(true)
    }
}
