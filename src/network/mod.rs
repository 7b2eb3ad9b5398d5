//! Line-oriented TCP transport.
//!
//! One thread owns every socket and drives them off a poller. Complete lines are handed
//! to the async runtime, one at a time per client so replies keep request order, and the
//! replies come back through a channel that wakes the poller.

use crate::prelude::*;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc;

use polling::{Event, Poller};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Envelope, ErrorCode};

mod client;

use client::{Client, Inbound};

const LISTENER: usize = usize::MAX - 1;

#[derive(Debug)]
struct Completion {
    key: Key,
    reply: String,
}

/// Wakes a [`Network`] blocked in its poll loop, e.g. so it notices a stop request.
#[derive(Debug, Clone)]
pub struct Waker(Arc<Poller>);
impl Waker {
    pub fn wake(&self) {
        if let Err(e) = self.0.notify() {
            log::warn!("failed to wake the network thread: {e}");
        }
    }
}

pub struct Network {
    listener: TcpListener,
    scratch_buffer: Vec<u8>,

    poller: Arc<Poller>,
    events: Vec<Event>,

    clients: SlotMap<Client>,
    next_serial: u64,
    max_line: usize,
    too_long_reply: String,

    dispatcher: Arc<Dispatcher>,
    runtime: Handle,
    completed_tx: mpsc::Sender<Completion>,
    completed: mpsc::Receiver<Completion>,
}

impl Network {
    pub fn bind(
        config: &ServerConfig,
        dispatcher: Arc<Dispatcher>,
        runtime: Handle,
    ) -> io::Result<Self> {
        let poller = Poller::new()?;
        let listener = TcpListener::bind(&config.bind)?;
        listener.set_nonblocking(true)?;
        poller.add(&listener, Event::readable(LISTENER))?;
        let (completed_tx, completed) = mpsc::channel();
        let max_line = config.max_message_bytes;
        Ok(Self {
            listener,
            scratch_buffer: vec![0; 64 * 1024],

            poller: Arc::new(poller),
            events: vec![],

            clients: SlotMap::new(),
            next_serial: 0,
            max_line,
            too_long_reply: Envelope::error(
                "unknown",
                ErrorCode::InvalidParameters,
                format!("message exceeds {max_line} bytes"),
            )
            .to_line(),

            dispatcher,
            runtime,
            completed_tx,
            completed,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn waker(&self) -> Waker {
        Waker(Arc::clone(&self.poller))
    }

    pub fn connections(&self) -> usize {
        self.clients.len()
    }

    /// Serves clients until `stop` is cancelled. Wake the loop after cancelling.
    pub fn run(&mut self, stop: &CancellationToken) -> io::Result<()> {
        log::info!("listening on {}", self.listener.local_addr()?);
        while !stop.is_cancelled() {
            match self.poller.wait(&mut self.events, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            while let Some(event) = self.events.pop() {
                if event.key == LISTENER {
                    self.poller.modify(&self.listener, Event::readable(LISTENER))?;
                    self.accept_clients();
                    continue;
                }
                // events for slots released earlier in this batch are stale
                let Some(key) = self.clients.key_at(event.key) else { continue };
                if event.readable && !self.read_from(key) {
                    continue;
                }
                self.dispatch_next(key);
                self.flush_and_rearm(key);
            }
            self.drain_completions();
        }
        for key in self.clients.keys() {
            self.disconnect(key, "server shutting down");
        }
        log::info!("network stopped");
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("failed to accept a connection: {e}");
                    break;
                }
                Ok((conn, addr)) => {
                    self.next_serial += 1;
                    let identity = format!("conn_{}", self.next_serial);
                    let client = match Client::accept(conn, identity.clone(), self.max_line) {
                        Ok(client) => client,
                        Err(e) => {
                            log::warn!("failed to set up connection from {addr}: {e}");
                            continue;
                        }
                    };
                    let key = self.clients.insert(client);
                    let Some(client) = self.clients.get(key) else { continue };
                    if let Err(e) = self.poller.add(client.conn(), Event::readable(key.index())) {
                        log::warn!("failed to watch connection from {addr}: {e}");
                        self.clients.release(key);
                        continue;
                    }
                    client.queue_reply(&self.dispatcher.welcome(&identity));
                    log::info!("{identity} connected from {addr}");
                    self.flush_and_rearm(key);
                }
            }
        }
    }

    /// Returns false if the client went away.
    fn read_from(&mut self, key: Key) -> bool {
        let Some(client) = self.clients.get(key) else { return false };
        match client.read(&mut self.scratch_buffer) {
            Ok(true) => true,
            Ok(false) => {
                self.disconnect(key, "closed by peer");
                false
            }
            Err(e) => {
                self.disconnect(key, &e.to_string());
                false
            }
        }
    }

    fn dispatch_next(&mut self, key: Key) {
        let Some(client) = self.clients.get(key) else { return };
        while !client.busy {
            match client.pending.pop_front() {
                None => return,
                Some(Inbound::TooLong) => {
                    log::debug!("{} sent an oversized message", client.identity);
                    client.queue_reply(&self.too_long_reply);
                }
                Some(Inbound::Line(line)) => {
                    client.busy = true;
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let identity = client.identity.clone();
                    let completed = self.completed_tx.clone();
                    let waker = Waker(Arc::clone(&self.poller));
                    self.runtime.spawn(async move {
                        let reply = dispatcher.handle(&line, &identity).await;
                        // the network may already be gone during shutdown
                        if completed.send(Completion { key, reply }).is_ok() {
                            waker.wake();
                        }
                    });
                }
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(Completion { key, reply }) = self.completed.try_recv() {
            let Some(client) = self.clients.get(key) else {
                log::trace!("dropping reply for closed connection {key}");
                continue;
            };
            client.busy = false;
            client.queue_reply(&reply);
            self.dispatch_next(key);
            self.flush_and_rearm(key);
        }
    }

    fn flush_and_rearm(&mut self, key: Key) {
        let Some(client) = self.clients.get(key) else { return };
        let result = client.flush().and_then(|()| {
            self.poller.modify(
                client.conn(),
                Event {
                    key: key.index(),
                    readable: true,
                    writable: client.wants_write(),
                },
            )
        });
        if let Err(e) = result {
            self.disconnect(key, &e.to_string());
        }
    }

    fn disconnect(&mut self, key: Key, reason: &str) {
        if let Some(client) = self.clients.release(key) {
            if let Err(e) = self.poller.delete(client.conn()) {
                log::debug!("failed to unwatch {}: {e}", client.identity);
            }
            log::info!("{} disconnected: {reason}", client.identity);
        }
    }
}
