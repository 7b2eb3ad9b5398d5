use crate::prelude::*;
use std::collections::VecDeque;
use std::io::{Read, Write};

/// Lines a client may have waiting behind the one being handled.
const MAX_PENDING: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Inbound {
    Line(String),
    /// A line longer than the message limit. Its bytes were thrown away.
    TooLong,
}

/// Splits a byte stream into lines, dropping any line over `max` bytes.
#[derive(Debug)]
pub(super) struct LineBuffer {
    buf: Vec<u8>,
    max: usize,
    discarding: bool,
}
impl LineBuffer {
    pub(super) fn new(max: usize) -> Self {
        Self {
            buf: vec![],
            max,
            discarding: false,
        }
    }
    pub(super) fn push(&mut self, mut bytes: &[u8], out: &mut VecDeque<Inbound>) {
        while let Some(end) = bytes.iter().position(|&b| b == b'\n') {
            let (line, rest) = (&bytes[..end], &bytes[end + 1..]);
            if self.discarding {
                // already reported when it overflowed
                self.discarding = false;
            } else if self.buf.len() + line.len() > self.max {
                out.push_back(Inbound::TooLong);
            } else {
                self.buf.extend_from_slice(line);
                let text = String::from_utf8_lossy(&self.buf);
                let text = text.trim();
                if !text.is_empty() {
                    out.push_back(Inbound::Line(text.to_owned()));
                }
            }
            self.buf.clear();
            bytes = rest;
        }
        if self.discarding {
            return;
        }
        if self.buf.len() + bytes.len() > self.max {
            self.buf.clear();
            self.discarding = true;
            out.push_back(Inbound::TooLong);
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }
}

pub(super) struct Client {
    conn: TcpStream,
    pub(super) identity: String,
    lines: LineBuffer,
    pub(super) pending: VecDeque<Inbound>,
    /// A line from this client is being handled; the next one waits for its reply.
    pub(super) busy: bool,
    outgoing: Vec<u8>,
    written: usize,
}
impl Client {
    pub(super) fn accept(conn: TcpStream, identity: String, max_line: usize) -> io::Result<Self> {
        conn.set_nonblocking(true)?;
        conn.set_nodelay(true)?;
        Ok(Self {
            conn,
            identity,
            lines: LineBuffer::new(max_line),
            pending: VecDeque::new(),
            busy: false,
            outgoing: vec![],
            written: 0,
        })
    }
    pub(super) fn conn(&self) -> &TcpStream {
        &self.conn
    }
    pub(super) fn wants_write(&self) -> bool {
        self.written < self.outgoing.len()
    }
    pub(super) fn queue_reply(&mut self, line: &str) {
        self.outgoing.extend_from_slice(line.as_bytes());
        self.outgoing.push(b'\n');
    }

    /// Reads everything available. `Ok(false)` means the peer closed the connection.
    pub(super) fn read(&mut self, scratch: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.conn.read(scratch) {
                Ok(0) => return Ok(false),
                Ok(n) => self.lines.push(&scratch[..n], &mut self.pending),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            if self.pending.len() > MAX_PENDING {
                return Err(io::Error::new(io::ErrorKind::Other, "too many pending requests"));
            }
        }
    }

    /// Writes as much queued output as the socket takes.
    pub(super) fn flush(&mut self) -> io::Result<()> {
        while self.written < self.outgoing.len() {
            match self.conn.write(&self.outgoing[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.outgoing.clear();
        self.written = 0;
        Ok(())
    }
}
impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields = f.debug_struct("Client");
        fields.field("identity", &self.identity);
        if let Ok(addr) = self.conn.peer_addr() {
            fields.field("conn", &addr);
        }
        fields.field("pending", &self.pending.len());
        fields.field("busy", &self.busy);
        fields.finish()
    }
}
