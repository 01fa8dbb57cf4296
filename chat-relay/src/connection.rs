//! Non-blocking per-connection transport.
//!
//! A [`Transport`] never awaits. The relay polls readiness for every open
//! transport at once and then runs a non-blocking pass: [`Transport::read_available`]
//! drains the socket into the inbound buffer, [`Transport::next_frame`] peels
//! complete frames off it, and [`Transport::flush`] pushes queued output until
//! the kernel stops accepting bytes.

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use serde::Serialize;
use tokio::net::TcpStream;

use crate::codec::{self, FramingError, Message};
use crate::engine::Delivery;
use crate::protocol::{ChatMessage, Outbound};

const READ_CHUNK: usize = 4096;

/// Reads per pass before yielding to other connections.
const MAX_READS_PER_PASS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Open,
    /// The peer closed its side. Bytes read before the close stay buffered.
    Closed,
}

pub struct Transport {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: BytesMut,
    outbound: BytesMut,
    max_frame_len: usize,
}

impl Transport {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_frame_len: usize) -> Self {
        Self {
            stream,
            peer,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Resolves once the socket is readable, or writable while output is
    /// pending. Registers the task's waker otherwise.
    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.stream.poll_read_ready(cx).is_ready() {
            return Poll::Ready(());
        }
        if !self.outbound.is_empty() && self.stream.poll_write_ready(cx).is_ready() {
            return Poll::Ready(());
        }
        Poll::Pending
    }

    pub fn read_available(&mut self) -> io::Result<ReadStatus> {
        for _ in 0..MAX_READS_PER_PASS {
            self.inbound.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.inbound) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(ReadStatus::Open)
    }

    /// Next complete frame from the inbound buffer, if any.
    pub fn next_frame(&mut self) -> Option<Result<Message, FramingError>> {
        match codec::decode(&mut self.inbound, self.max_frame_len) {
            Err(err) if err.is_incomplete() => None,
            decoded => Some(decoded),
        }
    }

    /// Appends one frame to the outbox. Frames longer than the transport's
    /// frame limit are refused and nothing is queued.
    pub fn queue<T: Serialize + ?Sized>(&mut self, frame: &T) -> Result<(), FramingError> {
        let bytes = codec::encode_within(frame, self.max_frame_len)?;
        self.outbound.extend_from_slice(&bytes);
        Ok(())
    }

    /// Writes queued output until it is gone or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.outbound.advance(written),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Attempts one chat delivery.
    ///
    /// The transport is write-ready when earlier output has drained and the
    /// socket accepts at least part of the new frame. Any unwritten tail is
    /// kept and completed by later flushes.
    pub fn try_deliver(&mut self, message: &ChatMessage) -> Delivery {
        if self.flush().is_err() || !self.outbound.is_empty() {
            return Delivery::NotReady;
        }

        let frame = match codec::encode_within(&Outbound::from(message.clone()), self.max_frame_len) {
            Ok(frame) => frame,
            Err(_) => return Delivery::NotReady,
        };

        loop {
            match self.stream.try_write(&frame) {
                Ok(0) => return Delivery::NotReady,
                Ok(written) => {
                    self.outbound.extend_from_slice(&frame[written..]);
                    return Delivery::Sent;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Delivery::NotReady,
            }
        }
    }
}
