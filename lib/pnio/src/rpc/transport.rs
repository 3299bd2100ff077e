//! UDP transport for the RPC services. One socket serves both directions:
//! controller-initiated transactions (request out, response matched by
//! activity UUID and sequence) and device-initiated indications such as
//! ApplicationReady.

use crate::error::RpcError;
use crate::rpc::{RpcHeader, PTYPE_FAULT, PTYPE_REQUEST, PTYPE_RESPONSE};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use penstock::logging::{self, Logger};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Room for the largest advertised response plus its envelope.
const RECV_BUF_LEN: usize = 32 * 1024;

/// Request/response exchange with an explicit deadline. The engine drives
/// everything through this seam so sessions can be scripted in tests.
pub trait RpcChannel {
    fn transact(
        &mut self,
        dst: SocketAddr,
        request: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, RpcError>;
}

pub struct RpcTransport {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    sequence: u32,
    buf: Vec<u8>,
    log: Logger,
}

impl RpcTransport {
    const TOKEN: Token = Token(0);

    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        addr: SocketAddr,
        log: L,
    ) -> Result<RpcTransport, RpcError> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let mut socket = UdpSocket::bind(addr).map_err(io_send)?;
        let poll = Poll::new().map_err(io_send)?;

        poll.registry()
            .register(&mut socket, Self::TOKEN, Interest::READABLE)
            .map_err(io_send)?;

        logging::debug!(log, "rpc transport bound"; "context" => "bind", "addr" => %addr);

        Ok(RpcTransport {
            socket,
            poll,
            events: Events::with_capacity(16),
            sequence: 0,
            buf: vec![0u8; RECV_BUF_LEN],
            log,
        })
    }

    /// Monotonic RPC sequence numbers for this controller.
    pub fn next_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    /// Sends a prebuilt response datagram (ApplicationReady handshake).
    pub fn send_response(&mut self, dst: SocketAddr, bytes: &[u8]) -> Result<(), RpcError> {
        self.socket.send_to(bytes, dst).map_err(io_send)?;
        Ok(())
    }

    /// Waits up to `timeout` for a device-initiated request. Stale
    /// responses arriving in the window are discarded.
    pub fn poll_indication(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(SocketAddr, Vec<u8>)>, RpcError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Ok(None),
            };

            self.poll_once(remaining)?;

            while let Some((len, peer)) = self.recv_one()? {
                let bytes = &self.buf[..len];

                match RpcHeader::read_from(bytes, 0) {
                    Ok((header, _)) if header.ptype == PTYPE_REQUEST => {
                        return Ok(Some((peer, bytes.to_vec())));
                    }
                    Ok(_) => {
                        logging::trace!(self.log, "discarding stale datagram";
                                        "context" => "poll_indication",
                                        "peer" => %peer);
                    }
                    Err(_) => {
                        logging::debug!(self.log, "discarding unparseable datagram";
                                        "context" => "poll_indication",
                                        "peer" => %peer,
                                        "len" => len);
                    }
                }
            }
        }
    }

    fn poll_once(&mut self, timeout: Duration) -> Result<(), RpcError> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(io_send(err)),
        }
    }

    fn recv_one(&mut self) -> Result<Option<(usize, SocketAddr)>, RpcError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, peer)) => Ok(Some((len, peer))),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(io_send(err)),
        }
    }
}

impl RpcChannel for RpcTransport {
    /// Sends the request and waits for the matching response: same activity
    /// UUID, same sequence number, response or fault packet type. Anything
    /// else inside the window is logged and dropped.
    fn transact(
        &mut self,
        dst: SocketAddr,
        request: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let (request_header, _) = RpcHeader::read_from(request, 0)?;

        self.socket.send_to(request, dst).map_err(io_send)?;

        logging::trace!(self.log, "request sent";
                        "context" => "transact",
                        "dst" => %dst,
                        "sequence" => request_header.sequence,
                        "opnum" => request_header.opnum,
                        "len" => request.len());

        let until = Instant::now() + deadline;

        loop {
            let remaining = match until.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => {
                    logging::debug!(self.log, "transaction deadline expired";
                                    "context" => "transact",
                                    "dst" => %dst,
                                    "sequence" => request_header.sequence);
                    return Err(RpcError::TransportTimeout);
                }
            };

            self.poll_once(remaining)?;

            while let Some((len, peer)) = self.recv_one()? {
                let bytes = &self.buf[..len];

                let header = match RpcHeader::read_from(bytes, 0) {
                    Ok((header, _)) => header,
                    Err(_) => {
                        logging::debug!(self.log, "discarding unparseable datagram";
                                        "context" => "transact",
                                        "peer" => %peer,
                                        "len" => len);
                        continue;
                    }
                };

                let matches = (header.ptype == PTYPE_RESPONSE || header.ptype == PTYPE_FAULT)
                    && header.activity == request_header.activity
                    && header.sequence == request_header.sequence;

                if matches {
                    return Ok(bytes.to_vec());
                }

                logging::trace!(self.log, "ignoring unmatched datagram";
                                "context" => "transact",
                                "peer" => %peer,
                                "ptype" => header.ptype,
                                "sequence" => header.sequence);
            }
        }
    }
}

fn io_send(err: io::Error) -> RpcError {
    RpcError::SendFailed(err.kind())
}
