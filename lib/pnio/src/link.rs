//! Raw-Ethernet access. One `Link` instance owns the interface; the
//! dispatcher owns the receive side and fans frames out to per-AR mailboxes
//! keyed by FrameID. ARs never touch the socket directly. Sends go through
//! a mutex-guarded shared handle.

use crate::codec::{self, EthernetHeader, Mac, ETHERTYPE_PROFINET};
use crate::error::LinkError;
use hashbrown::HashMap;
use penstock::logging::{self, Logger};
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// DCP frame identifiers.
const FRAME_ID_DCP_LOW: u16 = 0xFEFC;
const FRAME_ID_DCP_HIGH: u16 = 0xFEFF;

/// RTA alarm frame identifiers (high and low priority).
const FRAME_ID_ALARM_LOW: u16 = 0xFC00;
const FRAME_ID_ALARM_HIGH: u16 = 0xFE7F;

/// A raw Ethernet endpoint. `recv` returns `Ok(None)` when the read timeout
/// elapses without a frame.
pub trait Link: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
    fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError>;
}

/// Production backend over `pnet`'s datalink channel.
pub struct PnetLink {
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
}

impl PnetLink {
    pub fn open(interface_name: &str, read_timeout: Duration) -> Result<PnetLink, LinkError> {
        let interface_names_match = |iface: &NetworkInterface| iface.name == interface_name;

        let interface = datalink::interfaces()
            .into_iter()
            .find(interface_names_match)
            .ok_or_else(|| LinkError::InterfaceNotFound(interface_name.to_string()))?;

        let config = datalink::Config {
            read_timeout: Some(read_timeout),
            ..Default::default()
        };

        match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => Ok(PnetLink { tx, rx }),
            Ok(_) => Err(LinkError::UnhandledInterfaceType),
            Err(err) => Err(LinkError::Io(err)),
        }
    }

    /// The interface MAC, used as the source address of every frame we
    /// build.
    pub fn interface_mac(interface_name: &str) -> Result<Mac, LinkError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| LinkError::InterfaceNotFound(interface_name.to_string()))?;

        let mac = interface
            .mac
            .ok_or(LinkError::UnhandledInterfaceType)?;

        Ok(Mac([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]))
    }
}

impl Link for PnetLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        match self.tx.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => Err(LinkError::Io(err)),
            None => Err(LinkError::Closed),
        }
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        match self.rx.next() {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(ref err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(err) => Err(LinkError::Io(err)),
        }
    }
}

/// In-memory double for tests: frames pushed to `inbound` come back from
/// `recv`, sent frames accumulate in `sent`.
#[derive(Default)]
pub struct MemoryLink {
    pub inbound: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
}

impl MemoryLink {
    pub fn new() -> MemoryLink {
        MemoryLink {
            inbound: VecDeque::new(),
            sent: Vec::new(),
        }
    }
}

impl Link for MemoryLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        Ok(self.inbound.pop_front())
    }
}

/// Mutex-guarded shared access to the send half of the link.
#[derive(Clone)]
pub struct LinkSender {
    inner: Arc<Mutex<Box<dyn Link>>>,
}

impl LinkSender {
    pub fn new(link: Box<dyn Link>) -> LinkSender {
        LinkSender {
            inner: Arc::new(Mutex::new(link)),
        }
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        self.inner.lock().expect("link lock poisoned").send(frame)
    }

    /// Receives under the same lock; only the dispatcher task calls this.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, LinkError> {
        self.inner.lock().expect("link lock poisoned").recv()
    }
}

/// An alarm frame surfaced to the AR layer.
#[derive(Debug, Clone)]
pub struct AlarmFrame {
    pub frame_id: u16,
    pub src: Mac,
    pub data: Vec<u8>,
}

/// Routes received PROFINET frames by FrameID: registered cyclic mailboxes
/// first, then the DCP range, then the RTA alarm range. Everything else is
/// counted and dropped.
pub struct FrameDispatcher {
    cyclic: HashMap<u16, SyncSender<Vec<u8>>>,
    dcp: Option<Sender<Vec<u8>>>,
    alarm: Option<Sender<AlarmFrame>>,
    dropped: u64,
    unroutable: u64,
    log: Logger,
}

impl FrameDispatcher {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> FrameDispatcher {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        FrameDispatcher {
            cyclic: HashMap::new(),
            dcp: None,
            alarm: None,
            dropped: 0,
            unroutable: 0,
            log,
        }
    }

    pub fn set_dcp(&mut self, sender: Sender<Vec<u8>>) {
        self.dcp = Some(sender);
    }

    pub fn set_alarm(&mut self, sender: Sender<AlarmFrame>) {
        self.alarm = Some(sender);
    }

    /// Registers the mailbox for a cyclic FrameID.
    pub fn register_cyclic(&mut self, frame_id: u16, sender: SyncSender<Vec<u8>>) {
        logging::debug!(self.log, "cyclic mailbox registered";
                        "context" => "register",
                        "frame_id" => frame_id);
        self.cyclic.insert(frame_id, sender);
    }

    pub fn unregister_cyclic(&mut self, frame_id: u16) {
        self.cyclic.remove(&frame_id);
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[inline]
    pub fn unroutable(&self) -> u64 {
        self.unroutable
    }

    /// Routes one received frame. Non-PROFINET traffic is ignored
    /// silently; a full mailbox drops the frame and counts it.
    pub fn route(&mut self, frame: &[u8]) {
        let (eth, header_len) = match EthernetHeader::read_from(frame) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        if eth.ethertype != ETHERTYPE_PROFINET {
            return;
        }

        let frame_id = match codec::get_u16(frame, header_len) {
            Ok(frame_id) => frame_id,
            Err(_) => return,
        };

        if let Some(mailbox) = self.cyclic.get(&frame_id) {
            match mailbox.try_send(frame.to_vec()) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    logging::debug!(self.log, "cyclic mailbox full, frame dropped";
                                    "context" => "route",
                                    "frame_id" => frame_id,
                                    "dropped" => self.dropped);
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.cyclic.remove(&frame_id);
                }
            }
            return;
        }

        if (FRAME_ID_DCP_LOW..=FRAME_ID_DCP_HIGH).contains(&frame_id) {
            if let Some(dcp) = &self.dcp {
                if dcp.send(frame.to_vec()).is_err() {
                    self.dcp = None;
                }
            }
            return;
        }

        if (FRAME_ID_ALARM_LOW..=FRAME_ID_ALARM_HIGH).contains(&frame_id) {
            if let Some(alarm) = &self.alarm {
                let sent = alarm.send(AlarmFrame {
                    frame_id,
                    src: eth.src,
                    data: frame[header_len + 2..].to_vec(),
                });
                if sent.is_err() {
                    self.alarm = None;
                }
            }
            return;
        }

        self.unroutable += 1;
    }
}
