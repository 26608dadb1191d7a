//! The socket reactor: one thread owns every socket.
//!
//! All socket state mutation happens on the reactor thread. Other threads
//! talk to it through a control pipe carrying framed commands (2 header
//! bytes: type and body length, then the body); the pipe's read end sits in
//! the poll set so commands interleave with socket readiness. The only
//! state shared with caller threads is one atomic header per slot (state,
//! id, queued-byte count), which is what slot reservation and the
//! send-side validity checks need.
//!
//! Readiness is edge-triggered under `mio`: events that may have residual
//! work (a read that filled the whole buffer, a listener that accepted a
//! connection) are revisited until the kernel reports would-block, which
//! restores the drain-to-exhaustion behaviour a level-triggered loop gets
//! for free.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use atomic_enum::atomic_enum;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::unix::pipe;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use super::addr::{UdpAddress, ADDRESS_TAG_IPV4, ADDRESS_TAG_IPV6};

const MAX_SOCKET_P: usize = 16;
/// Fixed socket table size; slot index is `id % MAX_SOCKET`.
pub const MAX_SOCKET: usize = 1 << MAX_SOCKET_P;

const MIN_READ_BUFFER: usize = 64;
const MAX_EVENT: usize = 64;
const MAX_UDP_PACKAGE: usize = 65535;

/// Commands longer than this cannot be framed on the pipe.
const MAX_REQUEST: usize = 255;

const PIPE_TOKEN: Token = Token(usize::MAX);

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum SocketState {
    /// Slot free (or socket torn down).
    Invalid = 0,
    /// Id allocated, no fd attached yet.
    Reserved,
    /// Listening but not yet reporting events; `start` arms it.
    PausedListen,
    Listen,
    /// Non-blocking connect in flight; completion arrives as writable.
    Connecting,
    Connected,
    /// Graceful close requested; write queues drain, then the socket closes.
    HalfClose,
    /// Accepted but not yet reporting events; `start` arms it.
    PausedAccept,
    /// Externally owned fd attached to the event loop; never closed here.
    Bind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Udp,
    Udpv6,
}

impl Protocol {
    fn address_tag(self) -> u8 {
        match self {
            Protocol::Udpv6 => ADDRESS_TAG_IPV6,
            _ => ADDRESS_TAG_IPV4,
        }
    }
}

/// Per-slot state shared with caller threads.
pub(crate) struct SlotHeader {
    state: AtomicSocketState,
    id: AtomicI32,
    wb_size: AtomicI64,
}

pub(crate) struct Shared {
    headers: Vec<SlotHeader>,
    alloc_id: AtomicI32,
}

impl Shared {
    fn new() -> Self {
        Self {
            headers: (0..MAX_SOCKET)
                .map(|_| SlotHeader {
                    state: AtomicSocketState::new(SocketState::Invalid),
                    id: AtomicI32::new(0),
                    wb_size: AtomicI64::new(0),
                })
                .collect(),
            alloc_id: AtomicI32::new(0),
        }
    }

    fn header(&self, id: i32) -> &SlotHeader {
        &self.headers[id as usize % MAX_SOCKET]
    }

    /// A live id must match its slot; anything else is stale.
    fn is_live(&self, id: i32) -> bool {
        let header = self.header(id);
        header.id.load(Ordering::Acquire) == id
            && header.state.load(Ordering::Acquire) != SocketState::Invalid
    }

    /// Allocate an id and claim its slot. Ids increase monotonically,
    /// wrapping to non-negative; a busy slot moves on to the next id, so a
    /// full table costs at most `MAX_SOCKET` probes before giving up.
    fn reserve_id(&self) -> Option<i32> {
        for _ in 0..MAX_SOCKET {
            let mut id = self
                .alloc_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id < 0 {
                let old = self.alloc_id.fetch_and(0x7FFF_FFFF, Ordering::Relaxed);
                id = old & 0x7FFF_FFFF;
            }
            let header = self.header(id);
            if header.state.load(Ordering::Acquire) == SocketState::Invalid
                && header
                    .state
                    .compare_exchange(
                        SocketState::Invalid,
                        SocketState::Reserved,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                header.id.store(id, Ordering::Release);
                header.wb_size.store(0, Ordering::Release);
                return Some(id);
            }
        }
        None
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum CommandKind {
    Start = b'S',
    Bind = b'B',
    Listen = b'L',
    Close = b'K',
    Open = b'O',
    Exit = b'X',
    Send = b'D',
    SendLow = b'P',
    SendUdp = b'A',
    SetUdp = b'C',
    SetOpt = b'T',
    Udp = b'U',
}

/// What the reactor reports back to the rest of the runtime.
#[derive(Debug)]
pub enum ReactorEvent {
    Data {
        id: i32,
        opaque: u32,
        data: Box<[u8]>,
    },
    Udp {
        id: i32,
        opaque: u32,
        data: Box<[u8]>,
        address: UdpAddress,
    },
    /// Connection established, started, transferred or bound.
    Connect {
        id: i32,
        opaque: u32,
        info: String,
    },
    Close {
        id: i32,
        opaque: u32,
    },
    Accept {
        id: i32,
        opaque: u32,
        new_id: i32,
        info: String,
    },
    Error {
        id: i32,
        opaque: u32,
        info: String,
    },
    Exit,
}

enum SocketFd {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
    /// Externally owned; never closed by the reactor.
    Raw(RawFd),
}

struct WriteBuffer {
    data: Box<[u8]>,
    offset: usize,
    udp_address: Option<UdpAddress>,
}

impl WriteBuffer {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

struct SocketData {
    id: i32,
    opaque: u32,
    protocol: Protocol,
    fd: SocketFd,
    high: VecDeque<WriteBuffer>,
    low: VecDeque<WriteBuffer>,
    /// TCP read-size hint; doubles after a full read, halves after a read
    /// at or below half, floored at [`MIN_READ_BUFFER`].
    read_size: usize,
    udp_peer: Option<UdpAddress>,
    /// Registered in the poll set.
    registered: bool,
    /// Writable interest currently armed.
    writing: bool,
}

impl SocketData {
    fn send_buffer_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }
}

#[derive(Debug, Copy, Clone)]
struct PendingEvent {
    id: i32,
    readable: bool,
    writable: bool,
    skip: bool,
}

enum Progress {
    /// Nothing to report; keep going.
    Quiet,
    /// Kernel has no more to give on this path; the event is spent.
    Blocked,
    Report(ReactorEvent),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Priority {
    High,
    Low,
}

/// Caller-thread handle: issues commands over the control pipe and answers
/// the cheap state queries from the shared slot headers.
pub struct SocketApi {
    shared: Arc<Shared>,
    sender: Mutex<pipe::Sender>,
}

/// The reactor half; lives on the socket thread.
pub struct SocketServer {
    poll: Poll,
    events: Events,
    receiver: pipe::Receiver,
    shared: Arc<Shared>,
    slots: Vec<Option<SocketData>>,
    pending: Vec<PendingEvent>,
    event_index: usize,
    checkctrl: bool,
}

impl SocketServer {
    pub fn new() -> crate::Result<(SocketServer, SocketApi)> {
        let poll = Poll::new()?;
        let (sender, mut receiver) = pipe::new()?;
        // command writers block instead of spinning when the pipe is full
        sender.set_nonblocking(false)?;
        poll.registry()
            .register(&mut receiver, PIPE_TOKEN, Interest::READABLE)?;

        let shared = Arc::new(Shared::new());
        let server = SocketServer {
            poll,
            events: Events::with_capacity(MAX_EVENT),
            receiver,
            shared: shared.clone(),
            slots: (0..MAX_SOCKET).map(|_| None).collect(),
            pending: Vec::with_capacity(MAX_EVENT),
            event_index: 0,
            checkctrl: true,
        };
        let api = SocketApi {
            shared,
            sender: Mutex::new(sender),
        };
        Ok((server, api))
    }

    /// One step of the reactor: process commands and readiness until
    /// something must be reported. Returns `None` when the wait itself
    /// failed (callers re-enter). `more` is cleared when the event batch
    /// was exhausted, i.e. the reactor is idle; callers pass it in true.
    pub fn poll_once(&mut self, more: &mut bool) -> Option<ReactorEvent> {
        loop {
            if self.checkctrl {
                match self.try_read_command() {
                    Some((tag, body)) => {
                        let Ok(kind) = CommandKind::try_from(tag) else {
                            log::error!(target: "warren::socket", "unknown ctrl command {tag}");
                            continue;
                        };
                        if let Some(event) = self.exec_command(kind, &body) {
                            self.clear_closed_event(&event);
                            return Some(event);
                        }
                        continue;
                    }
                    None => self.checkctrl = false,
                }
            }

            if self.event_index == self.pending.len() {
                self.checkctrl = true;
                *more = false;
                self.event_index = 0;
                self.pending.clear();
                if let Err(err) = self.poll.poll(&mut self.events, None) {
                    if err.kind() != std::io::ErrorKind::Interrupted {
                        log::error!(target: "warren::socket", "event wait failed: {err}");
                    }
                    return None;
                }
                for event in self.events.iter() {
                    if event.token() == PIPE_TOKEN {
                        continue;
                    }
                    self.pending.push(PendingEvent {
                        id: event.token().0 as i32,
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        skip: false,
                    });
                }
                continue;
            }

            let index = self.event_index;
            let ev = self.pending[index];
            if ev.skip || !self.shared.is_live(ev.id) {
                self.event_index += 1;
                continue;
            }

            match self.state(ev.id) {
                SocketState::Connecting => {
                    self.event_index += 1;
                    let event = self.report_connect(ev.id);
                    self.clear_closed_event(&event);
                    return Some(event);
                }
                SocketState::Listen => {
                    match self.report_accept(ev.id) {
                        // more connections may be pending: revisit the event
                        Progress::Report(event) => return Some(event),
                        Progress::Blocked => self.event_index += 1,
                        Progress::Quiet => {}
                    }
                    continue;
                }
                SocketState::Invalid => {
                    log::error!(target: "warren::socket", "invalid socket in event set");
                    self.event_index += 1;
                }
                _ => {
                    if ev.readable {
                        match self.forward_message(ev.id) {
                            Progress::Report(event) => {
                                if matches!(
                                    event,
                                    ReactorEvent::Close { .. } | ReactorEvent::Error { .. }
                                ) {
                                    self.event_index += 1;
                                    self.clear_closed_event(&event);
                                }
                                // otherwise revisit until the read blocks
                                return Some(event);
                            }
                            Progress::Blocked => {
                                self.pending[index].readable = false;
                            }
                            // interrupted or discarded: try the read again
                            Progress::Quiet => continue,
                        }
                    }
                    if self.pending[index].writable {
                        self.pending[index].writable = false;
                        if let Progress::Report(event) = self.send_buffer(ev.id) {
                            self.event_index += 1;
                            self.clear_closed_event(&event);
                            return Some(event);
                        }
                    }
                    self.event_index += 1;
                }
            }
        }
    }

    /// Later events for a socket that just closed are stale; skip them.
    fn clear_closed_event(&mut self, event: &ReactorEvent) {
        let id = match event {
            ReactorEvent::Close { id, .. } | ReactorEvent::Error { id, .. } => *id,
            _ => return,
        };
        for ev in &mut self.pending[self.event_index..] {
            if ev.id == id {
                ev.skip = true;
            }
        }
    }

    fn try_read_command(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut header = [0u8; 2];
        // commands are written atomically (well under PIPE_BUF), so once
        // the first byte is readable the rest of the command is too
        match (&self.receiver).read(&mut header) {
            Ok(0) => return None,
            Ok(1) => {
                let mut rest = [0u8; 1];
                read_fully(&self.receiver, &mut rest);
                header[1] = rest[0];
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return None,
            Err(err) => {
                log::error!(target: "warren::socket", "read pipe error: {err}");
                return None;
            }
        }
        let mut body = vec![0u8; header[1] as usize];
        read_fully(&self.receiver, &mut body);
        Some((header[0], body))
    }

    fn exec_command(&mut self, kind: CommandKind, body: &[u8]) -> Option<ReactorEvent> {
        let mut cur = Cursor::new(body);
        match kind {
            CommandKind::Start => {
                let id = cur.i32();
                let opaque = cur.u32();
                self.start_socket(id, opaque)
            }
            CommandKind::Bind => {
                let id = cur.i32();
                let fd = cur.i32();
                let opaque = cur.u32();
                Some(self.bind_socket(id, fd, opaque))
            }
            CommandKind::Listen => {
                let id = cur.i32();
                let fd = cur.i32();
                let opaque = cur.u32();
                self.listen_socket(id, fd, opaque)
            }
            CommandKind::Close => {
                let id = cur.i32();
                let opaque = cur.u32();
                let shutdown = cur.u8() != 0;
                self.close_socket(id, opaque, shutdown)
            }
            CommandKind::Open => {
                let id = cur.i32();
                let port = cur.u16();
                let opaque = cur.u32();
                let host = String::from_utf8_lossy(cur.rest()).into_owned();
                self.open_socket(id, opaque, &host, port)
            }
            CommandKind::Exit => Some(ReactorEvent::Exit),
            CommandKind::Send => {
                let id = cur.i32();
                let data = unsafe { cur.boxed_payload() };
                self.send_socket(id, data, Priority::High, None)
            }
            CommandKind::SendLow => {
                let id = cur.i32();
                let data = unsafe { cur.boxed_payload() };
                self.send_socket(id, data, Priority::Low, None)
            }
            CommandKind::SendUdp => {
                let id = cur.i32();
                let data = unsafe { cur.boxed_payload() };
                let address = UdpAddress::decode(cur.rest());
                self.send_socket(id, data, Priority::High, address)
            }
            CommandKind::SetUdp => {
                let id = cur.i32();
                let address = UdpAddress::decode(cur.rest());
                self.set_udp_address(id, address)
            }
            CommandKind::SetOpt => {
                let id = cur.i32();
                let what = cur.i32();
                let value = cur.i32();
                self.setopt_socket(id, what, value);
                None
            }
            CommandKind::Udp => {
                let id = cur.i32();
                let fd = cur.i32();
                let protocol = if cur.u8() == ADDRESS_TAG_IPV6 {
                    Protocol::Udpv6
                } else {
                    Protocol::Udp
                };
                let opaque = cur.u32();
                self.add_udp_socket(id, fd, protocol, opaque);
                None
            }
        }
    }

    fn slot_index(&self, id: i32) -> Option<usize> {
        let index = id as usize % MAX_SOCKET;
        match &self.slots[index] {
            Some(slot) if slot.id == id => Some(index),
            _ => None,
        }
    }

    fn state(&self, id: i32) -> SocketState {
        self.shared.header(id).state.load(Ordering::Acquire)
    }

    fn set_state(&self, id: i32, state: SocketState) {
        self.shared.header(id).state.store(state, Ordering::Release);
    }

    /// Install the socket body for a freshly reserved id.
    fn new_fd(
        &mut self,
        id: i32,
        fd: SocketFd,
        protocol: Protocol,
        opaque: u32,
        add_to_poll: bool,
    ) -> std::io::Result<usize> {
        debug_assert_eq!(self.state(id), SocketState::Reserved);
        let index = id as usize % MAX_SOCKET;
        let mut slot = SocketData {
            id,
            opaque,
            protocol,
            fd,
            high: VecDeque::new(),
            low: VecDeque::new(),
            read_size: MIN_READ_BUFFER,
            udp_peer: None,
            registered: false,
            writing: false,
        };
        if add_to_poll {
            if let Err(err) = register(&self.poll, &mut slot, Interest::READABLE) {
                self.set_state(id, SocketState::Invalid);
                return Err(err);
            }
            slot.registered = true;
        }
        self.shared.header(id).wb_size.store(0, Ordering::Release);
        self.slots[index] = Some(slot);
        Ok(index)
    }

    /// Tear a socket down: drop its write queues, pull it out of the poll
    /// set and free the slot. Externally owned fds stay open (dropping a
    /// `Raw` variant closes nothing).
    fn force_close(&mut self, id: i32) -> (i32, u32) {
        let index = id as usize % MAX_SOCKET;
        let opaque = match self.slots[index].take() {
            Some(mut slot) => {
                if slot.registered {
                    let _ = deregister(&self.poll, &mut slot);
                }
                slot.opaque
            }
            None => 0,
        };
        self.shared.header(id).wb_size.store(0, Ordering::Release);
        self.set_state(id, SocketState::Invalid);
        (id, opaque)
    }

    fn open_socket(&mut self, id: i32, opaque: u32, host: &str, port: u16) -> Option<ReactorEvent> {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                self.set_state(id, SocketState::Invalid);
                return Some(ReactorEvent::Error {
                    id,
                    opaque,
                    info: err.to_string(),
                });
            }
        };
        let mut last_err = None;
        for addr in addrs {
            let stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            socket_keepalive(stream.as_raw_fd());
            let installed =
                self.new_fd(id, SocketFd::Stream(stream), Protocol::Tcp, opaque, false);
            let index = match installed {
                Ok(index) => index,
                Err(err) => {
                    return Some(ReactorEvent::Error {
                        id,
                        opaque,
                        info: err.to_string(),
                    })
                }
            };
            self.set_state(id, SocketState::Connecting);
            // completion arrives as writable; data may follow at once
            let slot = self.slots[index].as_mut().expect("just installed");
            if register(&self.poll, slot, Interest::READABLE | Interest::WRITABLE).is_ok() {
                slot.registered = true;
                slot.writing = true;
                return None;
            }
            let (id, opaque) = self.force_close(id);
            return Some(ReactorEvent::Error {
                id,
                opaque,
                info: "register failed".to_owned(),
            });
        }
        self.set_state(id, SocketState::Invalid);
        let info = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no address resolved".to_owned());
        Some(ReactorEvent::Error { id, opaque, info })
    }

    fn listen_socket(&mut self, id: i32, fd: RawFd, opaque: u32) -> Option<ReactorEvent> {
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        match self.new_fd(id, SocketFd::Listener(listener), Protocol::Tcp, opaque, false) {
            Ok(_) => {
                self.set_state(id, SocketState::PausedListen);
                None
            }
            Err(err) => Some(ReactorEvent::Error {
                id,
                opaque,
                info: err.to_string(),
            }),
        }
    }

    fn bind_socket(&mut self, id: i32, fd: RawFd, opaque: u32) -> ReactorEvent {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        match self.new_fd(id, SocketFd::Raw(fd), Protocol::Tcp, opaque, true) {
            Ok(_) => {
                self.set_state(id, SocketState::Bind);
                ReactorEvent::Connect {
                    id,
                    opaque,
                    info: "binding".to_owned(),
                }
            }
            Err(err) => ReactorEvent::Error {
                id,
                opaque,
                info: err.to_string(),
            },
        }
    }

    fn add_udp_socket(&mut self, id: i32, fd: RawFd, protocol: Protocol, opaque: u32) {
        let socket = unsafe { UdpSocket::from_raw_fd(fd) };
        match self.new_fd(id, SocketFd::Udp(socket), protocol, opaque, true) {
            Ok(_) => self.set_state(id, SocketState::Connected),
            Err(err) => {
                log::error!(target: "warren::socket", "udp socket {id} failed: {err}");
            }
        }
    }

    fn start_socket(&mut self, id: i32, opaque: u32) -> Option<ReactorEvent> {
        let state = self.state(id);
        let Some(index) = self.slot_index(id) else {
            return Some(ReactorEvent::Error {
                id,
                opaque,
                info: "invalid socket".to_owned(),
            });
        };
        match state {
            SocketState::PausedAccept | SocketState::PausedListen => {
                let slot = self.slots[index].as_mut().expect("checked by slot_index");
                slot.opaque = opaque;
                if let Err(err) = register(&self.poll, slot, Interest::READABLE) {
                    let info = err.to_string();
                    let (id, opaque) = self.force_close(id);
                    return Some(ReactorEvent::Error { id, opaque, info });
                }
                slot.registered = true;
                self.set_state(
                    id,
                    if state == SocketState::PausedAccept {
                        SocketState::Connected
                    } else {
                        SocketState::Listen
                    },
                );
                Some(ReactorEvent::Connect {
                    id,
                    opaque,
                    info: "start".to_owned(),
                })
            }
            SocketState::Connected => {
                // hand the connection over to the requesting service
                let slot = self.slots[index].as_mut().expect("checked by slot_index");
                slot.opaque = opaque;
                Some(ReactorEvent::Connect {
                    id,
                    opaque,
                    info: "transfer".to_owned(),
                })
            }
            // half-closed sockets report their close when the queue drains
            _ => None,
        }
    }

    fn close_socket(&mut self, id: i32, opaque: u32, shutdown: bool) -> Option<ReactorEvent> {
        if self.slot_index(id).is_none() {
            return Some(ReactorEvent::Close { id, opaque });
        }
        let index = id as usize % MAX_SOCKET;
        let empty = self.slots[index]
            .as_ref()
            .map(|s| s.send_buffer_empty())
            .unwrap_or(true);
        if !empty {
            if let Progress::Report(event) = self.send_buffer(id) {
                // the drain itself may close the socket
                return Some(event);
            }
        }
        let empty_now = self.slots[index]
            .as_ref()
            .map(|s| s.send_buffer_empty())
            .unwrap_or(true);
        if shutdown || empty_now {
            self.force_close(id);
            return Some(ReactorEvent::Close { id, opaque });
        }
        self.set_state(id, SocketState::HalfClose);
        None
    }

    fn set_udp_address(&mut self, id: i32, address: Option<UdpAddress>) -> Option<ReactorEvent> {
        let index = self.slot_index(id)?;
        let address = address?;
        let slot = self.slots[index].as_mut().expect("checked by slot_index");
        if address.tag() != slot.protocol.address_tag() {
            return Some(ReactorEvent::Error {
                id,
                opaque: slot.opaque,
                info: "protocol mismatch".to_owned(),
            });
        }
        slot.udp_peer = Some(address);
        None
    }

    fn setopt_socket(&mut self, id: i32, what: i32, value: i32) {
        let Some(index) = self.slot_index(id) else {
            return;
        };
        let slot = self.slots[index].as_ref().expect("checked by slot_index");
        if what == libc::TCP_NODELAY {
            if let SocketFd::Stream(stream) = &slot.fd {
                let _ = stream.set_nodelay(value != 0);
            }
        }
    }

    /// A connecting socket became writable: read out the socket error to
    /// learn whether the connect landed.
    fn report_connect(&mut self, id: i32) -> ReactorEvent {
        let Some(index) = self.slot_index(id) else {
            let (id, opaque) = self.force_close(id);
            return ReactorEvent::Error {
                id,
                opaque,
                info: "invalid socket".to_owned(),
            };
        };
        let (opaque, error, info) = {
            let slot = self.slots[index].as_ref().expect("checked by slot_index");
            let (error, info) = match &slot.fd {
                SocketFd::Stream(stream) => (
                    stream.take_error().unwrap_or(None),
                    stream
                        .peer_addr()
                        .map(|a| a.ip().to_string())
                        .unwrap_or_default(),
                ),
                _ => (None, String::new()),
            };
            (slot.opaque, error, info)
        };
        if let Some(err) = error {
            let info = err.to_string();
            let (id, opaque) = self.force_close(id);
            return ReactorEvent::Error { id, opaque, info };
        }
        self.set_state(id, SocketState::Connected);
        let slot = self.slots[index].as_mut().expect("checked by slot_index");
        if slot.send_buffer_empty() {
            slot.writing = false;
            let _ = set_interest(&self.poll, slot, Interest::READABLE);
        }
        ReactorEvent::Connect { id, opaque, info }
    }

    fn report_accept(&mut self, id: i32) -> Progress {
        let Some(index) = self.slot_index(id) else {
            return Progress::Blocked;
        };
        let (opaque, accepted) = {
            let slot = self.slots[index].as_ref().expect("checked by slot_index");
            let SocketFd::Listener(listener) = &slot.fd else {
                return Progress::Blocked;
            };
            (slot.opaque, listener.accept())
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Progress::Blocked,
            Err(err)
                if err.raw_os_error() == Some(libc::EMFILE)
                    || err.raw_os_error() == Some(libc::ENFILE) =>
            {
                return Progress::Report(ReactorEvent::Error {
                    id,
                    opaque,
                    info: err.to_string(),
                });
            }
            Err(_) => return Progress::Quiet,
        };
        let Some(new_id) = self.shared.reserve_id() else {
            return Progress::Quiet;
        };
        socket_keepalive(stream.as_raw_fd());
        if self
            .new_fd(new_id, SocketFd::Stream(stream), Protocol::Tcp, opaque, false)
            .is_err()
        {
            return Progress::Quiet;
        }
        self.set_state(new_id, SocketState::PausedAccept);
        Progress::Report(ReactorEvent::Accept {
            id,
            opaque,
            new_id,
            info: peer.to_string(),
        })
    }

    fn forward_message(&mut self, id: i32) -> Progress {
        if self.slot_index(id).is_none() {
            return Progress::Blocked;
        }
        let protocol = {
            let index = id as usize % MAX_SOCKET;
            self.slots[index].as_ref().expect("checked above").protocol
        };
        match protocol {
            Protocol::Tcp => self.forward_message_tcp(id),
            _ => self.forward_message_udp(id),
        }
    }

    fn forward_message_tcp(&mut self, id: i32) -> Progress {
        let index = id as usize % MAX_SOCKET;
        let read = {
            let slot = self.slots[index].as_mut().expect("caller checked");
            let size = slot.read_size;
            let mut buffer = vec![0u8; size];
            let result = match &mut slot.fd {
                SocketFd::Stream(stream) => stream.read(&mut buffer),
                SocketFd::Raw(fd) => read_raw(*fd, &mut buffer),
                _ => return Progress::Blocked,
            };
            match result {
                Ok(n) => {
                    if n == size {
                        slot.read_size *= 2;
                    } else if size > MIN_READ_BUFFER && n * 2 < size {
                        slot.read_size /= 2;
                    }
                    buffer.truncate(n);
                    Ok((n, buffer, slot.opaque))
                }
                Err(err) => Err(err),
            }
        };
        match read {
            Ok((0, _, _)) => {
                // peer closed
                let (id, opaque) = self.force_close(id);
                Progress::Report(ReactorEvent::Close { id, opaque })
            }
            Ok((_, buffer, opaque)) => {
                if self.state(id) == SocketState::HalfClose {
                    // discard data received while draining for close
                    return Progress::Quiet;
                }
                Progress::Report(ReactorEvent::Data {
                    id,
                    opaque,
                    data: buffer.into_boxed_slice(),
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Progress::Quiet,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Progress::Blocked,
            Err(err) => {
                let info = err.to_string();
                let (id, opaque) = self.force_close(id);
                Progress::Report(ReactorEvent::Error { id, opaque, info })
            }
        }
    }

    fn forward_message_udp(&mut self, id: i32) -> Progress {
        let index = id as usize % MAX_SOCKET;
        let received = {
            let slot = self.slots[index].as_ref().expect("caller checked");
            let SocketFd::Udp(socket) = &slot.fd else {
                return Progress::Blocked;
            };
            let mut buffer = vec![0u8; MAX_UDP_PACKAGE];
            match socket.recv_from(&mut buffer) {
                Ok((n, peer)) => {
                    buffer.truncate(n);
                    Ok((buffer, peer, slot.opaque, slot.protocol))
                }
                Err(err) => Err(err),
            }
        };
        match received {
            Ok((buffer, peer, opaque, protocol)) => {
                let address = UdpAddress::encode(peer);
                if address.tag() != protocol.address_tag() {
                    return Progress::Quiet;
                }
                Progress::Report(ReactorEvent::Udp {
                    id,
                    opaque,
                    data: buffer.into_boxed_slice(),
                    address,
                })
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::Interrupted
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Progress::Blocked
            }
            Err(err) => {
                let info = err.to_string();
                let (id, opaque) = self.force_close(id);
                Progress::Report(ReactorEvent::Error { id, opaque, info })
            }
        }
    }

    /// Drain the write queues on a writable event: high first, then low; a
    /// partially sent low frame is promoted to the (empty) high queue so
    /// later enqueues never overtake it; once both queues are empty the
    /// writable interest is dropped and a half-closed socket finishes
    /// closing.
    fn send_buffer(&mut self, id: i32) -> Progress {
        let Some(index) = self.slot_index(id) else {
            return Progress::Quiet;
        };
        debug_assert!(self.slots[index]
            .as_ref()
            .and_then(|s| s.low.front())
            .map(|wb| wb.offset == 0)
            .unwrap_or(true));

        if let Err(info) = self.send_list(index, Priority::High) {
            log::error!(target: "warren::socket", "write to {id} error: {info}");
            let (id, opaque) = self.force_close(id);
            return Progress::Report(ReactorEvent::Close { id, opaque });
        }
        let high_empty = self.slots[index]
            .as_ref()
            .map(|s| s.high.is_empty())
            .unwrap_or(true);
        if !high_empty {
            return Progress::Quiet;
        }
        let low_empty = self.slots[index]
            .as_ref()
            .map(|s| s.low.is_empty())
            .unwrap_or(true);
        if !low_empty {
            if let Err(info) = self.send_list(index, Priority::Low) {
                log::error!(target: "warren::socket", "write to {id} error: {info}");
                let (id, opaque) = self.force_close(id);
                return Progress::Report(ReactorEvent::Close { id, opaque });
            }
            let slot = self.slots[index].as_mut().expect("checked by slot_index");
            if slot.low.front().map(|wb| wb.offset > 0).unwrap_or(false) {
                // keep the half-sent frame ahead of everything else
                let wb = slot.low.pop_front().expect("front checked");
                debug_assert!(slot.high.is_empty());
                slot.high.push_back(wb);
            }
        } else {
            let slot = self.slots[index].as_mut().expect("checked by slot_index");
            slot.writing = false;
            let _ = set_interest(&self.poll, slot, Interest::READABLE);
            if self.state(id) == SocketState::HalfClose {
                let (id, opaque) = self.force_close(id);
                return Progress::Report(ReactorEvent::Close { id, opaque });
            }
        }
        Progress::Quiet
    }

    /// Write out one queue until it empties or the kernel blocks. Returns
    /// `Err` on a fatal TCP write error; the caller closes the socket.
    fn send_list(&mut self, index: usize, priority: Priority) -> Result<(), String> {
        let shared = &self.shared;
        let slot = self.slots[index].as_mut().expect("caller checked");
        let SocketData {
            id,
            protocol,
            udp_peer,
            ref mut fd,
            ref mut high,
            ref mut low,
            ..
        } = *slot;
        let header = shared.header(id);
        loop {
            let queue = match priority {
                Priority::High => &mut *high,
                Priority::Low => &mut *low,
            };
            let Some(wb) = queue.front_mut() else {
                return Ok(());
            };
            if protocol == Protocol::Tcp {
                let result = match fd {
                    SocketFd::Stream(stream) => stream.write(wb.remaining()),
                    SocketFd::Raw(raw) => write_raw(*raw, wb.remaining()),
                    _ => return Ok(()),
                };
                match result {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        header.wb_size.fetch_sub(n as i64, Ordering::AcqRel);
                        if n < wb.remaining().len() {
                            // kernel buffer filled mid-frame
                            wb.offset += n;
                            return Ok(());
                        }
                        queue.pop_front();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err.to_string()),
                }
            } else {
                let len = wb.remaining().len() as i64;
                let peer = wb.udp_address.or(udp_peer);
                let (SocketFd::Udp(socket), Some(peer)) = (&mut *fd, peer) else {
                    // nowhere to send this datagram
                    queue.pop_front();
                    header.wb_size.fetch_sub(len, Ordering::AcqRel);
                    continue;
                };
                match socket.send_to(wb.remaining(), peer.to_socket_addr()) {
                    Ok(_) => {
                        queue.pop_front();
                        header.wb_size.fetch_sub(len, Ordering::AcqRel);
                    }
                    Err(err)
                        if err.kind() == std::io::ErrorKind::Interrupted
                            || err.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        // retry the same datagram on the next writable event
                        return Ok(());
                    }
                    Err(err) => {
                        log::error!(target: "warren::socket", "udp ({id}) sendto error: {err}");
                        queue.pop_front();
                        header.wb_size.fetch_sub(len, Ordering::AcqRel);
                    }
                }
            }
        }
    }

    /// Handle a send command. With empty queues on a connected socket the
    /// write goes straight to the kernel; a partial result queues the rest
    /// at high priority so the frame is never interleaved. Otherwise the
    /// payload queues at the requested priority.
    fn send_socket(
        &mut self,
        id: i32,
        data: Box<[u8]>,
        priority: Priority,
        udp_address: Option<UdpAddress>,
    ) -> Option<ReactorEvent> {
        let state = self.state(id);
        if self.slot_index(id).is_none()
            || matches!(
                state,
                SocketState::Invalid | SocketState::HalfClose | SocketState::PausedAccept
            )
        {
            return None; // dropped
        }
        if matches!(state, SocketState::Listen | SocketState::PausedListen) {
            log::error!(target: "warren::socket", "write to listen fd {id}");
            return None;
        }
        let index = id as usize % MAX_SOCKET;

        let direct_ok = {
            let slot = self.slots[index].as_ref().expect("checked above");
            slot.send_buffer_empty()
                && matches!(state, SocketState::Connected | SocketState::Bind)
        };

        if direct_ok {
            let slot = self.slots[index].as_mut().expect("checked above");
            if slot.protocol == Protocol::Tcp {
                let result = match &mut slot.fd {
                    SocketFd::Stream(stream) => stream.write(&data),
                    SocketFd::Raw(raw) => write_raw(*raw, &data),
                    _ => Ok(0),
                };
                match result {
                    Ok(n) if n == data.len() => return None,
                    Ok(n) => push_queue(
                        &self.shared,
                        slot,
                        Priority::High,
                        WriteBuffer {
                            data,
                            offset: n,
                            udp_address: None,
                        },
                    ),
                    Err(err)
                        if err.kind() == std::io::ErrorKind::Interrupted
                            || err.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        push_queue(
                            &self.shared,
                            slot,
                            Priority::High,
                            WriteBuffer {
                                data,
                                offset: 0,
                                udp_address: None,
                            },
                        );
                    }
                    Err(err) => {
                        log::error!(target: "warren::socket", "write to {id} error: {err}");
                        let (id, opaque) = self.force_close(id);
                        return Some(ReactorEvent::Close { id, opaque });
                    }
                }
            } else {
                let peer = udp_address.or(slot.udp_peer);
                let sent = match (&slot.fd, peer) {
                    (SocketFd::Udp(socket), Some(peer)) => socket
                        .send_to(&data, peer.to_socket_addr())
                        .map(|n| n == data.len())
                        .unwrap_or(false),
                    _ => false,
                };
                if sent {
                    return None;
                }
                push_queue(
                    &self.shared,
                    slot,
                    priority,
                    WriteBuffer {
                        data,
                        offset: 0,
                        udp_address,
                    },
                );
            }
        } else {
            let slot = self.slots[index].as_mut().expect("checked above");
            push_queue(
                &self.shared,
                slot,
                priority,
                WriteBuffer {
                    data,
                    offset: 0,
                    udp_address,
                },
            );
        }

        let slot = self.slots[index].as_mut().expect("checked above");
        if !slot.writing {
            slot.writing = true;
            let _ = set_interest(&self.poll, slot, Interest::READABLE | Interest::WRITABLE);
        }
        None
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        for index in 0..MAX_SOCKET {
            if let Some(id) = self.slots[index].as_ref().map(|s| s.id) {
                self.force_close(id);
            }
        }
    }
}

fn push_queue(shared: &Shared, slot: &mut SocketData, priority: Priority, wb: WriteBuffer) {
    let len = wb.remaining().len() as i64;
    match priority {
        Priority::High => slot.high.push_back(wb),
        Priority::Low => slot.low.push_back(wb),
    }
    shared
        .header(slot.id)
        .wb_size
        .fetch_add(len, Ordering::AcqRel);
}

fn register(poll: &Poll, slot: &mut SocketData, interest: Interest) -> std::io::Result<()> {
    let token = Token(slot.id as usize);
    match &mut slot.fd {
        SocketFd::Listener(l) => poll.registry().register(l, token, interest),
        SocketFd::Stream(s) => poll.registry().register(s, token, interest),
        SocketFd::Udp(u) => poll.registry().register(u, token, interest),
        SocketFd::Raw(fd) => poll.registry().register(&mut SourceFd(fd), token, interest),
    }
}

fn set_interest(poll: &Poll, slot: &mut SocketData, interest: Interest) -> std::io::Result<()> {
    let token = Token(slot.id as usize);
    match &mut slot.fd {
        SocketFd::Listener(l) => poll.registry().reregister(l, token, interest),
        SocketFd::Stream(s) => poll.registry().reregister(s, token, interest),
        SocketFd::Udp(u) => poll.registry().reregister(u, token, interest),
        SocketFd::Raw(fd) => poll
            .registry()
            .reregister(&mut SourceFd(fd), token, interest),
    }
}

fn deregister(poll: &Poll, slot: &mut SocketData) -> std::io::Result<()> {
    match &mut slot.fd {
        SocketFd::Listener(l) => poll.registry().deregister(l),
        SocketFd::Stream(s) => poll.registry().deregister(s),
        SocketFd::Udp(u) => poll.registry().deregister(u),
        SocketFd::Raw(fd) => poll.registry().deregister(&mut SourceFd(fd)),
    }
}

fn socket_keepalive(fd: RawFd) {
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn read_raw(fd: RawFd, buffer: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_raw(fd: RawFd, buffer: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, buffer.as_ptr().cast(), buffer.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// The pipe carries whole commands (each written atomically), so a short
/// read can only land between two commands; loop until `buf` fills.
fn read_fully(mut receiver: &pipe::Receiver, buf: &mut [u8]) {
    let mut read = 0;
    while read < buf.len() {
        match receiver.read(&mut buf[read..]) {
            Ok(0) => return,
            Ok(n) => read += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::Interrupted
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                std::thread::yield_now();
            }
            Err(err) => {
                log::error!(target: "warren::socket", "read pipe error: {err}");
                return;
            }
        }
    }
}

struct Cursor<'a> {
    body: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let (head, rest) = self.body.split_at(n);
        self.body = rest;
        head
    }

    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.bytes(2).try_into().expect("fixed slice"))
    }

    fn i32(&mut self) -> i32 {
        i32::from_ne_bytes(self.bytes(4).try_into().expect("fixed slice"))
    }

    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.bytes(4).try_into().expect("fixed slice"))
    }

    fn word(&mut self) -> usize {
        usize::from_ne_bytes(self.bytes(8).try_into().expect("fixed slice"))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.body)
    }

    /// Reclaim a payload that crossed the pipe as (pointer, length).
    ///
    /// SAFETY: the sending side leaked exactly one `Box<[u8]>` per send
    /// command, and each command is read exactly once.
    unsafe fn boxed_payload(&mut self) -> Box<[u8]> {
        let ptr = self.word() as *mut u8;
        let len = self.word();
        Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len))
    }
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_payload(buf: &mut Vec<u8>, data: Box<[u8]>) {
    let len = data.len();
    let ptr = Box::into_raw(data) as *mut u8;
    buf.extend_from_slice(&(ptr as usize).to_ne_bytes());
    buf.extend_from_slice(&len.to_ne_bytes());
}

impl SocketApi {
    fn send_request(&self, kind: CommandKind, body: &[u8]) {
        debug_assert!(body.len() <= MAX_REQUEST);
        let mut frame = Vec::with_capacity(2 + body.len());
        frame.push(u8::from(kind));
        frame.push(body.len() as u8);
        frame.extend_from_slice(body);
        // the sender is blocking; write_all also rides out EINTR
        let mut sender = self.sender.lock();
        if let Err(err) = sender.write_all(&frame) {
            log::error!(target: "warren::socket", "send ctrl command error: {err}");
        }
    }

    /// Start a non-blocking connect; the outcome arrives as a `Connect` or
    /// `Error` event carrying the returned id.
    pub fn connect(&self, opaque: u32, host: &str, port: u16) -> crate::Result<i32> {
        if host.len() + 10 > MAX_REQUEST {
            return Err(crate::Error::HostTooLong(host.to_owned()));
        }
        let id = self
            .shared
            .reserve_id()
            .ok_or(crate::Error::SocketTableFull)?;
        let mut body = Vec::with_capacity(10 + host.len());
        put_i32(&mut body, id);
        body.extend_from_slice(&port.to_ne_bytes());
        put_u32(&mut body, opaque);
        body.extend_from_slice(host.as_bytes());
        self.send_request(CommandKind::Open, &body);
        Ok(id)
    }

    /// Bind and listen, returning the paused listener's id; `start` arms
    /// event reporting.
    pub fn listen(&self, opaque: u32, host: &str, port: u16, backlog: i32) -> crate::Result<i32> {
        let fd = do_listen(host, port, backlog)?;
        let Some(id) = self.shared.reserve_id() else {
            unsafe { libc::close(fd) };
            return Err(crate::Error::SocketTableFull);
        };
        let mut body = Vec::with_capacity(12);
        put_i32(&mut body, id);
        put_i32(&mut body, fd);
        put_u32(&mut body, opaque);
        self.send_request(CommandKind::Listen, &body);
        Ok(id)
    }

    /// Attach an externally owned fd (it will not be closed on teardown).
    pub fn bind(&self, opaque: u32, fd: RawFd) -> crate::Result<i32> {
        let id = self
            .shared
            .reserve_id()
            .ok_or(crate::Error::SocketTableFull)?;
        let mut body = Vec::with_capacity(12);
        put_i32(&mut body, id);
        put_i32(&mut body, fd);
        put_u32(&mut body, opaque);
        self.send_request(CommandKind::Bind, &body);
        Ok(id)
    }

    /// Arm a paused listener/accepted socket, or transfer a connected one
    /// to the requesting service.
    pub fn start(&self, opaque: u32, id: i32) {
        let mut body = Vec::with_capacity(8);
        put_i32(&mut body, id);
        put_u32(&mut body, opaque);
        self.send_request(CommandKind::Start, &body);
    }

    fn request_close(&self, opaque: u32, id: i32, shutdown: bool) {
        let mut body = Vec::with_capacity(9);
        put_i32(&mut body, id);
        put_u32(&mut body, opaque);
        body.push(shutdown as u8);
        self.send_request(CommandKind::Close, &body);
    }

    /// Graceful close: pending writes drain before the socket closes.
    pub fn close(&self, opaque: u32, id: i32) {
        self.request_close(opaque, id, false);
    }

    /// Hard close after one best-effort drain.
    pub fn shutdown(&self, opaque: u32, id: i32) {
        self.request_close(opaque, id, true);
    }

    /// Ask the reactor thread to leave its loop.
    pub fn exit(&self) {
        self.send_request(CommandKind::Exit, &[]);
    }

    fn send_with(&self, kind: CommandKind, id: i32, data: Vec<u8>) -> i64 {
        let header = self.shared.header(id);
        if header.id.load(Ordering::Acquire) != id
            || header.state.load(Ordering::Acquire) == SocketState::Invalid
        {
            return -1;
        }
        let mut body = Vec::with_capacity(20);
        put_i32(&mut body, id);
        put_payload(&mut body, data.into_boxed_slice());
        self.send_request(kind, &body);
        header.wb_size.load(Ordering::Acquire)
    }

    /// Queue data on the high-priority queue. Returns the socket's queued
    /// byte count, or -1 if the socket is gone (the data is dropped).
    pub fn send(&self, id: i32, data: Vec<u8>) -> i64 {
        self.send_with(CommandKind::Send, id, data)
    }

    /// Queue data on the low-priority queue.
    pub fn send_lowpriority(&self, id: i32, data: Vec<u8>) -> i64 {
        self.send_with(CommandKind::SendLow, id, data)
    }

    /// Create a UDP socket, optionally bound to `host:port`.
    pub fn udp(&self, opaque: u32, host: &str, port: u16) -> crate::Result<i32> {
        let (fd, tag) = do_udp_bind(host, port)?;
        let Some(id) = self.shared.reserve_id() else {
            unsafe { libc::close(fd) };
            return Err(crate::Error::SocketTableFull);
        };
        let mut body = Vec::with_capacity(13);
        put_i32(&mut body, id);
        put_i32(&mut body, fd);
        body.push(tag);
        put_u32(&mut body, opaque);
        self.send_request(CommandKind::Udp, &body);
        Ok(id)
    }

    /// Install `host:port` as the socket's default peer.
    pub fn udp_connect(&self, id: i32, host: &str, port: u16) -> crate::Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| crate::Error::InvalidAddress(format!("{host}:{port}")))?;
        let packed = UdpAddress::encode(addr);
        let mut body = Vec::with_capacity(4 + packed.len());
        put_i32(&mut body, id);
        body.extend_from_slice(packed.as_bytes());
        self.send_request(CommandKind::SetUdp, &body);
        Ok(())
    }

    /// Send one datagram to an explicit peer.
    pub fn udp_send(&self, id: i32, address: &UdpAddress, data: Vec<u8>) -> i64 {
        let header = self.shared.header(id);
        if header.id.load(Ordering::Acquire) != id
            || header.state.load(Ordering::Acquire) == SocketState::Invalid
        {
            return -1;
        }
        let mut body = Vec::with_capacity(20 + address.len());
        put_i32(&mut body, id);
        put_payload(&mut body, data.into_boxed_slice());
        body.extend_from_slice(address.as_bytes());
        self.send_request(CommandKind::SendUdp, &body);
        header.wb_size.load(Ordering::Acquire)
    }

    /// Set TCP_NODELAY on a stream.
    pub fn nodelay(&self, id: i32) {
        let mut body = Vec::with_capacity(12);
        put_i32(&mut body, id);
        put_i32(&mut body, libc::TCP_NODELAY);
        put_i32(&mut body, 1);
        self.send_request(CommandKind::SetOpt, &body);
    }
}

fn do_listen(host: &str, port: u16, backlog: i32) -> crate::Result<RawFd> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| crate::Error::InvalidAddress(format!("{host}:{port}")))?;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into_raw_fd())
}

fn do_udp_bind(host: &str, port: u16) -> crate::Result<(RawFd, u8)> {
    if host.is_empty() && port == 0 {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_nonblocking(true)?;
        return Ok((socket.into_raw_fd(), ADDRESS_TAG_IPV4));
    }
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| crate::Error::InvalidAddress(format!("{host}:{port}")))?;
    let tag = if addr.is_ipv6() {
        ADDRESS_TAG_IPV6
    } else {
        ADDRESS_TAG_IPV4
    };
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok((socket.into_raw_fd(), tag))
}
