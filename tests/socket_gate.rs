//! Reactor behaviour over real loopback sockets: accept, echo, UDP, and
//! graceful close with a loaded write queue.

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use warren::{
    launch,
    message::{Message, MessageKind, Payload, SendFlags},
    module::{ModuleRegistry, Service, ServiceModule},
    node::Node,
    runtime,
    socket::SocketEventKind,
    ServiceContext,
};

/// Bytes pushed out before the graceful close; large enough that the
/// kernel cannot swallow it all at once.
const BLAST: usize = 4 * 1024 * 1024;

type Events = Arc<Mutex<Vec<String>>>;

struct Gate {
    events: Events,
    conn: Option<i32>,
}

impl Service for Gate {
    fn init(&mut self, ctx: &ServiceContext, args: &str) -> warren::Result<()> {
        let port: u16 = args
            .trim()
            .parse()
            .map_err(|_| warren::Error::Config(format!("bad port {args}")))?;
        let node = ctx.node();
        let id = node.socket_listen(ctx.handle(), "127.0.0.1", port, 64)?;
        node.socket_start(ctx.handle(), id);
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, message: Message) {
        let node = ctx.node().clone();
        match message.payload {
            Payload::Socket(sm) => match sm.kind {
                SocketEventKind::Accept => {
                    self.conn = Some(sm.ud);
                    node.socket_start(ctx.handle(), sm.ud);
                    self.events.lock().push(format!("accept:{}", sm.ud));
                }
                SocketEventKind::Connect => {
                    self.events
                        .lock()
                        .push(format!("connect:{}", String::from_utf8_lossy(&sm.buffer)));
                }
                SocketEventKind::Data => {
                    self.events.lock().push(format!("data:{}", sm.ud));
                    // echo
                    let _ = node.socket_send(ctx.handle(), sm.id, sm.buffer.into_vec());
                }
                SocketEventKind::Udp => {
                    let datagram = sm.buffer[..sm.ud as usize].to_vec();
                    self.events.lock().push(format!("udp:{}", datagram.len()));
                    if let Some(peer) = sm.udp_address() {
                        let _ = node.socket_udp_send(ctx.handle(), sm.id, &peer, datagram);
                    }
                }
                SocketEventKind::Close => {
                    self.events.lock().push(format!("close:{}", sm.id));
                }
                SocketEventKind::Error => {
                    self.events
                        .lock()
                        .push(format!("error:{}", String::from_utf8_lossy(&sm.buffer)));
                }
                SocketEventKind::Warning => {
                    self.events.lock().push(format!("warning:{}", sm.ud));
                }
                _ => {}
            },
            _ => {
                // "blast": pour BLAST bytes at the client, then close
                // gracefully so the queue drains before the socket dies
                if message.kind == MessageKind::Text {
                    if let Some(conn) = self.conn {
                        let payload = vec![0x5Au8; BLAST];
                        let _ = node.socket_send(ctx.handle(), conn, payload);
                        node.socket_close(ctx.handle(), conn);
                    }
                }
            }
        }
    }
}

struct GateModule {
    events: Events,
}

impl ServiceModule for GateModule {
    fn name(&self) -> &str {
        "gate"
    }

    fn create(&self) -> Box<dyn Service> {
        Box::new(Gate {
            events: self.events.clone(),
            conn: None,
        })
    }
}

struct UdpEcho {
    events: Events,
}

impl Service for UdpEcho {
    fn init(&mut self, ctx: &ServiceContext, args: &str) -> warren::Result<()> {
        let port: u16 = args
            .trim()
            .parse()
            .map_err(|_| warren::Error::Config(format!("bad port {args}")))?;
        let node = ctx.node();
        node.socket_udp(ctx.handle(), "127.0.0.1", port)?;
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ServiceContext, message: Message) {
        let node = ctx.node().clone();
        if let Payload::Socket(sm) = message.payload {
            if sm.kind == SocketEventKind::Udp {
                let datagram = sm.buffer[..sm.ud as usize].to_vec();
                self.events.lock().push(format!("udp:{}", datagram.len()));
                if let Some(peer) = sm.udp_address() {
                    let _ = node.socket_udp_send(ctx.handle(), sm.id, &peer, datagram);
                }
            }
        }
    }
}

struct UdpEchoModule {
    events: Events,
}

impl ServiceModule for UdpEchoModule {
    fn name(&self) -> &str {
        "udp-echo"
    }

    fn create(&self) -> Box<dyn Service> {
        Box::new(UdpEcho {
            events: self.events.clone(),
        })
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn node_with(events: &Events) -> Arc<Node> {
    let registry = ModuleRegistry::new();
    registry.insert(Arc::new(GateModule {
        events: events.clone(),
    }));
    registry.insert(Arc::new(UdpEchoModule {
        events: events.clone(),
    }));
    Node::new(1, registry).expect("building node")
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !done() {
        assert!(Instant::now() < end, "timed out");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn tcp_accept_and_echo() {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let node = node_with(&events);
    let port = free_port();

    let gate = launch(&node, "gate", &port.to_string()).unwrap();
    let runner = {
        let node = node.clone();
        std::thread::spawn(move || runtime::start(&node, 2))
    };

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello gate").unwrap();

    let mut echoed = vec![0u8; 10];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello gate");

    wait_until(Duration::from_secs(5), || {
        events.lock().iter().any(|e| e.starts_with("accept:"))
    });

    drop(client);
    // peer close surfaces as a close event on the connection
    wait_until(Duration::from_secs(5), || {
        events.lock().iter().any(|e| e.starts_with("close:"))
    });

    drop(gate);
    node.abort();
    runner.join().unwrap();
}

#[test]
fn graceful_close_drains_pending_data() {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let node = node_with(&events);
    let port = free_port();

    let gate = launch(&node, "gate", &port.to_string()).unwrap();
    let gate_handle = gate.handle();
    let runner = {
        let node = node.clone();
        std::thread::spawn(move || runtime::start(&node, 2))
    };

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        events.lock().iter().any(|e| e.starts_with("accept:"))
    });

    // trigger the blast-then-close from inside the service
    gate.send(
        0,
        gate_handle,
        MessageKind::Text,
        SendFlags::empty(),
        0,
        Payload::from(b"blast".to_vec()),
    )
    .unwrap();

    // every byte must arrive before the close lands
    let mut total = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                assert!(chunk[..n].iter().all(|b| *b == 0x5A));
                total += n;
            }
            Err(err) => panic!("read failed after {total} bytes: {err}"),
        }
    }
    assert_eq!(total, BLAST);

    // exactly one close event for the drained connection
    wait_until(Duration::from_secs(5), || {
        events.lock().iter().any(|e| e.starts_with("close:"))
    });
    let closes = events
        .lock()
        .iter()
        .filter(|e| e.starts_with("close:"))
        .count();
    assert_eq!(closes, 1);

    drop(gate);
    node.abort();
    runner.join().unwrap();
}

#[test]
fn udp_echo_round_trip() {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let node = node_with(&events);
    let port = free_udp_port();

    let echo = launch(&node, "udp-echo", &port.to_string()).unwrap();
    let runner = {
        let node = node.clone();
        std::thread::spawn(move || runtime::start(&node, 2))
    };

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // the reactor may still be arming the socket; retry a few times
    let mut reply = vec![0u8; 64];
    let mut received = None;
    for _ in 0..20 {
        client.send_to(b"ping?", ("127.0.0.1", port)).unwrap();
        match client.recv_from(&mut reply) {
            Ok((n, _)) => {
                received = Some(reply[..n].to_vec());
                break;
            }
            Err(_) => continue,
        }
    }
    assert_eq!(received.as_deref(), Some(&b"ping?"[..]));

    drop(echo);
    node.abort();
    runner.join().unwrap();
}
