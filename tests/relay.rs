extern crate futures;
extern crate relay_chat;
extern crate tokio;

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use futures::Future;

use relay_chat::peer::ConnectionId;
use relay_chat::sink::strip_timestamp;
use relay_chat::{Client, Error, LogSink, MemorySink, Server, Settings};

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> Settings {
    Settings {
        accept_poll: Duration::from_millis(50),
        ..Settings::default()
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn start_server() -> (Server, Arc<MemorySink>, SocketAddr) {
    let sink = Arc::new(MemorySink::new());
    let server = Server::new(settings(), sink.clone()).unwrap();
    let addr = server.start("127.0.0.1", "0").unwrap();
    (server, sink, addr)
}

/// Connects a plain socket and waits until the server has registered it.
fn join(server: &Server, addr: SocketAddr) -> TcpStream {
    let before = server.client_count();
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    wait_until("registration", || server.client_count() == before + 1);
    stream
}

fn read_text(stream: &mut TcpStream) -> String {
    let mut buf = [0; 1024];
    let n = stream.read(&mut buf).unwrap();
    String::from_utf8(buf[..n].to_vec()).unwrap()
}

fn assert_silent(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0; 64];
    match stream.read(&mut buf) {
        Err(ref err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
        other => panic!("expected nothing, got {:?}", other),
    }
    stream.set_read_timeout(Some(WAIT)).unwrap();
}

/// Keeps opening connections to `addr` until `done` is set, and hands back every one it opened.
fn flood(addr: SocketAddr, done: Arc<AtomicBool>) -> thread::JoinHandle<Vec<TcpStream>> {
    thread::spawn(move || {
        let mut held = Vec::new();
        while !done.load(Ordering::SeqCst) {
            match TcpStream::connect(addr) {
                Ok(stream) => held.push(stream),
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        held
    })
}

#[test]
fn relays_to_everyone_but_the_sender() {
    let (server, sink, addr) = start_server();
    assert!(sink.contains("[/ Server started /]"));

    let mut first = join(&server, addr);
    wait_until("connect notice", || sink.contains("[/ Client 0 connected /]"));
    first.write_all(b"hello").unwrap();
    wait_until("server log", || sink.contains("<- Client 0 -> hello"));

    let mut second = join(&server, addr);
    wait_until("connect notice", || sink.contains("[/ Client 1 connected /]"));
    first.write_all(b"hi").unwrap();
    assert_eq!(read_text(&mut second), "hi");
    assert_silent(&mut first);
    assert!(sink.contains("<- Client 0 -> hi"));
}

#[test]
fn broadcast_skips_only_the_sender() {
    let (server, _sink, addr) = start_server();
    let mut a = join(&server, addr);
    let mut b = join(&server, addr);
    let mut c = join(&server, addr);

    b.write_all(b"from b").unwrap();
    assert_eq!(read_text(&mut a), "from b");
    assert_eq!(read_text(&mut c), "from b");
    assert_silent(&mut b);
}

#[test]
fn operator_broadcast_reaches_every_client() {
    let (server, sink, addr) = start_server();
    let mut a = join(&server, addr);
    let mut b = join(&server, addr);

    server.broadcast("maintenance at noon").unwrap().wait().unwrap();
    assert!(sink.contains("<- Server (You) -> maintenance at noon"));
    assert_eq!(read_text(&mut a), "<- Server -> maintenance at noon");
    assert_eq!(read_text(&mut b), "<- Server -> maintenance at noon");
    assert!(server.broadcast("").is_none());
}

#[test]
fn peer_close_unregisters_exactly_once() {
    let (server, sink, addr) = start_server();
    let first = join(&server, addr);
    let _second = join(&server, addr);

    drop(first);
    wait_until("unregister", || server.client_count() == 1);
    wait_until("close notice", || sink.contains("[/ Client 0 connection closed /]"));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(sink.count("[/ Client 0 connection closed /]"), 1);
    assert!(!server.registry().contains(ConnectionId(0)));
    assert!(server.registry().contains(ConnectionId(1)));
}

#[test]
fn disconnect_all_keeps_listening() {
    let (server, sink, addr) = start_server();
    let mut a = join(&server, addr);
    let mut b = join(&server, addr);

    assert_eq!(server.disconnect_all(), 2);
    assert_eq!(a.read(&mut [0; 8]).unwrap(), 0);
    assert_eq!(b.read(&mut [0; 8]).unwrap(), 0);
    wait_until("registry drained", || server.client_count() == 0);
    assert_eq!(sink.count("[/ Client 0 connection closed /]"), 1);
    assert_eq!(sink.count("[/ Client 1 connection closed /]"), 1);
    assert!(server.is_active());

    // ids are never reused
    let _c = join(&server, addr);
    wait_until("new client", || sink.contains("[/ Client 2 connected /]"));
}

#[test]
fn stop_closes_the_listener_and_clients() {
    let (server, sink, addr) = start_server();
    let mut a = join(&server, addr);

    server.stop();
    assert!(!server.is_active());
    assert_eq!(a.read(&mut [0; 8]).unwrap(), 0);
    wait_until("acceptor exit", || !server.is_running());
    assert_eq!(sink.count("[/ Server stopped /]"), 1);
    wait_until("registry drained", || server.client_count() == 0);

    // and it can be started again
    server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    assert!(server.is_active());
}

#[test]
fn stop_disconnects_clients_admitted_while_stopping() {
    for _ in 0..3 {
        let (server, _sink, addr) = start_server();
        let done = Arc::new(AtomicBool::new(false));
        let flooder = flood(addr, done.clone());
        wait_until("first clients", || server.client_count() > 0);

        server.stop();
        wait_until("acceptor exit", || !server.is_running());
        done.store(true, Ordering::SeqCst);
        let held = flooder.join().unwrap();
        wait_until("registry drained", || server.client_count() == 0);

        for mut stream in held {
            stream.set_read_timeout(Some(WAIT)).unwrap();
            match stream.read(&mut [0; 8]) {
                Ok(0) => {}
                Err(ref err) if err.kind() != ErrorKind::WouldBlock && err.kind() != ErrorKind::TimedOut => {}
                other => panic!("client still connected after stop: {:?}", other),
            }
        }
    }
}

#[test]
fn dropping_the_server_does_not_wait_on_its_peers() {
    let (server, _sink, addr) = start_server();
    let done = Arc::new(AtomicBool::new(false));
    let flooder = flood(addr, done.clone());
    wait_until("first clients", || server.client_count() > 0);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        drop(server);
        let _ = tx.send(());
    });
    let dropped = rx.recv_timeout(WAIT);
    done.store(true, Ordering::SeqCst);
    let _held = flooder.join().unwrap();
    assert!(dropped.is_ok(), "server drop blocked on connected peers");
}

#[test]
fn read_error_closes_and_unregisters_once() {
    let (server, sink, addr) = start_server();
    let mut rt = tokio::runtime::Runtime::new().unwrap();
    let stream = rt.block_on(tokio::net::TcpStream::connect(&addr)).unwrap();
    wait_until("connect notice", || sink.contains("[/ Client 0 connected /]"));

    // linger 0 makes the close an RST, which the server reads as an error
    stream.set_linger(Some(Duration::from_secs(0))).unwrap();
    drop(stream);
    wait_until("close notice", || sink.contains("[/ Client 0 connection closed /]"));
    wait_until("unregister", || server.client_count() == 0);
    thread::sleep(Duration::from_millis(100));

    let lines = sink.lines();
    assert_eq!(lines.len(), 4, "{:?}", lines);
    let failure = strip_timestamp(&lines[2]);
    assert!(failure.starts_with("[/ ") && failure != "[/ Client 0 connection closed /]", "{:?}", lines);
    assert_eq!(sink.count("[/ Client 0 connection closed /]"), 1);
    assert!(!server.registry().contains(ConnectionId(0)));
    rt.shutdown_now().wait().unwrap();
}

#[test]
fn starting_twice_is_refused() {
    let (server, sink, _addr) = start_server();
    match server.start("127.0.0.1", "0") {
        Err(Error::AlreadyActive) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert!(sink.contains("[/ Server is already running /]"));
}

#[test]
fn invalid_port_is_rejected_before_any_socket() {
    let sink = Arc::new(MemorySink::new());
    let server = Server::new(settings(), sink.clone()).unwrap();
    match server.start("127.0.0.1", "70000") {
        Err(Error::PortOutOfRange(70000)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sink.lines().len(), 1);
    assert!(sink.contains("[/ Port is out of range /]"));
    assert!(!server.is_active());
    assert!(server.local_addr().is_none());

    let sink = Arc::new(MemorySink::new());
    let client = Client::new(settings(), sink.clone()).unwrap();
    match client.connect("not an address", "9000") {
        Err(Error::InvalidAddress(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sink.lines().len(), 1);
    assert!(sink.contains("[/ Address is not valid /]"));
    assert!(!client.is_connected());

    // both wrong: both reported
    sink.clear();
    assert!(client.connect("not an address", "port").is_err());
    assert_eq!(sink.lines().len(), 2);
    assert!(sink.contains("[/ Address is not valid /]"));
    assert!(sink.contains("[/ Port is not valid /]"));
}

#[test]
fn client_talks_through_the_server() {
    let (server, server_sink, addr) = start_server();
    let mut plain = join(&server, addr);

    let sink = Arc::new(MemorySink::new());
    let client = Client::new(settings(), sink.clone()).unwrap();
    client
        .connect("127.0.0.1", &addr.port().to_string())
        .unwrap();
    wait_until("client connected", || client.is_connected());
    wait_until("server sees client", || server.client_count() == 2);
    assert!(sink.contains("[/ Client connected /]"));

    client.send("hey there").unwrap().wait().unwrap();
    assert!(sink.contains("<- You -> hey there"));
    assert_eq!(read_text(&mut plain), "hey there");
    wait_until("server log", || server_sink.contains("<- Client 1 -> hey there"));

    plain.write_all(b"hello client").unwrap();
    wait_until("client display", || sink.contains("hello client"));

    server.broadcast("welcome").unwrap().wait().unwrap();
    wait_until("operator text", || sink.contains("<- Server -> welcome"));

    assert!(client.disconnect());
    wait_until("client disconnected", || !client.is_connected());
    assert!(sink.contains("[/ Client disconnected /]"));
    wait_until("server dropped client", || server.client_count() == 1);

    // not connected: logged, nothing written
    assert!(client.send("into the void").is_none());
    assert!(sink.contains("<- You -> into the void"));
}

#[test]
fn client_reports_refused_connections() {
    // grab a free port, then release it so nothing is listening there
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let sink = Arc::new(MemorySink::new());
    let client = Client::new(settings(), sink.clone()).unwrap();
    client.connect("127.0.0.1", &port.to_string()).unwrap();
    wait_until("failure logged", || sink.lines().len() == 1);
    assert!(!client.is_connected());
    // free to try again
    client.connect("127.0.0.1", &port.to_string()).unwrap();
}

#[test]
fn broadcasts_survive_a_peer_leaving_midway() {
    let (server, _sink, addr) = start_server();
    let mut a = join(&server, addr);
    let b = join(&server, addr);

    drop(b);
    for i in 0..20 {
        server.broadcast(&format!("tick {}", i));
    }
    let mut got = String::new();
    let expected: String = (0..20).map(|i| format!("<- Server -> tick {}", i)).collect();
    while got.len() < expected.len() {
        got.push_str(&read_text(&mut a));
    }
    assert_eq!(got, expected);
    wait_until("b removed", || server.client_count() == 1);
}
