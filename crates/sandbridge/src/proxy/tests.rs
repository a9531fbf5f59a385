//! End-to-end tunnel tests
//!
//! Both sides run on threads here; a channel behaves the same whether its
//! views live in two threads or two processes.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::thread::{self, JoinHandle};

use super::*;
use crate::error::BridgeError;
use crate::multiplexer::StopHandle;

/// Upstream that answers every number it reads with the number doubled
fn spawn_doubler() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let mut mux = Multiplexer::<HashMap<RawFd, TcpStream>>::new().unwrap();
        mux.register(listener.as_raw_fd(), move |mux, sockets, _| {
            let (stream, _) = listener.accept()?;
            let fd = stream.as_raw_fd();
            sockets.insert(fd, stream);
            mux.register(fd, |mux, sockets, fd| {
                let Some(stream) = sockets.get_mut(&fd) else {
                    mux.unregister(fd);
                    return Ok(Flow::Continue);
                };
                let mut buf = [0u8; 64];
                let n = stream.read(&mut buf)?;
                if n == 0 {
                    mux.unregister(fd);
                    sockets.remove(&fd);
                    return Ok(Flow::Continue);
                }
                let number: i64 = String::from_utf8_lossy(&buf[..n]).trim().parse().unwrap();
                stream.write_all((number * 2).to_string().as_bytes())?;
                Ok(Flow::Continue)
            });
            Ok(Flow::Continue)
        });
        let _ = mux.run(&mut HashMap::new());
    });

    addr
}

/// Upstream that hangs up on every connection right away
fn spawn_hangup() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            drop(stream);
        }
    });
    addr
}

fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn request(stream: &mut TcpStream, body: &str, expected: &str) {
    stream.write_all(body.as_bytes()).unwrap();
    let mut reply = vec![0u8; expected.len()];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(String::from_utf8(reply).unwrap(), expected);
}

fn next_event(channel: &Channel) -> ProxyEvent {
    match channel.receive::<ProxyEvent>().unwrap() {
        Received::Message(event) => event,
        Received::EndOfStream => panic!("Channel ended while waiting for an event"),
    }
}

fn spawn_client(
    channel: Channel,
    listener: TcpListener,
) -> (StopHandle, JoinHandle<(TunnelClient, Result<()>)>) {
    let mut client = TunnelClient::new(channel, listener).unwrap();
    let stop = client.stop_handle();
    let handle = thread::spawn(move || {
        let result = client.start();
        (client, result)
    });
    (stop, handle)
}

fn spawn_server<C: Connector + 'static>(
    channel: Channel,
    connector: C,
) -> (StopHandle, JoinHandle<(TunnelServer<C>, Result<()>)>) {
    let mut server = TunnelServer::new(channel, connector).unwrap();
    let stop = server.stop_handle();
    let handle = thread::spawn(move || {
        let result = server.start();
        (server, result)
    });
    (stop, handle)
}

#[test]
fn test_tunnel_forwards_requests_both_ways() {
    let upstream = spawn_doubler();
    let (host, peer) = Channel::open().unwrap();
    let (listener, local) = local_listener();

    let (client_stop, client) = spawn_client(peer, listener);
    let (_, server) = spawn_server(host, TcpConnector::new(upstream));

    let mut first = TcpStream::connect(local).unwrap();
    request(&mut first, "10", "20");
    request(&mut first, "30", "60");
    drop(first);

    let mut second = TcpStream::connect(local).unwrap();
    request(&mut second, "50", "100");
    request(&mut second, "70", "140");
    drop(second);

    // Stopping the client also stops the server
    client_stop.stop().unwrap();
    let (client, client_result) = client.join().unwrap();
    let (server, server_result) = server.join().unwrap();

    client_result.unwrap();
    server_result.unwrap();
    assert_eq!(client.connection_count(), 0);
    assert_eq!(server.connection_count(), 0);
}

fn expect_open(channel: &Channel) -> ConnectionId {
    match next_event(channel) {
        ProxyEvent::Open { id } => id,
        other => panic!("Expected open, got {:?}", other),
    }
}

fn expect_unknown_connection(channel: &Channel, expected: ConnectionId) {
    match next_event(channel) {
        ProxyEvent::ConnectionError { id, message } => {
            assert_eq!(id, expected);
            assert!(message.unwrap().contains("unknown connection"));
        }
        other => panic!("Expected connection error, got {:?}", other),
    }
}

#[test]
fn test_client_close_removes_only_that_connection() {
    let (host, peer) = Channel::open().unwrap();
    let (listener, local) = local_listener();
    let (_, client) = spawn_client(peer, listener);

    let closing = TcpStream::connect(local).unwrap();
    let closing_id = expect_open(&host);
    let mut staying = TcpStream::connect(local).unwrap();
    let staying_id = expect_open(&host);
    assert_ne!(closing_id, staying_id);

    drop(closing);
    assert_eq!(next_event(&host), ProxyEvent::Close { id: closing_id });

    // The other connection still relays both ways, and nothing else was
    // sent for the closed one in between
    staying.write_all(b"hi").unwrap();
    assert_eq!(
        next_event(&host),
        ProxyEvent::Data {
            id: staying_id,
            payload: b"hi".to_vec()
        }
    );
    host.send(&ProxyEvent::Data {
        id: staying_id,
        payload: b"yo".to_vec(),
    })
    .unwrap();
    let mut reply = [0u8; 2];
    staying.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"yo");

    // Data for the closed connection is answered with a connection error;
    // a second close for it would arrive first
    host.send(&ProxyEvent::Data {
        id: closing_id,
        payload: b"late".to_vec(),
    })
    .unwrap();
    expect_unknown_connection(&host, closing_id);

    drop(staying);
    assert_eq!(next_event(&host), ProxyEvent::Close { id: staying_id });

    host.send(&ProxyEvent::Stop).unwrap();
    let (client, result) = client.join().unwrap();
    result.unwrap();
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn test_server_rejects_data_for_unknown_connection() {
    let upstream = spawn_doubler();
    let (host, peer) = Channel::open().unwrap();
    let (_, server) = spawn_server(host, TcpConnector::new(upstream));

    let closed = ConnectionId(21);
    peer.send(&ProxyEvent::Open { id: closed }).unwrap();
    peer.send(&ProxyEvent::Data {
        id: closed,
        payload: b"1".to_vec(),
    })
    .unwrap();
    assert_eq!(
        next_event(&peer),
        ProxyEvent::Data {
            id: closed,
            payload: b"2".to_vec()
        }
    );
    peer.send(&ProxyEvent::Close { id: closed }).unwrap();

    peer.send(&ProxyEvent::Data {
        id: closed,
        payload: b"3".to_vec(),
    })
    .unwrap();
    expect_unknown_connection(&peer, closed);

    let never_opened = ConnectionId(99);
    peer.send(&ProxyEvent::Data {
        id: never_opened,
        payload: b"4".to_vec(),
    })
    .unwrap();
    expect_unknown_connection(&peer, never_opened);

    // The tunnel keeps serving new connections
    let fresh = ConnectionId(22);
    peer.send(&ProxyEvent::Open { id: fresh }).unwrap();
    peer.send(&ProxyEvent::Data {
        id: fresh,
        payload: b"5".to_vec(),
    })
    .unwrap();
    assert_eq!(
        next_event(&peer),
        ProxyEvent::Data {
            id: fresh,
            payload: b"10".to_vec()
        }
    );

    peer.send(&ProxyEvent::Close { id: fresh }).unwrap();
    peer.send(&ProxyEvent::Stop).unwrap();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_server_isolates_failed_connect() {
    let upstream = spawn_doubler();
    let (host, peer) = Channel::open().unwrap();

    let mut attempts = 0;
    let connector = move || {
        attempts += 1;
        if attempts == 1 {
            Err(std::io::Error::new(ErrorKind::ConnectionRefused, "refused"))
        } else {
            TcpStream::connect(upstream)
        }
    };
    let (_, server) = spawn_server(host, connector);

    let refused = ConnectionId(1001);
    peer.send(&ProxyEvent::Open { id: refused }).unwrap();
    match next_event(&peer) {
        ProxyEvent::ConnectionError { id, message } => {
            assert_eq!(id, refused);
            assert!(message.unwrap().contains("refused"));
        }
        other => panic!("Expected connection error, got {:?}", other),
    }

    // The tunnel is still up for other connections
    let working = ConnectionId(1002);
    peer.send(&ProxyEvent::Open { id: working }).unwrap();
    peer.send(&ProxyEvent::Data {
        id: working,
        payload: b"21".to_vec(),
    })
    .unwrap();
    assert_eq!(
        next_event(&peer),
        ProxyEvent::Data {
            id: working,
            payload: b"42".to_vec()
        }
    );

    peer.send(&ProxyEvent::Close { id: working }).unwrap();
    peer.send(&ProxyEvent::Stop).unwrap();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_server_reports_upstream_close() {
    let upstream = spawn_hangup();
    let (host, peer) = Channel::open().unwrap();
    let (_, server) = spawn_server(host, TcpConnector::new(upstream));

    let id = ConnectionId(3);
    peer.send(&ProxyEvent::Open { id }).unwrap();
    assert_eq!(next_event(&peer), ProxyEvent::Close { id });

    peer.send(&ProxyEvent::Stop).unwrap();
    let (server, result) = server.join().unwrap();
    result.unwrap();
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_unexpected_event_is_fatal() {
    let (host, peer) = Channel::open().unwrap();
    let (listener, _) = local_listener();
    let (_, client) = spawn_client(peer, listener);

    host.send(&ProxyEvent::Open {
        id: ConnectionId(7),
    })
    .unwrap();

    match next_event(&host) {
        ProxyEvent::ServerError { error } => {
            assert_eq!(error.kind, "BridgeError");
            assert!(error.message.contains("unexpected open"));
        }
        other => panic!("Expected server error, got {:?}", other),
    }

    let (_, result) = client.join().unwrap();
    assert!(matches!(result, Err(BridgeError::Protocol(_))));
}

#[test]
fn test_client_stop_handle_stops_host() {
    let (host, peer) = Channel::open().unwrap();
    let (listener, _) = local_listener();
    let (stop, client) = spawn_client(peer, listener);

    stop.stop().unwrap();
    assert_eq!(next_event(&host), ProxyEvent::Stop);
    client.join().unwrap().1.unwrap();
}

#[test]
fn test_client_stops_when_channel_ends() {
    let (mut host, peer) = Channel::open().unwrap();
    let (listener, _) = local_listener();
    let (_, client) = spawn_client(peer, listener);

    host.stop().unwrap();
    client.join().unwrap().1.unwrap();
}

#[test]
fn test_server_stop_handle() {
    let (host, _peer) = Channel::open().unwrap();
    let (stop, server) = spawn_server(host, TcpConnector::new(spawn_hangup()));

    stop.stop().unwrap();
    server.join().unwrap().1.unwrap();
}

#[test]
fn test_tcp_connector_with_timeout() {
    let upstream = spawn_doubler();
    let mut connector = TcpConnector::new(upstream).with_timeout(std::time::Duration::from_secs(2));

    let mut stream = connector.connect().unwrap();
    request(&mut stream, "4", "8");
}
