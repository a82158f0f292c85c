// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    bounded,
    Receiver,
    Sender,
};
use ::socket2::SockAddr;
use ::std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use ::weft::{
    scheduler::{
        Scheduler,
        SchedulerExt,
    },
    tcp_server::Handler,
    IoScheduler,
    Socket,
    TcpServer,
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// PING/PONG handshake through the server skeleton: the client sends "PING",
/// the handler answers "PONG" and closes, the client reads until EOF.
#[test]
fn test_echo_handshake() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(2, false, "echo-test")?;
    io.start()?;

    let handler: Handler = Arc::new(|client: Socket| {
        let mut buf: [u8; 16] = [0; 16];
        match client.recv(&mut buf) {
            Ok(n) if &buf[..n] == b"PING" => {
                client.send_all(b"PONG").expect("short reply fits in the send buffer");
            },
            Ok(n) => eprintln!("unexpected request of {} bytes", n),
            Err(e) => eprintln!("handler recv failed: {:?}", e),
        }
        let _ = client.close();
    });
    let server: Arc<TcpServer> = TcpServer::new(io.clone(), io.clone(), handler);
    let listen: SocketAddr = "127.0.0.1:0".parse()?;
    server.bind(&SockAddr::from(listen))?;
    let addr: SocketAddr = server.listen_addrs()[0]
        .as_socket()
        .expect("listener has an IP endpoint");
    server.start();

    let (tx, rx): (Sender<Result<Vec<u8>, i32>>, Receiver<Result<Vec<u8>, i32>>) = bounded(1);
    io.submit_closure(move || {
        let reply = (|| -> Result<Vec<u8>, weft::Fail> {
            let socket: Socket = Socket::tcp_v4()?;
            socket.connect_addr(addr, Some(1000))?;
            socket.send_all(b"PING")?;
            let mut reply: Vec<u8> = Vec::new();
            let mut buf: [u8; 16] = [0; 16];
            loop {
                match socket.recv(&mut buf)? {
                    0 => break,
                    n => reply.extend_from_slice(&buf[..n]),
                }
            }
            socket.close()?;
            Ok(reply)
        })();
        tx.send(reply.map_err(|e| e.errno)).expect("test driver is waiting");
    });

    let reply: Vec<u8> = rx
        .recv_timeout(Duration::from_secs(10))?
        .map_err(|errno| anyhow::format_err!("client failed with errno {}", errno))?;
    weft::ensure_eq!(reply.as_slice(), b"PONG".as_slice());

    server.stop();
    io.stop();
    weft::ensure_eq!(io.pending_events(), 0);
    Ok(())
}

/// The facade speaks unix-domain endpoints with the same blocking-looking
/// API: accept, recv and send all suspend cooperatively.
#[test]
fn test_unix_stream_round_trip() -> Result<()> {
    common::initialize();
    let io: Arc<IoScheduler> = IoScheduler::new(2, false, "unix-test")?;
    io.start()?;

    let mut path = std::env::temp_dir();
    path.push(format!("weft-unix-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let listener: Arc<Socket> = {
        let socket: Socket = Socket::unix_stream()?;
        socket.bind_unix(&path)?;
        socket.listen(16)?;
        Arc::new(socket)
    };

    let acceptor: Arc<Socket> = listener.clone();
    io.submit_closure(move || {
        if let Ok(client) = acceptor.accept() {
            let mut buf: [u8; 8] = [0; 8];
            if let Ok(n) = client.recv(&mut buf) {
                let _ = client.send_all(&buf[..n]);
            }
            let _ = client.close();
        }
    });

    let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = bounded(1);
    let peer_path = path.clone();
    io.submit_closure(move || {
        let socket: Socket = Socket::unix_stream().expect("socket creation");
        socket.connect_unix(&peer_path, Some(1000)).expect("unix connect");
        socket.send_all(b"unix").expect("short message");
        let mut buf: [u8; 8] = [0; 8];
        let n: usize = socket.recv(&mut buf).expect("echoed payload");
        let _ = socket.close();
        tx.send(buf[..n].to_vec()).expect("test driver is waiting");
    });

    let reply: Vec<u8> = rx.recv_timeout(Duration::from_secs(10))?;
    weft::ensure_eq!(reply.as_slice(), b"unix".as_slice());

    io.stop();
    weft::ensure_eq!(io.pending_events(), 0);
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Separate accept and I/O schedulers carry the same handshake.
#[test]
fn test_echo_two_schedulers() -> Result<()> {
    common::initialize();
    let accept_io: Arc<IoScheduler> = IoScheduler::new(1, false, "echo-accept")?;
    let handler_io: Arc<IoScheduler> = IoScheduler::new(2, false, "echo-io")?;
    accept_io.start()?;
    handler_io.start()?;

    let handler: Handler = Arc::new(|client: Socket| {
        let mut buf: [u8; 16] = [0; 16];
        if let Ok(n) = client.recv(&mut buf) {
            let _ = client.send_all(&buf[..n]);
        }
        let _ = client.close();
    });
    let server: Arc<TcpServer> = TcpServer::new(handler_io.clone(), accept_io.clone(), handler);
    server.bind(&SockAddr::from("127.0.0.1:0".parse::<SocketAddr>()?))?;
    let addr: SocketAddr = server.listen_addrs()[0]
        .as_socket()
        .expect("listener has an IP endpoint");
    server.start();

    let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = bounded(1);
    handler_io.submit_closure(move || {
        let socket: Socket = Socket::tcp_v4().expect("socket creation");
        socket.connect_addr(addr, Some(1000)).expect("loopback connect");
        socket.send_all(b"HELLO").expect("short message");
        let mut buf: [u8; 16] = [0; 16];
        let n: usize = socket.recv(&mut buf).expect("echoed payload");
        let _ = socket.close();
        tx.send(buf[..n].to_vec()).expect("test driver is waiting");
    });

    let reply: Vec<u8> = rx.recv_timeout(Duration::from_secs(10))?;
    weft::ensure_eq!(reply.as_slice(), b"HELLO".as_slice());

    server.stop();
    accept_io.stop();
    handler_io.stop();
    weft::ensure_eq!(accept_io.pending_events(), 0);
    weft::ensure_eq!(handler_io.pending_events(), 0);
    Ok(())
}
