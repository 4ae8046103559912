//! End-to-end channel and selector scenarios over the memory engine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use xchannel::{
    Channel, Config, ConnectionState, Error, Kind, MemoryEngine, Ops, OptionValue, Provider,
    Providers, SocketOption, Transfer,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup() -> (MemoryEngine, Providers) {
    init_logger();
    let engine = MemoryEngine::default();
    let providers = Providers::new(Arc::new(engine.clone()), Config::default());
    (engine, providers)
}

fn any_port() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// Listening acceptor plus a connected client/server channel pair.
fn connected(provider: &Provider) -> (Arc<Channel>, Arc<Channel>, Arc<Channel>) {
    let acceptor = provider.open_server_socket().unwrap();
    let addr = acceptor.bind(any_port()).unwrap();
    acceptor.listen(0).unwrap();

    let client = provider.open_socket().unwrap();
    client.configure_blocking(false).unwrap();
    assert!(!client.connect(addr).unwrap());
    let server = acceptor.accept().unwrap().unwrap();
    assert!(client.finish_connect().unwrap());
    (acceptor, client, server)
}

#[test]
fn test_valid_ops_fixed_for_lifetime() {
    let (_engine, providers) = setup();
    let stream = providers.stream();
    let (acceptor, client, _server) = connected(stream);
    assert_eq!(acceptor.valid_ops(), Ops::ACCEPT);
    assert_eq!(client.valid_ops(), Ops::CONNECT | Ops::READ | Ops::WRITE);

    client.close().unwrap();
    acceptor.close().unwrap();
    assert_eq!(acceptor.valid_ops(), Ops::ACCEPT);
    assert_eq!(client.valid_ops(), Ops::CONNECT | Ops::READ | Ops::WRITE);
}

#[test]
fn test_configure_blocking_then_close_then_read() {
    let (_engine, providers) = setup();
    let channel = providers.stream().open_channel(Kind::Connect).unwrap();
    assert!(channel.is_blocking());

    channel.configure_blocking(false).unwrap();
    assert!(channel.is_open());
    assert!(!channel.is_blocking());

    channel.close().unwrap();
    assert!(!channel.is_open());
    let mut buf = [0u8; 8];
    assert!(matches!(channel.read(&mut buf), Err(Error::ChannelClosed)));
}

#[test]
fn test_concurrent_close_releases_once() {
    let (engine, providers) = setup();
    let (_acceptor, client, _server) = connected(providers.stream());
    let before = engine.stats().close_calls;

    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));
    let closers: Vec<_> = (0..THREADS)
        .map(|_| {
            let client = client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                client.close()
            })
        })
        .collect();
    for closer in closers {
        closer.join().unwrap().unwrap();
    }

    assert_eq!(engine.stats().close_calls, before + 1);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[test]
fn test_writable_interest_masks_readable() {
    let (_engine, providers) = setup();
    let stream = providers.stream();
    let (_acceptor, client, server) = connected(stream);
    server.write(b"pending").unwrap();

    let selector = stream.open_selector();
    let key = selector.register(&client, Ops::WRITE).unwrap();
    assert_eq!(key.ready_ops(), Ops::NONE);

    assert_eq!(selector.select_now().unwrap(), 1);
    assert_eq!(key.ready_ops(), Ops::WRITE);
    assert!(!key.is_readable());

    key.set_interest_ops(Ops::READ | Ops::WRITE).unwrap();
    selector.select_now().unwrap();
    assert_eq!(key.ready_ops(), Ops::READ | Ops::WRITE);
}

#[test]
fn test_rendezvous_options_before_connect() {
    let (_engine, providers) = setup();
    for provider in [providers.stream(), providers.message()] {
        let channel = provider.open_rendezvous().unwrap();
        assert_eq!(channel.state(), ConnectionState::Unconnected);
        assert_eq!(channel.option(SocketOption::ReuseAddress).unwrap(), OptionValue::Bool(true));
        assert_eq!(channel.option(SocketOption::Rendezvous).unwrap(), OptionValue::Bool(true));
    }
}

#[test]
fn test_finish_connect_never_flips_back() {
    let (_engine, providers) = setup();
    let stream = providers.stream();
    let acceptor = stream.open_server_socket().unwrap();
    let addr = acceptor.bind(any_port()).unwrap();
    acceptor.listen(0).unwrap();

    let client = stream.open_socket().unwrap();
    client.configure_blocking(false).unwrap();
    assert!(!client.connect(addr).unwrap());

    let accepter = {
        let acceptor = acceptor.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            acceptor.accept().unwrap().unwrap()
        })
    };

    let mut seen_true = false;
    for _ in 0..500 {
        let finished = client.finish_connect().unwrap();
        assert!(!(seen_true && !finished));
        seen_true |= finished;
        if seen_true && client.is_connect_finished() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(seen_true);
    assert!(client.finish_connect().unwrap());
    let _server = accepter.join().unwrap();
}

#[test]
fn test_echo_through_selector() {
    let (_engine, providers) = setup();
    let stream = providers.stream();
    let selector = stream.open_selector();

    let acceptor = stream.open_server_socket().unwrap();
    let addr = acceptor.bind(any_port()).unwrap();
    acceptor.listen(0).unwrap();
    acceptor.configure_blocking(false).unwrap();
    selector.register(&acceptor, Ops::ACCEPT).unwrap();

    let client = stream.open_socket().unwrap();
    client.configure_blocking(false).unwrap();
    client.connect(addr).unwrap();
    let client_key = selector.register(&client, Ops::CONNECT).unwrap();

    let mut echoed = Vec::new();
    let mut sent = false;
    for _ in 0..50 {
        selector.select_timeout(Duration::from_secs(1)).unwrap();
        for key in selector.selected_keys() {
            let channel = key.channel().unwrap();
            if key.is_acceptable() {
                while let Some(accepted) = channel.accept().unwrap() {
                    accepted.configure_blocking(false).unwrap();
                    selector.register(&accepted, Ops::READ).unwrap();
                }
            } else if key.is_connectable() {
                assert!(channel.finish_connect().unwrap());
                key.set_interest_ops(Ops::READ | Ops::WRITE).unwrap();
            } else if Arc::ptr_eq(&channel, &client) {
                if key.is_writable() && !sent {
                    assert_eq!(channel.write(b"hello").unwrap(), Transfer::Bytes(5));
                    sent = true;
                    key.set_interest_ops(Ops::READ).unwrap();
                }
                if key.is_readable() {
                    let mut buf = [0u8; 64];
                    if let Transfer::Bytes(n) = channel.read(&mut buf).unwrap() {
                        echoed.extend_from_slice(&buf[..n]);
                    }
                }
            } else if key.is_readable() {
                let mut buf = [0u8; 64];
                match channel.read(&mut buf).unwrap() {
                    Transfer::Bytes(n) => {
                        channel.write(&buf[..n]).unwrap();
                    }
                    Transfer::Eof => key.cancel(),
                    Transfer::WouldBlock => {}
                }
            }
        }
        if echoed.len() == 5 {
            break;
        }
    }
    assert_eq!(echoed, b"hello");
    assert!(client_key.is_valid());
}

#[test]
fn test_non_blocking_rendezvous() {
    let (_engine, providers) = setup();
    let message = providers.message();
    let a = message.open_rendezvous().unwrap();
    let b = message.open_rendezvous().unwrap();
    for channel in [&a, &b] {
        channel.configure_blocking(false).unwrap();
    }
    let a_addr = a.bind(any_port()).unwrap();
    let b_addr = b.bind(any_port()).unwrap();

    let selector = message.open_selector();
    let key = selector.register(&a, Ops::CONNECT).unwrap();

    assert!(!a.connect(b_addr).unwrap());
    assert!(a.is_connection_pending());
    assert!(b.connect(a_addr).unwrap());

    assert_eq!(selector.select_timeout(Duration::from_secs(1)).unwrap(), 1);
    assert!(key.is_connectable());
    assert!(a.finish_connect().unwrap());

    assert_eq!(a.send(b"hi").unwrap(), Transfer::Bytes(2));
    let mut buf = [0u8; 8];
    assert_eq!(b.receive(&mut buf).unwrap(), Transfer::Bytes(2));
    assert_eq!(&buf[..2], b"hi");
}

#[test]
fn test_message_boundaries_preserved() {
    let (_engine, providers) = setup();
    let (_acceptor, client, server) = connected(providers.message());
    assert_eq!(client.kind(), Kind::Message);
    assert_eq!(server.kind(), Kind::Message);

    for message in [&b"one"[..], b"two two", b"three three three"] {
        assert_eq!(client.send(message).unwrap(), Transfer::Bytes(message.len()));
    }
    let mut buf = [0u8; 64];
    for expected in [&b"one"[..], b"two two", b"three three three"] {
        let n = server.receive(&mut buf).unwrap().bytes().unwrap();
        assert_eq!(&buf[..n], expected);
    }
    server.configure_blocking(false).unwrap();
    assert_eq!(server.receive(&mut buf).unwrap(), Transfer::WouldBlock);

    let mut stream_buf = [0u8; 4];
    assert!(matches!(
        server.read(&mut stream_buf),
        Err(Error::Unsupported { op: "read", .. })
    ));
}

#[test]
fn test_closed_channel_drops_out_of_selection() {
    let (_engine, providers) = setup();
    let stream = providers.stream();
    let (_acceptor, client, _server) = connected(stream);
    let selector = stream.open_selector();
    let key = selector.register(&client, Ops::WRITE).unwrap();
    assert_eq!(selector.select_now().unwrap(), 1);

    client.close().unwrap();
    assert_eq!(selector.select_now().unwrap(), 0);
    assert!(!key.is_valid());
    assert!(selector.keys().is_empty());
}

#[test]
fn test_blocking_connect_and_accept_threads() {
    let (_engine, providers) = setup();
    let stream = providers.stream().clone();
    let acceptor = stream.open_server_socket().unwrap();
    let addr = acceptor.bind(any_port()).unwrap();
    acceptor.listen(4).unwrap();

    let server = thread::spawn(move || {
        let accepted = acceptor.accept().unwrap().unwrap();
        let mut buf = [0u8; 16];
        let n = accepted.read(&mut buf).unwrap().bytes().unwrap();
        accepted.write(&buf[..n]).unwrap();
        accepted
    });

    let client = stream.open_socket().unwrap();
    assert!(client.connect(addr).unwrap());
    assert!(client.is_connect_finished());
    client.write(b"ping").unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap().bytes().unwrap();
    assert_eq!(&buf[..n], b"ping");
    let _accepted = server.join().unwrap();
}
