//! Rendezvous handshake between two peers.
//!
//! Both peers bind a known address and dial each other at the same time.
//! Neither side listens.
//!
//! Run with: cargo run --example rendezvous

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use log::info;
use xchannel::{Config, MemoryEngine, Provider, Providers, Result, Transfer};

fn peer(provider: Provider, name: &'static str, local: SocketAddr, remote: SocketAddr) -> Result<()> {
    let channel = provider.open_rendezvous()?;
    channel.bind(local)?;
    channel.connect(remote)?;
    info!("{} connected {} -> {}", name, local, remote);

    channel.send(format!("greetings from {}", name).as_bytes())?;
    let mut buf = [0u8; 128];
    if let Transfer::Bytes(n) = channel.receive(&mut buf)? {
        info!("{} received {:?}", name, String::from_utf8_lossy(&buf[..n]));
    }
    channel.close()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let providers = Providers::new(Arc::new(MemoryEngine::default()), Config::default());
    let message = providers.message().clone();

    let left: SocketAddr = "127.0.0.1:9001".parse().expect("valid address");
    let right: SocketAddr = "127.0.0.1:9002".parse().expect("valid address");

    let other = {
        let message = message.clone();
        thread::spawn(move || peer(message, "right", right, left))
    };
    peer(message, "left", left, right)?;
    match other.join() {
        Ok(result) => result,
        Err(_) => panic!("right peer panicked"),
    }
}
