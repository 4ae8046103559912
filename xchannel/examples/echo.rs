//! Echo server and client driven by one selector.
//!
//! The server accepts connections and echoes whatever it reads; the client
//! sends a few lines and prints the echoes.
//!
//! Run with: cargo run --example echo

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use xchannel::{Config, MemoryEngine, Ops, Providers, Result, Transfer};

const LINES: [&str; 3] = ["hello", "from", "xchannel"];

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let providers = Providers::new(
        Arc::new(MemoryEngine::default()),
        Config::new().with_blocking(false),
    );
    let stream = providers.stream();
    let selector = stream.open_selector();

    let server = stream.open_server_socket()?;
    let addr = server.bind("127.0.0.1:7878".parse().expect("valid address"))?;
    server.listen(0)?;
    selector.register(&server, Ops::ACCEPT)?;
    info!("echo server listening on {}", addr);

    let client = stream.open_socket()?;
    client.connect(addr)?;
    selector.register(&client, Ops::CONNECT)?;

    let mut pending = LINES.iter();
    let expected: usize = LINES.iter().map(|line| line.len()).sum();
    let mut echoed = 0;
    let mut buf = [0u8; 256];

    while echoed < expected {
        if selector.select_timeout(Duration::from_secs(5))? == 0 {
            info!("timed out waiting for readiness");
            break;
        }
        for key in selector.selected_keys() {
            let Some(channel) = key.channel() else { continue };

            if key.is_acceptable() {
                while let Some(accepted) = channel.accept()? {
                    info!("accepted connection from {:?}", accepted.remote_addr());
                    selector.register(&accepted, Ops::READ)?;
                }
            } else if key.is_connectable() {
                if channel.finish_connect()? {
                    info!("client connected to {}", addr);
                    key.set_interest_ops(Ops::READ | Ops::WRITE)?;
                }
            } else if Arc::ptr_eq(&channel, &client) {
                if key.is_writable() {
                    match pending.next() {
                        Some(line) => {
                            channel.write(line.as_bytes())?;
                            debug!("client sent {:?}", line);
                        }
                        None => key.set_interest_ops(Ops::READ)?,
                    }
                }
                if key.is_readable() {
                    if let Transfer::Bytes(n) = channel.read(&mut buf)? {
                        info!("client got echo {:?}", String::from_utf8_lossy(&buf[..n]));
                        echoed += n;
                    }
                }
            } else if key.is_readable() {
                match channel.read(&mut buf)? {
                    Transfer::Bytes(n) => {
                        channel.write(&buf[..n])?;
                    }
                    Transfer::Eof => {
                        info!("peer {:?} closed", channel.remote_addr());
                        channel.close()?;
                    }
                    Transfer::WouldBlock => {}
                }
            }
        }
    }

    client.close()?;
    server.close()?;
    selector.close();
    info!("done");
    Ok(())
}
