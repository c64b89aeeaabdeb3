//! Entry point: parse the CLI, install logging, bind the proxy, and drive the
//! single-threaded event loop to completion (§10.3).

use std::os::unix::net::UnixStream;

use clap::Parser;
use tracing::{debug, info, warn};

use dbus_proxy::cli::Args;
use dbus_proxy::error::ProxyError;
use dbus_proxy::event_loop::{EventLoop, Readiness};
use dbus_proxy::proxy::Proxy;
use dbus_proxy::{logging, proxy};

fn main() -> Result<(), ProxyError> {
    let args = Args::parse();
    let config = args.into_config()?;
    logging::init(config.log);

    let mut proxy = Proxy::bind(
        &config.socket_path,
        config.bus_address,
        config.filter,
        config.log,
        config.sloppy_names,
        config.filters,
    )?;

    let mut event_loop = EventLoop::new(&proxy)?;

    if let Some(fd) = config.liveness_fd {
        event_loop.register_liveness(fd)?;
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        nix::unistd::write(borrowed, &[0u8])
            .map_err(|e| ProxyError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        debug!(fd, "wrote liveness byte");
    }

    info!(bus = %proxy.bus_address(), "proxy listening");

    loop {
        let events = event_loop.poll(None)?;
        for event in events {
            match event {
                Readiness::Listener => loop {
                    match proxy.accept_one(connect_bus) {
                        Ok(Some(id)) => {
                            if let Err(e) = event_loop.register_client(id, &proxy) {
                                warn!(client = id, error = %e, "failed to register new client");
                                proxy.remove_client(id);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "failed to accept/connect a new client");
                            break;
                        }
                    }
                },
                Readiness::Liveness { hung_up } => {
                    if hung_up {
                        info!("liveness descriptor closed, shutting down");
                        return Ok(());
                    }
                }
                Readiness::Side { client, side, .. } => {
                    if let Err(e) = proxy.service_side(client, side) {
                        warn!(client, side = side.0, error = %e, "side error");
                    }
                }
            }
        }

        let to_reap: Vec<proxy::ClientId> = proxy
            .clients()
            .filter(|(_, c)| c.can_be_released())
            .map(|(id, _)| *id)
            .collect();
        for id in &to_reap {
            event_loop.deregister_client(*id, &proxy);
        }
        proxy.reap_closed_clients();
    }
}

/// Connect to the upstream bus address. Supports the D-Bus server-address grammar's
/// `unix:path=...`/`unix:abstract=...` forms, falling back to treating the whole
/// string as a filesystem path (§6 "opaque to this spec": a minimal connector is
/// still needed for a runnable binary).
fn connect_bus(address: &str) -> dbus_proxy_wire::WireResult<UnixStream> {
    let path = parse_unix_address(address).ok_or_else(|| {
        dbus_proxy_wire::WireError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported bus address {address:?}"),
        ))
    })?;
    UnixStream::connect(path).map_err(dbus_proxy_wire::WireError::Io)
}

fn parse_unix_address(address: &str) -> Option<&str> {
    if let Some(rest) = address.strip_prefix("unix:path=") {
        return Some(rest.split(',').next().unwrap_or(rest));
    }
    if address.starts_with("unix:abstract=") {
        return None;
    }
    Some(address)
}
