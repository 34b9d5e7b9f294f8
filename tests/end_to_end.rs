#![cfg(unix)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gpurm::engine::SimulatedBackend;
use gpurm::ipc::{
    ChannelKind, ConnectionState, Endpoint, PixelFormat, RmClient, Status, PROTOCOL_VERSION,
};
use gpurm::server::{start_server, Dispatcher, ServerConfig, ServerHandle};
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn unique_name() -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "gpurm-e2e-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn config(socket: &Path, gfx_engines: usize) -> ServerConfig {
    ServerConfig {
        rendezvous_name: None,
        socket_path: socket.to_path_buf(),
        gfx_engines,
        dma_engines: 1,
        gfx_ring_kib: 64,
        dma_ring_kib: 64,
        poll_interval: Duration::from_millis(5),
        display_heads: 1,
        aperture_size: 16 * 1024 * 1024,
    }
}

fn start(config: &ServerConfig) -> anyhow::Result<ServerHandle> {
    init_tracing();
    let dispatcher = Dispatcher::new(config, Arc::new(SimulatedBackend::new()))?;
    Ok(start_server(config, Arc::new(dispatcher))?)
}

fn client(socket: &Path) -> anyhow::Result<RmClient> {
    Ok(RmClient::connect(&Endpoint::socket(socket))?)
}

#[test]
fn calls_before_init_are_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let server = start(&config(&socket, 1))?;

    let rm = client(&socket)?;
    let err = rm.get_display_info(0, 0).unwrap_err();
    assert_eq!(err.status(), Status::NotInitialized);

    let info = rm.init()?;
    assert_eq!(info.protocol_version, PROTOCOL_VERSION);
    assert_eq!(info.engines, 2);
    assert_eq!(info.display_heads, 1);

    rm.shutdown()?;
    server.shutdown();
    assert!(!socket.exists());
    Ok(())
}

#[test]
fn display_info_honours_requested_size() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let server = start(&config(&socket, 1))?;
    let rm = client(&socket)?;
    rm.init()?;

    let (full, copied) = rm.get_display_info(0, 0)?;
    assert_eq!(copied, 16);
    assert_eq!(
        (full.width, full.height, full.refresh, full.pixel_clock),
        (1920, 1080, 60, 148_500)
    );

    let (partial, copied) = rm.get_display_info(0, 8)?;
    assert_eq!(copied, 8);
    assert_eq!((partial.width, partial.height, partial.refresh), (1920, 1080, 0));

    rm.set_display_mode(0, 1280, 720, 60, PixelFormat::Xrgb8888)?;
    let (info, _) = rm.get_display_info(0, 0)?;
    assert_eq!((info.width, info.height, info.pixel_clock), (1280, 720, 55_296));

    let err = rm
        .set_display_mode(0, 100, 100, 60, PixelFormat::Argb8888)
        .unwrap_err();
    assert_eq!(err.status(), Status::BadValue);

    server.shutdown();
    Ok(())
}

#[test]
fn freeing_a_parent_frees_the_whole_subtree() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let server = start(&config(&socket, 1))?;
    let rm = client(&socket)?;
    rm.init()?;

    let root = rm.allocate_memory(4096, None, Some(0x10))?;
    rm.allocate_memory(8192, Some(0x10), Some(0x11))?;
    rm.allocate_memory(100, Some(0x11), Some(0x12))?;
    let other = rm.allocate_memory(4096, None, None)?;
    assert_eq!(root.handle, 0x10);
    assert_ne!(root.gpu_addr, other.gpu_addr);

    let dispatcher = server.dispatcher();
    assert_eq!(dispatcher.resources().len(), 4);
    assert_eq!(dispatcher.aperture_used(), 3 * 4096 + 8192);

    rm.free_memory(0x10)?;
    assert_eq!(dispatcher.resources().len(), 1);
    assert_eq!(dispatcher.aperture_used(), 4096);
    assert_eq!(rm.free_memory(0x11).unwrap_err().status(), Status::NotFound);
    assert_eq!(
        rm.allocate_memory(64, Some(0x12), None).unwrap_err().status(),
        Status::NotFound
    );

    server.shutdown();
    Ok(())
}

#[test]
fn submitted_work_reaches_its_fence() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let server = start(&config(&socket, 1))?;
    let rm = client(&socket)?;
    rm.init()?;

    let token = rm.acquire_engine(0, Duration::ZERO)?;
    let first = rm.submit(token, &[0xFFFF_1000, 0, 0])?;
    let second = rm.submit(token, &[0xFFFF_1000])?;
    assert_eq!((first, second), (1, 2));

    let completed = rm.wait_fence(token, second, Duration::from_millis(500))?;
    assert!(completed >= second);
    assert_eq!(
        rm.wait_fence(token, 99, Duration::ZERO).unwrap_err().status(),
        Status::BadValue
    );

    rm.release_engine(token)?;
    assert_eq!(rm.submit(token, &[0]).unwrap_err().status(), Status::BadValue);
    assert_eq!(
        server.dispatcher().metrics().snapshot().fences_submitted_total,
        2
    );

    server.shutdown();
    Ok(())
}

#[test]
fn disconnect_returns_engines_to_the_pool() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let server = start(&config(&socket, 0))?;

    let holder = client(&socket)?;
    holder.init()?;
    holder.acquire_engine(0, Duration::ZERO)?;

    let waiter = client(&socket)?;
    waiter.init()?;
    let err = waiter.acquire_engine(0, Duration::from_millis(20)).unwrap_err();
    assert_eq!(err.status(), Status::WouldBlock);

    let started = Instant::now();
    let dropper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        drop(holder);
    });
    let token = waiter.acquire_engine(0, Duration::from_secs(5))?;
    assert!(started.elapsed() < Duration::from_secs(5));
    dropper.join().unwrap();

    assert_eq!(server.dispatcher().engines().held_count(), 1);
    waiter.release_engine(token)?;
    server.shutdown();
    Ok(())
}

#[test]
fn stale_socket_is_replaced_and_live_one_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket)?);
    assert!(socket.exists());

    let server = start(&config(&socket, 1))?;
    let second = start(&config(&socket, 1));
    assert!(matches!(
        second.unwrap_err().downcast_ref::<gpurm::server::ServerError>(),
        Some(gpurm::server::ServerError::SocketInUse(_))
    ));
    server.shutdown();
    Ok(())
}

#[test]
fn server_shutdown_disconnects_clients() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let server = start(&config(&socket, 1))?;
    let rm = client(&socket)?;
    rm.init()?;

    server.shutdown();
    assert!(rm.init().is_err());
    assert_eq!(rm.connection().state(), ConnectionState::Disconnected);
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn rendezvous_channel_is_preferred() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("rm.sock");
    let name = unique_name();
    let config = ServerConfig {
        rendezvous_name: Some(name.clone()),
        ..config(&socket, 1)
    };
    let server = start(&config)?;
    assert_eq!(server.rendezvous_name(), Some(name.as_str()));

    let rm = RmClient::connect(&Endpoint {
        rendezvous: Some(name),
        socket_path: socket.clone(),
    })?;
    assert_eq!(
        rm.connection().state(),
        ConnectionState::Connected(ChannelKind::Rendezvous)
    );
    rm.init()?;

    let fallback = RmClient::connect(&Endpoint {
        rendezvous: Some(unique_name()),
        socket_path: socket,
    })?;
    assert_eq!(
        fallback.connection().state(),
        ConnectionState::Connected(ChannelKind::Socket)
    );

    server.shutdown();
    Ok(())
}
