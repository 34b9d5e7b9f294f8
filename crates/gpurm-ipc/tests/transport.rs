#![cfg(unix)]

use std::os::unix::net::UnixListener;
use std::sync::mpsc;
use std::thread;

use gpurm_ipc::transport::{read_request, write_response};
use gpurm_ipc::{
    connect, ChannelKind, ClientError, ConnectionState, Endpoint, Opcode, Request, Response,
    RmClient, Status, SubmitFlags, TransportError,
};
use pretty_assertions::assert_eq;

/// Accepts one client, records every request and answers each with `reply`.
fn fake_server(
    listener: UnixListener,
    reply: fn(&Request) -> Response,
) -> (mpsc::Receiver<Request>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        while let Some(req) = read_request(&mut stream).unwrap() {
            write_response(&mut stream, &reply(&req)).unwrap();
            tx.send(req).unwrap();
        }
    });
    (rx, handle)
}

#[test]
fn falls_back_to_socket_when_rendezvous_is_absent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rm.sock");
    let listener = UnixListener::bind(&path)?;
    let (rx, server) = fake_server(listener, |_| Response::ok(0, 0));

    let endpoint = Endpoint {
        rendezvous: Some(format!("gpurm-test-absent-{}", std::process::id())),
        socket_path: path,
    };
    let conn = connect(&endpoint)?;
    assert_eq!(conn.state(), ConnectionState::Connected(ChannelKind::Socket));

    conn.shutdown()?;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(rx.recv()?.opcode(), Some(Opcode::Shutdown));

    assert!(matches!(
        conn.request(&Request::new(Opcode::Init)),
        Err(TransportError::NotInitialized)
    ));
    server.join().unwrap();
    Ok(())
}

#[test]
fn client_stub_encodes_engine_calls() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rm.sock");
    let listener = UnixListener::bind(&path)?;
    let (rx, server) = fake_server(listener, |req| match req.opcode() {
        Some(Opcode::WaitFence) => Response::from_status(Status::WouldBlock),
        _ => Response::ok(0x1000, 0),
    });

    let client = RmClient::connect(&Endpoint::socket(&path))?;

    let token = client.acquire_engine(0b11, std::time::Duration::from_millis(250))?;
    assert_eq!(token, 0x1000);
    let acquire = rx.recv()?;
    assert_eq!(acquire.flags, SubmitFlags::ACQUIRE.bits());
    assert_eq!((acquire.param1, acquire.param2), (0b11, 250));

    client.submit(token, &[0xAAAA_0001, 0xBBBB_0002, 0xCCCC_0003])?;
    let submit = rx.recv()?;
    assert_eq!(SubmitFlags::from_bits_retain(submit.flags).dword_count(), 3);
    assert_eq!(submit.param2, 0xBBBB_0002_AAAA_0001);
    assert_eq!(submit.param3, 0x0000_0000_CCCC_0003);

    let err = client
        .wait_fence(token, 1, std::time::Duration::from_millis(5))
        .unwrap_err();
    assert_eq!(err.status(), Status::WouldBlock);
    assert!(matches!(
        err,
        ClientError::Status {
            opcode: Opcode::WaitFence,
            ..
        }
    ));

    let err = client.submit(token, &[0; 5]).unwrap_err();
    assert!(matches!(err, ClientError::TooManyDwords(5)));

    client.shutdown()?;
    server.join().unwrap();
    Ok(())
}
