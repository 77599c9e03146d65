use std::ffi::OsStr;
use std::net::{TcpListener, UdpSocket};
use std::process::{Command, Output};
use std::time::Duration;

use serde_json::Value;

fn run_commendable<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_commendable"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute commendable binary: {err}"))
}

fn bound_receiver() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .unwrap_or_else(|err| panic!("failed to bind receiver socket: {err}"));
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap_or_else(|err| panic!("failed to set read timeout: {err}"));
    let port = socket
        .local_addr()
        .unwrap_or_else(|err| panic!("receiver has no local address: {err}"))
        .port();
    (socket, port.to_string())
}

fn receive_json(socket: &UdpSocket) -> Value {
    let mut buffer = [0_u8; 8192];
    let (size, _) = socket
        .recv_from(&mut buffer)
        .unwrap_or_else(|err| panic!("no datagram received: {err}"));
    serde_json::from_slice(&buffer[..size])
        .unwrap_or_else(|err| panic!("datagram is not JSON: {err}"))
}

fn assert_success(output: &Output) {
    if !output.status.success() {
        panic!(
            "commendable command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

// Test IDs: TCLI-001
#[test]
fn like_sends_one_datagram_with_wire_field_names() {
    let (socket, port) = bound_receiver();
    let output = run_commendable([
        "like",
        "--uid",
        "a",
        "--oid",
        "x",
        "--weight",
        "2.5",
        "--dont-activate",
        "--udp-port",
        &port,
    ]);
    assert_success(&output);

    let received = receive_json(&socket);
    assert_eq!(
        received,
        serde_json::json!({
            "Type": "like",
            "User": "a",
            "Object": "x",
            "Weight": 2.5,
            "DontActivate": true
        })
    );

    let echoed: Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("stdout is not JSON: {err}"));
    assert_eq!(echoed, received);
}

// Test IDs: TCLI-002
#[test]
fn view_and_deactivate_omit_unused_fields() {
    let (socket, port) = bound_receiver();

    assert_success(&run_commendable(["--udp-port", &port, "view", "--uid", "a", "--oid", "x"]));
    assert_eq!(
        receive_json(&socket),
        serde_json::json!({ "Type": "view", "User": "a", "Object": "x" })
    );

    assert_success(&run_commendable(["--udp-port", &port, "deactivate", "--oid", "x"]));
    assert_eq!(receive_json(&socket), serde_json::json!({ "Type": "deactivate", "Object": "x" }));
}

// Test IDs: TCLI-003
#[test]
fn missing_required_arguments_fail() {
    for args in [vec!["like", "--oid", "x"], vec!["view", "--uid", "a"], vec!["recommend"]] {
        let output = run_commendable(&args);
        assert!(!output.status.success(), "expected failure for {args:?}");
    }

    let output = run_commendable(["recommend", "--uid", "a", "--actives", "sometimes"]);
    assert!(!output.status.success());
}

// Test IDs: TCLI-004
#[test]
fn queries_against_a_closed_port_fail() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to reserve a port: {err}"));
        listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener has no local address: {err}"))
            .port()
            .to_string()
    };

    let output = run_commendable(["--json-port", &port, "actives"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("/actives"));
}
