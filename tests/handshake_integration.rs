//! End-to-end handshake behavior against a booted supervisor.

mod support;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use support::*;

#[tokio::test]
async fn clean_boot_then_client_echo() {
    let server = TestServer::start().await;

    // Database omitted: it defaults to the user name and the session
    // comes up normally.
    let mut session = open_session(server.port, "alice").await.expect("admitted");
    assert_ne!(session.worker_id, 0);

    let (rows, tag) = session.query("hello supervisor").await.expect("echo");
    assert_eq!(rows, vec![vec![Some("hello supervisor".to_string())]]);
    assert_eq!(tag, "ECHO 1");

    session.terminate().await;
}

#[tokio::test]
async fn unsupported_protocol_is_rejected_without_a_worker() {
    let server = TestServer::start().await;

    let mut stream = server.connect().await;
    let mut body = ((4u32 << 16) as u32).to_be_bytes().to_vec();
    body.push(0);
    let mut wire = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(&body);
    stream.write_all(&wire).await.unwrap();

    let (ty, body) = read_message(&mut stream).await.unwrap();
    assert_eq!(ty, b'E');
    assert_eq!(error_code(&body).as_deref(), Some("0A000"));

    // The server is unaffected; the next client is served.
    let mut session = open_session(server.port, "alice").await.expect("admitted");
    session.terminate().await;
}

#[tokio::test]
async fn missing_user_is_rejected() {
    let server = TestServer::start().await;

    let mut stream = server.connect().await;
    stream
        .write_all(&startup_packet(&[("database", "inventory")]))
        .await
        .unwrap();

    let (ty, body) = read_message(&mut stream).await.unwrap();
    assert_eq!(ty, b'E');
    assert_eq!(error_code(&body).as_deref(), Some("28000"));
}

#[tokio::test]
async fn legacy_protocol_startup_is_accepted() {
    let server = TestServer::start().await;

    let mut stream = server.connect().await;
    let mut body = (2u32 << 16).to_be_bytes().to_vec();
    let mut record = vec![0u8; 64 + 32 + 64 + 64 + 64];
    record[..9].copy_from_slice(b"inventory");
    record[64..64 + 5].copy_from_slice(b"alice");
    body.extend_from_slice(&record);
    let mut wire = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(&body);
    stream.write_all(&wire).await.unwrap();

    let session = open_greeting(stream).await.expect("admitted");
    drop(session);
}

/// Read the greeting of an already-sent startup.
async fn open_greeting(
    mut stream: tokio::net::TcpStream,
) -> Result<tokio::net::TcpStream, String> {
    loop {
        let (ty, body) = match read_message(&mut stream).await {
            Ok(message) => message,
            Err(_) => return Err("CLOSED".to_string()),
        };
        match ty {
            b'E' => return Err(error_code(&body).unwrap_or_default()),
            b'Z' => return Ok(stream),
            _ => {}
        }
    }
}

#[tokio::test]
async fn startup_body_at_the_maximum_length_is_processed() {
    let server = TestServer::start().await;

    // Pad the packet to a body of exactly 10000 bytes.
    let probe = startup_packet(&[("user", "alice"), ("pad", "")]);
    let base_body = probe.len() - 4;
    let filler = "x".repeat(10000 - base_body);
    let packet = startup_packet(&[("user", "alice"), ("pad", &filler)]);
    assert_eq!(packet.len() - 4, 10000);

    let mut stream = server.connect().await;
    stream.write_all(&packet).await.unwrap();
    let session = open_greeting(stream).await.expect("admitted at the boundary");
    drop(session);
}

#[tokio::test]
async fn startup_body_one_past_the_maximum_is_a_violation() {
    let server = TestServer::start().await;

    let probe = startup_packet(&[("user", "alice"), ("pad", "")]);
    let base_body = probe.len() - 4;
    let filler = "x".repeat(10001 - base_body);
    let packet = startup_packet(&[("user", "alice"), ("pad", &filler)]);
    assert_eq!(packet.len() - 4, 10001);

    let mut stream = server.connect().await;
    stream.write_all(&packet).await.unwrap();

    let (ty, body) = read_message(&mut stream).await.unwrap();
    assert_eq!(ty, b'E');
    assert_eq!(error_code(&body).as_deref(), Some("08P01"));
}

#[tokio::test]
async fn negotiation_on_network_endpoint_without_tls_answers_n() {
    let server = TestServer::start().await;

    let mut stream = server.connect().await;
    stream
        .write_all(&request_packet(NEGOTIATE_CODE, &[]))
        .await
        .unwrap();
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"N");

    // The following startup packet is processed normally.
    stream
        .write_all(&startup_packet(&[("user", "alice")]))
        .await
        .unwrap();
    let session = open_greeting(stream).await.expect("admitted");
    drop(session);
}

#[tokio::test]
async fn negotiation_storm_on_the_local_endpoint() {
    let socket_dir = tempfile::tempdir().unwrap();
    let server =
        TestServer::start_with(50, Some(socket_dir.path().to_path_buf()), |builder| builder)
            .await;
    let socket_path = server.socket_path.clone().expect("local endpoint");

    for i in 0..1000 {
        let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        stream
            .write_all(&request_packet(NEGOTIATE_CODE, &[]))
            .await
            .unwrap();
        let mut answer = [0u8; 1];
        stream.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"N", "local endpoints never offer secure transport");

        // Every startup packet after the refusal is processed normally.
        let user = format!("client{i}");
        let mut session = open_session_on(stream, &user).await.expect("admitted");
        session.terminate().await;
    }
}
