//! Lifecycle drills: cancellation, crash recovery, shutdown sequences.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gatehouse::auxiliary::ControlFile;
use gatehouse::config::Config;
use gatehouse::supervisor::{BootError, Builder, ControlEvent, WakeReason};

use support::*;

#[tokio::test]
async fn cancel_round_trip() {
    let server = TestServer::start_with(3, None, |b| b.engine(drill_engine())).await;

    let session = open_session(server.port, "alice").await.expect("admitted");
    let (worker_id, cancel_secret) = (session.worker_id, session.cancel_secret);

    // Park the worker in an interruptible statement.
    let inflight = tokio::spawn(async move {
        let mut session = session;
        let result = session.query("sleep").await;
        (session, result)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A wrong secret produces no signal: the statement keeps running.
    send_cancel(server.port, worker_id, cancel_secret ^ 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!inflight.is_finished(), "bad secret must not cancel");

    // An unknown worker id is equally silent.
    send_cancel(server.port, worker_id + 100, cancel_secret).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!inflight.is_finished());

    // The exact pair delivers the interrupt.
    send_cancel(server.port, worker_id, cancel_secret).await;
    let (mut session, result) = inflight.await.unwrap();
    assert_eq!(result.unwrap_err(), "57014");

    // The session survives the cancellation.
    let (rows, _) = session.query("still alive").await.expect("session lives");
    assert_eq!(rows[0][0].as_deref(), Some("still alive"));
    session.terminate().await;
}

#[tokio::test]
async fn worker_crash_quiesces_and_recovers() {
    let server = TestServer::start_with(5, None, |b| b.engine(drill_engine())).await;

    let checkpoint_before = ControlFile::load(server.data_dir.path())
        .unwrap()
        .unwrap()
        .checkpoint;

    let mut survivor = open_session(server.port, "w2").await.expect("admitted");
    let mut crasher = open_session(server.port, "w1").await.expect("admitted");

    // The crashing statement takes its worker down with a nonzero exit.
    let crash_result = crasher.query("boom").await;
    assert!(crash_result.is_err(), "crashing worker answers nothing useful");

    // The peer is forcibly terminated while shared state is rebuilt.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match survivor.query("anyone there").await {
            Err(_) => break,
            Ok(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "peers must not survive a crash"
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }

    // Recovery relaunches startup; eventually sessions are admitted
    // again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match open_session(server.port, "after").await {
            Ok(mut session) => {
                session.terminate().await;
                break;
            }
            Err(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "server did not recover"
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }

    // The startup child replayed the log: the control record moved.
    let ctl = ControlFile::load(server.data_dir.path()).unwrap().unwrap();
    assert_eq!(ctl.state, "running");
    assert!(ctl.checkpoint > checkpoint_before, "recovery writes a checkpoint");
}

#[tokio::test]
async fn smart_then_fast_shutdown() {
    let mut server = TestServer::start().await;
    let mut session = open_session(server.port, "alice").await.expect("admitted");

    server.events.send(ControlEvent::SmartStop);

    // New sessions are refused while existing ones keep working.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match open_session(server.port, "late").await {
            Err(code) if code == "57P03" => break,
            other => {
                if let Ok(mut extra) = other {
                    extra.terminate().await;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "smart stop never took effect"
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    let (rows, _) = session.query("still here").await.expect("smart keeps sessions");
    assert_eq!(rows[0][0].as_deref(), Some("still here"));

    // Escalate: the session is told to abort and the supervisor exits
    // cleanly once the page writer has checkpointed.
    server.events.send(ControlEvent::FastStop);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match session.query("too late").await {
            Err(_) => break,
            Ok(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "fast stop aborts sessions"
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }

    let code = tokio::time::timeout(Duration::from_secs(10), &mut server.handle)
        .await
        .expect("supervisor exit")
        .unwrap();
    assert_eq!(code, 0);

    let ctl = ControlFile::load(server.data_dir.path()).unwrap().unwrap();
    assert_eq!(ctl.state, "clean", "shutdown checkpoint was written");
}

#[tokio::test]
async fn immediate_stop_terminates_quickly_with_sessions_open() {
    let mut server = TestServer::start().await;
    let _session = open_session(server.port, "alice").await.expect("admitted");

    server.events.send(ControlEvent::ImmediateStop);
    let code = tokio::time::timeout(Duration::from_secs(5), &mut server.handle)
        .await
        .expect("immediate stop is bounded")
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn repeated_reload_keeps_serving() {
    let server = TestServer::start().await;

    std::fs::write(
        server.data_dir.path().join("gatehouse.conf"),
        "authentication_timeout = 30\nlog_connections = on\n",
    )
    .unwrap();

    for _ in 0..3 {
        server.events.send(ControlEvent::Reload);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut session = open_session(server.port, "alice").await.expect("admitted");
        let (rows, _) = session.query("ping").await.expect("served");
        assert_eq!(rows[0][0].as_deref(), Some("ping"));
        session.terminate().await;
    }

    // A broken override is logged and the previous settings stay live.
    std::fs::write(
        server.data_dir.path().join("gatehouse.conf"),
        "port = off\n",
    )
    .unwrap();
    server.events.send(ControlEvent::Reload);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut session = open_session(server.port, "alice").await.expect("still serving");
    session.terminate().await;
}

#[tokio::test]
async fn reload_and_wake_refresh_authentication_state() {
    struct CountingAuthenticator(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl gatehouse::worker::Authenticator for CountingAuthenticator {
        async fn authenticate(
            &self,
            _context: &gatehouse::server::ConnectionContext,
            _rng: &mut rand::rngs::StdRng,
        ) -> Result<(), gatehouse::worker::AuthError> {
            Ok(())
        }

        fn refresh(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let server = TestServer::start_with(3, None, move |b| {
        b.authenticator(Arc::new(CountingAuthenticator(counter)))
    })
    .await;

    // Both a configuration reload and the dedicated wake-up re-read
    // authentication state.
    server.events.send(ControlEvent::Reload);
    server.events.send(ControlEvent::Wake(WakeReason::AuthFiles));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while refreshes.load(Ordering::SeqCst) < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "authentication state was never refreshed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn saturation_at_twice_the_maximum() {
    // One session slot: the soft cap admits two children, the third is
    // refused outright.
    let server = TestServer::start_with(1, None, |b| {
        b.authenticator(Arc::new(SlowAuthenticator(Duration::from_secs(3))))
    })
    .await;
    // Give the readiness probe's worker a moment to be reaped.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Two connections sit in the handshake window (slow authentication).
    let mut first = server.connect().await;
    tokio::io::AsyncWriteExt::write_all(&mut first, &startup_packet(&[("user", "a")]))
        .await
        .unwrap();
    let mut second = server.connect().await;
    tokio::io::AsyncWriteExt::write_all(&mut second, &startup_packet(&[("user", "b")]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The third is SATURATED at admission.
    let rejected = open_session(server.port, "c").await;
    assert_eq!(rejected.unwrap_err(), "53300");
}

#[tokio::test]
async fn second_supervisor_refuses_a_locked_data_directory() {
    let server = TestServer::start().await;

    let config = Config {
        data_dir: server.data_dir.path().to_path_buf(),
        listen_addresses: vec!["127.0.0.1".to_string()],
        port: 0,
        ..Config::default()
    };
    match Builder::new(config).boot().await {
        Err(BootError::Lock(_)) => {}
        Err(other) => panic!("expected a lock conflict, got {other}"),
        Ok(_) => panic!("second supervisor must not boot"),
    }
}
