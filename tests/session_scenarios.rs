//! End-to-end scenarios against a mock RFB server.

mod common;

use common::*;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write as _;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use vncpool::{
    Batch, Color, Error, Region, Session, SessionStatus, StepOutcome, VncEvent,
};

const WAIT: Duration = Duration::from_secs(5);

async fn step_until_update(session: &Session) -> StepOutcome {
    tokio::time::timeout(WAIT, async {
        loop {
            let outcome = session.step(&[]).await.expect("step");
            if !outcome.updates.is_empty() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for an update")
}

async fn wait_for_status(session: &Session, status: SessionStatus) {
    tokio::time::timeout(WAIT, async {
        while session.status() != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status:?}"));
}

async fn step_until_error(session: &Session) -> Error {
    tokio::time::timeout(WAIT, async {
        loop {
            match session.step(&[]).await {
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(err) => return err,
            }
        }
    })
    .await
    .expect("timed out waiting for the session to fail")
}

/// S1: handshake, one Raw pixel, step surfaces it with the right channel
/// order; a second step without traffic is an idempotent no-op.
#[tokio::test]
async fn raw_pixel_end_to_end() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 1, 1, 1).await;
        let update = update_message(&[raw_rect(0, 0, 1, 1, &[0x00aabbcc])]);
        stream.write_all(&update).await.unwrap();
        // The reader re-requests after the update.
        read_update_request(&mut stream).await;
        stream
    });

    let session = Session::open("s1", config(&addr)).unwrap();
    let outcome = step_until_update(&session).await;

    assert_eq!(outcome.updates.len(), 1);
    let screen = outcome.screen.expect("screen after first update");
    // Pixel 0x00AABBCC with shifts 0/8/16: R=0xCC, G=0xBB, B=0xAA.
    assert_eq!(screen.pixel(0, 0), Some(Color::new(0xcc, 0xbb, 0xaa)));

    // Swap is idempotent while no new update arrives.
    let again = session.step(&[]).await.unwrap();
    assert!(again.updates.is_empty());
    assert_eq!(*again.screen.unwrap(), *screen);

    session.close();
    assert!(matches!(session.step(&[]).await, Err(Error::Closed)));
    let _stream = server.await.unwrap();
}

/// The front buffer stays stable while the back buffer absorbs further
/// updates; the next step converges the two.
#[tokio::test]
async fn double_buffering_keeps_snapshots_stable() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 2, 1, 1).await;
        let first = update_message(&[raw_rect(0, 0, 2, 1, &[0x11, 0x11])]);
        stream.write_all(&first).await.unwrap();
        read_update_request(&mut stream).await;
        (stream, listener)
    });

    let session = Session::open("buffers", config(&addr)).unwrap();
    let first = step_until_update(&session).await;
    let snapshot = first.screen.unwrap();
    assert_eq!(snapshot.pixel(0, 0), Some(Color::new(0x11, 0, 0)));

    let (mut stream, _listener) = server.await.unwrap();
    let second = update_message(&[raw_rect(1, 0, 1, 1, &[0x22])]);
    stream.write_all(&second).await.unwrap();

    let outcome = step_until_update(&session).await;
    assert_eq!(outcome.updates.len(), 1);
    let screen = outcome.screen.unwrap();
    assert_eq!(screen.pixel(1, 0), Some(Color::new(0x22, 0, 0)));
    // The earlier snapshot still shows the old contents.
    assert_eq!(snapshot.pixel(1, 0), Some(Color::new(0x11, 0, 0)));

    session.close();
}

/// Events written during a step arrive on the wire in order, ahead of the
/// swap.
#[tokio::test]
async fn step_sends_events_in_order() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 1, 1, 1).await;
        let mut events = [0u8; 14];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut events)
            .await
            .unwrap();
        assert_eq!(&events[..8], &[4, 1, 0, 0, 0, 0, 0xff, 0x0d]);
        assert_eq!(&events[8..], &[5, 1, 0, 3, 0, 4]);
        stream
    });

    let session = Session::open("events", config(&addr)).unwrap();
    wait_for_status(&session, SessionStatus::Running).await;

    session
        .step(&[
            VncEvent::Key(vncpool::KeyEvent {
                keysym: 0xff0d,
                down: true,
            }),
            VncEvent::Pointer(vncpool::PointerEvent {
                x: 3,
                y: 4,
                buttons: 1,
            }),
        ])
        .await
        .unwrap();

    let _stream = server.await.unwrap();
    session.close();
}

/// S5: when the deferred log reaches its bound the session pauses and
/// stops requesting updates; the next step drains the log, resumes, and a
/// fresh request goes out.
#[tokio::test]
async fn backlog_pauses_and_step_resumes() {
    let (listener, addr) = listen().await;
    let mut cfg = config(&addr);
    cfg.max_deferred_updates = 5;

    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 1, 1, 1).await;
        for i in 0..5u32 {
            let update = update_message(&[raw_rect(0, 0, 1, 1, &[i])]);
            stream.write_all(&update).await.unwrap();
        }
        // Updates 1-4 trigger re-requests; the fifth pauses the session.
        for _ in 0..4 {
            read_update_request(&mut stream).await;
        }
        stream
    });

    let session = Session::open("backlog", cfg).unwrap();
    wait_for_status(&session, SessionStatus::Paused).await;

    let mut stream = server.await.unwrap();
    // No further request arrives while paused.
    let quiet = tokio::time::timeout(
        Duration::from_millis(100),
        read_update_request(&mut stream),
    )
    .await;
    assert!(quiet.is_err(), "reader kept requesting while paused");

    // One step returns the whole backlog in arrival order and resumes.
    let outcome = session.step(&[]).await.unwrap();
    assert_eq!(outcome.updates.len(), 5);
    let (incremental, _, _, w, h) = read_update_request(&mut stream).await;
    assert!(incremental);
    assert_eq!((w, h), (1, 1));
    wait_for_status(&session, SessionStatus::Running).await;

    session.close();
}

/// S6: an update with 1001 rectangles poisons the session; every later
/// step returns the same protocol error.
#[tokio::test]
async fn excessive_rectangle_count_poisons_the_session() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 1, 1, 1).await;
        let mut msg = vec![0u8, 0];
        msg.extend_from_slice(&1001u16.to_be_bytes());
        stream.write_all(&msg).await.unwrap();
        stream
    });

    let session = Session::open("poisoned", config(&addr)).unwrap();
    let err = step_until_error(&session).await;
    assert!(matches!(err, Error::Protocol(_)));

    let again = session.step(&[]).await.unwrap_err();
    assert!(matches!(again, Error::Protocol(_)));
    assert_eq!(session.status(), SessionStatus::Closed);

    let _stream = server.await.unwrap();
}

/// A connect to a dead port with no retry budget fails fast with a sticky
/// I/O error.
#[tokio::test]
async fn refused_connection_is_sticky() {
    let (listener, addr) = listen().await;
    drop(listener);

    let session = Session::open("refused", config(&addr)).unwrap();
    let err = step_until_error(&session).await;
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(session.status(), SessionStatus::Closed);
}

/// Subscriptions turn into one update request per region.
#[tokio::test]
async fn subscriptions_drive_update_requests() {
    let (listener, addr) = listen().await;
    let mut cfg = config(&addr);
    cfg.subscription = vec![
        Region {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
        },
        Region {
            x: 4,
            y: 0,
            width: 4,
            height: 8,
        },
    ];

    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 8, 8, 0).await;
        // The initial request covers each subscribed region.
        assert_eq!(read_update_request(&mut stream).await, (true, 0, 0, 4, 4));
        assert_eq!(read_update_request(&mut stream).await, (true, 4, 0, 4, 8));
        stream
    });

    let session = Session::open("subs", cfg).unwrap();
    wait_for_status(&session, SessionStatus::Running).await;
    let _stream = server.await.unwrap();
    session.close();
}

/// A Tight session: Fill and palette rectangles decode through the
/// session's persistent streams.
#[tokio::test]
async fn tight_session_end_to_end() {
    let (listener, addr) = listen().await;
    let mut cfg = config(&addr);
    cfg.encoding = vncpool::PreferredEncoding::Tight;

    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 4, 4, 1).await;

        // Fill rectangle covering the screen.
        let fill = update_message(&[(0, 0, 4, 4, 7, vec![0x80, 0x10, 0x20, 0x30])]);
        stream.write_all(&fill).await.unwrap();
        read_update_request(&mut stream).await;

        // CopyFilter rectangle through zlib stream 0 (2x2, 12 bytes).
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[9u8; 12]).unwrap();
        encoder.flush().unwrap();
        let segment = encoder.get_ref().clone();
        let mut payload = vec![0x00u8];
        payload.push(segment.len() as u8); // compact length, < 128
        payload.extend(&segment);
        let basic = update_message(&[(0, 0, 2, 2, 7, payload)]);
        stream.write_all(&basic).await.unwrap();
        read_update_request(&mut stream).await;
        stream
    });

    let session = Session::open("tight", cfg).unwrap();
    let outcome = step_until_update(&session).await;
    let screen = outcome.screen.unwrap();
    assert_eq!(screen.pixel(3, 3), Some(Color::new(0x10, 0x20, 0x30)));

    tokio::time::timeout(WAIT, async {
        loop {
            let outcome = session.step(&[]).await.unwrap();
            if let Some(screen) = &outcome.screen {
                if screen.pixel(0, 0) == Some(Color::new(9, 9, 9)) {
                    assert_eq!(screen.pixel(3, 3), Some(Color::new(0x10, 0x20, 0x30)));
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for the tight rectangles");

    session.close();
    let _stream = server.await.unwrap();
}

/// A ZRLE session: a solid tile decodes through the session's single
/// persistent stream.
#[tokio::test]
async fn zrle_session_end_to_end() {
    let (listener, addr) = listen().await;
    let mut cfg = config(&addr);
    cfg.encoding = vncpool::PreferredEncoding::Zrle;

    let server = tokio::spawn(async move {
        let mut stream = accept_ready(&listener, 3, 3, 1).await;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[0x01, 0xaa, 0xbb, 0xcc]).unwrap(); // solid tile
        encoder.flush().unwrap();
        let segment = encoder.get_ref().clone();

        let mut payload = Vec::new();
        payload.extend_from_slice(&(segment.len() as u32).to_be_bytes());
        payload.extend(&segment);
        let update = update_message(&[(0, 0, 3, 3, 16, payload)]);
        stream.write_all(&update).await.unwrap();
        read_update_request(&mut stream).await;
        stream
    });

    let session = Session::open("zrle", cfg).unwrap();
    let outcome = step_until_update(&session).await;
    let screen = outcome.screen.unwrap();
    assert_eq!(screen.pixel(1, 1), Some(Color::new(0xaa, 0xbb, 0xcc)));

    session.close();
    let _stream = server.await.unwrap();
}

/// Batch semantics: named sessions step together, errors stay per-name,
/// and close(None) tears everything down.
#[tokio::test]
async fn batch_steps_named_sessions() {
    let (listener_a, addr_a) = listen().await;
    let (listener_b, addr_b) = listen().await;

    let server_a = tokio::spawn(async move {
        let mut stream = accept_ready(&listener_a, 1, 1, 1).await;
        let update = update_message(&[raw_rect(0, 0, 1, 1, &[0x44])]);
        stream.write_all(&update).await.unwrap();
        read_update_request(&mut stream).await;
        stream
    });
    let server_b = tokio::spawn(async move {
        let mut stream = accept_ready(&listener_b, 1, 1, 1).await;
        // Poison this session immediately.
        let mut msg = vec![0u8, 0];
        msg.extend_from_slice(&1001u16.to_be_bytes());
        stream.write_all(&msg).await.unwrap();
        stream
    });

    let mut batch = Batch::new();
    batch.open("alpha", config(&addr_a)).unwrap();
    batch.open("beta", config(&addr_b)).unwrap();

    let actions: HashMap<String, Vec<VncEvent>> = [
        ("alpha".to_string(), Vec::new()),
        ("beta".to_string(), Vec::new()),
        ("missing".to_string(), Vec::new()),
    ]
    .into_iter()
    .collect();

    let result = tokio::time::timeout(WAIT, async {
        loop {
            let result = batch.step(&actions).await;
            let alpha_ready = !result.updates.get("alpha").map_or(true, Vec::is_empty);
            let beta_failed = result.errors.get("beta").is_some_and(Option::is_some);
            if alpha_ready && beta_failed {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for batch progress");

    // The missing name was skipped silently.
    assert!(!result.screens.contains_key("missing"));

    let screen = result.screens["alpha"].as_ref().unwrap();
    assert_eq!(screen.pixel(0, 0), Some(Color::new(0x44, 0, 0)));
    assert!(result.errors["alpha"].is_none());

    assert!(result.screens["beta"].is_none());
    assert!(matches!(result.errors["beta"], Some(Error::Protocol(_))));

    let peeked = batch.peek();
    assert!(peeked["alpha"].is_some());

    batch.close(None);
    assert!(batch.is_empty());

    let _a = server_a.await.unwrap();
    let _b = server_b.await.unwrap();
}
