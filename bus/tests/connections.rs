//! Connection-lifecycle scenarios: idle expiry, reply fallback after a
//! disconnect, and shutdown draining.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use peerbus::{Access, Allow, AuthLevel, BusBuilder, SendOption};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn idle_outgoing_connection_expires_and_reconnects() {
    let handshakes = Arc::new(AtomicUsize::new(0));
    let handshakes_in_allow = handshakes.clone();

    let server = BusBuilder::new()
        .listen_on("127.0.0.1:0".parse().unwrap())
        .allow(move |_ip, _pubkey| {
            handshakes_in_allow.fetch_add(1, Ordering::SeqCst);
            Some(Allow {
                auth: AuthLevel::None,
                remote_sn: false,
            })
        })
        .add_category("x", Access::default(), 0, Some(200))
        .unwrap()
        .add_command("x", "noop", |_msg| {})
        .unwrap()
        .start()
        .unwrap();
    let addr = server.listen_addrs()[0].to_string();

    let client = BusBuilder::new().start().unwrap();

    // Explicit connect with a very short keep-alive.
    client
        .connect(server.pubkey(), Duration::from_millis(200), Some(&addr))
        .unwrap();
    wait_for("first handshake", || handshakes.load(Ordering::SeqCst) == 1);

    // Idle well past the keep-alive; the expiry scan closes the socket.
    std::thread::sleep(Duration::from_millis(700));

    // The next send builds a brand-new connection.
    client
        .send(
            server.pubkey(),
            "x.noop",
            &[],
            &[SendOption::Hint(addr)],
        )
        .unwrap();
    wait_for("reconnect handshake", || {
        handshakes.load(Ordering::SeqCst) == 2
    });
}

#[test]
fn connect_keeps_raising_the_idle_timeout() {
    let handshakes = Arc::new(AtomicUsize::new(0));
    let handshakes_in_allow = handshakes.clone();

    let server = BusBuilder::new()
        .listen_on("127.0.0.1:0".parse().unwrap())
        .allow(move |_ip, _pubkey| {
            handshakes_in_allow.fetch_add(1, Ordering::SeqCst);
            Some(Allow {
                auth: AuthLevel::None,
                remote_sn: false,
            })
        })
        .start()
        .unwrap();
    let addr = server.listen_addrs()[0].to_string();

    let client = BusBuilder::new().start().unwrap();

    // Short keep-alive first, then a longer one: the longer value wins, so
    // the connection survives past the shorter expiry.
    client
        .connect(server.pubkey(), Duration::from_millis(200), Some(&addr))
        .unwrap();
    client
        .connect(server.pubkey(), Duration::from_secs(60), Some(&addr))
        .unwrap();
    wait_for("handshake", || handshakes.load(Ordering::SeqCst) == 1);

    std::thread::sleep(Duration::from_millis(700));
    client
        .send(server.pubkey(), "x.noop", &[], &[SendOption::Optional])
        .unwrap();
    // Still the original connection: an optional send found it, and no
    // second handshake happened.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);
}

#[test]
fn reply_to_non_service_node_is_dropped_after_disconnect() {
    let (req_seen_tx, req_seen) = std_mpsc::channel();
    let req_seen_tx = Mutex::new(req_seen_tx);
    let (release_tx, release) = std_mpsc::channel::<()>();
    let release = Arc::new(Mutex::new(release));
    let release_in_handler = release.clone();

    let server = BusBuilder::new()
        .listen_on("127.0.0.1:0".parse().unwrap())
        .allow(|_ip, _pubkey| {
            Some(Allow {
                auth: AuthLevel::None,
                remote_sn: false,
            })
        })
        .add_category("x", Access::default(), 1, Some(200))
        .unwrap()
        .add_command("x", "req", move |msg| {
            req_seen_tx.lock().unwrap().send(()).unwrap();
            // Hold the reply until the test has torn the connection down.
            let _ = release_in_handler.lock().unwrap().recv();
            let result = msg.reply("x.res", &[]);
            // The reply call itself succeeds; the proxy drops it later.
            assert!(result.is_ok());
        })
        .unwrap()
        .start()
        .unwrap();
    let addr = server.listen_addrs()[0].to_string();

    let (res_tx, res_rx) = std_mpsc::channel();
    let res_tx = Mutex::new(res_tx);
    let client = BusBuilder::new()
        .add_category("x", Access::default(), 0, Some(200))
        .unwrap()
        .add_command("x", "res", move |_msg| {
            let _ = res_tx.lock().unwrap().send(());
        })
        .unwrap()
        .start()
        .unwrap();

    client
        .send(server.pubkey(), "x.req", &[], &[SendOption::Hint(addr)])
        .unwrap();
    req_seen.recv_timeout(Duration::from_secs(5)).unwrap();

    // Tear down the only connection, then let the handler reply.
    client.disconnect(server.pubkey()).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    release_tx.send(()).unwrap();

    // The reply had nowhere to go and was not re-connected.
    assert!(res_rx.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
fn reply_to_service_node_reconnects_through_lookup() {
    let (req_seen_tx, req_seen) = std_mpsc::channel();
    let req_seen_tx = Mutex::new(req_seen_tx);
    let (release_tx, release) = std_mpsc::channel::<()>();
    let release = Arc::new(Mutex::new(release));
    let release_in_handler = release.clone();

    // The "service node" peer listens so the server can come back to it.
    let (res_tx, res_rx) = std_mpsc::channel();
    let res_tx = Mutex::new(res_tx);
    let sn_peer = BusBuilder::new()
        .listen_on("127.0.0.1:0".parse().unwrap())
        .allow(|_ip, _pubkey| {
            Some(Allow {
                auth: AuthLevel::None,
                remote_sn: false,
            })
        })
        .add_category("x", Access::default(), 0, Some(200))
        .unwrap()
        .add_command("x", "res", move |_msg| {
            let _ = res_tx.lock().unwrap().send(());
        })
        .unwrap()
        .start()
        .unwrap();
    let sn_pubkey = *sn_peer.pubkey();
    let sn_addr = sn_peer.listen_addrs()[0].to_string();

    let server = BusBuilder::new()
        .listen_on("127.0.0.1:0".parse().unwrap())
        .allow(|_ip, _pubkey| {
            Some(Allow {
                auth: AuthLevel::None,
                remote_sn: true,
            })
        })
        .peer_lookup(move |pubkey| {
            if *pubkey == sn_pubkey {
                Some(sn_addr.clone())
            } else {
                None
            }
        })
        .add_category("x", Access::default(), 1, Some(200))
        .unwrap()
        .add_command("x", "req", move |msg| {
            assert!(msg.is_service_node());
            req_seen_tx.lock().unwrap().send(()).unwrap();
            let _ = release_in_handler.lock().unwrap().recv();
            msg.reply("x.res", &[]).unwrap();
        })
        .unwrap()
        .start()
        .unwrap();
    let server_addr = server.listen_addrs()[0].to_string();

    sn_peer
        .send(
            server.pubkey(),
            "x.req",
            &[],
            &[SendOption::Hint(server_addr)],
        )
        .unwrap();
    req_seen.recv_timeout(Duration::from_secs(5)).unwrap();

    // Drop the original connection, then release the reply: the server
    // re-establishes an outgoing connection via the lookup callback.
    sn_peer.disconnect(server.pubkey()).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    release_tx.send(()).unwrap();

    res_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn stop_waits_for_in_flight_handlers() {
    let finished = Arc::new(AtomicBool::new(false));
    let finished_in_handler = finished.clone();
    let (started_tx, started) = std_mpsc::channel();
    let started_tx = Mutex::new(started_tx);

    let mut server = BusBuilder::new()
        .listen_on("127.0.0.1:0".parse().unwrap())
        .allow(|_ip, _pubkey| {
            Some(Allow {
                auth: AuthLevel::None,
                remote_sn: false,
            })
        })
        .add_category("x", Access::default(), 1, Some(200))
        .unwrap()
        .add_command("x", "slow", move |_msg| {
            started_tx.lock().unwrap().send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
            finished_in_handler.store(true, Ordering::SeqCst);
        })
        .unwrap()
        .start()
        .unwrap();
    let addr = server.listen_addrs()[0].to_string();

    let client = BusBuilder::new().start().unwrap();
    client
        .send(server.pubkey(), "x.slow", &[], &[SendOption::Hint(addr)])
        .unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();

    // Shutdown drains: the in-flight handler runs to completion before the
    // proxy thread is joined.
    server.stop();
    assert!(finished.load(Ordering::SeqCst));

    // After stop the caller-facing API refuses new work.
    assert!(client.send(server.pubkey(), "x.slow", &[], &[]).is_ok());
    let mut client = client;
    client.stop();
    assert!(client
        .send(server.pubkey(), "x.slow", &[], &[])
        .is_err());
}
