mod common;

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use uringloop::abi::KernelTimespec;
use uringloop::event_loop::EventLoop;
use uringloop::ring::Ring;

/// Scenario 1: a file write followed by a read of the same bytes round-trips
/// through the ring without going through the event loop's socket plumbing.
#[test]
fn file_write_then_read_round_trips_bytes() {
    require_io_uring!();

    let mut tmp = tempfile();
    let mut ring = Ring::new(8).expect("ring setup");

    let payload = b"hello io_uring";
    ring.sq
        .add_write(tmp.as_raw_fd(), payload.as_ptr(), payload.len() as u32, 0)
        .unwrap();
    ring.submit_and_wait(1).unwrap();
    let mut write_res = None;
    ring.cq.process(|cqe| write_res = Some(cqe.res));
    assert_eq!(write_res, Some(payload.len() as i32));

    let mut read_buf = vec![0u8; payload.len()];
    tmp.flush().unwrap();
    let fd = tmp.as_raw_fd();
    ring.sq
        .add_read(fd, read_buf.as_mut_ptr(), read_buf.len() as u32, 0)
        .unwrap();
    // The read must start from the beginning of the file, not the offset the
    // write left the cursor at — io_uring reads/writes on io_uring's `off`
    // field are always explicit/positional for regular files with off = 0.
    ring.submit_and_wait(1).unwrap();
    let mut read_res = None;
    ring.cq.process(|cqe| read_res = Some(cqe.res));
    assert_eq!(read_res, Some(payload.len() as i32));
    assert_eq!(&read_buf, payload);
}

/// Scenario 2: an armed TIMEOUT with no other work fires with -ETIME once
/// its deadline elapses.
#[test]
fn timeout_fires_with_etime_after_deadline_elapses() {
    require_io_uring!();

    let mut ring = Ring::new(8).expect("ring setup");
    let ts = KernelTimespec::from_nanos(20_000_000); // 20ms
    ring.sq.add_timeout(&ts, 0).unwrap();

    let start = Instant::now();
    ring.submit_and_wait(1).unwrap();
    let mut res = None;
    ring.cq.process(|cqe| res = Some(cqe.res));

    assert!(start.elapsed() >= Duration::from_millis(15));
    assert_eq!(res, Some(-(libc::ETIME)));
}

/// Scenario 3: a running event loop notices work pushed from another thread
/// via its eventfd wake-up protocol, rather than waiting out a long timeout.
#[test]
fn cross_thread_task_wakes_blocked_loop() {
    require_io_uring!();

    let mut event_loop = EventLoop::new(8, 4096).expect("event loop setup");
    let sender = event_loop.task_sender();
    let shutdown = event_loop.shutdown_handle();

    let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ran2 = std::sync::Arc::clone(&ran);

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        sender.send(Box::new(move || {
            ran2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(50));
        shutdown.request();
    });

    let start = Instant::now();
    event_loop.run().expect("loop should shut down cleanly");
    assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    // Should not have taken anywhere near config::MAX_BLOCK_NANOS to notice.
    assert!(start.elapsed() < Duration::from_secs(2));
}

/// Scenario 4: POLL_ADD followed by POLL_REMOVE before the poll condition is
/// ever met yields a cancellation completion, not a hang.
#[test]
fn poll_add_then_remove_cancels_cleanly() {
    require_io_uring!();

    let mut ring = Ring::new(8).expect("ring setup");
    let (r, _w) = pipe();

    ring.sq
        .add_poll(r, uringloop::abi::poll_mask::POLLIN as u16)
        .unwrap();
    ring.submit().unwrap();

    let target = uringloop::userdata::encode(r, uringloop::userdata::Op::PollAdd, 0);
    ring.sq.add_poll_remove(r, target).unwrap();
    ring.submit_and_wait(2).unwrap();

    let mut results = Vec::new();
    ring.cq.process(|cqe| results.push(cqe.res));
    assert_eq!(results.len(), 2);
    // The poll-add completion is canceled (-ECANCELED), the remove succeeds (0).
    assert!(results.contains(&0) || results.contains(&-(libc::ECANCELED)));
}

/// Scenario 5: submitting more entries than the ring holds, across several
/// rounds, proves index math wraps correctly rather than corrupting state.
#[test]
fn ring_wrap_around_survives_many_rounds() {
    require_io_uring!();

    let mut ring = Ring::new(4).expect("small ring to force wraparound quickly");
    for round in 0..20u64 {
        let ts = KernelTimespec::from_nanos(1_000_000);
        ring.sq.add_timeout(&ts, 0).unwrap();
        ring.submit_and_wait(1).unwrap();
        let mut seen = 0;
        ring.cq.process(|_| seen += 1);
        assert_eq!(seen, 1, "round {round} produced unexpected completion count");
    }
}

/// Scenario 6: requesting shutdown while a channel is still registered does
/// not end the loop until that channel is removed.
#[test]
fn shutdown_waits_for_active_channels_to_drain() {
    require_io_uring!();

    let mut event_loop = EventLoop::new(8, 4096).expect("event loop setup");
    let shutdown = event_loop.shutdown_handle();

    let (listener, port) = local_listener();
    event_loop.add_listener(listener).unwrap();

    std::thread::spawn(move || {
        let _client = common::connect_with_retry(port);
        std::thread::sleep(Duration::from_millis(100));
        shutdown.request();
        // Intentionally do not close `_client` immediately: the accepted
        // server-side channel is what keeps the loop alive, not the peer.
        std::thread::sleep(Duration::from_millis(300));
        drop(_client);
    });

    let start = Instant::now();
    // Loop exits once its one registered channel (the listener) plus the
    // accepted connection settle into "inactive"; this bounds how long the
    // test can take so a regression hangs the suite instead of passing.
    let result = event_loop.run();
    assert!(result.is_ok());
    assert!(start.elapsed() < Duration::from_secs(5));
}

fn tempfile() -> std::fs::File {
    let path = std::env::temp_dir().join(format!("uringloop-test-{}", std::process::id()));
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)
        .expect("create tempfile")
}

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn local_listener() -> (i32, u16) {
    use socket2::{Domain, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_nonblocking(true).unwrap();
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    socket.bind(&addr.into()).unwrap();
    socket.listen(128).unwrap();
    let port = socket.local_addr().unwrap().as_socket().unwrap().port();
    use std::os::unix::io::IntoRawFd;
    (socket.into_raw_fd(), port)
}
