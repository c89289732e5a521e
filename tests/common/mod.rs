use std::net::TcpStream;
use std::time::Duration;

/// Skips a test with a log line instead of failing it outright when this
/// kernel has no io_uring support (e.g. a restrictive container sandbox).
#[macro_export]
macro_rules! require_io_uring {
    () => {
        if !uringloop::io_uring_available() {
            eprintln!("skipping: io_uring not available on this kernel");
            return;
        }
    };
}

pub fn connect_with_retry(port: u16) -> TcpStream {
    let addr = format!("127.0.0.1:{port}");
    let mut last_err = None;
    for _ in 0..50 {
        match TcpStream::connect(&addr) {
            Ok(stream) => return stream,
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
    panic!("could not connect to {addr}: {:?}", last_err);
}
