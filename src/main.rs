use std::os::unix::io::IntoRawFd;

use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tracing_subscriber::EnvFilter;

use uringloop::config;
use uringloop::event_loop::EventLoop;

#[derive(Parser)]
#[command(about = "io_uring-backed echo server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    /// Submission/completion ring size (entries)
    #[arg(long, default_value_t = config::DEFAULT_RING_ENTRIES)]
    ring_entries: u32,
}

fn create_listener(port: u16) -> Socket {
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).expect("failed to create socket");
    socket.set_reuse_address(true).unwrap();

    // SO_REUSEPORT via raw setsockopt (not in socket2's API).
    unsafe {
        use std::os::unix::io::AsRawFd;
        let optval: libc::c_int = 1;
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    socket.set_nonblocking(true).unwrap();
    socket.set_nodelay(true).unwrap();

    let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).expect("failed to bind");
    socket.listen(1024).expect("failed to listen");
    socket
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    uringloop::metrics::spawn_reporter();
    let args = Args::parse();

    if !uringloop::io_uring_available() {
        eprintln!("io_uring is not available on this kernel; cannot start");
        std::process::exit(1);
    }

    tracing::info!(port = args.port, ring_entries = args.ring_entries, "uringloop: starting");

    let listen_socket = create_listener(args.port);
    let listen_fd = listen_socket.into_raw_fd();

    let mut event_loop = EventLoop::new(args.ring_entries, config::READ_BUF_SIZE)
        .expect("failed to initialize event loop");
    event_loop
        .add_listener(listen_fd)
        .expect("failed to register listener");

    ctrlc_shutdown(event_loop.shutdown_handle());

    tracing::info!("uringloop: ready");
    if let Err(err) = event_loop.run() {
        tracing::error!(%err, "event loop exited with error");
        std::process::exit(1);
    }
}

/// Installs a SIGINT handler that asks the loop to shut down gracefully
/// rather than calling `std::process::exit` directly, so in-flight
/// connections get a chance to drain.
fn ctrlc_shutdown(handle: uringloop::event_loop::ShutdownHandle) {
    use std::sync::atomic::{AtomicBool, Ordering};
    static REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigint(_sig: libc::c_int) {
        REQUESTED.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }

    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_millis(200));
        if REQUESTED.load(Ordering::SeqCst) {
            tracing::info!("uringloop: shutdown requested");
            handle.request();
            break;
        }
    });
}
