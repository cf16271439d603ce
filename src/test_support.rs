//! Loopback stand-ins for the provisioning server used by unit tests.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::LOGIN_SUCCESS_MARKER;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Respond(String),
    RespondBytes(Vec<u8>),
    Hangup,
}

type Behaviour = Arc<dyn Fn(usize, &str) -> Reply + Send + Sync>;

/// Fake server: every accepted connection runs on its own thread and hands
/// each received chunk, with the zero-based connection index, to the
/// behaviour closure.
pub struct FakeSps {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<(usize, String)>>>,
}

impl FakeSps {
    pub fn spawn<F>(max_connections: Option<usize>, behaviour: F) -> Self
    where
        F: Fn(usize, &str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("fake server should bind");
        let addr = listener.local_addr().expect("fake server addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let behaviour: Behaviour = Arc::new(behaviour);

        {
            let accepted = Arc::clone(&accepted);
            let received = Arc::clone(&received);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { continue };
                    let index = accepted.fetch_add(1, Ordering::SeqCst);
                    let behaviour = Arc::clone(&behaviour);
                    let received = Arc::clone(&received);
                    thread::spawn(move || serve_connection(index, stream, behaviour, received));
                    if max_connections.is_some_and(|max| index + 1 >= max) {
                        break;
                    }
                }
            });
        }

        Self {
            addr,
            accepted,
            received,
        }
    }

    /// Accepts any login and logout; everything else goes to `responder`.
    pub fn with_login<F>(max_connections: Option<usize>, responder: F) -> Self
    where
        F: Fn(usize, &str) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(max_connections, move |index, request| {
            if request.contains("<Login ") {
                Reply::Respond(format!("<LoginResponse>{LOGIN_SUCCESS_MARKER}</LoginResponse>"))
            } else if request.contains("<Logout ") {
                Reply::Respond("<LogoutResponse/>".to_owned())
            } else {
                responder(index, request)
            }
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(usize, String)> {
        self.received
            .lock()
            .expect("fake server lock poisoned")
            .clone()
    }

    pub fn received_containing(&self, needle: &str) -> usize {
        self.received()
            .iter()
            .filter(|(_, chunk)| chunk.contains(needle))
            .count()
    }

    /// Polls until `needle` has been received `count` times or the timeout
    /// elapses.
    pub fn wait_for(&self, needle: &str, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.received_containing(needle) >= count)
    }
}

fn serve_connection(
    index: usize,
    mut stream: TcpStream,
    behaviour: Behaviour,
    received: Arc<Mutex<Vec<(usize, String)>>>,
) {
    let mut buffer = [0_u8; 8192];
    loop {
        let size = match stream.read(&mut buffer) {
            Ok(0) | Err(_) => return,
            Ok(size) => size,
        };
        let chunk = String::from_utf8_lossy(&buffer[..size]).into_owned();
        received
            .lock()
            .expect("fake server lock poisoned")
            .push((index, chunk.clone()));

        match behaviour(index, &chunk) {
            Reply::Respond(body) => {
                if stream.write_all(body.as_bytes()).is_err() {
                    return;
                }
            }
            Reply::RespondBytes(body) => {
                if stream.write_all(&body).is_err() {
                    return;
                }
            }
            Reply::Hangup => return,
        }
    }
}

/// Address that refuses connections: bound once, then released.
pub fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
    listener.local_addr().expect("listener addr")
}

pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
