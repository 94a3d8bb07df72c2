//! The tokio runtime around [`Ircd`]: listeners, one task per connection,
//! outbound links and the housekeeping timer.
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::SinkExt;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::LineCodec;
use super::conf::Config;
use super::ircd::{ConnectRequest, Ircd};
use super::message::Message;
use super::msgtab::Disposition;
use super::topology::ConnId;

pub type SharedIrcd = Arc<Mutex<Ircd>>;

/// How often pings and autoconnects are checked.
const TICK: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Outbound connects are spread over this many milliseconds.
const CONNECT_JITTER_MS: u64 = 500;

/// Seconds since the epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Lock the server and bring its clock up to date.
async fn lock(ircd: &SharedIrcd) -> MutexGuard<'_, Ircd> {
    let mut guard = ircd.lock().await;
    guard.now = unix_now();
    guard
}

/// Run the server until a listener fails.
///
/// Binds every configured address first, so a port conflict fails fast.
pub async fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let bind = config.bind.clone();
    let ircd: SharedIrcd = Arc::new(Mutex::new(Ircd::new(config, unix_now())?));

    let mut listeners = Vec::with_capacity(bind.len());
    for addr in &bind {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {addr}");
        listeners.push(listener);
    }

    tokio::spawn(housekeeping(Arc::clone(&ircd)));

    let mut handles = Vec::new();
    for listener in listeners {
        handles.push(tokio::spawn(accept_loop(listener, Arc::clone(&ircd))));
    }
    for handle in handles {
        handle.await??;
    }
    Ok(())
}

/// Accept loop for a single listener.
async fn accept_loop(listener: TcpListener, ircd: SharedIrcd) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        let (socket, addr) = listener.accept().await?;
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let conn = lock(&ircd).await.accept(Some(addr), tx);
        info!(%addr, %conn, "new connection");
        let ircd = Arc::clone(&ircd);
        tokio::spawn(handle_connection(socket, conn, rx, ircd));
    }
}

/// Pump one connection: lines in go through dispatch, queued messages go
/// out. Reading pauses while the flood clock is ahead; the task ends once
/// the server drops the connection's sender and the queue is drained.
async fn handle_connection(socket: TcpStream, conn: ConnId, mut rx: mpsc::UnboundedReceiver<Message>, ircd: SharedIrcd) {
    let mut framed = Framed::new(socket, LineCodec);
    let mut reading = true;
    let mut delay = 0i64;

    let reason = loop {
        tokio::select! {
            frame = framed.next(), if reading && delay == 0 => {
                match frame {
                    Some(Ok(line)) => {
                        let mut ircd = lock(&ircd).await;
                        match ircd.dispatch(conn, &line) {
                            Ok(Disposition::Continue) => {}
                            Ok(Disposition::ConnectionClosed) => reading = false,
                            Err(e) => debug!(%conn, "line dropped: {e}"),
                        }
                        delay = ircd.read_delay(conn);
                    }
                    Some(Err(e)) => break format!("Read error: {e}"),
                    None => break "EOF from client".to_string(),
                }
            }

            _ = tokio::time::sleep(Duration::from_secs(delay.max(0) as u64)), if reading && delay > 0 => {
                delay = lock(&ircd).await.read_delay(conn);
            }

            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = framed.send(msg).await {
                        break format!("Write error: {e}");
                    }
                }
                None => break "Connection closed".to_string(),
            },
        }
    };

    debug!(%conn, %reason, "connection task done");
    lock(&ircd).await.remove_connection(conn, &reason);
}

/// Ping checks and autoconnect, once per tick; also picks up connects
/// requested by operators.
async fn housekeeping(ircd: SharedIrcd) {
    let mut ticker = tokio::time::interval(TICK);
    loop {
        ticker.tick().await;
        let requests = {
            let mut ircd = lock(&ircd).await;
            ircd.check_pings();
            ircd.try_connections();
            ircd.take_connect_requests()
        };
        for request in requests {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..CONNECT_JITTER_MS));
            let ircd = Arc::clone(&ircd);
            tokio::spawn(async move {
                tokio::time::sleep(jitter).await;
                connect_link(ircd, request).await;
            });
        }
    }
}

/// Open an outbound server link and run it like any other connection.
async fn connect_link(ircd: SharedIrcd, request: ConnectRequest) {
    let ConnectRequest { conn, name, addr } = request;
    let socket = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            warn!(%name, %addr, "connect failed: {e}");
            lock(&ircd).await.connect_failed(conn, &e.to_string());
            return;
        }
        Err(_) => {
            warn!(%name, %addr, "connect timed out");
            lock(&ircd).await.connect_failed(conn, "Connect timeout");
            return;
        }
    };
    let peer = socket.peer_addr().ok();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    if !lock(&ircd).await.connect_established(conn, peer, tx) {
        return;
    }
    info!(%name, %addr, %conn, "link socket up");
    handle_connection(socket, conn, rx, ircd).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn shared() -> SharedIrcd {
        let config = Config::from_json(r#"{"name": "hub.lagun.co", "numeric": "A"}"#).unwrap();
        Arc::new(Mutex::new(Ircd::new(config, unix_now()).unwrap()))
    }

    async fn listen(ircd: SharedIrcd) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_loop(listener, ircd));
        addr
    }

    #[tokio::test]
    async fn client_registers_over_tcp() {
        let addr = listen(shared()).await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        write.write_all(b"NICK wings\r\nUSER wings 0 * :Wings\r\n").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        let welcome = lines.next_line().await.unwrap().unwrap();
        assert!(welcome.starts_with(":hub.lagun.co 001 wings :Welcome"), "{welcome}");
    }

    #[tokio::test]
    async fn quit_closes_the_socket() {
        let ircd = shared();
        let addr = listen(Arc::clone(&ircd)).await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        write.write_all(b"NICK wings\r\nUSER wings 0 * :Wings\r\nQUIT :bye\r\n").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            seen.push(line);
        }
        assert!(seen.iter().any(|l| l.contains(" 001 wings ")), "{seen:?}");
        assert!(!seen.iter().any(|l| l.starts_with("ERROR")), "{seen:?}");

        // The task unregisters the connection once the socket is done.
        for _ in 0..50 {
            if ircd.lock().await.connections().next().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection still registered");
    }

    #[tokio::test]
    async fn overlong_line_drops_the_connection() {
        let ircd = shared();
        let addr = listen(Arc::clone(&ircd)).await;
        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut line = vec![b'A'; 600];
        line.extend_from_slice(b"\r\n");
        write.write_all(&line).await.unwrap();

        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(_)) = lines.next_line().await {}

        for _ in 0..50 {
            if ircd.lock().await.connections().next().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection still registered");
    }
}
