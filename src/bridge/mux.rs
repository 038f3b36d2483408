use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, info, warn};

use super::frame::FrameBuffer;
use crate::errors::BridgeError;

/// Fixed pause between dial attempts after a drop.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

type Reply = oneshot::Sender<Result<Value, BridgeError>>;

enum Op {
    Send {
        id: u64,
        command: String,
        params: Value,
        reply: Reply,
    },
    MarkTimedOut {
        id: u64,
    },
}

/// Request/response RPC handle over the single TCP connection to the
/// remote modeling host. Cloneable; all clones feed one actor task that
/// owns the socket, so writes are serialized and responses are matched
/// to requests in strict FIFO order (the wire carries no correlation id).
#[derive(Clone)]
pub struct Bridge {
    tx: mpsc::Sender<Op>,
    next_id: Arc<AtomicU64>,
}

impl Bridge {
    /// Spawn the connection actor. Dialing is lazy: the first `send`
    /// triggers the connect, and drops re-dial after a fixed backoff.
    pub fn connect(addr: String, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(run_dialer(addr, rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Serve one pre-established stream with no reconnection. Used by
    /// tests over an in-memory duplex pipe.
    #[cfg(test)]
    pub(crate) fn with_stream<S>(stream: S, queue_capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(async move {
            let mut actor = Actor::new(rx);
            let _ = actor.serve(stream).await;
            actor.fail_in_flight(&BridgeError::ConnectionReset);
            actor.fail_unsent(&BridgeError::ConnectionReset);
        });
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send one command and wait for its response or error. The deadline
    /// depends on the command type; a deadline that fires flags the id so
    /// the eventual response is drained and discarded without disturbing
    /// the FIFO order.
    pub async fn send(&self, command: &str, params: Value) -> Result<Value, BridgeError> {
        self.send_with_timeout(command, params, command_timeout(command)).await
    }

    pub(crate) async fn send_with_timeout(
        &self,
        command: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Op::Send {
                id,
                command: command.to_string(),
                params,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BridgeError::NotConnected,
            })?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionReset),
            Err(_) => {
                let _ = self.tx.try_send(Op::MarkTimedOut { id });
                Err(BridgeError::Timeout)
            }
        }
    }
}

/// Deadline per command type. Downloads and imports move real asset
/// data; searches hit remote catalogs; job control is quick polling.
fn command_timeout(command: &str) -> Duration {
    match command {
        "download_sketchfab_model" | "download_polyhaven_asset" | "import_generated_asset" => {
            Duration::from_secs(120)
        }
        "search_sketchfab_models" | "search_polyhaven_assets" => Duration::from_secs(60),
        "create_rodin_job" | "poll_rodin_job_status" => Duration::from_secs(30),
        _ => Duration::from_secs(15),
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct Pending {
    id: u64,
    reply: Option<Reply>,
    timed_out: bool,
    sent_at: chrono::DateTime<chrono::Local>,
}

struct Unsent {
    id: u64,
    command: String,
    params: Value,
    reply: Reply,
}

enum Served {
    /// All handles dropped; the actor is done.
    RxClosed,
    /// The connection broke; the dialer should reconnect.
    Disconnected,
}

enum Wake {
    Op(Option<Op>),
    Read(io::Result<usize>),
}

struct Actor {
    rx: mpsc::Receiver<Op>,
    in_flight: VecDeque<Pending>,
    unsent: VecDeque<Unsent>,
    frames: FrameBuffer,
}

impl Actor {
    fn new(rx: mpsc::Receiver<Op>) -> Self {
        Self {
            rx,
            in_flight: VecDeque::new(),
            unsent: VecDeque::new(),
            frames: FrameBuffer::new(),
        }
    }

    async fn serve<S>(&mut self, mut stream: S) -> Served
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Offer everything queued while the link was down to the fresh
        // connection before serving new traffic.
        while let Some(req) = self.unsent.pop_front() {
            if write_request(&mut stream, &req.command, &req.params).await.is_err() {
                self.unsent.push_front(req);
                return Served::Disconnected;
            }
            self.in_flight.push_back(Pending {
                id: req.id,
                reply: Some(req.reply),
                timed_out: false,
                sent_at: chrono::Local::now(),
            });
        }

        let mut chunk = [0u8; 4096];
        loop {
            // Resolve the wakeup first so the stream is free to write to
            // in the handling below.
            let wake = tokio::select! {
                op = self.rx.recv() => Wake::Op(op),
                read = stream.read(&mut chunk) => Wake::Read(read),
            };
            match wake {
                Wake::Op(None) => return Served::RxClosed,
                Wake::Op(Some(Op::Send { id, command, params, reply })) => {
                    if write_request(&mut stream, &command, &params).await.is_err() {
                        self.unsent.push_back(Unsent { id, command, params, reply });
                        return Served::Disconnected;
                    }
                    self.in_flight.push_back(Pending {
                        id,
                        reply: Some(reply),
                        timed_out: false,
                        sent_at: chrono::Local::now(),
                    });
                }
                Wake::Op(Some(Op::MarkTimedOut { id })) => self.mark_timed_out(id),
                Wake::Read(Ok(0)) | Wake::Read(Err(_)) => return Served::Disconnected,
                Wake::Read(Ok(n)) => {
                    self.frames.extend(&chunk[..n]);
                    while let Some(frame) = self.frames.next_frame() {
                        self.deliver(frame);
                    }
                }
            }
        }
    }

    fn mark_timed_out(&mut self, id: u64) {
        // A queued-but-unsent request can be dropped outright; nothing
        // will ever answer it.
        if let Some(pos) = self.unsent.iter().position(|u| u.id == id) {
            self.unsent.remove(pos);
            return;
        }
        if let Some(p) = self.in_flight.iter_mut().find(|p| p.id == id) {
            p.timed_out = true;
            p.reply = None;
        }
    }

    /// FIFO correlation: every frame belongs to the oldest in-flight
    /// request. A head flagged timed-out consumes the frame silently.
    fn deliver(&mut self, frame: Value) {
        let Some(head) = self.in_flight.pop_front() else {
            debug!("unsolicited frame from host discarded");
            return;
        };
        if head.timed_out {
            let waited = chrono::Local::now() - head.sent_at;
            debug!(
                id = head.id,
                waited_ms = waited.num_milliseconds(),
                "late response for timed-out request discarded"
            );
            return;
        }
        let result = interpret_response(frame);
        if let Some(reply) = head.reply {
            // The caller may have lost interest; a failed send is a
            // silent discard.
            let _ = reply.send(result);
        }
    }

    fn fail_in_flight(&mut self, err: &BridgeError) {
        for p in self.in_flight.drain(..) {
            if let Some(reply) = p.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    fn fail_unsent(&mut self, err: &BridgeError) {
        for u in self.unsent.drain(..) {
            let _ = u.reply.send(Err(err.clone()));
        }
    }
}

async fn run_dialer(addr: String, rx: mpsc::Receiver<Op>) {
    let mut actor = Actor::new(rx);
    let mut last_attempt: Option<Instant> = None;

    loop {
        // Nothing to do until somebody wants the link.
        if actor.unsent.is_empty() {
            match actor.rx.recv().await {
                None => return,
                Some(Op::Send { id, command, params, reply }) => {
                    actor.unsent.push_back(Unsent { id, command, params, reply });
                }
                Some(Op::MarkTimedOut { id }) => {
                    actor.mark_timed_out(id);
                    continue;
                }
            }
        }

        if let Some(t) = last_attempt {
            let elapsed = t.elapsed();
            if elapsed < RECONNECT_BACKOFF {
                tokio::time::sleep(RECONNECT_BACKOFF - elapsed).await;
            }
        }
        last_attempt = Some(Instant::now());

        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(addr = %addr, "connected to remote host");
                match actor.serve(stream).await {
                    Served::RxClosed => return,
                    Served::Disconnected => {
                        warn!(addr = %addr, "connection to remote host lost");
                        actor.fail_in_flight(&BridgeError::ConnectionReset);
                        actor.frames.clear();
                    }
                }
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "dial failed");
                actor.fail_unsent(&BridgeError::NotConnected);
            }
        }
    }
}

fn interpret_response(frame: Value) -> Result<Value, BridgeError> {
    if frame.get("status").and_then(Value::as_str) == Some("error") {
        let message = frame
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified remote error")
            .to_string();
        return Err(BridgeError::Remote(message));
    }
    match frame.get("result") {
        Some(result) => Ok(result.clone()),
        None => Ok(frame),
    }
}

async fn write_request<S>(stream: &mut S, command: &str, params: &Value) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let frame = serde_json::to_vec(&json!({ "type": command, "params": params }))
        .map_err(io::Error::other)?;
    stream.write_all(&frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Host side of a duplex pipe: collect `n` request frames, then hand
    /// them back so the test can script responses.
    async fn read_requests(server: &mut DuplexStream, n: usize) -> Vec<Value> {
        let mut frames = FrameBuffer::new();
        let mut out = Vec::new();
        let mut chunk = [0u8; 1024];
        while out.len() < n {
            let read = server.read(&mut chunk).await.expect("host read");
            assert!(read > 0, "client closed early");
            frames.extend(&chunk[..read]);
            while let Some(frame) = frames.next_frame() {
                out.push(frame);
            }
        }
        out
    }

    async fn write_response(server: &mut DuplexStream, response: Value) {
        let bytes = serde_json::to_vec(&response).unwrap();
        server.write_all(&bytes).await.unwrap();
        server.flush().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sends_resolve_in_fifo_order() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bridge = Bridge::with_stream(client, 16);

        let host = tokio::spawn(async move {
            let requests = read_requests(&mut server, 3).await;
            assert_eq!(requests[0]["type"], "get_scene_info");
            // Respond strictly in arrival order.
            for i in 0..3 {
                write_response(&mut server, json!({"status": "success", "result": i})).await;
            }
            server
        });

        let (a, b, c) = tokio::join!(
            bridge.send("get_scene_info", json!({})),
            bridge.send("get_scene_info", json!({})),
            bridge.send("get_scene_info", json!({})),
        );
        assert_eq!(a.unwrap(), json!(0));
        assert_eq!(b.unwrap(), json!(1));
        assert_eq!(c.unwrap(), json!(2));
        host.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_response_is_discarded_and_later_callers_get_theirs() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bridge = Bridge::with_stream(client, 16);

        let b2 = bridge.clone();
        let b3 = bridge.clone();

        // First request times out before the host answers anything.
        let r1 = bridge
            .send_with_timeout("execute_code", json!({"code": "slow"}), Duration::from_millis(40))
            .await;
        assert_eq!(r1, Err(BridgeError::Timeout));

        let host = tokio::spawn(async move {
            let _ = read_requests(&mut server, 3).await;
            // Now answer all three in order; the first answer belongs to
            // the timed-out request and must vanish.
            for i in 1..=3 {
                write_response(&mut server, json!({"status": "success", "result": i})).await;
            }
            server
        });

        let (r2, r3) = tokio::join!(
            b2.send("get_scene_info", json!({})),
            b3.send("get_scene_info", json!({})),
        );
        assert_eq!(r2.unwrap(), json!(2));
        assert_eq!(r3.unwrap(), json!(3));
        host.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_status_maps_to_remote_error() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bridge = Bridge::with_stream(client, 16);

        let host = tokio::spawn(async move {
            let _ = read_requests(&mut server, 1).await;
            write_response(&mut server, json!({"status": "error", "message": "no such object"}))
                .await;
            server
        });

        let err = bridge.send("get_scene_info", json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::Remote("no such object".to_string()));
        host.await.unwrap();
    }

    #[tokio::test]
    async fn response_without_result_field_returns_whole_object() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bridge = Bridge::with_stream(client, 16);

        let host = tokio::spawn(async move {
            let _ = read_requests(&mut server, 1).await;
            write_response(&mut server, json!({"status": "success", "enabled": true})).await;
            server
        });

        let value = bridge.send("get_polyhaven_status", json!({})).await.unwrap();
        assert_eq!(value["enabled"], true);
        host.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_and_handle_reports_not_connected() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bridge = Bridge::with_stream(client, 16);

        let pending = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.send("get_scene_info", json!({})).await })
        };
        // Let the request reach the host, then drop the connection.
        let _ = read_requests(&mut server, 1).await;
        drop(server);

        assert_eq!(pending.await.unwrap(), Err(BridgeError::ConnectionReset));

        // The actor is gone now; later sends cannot reconnect.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = bridge.send("get_scene_info", json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::NotConnected);
    }

    #[tokio::test]
    async fn bounded_queue_overflows_with_queue_full() {
        // One-byte pipe: the actor jams on its first write while ops pile
        // up behind a capacity-1 queue.
        let (client, server) = tokio::io::duplex(1);
        let bridge = Bridge::with_stream(client, 1);
        let _server = server; // keep the pipe open, never read

        let b1 = bridge.clone();
        let first =
            tokio::spawn(async move { b1.send("execute_code", json!({"code": "x"})).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let b2 = bridge.clone();
        let second =
            tokio::spawn(async move { b2.send("execute_code", json!({"code": "y"})).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let third = bridge
            .send_with_timeout("execute_code", json!({"code": "z"}), Duration::from_secs(5))
            .await;
        assert_eq!(third, Err(BridgeError::QueueFull));

        first.abort();
        second.abort();
    }

    #[tokio::test]
    async fn unsolicited_frame_is_ignored() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bridge = Bridge::with_stream(client, 16);

        // Host speaks before being spoken to.
        write_response(&mut server, json!({"status": "success", "result": "noise"})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let host = tokio::spawn(async move {
            let _ = read_requests(&mut server, 1).await;
            write_response(&mut server, json!({"status": "success", "result": "real"})).await;
            server
        });

        let value = bridge.send("get_scene_info", json!({})).await.unwrap();
        assert_eq!(value, json!("real"));
        host.await.unwrap();
    }

    #[test]
    fn command_timeouts_follow_the_class_of_command() {
        assert_eq!(command_timeout("download_polyhaven_asset"), Duration::from_secs(120));
        assert_eq!(command_timeout("search_sketchfab_models"), Duration::from_secs(60));
        assert_eq!(command_timeout("poll_rodin_job_status"), Duration::from_secs(30));
        assert_eq!(command_timeout("execute_code"), Duration::from_secs(15));
    }
}
