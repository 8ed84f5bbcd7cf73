use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{Semaphore, mpsc, watch};

use crate::frame::{Frame, decode_payload};

const OUTBOUND_BUFFER: usize = 64;

/// Data frames a stream may have in flight before the receiver grants more.
const STREAM_WINDOW: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts the physical connection; opens odd-numbered streams.
    Controller,
    /// Dials the physical connection; opens even-numbered streams.
    Device,
}

impl Role {
    fn first_id(self) -> u64 {
        match self {
            Role::Controller => 1,
            Role::Device => 2,
        }
    }

    fn owns(self, id: u64) -> bool {
        id % 2 == self.first_id() % 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("session closed")]
    SessionClosed,
    #[error("stream closed by peer")]
    StreamClosed,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry entry for one open stream.
struct Slot {
    inbound: mpsc::Sender<Vec<u8>>,
    credit: Arc<Semaphore>,
}

impl Slot {
    fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (inbound, rx) = mpsc::channel(STREAM_WINDOW as usize);
        let slot = Self {
            inbound,
            credit: Arc::new(Semaphore::new(STREAM_WINDOW as usize)),
        };
        (slot, rx)
    }

    fn grant(&self, credit: u32) {
        let room = (STREAM_WINDOW as usize).saturating_sub(self.credit.available_permits());
        let credit = (credit as usize).min(room);
        if credit > 0 {
            self.credit.add_permits(credit);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Wakes writers parked on an exhausted window.
        self.credit.close();
    }
}

struct Inner {
    role: Role,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    streams: Mutex<HashMap<u64, Slot>>,
    incoming: Mutex<Option<mpsc::UnboundedSender<Stream>>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Inner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn outbound(&self) -> Option<mpsc::Sender<Frame>> {
        lock(&self.outbound).clone()
    }

    fn is_open(&self, id: u64) -> bool {
        lock(&self.streams).contains_key(&id)
    }

    /// Drops the local end of `id`. Returns whether it was still open.
    fn forget(&self, id: u64) -> bool {
        lock(&self.streams).remove(&id).is_some()
    }

    /// Queues a control frame without waiting for room in the outbound buffer.
    fn send_control(&self, frame: Frame) {
        let Some(outbound) = self.outbound() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(frame)) = outbound.try_send(frame) {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        lock(&self.outbound).take();
        lock(&self.streams).clear();
        lock(&self.incoming).take();
    }
}

/// Multiplexed session over one physical device connection.
///
/// The owner of the socket drains the outbound receiver returned by
/// [`Session::new`] into the socket and feeds every inbound frame to
/// [`Session::handle_frame`]. Streams opened from either side are independent:
/// closing one never affects the session or its siblings.
///
/// Each stream carries its own send window, counted in data frames.
/// A writer parks once the window is used up and resumes when the reader on
/// the far side has consumed enough to grant credit back, so a slow reader
/// stalls only its own stream.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(role: Role) -> (Self, mpsc::Receiver<Frame>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            role,
            outbound: Mutex::new(Some(out_tx)),
            streams: Mutex::new(HashMap::new()),
            incoming: Mutex::new(Some(in_tx)),
            next_id: AtomicU64::new(role.first_id()),
            closed,
        });
        let session = Self {
            inner,
            accept_rx: Arc::new(tokio::sync::Mutex::new(in_rx)),
        };
        (session, out_rx)
    }

    /// Two sessions wired back to back in-process.
    pub fn pair() -> (Session, Session) {
        let (controller, controller_out) = Session::new(Role::Controller);
        let (device, device_out) = Session::new(Role::Device);
        tokio::spawn(pump(controller_out, device.clone()));
        tokio::spawn(pump(device_out, controller.clone()));
        (controller, device)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Retires the session. Pending reads on its streams observe end of
    /// stream, later writes fail, and the outbound receiver drains to `None`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub async fn open_stream(&self) -> Result<Stream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let outbound = self.inner.outbound().ok_or(TunnelError::SessionClosed)?;

        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let (slot, rx) = Slot::new();
        let credit = slot.credit.clone();
        lock(&self.inner.streams).insert(id, slot);
        let stream = Stream::new(id, self.inner.clone(), credit, rx);

        // Lost a race with shutdown; dropping `stream` cleans up the entry.
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if outbound.send(Frame::Open { stream: id }).await.is_err() {
            self.shutdown();
            return Err(TunnelError::SessionClosed);
        }
        Ok(stream)
    }

    /// Next stream opened by the peer; `None` once the session is closed.
    pub async fn accept(&self) -> Option<Stream> {
        self.accept_rx.lock().await.recv().await
    }

    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Open { stream } => self.accept_open(stream),
            Frame::Data {
                stream,
                payload_b64,
            } => {
                let Some(payload) = decode_payload(&payload_b64) else {
                    tracing::warn!(stream, "dropping data frame with invalid base64");
                    return;
                };
                self.deliver(stream, payload);
            }
            Frame::Close { stream } => {
                lock(&self.inner.streams).remove(&stream);
            }
            Frame::Window { stream, credit } => {
                if let Some(slot) = lock(&self.inner.streams).get(&stream) {
                    slot.grant(credit);
                }
            }
            Frame::Hello { .. } | Frame::Unknown => {}
        }
    }

    fn deliver(&self, id: u64, payload: Vec<u8>) {
        let sent = match lock(&self.inner.streams).get(&id) {
            Some(slot) => slot.inbound.try_send(payload),
            None => {
                tracing::debug!(stream = id, "data for unknown stream");
                return;
            }
        };
        match sent {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(stream = id, "peer overran the stream window; resetting");
                if self.inner.forget(id) {
                    self.inner.send_control(Frame::Close { stream: id });
                }
            }
            // The local reader is gone; keep the peer's window open.
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.send_control(Frame::Window {
                    stream: id,
                    credit: 1,
                });
            }
        }
    }

    fn accept_open(&self, id: u64) {
        if self.is_closed() || self.inner.role.owns(id) {
            tracing::debug!(stream = id, "ignoring open frame");
            return;
        }

        let (slot, rx) = Slot::new();
        let credit = slot.credit.clone();
        {
            let mut streams = lock(&self.inner.streams);
            if streams.contains_key(&id) {
                return;
            }
            streams.insert(id, slot);
        }

        let stream = Stream::new(id, self.inner.clone(), credit, rx);
        let incoming = lock(&self.inner.incoming).clone();
        if let Some(incoming) = incoming {
            // A dropped acceptor rejects the stream; its drop sends `close`.
            let _ = incoming.send(stream);
        }
    }
}

async fn pump(mut rx: mpsc::Receiver<Frame>, peer: Session) {
    while let Some(frame) = rx.recv().await {
        peer.handle_frame(frame);
    }
    peer.shutdown();
}

struct StreamHandle {
    id: u64,
    session: Arc<Inner>,
    credit: Arc<Semaphore>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.session.forget(self.id) {
            self.session.send_control(Frame::Close { stream: self.id });
        }
    }
}

/// Logical exchange carved out of a session.
pub struct Stream {
    writer: StreamWriter,
    reader: StreamReader,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish()
    }
}

impl Stream {
    fn new(
        id: u64,
        session: Arc<Inner>,
        credit: Arc<Semaphore>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let handle = Arc::new(StreamHandle {
            id,
            session,
            credit,
        });
        Self {
            writer: StreamWriter {
                handle: handle.clone(),
            },
            reader: StreamReader {
                handle,
                rx,
                consumed: 0,
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.writer.handle.id
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), TunnelError> {
        self.writer.send(payload).await
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.reader.recv().await
    }

    /// The stream closes once both halves are dropped.
    pub fn split(self) -> (StreamWriter, StreamReader) {
        (self.writer, self.reader)
    }

    pub fn close(self) {}
}

#[derive(Clone)]
pub struct StreamWriter {
    handle: Arc<StreamHandle>,
}

impl StreamWriter {
    /// Sends one message, waiting for window credit when the peer lags.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let session = &self.handle.session;
        if session.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if !session.is_open(self.handle.id) {
            return Err(TunnelError::StreamClosed);
        }

        match self.handle.credit.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) if session.is_closed() => return Err(TunnelError::SessionClosed),
            Err(_) => return Err(TunnelError::StreamClosed),
        }

        let outbound = session.outbound().ok_or(TunnelError::SessionClosed)?;
        outbound
            .send(Frame::data(self.handle.id, payload))
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }
}

pub struct StreamReader {
    handle: Arc<StreamHandle>,
    rx: mpsc::Receiver<Vec<u8>>,
    consumed: u32,
}

impl StreamReader {
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let payload = self.rx.recv().await?;
        self.consumed += 1;
        if self.consumed >= STREAM_WINDOW / 2 {
            let credit = std::mem::take(&mut self.consumed);
            if let Some(outbound) = self.handle.session.outbound() {
                let _ = outbound
                    .send(Frame::Window {
                        stream: self.handle.id,
                        credit,
                    })
                    .await;
            }
        }
        Some(payload)
    }
}
