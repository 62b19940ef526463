//! Relay sessions: counted, ordered forwarding of upstream chunks into a response body.
//!
//! A session is a spawned task that owns the upstream (socket or transcoder pipe) and a
//! bounded channel to the client half. The client half holds a drop guard on the session's
//! cancellation token, so a client going away cancels the task at its next suspension point.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use rocket::http::{ContentType, Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, stream::ByteStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::common::{CameraIndex, Credentials, SourceLocator};
use crate::counters::CounterStore;
use crate::error::{Error, Result};



/// Chunks buffered between the upstream reader and the client.
const SESSION_BUFFER: usize = 16;

#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
	/// Upstream finished or the transcoder exited.
	SourceClosed,
	/// Client went away (or the session was cancelled explicitly).
	Cancelled,
	/// Upstream read failed mid-stream.
	Failed(String),
}

/// Client half of a session. Dropping it cancels the session.
pub struct RelayBody {
	chunks: mpsc::Receiver<Bytes>,
	_cancel_on_drop: DropGuard,
}

impl Stream for RelayBody {
	type Item = Bytes;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
		self.chunks.poll_recv(cx)
	}
}

pub struct Session {
	pub body: RelayBody,
	pub cancel: CancellationToken,
	pub task: JoinHandle<SessionEnd>,
}

impl Session {
	/// Hands the body to the client and leaves the task running on its own. The session is
	/// cancelled if `shutdown` resolves first; either way its end is logged.
	pub fn detach<F>(self, cam: CameraIndex, shutdown: F) -> RelayBody
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let Session { body, cancel, task } = self;
		tokio::spawn(async move {
			tokio::select! {
				end = task => match end {
					Ok(end) => debug!("cam{} session finished: {:?}", cam, end),
					Err(err) => warn!("cam{} session task failed: {}", cam, err),
				},
				_ = shutdown => {
					info!("cam{} session cancelled by shutdown", cam);
					cancel.cancel();
				},
			}
		});
		body
	}
}

/// Upstream half of a session: counts each chunk, then hands it to the client.
pub struct Forwarder {
	cam: CameraIndex,
	counters: Arc<CounterStore>,
	tx: mpsc::Sender<Bytes>,
	cancel: CancellationToken,
	relayed: u64,
}

pub fn session_channel(cam: CameraIndex, counters: Arc<CounterStore>) -> (Forwarder, RelayBody, CancellationToken) {
	let (tx, chunks) = mpsc::channel(SESSION_BUFFER);
	let cancel = CancellationToken::new();

	let forwarder = Forwarder {
		cam,
		counters,
		tx,
		cancel: cancel.clone(),
		relayed: 0,
	};
	let body = RelayBody {
		chunks,
		_cancel_on_drop: cancel.clone().drop_guard(),
	};

	(forwarder, body, cancel)
}

impl Forwarder {
	/// Counts and forwards one chunk. Returns false once the client is gone.
	async fn forward(&mut self, chunk: Bytes) -> bool {
		self.counters.add_bytes(self.cam, chunk.len());
		self.relayed += chunk.len() as u64;

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => false,
			sent = self.tx.send(chunk) => sent.is_ok(),
		}
	}

	/// Relays `source` until it ends, fails, or the session is cancelled.
	pub async fn pump<S, E>(mut self, mut source: S) -> SessionEnd
	where
		S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
		E: fmt::Display,
	{
		let end = loop {
			let next = tokio::select! {
				biased;
				_ = self.cancel.cancelled() => break SessionEnd::Cancelled,
				next = source.next() => next,
			};

			match next {
				Some(Ok(chunk)) => {
					if !self.forward(chunk).await {
						break SessionEnd::Cancelled;
					}
				},
				Some(Err(err)) => break SessionEnd::Failed(err.to_string()),
				None => break SessionEnd::SourceClosed,
			}
		};

		match &end {
			SessionEnd::Failed(reason) => warn!("cam{} relay failed after {} bytes: {}", self.cam, self.relayed, reason),
			other => info!("cam{} relay ended ({:?}) after {} bytes", self.cam, other, self.relayed),
		}
		end
	}
}

/// Streaming response for a relay session.
pub struct StreamResponse {
	pub status: Status,
	pub content_type: ContentType,
	pub body: RelayBody,
}

impl<'r> Responder<'r, 'r> for StreamResponse {
	fn respond_to(self, request: &'r Request<'_>) -> response::Result<'r> {
		let mut response = ByteStream(self.body).respond_to(request)?;
		response.set_status(self.status);
		response.set_header(self.content_type);
		response.set_header(Header::new("Cache-Control", "no-cache, no-store, must-revalidate"));
		Ok(response)
	}
}

/// Forwards an MJPEG/HTTP camera endpoint with the shared Basic-Auth credentials.
pub struct HttpProxy {
	client: reqwest::Client,
	/// For cameras with self-signed certificates.
	insecure_client: reqwest::Client,
	credentials: Credentials,
	counters: Arc<CounterStore>,
}

impl HttpProxy {
	pub fn new(credentials: Credentials, counters: Arc<CounterStore>) -> Result<Self> {
		let build = |insecure: bool| reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(10))
			.no_proxy()
			.danger_accept_invalid_certs(insecure)
			.build()
			.map_err(|e| Error::Config(format!("Cannot build HTTP client: {}", e)));

		Ok(HttpProxy {
			client: build(false)?,
			insecure_client: build(true)?,
			credentials,
			counters,
		})
	}

	/// Opens the camera stream and starts relaying it. Fails before any body is sent
	/// if the camera cannot be reached.
	pub async fn open(&self, cam: CameraIndex, locator: &SourceLocator) -> Result<(Status, ContentType, Session)> {
		if !self.credentials.is_configured() {
			return Err(Error::Config("Camera credentials are not configured (CAMERA_USERNAME / CAMERA_PASSWORD)".to_string()));
		}

		let url = locator.to_url(None)?;
		let client = if locator.accept_invalid_certs { &self.insecure_client } else { &self.client };

		let upstream = client.get(url.clone())
			.basic_auth(&self.credentials.username, Some(&self.credentials.password))
			.send()
			.await
			.map_err(|e| Error::Upstream(format!("cam{} request to {} failed: {}", cam, url, e)))?;

		let status = Status::new(upstream.status().as_u16());
		let content_type = upstream.headers()
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.and_then(ContentType::parse_flexible)
			.unwrap_or_else(|| ContentType::new("multipart", "x-mixed-replace"));

		info!("cam{} proxying {} ({}, {})", cam, url, status, content_type);

		let (forwarder, body, cancel) = session_channel(cam, self.counters.clone());
		let task = tokio::spawn(forwarder.pump(Box::pin(upstream.bytes_stream())));

		Ok((status, content_type, Session { body, cancel, task }))
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use futures::stream;
	use std::io;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	use crate::common::Scheme;

	fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
		stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
	}

	#[tokio::test]
	async fn forwards_in_order_and_counts() {
		let counters = Arc::new(CounterStore::new(2));
		let (forwarder, body, _cancel) = session_channel(1, counters.clone());

		let task = tokio::spawn(forwarder.pump(chunks(&[&b"abc"[..], &b"de"[..], &b"fghij"[..]])));
		let received: Vec<Bytes> = body.collect().await;

		assert_eq!(received, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de"), Bytes::from_static(b"fghij")]);
		assert_eq!(task.await.unwrap(), SessionEnd::SourceClosed);
		assert_eq!(counters.read(1), Some(10));
		assert_eq!(counters.read(0), Some(0));
	}

	#[tokio::test]
	async fn upstream_error_ends_session() {
		let counters = Arc::new(CounterStore::new(1));
		let (forwarder, body, _cancel) = session_channel(0, counters.clone());

		let source = stream::iter(vec![
			Ok(Bytes::from_static(b"1234")),
			Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by camera")),
			Ok(Bytes::from_static(b"never")),
		]);
		let task = tokio::spawn(forwarder.pump(source));
		let received: Vec<Bytes> = body.collect().await;

		assert_eq!(received.len(), 1);
		assert!(matches!(task.await.unwrap(), SessionEnd::Failed(reason) if reason.contains("reset")));
		assert_eq!(counters.read(0), Some(4));
	}

	#[tokio::test]
	async fn dropping_body_cancels_pending_upstream() {
		let counters = Arc::new(CounterStore::new(1));
		let (forwarder, body, cancel) = session_channel(0, counters.clone());

		// An upstream that never produces anything.
		let task = tokio::spawn(forwarder.pump(stream::pending::<io::Result<Bytes>>()));
		drop(body);

		let end = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
		assert_eq!(end, SessionEnd::Cancelled);
		assert!(cancel.is_cancelled());
	}

	#[tokio::test]
	async fn shutdown_cancels_detached_session() {
		let counters = Arc::new(CounterStore::new(1));
		let (forwarder, body, cancel) = session_channel(0, counters);
		let task = tokio::spawn(forwarder.pump(stream::pending::<io::Result<Bytes>>()));
		let session = Session { body, cancel: cancel.clone(), task };

		let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
		let mut body = session.detach(0, async move {
			let _ = stopped.await;
		});
		stop.send(()).unwrap();

		// The forwarder goes away with the cancelled task, which ends the body.
		let next = tokio::time::timeout(Duration::from_secs(1), body.next()).await.unwrap();
		assert!(next.is_none());
		assert!(cancel.is_cancelled());
	}

	#[tokio::test]
	async fn detached_session_runs_to_completion() {
		let counters = Arc::new(CounterStore::new(1));
		let (forwarder, body, cancel) = session_channel(0, counters.clone());
		let task = tokio::spawn(forwarder.pump(chunks(&[&b"ts"[..]])));
		let body = Session { body, cancel: cancel.clone(), task }.detach(0, futures::future::pending());

		let received: Vec<Bytes> = body.collect().await;
		assert_eq!(received, vec![Bytes::from_static(b"ts")]);
		assert_eq!(counters.read(0), Some(2));
	}

	/// Serves one canned HTTP response and hands back the request head it received.
	async fn fake_camera(response: &'static [u8]) -> (u16, JoinHandle<String>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let handle = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut head = vec![0u8; 4096];
			let n = socket.read(&mut head).await.unwrap();
			socket.write_all(response).await.unwrap();
			socket.shutdown().await.unwrap();
			String::from_utf8_lossy(&head[..n]).to_string()
		});
		(port, handle)
	}

	fn http_locator(port: u16) -> SourceLocator {
		SourceLocator {
			scheme: Scheme::Http,
			host: "127.0.0.1".to_string(),
			port,
			path: "/axis-cgi/mjpg/video.cgi".to_string(),
			query: vec![("fps".to_string(), "5".to_string())],
			accept_invalid_certs: false,
		}
	}

	fn credentials() -> Credentials {
		Credentials { username: "root".to_string(), password: "secret".to_string() }
	}

	#[tokio::test]
	async fn proxies_status_type_and_body() {
		let (port, camera) = fake_camera(
			b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nContent-Length: 12\r\nConnection: close\r\n\r\n--frame\r\nxyz"
		).await;
		let counters = Arc::new(CounterStore::new(1));
		let proxy = HttpProxy::new(credentials(), counters.clone()).unwrap();

		let (status, content_type, session) = proxy.open(0, &http_locator(port)).await.unwrap();
		assert_eq!(status, Status::Ok);
		assert!(content_type.to_string().starts_with("multipart/x-mixed-replace"));

		let body: Vec<u8> = session.body.collect::<Vec<Bytes>>().await.concat();
		assert_eq!(body, b"--frame\r\nxyz");
		assert_eq!(counters.read(0), Some(12));

		let head = camera.await.unwrap();
		assert!(head.starts_with("GET /axis-cgi/mjpg/video.cgi?fps=5 "));
		// base64("root:secret")
		let authorization = head.lines()
			.find_map(|line| {
				let (name, value) = line.split_once(':')?;
				name.eq_ignore_ascii_case("authorization").then(|| value.trim().to_string())
			});
		assert_eq!(authorization.as_deref(), Some("Basic cm9vdDpzZWNyZXQ="));
	}

	#[tokio::test]
	async fn refused_connection_is_an_upstream_error() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);

		let proxy = HttpProxy::new(credentials(), Arc::new(CounterStore::new(1))).unwrap();
		let Err(err) = proxy.open(0, &http_locator(port)).await else {
			panic!("expected the refused connection to fail");
		};
		assert!(matches!(err, Error::Upstream(_)));
	}

	#[tokio::test]
	async fn missing_credentials_is_a_config_error() {
		let proxy = HttpProxy::new(Credentials::default(), Arc::new(CounterStore::new(1))).unwrap();
		let Err(err) = proxy.open(0, &http_locator(1)).await else {
			panic!("expected missing credentials to fail");
		};
		assert!(matches!(err, Error::Config(_)));
	}
}
