//! Supervises the external transcoder that turns a camera's RTSP feed into MPEG-TS.
//!
//! The transcoder copies the video track untouched (audio dropped) and is tuned for
//! latency: TCP transport, no input buffering, no probing, packets flushed as soon as
//! they are muxed, and headers repeated so a client can join mid-stream. Its stdout
//! becomes the response body, its stderr goes to the log.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use url::Url;

use crate::common::{CameraIndex, Credentials, SourceLocator};
use crate::counters::CounterStore;
use crate::error::{Error, Result};
use crate::relay::{session_channel, Forwarder, Session, SessionEnd};



const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Transcoder {
	binary: PathBuf,
	credentials: Credentials,
	counters: Arc<CounterStore>,
}

impl Transcoder {
	pub fn new(binary: PathBuf, credentials: Credentials, counters: Arc<CounterStore>) -> Self {
		Transcoder { binary, credentials, counters }
	}

	/// Finds the transcoder executable, either at the configured path or on `PATH`.
	pub fn locate(&self) -> Result<PathBuf> {
		locate_executable(&self.binary).ok_or_else(|| Error::Config(format!(
			"Transcoder '{}' is not installed or not executable",
			self.binary.display()
		)))
	}

	/// Runs `<transcoder> -version` and returns the first line of its output.
	pub async fn version(&self) -> Result<String> {
		let binary = self.locate()?;
		let child = Command::new(&binary)
			.arg("-version")
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| Error::Config(format!("Transcoder '{}' cannot be started: {}", binary.display(), e)))?;

		let output = tokio::time::timeout(VERSION_TIMEOUT, child.wait_with_output())
			.await
			.map_err(|_| Error::Config(format!("Transcoder '{}' version check timed out", binary.display())))?
			.map_err(|e| Error::Config(format!("Transcoder '{}' version check failed: {}", binary.display(), e)))?;

		if !output.status.success() {
			return Err(Error::Config(format!("Transcoder '{}' version check exited with {}", binary.display(), output.status)));
		}

		let stdout = String::from_utf8_lossy(&output.stdout);
		Ok(stdout.lines().next().unwrap_or("unknown").to_string())
	}

	pub fn arguments(source: &Url) -> Vec<String> {
		[
			"-hide_banner",
			"-loglevel", "error",
			"-rtsp_transport", "tcp",
			"-fflags", "nobuffer",
			"-flags", "low_delay",
			"-probesize", "32",
			"-analyzeduration", "0",
			"-i", source.as_str(),
			"-an",
			"-c:v", "copy",
			"-f", "mpegts",
			"-mpegts_flags", "resend_headers",
			"-muxdelay", "0",
			"-flush_packets", "1",
			"pipe:1",
		]
		.iter()
		.map(|arg| arg.to_string())
		.collect()
	}

	/// Launches the transcoder for `locator` and starts relaying its output.
	pub fn start(&self, cam: CameraIndex, locator: &SourceLocator) -> Result<Session> {
		if !self.credentials.is_configured() {
			return Err(Error::Config("Camera credentials are not configured (CAMERA_USERNAME / CAMERA_PASSWORD)".to_string()));
		}
		let binary = self.locate()?;
		let source = locator.to_url(Some(&self.credentials))?;

		let mut child = Command::new(&binary)
			.args(Self::arguments(&source))
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| Error::Config(format!("Transcoder '{}' cannot be started: {}", binary.display(), e)))?;

		let stdout = child.stdout.take()
			.ok_or_else(|| Error::Transport("Transcoder stdout is not available".to_string()))?;
		if let Some(stderr) = child.stderr.take() {
			tokio::spawn(log_stderr(cam, stderr));
		}

		info!("cam{} transcoding {}:{} (pid {:?})", cam, locator.host, locator.port, child.id());

		let (forwarder, body, cancel) = session_channel(cam, self.counters.clone());
		let task = tokio::spawn(supervise(cam, child, forwarder, stdout));

		Ok(Session { body, cancel, task })
	}
}

async fn supervise(cam: CameraIndex, mut child: Child, forwarder: Forwarder, stdout: ChildStdout) -> SessionEnd {
	let end = forwarder.pump(ReaderStream::new(stdout)).await;

	if end != SessionEnd::SourceClosed {
		if let Err(err) = child.start_kill() {
			warn!("cam{} failed to kill transcoder: {}", cam, err);
		}
	}

	match child.wait().await {
		Ok(status) => info!("cam{} transcoder exited with {}", cam, status),
		Err(err) => warn!("cam{} failed to reap transcoder: {}", cam, err),
	}
	end
}

async fn log_stderr(cam: CameraIndex, stderr: ChildStderr) {
	let mut lines = BufReader::new(stderr).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		warn!("cam{} transcoder: {}", cam, line);
	}
}

fn locate_executable(binary: &Path) -> Option<PathBuf> {
	if binary.components().count() > 1 {
		return is_executable(binary).then(|| binary.to_path_buf());
	}

	let paths = env::var_os("PATH")?;
	env::split_paths(&paths)
		.map(|dir| dir.join(binary))
		.find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
	use std::os::unix::fs::PermissionsExt;

	std::fs::metadata(path)
		.map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
		.unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
	path.is_file()
}
