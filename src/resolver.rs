//! Works out where a camera can be reached right now.
//!
//! The HTTP proxy relay picks between the LAN (HTTPS, then HTTP) and the WAN path
//! with bounded TCP probes. The transcode relay looks the camera up in the table of
//! the requested mode. Locators are never cached, reachability can change between requests.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::net::TcpStream;

use crate::common::{CameraIndex, Mode, Scheme, SourceLocator, StreamParams};
use crate::config::Settings;
use crate::error::{Error, Result};



pub const MJPEG_PATH: &str = "/axis-cgi/mjpg/video.cgi";
pub const RTSP_PATH: &str = "/axis-media/media.amp";

/// Tests whether a host:port currently accepts TCP connections.
#[rocket::async_trait]
pub trait Reachability: Send + Sync {
	async fn is_reachable(&self, host: &str, port: u16) -> bool;
}

/// Reports the public address this server is seen from.
#[rocket::async_trait]
pub trait PublicAddress: Send + Sync {
	async fn public_ip(&self) -> Result<String>;
}

pub struct TcpProbe {
	timeout: Duration,
}

impl TcpProbe {
	pub fn new(timeout: Duration) -> Self {
		TcpProbe { timeout }
	}
}

#[rocket::async_trait]
impl Reachability for TcpProbe {
	async fn is_reachable(&self, host: &str, port: u16) -> bool {
		match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
			Ok(Ok(_)) => true,
			Ok(Err(err)) => {
				debug!("Probe {}:{} refused: {}", host, port, err);
				false
			},
			Err(_) => {
				debug!("Probe {}:{} timed out after {:?}", host, port, self.timeout);
				false
			},
		}
	}
}

/// Asks an echo service (ipify-style JSON `{"ip": "..."}`) for our public address.
pub struct IpEcho {
	client: reqwest::Client,
	url: String,
}

#[derive(Deserialize)]
struct IpEchoReply {
	ip: String,
}

impl IpEcho {
	pub fn new(url: String) -> Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(5))
			.build()
			.map_err(|e| Error::Config(format!("Cannot build HTTP client: {}", e)))?;
		Ok(IpEcho { client, url })
	}
}

#[rocket::async_trait]
impl PublicAddress for IpEcho {
	async fn public_ip(&self) -> Result<String> {
		let reply = self.client.get(&self.url)
			.send()
			.await
			.and_then(|resp| resp.error_for_status())
			.map_err(|e| Error::Upstream(format!("Public address lookup failed: {}", e)))?
			.json::<IpEchoReply>()
			.await
			.map_err(|e| Error::Upstream(format!("Public address lookup returned garbage: {}", e)))?;
		Ok(reply.ip.trim().to_string())
	}
}

/// Clamps a requested index into `[0, len - 1]`.
///
/// Out-of-range indices select the nearest valid camera instead of failing, which keeps the
/// UI's wrap-around camera selection well defined. `len` must be non-zero.
pub fn clamp_index(requested: i64, len: usize) -> CameraIndex {
	requested.clamp(0, len as i64 - 1) as CameraIndex
}

pub struct EndpointResolver {
	settings: Arc<Settings>,
	probe: Arc<dyn Reachability>,
	public_address: Arc<dyn PublicAddress>,
}

impl EndpointResolver {
	pub fn new(settings: Arc<Settings>, probe: Arc<dyn Reachability>, public_address: Arc<dyn PublicAddress>) -> Self {
		EndpointResolver { settings, probe, public_address }
	}

	/// Maps a requested index onto the proxy relay's camera list.
	pub fn proxy_camera(&self, requested: i64) -> Result<CameraIndex> {
		let count = self.settings.network.camera_count();
		if count == 0 {
			return Err(Error::Config("No camera addresses configured (CAMERA_LOCAL_IPS / CAMERA_GLOBAL_IPS)".to_string()));
		}
		Ok(clamp_index(requested, count))
	}

	/// Picks the LAN or WAN path to `cam` for the HTTP proxy relay.
	pub async fn resolve_http(&self, cam: CameraIndex, params: &StreamParams) -> Result<SourceLocator> {
		let network = &self.settings.network;
		let wan_host = network.wan_hosts.get(cam);

		// A camera with no WAN address can only be on our network.
		let same_network = match wan_host {
			Some(wan_host) => &self.public_address.public_ip().await? == wan_host,
			None => true,
		};

		if same_network {
			let host = network.local_hosts.get(cam)
				.ok_or_else(|| Error::Config(format!("cam{} has no LAN address configured", cam)))?;
			let mut tried = Vec::new();

			if let Some(port) = network.local_https_port(cam) {
				if self.probe.is_reachable(host, port).await {
					info!("cam{} resolved to LAN https://{}:{}", cam, host, port);
					return Ok(locator(Scheme::Https, host, port, MJPEG_PATH, params.to_query()));
				}
				tried.push(format!("https {}:{}", host, port));
			}

			if let Some(port) = network.local_http_port(cam) {
				if self.probe.is_reachable(host, port).await {
					info!("cam{} resolved to LAN http://{}:{}", cam, host, port);
					return Ok(locator(Scheme::Http, host, port, MJPEG_PATH, params.to_query()));
				}
				tried.push(format!("http {}:{}", host, port));
			}

			return Err(Error::Unreachable(format!("cam{} not reachable (LAN): tried {}", cam, tried.join(", "))));
		}

		let host = wan_host
			.ok_or_else(|| Error::Config(format!("cam{} has no WAN address configured", cam)))?;
		let port = network.wan_port(cam)
			.ok_or_else(|| Error::Config(format!("cam{} has no WAN port configured", cam)))?;

		if self.probe.is_reachable(host, port).await {
			info!("cam{} resolved to WAN https://{}:{}", cam, host, port);
			return Ok(locator(Scheme::Https, host, port, MJPEG_PATH, params.to_query()));
		}

		Err(Error::Unreachable(format!("cam{} not reachable (WAN): tried https {}:{}", cam, host, port)))
	}

	/// Looks the camera up in the RTSP table of `mode`. Returns the (clamped) camera index used.
	pub fn resolve_rtsp(&self, requested: i64, mode: Mode, params: &StreamParams) -> Result<(CameraIndex, SourceLocator)> {
		let table = self.settings.rtsp_table(mode);
		if table.hosts.is_empty() || table.ports.is_empty() {
			return Err(Error::Config(format!(
				"RTSP hosts/ports are not configured for {} mode (CAMERA_RTSP_HOSTS_{} / CAMERA_RTSP_PORTS_{})",
				mode, mode, mode
			)));
		}

		let profiles = &self.settings.profiles;
		if profiles.is_empty() {
			return Err(Error::Config("No stream profiles configured (CAMERA_STREAM_PROFILES)".to_string()));
		}

		let cam = clamp_index(requested, table.hosts.len());
		if cam as i64 != requested {
			debug!("Camera index {} clamped to {} for {} mode", requested, cam, mode);
		}

		let port = table.port_for(cam)
			.ok_or_else(|| Error::Config(format!("cam{} has no RTSP port configured for {} mode", cam, mode)))?;

		let mut query = vec![("streamprofile".to_string(), profiles[cam % profiles.len()].clone())];
		query.extend(params.to_query());

		Ok((cam, SourceLocator {
			scheme: Scheme::Rtsp,
			host: table.hosts[cam].clone(),
			port,
			path: RTSP_PATH.to_string(),
			query,
			accept_invalid_certs: false,
		}))
	}
}

fn locator(scheme: Scheme, host: &str, port: u16, path: &str, query: Vec<(String, String)>) -> SourceLocator {
	SourceLocator {
		scheme,
		host: host.to_string(),
		port,
		path: path.to_string(),
		query,
		accept_invalid_certs: scheme == Scheme::Https,
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;
	use std::sync::Mutex;

	use crate::config::{NetworkTable, RtspTable};

	struct FakeProbe {
		open: HashSet<(String, u16)>,
		attempts: Mutex<Vec<(String, u16)>>,
	}

	impl FakeProbe {
		fn new(open: &[(&str, u16)]) -> Arc<Self> {
			Arc::new(FakeProbe {
				open: open.iter().map(|(h, p)| (h.to_string(), *p)).collect(),
				attempts: Mutex::new(Vec::new()),
			})
		}

		fn attempts(&self) -> Vec<(String, u16)> {
			self.attempts.lock().unwrap().clone()
		}
	}

	#[rocket::async_trait]
	impl Reachability for FakeProbe {
		async fn is_reachable(&self, host: &str, port: u16) -> bool {
			self.attempts.lock().unwrap().push((host.to_string(), port));
			self.open.contains(&(host.to_string(), port))
		}
	}

	struct FixedAddress(&'static str);

	#[rocket::async_trait]
	impl PublicAddress for FixedAddress {
		async fn public_ip(&self) -> Result<String> {
			Ok(self.0.to_string())
		}
	}

	fn settings() -> Arc<Settings> {
		Arc::new(Settings {
			network: NetworkTable {
				local_hosts: vec!["192.168.1.10".into(), "192.168.1.11".into()],
				local_https_ports: vec![443],
				local_http_ports: vec![80],
				wan_hosts: vec!["203.0.113.7".into(), "198.51.100.9".into()],
				wan_ports: vec![1080, 1081],
			},
			local: RtspTable { hosts: vec!["10.0.0.1".into(), "10.0.0.2".into()], ports: vec![554] },
			global: RtspTable { hosts: vec!["cam-a.example.net".into(), "cam-b.example.net".into(), "cam-c.example.net".into()], ports: vec![8554, 8555, 8556] },
			profiles: vec!["Quality".into(), "Bandwidth".into()],
			..Settings::default()
		})
	}

	fn resolver(probe: Arc<FakeProbe>, ip: &'static str) -> EndpointResolver {
		EndpointResolver::new(settings(), probe, Arc::new(FixedAddress(ip)))
	}

	fn params() -> StreamParams {
		StreamParams::parse(Some("1280x720"), None).unwrap()
	}

	#[tokio::test]
	async fn same_network_prefers_lan_https() {
		let probe = FakeProbe::new(&[("192.168.1.10", 443), ("192.168.1.10", 80)]);
		let locator = resolver(probe.clone(), "203.0.113.7").resolve_http(0, &params()).await.unwrap();

		assert_eq!(locator.scheme, Scheme::Https);
		assert_eq!(locator.host, "192.168.1.10");
		assert_eq!(locator.port, 443);
		assert!(locator.accept_invalid_certs);
		assert_eq!(
			locator.to_url(None).unwrap().as_str(),
			"https://192.168.1.10/axis-cgi/mjpg/video.cgi?resolution=1280x720&fps=5"
		);
		assert_eq!(probe.attempts().len(), 1);
	}

	#[tokio::test]
	async fn same_network_falls_back_to_lan_http() {
		let probe = FakeProbe::new(&[("192.168.1.10", 80)]);
		let locator = resolver(probe, "203.0.113.7").resolve_http(0, &params()).await.unwrap();

		assert_eq!(locator.scheme, Scheme::Http);
		assert_eq!(locator.port, 80);
		assert!(!locator.accept_invalid_certs);
	}

	#[tokio::test]
	async fn lan_failure_does_not_try_wan() {
		let probe = FakeProbe::new(&[("203.0.113.7", 1080)]);
		let err = resolver(probe.clone(), "203.0.113.7").resolve_http(0, &params()).await.unwrap_err();

		assert!(matches!(err, Error::Unreachable(ref msg) if msg.contains("(LAN)")));
		assert_eq!(probe.attempts(), vec![
			("192.168.1.10".to_string(), 443),
			("192.168.1.10".to_string(), 80),
		]);
	}

	#[tokio::test]
	async fn other_network_goes_through_wan() {
		let probe = FakeProbe::new(&[("198.51.100.9", 1081)]);
		let locator = resolver(probe, "192.0.2.1").resolve_http(1, &params()).await.unwrap();

		assert_eq!(locator.scheme, Scheme::Https);
		assert_eq!(locator.host, "198.51.100.9");
		assert_eq!(locator.port, 1081);
	}

	#[tokio::test]
	async fn wan_failure_is_reported() {
		let probe = FakeProbe::new(&[]);
		let err = resolver(probe, "192.0.2.1").resolve_http(1, &params()).await.unwrap_err();
		assert!(matches!(err, Error::Unreachable(ref msg) if msg.contains("(WAN)")));
	}

	#[tokio::test]
	async fn tcp_probe_sees_listener() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let probe = TcpProbe::new(Duration::from_millis(500));

		assert!(probe.is_reachable("127.0.0.1", port).await);
		drop(listener);
		assert!(!probe.is_reachable("127.0.0.1", port).await);
	}

	#[test]
	fn local_index_past_table_is_clamped_to_last() {
		let resolver = resolver(FakeProbe::new(&[]), "192.0.2.1");
		let (cam, locator) = resolver.resolve_rtsp(2, Mode::Local, &params()).unwrap();

		assert_eq!(cam, 1);
		assert_eq!(locator.host, "10.0.0.2");
		assert_eq!(locator.port, 554);
	}

	#[test]
	fn negative_index_is_clamped_to_first() {
		let resolver = resolver(FakeProbe::new(&[]), "192.0.2.1");
		let (cam, _) = resolver.resolve_rtsp(-4, Mode::Global, &params()).unwrap();
		assert_eq!(cam, 0);
	}

	#[test]
	fn profiles_cycle_by_camera_index() {
		let resolver = resolver(FakeProbe::new(&[]), "192.0.2.1");
		let (cam, locator) = resolver.resolve_rtsp(2, Mode::Global, &params()).unwrap();

		assert_eq!(cam, 2);
		assert_eq!(locator.port, 8556);
		assert_eq!(locator.query[0], ("streamprofile".to_string(), "Quality".to_string()));
		assert_eq!(
			locator.to_url(None).unwrap().as_str(),
			"rtsp://cam-c.example.net:8556/axis-media/media.amp?streamprofile=Quality&resolution=1280x720&fps=5"
		);
	}

	#[test]
	fn missing_mode_table_is_a_config_error() {
		let settings = Arc::new(Settings {
			local: RtspTable { hosts: vec!["10.0.0.1".into()], ports: Vec::new() },
			profiles: vec!["Quality".into()],
			..Settings::default()
		});
		let resolver = EndpointResolver::new(settings, FakeProbe::new(&[]), Arc::new(FixedAddress("192.0.2.1")));

		assert!(matches!(resolver.resolve_rtsp(0, Mode::Local, &params()), Err(Error::Config(_))));
		assert!(matches!(resolver.resolve_rtsp(0, Mode::Global, &params()), Err(Error::Config(_))));
	}
}
