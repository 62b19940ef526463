use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgMatches, Command};

use crate::common::{CameraIndex, Credentials, Mode};



/// Which relay variant backs `/stream`.
#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
pub enum RelayKind {
	/// RTSP source piped through the external transcoder as MPEG-TS.
	Transcode,
	/// MJPEG over HTTP(S) forwarded byte for byte.
	Proxy,
}

/// Picks the port for `cam`. A single-entry list applies to every camera.
fn port_for(ports: &[u16], cam: CameraIndex) -> Option<u16> {
	match ports {
		[only] => Some(*only),
		_ => ports.get(cam).copied(),
	}
}

/// RTSP host/port table for one mode.
#[derive(Clone)]
#[derive(Debug, Default)]
pub struct RtspTable {
	pub hosts: Vec<String>,
	pub ports: Vec<u16>,
}

impl RtspTable {
	pub fn port_for(&self, cam: CameraIndex) -> Option<u16> {
		port_for(&self.ports, cam)
	}
}

/// Address tables used by the HTTP proxy variant.
#[derive(Clone)]
#[derive(Debug, Default)]
pub struct NetworkTable {
	pub local_hosts: Vec<String>,
	pub local_https_ports: Vec<u16>,
	pub local_http_ports: Vec<u16>,
	pub wan_hosts: Vec<String>,
	pub wan_ports: Vec<u16>,
}

impl NetworkTable {
	pub fn camera_count(&self) -> usize {
		self.local_hosts.len().max(self.wan_hosts.len())
	}

	pub fn local_https_port(&self, cam: CameraIndex) -> Option<u16> {
		port_for(&self.local_https_ports, cam)
	}

	pub fn local_http_port(&self, cam: CameraIndex) -> Option<u16> {
		port_for(&self.local_http_ports, cam)
	}

	pub fn wan_port(&self, cam: CameraIndex) -> Option<u16> {
		port_for(&self.wan_ports, cam)
	}
}

#[derive(Clone)]
#[derive(Debug)]
pub struct Settings {
	pub credentials: Credentials,
	pub default_mode: Mode,
	pub relay: RelayKind,
	pub camera_count: usize,
	pub local: RtspTable,
	pub global: RtspTable,
	pub profiles: Vec<String>,
	pub network: NetworkTable,
	pub transcoder: PathBuf,
	pub probe_timeout: Duration,
	pub metrics_interval: Duration,
	pub public_ip_url: String,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			credentials: Credentials::default(),
			default_mode: Mode::Global,
			relay: RelayKind::Transcode,
			camera_count: 0,
			local: RtspTable::default(),
			global: RtspTable::default(),
			profiles: Vec::new(),
			network: NetworkTable::default(),
			transcoder: PathBuf::from("ffmpeg"),
			probe_timeout: Duration::from_millis(2500),
			metrics_interval: Duration::from_secs(5),
			public_ip_url: "https://api.ipify.org?format=json".to_string(),
		}
	}
}

impl Settings {
	pub fn rtsp_table(&self, mode: Mode) -> &RtspTable {
		match mode {
			Mode::Local => &self.local,
			Mode::Global => &self.global,
		}
	}

	/// Number of counter slots: large enough for every table of every mode.
	pub fn counter_slots(&self) -> usize {
		self.camera_count
			.max(self.local.hosts.len())
			.max(self.global.hosts.len())
			.max(self.network.camera_count())
	}

	pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Settings> {
		let text = |id: &str| matches.get_one::<String>(id).cloned().unwrap_or_default();

		let default_mode = text("mode").parse::<Mode>()
			.map_err(|e| anyhow::anyhow!("{}", e))
			.context("Invalid --mode / CAMERA_MODE")?;

		let relay = match text("relay").trim().to_ascii_lowercase().as_str() {
			"transcode" => RelayKind::Transcode,
			"proxy" => RelayKind::Proxy,
			other => bail!("Invalid --relay / CAMERA_RELAY '{}': expected 'transcode' or 'proxy'", other),
		};

		let millis = |id: &str| Duration::from_millis(matches.get_one::<u64>(id).copied().unwrap_or_default());

		Ok(Settings {
			credentials: Credentials {
				username: text("username"),
				password: text("password"),
			},
			default_mode,
			relay,
			camera_count: matches.get_one::<usize>("camera-count").copied().unwrap_or_default(),
			local: RtspTable {
				hosts: split_list(&text("rtsp-hosts-local")),
				ports: parse_ports(&text("rtsp-ports-local")).context("Invalid LOCAL RTSP port list")?,
			},
			global: RtspTable {
				hosts: split_list(&text("rtsp-hosts-global")),
				ports: parse_ports(&text("rtsp-ports-global")).context("Invalid GLOBAL RTSP port list")?,
			},
			profiles: split_list(&text("stream-profiles")),
			network: NetworkTable {
				local_hosts: split_list(&text("local-ips")),
				local_https_ports: parse_ports(&text("local-https-ports")).context("Invalid LAN HTTPS port list")?,
				local_http_ports: parse_ports(&text("local-http-ports")).context("Invalid LAN HTTP port list")?,
				wan_hosts: split_list(&text("global-ips")),
				wan_ports: parse_ports(&text("global-ports")).context("Invalid WAN port list")?,
			},
			transcoder: PathBuf::from(text("transcoder")),
			probe_timeout: millis("probe-timeout-ms"),
			metrics_interval: millis("metrics-interval-ms"),
			public_ip_url: text("public-ip-url"),
		})
	}
}

/// Splits a comma-separated list, trimming entries and dropping empty ones.
pub fn split_list(raw: &str) -> Vec<String> {
	raw.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(String::from)
		.collect()
}

fn parse_ports(raw: &str) -> anyhow::Result<Vec<u16>> {
	split_list(raw)
		.iter()
		.map(|port| port.parse::<u16>().with_context(|| format!("'{}' is not a port number", port)))
		.collect()
}

fn env_arg(id: &'static str, env: &'static str, help: &'static str) -> Arg {
	Arg::new(id)
		.long(id)
		.env(env)
		.help(help)
}

pub fn command() -> Command {
	Command::new("camrelay")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Relays live camera video to browsers and reports per-camera throughput.")
		.arg(env_arg("username", "CAMERA_USERNAME", "Shared camera username"))
		.arg(env_arg("password", "CAMERA_PASSWORD", "Shared camera password").hide_env_values(true))
		.arg(env_arg("mode", "CAMERA_MODE", "Default mode, LOCAL or GLOBAL").default_value("GLOBAL"))
		.arg(env_arg("relay", "CAMERA_RELAY", "Relay used by /stream: transcode (RTSP) or proxy (HTTP)").default_value("transcode"))
		.arg(
			Arg::new("camera-count")
				.long("camera-count")
				.env("CAMERA_COUNT")
				.value_parser(value_parser!(usize))
				.default_value("0")
				.help("Minimum number of cameras to keep counters for")
		)
		.arg(env_arg("rtsp-hosts-local", "CAMERA_RTSP_HOSTS_LOCAL", "Comma-separated RTSP hosts for LOCAL mode"))
		.arg(env_arg("rtsp-ports-local", "CAMERA_RTSP_PORTS_LOCAL", "Comma-separated RTSP ports for LOCAL mode"))
		.arg(env_arg("rtsp-hosts-global", "CAMERA_RTSP_HOSTS_GLOBAL", "Comma-separated RTSP hosts for GLOBAL mode"))
		.arg(env_arg("rtsp-ports-global", "CAMERA_RTSP_PORTS_GLOBAL", "Comma-separated RTSP ports for GLOBAL mode"))
		.arg(env_arg("stream-profiles", "CAMERA_STREAM_PROFILES", "Comma-separated stream profiles, cycled by camera index"))
		.arg(env_arg("local-ips", "CAMERA_LOCAL_IPS", "Comma-separated LAN addresses (proxy relay)"))
		.arg(env_arg("local-https-ports", "CAMERA_LOCAL_HTTPS_PORTS", "Comma-separated LAN HTTPS ports").default_value("443"))
		.arg(env_arg("local-http-ports", "CAMERA_LOCAL_HTTP_PORTS", "Comma-separated LAN HTTP ports").default_value("80"))
		.arg(env_arg("global-ips", "CAMERA_GLOBAL_IPS", "Comma-separated WAN addresses (proxy relay)"))
		.arg(env_arg("global-ports", "CAMERA_GLOBAL_PORTS", "Comma-separated WAN ports").default_value("1080"))
		.arg(env_arg("transcoder", "TRANSCODER_BIN", "Transcoder executable").default_value("ffmpeg"))
		.arg(
			Arg::new("probe-timeout-ms")
				.long("probe-timeout-ms")
				.env("PROBE_TIMEOUT_MS")
				.value_parser(value_parser!(u64).range(1..))
				.default_value("2500")
				.help("Reachability probe timeout")
		)
		.arg(
			Arg::new("metrics-interval-ms")
				.long("metrics-interval-ms")
				.env("METRICS_INTERVAL_MS")
				.value_parser(value_parser!(u64).range(1..))
				.default_value("5000")
				.help("Interval between throughput samples")
		)
		.arg(env_arg("public-ip-url", "PUBLIC_IP_URL", "Service echoing the caller's public address as {\"ip\": ...}").default_value("https://api.ipify.org?format=json"))
}



#[cfg(test)]
mod tests {
	use super::*;

	fn parse(args: &[&str]) -> anyhow::Result<Settings> {
		let mut argv = vec!["camrelay"];
		argv.extend_from_slice(args);
		let matches = command().try_get_matches_from(argv)?;
		Settings::from_matches(&matches)
	}

	#[test]
	fn lists_are_trimmed_and_empty_entries_dropped() {
		assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
		assert!(split_list("").is_empty());
	}

	#[test]
	fn single_port_applies_to_every_camera() {
		let table = RtspTable { hosts: vec!["a".into(), "b".into(), "c".into()], ports: vec![8554] };
		assert_eq!(table.port_for(2), Some(8554));

		let table = RtspTable { hosts: vec!["a".into(), "b".into()], ports: vec![554, 555, 556] };
		assert_eq!(table.port_for(1), Some(555));
		assert_eq!(table.port_for(3), None);
	}

	#[test]
	fn parses_tables_from_flags() {
		let settings = parse(&[
			"--mode", "local",
			"--relay", "proxy",
			"--rtsp-hosts-local", "10.0.0.2, 10.0.0.3",
			"--rtsp-ports-local", "554,8554",
			"--global-ips", "203.0.113.1,203.0.113.2,203.0.113.3",
			"--camera-count", "2",
		]).unwrap();

		assert_eq!(settings.default_mode, Mode::Local);
		assert_eq!(settings.relay, RelayKind::Proxy);
		assert_eq!(settings.local.hosts, vec!["10.0.0.2", "10.0.0.3"]);
		assert_eq!(settings.local.ports, vec![554, 8554]);
		assert_eq!(settings.network.wan_ports, vec![1080]);
		assert_eq!(settings.counter_slots(), 3);
	}

	#[test]
	fn bad_port_is_a_startup_error() {
		assert!(parse(&["--rtsp-ports-global", "554,http"]).is_err());
		assert!(parse(&["--relay", "webrtc"]).is_err());
	}
}
