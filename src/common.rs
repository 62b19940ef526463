use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::{Error, Result};



pub type CameraIndex = usize;

/// Which address table (and profile set) is used to reach the fleet.
#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
	Local,
	Global,
}

impl Mode {
	pub const ALL: [Mode; 2] = [Mode::Local, Mode::Global];

	pub fn as_str(&self) -> &'static str {
		match self {
			Mode::Local => "LOCAL",
			Mode::Global => "GLOBAL",
		}
	}
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Mode {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_uppercase().as_str() {
			"LOCAL" => Ok(Mode::Local),
			"GLOBAL" => Ok(Mode::Global),
			other => Err(Error::Validation(format!("Unknown mode '{}'. Must be LOCAL or GLOBAL.", other))),
		}
	}
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
pub enum Scheme {
	Http,
	Https,
	Rtsp,
}

impl Scheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			Scheme::Http => "http",
			Scheme::Https => "https",
			Scheme::Rtsp => "rtsp",
		}
	}
}

#[derive(Clone)]
#[derive(Debug, Default)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

impl Credentials {
	pub fn is_configured(&self) -> bool {
		!self.username.is_empty()
	}
}

/// Resolved address for a single stream attempt. Built fresh for every request.
#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub struct SourceLocator {
	pub scheme: Scheme,
	pub host: String,
	pub port: u16,
	pub path: String,
	pub query: Vec<(String, String)>,
	/// Cameras commonly present self-signed certificates.
	pub accept_invalid_certs: bool,
}

impl SourceLocator {
	/// Builds the URL for this locator, embedding credentials when given (RTSP sources need them inline).
	pub fn to_url(&self, credentials: Option<&Credentials>) -> Result<Url> {
		let base = format!("{}://{}:{}{}", self.scheme.as_str(), self.host, self.port, self.path);
		let mut url = Url::parse(&base)
			.map_err(|e| Error::Config(format!("Invalid camera address '{}': {}", base, e)))?;

		if !self.query.is_empty() {
			url.query_pairs_mut().extend_pairs(self.query.iter());
		}

		if let Some(credentials) = credentials {
			url.set_username(&credentials.username)
				.map_err(|_| Error::Config(format!("Cannot embed credentials in '{}'", base)))?;
			url.set_password(Some(&credentials.password))
				.map_err(|_| Error::Config(format!("Cannot embed credentials in '{}'", base)))?;
		}

		Ok(url)
	}
}

/// Query parameters forwarded to the camera, already validated.
#[derive(Clone)]
#[derive(Debug, PartialEq)]
pub struct StreamParams {
	pub resolution: Option<String>,
	/// Any number in `[1, 30]`; fractional rates are forwarded as given.
	pub fps: f64,
}

impl StreamParams {
	pub const DEFAULT_FPS: f64 = 5.0;
	pub const MIN_FPS: f64 = 1.0;
	pub const MAX_FPS: f64 = 30.0;

	/// Validates the raw `res` and `fps` query values.
	pub fn parse(res: Option<&str>, fps: Option<&str>) -> Result<StreamParams> {
		let fps = match fps.map(str::trim).filter(|v| !v.is_empty()) {
			None => Self::DEFAULT_FPS,
			Some(raw) => match raw.parse::<f64>() {
				Ok(value) if value.is_finite() && (Self::MIN_FPS..=Self::MAX_FPS).contains(&value) => value,
				_ => return Err(Error::Validation("Invalid FPS value. Must be between 1 and 30.".to_string())),
			},
		};

		let resolution = match res.map(str::trim).filter(|v| !v.is_empty()) {
			None => None,
			Some(raw) => {
				if !is_resolution(raw) {
					return Err(Error::Validation(format!("Invalid resolution '{}'. Expected WIDTHxHEIGHT.", raw)));
				}
				Some(raw.to_string())
			},
		};

		Ok(StreamParams { resolution, fps })
	}

	pub fn to_query(&self) -> Vec<(String, String)> {
		let mut query = Vec::new();
		if let Some(resolution) = &self.resolution {
			query.push(("resolution".to_string(), resolution.clone()));
		}
		query.push(("fps".to_string(), self.fps.to_string()));
		query
	}
}

fn is_resolution(value: &str) -> bool {
	match value.split_once('x') {
		Some((w, h)) => {
			!w.is_empty() && !h.is_empty()
				&& w.bytes().all(|b| b.is_ascii_digit())
				&& h.bytes().all(|b| b.is_ascii_digit())
		},
		None => false,
	}
}

/// Parses the `cam` query value. Missing means camera 0.
pub fn parse_camera_param(cam: Option<&str>) -> Result<i64> {
	match cam.map(str::trim).filter(|v| !v.is_empty()) {
		None => Ok(0),
		Some(raw) => raw.parse::<i64>()
			.map_err(|_| Error::Validation(format!("Invalid camera index '{}'", raw))),
	}
}
