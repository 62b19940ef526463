use std::io::Cursor;

use log::warn;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::json;



pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Malformed or out-of-range request parameter.
	#[error("{0}")]
	Validation(String),

	/// No configured path to the camera answered the probe.
	#[error("{0}")]
	Unreachable(String),

	/// Host/port/profile tables or the transcoder are missing for the request.
	#[error("{0}")]
	Config(String),

	/// The camera (or the public address service) failed the request.
	#[error("{0}")]
	Upstream(String),

	/// Failure inside a running relay session.
	#[error("{0}")]
	Transport(String),
}

impl Error {
	pub fn kind(&self) -> &'static str {
		match self {
			Error::Validation(_) => "validation",
			Error::Unreachable(_) => "unreachable",
			Error::Config(_) => "config",
			Error::Upstream(_) => "upstream",
			Error::Transport(_) => "transport",
		}
	}

	pub fn status(&self) -> Status {
		match self {
			Error::Validation(_) => Status::BadRequest,
			_ => Status::BadGateway,
		}
	}
}

impl From<reqwest::Error> for Error {
	fn from(err: reqwest::Error) -> Self {
		Error::Upstream(format!("Camera request failed: {}", err))
	}
}

impl<'r> Responder<'r, 'static> for Error {
	fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
		warn!("{} {} failed ({}): {}", request.method(), request.uri(), self.kind(), self);

		let body = json!({
			"error": self.to_string(),
			"kind": self.kind(),
		}).to_string();

		Response::build()
			.status(self.status())
			.header(ContentType::JSON)
			.sized_body(body.len(), Cursor::new(body))
			.ok()
	}
}
