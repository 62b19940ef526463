#[macro_use] extern crate rocket;
#[macro_use] extern crate serde_derive;

use rocket::{Request, Response};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;

mod common;
mod config;
mod counters;
mod error;
mod metrics;
mod relay;
mod resolver;
mod rest_api;
mod transcoder;



// The viewer page may be served from elsewhere, so allow cross-origin requests.
pub struct CORS;

#[rocket::async_trait]
impl Fairing for CORS {
	fn info(&self) -> Info {
		Info {
			name: "Add CORS headers to responses",
			kind: Kind::Response
		}
	}

	async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
		response.set_header(Header::new("Access-Control-Allow-Origin", "*"));
		response.set_header(Header::new("Access-Control-Allow-Methods", "GET, OPTIONS"));
		response.set_header(Header::new("Access-Control-Allow-Headers", "*"));
	}
}


#[rocket::main]
async fn main() -> anyhow::Result<()> {
	let matches = config::command().get_matches();
	let settings = config::Settings::from_matches(&matches)?;
	let state = rest_api::AppState::new(settings)?;

	rocket::build()
		.attach(rest_api::stage(state))
		.attach(CORS)
		.launch()
		.await?;

	anyhow::Ok(())
}
