use std::sync::Arc;

use log::{info, warn};
use rocket::http::{ContentType, Status};
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::{json, Value};
use rocket::tokio::select;
use rocket::tokio::time::{self, Instant};
use rocket::{Request, Shutdown, State};

use crate::common::{parse_camera_param, Mode, StreamParams};
use crate::config::{RelayKind, Settings};
use crate::counters::CounterStore;
use crate::error::Result;
use crate::metrics::MetricsFeed;
use crate::relay::{HttpProxy, StreamResponse};
use crate::resolver::{EndpointResolver, IpEcho, TcpProbe};
use crate::transcoder::Transcoder;



/// Everything the routes share. The counter store is the only state written by more than one flow.
pub struct AppState {
	pub settings: Arc<Settings>,
	pub counters: Arc<CounterStore>,
	pub resolver: EndpointResolver,
	pub proxy: HttpProxy,
	pub transcoder: Transcoder,
}

impl AppState {
	pub fn new(settings: Settings) -> Result<AppState> {
		let settings = Arc::new(settings);
		let counters = Arc::new(CounterStore::new(settings.counter_slots()));

		let resolver = EndpointResolver::new(
			settings.clone(),
			Arc::new(TcpProbe::new(settings.probe_timeout)),
			Arc::new(IpEcho::new(settings.public_ip_url.clone())?),
		);
		let proxy = HttpProxy::new(settings.credentials.clone(), counters.clone())?;
		let transcoder = Transcoder::new(settings.transcoder.clone(), settings.credentials.clone(), counters.clone());

		Ok(AppState { settings, counters, resolver, proxy, transcoder })
	}
}

#[get("/stream?<cam>&<res>&<fps>&<mode>")]
async fn stream(
	cam: Option<&str>,
	res: Option<&str>,
	fps: Option<&str>,
	mode: Option<&str>,
	state: &State<AppState>,
	shutdown: Shutdown,
) -> Result<StreamResponse> {
	// Everything is validated before any probe or process is started.
	let requested = parse_camera_param(cam)?;
	let params = StreamParams::parse(res, fps)?;
	let mode = match mode {
		Some(mode) => mode.parse::<Mode>()?,
		None => state.settings.default_mode,
	};

	match state.settings.relay {
		RelayKind::Transcode => {
			let (cam, locator) = state.resolver.resolve_rtsp(requested, mode, &params)?;
			let session = state.transcoder.start(cam, &locator)?;
			Ok(StreamResponse {
				status: Status::Ok,
				content_type: ContentType::new("video", "mp2t"),
				body: session.detach(cam, shutdown),
			})
		},
		RelayKind::Proxy => {
			let cam = state.resolver.proxy_camera(requested)?;
			let locator = state.resolver.resolve_http(cam, &params).await?;
			let (status, content_type, session) = state.proxy.open(cam, &locator).await?;
			Ok(StreamResponse {
				status,
				content_type,
				body: session.detach(cam, shutdown),
			})
		},
	}
}

#[get("/metrics?<cam>&<mode>")]
fn metrics_feed(cam: Option<&str>, mode: Option<&str>, state: &State<AppState>, mut shutdown: Shutdown) -> EventStream![] {
	let requested = parse_camera_param(cam).ok();
	let mode = mode
		.map(str::to_string)
		.unwrap_or_else(|| state.settings.default_mode.to_string());
	let mut feed = MetricsFeed::new(state.counters.clone(), requested, mode, state.settings.metrics_interval);

	EventStream! {
		let connected = feed.connect();
		if connected.is_fault() {
			warn!("Metrics feed rejected: {:?}", connected);
			yield Event::json(&connected);
			return;
		}
		info!("Metrics feed opened for cam {:?}", requested);
		yield Event::json(&connected).event("connected");

		let period = feed.interval();
		let mut ticker = time::interval_at(Instant::now() + period, period);
		loop {
			select! {
				_ = ticker.tick() => {},
				_ = &mut shutdown => break,
			};
			yield Event::json(&feed.sample());
		}
		feed.close();
	}
}

#[get("/mode")]
fn current_mode(state: &State<AppState>) -> Value {
	json!({
		"mode": state.settings.default_mode,
		"availableModes": Mode::ALL,
		"message": "The mode can be switched from the UI.",
	})
}

#[catch(404)]
fn not_found(request: &Request) -> Value {
	json!({
		"error": format!("Resource '{}' was not found.", request.uri().path()),
	})
}

#[catch(default)]
fn default_catcher(status: Status, _request: &Request) -> (Status, Value) {
	(status, json!({
		"error": status.reason().unwrap_or("Request failed"),
	}))
}



pub fn stage(state: AppState) -> rocket::fairing::AdHoc {
	rocket::fairing::AdHoc::on_ignite("Stream proxy", move |rocket| async move {
		let settings = state.settings.clone();
		info!(
			"Relay {:?}, default mode {}, {} camera counters, LOCAL {} / GLOBAL {} RTSP hosts, {} profiles",
			settings.relay,
			settings.default_mode,
			state.counters.len(),
			settings.local.hosts.len(),
			settings.global.hosts.len(),
			settings.profiles.len(),
		);

		if settings.relay == RelayKind::Transcode {
			match state.transcoder.version().await {
				Ok(version) => info!("Transcoder: {}", version),
				Err(err) => warn!("{} (streams will fail until it is installed)", err),
			}
		}

		let routes = routes![stream, metrics_feed, current_mode];
		rocket
			.manage(state)
			.register("/", catchers![not_found, default_catcher])
			.mount("/", routes.clone())
			.mount("/api", routes)
	})
}
