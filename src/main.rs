// Backend API server for the TTC live board
// Polls the TTC vehicle feed, reconciles it into per-route state and serves it as JSON

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod direction;
mod engine;
mod feed_client;
mod feed_parser;
mod proxy;
mod reconciler;
mod route_cache;
mod stats;
mod ttc_api_models;
mod view_model;

use config::Config;
use direction::MemoryPolicy;
use engine::{PollOutcome, TransitEngine};
use feed_client::{FeedClient, HttpTransport};
use proxy::ProxyState;
use ttc_api_models::{FeedError, FeedStatus, FleetMode, format_timestamp_full, get_current_timestamp};

const MAX_PREDICTIONS: usize = 4;

#[derive(Clone)]
struct AppState {
    engine: Arc<TransitEngine>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: get_current_timestamp(),
            sources: vec!["TTC".to_string()],
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: get_current_timestamp(),
            sources: vec![],
        }
    }
}

fn error_response(e: &FeedError) -> HttpResponse {
    let body = ApiResponse::<String>::error(e.to_string());
    match e {
        FeedError::UnknownRoute(_)
        | FeedError::UnknownVehicle { .. }
        | FeedError::MetadataNotCached(_) => HttpResponse::NotFound().json(body),
        FeedError::InvalidRequest(_) => HttpResponse::BadRequest().json(body),
        FeedError::Transport(_)
        | FeedError::AllPathsExhausted { .. }
        | FeedError::MalformedFeed(_)
        | FeedError::MetadataLoadFailed { .. } => HttpResponse::BadGateway().json(body),
    }
}

#[derive(Deserialize)]
struct RouteQuery {
    mode: Option<String>,
    q: Option<String>,
}

#[derive(Deserialize)]
struct BranchQuery {
    branch: Option<String>,
}

#[derive(Serialize)]
struct StatusView {
    #[serde(flatten)]
    status: FeedStatus,
    label: String,
    cached_routes: usize,
    remembered_destinations: usize,
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_routes(state: web::Data<AppState>, query: web::Query<RouteQuery>) -> HttpResponse {
    let mode = match query.mode.as_deref() {
        Some(raw) => match raw.parse::<FleetMode>() {
            Ok(mode) => mode,
            Err(e) => return error_response(&e),
        },
        None => state.engine.mode().await,
    };

    let listing = state
        .engine
        .route_listing(mode, query.q.as_deref().unwrap_or_default())
        .await;
    info!("🚊 Routes requested ({:?}): {} listed", mode, listing.len());
    HttpResponse::Ok().json(ApiResponse::success(listing))
}

async fn get_stats(state: web::Data<AppState>) -> HttpResponse {
    match state.engine.summary().await {
        Some(summary) => HttpResponse::Ok().json(ApiResponse::success(summary)),
        None => HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<String>::error("No feed cycle has completed yet".to_string())),
    }
}

async fn set_mode(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match path.into_inner().parse::<FleetMode>() {
        Ok(mode) => {
            let summary = state.engine.set_mode(mode).await;
            info!("🔀 Fleet mode switched to {:?}", mode);
            HttpResponse::Ok().json(ApiResponse::success(summary))
        }
        Err(e) => error_response(&e),
    }
}

async fn get_route(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.engine.route(&path.into_inner()).await {
        Ok(aggregate) => HttpResponse::Ok().json(ApiResponse::success(aggregate)),
        Err(e) => error_response(&e),
    }
}

async fn get_route_vehicles(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<BranchQuery>,
) -> HttpResponse {
    let route = path.into_inner();
    match state.engine.vehicle_details(&route, query.branch.as_deref()).await {
        Ok(vehicles) => HttpResponse::Ok().json(ApiResponse::success(vehicles)),
        Err(e) => error_response(&e),
    }
}

async fn get_route_config(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let route = path.into_inner();
    match state.engine.ensure_route_loaded(&route).await {
        Ok(metadata) => HttpResponse::Ok().json(ApiResponse::success(metadata.as_ref())),
        Err(e) => {
            warn!("⚠️  Route {} config unavailable: {}", route, e);
            error_response(&e)
        }
    }
}

async fn get_cached_metadata(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match state.engine.cached_metadata(&path.into_inner()).await {
        Ok(metadata) => HttpResponse::Ok().json(ApiResponse::success(metadata.as_ref())),
        Err(e) => error_response(&e),
    }
}

async fn get_vehicle_destination(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (route, vehicle) = path.into_inner();
    match state.engine.vehicle_destination(&route, &vehicle).await {
        Ok(destination) => HttpResponse::Ok().json(ApiResponse::success(destination)),
        Err(e) => error_response(&e),
    }
}

async fn get_predictions(state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (route, stop) = path.into_inner();
    match state.engine.predictions(&route, &stop).await {
        Ok(mut predictions) => {
            predictions.truncate(MAX_PREDICTIONS);
            HttpResponse::Ok().json(ApiResponse::success(predictions))
        }
        Err(e) => {
            warn!("⚠️  Predictions for {}/{} failed: {}", route, stop, e);
            error_response(&e)
        }
    }
}

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let status = state.engine.status().await;
    let tz = state.engine.timezone();
    let label = match &status {
        FeedStatus::Pending => "CONNECTING".to_string(),
        FeedStatus::Live { updated_at, .. } => format!("LIVE: {}", format_timestamp_full(*updated_at, tz)),
        FeedStatus::Stale { since, .. } => format!("STALE since {}", format_timestamp_full(*since, tz)),
    };

    HttpResponse::Ok().json(ApiResponse::success(StatusView {
        status,
        label,
        cached_routes: state.engine.cached_route_count().await,
        remembered_destinations: state.engine.remembered_destinations().await,
    }))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "TTC Live Board API",
        "version": env!("CARGO_PKG_VERSION"),
        "sources": ["TTC"],
        "timestamp": get_current_timestamp(),
    }))
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    info!("🔄 Manual refresh requested...");

    match state.engine.poll().await {
        Ok(PollOutcome::Updated { routes, vehicles }) => {
            info!("✓ Manual refresh completed: {} routes, {} vehicles", routes, vehicles);
            HttpResponse::Ok().json(ApiResponse::success("Data refreshed successfully"))
        }
        Ok(PollOutcome::Skipped) => {
            HttpResponse::Accepted().json(ApiResponse::success("Refresh already in progress"))
        }
        Err(e) => {
            warn!("⚠️  Manual refresh failed: {}", e);
            error_response(&e)
        }
    }
}

// ============================================================================
// Background Task
// ============================================================================

async fn data_refresh_task(engine: Arc<TransitEngine>, every: std::time::Duration) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        match engine.poll().await {
            Ok(PollOutcome::Updated { routes, vehicles }) => {
                tracing::debug!("✓ Auto-refresh: {} routes, {} vehicles", routes, vehicles);
            }
            Ok(PollOutcome::Skipped) => {
                tracing::debug!("Auto-refresh skipped, previous cycle still running");
            }
            Err(e) => {
                warn!("⚠️  Auto-refresh failed: {}", e);
            }
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/proxy", web::get().to(proxy::proxy_feed))
        .service(
            web::scope("/api/ttc")
                .route("/routes", web::get().to(get_routes))
                .route("/stats", web::get().to(get_stats))
                .route("/status", web::get().to(get_status))
                .route("/mode/{mode}", web::post().to(set_mode))
                .route("/route/{tag}", web::get().to(get_route))
                .route("/route/{tag}/vehicles", web::get().to(get_route_vehicles))
                .route("/route/{tag}/config", web::get().to(get_route_config))
                .route("/route/{tag}/metadata", web::get().to(get_cached_metadata))
                .route(
                    "/route/{tag}/vehicle/{id}/destination",
                    web::get().to(get_vehicle_destination),
                )
                .route("/route/{tag}/stop/{stop}/predictions", web::get().to(get_predictions))
                .route("/refresh", web::post().to(force_refresh)),
        );
}

async fn run_server(config: Config, engine: Arc<TransitEngine>, proxy_state: ProxyState) -> std::io::Result<()> {
    if let Err(e) = engine.load_route_names().await {
        warn!("⚠️  Route names unavailable, falling back to fleet labels: {}", e);
    }
    if let Err(e) = engine.poll().await {
        warn!("⚠️  Initial vehicle poll failed: {}", e);
    }

    let refresh_engine = engine.clone();
    let every = config.poll_interval;
    tokio::spawn(async move {
        data_refresh_task(refresh_engine, every).await;
    });

    info!("🚀 TTC Live Board running on http://{}", config.bind_addr);
    info!("🔄 Auto-refresh: every {}s", config.poll_interval.as_secs());

    let app_state = AppState { engine };

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(proxy_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure_api)
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,actix_web=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> std::io::Result<()> {
    init_tracing();

    let config = Config::from_env();
    info!("📡 Feed: {} via {} access paths", config.feed_base, config.access_paths.len());

    let transport = match HttpTransport::new(config.request_timeout) {
        Ok(transport) => transport,
        Err(e) => {
            error!("❌ Failed to initialize feed transport: {}", e);
            std::process::exit(1);
        }
    };

    let proxy_client = match reqwest::Client::builder().timeout(config.request_timeout).build() {
        Ok(client) => client,
        Err(e) => {
            error!("❌ Failed to initialize proxy client: {}", e);
            std::process::exit(1);
        }
    };

    let memory_policy = config
        .destination_evict_after
        .map(MemoryPolicy::EvictAfterMissedCycles)
        .unwrap_or_default();

    let client = FeedClient::new(transport, config.feed_base.clone(), config.access_paths.clone());
    let engine = Arc::new(TransitEngine::new(client, config.timezone, memory_policy));
    let proxy_state = ProxyState {
        client: proxy_client,
        allowed_prefix: config.proxy_allowed_prefix.clone(),
    };

    actix_web::rt::System::new().block_on(run_server(config, engine, proxy_state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::test as actix_test;
    use std::time::Duration;

    const VEHICLES: &str = r#"<body>
        <vehicle id="4401" routeTag="504" dirTag="504_0_504A" lat="43.65" lon="-79.38" heading="90" speedKmHr="10"/>
        <vehicle id="8001" routeTag="29" lat="43.70" lon="-79.43" speedKmHr="30"/>
    </body>"#;

    async fn seeded_engine() -> Arc<TransitEngine> {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let client = FeedClient::new(transport, "http://127.0.0.1:9/feed?a=ttc", vec![]);
        let engine = Arc::new(TransitEngine::new(client, chrono_tz::America::Toronto, MemoryPolicy::Retain));
        let snapshot = feed_parser::parse_vehicle_locations(VEHICLES).unwrap();
        engine.apply_snapshot(snapshot, 12).await;
        engine
    }

    #[actix_web::test]
    async fn routes_and_route_lookup() {
        let engine = seeded_engine().await;
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState { engine }))
                .configure(configure_api),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/api/ttc/routes?mode=all").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"].as_array().map(|a| a.len()), Some(2));
        assert_eq!(body["data"][0]["tag"], "29");

        let req = actix_test::TestRequest::get().uri("/api/ttc/route/504").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["vehicle_count"], 1);

        let req = actix_test::TestRequest::get().uri("/api/ttc/route/999").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = actix_test::TestRequest::get().uri("/api/ttc/routes?mode=ferry").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn mode_switch_updates_stats() {
        let engine = seeded_engine().await;
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState { engine }))
                .configure(configure_api),
        )
        .await;

        let req = actix_test::TestRequest::post().uri("/api/ttc/mode/bus").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["mode"], "bus");
        assert_eq!(body["data"]["stats"]["count"], 1);
        assert_eq!(body["data"]["top_route"], "29");

        let req = actix_test::TestRequest::get().uri("/api/ttc/stats").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["mode"], "bus");
    }

    #[actix_web::test]
    async fn metadata_and_destination_endpoints_never_fetch() {
        let engine = seeded_engine().await;
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState { engine }))
                .configure(configure_api),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/api/ttc/route/504/metadata").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = actix_test::TestRequest::get()
            .uri("/api/ttc/route/504/vehicle/4401/destination")
            .to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"], "Eastbound");

        let req = actix_test::TestRequest::get()
            .uri("/api/ttc/route/504/vehicle/0000/destination")
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
