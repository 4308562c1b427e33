// Pass-through request proxy restricted to the upstream feed host

use actix_web::http::{StatusCode, header};
use actix_web::{HttpResponse, web};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub allowed_prefix: String,
}

#[derive(Deserialize)]
pub struct ProxyQuery {
    url: Option<String>,
}

/// The target must be present and start with the allowed upstream prefix
pub fn validate_target<'a>(target: Option<&'a str>, allowed_prefix: &str) -> Option<&'a str> {
    target.filter(|t| !allowed_prefix.is_empty() && t.starts_with(allowed_prefix))
}

pub async fn proxy_feed(state: web::Data<ProxyState>, query: web::Query<ProxyQuery>) -> HttpResponse {
    let Some(target) = validate_target(query.url.as_deref(), &state.allowed_prefix) else {
        warn!("🚫 Proxy rejected target: {:?}", query.url);
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "Only TTC API URLs are allowed" }));
    };

    let upstream = match state.client.get(target).send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("⚠️  Proxy upstream fetch failed: {}", e);
            return HttpResponse::BadGateway().json(serde_json::json!({
                "error": "Upstream fetch failed",
                "detail": e.to_string()
            }));
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match upstream.bytes().await {
        Ok(body) => {
            debug!("🔁 Proxied {} ({}, {} bytes)", target, status, body.len());
            let mut response = HttpResponse::build(status);
            if let Some(content_type) = content_type {
                response.insert_header((header::CONTENT_TYPE, content_type));
            }
            response.body(body)
        }
        Err(e) => HttpResponse::BadGateway().json(serde_json::json!({
            "error": "Upstream fetch failed",
            "detail": e.to_string()
        })),
    }
}
