use std::sync::Arc;

use actix_web::{get, web, HttpRequest, HttpResponse, Responder};

use super::{page, DashboardAuth};
use crate::service::stats::StatsRegistry;

/// Current counters for every rule, in the shape the polling page consumes.
#[get("/api/stats")]
pub async fn stats(
    registry: web::Data<Arc<StatsRegistry>>,
    auth: web::Data<DashboardAuth>,
    req: HttpRequest,
) -> impl Responder {
    if let Err(resp) = auth.check(&req) {
        return resp;
    }
    HttpResponse::Ok().json(registry.snapshot())
}

#[get("/")]
pub async fn index(auth: web::Data<DashboardAuth>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = auth.check(&req) {
        return resp;
    }
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(page::DASHBOARD_HTML)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn stats_endpoint_returns_the_snapshot() {
        let registry = StatsRegistry::new();
        registry.add_bytes("tcp:a->b", 10, 20);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::clone(&registry)))
                .app_data(web::Data::new(DashboardAuth::default()))
                .configure(crate::api::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ruleStats"]["tcp:a->b"]["BytesIn"], 10);
        assert_eq!(body["ruleStats"]["tcp:a->b"]["BytesOut"], 20);
        assert!(body["lastUpdateTime"].is_string());
    }

    #[actix_web::test]
    async fn unauthorized_request_gets_a_challenge() {
        let registry = StatsRegistry::new();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::clone(&registry)))
                .app_data(web::Data::new(DashboardAuth::new("admin", "secret")))
                .configure(crate::api::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key("WWW-Authenticate"));
    }
}
