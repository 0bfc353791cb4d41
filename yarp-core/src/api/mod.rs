//! Read-only statistics dashboard.
//!
//! Two endpoints: `/api/stats` returns the current registry snapshot as
//! JSON, `/` serves a small polling page. Optional HTTP Basic auth guards
//! both when credentials are configured.

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use base64::Engine;

mod page;
mod statistics;

/// Basic-auth policy for the dashboard. Disabled unless both a user and a
/// password were configured.
#[derive(Clone, Default)]
pub struct DashboardAuth {
    credentials: Option<(String, String)>,
}

impl DashboardAuth {
    pub fn new(user: &str, password: &str) -> Self {
        if user.is_empty() || password.is_empty() {
            return DashboardAuth { credentials: None };
        }
        DashboardAuth {
            credentials: Some((user.to_string(), password.to_string())),
        }
    }

    fn allows(&self, req: &HttpRequest) -> bool {
        let (user, password) = match &self.credentials {
            Some(credentials) => credentials,
            None => return true,
        };
        let value = match req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(value) => value,
            None => return false,
        };
        let encoded = match value.strip_prefix("Basic ") {
            Some(encoded) => encoded.trim(),
            None => return false,
        };
        let decoded = match base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(decoded) => decoded,
            None => return false,
        };
        match decoded.split_once(':') {
            Some((u, p)) => u == user && p == password,
            None => false,
        }
    }

    /// Returns the `401` response to send when the request is not allowed.
    fn check(&self, req: &HttpRequest) -> Result<(), HttpResponse> {
        if self.allows(req) {
            Ok(())
        } else {
            Err(HttpResponse::Unauthorized()
                .insert_header(("WWW-Authenticate", "Basic realm=\"Restricted\""))
                .body("Unauthorized\n"))
        }
    }
}

/// Configures the dashboard routes on an actix-web app. The app needs a
/// `web::Data<Arc<StatsRegistry>>` and a `web::Data<DashboardAuth>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(statistics::stats).service(statistics::index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn basic_header(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, password))
        )
    }

    #[test]
    fn auth_disabled_without_full_credentials() {
        let req = TestRequest::default().to_http_request();
        assert!(DashboardAuth::new("", "").allows(&req));
        assert!(DashboardAuth::new("admin", "").allows(&req));
        assert!(DashboardAuth::new("", "secret").allows(&req));
    }

    #[test]
    fn matching_credentials_pass() {
        let auth = DashboardAuth::new("admin", "secret");
        let req = TestRequest::default()
            .insert_header(("Authorization", basic_header("admin", "secret")))
            .to_http_request();
        assert!(auth.allows(&req));
    }

    #[test]
    fn wrong_or_missing_credentials_fail() {
        let auth = DashboardAuth::new("admin", "secret");

        let missing = TestRequest::default().to_http_request();
        assert!(!auth.allows(&missing));

        let wrong = TestRequest::default()
            .insert_header(("Authorization", basic_header("admin", "nope")))
            .to_http_request();
        assert!(!auth.allows(&wrong));

        let garbage = TestRequest::default()
            .insert_header(("Authorization", "Basic !!!not-base64!!!"))
            .to_http_request();
        assert!(!auth.allows(&garbage));
    }

    #[test]
    fn rejection_carries_the_challenge_header() {
        let auth = DashboardAuth::new("admin", "secret");
        let req = TestRequest::default().to_http_request();
        let resp = auth.check(&req).unwrap_err();
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get("WWW-Authenticate").unwrap(),
            "Basic realm=\"Restricted\""
        );
    }
}
