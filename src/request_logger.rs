use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

use crate::auth::guards::authenticated_user;

/// Fairing to log one line per HTTP request with timing and, when the
/// authorization gate admitted the request, the caller's user id.
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let duration = request.local_cache(Instant::now).elapsed();

        let method = request.method();
        let uri = request.uri();
        let status = response.status();

        match authenticated_user(request) {
            Some(user) => log::info!(
                "{} {} -> {} ({:.2}ms) user={}",
                method,
                uri,
                status.code,
                duration.as_secs_f64() * 1000.0,
                user.user_id
            ),
            None => log::info!(
                "{} {} -> {} ({:.2}ms)",
                method,
                uri,
                status.code,
                duration.as_secs_f64() * 1000.0
            ),
        }
    }
}
