use super::AdminState;
use crate::ids::AccountId;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::time::Duration;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn json(status: u16, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: AdminState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    let response = match segments.as_slice() {
        ["healthz"] | ["health"] => json(200, r#"{"status":"ok"}"#),

        ["readyz"] | ["ready"] => {
            let cfg = state.config.load();
            json(
                200,
                format!(
                    r#"{{"status":"ready","redis_url":"{}","admin_listen":"{}"}}"#,
                    cfg.redis.url, cfg.admin.listen,
                ),
            )
        }

        ["metrics"] => Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap(),

        ["debug", "slots", account] => handle_debug_slots(&state, account).await,

        _ => json(404, r#"{"error":"not found"}"#),
    };

    Ok(response)
}

/// Read-only snapshot of one account's current occupancy, via the same
/// `load_batch` round trip the selector uses — no account-specific max
/// concurrency is known to the admin surface, so `load_percent` is always 0
/// here; `current_concurrency`/`waiting_count`/`request_count` are accurate.
async fn handle_debug_slots(state: &AdminState, account: &str) -> Response<BoxBody> {
    let account_id = AccountId::from(account.to_string());
    let ttl = Duration::from_secs(state.config.load().concurrency.slot_ttl_minutes * 60);
    let load_window = Duration::from_secs(state.config.load().load_balancing.window_minutes * 60);

    match state
        .kv
        .load_batch(ttl, load_window, &[(account_id.clone(), 0)])
        .await
    {
        Ok(mut loads) => match loads.remove(&account_id) {
            Some(load) => json(
                200,
                format!(
                    r#"{{"account_id":"{}","current_concurrency":{},"waiting_count":{},"request_count":{}}}"#,
                    account_id, load.current_concurrency, load.waiting_count, load.request_count,
                ),
            ),
            None => json(404, r#"{"error":"no data for account"}"#),
        },
        Err(e) => json(500, format!(r#"{{"error":"{e}"}}"#)),
    }
}
