//! Ambient system endpoints, grounded on the teacher's `routes/system.rs::health`.

use rocket::get;
use rocket::serde::json::Json;

#[get("/healthz")]
pub fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-hub",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
