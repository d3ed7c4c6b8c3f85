//! Responses synthesized when an API request finds neither network nor cache.

use serde_json::json;

use crate::http::Response;

const OFFLINE: &str = "Offline";

/// Dashboard payload with every summary figure replaced by "Offline".
pub fn dashboard_stub() -> Response {
  Response::json(&json!({
    "success": true,
    "offline": true,
    "summary": {
      "totalCases": OFFLINE,
      "activeCases": OFFLINE,
      "resolvedThisMonth": OFFLINE,
      "complianceScore": OFFLINE,
    },
    "recentCases": [],
  }))
}

/// Generic error payload for every other API endpoint.
pub fn error_stub() -> Response {
  Response::json(&json!({
    "error": OFFLINE,
    "message": "No internet connection",
  }))
}
