use crate::proxy::{empty_body, error_response, full_body, BoxBody};
use crate::registry::{Instance, Registry};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use serde::Deserialize;
use tracing::info;

/// Body of `POST /register`.
#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    service: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    addr: String,
    #[serde(default)]
    weight: u32,
}

/// Body of `DELETE /register`.
#[derive(Deserialize)]
struct UnregisterRequest {
    #[serde(default)]
    service: String,
    #[serde(default)]
    id: String,
}

/// `POST /register` adds or updates an instance; `DELETE /register` removes
/// one. 204 on success, 400 for bad JSON or missing fields, 405 otherwise.
pub async fn handle_register(
    req: Request<BoxBody>,
    registry: Option<&Registry>,
) -> Response<BoxBody> {
    let Some(registry) = registry else {
        return error_response(StatusCode::NOT_IMPLEMENTED, "registration not enabled");
    };

    match *req.method() {
        Method::POST => {
            let Some(body) = read_body(req).await else {
                return error_response(StatusCode::BAD_REQUEST, "invalid JSON");
            };
            let Ok(reg) = serde_json::from_slice::<RegisterRequest>(&body) else {
                return error_response(StatusCode::BAD_REQUEST, "invalid JSON");
            };
            if reg.service.is_empty() || reg.id.is_empty() || reg.addr.is_empty() {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "service, id, and addr are required",
                );
            }
            info!(
                "management: instance registered, service={}, id={}, addr={}",
                reg.service, reg.id, reg.addr
            );
            registry.register(
                &reg.service,
                Instance {
                    id: reg.id,
                    addr: reg.addr,
                    weight: reg.weight,
                },
            );
            no_content()
        }

        Method::DELETE => {
            let Some(body) = read_body(req).await else {
                return error_response(StatusCode::BAD_REQUEST, "invalid JSON");
            };
            let Ok(unreg) = serde_json::from_slice::<UnregisterRequest>(&body) else {
                return error_response(StatusCode::BAD_REQUEST, "invalid JSON");
            };
            if unreg.service.is_empty() || unreg.id.is_empty() {
                return error_response(StatusCode::BAD_REQUEST, "service and id are required");
            }
            info!(
                "management: instance unregistered, service={}, id={}",
                unreg.service, unreg.id
            );
            registry.unregister(&unreg.service, &unreg.id);
            no_content()
        }

        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

/// `GET /services` lists registered service names as a JSON array.
pub fn handle_services(req: &Request<BoxBody>, registry: Option<&Registry>) -> Response<BoxBody> {
    let Some(registry) = registry else {
        return error_response(StatusCode::NOT_IMPLEMENTED, "registry not enabled");
    };
    if req.method() != Method::GET {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let names = registry.services();
    let body = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

async fn read_body(req: Request<BoxBody>) -> Option<bytes::Bytes> {
    req.into_body().collect().await.ok().map(|c| c.to_bytes())
}

fn no_content() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .unwrap()
}
