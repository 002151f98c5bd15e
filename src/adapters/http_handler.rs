use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{Method, StatusCode, header},
    routing::any,
};
use eyre::{Result, WrapErr};
use hyper::Response;
use serde_json::json;

use crate::{
    config::models::ManagementConfig,
    core::{
        exchange::{Exchange, GatewayRequest},
        gateway::GatewayHandler,
        route::RouteDescription,
    },
};

/// Axum-facing entry point: serves the management endpoints and turns every
/// other request into an [`Exchange`] for the [`GatewayHandler`].
pub struct HttpHandler {
    gateway: Arc<GatewayHandler>,
    management: ManagementConfig,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayHandler>, management: ManagementConfig) -> Self {
        let mut management = management;
        let trimmed = management.base_path.trim_end_matches('/').to_string();
        management.base_path = trimmed;
        Self {
            gateway,
            management,
        }
    }

    /// Router sending every path to [`HttpHandler::handle_request`].
    pub fn router(handler: Arc<Self>) -> Router {
        let route = |handler: Arc<HttpHandler>| {
            any(move |req: Request| {
                let handler = handler.clone();
                async move {
                    let client_addr = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| *addr);
                    match handler.handle_request(req, client_addr).await {
                        Ok(response) => Ok::<_, Infallible>(response),
                        Err(e) => {
                            tracing::error!("Request handling error: {:?}", e);
                            Ok(internal_error())
                        }
                    }
                }
            })
        };

        Router::new()
            .route("/{*path}", route(handler.clone()))
            .route("/", route(handler))
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        if self.management.enabled {
            if let Some(endpoint) = req.uri().path().strip_prefix(&self.management.base_path) {
                match (req.method(), endpoint) {
                    (&Method::GET, "/routes") => return self.handle_list_routes(),
                    (&Method::POST, "/refresh") => return self.handle_refresh().await,
                    (&Method::GET, other) if other.starts_with("/routes/") => {
                        let id = other.trim_start_matches("/routes/").to_string();
                        return self.handle_route_detail(&id);
                    }
                    _ => {}
                }
            }
        }

        Ok(self.gateway.handle(Self::exchange(req, client_addr)).await)
    }

    fn exchange(req: Request<AxumBody>, client_addr: Option<SocketAddr>) -> Exchange {
        let (parts, body) = req.into_parts();
        let request = GatewayRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            remote_addr: client_addr,
        };
        Exchange::new(request, body)
    }

    fn handle_list_routes(&self) -> Result<Response<AxumBody>> {
        let snapshot = self.gateway.routes().snapshot();
        let routes: Vec<RouteDescription> = snapshot.routes().iter().map(|r| r.describe()).collect();
        json_response(StatusCode::OK, &serde_json::to_value(routes)?)
    }

    fn handle_route_detail(&self, id: &str) -> Result<Response<AxumBody>> {
        let snapshot = self.gateway.routes().snapshot();
        match snapshot.find(id) {
            Some(route) => json_response(StatusCode::OK, &serde_json::to_value(route.describe())?),
            None => json_response(
                StatusCode::NOT_FOUND,
                &json!({ "error": { "code": "ROUTE_NOT_FOUND", "message": format!("no route '{id}'") } }),
            ),
        }
    }

    async fn handle_refresh(&self) -> Result<Response<AxumBody>> {
        tracing::info!("Route refresh requested through management endpoint");
        match self.gateway.routes().refresh().await {
            Ok(routes) => json_response(StatusCode::OK, &json!({ "routes": routes })),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "error": { "code": "REFRESH_FAILED", "message": format!("{e:#}") } }),
            ),
        }
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Result<Response<AxumBody>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(AxumBody::from(body.to_string()))
        .wrap_err("Failed to build management response")
}

fn internal_error() -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        core::{route::Route, route_table::RouteTable},
        ports::http_client::{HttpClient, HttpClientResult},
    };

    /// Answers with the target URI.
    struct Echo;

    #[async_trait]
    impl HttpClient for Echo {
        async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
            Ok(Response::new(AxumBody::from(req.uri().to_string())))
        }
    }

    fn handler() -> HttpHandler {
        let table = RouteTable::from_routes(vec![
            Route::builder("echo")
                .uri("http://echo:7000")
                .build()
                .unwrap(),
        ]);
        let gateway = Arc::new(GatewayHandler::new(Arc::new(table), Arc::new(Echo)));
        HttpHandler::new(gateway, ManagementConfig::default())
    }

    async fn body_json(response: Response<AxumBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str) -> Request<AxumBody> {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(AxumBody::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_proxies_ordinary_requests() {
        let response = handler()
            .handle_request(request(Method::GET, "/anything?x=1"), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"http://echo:7000/anything?x=1");
    }

    #[tokio::test]
    async fn test_lists_routes() {
        let response = handler()
            .handle_request(request(Method::GET, "/actuator/gateway/routes"), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let routes = body_json(response).await;
        assert_eq!(routes[0]["id"], "echo");
        assert_eq!(routes[0]["predicate"], "Always");

        let missing = handler()
            .handle_request(request(Method::GET, "/actuator/gateway/routes/nope"), None)
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refresh_on_fixed_table_reports_route_count() {
        let response = handler()
            .handle_request(request(Method::POST, "/actuator/gateway/refresh"), None)
            .await
            .unwrap();
        assert_eq!(body_json(response).await["routes"], 1);
    }

    #[tokio::test]
    async fn test_disabled_management_is_proxied() {
        let table = RouteTable::from_routes(vec![
            Route::builder("echo").uri("http://echo:7000").build().unwrap(),
        ]);
        let gateway = Arc::new(GatewayHandler::new(Arc::new(table), Arc::new(Echo)));
        let handler = HttpHandler::new(
            gateway,
            ManagementConfig {
                enabled: false,
                ..ManagementConfig::default()
            },
        );
        let response = handler
            .handle_request(request(Method::GET, "/actuator/gateway/routes"), None)
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"http://echo:7000/actuator/gateway/routes");
    }

    #[tokio::test]
    async fn test_router_serves_through_tower() {
        use tower::ServiceExt;

        let app = HttpHandler::router(Arc::new(handler()));
        let response = app
            .oneshot(request(Method::GET, "/actuator/gateway/routes/echo"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], "echo");
    }
}
