use axum::{
    Router, error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse,
    routing::get,
};
use moat_keeper::config::RateLimitConfig;
use moat_keeper::config::ResourceConfig;
use moat_keeper::{MoatError, MoatKeeper, MoatLayer, ResourceId};
use std::time::Duration;
use tower::BoxError;
use tower::ServiceBuilder;

#[tokio::main]
async fn main() {
    // 1. Setup Keeper: 10 requests per second on "/"
    let id = ResourceId::method("GET /");
    let keeper = MoatKeeper::builder()
        .baseline(
            id.clone(),
            ResourceConfig::new().with_rate(RateLimitConfig::new(10, Duration::from_secs(1))),
        )
        .build()
        .unwrap();

    // 2. Build the Router
    let app = Router::new()
        .route("/", get(|| async { "Hello, Moat!" }))
        .layer(
            ServiceBuilder::new()
                // 1. The outermost layer: catches BoxError and returns Response
                .layer(HandleErrorLayer::new(handle_moat_error))
                // 2. The middle layer: introduces BoxError
                .layer(MoatLayer::new(keeper, id))
                // 3. Converts the Route's Infallible to BoxError
                .map_err(BoxError::from),
        );

    // 3. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .unwrap();
    println!("📡 Listening on http://127.0.0.1:3000");

    axum::serve(listener, app).await.unwrap();
}

/// The signature must match BoxError -> IntoResponse
async fn handle_moat_error(err: BoxError) -> impl IntoResponse {
    if let Some(moat_err) = err.downcast_ref::<MoatError>() {
        moat_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}
