use std::net::SocketAddr;

use axum::{routing, Router};
use sprintsafe::app::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sprintsafe=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_state = AppState::new_from_env().await.unwrap();

    let user = Router::new()
        .route(
            "/createUser",
            routing::post(sprintsafe::api::v1::user::create_user),
        )
        .route("/login", routing::post(sprintsafe::api::v1::user::login))
        .route(
            "/verify-otp",
            routing::post(sprintsafe::api::v1::user::verify_otp),
        )
        .route(
            "/registration-verify-otp",
            routing::post(sprintsafe::api::v1::user::verify_otp),
        )
        .route(
            "/verify-email-otp",
            routing::post(sprintsafe::api::v1::user::verify_email_otp),
        )
        .route(
            "/resend-otp",
            routing::post(sprintsafe::api::v1::user::resend_otp),
        )
        .route(
            "/resend-email-otp",
            routing::post(sprintsafe::api::v1::user::resend_email_otp),
        )
        .route(
            "/pickup-login",
            routing::post(sprintsafe::api::v1::user::pickup_login),
        );

    let order = Router::new()
        .route(
            "/create-shipment",
            routing::post(sprintsafe::api::v1::order::create_shipment),
        )
        .route(
            "/complete-dropOff",
            routing::post(sprintsafe::api::v1::order::complete_drop_off),
        )
        .route(
            "/collect-shipment-faceId-v1",
            routing::post(sprintsafe::api::v1::order::collect_shipment_face_id),
        )
        .route(
            "/collectShipment-collect-pin-non-face-id",
            routing::post(sprintsafe::api::v1::order::collect_shipment_pin),
        )
        .route(
            "/complete-order",
            routing::post(sprintsafe::api::v1::order::complete_order),
        );

    let admin = Router::new()
        .route(
            "/createTerminal",
            routing::post(sprintsafe::api::v1::terminal::create_terminal),
        )
        .route(
            "/update-terminal",
            routing::post(sprintsafe::api::v1::terminal::update_terminal_details),
        )
        .route(
            "/terminals/price",
            routing::post(sprintsafe::api::v1::terminal::update_pricing),
        )
        .route(
            "/getTerminal/:id",
            routing::get(sprintsafe::api::v1::terminal::get_terminal),
        )
        .route(
            "/terminal/login",
            routing::post(sprintsafe::api::v1::member::member_login),
        )
        .route(
            "/member/create",
            routing::post(sprintsafe::api::v1::member::create_member),
        )
        .route(
            "/member/update",
            routing::post(sprintsafe::api::v1::member::update_member),
        );

    let app = Router::new()
        .nest("/user", user)
        .nest("/order", order)
        .nest("/admin", admin)
        .with_state(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::debug!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
