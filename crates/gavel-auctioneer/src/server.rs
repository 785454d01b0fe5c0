//! The HTTP edge: product creation and websocket subscription.
//!
//! Signup, login, and session management are external collaborators; this
//! router only consumes the authenticated identity they inject as an
//! [`AuthenticatedUser`] request extension.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{
        ws::WebSocket,
        Path,
        State,
        WebSocketUpgrade,
    },
    http::StatusCode,
    response::{
        IntoResponse,
        Response,
    },
    routing::{
        get,
        post,
    },
    Extension,
    Json,
    Router,
};
use gavel_core::{
    auction::{
        NewProduct,
        Product,
    },
    primitive::{
        Money,
        ProductId,
        UserId,
    },
};
use jiff::Timestamp;
use serde::Deserialize;
use serde_json::json;
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{
    error,
    info,
    instrument,
};
use uuid::Uuid;

use crate::{
    lobby::{
        AlreadyLive,
        Lobby,
    },
    metrics::Metrics,
    room,
    session,
    store::{
        BidStore,
        GetProductError,
    },
    transport::Connection,
};

const MIN_AUCTION_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

/// Identity of the authenticated caller, injected as a request extension by
/// the authentication middleware in front of this router.
#[derive(Clone, Copy, Debug)]
pub struct AuthenticatedUser(pub UserId);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) lobby: Lobby,
    pub(crate) store: Arc<dyn BidStore>,
    pub(crate) metrics: &'static Metrics,
    /// Root of every room's cancellation token; cancelling it ends all
    /// live auctions.
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/products", post(create_product))
        .route("/api/v1/products/:product_id/ws", get(subscribe_to_auction))
        .with_state(state)
}

/// Spawns the product's auction room and registers it in the lobby.
#[instrument(skip_all, fields(product_id = %product.id), err)]
pub(crate) fn create_auction(state: &AppState, product: &Product) -> Result<(), AlreadyLive> {
    let (handle, worker) = room::Builder {
        product_id: product.id,
        auction_end: product.auction_end,
        store: state.store.clone(),
        lobby: state.lobby.clone(),
        metrics: state.metrics,
        // Rooms hang off the service's shutdown root, not the request.
        cancellation_token: state.shutdown_token.child_token(),
    }
    .build();
    state.lobby.attach(handle)?;
    state.tasks.spawn(worker.run());
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateProductRequest {
    product_name: String,
    description: String,
    base_price: f64,
    auction_end: Timestamp,
}

impl CreateProductRequest {
    /// The product-creation validation rules.
    fn into_new_product(
        self,
        seller: UserId,
    ) -> Result<NewProduct, HashMap<&'static str, &'static str>> {
        let mut problems = HashMap::new();
        if self.product_name.trim().is_empty() {
            problems.insert("product_name", "this field cannot be blank");
        }
        let description_chars = self.description.chars().count();
        if !(10..=255).contains(&description_chars) {
            problems.insert(
                "description",
                "this field must have a length between 10 and 255 characters",
            );
        }
        let base_price = match Money::checked_from(self.base_price) {
            Ok(price) if price.get() > 0.0 => Some(price),
            _ => {
                problems.insert("base_price", "this field must be a positive amount");
                None
            }
        };
        let remaining = Timestamp::now().duration_until(self.auction_end);
        if remaining.is_negative() || remaining.unsigned_abs() < MIN_AUCTION_DURATION {
            problems.insert("auction_end", "must be at least two hours from now");
        }
        if !problems.is_empty() {
            return Err(problems);
        }
        Ok(NewProduct {
            seller,
            product_name: self.product_name,
            description: self.description,
            base_price: base_price.expect("base_price is set when there are no problems"),
            auction_end: self.auction_end,
        })
    }
}

async fn create_product(
    State(state): State<AppState>,
    auth: Option<Extension<AuthenticatedUser>>,
    Json(request): Json<CreateProductRequest>,
) -> Response {
    let Some(Extension(AuthenticatedUser(seller))) = auth else {
        return unauthorized();
    };
    let new_product = match request.into_new_product(seller) {
        Ok(new_product) => new_product,
        Err(problems) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(problems)).into_response();
        }
    };
    let product = match state.store.create_product(new_product).await {
        Ok(product) => product,
        Err(error) => {
            error!(%error, "failed creating the product");
            return failed_to_create();
        }
    };
    if let Err(error) = create_auction(&state, &product) {
        error!(%error, "failed opening the auction room");
        return failed_to_create();
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "product_id": product.id,
            "message": "product auction created successfully",
        })),
    )
        .into_response()
}

async fn subscribe_to_auction(
    State(state): State<AppState>,
    auth: Option<Extension<AuthenticatedUser>>,
    Path(raw_product_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(Extension(AuthenticatedUser(user_id))) = auth else {
        return unauthorized();
    };
    let Ok(product_id) = raw_product_id.parse::<Uuid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "invalid product id, must be a valid uuid"})),
        )
            .into_response();
    };
    let product_id = ProductId::from(product_id);
    if let Err(error) = state.store.get_product(product_id).await {
        return match error {
            GetProductError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"message": "no product found with the given id"})),
            )
                .into_response(),
            GetProductError::Transient {
                source,
            } => {
                error!(error = %source, "failed looking up the product");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"message": "unexpected error, try again later"})),
                )
                    .into_response()
            }
        };
    }
    let Some(room) = state.lobby.lookup(product_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "the auction for this product has ended or does not exist"})),
        )
            .into_response();
    };
    let metrics = state.metrics;
    let tasks = state.tasks.clone();
    // The protocol's frame limit is enforced by the session reader, which
    // answers oversized frames with an invalid-json notice; capping the
    // socket here would tear the connection down before the reader ever
    // saw the frame.
    ws.on_upgrade(move |socket| attach_bidder(socket, user_id, room, metrics, tasks))
}

#[instrument(skip_all, fields(%user_id, product_id = %room.product_id()))]
async fn attach_bidder(
    socket: WebSocket,
    user_id: UserId,
    room: room::RoomHandle,
    metrics: &'static Metrics,
    tasks: TaskTracker,
) {
    let connection = Connection::from_websocket(socket);
    let session = session::spawn(user_id, connection, room.clone(), metrics, &tasks);
    if room.register(session).await.is_err() {
        info!("auction room closed before the bidder could join");
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "must be logged in"})),
    )
        .into_response()
}

fn failed_to_create() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"message": "failed to create product auction, try again later"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use axum::{
        body::Body,
        http::{
            header,
            Request,
            StatusCode,
        },
    };
    use gavel_core::primitive::{
        ProductId,
        UserId,
    };
    use jiff::Timestamp;
    use tokio_util::{
        sync::CancellationToken,
        task::TaskTracker,
    };
    use tower::ServiceExt as _;

    use super::{
        router,
        AppState,
        AuthenticatedUser,
    };
    use crate::{
        lobby::Lobby,
        metrics::Metrics,
        store::InMemoryStore,
    };

    fn test_state() -> AppState {
        AppState {
            lobby: Lobby::new(),
            store: Arc::new(InMemoryStore::new()),
            metrics: Metrics::register(),
            shutdown_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn product_payload() -> serde_json::Value {
        let auction_end = Timestamp::now()
            .checked_add(Duration::from_secs(3 * 60 * 60))
            .unwrap();
        serde_json::json!({
            "product_name": "vintage gavel",
            "description": "a mahogany auction gavel",
            "base_price": 100.0,
            "auction_end": auction_end.to_string(),
        })
    }

    fn create_product_request(payload: &serde_json::Value, authenticated: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/products")
            .header(header::CONTENT_TYPE, "application/json");
        if authenticated {
            builder = builder.extension(AuthenticatedUser(UserId::random()));
        }
        builder.body(Body::from(payload.to_string())).unwrap()
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn creating_a_product_requires_authentication() {
        let state = test_state();
        let response = router(state)
            .oneshot(create_product_request(&product_payload(), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_product_payloads_report_their_problems() {
        let state = test_state();
        let mut payload = product_payload();
        payload["description"] = serde_json::json!("too short");
        payload["base_price"] = serde_json::json!(0.0);

        let response = router(state)
            .oneshot(create_product_request(&payload, true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let problems = response_json(response).await;
        assert!(problems.get("description").is_some());
        assert!(problems.get("base_price").is_some());
    }

    #[tokio::test]
    async fn creating_a_product_opens_its_auction_room() {
        let state = test_state();
        let response = router(state.clone())
            .oneshot(create_product_request(&product_payload(), true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = response_json(response).await;
        let product_id: ProductId = serde_json::from_value(body["product_id"].clone()).unwrap();
        assert!(state.lobby.lookup(product_id).is_some());
    }

    #[tokio::test]
    async fn subscribing_to_an_unknown_product_is_a_miss() {
        let state = test_state();
        let request = Request::builder()
            .method("GET")
            .uri(format!("/api/v1/products/{}/ws", ProductId::random()))
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .extension(AuthenticatedUser(UserId::random()))
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
