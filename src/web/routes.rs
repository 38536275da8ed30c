use crate::core::EntityKind;
use crate::model::{Customer, EntityFields, Enquiry, Fee, Note, Product, StageHistoryEntry, User};
use crate::web::auth;
use crate::web::handlers::{
    create_record, delete_record, get_record, healthcheck, list_records, update_record,
};
use crate::web::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/me", get(auth::me))
        .merge(collection_routes::<Customer>())
        .merge(collection_routes::<Enquiry>())
        .merge(collection_routes::<Fee>())
        .merge(collection_routes::<Note>())
        .merge(collection_routes::<Product>())
        .merge(collection_routes::<StageHistoryEntry>())
        .merge(collection_routes::<User>())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .route("/auth/login", post(auth::login));

    Router::new()
        .route("/health", get(healthcheck))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn collection_routes<T: EntityFields>() -> Router<AppState> {
    let base = format!("/{}", path_segment(T::KIND));
    Router::new()
        .route(&base, get(list_records::<T>).post(create_record::<T>))
        .route(
            &format!("{base}/:id"),
            get(get_record::<T>)
                .put(update_record::<T>)
                .delete(delete_record::<T>),
        )
}

fn path_segment(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::StageHistory => "stage-history",
        other => other.collection(),
    }
}
