use anyhow::Result;
use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::debug;

use accounts_types::{CreateUser, ListUsersQuery, Login, Token, UpdateUser, User, UserPage};

use crate::{auth::AuthUser, error::AppError, server::Dependencies};

pub fn create_router(deps: Dependencies) -> Router {
    let router: Router = Router::new()
        .route("/v1/users", post(create_user).get(list_users))
        .route("/v1/users/login", post(login))
        .route(
            "/v1/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .with_state(deps);
    router
}

#[debug_handler]
async fn create_user(
    State(state): State<Dependencies>,
    Json(payload): Json<CreateUser>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let user = state.users.create_user(payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[debug_handler]
async fn login(
    State(state): State<Dependencies>,
    Json(payload): Json<Login>,
) -> Result<Json<Token>, AppError> {
    let token = state.users.authenticate(payload).await?;
    Ok(Json(token))
}

#[debug_handler]
async fn list_users(
    State(state): State<Dependencies>,
    caller: AuthUser,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<UserPage>, AppError> {
    debug!(caller = caller.id, email = caller.email, "list users");
    let page = state.users.list_users(query).await?;
    Ok(Json(page))
}

#[debug_handler]
async fn get_user(
    State(state): State<Dependencies>,
    _caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<User>, AppError> {
    let user = state.users.get_user(id).await?;
    Ok(Json(user))
}

#[debug_handler]
async fn update_user(
    State(state): State<Dependencies>,
    caller: AuthUser,
    Path(id): Path<String>,
    Json(payload): Json<UpdateUser>,
) -> Result<Json<User>, AppError> {
    debug!(caller = caller.id, id = id, "update user");
    let user = state.users.update_user(id, payload).await?;
    Ok(Json(user))
}

#[debug_handler]
async fn delete_user(
    State(state): State<Dependencies>,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    debug!(caller = caller.id, id = id, "delete user");
    state.users.delete_user(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
