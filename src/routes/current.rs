use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};

use crate::auth::{require_grants, AuthUser, GRANT_ADMIN, GRANT_EDIT};
use crate::error::AppResult;
use crate::services::existing::{
    self, BandEdit, BandSummary, MapEdit, MapGroupEdit, MapGroupSummary, MapSummary,
};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct MapGroupsResponse {
    pub(crate) map_groups: Vec<MapGroupSummary>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct MapGroupDetail {
    pub(crate) map_group: MapGroupSummary,
    pub(crate) maps: Vec<MapSummary>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct MapDetail {
    pub(crate) map: MapSummary,
    pub(crate) bands: Vec<BandSummary>,
}

#[utoipa::path(
    get,
    path = "/current",
    tag = "current",
    responses(
        (status = 200, description = "Registered map groups", body = MapGroupsResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden")
    )
)]
pub(crate) async fn list_map_groups(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<MapGroupsResponse>> {
    require_grants(&user, &[GRANT_EDIT])?;
    let map_groups = existing::read_map_groups(&state.db).await?;
    tracing::info!(groups = map_groups.len(), "current.index");
    Ok(Json(MapGroupsResponse { map_groups }))
}

#[utoipa::path(
    get,
    path = "/current/groups/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Map group id")),
    responses(
        (status = 200, description = "Map group with its maps", body = MapGroupDetail),
        (status = 404, description = "Map group not found")
    )
)]
pub(crate) async fn get_map_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<MapGroupDetail>> {
    require_grants(&user, &[GRANT_EDIT])?;
    let map_group = existing::read_map_group(&state.db, id).await?;
    let maps = existing::read_maps_for_map_group(&state.db, id).await?;
    tracing::info!(map_group = id, maps = maps.len(), "current.maps");
    Ok(Json(MapGroupDetail { map_group, maps }))
}

#[utoipa::path(
    put,
    path = "/current/groups/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Map group id")),
    request_body = MapGroupEdit,
    responses(
        (status = 200, description = "Updated map group", body = MapGroupSummary),
        (status = 400, description = "Invalid edit"),
        (status = 404, description = "Map group not found")
    )
)]
pub(crate) async fn update_map_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
    Json(edit): Json<MapGroupEdit>,
) -> AppResult<Json<MapGroupSummary>> {
    require_grants(&user, &[GRANT_EDIT])?;
    let group = existing::update_map_group(&state.db, id, &edit).await?;
    tracing::info!(user = %user.name, map_group = id, "current.update_group");
    Ok(Json(group))
}

#[utoipa::path(
    delete,
    path = "/current/groups/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Map group id")),
    responses(
        (status = 204, description = "Deleted the group and everything under it"),
        (status = 404, description = "Map group not found")
    )
)]
pub(crate) async fn delete_map_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    require_grants(&user, &[GRANT_ADMIN])?;
    existing::delete_map_group(&state.db, id).await?;
    tracing::info!(user = %user.name, map_group = id, "current.delete_group");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/current/maps/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Map id")),
    responses(
        (status = 200, description = "Map with its bands and layers", body = MapDetail),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn get_map(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<MapDetail>> {
    require_grants(&user, &[GRANT_EDIT])?;
    let map = existing::read_map(&state.db, id).await?;
    let bands = existing::read_bands_for_map(&state.db, id).await?;
    tracing::info!(map = id, bands = bands.len(), "current.bands");
    Ok(Json(MapDetail { map, bands }))
}

#[utoipa::path(
    put,
    path = "/current/maps/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Map id")),
    request_body = MapEdit,
    responses(
        (status = 200, description = "Updated map", body = MapSummary),
        (status = 400, description = "Invalid edit"),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn update_map(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
    Json(edit): Json<MapEdit>,
) -> AppResult<Json<MapSummary>> {
    require_grants(&user, &[GRANT_EDIT])?;
    let map = existing::update_map(&state.db, id, &edit).await?;
    tracing::info!(user = %user.name, map = id, cascade = edit.cascade_grant, "current.update_map");
    Ok(Json(map))
}

#[utoipa::path(
    delete,
    path = "/current/maps/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Map id")),
    responses(
        (status = 204, description = "Deleted the map with its bands and layers"),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn delete_map(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    require_grants(&user, &[GRANT_ADMIN])?;
    existing::delete_map(&state.db, id).await?;
    tracing::info!(user = %user.name, map = id, "current.delete_map");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/current/bands/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Band id")),
    request_body = BandEdit,
    responses(
        (status = 200, description = "Updated band", body = BandSummary),
        (status = 400, description = "Invalid edit"),
        (status = 404, description = "Band not found")
    )
)]
pub(crate) async fn update_band(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
    Json(edit): Json<BandEdit>,
) -> AppResult<Json<BandSummary>> {
    require_grants(&user, &[GRANT_EDIT])?;
    let band = existing::update_band(&state.db, id, &edit).await?;
    tracing::info!(user = %user.name, band = id, cascade = edit.cascade_grant, "current.update_band");
    Ok(Json(band))
}

#[utoipa::path(
    delete,
    path = "/current/bands/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Band id")),
    responses(
        (status = 204, description = "Deleted the band with its layers"),
        (status = 404, description = "Band not found")
    )
)]
pub(crate) async fn delete_band(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    require_grants(&user, &[GRANT_ADMIN])?;
    existing::delete_band(&state.db, id).await?;
    tracing::info!(user = %user.name, band = id, "current.delete_band");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/current/layers/{id}",
    tag = "current",
    params(("id" = i32, Path, description = "Layer id")),
    responses(
        (status = 204, description = "Deleted the layer"),
        (status = 404, description = "Layer not found")
    )
)]
pub(crate) async fn delete_layer(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    require_grants(&user, &[GRANT_ADMIN])?;
    existing::delete_layer(&state.db, id).await?;
    tracing::info!(user = %user.name, layer = id, "current.delete_layer");
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/current", get(list_map_groups))
        .route(
            "/current/groups/{id}",
            get(get_map_group)
                .put(update_map_group)
                .delete(delete_map_group),
        )
        .route(
            "/current/maps/{id}",
            get(get_map).put(update_map).delete(delete_map),
        )
        .route("/current/bands/{id}", put(update_band).delete(delete_band))
        .route("/current/layers/{id}", delete(delete_layer))
}
