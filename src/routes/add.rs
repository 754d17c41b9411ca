use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::path::PathBuf;

use crate::auth::{require_grants, AuthUser, GRANT_ADD};
use crate::error::AppResult;
use crate::services::creation::{self, CreatedMap, ExistingMapForm, MapForm, MapGroupForm};
use crate::services::existing::{read_map_groups, MapGroupSummary};
use crate::services::filesystem::{safe_evaluate, DirectoryListing};
use crate::services::fits::LayerDescriptor;
use crate::services::run_blocking;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AddContext {
    pub(crate) extensions: Vec<String>,
    pub(crate) colormaps: Vec<String>,
    pub(crate) map_groups: Vec<MapGroupSummary>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct CreateFormContext {
    pub(crate) map_groups: Vec<MapGroupSummary>,
    pub(crate) colormaps: Vec<String>,
    pub(crate) default_cmap: String,
    pub(crate) tile_size: u32,
}

#[derive(Debug, Clone, Default, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct ListRequest {
    /// Directory relative to the map directory; omitted or empty lists the root.
    #[serde(default)]
    pub(crate) path: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct EvaluateRequest {
    pub(crate) path: String,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct EvaluateResponse {
    pub(crate) filename: String,
    pub(crate) layers: Vec<LayerDescriptor>,
}

#[utoipa::path(
    get,
    path = "/add",
    tag = "add",
    responses(
        (status = 200, description = "Form bootstrap", body = AddContext),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden")
    )
)]
pub(crate) async fn add_home(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<AddContext>> {
    require_grants(&user, &[GRANT_ADD])?;
    let map_groups = read_map_groups(&state.db).await?;
    tracing::info!(user = %user.name, groups = map_groups.len(), "add.index");
    Ok(Json(AddContext {
        extensions: state.sandbox.extensions().to_vec(),
        colormaps: state.config.colormaps.clone(),
        map_groups,
    }))
}

#[utoipa::path(
    post,
    path = "/add/list",
    tag = "add",
    request_body = ListRequest,
    responses(
        (status = 200, description = "Directory listing", body = DirectoryListing),
        (status = 400, description = "Path outside the map directory"),
        (status = 404, description = "Directory not found")
    )
)]
pub(crate) async fn list_directory(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<ListRequest>,
) -> AppResult<Json<DirectoryListing>> {
    require_grants(&user, &[GRANT_ADD])?;
    let requested = request
        .path
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    let sandbox = state.sandbox.clone();
    let log_path = requested.clone();
    let listing = run_blocking(move || sandbox.list_directory(requested.as_deref())).await?;
    tracing::info!(
        path = ?log_path,
        files = listing.files.len(),
        directories = listing.directories.len(),
        "add.list"
    );
    Ok(Json(listing))
}

#[utoipa::path(
    post,
    path = "/add/evaluate",
    tag = "add",
    request_body = EvaluateRequest,
    responses(
        (status = 200, description = "Layers found in the file", body = EvaluateResponse),
        (status = 400, description = "Path outside the map directory or disallowed extension"),
        (status = 404, description = "File not found"),
        (status = 500, description = "Unreadable data file")
    )
)]
pub(crate) async fn evaluate_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<EvaluateRequest>,
) -> AppResult<Json<EvaluateResponse>> {
    require_grants(&user, &[GRANT_ADD])?;
    let path = PathBuf::from(request.path.trim());
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let sandbox = state.sandbox.clone();
    let reader = state.reader.clone();
    let target = path.clone();
    let layers =
        run_blocking(move || safe_evaluate(&sandbox, reader.as_ref(), &target)).await?;
    tracing::info!(path = %path.display(), layers = layers.len(), "add.evaluate");
    Ok(Json(EvaluateResponse { filename, layers }))
}

#[utoipa::path(
    post,
    path = "/add/groups",
    tag = "add",
    request_body = MapGroupForm,
    responses(
        (status = 201, description = "Created map group", body = MapGroupSummary),
        (status = 400, description = "Invalid form")
    )
)]
pub(crate) async fn create_map_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(form): Json<MapGroupForm>,
) -> AppResult<(StatusCode, Json<MapGroupSummary>)> {
    require_grants(&user, &[GRANT_ADD])?;
    let group = creation::create_map_group(&state.db, &form).await?;
    tracing::info!(user = %user.name, map_group = group.id, "add.groups");
    Ok((StatusCode::CREATED, Json(group)))
}

#[utoipa::path(
    get,
    path = "/add/create",
    tag = "add",
    responses((status = 200, description = "Create-map form context", body = CreateFormContext))
)]
pub(crate) async fn create_form(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<CreateFormContext>> {
    require_grants(&user, &[GRANT_ADD])?;
    let map_groups = read_map_groups(&state.db).await?;
    Ok(Json(CreateFormContext {
        map_groups,
        colormaps: state.config.colormaps.clone(),
        default_cmap: creation::DEFAULT_CMAP.to_string(),
        tile_size: state.config.tile_size,
    }))
}

#[utoipa::path(
    post,
    path = "/add/create",
    tag = "add",
    request_body = MapForm,
    responses(
        (status = 201, description = "Created map, band and layers", body = CreatedMap),
        (status = 400, description = "Invalid form"),
        (status = 404, description = "Map group or file not found"),
        (status = 409, description = "Form layers missing from the file, or map id already used"),
        (status = 500, description = "Unreadable data file")
    )
)]
pub(crate) async fn create_map(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(form): Json<MapForm>,
) -> AppResult<(StatusCode, Json<CreatedMap>)> {
    require_grants(&user, &[GRANT_ADD])?;
    let created = creation::create_map(
        &state.db,
        &state.sandbox,
        &state.reader,
        &state.config.colormaps,
        &form,
    )
    .await?;
    tracing::info!(user = %user.name, map = created.map.id, "add.create");
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    post,
    path = "/add/existing",
    tag = "add",
    request_body = ExistingMapForm,
    responses(
        (status = 200, description = "Band and layers written to the existing map", body = CreatedMap),
        (status = 400, description = "Invalid form"),
        (status = 404, description = "Map or file not found"),
        (status = 409, description = "Form layers missing from the file"),
        (status = 500, description = "Unreadable data file")
    )
)]
pub(crate) async fn append_to_existing(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(form): Json<ExistingMapForm>,
) -> AppResult<Json<CreatedMap>> {
    require_grants(&user, &[GRANT_ADD])?;
    let updated = creation::append_to_existing_map(
        &state.db,
        &state.sandbox,
        &state.reader,
        &state.config.colormaps,
        &form,
    )
    .await?;
    tracing::info!(user = %user.name, map = updated.map.id, band = updated.band.id, "add.existing");
    Ok(Json(updated))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/add", get(add_home))
        .route("/add/list", post(list_directory))
        .route("/add/evaluate", post(evaluate_file))
        .route("/add/groups", post(create_map_group))
        .route("/add/create", get(create_form).post(create_map))
        .route("/add/existing", post(append_to_existing))
}
