use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes::{add, current, health};
use crate::services::{creation, existing, filesystem, fits};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "tileadder",
        description = "Admin API for registering FITS tile datasets with the tile server"
    ),
    paths(
        health::healthz_handler,
        add::add_home,
        add::list_directory,
        add::evaluate_file,
        add::create_map_group,
        add::create_form,
        add::create_map,
        add::append_to_existing,
        current::list_map_groups,
        current::get_map_group,
        current::update_map_group,
        current::delete_map_group,
        current::get_map,
        current::update_map,
        current::delete_map,
        current::update_band,
        current::delete_band,
        current::delete_layer
    ),
    components(schemas(
        health::HealthResponse,
        add::AddContext,
        add::CreateFormContext,
        add::ListRequest,
        add::EvaluateRequest,
        add::EvaluateResponse,
        current::MapGroupsResponse,
        current::MapGroupDetail,
        current::MapDetail,
        filesystem::DirectoryListing,
        fits::BoundingBox,
        fits::LayerProvider,
        fits::ProviderRecord,
        fits::LayerDescriptor,
        creation::LayerChoice,
        creation::BandForm,
        creation::MapForm,
        creation::ExistingMapForm,
        creation::MapGroupForm,
        creation::CreatedMap,
        existing::MapGroupSummary,
        existing::MapSummary,
        existing::BandSummary,
        existing::LayerSummary,
        existing::MapGroupEdit,
        existing::MapEdit,
        existing::BandEdit
    )),
    tags(
        (name = "health"),
        (name = "add", description = "Browse the map directory and register new maps"),
        (name = "current", description = "Inspect, edit and delete registered maps")
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or(serde_json::Value::Null)
}

async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = openapi_json();
        let paths = doc["paths"].as_object().expect("paths object");
        for path in [
            "/healthz",
            "/add",
            "/add/list",
            "/add/evaluate",
            "/add/groups",
            "/add/create",
            "/add/existing",
            "/current",
            "/current/groups/{id}",
            "/current/maps/{id}",
            "/current/bands/{id}",
            "/current/layers/{id}",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
        assert!(doc["components"]["schemas"]["LayerSummary"].is_object());
    }
}
