//! Reads, edits and deletes of records already registered for the tile server.

use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::services::creation::{normalize_optional, DisplayBound};
use crate::services::fits::{BoundingBox, ProviderRecord};
use crate::services::{Rejection, ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, serde::Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct MapGroupSummary {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub grant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct MapSummary {
    pub id: i32,
    pub map_id: String,
    pub map_group_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub grant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, utoipa::ToSchema)]
pub struct BandSummary {
    pub id: i32,
    pub band_id: String,
    pub map_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub grant: Option<String>,
    pub layers: Vec<LayerSummary>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, utoipa::ToSchema)]
pub struct LayerSummary {
    pub id: i32,
    pub layer_id: String,
    pub band_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub grant: Option<String>,
    pub quantity: Option<String>,
    pub units: Option<String>,
    #[schema(value_type = String, example = "auto")]
    pub vmin: DisplayBound,
    #[schema(value_type = String, example = "auto")]
    pub vmax: DisplayBound,
    pub cmap: String,
    pub bounding_box: BoundingBox,
    pub number_of_levels: i32,
    pub tile_size: i32,
    /// `None` when the stored provider has a schema this build does not understand.
    pub provider: Option<ProviderRecord>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct BandRow {
    pub(crate) id: i32,
    pub(crate) band_id: String,
    pub(crate) map_id: i32,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) grant: Option<String>,
}

impl BandRow {
    pub(crate) fn into_summary(self, layers: Vec<LayerSummary>) -> BandSummary {
        BandSummary {
            id: self.id,
            band_id: self.band_id,
            map_id: self.map_id,
            name: self.name,
            description: self.description,
            grant: self.grant,
            layers,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct LayerRow {
    id: i32,
    layer_id: String,
    band_id: i32,
    name: String,
    description: Option<String>,
    grant: Option<String>,
    quantity: Option<String>,
    units: Option<String>,
    vmin: Option<f64>,
    vmax: Option<f64>,
    cmap: String,
    provider: SqlJson<JsonValue>,
    bounding_left: f64,
    bounding_right: f64,
    bounding_top: f64,
    bounding_bottom: f64,
    number_of_levels: i32,
    tile_size: i32,
}

impl From<LayerRow> for LayerSummary {
    fn from(row: LayerRow) -> Self {
        let provider = match ProviderRecord::from_json(row.provider.0) {
            Ok(provider) => Some(provider),
            Err(err) => {
                tracing::warn!(layer = row.id, error = %err, "stored provider could not be decoded");
                None
            }
        };
        Self {
            id: row.id,
            layer_id: row.layer_id,
            band_id: row.band_id,
            name: row.name,
            description: row.description,
            grant: row.grant,
            quantity: row.quantity,
            units: row.units,
            vmin: DisplayBound::from_column(row.vmin),
            vmax: DisplayBound::from_column(row.vmax),
            cmap: row.cmap,
            bounding_box: BoundingBox {
                left: row.bounding_left,
                right: row.bounding_right,
                top: row.bounding_top,
                bottom: row.bounding_bottom,
            },
            number_of_levels: row.number_of_levels,
            tile_size: row.tile_size,
            provider,
        }
    }
}

pub(crate) const LAYER_COLUMNS: &str = r#"id, layer_id, band_id, name, description, "grant", quantity, units,
    vmin, vmax, cmap, provider, bounding_left, bounding_right, bounding_top, bounding_bottom,
    number_of_levels, tile_size"#;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct MapGroupEdit {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub grant: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct MapEdit {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub grant: Option<String>,
    /// Copy the new grant onto every band and layer of the map.
    #[serde(default = "default_true")]
    pub cascade_grant: bool,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct BandEdit {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub grant: Option<String>,
    /// Copy the new grant onto every layer of the band.
    #[serde(default = "default_true")]
    pub cascade_grant: bool,
}

fn required_name(name: &str, field: &'static str) -> Result<String, Rejection> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Rejection::MissingField(field));
    }
    Ok(trimmed.to_string())
}

pub async fn read_map_groups(db: &PgPool) -> ServiceResult<Vec<MapGroupSummary>> {
    let groups = sqlx::query_as(
        r#"
        SELECT id, name, description, "grant"
        FROM map_group
        ORDER BY id
        "#,
    )
    .fetch_all(db)
    .await?;
    Ok(groups)
}

pub async fn read_map_group(db: &PgPool, map_group_id: i32) -> ServiceResult<MapGroupSummary> {
    sqlx::query_as(
        r#"
        SELECT id, name, description, "grant"
        FROM map_group
        WHERE id = $1
        "#,
    )
    .bind(map_group_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("Map group with id={map_group_id} not found")))
}

pub async fn read_maps_for_map_group(
    db: &PgPool,
    map_group_id: i32,
) -> ServiceResult<Vec<MapSummary>> {
    let maps = sqlx::query_as(
        r#"
        SELECT id, map_id, map_group_id, name, description, "grant"
        FROM map
        WHERE map_group_id = $1
        ORDER BY id
        "#,
    )
    .bind(map_group_id)
    .fetch_all(db)
    .await?;
    Ok(maps)
}

pub async fn read_map(db: &PgPool, map_id: i32) -> ServiceResult<MapSummary> {
    sqlx::query_as(
        r#"
        SELECT id, map_id, map_group_id, name, description, "grant"
        FROM map
        WHERE id = $1
        "#,
    )
    .bind(map_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("Map with id={map_id} not found")))
}

pub async fn read_bands_for_map(db: &PgPool, map_id: i32) -> ServiceResult<Vec<BandSummary>> {
    let bands: Vec<BandRow> = sqlx::query_as(
        r#"
        SELECT id, band_id, map_id, name, description, "grant"
        FROM band
        WHERE map_id = $1
        ORDER BY id
        "#,
    )
    .bind(map_id)
    .fetch_all(db)
    .await?;
    if bands.is_empty() {
        return Ok(Vec::new());
    }

    let band_ids: Vec<i32> = bands.iter().map(|band| band.id).collect();
    let layers: Vec<LayerRow> = sqlx::query_as(&format!(
        "SELECT {LAYER_COLUMNS} FROM layer WHERE band_id = ANY($1) ORDER BY id"
    ))
    .bind(&band_ids)
    .fetch_all(db)
    .await?;

    let mut by_band: HashMap<i32, Vec<LayerSummary>> = HashMap::new();
    for layer in layers {
        by_band
            .entry(layer.band_id)
            .or_default()
            .push(LayerSummary::from(layer));
    }

    Ok(bands
        .into_iter()
        .map(|band| {
            let layers = by_band.remove(&band.id).unwrap_or_default();
            band.into_summary(layers)
        })
        .collect())
}

pub async fn update_map_group(
    db: &PgPool,
    map_group_id: i32,
    edit: &MapGroupEdit,
) -> ServiceResult<MapGroupSummary> {
    let name = required_name(&edit.name, "name")?;
    sqlx::query_as(
        r#"
        UPDATE map_group
        SET name = $2, description = $3, "grant" = $4
        WHERE id = $1
        RETURNING id, name, description, "grant"
        "#,
    )
    .bind(map_group_id)
    .bind(name)
    .bind(normalize_optional(edit.description.as_deref()))
    .bind(normalize_optional(edit.grant.as_deref()))
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("Map group with id={map_group_id} not found")))
}

pub async fn update_map(db: &PgPool, map_id: i32, edit: &MapEdit) -> ServiceResult<MapSummary> {
    let name = required_name(&edit.name, "name")?;
    let grant = normalize_optional(edit.grant.as_deref());

    let mut tx = db.begin().await?;
    let map: MapSummary = sqlx::query_as(
        r#"
        UPDATE map
        SET name = $2, description = $3, "grant" = $4
        WHERE id = $1
        RETURNING id, map_id, map_group_id, name, description, "grant"
        "#,
    )
    .bind(map_id)
    .bind(name)
    .bind(normalize_optional(edit.description.as_deref()))
    .bind(&grant)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("Map with id={map_id} not found")))?;

    if edit.cascade_grant {
        sqlx::query(r#"UPDATE band SET "grant" = $2 WHERE map_id = $1"#)
            .bind(map_id)
            .bind(&grant)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE layer
            SET "grant" = $2
            FROM band
            WHERE layer.band_id = band.id AND band.map_id = $1
            "#,
        )
        .bind(map_id)
        .bind(&grant)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(map)
}

pub async fn update_band(db: &PgPool, band_id: i32, edit: &BandEdit) -> ServiceResult<BandSummary> {
    let name = required_name(&edit.name, "name")?;
    let grant = normalize_optional(edit.grant.as_deref());

    let mut tx = db.begin().await?;
    let band: BandRow = sqlx::query_as(
        r#"
        UPDATE band
        SET name = $2, description = $3, "grant" = $4
        WHERE id = $1
        RETURNING id, band_id, map_id, name, description, "grant"
        "#,
    )
    .bind(band_id)
    .bind(name)
    .bind(normalize_optional(edit.description.as_deref()))
    .bind(&grant)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("Band with id={band_id} not found")))?;

    if edit.cascade_grant {
        sqlx::query(r#"UPDATE layer SET "grant" = $2 WHERE band_id = $1"#)
            .bind(band_id)
            .bind(&grant)
            .execute(&mut *tx)
            .await?;
    }
    let layers: Vec<LayerRow> = sqlx::query_as(&format!(
        "SELECT {LAYER_COLUMNS} FROM layer WHERE band_id = $1 ORDER BY id"
    ))
    .bind(band_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(band.into_summary(layers.into_iter().map(LayerSummary::from).collect()))
}

async fn delete_by_id(db: &PgPool, table: &'static str, label: &str, id: i32) -> ServiceResult<()> {
    let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
        .bind(id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound(format!("{label} with id={id} not found")));
    }
    Ok(())
}

/// Deletes the group; its maps, bands and layers go with it through the foreign keys.
pub async fn delete_map_group(db: &PgPool, map_group_id: i32) -> ServiceResult<()> {
    delete_by_id(db, "map_group", "Map group", map_group_id).await
}

pub async fn delete_map(db: &PgPool, map_id: i32) -> ServiceResult<()> {
    delete_by_id(db, "map", "Map", map_id).await
}

pub async fn delete_band(db: &PgPool, band_id: i32) -> ServiceResult<()> {
    delete_by_id(db, "band", "Band", band_id).await
}

pub async fn delete_layer(db: &PgPool, layer_id: i32) -> ServiceResult<()> {
    delete_by_id(db, "layer", "Layer", layer_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fits::{LayerProvider, PROVIDER_SCHEMA_VERSION};

    fn layer_row(provider: JsonValue) -> LayerRow {
        LayerRow {
            id: 7,
            layer_id: "layer-0-a".to_string(),
            band_id: 3,
            name: "Intensity".to_string(),
            description: None,
            grant: Some("maps:act".to_string()),
            quantity: Some("T".to_string()),
            units: Some("uK".to_string()),
            vmin: None,
            vmax: Some(500.0),
            cmap: "plasma".to_string(),
            provider: SqlJson(provider),
            bounding_left: 10.0,
            bounding_right: -10.0,
            bounding_top: 5.0,
            bounding_bottom: -5.0,
            number_of_levels: 4,
            tile_size: 256,
        }
    }

    #[test]
    fn layer_rows_map_columns_onto_summary() {
        let summary = LayerSummary::from(layer_row(serde_json::json!({
            "schema_version": PROVIDER_SCHEMA_VERSION,
            "provider_type": "fits",
            "filename": "/data/maps/survey.fits",
            "hdu": 0
        })));
        assert_eq!(summary.vmin, DisplayBound::Auto);
        assert_eq!(summary.vmax, DisplayBound::Value(500.0));
        assert_eq!(summary.bounding_box.left, 10.0);
        assert_eq!(summary.bounding_box.bottom, -5.0);
        assert_eq!(
            summary.provider.map(|p| p.provider),
            Some(LayerProvider::Fits {
                filename: "/data/maps/survey.fits".to_string(),
                hdu: 0,
                index: None,
            })
        );
    }

    #[test]
    fn undecodable_providers_are_dropped_not_fatal() {
        let summary = LayerSummary::from(layer_row(serde_json::json!({ "type": "legacy" })));
        assert!(summary.provider.is_none());
        assert_eq!(summary.layer_id, "layer-0-a");
    }

    #[test]
    fn edits_default_to_cascading_grants() -> anyhow::Result<()> {
        let edit: MapEdit = serde_json::from_value(serde_json::json!({
            "name": "ACT DR6",
            "grant": "maps:act"
        }))?;
        assert!(edit.cascade_grant);
        assert!(edit.description.is_none());

        let edit: BandEdit = serde_json::from_value(serde_json::json!({
            "name": "f090",
            "cascade_grant": false
        }))?;
        assert!(!edit.cascade_grant);
        Ok(())
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(matches!(
            required_name("   ", "name"),
            Err(Rejection::MissingField("name"))
        ));
        assert_eq!(required_name(" ACT ", "name").unwrap(), "ACT");
    }
}
