//! Turns submitted forms plus freshly extracted file metadata into persisted
//! map/band/layer rows.
//!
//! Client-supplied geometry is never trusted: the data file is re-read on every
//! submission and the form only contributes display choices. All validation
//! happens before the first write, and every write of one submission shares a
//! single transaction.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::services::existing::{
    BandRow, BandSummary, LayerRow, LayerSummary, MapGroupSummary, MapSummary, LAYER_COLUMNS,
};
use crate::services::filesystem::{safe_evaluate, Sandbox};
use crate::services::fits::{BoundingBox, LayerDescriptor, LayerReader, ProviderRecord};
use crate::services::{run_blocking, Rejection, ServiceError, ServiceResult};

pub const DEFAULT_CMAP: &str = "viridis";

/// A colour-scale limit: a fixed number, or "auto" to let the tile server decide.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DisplayBound {
    #[default]
    Auto,
    Value(f64),
}

impl DisplayBound {
    pub fn to_column(self) -> Option<f64> {
        match self {
            DisplayBound::Auto => None,
            DisplayBound::Value(value) => Some(value),
        }
    }

    pub fn from_column(value: Option<f64>) -> Self {
        value.map_or(DisplayBound::Auto, DisplayBound::Value)
    }
}

impl Serialize for DisplayBound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DisplayBound::Auto => serializer.serialize_str("auto"),
            DisplayBound::Value(value) => serializer.serialize_f64(*value),
        }
    }
}

impl<'de> Deserialize<'de> for DisplayBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(DisplayBound::Value(value)),
            Raw::Text(text) => {
                let text = text.trim();
                if text.is_empty() || text.eq_ignore_ascii_case("auto") {
                    return Ok(DisplayBound::Auto);
                }
                match text.parse::<f64>() {
                    Ok(value) if value.is_finite() => Ok(DisplayBound::Value(value)),
                    _ => Err(serde::de::Error::custom(format!(
                        "expected a number or \"auto\", got {text:?}"
                    ))),
                }
            }
        }
    }
}

fn default_cmap() -> String {
    DEFAULT_CMAP.to_string()
}

/// Display choices for one layer of the file, as submitted.
#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct LayerChoice {
    pub layer_id: String,
    pub included: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    #[schema(value_type = String, example = "auto")]
    pub vmin: DisplayBound,
    #[serde(default)]
    #[schema(value_type = String, example = "auto")]
    pub vmax: DisplayBound,
    #[serde(default = "default_cmap")]
    pub cmap: String,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct BandForm {
    pub band_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required_grant: Option<String>,
    #[serde(default)]
    pub layers: Vec<LayerChoice>,
    /// Data file, relative to the map directory.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct MapForm {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub map_group_id: i32,
    #[serde(default)]
    pub required_grant: Option<String>,
    pub form_data: BandForm,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct ExistingMapForm {
    pub map_id: String,
    pub form_data: BandForm,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct MapGroupForm {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub grant: Option<String>,
}

/// The map a submission wrote to, and the band holding the written layers.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct CreatedMap {
    pub map: MapSummary,
    pub band: BandSummary,
}

/// One included layer: form overrides joined with extracted geometry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedLayer {
    pub(crate) layer_id: String,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) quantity: Option<String>,
    pub(crate) units: Option<String>,
    pub(crate) vmin: DisplayBound,
    pub(crate) vmax: DisplayBound,
    pub(crate) cmap: String,
    pub(crate) bounding_box: BoundingBox,
    pub(crate) number_of_levels: i32,
    pub(crate) tile_size: i32,
    pub(crate) provider: ProviderRecord,
}

/// Trims free text; blank input becomes `None`.
pub(crate) fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn required(value: &str, field: &'static str) -> Result<String, Rejection> {
    normalize_optional(Some(value)).ok_or(Rejection::MissingField(field))
}

/// Map identifiers are band identifiers without their two-character band prefix.
pub fn derive_map_id(band_id: &str) -> Result<String, Rejection> {
    let map_id: String = band_id.trim().chars().skip(2).collect();
    if map_id.is_empty() {
        return Err(Rejection::Invalid(format!(
            "Band id {band_id:?} is too short to derive a map id"
        )));
    }
    Ok(map_id)
}

pub(crate) fn validate_band_form(form: &BandForm, colormaps: &[String]) -> Result<(), Rejection> {
    required(&form.band_id, "band_id")?;
    required(&form.name, "name")?;
    required(&form.path, "path")?;

    let mut seen = HashSet::new();
    let mut included = 0usize;
    for layer in form.layers.iter().filter(|layer| layer.included) {
        included += 1;
        let layer_id = required(&layer.layer_id, "layer_id")?;
        if !seen.insert(layer_id.clone()) {
            return Err(Rejection::Invalid(format!(
                "Layer {layer_id} is listed more than once"
            )));
        }
        if !colormaps.iter().any(|cmap| cmap == &layer.cmap) {
            return Err(Rejection::Invalid(format!(
                "Colormap {} is not one of the allowed colormaps",
                layer.cmap
            )));
        }
        if let (DisplayBound::Value(vmin), DisplayBound::Value(vmax)) = (layer.vmin, layer.vmax) {
            if vmin >= vmax {
                return Err(Rejection::Invalid(format!(
                    "Layer {layer_id}: vmin ({vmin}) must be below vmax ({vmax})"
                )));
            }
        }
    }
    if included == 0 {
        return Err(Rejection::Invalid(
            "At least one layer must be included".to_string(),
        ));
    }
    Ok(())
}

/// Joins included form entries with the extracted layers, keeping form order.
/// Fails naming every included id the file does not contain.
pub(crate) fn plan_layers(
    choices: &[LayerChoice],
    extracted: Vec<LayerDescriptor>,
    path: &Path,
) -> ServiceResult<Vec<PlannedLayer>> {
    let mut by_id: HashMap<String, LayerDescriptor> = extracted
        .into_iter()
        .map(|layer| (layer.layer_id.clone(), layer))
        .collect();

    let mut planned = Vec::new();
    let mut missing = Vec::new();
    for choice in choices.iter().filter(|choice| choice.included) {
        let layer_id = choice.layer_id.trim();
        let Some(found) = by_id.remove(layer_id) else {
            missing.push(layer_id.to_string());
            continue;
        };
        planned.push(PlannedLayer {
            layer_id: found.layer_id,
            name: normalize_optional(choice.name.as_deref()).unwrap_or(found.name),
            description: normalize_optional(choice.description.as_deref()).or(found.description),
            quantity: normalize_optional(choice.quantity.as_deref()).or(found.quantity),
            units: normalize_optional(choice.units.as_deref()).or(found.units),
            vmin: choice.vmin,
            vmax: choice.vmax,
            cmap: choice.cmap.clone(),
            bounding_box: found.bounding_box,
            number_of_levels: found.number_of_levels,
            tile_size: found.tile_size,
            provider: found.provider,
        });
    }

    if !missing.is_empty() {
        return Err(ServiceError::LayersNotFound {
            path: path.to_path_buf(),
            missing,
        });
    }
    Ok(planned)
}

async fn extract_layers(
    sandbox: &Sandbox,
    reader: &Arc<dyn LayerReader>,
    path: &Path,
) -> ServiceResult<Vec<LayerDescriptor>> {
    let sandbox = sandbox.clone();
    let reader = Arc::clone(reader);
    let path = path.to_path_buf();
    run_blocking(move || safe_evaluate(&sandbox, reader.as_ref(), &path)).await
}

async fn insert_layers(
    tx: &mut Transaction<'_, Postgres>,
    band_pk: i32,
    grant: Option<&str>,
    layers: &[PlannedLayer],
) -> ServiceResult<Vec<LayerSummary>> {
    let query = format!(
        r#"
        INSERT INTO layer (
            layer_id, name, description, "grant", quantity, units, vmin, vmax, cmap, provider,
            bounding_left, bounding_right, bounding_top, bounding_bottom,
            number_of_levels, tile_size, band_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (band_id, layer_id) DO UPDATE SET
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            "grant" = EXCLUDED."grant",
            quantity = EXCLUDED.quantity,
            units = EXCLUDED.units,
            vmin = EXCLUDED.vmin,
            vmax = EXCLUDED.vmax,
            cmap = EXCLUDED.cmap,
            provider = EXCLUDED.provider,
            bounding_left = EXCLUDED.bounding_left,
            bounding_right = EXCLUDED.bounding_right,
            bounding_top = EXCLUDED.bounding_top,
            bounding_bottom = EXCLUDED.bounding_bottom,
            number_of_levels = EXCLUDED.number_of_levels,
            tile_size = EXCLUDED.tile_size
        RETURNING {LAYER_COLUMNS}
        "#
    );

    let mut written = Vec::with_capacity(layers.len());
    for layer in layers {
        let provider = layer
            .provider
            .to_json()
            .map_err(|err| ServiceError::Internal(format!("failed to encode provider: {err}")))?;
        let row: LayerRow = sqlx::query_as(&query)
            .bind(&layer.layer_id)
            .bind(&layer.name)
            .bind(&layer.description)
            .bind(grant)
            .bind(&layer.quantity)
            .bind(&layer.units)
            .bind(layer.vmin.to_column())
            .bind(layer.vmax.to_column())
            .bind(&layer.cmap)
            .bind(SqlJson(provider))
            .bind(layer.bounding_box.left)
            .bind(layer.bounding_box.right)
            .bind(layer.bounding_box.top)
            .bind(layer.bounding_box.bottom)
            .bind(layer.number_of_levels)
            .bind(layer.tile_size)
            .bind(band_pk)
            .fetch_one(&mut **tx)
            .await?;
        written.push(LayerSummary::from(row));
    }
    Ok(written)
}

async fn insert_band(
    tx: &mut Transaction<'_, Postgres>,
    map_pk: i32,
    form: &BandForm,
) -> ServiceResult<BandRow> {
    let band = sqlx::query_as(
        r#"
        INSERT INTO band (band_id, name, description, "grant", map_id)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, band_id, map_id, name, description, "grant"
        "#,
    )
    .bind(form.band_id.trim())
    .bind(form.name.trim())
    .bind(normalize_optional(form.description.as_deref()))
    .bind(normalize_optional(form.required_grant.as_deref()))
    .bind(map_pk)
    .fetch_one(&mut **tx)
    .await?;
    Ok(band)
}

pub async fn create_map_group(db: &PgPool, form: &MapGroupForm) -> ServiceResult<MapGroupSummary> {
    let name = required(&form.name, "name")?;
    let group: MapGroupSummary = sqlx::query_as(
        r#"
        INSERT INTO map_group (name, description, "grant")
        VALUES ($1, $2, $3)
        RETURNING id, name, description, "grant"
        "#,
    )
    .bind(name)
    .bind(normalize_optional(form.description.as_deref()))
    .bind(normalize_optional(form.grant.as_deref()))
    .fetch_one(db)
    .await?;
    tracing::info!(map_group = group.id, name = %group.name, "created map group");
    Ok(group)
}

/// Registers a new map with one band whose layers come from `form.form_data.path`.
pub async fn create_map(
    db: &PgPool,
    sandbox: &Sandbox,
    reader: &Arc<dyn LayerReader>,
    colormaps: &[String],
    form: &MapForm,
) -> ServiceResult<CreatedMap> {
    let name = required(&form.name, "name")?;
    validate_band_form(&form.form_data, colormaps)?;
    let map_id = derive_map_id(&form.form_data.band_id)?;

    let path = PathBuf::from(form.form_data.path.trim());
    let extracted = extract_layers(sandbox, reader, &path).await?;
    let planned = plan_layers(&form.form_data.layers, extracted, &path)?;

    let mut tx = db.begin().await?;
    let group_exists: Option<i32> = sqlx::query_scalar("SELECT id FROM map_group WHERE id = $1")
        .bind(form.map_group_id)
        .fetch_optional(&mut *tx)
        .await?;
    if group_exists.is_none() {
        return Err(ServiceError::NotFound(format!(
            "Map group with id={} not found",
            form.map_group_id
        )));
    }

    let map: MapSummary = sqlx::query_as(
        r#"
        INSERT INTO map (map_id, name, description, "grant", map_group_id)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, map_id, map_group_id, name, description, "grant"
        "#,
    )
    .bind(&map_id)
    .bind(name)
    .bind(normalize_optional(form.description.as_deref()))
    .bind(normalize_optional(form.required_grant.as_deref()))
    .bind(form.map_group_id)
    .fetch_one(&mut *tx)
    .await?;

    let band = insert_band(&mut tx, map.id, &form.form_data).await?;
    let layers = insert_layers(&mut tx, band.id, band.grant.as_deref(), &planned).await?;
    tx.commit().await?;

    tracing::info!(
        map = map.id,
        map_id = %map.map_id,
        band = band.id,
        layers = layers.len(),
        path = %path.display(),
        "created map"
    );
    Ok(CreatedMap {
        map,
        band: band.into_summary(layers),
    })
}

/// Adds layers to an existing map. The band is matched by name within the map
/// and created when absent; layers inherit the band's grant.
pub async fn append_to_existing_map(
    db: &PgPool,
    sandbox: &Sandbox,
    reader: &Arc<dyn LayerReader>,
    colormaps: &[String],
    form: &ExistingMapForm,
) -> ServiceResult<CreatedMap> {
    let map_id = required(&form.map_id, "map_id")?;
    validate_band_form(&form.form_data, colormaps)?;

    let path = PathBuf::from(form.form_data.path.trim());
    let extracted = extract_layers(sandbox, reader, &path).await?;
    let planned = plan_layers(&form.form_data.layers, extracted, &path)?;

    let mut tx = db.begin().await?;
    let map: MapSummary = sqlx::query_as(
        r#"
        SELECT id, map_id, map_group_id, name, description, "grant"
        FROM map
        WHERE map_id = $1
        "#,
    )
    .bind(&map_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("Map with ID {map_id} does not exist")))?;

    let existing: Option<BandRow> = sqlx::query_as(
        r#"
        SELECT id, band_id, map_id, name, description, "grant"
        FROM band
        WHERE map_id = $1 AND name = $2
        "#,
    )
    .bind(map.id)
    .bind(form.form_data.name.trim())
    .fetch_optional(&mut *tx)
    .await?;
    let band = match existing {
        Some(band) => band,
        None => insert_band(&mut tx, map.id, &form.form_data).await?,
    };

    let layers = insert_layers(&mut tx, band.id, band.grant.as_deref(), &planned).await?;
    tx.commit().await?;

    tracing::info!(
        map = map.id,
        map_id = %map.map_id,
        band = band.id,
        layers = layers.len(),
        path = %path.display(),
        "appended layers to existing map"
    );
    Ok(CreatedMap {
        map,
        band: band.into_summary(layers),
    })
}
