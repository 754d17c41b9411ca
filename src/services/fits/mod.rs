//! Data-file reader boundary.
//!
//! [`LayerReader`] turns a data file into the ordered layer descriptors the
//! admin tool registers. [`FitsLayerReader`] is the built-in implementation;
//! it walks the HDUs with `fitsio` and reads header keywords, touching pixel
//! data only to confirm each image's data unit is present.

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::FitsFile;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PROVIDER_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cfitsio error: {0}")]
    Fits(#[from] fitsio::errors::Error),
    #[error("invalid FITS data: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BoundingBox {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

/// How the downstream tile server locates pixel data for a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "provider_type", rename_all = "snake_case")]
pub enum LayerProvider {
    Fits {
        filename: String,
        hdu: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },
}

/// Provider as persisted in the `layer.provider` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProviderRecord {
    pub schema_version: i32,
    #[serde(flatten)]
    pub provider: LayerProvider,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderDecodeError {
    #[error("unsupported provider schema version {0}")]
    UnsupportedVersion(i32),
    #[error("malformed provider: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProviderRecord {
    pub fn new(provider: LayerProvider) -> Self {
        Self {
            schema_version: PROVIDER_SCHEMA_VERSION,
            provider,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, ProviderDecodeError> {
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32;
        if version != PROVIDER_SCHEMA_VERSION {
            return Err(ProviderDecodeError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LayerDescriptor {
    pub layer_id: String,
    pub name: String,
    pub description: Option<String>,
    pub quantity: Option<String>,
    pub units: Option<String>,
    pub bounding_box: BoundingBox,
    pub number_of_levels: i32,
    pub tile_size: i32,
    pub provider: ProviderRecord,
}

pub trait LayerReader: Send + Sync {
    fn read_layers(&self, path: &Path) -> Result<Vec<LayerDescriptor>, ReadError>;
}

/// Upper bound on planes per HDU; anything larger is treated as a corrupt header.
const MAX_PLANES: usize = 4096;

#[derive(Debug, Clone)]
pub struct FitsLayerReader {
    tile_size: u32,
}

/// Image layout of one HDU, from `ImageInfo.shape` (slowest axis first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageGeometry {
    naxis: usize,
    nx: usize,
    ny: usize,
    planes: usize,
}

impl ImageGeometry {
    /// `None` for HDUs with fewer than two non-empty axes.
    fn from_shape(shape: &[usize]) -> Result<Option<Self>, ReadError> {
        let naxis = shape.len();
        if naxis < 2 {
            return Ok(None);
        }
        let nx = shape[naxis - 1];
        let ny = shape[naxis - 2];
        if nx == 0 || ny == 0 {
            return Ok(None);
        }
        let planes = shape[..naxis - 2]
            .iter()
            .try_fold(1usize, |acc, len| acc.checked_mul((*len).max(1)))
            .ok_or_else(|| ReadError::Format("image dimensions overflow".to_string()))?;
        if planes > MAX_PLANES {
            return Err(ReadError::Format(format!(
                "{planes} image planes exceeds the limit of {MAX_PLANES}"
            )));
        }
        Ok(Some(Self {
            naxis,
            nx,
            ny,
            planes,
        }))
    }

    fn pixel_count(&self) -> Option<usize> {
        self.nx
            .checked_mul(self.ny)
            .and_then(|plane| plane.checked_mul(self.planes))
    }
}

/// Keyword access for one HDU.
struct HduKeys<'a> {
    hdu: &'a FitsHdu,
    fptr: &'a mut FitsFile,
}

impl HduKeys<'_> {
    fn read_key_optional<T: fitsio::headers::ReadsKey>(&mut self, key: &str) -> Option<T> {
        self.hdu.read_key(self.fptr, key).ok()
    }

    fn text(&mut self, key: &str) -> Option<String> {
        self.read_key_optional::<String>(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn real(&mut self, key: &str) -> Option<f64> {
        self.read_key_optional::<f64>(key)
    }
}

impl FitsLayerReader {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size.max(1),
        }
    }

    fn layers_for_hdu(
        &self,
        path: &Path,
        stem: &str,
        hdu: u32,
        geometry: ImageGeometry,
        keys: &mut HduKeys<'_>,
    ) -> Vec<LayerDescriptor> {
        let base_name = keys.text("EXTNAME").unwrap_or_else(|| {
            if hdu == 0 {
                "Primary".to_string()
            } else {
                format!("HDU {hdu}")
            }
        });
        let description = keys.text("OBJECT");
        let quantity = keys.text("BTYPE");
        let units = keys.text("BUNIT");

        let (left, right) = axis_bounds(keys, 1, geometry.nx);
        let (bottom, top) = axis_bounds(keys, 2, geometry.ny);
        let bounding_box = BoundingBox {
            left,
            right,
            top,
            bottom,
        };
        let number_of_levels = levels_for(geometry.nx.max(geometry.ny) as u64, self.tile_size);
        let labels = stokes_labels(keys, geometry);

        (0..geometry.planes)
            .map(|plane| {
                let name = if geometry.planes > 1 {
                    let label = labels
                        .as_ref()
                        .and_then(|labels| labels.get(plane).cloned().flatten())
                        .unwrap_or_else(|| format!("plane {plane}"));
                    format!("{base_name} ({label})")
                } else {
                    base_name.clone()
                };
                LayerDescriptor {
                    layer_id: format!("{stem}-{hdu}-{plane}"),
                    name,
                    description: description.clone(),
                    quantity: quantity.clone(),
                    units: units.clone(),
                    bounding_box,
                    number_of_levels,
                    tile_size: self.tile_size as i32,
                    provider: ProviderRecord::new(LayerProvider::Fits {
                        filename: path.display().to_string(),
                        hdu,
                        index: (geometry.planes > 1).then_some(plane as u32),
                    }),
                }
            })
            .collect()
    }
}

/// Reads the final pixel so a header promising more data than the file holds fails here.
fn ensure_data_present(
    hdu: &FitsHdu,
    fptr: &mut FitsFile,
    geometry: ImageGeometry,
) -> Result<(), ReadError> {
    let total = geometry
        .pixel_count()
        .ok_or_else(|| ReadError::Format("image dimensions overflow".to_string()))?;
    hdu.read_section::<Vec<f64>>(fptr, total - 1, total)
        .map_err(|_| ReadError::Format("truncated data unit".to_string()))?;
    Ok(())
}

impl LayerReader for FitsLayerReader {
    fn read_layers(&self, path: &Path) -> Result<Vec<LayerDescriptor>, ReadError> {
        std::fs::metadata(path)?;
        let mut fptr = FitsFile::open(path)?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("layer")
            .to_string();

        let mut layers = Vec::new();
        for index in 0..fptr.num_hdus()? {
            let hdu = fptr.hdu(index)?;
            let HduInfo::ImageInfo { shape, .. } = &hdu.info else {
                continue;
            };
            let Some(geometry) = ImageGeometry::from_shape(shape)? else {
                continue;
            };
            ensure_data_present(&hdu, &mut fptr, geometry)?;
            let hdu_number = u32::try_from(index)
                .map_err(|_| ReadError::Format("too many HDUs".to_string()))?;
            let mut keys = HduKeys {
                hdu: &hdu,
                fptr: &mut fptr,
            };
            layers.extend(self.layers_for_hdu(path, &stem, hdu_number, geometry, &mut keys));
        }
        Ok(layers)
    }
}

/// World coordinates of the outer pixel edges along `axis`, from a linear WCS.
/// Falls back to pixel coordinates when the axis carries no WCS.
fn axis_bounds(keys: &mut HduKeys<'_>, axis: u32, len: usize) -> (f64, f64) {
    let Some(crval) = keys.real(&format!("CRVAL{axis}")) else {
        return (0.0, len as f64);
    };
    let crpix = keys.real(&format!("CRPIX{axis}")).unwrap_or(1.0);
    let cdelt = keys
        .real(&format!("CDELT{axis}"))
        .or_else(|| keys.real(&format!("CD{axis}_{axis}")))
        .unwrap_or(1.0);
    let world = |pixel: f64| crval + (pixel - crpix) * cdelt;
    (world(0.5), world(len as f64 + 0.5))
}

/// Stokes parameter names per plane, when the third axis is a STOKES axis.
fn stokes_labels(keys: &mut HduKeys<'_>, geometry: ImageGeometry) -> Option<Vec<Option<String>>> {
    if geometry.naxis != 3 {
        return None;
    }
    let ctype = keys.text("CTYPE3")?;
    if !ctype.eq_ignore_ascii_case("STOKES") {
        return None;
    }
    let crval = keys.real("CRVAL3").unwrap_or(1.0);
    let crpix = keys.real("CRPIX3").unwrap_or(1.0);
    let cdelt = keys.real("CDELT3").unwrap_or(1.0);
    let labels = (0..geometry.planes)
        .map(|plane| {
            let code = (crval + ((plane + 1) as f64 - crpix) * cdelt).round() as i64;
            let label = match code {
                1 => "I",
                2 => "Q",
                3 => "U",
                4 => "V",
                _ => return None,
            };
            Some(label.to_string())
        })
        .collect();
    Some(labels)
}

/// Pyramid depth: one level per halving until a single tile covers `extent` pixels.
pub(crate) fn levels_for(extent: u64, tile_size: u32) -> i32 {
    let mut levels = 1;
    let mut covered = u64::from(tile_size.max(1));
    while covered < extent {
        covered = covered.saturating_mul(2);
        levels += 1;
    }
    levels
}


#[cfg(test)]
mod tests {
    use super::test_files::*;
    use super::*;

    #[test]
    fn levels_cover_the_largest_axis() {
        assert_eq!(levels_for(100, 256), 1);
        assert_eq!(levels_for(256, 256), 1);
        assert_eq!(levels_for(257, 256), 2);
        assert_eq!(levels_for(512, 256), 2);
        assert_eq!(levels_for(21_600, 256), 8);
    }

    #[test]
    fn reads_primary_image_geometry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("survey.fits");
        std::fs::write(&path, image_2d(512, 300))?;

        let layers = FitsLayerReader::new(256).read_layers(&path)?;
        assert_eq!(layers.len(), 1);
        let layer = &layers[0];
        assert_eq!(layer.layer_id, "survey-0-0");
        assert_eq!(layer.name, "Primary");
        assert_eq!(layer.quantity.as_deref(), Some("Intensity"));
        assert_eq!(layer.units.as_deref(), Some("uK"));
        assert_eq!(layer.number_of_levels, 2);
        assert_eq!(layer.tile_size, 256);
        assert!((layer.bounding_box.left - 308.0).abs() < 1e-9);
        assert!((layer.bounding_box.right - 52.0).abs() < 1e-9);
        assert!((layer.bounding_box.bottom + 75.0).abs() < 1e-9);
        assert!((layer.bounding_box.top - 75.0).abs() < 1e-9);
        assert_eq!(
            layer.provider.provider,
            LayerProvider::Fits {
                filename: path.display().to_string(),
                hdu: 0,
                index: None,
            }
        );
        Ok(())
    }

    #[test]
    fn splits_stokes_cube_into_planes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("pol.fits");
        let cards = vec![
            card("SIMPLE", "T"),
            card("BITPIX", "16"),
            card("NAXIS", "3"),
            card("NAXIS1", "64"),
            card("NAXIS2", "64"),
            card("NAXIS3", "3"),
            text_card("CTYPE3", "STOKES"),
            card("CRVAL3", "1.0"),
            card("CRPIX3", "1.0"),
            card("CDELT3", "1.0"),
        ];
        std::fs::write(&path, hdu(&cards, 64 * 64 * 3 * 2))?;

        let layers = FitsLayerReader::new(256).read_layers(&path)?;
        let ids: Vec<&str> = layers.iter().map(|l| l.layer_id.as_str()).collect();
        assert_eq!(ids, vec!["pol-0-0", "pol-0-1", "pol-0-2"]);
        let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Primary (I)", "Primary (Q)", "Primary (U)"]);
        assert_eq!(layers[0].bounding_box.right, 64.0);
        assert!(matches!(
            layers[2].provider.provider,
            LayerProvider::Fits { index: Some(2), .. }
        ));
        Ok(())
    }

    #[test]
    fn reads_image_extensions_after_empty_primary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("coadd.fits");
        let mut bytes = hdu(
            &[
                card("SIMPLE", "T"),
                card("BITPIX", "8"),
                card("NAXIS", "0"),
                card("EXTEND", "T"),
            ],
            0,
        );
        bytes.extend(hdu(
            &[
                text_card("XTENSION", "BINTABLE"),
                card("BITPIX", "8"),
                card("NAXIS", "2"),
                card("NAXIS1", "16"),
                card("NAXIS2", "200"),
                card("PCOUNT", "0"),
                card("GCOUNT", "1"),
                card("TFIELDS", "1"),
                text_card("TFORM1", "16A"),
            ],
            16 * 200,
        ));
        bytes.extend(hdu(
            &[
                text_card("XTENSION", "IMAGE"),
                card("BITPIX", "-64"),
                card("NAXIS", "2"),
                card("NAXIS1", "600"),
                card("NAXIS2", "600"),
                card("PCOUNT", "0"),
                card("GCOUNT", "1"),
                text_card("EXTNAME", "COADD"),
                text_card("OBJECT", "Deep field"),
            ],
            600 * 600 * 8,
        ));
        std::fs::write(&path, bytes)?;

        let layers = FitsLayerReader::new(256).read_layers(&path)?;
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].layer_id, "coadd-2-0");
        assert_eq!(layers[0].name, "COADD");
        assert_eq!(layers[0].description.as_deref(), Some("Deep field"));
        assert_eq!(layers[0].number_of_levels, 3);
        Ok(())
    }

    #[test]
    fn non_fits_files_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("notes.fits");
        std::fs::write(&path, "just some text")?;

        let err = FitsLayerReader::new(256).read_layers(&path).unwrap_err();
        assert!(matches!(err, ReadError::Fits(_) | ReadError::Format(_)));
        Ok(())
    }

    #[test]
    fn truncated_data_unit_is_a_format_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("partial.fits");
        let mut bytes = image_2d(512, 512);
        bytes.truncate(5760);
        std::fs::write(&path, bytes)?;

        let err = FitsLayerReader::new(256).read_layers(&path).unwrap_err();
        assert!(
            matches!(err, ReadError::Format(ref message) if message == "truncated data unit"),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[test]
    fn oversized_plane_count_fails_without_allocating() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("claims.fits");
        let cards = vec![
            card("SIMPLE", "T"),
            card("BITPIX", "8"),
            card("NAXIS", "3"),
            card("NAXIS1", "1"),
            card("NAXIS2", "1"),
            card("NAXIS3", "1000000000"),
        ];
        std::fs::write(&path, hdu(&cards, 0))?;

        assert!(FitsLayerReader::new(256).read_layers(&path).is_err());
        Ok(())
    }

    #[test]
    fn overflowing_plane_product_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("overflow.fits");
        let cards = vec![
            card("SIMPLE", "T"),
            card("BITPIX", "8"),
            card("NAXIS", "4"),
            card("NAXIS1", "1"),
            card("NAXIS2", "1"),
            card("NAXIS3", "4294967296"),
            card("NAXIS4", "4294967296"),
        ];
        std::fs::write(&path, hdu(&cards, 0))?;

        assert!(FitsLayerReader::new(256).read_layers(&path).is_err());
        Ok(())
    }

    #[test]
    fn geometry_rejects_overflow_and_plane_floods() {
        assert!(matches!(
            ImageGeometry::from_shape(&[usize::MAX, 2, 1, 1]),
            Err(ReadError::Format(_))
        ));
        assert!(matches!(
            ImageGeometry::from_shape(&[1_000_000_000, 1, 1]),
            Err(ReadError::Format(_))
        ));
        assert!(matches!(ImageGeometry::from_shape(&[64]), Ok(None)));
        let cube = ImageGeometry::from_shape(&[3, 300, 512]).ok().flatten();
        assert_eq!(
            cube,
            Some(ImageGeometry {
                naxis: 3,
                nx: 512,
                ny: 300,
                planes: 3,
            })
        );
    }

    #[test]
    fn missing_files_are_io_errors() {
        let err = FitsLayerReader::new(256)
            .read_layers(Path::new("/nonexistent/survey.fits"))
            .unwrap_err();
        assert!(matches!(err, ReadError::Io(_)));
    }

    #[test]
    fn provider_round_trips_with_version_check() -> anyhow::Result<()> {
        let record = ProviderRecord::new(LayerProvider::Fits {
            filename: "/data/maps/survey.fits".to_string(),
            hdu: 1,
            index: Some(0),
        });
        let json = record.to_json()?;
        assert_eq!(json["provider_type"], "fits");
        assert_eq!(json["schema_version"], PROVIDER_SCHEMA_VERSION);
        assert_eq!(ProviderRecord::from_json(json)?, record);

        let future = serde_json::json!({
            "schema_version": 99,
            "provider_type": "fits",
            "filename": "x.fits",
            "hdu": 0
        });
        assert!(matches!(
            ProviderRecord::from_json(future),
            Err(ProviderDecodeError::UnsupportedVersion(99))
        ));

        let unknown = serde_json::json!({
            "schema_version": PROVIDER_SCHEMA_VERSION,
            "provider_type": "hips",
        });
        assert!(matches!(
            ProviderRecord::from_json(unknown),
            Err(ProviderDecodeError::Malformed(_))
        ));
        Ok(())
    }
}
