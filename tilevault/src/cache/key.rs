//! Tile keys and their backend addresses.
//!
//! A [`TileKey`] names one cached artifact: a layer, a tile coordinate, and a
//! format extension. Backends derive their storage address from it:
//!
//! - Filesystem caches use [`TileKey::relative_path`] with a [`DirLayout`]
//! - Key-value and object stores use [`TileKey::object_key`]
//!
//! # Layouts
//!
//! For the example tile `roads` 12/656/1582.png:
//!
//! | Layout     | Path                               |
//! |------------|------------------------------------|
//! | `safe`     | `roads/12/000/656/001/582.png`     |
//! | `portable` | `roads/12/656/1582.png`            |
//! | `quadtile` | `roads/002/301/021/222/0.png`      |
//!
//! Every layout is injective over valid keys: layer names cannot contain
//! path separators or whitespace and each coordinate component is rendered
//! in full. Whitespace would also split memcache keys.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::cache::traits::CacheError;
use crate::coord::TileCoord;

/// Directory layout policy for filesystem caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirLayout {
    /// Bushy directories: column and row are zero-padded to six digits and
    /// split after the third, bounding the number of entries per directory.
    #[default]
    Safe,
    /// Mirrors the zoom/column/row hierarchy directly.
    Portable,
    /// Interleaved quadkey digits, three per directory level.
    Quadtile,
}

impl FromStr for DirLayout {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(DirLayout::Safe),
            "portable" => Ok(DirLayout::Portable),
            "quadtile" => Ok(DirLayout::Quadtile),
            other => Err(CacheError::config(format!(
                "Please provide a valid \"dirs\" parameter to the disk cache, \
                 either \"safe\", \"portable\" or \"quadtile\" but not \"{}\"",
                other
            ))),
        }
    }
}

/// Identifies one cached artifact.
///
/// Immutable once built. The format extension is normalised to lowercase so
/// `PNG` and `png` address the same artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    layer: String,
    coord: TileCoord,
    format: String,
}

impl TileKey {
    /// Create a validated tile key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] if the layer name is empty, is `.`
    /// or `..`, or contains a path separator, whitespace or a control
    /// character, or if the format is empty or not alphanumeric.
    pub fn new(
        layer: impl Into<String>,
        coord: TileCoord,
        format: impl AsRef<str>,
    ) -> Result<Self, CacheError> {
        let layer = layer.into();
        validate_layer(&layer)?;

        let format = format.as_ref();
        if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CacheError::InvalidKey(format!(
                "format must be a non-empty alphanumeric extension, not {:?}",
                format
            )));
        }

        Ok(Self {
            layer,
            coord,
            format: format.to_ascii_lowercase(),
        })
    }

    /// Layer name.
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Tile coordinate.
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    /// Lowercase format extension.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Path of this tile relative to a cache root.
    ///
    /// `suffix` is appended after the extension (e.g. `Some("gz")` gives
    /// `582.png.gz`).
    pub fn relative_path(&self, layout: DirLayout, suffix: Option<&str>) -> PathBuf {
        let ext = match suffix {
            Some(s) => format!("{}.{}", self.format, s),
            None => self.format.clone(),
        };

        let z = self.coord.zoom.to_string();
        let mut path = PathBuf::from(&self.layer);

        match layout {
            DirLayout::Safe => {
                let x = format!("{:06}", self.coord.column);
                let y = format!("{:06}", self.coord.row);
                let (x1, x2) = x.split_at(3);
                let (y1, y2) = y.split_at(3);

                path.push(z);
                path.push(x1);
                path.push(x2);
                path.push(y1);
                path.push(format!("{}.{}", y2, ext));
            }
            DirLayout::Portable => {
                path.push(z);
                path.push(self.coord.column.to_string());
                path.push(format!("{}.{}", self.coord.row, ext));
            }
            DirLayout::Quadtile => {
                let quadkey = self.coord.quadkey();
                let digits = quadkey.as_bytes();
                let parts: Vec<&str> = digits
                    .chunks(3)
                    // quadkey is ASCII digits only
                    .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
                    .collect();

                if let Some((last, dirs)) = parts.split_last() {
                    for dir in dirs {
                        path.push(dir);
                    }
                    path.push(format!("{}.{}", last, ext));
                }
            }
        }

        path
    }

    /// Key for key-value and object stores: `{prefix}/{layer}/{z}/{x}/{y}.{ext}`.
    ///
    /// Leading and trailing slashes on `prefix` are ignored, and an empty
    /// prefix omits the segment entirely.
    pub fn object_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            self.to_string()
        } else {
            format!("{}/{}", prefix, self)
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.layer, self.coord, self.format)
    }
}

fn validate_layer(layer: &str) -> Result<(), CacheError> {
    if layer.is_empty() || layer == "." || layer == ".." {
        return Err(CacheError::InvalidKey(format!(
            "layer name {:?} is not allowed",
            layer
        )));
    }

    if layer
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control() || c.is_whitespace())
    {
        return Err(CacheError::InvalidKey(format!(
            "layer name {:?} contains a path separator, whitespace or control character",
            layer
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;

    fn key(layer: &str, z: u8, x: u32, y: u32, ext: &str) -> TileKey {
        TileKey::new(layer, TileCoord::new(z, x, y).unwrap(), ext).unwrap()
    }

    #[test]
    fn test_safe_layout() {
        let k = key("roads", 12, 656, 1582, "png");
        assert_eq!(
            k.relative_path(DirLayout::Safe, None),
            Path::new("roads/12/000/656/001/582.png")
        );
    }

    #[test]
    fn test_safe_layout_seven_digit_columns() {
        let k = key("roads", 21, 1_048_575, 2_000_000, "png");
        assert_eq!(
            k.relative_path(DirLayout::Safe, None),
            Path::new("roads/21/104/8575/200/0000.png")
        );
    }

    #[test]
    fn test_portable_layout() {
        let k = key("roads", 12, 656, 1582, "png");
        assert_eq!(
            k.relative_path(DirLayout::Portable, None),
            Path::new("roads/12/656/1582.png")
        );
    }

    #[test]
    fn test_quadtile_layout() {
        let k = key("roads", 12, 656, 1582, "png");
        assert_eq!(k.coord().quadkey(), "0023010212220");
        assert_eq!(
            k.relative_path(DirLayout::Quadtile, None),
            Path::new("roads/002/301/021/222/0.png")
        );
    }

    #[test]
    fn test_quadtile_zoom_zero() {
        let k = key("roads", 0, 0, 0, "png");
        assert_eq!(
            k.relative_path(DirLayout::Quadtile, None),
            Path::new("roads/0.png")
        );
    }

    #[test]
    fn test_suffix_is_appended() {
        let k = key("points", 1, 0, 1, "json");
        assert_eq!(
            k.relative_path(DirLayout::Portable, Some("gz")),
            Path::new("points/1/0/1.json.gz")
        );
    }

    #[test]
    fn test_object_key() {
        let k = key("roads", 12, 656, 1582, "png");
        assert_eq!(k.object_key(""), "roads/12/656/1582.png");
        assert_eq!(k.object_key("/cache/"), "cache/roads/12/656/1582.png");
        assert_eq!(k.object_key("prefix/4"), "prefix/4/roads/12/656/1582.png");
    }

    #[test]
    fn test_format_is_lowercased() {
        let upper = key("roads", 3, 1, 2, "PNG");
        let lower = key("roads", 3, 1, 2, "png");
        assert_eq!(upper, lower);
        assert_eq!(upper.format(), "png");
    }

    #[test]
    fn test_invalid_layers() {
        let coord = TileCoord::new(0, 0, 0).unwrap();
        for layer in ["", ".", "..", "a/b", "a\\b", "tab\there", "my roads", " roads", "roads\u{a0}"] {
            assert!(
                matches!(TileKey::new(layer, coord, "png"), Err(CacheError::InvalidKey(_))),
                "layer {:?} should be rejected",
                layer
            );
        }
    }

    #[test]
    fn test_invalid_formats() {
        let coord = TileCoord::new(0, 0, 0).unwrap();
        for format in ["", "p.g", "../x", "png "] {
            assert!(
                matches!(TileKey::new("roads", coord, format), Err(CacheError::InvalidKey(_))),
                "format {:?} should be rejected",
                format
            );
        }
    }

    #[test]
    fn test_dir_layout_from_str() {
        assert_eq!("SAFE".parse::<DirLayout>().unwrap(), DirLayout::Safe);
        assert_eq!("portable".parse::<DirLayout>().unwrap(), DirLayout::Portable);
        assert_eq!("Quadtile".parse::<DirLayout>().unwrap(), DirLayout::Quadtile);
        assert!(matches!(
            "bushy".parse::<DirLayout>(),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn test_layouts_distinct_across_zoom_grid() {
        for layout in [DirLayout::Safe, DirLayout::Portable, DirLayout::Quadtile] {
            let mut seen = HashSet::new();
            for z in 0..=4u8 {
                let n = 1u32 << z;
                for x in 0..n {
                    for y in 0..n {
                        let path = key("roads", z, x, y, "png").relative_path(layout, None);
                        assert!(seen.insert(path.clone()), "{:?} collided at {:?}", layout, path);
                    }
                }
            }
        }
    }
}
