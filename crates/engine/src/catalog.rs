use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::shape::Shape;

const BUILTIN_CATALOG: &str = include_str!("../data/catalog.json");

/// Display order of categories; anything else follows in first-seen order.
pub const CATEGORY_ORDER: [&str; 5] = ["Economy", "Warfare", "Housing", "Resource", "Trophy"];

const DEFAULT_SIDE: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse catalog json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parse catalog yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How a catalog entry describes the cells it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Footprint {
    Shape(Shape),
    Rect { w: u32, h: u32 },
}

impl Default for Footprint {
    fn default() -> Self {
        Self::Rect {
            w: DEFAULT_SIDE,
            h: DEFAULT_SIDE,
        }
    }
}

impl Footprint {
    /// Explicit, 1-indexed shape for this footprint. Empty shapes and zero-sized
    /// rectangles fall back to the 2x2 default.
    pub fn to_shape(&self) -> Shape {
        match self {
            Self::Shape(shape) if !shape.is_empty() => shape.normalized(),
            Self::Rect { w, h } if *w > 0 && *h > 0 => Shape::rect(*w, *h),
            _ => Shape::rect(DEFAULT_SIDE, DEFAULT_SIDE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cost {
    #[serde(default)]
    pub gold: u32,
    #[serde(default)]
    pub wheat: u32,
    #[serde(default)]
    pub wood: u32,
    #[serde(default)]
    pub stone: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Size {
    #[serde(default)]
    w: Option<u32>,
    #[serde(default)]
    h: Option<u32>,
}

/// A catalog entry as it appears in the data tables.
#[derive(Debug, Clone, Deserialize)]
struct RawDefinition {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    cost: Cost,
    #[serde(default)]
    size: Option<Size>,
    #[serde(default)]
    shape: Option<Shape>,
    #[serde(default)]
    max_placeable: Option<u32>,
}

impl RawDefinition {
    fn footprint(&self) -> Footprint {
        if let Some(shape) = &self.shape {
            return Footprint::Shape(shape.clone());
        }
        match self.size {
            Some(size) => Footprint::Rect {
                w: size.w.unwrap_or(DEFAULT_SIDE),
                h: size.h.unwrap_or(DEFAULT_SIDE),
            },
            None => Footprint::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    buildings: Vec<RawDefinition>,
    #[serde(default)]
    resource_tiles: Vec<RawDefinition>,
}

/// A placeable building or resource tile. The footprint is always held as an
/// explicit shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Definition {
    pub name: String,
    pub category: String,
    pub description: String,
    pub cost: Cost,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_placeable: Option<u32>,
    pub shape: Shape,
}

impl Definition {
    pub fn new(name: impl Into<String>, footprint: Footprint) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
            description: String::new(),
            cost: Cost::default(),
            max_placeable: None,
            shape: footprint.to_shape(),
        }
    }

    pub fn with_max_placeable(mut self, max: u32) -> Self {
        self.max_placeable = Some(max);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Stand-in for a layout entry whose name is not in the catalog.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new(name, Footprint::default()).with_category("Unknown")
    }

    fn from_raw(raw: RawDefinition) -> Self {
        let shape = raw.footprint().to_shape();
        Self {
            name: raw.name,
            category: raw.category,
            description: raw.description,
            cost: raw.cost,
            max_placeable: raw.max_placeable,
            shape,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<Arc<Definition>>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(definitions: impl IntoIterator<Item = Definition>) -> Self {
        let mut catalog = Self::default();
        for def in definitions {
            catalog.insert(def);
        }
        catalog
    }

    fn insert(&mut self, def: Definition) {
        if self.by_name.contains_key(&def.name) {
            tracing::warn!(name = %def.name, "duplicate catalog entry dropped");
            return;
        }
        self.by_name.insert(def.name.clone(), self.entries.len());
        self.entries.push(Arc::new(def));
    }

    fn from_raw(raw: RawCatalog) -> Self {
        Self::new(
            raw.buildings
                .into_iter()
                .chain(raw.resource_tiles)
                .map(Definition::from_raw),
        )
    }

    pub fn from_json_str(s: &str) -> Result<Self, CatalogError> {
        Ok(Self::from_raw(serde_json::from_str(s)?))
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, CatalogError> {
        Ok(Self::from_raw(serde_yaml::from_str(s)?))
    }

    /// Load a catalog file; `.yaml`/`.yml` files go through the YAML parser, everything
    /// else is read as JSON.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let catalog = if is_yaml {
            Self::from_yaml_str(&text)?
        } else {
            Self::from_json_str(&text)?
        };
        tracing::info!(path = %path.display(), entries = catalog.len(), "catalog loaded");
        Ok(catalog)
    }

    /// The building table shipped with the planner.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json_str(BUILTIN_CATALOG)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Definition>> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.entries.iter()
    }

    pub fn resolve_or_placeholder(&self, name: &str) -> Arc<Definition> {
        match self.get(name) {
            Some(def) => Arc::clone(def),
            None => {
                tracing::warn!(name, "unknown definition, using placeholder");
                Arc::new(Definition::placeholder(name))
            }
        }
    }

    /// Entries grouped by category in display order.
    pub fn by_category(&self) -> Vec<(String, Vec<Arc<Definition>>)> {
        let mut groups: Vec<(String, Vec<Arc<Definition>>)> = CATEGORY_ORDER
            .iter()
            .map(|c| (c.to_string(), Vec::new()))
            .collect();
        for def in &self.entries {
            match groups.iter_mut().find(|(c, _)| *c == def.category) {
                Some((_, defs)) => defs.push(Arc::clone(def)),
                None => groups.push((def.category.clone(), vec![Arc::clone(def)])),
            }
        }
        groups.retain(|(_, defs)| !defs.is_empty());
        groups
    }
}
