use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::db::bootstrap;
use crate::errors::{AppError, AppResult};
use crate::geo::{haversine_km, BoundingBox, GeoPoint};

pub const MATERIAL_CATEGORIES: &[&str] = &[
    "Wood",
    "Glass",
    "Aggregates",
    "Metals",
    "Bricks/Blocks",
    "Plastics",
    "Composites",
    "Cement",
    "Structural Materials",
    "Finishing Materials",
    "Ceramic Materials",
    "Insulation Materials",
    "Roofing Materials",
    "Landscaping Materials",
    "Adhesives/Sealants",
    "Paint/Coatings",
    "Plumbing Materials",
    "Electrical Materials",
    "Hardware/Fasteners",
    "Other",
];

const PRODUCT_COLUMNS: &str = "id, title, description, category, price, quantity, address,
    location_lng, location_lat, location_address, created_at, updated_at";

/// Rows whose location is absent or not a well-formed point.
const NEEDS_GEOCODE: &str = "(location_lng IS NULL
    OR location_lat IS NULL
    OR location_address IS NULL
    OR TRIM(location_address) = ''
    OR location_lng NOT BETWEEN -180 AND 180
    OR location_lat NOT BETWEEN -90 AND 90)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PointKind {
    Point,
}

/// A validated stored location. Construction enforces the point invariant,
/// so a `Location` value is always well-formed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(rename = "type")]
    kind: PointKind,
    coordinates: [f64; 2],
    formatted_address: String,
}

impl Location {
    pub fn new(point: GeoPoint, formatted_address: impl Into<String>) -> AppResult<Self> {
        point.validate().map_err(AppError::InvalidCoordinates)?;
        let formatted_address = formatted_address.into().trim().to_string();
        if formatted_address.is_empty() {
            return Err(AppError::InvalidCoordinates(
                "formatted address must not be empty".into(),
            ));
        }
        Ok(Self {
            kind: PointKind::Point,
            coordinates: point.coordinates(),
            formatted_address,
        })
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::from_coordinates(self.coordinates)
    }

    pub fn coordinates(&self) -> [f64; 2] {
        self.coordinates
    }

    pub fn formatted_address(&self) -> &str {
        &self.formatted_address
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    pub quantity: i64,
    pub address: String,
    pub location: Option<Location>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub price: f64,
    pub quantity: i64,
    pub address: String,
}

impl NewProduct {
    fn validate(&self) -> AppResult<()> {
        if self.title.trim().is_empty() {
            return Err(AppError::InvalidRequest("title is required".into()));
        }
        if self.address.trim().is_empty() {
            return Err(AppError::InvalidRequest("address is required".into()));
        }
        if !MATERIAL_CATEGORIES.contains(&self.category.as_str()) {
            return Err(AppError::InvalidRequest(format!(
                "unknown category: {}",
                self.category
            )));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(AppError::InvalidRequest(
                "price must be greater than or equal to 0".into(),
            ));
        }
        if self.quantity < 0 {
            return Err(AppError::InvalidRequest(
                "quantity must be greater than or equal to 0".into(),
            ));
        }
        Ok(())
    }
}

/// How the migration walks the set of products needing geocoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCursor {
    /// Live predicate, restricted to ids after the last visited one.
    AfterId(Option<String>),
    /// Live predicate skipping a fixed number of rows. Only safe when nothing
    /// is written between pages.
    Offset(usize),
}

#[derive(Clone)]
pub struct ProductStore {
    db: Arc<Mutex<Connection>>,
}

impl ProductStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let context = bootstrap(path)?;
        Ok(Self::new(Arc::new(Mutex::new(context.connection))))
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn create_product(&self, new: NewProduct) -> AppResult<Product> {
        new.validate()?;
        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();
        {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO products
                    (id, title, description, category, price, quantity, address, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    new.title.trim(),
                    new.description.trim(),
                    new.category,
                    new.price,
                    new.quantity,
                    new.address.trim(),
                    now
                ],
            )?;
        }
        debug!(target: "product_store", product_id = %id, "product created");
        self.get_product(&id)?
            .ok_or_else(|| AppError::NotFound(format!("product {id}")))
    }

    pub fn get_product(&self, id: &str) -> AppResult<Option<Product>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            [id],
            product_from_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Resolves ids in the order given. Unknown and repeated ids are dropped.
    pub fn find_by_ids(&self, ids: &[String]) -> AppResult<Vec<Product>> {
        let mut seen = HashSet::new();
        let unique: Vec<&str> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; unique.len()].join(", ");
        let mut found = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products WHERE id IN ({placeholders})"
            ))?;
            let rows = stmt
                .query_map(params_from_iter(unique.iter()), product_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let rank: HashMap<&str, usize> = unique
            .iter()
            .enumerate()
            .map(|(idx, id)| (*id, idx))
            .collect();
        found.sort_by_key(|product| {
            rank.get(product.id.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });
        Ok(found)
    }

    /// Replaces the free-text address. A changed address clears the stored
    /// location in the same write, so the product needs geocoding again until
    /// a fresh point is set.
    pub fn update_address(&self, id: &str, address: &str) -> AppResult<Product> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AppError::InvalidRequest("address is required".into()));
        }
        let changed = {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE products
                SET location_lng = CASE WHEN address = ?1 THEN location_lng END,
                    location_lat = CASE WHEN address = ?1 THEN location_lat END,
                    location_address = CASE WHEN address = ?1 THEN location_address END,
                    address = ?1,
                    updated_at = ?2
                WHERE id = ?3",
                params![address, now_timestamp(), id],
            )?
        };
        if changed == 0 {
            return Err(AppError::NotFound(format!("product {id}")));
        }
        self.get_product(id)?
            .ok_or_else(|| AppError::NotFound(format!("product {id}")))
    }

    /// Case-insensitive substring match over title, category and description.
    /// Case folding is Unicode-aware through the `lower_unicode` SQL function
    /// registered at bootstrap.
    pub fn search_text(&self, query: &str, limit: usize) -> AppResult<Vec<Product>> {
        let pattern = format!("%{}%", escape_like(&query.trim().to_lowercase()));
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products
            WHERE lower_unicode(title) LIKE ?1 ESCAPE '\\'
                OR lower_unicode(category) LIKE ?1 ESCAPE '\\'
                OR lower_unicode(description) LIKE ?1 ESCAPE '\\'
            ORDER BY created_at DESC, id ASC
            LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![pattern, limit as i64], product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Products whose great-circle distance from `center` is at most
    /// `radius_km`, nearest first (ties broken by id). The lat/lng index only
    /// narrows the scan; inclusion is decided by the haversine distance.
    pub fn find_within_radius(&self, center: GeoPoint, radius_km: f64) -> AppResult<Vec<Product>> {
        center.validate().map_err(AppError::InvalidQuery)?;
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(AppError::InvalidQuery(format!(
                "radius must be a positive number of kilometres, got {radius_km}"
            )));
        }

        let bbox = BoundingBox::around(center, radius_km);
        let candidates = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                WHERE location_lat BETWEEN ?1 AND ?2
                    AND location_lng BETWEEN ?3 AND ?4
                    AND location_address IS NOT NULL"
            ))?;
            let rows = stmt
                .query_map(
                    params![bbox.min_lat, bbox.max_lat, bbox.min_lng, bbox.max_lng],
                    product_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let scanned = candidates.len();

        let mut matches: Vec<(f64, Product)> = candidates
            .into_iter()
            .filter_map(|product| {
                let distance = haversine_km(center, product.location.as_ref()?.point());
                (distance <= radius_km).then_some((distance, product))
            })
            .collect();
        matches.sort_by(|(a_dist, a), (b_dist, b)| {
            a_dist
                .partial_cmp(b_dist)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        trace!(
            target: "product_store",
            scanned,
            matched = matches.len(),
            radius_km,
            "radius query"
        );
        Ok(matches.into_iter().map(|(_, product)| product).collect())
    }

    /// Writes a complete location or nothing. Re-applying the same value is a
    /// no-op, including the update timestamp.
    pub fn set_location(
        &self,
        id: &str,
        coordinates: [f64; 2],
        formatted_address: &str,
    ) -> AppResult<()> {
        let location = Location::new(GeoPoint::from_coordinates(coordinates), formatted_address)?;
        let [lng, lat] = location.coordinates();

        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE products
            SET location_lng = ?1, location_lat = ?2, location_address = ?3, updated_at = ?4
            WHERE id = ?5
                AND NOT (location_lng IS ?1 AND location_lat IS ?2 AND location_address IS ?3)",
            params![lng, lat, location.formatted_address(), now_timestamp(), id],
        )?;
        if changed > 0 {
            trace!(target: "product_store", product_id = id, lng, lat, "location written");
            return Ok(());
        }

        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM products WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        match exists {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("product {id}"))),
        }
    }

    pub fn count_products(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_needing_geocode(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM products WHERE {NEEDS_GEOCODE}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One page of products lacking a well-formed location, ordered by id.
    pub fn needing_geocode(&self, cursor: &PendingCursor, limit: usize) -> AppResult<Vec<Product>> {
        let conn = self.db.lock();
        let rows = match cursor {
            PendingCursor::AfterId(after) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRODUCT_COLUMNS} FROM products
                    WHERE {NEEDS_GEOCODE} AND (?1 IS NULL OR id > ?1)
                    ORDER BY id ASC
                    LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![after, limit as i64], product_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            PendingCursor::Offset(offset) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRODUCT_COLUMNS} FROM products
                    WHERE {NEEDS_GEOCODE}
                    ORDER BY id ASC
                    LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(params![limit as i64, *offset as i64], product_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let lng: Option<f64> = row.get(7)?;
    let lat: Option<f64> = row.get(8)?;
    let formatted: Option<String> = row.get(9)?;
    // Partial or out-of-range legacy values read back as no location.
    let location = match (lng, lat, formatted) {
        (Some(lng), Some(lat), Some(formatted)) => {
            Location::new(GeoPoint::new(lng, lat), formatted).ok()
        }
        _ => None,
    };

    Ok(Product {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        price: row.get(4)?,
        quantity: row.get(5)?,
        address: row.get(6)?,
        location,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
