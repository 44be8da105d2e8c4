use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rentwatch_core::{InteriorCondition, Listing, ListingSource, SourceWebsite, UnknownVariant};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    ListingSourceUpsert, ListingStore, NewSourceWebsite, StoreError, StoreResult, StructuralQuery,
    UniqueKey,
};

/// Columns written on insert only; never touched by merges.
const KEY_COLUMNS: &[&str] = &[
    "id",
    "fingerprint",
    "reference_code",
    "reference_code_normalized",
    "first_seen_at",
];

/// Columns rewritten on every merge. Order must match [`bind_mutable_columns`].
const MUTABLE_COLUMNS: &[&str] = &[
    "title",
    "city",
    "district",
    "building_name",
    "address",
    "contract_type",
    "property_type",
    "price_monthly_cents",
    "currency",
    "service_charges_monthly_cents",
    "service_charges_included",
    "rooms",
    "bedrooms",
    "bathrooms",
    "total_area_sqm",
    "living_area_sqm",
    "terrace_area_sqm",
    "floor",
    "parking_spaces",
    "cellars",
    "is_mixed_use",
    "has_rooftop",
    "has_terrace",
    "has_sea_view",
    "has_elevator",
    "has_concierge",
    "has_ac",
    "condition",
    "interior_condition",
    "features_tags",
    "description",
    "description_lang",
    "agency_name",
    "agency_address",
    "agency_phone",
    "agency_email",
    "agency_website",
    "primary_url",
    "all_urls",
    "image_urls",
    "score",
    "last_seen_at",
    "is_active",
];

const SOURCE_COLUMNS: &str = "id, listing_id, source_website_id, source_listing_id, url, \
     source_reference_code, source_reference_code_normalized, source_title, raw_payload, \
     first_seen_at, last_seen_at, is_active_on_source";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Postgres-backed canonical store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn fetch_listings(&self, sql: &str, binds: &[&str]) -> StoreResult<Vec<Listing>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }
}

fn listing_select(filter: &str) -> String {
    format!(
        "SELECT {}, {} FROM listings {filter}",
        KEY_COLUMNS.join(", "),
        MUTABLE_COLUMNS.join(", ")
    )
}

fn insert_listing_sql() -> String {
    let columns = KEY_COLUMNS
        .iter()
        .chain(MUTABLE_COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO listings ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

fn update_listing_sql() -> String {
    let assignments = MUTABLE_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ${}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE listings SET {assignments} WHERE id = $1")
}

fn bind_mutable_columns<'q>(
    query: Query<'q, Postgres, PgArguments>,
    l: &'q Listing,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(&l.title)
        .bind(&l.city)
        .bind(l.district.as_deref())
        .bind(l.building_name.as_deref())
        .bind(l.address.as_deref())
        .bind(l.contract_type.as_str())
        .bind(l.property_type.as_str())
        .bind(l.price_monthly_cents)
        .bind(&l.currency)
        .bind(l.service_charges_monthly_cents)
        .bind(l.service_charges_included)
        .bind(l.rooms)
        .bind(l.bedrooms)
        .bind(l.bathrooms)
        .bind(l.total_area_sqm)
        .bind(l.living_area_sqm)
        .bind(l.terrace_area_sqm)
        .bind(l.floor)
        .bind(l.parking_spaces)
        .bind(l.cellars)
        .bind(l.is_mixed_use)
        .bind(l.has_rooftop)
        .bind(l.has_terrace)
        .bind(l.has_sea_view)
        .bind(l.has_elevator)
        .bind(l.has_concierge)
        .bind(l.has_ac)
        .bind(l.condition.as_str())
        .bind(l.interior_condition.map(|c| c.as_str()))
        .bind(l.features_tags.as_slice())
        .bind(l.description.as_deref())
        .bind(l.description_lang.as_deref())
        .bind(l.agency_name.as_deref())
        .bind(l.agency_address.as_deref())
        .bind(l.agency_phone.as_deref())
        .bind(l.agency_email.as_deref())
        .bind(l.agency_website.as_deref())
        .bind(l.primary_url.as_deref())
        .bind(l.all_urls.as_slice())
        .bind(l.image_urls.as_slice())
        .bind(l.score)
        .bind(l.last_seen_at)
        .bind(l.is_active)
}

/// Map driver errors onto the store contract, surfacing unique violations by key.
fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            if let Some(key) = db.constraint().and_then(UniqueKey::from_constraint_name) {
                return StoreError::UniqueViolation(key);
            }
        }
    }
    StoreError::Database(err)
}

fn parse_label<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|err: UnknownVariant| StoreError::CorruptRow {
        table: "listings",
        message: err.to_string(),
    })
}

fn listing_from_row(row: &PgRow) -> StoreResult<Listing> {
    let interior_condition = row
        .try_get::<Option<String>, _>("interior_condition")?
        .map(|raw| raw.parse::<InteriorCondition>())
        .transpose()
        .map_err(|err: UnknownVariant| StoreError::CorruptRow {
            table: "listings",
            message: err.to_string(),
        })?;

    Ok(Listing {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        reference_code: row.try_get("reference_code")?,
        reference_code_normalized: row.try_get("reference_code_normalized")?,
        title: row.try_get("title")?,
        city: row.try_get("city")?,
        district: row.try_get("district")?,
        building_name: row.try_get("building_name")?,
        address: row.try_get("address")?,
        contract_type: parse_label(row, "contract_type")?,
        property_type: parse_label(row, "property_type")?,
        price_monthly_cents: row.try_get("price_monthly_cents")?,
        currency: row.try_get("currency")?,
        service_charges_monthly_cents: row.try_get("service_charges_monthly_cents")?,
        service_charges_included: row.try_get("service_charges_included")?,
        rooms: row.try_get("rooms")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        total_area_sqm: row.try_get("total_area_sqm")?,
        living_area_sqm: row.try_get("living_area_sqm")?,
        terrace_area_sqm: row.try_get("terrace_area_sqm")?,
        floor: row.try_get("floor")?,
        parking_spaces: row.try_get("parking_spaces")?,
        cellars: row.try_get("cellars")?,
        is_mixed_use: row.try_get("is_mixed_use")?,
        has_rooftop: row.try_get("has_rooftop")?,
        has_terrace: row.try_get("has_terrace")?,
        has_sea_view: row.try_get("has_sea_view")?,
        has_elevator: row.try_get("has_elevator")?,
        has_concierge: row.try_get("has_concierge")?,
        has_ac: row.try_get("has_ac")?,
        condition: parse_label(row, "condition")?,
        interior_condition,
        features_tags: row.try_get("features_tags")?,
        description: row.try_get("description")?,
        description_lang: row.try_get("description_lang")?,
        agency_name: row.try_get("agency_name")?,
        agency_address: row.try_get("agency_address")?,
        agency_phone: row.try_get("agency_phone")?,
        agency_email: row.try_get("agency_email")?,
        agency_website: row.try_get("agency_website")?,
        primary_url: row.try_get("primary_url")?,
        all_urls: row.try_get("all_urls")?,
        image_urls: row.try_get("image_urls")?,
        score: row.try_get("score")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        is_active: row.try_get("is_active")?,
    })
}

fn listing_source_from_row(row: &PgRow) -> StoreResult<ListingSource> {
    Ok(ListingSource {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        source_website_id: row.try_get("source_website_id")?,
        source_listing_id: row.try_get("source_listing_id")?,
        url: row.try_get("url")?,
        source_reference_code: row.try_get("source_reference_code")?,
        source_reference_code_normalized: row.try_get("source_reference_code_normalized")?,
        source_title: row.try_get("source_title")?,
        raw_payload: row.try_get("raw_payload")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        is_active_on_source: row.try_get("is_active_on_source")?,
    })
}

fn source_website_from_row(row: &PgRow) -> StoreResult<SourceWebsite> {
    Ok(SourceWebsite {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
    })
}

/// Escape LIKE metacharacters so a reference prefix matches literally.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ListingStore for PgStore {
    async fn find_source_website(&self, code: &str) -> StoreResult<Option<SourceWebsite>> {
        let row = sqlx::query("SELECT id, code, name, base_url FROM source_websites WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_website_from_row).transpose()
    }

    async fn upsert_source_website(&self, website: &NewSourceWebsite) -> StoreResult<SourceWebsite> {
        let row = sqlx::query(
            r#"
            INSERT INTO source_websites (id, code, name, base_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO UPDATE
               SET name = EXCLUDED.name,
                   base_url = EXCLUDED.base_url
            RETURNING id, code, name, base_url
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&website.code)
        .bind(&website.name)
        .bind(&website.base_url)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        source_website_from_row(&row)
    }

    async fn list_source_websites(&self) -> StoreResult<Vec<SourceWebsite>> {
        let rows = sqlx::query("SELECT id, code, name, base_url FROM source_websites ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_website_from_row).collect()
    }

    async fn find_listing_source(
        &self,
        source_website_id: Uuid,
        source_listing_id: &str,
    ) -> StoreResult<Option<ListingSource>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM listing_sources \
             WHERE source_website_id = $1 AND source_listing_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(source_website_id)
            .bind(source_listing_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_source_from_row).transpose()
    }

    async fn sources_for_listing(&self, listing_id: Uuid) -> StoreResult<Vec<ListingSource>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM listing_sources WHERE listing_id = $1 \
             ORDER BY first_seen_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(listing_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_source_from_row).collect()
    }

    async fn all_listing_sources(&self) -> StoreResult<Vec<ListingSource>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM listing_sources ORDER BY first_seen_at, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(listing_source_from_row).collect()
    }

    async fn find_listing(&self, id: Uuid) -> StoreResult<Option<Listing>> {
        let sql = listing_select("WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn find_by_reference_code(&self, normalized: &str) -> StoreResult<Option<Listing>> {
        let sql = listing_select("WHERE reference_code_normalized = $1");
        Ok(self.fetch_listings(&sql, &[normalized]).await?.into_iter().next())
    }

    async fn find_by_reference_prefix(&self, prefix: &str) -> StoreResult<Vec<Listing>> {
        let sql = listing_select(
            "WHERE reference_code_normalized LIKE $1 ORDER BY first_seen_at, id",
        );
        let pattern = format!("{}\\_%", escape_like(prefix));
        self.fetch_listings(&sql, &[pattern.as_str()]).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<Listing>> {
        let sql = listing_select("WHERE fingerprint = $1");
        Ok(self.fetch_listings(&sql, &[fingerprint]).await?.into_iter().next())
    }

    async fn find_structural_candidates(&self, query: &StructuralQuery) -> StoreResult<Vec<Listing>> {
        let sql = listing_select(
            "WHERE building_name = $1 AND rooms = $2 \
               AND total_area_sqm BETWEEN $3 AND $4 \
               AND ($5::text IS NULL OR district = $5) \
             ORDER BY first_seen_at, id",
        );
        let rows = sqlx::query(&sql)
            .bind(&query.building_name)
            .bind(query.rooms)
            .bind(query.total_area_min_sqm)
            .bind(query.total_area_max_sqm)
            .bind(query.district.as_deref())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn all_listings(&self) -> StoreResult<Vec<Listing>> {
        let sql = listing_select("ORDER BY first_seen_at, id");
        self.fetch_listings(&sql, &[]).await
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<()> {
        let sql = insert_listing_sql();
        let query = sqlx::query(&sql)
            .bind(listing.id)
            .bind(&listing.fingerprint)
            .bind(listing.reference_code.as_deref())
            .bind(listing.reference_code_normalized.as_deref())
            .bind(listing.first_seen_at);
        bind_mutable_columns(query, listing)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        debug!(listing_id = %listing.id, fingerprint = %listing.fingerprint, "listing inserted");
        Ok(())
    }

    async fn update_listing(&self, listing: &Listing) -> StoreResult<()> {
        let sql = update_listing_sql();
        let query = sqlx::query(&sql).bind(listing.id);
        let result = bind_mutable_columns(query, listing)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "listing",
                id: listing.id,
            });
        }
        Ok(())
    }

    async fn update_score(&self, listing_id: Uuid, score: i32) -> StoreResult<()> {
        let result = sqlx::query("UPDATE listings SET score = $2 WHERE id = $1")
            .bind(listing_id)
            .bind(score)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "listing",
                id: listing_id,
            });
        }
        Ok(())
    }

    async fn upsert_listing_source(&self, source: &ListingSourceUpsert) -> StoreResult<ListingSource> {
        let sql = format!(
            r#"
            INSERT INTO listing_sources (
                id, listing_id, source_website_id, source_listing_id, url,
                source_reference_code, source_reference_code_normalized, source_title,
                raw_payload, first_seen_at, last_seen_at, is_active_on_source
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, TRUE)
            ON CONFLICT (source_website_id, source_listing_id) DO UPDATE
               SET listing_id = EXCLUDED.listing_id,
                   url = EXCLUDED.url,
                   source_reference_code = EXCLUDED.source_reference_code,
                   source_reference_code_normalized = EXCLUDED.source_reference_code_normalized,
                   source_title = EXCLUDED.source_title,
                   raw_payload = EXCLUDED.raw_payload,
                   last_seen_at = EXCLUDED.last_seen_at,
                   is_active_on_source = TRUE
            RETURNING {SOURCE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(source.listing_id)
            .bind(source.source_website_id)
            .bind(&source.source_listing_id)
            .bind(&source.url)
            .bind(source.source_reference_code.as_deref())
            .bind(source.source_reference_code_normalized.as_deref())
            .bind(source.source_title.as_deref())
            .bind(&source.raw_payload)
            .bind(source.seen_at)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        listing_source_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_has_one_placeholder_per_column() {
        let sql = insert_listing_sql();
        let total = KEY_COLUMNS.len() + MUTABLE_COLUMNS.len();
        assert!(sql.contains(&format!("${total})")));
        assert!(!sql.contains(&format!("${}", total + 1)));
    }

    #[test]
    fn update_sql_never_touches_keys() {
        let sql = update_listing_sql();
        for key in ["fingerprint", "reference_code_normalized", "first_seen_at"] {
            assert!(!sql.contains(&format!("{key} =")), "{key} must not be updated");
        }
        assert!(sql.ends_with("WHERE id = $1"));
    }

    #[test]
    fn like_escape_protects_underscores() {
        assert_eq!(escape_like("ACL_2P"), "ACL\\_2P");
        assert_eq!(escape_like("50%"), "50\\%");
    }
}
