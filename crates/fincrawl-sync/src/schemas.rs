//! Target table declarations.

use fincrawl_core::{ColumnType, SchemaError, TableSchema};

use ColumnType::{Date, Float, Int, Text};

pub const INDEX_DESCRIPTION: &str = "index_org_description";
pub const INDEX_PRICE: &str = "index_org_price";
pub const FUND_DESCRIPTION: &str = "mf_org_description";
pub const FUND_NAV: &str = "mf_org_nav";
pub const FUND_MANAGER: &str = "mf_org_manager";
pub const FUND_SALE: &str = "mf_org_sale";

const UPDATED_AT: &str = "updated_at";

fn table(name: &str, columns: &[(&str, ColumnType)], key: &[&str]) -> Result<TableSchema, SchemaError> {
    columns
        .iter()
        .fold(TableSchema::new(name), |schema, (col, ty)| {
            schema.column(*col, *ty, !key.contains(col))
        })
        .unique_key(key)
        .updated_at(UPDATED_AT)
        .validate()
}

pub fn index_description() -> Result<TableSchema, SchemaError> {
    table(
        INDEX_DESCRIPTION,
        &[
            ("wind_code", Text),
            ("short_name", Text),
            ("full_name", Text),
            ("market", Text),
            ("base_date", Date),
            ("base_point", Float),
            ("list_date", Date),
            ("weights_rule", Text),
            ("publisher", Text),
            ("index_code", Text),
            ("index_style", Text),
            ("index_intro", Text),
            ("weight_type", Text),
            ("expire_date", Date),
            ("income_processing_method", Text),
            ("change_history", Text),
            ("localized", Int),
        ],
        &["wind_code"],
    )
}

pub fn index_price() -> Result<TableSchema, SchemaError> {
    table(
        INDEX_PRICE,
        &[
            ("wind_code", Text),
            ("trade_dt", Date),
            ("currency", Text),
            ("open_", Float),
            ("high_", Float),
            ("low_", Float),
            ("close_", Float),
            ("volume_", Float),
            ("amount_", Float),
        ],
        &["wind_code", "trade_dt"],
    )
}

pub fn fund_description() -> Result<TableSchema, SchemaError> {
    table(
        FUND_DESCRIPTION,
        &[
            ("wind_code", Text),
            ("short_name", Text),
            ("management", Text),
            ("custodian", Text),
            ("invest_type", Text),
            ("setup_date", Date),
            ("maturity_date", Date),
            ("issue_date", Date),
            ("list_date", Date),
            ("delist_date", Date),
            ("purchase_start_dt", Date),
            ("redemption_start_dt", Date),
            ("m_fee", Float),
            ("c_fee", Float),
            ("duration_year", Float),
            ("p_value", Float),
            ("min_amount", Float),
            ("exp_return", Float),
            ("benchmark", Text),
            ("status", Text),
            ("invest_style", Text),
            ("fund_type", Text),
            ("trustee", Text),
            ("market", Text),
        ],
        &["wind_code"],
    )
}

pub fn fund_nav() -> Result<TableSchema, SchemaError> {
    table(
        FUND_NAV,
        &[
            ("wind_code", Text),
            ("trade_dt", Date),
            ("ann_date", Date),
            ("unit_nav", Float),
            ("acc_nav", Float),
            ("adj_factor", Float),
            ("net_asset", Float),
            ("total_netasset", Float),
        ],
        &["wind_code", "trade_dt"],
    )
}

pub fn fund_manager() -> Result<TableSchema, SchemaError> {
    table(
        FUND_MANAGER,
        &[
            ("wind_code", Text),
            ("ann_date", Date),
            ("manager_name", Text),
            ("start_dt", Date),
            ("end_dt", Date),
        ],
        &["wind_code", "start_dt", "manager_name"],
    )
}

pub fn fund_sale() -> Result<TableSchema, SchemaError> {
    table(
        FUND_SALE,
        &[
            ("product_code", Text),
            ("product_id", Int),
            ("product_abbr", Text),
            ("risk_level", Int),
            ("per_buy_limit", Float),
            ("product_status", Int),
            ("subscribe_start_time", Date),
            ("subscribe_end_time", Date),
            ("purchase_rates", Float),
            ("purchase_rates_dis", Float),
        ],
        &["product_code"],
    )
}

/// Every table the jobs write, for maintenance lookups by name.
pub fn all() -> Result<Vec<TableSchema>, SchemaError> {
    Ok(vec![
        index_description()?,
        index_price()?,
        fund_description()?,
        fund_nav()?,
        fund_manager()?,
        fund_sale()?,
    ])
}

pub fn by_name(name: &str) -> Result<Option<TableSchema>, SchemaError> {
    Ok(all()?.into_iter().find(|s| s.name() == name))
}
