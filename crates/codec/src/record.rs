use crate::{CodecError, Row, Timestamp};

/// One trade/sale event for a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    /// Entity id of the product this trade belongs to.
    pub product_id: String,
    /// Sale price.
    pub price: u64,
    /// Option label (size, colour, ...).
    pub option: String,
    /// When the trade happened.
    pub date_created: Timestamp,
    /// Whether the item shipped from stock.
    pub is_immediate_delivery_item: bool,
}

impl TradeRecord {
    /// Shorthand for the record's timestamp.
    pub fn timestamp(&self) -> &Timestamp {
        &self.date_created
    }
}

impl Row for TradeRecord {
    const COLUMNS: &'static [&'static str] = &[
        "product_id",
        "price",
        "option",
        "date_created",
        "is_immediate_delivery_item",
    ];

    fn to_fields(&self) -> Vec<String> {
        vec![
            self.product_id.clone(),
            self.price.to_string(),
            self.option.clone(),
            self.date_created.as_str().to_string(),
            self.is_immediate_delivery_item.to_string(),
        ]
    }

    fn from_fields(fields: &[String]) -> Result<Self, CodecError> {
        Ok(Self {
            product_id: fields[0].clone(),
            price: parse_u64("price", &fields[1])?,
            option: fields[2].clone(),
            date_created: Timestamp::parse(&fields[3])?,
            is_immediate_delivery_item: parse_bool("is_immediate_delivery_item", &fields[4])?,
        })
    }
}

/// Descriptive metadata for a product, kept in one aggregate log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductMeta {
    pub product_id: String,
    pub name: String,
    /// Retail price; `0` when the listing did not show one.
    pub original_price: u64,
    pub brand: String,
}

impl Row for ProductMeta {
    const COLUMNS: &'static [&'static str] = &["product_id", "name", "original_price", "brand"];

    fn to_fields(&self) -> Vec<String> {
        vec![
            self.product_id.clone(),
            self.name.clone(),
            self.original_price.to_string(),
            self.brand.clone(),
        ]
    }

    fn from_fields(fields: &[String]) -> Result<Self, CodecError> {
        Ok(Self {
            product_id: fields[0].clone(),
            name: fields[1].clone(),
            original_price: parse_u64("original_price", &fields[2])?,
            brand: fields[3].clone(),
        })
    }
}

fn parse_u64(column: &'static str, value: &str) -> Result<u64, CodecError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| CodecError::InvalidField {
            column,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(column: &'static str, value: &str) -> Result<bool, CodecError> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CodecError::InvalidField {
            column,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
