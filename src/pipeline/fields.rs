//! Structured record field parsing from free-form staff text.
//!
//! Handles the forms staff actually type: `Toyota Avanza 2020 150jt`,
//! `harga 150 juta`, `1,2m`, `150.000.000`, `45rb km`.

use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::{RecordDraft, RecordStatus, RecordUpdate};

static MILEAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}(?:[.,]\d{3})+|\d+)\s*(rb|ribu|k)?\s*km\b").unwrap()
});

static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(19[5-9]\d|20\d{2})\b").unwrap());

static PRICE_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+(?:[.,]\d+)?)\s*(jt|juta|m|miliar|milyar|rb|ribu|k)\b").unwrap()
});

static PRICE_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3}(?:\.\d{3}){2,}|\d{7,})\b").unwrap());

/// Words that introduce a record but are not part of it.
const FILLER_WORDS: &[&str] = &[
    "/upload", "upload", "tambah", "input", "mobil", "unit", "baru", "harga", "tahun", "warna",
    "rp", "rp.", "km", "data",
];

const COLORS: &[&str] = &[
    "hitam", "putih", "silver", "abu", "abu-abu", "merah", "biru", "hijau", "kuning", "coklat",
    "cokelat", "emas", "gold", "orange", "oranye", "ungu", "black", "white", "grey", "gray",
    "red", "blue",
];

/// Partially collected record fields carried between flow turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage_km: Option<u32>,
}

impl RecordFields {
    /// Extract whatever fields the text contains.
    pub fn parse(text: &str) -> Self {
        let mut rest = text.to_string();
        let mut fields = Self::default();

        if let Some(caps) = MILEAGE.captures(&rest) {
            let digits: String = caps[1].chars().filter(char::is_ascii_digit).collect();
            let multiplier = if caps.get(2).is_some() { 1000 } else { 1 };
            fields.mileage_km = digits.parse::<u32>().ok().map(|km| km.saturating_mul(multiplier));
            rest = remove_match(&rest, caps.get(0).map(|m| m.range()));
        }

        if let Some(m) = YEAR.find(&rest) {
            fields.year = m.as_str().parse().ok();
            rest = remove_match(&rest, Some(m.range()));
        }

        if let Some(caps) = PRICE_UNIT.captures(&rest) {
            fields.price = parse_price_with_unit(&caps[1], &caps[2]);
            rest = remove_match(&rest, caps.get(0).map(|m| m.range()));
        } else if let Some(m) = PRICE_PLAIN.find(&rest) {
            fields.price = parse_price_plain(m.as_str());
            rest = remove_match(&rest, Some(m.range()));
        }

        let mut words = Vec::new();
        for word in rest.split_whitespace() {
            let lower = word.trim_matches(|c: char| c == ',' || c == ':').to_lowercase();
            if lower.is_empty() || FILLER_WORDS.contains(&lower.as_str()) {
                continue;
            }
            if fields.color.is_none() && COLORS.contains(&lower.as_str()) {
                fields.color = Some(capitalize(&lower));
                continue;
            }
            if lower.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            words.push(word.trim_matches(|c: char| c == ',' || c == ':'));
        }

        if let Some((make, model)) = words.split_first() {
            fields.make = Some(capitalize(make));
            if !model.is_empty() {
                fields.model = Some(
                    model
                        .iter()
                        .map(|w| capitalize(w))
                        .collect::<Vec<_>>()
                        .join(" "),
                );
            }
        }

        fields
    }

    /// Fill in fields from `other` that are present there.
    pub fn merge(&mut self, other: RecordFields) {
        if other.make.is_some() && self.make.is_none() {
            self.make = other.make;
            // A model only makes sense next to the make it was typed with.
            if other.model.is_some() {
                self.model = other.model;
            }
        } else if other.model.is_some() && self.model.is_none() {
            self.model = other.model;
        } else if self.model.is_none() {
            // A bare word after the make was given is the model.
            self.model = other.make;
        }
        self.year = other.year.or(self.year);
        self.price = other.price.or(self.price);
        self.color = other.color.or(self.color.take());
        self.mileage_km = other.mileage_km.or(self.mileage_km);
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Names of required fields that are still missing.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.make.is_none() {
            missing.push("merk");
        }
        if self.model.is_none() {
            missing.push("model");
        }
        if self.year.is_none() {
            missing.push("tahun");
        }
        if self.price.is_none() {
            missing.push("harga");
        }
        missing
    }

    /// A complete draft, when every required field is present.
    pub fn to_draft(&self) -> Option<RecordDraft> {
        Some(RecordDraft {
            make: self.make.clone()?,
            model: self.model.clone()?,
            year: self.year?,
            price: self.price?,
            color: self.color.clone(),
            mileage_km: self.mileage_km,
        })
    }
}

/// Parse an `/edit` field name and value into a record update.
pub fn parse_field_update(field: &str, value: &str) -> Result<RecordUpdate, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("nilai untuk '{field}' kosong"));
    }
    match field.trim().to_lowercase().as_str() {
        "merk" | "make" | "brand" => Ok(RecordUpdate::Make(capitalize(value))),
        "model" | "tipe" | "type" => Ok(RecordUpdate::Model(capitalize(value))),
        "tahun" | "year" => YEAR
            .find(value)
            .and_then(|m| m.as_str().parse().ok())
            .map(RecordUpdate::Year)
            .ok_or_else(|| format!("tahun tidak valid: {value}")),
        "harga" | "price" => parse_price(value)
            .map(RecordUpdate::Price)
            .ok_or_else(|| format!("harga tidak valid: {value}")),
        "warna" | "color" | "colour" => Ok(RecordUpdate::Color(capitalize(value))),
        "km" | "kilometer" | "mileage" => {
            let with_unit = if value.to_lowercase().contains("km") {
                value.to_string()
            } else {
                format!("{value} km")
            };
            RecordFields::parse(&with_unit)
                .mileage_km
                .map(RecordUpdate::Mileage)
                .ok_or_else(|| format!("kilometer tidak valid: {value}"))
        }
        "status" => value.parse::<RecordStatus>().map(RecordUpdate::Status),
        other => Err(format!("field tidak dikenal: {other}")),
    }
}

/// Parse a standalone price value in any supported form.
pub fn parse_price(text: &str) -> Option<Decimal> {
    if let Some(caps) = PRICE_UNIT.captures(text) {
        return parse_price_with_unit(&caps[1], &caps[2]);
    }
    if let Some(m) = PRICE_PLAIN.find(text) {
        return parse_price_plain(m.as_str());
    }
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok().filter(|d: &Decimal| !d.is_zero())
}

/// Format a price the way Indonesian listings show it: `Rp 150.000.000`.
pub fn format_price(price: Decimal) -> String {
    let whole = price.trunc().abs().to_string();
    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("Rp {grouped}")
}

fn parse_price_with_unit(number: &str, unit: &str) -> Option<Decimal> {
    let number: Decimal = number.replace(',', ".").parse().ok()?;
    let multiplier = match unit.to_lowercase().as_str() {
        "jt" | "juta" => Decimal::from(1_000_000),
        "m" | "miliar" | "milyar" => Decimal::from(1_000_000_000),
        "rb" | "ribu" | "k" => Decimal::from(1_000),
        _ => return None,
    };
    number.checked_mul(multiplier).map(|price| price.normalize())
}

fn parse_price_plain(text: &str) -> Option<Decimal> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn remove_match(text: &str, range: Option<std::ops::Range<usize>>) -> String {
    match range {
        Some(range) => format!("{} {}", &text[..range.start], &text[range.end..]),
        None => text.to_string(),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_full_upload_line() {
        let fields = RecordFields::parse("upload Toyota Avanza 2020 150jt hitam 45rb km");
        assert_eq!(fields.make.as_deref(), Some("Toyota"));
        assert_eq!(fields.model.as_deref(), Some("Avanza"));
        assert_eq!(fields.year, Some(2020));
        assert_eq!(fields.price, Some(dec!(150000000)));
        assert_eq!(fields.color.as_deref(), Some("Hitam"));
        assert_eq!(fields.mileage_km, Some(45000));
        assert!(fields.missing().is_empty());
        assert!(fields.to_draft().is_some());
    }

    #[test]
    fn price_forms() {
        assert_eq!(parse_price("150jt"), Some(dec!(150000000)));
        assert_eq!(parse_price("150 juta"), Some(dec!(150000000)));
        assert_eq!(parse_price("1.5m"), Some(dec!(1500000000)));
        assert_eq!(parse_price("1,2 miliar"), Some(dec!(1200000000)));
        assert_eq!(parse_price("150000000"), Some(dec!(150000000)));
        assert_eq!(parse_price("150.000.000"), Some(dec!(150000000)));
        assert_eq!(parse_price("murah"), None);
    }

    #[test]
    fn oversized_price_is_rejected() {
        assert_eq!(parse_price("79228162514264337593543950jt"), None);
        assert_eq!(parse_price("99999999999999999999999999999"), None);

        let fields = RecordFields::parse("/upload Toyota Avanza 2020 79228162514264337593543950jt");
        assert_eq!(fields.price, None);
        assert_eq!(fields.year, Some(2020));
        assert_eq!(fields.missing(), vec!["harga"]);

        assert!(parse_field_update("harga", "79228162514264337593543950jt").is_err());
    }

    #[test]
    fn bare_upload_has_nothing() {
        let fields = RecordFields::parse("/upload");
        assert!(fields.is_empty());
        assert_eq!(fields.missing(), vec!["merk", "model", "tahun", "harga"]);
    }

    #[test]
    fn merge_fills_gaps_across_turns() {
        let mut fields = RecordFields::parse("upload Honda");
        fields.merge(RecordFields::parse("Jazz"));
        fields.merge(RecordFields::parse("2018 harga 175 juta"));
        assert_eq!(fields.make.as_deref(), Some("Honda"));
        assert_eq!(fields.model.as_deref(), Some("Jazz"));
        assert_eq!(fields.year, Some(2018));
        assert_eq!(fields.price, Some(dec!(175000000)));
    }

    #[test]
    fn year_not_taken_from_long_numbers() {
        let fields = RecordFields::parse("Suzuki Ertiga 120000000");
        assert_eq!(fields.year, None);
        assert_eq!(fields.price, Some(dec!(120000000)));
    }

    #[test]
    fn edit_updates() {
        assert_eq!(
            parse_field_update("harga", "140jt").unwrap(),
            RecordUpdate::Price(dec!(140000000))
        );
        assert_eq!(parse_field_update("tahun", "2019").unwrap(), RecordUpdate::Year(2019));
        assert_eq!(parse_field_update("warna", "putih").unwrap(), RecordUpdate::Color("Putih".into()));
        assert_eq!(parse_field_update("km", "30000").unwrap(), RecordUpdate::Mileage(30000));
        assert_eq!(
            parse_field_update("status", "terjual").unwrap(),
            RecordUpdate::Status(RecordStatus::Sold)
        );
        assert!(parse_field_update("tahun", "kemarin").is_err());
        assert!(parse_field_update("mesin", "bagus").is_err());
    }

    #[test]
    fn formats_rupiah() {
        assert_eq!(format_price(dec!(150000000)), "Rp 150.000.000");
        assert_eq!(format_price(dec!(950)), "Rp 950");
    }
}
