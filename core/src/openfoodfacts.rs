use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::models::{Product, non_empty, normalize_grade};

/// Fields requested from the v2 product endpoint.
pub const PRODUCT_FIELDS: &str = "code,product_name,ingredients_text,ingredients_from_palm_oil_tags,\
ingredients_that_may_be_from_palm_oil_tags,image_front_small_url,nutriscore_grade,nova_group,\
nutrient_levels,additives_tags";

const IMAGE_BASE_URL: &str = "https://images.openfoodfacts.org/images/products";

#[derive(Debug, Deserialize)]
pub struct ProductResponse {
    pub code: Option<String>,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
    pub product: Option<ProductData>,
}

impl ProductResponse {
    /// `status` arrives as either `0`/`1` or `"0"`/`"1"`; absent means found.
    #[must_use]
    pub fn is_found(&self) -> bool {
        let status = match &self.status {
            None | Some(serde_json::Value::Null) => return self.product.is_some(),
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        status != Some(0) && self.product.is_some()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductData {
    pub product_name: Option<String>,
    pub ingredients_text: Option<String>,
    pub ingredients_from_palm_oil_tags: Option<Vec<String>>,
    pub ingredients_that_may_be_from_palm_oil_tags: Option<Vec<String>>,
    pub image_front_small_url: Option<String>,
    pub nutriscore_grade: Option<String>,
    pub nova_group: Option<i64>,
    pub nutrient_levels: Option<BTreeMap<String, String>>,
    pub additives_tags: Option<Vec<String>>,
}

/// Map a remote product onto the catalog schema. Absent fields stay absent
/// (unknown), never negative.
#[must_use]
pub fn product_from_remote(code: &str, p: ProductData) -> Product {
    Product {
        code: code.to_string(),
        name: non_empty(p.product_name),
        ingredients: non_empty(p.ingredients_text),
        palm_oil_tags: to_set(p.ingredients_from_palm_oil_tags),
        palm_oil_may_be_tags: to_set(p.ingredients_that_may_be_from_palm_oil_tags),
        image_url: non_empty(p.image_front_small_url),
        nutriscore_grade: normalize_grade(p.nutriscore_grade),
        nova_group: p.nova_group,
        nutrient_levels: p.nutrient_levels.unwrap_or_default(),
        additives_tags: to_set(p.additives_tags),
        last_updated: 0,
    }
}

fn to_set(tags: Option<Vec<String>>) -> BTreeSet<String> {
    tags.unwrap_or_default().into_iter().collect()
}

/// Image folder layout used by OpenFoodFacts: the code is padded to 13
/// digits and split 3/3/3/rest.
#[must_use]
pub fn image_url_for_code(code: &str) -> Option<String> {
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let padded = format!("{code:0>13}");
    let (p1, rest) = padded.split_at(3);
    let (p2, rest) = rest.split_at(3);
    let (p3, p4) = rest.split_at(3);
    Some(format!(
        "{IMAGE_BASE_URL}/{p1}/{p2}/{p3}/{p4}/front_en.400.jpg"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_product() -> ProductData {
        ProductData {
            product_name: Some("Nutella".to_string()),
            ingredients_text: Some("Sugar, palm oil, hazelnuts".to_string()),
            ingredients_from_palm_oil_tags: Some(vec!["huile-de-palme".to_string()]),
            ingredients_that_may_be_from_palm_oil_tags: Some(vec![]),
            image_front_small_url: Some("https://example.org/nutella.jpg".to_string()),
            nutriscore_grade: Some("e".to_string()),
            nova_group: Some(4),
            nutrient_levels: Some(BTreeMap::from([("sugars".to_string(), "high".to_string())])),
            additives_tags: Some(vec!["en:e322".to_string(), "en:e322i".to_string()]),
        }
    }

    #[test]
    fn test_product_from_remote_complete() {
        let p = product_from_remote("3017620422003", full_product());
        assert_eq!(p.code, "3017620422003");
        assert_eq!(p.name.as_deref(), Some("Nutella"));
        assert!(p.palm_oil_tags.contains("huile-de-palme"));
        assert!(p.palm_oil_may_be_tags.is_empty());
        assert_eq!(p.nutriscore_grade.as_deref(), Some("e"));
        assert_eq!(p.nova_group, Some(4));
        assert_eq!(p.additives_tags.len(), 2);
        assert_eq!(p.last_updated, 0);
    }

    #[test]
    fn test_product_from_remote_minimal() {
        let p = product_from_remote("123", ProductData::default());
        assert!(p.name.is_none());
        assert!(p.ingredients.is_none());
        assert!(p.palm_oil_tags.is_empty());
        assert!(p.nutrient_levels.is_empty());
        assert!(p.image_url.is_none());
    }

    #[test]
    fn test_response_status_variants() {
        let found: ProductResponse =
            serde_json::from_str(r#"{"code":"1","status":1,"product":{}}"#).unwrap();
        assert!(found.is_found());

        let found_str: ProductResponse =
            serde_json::from_str(r#"{"code":"1","status":"1","product":{}}"#).unwrap();
        assert!(found_str.is_found());

        let missing: ProductResponse =
            serde_json::from_str(r#"{"code":"1","status":0,"status_verbose":"product not found"}"#)
                .unwrap();
        assert!(!missing.is_found());

        let no_status: ProductResponse =
            serde_json::from_str(r#"{"code":"1","product":{"product_name":"x"}}"#).unwrap();
        assert!(no_status.is_found());
    }

    #[test]
    fn test_image_url_for_code() {
        assert_eq!(
            image_url_for_code("3435660768163").as_deref(),
            Some("https://images.openfoodfacts.org/images/products/343/566/076/8163/front_en.400.jpg")
        );
        // short codes are zero padded
        assert_eq!(
            image_url_for_code("12345678").as_deref(),
            Some("https://images.openfoodfacts.org/images/products/000/001/234/5678/front_en.400.jpg")
        );
        assert!(image_url_for_code("").is_none());
        assert!(image_url_for_code("abc").is_none());
    }
}
