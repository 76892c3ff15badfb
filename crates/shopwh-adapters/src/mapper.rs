//! Tolerant field mapping from upstream JSON into domain records.
//!
//! Every attribute has an ordered list of candidate paths; the first non-empty value
//! wins. Field-level defects degrade to `None`. Only a missing external id is an error.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use shopwh_core::{ProductRecord, RemoteLineItem, RemoteOrderDetail, RemoteOrderSummary};

use crate::MappingError;

const ORDER_ID: &[&[&str]] = &[&["id"], &["id_pedido"]];
const ORDER_NUMBER: &[&[&str]] = &[&["numero"], &["numero_pedido"]];
const ORDER_DATE: &[&[&str]] = &[
    &["data_pedido"],
    &["data_criacao"],
    &["data_emissao"],
    &["data"],
];
const CUSTOMER_ID: &[&[&str]] = &[&["cliente", "id"], &["cliente", "codigo"], &["id_contato"]];
const CUSTOMER_NAME: &[&[&str]] = &[
    &["nome"],
    &["cliente", "nome"],
    &["cliente"],
    &["cliente_nome"],
];
const CHANNEL: &[&[&str]] = &[
    &["canal_venda"],
    &["origem"],
    &["ecommerce", "nomeEcommerce"],
];
const STATUS: &[&[&str]] = &[&["situacao"], &["status"]];
const PRODUCTS_AMOUNT: &[&[&str]] = &[&["total_produtos"], &["valor_produtos"]];
const DISCOUNT_AMOUNT: &[&[&str]] = &[&["valor_desconto"], &["desconto"]];
const SHIPPING_AMOUNT: &[&[&str]] = &[&["valor_frete"], &["frete"]];
const TOTAL_AMOUNT: &[&[&str]] = &[&["valor_total"], &["total_pedido"], &["valor"]];

const ITEM_PRODUCT_ID: &[&[&str]] = &[&["id_produto"], &["id"]];
const ITEM_CODE: &[&[&str]] = &[&["codigo"], &["sku"]];
const ITEM_NAME: &[&[&str]] = &[&["descricao"], &["nome"]];
const ITEM_QUANTITY: &[&[&str]] = &[&["quantidade"]];
const ITEM_UNIT_PRICE: &[&[&str]] = &[&["valor_unitario"]];
const ITEM_TOTAL: &[&[&str]] = &[&["valor_total"]];

/// Returns `value[key]` when it is an object, otherwise `value` itself.
pub fn unwrap_wrapper<'a>(value: &'a JsonValue, key: &str) -> &'a JsonValue {
    match value.get(key) {
        Some(inner) if inner.is_object() => inner,
        _ => value,
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn first_text(value: &JsonValue, candidates: &[&[&str]]) -> Option<String> {
    candidates
        .iter()
        .find_map(|path| json_path(value, path).and_then(scalar_text))
}

pub fn first_number(value: &JsonValue, candidates: &[&[&str]]) -> Option<f64> {
    candidates
        .iter()
        .find_map(|path| json_path(value, path).and_then(parse_number))
}

/// Accepts JSON numbers and numeric strings such as `"2.00"`, `"1.234,56"` or `"12,5"`.
pub fn parse_number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            let normalized = if trimmed.contains(',') {
                trimmed.replace('.', "").replace(',', ".")
            } else {
                trimmed.to_string()
            };
            normalized.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

/// `DD/MM/YYYY[ HH:MM:SS]` to ISO `YYYY-MM-DD[THH:MM:SS]`; ISO input passes through.
pub fn normalize_br_datetime(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(dt) = parse_datetime_any(raw) {
        if raw.len() > 10 {
            return Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string());
        }
    }
    parse_date_any(raw).map(|d| d.format("%Y-%m-%d").to_string())
}

fn parse_date_any(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn parse_datetime_any(raw: &str) -> Option<NaiveDateTime> {
    ["%d/%m/%Y %H:%M:%S", "%d/%m/%Y %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Calendar date of a `DD/MM/YYYY` or ISO value; a time component is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let normalized = normalize_br_datetime(raw)?;
    let date_part = normalized.split('T').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let normalized = normalize_br_datetime(raw)?;
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| parse_date(&normalized).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

pub fn map_order(raw: &JsonValue) -> Result<RemoteOrderSummary, MappingError> {
    let order = unwrap_wrapper(raw, "pedido");
    let external_id = first_text(order, ORDER_ID).ok_or(MappingError::MissingExternalId {
        entity: "order",
    })?;

    Ok(RemoteOrderSummary {
        external_id,
        number: first_text(order, ORDER_NUMBER),
        date: first_text(order, ORDER_DATE).and_then(|d| parse_date(&d)),
        customer_id: first_text(order, CUSTOMER_ID),
        customer_name: first_text(order, CUSTOMER_NAME),
        channel: first_text(order, CHANNEL),
        status: first_text(order, STATUS),
        products_amount: first_number(order, PRODUCTS_AMOUNT),
        discount_amount: first_number(order, DISCOUNT_AMOUNT),
        shipping_amount: first_number(order, SHIPPING_AMOUNT),
        total_amount: first_number(order, TOTAL_AMOUNT),
    })
}

/// Order object inside a detail response (`retorno.pedido`, `pedido`, or the body itself).
pub fn detail_order_payload(raw_detail: &JsonValue) -> &JsonValue {
    let retorno = unwrap_wrapper(raw_detail, "retorno");
    unwrap_wrapper(retorno, "pedido")
}

pub fn map_line_items(raw_detail: &JsonValue) -> Vec<RemoteLineItem> {
    let order = detail_order_payload(raw_detail);
    let items = order
        .get("itens")
        .or_else(|| json_path(raw_detail, &["retorno", "itens"]))
        .and_then(JsonValue::as_array);

    items
        .map(|items| {
            items
                .iter()
                .map(|entry| unwrap_wrapper(entry, "item"))
                .filter(|item| item.is_object())
                .map(|item| RemoteLineItem {
                    product_id: first_text(item, ITEM_PRODUCT_ID),
                    product_code: first_text(item, ITEM_CODE),
                    product_name: first_text(item, ITEM_NAME),
                    quantity: first_number(item, ITEM_QUANTITY),
                    unit_price: first_number(item, ITEM_UNIT_PRICE),
                    line_total: first_number(item, ITEM_TOTAL).or_else(|| {
                        let qty = first_number(item, ITEM_QUANTITY)?;
                        let unit = first_number(item, ITEM_UNIT_PRICE)?;
                        Some(qty * unit)
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn map_order_detail(raw_detail: &JsonValue) -> Result<RemoteOrderDetail, MappingError> {
    let order = detail_order_payload(raw_detail);
    if !order.is_object() {
        return Err(MappingError::MissingSection { section: "pedido" });
    }
    Ok(RemoteOrderDetail {
        order: map_order(order)?,
        line_items: map_line_items(raw_detail),
    })
}

pub fn map_product(raw: &JsonValue) -> Result<ProductRecord, MappingError> {
    let product = unwrap_wrapper(raw, "produto");
    let external_id = first_text(product, &[&["id"]]).ok_or(MappingError::MissingExternalId {
        entity: "product",
    })?;

    Ok(ProductRecord {
        external_id,
        code: first_text(product, &[&["codigo"], &["sku"]]),
        name: first_text(product, &[&["nome"], &["descricao"]]),
        price: first_number(product, &[&["preco"]]),
        promotional_price: first_number(product, &[&["preco_promocional"]]),
        cost_price: first_number(product, &[&["preco_custo"]]),
        average_cost_price: first_number(product, &[&["preco_custo_medio"]]),
        unit: first_text(product, &[&["unidade"]]),
        gtin: first_text(product, &[&["gtin"]]),
        variation_type: first_text(product, &[&["tipoVariacao"]]),
        location: first_text(product, &[&["localizacao"]]),
        status: first_text(product, &[&["situacao"]]),
        created_at: first_text(product, &[&["data_criacao"]]).and_then(|d| parse_datetime(&d)),
        tags: product_tags(product),
        raw_payload: product.clone(),
    })
}

/// Comma-joined tag names; falls back to the deepest `categoria` segment (`A >> B` gives `B`).
pub fn product_tags(product: &JsonValue) -> Option<String> {
    for key in ["tags_produto", "tags"] {
        let Some(value) = product.get(key) else {
            continue;
        };
        let names: Vec<String> = match value {
            JsonValue::Array(entries) => entries
                .iter()
                .filter_map(|entry| {
                    let tag = unwrap_wrapper(entry, "tag");
                    scalar_text(tag).or_else(|| first_text(tag, &[&["nome"], &["descricao"]]))
                })
                .collect(),
            other => scalar_text(other)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        if !names.is_empty() {
            return Some(names.join(", "));
        }
    }

    first_text(product, &[&["categoria"]]).and_then(|category| {
        category
            .split(">>")
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .last()
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_tolerate_strings_and_garbage() {
        assert_eq!(parse_number(&json!("2.00")), Some(2.0));
        assert_eq!(parse_number(&json!("1.234,56")), Some(1234.56));
        assert_eq!(parse_number(&json!("12,5")), Some(12.5));
        assert_eq!(parse_number(&json!(7)), Some(7.0));
        assert_eq!(parse_number(&json!("")), None);
        assert_eq!(parse_number(&json!("abc")), None);
        assert_eq!(parse_number(&json!(null)), None);
        assert_eq!(parse_number(&json!({"v": 1})), None);
    }

    #[test]
    fn brazilian_dates_normalize_to_iso() {
        assert_eq!(
            normalize_br_datetime("05/03/2024").as_deref(),
            Some("2024-03-05")
        );
        assert_eq!(
            normalize_br_datetime("31/10/2023 10:24:18").as_deref(),
            Some("2023-10-31T10:24:18")
        );
        assert_eq!(
            normalize_br_datetime("2024-03-05").as_deref(),
            Some("2024-03-05")
        );
        assert_eq!(normalize_br_datetime("31/02/2024"), None);
        assert_eq!(normalize_br_datetime("yesterday"), None);
        assert_eq!(normalize_br_datetime("  "), None);
        assert_eq!(
            parse_date("31/10/2023 10:24:18"),
            NaiveDate::from_ymd_opt(2023, 10, 31)
        );
    }

    #[test]
    fn order_fields_fall_back_through_candidates() {
        let summary = map_order(&json!({
            "pedido": {
                "id": 901,
                "numero": "1501",
                "data_emissao": "02/03/2024",
                "cliente": { "nome": "Maria Souza", "id": "77" },
                "ecommerce": { "nomeEcommerce": "Shopee" },
                "situacao": "Aprovado",
                "total_pedido": "150,90"
            }
        }))
        .unwrap();

        assert_eq!(summary.external_id, "901");
        assert_eq!(summary.number.as_deref(), Some("1501"));
        assert_eq!(summary.date, NaiveDate::from_ymd_opt(2024, 3, 2));
        assert_eq!(summary.customer_name.as_deref(), Some("Maria Souza"));
        assert_eq!(summary.customer_id.as_deref(), Some("77"));
        assert_eq!(summary.channel.as_deref(), Some("Shopee"));
        assert_eq!(summary.total_amount, Some(150.90));
        assert_eq!(summary.products_amount, None);
    }

    #[test]
    fn order_without_id_is_a_mapping_defect() {
        let err = map_order(&json!({"pedido": {"numero": "1", "id": "  "}})).unwrap_err();
        assert!(matches!(err, MappingError::MissingExternalId { .. }));
    }

    #[test]
    fn line_items_accept_both_detail_layouts() {
        let nested = json!({
            "retorno": {
                "pedido": {
                    "id": "1",
                    "itens": [
                        {"item": {"codigo": "SKU-1", "descricao": "Caneca", "quantidade": "2.00", "valor_unitario": "10.50"}},
                        {"item": {"sku": "SKU-2", "nome": "Camiseta", "quantidade": 1, "valor_unitario": 40, "valor_total": "40.00"}}
                    ]
                }
            }
        });
        let items = map_line_items(&nested);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].product_code.as_deref(), Some("SKU-1"));
        assert_eq!(items[0].line_total, Some(21.0));
        assert_eq!(items[1].product_name.as_deref(), Some("Camiseta"));
        assert_eq!(items[1].line_total, Some(40.0));

        let flat = json!({"retorno": {"itens": [{"item": {"codigo": "X", "quantidade": "3"}}]}});
        let items = map_line_items(&flat);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, Some(3.0));
        assert_eq!(items[0].line_total, None);

        assert!(map_line_items(&json!({"retorno": {"pedido": {"id": "1"}}})).is_empty());
    }

    #[test]
    fn tags_prefer_tag_list_then_category_leaf() {
        assert_eq!(
            product_tags(&json!({"tags_produto": [{"tag": {"nome": "verao"}}, "promo"]})).as_deref(),
            Some("verao, promo")
        );
        assert_eq!(
            product_tags(&json!({"tags": "a, b,,c"})).as_deref(),
            Some("a, b, c")
        );
        assert_eq!(
            product_tags(&json!({"categoria": "Casa >> Cozinha >> Canecas"})).as_deref(),
            Some("Canecas")
        );
        assert_eq!(product_tags(&json!({"tags": [], "categoria": ""})), None);
    }
}
