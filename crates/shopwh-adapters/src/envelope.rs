//! `retorno` envelope checks shared by every endpoint.

use serde_json::Value as JsonValue;
use shopwh_client::ApiError;

use crate::mapper::{first_text, parse_number};

const RATE_LIMIT_MARKERS: &[&str] = &["api bloqueada", "número de acessos", "numero de acessos"];
const NO_RECORDS_MARKERS: &[&str] = &["não retornou registros", "nao retornou registros"];
const NO_RECORDS_CODE: &str = "20";

/// Usable part of an upstream response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Envelope<'a> {
    Ok(&'a JsonValue),
    /// Upstream answered "no records" for the query; treated as an empty final page.
    Empty,
}

/// Validates `retorno.status` and classifies upstream errors.
pub fn check_envelope<'a>(endpoint: &str, body: &'a JsonValue) -> Result<Envelope<'a>, ApiError> {
    let Some(retorno) = body.get("retorno").filter(|r| r.is_object()) else {
        return Err(ApiError::Decode {
            endpoint: endpoint.to_string(),
            message: "response has no `retorno` object".to_string(),
        });
    };

    let status = first_text(retorno, &[&["status"]]).unwrap_or_default();
    if status.eq_ignore_ascii_case("OK") {
        return Ok(Envelope::Ok(retorno));
    }

    let message = error_message(retorno);
    let lowered = message.to_lowercase();
    let code = first_text(retorno, &[&["codigo_erro"]]);

    if code.as_deref() == Some(NO_RECORDS_CODE)
        || NO_RECORDS_MARKERS.iter().any(|m| lowered.contains(m))
    {
        return Ok(Envelope::Empty);
    }
    if RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(ApiError::RateLimited {
            endpoint: endpoint.to_string(),
            message,
        });
    }
    Err(ApiError::Business {
        endpoint: endpoint.to_string(),
        message: match code {
            Some(code) => format!("[{code}] {message}"),
            None => message,
        },
    })
}

fn error_message(retorno: &JsonValue) -> String {
    let collected: Vec<String> = match retorno.get("erros") {
        Some(JsonValue::Array(entries)) => entries
            .iter()
            .filter_map(|e| first_text(e, &[&["erro"]]).or_else(|| e.as_str().map(str::to_string)))
            .collect(),
        Some(JsonValue::String(s)) => vec![s.clone()],
        Some(other) => first_text(other, &[&["erro"]]).into_iter().collect(),
        None => Vec::new(),
    };
    if collected.is_empty() {
        let status = first_text(retorno, &[&["status"]]).unwrap_or_else(|| "missing".to_string());
        format!("status {status}")
    } else {
        collected.join("; ")
    }
}

/// `numero_paginas` as a page count; absent or malformed means a single page.
pub fn total_pages(retorno: &JsonValue) -> u32 {
    retorno
        .get("numero_paginas")
        .and_then(parse_number)
        .filter(|n| *n >= 1.0)
        .map(|n| n as u32)
        .unwrap_or(1)
}
