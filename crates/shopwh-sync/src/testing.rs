//! Scripted upstream fake and payload builders shared by engine and pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use shopwh_client::{ApiError, SourceApi};

use crate::engine::EngineConfig;

pub fn instant_engine() -> EngineConfig {
    EngineConfig {
        detail_delay: Duration::ZERO,
        page_delay: Duration::ZERO,
        rate_limit_cooldown: Duration::ZERO,
        max_rate_limit_cooldowns: 5,
    }
}

/// Responses are scripted per `endpoint?param=value` key and consumed in order; the
/// last scripted response for a key repeats once the queue is down to one entry.
#[derive(Default)]
pub struct ScriptedApi {
    scripts: Mutex<HashMap<String, VecDeque<Result<JsonValue, ApiError>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, key: &str, response: Result<JsonValue, ApiError>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn ok(&self, key: &str, body: JsonValue) -> &Self {
        self.script(key, Ok(body))
    }

    /// Drops everything scripted for `key`.
    pub fn reset(&self, key: &str) -> &Self {
        self.scripts.lock().unwrap().remove(key);
        self
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

fn clone_response(response: &Result<JsonValue, ApiError>) -> Result<JsonValue, ApiError> {
    match response {
        Ok(body) => Ok(body.clone()),
        Err(ApiError::Transient {
            endpoint,
            attempts,
            message,
        }) => Err(ApiError::Transient {
            endpoint: endpoint.clone(),
            attempts: *attempts,
            message: message.clone(),
        }),
        Err(ApiError::Decode { endpoint, message }) => Err(ApiError::Decode {
            endpoint: endpoint.clone(),
            message: message.clone(),
        }),
        Err(other) => Err(ApiError::Request {
            endpoint: "scripted".into(),
            message: other.to_string(),
        }),
    }
}

#[async_trait]
impl SourceApi for ScriptedApi {
    async fn call(&self, endpoint: &str, params: &[(&str, String)]) -> Result<JsonValue, ApiError> {
        let key = params
            .iter()
            .map(|(k, v)| format!("{endpoint}?{k}={v}"))
            .find(|key| self.scripts.lock().unwrap().contains_key(key))
            .unwrap_or_else(|| endpoint.to_string());
        self.calls.lock().unwrap().push(key.clone());

        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(&key) else {
            return Err(ApiError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: 404,
            });
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue
                .front()
                .map(clone_response)
                .unwrap_or_else(|| Err(ApiError::Closed))
        }
    }
}

pub fn transient(endpoint: &str) -> ApiError {
    ApiError::Transient {
        endpoint: endpoint.to_string(),
        attempts: 5,
        message: "operation timed out".to_string(),
    }
}

pub fn orders_page(page: u32, total: u32, orders: &[(&str, &str)]) -> JsonValue {
    let pedidos: Vec<JsonValue> = orders
        .iter()
        .map(|(id, date)| {
            json!({"pedido": {
                "id": id,
                "numero": format!("N{id}"),
                "data_pedido": date,
                "nome": format!("Cliente {id}"),
                "valor": "100.00",
                "situacao": "Aprovado"
            }})
        })
        .collect();
    json!({"retorno": {"status": "OK", "pagina": page, "numero_paginas": total, "pedidos": pedidos}})
}

pub fn order_detail(id: &str, date: &str, skus: &[&str]) -> JsonValue {
    let itens: Vec<JsonValue> = skus
        .iter()
        .map(|sku| {
            json!({"item": {
                "id_produto": format!("P-{sku}"),
                "codigo": sku,
                "descricao": format!("Produto {sku}"),
                "quantidade": "1.00",
                "valor_unitario": "50.00"
            }})
        })
        .collect();
    json!({"retorno": {"status": "OK", "pedido": {
        "id": id,
        "numero": format!("N{id}"),
        "data_pedido": date,
        "cliente": {"nome": format!("Cliente {id}")},
        "canal_venda": "Loja Virtual",
        "total_pedido": "100.00",
        "situacao": "Aprovado",
        "itens": itens
    }}})
}

pub fn products_page(page: u32, total: u32, products: &[(&str, &str)]) -> JsonValue {
    let produtos: Vec<JsonValue> = products
        .iter()
        .map(|(id, code)| json!({"produto": {"id": id, "codigo": code, "nome": format!("Produto {code}"), "preco": "10.00"}}))
        .collect();
    json!({"retorno": {"status": "OK", "pagina": page, "numero_paginas": total, "produtos": produtos}})
}

pub fn rate_limited() -> JsonValue {
    json!({"retorno": {"status": "Erro", "codigo_erro": "6", "erros": [{"erro": "API Bloqueada - Excedido o número de acessos a API"}]}})
}

pub fn no_records() -> JsonValue {
    json!({"retorno": {"status": "Erro", "codigo_erro": "20", "erros": [{"erro": "A consulta não retornou registros"}]}})
}
