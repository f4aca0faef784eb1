use metrics_exporter_prometheus::PrometheusHandle;
use pqc_hybrid_auth::{AuthRequest, HybridAuthConfig, HybridAuthError, HybridOrchestrator, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const SERVER_ERROR: i32 = -32000;
pub const AUTH_FAILED: i32 = -32001;

/// Floor for the per-request processing bound
const BASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Room after the engine deadline for fallback, audit and the response
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

// --- Struct Definitions ---
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Debug)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Serialize, Debug)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
struct BreakerResetParams {
    #[serde(default)]
    operation: Option<OperationKind>,
}

#[derive(Deserialize, Debug)]
struct FlagSetParams {
    feature: String,
    enabled: bool,
}

#[derive(Deserialize, Debug)]
struct FlagOverrideParams {
    user_id: String,
    feature: String,
    /// `null` clears the override
    #[serde(default)]
    enabled: Option<bool>,
}
// --- Struct Definitions End ---

pub struct AdminState {
    pub orchestrator: Arc<HybridOrchestrator>,
    pub metrics: Option<PrometheusHandle>,
}

// --- Helper Functions ---
pub fn create_error_response(id: Value, code: i32, message: String) -> RpcResponse {
    error!("Responding with error: code={}, message={}", code, message);
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(RpcError {
            code,
            message,
            data: None,
        }),
    }
}

fn create_success_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

fn auth_error_response(id: Value, err: &HybridAuthError) -> RpcResponse {
    warn!(error = %err, "auth/execute failed");
    let category = if err.is_policy_error() {
        "policy"
    } else if err.is_input_error() {
        "input"
    } else {
        "crypto"
    };
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(RpcError {
            code: AUTH_FAILED,
            message: err.client_message().to_string(),
            data: Some(json!({ "category": category })),
        }),
    }
}

fn to_result<T: Serialize>(id: Value, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => create_success_response(id, v),
        Err(e) => create_error_response(id, SERVER_ERROR, format!("Failed to serialize result: {}", e)),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, String> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| format!("Invalid params: {}", e))
}

/// Overlay the keys of `patch` onto the current config and validate the result
fn merge_config(current: &HybridAuthConfig, patch: Value) -> Result<HybridAuthConfig, String> {
    let patch: Map<String, Value> = match patch {
        Value::Object(map) => map,
        _ => return Err("Invalid params: config/update expects an object".to_string()),
    };
    let mut merged = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => return Err("Current config is not representable".to_string()),
    };
    for (key, value) in patch {
        if !merged.contains_key(&key) {
            return Err(format!("Invalid params: unknown config field '{}'", key));
        }
        merged.insert(key, value);
    }
    serde_json::from_value(Value::Object(merged)).map_err(|e| format!("Invalid params: {}", e))
}
// --- Helper Functions End ---

/// Processing bound for one request; always outlives the engine deadline so
/// an engine timeout is handled by the orchestrator, not cut off here
pub fn request_timeout(engine_deadline: Duration) -> Duration {
    BASE_REQUEST_TIMEOUT.max(engine_deadline + RESPONSE_GRACE)
}

fn help() -> Value {
    json!({
        "message": "PQC hybrid auth admin server. JSON-RPC 2.0, one request per line.",
        "commands": {
            "help": { "description": "Displays this help message." },
            "config/get": { "description": "Returns the live hybrid auth config." },
            "config/update": { "description": "Merges the given fields into the config; invalid combinations are rejected." },
            "breaker/status": { "description": "Circuit breaker snapshot per operation kind." },
            "breaker/reset": { "description": "Closes one breaker ({\"operation\": kind}) or all of them." },
            "flags/set": { "description": "Sets a global feature flag ({feature, enabled})." },
            "flags/override": { "description": "Sets or clears a per-user override ({user_id, feature, enabled|null})." },
            "audit/stats": { "description": "Fallback audit counters and delivery state." },
            "cache/stats": { "description": "Session cache statistics." },
            "cache/clear": { "description": "Drops all cached sessions." },
            "engine/status": { "description": "Checks the cryptographic engine with get_status." },
            "auth/execute": { "description": "Runs one orchestrated operation (operator smoke test)." },
            "metrics/render": { "description": "Prometheus text exposition of the process metrics." }
        }
    })
}

type ResponseFuture = Pin<Box<dyn Future<Output = RpcResponse> + Send>>;

// --- Main Request Processor ---
pub fn process_request(state: Arc<AdminState>, req: RpcRequest) -> ResponseFuture {
    Box::pin(async move {
        debug!("Processing request: {:?}", req);

        if req.jsonrpc != "2.0" {
            return create_error_response(
                req.id,
                INVALID_REQUEST,
                "Invalid Request: jsonrpc must be \"2.0\"".to_string(),
            );
        }
        let orchestrator = &state.orchestrator;

        match req.method.as_str() {
            "help" => create_success_response(req.id, help()),

            "config/get" => to_result(req.id, &*orchestrator.config().snapshot()),

            "config/update" => {
                let current = orchestrator.config().snapshot();
                let next = match merge_config(&current, req.params) {
                    Ok(next) => next,
                    Err(message) => return create_error_response(req.id, INVALID_PARAMS, message),
                };
                match orchestrator.config().replace(next) {
                    Ok(updated) => {
                        info!("Config updated through admin surface");
                        to_result(req.id, &*updated)
                    }
                    Err(e) => create_error_response(req.id, INVALID_PARAMS, e.to_string()),
                }
            }

            "breaker/status" => to_result(req.id, &orchestrator.breakers().status()),

            "breaker/reset" => match parse_params::<BreakerResetParams>(req.params) {
                Ok(BreakerResetParams {
                    operation: Some(kind),
                }) => {
                    orchestrator.breakers().reset(kind);
                    to_result(req.id, &orchestrator.breakers().status())
                }
                Ok(BreakerResetParams { operation: None }) => {
                    orchestrator.breakers().reset_all();
                    to_result(req.id, &orchestrator.breakers().status())
                }
                Err(message) => create_error_response(req.id, INVALID_PARAMS, message),
            },

            "flags/set" => match parse_params::<FlagSetParams>(req.params) {
                Ok(p) => {
                    orchestrator.flags().set_global(&p.feature, p.enabled);
                    to_result(req.id, &orchestrator.flags().snapshot())
                }
                Err(message) => create_error_response(req.id, INVALID_PARAMS, message),
            },

            "flags/override" => match parse_params::<FlagOverrideParams>(req.params) {
                Ok(p) => {
                    orchestrator
                        .flags()
                        .set_override(&p.user_id, &p.feature, p.enabled);
                    to_result(req.id, &orchestrator.flags().snapshot())
                }
                Err(message) => create_error_response(req.id, INVALID_PARAMS, message),
            },

            "audit/stats" => create_success_response(
                req.id,
                json!({
                    "sink": orchestrator.audit().sink_name(),
                    "stats": orchestrator.audit().stats(),
                }),
            ),

            "cache/stats" => to_result(req.id, &orchestrator.sessions().stats()),

            "cache/clear" => {
                let removed = orchestrator.sessions().clear();
                info!(removed, "Session cache cleared through admin surface");
                create_success_response(req.id, json!({ "removed": removed }))
            }

            "engine/status" => match orchestrator.engine_status().await {
                Ok(response) => create_success_response(
                    req.id,
                    json!({
                        "engine": orchestrator.engine_name(),
                        "available": true,
                        "algorithm": response.algorithm,
                    }),
                ),
                Err(failure) => create_success_response(
                    req.id,
                    json!({
                        "engine": orchestrator.engine_name(),
                        "available": false,
                        "failure": failure.kind(),
                    }),
                ),
            },

            "auth/execute" => match parse_params::<AuthRequest>(req.params) {
                Ok(request) => match orchestrator.execute(request).await {
                    Ok(result) => to_result(req.id, &result),
                    Err(e) => auth_error_response(req.id, &e),
                },
                Err(message) => create_error_response(req.id, INVALID_PARAMS, message),
            },

            "metrics/render" => match &state.metrics {
                Some(handle) => create_success_response(req.id, Value::String(handle.render())),
                None => create_error_response(
                    req.id,
                    SERVER_ERROR,
                    "Metrics recorder not installed".to_string(),
                ),
            },

            other => create_error_response(
                req.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pqc_hybrid_auth::{
        AuditSettings, CryptoEngine, EngineOutcome, EngineRequest, EngineResponse,
        FallbackAuditRecorder, MemorySink,
    };

    struct AlwaysOk;

    #[async_trait]
    impl CryptoEngine for AlwaysOk {
        async fn invoke(&self, _request: EngineRequest) -> EngineOutcome {
            Ok(EngineResponse {
                success: true,
                algorithm: Some("ML-KEM-768".to_string()),
                session_id: Some("pqc-session".to_string()),
                public_key_hash: Some("feedface".to_string()),
                ..EngineResponse::default()
            })
        }

        fn name(&self) -> &str {
            "always-ok"
        }
    }

    fn state() -> Arc<AdminState> {
        let audit = Arc::new(FallbackAuditRecorder::new(
            Arc::new(MemorySink::new()),
            &AuditSettings::default(),
        ));
        let orchestrator = HybridOrchestrator::builder(Arc::new(AlwaysOk), audit)
            .build()
            .unwrap();
        Arc::new(AdminState {
            orchestrator: Arc::new(orchestrator),
            metrics: None,
        })
    }

    async fn call(state: &Arc<AdminState>, method: &str, params: Value) -> RpcResponse {
        process_request(
            state.clone(),
            RpcRequest {
                jsonrpc: "2.0".to_string(),
                id: json!(1),
                method: method.to_string(),
                params,
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_config_update_is_validated() {
        let state = state();
        let ok = call(&state, "config/update", json!({ "pqc_threshold": 0.5 })).await;
        assert_eq!(ok.result.unwrap()["pqc_threshold"], 0.5);

        let bad = call(
            &state,
            "config/update",
            json!({ "enable_pqc": false, "preferred_mode": "PQC" }),
        )
        .await;
        assert_eq!(bad.error.unwrap().code, INVALID_PARAMS);
        assert!(state.orchestrator.config().snapshot().enable_pqc);

        let unknown = call(&state, "config/update", json!({ "pqc_enabled": true })).await;
        assert_eq!(unknown.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_auth_execute_and_cache() {
        let state = state();
        let response = call(
            &state,
            "auth/execute",
            json!({ "kind": "handshake", "user": { "user_id": "u1" } }),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["used_mode"], "PQC");
        assert_eq!(result["algorithm"], "ML-KEM-768");

        let stats = call(&state, "cache/stats", Value::Null).await.result.unwrap();
        assert_eq!(stats["entries"], 1);
        let cleared = call(&state, "cache/clear", Value::Null).await.result.unwrap();
        assert_eq!(cleared["removed"], 1);
    }

    #[tokio::test]
    async fn test_auth_execute_hides_details() {
        let state = state();
        let response = call(
            &state,
            "auth/execute",
            json!({ "kind": "signing", "user": { "user_id": "user<script>123" } }),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, AUTH_FAILED);
        assert_eq!(error.message, "Request contains invalid parameters");
        assert_eq!(error.data.unwrap()["category"], "input");
    }

    #[tokio::test]
    async fn test_breaker_and_flags() {
        let state = state();
        let status = call(&state, "breaker/status", Value::Null).await.result.unwrap();
        assert_eq!(status["signing"]["state"], "CLOSED");

        let reset = call(&state, "breaker/reset", json!({ "operation": "signing" })).await;
        assert!(reset.error.is_none());
        let bad = call(&state, "breaker/reset", json!({ "operation": "decrypt" })).await;
        assert_eq!(bad.error.unwrap().code, INVALID_PARAMS);

        let flags = call(&state, "flags/set", json!({ "feature": "pqc", "enabled": false }))
            .await
            .result
            .unwrap();
        assert_eq!(flags["global"]["pqc"], false);
        let flags = call(
            &state,
            "flags/override",
            json!({ "user_id": "u1", "feature": "pqc", "enabled": true }),
        )
        .await
        .result
        .unwrap();
        assert_eq!(flags["overrides"]["u1"]["pqc"], true);
    }

    #[tokio::test]
    async fn test_request_timeout_outlives_engine_deadline() {
        let state = state();
        let deadline = state.orchestrator.engine_deadline();
        assert_eq!(deadline, Duration::from_secs(31));
        assert!(request_timeout(deadline) > deadline);
        assert_eq!(
            request_timeout(Duration::from_millis(500)),
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_engine_status_and_unknown_method() {
        let state = state();
        let status = call(&state, "engine/status", Value::Null).await.result.unwrap();
        assert_eq!(status["available"], true);
        assert_eq!(status["engine"], "always-ok");

        let missing = call(&state, "keys/rotate", Value::Null).await;
        assert_eq!(missing.error.unwrap().code, METHOD_NOT_FOUND);
        let no_metrics = call(&state, "metrics/render", Value::Null).await;
        assert_eq!(no_metrics.error.unwrap().code, SERVER_ERROR);
    }
}
