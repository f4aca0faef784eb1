mod handlers;

use handlers::{
    create_error_response, process_request, request_timeout, AdminState, RpcRequest, RpcResponse,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use pqc_hybrid_auth::{HybridOrchestrator, ServiceSettings};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

async fn write_frame(stdout: &mut Stdout, response: &RpcResponse) {
    let resp_str = serde_json::to_string(response).unwrap_or_else(|e| {
        format!(
            r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":-32000,"message":"Serialization error: {}"}}}}"#,
            e
        )
    });
    if let Err(e) = stdout.write_all(format!("{}\r\n", resp_str).as_bytes()).await {
        error!("Failed to write response for ID {:?}: {}", response.id, e);
    } else if let Err(e) = stdout.flush().await {
        error!("Failed to flush stdout for ID {:?}: {}", response.id, e);
    }
}

// --- Main Function ---
#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    };

    let settings = match ServiceSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Fatal: invalid service settings: {}", e);
            return;
        }
    };
    let orchestrator = match HybridOrchestrator::from_settings(&settings) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(e) => {
            error!("Fatal: could not build orchestrator: {}", e);
            return;
        }
    };
    let request_deadline = request_timeout(orchestrator.engine_deadline());
    let state = Arc::new(AdminState {
        orchestrator,
        metrics,
    });

    info!(
        engine = %settings.gateway.program.display(),
        preferred_mode = %settings.auth.preferred_mode,
        request_timeout_ms = request_deadline.as_millis() as u64,
        "Starting PQC admin server on stdio..."
    );
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut stdout = tokio::io::stdout();
    let mut line_buffer = String::new();

    let ready_msg = json!({"jsonrpc": "2.0", "method": "server/ready", "params": {"status": "ready"}});
    if let Err(e) = stdout
        .write_all(format!("{}\r\n", ready_msg).as_bytes())
        .await
    {
        error!("Fatal: Failed to write ready message: {}", e);
        return;
    }
    if let Err(e) = stdout.flush().await {
        error!("Fatal: Failed to flush after ready message: {}", e);
        return;
    }

    loop {
        line_buffer.clear();
        match reader.read_line(&mut line_buffer).await {
            Ok(0) => {
                info!("Stdin closed (EOF). Exiting server.");
                break;
            }
            Ok(_) => {
                let trimmed_line = line_buffer.trim();
                if trimmed_line.is_empty() || !trimmed_line.starts_with('{') {
                    if !trimmed_line.is_empty() {
                        warn!("Received non-JSON input line, ignoring.");
                    }
                    continue;
                }
                debug!("<<< Received raw line ({} bytes)", trimmed_line.len());

                let parsed_json: Value = match serde_json::from_str(trimmed_line) {
                    Ok(v) => v,
                    Err(e) => {
                        let error_resp =
                            create_error_response(Value::Null, -32700, format!("Parse error: {}", e));
                        write_frame(&mut stdout, &error_resp).await;
                        continue;
                    }
                };

                // Notifications get no response
                if parsed_json.get("id").map_or(true, Value::is_null) {
                    match parsed_json.get("method").and_then(|m| m.as_str()) {
                        Some(method) => info!("Received notification: {}", method),
                        None => warn!("Received notification without method field"),
                    }
                    continue;
                }

                let req: RpcRequest = match serde_json::from_value(parsed_json.clone()) {
                    Ok(r) => r,
                    Err(e) => {
                        let id = parsed_json.get("id").cloned().unwrap_or(Value::Null);
                        let error_resp =
                            create_error_response(id, -32700, format!("Parse error: {}", e));
                        write_frame(&mut stdout, &error_resp).await;
                        continue;
                    }
                };
                let request_id = req.id.clone();
                let request_method = req.method.clone();
                metrics::increment_counter!("pqc_admin_requests_total", "method" => request_method.clone());

                match tokio::time::timeout(request_deadline, process_request(state.clone(), req))
                    .await
                {
                    Ok(response) => write_frame(&mut stdout, &response).await,
                    Err(_) => {
                        error!(
                            "Request processing timed out after {:?} for Method '{}', ID {:?}",
                            request_deadline, request_method, request_id
                        );
                        let timeout_resp = create_error_response(
                            request_id,
                            -32000,
                            format!("Request timed out for method '{}'", request_method),
                        );
                        write_frame(&mut stdout, &timeout_resp).await;
                    }
                }
            }
            Err(e) => {
                error!("Error reading from stdin: {}. Exiting.", e);
                break;
            }
        }
    }

    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, state.orchestrator.audit().flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to flush audit events on shutdown: {}", e),
        Err(_) => error!("Timed out flushing audit events on shutdown"),
    }
    info!("PQC admin server shutting down.");
}
