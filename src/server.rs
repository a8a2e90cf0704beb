use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use tokio_util::sync::CancellationToken;

use crate::gateway::Gateway;
use crate::response::{ToolMetadata, ToolResponse};
use crate::tools::ask::AskRequest;

#[derive(Clone)]
pub struct GustServer {
    gateway: Arc<Gateway>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GustServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            tool_router: Self::tool_router(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    #[tool(
        name = "ask",
        description = "Get a natural-language answer. Tries the on-device model, then the external assistant, then the remote API, and returns the first success. Only one request runs at a time; a second one is rejected as busy.",
        annotations(read_only_hint = true)
    )]
    pub async fn ask(
        &self,
        Parameters(req): Parameters<AskRequest>,
    ) -> Result<CallToolResult, McpError> {
        let (request, preference) = req
            .into_request()
            .map_err(|msg| McpError::invalid_params(msg, None))?;
        let start = Instant::now();

        let response = match self
            .gateway
            .resolve_with(&request, preference, &CancellationToken::new())
            .await
        {
            Ok(resolution) => {
                let mut metadata = ToolMetadata::bare("ask", 0.0);
                metadata.backend_used = resolution.tier;
                metadata.attempts = resolution.attempts.clone();
                metadata.duration_seconds = start.elapsed().as_secs_f64();
                match resolution.into_result() {
                    Ok(text) => ToolResponse::success(text, metadata),
                    Err(e) => {
                        tracing::warn!("ask failed: {e}");
                        ToolResponse::error(e.user_message(), metadata)
                    }
                }
            }
            Err(e) => {
                tracing::warn!("ask rejected: {e}");
                let mut metadata = ToolMetadata::bare("ask", start.elapsed().as_secs_f64());
                metadata.backend_used = e.backend();
                ToolResponse::error(e.user_message(), metadata)
            }
        };

        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "backends",
        description = "Show which backends are configured, their last known availability, the backend preference, and whether a request is in flight.",
        annotations(read_only_hint = true)
    )]
    pub async fn backends(&self) -> Result<CallToolResult, McpError> {
        let content = self.gateway.backends().to_markdown();
        Ok(ToolResponse::success(content, ToolMetadata::bare("backends", 0.0)).into_call_tool_result())
    }

    #[tool(
        name = "cancel",
        description = "Cancel the request currently in flight, stopping any external tool it launched."
    )]
    pub async fn cancel(&self) -> Result<CallToolResult, McpError> {
        let content = if self.gateway.cancel() {
            "Cancelled the in-flight request."
        } else {
            "No request is in flight."
        };
        Ok(ToolResponse::success(content.to_string(), ToolMetadata::bare("cancel", 0.0))
            .into_call_tool_result())
    }
}

#[tool_handler]
impl ServerHandler for GustServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "gust".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Gust: one answer from whichever backend can give it.\n\n\
                 - `ask` with `query`, optional `context` (e.g. page text), `history`, and \
                 `capability` (summarize / answer_question / raw_prompt).\n\
                 - Pass `preference` (local_only / cloud_preferred / auto) to override routing for one call.\n\
                 - One request at a time: a busy error means retry after the current one finishes, or `cancel` it.\n\
                 - `backends` shows what is configured and reachable."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
