//! The authorized server surface.
//!
//! Every operation, the read-only ones included, passes through the
//! [`AuthGate`] before touching the dispatcher. A denied request gets the
//! gate's generic reason and nothing else.

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    error::{Error, Result},
    gate::AuthGate,
    invocation::Dispatcher,
    schema::{CallEvent, CallId, Claims, Tool, ToolCall},
};

pub struct GatedServer {
    gate: AuthGate,
    dispatcher: Dispatcher,
}

impl GatedServer {
    pub fn new(gate: AuthGate, dispatcher: Dispatcher) -> Self {
        Self { gate, dispatcher }
    }

    /// Lists the advertised tools. Gated like every other operation, so
    /// an unauthenticated caller cannot enumerate the surface.
    pub async fn list_tools(&self, authorization: Option<&str>) -> Result<Vec<Tool>> {
        self.authorize(authorization).await?;
        Ok(self.dispatcher.registry().list())
    }

    /// Starts a tool call for an authorized caller and returns its id.
    pub async fn call_tool(
        &self,
        authorization: Option<&str>,
        tool_name: &str,
        arguments: Value,
    ) -> Result<CallId> {
        let claims = self.authorize(authorization).await?;
        let call = ToolCall {
            call_id: CallId::new(),
            tool_name: tool_name.to_string(),
            arguments,
            caller_claims: claims,
        };
        info!(call_id = %call.call_id, tool = tool_name, "accepted tool call");
        self.dispatcher.submit(call)
    }

    /// Takes the event stream for a running call.
    pub async fn subscribe(
        &self,
        authorization: Option<&str>,
        call_id: CallId,
    ) -> Result<mpsc::Receiver<CallEvent>> {
        self.authorize(authorization).await?;
        self.dispatcher.subscribe(call_id)
    }

    /// Stream form of [`subscribe`](Self::subscribe); ends after the
    /// terminal event.
    pub async fn subscribe_stream(
        &self,
        authorization: Option<&str>,
        call_id: CallId,
    ) -> Result<impl Stream<Item = CallEvent> + Send> {
        self.authorize(authorization).await?;
        self.dispatcher.subscribe_stream(call_id)
    }

    /// Requests cancellation of a running call. Idempotent; returns
    /// whether the call was still running.
    pub async fn cancel(&self, authorization: Option<&str>, call_id: CallId) -> Result<bool> {
        self.authorize(authorization).await?;
        Ok(self.dispatcher.cancel(call_id))
    }

    async fn authorize(&self, authorization: Option<&str>) -> Result<Claims> {
        let decision = self.gate.check(authorization).await;
        match decision.claims {
            Some(claims) if decision.allowed => Ok(claims),
            _ => Err(Error::AuthorizationFailed(
                decision.denial.unwrap_or("authorization required").to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        invocation::ToolRegistry,
        testutils::{
            bearer, generate_ed25519_keypair, jwk_for, static_cache, test_policy, EchoTool,
            TokenSpec,
        },
        validator::TokenValidator,
    };
    use serde_json::json;

    fn server() -> (GatedServer, ed25519_dalek::SigningKey) {
        let (signing, public) = generate_ed25519_keypair();
        let cache = static_cache(vec![jwk_for("k1", &public)]);
        let validator = Arc::new(TokenValidator::new(cache, test_policy()));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        (
            GatedServer::new(AuthGate::new(validator), Dispatcher::new(Arc::new(registry))),
            signing,
        )
    }

    #[tokio::test]
    async fn list_tools_requires_authorization() {
        let (server, key) = server();
        assert!(matches!(
            server.list_tools(None).await,
            Err(Error::AuthorizationFailed(_))
        ));

        let header = bearer(&key, "k1", TokenSpec::valid());
        let tools = server.list_tools(Some(&header)).await.unwrap();
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn call_runs_end_to_end() {
        let (server, key) = server();
        let header = bearer(&key, "k1", TokenSpec::valid());

        let id = server
            .call_tool(Some(&header), "echo", json!({"value": 7}))
            .await
            .unwrap();
        let mut rx = server.subscribe(Some(&header), id).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            CallEvent::Result { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_requires_authorization() {
        let (server, _) = server();
        assert!(matches!(
            server.cancel(None, CallId::new()).await,
            Err(Error::AuthorizationFailed(_))
        ));
    }

    #[tokio::test]
    async fn expired_token_is_denied() {
        let (server, key) = server();
        let header = bearer(
            &key,
            "k1",
            TokenSpec::valid().expires_at(chrono::Utc::now().timestamp() - 600),
        );
        assert!(server.list_tools(Some(&header)).await.is_err());
    }
}
