// ABOUTME: Built-in agent handlers shipped with the bihua binary.
// ABOUTME: register_builtin wires each one into the registry under its conventional symbol.

pub mod echo;
pub mod greeter;
pub mod lurker;

pub use echo::EchoHandler;
pub use greeter::GreeterHandler;
pub use lurker::LurkerHandler;

use bihua_agent::{HandlerContext, HandlerRegistry, MessageHandler};
use std::sync::Arc;

/// Read an optional string parameter from the agent's handler manifest
fn string_param(ctx: &HandlerContext, key: &str) -> Option<String> {
    ctx.manifest
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Add every built-in handler to `registry`
pub fn register_builtin(registry: HandlerRegistry) -> HandlerRegistry {
    registry
        .register_agent("echo", |ctx| {
            let handler: Arc<dyn MessageHandler> = match string_param(ctx, "trigger") {
                Some(trigger) => Arc::new(EchoHandler::with_trigger(trigger)),
                None => Arc::new(EchoHandler::default()),
            };
            Ok(handler)
        })
        .register_agent("greeter", |ctx| {
            let handler: Arc<dyn MessageHandler> = match string_param(ctx, "greeting") {
                Some(greeting) => Arc::new(GreeterHandler::with_greeting(greeting)),
                None => Arc::new(GreeterHandler::default()),
            };
            Ok(handler)
        })
        .register_agent("lurker", |ctx| {
            let handler: Arc<dyn MessageHandler> = Arc::new(LurkerHandler::new(&ctx.agent_id));
            Ok(handler)
        })
}
