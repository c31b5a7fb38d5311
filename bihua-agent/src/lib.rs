// ABOUTME: Message handler abstraction for bihua agents.
// ABOUTME: Provides the normalized inbound event, handler traits, and the name-based registry.

pub mod event;
pub mod ident;
pub mod registry;
pub mod traits;

pub mod testing;

pub use event::InboundMessage;
pub use ident::{handler_symbol, is_valid_username, ResidentId};
pub use registry::{
    discover_handler_sources, HandlerContext, HandlerFactory, HandlerManifest, HandlerRegistry,
    MissingHandler, RegistryError, Resolution, ResolvedHandler, HANDLER_SOURCE_EXT,
    HANDLER_SYMBOL_PREFIX,
};
pub use traits::{MessageHandler, Replier};
