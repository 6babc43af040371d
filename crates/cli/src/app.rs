//! Engine construction.

use std::sync::Arc;

use anyhow::{Context, Result};
use codec::JsonCodec;
use engine::{ExtensionPipeline, ExtensionRegistry, RequestHandler};
use extensions::{CachingExtension, DeadlineExtension, IdempotencyExtension};
use functions::system::{self, Echo};
use functions::FunctionRegistry;
use protocol::CacheStore;
use store::MemoryStore;

use crate::config::Config;

/// Builds a request handler with the bundled extensions and system functions,
/// all sharing one in-memory store.
pub fn build_handler(config: &Config, pretty: bool) -> Result<RequestHandler> {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());

    let extensions = ExtensionRegistry::new()
        .with(Arc::new(DeadlineExtension::new()))?
        .with(Arc::new(IdempotencyExtension::new(Arc::clone(&store))))?
        .with(Arc::new(CachingExtension::new(store)))?;
    let pipeline = ExtensionPipeline::new(extensions);

    let functions = FunctionRegistry::builder()
        .register(system::echo_descriptor()?, Arc::new(Echo))?
        .with_system_functions()
        .build()
        .context("failed to build the function registry")?;

    let codec = if pretty { JsonCodec::pretty() } else { JsonCodec::new() };

    tracing::debug!(
        extensions = ?pipeline.extension_urns(),
        functions = functions.len(),
        "engine assembled"
    );
    Ok(RequestHandler::new(Arc::new(codec), Arc::new(pipeline), Arc::new(functions))
        .with_config(config.handler.clone()))
}
