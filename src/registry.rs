//! Process-wide registries for calculators, packet generators and input
//! stream handlers.
//!
//! Each registry is an initialized-once map keyed by the fully qualified
//! name used in the configuration, with a thread-safe read path. Registering
//! the same name twice replaces the previous entry, so test binaries can
//! re-register fixtures freely.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::calculator::Calculator;
use crate::error::{GraphError, GraphResult};
use crate::side_packet::PacketGenerator;
use crate::stream::handler::{
    BarrierInputStreamHandler, DefaultInputStreamHandler, EarlyCloseInputStreamHandler,
    FixedSizeInputStreamHandler, ImmediateInputStreamHandler, InputStreamHandler,
    MuxInputStreamHandler,
};

pub(crate) type CalculatorFactory = Arc<dyn Fn() -> Box<dyn Calculator> + Send + Sync>;

type HandlerFactory =
    Arc<dyn Fn(&serde_json::Value) -> GraphResult<Box<dyn InputStreamHandler>> + Send + Sync>;

static CALCULATORS: Lazy<RwLock<HashMap<String, CalculatorFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static GENERATORS: Lazy<RwLock<HashMap<String, Arc<dyn PacketGenerator>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static HANDLERS: Lazy<RwLock<HashMap<String, HandlerFactory>>> = Lazy::new(|| {
    let mut map: HashMap<String, HandlerFactory> = HashMap::new();
    map.insert(
        "DefaultInputStreamHandler".into(),
        Arc::new(|_| Ok(Box::<DefaultInputStreamHandler>::default() as Box<dyn InputStreamHandler>)),
    );
    map.insert(
        "ImmediateInputStreamHandler".into(),
        Arc::new(|_| Ok(Box::<ImmediateInputStreamHandler>::default() as Box<dyn InputStreamHandler>)),
    );
    map.insert(
        "BarrierInputStreamHandler".into(),
        Arc::new(|_| Ok(Box::<BarrierInputStreamHandler>::default() as Box<dyn InputStreamHandler>)),
    );
    map.insert(
        "EarlyCloseInputStreamHandler".into(),
        Arc::new(|_| Ok(Box::<EarlyCloseInputStreamHandler>::default() as Box<dyn InputStreamHandler>)),
    );
    map.insert(
        "FixedSizeInputStreamHandler".into(),
        Arc::new(|options| {
            Ok(Box::new(FixedSizeInputStreamHandler::from_options(options)?)
                as Box<dyn InputStreamHandler>)
        }),
    );
    map.insert(
        "MuxInputStreamHandler".into(),
        Arc::new(|_| Ok(Box::<MuxInputStreamHandler>::default() as Box<dyn InputStreamHandler>)),
    );
    RwLock::new(map)
});

/// Registers a calculator factory under `name`.
pub fn register_calculator<F>(name: impl Into<String>, factory: F)
where
    F: Fn() -> Box<dyn Calculator> + Send + Sync + 'static,
{
    CALCULATORS.write().insert(name.into(), Arc::new(factory));
}

pub(crate) fn calculator_factory(name: &str) -> GraphResult<CalculatorFactory> {
    CALCULATORS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| GraphError::NotFound(format!("no calculator registered as '{name}'")))
}

/// Registers a packet generator under `name`.
pub fn register_generator(name: impl Into<String>, generator: impl PacketGenerator) {
    GENERATORS.write().insert(name.into(), Arc::new(generator));
}

pub(crate) fn generator(name: &str) -> GraphResult<Arc<dyn PacketGenerator>> {
    GENERATORS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| GraphError::NotFound(format!("no packet generator registered as '{name}'")))
}

/// Registers an input stream handler factory under `name`. The built-in
/// handlers are pre-registered.
pub fn register_input_stream_handler<F>(name: impl Into<String>, factory: F)
where
    F: Fn(&serde_json::Value) -> GraphResult<Box<dyn InputStreamHandler>> + Send + Sync + 'static,
{
    HANDLERS.write().insert(name.into(), Arc::new(factory));
}

pub(crate) fn create_input_stream_handler(
    name: &str,
    options: &serde_json::Value,
) -> GraphResult<Box<dyn InputStreamHandler>> {
    let factory = HANDLERS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| GraphError::NotFound(format!("no input stream handler named '{name}'")))?;
    factory(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{CalculatorContext, Continuation};

    struct Noop;
    impl Calculator for Noop {
        fn process(&mut self, _cc: &mut CalculatorContext) -> GraphResult<Continuation> {
            Ok(Continuation::Continue)
        }
    }

    #[test]
    fn calculator_roundtrip() {
        register_calculator("registry_test::Noop", || Box::new(Noop));
        assert!(calculator_factory("registry_test::Noop").is_ok());
        assert!(matches!(
            calculator_factory("registry_test::Missing"),
            Err(GraphError::NotFound(_))
        ));
    }

    #[test]
    fn builtin_handlers_are_available() {
        for name in [
            "DefaultInputStreamHandler",
            "ImmediateInputStreamHandler",
            "BarrierInputStreamHandler",
            "EarlyCloseInputStreamHandler",
            "FixedSizeInputStreamHandler",
            "MuxInputStreamHandler",
        ] {
            assert!(
                create_input_stream_handler(name, &serde_json::Value::Null).is_ok(),
                "handler {name} missing"
            );
        }
    }
}
