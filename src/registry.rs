use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::ServerError;
use crate::handler::Handler;

/// Case-insensitive command table: names are normalised to upper case on
/// registration and looked up by exact upper-case match. Reads dominate, so
/// lookups take the read side; registration is expected before the server
/// starts but stays safe at any point.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl CommandRegistry {
    pub fn new() -> CommandRegistry {
        CommandRegistry::default()
    }

    /// Registers `handler` under `name`. Re-registering a name replaces the
    /// previous handler, which is how embedders override the bundled
    /// defaults.
    pub fn register(
        &self,
        name: &str,
        handler: impl Handler + 'static,
    ) -> Result<(), ServerError> {
        if name.is_empty() {
            return Err(ServerError::Registration("empty command name".into()));
        }

        self.handlers
            .write()
            .unwrap()
            .insert(name.to_uppercase(), Arc::new(handler));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap()
            .get(&name.to_uppercase())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
