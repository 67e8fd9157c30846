//! Minimal routing boundary.
//!
//! Route matching and authorization policy live outside the core; the
//! pipeline only needs the handful of route attributes consulted by the tail
//! filter, the error subsystem, and the terminal handlers.

use crate::{auth::user::Auth, pipeline::stage::Stage};
use std::{collections::HashMap, fmt, sync::Arc};

pub struct Route {
    pub name: String,
    /// Terminal handler stage. Defaults to the pass handler.
    pub handler: Option<Arc<dyn Stage>>,
    /// Permitted methods, advertised on OPTIONS responses.
    pub methods: Vec<String>,
    /// Status → URI of a document to re-dispatch internally on error.
    pub error_documents: HashMap<u16, String>,
    /// Include the error message in synthesised error bodies.
    pub show_errors: bool,
    pub auth: Option<Arc<Auth>>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("handler", &self.handler.as_ref().map(|_| "<stage>"))
            .field("methods", &self.methods)
            .field("error_documents", &self.error_documents)
            .field("show_errors", &self.show_errors)
            .field("auth", &self.auth.as_ref().map(|_| "<auth>"))
            .finish()
    }
}

impl Default for Route {
    fn default() -> Self {
        Route {
            name: "default".to_string(),
            handler: None,
            methods: ["GET", "HEAD", "POST", "OPTIONS", "TRACE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            error_documents: HashMap::new(),
            show_errors: false,
            auth: None,
        }
    }
}

impl Route {
    pub fn new(name: impl Into<String>) -> Self {
        Route {
            name: name.into(),
            ..Route::default()
        }
    }

    pub fn error_document(&self, status: u16) -> Option<&str> {
        self.error_documents.get(&status).map(String::as_str)
    }

    pub fn methods_string(&self) -> String {
        self.methods.join(",")
    }
}
