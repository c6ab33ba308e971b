//! HTTP transport for layerstack
//!
//! - [`serve`] exposes a running layer's publication endpoint, plus routes to
//!   list, approve and discard its actions
//! - [`HttpRemoteSource`] reads another layer's endpoint for an import node
//! - [`HttpConnector`] builds those sources from `http(s)://` import bindings
//!
//! # Example
//!
//! ```ignore
//! let layer1 = Arc::new(LayerBuilder::new("context") /* ... */ .start().await?);
//! let (addr, _server) = layerstack_http::serve(layer1, "127.0.0.1:2718").await?;
//!
//! let layer2 = LayerBuilder::new("analysis")
//!     .connector(layerstack_http::HttpConnector)
//!     .import("metrics", ImportBinding::new(format!("http://{}", addr), "metrics"))
//!     /* ... */
//!     .start()
//!     .await?;
//! ```

pub mod client;
pub mod error;
pub mod server;

pub use client::{HttpConnector, HttpRemoteSource};
pub use error::{ServeError, TransportError};
pub use server::{router, router_with_timeout, serve, DEFAULT_REQUEST_TIMEOUT};
