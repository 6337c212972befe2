//! Infrastructure adapters.
//!
//! Implements the domain ports (Port/Adapter architecture).
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  Domain Layer                    │
//! │  ┌──────────────────────────────────────────┐  │
//! │  │     Ports: ProxyClient │ EventPublisher    │  │
//! │  └──────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────┘
//!                        │
//!                        ▼
//! ┌────────────────────────────────────────────────┐
//! │                 Adapters (this module)            │
//! │  ProxyHttpClient │ MockProxyClient               │
//! │  LoggingEventPublisher │ InMemoryEventCollector   │
//! └────────────────────────────────────────────────┘
//! ```

mod event_publisher;
mod proxy_http;
mod proxy_mock;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use proxy_http::ProxyHttpClient;
pub use proxy_mock::MockProxyClient;
