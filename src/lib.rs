//! # Callweave - typed, composable HTTP calls
//!
//! Callweave describes outbound HTTP calls declaratively, sends them through
//! a retry-aware [`Client`], composes many calls into one logical operation
//! with a single typed result, and lets any number of independent observers
//! watch every call's lifecycle.
//!
//! ## Quick Start
//!
//! ```no_run
//! use callweave::{CallContext, Client, RetryConfig, Slot};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct CreateUser {
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone, Default, Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), callweave::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com/v1")?
//!         .timeout(Duration::from_secs(30))
//!         .retry_config(RetryConfig::default().with_count(3))
//!         .build()?;
//!     let ctx = CallContext::new();
//!
//!     // Requests are immutable templates; every builder call returns a copy.
//!     let user = Slot::<User>::default();
//!     let outcome = client
//!         .get("/users/{id}")
//!         .with_path_param("id", "123")
//!         .with_result(&user)
//!         .send_raw(&ctx)
//!         .await?;
//!     println!("{:?} after {} tries", user.get(), outcome.attempts());
//!
//!     let created = client
//!         .post("/users")
//!         .with_json(&CreateUser { name: "Alice".into() })?
//!         .into_api::<User>()
//!         .call(&ctx)
//!         .await?;
//!     println!("Created user with ID: {}", created.id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Immutable requests** - branch a template into many variants without copies leaking state
//! - **Composable operations** - [`ApiRequest`] runs sendables concurrently with pre- and post-flight hooks
//! - **Concurrency groups** - [`WaitGroup`] collects every failure, [`RunGroup`] bounds concurrency and stops at the first
//! - **Retry with backoff** - exponential, jittered, `Retry-After` aware, with pluggable predicates
//! - **Lifecycle hooks** - [`ClientTrace`](trace::ClientTrace) sets compose without interfering
//! - **OpenTelemetry** - spans and metrics with redaction via [`telemetry::Telemetry`]
//! - **Structured logging** - every attempt is logged with `tracing`
//!
//! ## Error Handling
//!
//! Every failure is an [`Error`]; HTTP failures keep the raw body:
//!
//! ```no_run
//! use callweave::{CallContext, Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get("/endpoint").send_raw(&CallContext::new()).await {
//!     Ok(outcome) => println!("Success after {:?}", outcome.latency()),
//!     Err(Error::Http { status, raw_response, .. }) => {
//!         eprintln!("HTTP error {}: {}", status, raw_response);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retries
//!
//! ```no_run
//! use callweave::{Client, RetryConfig, retry::{OrPredicate, RetryOn5xx, RetryOnTimeout}};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), callweave::Error> {
//! let client = Client::builder()
//!     .retry_config(
//!         RetryConfig::default()
//!             .with_count(5)
//!             .with_initial_wait(Duration::from_millis(100))
//!             .with_max_wait(Duration::from_secs(30))
//!             .with_predicate(OrPredicate::new(vec![
//!                 Box::new(RetryOn5xx),
//!                 Box::new(RetryOnTimeout),
//!             ])),
//!     )
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod api_request;
mod client;
mod context;
mod error;
pub mod form;
mod request;
mod response;
pub mod retry;
mod run_group;
mod sendable;
mod slot;
pub mod telemetry;
pub mod trace;
pub mod transport;
mod wait_group;

pub use api_request::ApiRequest;
pub use client::{Client, ClientBuilder, DEFAULT_MAX_REDIRECTS};
pub use context::CallContext;
pub use error::{Error, MultiError, Result};
pub use request::{Body, Listener, Request};
pub use response::{Outcome, RawResponse};
pub use retry::{RetryConfig, RetryPredicate};
pub use run_group::RunGroup;
pub use sendable::{Sendable, Sender};
pub use slot::Slot;
pub use wait_group::WaitGroup;
