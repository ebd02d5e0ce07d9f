#![forbid(unsafe_code)]

//! The interception layer of the Gondolin sandbox.
//!
//! Sits between the userspace TCP engine and the real network: classifies
//! each new guest flow (plaintext HTTP, TLS, or neither), terminates TLS
//! with a locally-minted certificate, parses HTTP/1.x requests, enforces
//! the secret allowlist defence, substitutes secret placeholders, and
//! replays admitted requests upstream.

pub mod classify;
mod error;
mod flow;
pub mod http;
mod interceptor;
mod secrets;
pub mod tls;
mod upstream;

pub use classify::{classify, Classification};
pub use error::InterceptError;
pub use flow::{FlowChannel, FlowOutput, GuestInput};
pub use interceptor::{FlowContext, Interceptor, InterceptorConfig, Scheme};
pub use tls::ca::CertificateAuthority;
pub use tls::cache::{CertCache, MintedLeaf};
pub use tls::sni::extract_client_hello;
pub use upstream::{HostResolver, ResolveFuture, SystemResolver, UpstreamClient};
