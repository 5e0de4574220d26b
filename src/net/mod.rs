//! Network channel between the agent and the remote storefront API.

mod client;
mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Headers, HttpRequest, HttpResponse, Method, RequestBody, RequestMode};
