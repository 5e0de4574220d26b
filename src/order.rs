//! Order payloads for the critical mutation route.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;

use crate::net::{HttpRequest, HttpResponse, Method};

/// Body returned when an order could not be delivered and was queued.
pub const QUEUED_MESSAGE: &str =
  "Order saved offline. It will be sent automatically once the connection is back.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
  pub product_id: u64,
  pub quantity: u32,
}

impl FromStr for OrderItem {
  type Err = String;

  /// Parse `PRODUCT_ID[:QUANTITY]`; quantity defaults to 1.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (id, qty) = match s.split_once(':') {
      Some((id, qty)) => (id, Some(qty)),
      None => (s, None),
    };
    let product_id = id
      .trim()
      .parse()
      .map_err(|_| format!("invalid product id '{}'", id))?;
    let quantity = match qty {
      Some(q) => q
        .trim()
        .parse()
        .map_err(|_| format!("invalid quantity '{}'", q))?,
      None => 1,
    };
    if quantity == 0 {
      return Err("quantity must be at least 1".to_string());
    }
    Ok(Self {
      product_id,
      quantity,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
  pub items: Vec<OrderItem>,
}

impl CreateOrder {
  pub fn new(items: Vec<OrderItem>) -> Self {
    Self { items }
  }

  /// Build the POST request for the order route, with a bearer token when
  /// one is available.
  pub fn into_request(
    self,
    order_url: Url,
    token: Option<&str>,
  ) -> serde_json::Result<HttpRequest> {
    let request = HttpRequest::json(Method::POST, order_url, &self)?;
    Ok(match token {
      Some(token) => request.with_header("authorization", format!("Bearer {}", token)),
      None => request,
    })
  }
}

/// The "accepted but deferred" acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAck {
  pub queued: bool,
  pub message: String,
}

impl QueuedAck {
  pub fn new() -> Self {
    Self {
      queued: true,
      message: QUEUED_MESSAGE.to_string(),
    }
  }

  /// The 202 response handed to the application.
  pub fn into_response(self) -> serde_json::Result<HttpResponse> {
    HttpResponse::json(202, &self)
  }
}

impl Default for QueuedAck {
  fn default() -> Self {
    Self::new()
  }
}
