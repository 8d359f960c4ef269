//! Product-change webhooks for the recommendation service's catalog copy.
//!
//! Delivery is best effort: failures are logged and never reach the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::store::Product;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogChange {
    Added,
    Updated,
}

impl CatalogChange {
    pub fn action(self) -> &'static str {
        match self {
            CatalogChange::Added => "product-added",
            CatalogChange::Updated => "product-updated",
        }
    }
}

#[derive(Debug, Serialize)]
struct ProductPayload<'a> {
    product_id: &'a str,
    title: &'a str,
    category: &'a str,
    description: &'a str,
    price: f64,
    quantity: i64,
    address: &'a str,
}

impl<'a> From<&'a Product> for ProductPayload<'a> {
    fn from(product: &'a Product) -> Self {
        Self {
            product_id: &product.id,
            title: &product.title,
            category: &product.category,
            description: &product.description,
            price: product.price,
            quantity: product.quantity,
            address: &product.address,
        }
    }
}

#[async_trait]
pub trait CatalogNotifier: Send + Sync {
    async fn product_changed(&self, product: &Product, change: CatalogChange);
}

pub struct HttpCatalogNotifier {
    http: Client,
    base: Url,
}

impl HttpCatalogNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|err| AppError::Config(format!("invalid catalog webhook url: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "invalid catalog webhook url: {base_url}"
            )));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        config
            .catalog_webhook_base()
            .map(|base| Self::new(base, config.catalog_webhook_timeout()))
            .transpose()
    }

    fn endpoint(&self, change: CatalogChange) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("webhook").push(change.action());
        }
        url
    }

    async fn deliver(&self, product: &Product, change: CatalogChange) -> AppResult<()> {
        let response = self
            .http
            .post(self.endpoint(change))
            .json(&ProductPayload::from(product))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Provider(format!(
                "catalog webhook responded with {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogNotifier for HttpCatalogNotifier {
    async fn product_changed(&self, product: &Product, change: CatalogChange) {
        match self.deliver(product, change).await {
            Ok(()) => {
                debug!(target: "webhook", product_id = %product.id, action = change.action(), "catalog notified")
            }
            Err(err) => {
                warn!(target: "webhook", product_id = %product.id, action = change.action(), error = %err, "catalog webhook failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, eq, json_decoded, request};
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    use super::*;
    use crate::store::{NewProduct, ProductStore};

    fn sample_product() -> (tempfile::TempDir, Product) {
        let dir = tempdir().unwrap();
        let store = ProductStore::open(dir.path().join("hooks.db")).unwrap();
        let product = store
            .create_product(NewProduct {
                title: "TMT bars Fe500".into(),
                description: "12 mm".into(),
                category: "Metals".into(),
                price: 62.5,
                quantity: 300,
                address: "Bhiwandi".into(),
            })
            .unwrap();
        (dir, product)
    }

    fn payload(product: &Product) -> Value {
        json!({
            "product_id": product.id,
            "title": "TMT bars Fe500",
            "category": "Metals",
            "description": "12 mm",
            "price": 62.5,
            "quantity": 300,
            "address": "Bhiwandi"
        })
    }

    #[tokio::test]
    async fn posts_added_and_updated_webhooks() {
        let (_dir, product) = sample_product();
        let server = Server::run();
        for path in ["/friend/webhook/product-added", "/friend/webhook/product-updated"] {
            server.expect(
                Expectation::matching(all_of![
                    request::method("POST"),
                    request::path(path),
                    request::body(json_decoded::<Value, _>(eq(payload(&product)))),
                ])
                .times(1)
                .respond_with(status_code(200)),
            );
        }

        let notifier = HttpCatalogNotifier::new(
            &server.url("/friend/").to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        notifier.product_changed(&product, CatalogChange::Added).await;
        notifier.product_changed(&product, CatalogChange::Updated).await;
    }

    #[tokio::test]
    async fn failed_delivery_is_swallowed() {
        let (_dir, product) = sample_product();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("POST"))
                .times(2)
                .respond_with(status_code(503)),
        );

        let notifier =
            HttpCatalogNotifier::new(&server.url("/").to_string(), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            notifier.deliver(&product, CatalogChange::Added).await,
            Err(AppError::Provider(_))
        ));
        notifier.product_changed(&product, CatalogChange::Updated).await;
    }

    #[test]
    fn no_webhook_without_a_target() {
        assert!(HttpCatalogNotifier::from_config(&AppConfig::default())
            .unwrap()
            .is_none());
        let config = AppConfig {
            recommendation_delegate_url: Some("http://localhost:5001".into()),
            ..AppConfig::default()
        };
        let notifier = HttpCatalogNotifier::from_config(&config).unwrap().unwrap();
        assert_eq!(
            notifier.endpoint(CatalogChange::Added).as_str(),
            "http://localhost:5001/webhook/product-added"
        );
    }
}
