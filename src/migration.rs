use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geocoder::{GeocodeResult, Geocoder};
use crate::store::{PendingCursor, Product, ProductStore};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    /// Pause after every provider call.
    pub call_delay: Duration,
    /// Pause before the single retry of a rate-limited item.
    pub rate_limit_cooldown: Duration,
    /// Geocode without writing. Pages by offset since nothing shrinks.
    pub dry_run: bool,
}

impl MigrationOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.migration_batch_size,
            call_delay: Duration::from_millis(config.migration_delay_ms),
            rate_limit_cooldown: Duration::from_millis(config.migration_cooldown_ms),
            dry_run: false,
        }
    }
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum FailureReason {
    NoAddress,
    NoMatch,
    RateLimited,
    Provider(String),
    /// The store refused the provider's answer.
    Rejected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoAddress => f.write_str("no address"),
            FailureReason::NoMatch => f.write_str("no match"),
            FailureReason::RateLimited => f.write_str("rate limited"),
            FailureReason::Provider(detail) => write!(f, "provider error: {detail}"),
            FailureReason::Rejected(detail) => write!(f, "rejected: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFailure {
    pub product_id: String,
    pub title: String,
    pub address: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub needing_geocode: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub product_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub total_products: usize,
    pub needing_geocode: usize,
    pub already_located: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<MigrationFailure>,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl MigrationSummary {
    /// Writes one row per failure: id, title, address, reason.
    pub fn write_failures_csv<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["product_id", "title", "address", "reason"])?;
        for failure in &self.failures {
            writer.write_record([
                failure.product_id.as_str(),
                failure.title.as_str(),
                failure.address.as_str(),
                failure.reason.to_string().as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

enum ItemOutcome {
    Located(GeocodeResult),
    Failed(FailureReason),
}

/// Sequential sweep geocoding every product that lacks a well-formed
/// location. One provider call is in flight at a time.
pub struct MigrationRunner {
    store: ProductStore,
    geocoder: Arc<dyn Geocoder>,
    options: MigrationOptions,
}

impl MigrationRunner {
    pub fn new(store: ProductStore, geocoder: Arc<dyn Geocoder>, options: MigrationOptions) -> Self {
        Self {
            store,
            geocoder,
            options,
        }
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub async fn run(
        &self,
        observer: Option<Arc<dyn Fn(MigrationProgress) + Send + Sync>>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<MigrationSummary> {
        let total_products = self.store.count_products()?;
        let needing_geocode = self.store.count_needing_geocode()?;
        let mut summary = MigrationSummary {
            total_products,
            needing_geocode,
            already_located: total_products.saturating_sub(needing_geocode),
            dry_run: self.options.dry_run,
            ..MigrationSummary::default()
        };
        info!(
            target: "migration",
            total_products,
            needing_geocode,
            already_located = summary.already_located,
            dry_run = self.options.dry_run,
            batch_size = self.options.batch_size,
            "starting geocoding sweep"
        );

        let batch_size = self.options.batch_size.max(1);
        let mut cursor = if self.options.dry_run {
            PendingCursor::Offset(0)
        } else {
            PendingCursor::AfterId(None)
        };

        'sweep: loop {
            let page = self.store.needing_geocode(&cursor, batch_size)?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let last_id = page.last().map(|product| product.id.clone());

            for product in page {
                if cancelled(&cancel_flag) {
                    summary.cancelled = true;
                    break 'sweep;
                }

                let outcome = match self.process(&product).await {
                    ItemOutcome::Located(result) if !self.options.dry_run => {
                        match self.store.set_location(
                            &product.id,
                            result.coordinates,
                            &result.formatted_address,
                        ) {
                            Ok(()) => ItemOutcome::Located(result),
                            Err(err) if err.is_client_error() => {
                                ItemOutcome::Failed(FailureReason::Rejected(err.to_string()))
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    other => other,
                };
                match outcome {
                    ItemOutcome::Located(result) => {
                        debug!(
                            target: "migration",
                            product_id = %product.id,
                            formatted_address = %result.formatted_address,
                            "product located"
                        );
                        summary.succeeded += 1;
                    }
                    ItemOutcome::Failed(reason) => {
                        debug!(target: "migration", product_id = %product.id, %reason, "product not located");
                        summary.failed += 1;
                        summary.failures.push(MigrationFailure {
                            product_id: product.id.clone(),
                            title: product.title.clone(),
                            address: product.address.clone(),
                            reason,
                        });
                    }
                }
                summary.processed += 1;

                if let Some(callback) = &observer {
                    callback(MigrationProgress {
                        needing_geocode,
                        processed: summary.processed,
                        succeeded: summary.succeeded,
                        failed: summary.failed,
                        product_id: product.id.clone(),
                    });
                }
            }

            if page_len < batch_size {
                break;
            }
            cursor = match cursor {
                PendingCursor::Offset(offset) => PendingCursor::Offset(offset + page_len),
                PendingCursor::AfterId(_) => PendingCursor::AfterId(last_id),
            };
        }

        info!(
            target: "migration",
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "geocoding sweep finished"
        );
        Ok(summary)
    }

    async fn process(&self, product: &Product) -> ItemOutcome {
        if product.address.trim().is_empty() {
            return ItemOutcome::Failed(FailureReason::NoAddress);
        }

        let outcome = match self.geocoder.geocode(&product.address).await {
            Err(AppError::RateLimited) => {
                warn!(
                    target: "migration",
                    product_id = %product.id,
                    cooldown_ms = self.options.rate_limit_cooldown.as_millis() as u64,
                    "geocoding provider still rate limiting; cooling down before one retry"
                );
                self.pause(self.options.rate_limit_cooldown).await;
                self.geocoder.geocode(&product.address).await
            }
            other => other,
        };
        self.pause(self.options.call_delay).await;

        match outcome {
            Ok(Some(result)) => ItemOutcome::Located(result),
            Ok(None) => ItemOutcome::Failed(FailureReason::NoMatch),
            Err(AppError::MissingAddress) => ItemOutcome::Failed(FailureReason::NoAddress),
            Err(AppError::RateLimited) => ItemOutcome::Failed(FailureReason::RateLimited),
            Err(err) => {
                warn!(target: "migration", product_id = %product.id, error = %err, "geocoding failed");
                ItemOutcome::Failed(FailureReason::Provider(err.to_string()))
            }
        }
    }

    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            sleep(duration).await;
        }
    }
}

fn cancelled(flag: &Option<Arc<AtomicBool>>) -> bool {
    flag.as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}
