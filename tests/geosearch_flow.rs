use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, contains, matches, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use materials_geosearch::geocoder::MapboxGeocoder;
use materials_geosearch::migration::FailureReason;
use materials_geosearch::{
    AppConfig, GeoPoint, Geocoder, MigrationOptions, MigrationRunner, NewProduct, ProductStore,
};

fn new_product(title: &str, address: &str) -> NewProduct {
    NewProduct {
        title: title.into(),
        description: String::new(),
        category: "Bricks/Blocks".into(),
        price: 12.5,
        quantity: 1000,
        address: address.into(),
    }
}

#[tokio::test]
async fn migration_locates_products_for_radius_search() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path(matches("^/geocoding/v5/mapbox.places/.*Baker.*\\.json$")),
            request::query(url_decoded(contains(("access_token", "pk.test")))),
            request::query(url_decoded(contains(("country", "IN")))),
            request::query(url_decoded(contains(("limit", "1")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({
            "type": "FeatureCollection",
            "features": [{
                "id": "address.1",
                "center": [-0.1586, 51.5237],
                "place_name": "221B Baker Street, London, UK"
            }]
        }))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path(matches("Nowhere")),
        ])
        .times(2)
        .respond_with(json_encoded(json!({ "type": "FeatureCollection", "features": [] }))),
    );

    let dir = tempdir().unwrap();
    let config = AppConfig {
        database_path: dir.path().join("flow.db").to_string_lossy().to_string(),
        mapbox_access_token: Some(SecretString::from("pk.test".to_string())),
        mapbox_api_base: server.url("/").to_string(),
        ..AppConfig::default()
    };
    let store = ProductStore::open(&config.database_path).unwrap();
    let baker = store
        .create_product(new_product("Yellow London stock bricks", "221B Baker Street, London"))
        .unwrap();
    let nowhere = store
        .create_product(new_product("Fly ash blocks", "Nowhere Town"))
        .unwrap();

    let geocoder = Arc::new(MapboxGeocoder::from_config(&config).unwrap().unwrap());
    let options = MigrationOptions {
        batch_size: 10,
        call_delay: Duration::ZERO,
        rate_limit_cooldown: Duration::ZERO,
        dry_run: false,
    };
    let runner = MigrationRunner::new(
        store.clone(),
        geocoder.clone() as Arc<dyn Geocoder>,
        options,
    );

    let summary = runner.run(None, None).await.unwrap();
    assert_eq!(summary.total_products, 2);
    assert_eq!(summary.needing_geocode, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].product_id, nowhere.id);
    assert_eq!(summary.failures[0].reason, FailureReason::NoMatch);

    let located = store.get_product(&baker.id).unwrap().unwrap();
    let location = located.location.expect("location written");
    assert_eq!(location.coordinates(), [-0.1586, 51.5237]);
    assert_eq!(location.formatted_address(), "221B Baker Street, London, UK");

    let near_baker = store
        .find_within_radius(GeoPoint::new(-0.16, 51.52), 5.0)
        .unwrap();
    assert_eq!(near_baker.len(), 1);
    assert_eq!(near_baker[0].id, baker.id);
    assert!(store
        .find_within_radius(GeoPoint::new(77.2, 28.6), 5.0)
        .unwrap()
        .is_empty());

    // Only the unmatched product is selected again.
    let rerun = runner.run(None, None).await.unwrap();
    assert_eq!(rerun.needing_geocode, 1);
    assert_eq!(rerun.already_located, 1);
    assert_eq!(rerun.processed, 1);
    assert_eq!(geocoder.provider_calls(), 3);
}

#[tokio::test]
async fn direct_geocode_round_trips_through_the_store() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method("GET")).respond_with(json_encoded(json!({
            "features": [{
                "id": "place.9",
                "center": [73.8567, 18.5204],
                "place_name": "Pune, Maharashtra, India"
            }]
        }))),
    );

    let dir = tempdir().unwrap();
    let config = AppConfig {
        mapbox_access_token: Some(SecretString::from("pk.test".to_string())),
        mapbox_api_base: server.url("/").to_string(),
        ..AppConfig::default()
    };
    let store = ProductStore::open(dir.path().join("roundtrip.db")).unwrap();
    let product = store.create_product(new_product("AAC blocks", "Pune")).unwrap();

    let geocoder = MapboxGeocoder::from_config(&config).unwrap().unwrap();
    let result = geocoder.geocode(&product.address).await.unwrap().unwrap();
    store
        .set_location(&product.id, result.coordinates, &result.formatted_address)
        .unwrap();

    let stored = store.get_product(&product.id).unwrap().unwrap();
    let [lng, lat] = stored.location.unwrap().coordinates();
    assert!((lng - result.coordinates[0]).abs() < 1e-9);
    assert!((lat - result.coordinates[1]).abs() < 1e-9);
}
