use actix_web::{http::StatusCode, test, web, App};
use serde_json::{json, Value};

use open_saves::api;
use open_saves::app_state::AppState;

macro_rules! test_app {
    () => {{
        let _ = env_logger::builder().is_test(true).try_init();
        let state = web::Data::new(AppState::new_for_testing());
        test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(api::configure),
        )
        .await
    }};
}

macro_rules! create_store {
    ($app:expr, $store_id:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/stores")
            .set_json(json!({ "store_id": $store_id, "name": $store_id.to_uppercase() }))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }};
}

macro_rules! create_record {
    ($app:expr, $store_id:expr, $body:expr) => {{
        let req = test::TestRequest::post()
            .uri(&format!("/api/stores/{}/records", $store_id))
            .set_json($body)
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }};
}

fn record_ids(body: &Value) -> Vec<String> {
    let mut ids: Vec<String> = body["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|record| record["record_id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

#[actix_web::test]
async fn test_health_endpoint() {
    let app = test_app!();
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&test::read_body(resp).await[..], b"ok");
}

#[actix_web::test]
async fn test_happy_path_crud() {
    let app = test_app!();

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/stores")
            .set_json(json!({ "store_id": "s1", "name": "S1" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["store_id"], "s1");
    assert_eq!(body["name"], "S1");
    assert!(body["created_at"].as_str().unwrap().ends_with('Z'));

    create_record!(
        &app,
        "s1",
        json!({
            "record_id": "r1",
            "properties": { "owner_id": "o1", "game_id": "g1" },
            "tags": ["a", "b"],
        })
    );

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["owner_id"], "o1");
    assert_eq!(body["game_id"], "g1");
    assert_eq!(body["concat_key"], "s1#r1");
    assert_eq!(body["tags"], json!(["a", "b"]));
    assert_eq!(body["properties"]["owner_id"], "o1");
}

#[actix_web::test]
async fn test_store_conflict_and_missing_parent() {
    let app = test_app!();
    create_store!(&app, "s2");

    // Recreating the same store loses the conditional insert.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/stores")
            .set_json(json!({ "store_id": "s2", "name": "S2" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ALREADY_EXISTS");

    // A record cannot exist without its store.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/api/stores/missing/records")
            .set_json(json!({ "record_id": "r1" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "NOT_FOUND");
}

#[actix_web::test]
async fn test_indexed_queries() {
    let app = test_app!();
    create_store!(&app, "s1");
    create_record!(&app, "s1", json!({ "record_id": "r1", "owner_id": "o1", "game_id": "g1" }));
    create_record!(&app, "s1", json!({ "record_id": "r2", "owner_id": "o1", "game_id": "g2" }));
    create_record!(&app, "s1", json!({ "record_id": "r3", "owner_id": "o2", "game_id": "g1" }));

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records?game_id=g1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(record_ids(&body), vec!["r1", "r3"]);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records?owner_id=o1")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(record_ids(&body), vec!["r1", "r2"]);

    // Both filters set: the game id index wins, the owner filter applies
    // in memory.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records?owner_id=o1&game_id=g1")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(record_ids(&body), vec!["r1"]);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records?limit=0")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert!(body["records"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn test_blob_round_trip() {
    let app = test_app!();
    create_store!(&app, "s1");
    create_record!(&app, "s1", json!({ "record_id": "r1", "blob_keys": ["save.dat"] }));

    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .insert_header(("content-type", "application/octet-stream"))
            .set_payload("Hello, Saves!")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["size"], 13);
    assert_eq!(body["blob_name"], "save.dat");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&test::read_body(resp).await[..], b"Hello, Saves!");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1/blobs")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["blob_names"], json!(["save.dat"]));

    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // Deleting again succeeds although nothing is left.
    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_cascade_delete() {
    let app = test_app!();
    create_store!(&app, "s1");
    create_record!(&app, "s1", json!({ "record_id": "r1" }));
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .set_payload("Hello, Saves!")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::delete().uri("/api/stores/s1").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1/blobs/save.dat")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_update_is_visible_through_warm_cache() {
    let app = test_app!();
    create_store!(&app, "s1");
    create_record!(&app, "s1", json!({ "record_id": "r1", "properties": { "owner_id": "o1" } }));

    // Warm the record entry and the query result entry.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records?owner_id=o9")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert!(body["records"].as_array().unwrap().is_empty());

    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/stores/s1/records/r1")
            .set_json(json!({ "properties": { "owner_id": "o9" } }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    // The fresh value is visible immediately, cache warmth notwithstanding.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["owner_id"], "o9");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records?owner_id=o9")
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(record_ids(&body), vec!["r1"]);
}

#[actix_web::test]
async fn test_record_delete_visible_through_both_paths() {
    let app = test_app!();
    create_store!(&app, "s1");
    create_record!(&app, "s1", json!({ "record_id": "r1" }));

    // Warm the cache, then delete.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Record deletion is idempotent.
    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/api/stores/s1/records/r1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_store_listing_pages() {
    let app = test_app!();
    for store_id in ["s1", "s2", "s3"] {
        create_store!(&app, store_id);
    }

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/stores?limit=2").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["stores"].as_array().unwrap().len(), 2);
    let token = body["next_page_token"].as_str().unwrap().to_string();

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/api/stores?limit=2&page_token={}", token))
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["stores"].as_array().unwrap().len(), 1);
    assert_eq!(body["stores"][0]["store_id"], "s3");
}

#[actix_web::test]
async fn test_typed_metadata_endpoint() {
    let app = test_app!();

    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/metadata/progress/p1")
            .set_json(json!({ "level": 3 }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/metadata/progress/p1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["metadata_type"], "progress");
    assert_eq!(body["payload"]["level"], 3);

    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/api/metadata/progress/p1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/metadata/progress/p1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_update_missing_record_is_not_found() {
    let app = test_app!();
    create_store!(&app, "s1");
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/api/stores/s1/records/missing")
            .set_json(json!({ "tags": ["a"] }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
