mod common;

use actix_web::{test, web, App};
use common::Fixture;
use plum_backend::registry::{ArtifactDescriptor, ModelArtifact, ModelRegistry};
use plum_backend::routes::configure_routes;
use serde_json::json;
use uuid::Uuid;

#[actix_web::test]
async fn test_production_flag_is_updated() {
    let fx = Fixture::new();
    let weights = fx.weights("plum.pt", "favor=0");
    let record = fx
        .registry
        .register(ArtifactDescriptor::new("plum", weights))
        .unwrap();
    assert!(!record.is_production);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(fx.service.clone()))
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::put()
        .uri(&format!("/api/models/{}/production", record.id))
        .set_json(json!({ "is_production": true }))
        .to_request();
    let updated: ModelArtifact = test::call_and_read_body_json(&app, req).await;
    assert_eq!(updated.id, record.id);
    assert!(updated.is_production);
    assert!(fx.registry.get(record.id).unwrap().unwrap().is_production);

    let req = test::TestRequest::put()
        .uri(&format!("/api/models/{}/production", Uuid::new_v4()))
        .set_json(json!({ "is_production": true }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::put()
        .uri("/api/models/not-a-uuid/production")
        .set_json(json!({ "is_production": false }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}
