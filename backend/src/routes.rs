use actix_multipart::Multipart;
use actix_web::{web, Error, HttpResponse};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, TryStreamExt};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use shared::{ClassifyRequest, ErrorResponse, PredictionResult};
use std::io::Write;
use uuid::Uuid;

use crate::batch::{BatchJob, BatchJobStore, BatchRunner, ImageRecord, MemoryStore};
use crate::classifier::prediction::UNKNOWN_CLASS;
use crate::classifier::{ClassifierError, ClassifierService};
use crate::registry::RegistryError;

#[derive(Deserialize)]
struct ClassifyQuery {
    #[serde(default)]
    tta: bool,
}

#[derive(Deserialize)]
struct OwnerQuery {
    owner_id: Uuid,
}

#[derive(Deserialize)]
struct ProductionRequest {
    is_production: bool,
}

#[derive(Deserialize)]
struct CreateBatchRequest {
    owner_id: Uuid,
    image_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    use_tta: bool,
    save_results: Option<bool>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/classify").route(web::post().to(classify_upload)))
        .service(web::resource("/api/classify/base64").route(web::post().to(classify_base64)))
        .service(web::resource("/api/model").route(web::get().to(model_info)))
        .service(web::resource("/api/model/reload").route(web::post().to(reload_model)))
        .service(web::resource("/api/model/switch/{model_id}").route(web::post().to(switch_model)))
        .service(web::resource("/api/models").route(web::get().to(list_models)))
        .service(
            web::resource("/api/models/{model_id}/production")
                .route(web::put().to(set_production)),
        )
        .service(web::resource("/api/images").route(web::post().to(upload_images)))
        .service(web::resource("/api/batches").route(web::post().to(create_batch)))
        .service(web::resource("/api/batches/{batch_id}").route(web::get().to(get_batch)));
}

fn error_body(message: impl Into<String>) -> ErrorResponse {
    ErrorResponse {
        error: message.into(),
    }
}

fn is_unavailable(result: &PredictionResult) -> bool {
    result.is_error() && result.predicted_class == UNKNOWN_CLASS
}

fn prediction_response(outcome: Result<PredictionResult, ClassifierError>) -> HttpResponse {
    match outcome {
        Ok(result) if is_unavailable(&result) => HttpResponse::ServiceUnavailable()
            .json(error_body(result.error.unwrap_or_default())),
        Ok(result) if result.is_error() => HttpResponse::InternalServerError().json(result),
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) if e.is_invalid_input() => HttpResponse::BadRequest().json(error_body(e.to_string())),
        Err(e) => {
            error!("Classification failed: {}", e);
            HttpResponse::InternalServerError().json(error_body(e.to_string()))
        }
    }
}

async fn read_images(payload: &mut Multipart) -> Result<Vec<Vec<u8>>, Error> {
    let mut images = Vec::new();
    while let Ok(Some(mut field)) = payload.try_next().await {
        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            image_data.write_all(&data)?;
        }
        if !image_data.is_empty() {
            images.push(image_data);
        }
    }
    Ok(images)
}

async fn classify_upload(
    classifier: web::Data<ClassifierService>,
    query: web::Query<ClassifyQuery>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let images = read_images(&mut payload).await?;
    if images.is_empty() {
        return Ok(HttpResponse::BadRequest().json(error_body("No image in request")));
    }

    let use_tta = query.tta;
    let count = images.len();
    let outcomes = web::block(move || classifier.classify_many(images, use_tta)).await?;

    if outcomes.iter().all(|o| matches!(o, Ok(r) if is_unavailable(r))) {
        let message = outcomes
            .into_iter()
            .find_map(|o| o.ok().and_then(|r| r.error))
            .unwrap_or_default();
        return Ok(HttpResponse::ServiceUnavailable().json(error_body(message)));
    }

    let results: Vec<serde_json::Value> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => json!(result),
            Err(e) => json!({ "error": e.to_string() }),
        })
        .collect();
    info!("Classified {} uploaded image(s)", count);
    Ok(HttpResponse::Ok().json(json!({ "results": results })))
}

async fn classify_base64(
    classifier: web::Data<ClassifierService>,
    body: web::Json<ClassifyRequest>,
) -> Result<HttpResponse, Error> {
    let request = body.into_inner();
    let bytes = match STANDARD.decode(request.image_data.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(error_body(format!("Invalid base64 image: {}", e))));
        }
    };
    let use_tta = request.use_tta;
    let outcome = web::block(move || classifier.classify(bytes, use_tta)).await?;
    Ok(prediction_response(outcome))
}

async fn model_info(classifier: web::Data<ClassifierService>) -> Result<HttpResponse, Error> {
    let info = web::block(move || classifier.model_info()).await?;
    if info.error.is_some() {
        Ok(HttpResponse::ServiceUnavailable().json(info))
    } else {
        Ok(HttpResponse::Ok().json(info))
    }
}

async fn reload_model(classifier: web::Data<ClassifierService>) -> Result<HttpResponse, Error> {
    let (reloaded, info) = web::block(move || {
        let reloaded = classifier.reload();
        (reloaded, classifier.model_info())
    })
    .await?;
    if reloaded {
        info!("Model reloaded on request");
        Ok(HttpResponse::Ok().json(info))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(info))
    }
}

async fn switch_model(
    classifier: web::Data<ClassifierService>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let model_id = match Uuid::parse_str(&path.into_inner()) {
        Ok(uuid) => uuid,
        Err(_) => return Ok(HttpResponse::BadRequest().json(error_body("Invalid UUID format"))),
    };

    let outcome = web::block(move || classifier.try_switch_model(model_id)).await?;
    match outcome {
        Ok(model) => {
            info!("Switched to model {}", model_id);
            Ok(HttpResponse::Ok().json(json!({
                "model_id": model.artifact.id,
                "name": model.artifact.name,
                "version": model.artifact.version,
            })))
        }
        Err(e @ ClassifierError::NotFound(_)) => {
            Ok(HttpResponse::NotFound().json(error_body(e.to_string())))
        }
        Err(e) => {
            error!("Failed to switch to model {}: {}", model_id, e);
            Ok(HttpResponse::Conflict().json(error_body(e.to_string())))
        }
    }
}

async fn list_models(classifier: web::Data<ClassifierService>) -> Result<HttpResponse, Error> {
    let records = web::block(move || classifier.registry().list()).await?;
    match records {
        Ok(records) => Ok(HttpResponse::Ok().json(records)),
        Err(e) => {
            error!("Failed to list models: {}", e);
            Ok(HttpResponse::InternalServerError().json(error_body(e.to_string())))
        }
    }
}

async fn set_production(
    classifier: web::Data<ClassifierService>,
    path: web::Path<String>,
    body: web::Json<ProductionRequest>,
) -> Result<HttpResponse, Error> {
    let model_id = match Uuid::parse_str(&path.into_inner()) {
        Ok(uuid) => uuid,
        Err(_) => return Ok(HttpResponse::BadRequest().json(error_body("Invalid UUID format"))),
    };
    let production = body.is_production;

    let outcome =
        web::block(move || classifier.registry().set_production(model_id, production)).await?;
    match outcome {
        Ok(record) => {
            info!("Model {} production flag set to {}", model_id, production);
            Ok(HttpResponse::Ok().json(record))
        }
        Err(e @ RegistryError::NotFound(_)) => {
            Ok(HttpResponse::NotFound().json(error_body(e.to_string())))
        }
        Err(e) => {
            error!("Failed to update model {}: {}", model_id, e);
            Ok(HttpResponse::InternalServerError().json(error_body(e.to_string())))
        }
    }
}

async fn upload_images(
    store: web::Data<MemoryStore>,
    query: web::Query<OwnerQuery>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let images = read_images(&mut payload).await?;
    if images.is_empty() {
        return Ok(HttpResponse::BadRequest().json(error_body("No image in request")));
    }
    let image_ids: Vec<Uuid> = images
        .into_iter()
        .map(|bytes| store.add_image(ImageRecord::new(query.owner_id, bytes)))
        .collect();
    info!("Stored {} image(s) for user {}", image_ids.len(), query.owner_id);
    Ok(HttpResponse::Created().json(json!({ "image_ids": image_ids })))
}

async fn create_batch(
    runner: web::Data<BatchRunner>,
    store: web::Data<MemoryStore>,
    body: web::Json<CreateBatchRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let mut job = BatchJob::new(request.owner_id).with_tta(request.use_tta);
    if let Some(image_ids) = request.image_ids {
        job = job.with_images(image_ids);
    }
    if let Some(save_results) = request.save_results {
        job = job.with_save_results(save_results);
    }

    if let Err(e) = store.save(&job) {
        error!("Failed to create batch: {}", e);
        return HttpResponse::InternalServerError().json(error_body("Failed to create batch"));
    }

    let response = HttpResponse::Accepted().json(&job);
    let batch_id = job.id;
    actix_web::rt::spawn(async move {
        let outcome = web::block(move || {
            let mut job = job;
            runner.run(&mut job)
        })
        .await;
        if let Err(e) = outcome {
            error!("Batch {} worker crashed: {}", batch_id, e);
        }
    });
    response
}

async fn get_batch(store: web::Data<MemoryStore>, path: web::Path<String>) -> HttpResponse {
    let batch_id = match Uuid::parse_str(&path.into_inner()) {
        Ok(uuid) => uuid,
        Err(_) => return HttpResponse::BadRequest().json(error_body("Invalid UUID format")),
    };
    match BatchJobStore::get(store.get_ref(), batch_id) {
        Ok(Some(job)) => HttpResponse::Ok().json(job),
        Ok(None) => HttpResponse::NotFound().json(error_body(format!("Batch {} not found", batch_id))),
        Err(e) => {
            error!("Error retrieving batch {}: {}", batch_id, e);
            HttpResponse::InternalServerError().json(error_body(e.to_string()))
        }
    }
}
